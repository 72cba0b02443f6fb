use tracing::info;

use lagoon_bouncer::config::BouncerConfig;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let config = BouncerConfig::from_env();
    info!(
        server = %config.server_name,
        networks = config.seed_networks.len(),
        log_lines = config.log_capacity,
        "lagoon-bouncer starting"
    );

    lagoon_bouncer::irc::server::run(config).await
}
