/// Bouncer process core: open the datastore, bring networks up, accept
/// clients.
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{info, warn};

use super::client::handle_client;
use super::relay::Relay;
use crate::config::BouncerConfig;
use crate::store::JsonStore;

/// Run the bouncer with `config` until a listener fails.
///
/// Binds every listen address first, so a port conflict fails fast.
pub async fn run(config: BouncerConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let store = JsonStore::load_or_create(&config.data_dir)?;
    info!(dir = %config.data_dir.display(), "datastore opened");

    let mut listeners = Vec::with_capacity(config.bind.len());
    for addr in &config.bind {
        let listener = TcpListener::bind(addr).await?;
        info!("lagoon-bouncer listening on {addr}");
        listeners.push(listener);
    }

    let seeds = config.seed_networks.clone();
    let relay = Relay::new(Arc::new(store), config);
    start_networks(&relay, seeds).await?;

    let mut handles = Vec::new();
    for listener in listeners {
        handles.push(tokio::spawn(serve(listener, relay.clone())));
    }

    // Wait for any listener to exit (they shouldn't).
    for handle in handles {
        handle.await??;
    }

    Ok(())
}

/// Restore persisted networks, then add configured ones not yet stored.
async fn start_networks(
    relay: &Relay,
    seeds: Vec<crate::store::Credentials>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let stored = relay.datastore().networks()?;
    relay.restore_networks().await?;
    for creds in seeds {
        if stored.contains_key(&creds.network) {
            continue;
        }
        let name = creds.network.clone();
        if let Err(e) = relay.add_network(creds).await {
            warn!(network = %name, "skipping configured network: {e}");
        }
    }
    Ok(())
}

/// Accept loop for a single listener.
pub async fn serve(
    listener: TcpListener,
    relay: Relay,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    loop {
        let (socket, addr) = listener.accept().await?;
        info!(%addr, "new connection");
        let relay = relay.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_client(socket, addr, relay).await {
                warn!(%addr, "client error: {e}");
            }
            info!(%addr, "disconnected");
        });
    }
}
