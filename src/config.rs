//! Process configuration, read from `LAGOON_BOUNCER_*` environment variables.

use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;

use tracing::warn;

use crate::irc::backoff::ReconnectPolicy;
use crate::store::Credentials;

/// Name used as the prefix of lines the bouncer generates itself.
pub static SERVER_NAME: LazyLock<String> = LazyLock::new(|| {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| h.contains('.'))
        .unwrap_or_else(|| "bouncer.lagun.co".into())
});

/// Default server-log ring size per network.
pub const DEFAULT_LOG_CAPACITY: usize = 2048;

/// Default IRC port.
const DEFAULT_PORT: u16 = 6667;

/// Bouncer settings.
#[derive(Debug, Clone)]
pub struct BouncerConfig {
    /// Listen addresses for downstream clients.
    pub bind: Vec<String>,
    /// Where the datastore keeps `bouncer.json`.
    pub data_dir: PathBuf,
    pub reconnect: ReconnectPolicy,
    /// Lines of server log kept per network for replay.
    pub log_capacity: usize,
    /// Prefix for locally generated lines.
    pub server_name: String,
    /// Networks to add at startup (on top of the persisted ones).
    pub seed_networks: Vec<Credentials>,
}

impl Default for BouncerConfig {
    fn default() -> Self {
        Self {
            bind: vec!["127.0.0.1:6667".into()],
            data_dir: PathBuf::from("./lagoon-bouncer-data"),
            reconnect: ReconnectPolicy::default(),
            log_capacity: DEFAULT_LOG_CAPACITY,
            server_name: SERVER_NAME.clone(),
            seed_networks: Vec::new(),
        }
    }
}

impl BouncerConfig {
    /// Build from the environment, falling back to defaults per variable.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(bind) = var("LAGOON_BOUNCER_BIND") {
            let addrs = split_list(&bind);
            if !addrs.is_empty() {
                config.bind = addrs;
            }
        }
        if let Some(dir) = var("LAGOON_BOUNCER_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(ms) = parse_var::<u64>(&var, "LAGOON_BOUNCER_RECONNECT_BASE_MS") {
            config.reconnect.base = Duration::from_millis(ms);
        }
        if let Some(n) = parse_var::<u32>(&var, "LAGOON_BOUNCER_MAX_RECONNECTS") {
            config.reconnect.max_attempts = n;
        }
        if let Some(n) = parse_var::<usize>(&var, "LAGOON_BOUNCER_LOG_LINES") {
            config.log_capacity = n.max(1);
        }

        if let Some(list) = var("LAGOON_BOUNCER_NETWORKS") {
            let nick = var("LAGOON_BOUNCER_NICK").unwrap_or_else(|| "lagoon".into());
            let user = var("LAGOON_BOUNCER_USER").unwrap_or_else(|| nick.clone());
            let realname = var("LAGOON_BOUNCER_REALNAME").unwrap_or_else(|| nick.clone());
            for entry in split_list(&list) {
                match parse_network_entry(&entry) {
                    Some((name, host, port)) => {
                        let mut creds = Credentials::new(&name, &host, port, &nick);
                        creds.username = user.clone();
                        creds.realname = realname.clone();
                        config.seed_networks.push(creds);
                    }
                    None => warn!("ignoring malformed network entry {entry:?}"),
                }
            }
        }

        config
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_var<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = var(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("ignoring {key}={raw:?}: not a number");
            None
        }
    }
}

/// Parse `name=host[:port]`.
pub fn parse_network_entry(entry: &str) -> Option<(String, String, u16)> {
    let (name, target) = entry.split_once('=')?;
    let name = name.trim();
    let target = target.trim();
    if name.is_empty() || target.is_empty() {
        return None;
    }

    let (host, port) = match target.rsplit_once(':') {
        Some((host, port)) => (host, port.parse().ok()?),
        None => (target, DEFAULT_PORT),
    };
    if host.is_empty() {
        return None;
    }
    Some((name.to_owned(), host.to_owned(), port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_environment() {
        let config = BouncerConfig::from_lookup(|_| None);
        assert_eq!(config.bind, vec!["127.0.0.1:6667"]);
        assert_eq!(config.log_capacity, DEFAULT_LOG_CAPACITY);
        assert_eq!(config.reconnect, ReconnectPolicy::default());
        assert!(config.seed_networks.is_empty());
    }

    #[test]
    fn reads_overrides() {
        let config = BouncerConfig::from_lookup(lookup(&[
            ("LAGOON_BOUNCER_BIND", "0.0.0.0:6667, [::]:6667"),
            ("LAGOON_BOUNCER_DATA_DIR", "/var/lib/bouncer"),
            ("LAGOON_BOUNCER_RECONNECT_BASE_MS", "250"),
            ("LAGOON_BOUNCER_MAX_RECONNECTS", "3"),
            ("LAGOON_BOUNCER_LOG_LINES", "100"),
        ]));
        assert_eq!(config.bind, vec!["0.0.0.0:6667", "[::]:6667"]);
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/bouncer"));
        assert_eq!(config.reconnect.base, Duration::from_millis(250));
        assert_eq!(config.reconnect.max_attempts, 3);
        assert_eq!(config.log_capacity, 100);
    }

    #[test]
    fn bad_numbers_fall_back() {
        let config = BouncerConfig::from_lookup(lookup(&[
            ("LAGOON_BOUNCER_MAX_RECONNECTS", "lots"),
            ("LAGOON_BOUNCER_LOG_LINES", "0"),
        ]));
        assert_eq!(config.reconnect.max_attempts, 8);
        assert_eq!(config.log_capacity, 1);
    }

    #[test]
    fn seed_networks_from_list() {
        let config = BouncerConfig::from_lookup(lookup(&[
            ("LAGOON_BOUNCER_NETWORKS", "libera=irc.libera.chat:6697,oftc=irc.oftc.net,broken"),
            ("LAGOON_BOUNCER_NICK", "bob"),
        ]));
        assert_eq!(config.seed_networks.len(), 2);
        let libera = &config.seed_networks[0];
        assert_eq!(libera.network, "libera");
        assert_eq!(libera.hostname, "irc.libera.chat");
        assert_eq!(libera.port, 6697);
        assert_eq!(libera.nickname, "bob");
        assert_eq!(libera.username, "bob");
        assert_eq!(config.seed_networks[1].port, 6667);
    }

    #[test]
    fn network_entry_parsing() {
        assert_eq!(
            parse_network_entry("x=127.0.0.1:7000"),
            Some(("x".into(), "127.0.0.1".into(), 7000))
        );
        assert_eq!(parse_network_entry("x=host"), Some(("x".into(), "host".into(), 6667)));
        assert_eq!(parse_network_entry("=host"), None);
        assert_eq!(parse_network_entry("x=host:notaport"), None);
        assert_eq!(parse_network_entry("nohost"), None);
    }
}
