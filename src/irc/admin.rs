/// Network management entry points for whatever administrative front end
/// sits outside the protocol path.
use serde::Serialize;
use tracing::info;

use super::network;
use super::relay::{Relay, RelayError};
use crate::store::Credentials;

/// A configured network as shown to administrators. Never carries the
/// server password.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkSummary {
    pub name: String,
    pub hostname: String,
    pub port: u16,
    pub nickname: String,
    pub username: String,
    pub realname: String,
    pub usermode: u32,
    pub connected: bool,
}

impl NetworkSummary {
    fn new(creds: &Credentials, connected: bool) -> Self {
        Self {
            name: creds.network.clone(),
            hostname: creds.hostname.clone(),
            port: creds.port,
            nickname: creds.nickname.clone(),
            username: creds.username.clone(),
            realname: creds.realname.clone(),
            usermode: creds.usermode,
            connected,
        }
    }
}

/// Network names travel inside `USER` idents, so they may not contain
/// separators or whitespace.
pub fn valid_network_name(name: &str) -> bool {
    !name.is_empty() && !name.contains(['/', ',', ' ', '\t', '\r', '\n'])
}

impl Relay {
    /// Persist `credentials` and start connecting.
    ///
    /// Re-adding an existing name replaces its credentials and restarts it.
    pub async fn add_network(&self, credentials: Credentials) -> Result<(), RelayError> {
        if !valid_network_name(&credentials.network) {
            return Err(RelayError::InvalidName(credentials.network));
        }
        self.datastore().add_network(&credentials)?;
        info!(network = %credentials.network, host = %credentials.hostname, "network added");
        network::spawn(self.clone(), credentials).await;
        Ok(())
    }

    /// Forget `name` and close it with no retry. Returns whether anything
    /// was configured or running under that name.
    pub async fn remove_network(&self, name: &str) -> Result<bool, RelayError> {
        let stored = self.datastore().networks()?.contains_key(name);
        self.datastore().remove_network(name)?;
        let running = self.shut_down_network(name).await;
        if stored || running {
            info!(network = name, "network removed");
        }
        Ok(stored || running)
    }

    /// Start every persisted network. Returns how many were started.
    pub async fn restore_networks(&self) -> Result<usize, RelayError> {
        let networks = self.datastore().networks()?;
        let count = networks.len();
        for credentials in networks.into_values() {
            network::spawn(self.clone(), credentials).await;
        }
        info!(count, "restored networks");
        Ok(count)
    }

    /// Configured networks, sorted by name, with live connection state.
    pub async fn list_networks(&self) -> Result<Vec<NetworkSummary>, RelayError> {
        let networks = self.datastore().networks()?;
        let live = self.network_names().await;
        Ok(networks
            .values()
            .map(|creds| NetworkSummary::new(creds, live.contains(&creds.network)))
            .collect())
    }

    pub fn check_password(&self, attempt: &str) -> Result<bool, RelayError> {
        Ok(self.datastore().check_password(attempt)?)
    }

    pub fn change_password(&self, plaintext: &str) -> Result<(), RelayError> {
        self.datastore().set_password(plaintext)?;
        info!("bouncer password changed");
        Ok(())
    }
}
