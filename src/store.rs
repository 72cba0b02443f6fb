//! Datastore: durable network credentials, joined channels, and the
//! bouncer password.
//!
//! The relay only talks to the [`Datastore`] trait. [`JsonStore`] is the
//! bundled implementation: in-memory maps written through to
//! `{data_dir}/bouncer.json`.
//!
//! Every mutation is applied to a copy, persisted, and only then committed,
//! so a failed write leaves the store exactly as it was.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// File name used inside the data directory.
const STORE_FILE: &str = "bouncer.json";

fn default_port() -> u16 {
    6667
}

/// Everything needed to (re)connect to one upstream network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Unique network name, e.g. `"libera"`.
    pub network: String,
    pub hostname: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub nickname: String,
    /// Ident sent in `USER`.
    pub username: String,
    pub realname: String,
    /// Server password sent as `PASS`, if any.
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub usermode: u32,
}

impl Credentials {
    /// Credentials with the nick doubling as ident and realname.
    pub fn new(network: &str, hostname: &str, port: u16, nickname: &str) -> Self {
        Self {
            network: network.to_owned(),
            hostname: hostname.to_owned(),
            port,
            nickname: nickname.to_owned(),
            username: nickname.to_owned(),
            realname: nickname.to_owned(),
            password: None,
            usermode: 0,
        }
    }
}

/// Persisted channel keys for one network: channel → optional key.
pub type ChannelMap = BTreeMap<String, Option<String>>;

/// Datastore failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("datastore I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("datastore encoding: {0}")]
    Json(#[from] serde_json::Error),
    #[error("datastore lock poisoned")]
    Poisoned,
    #[error("stored password hash is malformed")]
    BadHash,
}

/// Persistence consumed by the relay.
///
/// Calls are synchronous and must not leave partial writes behind on error.
pub trait Datastore: Send + Sync + std::fmt::Debug {
    fn networks(&self) -> Result<BTreeMap<String, Credentials>, StoreError>;
    fn add_network(&self, credentials: &Credentials) -> Result<(), StoreError>;
    fn remove_network(&self, network: &str) -> Result<(), StoreError>;

    fn channels(&self, network: &str) -> Result<ChannelMap, StoreError>;
    fn add_channel(
        &self,
        network: &str,
        channel: &str,
        password: Option<&str>,
    ) -> Result<(), StoreError>;
    fn remove_channel(&self, network: &str, channel: &str) -> Result<(), StoreError>;

    /// Stored password hash, if a password has been set.
    fn password(&self) -> Result<Option<String>, StoreError>;
    fn set_password(&self, plaintext: &str) -> Result<(), StoreError>;
    fn check_password(&self, attempt: &str) -> Result<bool, StoreError>;
}

/// On-disk shape of the store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreData {
    #[serde(default)]
    networks: BTreeMap<String, Credentials>,
    #[serde(default)]
    channels: BTreeMap<String, ChannelMap>,
    #[serde(default)]
    password: Option<String>,
}

/// Datastore backed by a JSON file (or nothing, for tests).
#[derive(Debug, Default)]
pub struct JsonStore {
    data: Mutex<StoreData>,
    persist_path: Option<PathBuf>,
}

impl JsonStore {
    /// Create an empty store that never touches disk.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from `{data_dir}/bouncer.json`, creating the directory if needed.
    ///
    /// A missing file starts an empty store. An unreadable one is an error
    /// rather than silently discarding saved networks.
    pub fn load_or_create(data_dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(data_dir)?;
        let path = data_dir.join(STORE_FILE);

        let data = if path.exists() {
            let json = std::fs::read_to_string(&path)?;
            let data: StoreData = serde_json::from_str(&json)?;
            info!(
                networks = data.networks.len(),
                path = %path.display(),
                "loaded datastore"
            );
            data
        } else {
            StoreData::default()
        };

        Ok(Self {
            data: Mutex::new(data),
            persist_path: Some(path),
        })
    }

    /// Apply `change` to a copy, persist it, then commit.
    fn update(&self, change: impl FnOnce(&mut StoreData)) -> Result<(), StoreError> {
        let mut data = self.data.lock().map_err(|_| StoreError::Poisoned)?;
        let mut next = data.clone();
        change(&mut next);
        self.persist(&next)?;
        *data = next;
        Ok(())
    }

    fn read<T>(&self, view: impl FnOnce(&StoreData) -> T) -> Result<T, StoreError> {
        let data = self.data.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(view(&data))
    }

    /// Atomic write via tmp + rename.
    fn persist(&self, data: &StoreData) -> Result<(), StoreError> {
        let Some(path) = &self.persist_path else {
            return Ok(());
        };
        let json = serde_json::to_string_pretty(data)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        if let Err(e) = std::fs::rename(&tmp, path) {
            warn!("failed to replace {}: {e}", path.display());
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }
}

impl Datastore for JsonStore {
    fn networks(&self) -> Result<BTreeMap<String, Credentials>, StoreError> {
        self.read(|d| d.networks.clone())
    }

    fn add_network(&self, credentials: &Credentials) -> Result<(), StoreError> {
        self.update(|d| {
            d.networks
                .insert(credentials.network.clone(), credentials.clone());
        })
    }

    fn remove_network(&self, network: &str) -> Result<(), StoreError> {
        self.update(|d| {
            d.networks.remove(network);
        })
    }

    fn channels(&self, network: &str) -> Result<ChannelMap, StoreError> {
        self.read(|d| d.channels.get(network).cloned().unwrap_or_default())
    }

    fn add_channel(
        &self,
        network: &str,
        channel: &str,
        password: Option<&str>,
    ) -> Result<(), StoreError> {
        self.update(|d| {
            d.channels
                .entry(network.to_owned())
                .or_default()
                .insert(channel.to_owned(), password.map(str::to_owned));
        })
    }

    fn remove_channel(&self, network: &str, channel: &str) -> Result<(), StoreError> {
        self.update(|d| {
            if let Some(chans) = d.channels.get_mut(network) {
                chans.remove(channel);
                if chans.is_empty() {
                    d.channels.remove(network);
                }
            }
        })
    }

    fn password(&self) -> Result<Option<String>, StoreError> {
        self.read(|d| d.password.clone())
    }

    fn set_password(&self, plaintext: &str) -> Result<(), StoreError> {
        let hash = hash_password(plaintext);
        self.update(|d| d.password = Some(hash))
    }

    fn check_password(&self, attempt: &str) -> Result<bool, StoreError> {
        match self.password()? {
            Some(stored) => verify_password(attempt, &stored),
            None => Ok(false),
        }
    }
}

fn digest(salt: &[u8], plaintext: &str) -> blake3::Hash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(salt);
    hasher.update(plaintext.as_bytes());
    hasher.finalize()
}

/// Salted BLAKE3 hash, formatted `hex(salt)$hex(hash)`.
pub fn hash_password(plaintext: &str) -> String {
    let salt: [u8; 16] = rand::random();
    format!("{}${}", hex::encode(salt), digest(&salt, plaintext).to_hex())
}

/// Check `attempt` against a hash produced by [`hash_password`].
pub fn verify_password(attempt: &str, stored: &str) -> Result<bool, StoreError> {
    let (salt_hex, hash_hex) = stored.split_once('$').ok_or(StoreError::BadHash)?;
    let salt = hex::decode(salt_hex).map_err(|_| StoreError::BadHash)?;
    let expected = blake3::Hash::from_hex(hash_hex).map_err(|_| StoreError::BadHash)?;
    // blake3::Hash equality is constant-time.
    Ok(digest(&salt, attempt) == expected)
}

/// Datastore whose every write and channel lookup fails. No password is set,
/// so registration still goes through.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct UnavailableStore;

#[cfg(test)]
impl Datastore for UnavailableStore {
    fn networks(&self) -> Result<BTreeMap<String, Credentials>, StoreError> {
        Err(StoreError::Poisoned)
    }
    fn add_network(&self, _: &Credentials) -> Result<(), StoreError> {
        Err(StoreError::Poisoned)
    }
    fn remove_network(&self, _: &str) -> Result<(), StoreError> {
        Err(StoreError::Poisoned)
    }
    fn channels(&self, _: &str) -> Result<ChannelMap, StoreError> {
        Err(StoreError::Poisoned)
    }
    fn add_channel(&self, _: &str, _: &str, _: Option<&str>) -> Result<(), StoreError> {
        Err(StoreError::Poisoned)
    }
    fn remove_channel(&self, _: &str, _: &str) -> Result<(), StoreError> {
        Err(StoreError::Poisoned)
    }
    fn password(&self) -> Result<Option<String>, StoreError> {
        Ok(None)
    }
    fn set_password(&self, _: &str) -> Result<(), StoreError> {
        Err(StoreError::Poisoned)
    }
    fn check_password(&self, _: &str) -> Result<bool, StoreError> {
        Err(StoreError::Poisoned)
    }
}
