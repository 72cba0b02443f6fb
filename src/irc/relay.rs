/// The relay registry: which clients are connected, which networks are
/// live, and who is bound to what.
///
/// A single [`Relay`] value is cloned into every connection task. All
/// membership changes go through its write lock; fan-out only takes the read
/// lock and pushes into per-client outboxes, so it never waits on a socket.
///
/// Clients are bound to networks **by name**. A network that reconnects
/// registers a fresh instance under the same name and its bound clients keep
/// receiving traffic without being rebound.
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::connection::{Outbox, Role};
use super::message::Message;
use crate::config::BouncerConfig;
use crate::store::{Datastore, StoreError};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Identity of one downstream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl ClientId {
    pub fn next() -> Self {
        Self(next_id())
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// Identity of one upstream connection instance. A reconnect gets a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NetworkId(u64);

impl NetworkId {
    pub fn next() -> Self {
        Self(next_id())
    }
}

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Relay errors.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("network {0} does not exist")]
    UnknownNetwork(String),
    #[error("invalid network name {0:?}")]
    InvalidName(String),
    #[error("client {0} is not attached")]
    UnknownClient(ClientId),
    #[error("{0} connection closed")]
    WriteFailed(Role),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Work a client hands to the network it is bound to.
///
/// Both kinds travel through the same queue, so a client's `Attach` is
/// always processed before anything it forwards afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkCommand {
    /// Replay the server log to newly bound clients and mark them ready.
    Attach(ClientId),
    /// Write a client line upstream verbatim.
    Forward { from: ClientId, line: String },
}

/// Registry entry for a downstream client.
#[derive(Debug)]
pub struct ClientEntry {
    pub id: ClientId,
    pub addr: SocketAddr,
    /// Ident from the registration line, used as the target of notices.
    pub username: Option<String>,
    /// Bound network name. Resolved against the registry on every use.
    pub network: Option<String>,
    /// Set once the bound network's log has been replayed.
    pub ready: bool,
    pub outbox: Outbox,
}

impl ClientEntry {
    pub fn new(id: ClientId, addr: SocketAddr, outbox: Outbox) -> Self {
        Self {
            id,
            addr,
            username: None,
            network: None,
            ready: false,
            outbox,
        }
    }
}

/// Snapshot of a client's binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientView {
    pub network: Option<String>,
    pub ready: bool,
}

/// Registry entry for a live network instance.
#[derive(Debug, Clone)]
pub struct NetworkHandle {
    pub id: NetworkId,
    pub name: String,
    pub commands: mpsc::UnboundedSender<NetworkCommand>,
    /// Cancelling closes the instance's transport with no retry.
    pub shutdown: CancellationToken,
}

impl NetworkHandle {
    /// New handle plus the command queue its network task drains.
    pub fn new(
        name: &str,
        shutdown: CancellationToken,
    ) -> (Self, mpsc::UnboundedReceiver<NetworkCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Self {
            id: NetworkId::next(),
            name: name.to_owned(),
            commands: tx,
            shutdown,
        };
        (handle, rx)
    }

    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

/// A running reconnect loop for one network name.
#[derive(Debug)]
struct Supervisor {
    id: u64,
    cancel: CancellationToken,
}

#[derive(Debug, Default)]
struct RelayState {
    clients: HashMap<ClientId, ClientEntry>,
    networks: HashMap<String, NetworkHandle>,
    supervisors: HashMap<String, Supervisor>,
}

impl RelayState {
    fn is_current(&self, name: &str, id: NetworkId) -> bool {
        self.networks.get(name).is_some_and(|h| h.id == id)
    }

    fn ready_clients<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a ClientEntry> + 'a {
        self.clients
            .values()
            .filter(move |c| c.ready && c.network.as_deref() == Some(name))
    }
}

fn push(client: &ClientEntry, line: &str) {
    if let Err(e) = client.outbox.send_line(line) {
        debug!(client = %client.id, "dropping line: {e}");
    }
}

/// Shared, cloneable handle to the relay registry.
#[derive(Debug, Clone)]
pub struct Relay {
    state: Arc<RwLock<RelayState>>,
    datastore: Arc<dyn Datastore>,
    config: Arc<BouncerConfig>,
}

impl Relay {
    pub fn new(datastore: Arc<dyn Datastore>, config: BouncerConfig) -> Self {
        Self {
            state: Arc::new(RwLock::new(RelayState::default())),
            datastore,
            config: Arc::new(config),
        }
    }

    pub fn datastore(&self) -> &dyn Datastore {
        self.datastore.as_ref()
    }

    /// Owned handle for moving datastore work off the async workers.
    pub fn shared_datastore(&self) -> Arc<dyn Datastore> {
        Arc::clone(&self.datastore)
    }

    pub fn config(&self) -> &BouncerConfig {
        &self.config
    }

    pub fn server_name(&self) -> &str {
        &self.config.server_name
    }

    // ── Clients ──────────────────────────────────────────────────

    pub async fn attach_client(&self, entry: ClientEntry) {
        let mut st = self.state.write().await;
        info!(client = %entry.id, addr = %entry.addr, "client attached");
        st.clients.insert(entry.id, entry);
    }

    /// Remove a client. Returns `false` if it was already gone.
    pub async fn detach_client(&self, id: ClientId) -> bool {
        let removed = self.state.write().await.clients.remove(&id);
        if let Some(entry) = &removed {
            info!(client = %id, network = ?entry.network, "client detached");
        }
        removed.is_some()
    }

    pub async fn client(&self, id: ClientId) -> Option<ClientView> {
        let st = self.state.read().await;
        st.clients.get(&id).map(|c| ClientView {
            network: c.network.clone(),
            ready: c.ready,
        })
    }

    pub async fn client_count(&self) -> usize {
        self.state.read().await.clients.len()
    }

    /// Bind `client` to the network registered under `name`.
    ///
    /// Binding to a different network than before clears `ready`, so the
    /// new network replays its log on attach.
    pub async fn bind_client(
        &self,
        client: ClientId,
        username: &str,
        name: &str,
    ) -> Result<NetworkHandle, RelayError> {
        let mut st = self.state.write().await;
        let handle = st
            .networks
            .get(name)
            .cloned()
            .ok_or_else(|| RelayError::UnknownNetwork(name.to_owned()))?;
        let entry = st
            .clients
            .get_mut(&client)
            .ok_or(RelayError::UnknownClient(client))?;

        entry.username = Some(username.to_owned());
        if entry.network.as_deref() != Some(name) {
            entry.network = Some(name.to_owned());
            entry.ready = false;
        }
        info!(client = %client, network = name, "client bound");
        Ok(handle)
    }

    // ── Networks ─────────────────────────────────────────────────

    pub async fn lookup_network(&self, name: &str) -> Option<NetworkHandle> {
        self.state.read().await.networks.get(name).cloned()
    }

    pub async fn network_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.state.read().await.networks.keys().cloned().collect();
        names.sort();
        names
    }

    /// Insert `handle` under its name, closing whatever was there first.
    ///
    /// The old instance is cancelled while the write lock is held, so no
    /// reader ever sees two live networks under one name.
    pub async fn register_network(&self, handle: NetworkHandle) -> Option<NetworkHandle> {
        let mut st = self.state.write().await;
        let (name, id) = (handle.name.clone(), handle.id);
        let evicted = st.networks.insert(name.clone(), handle);
        if let Some(old) = &evicted {
            if old.id != id {
                info!(network = %name, old = %old.id, new = %id, "evicting previous connection");
                old.close();
            }
        }
        info!(network = %name, id = %id, "network registered");
        evicted
    }

    /// Remove `name` only if it still maps to instance `id`.
    pub async fn unregister_network(&self, name: &str, id: NetworkId) -> bool {
        let mut st = self.state.write().await;
        if !st.is_current(name, id) {
            return false;
        }
        st.networks.remove(name);
        info!(network = name, id = %id, "network unregistered");
        true
    }

    // ── Fan-out ──────────────────────────────────────────────────

    /// Deliver queued lines from network instance `id` to its ready clients.
    ///
    /// With no ready client bound, the queue is left intact so order is
    /// kept until someone attaches. Lines from an evicted instance are
    /// dropped. Returns the number of recipients.
    pub async fn deliver(
        &self,
        name: &str,
        id: NetworkId,
        pending: &mut VecDeque<String>,
    ) -> usize {
        let st = self.state.read().await;
        if !st.is_current(name, id) {
            pending.clear();
            return 0;
        }
        let recipients: Vec<&ClientEntry> = st.ready_clients(name).collect();
        if recipients.is_empty() {
            return 0;
        }
        for line in pending.drain(..) {
            for client in &recipients {
                push(client, &line);
            }
        }
        recipients.len()
    }

    /// Replay `server_log` to every client bound to `name` that is not yet
    /// ready, then mark them ready.
    ///
    /// Queued lines go to already-ready clients first; newly attached
    /// clients get them through the replay instead, so nothing arrives
    /// twice. Returns the number of clients attached.
    pub async fn attach_waiting(
        &self,
        name: &str,
        id: NetworkId,
        pending: &mut VecDeque<String>,
        server_log: &VecDeque<String>,
    ) -> usize {
        let mut st = self.state.write().await;
        if !st.is_current(name, id) {
            return 0;
        }

        let waiting: Vec<ClientId> = st
            .clients
            .values()
            .filter(|c| !c.ready && c.network.as_deref() == Some(name))
            .map(|c| c.id)
            .collect();
        if waiting.is_empty() {
            return 0;
        }

        {
            let ready: Vec<&ClientEntry> = st.ready_clients(name).collect();
            for line in pending.drain(..) {
                for client in &ready {
                    push(client, &line);
                }
            }
        }

        for cid in &waiting {
            if let Some(entry) = st.clients.get_mut(cid) {
                for line in server_log {
                    push(entry, line);
                }
                entry.ready = true;
                info!(client = %cid, network = name, replayed = server_log.len(), "client ready");
            }
        }
        waiting.len()
    }

    /// Send a NOTICE to every client bound to `name`.
    pub async fn notify_bound(&self, name: &str, text: &str) -> usize {
        let st = self.state.read().await;
        let mut sent = 0;
        for client in st.clients.values().filter(|c| c.network.as_deref() == Some(name)) {
            let target = client.username.as_deref().unwrap_or("*");
            push(client, &Message::notice(self.server_name(), target, text).to_wire());
            sent += 1;
        }
        sent
    }

    // ── Supervisors ──────────────────────────────────────────────

    /// Record a new reconnect loop for `name`, cancelling any previous one.
    pub(crate) async fn install_supervisor(&self, name: &str) -> (u64, CancellationToken) {
        let cancel = CancellationToken::new();
        let id = next_id();
        let mut st = self.state.write().await;
        let previous = st.supervisors.insert(
            name.to_owned(),
            Supervisor {
                id,
                cancel: cancel.clone(),
            },
        );
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }
        (id, cancel)
    }

    /// Forget supervisor `id` if it is still the one recorded for `name`.
    pub(crate) async fn retire_supervisor(&self, name: &str, id: u64) {
        let mut st = self.state.write().await;
        if st.supervisors.get(name).is_some_and(|s| s.id == id) {
            st.supervisors.remove(name);
        }
    }

    /// Stop `name` for good: cancel its reconnect loop and close the live
    /// instance. Returns whether anything was running.
    pub(crate) async fn shut_down_network(&self, name: &str) -> bool {
        let mut st = self.state.write().await;
        let supervisor = st.supervisors.remove(name);
        let live = st.networks.remove(name);
        if let Some(s) = &supervisor {
            s.cancel.cancel();
        }
        if let Some(h) = &live {
            h.close();
        }
        supervisor.is_some() || live.is_some()
    }

    pub async fn is_supervised(&self, name: &str) -> bool {
        self.state.read().await.supervisors.contains_key(name)
    }
}
