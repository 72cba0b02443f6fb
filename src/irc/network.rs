/// Upstream network sessions.
///
/// A supervisor task per network name dials the server, registers the
/// session in the [`Relay`], performs the handshake, and then shuttles lines
/// until the transport goes away. Unexpected loss is retried on an
/// exponential schedule; an intentional close (eviction or administrative
/// removal) ends the supervisor.
///
/// [`NetworkState`] holds the per-session buffers and is only ever touched
/// by the session task. Clients talk to it through [`NetworkCommand`]s.
use std::collections::VecDeque;
use std::time::Duration;

use futures::SinkExt;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backoff::Backoff;
use super::codec::{Framer, LineCodec};
use super::connection::{Outbox, Role};
use super::message::Message;
use super::relay::{NetworkCommand, NetworkHandle, NetworkId, Relay, RelayError};
use crate::store::{Credentials, Datastore};

/// How long an intentional close waits for `QUIT` to be written.
const QUIT_GRACE: Duration = Duration::from_secs(2);

/// What an inbound upstream line is, for buffering purposes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineKind {
    /// Keepalive request. Carries the reply to send back.
    Ping(String),
    /// Keepalive echo. Forwarded, never logged.
    Pong,
    /// Anything else. Logged for replay and broadcast.
    Record,
}

/// Classify one raw line. Unparseable lines yield `None` and are skipped.
pub fn classify(line: &str) -> Option<LineKind> {
    let msg = Message::parse(line).ok()?;
    if msg.is("PING") {
        Some(LineKind::Ping(Message::new("PONG", msg.params).to_wire()))
    } else if msg.is("PONG") {
        Some(LineKind::Pong)
    } else {
        Some(LineKind::Record)
    }
}

/// `001` (RPL_WELCOME) from upstream.
fn is_welcome(line: &str) -> bool {
    Message::parse(line).is_ok_and(|msg| msg.is("001"))
}

/// Buffers and identity of one upstream session.
#[derive(Debug)]
pub struct NetworkState {
    handle: NetworkHandle,
    credentials: Credentials,
    /// Replay record, oldest first, bounded by `capacity`.
    server_log: VecDeque<String>,
    /// Lines waiting for a ready client.
    pending: VecDeque<String>,
    capacity: usize,
    upstream: Outbox,
    /// Set once upstream has sent `001`.
    registered: bool,
}

impl NetworkState {
    pub fn new(
        handle: NetworkHandle,
        credentials: Credentials,
        capacity: usize,
        upstream: Outbox,
    ) -> Self {
        Self {
            handle,
            credentials,
            server_log: VecDeque::new(),
            pending: VecDeque::new(),
            capacity: capacity.max(1),
            upstream,
            registered: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.handle.name
    }

    pub fn id(&self) -> NetworkId {
        self.handle.id
    }

    /// Whether upstream has welcomed us. A session that drops before this
    /// counts as a failed attempt.
    pub fn is_registered(&self) -> bool {
        self.registered
    }

    pub fn server_log(&self) -> &VecDeque<String> {
        &self.server_log
    }

    pub fn pending(&self) -> &VecDeque<String> {
        &self.pending
    }

    /// Queue the registration lines, then a `JOIN` per persisted channel.
    ///
    /// A datastore failure skips the auto-join; the session still comes up.
    pub fn handshake(&mut self, datastore: &dyn Datastore) -> Result<(), RelayError> {
        let creds = &self.credentials;
        if let Some(password) = &creds.password {
            self.upstream.send(&["PASS", password])?;
        }
        self.upstream.send(&["NICK", &creds.nickname])?;
        let mode = creds.usermode.to_string();
        let realname = format!(":{}", creds.realname);
        self.upstream
            .send(&["USER", &creds.username, &mode, "*", &realname])?;

        match datastore.channels(&creds.network) {
            Ok(channels) => {
                for (channel, key) in &channels {
                    match key {
                        Some(key) => self.upstream.send(&["JOIN", channel, key])?,
                        None => self.upstream.send(&["JOIN", channel])?,
                    }
                }
                info!(network = %creds.network, channels = channels.len(), "handshake sent");
            }
            Err(e) => {
                warn!(network = %creds.network, "skipping auto-join, channel list unavailable: {e}");
            }
        }
        Ok(())
    }

    fn record(&mut self, line: String) {
        if self.server_log.len() == self.capacity {
            self.server_log.pop_front();
        }
        self.server_log.push_back(line.clone());
        self.enqueue(line);
    }

    fn enqueue(&mut self, line: String) {
        if self.pending.len() == self.capacity {
            self.pending.pop_front();
        }
        self.pending.push_back(line);
    }

    /// Process the lines from one read, then fan out what is queued.
    pub async fn ingest(&mut self, relay: &Relay, lines: Vec<String>) -> Result<(), RelayError> {
        for line in lines {
            match classify(&line) {
                Some(LineKind::Ping(reply)) => {
                    debug!(network = %self.handle.name, "answering keepalive");
                    self.upstream.send_line(reply)?;
                }
                Some(LineKind::Pong) => self.enqueue(line),
                Some(LineKind::Record) => {
                    if !self.registered && is_welcome(&line) {
                        info!(network = %self.handle.name, "registered with server");
                        self.registered = true;
                    }
                    self.record(line);
                }
                None => debug!(network = %self.handle.name, "skipping malformed line {line:?}"),
            }
        }
        relay
            .deliver(&self.handle.name, self.handle.id, &mut self.pending)
            .await;
        Ok(())
    }

    /// Replay the log to clients bound by name that are not ready yet.
    pub async fn attach_waiting(&mut self, relay: &Relay) -> usize {
        relay
            .attach_waiting(
                &self.handle.name,
                self.handle.id,
                &mut self.pending,
                &self.server_log,
            )
            .await
    }

    pub async fn handle_command(
        &mut self,
        relay: &Relay,
        command: NetworkCommand,
    ) -> Result<(), RelayError> {
        match command {
            NetworkCommand::Attach(client) => {
                let attached = self.attach_waiting(relay).await;
                debug!(network = %self.handle.name, %client, attached, "attach requested");
            }
            NetworkCommand::Forward { from, line } => {
                debug!(network = %self.handle.name, client = %from, "forwarding {line:?}");
                self.upstream.send_line(line)?;
            }
        }
        Ok(())
    }
}

/// How a session ended.
#[derive(Debug)]
enum SessionEnd {
    /// Shut down on purpose. Never retried.
    Closed,
    /// Could not reach the server.
    ConnectFailed(std::io::Error),
    /// Connected, then lost the transport.
    Lost(String),
}

/// Start supervising `credentials.network`. Replaces any running supervisor
/// for the same name.
///
/// The supervisor is recorded before the task starts, so a removal issued
/// right after this returns always reaches it.
pub async fn spawn(relay: Relay, credentials: Credentials) -> JoinHandle<()> {
    let (supervisor, cancel) = relay.install_supervisor(&credentials.network).await;
    tokio::spawn(supervise(relay, credentials, supervisor, cancel))
}

/// Reconnect loop for one network name.
async fn supervise(
    relay: Relay,
    credentials: Credentials,
    supervisor: u64,
    cancel: CancellationToken,
) {
    let name = credentials.network.clone();
    let mut backoff = Backoff::new(relay.config().reconnect);

    'reconnect: loop {
        let end = run_session(&relay, &credentials, &cancel, &mut backoff).await;

        match end {
            SessionEnd::Closed => {
                info!(network = %name, "network closed");
                break 'reconnect;
            }
            SessionEnd::ConnectFailed(e) => {
                warn!(network = %name, attempt = backoff.attempts(), "connect failed: {e}");
            }
            SessionEnd::Lost(reason) => {
                warn!(network = %name, "connection lost: {reason}");
                relay
                    .notify_bound(&name, &format!("Connection to {name} lost, reconnecting"))
                    .await;
            }
        }

        let Some(delay) = backoff.next_delay() else {
            warn!(network = %name, attempts = backoff.attempts(), "giving up on network");
            relay
                .notify_bound(&name, &format!("Network {name} is unavailable"))
                .await;
            break 'reconnect;
        };
        info!(
            network = %name,
            attempt = backoff.attempts(),
            ?delay,
            "scheduling reconnect"
        );
        tokio::select! {
            _ = cancel.cancelled() => break 'reconnect,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    relay.retire_supervisor(&name, supervisor).await;
}

/// One connection attempt and, if it succeeds, the whole session.
async fn run_session(
    relay: &Relay,
    credentials: &Credentials,
    cancel: &CancellationToken,
    backoff: &mut Backoff,
) -> SessionEnd {
    let name = credentials.network.as_str();
    let target = (credentials.hostname.as_str(), credentials.port);

    let stream = tokio::select! {
        _ = cancel.cancelled() => return SessionEnd::Closed,
        res = TcpStream::connect(target) => match res {
            Ok(stream) => stream,
            Err(e) => return SessionEnd::ConnectFailed(e),
        },
    };
    info!(network = name, host = %credentials.hostname, port = credentials.port, "connected");

    let (handle, mut commands) = NetworkHandle::new(name, cancel.child_token());
    let shutdown = handle.shutdown.clone();
    let (upstream, mut outgoing) = Outbox::channel(Role::Network);
    let mut state = NetworkState::new(
        handle.clone(),
        credentials.clone(),
        relay.config().log_capacity,
        upstream,
    );

    relay.register_network(handle.clone()).await;
    if let Err(e) = state.handshake(relay.datastore()) {
        relay.unregister_network(name, handle.id).await;
        return SessionEnd::Lost(e.to_string());
    }
    state.attach_waiting(relay).await;

    let (mut reader, writer) = stream.into_split();
    let mut sink = FramedWrite::new(writer, LineCodec::new());
    let mut framer = Framer::new();
    let mut chunk = vec![0u8; 4096];

    let end = loop {
        tokio::select! {
            _ = shutdown.cancelled() => break SessionEnd::Closed,
            read = reader.read(&mut chunk) => match read {
                Ok(0) => break SessionEnd::Lost("closed by server".into()),
                Ok(n) => {
                    let lines = framer.feed(&chunk[..n]);
                    let was_registered = state.is_registered();
                    if let Err(e) = state.ingest(relay, lines).await {
                        break SessionEnd::Lost(e.to_string());
                    }
                    if !was_registered && state.is_registered() {
                        backoff.reset();
                    }
                }
                Err(e) => break SessionEnd::Lost(e.to_string()),
            },
            Some(line) = outgoing.recv() => {
                if let Err(e) = sink.send(line).await {
                    break SessionEnd::Lost(e.to_string());
                }
            }
            Some(command) = commands.recv() => {
                if let Err(e) = state.handle_command(relay, command).await {
                    break SessionEnd::Lost(e.to_string());
                }
            }
        }
    };

    relay.unregister_network(name, handle.id).await;

    if let SessionEnd::Closed = end {
        // Flush whatever was queued, then say goodbye.
        while let Ok(line) = outgoing.try_recv() {
            if sink.feed(line).await.is_err() {
                break;
            }
        }
        let quit = sink.send("QUIT :Bouncer closing connection".to_string());
        if tokio::time::timeout(QUIT_GRACE, quit).await.is_err() {
            debug!(network = name, "QUIT not delivered");
        }
    }
    end
}
