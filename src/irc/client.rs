/// Downstream client sessions.
///
/// A client starts unbound. `USER <user>/<network>` binds it to a network by
/// name; from then on every line it sends goes upstream verbatim, except
/// `QUIT` (ends the downstream session only) and `JOIN`/`PART`, which are
/// also persisted so the network rejoins them on reconnect.
use std::net::SocketAddr;

use futures::SinkExt;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio_util::codec::FramedWrite;
use tracing::{debug, info, warn};

use super::codec::{Framer, LineCodec};
use super::connection::{Outbox, Role};
use super::message::Message;
use super::relay::{ClientEntry, ClientId, NetworkCommand, Relay, RelayError};

/// What the connection task should do after a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientFlow {
    Continue,
    Quit,
}

/// A channel membership change to persist.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ChannelChange {
    Join(String, Option<String>),
    Part(String),
}

/// Split the `USER` ident into `(username, network)`.
///
/// `bob/libera` → `("bob", "libera")`. Without a `/`, the whole field names
/// the network and doubles as the username.
pub fn parse_ident(ident: &str) -> Option<(&str, &str)> {
    let (user, network) = match ident.split_once('/') {
        Some((user, network)) => (user, network),
        None => (ident, ident),
    };
    if user.is_empty() || network.is_empty() {
        return None;
    }
    Some((user, network))
}

/// Protocol state of one downstream connection.
#[derive(Debug)]
pub struct ClientSession {
    id: ClientId,
    relay: Relay,
    outbox: Outbox,
    username: Option<String>,
    network: Option<String>,
    password: Option<String>,
}

impl ClientSession {
    pub fn new(id: ClientId, relay: Relay, outbox: Outbox) -> Self {
        Self {
            id,
            relay,
            outbox,
            username: None,
            network: None,
            password: None,
        }
    }

    pub fn network(&self) -> Option<&str> {
        self.network.as_deref()
    }

    fn target(&self) -> &str {
        self.username.as_deref().unwrap_or("*")
    }

    fn notice(&self, text: &str) -> Result<(), RelayError> {
        let line = Message::notice(self.relay.server_name(), self.target(), text).to_wire();
        self.outbox.send_line(line)
    }

    fn reply(&self, command: &str, params: Vec<String>) -> Result<(), RelayError> {
        let mut msg = Message::new(command, params);
        msg.prefix = Some(self.relay.server_name().to_owned());
        self.outbox.send_line(msg.to_wire())
    }

    pub async fn handle_line(&mut self, line: &str) -> Result<ClientFlow, RelayError> {
        let msg = match Message::parse(line) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(client = %self.id, "skipping line: {e}");
                return Ok(ClientFlow::Continue);
            }
        };

        match msg.command.to_ascii_uppercase().as_str() {
            "QUIT" => return Ok(ClientFlow::Quit),
            "PASS" => {
                self.password = msg.first().map(str::to_owned);
            }
            "USER" => self.register(&msg).await?,
            _ if self.network.is_none() => self.unbound(&msg)?,
            "JOIN" => {
                self.persist(Self::joined(&msg)).await;
                self.forward(line).await?;
            }
            "PART" => {
                self.persist(Self::parted(&msg)).await;
                self.forward(line).await?;
            }
            _ => self.forward(line).await?,
        }
        Ok(ClientFlow::Continue)
    }

    /// Lines from a client that has not picked a network yet.
    fn unbound(&self, msg: &Message) -> Result<(), RelayError> {
        let server = self.relay.server_name().to_owned();
        if msg.is("PING") {
            let token = msg.first().unwrap_or(server.as_str()).to_owned();
            self.reply("PONG", vec![server, token])
        } else if msg.is("CAP") && msg.first().is_some_and(|p| p.eq_ignore_ascii_case("LS")) {
            self.reply("CAP", vec!["*".into(), "LS".into(), String::new()])
        } else {
            debug!(client = %self.id, command = %msg.command, "dropping line from unbound client");
            Ok(())
        }
    }

    fn password_accepted(&self) -> bool {
        let datastore = self.relay.datastore();
        match datastore.password() {
            Ok(None) => true,
            Ok(Some(_)) => match &self.password {
                Some(attempt) => datastore.check_password(attempt).unwrap_or_else(|e| {
                    warn!(client = %self.id, "password check failed: {e}");
                    false
                }),
                None => false,
            },
            Err(e) => {
                warn!(client = %self.id, "password lookup failed: {e}");
                false
            }
        }
    }

    async fn register(&mut self, msg: &Message) -> Result<(), RelayError> {
        let Some((user, network)) = msg.first().and_then(parse_ident) else {
            debug!(client = %self.id, "skipping malformed USER");
            return Ok(());
        };
        let (user, network) = (user.to_owned(), network.to_owned());
        self.username = Some(user.clone());

        if !self.password_accepted() {
            info!(client = %self.id, "rejecting registration: bad password");
            return self.reply("464", vec!["*".into(), "Password incorrect".into()]);
        }

        match self.relay.bind_client(self.id, &user, &network).await {
            Ok(handle) => {
                self.network = Some(network);
                // A closed queue means the instance is going away; its
                // successor attaches us when it registers.
                let _ = handle.commands.send(NetworkCommand::Attach(self.id));
                Ok(())
            }
            Err(RelayError::UnknownNetwork(name)) => {
                info!(client = %self.id, network = %name, "unknown network requested");
                self.notice(&format!("Network {name} does not exist"))
            }
            Err(e) => Err(e),
        }
    }

    /// Resolve the bound network by name and queue `line` for it.
    async fn forward(&self, line: &str) -> Result<(), RelayError> {
        let Some(name) = self.network.as_deref() else {
            return Ok(());
        };
        let command = NetworkCommand::Forward {
            from: self.id,
            line: line.to_owned(),
        };
        let sent = match self.relay.lookup_network(name).await {
            Some(handle) => handle.commands.send(command).is_ok(),
            None => false,
        };
        if !sent {
            debug!(client = %self.id, network = name, "network absent, dropping line");
            self.notice(&format!("Network {name} is not connected"))?;
        }
        Ok(())
    }

    /// Channels named by a `JOIN`, with their positional keys.
    fn joined(msg: &Message) -> Vec<ChannelChange> {
        let Some(channels) = msg.first() else {
            return Vec::new();
        };
        if channels == "0" {
            return Vec::new();
        }
        let mut keys = msg.params.get(1).map(|k| k.split(',')).into_iter().flatten();
        channels
            .split(',')
            .filter(|c| !c.is_empty())
            .map(|channel| {
                let key = keys.next().filter(|k| !k.is_empty()).map(str::to_owned);
                ChannelChange::Join(channel.to_owned(), key)
            })
            .collect()
    }

    fn parted(msg: &Message) -> Vec<ChannelChange> {
        msg.first()
            .into_iter()
            .flat_map(|channels| channels.split(','))
            .filter(|c| !c.is_empty())
            .map(|channel| ChannelChange::Part(channel.to_owned()))
            .collect()
    }

    /// Write channel changes for the bound network on the blocking pool.
    ///
    /// Failures are logged; the line is forwarded regardless.
    async fn persist(&self, changes: Vec<ChannelChange>) {
        let Some(network) = self.network.clone() else {
            return;
        };
        if changes.is_empty() {
            return;
        }
        let store = self.relay.shared_datastore();
        let client = self.id;
        let task = tokio::task::spawn_blocking(move || {
            for change in &changes {
                let result = match change {
                    ChannelChange::Join(channel, key) => {
                        store.add_channel(&network, channel, key.as_deref())
                    }
                    ChannelChange::Part(channel) => store.remove_channel(&network, channel),
                };
                if let Err(e) = result {
                    warn!(%client, network = %network, ?change, "failed to persist channel: {e}");
                }
            }
        });
        if let Err(e) = task.await {
            warn!(%client, "channel persistence task failed: {e}");
        }
    }
}

/// Serve one downstream connection until it closes or sends `QUIT`.
pub async fn handle_client(
    socket: TcpStream,
    addr: SocketAddr,
    relay: Relay,
) -> Result<(), RelayError> {
    let id = ClientId::next();
    let (outbox, mut outgoing) = Outbox::channel(Role::Client);
    relay
        .attach_client(ClientEntry::new(id, addr, outbox.clone()))
        .await;

    let (mut reader, writer) = socket.into_split();
    let mut sink = FramedWrite::new(writer, LineCodec::new());
    let mut framer = Framer::new();
    let mut session = ClientSession::new(id, relay.clone(), outbox);
    let mut chunk = vec![0u8; 4096];

    let result = 'session: loop {
        tokio::select! {
            read = reader.read(&mut chunk) => match read {
                Ok(0) => break Ok(()),
                Ok(n) => {
                    for line in framer.feed(&chunk[..n]) {
                        match session.handle_line(&line).await {
                            Ok(ClientFlow::Continue) => {}
                            Ok(ClientFlow::Quit) => break 'session Ok(()),
                            Err(e) => break 'session Err(e),
                        }
                    }
                }
                Err(e) => break Err(e.into()),
            },
            Some(line) = outgoing.recv() => {
                if let Err(e) = sink.send(line).await {
                    break Err(e.into());
                }
            }
        }
    };

    relay.detach_client(id).await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BouncerConfig;
    use crate::irc::relay::NetworkHandle;
    use crate::store::{
        ChannelMap, Credentials, Datastore, JsonStore, StoreError, UnavailableStore,
    };
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    /// Datastore wrapper that records channel writes.
    #[derive(Debug, Default)]
    struct RecordingStore {
        inner: JsonStore,
        joins: Mutex<Vec<(String, String, Option<String>)>>,
        parts: Mutex<Vec<(String, String)>>,
    }

    impl Datastore for RecordingStore {
        fn networks(&self) -> Result<BTreeMap<String, Credentials>, StoreError> {
            self.inner.networks()
        }
        fn add_network(&self, credentials: &Credentials) -> Result<(), StoreError> {
            self.inner.add_network(credentials)
        }
        fn remove_network(&self, network: &str) -> Result<(), StoreError> {
            self.inner.remove_network(network)
        }
        fn channels(&self, network: &str) -> Result<ChannelMap, StoreError> {
            self.inner.channels(network)
        }
        fn add_channel(
            &self,
            network: &str,
            channel: &str,
            password: Option<&str>,
        ) -> Result<(), StoreError> {
            self.joins.lock().unwrap().push((
                network.into(),
                channel.into(),
                password.map(str::to_owned),
            ));
            self.inner.add_channel(network, channel, password)
        }
        fn remove_channel(&self, network: &str, channel: &str) -> Result<(), StoreError> {
            self.parts.lock().unwrap().push((network.into(), channel.into()));
            self.inner.remove_channel(network, channel)
        }
        fn password(&self) -> Result<Option<String>, StoreError> {
            self.inner.password()
        }
        fn set_password(&self, plaintext: &str) -> Result<(), StoreError> {
            self.inner.set_password(plaintext)
        }
        fn check_password(&self, attempt: &str) -> Result<bool, StoreError> {
            self.inner.check_password(attempt)
        }
    }

    struct Harness {
        store: Arc<RecordingStore>,
        relay: Relay,
        session: ClientSession,
        replies: mpsc::UnboundedReceiver<String>,
    }

    impl Harness {
        async fn new() -> Self {
            let store = Arc::new(RecordingStore::default());
            let config = BouncerConfig {
                server_name: "bnc.test".into(),
                ..BouncerConfig::default()
            };
            let relay = Relay::new(store.clone(), config);
            let id = ClientId::next();
            let (outbox, replies) = Outbox::channel(Role::Client);
            let addr: SocketAddr = ([127, 0, 0, 1], 40001).into();
            relay
                .attach_client(ClientEntry::new(id, addr, outbox.clone()))
                .await;
            let session = ClientSession::new(id, relay.clone(), outbox);
            Self {
                store,
                relay,
                session,
                replies,
            }
        }

        async fn network(&self, name: &str) -> mpsc::UnboundedReceiver<NetworkCommand> {
            let (handle, rx) = NetworkHandle::new(name, CancellationToken::new());
            self.relay.register_network(handle).await;
            rx
        }

        async fn send(&mut self, line: &str) -> ClientFlow {
            self.session.handle_line(line).await.unwrap()
        }

        fn replies(&mut self) -> Vec<String> {
            std::iter::from_fn(|| self.replies.try_recv().ok()).collect()
        }
    }

    fn commands(rx: &mut mpsc::UnboundedReceiver<NetworkCommand>) -> Vec<NetworkCommand> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    fn forwarded(rx: &mut mpsc::UnboundedReceiver<NetworkCommand>) -> Vec<String> {
        commands(rx)
            .into_iter()
            .filter_map(|c| match c {
                NetworkCommand::Forward { line, .. } => Some(line),
                NetworkCommand::Attach(_) => None,
            })
            .collect()
    }

    #[test]
    fn ident_parsing() {
        assert_eq!(parse_ident("bob/libera"), Some(("bob", "libera")));
        assert_eq!(parse_ident("libera"), Some(("libera", "libera")));
        assert_eq!(parse_ident("bob/"), None);
        assert_eq!(parse_ident("/libera"), None);
        assert_eq!(parse_ident(""), None);
    }

    #[tokio::test]
    async fn user_binds_and_requests_attach() {
        let mut h = Harness::new().await;
        let mut x = h.network("x").await;
        let id = h.session.id;

        h.send("NICK bob").await;
        h.send("USER bob/x 0 * :Bob").await;

        assert_eq!(h.session.network(), Some("x"));
        assert_eq!(commands(&mut x), vec![NetworkCommand::Attach(id)]);
        let view = h.relay.client(id).await.unwrap();
        assert_eq!(view.network.as_deref(), Some("x"));
        assert!(h.replies().is_empty());
    }

    #[tokio::test]
    async fn unknown_network_is_rejected() {
        let mut h = Harness::new().await;
        let _x = h.network("x").await;

        assert_eq!(h.send("USER bob/nope 0 * :Bob").await, ClientFlow::Continue);
        assert_eq!(
            h.replies(),
            vec![":bnc.test NOTICE bob :Network nope does not exist"]
        );
        assert_eq!(h.session.network(), None);
        assert_eq!(h.relay.client(h.session.id).await.unwrap().network, None);

        // Still usable afterwards.
        h.send("USER bob/x 0 * :Bob").await;
        assert_eq!(h.session.network(), Some("x"));
    }

    #[tokio::test]
    async fn join_is_persisted_and_forwarded() {
        let mut h = Harness::new().await;
        let mut x = h.network("x").await;
        h.send("USER bob/x 0 * :Bob").await;

        h.send("JOIN #test pw123").await;

        assert_eq!(
            *h.store.joins.lock().unwrap(),
            vec![("x".to_string(), "#test".to_string(), Some("pw123".to_string()))]
        );
        assert_eq!(forwarded(&mut x), vec!["JOIN #test pw123"]);
    }

    #[tokio::test]
    async fn join_keys_are_positional() {
        let mut h = Harness::new().await;
        let _x = h.network("x").await;
        h.send("USER bob/x 0 * :Bob").await;

        h.send("JOIN #a,#b,#c ka,,kc").await;
        h.send("JOIN 0").await;

        let joins = h.store.joins.lock().unwrap().clone();
        assert_eq!(
            joins,
            vec![
                ("x".into(), "#a".into(), Some("ka".into())),
                ("x".into(), "#b".into(), None),
                ("x".into(), "#c".into(), Some("kc".into())),
            ]
        );
    }

    #[tokio::test]
    async fn part_is_persisted_and_forwarded() {
        let mut h = Harness::new().await;
        let mut x = h.network("x").await;
        h.send("USER bob/x 0 * :Bob").await;
        h.send("JOIN #a,#b").await;

        h.send("PART #a,#b :bye").await;

        assert_eq!(
            *h.store.parts.lock().unwrap(),
            vec![("x".to_string(), "#a".to_string()), ("x".to_string(), "#b".to_string())]
        );
        assert!(h.store.channels("x").unwrap().is_empty());
        assert_eq!(forwarded(&mut x), vec!["JOIN #a,#b", "PART #a,#b :bye"]);
    }

    #[tokio::test]
    async fn quit_is_swallowed() {
        let mut h = Harness::new().await;
        let mut x = h.network("x").await;
        h.send("USER bob/x 0 * :Bob").await;

        assert_eq!(h.send("QUIT :gone").await, ClientFlow::Quit);
        assert!(forwarded(&mut x).is_empty());
    }

    #[tokio::test]
    async fn nothing_is_forwarded_before_binding() {
        let mut h = Harness::new().await;
        let mut x = h.network("x").await;

        h.send("NICK bob").await;
        h.send("PRIVMSG #x :hello").await;
        h.send("JOIN #x").await;

        assert!(commands(&mut x).is_empty());
        assert!(h.store.joins.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unbound_keepalive_and_caps() {
        let mut h = Harness::new().await;
        h.send("CAP LS 302").await;
        h.send("PING :abc").await;
        assert_eq!(
            h.replies(),
            vec![":bnc.test CAP * LS :", ":bnc.test PONG bnc.test :abc"]
        );
    }

    #[tokio::test]
    async fn password_gates_registration() {
        let mut h = Harness::new().await;
        let _x = h.network("x").await;
        h.store.set_password("hunter2").unwrap();

        h.send("USER bob/x 0 * :Bob").await;
        assert_eq!(h.replies(), vec![":bnc.test 464 * :Password incorrect"]);
        assert_eq!(h.session.network(), None);

        h.send("PASS wrong").await;
        h.send("USER bob/x 0 * :Bob").await;
        assert_eq!(h.replies(), vec![":bnc.test 464 * :Password incorrect"]);

        h.send("PASS hunter2").await;
        h.send("USER bob/x 0 * :Bob").await;
        assert_eq!(h.session.network(), Some("x"));
        assert!(h.replies().is_empty());
    }

    #[tokio::test]
    async fn forwarding_to_absent_network_notifies() {
        let mut h = Harness::new().await;
        let _x = h.network("x").await;
        h.send("USER bob/x 0 * :Bob").await;
        let handle = h.relay.lookup_network("x").await.unwrap();
        h.relay.unregister_network("x", handle.id).await;

        h.send("PRIVMSG #x :anyone?").await;
        assert_eq!(
            h.replies(),
            vec![":bnc.test NOTICE bob :Network x is not connected"]
        );
    }

    #[tokio::test]
    async fn rebinding_moves_to_other_network() {
        let mut h = Harness::new().await;
        let mut x = h.network("x").await;
        let mut y = h.network("y").await;
        let id = h.session.id;

        h.send("USER bob/x 0 * :Bob").await;
        h.send("USER bob/y 0 * :Bob").await;
        h.send("PRIVMSG #y :hi").await;

        assert_eq!(commands(&mut x), vec![NetworkCommand::Attach(id)]);
        assert_eq!(
            commands(&mut y),
            vec![
                NetworkCommand::Attach(id),
                NetworkCommand::Forward {
                    from: id,
                    line: "PRIVMSG #y :hi".into()
                },
            ]
        );
    }

    #[tokio::test]
    async fn join_and_part_forwarded_when_persistence_fails() {
        let relay = Relay::new(Arc::new(UnavailableStore), BouncerConfig::default());
        let (handle, mut x) = NetworkHandle::new("x", CancellationToken::new());
        relay.register_network(handle).await;
        let id = ClientId::next();
        let (outbox, mut replies) = Outbox::channel(Role::Client);
        let addr: SocketAddr = ([127, 0, 0, 1], 40002).into();
        relay
            .attach_client(ClientEntry::new(id, addr, outbox.clone()))
            .await;
        let mut session = ClientSession::new(id, relay, outbox);

        session.handle_line("USER bob/x 0 * :Bob").await.unwrap();
        session.handle_line("JOIN #a").await.unwrap();
        session.handle_line("PART #a :bye").await.unwrap();

        assert_eq!(forwarded(&mut x), vec!["JOIN #a", "PART #a :bye"]);
        assert!(replies.try_recv().is_err());
    }

    #[test]
    fn channel_changes_from_join_and_part() {
        let join = Message::parse("JOIN #a,#b ka").unwrap();
        assert_eq!(
            ClientSession::joined(&join),
            vec![
                ChannelChange::Join("#a".into(), Some("ka".into())),
                ChannelChange::Join("#b".into(), None),
            ]
        );
        assert!(ClientSession::joined(&Message::parse("JOIN 0").unwrap()).is_empty());
        assert!(ClientSession::joined(&Message::parse("JOIN").unwrap()).is_empty());

        let part = Message::parse("PART #a,,#b :later").unwrap();
        assert_eq!(
            ClientSession::parted(&part),
            vec![ChannelChange::Part("#a".into()), ChannelChange::Part("#b".into())]
        );
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped() {
        let mut h = Harness::new().await;
        assert_eq!(h.send(":prefixonly").await, ClientFlow::Continue);
        assert_eq!(h.send("USER").await, ClientFlow::Continue);
        assert!(h.replies().is_empty());
    }
}
