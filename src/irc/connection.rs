/// Behaviour shared by every endpoint the bouncer talks to.
///
/// Both downstream clients and upstream networks write through an
/// [`Outbox`]: an unbounded queue drained by the task that owns the socket.
/// Writing never blocks the caller, and a queue whose owner has gone away
/// reports [`RelayError::WriteFailed`], which callers treat as connection
/// loss for that endpoint.
use std::fmt;

use tokio::sync::mpsc;

use super::relay::RelayError;

/// IRC line terminator.
pub const TERMINATOR: &str = "\r\n";

/// Append the terminator unless the line already ends with it.
pub fn normalize(line: &str) -> String {
    if line.ends_with(TERMINATOR) {
        line.to_owned()
    } else {
        format!("{line}{TERMINATOR}")
    }
}

/// Join command parts with single spaces.
pub fn compose<S: AsRef<str>>(parts: &[S]) -> String {
    parts
        .iter()
        .map(AsRef::as_ref)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Which side of the bouncer a connection sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Downstream IRC client connected to us.
    Client,
    /// Upstream IRC network we connected to.
    Network,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Client => f.write_str("client"),
            Self::Network => f.write_str("network"),
        }
    }
}

/// Write side of a connection.
#[derive(Debug, Clone)]
pub struct Outbox {
    role: Role,
    tx: mpsc::UnboundedSender<String>,
}

impl Outbox {
    /// Create an outbox and the receiver its owning task drains.
    pub fn channel(role: Role) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { role, tx }, rx)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Join `parts` with spaces and queue the result.
    pub fn send<S: AsRef<str>>(&self, parts: &[S]) -> Result<(), RelayError> {
        self.send_line(compose(parts))
    }

    /// Queue one line. The terminator is added by the codec on the way out.
    pub fn send_line(&self, line: impl Into<String>) -> Result<(), RelayError> {
        let mut line = line.into();
        if line.ends_with(TERMINATOR) {
            line.truncate(line.len() - TERMINATOR.len());
        }
        self.tx
            .send(line)
            .map_err(|_| RelayError::WriteFailed(self.role))
    }

    /// Whether the owning task has dropped its receiver.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn normalize_appends_terminator_once() {
        assert_eq!(normalize("NICK bob"), "NICK bob\r\n");
        assert_eq!(normalize("NICK bob\r\n"), "NICK bob\r\n");
        assert_eq!(normalize(&normalize("PING :x")), "PING :x\r\n");
        assert_eq!(normalize(""), "\r\n");
    }

    #[test]
    fn compose_joins_with_single_spaces() {
        assert_eq!(compose(&["USER", "bob", "0", "*", ":Bob"]), "USER bob 0 * :Bob");
        assert_eq!(compose::<&str>(&[]), "");
    }

    #[test]
    fn send_queues_composed_line() {
        let (outbox, mut rx) = Outbox::channel(Role::Network);
        outbox.send(&["PONG", ":token"]).unwrap();
        outbox.send_line("JOIN #rust\r\n").unwrap();
        assert_eq!(rx.try_recv().unwrap(), "PONG :token");
        assert_eq!(rx.try_recv().unwrap(), "JOIN #rust");
    }

    #[test]
    fn send_after_owner_gone_is_write_failure() {
        let (outbox, rx) = Outbox::channel(Role::Client);
        drop(rx);
        assert!(outbox.is_closed());
        let err = outbox.send(&["PING", ":x"]).unwrap_err();
        assert!(matches!(err, RelayError::WriteFailed(Role::Client)));
    }
}
