/// IRC message parsing for line classification.
///
/// Lines relayed through the bouncer are forwarded as raw text. Parsing is
/// only used to decide what a line *is* (PING, PONG, JOIN, USER, ...) and to
/// build the handful of lines the bouncer generates itself.
///
/// Shape per RFC 2812:
///   [`:`prefix SPACE] command [SPACE params] [SPACE `:` trailing]
use std::fmt;

/// A parsed IRC message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Optional prefix (server name or `nick!user@host`).
    pub prefix: Option<String>,
    /// The command, as received (e.g. `PRIVMSG`, `001`, `ping`).
    pub command: String,
    /// Parameters. A trailing param keeps its spaces.
    pub params: Vec<String>,
}

/// Errors that can occur during message parsing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("empty message")]
    Empty,
    #[error("prefix present but missing command")]
    MissingCommand,
}

impl Message {
    /// Build an unprefixed message.
    pub fn new(command: &str, params: Vec<String>) -> Self {
        Self {
            prefix: None,
            command: command.to_owned(),
            params,
        }
    }

    /// `:<server> NOTICE <target> :<text>`
    pub fn notice(server: &str, target: &str, text: impl Into<String>) -> Self {
        Self {
            prefix: Some(server.to_owned()),
            command: "NOTICE".into(),
            params: vec![target.to_owned(), text.into()],
        }
    }

    /// Parse one line (terminator optional).
    pub fn parse(input: &str) -> Result<Self, ParseError> {
        let line = input.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return Err(ParseError::Empty);
        }

        let (prefix, rest) = match line.strip_prefix(':') {
            Some(tagged) => {
                let (prefix, rest) = tagged
                    .split_once(' ')
                    .ok_or(ParseError::MissingCommand)?;
                (Some(prefix.to_owned()), rest.trim_start_matches(' '))
            }
            None => (None, line),
        };

        let (command, mut remaining) = rest.split_once(' ').unwrap_or((rest, ""));
        if command.is_empty() {
            return Err(ParseError::MissingCommand);
        }

        let mut params = Vec::new();
        loop {
            remaining = remaining.trim_start_matches(' ');
            if remaining.is_empty() {
                break;
            }
            if let Some(trailing) = remaining.strip_prefix(':') {
                params.push(trailing.to_owned());
                break;
            }
            match remaining.split_once(' ') {
                Some((param, tail)) => {
                    params.push(param.to_owned());
                    remaining = tail;
                }
                None => {
                    params.push(remaining.to_owned());
                    break;
                }
            }
        }

        Ok(Self {
            prefix,
            command: command.to_owned(),
            params,
        })
    }

    /// Case-insensitive command comparison.
    pub fn is(&self, command: &str) -> bool {
        self.command.eq_ignore_ascii_case(command)
    }

    /// The first parameter, if any.
    pub fn first(&self) -> Option<&str> {
        self.params.first().map(String::as_str)
    }

    /// Serialize to the wire format (without `\r\n`).
    ///
    /// The last parameter always gets a `:` so it may carry spaces.
    pub fn to_wire(&self) -> String {
        let mut out = String::new();
        if let Some(prefix) = &self.prefix {
            out.push(':');
            out.push_str(prefix);
            out.push(' ');
        }
        out.push_str(&self.command);

        if let Some((last, middle)) = self.params.split_last() {
            for param in middle {
                out.push(' ');
                out.push_str(param);
            }
            out.push_str(" :");
            out.push_str(last);
        }
        out
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wire())
    }
}
