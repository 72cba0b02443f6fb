/// Line framing shared by both directions of the bouncer.
///
/// [`LineCodec`] splits a byte stream on `\r\n` and yields raw line text;
/// the encoder normalizes outgoing lines so each one ends in exactly one
/// terminator. [`Framer`] runs arbitrary read chunks through the codec, so a
/// line split across TCP reads is reassembled before anyone sees it.
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use super::connection::{normalize, TERMINATOR};

/// Maximum line length (including `\r\n`). IRCv3 tags allow up to 8191.
pub const MAX_LINE_LENGTH: usize = 8191;

/// A tokio codec that frames raw IRC lines on `\r\n` boundaries.
///
/// Empty lines are skipped. An overlong fragment is thrown away up to the
/// next terminator instead of failing the connection.
#[derive(Debug, Default)]
pub struct LineCodec {
    discarding: bool,
}

impl LineCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(TERMINATOR.len())
        .position(|w| w == TERMINATOR.as_bytes())
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(pos) = find_terminator(src) else {
                if src.len() > MAX_LINE_LENGTH {
                    if !self.discarding {
                        warn!(len = src.len(), "discarding overlong line");
                    }
                    // Keep a trailing `\r` in case the `\n` arrives next.
                    let keep = usize::from(src.last() == Some(&b'\r'));
                    src.advance(src.len() - keep);
                    self.discarding = true;
                }
                return Ok(None);
            };

            let line = src.split_to(pos);
            src.advance(TERMINATOR.len());

            if std::mem::take(&mut self.discarding) || line.is_empty() {
                continue;
            }
            if line.len() + TERMINATOR.len() > MAX_LINE_LENGTH {
                warn!(len = line.len(), "discarding overlong line");
                continue;
            }

            return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
        }
    }
}

impl Encoder<String> for LineCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let wire = normalize(&item);
        dst.reserve(wire.len());
        dst.put_slice(wire.as_bytes());
        Ok(())
    }
}

/// Reassembles complete lines from arbitrarily fragmented read chunks.
///
/// Whatever follows the last terminator in a chunk is kept and prefixed to
/// the next chunk.
#[derive(Debug, Default)]
pub struct Framer {
    codec: LineCodec,
    leftover: BytesMut,
}

impl Framer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one read chunk, returning every line it completed, in order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.leftover.extend_from_slice(chunk);
        let mut lines = Vec::new();
        // The decoder never returns an error; lossy UTF-8 and overlong
        // discards are handled inside it.
        while let Ok(Some(line)) = self.codec.decode(&mut self.leftover) {
            lines.push(line);
        }
        lines
    }

    /// Bytes waiting for a terminator.
    pub fn leftover(&self) -> &[u8] {
        &self.leftover
    }
}
