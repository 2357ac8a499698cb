//! Line framing for Stratum connections.
//!
//! Splits the inbound byte stream on `\n` or `\r`, drops blank lines and
//! parses each remaining line as a [`StratumRequest`]. A line (or an
//! undelimited tail) longer than `max_line_length` is a flood and fails the
//! stream before any of it is deserialized.

use bytes::{BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use super::protocol::StratumRequest;

pub const DEFAULT_MAX_LINE_LENGTH: usize = 8192;

/// Transport-fatal errors. The connection is closed on any of these.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("line exceeds {max} bytes")]
    LineTooLong { max: usize },
    #[error("line is not valid UTF-8")]
    InvalidUtf8,
    #[error("malformed request: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Garbage from the peer, as opposed to a socket failure.
    pub fn is_junk(&self) -> bool {
        !matches!(self, Self::Io(_))
    }
}

#[derive(Debug, Clone)]
pub struct StratumCodec {
    max_line_length: usize,
    /// Bytes already scanned for a delimiter.
    next_index: usize,
}

impl StratumCodec {
    pub fn new(max_line_length: usize) -> Self {
        Self {
            max_line_length,
            next_index: 0,
        }
    }
}

impl Default for StratumCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE_LENGTH)
    }
}

impl Decoder for StratumCodec {
    type Item = StratumRequest;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let delimiter = src[self.next_index..]
                .iter()
                .position(|b| *b == b'\n' || *b == b'\r');

            let Some(offset) = delimiter else {
                if src.len() > self.max_line_length {
                    return Err(ProtocolError::LineTooLong {
                        max: self.max_line_length,
                    });
                }
                self.next_index = src.len();
                return Ok(None);
            };

            let end = self.next_index + offset;
            self.next_index = 0;

            let frame = src.split_to(end + 1);
            let line = &frame[..end];
            if line.len() > self.max_line_length {
                return Err(ProtocolError::LineTooLong {
                    max: self.max_line_length,
                });
            }

            let text = std::str::from_utf8(line).map_err(|_| ProtocolError::InvalidUtf8)?;
            let text = text.trim();
            if text.is_empty() {
                continue;
            }

            return Ok(Some(serde_json::from_str(text)?));
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(request) => Ok(Some(request)),
            None => {
                // An unterminated tail at EOF is never parsed.
                src.clear();
                self.next_index = 0;
                Ok(None)
            }
        }
    }
}

impl<T: AsRef<str>> Encoder<T> for StratumCodec {
    type Error = ProtocolError;

    fn encode(&mut self, line: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let line = line.as_ref();
        dst.reserve(line.len() + 1);
        dst.put_slice(line.as_bytes());
        dst.put_u8(b'\n');
        Ok(())
    }
}
