//! Framing for daemon replies.
//!
//! One-shot replies are written as-is. Long-running sessions push status
//! objects in the format status bars such as waybar expect from a
//! continuously running module:
//!
//! ```text
//! \n{"text": "...", "class": "..."}\n
//! ```
//!
//! A bare `\n` clears the module. On the reading side, every non-empty line
//! is one item; a trailing partial line is yielded when the daemon closes the
//! connection.

use bytes::{BufMut, BytesMut};
use serde_json::Value;
use std::io;
use tokio_util::codec::{Decoder, Encoder};

/// Default maximum line length accepted by the decoder (64 KiB)
const DEFAULT_MAX_LINE_LENGTH: usize = 64 * 1024;

/// A unit of output written to a client
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Raw text, written without any framing
    Text(String),
    /// A status object, framed as `\n<json>\n`
    Status(Value),
    /// An empty frame, clearing the status bar module
    Clear,
}

impl Frame {
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }
}

/// Codec encoding [`Frame`]s and decoding non-empty lines
#[derive(Debug)]
pub struct ActionCodec {
    max_line_length: usize,
    next_index: usize,
}

impl ActionCodec {
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_line_length(DEFAULT_MAX_LINE_LENGTH)
    }

    #[must_use]
    pub fn with_max_line_length(max_line_length: usize) -> Self {
        Self {
            max_line_length,
            next_index: 0,
        }
    }
}

impl Default for ActionCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn line_from_bytes(bytes: &[u8]) -> Result<Option<String>, CodecError> {
    let line = std::str::from_utf8(bytes)?;
    let line = line.trim_end_matches(['\n', '\r']);
    if line.is_empty() {
        Ok(None)
    } else {
        Ok(Some(line.to_string()))
    }
}

impl Decoder for ActionCodec {
    type Item = String;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(offset) = src[self.next_index..].iter().position(|b| *b == b'\n') else {
                if src.len() > self.max_line_length {
                    return Err(CodecError::LineTooLong(src.len()));
                }
                self.next_index = src.len();
                return Ok(None);
            };

            let newline = self.next_index + offset;
            self.next_index = 0;
            let raw = src.split_to(newline + 1);

            if raw.len() > self.max_line_length {
                return Err(CodecError::LineTooLong(raw.len()));
            }

            if let Some(line) = line_from_bytes(&raw)? {
                return Ok(Some(line));
            }
            // Blank lines are frame separators; keep scanning.
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }
        self.next_index = 0;
        if src.is_empty() {
            return Ok(None);
        }
        let rest = src.split_to(src.len());
        line_from_bytes(&rest)
    }
}

impl Encoder<Frame> for ActionCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            Frame::Text(text) => {
                dst.reserve(text.len());
                dst.put_slice(text.as_bytes());
            }
            Frame::Status(value) => {
                let json = serde_json::to_string(&value)?;
                dst.reserve(json.len() + 2);
                dst.put_u8(b'\n');
                dst.put_slice(json.as_bytes());
                dst.put_u8(b'\n');
            }
            Frame::Clear => dst.put_u8(b'\n'),
        }
        Ok(())
    }
}

/// Errors that can occur during codec operations
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("UTF-8 error: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("Line too long: {0} bytes")]
    LineTooLong(usize),
}

impl CodecError {
    /// Whether the error means the peer has gone away.
    #[must_use]
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            CodecError::Io(e) if matches!(
                e.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::UnexpectedEof
            )
        )
    }
}
