//! Request and reply conventions.
//!
//! A request is a single write of `<action> <arg1> ... <argN>`. Replies are
//! either a payload, the literal [`OK_REPLY`], or a line starting with
//! [`ERROR_PREFIX`].

/// Maximum number of request bytes the daemon reads from a connection.
pub const MAX_REQUEST_SIZE: usize = 1024;

/// Prefix of every error reply.
pub const ERROR_PREFIX: &str = "ERROR: ";

/// Reply sent by a one-shot action that printed nothing.
pub const OK_REPLY: &str = "OK";

/// Errors produced while parsing or encoding a request
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Empty request")]
    Empty,

    #[error("Request too large: {0} bytes (max: {MAX_REQUEST_SIZE})")]
    TooLarge(usize),
}

/// A parsed action request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionRequest {
    pub action: String,
    pub args: Vec<String>,
}

impl ActionRequest {
    #[must_use]
    pub fn new(action: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            action: action.into(),
            args,
        }
    }

    /// Parse the raw bytes read from a connection.
    ///
    /// Invalid UTF-8 is replaced rather than rejected; the identifier lookup
    /// that follows will report anything unrecognisable. Arguments are split
    /// on runs of whitespace.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Empty`] when the body is empty or whitespace.
    pub fn parse(raw: &[u8]) -> Result<Self, ProtocolError> {
        let text = String::from_utf8_lossy(raw);
        let mut parts = text.split_whitespace();
        let action = parts.next().ok_or(ProtocolError::Empty)?;

        Ok(Self {
            action: action.to_string(),
            args: parts.map(String::from).collect(),
        })
    }

    /// Render the request as it travels on the wire.
    #[must_use]
    pub fn to_wire(&self) -> String {
        let mut line = self.action.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }

    /// Encode the request, enforcing the daemon's read limit.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Empty`] for a blank action and
    /// [`ProtocolError::TooLarge`] when the daemon would truncate the request.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        if self.action.trim().is_empty() {
            return Err(ProtocolError::Empty);
        }
        let wire = self.to_wire();
        if wire.len() > MAX_REQUEST_SIZE {
            return Err(ProtocolError::TooLarge(wire.len()));
        }
        Ok(wire.into_bytes())
    }
}

/// Build an error reply for `reason`.
#[must_use]
pub fn error_reply(reason: impl std::fmt::Display) -> String {
    format!("{ERROR_PREFIX}{reason}")
}

/// Whether `identifier` matches `[a-z0-9_]+`.
#[must_use]
pub fn is_valid_identifier(identifier: &str) -> bool {
    !identifier.is_empty()
        && identifier
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
}
