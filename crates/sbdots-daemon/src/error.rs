//! Error types for the actions daemon.

use sbdots_ipc::{CodecError, ProtocolError};

/// Errors that can occur in the daemon
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    /// Empty or unparsable command
    #[error("{0}")]
    MalformedRequest(#[from] ProtocolError),

    /// Unknown identifier, or the registered handler does not match it
    #[error("{0}")]
    HandlerNotFound(String),

    /// Handler factory failed
    #[error("Failed to initialize '{handler}': {reason}")]
    HandlerInitFailed { handler: String, reason: String },

    /// Handler failed while running
    #[error("Error during '{action}' execution: {reason}")]
    ExecutionFailed { action: String, reason: String },

    /// One-shot handler exceeded the timeout
    #[error("Action '{action}' timed out after {secs}s")]
    ExecutionTimeout { action: String, secs: u64 },

    /// Daemon is draining and accepts no new sessions
    #[error("Daemon is shutting down")]
    ShuttingDown,

    /// Peer reset or closed the connection
    #[error("Connection lost")]
    ConnectionLost,

    /// Invalid registration at startup
    #[error("Registration error: {0}")]
    Registration(String),

    /// Invalid configuration
    #[error("Config error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DaemonError {
    /// Whether this error should be reported to the client.
    ///
    /// A lost connection has nobody left to report to.
    #[must_use]
    pub fn is_reportable(&self) -> bool {
        !matches!(self, DaemonError::ConnectionLost)
    }

    /// Render the `ERROR: ` reply for this error.
    #[must_use]
    pub fn to_reply(&self) -> String {
        sbdots_ipc::error_reply(self)
    }
}

impl From<CodecError> for DaemonError {
    fn from(err: CodecError) -> Self {
        if err.is_disconnect() {
            return DaemonError::ConnectionLost;
        }
        match err {
            CodecError::Io(e) => DaemonError::Io(e),
            CodecError::Json(e) => DaemonError::Json(e),
            other => DaemonError::Io(std::io::Error::other(other.to_string())),
        }
    }
}

pub type Result<T> = std::result::Result<T, DaemonError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_request_reply() {
        let err = DaemonError::MalformedRequest(ProtocolError::Empty);
        assert_eq!(err.to_reply(), "ERROR: Empty request");
    }

    #[test]
    fn test_handler_not_found_reply() {
        let err = DaemonError::HandlerNotFound("Unknown action 'nope'".to_string());
        assert_eq!(err.to_reply(), "ERROR: Unknown action 'nope'");
    }

    #[test]
    fn test_handler_init_failed_display() {
        let err = DaemonError::HandlerInitFailed {
            handler: "OnMpdChange".to_string(),
            reason: "bad player list".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Failed to initialize 'OnMpdChange': bad player list"
        );
    }

    #[test]
    fn test_execution_failed_display() {
        let err = DaemonError::ExecutionFailed {
            action: "on_check_updates".to_string(),
            reason: "checkupdates exited with 2".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Error during 'on_check_updates' execution: checkupdates exited with 2"
        );
    }

    #[test]
    fn test_execution_timeout_reply() {
        let err = DaemonError::ExecutionTimeout {
            action: "slow".to_string(),
            secs: 30,
        };
        assert_eq!(err.to_reply(), "ERROR: Action 'slow' timed out after 30s");
    }

    #[test]
    fn test_connection_lost_not_reportable() {
        assert!(!DaemonError::ConnectionLost.is_reportable());
        assert!(DaemonError::HandlerNotFound("x".to_string()).is_reportable());
    }

    #[test]
    fn test_from_codec_broken_pipe_is_connection_lost() {
        let codec_err = CodecError::Io(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "pipe broken",
        ));
        let err: DaemonError = codec_err.into();
        assert!(matches!(err, DaemonError::ConnectionLost));
    }

    #[test]
    fn test_from_codec_other_io_error() {
        let codec_err = CodecError::Io(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "denied",
        ));
        let err: DaemonError = codec_err.into();
        assert!(matches!(err, DaemonError::Io(_)));
        assert!(err.to_string().contains("denied"));
    }

    #[test]
    fn test_from_codec_line_too_long() {
        let err: DaemonError = CodecError::LineTooLong(99).into();
        assert!(matches!(err, DaemonError::Io(_)));
        assert!(err.to_string().contains("99"));
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use");
        let err: DaemonError = io_err.into();
        assert!(matches!(err, DaemonError::Io(_)));
        assert!(err.to_string().contains("I/O error"));
    }

    #[test]
    fn test_config_error_display() {
        let err = DaemonError::Config("actionTimeoutSecs must be positive".to_string());
        assert_eq!(
            err.to_string(),
            "Config error: actionTimeoutSecs must be positive"
        );
    }

    #[test]
    fn test_shutting_down_reply() {
        let err = DaemonError::ShuttingDown;
        assert!(err.is_reportable());
        assert_eq!(err.to_reply(), "ERROR: Daemon is shutting down");
    }

    #[test]
    fn test_daemon_error_debug() {
        let err = DaemonError::ConnectionLost;
        assert!(format!("{err:?}").contains("ConnectionLost"));
    }
}
