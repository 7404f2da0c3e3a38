//! Client helper for talking to the actions daemon.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio_util::codec::FramedRead;
use tracing::debug;

use crate::protocol::{ActionRequest, ProtocolError};
use crate::transport::{ActionCodec, CodecError};

/// Environment variable overriding the socket path.
pub const SOCKET_ENV: &str = "SBDOTS_ACTIONS_SOCKET";

/// Socket file name inside the runtime directory.
pub const SOCKET_NAME: &str = "sbdots_actions.sock";

fn runtime_dir() -> PathBuf {
    std::env::var("XDG_RUNTIME_DIR").map_or_else(|_| std::env::temp_dir(), PathBuf::from)
}

/// Get the socket path for the actions daemon.
///
/// Honours [`SOCKET_ENV`] first, then prefers `$XDG_RUNTIME_DIR` and falls
/// back to the system temp directory.
#[must_use]
pub fn socket_path() -> PathBuf {
    if let Ok(path) = std::env::var(SOCKET_ENV)
        && !path.is_empty()
    {
        return PathBuf::from(path);
    }
    runtime_dir().join(SOCKET_NAME)
}

/// Errors that can occur with the client
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Invalid request: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Daemon is not running at {0}")]
    NotRunning(PathBuf),
}

/// Stream of reply lines from the daemon
pub type ReplyStream = FramedRead<UnixStream, ActionCodec>;

/// Send `request` to the daemon at `path` and return the reply stream.
///
/// The write side is left open: the daemon treats a closed peer as the end
/// of a long-running session. The stream ends when the daemon closes the
/// connection.
///
/// # Errors
///
/// Returns [`ClientError::NotRunning`] when nothing is listening at `path`,
/// [`ClientError::Protocol`] for requests the daemon would reject unread, and
/// [`ClientError::Io`] when the write fails.
pub async fn send_request(path: &Path, request: &ActionRequest) -> Result<ReplyStream, ClientError> {
    let payload = request.encode()?;

    let mut stream = match UnixStream::connect(path).await {
        Ok(stream) => stream,
        Err(e)
            if matches!(
                e.kind(),
                std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused
            ) =>
        {
            return Err(ClientError::NotRunning(path.to_path_buf()));
        }
        Err(e) => return Err(e.into()),
    };

    debug!("Sending request: {}", request.to_wire());
    stream.write_all(&payload).await?;
    stream.flush().await?;

    Ok(FramedRead::new(stream, ActionCodec::new()))
}
