//! Wire protocol for the SBDots actions daemon.
//!
//! The daemon speaks a small text protocol over a Unix stream
//! socket so that status bars and shell scripts can drive it without a
//! client library:
//!
//! - [`protocol`]: request parsing and the `ERROR: ` reply convention
//! - [`transport`]: the status frame encoder and line decoder
//! - [`client`]: socket path resolution and a minimal async client
//!
//! # Example
//!
//! ```no_run
//! use futures_util::StreamExt;
//! use sbdots_ipc::{ActionRequest, client};
//!
//! # async fn example() -> Result<(), sbdots_ipc::ClientError> {
//! let request = ActionRequest::new("get_hypridle_status", Vec::new());
//! let mut replies = client::send_request(&client::socket_path(), &request).await?;
//! while let Some(line) = replies.next().await {
//!     println!("{}", line?);
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod protocol;
pub mod transport;

pub use client::{ClientError, ReplyStream, SOCKET_ENV, SOCKET_NAME, send_request, socket_path};
pub use protocol::{
    ActionRequest, ERROR_PREFIX, MAX_REQUEST_SIZE, OK_REPLY, ProtocolError, error_reply,
    is_valid_identifier,
};
pub use transport::{ActionCodec, CodecError, Frame};
