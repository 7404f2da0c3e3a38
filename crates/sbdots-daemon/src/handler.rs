//! The contract every action handler implements.
//!
//! A handler is built by its registered factory from the request arguments,
//! then driven through [`ActionHandler::run`]. One-shot handlers print into
//! the captured output, which becomes the reply. Long-running handlers keep
//! emitting status frames until [`ActionContext::stopped`] resolves or a
//! write fails.

use std::fmt::Display;
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::future::BoxFuture;
use sbdots_ipc::{Frame, OK_REPLY};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::connection::ConnectionWriter;
use crate::error::Result;

pub trait ActionHandler: Send + Sync {
    /// Run the action. This is the handler's main loop for long-running
    /// actions and a single unit of work for one-shot actions.
    fn run<'a>(&'a self, ctx: &'a ActionContext) -> BoxFuture<'a, anyhow::Result<()>>;

    /// Optional teardown, called before the daemon signals the stop token.
    ///
    /// Must be idempotent and safe to call when `run` never started.
    fn stop(&self) {}
}

/// Output a one-shot handler prints while it runs
#[derive(Debug, Clone, Default)]
pub struct CapturedOutput(Arc<Mutex<String>>);

impl CapturedOutput {
    pub fn push_line(&self, text: impl Display) {
        let mut buf = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        buf.push_str(&text.to_string());
        buf.push('\n');
    }

    #[must_use]
    pub fn contents(&self) -> String {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The reply for a successful one-shot run: the trimmed output, or `OK`.
    #[must_use]
    pub fn reply(&self) -> String {
        let contents = self.contents();
        let trimmed = contents.trim();
        if trimmed.is_empty() {
            OK_REPLY.to_string()
        } else {
            trimmed.to_string()
        }
    }
}

/// Everything a running handler may touch
pub struct ActionContext {
    action: String,
    output: CapturedOutput,
    writer: ConnectionWriter,
    stop: CancellationToken,
}

impl ActionContext {
    #[must_use]
    pub fn new(
        action: impl Into<String>,
        output: CapturedOutput,
        writer: ConnectionWriter,
        stop: CancellationToken,
    ) -> Self {
        Self {
            action: action.into(),
            output,
            writer,
            stop,
        }
    }

    #[must_use]
    pub fn action(&self) -> &str {
        &self.action
    }

    /// Append a line to the captured output.
    pub fn print(&self, text: impl Display) {
        self.output.push_line(text);
    }

    /// Push a status object to the client as a `\n<json>\n` frame.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionLost` once the client is gone, which long-running
    /// handlers should treat as the signal to return.
    pub async fn emit<T: Serialize>(&self, status: &T) -> Result<()> {
        let value = serde_json::to_value(status)?;
        self.writer.send(Frame::Status(value)).await
    }

    /// Clear the client's status bar module.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionLost` once the client is gone.
    pub async fn clear(&self) -> Result<()> {
        self.writer.send(Frame::Clear).await
    }

    /// Resolves once the daemon asks the handler to stop or the client
    /// disconnects.
    pub async fn stopped(&self) {
        self.stop.cancelled().await;
    }
}
