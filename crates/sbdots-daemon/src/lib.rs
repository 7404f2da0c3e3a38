//! SBDots actions daemon library.
//!
//! Accepts text commands over a Unix socket, resolves them against a
//! registry of action handlers and runs each either as a bounded one-shot
//! call or as a supervised long-running session streaming status frames back
//! to a status bar client.

pub mod actions;
pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod registry;
pub mod server;
pub mod state;
pub mod supervisor;

pub use config::{DaemonConfig, Directories};
pub use error::{DaemonError, Result};
pub use handler::{ActionContext, ActionHandler, CapturedOutput};
pub use registry::{
    ActionDescriptor, ActionRegistry, ExecutionMode, HandlerFactory, RegistryBuilder,
};
pub use server::{Daemon, Phase, wait_for_shutdown_signal};
pub use state::{SessionId, SharedState, StatusSnapshot};
