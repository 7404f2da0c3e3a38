//! Daemon configuration.
//!
//! Loaded from `~/.config/sbdots/actionsd.json`. Every key is optional and a
//! missing file yields the defaults. Command-line flags are applied on top by
//! the binary.

mod dirs;
mod validation;

pub use dirs::Directories;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{DaemonError, Result};

/// On-disk config format
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigFile {
    pub socket_path: Option<PathBuf>,
    pub action_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub drain_timeout_secs: u64,
    pub eviction_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub log_dir: Option<PathBuf>,
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            socket_path: None,
            action_timeout_secs: 30,
            poll_interval_ms: 1000,
            drain_timeout_secs: 5,
            eviction_timeout_secs: 2,
            request_timeout_secs: 5,
            log_dir: None,
        }
    }
}

/// Resolved runtime configuration
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub socket_path: PathBuf,
    /// Hard limit for one-shot actions
    pub action_timeout: Duration,
    /// Accept loop wake-up interval
    pub poll_interval: Duration,
    /// Shared deadline for joining connection tasks at shutdown
    pub drain_timeout: Duration,
    /// How long to wait for an evicted session to finish
    pub eviction_timeout: Duration,
    /// How long a client may take to send its request
    pub request_timeout: Duration,
    pub log_dir: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        let file = ConfigFile::default();
        Self {
            socket_path: sbdots_ipc::socket_path(),
            action_timeout: Duration::from_secs(file.action_timeout_secs),
            poll_interval: Duration::from_millis(file.poll_interval_ms),
            drain_timeout: Duration::from_secs(file.drain_timeout_secs),
            eviction_timeout: Duration::from_secs(file.eviction_timeout_secs),
            request_timeout: Duration::from_secs(file.request_timeout_secs),
            log_dir: Directories::new().logs,
        }
    }
}

fn non_zero(value: u64, key: &str) -> Result<u64> {
    if value == 0 {
        return Err(DaemonError::Config(format!("{key} must be greater than zero")));
    }
    Ok(value)
}

impl DaemonConfig {
    /// Load config from `path`. A missing file gives the defaults.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the file cannot be read or parsed, or a duration
    /// is zero.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No config at {}, using defaults", path.display());
            return Self::from_file(ConfigFile::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| DaemonError::Config(format!("{}: {e}", path.display())))?;
        validation::warn_unknown_fields(&content, &path.display().to_string());
        let file: ConfigFile = serde_json::from_str(&content)
            .map_err(|e| DaemonError::Config(format!("{}: {e}", path.display())))?;
        Self::from_file(file)
    }

    /// Resolve a parsed config file.
    ///
    /// # Errors
    ///
    /// Returns `Config` if any duration is zero.
    pub fn from_file(file: ConfigFile) -> Result<Self> {
        Ok(Self {
            socket_path: file.socket_path.unwrap_or_else(sbdots_ipc::socket_path),
            action_timeout: Duration::from_secs(non_zero(
                file.action_timeout_secs,
                "actionTimeoutSecs",
            )?),
            poll_interval: Duration::from_millis(non_zero(file.poll_interval_ms, "pollIntervalMs")?),
            drain_timeout: Duration::from_secs(non_zero(
                file.drain_timeout_secs,
                "drainTimeoutSecs",
            )?),
            eviction_timeout: Duration::from_secs(non_zero(
                file.eviction_timeout_secs,
                "evictionTimeoutSecs",
            )?),
            request_timeout: Duration::from_secs(non_zero(
                file.request_timeout_secs,
                "requestTimeoutSecs",
            )?),
            log_dir: file.log_dir.unwrap_or_else(|| Directories::new().logs),
        })
    }

    #[must_use]
    pub fn with_socket_path(mut self, path: PathBuf) -> Self {
        self.socket_path = path;
        self
    }

    /// Override the one-shot timeout.
    ///
    /// # Errors
    ///
    /// Returns `Config` if `secs` is zero.
    pub fn with_action_timeout(mut self, secs: u64) -> Result<Self> {
        self.action_timeout = Duration::from_secs(non_zero(secs, "action timeout")?);
        Ok(self)
    }
}
