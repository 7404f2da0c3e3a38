//! SBDots actions daemon entry point.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use sbdots_daemon::{ActionRegistry, Daemon, DaemonConfig, Directories, wait_for_shutdown_signal};
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const LOG_FILE: &str = "actionsd.log";

/// SBDots actions daemon - runs status bar actions over a Unix socket
#[derive(Parser, Debug)]
#[command(name = "sbdots-actionsd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Custom socket path (defaults to `$XDG_RUNTIME_DIR/sbdots_actions.sock`)
    #[arg(long, value_name = "PATH")]
    socket_path: Option<PathBuf>,

    /// Config file (defaults to `~/.config/sbdots/actionsd.json`)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Timeout for one-shot actions, in seconds
    #[arg(long, value_name = "SECS")]
    action_timeout: Option<u64>,
}

/// Set up logging to stderr and to `actionsd.log` in `log_dir`.
///
/// Falls back to stderr only when the log directory cannot be created. The
/// returned guard must be held until exit so buffered lines are flushed.
fn setup_logging(log_dir: &Path) -> Option<WorkerGuard> {
    let default_level = if cfg!(debug_assertions) {
        "debug"
    } else {
        "info"
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("sbdots={default_level}")));

    if let Err(e) = std::fs::create_dir_all(log_dir) {
        tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr).with_target(true))
            .with(filter)
            .init();
        warn!("Cannot create log directory {}: {e}", log_dir.display());
        return None;
    }

    let file_appender = tracing_appender::rolling::never(log_dir, LOG_FILE);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_line_number(true);

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .with_target(true);

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .with(filter)
        .init();

    Some(guard)
}

fn load_config(args: &Args) -> anyhow::Result<DaemonConfig> {
    let path = args
        .config
        .clone()
        .unwrap_or_else(|| Directories::new().config_file);
    let mut config = DaemonConfig::load(&path)
        .with_context(|| format!("Failed to load config from {}", path.display()))?;

    if let Some(socket_path) = &args.socket_path {
        config = config.with_socket_path(socket_path.clone());
    }
    if let Some(secs) = args.action_timeout {
        config = config.with_action_timeout(secs)?;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    let _log_guard = setup_logging(&config.log_dir);

    info!("Starting actions daemon...");

    let registry = ActionRegistry::builtin().context("Failed to register built-in actions")?;
    let socket_path = config.socket_path.clone();
    let daemon = Daemon::new(config, registry);

    let shutdown = daemon.shutdown_token();
    tokio::spawn(async move {
        match wait_for_shutdown_signal().await {
            Ok(name) => info!("Received {name}"),
            Err(e) => {
                error!("Failed to install signal handlers: {e}");
                return;
            }
        }
        shutdown.cancel();
    });

    daemon
        .run()
        .await
        .with_context(|| format!("Daemon failed on {}", socket_path.display()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_overrides() {
        let args = Args::try_parse_from([
            "sbdots-actionsd",
            "--socket-path",
            "/tmp/d.sock",
            "--action-timeout",
            "7",
        ])
        .unwrap();
        assert_eq!(args.socket_path, Some(PathBuf::from("/tmp/d.sock")));
        assert_eq!(args.action_timeout, Some(7));
    }

    #[test]
    fn test_setup_logging_writes_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let guard = setup_logging(dir.path());
        assert!(guard.is_some());

        info!("logging initialized");
        drop(guard);
        assert!(dir.path().join(LOG_FILE).exists());
    }
}
