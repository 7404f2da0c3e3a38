//! Socket listener and shutdown coordination.
//!
//! The daemon moves through `Starting -> Listening -> Draining -> Stopped`.
//! Cancelling the shutdown token ends the accept loop; draining then stops
//! every session and joins connection tasks against one shared deadline.

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::DaemonConfig;
use crate::connection::{Connection, ConnectionId, HandlerContext, Outcome, handle_connection};
use crate::error::{DaemonError, Result};
use crate::registry::ActionRegistry;
use crate::state::SharedState;
use crate::supervisor::Supervisor;

/// Lifecycle phase of the daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Starting,
    Listening,
    Draining,
    Stopped,
}

/// Removes the socket file when dropped
struct SocketGuard {
    path: PathBuf,
}

impl Drop for SocketGuard {
    fn drop(&mut self) {
        if self.path.exists()
            && let Err(e) = std::fs::remove_file(&self.path)
        {
            warn!("Failed to remove socket file {:?}: {}", self.path, e);
        }
    }
}

/// Connection tasks still being tracked for the drain
#[derive(Default)]
struct ConnectionTracker {
    next_id: u64,
    tasks: HashMap<ConnectionId, JoinHandle<()>>,
}

impl ConnectionTracker {
    fn next_id(&mut self) -> ConnectionId {
        self.next_id += 1;
        ConnectionId::new(self.next_id)
    }

    /// Track a new task. Finished tasks are reaped first, so the map stays
    /// bounded even when accepts keep the poll tick from firing.
    fn track(&mut self, id: ConnectionId, task: JoinHandle<()>) {
        self.reap();
        self.tasks.insert(id, task);
    }

    fn reap(&mut self) {
        self.tasks.retain(|_, task| !task.is_finished());
    }

    async fn drain(&mut self, deadline: Instant) {
        for (id, task) in self.tasks.drain() {
            match tokio::time::timeout_at(deadline, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("[{id}] Connection task failed: {e}"),
                Err(_) => warn!("[{id}] Connection failed to terminate within timeout"),
            }
        }
    }
}

pub struct Daemon {
    config: DaemonConfig,
    registry: Arc<ActionRegistry>,
    state: SharedState,
    shutdown: CancellationToken,
    phase: watch::Sender<Phase>,
}

impl Daemon {
    #[must_use]
    pub fn new(config: DaemonConfig, registry: ActionRegistry) -> Self {
        let (phase, _) = watch::channel(Phase::Starting);
        Self {
            config,
            registry: Arc::new(registry),
            state: SharedState::new(),
            shutdown: CancellationToken::new(),
            phase,
        }
    }

    /// Token that starts a graceful shutdown when cancelled
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    #[must_use]
    pub fn state(&self) -> SharedState {
        self.state.clone()
    }

    #[must_use]
    pub fn subscribe_phase(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.config.socket_path
    }

    /// Bind the socket and serve until the shutdown token is cancelled.
    ///
    /// # Errors
    ///
    /// Fails at startup if another daemon answers on the socket or the socket
    /// cannot be bound. Once listening, errors are handled per connection.
    pub async fn run(self) -> Result<()> {
        let result = self.serve().await;
        self.phase.send_replace(Phase::Stopped);
        info!("Daemon stopped");
        result
    }

    async fn serve(&self) -> Result<()> {
        let path = self.config.socket_path.clone();
        let listener = bind_socket(&path).await?;
        let _socket_guard = SocketGuard { path: path.clone() };

        let supervisor = Arc::new(Supervisor::new(
            self.state.clone(),
            self.config.action_timeout,
            self.config.eviction_timeout,
            self.shutdown.clone(),
        ));
        let ctx = Arc::new(HandlerContext {
            registry: Arc::clone(&self.registry),
            supervisor: Arc::clone(&supervisor),
            request_timeout: self.config.request_timeout,
        });

        self.phase.send_replace(Phase::Listening);
        info!(
            actions = ?self.registry.identifiers(),
            "Daemon started. Listening on {}",
            path.display()
        );

        let mut tracker = ConnectionTracker::default();
        let mut poll = tokio::time::interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                () = self.shutdown.cancelled() => break,
                _ = poll.tick() => tracker.reap(),
                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        let id = tracker.next_id();
                        let task = self.spawn_connection(id, stream, &ctx);
                        tracker.track(id, task);
                    }
                    Err(e) => error!("Accept error: {e}"),
                },
            }
        }

        self.phase.send_replace(Phase::Draining);
        info!("Shutdown initiated. Waiting for active actions to complete...");
        drop(listener);

        let deadline = Instant::now() + self.config.drain_timeout;
        let sessions = supervisor.stop_all().await;
        tracker.drain(deadline).await;
        for (action, task) in sessions {
            if tokio::time::timeout_at(deadline, task).await.is_err() {
                warn!("Action '{action}' failed to stop within timeout");
            }
        }

        info!("All actions finished. Daemon shut down.");
        Ok(())
    }

    fn spawn_connection(
        &self,
        id: ConnectionId,
        stream: UnixStream,
        ctx: &Arc<HandlerContext>,
    ) -> JoinHandle<()> {
        let connection = Connection::new(id, stream, self.shutdown.clone());
        let ctx = Arc::clone(ctx);
        let state = self.state.clone();

        state.connection_opened();
        state.log_status("Client connected");

        tokio::spawn(async move {
            // A session that took over the connection reports the disconnect.
            if handle_connection(connection, &ctx).await == Outcome::Closed {
                state.connection_closed();
                state.log_status("Client disconnected");
            }
        })
    }
}

/// Bind `path`, refusing to replace a socket a live daemon still answers on.
async fn bind_socket(path: &Path) -> Result<UnixListener> {
    if path.exists() {
        if UnixStream::connect(path).await.is_ok() {
            return Err(DaemonError::Io(std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                format!("Another daemon is already running on {}", path.display()),
            )));
        }
        info!("Removing stale socket at {}", path.display());
        std::fs::remove_file(path)?;
    }

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }

    let listener = UnixListener::bind(path)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    debug!("Bound {} with mode 0600", path.display());
    Ok(listener)
}

/// Wait for SIGTERM or SIGINT.
///
/// # Errors
///
/// Returns an error if the signal handlers cannot be installed.
pub async fn wait_for_shutdown_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let name = tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    };
    Ok(name)
}
