//! Execution supervisor.
//!
//! One-shot handlers run on a worker task under a wall-clock timeout.
//! Long-running handlers become sessions: at most one per handler type,
//! with an older instance evicted before its replacement is registered.
//!
//! One-shot timeouts are soft. The reply path stops waiting but the worker
//! is detached rather than aborted, so a handler stuck in a blocking call
//! keeps running to completion in the background.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use sbdots_ipc::error_reply;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::connection::{Connection, ConnectionWriter, wait_for_disconnect};
use crate::error::{DaemonError, Result};
use crate::handler::{ActionContext, ActionHandler, CapturedOutput};
use crate::registry::ActionDescriptor;
use crate::state::{RunningSession, SessionId, SharedState};

/// Best-effort text of a caught panic payload
#[must_use]
pub fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

pub struct Supervisor {
    state: SharedState,
    action_timeout: Duration,
    eviction_timeout: Duration,
    shutdown: CancellationToken,
    start_gate: Mutex<()>,
    next_session_id: AtomicU64,
}

impl Supervisor {
    #[must_use]
    pub fn new(
        state: SharedState,
        action_timeout: Duration,
        eviction_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            state,
            action_timeout,
            eviction_timeout,
            shutdown,
            start_gate: Mutex::new(()),
            next_session_id: AtomicU64::new(1),
        }
    }

    /// Run a one-shot handler and produce its reply.
    ///
    /// # Errors
    ///
    /// `ExecutionTimeout` when the handler outlives the action timeout,
    /// `ExecutionFailed` when it returns an error or panics.
    pub async fn run_one_shot(
        &self,
        descriptor: &ActionDescriptor,
        handler: Arc<dyn ActionHandler>,
        writer: &ConnectionWriter,
    ) -> Result<String> {
        let action = descriptor.identifier().to_string();
        let result = {
            let _in_flight = self.state.begin_one_shot(&action);
            self.state.log_status(&format!("Action '{action}' started"));
            self.execute_one_shot(&action, handler, writer).await
        };
        self.state.log_status(&format!("Action '{action}' finished"));
        result
    }

    async fn execute_one_shot(
        &self,
        action: &str,
        handler: Arc<dyn ActionHandler>,
        writer: &ConnectionWriter,
    ) -> Result<String> {
        let output = CapturedOutput::default();
        let ctx = ActionContext::new(
            action,
            output.clone(),
            writer.clone(),
            self.shutdown.child_token(),
        );
        let started = Instant::now();
        let worker = tokio::spawn(async move {
            AssertUnwindSafe(handler.run(&ctx)).catch_unwind().await
        });

        let failed = |reason: String| DaemonError::ExecutionFailed {
            action: action.to_string(),
            reason,
        };

        match tokio::time::timeout(self.action_timeout, worker).await {
            Ok(Ok(Ok(Ok(())))) => {
                debug!("Action '{action}' completed in {:?}", started.elapsed());
                Ok(output.reply())
            }
            Ok(Ok(Ok(Err(e)))) => Err(failed(format!("{e:#}"))),
            Ok(Ok(Err(panic))) => Err(failed(panic_message(panic.as_ref()))),
            Ok(Err(join_err)) => Err(failed(join_err.to_string())),
            Err(_) => {
                // Dropping the handle detaches the worker.
                warn!("Action '{action}' exceeded its timeout; worker left running");
                Err(DaemonError::ExecutionTimeout {
                    action: action.to_string(),
                    secs: self.action_timeout.as_secs(),
                })
            }
        }
    }

    /// Start a long-running session on `connection`, evicting any live
    /// session of the same handler type first.
    ///
    /// Starts are serialized, so the session map never holds two entries for
    /// one type. The new entry is registered before the handler runs.
    ///
    /// # Errors
    ///
    /// `ShuttingDown` once the drain has begun; the connection is dropped.
    pub async fn start_session(
        &self,
        descriptor: &ActionDescriptor,
        handler: Arc<dyn ActionHandler>,
        connection: Connection,
    ) -> Result<SessionId> {
        let _gate = self.start_gate.lock().await;
        if self.shutdown.is_cancelled() {
            return Err(DaemonError::ShuttingDown);
        }
        let handler_type = descriptor.handler_type().to_string();
        let action = descriptor.identifier().to_string();

        if let Some(previous) = self.state.take_session(&handler_type) {
            warn!("'{action}' is already running ({}). Stopping it first...", previous.id);
            self.evict(previous).await;
        }

        let id = SessionId::from(self.next_session_id.fetch_add(1, Ordering::Relaxed));
        let (conn_id, reader, writer) = connection.into_parts();
        // Not tied to the shutdown token: the drain calls `stop()` first.
        let stop = CancellationToken::new();
        let ctx = ActionContext::new(
            &action,
            CapturedOutput::default(),
            writer.clone(),
            stop.clone(),
        );

        let (start_tx, start_rx) = oneshot::channel();
        let task = tokio::spawn(run_session(
            SessionTask {
                id,
                action: action.clone(),
                handler_type: handler_type.clone(),
                handler: Arc::clone(&handler),
                ctx,
                reader,
                writer: writer.clone(),
                stop: stop.clone(),
                state: self.state.clone(),
            },
            start_rx,
        ));

        let session = RunningSession {
            id,
            action: action.clone(),
            handler_type,
            handler,
            writer,
            stop,
            task,
            started_at: Instant::now(),
        };
        if let Some(displaced) = self.state.insert_session(session) {
            error!("Session {} displaced without eviction", displaced.id);
            displaced.signal_stop();
        }
        let _ = start_tx.send(());

        info!("[{conn_id}] Started long-running action '{action}' as {id}");
        self.state.log_status(&format!("Action '{action}' started"));
        Ok(id)
    }

    /// Stop a session and wait, bounded, for its task to finish.
    async fn evict(&self, session: RunningSession) {
        session.signal_stop();
        let RunningSession {
            id,
            action,
            writer,
            task,
            started_at,
            ..
        } = session;

        let finished = tokio::time::timeout(self.eviction_timeout, async {
            writer.close().await;
            task.await
        })
        .await;

        match finished {
            Ok(Ok(())) => debug!(
                "Evicted '{action}' ({id}) after {:?}",
                started_at.elapsed()
            ),
            Ok(Err(e)) => warn!("Session task for '{action}' ({id}) failed: {e}"),
            Err(_) => warn!(
                "'{action}' ({id}) did not stop within {:?}; abandoning it",
                self.eviction_timeout
            ),
        }
    }

    /// Stop every live session for shutdown and return their tasks so the
    /// caller can join them against its own deadline.
    ///
    /// Waits for any start in progress, so a session cannot be registered
    /// after the map has been drained.
    pub async fn stop_all(&self) -> Vec<(String, JoinHandle<()>)> {
        let _gate = self.start_gate.lock().await;
        let sessions = self.state.drain_sessions();
        let mut tasks = Vec::with_capacity(sessions.len());
        for session in sessions {
            info!("Stopping long-running action '{}'", session.action);
            session.signal_stop();
            if tokio::time::timeout(self.eviction_timeout, session.writer.close())
                .await
                .is_err()
            {
                warn!("Timed out closing connection for '{}'", session.action);
            }
            tasks.push((session.action, session.task));
        }
        tasks
    }
}

struct SessionTask {
    id: SessionId,
    action: String,
    handler_type: String,
    handler: Arc<dyn ActionHandler>,
    ctx: ActionContext,
    reader: tokio::net::unix::OwnedReadHalf,
    writer: ConnectionWriter,
    stop: CancellationToken,
    state: SharedState,
}

async fn run_session(task: SessionTask, start: oneshot::Receiver<()>) {
    let SessionTask {
        id,
        action,
        handler_type,
        handler,
        ctx,
        reader,
        writer,
        stop,
        state,
    } = task;

    if start.await.is_err() {
        debug!("{id} for '{action}' was never started");
        writer.close().await;
        state.connection_closed();
        return;
    }

    let watcher = tokio::spawn(async move {
        wait_for_disconnect(reader).await;
        stop.cancel();
    });

    let result = AssertUnwindSafe(handler.run(&ctx)).catch_unwind().await;
    let failure = match result {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(format!("{e:#}")),
        Err(panic) => Some(panic_message(panic.as_ref())),
    };

    if let Some(message) = failure {
        error!("Long-running action '{action}' crashed: {message}");
        writer
            .reply(&error_reply(format!("Action crashed: {message}")))
            .await;
    } else {
        debug!("'{action}' ({id}) exited");
    }

    watcher.abort();
    drop(state.remove_session(&handler_type, id));
    writer.close().await;
    state.log_status(&format!("Action '{action}' finished"));
    state.connection_closed();
    state.log_status("Client disconnected");
}
