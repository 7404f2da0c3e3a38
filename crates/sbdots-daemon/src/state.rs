//! Shared daemon state.
//!
//! Active connection count, in-flight one-shot actions and running sessions
//! live behind a single mutex. The lock is never held across an await or
//! any I/O; callers take a [`StatusSnapshot`] and log after releasing it.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::connection::ConnectionWriter;
use crate::handler::ActionHandler;
use crate::supervisor::panic_message;

/// Identifies one long-running session instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl From<u64> for SessionId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// A live long-running handler and the connection it streams to
pub struct RunningSession {
    pub id: SessionId,
    pub action: String,
    pub handler_type: String,
    pub handler: Arc<dyn ActionHandler>,
    pub writer: ConnectionWriter,
    pub stop: CancellationToken,
    pub task: JoinHandle<()>,
    pub started_at: Instant,
}

impl RunningSession {
    /// Ask the handler to stop: call its teardown, then cancel its token.
    ///
    /// A panicking teardown is logged and otherwise ignored.
    pub fn signal_stop(&self) {
        let handler = Arc::clone(&self.handler);
        if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(move || handler.stop())) {
            warn!(
                "Error stopping '{}': {}",
                self.action,
                panic_message(panic.as_ref())
            );
        }
        self.stop.cancel();
    }
}

impl fmt::Debug for RunningSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunningSession")
            .field("id", &self.id)
            .field("action", &self.action)
            .field("handler_type", &self.handler_type)
            .field("started_at", &self.started_at)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
struct DaemonState {
    active_connections: usize,
    in_flight: BTreeMap<String, usize>,
    sessions: HashMap<String, RunningSession>,
}

/// Point-in-time view of the daemon state, for logging
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    pub connections: usize,
    /// In-flight one-shot identifiers, repeated per concurrent run
    pub running: Vec<String>,
    /// Identifiers of running sessions, sorted
    pub sessions: Vec<String>,
}

/// Cloneable handle to the daemon state
#[derive(Clone, Default)]
pub struct SharedState(Arc<Mutex<DaemonState>>);

impl SharedState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, DaemonState> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the new connection count
    pub fn connection_opened(&self) -> usize {
        let mut state = self.lock();
        state.active_connections += 1;
        state.active_connections
    }

    /// Returns the new connection count
    pub fn connection_closed(&self) -> usize {
        let mut state = self.lock();
        state.active_connections = state.active_connections.saturating_sub(1);
        state.active_connections
    }

    /// Record a one-shot run. The record is removed when the guard drops.
    pub fn begin_one_shot(&self, action: &str) -> InFlightGuard {
        *self.lock().in_flight.entry(action.to_string()).or_default() += 1;
        InFlightGuard {
            state: self.clone(),
            action: action.to_string(),
        }
    }

    fn end_one_shot(&self, action: &str) {
        let mut state = self.lock();
        if let Some(count) = state.in_flight.get_mut(action) {
            *count -= 1;
            if *count == 0 {
                state.in_flight.remove(action);
            }
        }
    }

    /// Remove and return the session registered for `handler_type`.
    pub fn take_session(&self, handler_type: &str) -> Option<RunningSession> {
        self.lock().sessions.remove(handler_type)
    }

    /// Register a session, returning any session it displaced.
    pub fn insert_session(&self, session: RunningSession) -> Option<RunningSession> {
        self.lock()
            .sessions
            .insert(session.handler_type.clone(), session)
    }

    /// Remove the entry for `handler_type` only if it still belongs to `id`.
    ///
    /// A session that was evicted and replaced must not remove its successor.
    pub fn remove_session(&self, handler_type: &str, id: SessionId) -> Option<RunningSession> {
        let mut state = self.lock();
        if state.sessions.get(handler_type).is_some_and(|s| s.id == id) {
            state.sessions.remove(handler_type)
        } else {
            None
        }
    }

    /// Remove every session, for shutdown.
    pub fn drain_sessions(&self) -> Vec<RunningSession> {
        self.lock().sessions.drain().map(|(_, s)| s).collect()
    }

    #[must_use]
    pub fn session_id(&self, handler_type: &str) -> Option<SessionId> {
        self.lock().sessions.get(handler_type).map(|s| s.id)
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.lock().active_connections
    }

    #[must_use]
    pub fn snapshot(&self) -> StatusSnapshot {
        let state = self.lock();
        let running = state
            .in_flight
            .iter()
            .flat_map(|(action, count)| std::iter::repeat_n(action.clone(), *count))
            .collect();
        let mut sessions: Vec<String> = state.sessions.values().map(|s| s.action.clone()).collect();
        sessions.sort_unstable();
        StatusSnapshot {
            connections: state.active_connections,
            running,
            sessions,
        }
    }

    /// Log a status line for `event`. The lock is released before logging.
    pub fn log_status(&self, event: &str) {
        let snapshot = self.snapshot();
        info!(
            clients = snapshot.connections,
            running = ?snapshot.running,
            sessions = ?snapshot.sessions,
            "Event: {event}"
        );
    }
}

impl fmt::Debug for SharedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SharedState").field(&self.snapshot()).finish()
    }
}

/// Removes a one-shot record on drop, whatever way the run ended
#[must_use]
pub struct InFlightGuard {
    state: SharedState,
    action: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.state.end_one_shot(&self.action);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Connection, ConnectionId};
    use crate::handler::ActionContext;
    use futures_util::FutureExt;
    use futures_util::future::BoxFuture;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::UnixStream;

    #[derive(Default)]
    struct CountingStop(AtomicUsize);

    impl ActionHandler for CountingStop {
        fn run<'a>(&'a self, _ctx: &'a ActionContext) -> BoxFuture<'a, anyhow::Result<()>> {
            async { Ok(()) }.boxed()
        }

        fn stop(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct PanickingStop;

    impl ActionHandler for PanickingStop {
        fn run<'a>(&'a self, _ctx: &'a ActionContext) -> BoxFuture<'a, anyhow::Result<()>> {
            async { Ok(()) }.boxed()
        }

        fn stop(&self) {
            panic!("stop failed");
        }
    }

    fn session(id: u64, handler: Arc<dyn ActionHandler>) -> (RunningSession, UnixStream) {
        let (server, client) = UnixStream::pair().unwrap();
        let conn = Connection::new(ConnectionId::new(id), server, CancellationToken::new());
        let (_, _reader, writer) = conn.into_parts();
        let session = RunningSession {
            id: SessionId::from(id),
            action: "on_mpd_change".to_string(),
            handler_type: "OnMpdChange".to_string(),
            handler,
            writer,
            stop: CancellationToken::new(),
            task: tokio::spawn(async {}),
            started_at: Instant::now(),
        };
        (session, client)
    }

    #[test]
    fn test_session_id_display() {
        assert_eq!(SessionId::from(3).to_string(), "session-3");
    }

    #[test]
    fn test_connection_counting() {
        let state = SharedState::new();
        assert_eq!(state.connection_opened(), 1);
        assert_eq!(state.connection_opened(), 2);
        assert_eq!(state.connection_closed(), 1);
        assert_eq!(state.connection_closed(), 0);
        assert_eq!(state.connection_closed(), 0);
    }

    #[test]
    fn test_in_flight_guard_tracks_concurrent_runs() {
        let state = SharedState::new();
        let first = state.begin_one_shot("ping");
        let second = state.begin_one_shot("ping");
        let other = state.begin_one_shot("get_hypridle_status");

        assert_eq!(
            state.snapshot().running,
            vec!["get_hypridle_status", "ping", "ping"]
        );

        drop(first);
        assert_eq!(state.snapshot().running, vec!["get_hypridle_status", "ping"]);

        drop(second);
        drop(other);
        assert!(state.snapshot().running.is_empty());
    }

    #[tokio::test]
    async fn test_remove_session_only_removes_own_entry() {
        let state = SharedState::new();
        let (old, _c1) = session(1, Arc::new(CountingStop::default()));
        let (new, _c2) = session(2, Arc::new(CountingStop::default()));

        assert!(state.insert_session(old).is_none());
        let evicted = state.take_session("OnMpdChange").unwrap();
        assert_eq!(evicted.id, SessionId::from(1));
        assert!(state.insert_session(new).is_none());

        assert!(state.remove_session("OnMpdChange", SessionId::from(1)).is_none());
        assert_eq!(state.session_id("OnMpdChange"), Some(SessionId::from(2)));

        assert!(state.remove_session("OnMpdChange", SessionId::from(2)).is_some());
        assert_eq!(state.session_count(), 0);
    }

    #[tokio::test]
    async fn test_drain_sessions_and_snapshot() {
        let state = SharedState::new();
        let (s, _c) = session(1, Arc::new(CountingStop::default()));
        state.insert_session(s);
        state.connection_opened();

        let snapshot = state.snapshot();
        assert_eq!(snapshot.connections, 1);
        assert_eq!(snapshot.sessions, vec!["on_mpd_change"]);

        let drained = state.drain_sessions();
        assert_eq!(drained.len(), 1);
        assert_eq!(state.session_count(), 0);
    }

    #[tokio::test]
    async fn test_signal_stop_calls_teardown_and_cancels() {
        let handler = Arc::new(CountingStop::default());
        let (s, _c) = session(1, handler.clone());

        s.signal_stop();
        assert_eq!(handler.0.load(Ordering::SeqCst), 1);
        assert!(s.stop.is_cancelled());
    }

    #[tokio::test]
    async fn test_signal_stop_survives_panicking_teardown() {
        let (s, _c) = session(1, Arc::new(PanickingStop));
        s.signal_stop();
        assert!(s.stop.is_cancelled());
    }

    #[test]
    fn test_snapshot_serializes() {
        let state = SharedState::new();
        let _guard = state.begin_one_shot("ping");
        let json = serde_json::to_value(state.snapshot()).unwrap();
        assert_eq!(json["running"], serde_json::json!(["ping"]));
        assert_eq!(json["connections"], 0);
    }
}
