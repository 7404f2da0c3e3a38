//! End-to-end tests driving a real daemon over a temp-dir socket.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use futures_util::{FutureExt, StreamExt};
use sbdots_daemon::{
    ActionContext, ActionHandler, ActionRegistry, Daemon, DaemonConfig, DaemonError, Phase,
    RegistryBuilder, SharedState,
};
use sbdots_ipc::{ActionRequest, ReplyStream, send_request};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(10);

/// Prints its arguments joined by spaces
struct Echo(Vec<String>);

impl ActionHandler for Echo {
    fn run<'a>(&'a self, ctx: &'a ActionContext) -> BoxFuture<'a, anyhow::Result<()>> {
        async move {
            if !self.0.is_empty() {
                ctx.print(self.0.join(" "));
            }
            Ok(())
        }
        .boxed()
    }
}

/// Sleeps for the given number of seconds, then raises `finished`
struct Sleeper {
    secs: u64,
    finished: Arc<AtomicBool>,
}

impl ActionHandler for Sleeper {
    fn run<'a>(&'a self, ctx: &'a ActionContext) -> BoxFuture<'a, anyhow::Result<()>> {
        async move {
            tokio::time::sleep(Duration::from_secs(self.secs)).await;
            self.finished.store(true, Ordering::SeqCst);
            ctx.print("slept");
            Ok(())
        }
        .boxed()
    }
}

struct Failing;

impl ActionHandler for Failing {
    fn run<'a>(&'a self, _ctx: &'a ActionContext) -> BoxFuture<'a, anyhow::Result<()>> {
        async { anyhow::bail!("boom") }.boxed()
    }
}

/// Emits one frame, then waits to be stopped
struct Streamer {
    label: usize,
    stops: Arc<AtomicUsize>,
}

impl ActionHandler for Streamer {
    fn run<'a>(&'a self, ctx: &'a ActionContext) -> BoxFuture<'a, anyhow::Result<()>> {
        async move {
            ctx.emit(&serde_json::json!({ "text": format!("tick-{}", self.label) }))
                .await?;
            ctx.stopped().await;
            Ok(())
        }
        .boxed()
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

/// Writes large frames until the connection goes away, counting live runs
struct Flood {
    live: Arc<AtomicUsize>,
}

impl ActionHandler for Flood {
    fn run<'a>(&'a self, ctx: &'a ActionContext) -> BoxFuture<'a, anyhow::Result<()>> {
        async move {
            self.live.fetch_add(1, Ordering::SeqCst);
            let payload = "x".repeat(32 * 1024);
            let result = loop {
                match ctx.emit(&serde_json::json!({ "text": payload })).await {
                    Ok(()) => {}
                    Err(DaemonError::ConnectionLost) => break Ok(()),
                    Err(e) => break Err(e.into()),
                }
            };
            self.live.fetch_sub(1, Ordering::SeqCst);
            result
        }
        .boxed()
    }
}

struct Crashing;

impl ActionHandler for Crashing {
    fn run<'a>(&'a self, _ctx: &'a ActionContext) -> BoxFuture<'a, anyhow::Result<()>> {
        async { anyhow::bail!("exploded") }.boxed()
    }
}

#[derive(Default, Clone)]
struct Probes {
    finished: Arc<AtomicBool>,
    stops: Arc<AtomicUsize>,
    started: Arc<AtomicUsize>,
    live: Arc<AtomicUsize>,
}

fn test_registry(probes: &Probes) -> ActionRegistry {
    let mut builder = RegistryBuilder::new();
    builder
        .one_shot("echo", |args| {
            Ok(Arc::new(Echo(args.to_vec())) as Arc<dyn ActionHandler>)
        })
        .unwrap();
    builder
        .one_shot("fail", |_| Ok(Arc::new(Failing) as Arc<dyn ActionHandler>))
        .unwrap();
    builder
        .one_shot("broken_init", |_| anyhow::bail!("bad args"))
        .unwrap();

    let finished = Arc::clone(&probes.finished);
    builder
        .one_shot("sleep", move |args| {
            let secs = args.first().map_or(Ok(1), |s| s.parse())?;
            Ok(Arc::new(Sleeper {
                secs,
                finished: Arc::clone(&finished),
            }) as Arc<dyn ActionHandler>)
        })
        .unwrap();

    let stops = Arc::clone(&probes.stops);
    let started = Arc::clone(&probes.started);
    builder
        .long_running("stream", move |_| {
            let label = started.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Arc::new(Streamer {
                label,
                stops: Arc::clone(&stops),
            }) as Arc<dyn ActionHandler>)
        })
        .unwrap();
    builder
        .long_running("crash", |_| Ok(Arc::new(Crashing) as Arc<dyn ActionHandler>))
        .unwrap();

    let live = Arc::clone(&probes.live);
    builder
        .long_running("flood", move |_| {
            Ok(Arc::new(Flood {
                live: Arc::clone(&live),
            }) as Arc<dyn ActionHandler>)
        })
        .unwrap();
    builder.build()
}

struct TestDaemon {
    socket: PathBuf,
    shutdown: CancellationToken,
    state: SharedState,
    phase: watch::Receiver<Phase>,
    task: JoinHandle<sbdots_daemon::Result<()>>,
    _dir: tempfile::TempDir,
}

fn test_config(dir: &Path, action_timeout: Duration) -> DaemonConfig {
    DaemonConfig {
        socket_path: dir.join("actions.sock"),
        action_timeout,
        poll_interval: Duration::from_millis(50),
        drain_timeout: Duration::from_secs(2),
        eviction_timeout: Duration::from_secs(1),
        request_timeout: Duration::from_secs(1),
        log_dir: dir.join("logs"),
    }
}

async fn start_daemon(probes: &Probes, action_timeout: Duration) -> TestDaemon {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), action_timeout);
    let socket = config.socket_path.clone();

    let daemon = Daemon::new(config, test_registry(probes));
    let shutdown = daemon.shutdown_token();
    let state = daemon.state();
    let mut phase = daemon.subscribe_phase();
    let task = tokio::spawn(daemon.run());

    timeout(WAIT, phase.wait_for(|p| *p == Phase::Listening))
        .await
        .expect("daemon did not start listening")
        .unwrap();

    TestDaemon {
        socket,
        shutdown,
        state,
        phase,
        task,
        _dir: dir,
    }
}

/// Send a raw request and read until the daemon closes the connection.
async fn raw_request(socket: &Path, payload: &str) -> String {
    let mut stream = UnixStream::connect(socket).await.unwrap();
    stream.write_all(payload.as_bytes()).await.unwrap();
    let mut out = String::new();
    timeout(WAIT, stream.read_to_string(&mut out))
        .await
        .expect("reply timed out")
        .unwrap();
    out
}

async fn open_stream(socket: &Path, action: &str) -> ReplyStream {
    send_request(socket, &ActionRequest::new(action, Vec::new()))
        .await
        .unwrap()
}

async fn next_line(stream: &mut ReplyStream) -> Option<String> {
    timeout(WAIT, stream.next())
        .await
        .expect("frame timed out")
        .map(Result::unwrap)
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached");
}

#[tokio::test]
async fn test_empty_request_keeps_daemon_listening() {
    let daemon = start_daemon(&Probes::default(), Duration::from_secs(30)).await;

    assert_eq!(raw_request(&daemon.socket, "   \t ").await, "ERROR: Empty request");

    let mut stream = UnixStream::connect(&daemon.socket).await.unwrap();
    stream.shutdown().await.unwrap();
    let mut out = String::new();
    timeout(WAIT, stream.read_to_string(&mut out))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(out, "ERROR: Empty request");

    assert_eq!(raw_request(&daemon.socket, "echo still here").await, "still here");
}

#[tokio::test]
async fn test_unknown_action_names_identifier() {
    let daemon = start_daemon(&Probes::default(), Duration::from_secs(30)).await;

    let reply = raw_request(&daemon.socket, "no_such_action arg").await;
    assert!(reply.starts_with("ERROR: "), "unexpected reply: {reply}");
    assert!(reply.contains("no_such_action"));
}

#[tokio::test]
async fn test_factory_failure_reply() {
    let daemon = start_daemon(&Probes::default(), Duration::from_secs(30)).await;

    assert_eq!(
        raw_request(&daemon.socket, "broken_init").await,
        "ERROR: Failed to initialize 'BrokenInit': bad args"
    );
}

#[tokio::test]
async fn test_one_shot_output_and_ok() {
    let daemon = start_daemon(&Probes::default(), Duration::from_secs(30)).await;

    assert_eq!(raw_request(&daemon.socket, "echo hello  world").await, "hello world");
    assert_eq!(raw_request(&daemon.socket, "echo").await, "OK");
}

#[tokio::test]
async fn test_one_shot_failure_reply() {
    let daemon = start_daemon(&Probes::default(), Duration::from_secs(30)).await;

    assert_eq!(
        raw_request(&daemon.socket, "fail").await,
        "ERROR: Error during 'fail' execution: boom"
    );
    assert!(daemon.state.snapshot().running.is_empty());
}

#[tokio::test]
async fn test_one_shot_timeout_is_soft() {
    let probes = Probes::default();
    let daemon = start_daemon(&probes, Duration::from_secs(1)).await;

    let started = Instant::now();
    let reply = raw_request(&daemon.socket, "sleep 3").await;
    let elapsed = started.elapsed();

    assert_eq!(reply, "ERROR: Action 'sleep' timed out after 1s");
    assert!(elapsed < Duration::from_millis(2500), "took {elapsed:?}");
    assert!(!probes.finished.load(Ordering::SeqCst));
    assert!(daemon.state.snapshot().running.is_empty());

    // The abandoned worker keeps running to completion.
    let finished = Arc::clone(&probes.finished);
    wait_until(move || finished.load(Ordering::SeqCst)).await;
}

#[tokio::test]
async fn test_concurrent_one_shots_get_their_own_replies() {
    let daemon = start_daemon(&Probes::default(), Duration::from_secs(30)).await;

    let requests: Vec<_> = (0..20)
        .map(|i| {
            let socket = daemon.socket.clone();
            tokio::spawn(async move { (i, raw_request(&socket, &format!("echo reply-{i}")).await) })
        })
        .collect();

    for request in requests {
        let (i, reply) = request.await.unwrap();
        assert_eq!(reply, format!("reply-{i}"));
    }
}

#[tokio::test]
async fn test_second_start_evicts_first_session() {
    let probes = Probes::default();
    let daemon = start_daemon(&probes, Duration::from_secs(30)).await;

    let mut first = open_stream(&daemon.socket, "stream").await;
    assert_eq!(next_line(&mut first).await.as_deref(), Some(r#"{"text":"tick-1"}"#));

    let mut second = open_stream(&daemon.socket, "stream").await;
    assert_eq!(next_line(&mut second).await.as_deref(), Some(r#"{"text":"tick-2"}"#));

    assert_eq!(next_line(&mut first).await, None, "first session should be closed");
    assert_eq!(probes.stops.load(Ordering::SeqCst), 1);
    assert_eq!(daemon.state.session_count(), 1);
    assert_eq!(daemon.state.snapshot().sessions, vec!["stream"]);
}

#[tokio::test]
async fn test_client_disconnect_ends_session() {
    let probes = Probes::default();
    let daemon = start_daemon(&probes, Duration::from_secs(30)).await;

    let mut stream = open_stream(&daemon.socket, "stream").await;
    assert!(next_line(&mut stream).await.is_some());
    assert_eq!(daemon.state.session_count(), 1);
    drop(stream);

    let state = daemon.state.clone();
    wait_until(move || state.session_count() == 0 && state.active_connections() == 0).await;
}

#[tokio::test]
async fn test_crashed_session_reports_error() {
    let daemon = start_daemon(&Probes::default(), Duration::from_secs(30)).await;

    let mut stream = open_stream(&daemon.socket, "crash").await;
    assert_eq!(
        next_line(&mut stream).await.as_deref(),
        Some("ERROR: Action crashed: exploded")
    );
    assert_eq!(next_line(&mut stream).await, None);

    let state = daemon.state.clone();
    wait_until(move || state.session_count() == 0).await;
}

#[tokio::test]
async fn test_shutdown_stops_sessions_and_removes_socket() {
    let probes = Probes::default();
    let mut daemon = start_daemon(&probes, Duration::from_secs(30)).await;

    let mut stream = open_stream(&daemon.socket, "stream").await;
    assert!(next_line(&mut stream).await.is_some());

    let mut in_flight = UnixStream::connect(&daemon.socket).await.unwrap();
    in_flight.write_all(b"sleep 1").await.unwrap();
    let state = daemon.state.clone();
    wait_until(move || !state.snapshot().running.is_empty()).await;

    let started = Instant::now();
    daemon.shutdown.cancel();
    let result = timeout(WAIT, &mut daemon.task).await.unwrap().unwrap();
    assert!(result.is_ok());
    assert!(started.elapsed() < Duration::from_secs(4));

    assert_eq!(probes.stops.load(Ordering::SeqCst), 1);
    assert_eq!(daemon.state.session_count(), 0);
    assert!(!daemon.socket.exists());
    assert_eq!(*daemon.phase.borrow_and_update(), Phase::Stopped);
    assert_eq!(next_line(&mut stream).await, None);
}

#[tokio::test]
async fn test_drain_abandons_slow_one_shot_at_deadline() {
    let probes = Probes::default();
    let mut daemon = start_daemon(&probes, Duration::from_secs(30)).await;

    let mut in_flight = UnixStream::connect(&daemon.socket).await.unwrap();
    in_flight.write_all(b"sleep 10").await.unwrap();
    let state = daemon.state.clone();
    wait_until(move || !state.snapshot().running.is_empty()).await;

    let started = Instant::now();
    daemon.shutdown.cancel();
    let result = timeout(WAIT, &mut daemon.task).await.unwrap().unwrap();
    let elapsed = started.elapsed();

    assert!(result.is_ok());
    assert!(elapsed >= Duration::from_millis(1900), "drained after {elapsed:?}");
    assert!(elapsed < Duration::from_millis(3500), "drained after {elapsed:?}");
    assert!(!probes.finished.load(Ordering::SeqCst));
    assert!(!daemon.socket.exists());
}

#[tokio::test]
async fn test_eviction_closes_stalled_client() {
    let probes = Probes::default();
    let daemon = start_daemon(&probes, Duration::from_secs(30)).await;

    // Never read from the first client, so its session blocks mid-write.
    let _stalled = open_stream(&daemon.socket, "flood").await;
    let live = Arc::clone(&probes.live);
    wait_until(move || live.load(Ordering::SeqCst) == 1).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut second = open_stream(&daemon.socket, "flood").await;
    assert!(next_line(&mut second).await.is_some());

    let live = Arc::clone(&probes.live);
    wait_until(move || live.load(Ordering::SeqCst) == 1).await;
    assert_eq!(daemon.state.session_count(), 1);
}

#[tokio::test]
async fn test_refuses_to_replace_live_daemon() {
    let probes = Probes::default();
    let first = start_daemon(&probes, Duration::from_secs(30)).await;

    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path(), Duration::from_secs(30));
    config.socket_path = first.socket.clone();
    let err = Daemon::new(config, test_registry(&probes))
        .run()
        .await
        .unwrap_err();

    assert!(matches!(&err, DaemonError::Io(e) if e.kind() == std::io::ErrorKind::AddrInUse));
    assert!(first.socket.exists());
    assert_eq!(raw_request(&first.socket, "echo alive").await, "alive");
}

#[tokio::test]
async fn test_socket_is_private_and_stale_file_replaced() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), Duration::from_secs(30));
    drop(std::os::unix::net::UnixListener::bind(&config.socket_path).unwrap());
    assert!(config.socket_path.exists());

    let socket = config.socket_path.clone();
    let daemon = Daemon::new(config, test_registry(&Probes::default()));
    let shutdown = daemon.shutdown_token();
    let mut phase = daemon.subscribe_phase();
    let task = tokio::spawn(daemon.run());
    timeout(WAIT, phase.wait_for(|p| *p == Phase::Listening))
        .await
        .unwrap()
        .unwrap();

    let mode = std::fs::metadata(&socket).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600);

    shutdown.cancel();
    timeout(WAIT, task).await.unwrap().unwrap().unwrap();
    assert!(!socket.exists());
}
