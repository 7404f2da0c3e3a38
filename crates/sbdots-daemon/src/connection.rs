//! Per-client connection handling.
//!
//! Each accepted stream gets its own task running [`handle_connection`]:
//! read one request, resolve it, construct the handler and dispatch it by
//! execution mode. One-shot connections are closed here once the reply is
//! written. Long-running connections are handed to the supervisor and
//! outlive this task.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures_util::SinkExt;
use sbdots_ipc::{ActionCodec, ActionRequest, Frame, MAX_REQUEST_SIZE};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::{DaemonError, Result};
use crate::registry::ActionRegistry;
use crate::supervisor::Supervisor;

/// Identifier assigned to each accepted connection, in accept order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    #[must_use]
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

type Sink = FramedWrite<OwnedWriteHalf, ActionCodec>;

/// Shared write side of a client connection.
///
/// Clones share the same sink. Closing takes the sink out, so the connection
/// is shut down at most once no matter how many owners race to close it.
/// A write blocked on a client that stopped reading is abandoned as soon as
/// the connection is closed.
#[derive(Clone)]
pub struct ConnectionWriter {
    id: ConnectionId,
    sink: Arc<Mutex<Option<Sink>>>,
    closed: CancellationToken,
    shutdown: CancellationToken,
}

impl ConnectionWriter {
    fn new(id: ConnectionId, half: OwnedWriteHalf, shutdown: CancellationToken) -> Self {
        Self {
            id,
            sink: Arc::new(Mutex::new(Some(FramedWrite::new(half, ActionCodec::new())))),
            closed: CancellationToken::new(),
            shutdown,
        }
    }

    /// Write a frame to the client.
    ///
    /// Frames are dropped silently once daemon shutdown has begun.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionLost` if the connection was closed, including while
    /// this write was pending, or the peer is gone.
    pub async fn send(&self, frame: Frame) -> Result<()> {
        if self.shutdown.is_cancelled() {
            debug!("[{}] Shutting down, dropping frame", self.id);
            return Ok(());
        }
        let mut guard = tokio::select! {
            biased;
            () = self.closed.cancelled() => return Err(DaemonError::ConnectionLost),
            guard = self.sink.lock() => guard,
        };
        let Some(sink) = guard.as_mut() else {
            return Err(DaemonError::ConnectionLost);
        };
        tokio::select! {
            biased;
            () = self.closed.cancelled() => {
                debug!("[{}] Connection closed during write", self.id);
                Err(DaemonError::ConnectionLost)
            }
            sent = sink.send(frame) => sent.map_err(DaemonError::from),
        }
    }

    /// Best-effort text reply. Failures are logged, never propagated.
    pub async fn reply(&self, text: &str) {
        match self.send(Frame::text(text)).await {
            Ok(()) => {}
            Err(DaemonError::ConnectionLost) => {
                debug!("[{}] Client disconnected before response", self.id);
            }
            Err(e) => warn!("[{}] Failed to send response: {e}", self.id),
        }
    }

    /// Shut down the write side. Returns `false` if it was already closed.
    ///
    /// Any pending write is interrupted first. Every completed send has
    /// already been flushed, so only the bytes of an interrupted frame are
    /// discarded.
    pub async fn close(&self) -> bool {
        self.closed.cancel();
        let sink = self.sink.lock().await.take();
        let Some(sink) = sink else {
            return false;
        };
        let mut half = sink.into_inner();
        if let Err(e) = half.shutdown().await {
            debug!("[{}] Error while closing connection: {e}", self.id);
        }
        true
    }

    pub async fn is_closed(&self) -> bool {
        self.sink.lock().await.is_none()
    }
}

impl fmt::Debug for ConnectionWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionWriter")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// An accepted client connection, split into its two halves
pub struct Connection {
    id: ConnectionId,
    reader: OwnedReadHalf,
    writer: ConnectionWriter,
}

impl Connection {
    #[must_use]
    pub fn new(id: ConnectionId, stream: UnixStream, shutdown: CancellationToken) -> Self {
        let (reader, half) = stream.into_split();
        Self {
            id,
            reader,
            writer: ConnectionWriter::new(id, half, shutdown),
        }
    }

    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    #[must_use]
    pub fn writer(&self) -> &ConnectionWriter {
        &self.writer
    }

    /// Read the single request this connection carries.
    ///
    /// At most [`MAX_REQUEST_SIZE`] bytes are read in one receive. A client
    /// that sends nothing within `limit` is treated as an empty request.
    ///
    /// # Errors
    ///
    /// `MalformedRequest` for empty input, `ConnectionLost` if the peer
    /// reset the connection.
    pub async fn read_request(&mut self, limit: Duration) -> Result<ActionRequest> {
        let mut buf = vec![0u8; MAX_REQUEST_SIZE];
        let n = match tokio::time::timeout(limit, self.reader.read(&mut buf)).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) if is_disconnect(&e) => return Err(DaemonError::ConnectionLost),
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                debug!("[{}] No request within {limit:?}", self.id);
                0
            }
        };
        Ok(ActionRequest::parse(&buf[..n])?)
    }

    #[must_use]
    pub fn into_parts(self) -> (ConnectionId, OwnedReadHalf, ConnectionWriter) {
        (self.id, self.reader, self.writer)
    }
}

fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
    )
}

/// Resolves when the peer closes its end or the read side errors.
///
/// Anything the client sends after its request is discarded.
pub async fn wait_for_disconnect(mut reader: OwnedReadHalf) {
    let mut buf = [0u8; 256];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}

/// Everything a connection task needs
pub struct HandlerContext {
    pub registry: Arc<ActionRegistry>,
    pub supervisor: Arc<Supervisor>,
    pub request_timeout: Duration,
}

enum Disposition {
    Reply(String),
    HandedOff,
}

/// What became of a connection once its handler task returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Replied and closed
    Closed,
    /// Owned by a long-running session, which closes it
    HandedOff,
}

/// Serve one client from request to close, or until a session takes it over.
pub async fn handle_connection(connection: Connection, ctx: &HandlerContext) -> Outcome {
    let id = connection.id();
    let writer = connection.writer().clone();

    match dispatch(connection, ctx).await {
        Ok(Disposition::HandedOff) => return Outcome::HandedOff,
        Ok(Disposition::Reply(text)) => writer.reply(&text).await,
        Err(e) if e.is_reportable() => {
            match &e {
                DaemonError::MalformedRequest(_) => warn!("[{id}] {e}"),
                _ => error!("[{id}] {e}"),
            }
            writer.reply(&e.to_reply()).await;
        }
        Err(_) => debug!("[{id}] Client disconnected unexpectedly"),
    }

    writer.close().await;
    Outcome::Closed
}

async fn dispatch(mut connection: Connection, ctx: &HandlerContext) -> Result<Disposition> {
    let request = connection.read_request(ctx.request_timeout).await?;
    debug!("[{}] Request: {}", connection.id(), request.to_wire());

    let descriptor = ctx.registry.resolve(&request.action)?;
    let handler = descriptor.instantiate(&request.args)?;

    if descriptor.is_long_running() {
        ctx.supervisor
            .start_session(descriptor, handler, connection)
            .await?;
        Ok(Disposition::HandedOff)
    } else {
        let reply = ctx
            .supervisor
            .run_one_shot(descriptor, handler, connection.writer())
            .await?;
        Ok(Disposition::Reply(reply))
    }
}
