#![forbid(unsafe_code)]

//! `mux-jsonrpc` is a small JSON-RPC 2.0 client that frames messages as one
//! JSON object per newline-terminated line.
//!
//! Transports:
//! - stdio (spawned child process)
//! - any `AsyncRead`/`AsyncWrite` pair (`Client::connect_io`, used for
//!   in-memory peers in tests)
//!
//! Design goals:
//! - Minimal dependencies and low ceremony (`serde_json::Value` based)
//! - Correct correlation under partial reads, out-of-order and late responses
//! - Bounded queues + per-message size limits to reduce DoS risk
//!
//! Non-goals:
//! - Implementing a JSON-RPC server
//! - Automatic reconnect
//! - Rich typed schemas beyond `serde_json::Value`

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};

mod reader;

use reader::{spawn_reader_task, ReaderContext};

pub const JSONRPC_METHOD_NOT_FOUND: i64 = -32601;

#[derive(Debug, Clone)]
pub struct Limits {
    /// Maximum bytes for a single JSON-RPC message (one line).
    pub max_message_bytes: usize,
    /// Maximum buffered server-initiated notifications.
    pub notifications_capacity: usize,
    /// Maximum concurrently outstanding requests.
    pub max_pending_requests: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            // Large enough for typical MCP messages, but bounded to reduce DoS risk.
            max_message_bytes: 16 * 1024 * 1024,
            notifications_capacity: 256,
            max_pending_requests: 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SpawnOptions {
    pub limits: Limits,
    /// When true (default), kill the child process if the `Client` is dropped.
    ///
    /// Best-effort only; callers that own the child lifecycle should take the
    /// child out with `Client::take_child` and reap it themselves.
    pub kill_on_drop: bool,
}

impl Default for SpawnOptions {
    fn default() -> Self {
        Self {
            limits: Limits::default(),
            kill_on_drop: true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("json-rpc error {code}: {message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<Value>,
    },
    #[error("protocol error: {0}")]
    Protocol(ProtocolError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProtocolErrorKind {
    /// The client/transport was closed (explicitly, via drop, or on EOF).
    Closed,
    /// A request exceeded its deadline.
    Timeout,
    /// The peer sent an invalid JSON-RPC message.
    InvalidMessage,
    /// Catch-all for internal invariants.
    Other,
}

#[derive(Debug, Clone)]
pub struct ProtocolError {
    pub kind: ProtocolErrorKind,
    pub message: String,
}

impl ProtocolError {
    pub fn new(kind: ProtocolErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.message.fmt(f)
    }
}

impl std::error::Error for ProtocolError {}

impl Error {
    pub fn protocol(kind: ProtocolErrorKind, message: impl Into<String>) -> Self {
        Self::Protocol(ProtocolError::new(kind, message))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Protocol(err) if err.kind == ProtocolErrorKind::Timeout)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Error::Protocol(err) if err.kind == ProtocolErrorKind::Closed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Id {
    String(String),
    Integer(i64),
}

pub(crate) type PendingRequests = Arc<Mutex<HashMap<Id, oneshot::Sender<Result<Value, Error>>>>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientStats {
    pub invalid_json_lines: u64,
    /// Responses whose id no longer matched a pending request (typically a
    /// reply arriving after the caller's deadline already evicted the waiter).
    pub stale_responses: u64,
    pub dropped_notifications_full: u64,
    pub dropped_notifications_closed: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StatsInner {
    pub(crate) invalid_json_lines: AtomicU64,
    pub(crate) stale_responses: AtomicU64,
    pub(crate) dropped_notifications_full: AtomicU64,
    pub(crate) dropped_notifications_closed: AtomicU64,
}

impl StatsInner {
    fn snapshot(&self) -> ClientStats {
        ClientStats {
            invalid_json_lines: self.invalid_json_lines.load(Ordering::Relaxed),
            stale_responses: self.stale_responses.load(Ordering::Relaxed),
            dropped_notifications_full: self.dropped_notifications_full.load(Ordering::Relaxed),
            dropped_notifications_closed: self.dropped_notifications_closed.load(Ordering::Relaxed),
        }
    }
}

/// A server-initiated notification (a message with a `method` but no `id`).
#[derive(Debug, Clone)]
pub struct Notification {
    pub method: String,
    pub params: Option<Value>,
}

#[derive(Clone)]
pub struct ClientHandle {
    write: Arc<tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>>,
    next_id: Arc<AtomicI64>,
    pending: PendingRequests,
    max_pending: usize,
    stats: Arc<StatsInner>,
    closed: Arc<AtomicBool>,
    closed_signal: Arc<watch::Sender<bool>>,
    close_reason: Arc<Mutex<Option<String>>>,
}

impl std::fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHandle").finish_non_exhaustive()
    }
}

impl ClientHandle {
    pub fn stats(&self) -> ClientStats {
        self.stats.snapshot()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    /// A receiver that flips to `true` once the client closes (explicit
    /// close, peer EOF, unrecoverable write error, or drop).
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed_signal.subscribe()
    }

    pub fn close_reason(&self) -> Option<String> {
        self.close_reason
            .lock()
            .ok()
            .and_then(|guard| guard.clone())
    }

    pub fn pending_requests(&self) -> usize {
        lock_pending(&self.pending).len()
    }

    fn check_closed(&self) -> Result<(), Error> {
        if !self.closed.load(Ordering::Relaxed) {
            return Ok(());
        }
        let reason = self
            .close_reason
            .lock()
            .ok()
            .and_then(|guard| guard.clone())
            .unwrap_or_else(|| "client closed".to_string());
        Err(Error::protocol(ProtocolErrorKind::Closed, reason))
    }

    /// Marks the client closed, fails every pending waiter with a
    /// connection-closed error, and shuts the write end.
    pub async fn close(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.close_with_error(
            reason.clone(),
            Error::protocol(ProtocolErrorKind::Closed, reason),
        )
        .await;
    }

    pub(crate) async fn close_with_error(&self, reason: impl Into<String>, err: Error) {
        let reason = reason.into();

        self.closed.store(true, Ordering::Relaxed);
        if let Ok(mut guard) = self.close_reason.lock() {
            if guard.is_none() {
                *guard = Some(reason);
            }
        }
        let _ = self.closed_signal.send(true);

        drain_pending(&self.pending, &err);
        let mut write = self.write.lock().await;
        let _ = write.shutdown().await;
        // Many `AsyncWrite` impls (e.g. `tokio::process::ChildStdin`) only fully close on drop.
        // Replacing the writer guarantees the underlying write end is closed.
        let _ = std::mem::replace(&mut *write, Box::new(tokio::io::sink()));
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), Error> {
        self.check_closed()?;
        let mut msg = Map::new();
        msg.insert("jsonrpc".to_string(), Value::String("2.0".to_string()));
        msg.insert("method".to_string(), Value::String(method.to_string()));
        if let Some(params) = params.filter(|v| !v.is_null()) {
            msg.insert("params".to_string(), params);
        }

        let mut line = serde_json::to_string(&Value::Object(msg))?;
        line.push('\n');
        self.write_line(&line).await
    }

    /// Issues a request and waits (without bound) for the matching response.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, Error> {
        let (id, rx, line) = self.enqueue(method, params)?;
        let mut guard = PendingRequestGuard::new(self.pending.clone(), id.clone());

        if let Err(err) = self.write_line(&line).await {
            lock_pending(&self.pending).remove(&id);
            guard.disarm();
            return Err(err);
        }

        match rx.await {
            Ok(result) => {
                guard.disarm();
                result
            }
            Err(_) => Err(Error::protocol(
                ProtocolErrorKind::Closed,
                "response channel closed",
            )),
        }
    }

    /// Issues a request under a deadline covering both the write and the wait.
    ///
    /// A deadline that expires while the response is outstanding evicts the
    /// waiter; a response arriving later is discarded (and counted in
    /// `ClientStats::stale_responses`). A deadline that expires while the
    /// line is still being written closes the client, since a half-written
    /// frame would corrupt the stream for every other request.
    pub async fn request_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, Error> {
        let deadline = tokio::time::Instant::now() + timeout;
        let (id, rx, line) = self.enqueue(method, params)?;
        let mut guard = PendingRequestGuard::new(self.pending.clone(), id.clone());

        match tokio::time::timeout_at(deadline, self.write_line(&line)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                lock_pending(&self.pending).remove(&id);
                guard.disarm();
                return Err(err);
            }
            Err(_) => {
                lock_pending(&self.pending).remove(&id);
                guard.disarm();
                let reason = format!("request write timed out after {timeout:?}: {method}");
                self.close(reason.clone()).await;
                return Err(Error::protocol(ProtocolErrorKind::Timeout, reason));
            }
        }

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(result)) => {
                guard.disarm();
                result
            }
            Ok(Err(_)) => Err(Error::protocol(
                ProtocolErrorKind::Closed,
                "response channel closed",
            )),
            // Guard drop evicts the waiter; a late reply becomes stale.
            Err(_) => Err(Error::protocol(
                ProtocolErrorKind::Timeout,
                format!("request timed out after {timeout:?}: {method}"),
            )),
        }
    }

    fn enqueue(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<(Id, oneshot::Receiver<Result<Value, Error>>, String), Error> {
        self.check_closed()?;
        let id = Id::Integer(self.next_id.fetch_add(1, Ordering::Relaxed));

        let (tx, rx) = oneshot::channel::<Result<Value, Error>>();
        {
            let mut pending = lock_pending(&self.pending);
            if pending.len() >= self.max_pending {
                return Err(Error::protocol(
                    ProtocolErrorKind::Other,
                    format!("too many pending requests (max {})", self.max_pending),
                ));
            }
            pending.insert(id.clone(), tx);
        }

        let mut req = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
        });
        if let Some(params) = params.filter(|v| !v.is_null()) {
            req["params"] = params;
        }

        let mut line = match serde_json::to_string(&req) {
            Ok(line) => line,
            Err(err) => {
                lock_pending(&self.pending).remove(&id);
                return Err(Error::Json(err));
            }
        };
        line.push('\n');
        Ok((id, rx, line))
    }

    pub(crate) async fn respond_error(
        &self,
        id: Id,
        code: i64,
        message: impl Into<String>,
    ) -> Result<(), Error> {
        self.check_closed()?;
        let response = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": { "code": code, "message": message.into() },
        });
        let mut line = serde_json::to_string(&response)?;
        line.push('\n');
        self.write_line(&line).await
    }

    async fn write_line(&self, line: &str) -> Result<(), Error> {
        self.check_closed()?;
        let mut write = self.write.lock().await;
        write.write_all(line.as_bytes()).await?;
        write.flush().await?;
        Ok(())
    }
}

pub struct Client {
    handle: ClientHandle,
    child: Option<Child>,
    notifications_rx: Option<mpsc::Receiver<Notification>>,
    task: tokio::task::JoinHandle<()>,
}

impl Client {
    pub async fn connect_io<R, W>(read: R, write: W) -> Result<Self, Error>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::connect_io_with_options(read, write, SpawnOptions::default()).await
    }

    pub async fn connect_io_with_options<R, W>(
        read: R,
        write: W,
        options: SpawnOptions,
    ) -> Result<Self, Error>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Ok(Self::create(read, write, None, options))
    }

    pub async fn spawn_command(cmd: Command) -> Result<Self, Error> {
        Self::spawn_command_with_options(cmd, SpawnOptions::default()).await
    }

    /// Spawns `cmd` with piped stdin/stdout and wires the JSON-RPC client to
    /// its pipes. Stderr disposition is whatever the caller configured on
    /// `cmd` beforehand.
    pub async fn spawn_command_with_options(
        mut cmd: Command,
        options: SpawnOptions,
    ) -> Result<Self, Error> {
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.kill_on_drop(options.kill_on_drop);

        let mut child = cmd.spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::protocol(ProtocolErrorKind::Other, "child stdin not captured"))?;
        let stdout = child.stdout.take().ok_or_else(|| {
            Error::protocol(ProtocolErrorKind::Other, "child stdout not captured")
        })?;

        Ok(Self::create(stdout, stdin, Some(child), options))
    }

    fn create<R, W>(read: R, write: W, child: Option<Child>, options: SpawnOptions) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let limits = options.limits;
        let (notify_tx, notify_rx) =
            mpsc::channel::<Notification>(limits.notifications_capacity.max(1));
        let pending: PendingRequests = Arc::new(Mutex::new(HashMap::new()));
        let stats = Arc::new(StatsInner::default());

        let (closed_tx, _closed_rx) = watch::channel(false);
        let handle = ClientHandle {
            write: Arc::new(tokio::sync::Mutex::new(Box::new(write) as _)),
            next_id: Arc::new(AtomicI64::new(1)),
            pending: pending.clone(),
            max_pending: limits.max_pending_requests.max(1),
            stats: stats.clone(),
            closed: Arc::new(AtomicBool::new(false)),
            closed_signal: Arc::new(closed_tx),
            close_reason: Arc::new(Mutex::new(None)),
        };

        let task = spawn_reader_task(
            read,
            ReaderContext {
                pending,
                stats,
                notify_tx,
                responder: handle.clone(),
                max_message_bytes: limits.max_message_bytes.max(1),
            },
        );

        Self {
            handle,
            child,
            notifications_rx: Some(notify_rx),
            task,
        }
    }

    pub fn handle(&self) -> ClientHandle {
        self.handle.clone()
    }

    pub fn stats(&self) -> ClientStats {
        self.handle.stats()
    }

    pub fn child_id(&self) -> Option<u32> {
        self.child.as_ref().and_then(|child| child.id())
    }

    /// Hands the spawned child out to the caller, who then owns reaping it.
    pub fn take_child(&mut self) -> Option<Child> {
        self.child.take()
    }

    pub fn take_notifications(&mut self) -> Option<mpsc::Receiver<Notification>> {
        self.notifications_rx.take()
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), Error> {
        self.handle.notify(method, params).await
    }

    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, Error> {
        self.handle.request(method, params).await
    }

    pub async fn request_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, Error> {
        self.handle
            .request_with_timeout(method, params, timeout)
            .await
    }

    pub async fn close(&self, reason: impl Into<String>) {
        self.handle.close(reason).await;
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.handle.closed.store(true, Ordering::Relaxed);
        if let Ok(mut guard) = self.handle.close_reason.lock() {
            if guard.is_none() {
                *guard = Some("client dropped".to_string());
            }
        }
        let _ = self.handle.closed_signal.send(true);
        self.task.abort();
        let err = Error::protocol(ProtocolErrorKind::Closed, "client dropped");
        drain_pending(&self.handle.pending, &err);
    }
}

/// Evicts the pending entry for an abandoned request (caller future dropped,
/// deadline elapsed) so a late response cannot rendezvous with a dead waiter.
struct PendingRequestGuard {
    pending: PendingRequests,
    id: Id,
    armed: bool,
}

impl PendingRequestGuard {
    fn new(pending: PendingRequests, id: Id) -> Self {
        Self {
            pending,
            id,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingRequestGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        lock_pending(&self.pending).remove(&self.id);
    }
}

pub(crate) fn lock_pending(
    pending: &PendingRequests,
) -> std::sync::MutexGuard<'_, HashMap<Id, oneshot::Sender<Result<Value, Error>>>> {
    pending
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) fn drain_pending(pending: &PendingRequests, err: &Error) {
    let pending = {
        let mut pending = lock_pending(pending);
        std::mem::take(&mut *pending)
    };

    for (_id, tx) in pending {
        let _ = tx.send(Err(clone_error_for_drain(err)));
    }
}

fn clone_error_for_drain(err: &Error) -> Error {
    match err {
        Error::Io(err) => Error::Io(std::io::Error::new(err.kind(), err.to_string())),
        Error::Json(err) => Error::protocol(ProtocolErrorKind::Other, format!("json error: {err}")),
        Error::Rpc {
            code,
            message,
            data,
        } => Error::Rpc {
            code: *code,
            message: message.clone(),
            data: data.clone(),
        },
        Error::Protocol(err) => Error::Protocol(err.clone()),
    }
}

pub(crate) fn parse_id(value: &Value) -> Option<Id> {
    match value {
        Value::String(value) => Some(Id::String(value.clone())),
        Value::Number(value) => value.as_i64().map(Id::Integer).or_else(|| {
            value
                .as_u64()
                .and_then(|v| i64::try_from(v).ok())
                .map(Id::Integer)
        }),
        _ => None,
    }
}

#[cfg(test)]
mod stats_tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn stats_tracks_invalid_json_lines() {
        let (client_stream, server_stream) = tokio::io::duplex(1024);
        let (client_read, client_write) = tokio::io::split(client_stream);
        let (_server_read, mut server_write) = tokio::io::split(server_stream);

        let client = Client::connect_io(client_read, client_write).await.unwrap();

        server_write.write_all(b"not-json\n").await.unwrap();
        server_write.flush().await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if client.stats().invalid_json_lines >= 1 {
                    break;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn stats_tracks_dropped_notifications() {
        let (client_stream, server_stream) = tokio::io::duplex(1024);
        let (client_read, client_write) = tokio::io::split(client_stream);
        let (_server_read, mut server_write) = tokio::io::split(server_stream);

        let mut options = SpawnOptions::default();
        options.limits.notifications_capacity = 1;
        let client = Client::connect_io_with_options(client_read, client_write, options)
            .await
            .unwrap();

        let note = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "demo/notify",
            "params": {},
        });
        let mut out = serde_json::to_string(&note).unwrap();
        out.push('\n');
        server_write.write_all(out.as_bytes()).await.unwrap();
        server_write.write_all(out.as_bytes()).await.unwrap();
        server_write.flush().await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if client.stats().dropped_notifications_full >= 1 {
                    break;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn stats_tracks_stale_responses() {
        let (client_stream, server_stream) = tokio::io::duplex(1024);
        let (client_read, client_write) = tokio::io::split(client_stream);
        let (_server_read, mut server_write) = tokio::io::split(server_stream);

        let client = Client::connect_io(client_read, client_write).await.unwrap();

        // No request with id 99 was ever issued.
        let stale = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 99,
            "result": { "ok": true },
        });
        let mut out = serde_json::to_string(&stale).unwrap();
        out.push('\n');
        server_write.write_all(out.as_bytes()).await.unwrap();
        server_write.flush().await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if client.stats().stale_responses >= 1 {
                    break;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert!(!client.handle().is_closed());
    }
}
