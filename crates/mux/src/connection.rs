//! One live child server: the spawned process, its JSON-RPC client, the MCP
//! handshake, and the teardown state machine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite};
use tokio::process::{Child, ChildStderr};
use tokio::sync::{mpsc, watch};

use crate::error::{Error, Result};
use crate::{
    ServerName, ServerSpec, CLIENT_NAME, CLIENT_VERSION, MCP_PROTOCOL_VERSION, REQUEST_TIMEOUT,
    TERMINATE_GRACE,
};

/// Read-only snapshot of one connection, for status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    pub name: String,
    pub pid: Option<u32>,
    pub initialized: bool,
    pub pending_requests: usize,
}

/// A connected child server.
///
/// Created by [`Connection::connect`] (spawn + handshake) and destroyed by
/// [`Connection::disconnect`] or by the child exiting. All MCP verbs are safe
/// to call concurrently; each returns exactly once with either the decoded
/// `result` or a typed failure.
pub struct Connection {
    name: ServerName,
    client: mux_jsonrpc::Client,
    pid: Option<u32>,
    /// Shared with the teardown task, which clears it: initialized implies
    /// the child is live and not reaped.
    initialized: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    disconnected_rx: watch::Receiver<bool>,
    notifications: Mutex<Option<mpsc::Receiver<mux_jsonrpc::Notification>>>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.name)
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Spawns the spec's command and performs the MCP initialize handshake.
    ///
    /// On any handshake failure the child is killed and the error surfaced;
    /// the connection never leaves this function half-initialized.
    pub async fn connect(spec: &ServerSpec) -> Result<Self> {
        let name = spec.name.clone();
        let mut client =
            mux_jsonrpc::Client::spawn_command(spec.spawn_command())
                .await
                .map_err(|err| match err {
                    mux_jsonrpc::Error::Io(source) => Error::Spawn {
                        name: name.to_string(),
                        command: spec.command.clone(),
                        source,
                    },
                    other => Error::Transport {
                        name: name.to_string(),
                        message: other.to_string(),
                    },
                })?;

        let Some(mut child) = client.take_child() else {
            return Err(Error::Transport {
                name: name.to_string(),
                message: "spawned client did not expose a child handle".to_string(),
            });
        };
        let pid = child.id();
        if let Some(stderr) = child.stderr.take() {
            spawn_stderr_task(name.clone(), stderr);
        }
        tracing::info!(server = %name, command = %spec.command, ?pid, "spawned server");

        if let Err(err) = initialize_handshake(&name, &client).await {
            // Leave nothing behind: the handshake owns the child until it
            // succeeds.
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Err(err);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (disconnected_tx, disconnected_rx) = watch::channel(false);
        let closed_rx = client.handle().closed_signal();
        let initialized = Arc::new(AtomicBool::new(true));
        tokio::spawn(reap_child(
            name.clone(),
            child,
            client.handle(),
            Arc::clone(&initialized),
            shutdown_rx,
            closed_rx,
            disconnected_tx,
        ));

        let notifications = Mutex::new(client.take_notifications());
        Ok(Self {
            name,
            client,
            pid,
            initialized,
            shutdown_tx,
            disconnected_rx,
            notifications,
        })
    }

    /// Connects over an arbitrary byte-stream pair instead of a spawned
    /// process. There is no OS process behind such a connection, so teardown
    /// skips signal delivery. Used by tests and in-process embeddings.
    pub async fn connect_io<R, W>(name: ServerName, read: R, write: W) -> Result<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let mut client = mux_jsonrpc::Client::connect_io(read, write)
            .await
            .map_err(|err| Error::Transport {
                name: name.to_string(),
                message: err.to_string(),
            })?;

        initialize_handshake(&name, &client).await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (disconnected_tx, disconnected_rx) = watch::channel(false);
        let closed_rx = client.handle().closed_signal();
        let initialized = Arc::new(AtomicBool::new(true));
        let handle = client.handle();
        let task_name = name.clone();
        let task_initialized = Arc::clone(&initialized);
        tokio::spawn(async move {
            tokio::select! {
                _ = wait_flag(shutdown_rx) => {
                    handle
                        .close(format!("server {task_name} disconnected"))
                        .await;
                }
                _ = wait_flag(closed_rx) => {}
            }
            task_initialized.store(false, Ordering::SeqCst);
            let _ = disconnected_tx.send(true);
        });

        let notifications = Mutex::new(client.take_notifications());
        Ok(Self {
            name,
            client,
            pid: None,
            initialized,
            shutdown_tx,
            disconnected_rx,
            notifications,
        })
    }

    pub fn name(&self) -> &ServerName {
        &self.name
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            name: self.name.to_string(),
            pid: self.pid,
            initialized: self.is_initialized(),
            pending_requests: self.client.handle().pending_requests(),
        }
    }

    /// Server-initiated notifications. Takeable once; the core never
    /// acknowledges or blocks on them.
    pub fn take_notifications(&self) -> Option<mpsc::Receiver<mux_jsonrpc::Notification>> {
        self.notifications
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    /// A receiver that flips to `true` exactly once, when this connection is
    /// fully torn down (child exit, disconnect, or transport failure).
    pub fn disconnected(&self) -> watch::Receiver<bool> {
        self.disconnected_rx.clone()
    }

    pub async fn list_tools(&self) -> Result<Value> {
        self.request("tools/list", None).await
    }

    pub async fn call_tool(&self, tool: &str, arguments: Option<Value>) -> Result<Value> {
        let mut params = serde_json::json!({ "name": tool });
        if let Some(arguments) = arguments {
            params["arguments"] = arguments;
        }
        self.ensure_ready()?;
        self.client
            .request_with_timeout("tools/call", Some(params), REQUEST_TIMEOUT)
            .await
            .map_err(|err| Error::from_rpc(&self.name, &format!("tools/call {tool}"), err))
    }

    pub async fn list_resources(&self) -> Result<Value> {
        self.request("resources/list", None).await
    }

    pub async fn read_resource(&self, uri: &str) -> Result<Value> {
        let params = serde_json::json!({ "uri": uri });
        self.ensure_ready()?;
        self.client
            .request_with_timeout("resources/read", Some(params), REQUEST_TIMEOUT)
            .await
            .map_err(|err| Error::from_rpc(&self.name, &format!("resources/read {uri}"), err))
    }

    /// Any MCP request against this connection, under the standard deadline.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        self.ensure_ready()?;
        self.client
            .request_with_timeout(method, params, REQUEST_TIMEOUT)
            .await
            .map_err(|err| Error::from_rpc(&self.name, method, err))
    }

    /// Best-effort graceful shutdown; never surfaces an error.
    ///
    /// Sends an advisory `shutdown` request when initialized (failures
    /// swallowed), then triggers teardown and waits for it to complete:
    /// pending waiters fail with a connection-closed error, the child gets
    /// SIGTERM and, after the grace period, SIGKILL.
    pub async fn disconnect(&self) {
        if self.initialized.swap(false, Ordering::SeqCst) {
            match self
                .client
                .request_with_timeout("shutdown", None, REQUEST_TIMEOUT)
                .await
            {
                Ok(_) => tracing::debug!(server = %self.name, "server acknowledged shutdown"),
                Err(err) => {
                    tracing::debug!(server = %self.name, error = %err, "shutdown request failed")
                }
            }
        }

        let _ = self.shutdown_tx.send(true);
        wait_flag(self.disconnected_rx.clone()).await;
    }

    fn ensure_ready(&self) -> Result<()> {
        if !self.is_initialized() {
            return Err(Error::NotInitialized(self.name.to_string()));
        }
        Ok(())
    }
}

/// Sends `initialize` and the `notifications/initialized` notification.
async fn initialize_handshake(name: &ServerName, client: &mux_jsonrpc::Client) -> Result<Value> {
    let params = serde_json::json!({
        "protocolVersion": MCP_PROTOCOL_VERSION,
        "capabilities": { "tools": {} },
        "clientInfo": { "name": CLIENT_NAME, "version": CLIENT_VERSION },
    });

    let result = client
        .request_with_timeout("initialize", Some(params), REQUEST_TIMEOUT)
        .await
        .map_err(|err| Error::from_rpc(name, "initialize", err))?;

    client
        .notify("notifications/initialized", None)
        .await
        .map_err(|err| Error::from_rpc(name, "notifications/initialized", err))?;

    tracing::debug!(server = %name, "handshake complete");
    Ok(result)
}

/// The owner task for a spawned child: waits for whichever comes first of
/// child exit, an explicit disconnect, or the transport closing underneath
/// us, then reaps the process and emits `disconnected` exactly once.
async fn reap_child(
    name: ServerName,
    mut child: Child,
    handle: mux_jsonrpc::ClientHandle,
    initialized: Arc<AtomicBool>,
    shutdown_rx: watch::Receiver<bool>,
    closed_rx: watch::Receiver<bool>,
    disconnected_tx: watch::Sender<bool>,
) {
    tokio::select! {
        status = child.wait() => {
            match status {
                Ok(status) => tracing::info!(server = %name, %status, "server exited"),
                Err(err) => tracing::warn!(server = %name, error = %err, "wait for server failed"),
            }
            initialized.store(false, Ordering::SeqCst);
            handle.close(format!("server {name} exited")).await;
        }
        _ = wait_flag(shutdown_rx) => {
            initialized.store(false, Ordering::SeqCst);
            handle.close(format!("server {name} disconnected")).await;
            terminate(&name, &mut child).await;
        }
        _ = wait_flag(closed_rx) => {
            initialized.store(false, Ordering::SeqCst);
            terminate(&name, &mut child).await;
        }
    }
    let _ = disconnected_tx.send(true);
}

/// SIGTERM, wait up to the grace period, then SIGKILL. Always reaps.
async fn terminate(name: &ServerName, child: &mut Child) {
    if let Some(pid) = child.id() {
        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            tracing::debug!(server = %name, pid, "sending SIGTERM");
            if let Err(err) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                tracing::warn!(server = %name, pid, error = %err, "SIGTERM failed");
            }
        }

        match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(server = %name, %status, "server exited after SIGTERM");
                return;
            }
            Ok(Err(err)) => {
                tracing::error!(server = %name, error = %err, "wait failed after SIGTERM");
            }
            Err(_) => {
                tracing::warn!(
                    server = %name,
                    grace = ?TERMINATE_GRACE,
                    "server did not exit within grace period, sending SIGKILL"
                );
            }
        }
    }

    // kill() waits for the exit, so the child cannot be left as a zombie.
    if let Err(err) = child.kill().await {
        tracing::error!(server = %name, error = %err, "SIGKILL failed");
        return;
    }
    tracing::info!(server = %name, "server exited after SIGKILL");
}

fn spawn_stderr_task(name: ServerName, stderr: ChildStderr) {
    tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(server = %name, "stderr: {line}");
        }
    });
}

/// Resolves once the watch flag is (or becomes) `true`, or its sender is
/// dropped.
async fn wait_flag(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}
