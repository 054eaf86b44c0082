//! Process-wide registry of server specifications and live connections.
//!
//! One async mutex guards both maps. `connect_server` holds it across the
//! spawn + handshake, which serializes a re-connect racing a slow disconnect
//! of the same name; every other operation releases the lock before awaiting
//! the child.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures_util::future::join_all;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::{defaults, Connection, ServerName, ServerSpec, SpecOverrides};

/// Result of `connect_server`. Connecting an already-connected name is not a
/// failure; callers that care can branch on the sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    Connected,
    AlreadyConnected,
}

impl ConnectOutcome {
    pub fn is_already_connected(self) -> bool {
        matches!(self, ConnectOutcome::AlreadyConnected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerHealth {
    pub name: String,
    pub connected: bool,
    pub description: String,
    pub auto_start: bool,
    /// Tool count from a live `tools/list` probe; absent when not connected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub registered: usize,
    pub connected: usize,
    pub servers: Vec<ServerHealth>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub name: String,
    pub connected: bool,
    pub description: String,
    pub auto_start: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

struct ManagerState {
    specs: HashMap<ServerName, ServerSpec>,
    connections: HashMap<ServerName, Arc<Connection>>,
}

/// The facade the HTTP adapter calls per request.
pub struct Manager {
    state: Mutex<ManagerState>,
}

impl Manager {
    /// A manager with the default server registry pre-registered (none
    /// auto-start; API keys are captured from the ambient environment).
    pub fn new() -> Arc<Self> {
        let specs = defaults::default_specs()
            .into_iter()
            .map(|spec| (spec.name.clone(), spec))
            .collect();
        Arc::new(Self {
            state: Mutex::new(ManagerState {
                specs,
                connections: HashMap::new(),
            }),
        })
    }

    /// A manager with an empty registry.
    pub fn empty() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ManagerState {
                specs: HashMap::new(),
                connections: HashMap::new(),
            }),
        })
    }

    /// Inserts or overwrites a specification. Pure registry mutation; no
    /// process is spawned.
    pub async fn register_server(&self, spec: ServerSpec) {
        let mut state = self.state.lock().await;
        tracing::debug!(server = %spec.name, command = %spec.command, "registered server spec");
        state.specs.insert(spec.name.clone(), spec);
    }

    pub async fn registered_servers(&self) -> Vec<ServerName> {
        let state = self.state.lock().await;
        let mut names: Vec<_> = state.specs.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn is_connected(&self, name: &str) -> bool {
        self.state.lock().await.connections.contains_key(name)
    }

    /// Spawns and initializes the named server, overlaying `overrides` onto
    /// the registered spec. Returns the already-connected sentinel when a
    /// live connection exists under this name.
    pub async fn connect_server(
        self: &Arc<Self>,
        name: &str,
        overrides: Option<SpecOverrides>,
    ) -> Result<ConnectOutcome> {
        let name = ServerName::parse(name)?;
        let mut state = self.state.lock().await;
        if state.connections.contains_key(&name) {
            return Ok(ConnectOutcome::AlreadyConnected);
        }
        let spec = state
            .specs
            .get(&name)
            .ok_or_else(|| Error::UnknownServer(name.to_string()))?;
        let effective = match &overrides {
            Some(overrides) if !overrides.is_empty() => spec.apply_overrides(overrides),
            _ => spec.clone(),
        };

        let connection = Arc::new(Connection::connect(&effective).await?);
        self.watch_disconnect(&name, &connection);
        state.connections.insert(name.clone(), connection);
        tracing::info!(server = %name, "server connected");
        Ok(ConnectOutcome::Connected)
    }

    /// Like `connect_server`, but over an in-memory byte-stream pair instead
    /// of a spawned process. The name must still be registered.
    pub async fn connect_io_server<R, W>(
        self: &Arc<Self>,
        name: &str,
        read: R,
        write: W,
    ) -> Result<ConnectOutcome>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let name = ServerName::parse(name)?;
        let mut state = self.state.lock().await;
        if state.connections.contains_key(&name) {
            return Ok(ConnectOutcome::AlreadyConnected);
        }
        if !state.specs.contains_key(&name) {
            return Err(Error::UnknownServer(name.to_string()));
        }

        let connection = Arc::new(Connection::connect_io(name.clone(), read, write).await?);
        self.watch_disconnect(&name, &connection);
        state.connections.insert(name, connection);
        Ok(ConnectOutcome::Connected)
    }

    /// Removes a connection when its `disconnected` signal fires, unless a
    /// newer connection already took over the name.
    fn watch_disconnect(self: &Arc<Self>, name: &ServerName, connection: &Arc<Connection>) {
        let manager = Arc::downgrade(self);
        let name = name.clone();
        let connection = Arc::clone(connection);
        let mut disconnected = connection.disconnected();
        tokio::spawn(async move {
            while !*disconnected.borrow_and_update() {
                if disconnected.changed().await.is_err() {
                    break;
                }
            }
            let Some(manager) = manager.upgrade() else {
                return;
            };
            let mut state = manager.state.lock().await;
            let is_current = state
                .connections
                .get(&name)
                .is_some_and(|current| Arc::ptr_eq(current, &connection));
            if is_current {
                state.connections.remove(&name);
                tracing::info!(server = %name, "removed disconnected server");
            }
        });
    }

    /// Disconnects the named server. The name is gone from the live map when
    /// this returns, whether or not the graceful shutdown succeeded.
    pub async fn disconnect_server(&self, name: &str) -> Result<()> {
        let connection = {
            let mut state = self.state.lock().await;
            state
                .connections
                .remove(name)
                .ok_or_else(|| Error::NotConnected(name.to_string()))?
        };
        connection.disconnect().await;
        tracing::info!(server = %name, "server disconnected");
        Ok(())
    }

    /// Disconnects every live server in parallel, swallowing individual
    /// failures. Idempotent.
    pub async fn disconnect_all(&self) {
        let connections: Vec<(ServerName, Arc<Connection>)> = {
            let mut state = self.state.lock().await;
            state.connections.drain().collect()
        };
        if connections.is_empty() {
            return;
        }
        tracing::info!(count = connections.len(), "disconnecting all servers");
        join_all(connections.into_iter().map(|(name, connection)| async move {
            connection.disconnect().await;
            tracing::debug!(server = %name, "server disconnected");
        }))
        .await;
    }

    pub async fn call_tool(&self, name: &str, tool: &str, arguments: Option<Value>) -> Result<Value> {
        let connection = self.connection(name).await?;
        connection.call_tool(tool, arguments).await
    }

    pub async fn read_resource(&self, name: &str, uri: &str) -> Result<Value> {
        let connection = self.connection(name).await?;
        connection.read_resource(uri).await
    }

    pub async fn list_tools(&self, name: &str) -> Result<Value> {
        let connection = self.connection(name).await?;
        connection.list_tools().await
    }

    pub async fn list_resources(&self, name: &str) -> Result<Value> {
        let connection = self.connection(name).await?;
        connection.list_resources().await
    }

    /// `tools/list` fanned out across every live connection. A failing server
    /// contributes an empty list; the aggregate itself never fails.
    pub async fn list_all_tools(&self) -> BTreeMap<String, Value> {
        self.aggregate("tools/list", "tools").await
    }

    /// `resources/list` fanned out across every live connection, with the
    /// same per-server failure policy as `list_all_tools`.
    pub async fn list_all_resources(&self) -> BTreeMap<String, Value> {
        self.aggregate("resources/list", "resources").await
    }

    async fn aggregate(&self, method: &'static str, key: &'static str) -> BTreeMap<String, Value> {
        let connections = self.live_connections().await;

        let results = join_all(
            connections
                .into_iter()
                .map(|(name, connection)| async move {
                    match connection.request(method, None).await {
                        Ok(result) => {
                            let items = result
                                .get(key)
                                .cloned()
                                .unwrap_or_else(|| Value::Array(Vec::new()));
                            (name, items)
                        }
                        Err(err) => {
                            tracing::warn!(server = %name, error = %err, "aggregate {method} failed");
                            (name, Value::Array(Vec::new()))
                        }
                    }
                }),
        )
        .await;

        results
            .into_iter()
            .map(|(name, items)| (name.to_string(), items))
            .collect()
    }

    /// Per-server registry/liveness rows, no probes.
    pub async fn status(&self) -> Vec<ServerStatus> {
        let state = self.state.lock().await;
        let mut rows: Vec<ServerStatus> = state
            .specs
            .values()
            .map(|spec| {
                let connection = state.connections.get(&spec.name);
                ServerStatus {
                    name: spec.name.to_string(),
                    connected: connection.is_some(),
                    description: spec.description.clone(),
                    auto_start: spec.auto_start,
                    pid: connection.and_then(|conn| conn.pid()),
                }
            })
            .collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        rows
    }

    /// Registry snapshot plus a `tools/list` probe against every live
    /// connection; degraded if any probe fails.
    pub async fn health_check(&self) -> HealthReport {
        let (mut rows, probes) = {
            let state = self.state.lock().await;
            let rows: Vec<ServerHealth> = state
                .specs
                .values()
                .map(|spec| ServerHealth {
                    name: spec.name.to_string(),
                    connected: state.connections.contains_key(&spec.name),
                    description: spec.description.clone(),
                    auto_start: spec.auto_start,
                    tools: None,
                    error: None,
                })
                .collect();
            let probes: Vec<(ServerName, Arc<Connection>)> = state
                .connections
                .iter()
                .map(|(name, connection)| (name.clone(), Arc::clone(connection)))
                .collect();
            (rows, probes)
        };
        rows.sort_by(|a, b| a.name.cmp(&b.name));

        let connected = probes.len();
        let mut degraded = false;
        let probe_results = join_all(probes.into_iter().map(|(name, connection)| async move {
            let result = connection.list_tools().await;
            (name, result)
        }))
        .await;

        for (name, result) in probe_results {
            let Some(row) = rows.iter_mut().find(|row| row.name == name.as_str()) else {
                continue;
            };
            match result {
                Ok(value) => {
                    row.tools = Some(
                        value
                            .get("tools")
                            .and_then(|tools| tools.as_array())
                            .map(|tools| tools.len())
                            .unwrap_or(0),
                    );
                }
                Err(err) => {
                    degraded = true;
                    row.error = Some(err.to_string());
                }
            }
        }

        HealthReport {
            status: if degraded {
                HealthStatus::Degraded
            } else {
                HealthStatus::Healthy
            },
            registered: rows.len(),
            connected,
            servers: rows,
        }
    }

    /// Connects every spec flagged `auto_start`, serially, swallowing
    /// individual failures.
    pub async fn initialize_default_servers(self: &Arc<Self>) {
        let auto_start: Vec<ServerName> = {
            let state = self.state.lock().await;
            let mut names: Vec<_> = state
                .specs
                .values()
                .filter(|spec| spec.auto_start)
                .map(|spec| spec.name.clone())
                .collect();
            names.sort();
            names
        };

        for name in auto_start {
            match self.connect_server(&name, None).await {
                Ok(outcome) => {
                    tracing::info!(server = %name, ?outcome, "auto-start connect");
                }
                Err(err) => {
                    tracing::warn!(server = %name, error = %err, "auto-start connect failed");
                }
            }
        }
    }

    async fn connection(&self, name: &str) -> Result<Arc<Connection>> {
        let state = self.state.lock().await;
        state
            .connections
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotConnected(name.to_string()))
    }

    async fn live_connections(&self) -> Vec<(ServerName, Arc<Connection>)> {
        let state = self.state.lock().await;
        state
            .connections
            .iter()
            .map(|(name, connection)| (name.clone(), Arc::clone(connection)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt};

    fn spec(name: &str) -> ServerSpec {
        ServerSpec::new(ServerName::parse(name).unwrap(), "true")
            .with_description(format!("{name} test server"))
    }

    /// Fake MCP server over a duplex pipe. Responds to every request: echoes
    /// `initialize`, serves `tools/list`/`resources/list` from fixed data, or
    /// fails everything after `fail_after_handshake`.
    fn fake_server(
        tools: Value,
        fail_after_handshake: bool,
    ) -> (
        tokio::io::ReadHalf<tokio::io::DuplexStream>,
        tokio::io::WriteHalf<tokio::io::DuplexStream>,
    ) {
        let (client_stream, server_stream) = tokio::io::duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client_stream);
        let (server_read, mut server_write) = tokio::io::split(server_stream);

        tokio::spawn(async move {
            let mut lines = tokio::io::BufReader::new(server_read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let msg: Value = serde_json::from_str(&line).expect("valid json");
                let Some(id) = msg.get("id").cloned() else {
                    continue;
                };
                let method = msg["method"].as_str().unwrap_or_default();
                let response = if method == "initialize" {
                    json!({ "jsonrpc": "2.0", "id": id, "result": {
                        "protocolVersion": "2024-11-05",
                        "capabilities": { "tools": {} },
                    }})
                } else if fail_after_handshake {
                    // Hang up mid-conversation: transport failure for the
                    // caller.
                    break;
                } else {
                    match method {
                        "tools/list" => {
                            json!({ "jsonrpc": "2.0", "id": id, "result": { "tools": tools }})
                        }
                        "resources/list" => {
                            json!({ "jsonrpc": "2.0", "id": id, "result": { "resources": [] }})
                        }
                        "shutdown" => json!({ "jsonrpc": "2.0", "id": id, "result": {} }),
                        other => json!({ "jsonrpc": "2.0", "id": id, "error": {
                            "code": -32601, "message": format!("method not found: {other}"),
                        }}),
                    }
                };
                let mut out = serde_json::to_string(&response).unwrap();
                out.push('\n');
                if server_write.write_all(out.as_bytes()).await.is_err() {
                    break;
                }
                let _ = server_write.flush().await;
            }
        });

        (client_read, client_write)
    }

    #[tokio::test]
    async fn register_overwrites_existing_spec() {
        let manager = Manager::empty();
        manager.register_server(spec("srv")).await;
        manager
            .register_server(spec("srv").with_description("second registration"))
            .await;

        let status = manager.status().await;
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].description, "second registration");
        assert!(!status[0].connected);
    }

    #[tokio::test]
    async fn connect_unknown_server_fails() {
        let manager = Manager::empty();
        let err = manager
            .connect_server("ghost", None)
            .await
            .expect_err("unknown spec");
        assert!(matches!(err, Error::UnknownServer(name) if name == "ghost"));
    }

    #[tokio::test]
    async fn connect_io_requires_registered_spec() {
        let manager = Manager::empty();
        let (read, write) = fake_server(json!([]), false);
        let err = manager
            .connect_io_server("ghost", read, write)
            .await
            .expect_err("unknown spec");
        assert!(matches!(err, Error::UnknownServer(_)));
    }

    #[tokio::test]
    async fn second_connect_returns_already_connected_sentinel() {
        let manager = Manager::empty();
        manager.register_server(spec("srv")).await;

        let (read, write) = fake_server(json!([]), false);
        let outcome = manager
            .connect_io_server("srv", read, write)
            .await
            .expect("first connect");
        assert_eq!(outcome, ConnectOutcome::Connected);

        let (read, write) = fake_server(json!([]), false);
        let outcome = manager
            .connect_io_server("srv", read, write)
            .await
            .expect("second connect");
        assert!(outcome.is_already_connected());
    }

    #[tokio::test]
    async fn call_tool_requires_connection() {
        let manager = Manager::empty();
        manager.register_server(spec("srv")).await;
        let err = manager
            .call_tool("srv", "echo", None)
            .await
            .expect_err("not connected");
        assert!(matches!(err, Error::NotConnected(name) if name == "srv"));
    }

    #[tokio::test]
    async fn disconnect_server_removes_name_and_second_call_errors() {
        let manager = Manager::empty();
        manager.register_server(spec("srv")).await;
        let (read, write) = fake_server(json!([]), false);
        manager
            .connect_io_server("srv", read, write)
            .await
            .expect("connect");

        manager.disconnect_server("srv").await.expect("disconnect");
        assert!(!manager.is_connected("srv").await);

        let err = manager
            .disconnect_server("srv")
            .await
            .expect_err("already removed");
        assert!(matches!(err, Error::NotConnected(_)));
    }

    #[tokio::test]
    async fn list_all_tools_substitutes_empty_list_for_failing_server() {
        let manager = Manager::empty();
        manager.register_server(spec("healthy")).await;
        manager.register_server(spec("broken")).await;

        let (read, write) = fake_server(json!([{ "name": "echo" }]), false);
        manager
            .connect_io_server("healthy", read, write)
            .await
            .expect("connect healthy");
        let (read, write) = fake_server(json!([]), true);
        manager
            .connect_io_server("broken", read, write)
            .await
            .expect("connect broken");

        let all = manager.list_all_tools().await;
        assert_eq!(all.len(), 2);
        assert_eq!(all["healthy"], json!([{ "name": "echo" }]));
        assert_eq!(all["broken"], json!([]));
    }

    #[tokio::test]
    async fn health_check_reports_degraded_when_a_probe_fails() {
        let manager = Manager::empty();
        manager.register_server(spec("healthy")).await;
        manager.register_server(spec("broken")).await;
        manager.register_server(spec("offline")).await;

        let (read, write) = fake_server(json!([{ "name": "echo" }]), false);
        manager
            .connect_io_server("healthy", read, write)
            .await
            .expect("connect healthy");
        let (read, write) = fake_server(json!([]), true);
        manager
            .connect_io_server("broken", read, write)
            .await
            .expect("connect broken");

        let report = manager.health_check().await;
        assert_eq!(report.status, HealthStatus::Degraded);
        assert_eq!(report.registered, 3);
        assert_eq!(report.connected, 2);

        let healthy = report
            .servers
            .iter()
            .find(|row| row.name == "healthy")
            .unwrap();
        assert_eq!(healthy.tools, Some(1));
        assert!(healthy.error.is_none());

        let broken = report
            .servers
            .iter()
            .find(|row| row.name == "broken")
            .unwrap();
        assert!(broken.error.is_some());

        let offline = report
            .servers
            .iter()
            .find(|row| row.name == "offline")
            .unwrap();
        assert!(!offline.connected);
        assert!(offline.tools.is_none());
    }

    #[tokio::test]
    async fn health_check_is_healthy_when_all_probes_pass() {
        let manager = Manager::empty();
        manager.register_server(spec("srv")).await;
        let (read, write) = fake_server(json!([]), false);
        manager
            .connect_io_server("srv", read, write)
            .await
            .expect("connect");

        let report = manager.health_check().await;
        assert_eq!(report.status, HealthStatus::Healthy);
        assert_eq!(report.connected, 1);
    }

    #[tokio::test]
    async fn disconnect_all_is_parallel_safe_and_idempotent() {
        let manager = Manager::empty();
        for name in ["a", "b", "c"] {
            manager.register_server(spec(name)).await;
            let (read, write) = fake_server(json!([]), false);
            manager
                .connect_io_server(name, read, write)
                .await
                .expect("connect");
        }

        tokio::time::timeout(Duration::from_secs(5), manager.disconnect_all())
            .await
            .expect("disconnect_all returns");
        for name in ["a", "b", "c"] {
            assert!(!manager.is_connected(name).await);
        }

        // Second call is a no-op.
        tokio::time::timeout(Duration::from_secs(1), manager.disconnect_all())
            .await
            .expect("second disconnect_all returns");
    }

    #[tokio::test]
    async fn peer_hangup_removes_connection_from_manager() {
        let manager = Manager::empty();
        manager.register_server(spec("srv")).await;

        let (client_stream, server_stream) = tokio::io::duplex(4096);
        let (client_read, client_write) = tokio::io::split(client_stream);
        let (server_read, mut server_write) = tokio::io::split(server_stream);

        let server = tokio::spawn(async move {
            let mut lines = tokio::io::BufReader::new(server_read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let msg: Value = serde_json::from_str(&line).unwrap();
                if msg["method"] == "initialize" {
                    let response = json!({ "jsonrpc": "2.0", "id": msg["id"], "result": {} });
                    let mut out = serde_json::to_string(&response).unwrap();
                    out.push('\n');
                    server_write.write_all(out.as_bytes()).await.unwrap();
                } else if msg.get("id").is_none() {
                    // notifications/initialized seen: handshake done, hang up.
                    break;
                }
            }
        });

        manager
            .connect_io_server("srv", client_read, client_write)
            .await
            .expect("connect");
        server.await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while manager.is_connected("srv").await {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("manager self-removes the dead connection");
    }

    #[tokio::test]
    async fn reconnect_after_disconnect_succeeds() {
        let manager = Manager::empty();
        manager.register_server(spec("srv")).await;

        let (read, write) = fake_server(json!([]), false);
        manager
            .connect_io_server("srv", read, write)
            .await
            .expect("first connect");
        manager.disconnect_server("srv").await.expect("disconnect");

        let (read, write) = fake_server(json!([{ "name": "again" }]), false);
        let outcome = manager
            .connect_io_server("srv", read, write)
            .await
            .expect("reconnect");
        assert_eq!(outcome, ConnectOutcome::Connected);

        let tools = manager.list_tools("srv").await.expect("tools/list");
        assert_eq!(tools["tools"][0]["name"], "again");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn initialize_default_servers_swallows_failures() {
        let manager = Manager::empty();
        manager
            .register_server(
                ServerSpec::new(
                    ServerName::parse("broken").unwrap(),
                    "definitely-not-a-real-command-9f2c",
                )
                .with_auto_start(true),
            )
            .await;

        // Must not error or panic; the failure is logged and swallowed.
        manager.initialize_default_servers().await;
        assert!(!manager.is_connected("broken").await);
    }

    #[tokio::test]
    async fn default_registry_is_present_and_not_auto_started() {
        let manager = Manager::new();
        let status = manager.status().await;
        assert!(
            status.iter().any(|row| row.name == "filesystem"),
            "filesystem spec missing from defaults"
        );
        assert!(status.iter().any(|row| row.name == "nodit"));
        assert!(status.iter().all(|row| !row.auto_start));
        assert!(status.iter().all(|row| !row.connected));
    }
}
