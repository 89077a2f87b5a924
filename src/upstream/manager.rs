//! Upstream connection manager.
//!
//! Owns every live MCP client connection: opens transports, discovers and
//! namespaces tool catalogs, routes namespaced calls back to the owning
//! upstream, and feeds the health loop. All state lives in one map keyed by
//! server name; a per-name mutex serializes concurrent connects for the
//! same name while leaving unrelated servers free to proceed.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use rmcp::{
    model::{CallToolRequestParam, CallToolResult, JsonObject, Tool},
    service::{RunningService, ServiceExt},
    transport::StreamableHttpClientTransport,
    RoleClient,
};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::events::{RouterEvent, RouterEventSender};
use crate::buffers::{AuditBuffer, EventBuffer};
use crate::config::RouterConfig;
use crate::db::audit::{ServerEventRow, ToolCallRow};
use crate::db::servers::ServerConfig;
use crate::db::{now_ms, Database};
use crate::error::{RouterError, RouterResult};

/// Type alias for the running MCP client service.
pub type McpService = RunningService<RoleClient, ()>;

/// Original tool names consumed internally and filtered from the catalog.
const CONTROL_TOOLS: [&str; 2] = ["stats", "quote"];

/// Deadline for health-loop probes, independent of the caller timeout.
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Minimum spacing between health-loop reconnect attempts per server.
const RECONNECT_SPACING_MS: i64 = 60_000;

/// Reconnect failures are logged at warn only every Nth attempt.
const RECONNECT_LOG_EVERY: u32 = 20;

/// A downstream-visible tool re-exported from an upstream server.
#[derive(Debug, Clone)]
pub struct AggregatedTool {
    /// Namespaced name: `{server}{separator}{original}`.
    pub name: String,
    /// The upstream that owns the tool.
    pub server_name: String,
    /// The upstream's own name for the tool.
    pub original_name: String,
    /// Upstream description, prefixed with `[server]`.
    pub description: String,
    /// Raw JSON Schema for the tool input.
    pub input_schema: Arc<JsonObject>,
}

/// Snapshot of one connection's status.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub name: String,
    pub url: String,
    pub connected: bool,
    pub last_connected: Option<i64>,
    pub last_error: Option<String>,
    pub tools_count: usize,
    pub last_ping_time: Option<i64>,
    pub consecutive_ping_failures: u32,
    pub reconnect_attempts: u32,
}

/// In-memory state for one upstream server.
struct Connection {
    config: ServerConfig,
    service: Option<Arc<McpService>>,
    connected: bool,
    last_connected: Option<i64>,
    last_error: Option<String>,
    /// Whether last_error came from a failed health probe.
    ping_failure_error: bool,
    tools: Vec<AggregatedTool>,
    /// Control tools ('stats', 'quote') the upstream exposes; never in `tools`.
    control_tools: HashSet<String>,
    last_ping_time: Option<i64>,
    consecutive_ping_failures: u32,
    reconnect_attempts: u32,
    last_reconnect_attempt: Option<i64>,
}

impl Connection {
    fn status(&self, name: &str) -> ServerStatus {
        ServerStatus {
            name: name.to_string(),
            url: self.config.url.clone(),
            connected: self.connected,
            last_connected: self.last_connected,
            last_error: self.last_error.clone(),
            tools_count: self.tools.len(),
            last_ping_time: self.last_ping_time,
            consecutive_ping_failures: self.consecutive_ping_failures,
            reconnect_attempts: self.reconnect_attempts,
        }
    }
}

struct HealthTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Connection manager for upstream MCP servers.
pub struct ConnectionManager {
    connections: RwLock<HashMap<String, Connection>>,
    /// Per-name locks so two connects for one name serialize.
    connect_locks: std::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    separator: String,
    ping_interval: Duration,
    max_ping_failures: u32,
    db: Option<Arc<Database>>,
    events: RouterEventSender,
    event_buffer: Arc<EventBuffer>,
    audit: Arc<AuditBuffer>,
    health: std::sync::Mutex<Option<HealthTask>>,
}

impl ConnectionManager {
    pub fn new(
        config: &RouterConfig,
        db: Option<Arc<Database>>,
        event_buffer: Arc<EventBuffer>,
        audit: Arc<AuditBuffer>,
    ) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            connect_locks: std::sync::Mutex::new(HashMap::new()),
            separator: config.separator.clone(),
            ping_interval: Duration::from_millis(config.ping_interval_ms),
            max_ping_failures: config.max_ping_failures,
            db,
            events: RouterEventSender::default(),
            event_buffer,
            audit,
            health: std::sync::Mutex::new(None),
        }
    }

    /// The configured aggregated-name separator.
    pub fn separator(&self) -> &str {
        &self.separator
    }

    /// Subscribe to connection lifecycle events.
    pub fn subscribe(&self) -> super::events::RouterEventReceiver {
        self.events.subscribe()
    }

    fn lock_for(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.connect_locks.lock().expect("connect lock map poisoned");
        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Connect to an upstream server and discover its tools.
    ///
    /// Upserts the config through the repository when one is attached, so
    /// the returned status reflects the stored row. A failed connect is not
    /// an error: the server is recorded disconnected with `last_error` set
    /// and the health loop retries it.
    pub async fn connect(self: &Arc<Self>, config: ServerConfig) -> Result<ServerStatus> {
        let lock = self.lock_for(&config.name);
        let _guard = lock.lock().await;

        let config = match &self.db {
            Some(db) => db.upsert_server(&config)?,
            None => config,
        };
        let name = config.name.clone();

        // Disabled servers are stored but never connected.
        if !config.enabled {
            debug!(server = %name, "server disabled; not connecting");
            self.close_service(&name).await;
            self.connections.write().await.remove(&name);
            return Ok(ServerStatus {
                name,
                url: config.url,
                connected: false,
                last_connected: None,
                last_error: None,
                tools_count: 0,
                last_ping_time: None,
                consecutive_ping_failures: 0,
                reconnect_attempts: 0,
            });
        }

        // Already connected to the same URL: nothing to do.
        {
            let connections = self.connections.read().await;
            if let Some(conn) = connections.get(&name) {
                if conn.connected && conn.config.url == config.url {
                    debug!(server = %name, "already connected with same url");
                    return Ok(conn.status(&name));
                }
            }
        }

        // Close any previous transport before replacing the entry.
        self.close_service(&name).await;

        self.events.send(RouterEvent::Connecting {
            name: name.clone(),
            url: config.url.clone(),
        });
        info!(server = %name, url = %config.url, "connecting to upstream");

        let status = match open_service(&config.url, config.timeout_ms).await {
            Ok(service) => {
                let service = Arc::new(service);
                let (tools, control_tools, discovery_error) =
                    self.discover(&name, &service, config.timeout_ms).await;
                let tool_count = tools.len();

                let conn = Connection {
                    config: config.clone(),
                    service: Some(service),
                    connected: true,
                    last_connected: Some(now_ms()),
                    last_error: discovery_error,
                    ping_failure_error: false,
                    tools,
                    control_tools,
                    last_ping_time: None,
                    consecutive_ping_failures: 0,
                    reconnect_attempts: 0,
                    last_reconnect_attempt: None,
                };
                let status = conn.status(&name);
                self.connections.write().await.insert(name.clone(), conn);

                info!(server = %name, tool_count, "upstream connected");
                self.events.send(RouterEvent::Connected {
                    name: name.clone(),
                    url: config.url.clone(),
                    tool_count,
                });
                self.event_buffer
                    .record(
                        ServerEventRow::new(&name, "connected").with_details(serde_json::json!({
                            "url": config.url,
                            "tools": tool_count,
                        })),
                    )
                    .await;
                status
            }
            Err(e) => {
                let error = e.to_string();
                warn!(server = %name, error = %error, "upstream connect failed");

                let conn = Connection {
                    config: config.clone(),
                    service: None,
                    connected: false,
                    last_connected: None,
                    last_error: Some(error.clone()),
                    ping_failure_error: false,
                    tools: Vec::new(),
                    control_tools: HashSet::new(),
                    last_ping_time: None,
                    consecutive_ping_failures: 0,
                    reconnect_attempts: 0,
                    last_reconnect_attempt: Some(now_ms()),
                };
                let status = conn.status(&name);
                self.connections.write().await.insert(name.clone(), conn);

                self.events.send(RouterEvent::ConnectionError {
                    name: name.clone(),
                    error: error.clone(),
                });
                self.event_buffer
                    .record(
                        ServerEventRow::new(&name, "error")
                            .with_details(serde_json::json!({ "error": error })),
                    )
                    .await;
                status
            }
        };

        self.ensure_health_loop();
        Ok(status)
    }

    /// Disconnect and forget a server. Missing names are a no-op.
    ///
    /// The repository row is disabled so reconciliation on peer instances
    /// does not resurrect the connection.
    pub async fn disconnect(&self, name: &str) -> Result<bool> {
        let removed = {
            let mut connections = self.connections.write().await;
            connections.remove(name)
        };

        let Some(conn) = removed else {
            return Ok(false);
        };

        if let Some(service) = conn.service {
            service.cancellation_token().cancel();
        }

        if let Some(db) = &self.db {
            db.set_server_enabled(name, false)?;
        }

        info!(server = %name, "upstream disconnected");
        self.events.send(RouterEvent::Disconnected {
            name: name.to_string(),
            reason: "disconnect requested".to_string(),
        });
        self.event_buffer
            .record(ServerEventRow::new(name, "disconnected"))
            .await;

        Ok(true)
    }

    /// Close and re-open a server's connection using its stored config.
    pub async fn reconnect(self: &Arc<Self>, name: &str) -> RouterResult<ServerStatus> {
        let (config, prior_attempts) = {
            let connections = self.connections.read().await;
            match connections.get(name) {
                Some(conn) => (Some(conn.config.clone()), conn.reconnect_attempts),
                None => (None, 0),
            }
        };

        let config = match config {
            Some(config) => config,
            None => match &self.db {
                Some(db) => db
                    .find_server_by_name(name)
                    .map_err(RouterError::Internal)?
                    .ok_or_else(|| RouterError::ServerNotFound(name.to_string()))?,
                None => return Err(RouterError::ServerNotFound(name.to_string())),
            },
        };

        self.close_service(name).await;
        self.connections.write().await.remove(name);

        let status = self.connect(config).await.map_err(RouterError::Internal)?;

        // Carry the failure counter across the replaced entry.
        if !status.connected {
            let mut connections = self.connections.write().await;
            if let Some(conn) = connections.get_mut(name) {
                conn.reconnect_attempts = prior_attempts.saturating_add(1);
                conn.last_reconnect_attempt = Some(now_ms());
                return Ok(conn.status(name));
            }
        }
        Ok(status)
    }

    /// Re-discover and replace a connected server's tool list. Idempotent.
    pub async fn build_tools(&self, name: &str) -> RouterResult<usize> {
        let (service, timeout_ms) = {
            let connections = self.connections.read().await;
            let conn = connections
                .get(name)
                .ok_or_else(|| RouterError::ServerNotFound(name.to_string()))?;
            let service = conn
                .service
                .clone()
                .ok_or_else(|| RouterError::ServerDisconnected(name.to_string()))?;
            (service, conn.config.timeout_ms)
        };

        let (tools, control_tools, discovery_error) =
            self.discover(name, &service, timeout_ms).await;
        let tool_count = tools.len();

        {
            let mut connections = self.connections.write().await;
            if let Some(conn) = connections.get_mut(name) {
                conn.tools = tools;
                conn.control_tools = control_tools;
                if let Some(error) = discovery_error {
                    conn.last_error = Some(error);
                    conn.ping_failure_error = false;
                }
            }
        }

        self.events.send(RouterEvent::ToolsLoaded {
            name: name.to_string(),
            tool_count,
        });
        self.event_buffer
            .record(
                ServerEventRow::new(name, "tool_loaded")
                    .with_details(serde_json::json!({ "tools": tool_count })),
            )
            .await;

        Ok(tool_count)
    }

    /// Stop the health loop and close every transport.
    pub async fn disconnect_all(&self) {
        self.stop_health_loop();

        let drained: Vec<(String, Connection)> = {
            let mut connections = self.connections.write().await;
            connections.drain().collect()
        };

        for (name, conn) in drained {
            if let Some(service) = conn.service {
                service.cancellation_token().cancel();
            }
            debug!(server = %name, "closed upstream transport");
        }
    }

    /// List tools and remember which control tools the upstream exposes.
    ///
    /// A failed discovery leaves the connection connected with an empty
    /// tool list and the error recorded, per the failure contract.
    async fn discover(
        &self,
        name: &str,
        service: &Arc<McpService>,
        timeout_ms: u64,
    ) -> (Vec<AggregatedTool>, HashSet<String>, Option<String>) {
        let listed = tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            service.list_tools(Default::default()),
        )
        .await;

        match listed {
            Ok(Ok(result)) => {
                let (tools, control) = aggregate_tools(name, &self.separator, result.tools);
                (tools, control, None)
            }
            Ok(Err(e)) => {
                let error = format!("failed to list tools: {}", e);
                warn!(server = %name, error = %error, "tool discovery failed");
                (Vec::new(), HashSet::new(), Some(error))
            }
            Err(_) => {
                let error = "failed to list tools: timed out".to_string();
                warn!(server = %name, "tool discovery timed out");
                (Vec::new(), HashSet::new(), Some(error))
            }
        }
    }

    async fn close_service(&self, name: &str) {
        let service = {
            let connections = self.connections.read().await;
            connections.get(name).and_then(|c| c.service.clone())
        };
        if let Some(service) = service {
            service.cancellation_token().cancel();
        }
    }

    // ========================================================================
    // Data plane
    // ========================================================================

    /// Forward a namespaced tool call to the owning upstream.
    ///
    /// Splits at the first separator occurrence. A server unknown to memory
    /// but enabled in the repository is lazily connected; a known but
    /// disconnected server gets exactly one reconnect attempt. Every return
    /// path leaves an audit row.
    pub async fn call_tool(
        self: &Arc<Self>,
        namespaced: &str,
        args: serde_json::Value,
    ) -> RouterResult<CallToolResult> {
        let Some((server, original)) = self.split_tool_name(namespaced) else {
            let err = RouterError::InvalidInput(format!("unknown tool '{}'", namespaced));
            self.audit_call("unknown", namespaced, &args, None, 0, Some(err.to_string()))
                .await;
            return Err(err);
        };
        let server = server.to_string();
        let original = original.to_string();

        let service = match self.resolve_service(&server).await {
            Ok(service) => service,
            Err(e) => {
                self.audit_call(&server, &original, &args, None, 0, Some(e.to_string()))
                    .await;
                return Err(e);
            }
        };

        let timeout_ms = self.timeout_for(&server).await;
        let start = std::time::Instant::now();
        let outcome = tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            service.call_tool(CallToolRequestParam {
                name: original.clone().into(),
                arguments: args.as_object().cloned(),
            }),
        )
        .await;
        let duration_ms = start.elapsed().as_millis() as i64;

        match outcome {
            Ok(Ok(result)) => {
                self.audit_call(&server, &original, &args, Some(&result), duration_ms, None)
                    .await;
                Ok(result)
            }
            Ok(Err(e)) => {
                let error = format!("tool call failed: {}", e);
                self.audit_call(&server, &original, &args, None, duration_ms, Some(error.clone()))
                    .await;
                Err(RouterError::Upstream(error))
            }
            Err(_) => {
                let error = format!("tool call timed out after {}ms", timeout_ms);
                self.audit_call(&server, &original, &args, None, duration_ms, Some(error.clone()))
                    .await;
                Err(RouterError::Upstream(error))
            }
        }
    }

    /// Invoke a control tool (`stats` or `quote`) by its original name.
    ///
    /// Control tools are filtered from the aggregated catalog; this is
    /// their only route in.
    pub async fn call_control_tool(
        self: &Arc<Self>,
        server: &str,
        tool: &str,
        args: serde_json::Value,
    ) -> RouterResult<serde_json::Value> {
        let service = self.resolve_service(server).await?;
        let timeout_ms = self.timeout_for(server).await;

        let result = tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            service.call_tool(CallToolRequestParam {
                name: tool.to_string().into(),
                arguments: args.as_object().cloned(),
            }),
        )
        .await
        .map_err(|_| RouterError::Upstream(format!("{} call timed out", tool)))?
        .map_err(|e| RouterError::Upstream(format!("{} call failed: {}", tool, e)))?;

        if result.is_error.unwrap_or(false) {
            return Err(RouterError::Upstream(format!(
                "{} returned an error: {}",
                tool,
                first_text(&result).unwrap_or_default()
            )));
        }

        let text = first_text(&result)
            .ok_or_else(|| RouterError::Upstream(format!("{} returned no content", tool)))?;
        Ok(serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text)))
    }

    /// Aggregated stats call for one server (the `/stats` fan-out).
    pub async fn call_stats_tool(self: &Arc<Self>, server: &str) -> RouterResult<serde_json::Value> {
        self.call_control_tool(server, "stats", serde_json::json!({}))
            .await
    }

    /// Find a live service for `server`, lazily connecting or retrying once.
    async fn resolve_service(self: &Arc<Self>, server: &str) -> RouterResult<Arc<McpService>> {
        let known = {
            let connections = self.connections.read().await;
            connections
                .get(server)
                .map(|conn| (conn.connected, conn.service.clone()))
        };

        match known {
            Some((true, Some(service))) => Ok(service),
            Some(_) => {
                // Known but down: one reconnect attempt before giving up.
                let status = self.reconnect(server).await?;
                if !status.connected {
                    return Err(RouterError::ServerDisconnected(server.to_string()));
                }
                let connections = self.connections.read().await;
                connections
                    .get(server)
                    .and_then(|c| c.service.clone())
                    .ok_or_else(|| RouterError::ServerDisconnected(server.to_string()))
            }
            None => {
                // Unknown to memory: connect lazily when the repository has
                // an enabled row for it.
                let config = match &self.db {
                    Some(db) => db
                        .find_server_by_name(server)
                        .map_err(RouterError::Internal)?
                        .filter(|c| c.enabled),
                    None => None,
                };
                let config =
                    config.ok_or_else(|| RouterError::ServerNotFound(server.to_string()))?;
                let status = self.connect(config).await.map_err(RouterError::Internal)?;
                if !status.connected {
                    return Err(RouterError::ServerDisconnected(server.to_string()));
                }
                let connections = self.connections.read().await;
                connections
                    .get(server)
                    .and_then(|c| c.service.clone())
                    .ok_or_else(|| RouterError::ServerDisconnected(server.to_string()))
            }
        }
    }

    async fn timeout_for(&self, server: &str) -> u64 {
        let connections = self.connections.read().await;
        connections
            .get(server)
            .map(|c| c.config.timeout_ms)
            .unwrap_or(30_000)
    }

    async fn audit_call(
        &self,
        server: &str,
        tool: &str,
        args: &serde_json::Value,
        result: Option<&CallToolResult>,
        duration_ms: i64,
        error: Option<String>,
    ) {
        let mut row = ToolCallRow::new(server, tool);
        row.arguments = Some(args.to_string());
        row.duration_ms = duration_ms;
        match (result, error) {
            (Some(result), _) => {
                let is_error = result.is_error.unwrap_or(false);
                row.status = if is_error { "error" } else { "success" }.to_string();
                row.response = first_text(result);
                if is_error {
                    row.error_message = first_text(result);
                }
            }
            (None, Some(error)) => {
                row.status = "error".to_string();
                row.error_message = Some(error);
            }
            (None, None) => row.status = "error".to_string(),
        }
        self.audit.record(row).await;
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Split an aggregated name at the first separator occurrence.
    pub fn split_tool_name<'a>(&self, full: &'a str) -> Option<(&'a str, &'a str)> {
        let idx = full.find(&self.separator)?;
        let (server, rest) = full.split_at(idx);
        let original = &rest[self.separator.len()..];
        if server.is_empty() || original.is_empty() {
            return None;
        }
        Some((server, original))
    }

    /// Status snapshot for every known server, exactly one entry per name.
    pub async fn get_server_statuses(&self) -> Vec<ServerStatus> {
        let connections = self.connections.read().await;
        let mut statuses: Vec<ServerStatus> = connections
            .iter()
            .map(|(name, conn)| conn.status(name))
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    pub async fn get_status(&self, name: &str) -> Option<ServerStatus> {
        let connections = self.connections.read().await;
        connections.get(name).map(|conn| conn.status(name))
    }

    pub async fn is_connected(&self, name: &str) -> bool {
        let connections = self.connections.read().await;
        connections.get(name).map(|c| c.connected).unwrap_or(false)
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Aggregated tools across all connected servers.
    pub async fn get_all_tools(&self) -> Vec<AggregatedTool> {
        let connections = self.connections.read().await;
        let mut tools: Vec<AggregatedTool> = connections
            .values()
            .filter(|conn| conn.connected)
            .flat_map(|conn| conn.tools.iter().cloned())
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// Aggregated tools for one server (empty when unknown or down).
    pub async fn tools_for(&self, name: &str) -> Vec<AggregatedTool> {
        let connections = self.connections.read().await;
        connections
            .get(name)
            .filter(|conn| conn.connected)
            .map(|conn| conn.tools.clone())
            .unwrap_or_default()
    }

    /// Whether `server` re-exports `original` (control tools excluded).
    pub async fn has_tool(&self, server: &str, original: &str) -> bool {
        let connections = self.connections.read().await;
        connections
            .get(server)
            .map(|conn| conn.tools.iter().any(|t| t.original_name == original))
            .unwrap_or(false)
    }

    /// Whether the upstream exposes a `quote` control tool.
    pub async fn has_quote_tool(&self, server: &str) -> bool {
        let connections = self.connections.read().await;
        connections
            .get(server)
            .map(|conn| conn.control_tools.contains("quote"))
            .unwrap_or(false)
    }

    /// Connected servers exposing a `stats` control tool.
    pub async fn servers_with_stats_tool(&self) -> Vec<String> {
        let connections = self.connections.read().await;
        let mut servers: Vec<String> = connections
            .iter()
            .filter(|(_, conn)| conn.connected && conn.control_tools.contains("stats"))
            .map(|(name, _)| name.clone())
            .collect();
        servers.sort();
        servers
    }

    // ========================================================================
    // Health loop
    // ========================================================================

    /// Run one health pass over every connection.
    ///
    /// Exposed so tests can drive the loop deterministically; the spawned
    /// loop just calls this on the configured interval.
    pub async fn health_tick(self: &Arc<Self>) {
        let names: Vec<String> = {
            let connections = self.connections.read().await;
            connections.keys().cloned().collect()
        };

        for name in names {
            let snapshot = {
                let connections = self.connections.read().await;
                connections.get(&name).map(|conn| {
                    (
                        conn.connected,
                        conn.config.auto_reconnect,
                        conn.last_reconnect_attempt,
                        conn.service.clone(),
                    )
                })
            };
            let Some((connected, auto_reconnect, last_attempt, service)) = snapshot else {
                continue;
            };

            if connected {
                if let Some(service) = service {
                    self.probe(&name, &service, auto_reconnect).await;
                }
            } else if auto_reconnect {
                let due = last_attempt
                    .map(|t| now_ms() - t >= RECONNECT_SPACING_MS)
                    .unwrap_or(true);
                if due {
                    self.try_auto_reconnect(&name).await;
                }
            }
        }
    }

    /// Probe one server on demand, applying the same bookkeeping as the
    /// health loop (failure counters, trip-to-disconnected).
    pub async fn ping(self: &Arc<Self>, name: &str) -> RouterResult<()> {
        let (service, auto_reconnect) = {
            let connections = self.connections.read().await;
            let conn = connections
                .get(name)
                .ok_or_else(|| RouterError::ServerNotFound(name.to_string()))?;
            let service = conn
                .service
                .clone()
                .ok_or_else(|| RouterError::ServerDisconnected(name.to_string()))?;
            (service, conn.config.auto_reconnect)
        };

        self.probe(name, &service, auto_reconnect).await;

        let connections = self.connections.read().await;
        match connections.get(name) {
            Some(conn) if conn.connected && conn.consecutive_ping_failures == 0 => Ok(()),
            Some(conn) => Err(RouterError::Upstream(
                conn.last_error
                    .clone()
                    .unwrap_or_else(|| "ping failed".to_string()),
            )),
            None => Err(RouterError::ServerNotFound(name.to_string())),
        }
    }

    /// Issue one liveness probe and apply the consecutive-failure policy.
    ///
    /// rmcp's client peer has no dedicated ping, so the probe is a minimal
    /// tools/list under its own deadline; the listing itself is discarded.
    async fn probe(self: &Arc<Self>, name: &str, service: &Arc<McpService>, auto_reconnect: bool) {
        let ok = tokio::time::timeout(PROBE_TIMEOUT, service.list_tools(Default::default()))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false);

        self.events.send(RouterEvent::HealthCheck {
            name: name.to_string(),
            healthy: ok,
        });

        if ok {
            let mut connections = self.connections.write().await;
            if let Some(conn) = connections.get_mut(name) {
                conn.last_ping_time = Some(now_ms());
                conn.consecutive_ping_failures = 0;
                if conn.ping_failure_error {
                    conn.last_error = None;
                    conn.ping_failure_error = false;
                }
            }
            return;
        }

        let tripped = {
            let mut connections = self.connections.write().await;
            match connections.get_mut(name) {
                Some(conn) => {
                    conn.consecutive_ping_failures += 1;
                    conn.last_ping_time = Some(now_ms());
                    let failures = conn.consecutive_ping_failures;
                    warn!(server = %name, failures, "health probe failed");
                    if failures >= self.max_ping_failures {
                        conn.connected = false;
                        conn.tools.clear();
                        conn.control_tools.clear();
                        conn.last_error =
                            Some(format!("{} consecutive ping failures", failures));
                        conn.ping_failure_error = true;
                        if let Some(service) = conn.service.take() {
                            service.cancellation_token().cancel();
                        }
                        true
                    } else {
                        conn.last_error = Some(format!("ping failed ({} consecutive)", failures));
                        conn.ping_failure_error = true;
                        false
                    }
                }
                None => false,
            }
        };

        if tripped {
            self.events.send(RouterEvent::Disconnected {
                name: name.to_string(),
                reason: "consecutive ping failures".to_string(),
            });
            self.event_buffer
                .record(
                    ServerEventRow::new(name, "disconnected").with_details(serde_json::json!({
                        "reason": "consecutive ping failures",
                    })),
                )
                .await;

            if auto_reconnect {
                self.try_auto_reconnect(name).await;
            }
        } else {
            self.event_buffer
                .record(
                    ServerEventRow::new(name, "health_check")
                        .with_details(serde_json::json!({ "healthy": false })),
                )
                .await;
        }
    }

    async fn try_auto_reconnect(self: &Arc<Self>, name: &str) {
        match self.reconnect(name).await {
            Ok(status) if status.connected => {
                info!(server = %name, "auto-reconnect succeeded");
            }
            Ok(status) => {
                let attempts = status.reconnect_attempts;
                if attempts % RECONNECT_LOG_EVERY == 0 {
                    warn!(server = %name, attempts, "auto-reconnect still failing");
                } else {
                    debug!(server = %name, attempts, "auto-reconnect failed");
                }
            }
            Err(e) => debug!(server = %name, error = %e, "auto-reconnect error"),
        }
    }

    fn ensure_health_loop(self: &Arc<Self>) {
        let mut health = self.health.lock().expect("health lock poisoned");
        if health.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let manager = self.clone();
        let interval = self.ping_interval;
        let loop_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it so a fresh
            // connection is not probed at once.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => manager.health_tick().await,
                    _ = loop_cancel.cancelled() => break,
                }
            }
        });

        *health = Some(HealthTask { cancel, handle });
        debug!("health loop started");
    }

    fn stop_health_loop(&self) {
        let task = self.health.lock().expect("health lock poisoned").take();
        if let Some(task) = task {
            task.cancel.cancel();
            task.handle.abort();
            debug!("health loop stopped");
        }
    }
}

/// Attempt to open a streamable HTTP transport and initialize the session.
async fn open_service(url: &str, timeout_ms: u64) -> Result<McpService> {
    let transport = StreamableHttpClientTransport::from_uri(url);
    let service = tokio::time::timeout(Duration::from_millis(timeout_ms), ().serve(transport))
        .await
        .map_err(|_| anyhow!("connection to {} timed out", url))?
        .map_err(|e| anyhow!("failed to connect: {:?}", e))?;
    Ok(service)
}

/// Namespace an upstream catalog, filtering control tools out.
fn aggregate_tools(
    server: &str,
    separator: &str,
    tools: Vec<Tool>,
) -> (Vec<AggregatedTool>, HashSet<String>) {
    let mut aggregated = Vec::new();
    let mut control = HashSet::new();

    for tool in tools {
        let original = tool.name.to_string();
        if CONTROL_TOOLS.contains(&original.as_str()) {
            control.insert(original);
            continue;
        }
        let description = match tool.description.as_deref() {
            Some(desc) if !desc.is_empty() => format!("[{}] {}", server, desc),
            _ => format!("[{}]", server),
        };
        aggregated.push(AggregatedTool {
            name: format!("{}{}{}", server, separator, original),
            server_name: server.to_string(),
            original_name: original,
            description,
            input_schema: tool.input_schema.clone(),
        });
    }

    (aggregated, control)
}

/// First text content item of a tool result.
pub fn first_text(result: &CallToolResult) -> Option<String> {
    result
        .content
        .iter()
        .filter_map(|c| c.as_text().map(|t| t.text.to_string()))
        .next()
}
