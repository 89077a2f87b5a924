//! Core admin operations shared by the REST surface and the router's
//! built-in control tools.
//!
//! Pure async functions that take state + args and return Result<T>.
//! No formatting - callers decide how to present results.

use std::sync::Arc;

use futures::future::join_all;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::credit::CreditGate;
use crate::db::audit::ServerEventRow;
use crate::db::servers::ServerConfig;
use crate::db::sync_events::SyncEventType;
use crate::error::{RouterError, RouterResult};
use crate::registry::{RegisterOutcome, ToolHandler};
use crate::state::SharedState;
use crate::upstream::{AggregatedTool, ServerStatus};

/// Body of `POST /register` and the `register-server` control tool.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
}

fn default_true() -> bool {
    true
}

/// Outcome of a registration, shaped for response bodies.
#[derive(Debug, Clone)]
pub struct RegisterResult {
    pub server: ServerConfig,
    pub status: ServerStatus,
    pub tools_registered: usize,
}

/// Validate and normalize a server name: trimmed, `^[A-Za-z0-9_-]+$`.
pub fn validate_server_name(name: &str) -> RouterResult<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(RouterError::InvalidInput("server name is required".into()));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(RouterError::InvalidInput(format!(
            "server name '{}' may only contain letters, numbers, dashes, and underscores",
            name
        )));
    }
    Ok(name.to_string())
}

/// Validate that a URL parses as an absolute http(s) URL.
pub fn validate_url(url: &str) -> RouterResult<String> {
    let url = url.trim();
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| RouterError::InvalidInput(format!("invalid url '{}': {}", url, e)))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(RouterError::InvalidInput(format!(
            "url '{}' must be http or https",
            url
        )));
    }
    Ok(url.to_string())
}

/// Build the forwarding handler for one aggregated tool.
///
/// Each invocation routes through the credit gate, which decides whether
/// to price the call before forwarding.
pub fn forwarding_handler(gate: Arc<CreditGate>, tool: &AggregatedTool) -> ToolHandler {
    let server = tool.server_name.clone();
    let original = tool.original_name.clone();
    Arc::new(move |args| {
        let gate = gate.clone();
        let server = server.clone();
        let original = original.clone();
        Box::pin(async move { gate.invoke(&server, &original, args).await })
    })
}

/// Pull a connected server's tools and sync them into the registry.
pub async fn register_tools(state: &SharedState, server: &str) -> RegisterOutcome {
    let tools = state.manager.tools_for(server).await;
    let gate = state.gate.clone();
    state
        .registry
        .register_tools_for(&tools, &|tool| forwarding_handler(gate.clone(), tool))
        .await
}

/// Connect a server and register its tools, without publishing.
///
/// The shared path behind boot-time restore, sync event handling, and
/// reconciliation.
pub async fn attach_server(state: &SharedState, config: ServerConfig) -> RouterResult<ServerStatus> {
    let status = state
        .manager
        .connect(config)
        .await
        .map_err(RouterError::Internal)?;
    if status.connected {
        register_tools(state, &status.name).await;
    }
    Ok(status)
}

/// Register a new upstream server: validate, connect, export tools, publish.
///
/// A connect failure is still a successful registration as long as the
/// repository accepted the row; the health loop retries the connection.
pub async fn register_server(
    state: &SharedState,
    request: RegisterRequest,
) -> RouterResult<RegisterResult> {
    let name = validate_server_name(&request.name)?;
    let url = validate_url(&request.url)?;

    let existing = state
        .db
        .find_server_by_name(&name)
        .map_err(RouterError::Internal)?;
    if let Some(existing) = &existing {
        if existing.url != url {
            return Err(RouterError::NameUrlConflict {
                name: name.clone(),
                existing_url: existing.url.clone(),
            });
        }
    }
    let is_update = existing.is_some();

    let mut config = ServerConfig::new(&name, &url);
    config.description = request.description;
    config.enabled = request.enabled;
    config.auto_reconnect = request.auto_reconnect;

    let status = attach_server(state, config).await?;

    let server = state
        .db
        .find_server_by_name(&name)
        .map_err(RouterError::Internal)?
        .ok_or_else(|| RouterError::Internal(anyhow::anyhow!("registered row vanished")))?;
    let tools_registered = status.tools_count;

    state
        .event_buffer
        .record(
            ServerEventRow::new(&name, "registered").with_details(json!({
                "url": url,
                "connected": status.connected,
            })),
        )
        .await;

    let event_type = if is_update {
        SyncEventType::Updated
    } else {
        SyncEventType::Registered
    };
    state.publish_sync(event_type, serde_json::to_value(&server).unwrap_or(Value::Null));

    info!(server = %name, connected = status.connected, tools = tools_registered, "server registered");
    Ok(RegisterResult {
        server,
        status,
        tools_registered,
    })
}

/// Remove a server: unexport tools, disconnect, soft-delete, publish.
pub async fn unregister_server(state: &SharedState, name: &str) -> RouterResult<Vec<String>> {
    let row = state
        .db
        .find_server_by_name(name)
        .map_err(RouterError::Internal)?;
    let known_in_memory = state.manager.get_status(name).await.is_some();
    if row.is_none() && !known_in_memory {
        return Err(RouterError::ServerNotFound(name.to_string()));
    }

    let removed = state.registry.unregister_tools_for(name).await;
    state
        .manager
        .disconnect(name)
        .await
        .map_err(RouterError::Internal)?;
    if let Some(row) = row {
        state
            .db
            .soft_delete_server(&row.id)
            .map_err(RouterError::Internal)?;
    }

    state
        .event_buffer
        .record(
            ServerEventRow::new(name, "unregistered")
                .with_details(json!({ "tools_removed": removed.len() })),
        )
        .await;
    state.publish_sync(SyncEventType::Unregistered, json!({ "name": name }));

    info!(server = %name, tools_removed = removed.len(), "server unregistered");
    Ok(removed)
}

/// Force a reconnect, refresh the exported tools, publish.
pub async fn reconnect_server(state: &SharedState, name: &str) -> RouterResult<ServerStatus> {
    let status = state.manager.reconnect(name).await?;
    if status.connected {
        register_tools(state, name).await;
    }
    state.publish_sync(SyncEventType::Reconnected, json!({ "name": name }));
    Ok(status)
}

/// Router-level stats for `/health` and register responses.
pub async fn router_stats(state: &SharedState) -> Value {
    let statuses = state.manager.get_server_statuses().await;
    let connected = statuses.iter().filter(|s| s.connected).count();
    let usage = state
        .db
        .call_totals(24)
        .map(|t| json!({ "total": t.total, "success": t.success, "error": t.error }))
        .unwrap_or(Value::Null);
    json!({
        "totalServers": statuses.len(),
        "connectedServers": connected,
        "totalTools": state.registry.len().await,
        "creditEnforcement": state.gate.enforcing(),
        "usage24h": usage,
    })
}

/// Fan `stats` calls out to every server exposing one and merge results.
///
/// A failing server contributes its error string instead of stats; one bad
/// upstream never hides the others.
pub async fn aggregate_stats(state: &SharedState) -> Value {
    let servers = state.manager.servers_with_stats_tool().await;
    let calls = servers.iter().map(|server| {
        let manager = state.manager.clone();
        let server = server.clone();
        async move {
            let result = manager.call_stats_tool(&server).await;
            (server, result)
        }
    });

    let mut merged = serde_json::Map::new();
    for (server, result) in join_all(calls).await {
        let value = match result {
            Ok(stats) => stats,
            Err(e) => json!({ "error": e.to_string() }),
        };
        merged.insert(server, value);
    }
    Value::Object(merged)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_server_name() {
        assert_eq!(validate_server_name(" calc ").unwrap(), "calc");
        assert_eq!(validate_server_name("a-b_C9").unwrap(), "a-b_C9");
        assert!(validate_server_name("").is_err());
        assert!(validate_server_name("has space").is_err());
        assert!(validate_server_name("has:colon").is_err());
        assert!(validate_server_name("ünïcode").is_err());
    }

    #[test]
    fn test_validate_url() {
        assert!(validate_url("http://localhost:8080/mcp").is_ok());
        assert!(validate_url("https://example.com/mcp").is_ok());
        assert!(validate_url("not a url").is_err());
        assert!(validate_url("ftp://example.com").is_err());
        assert!(validate_url("").is_err());
    }

    #[test]
    fn test_register_request_defaults() {
        let request: RegisterRequest =
            serde_json::from_value(json!({ "name": "calc", "url": "http://u:1/mcp" })).unwrap();
        assert!(request.enabled);
        assert!(request.auto_reconnect);
        assert!(request.description.is_none());
    }
}
