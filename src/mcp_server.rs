//! Downstream MCP server: the single endpoint clients talk to.
//!
//! Advertises the dynamic aggregated catalog plus the router's own control
//! tools, and dispatches namespaced calls through the registry (and thus
//! the credit gate). The catalog changes while serving, so `list_tools`
//! reads the registry on every request instead of a fixed definition list.

use std::sync::Arc;

use rmcp::{
    model::{
        CallToolRequestParam, CallToolResult, Content, Implementation, JsonObject,
        ListToolsResult, PaginatedRequestParam, ServerCapabilities, ServerInfo, Tool,
    },
    schemars,
    service::{RequestContext, RoleServer},
    transport::streamable_http_server::{
        session::local::LocalSessionManager, StreamableHttpService,
    },
    ErrorData as McpError, ServerHandler,
};
use serde_json::Value;
use tracing::debug;

use crate::error::RouterError;
use crate::ops::{self, RegisterRequest};
use crate::state::SharedState;

/// Helper to generate schema without the $schema field
pub fn generate_schema<T: schemars::JsonSchema>() -> Arc<JsonObject> {
    let root = rmcp::schemars::schema_for!(T);
    let mut value = serde_json::to_value(root).unwrap_or(Value::Null);
    if let Some(obj) = value.as_object_mut() {
        obj.remove("$schema");
        Arc::new(obj.clone())
    } else {
        Arc::new(JsonObject::new())
    }
}

/// Parameters for list-servers
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct ListServersParams {}

/// Parameters for list-tools
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct ListToolsParams {}

/// Parameters for register-server
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct RegisterServerParams {
    #[schemars(description = "Server name (letters, numbers, dashes, underscores)")]
    pub name: String,
    #[schemars(description = "Absolute URL of the upstream MCP endpoint")]
    pub url: String,
    #[schemars(description = "Optional description of the server")]
    pub description: Option<String>,
    #[schemars(description = "Connect the server (default true)")]
    pub enabled: Option<bool>,
    #[schemars(description = "Reconnect automatically when the connection drops (default true)")]
    pub auto_reconnect: Option<bool>,
}

/// Parameters for unregister-server / reconnect-server
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct ServerNameParams {
    #[schemars(description = "Name of a registered server")]
    pub name: String,
}

/// Parameters for stats
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct StatsParams {}

/// Control tool names, namespaced under `router{sep}`.
struct ControlNames {
    list_servers: String,
    list_tools: String,
    register_server: String,
    unregister_server: String,
    reconnect_server: String,
    stats: String,
}

impl ControlNames {
    fn new(separator: &str) -> Self {
        Self {
            list_servers: format!("router{}list-servers", separator),
            list_tools: format!("router{}list-tools", separator),
            register_server: format!("router{}register-server", separator),
            unregister_server: format!("router{}unregister-server", separator),
            reconnect_server: format!("router{}reconnect-server", separator),
            stats: format!("router{}stats", separator),
        }
    }
}

/// The router's downstream MCP server.
#[derive(Clone)]
pub struct RouterMcpServer {
    state: Arc<SharedState>,
}

impl RouterMcpServer {
    pub fn new(state: Arc<SharedState>) -> Self {
        Self { state }
    }

    fn control_names(&self) -> ControlNames {
        ControlNames::new(&self.state.config.separator)
    }

    fn control_tool_definitions(&self) -> Vec<Tool> {
        let names = self.control_names();
        vec![
            Tool::new(
                names.list_servers,
                "List registered upstream servers and their connection status",
                generate_schema::<ListServersParams>(),
            ),
            Tool::new(
                names.list_tools,
                "List all aggregated tools across connected servers",
                generate_schema::<ListToolsParams>(),
            ),
            Tool::new(
                names.register_server,
                "Register an upstream MCP server and export its tools",
                generate_schema::<RegisterServerParams>(),
            ),
            Tool::new(
                names.unregister_server,
                "Unregister an upstream server and remove its tools",
                generate_schema::<ServerNameParams>(),
            ),
            Tool::new(
                names.reconnect_server,
                "Force a reconnect to an upstream server",
                generate_schema::<ServerNameParams>(),
            ),
            Tool::new(
                names.stats,
                "Aggregate stats from every upstream exposing a stats tool",
                generate_schema::<StatsParams>(),
            ),
        ]
    }

    async fn list_servers(&self) -> Value {
        let statuses = self.state.manager.get_server_statuses().await;
        serde_json::to_value(statuses).unwrap_or(Value::Null)
    }

    async fn list_aggregated_tools(&self) -> Value {
        let tools = self.state.manager.get_all_tools().await;
        Value::Array(
            tools
                .into_iter()
                .map(|t| {
                    serde_json::json!({
                        "name": t.name,
                        "server": t.server_name,
                        "description": t.description,
                    })
                })
                .collect(),
        )
    }

    async fn register_server(&self, params: RegisterServerParams) -> Result<Value, RouterError> {
        let result = ops::register_server(
            &self.state,
            RegisterRequest {
                name: params.name,
                url: params.url,
                description: params.description,
                enabled: params.enabled.unwrap_or(true),
                auto_reconnect: params.auto_reconnect.unwrap_or(true),
            },
        )
        .await?;
        Ok(serde_json::json!({
            "success": true,
            "server": result.server.name,
            "connected": result.status.connected,
            "tools": result.tools_registered,
        }))
    }

    async fn unregister_server(&self, params: ServerNameParams) -> Result<Value, RouterError> {
        let removed = ops::unregister_server(&self.state, &params.name).await?;
        Ok(serde_json::json!({
            "success": true,
            "server": params.name,
            "toolsRemoved": removed,
        }))
    }

    async fn reconnect_server(&self, params: ServerNameParams) -> Result<Value, RouterError> {
        let status = ops::reconnect_server(&self.state, &params.name).await?;
        Ok(serde_json::json!({
            "success": true,
            "server": params.name,
            "connected": status.connected,
            "tools": status.tools_count,
        }))
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(
    arguments: Option<JsonObject>,
) -> Result<T, McpError> {
    let value = arguments.map(Value::Object).unwrap_or_else(|| {
        Value::Object(serde_json::Map::new())
    });
    serde_json::from_value(value).map_err(|e| McpError::invalid_params(e.to_string(), None))
}

fn json_result(value: Value) -> CallToolResult {
    let text = serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string());
    CallToolResult::success(vec![Content::text(text)])
}

fn error_result(error: &RouterError) -> CallToolResult {
    CallToolResult {
        content: vec![Content::text(format!("{}: {}", error.code(), error))],
        structured_content: None,
        is_error: Some(true),
        meta: None,
    }
}

impl ServerHandler for RouterMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "Aggregating MCP router. Tools are namespaced {server}{separator}{tool}; \
                 use the router:* control tools to register, inspect, and remove \
                 upstream servers."
                    .into(),
            ),
            capabilities: ServerCapabilities::builder()
                .enable_tools()
                .enable_tool_list_changed()
                .build(),
            server_info: Implementation {
                name: self.state.config.name.clone(),
                version: self.state.config.version.clone(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        let mut tools = self.control_tool_definitions();
        tools.extend(self.state.registry.list_tools().await);
        Ok(ListToolsResult {
            tools,
            next_cursor: None,
            meta: None,
        })
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let name = request.name.to_string();
        let names = self.control_names();
        debug!(tool = %name, "downstream tool call");

        let control_result = if name == names.list_servers {
            Some(Ok(self.list_servers().await))
        } else if name == names.list_tools {
            Some(Ok(self.list_aggregated_tools().await))
        } else if name == names.stats {
            Some(Ok(ops::aggregate_stats(&self.state).await))
        } else if name == names.register_server {
            let params = parse_params::<RegisterServerParams>(request.arguments.clone())?;
            Some(self.register_server(params).await)
        } else if name == names.unregister_server {
            let params = parse_params::<ServerNameParams>(request.arguments.clone())?;
            Some(self.unregister_server(params).await)
        } else if name == names.reconnect_server {
            let params = parse_params::<ServerNameParams>(request.arguments.clone())?;
            Some(self.reconnect_server(params).await)
        } else {
            None
        };

        if let Some(outcome) = control_result {
            return Ok(match outcome {
                Ok(value) => json_result(value),
                Err(error) => error_result(&error),
            });
        }

        // Everything else must be a registered aggregated tool. Control
        // tools of upstreams (stats, quote) are never registered, so they
        // are unreachable from here.
        let args = request
            .arguments
            .map(Value::Object)
            .unwrap_or_else(|| Value::Object(serde_json::Map::new()));

        match self.state.registry.dispatch(&name, args).await {
            Some(Ok(result)) => Ok(result),
            Some(Err(error)) => Ok(error_result(&error)),
            None => Err(McpError::invalid_params(
                format!("tool not found: {}", name),
                None,
            )),
        }
    }
}

/// Build the streamable HTTP service wrapping the router MCP server.
pub fn mcp_service(state: Arc<SharedState>) -> StreamableHttpService<RouterMcpServer> {
    StreamableHttpService::new(
        move || Ok(RouterMcpServer::new(state.clone())),
        LocalSessionManager::default().into(),
        Default::default(),
    )
}
