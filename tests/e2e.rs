//! End-to-end integration tests for mcp-router
//!
//! Spins real MCP upstreams in-process over streamable HTTP (rmcp macro
//! servers) plus a mock user-management service, and drives the router
//! through registration, aggregation, filtering, credit gating, health
//! transitions, and cross-instance sync.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::Result;
use axum::{routing::post, Json};
use rmcp::{
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::{CallToolRequestParam, ServerCapabilities, ServerInfo},
    schemars,
    service::ServiceExt,
    tool, tool_handler, tool_router,
    transport::streamable_http_server::{
        session::local::LocalSessionManager, StreamableHttpService,
    },
    ServerHandler,
};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

use mcp_router::config::RouterConfig;
use mcp_router::context::{with_identity, RequestIdentity};
use mcp_router::db::servers::ServerConfig;
use mcp_router::db::Database;
use mcp_router::ops::{self, RegisterRequest};
use mcp_router::rest;
use mcp_router::state::SharedState;
use mcp_router::sync;

// ============================================================================
// Test MCP upstream
// ============================================================================

/// Parameters for add/sub
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
struct PairParams {
    #[schemars(description = "First number")]
    a: i64,
    #[schemars(description = "Second number")]
    b: i64,
}

/// Parameters for quote
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
struct QuoteParams {
    #[schemars(description = "Tool that would be called")]
    tool_name: String,
    #[schemars(description = "Arguments the tool would receive")]
    #[allow(dead_code)]
    tool_args: Option<Value>,
}

/// Upstream exposing plain tools plus the stats/quote control tools.
#[derive(Clone)]
struct CalcServer {
    add_calls: Arc<AtomicU32>,
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl CalcServer {
    fn new() -> Self {
        Self {
            add_calls: Arc::new(AtomicU32::new(0)),
            tool_router: Self::tool_router(),
        }
    }

    #[tool(description = "Adds two numbers together")]
    async fn add(&self, Parameters(params): Parameters<PairParams>) -> String {
        self.add_calls.fetch_add(1, Ordering::SeqCst);
        json!({
            "sum": params.a + params.b,
            "models_metrics": {
                "m": { "input_tokens": 100, "output_tokens": 20 }
            }
        })
        .to_string()
    }

    #[tool(description = "Subtracts b from a")]
    async fn sub(&self, Parameters(params): Parameters<PairParams>) -> String {
        format!("{}", params.a - params.b)
    }

    #[tool(description = "Usage statistics for this server")]
    async fn stats(&self) -> String {
        json!({ "calls": self.add_calls.load(Ordering::SeqCst) }).to_string()
    }

    #[tool(description = "Price a prospective call")]
    async fn quote(&self, Parameters(params): Parameters<QuoteParams>) -> String {
        json!({
            "success": true,
            "estimated_cost": {
                "model_id": "m",
                "input_tokens": 1000,
                "output_tokens": 500,
            },
            "tool": params.tool_name,
        })
        .to_string()
    }
}

#[tool_handler]
impl ServerHandler for CalcServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some("Test upstream with add, sub, stats, quote".into()),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}

/// Start a test upstream on a random port; returns url, call counter, and
/// the serve handle (abort it to simulate the upstream dying).
async fn start_upstream() -> Result<(String, Arc<AtomicU32>, tokio::task::JoinHandle<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    let url = format!("http://127.0.0.1:{}/mcp", port);

    let server = CalcServer::new();
    let add_calls = server.add_calls.clone();
    let service = StreamableHttpService::new(
        move || Ok(server.clone()),
        LocalSessionManager::default().into(),
        Default::default(),
    );
    let router = axum::Router::new().nest_service("/mcp", service);

    let handle = tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    Ok((url, add_calls, handle))
}

// ============================================================================
// Mock user-management service
// ============================================================================

#[derive(Clone)]
struct UserManagementMock {
    allowed: bool,
    remaining_daily: i64,
    remaining_monthly: i64,
    quota_calls: Arc<Mutex<Vec<Value>>>,
    track_calls: Arc<Mutex<Vec<Value>>>,
}

impl UserManagementMock {
    fn new(allowed: bool, remaining_daily: i64, remaining_monthly: i64) -> Self {
        Self {
            allowed,
            remaining_daily,
            remaining_monthly,
            quota_calls: Arc::new(Mutex::new(Vec::new())),
            track_calls: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

/// Start the mock on a random port; returns its base URL.
async fn start_user_management(mock: UserManagementMock) -> Result<String> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();

    let quota_mock = mock.clone();
    let track_mock = mock.clone();
    let router = axum::Router::new()
        .route(
            "/usage/quota",
            post(move |Json(body): Json<Value>| {
                let mock = quota_mock.clone();
                async move {
                    mock.quota_calls.lock().await.push(body);
                    Json(json!({
                        "allowed": mock.allowed,
                        "remainingDaily": mock.remaining_daily,
                        "remainingMonthly": mock.remaining_monthly,
                    }))
                }
            }),
        )
        .route(
            "/usage/track",
            post(move |Json(body): Json<Value>| {
                let mock = track_mock.clone();
                async move {
                    mock.track_calls.lock().await.push(body);
                    Json(json!({ "ok": true }))
                }
            }),
        )
        .route(
            "/keys/validate",
            post(|Json(body): Json<Value>| async move {
                let valid = body["apiKey"].as_str() == Some("sk-valid");
                Json(json!({ "valid": valid }))
            }),
        );

    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    Ok(format!("http://127.0.0.1:{}", port))
}

// ============================================================================
// Test helpers
// ============================================================================

fn test_config() -> RouterConfig {
    RouterConfig {
        enable_audit_log: true,
        ..Default::default()
    }
}

fn test_state_with(config: RouterConfig) -> Arc<SharedState> {
    let db = Arc::new(Database::in_memory().unwrap());
    SharedState::new(config, db).unwrap()
}

fn test_state() -> Arc<SharedState> {
    test_state_with(test_config())
}

fn keyed_identity() -> RequestIdentity {
    RequestIdentity {
        api_key: Some("sk-valid".to_string()),
        user_id: Some("u1".to_string()),
        user_email: Some("u1@example.com".to_string()),
        request_id: "req-1".to_string(),
    }
}

async fn register(state: &Arc<SharedState>, name: &str, url: &str) -> ops::RegisterResult {
    ops::register_server(
        state,
        RegisterRequest {
            name: name.to_string(),
            url: url.to_string(),
            description: None,
            enabled: true,
            auto_reconnect: true,
        },
    )
    .await
    .expect("registration should succeed")
}

// ============================================================================
// Aggregation and filtering
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_register_then_list() -> Result<()> {
    let (url, _, _upstream) = start_upstream().await?;
    let state = test_state();

    let result = register(&state, "calc", &url).await;
    assert!(result.status.connected);

    let tools = state.registry.list_tools().await;
    let names: Vec<String> = tools.iter().map(|t| t.name.to_string()).collect();
    assert!(names.contains(&"calc:add".to_string()));
    assert!(names.contains(&"calc:sub".to_string()));
    assert!(!names.contains(&"calc:stats".to_string()));
    assert!(!names.contains(&"calc:quote".to_string()));

    let add = tools.iter().find(|t| t.name == "calc:add").unwrap();
    assert!(add
        .description
        .as_deref()
        .unwrap_or_default()
        .starts_with("[calc]"));

    // Control queries see filtered names only.
    assert!(state.manager.has_tool("calc", "add").await);
    assert!(!state.manager.has_tool("calc", "quote").await);
    assert!(!state.manager.has_tool("calc", "stats").await);
    // But the quote tool is still reachable for the credit gate.
    assert!(state.manager.has_quote_tool("calc").await);

    // Re-discovery is idempotent.
    assert_eq!(state.manager.build_tools("calc").await?, 2);

    state.manager.disconnect_all().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_namespace_filter_and_stats_fanout() -> Result<()> {
    let (url, _, _upstream) = start_upstream().await?;
    let state = test_state();
    register(&state, "x", &url).await;

    // stats and quote are invocable only through their dedicated paths.
    assert!(state.registry.dispatch("x:stats", json!({})).await.is_none());
    assert!(state.registry.dispatch("x:quote", json!({})).await.is_none());

    assert_eq!(state.manager.servers_with_stats_tool().await, vec!["x"]);
    let merged = ops::aggregate_stats(&state).await;
    assert_eq!(merged["x"]["calls"], 0);

    state.manager.disconnect_all().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_register_conflict_rejected() -> Result<()> {
    let (url, _, _upstream) = start_upstream().await?;
    let state = test_state();
    register(&state, "a", &url).await;

    let err = ops::register_server(
        &state,
        RegisterRequest {
            name: "a".to_string(),
            url: "http://127.0.0.1:1/mcp".to_string(),
            description: None,
            enabled: true,
            auto_reconnect: true,
        },
    )
    .await
    .unwrap_err();

    let message = err.to_string();
    assert!(message.contains("Name/URL conflict"));
    assert!(message.contains(&url));

    state.manager.disconnect_all().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unregister_then_reregister_round_trip() -> Result<()> {
    let (url, _, _upstream) = start_upstream().await?;
    let state = test_state();

    let first = register(&state, "calc", &url).await;

    let removed = ops::unregister_server(&state, "calc").await?;
    assert!(removed.contains(&"calc:add".to_string()));
    assert!(state.registry.is_empty().await);
    assert!(state.manager.get_status("calc").await.is_none());
    assert!(state.db.find_server_by_name("calc")?.is_none());

    // Soft-delete then upsert preserves the row id.
    let second = register(&state, "calc", &url).await;
    assert_eq!(second.server.id, first.server.id);
    assert!(second.status.connected);
    assert!(state.registry.contains("calc:add").await);

    // Unregistering an unknown name is an error.
    assert!(ops::unregister_server(&state, "ghost").await.is_err());

    state.manager.disconnect_all().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_disabled_server_is_stored_but_not_connected() -> Result<()> {
    let (url, _, _upstream) = start_upstream().await?;
    let state = test_state();

    let result = ops::register_server(
        &state,
        RegisterRequest {
            name: "idle".to_string(),
            url: url.clone(),
            description: None,
            enabled: false,
            auto_reconnect: true,
        },
    )
    .await?;

    assert!(!result.status.connected);
    assert!(state.db.find_server_by_name("idle")?.is_some());
    assert!(state.manager.get_status("idle").await.is_none());
    assert!(state.registry.is_empty().await);

    state.manager.disconnect_all().await;
    Ok(())
}

// ============================================================================
// Forwarding, stripping, audit
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_forwarded_call_strips_metrics_and_audits() -> Result<()> {
    let (url, _, _upstream) = start_upstream().await?;
    let state = test_state();
    register(&state, "calc", &url).await;

    let result = state
        .registry
        .dispatch("calc:add", json!({"a": 17, "b": 25}))
        .await
        .expect("tool is registered")
        .expect("call succeeds");

    let text = result.content[0].as_text().unwrap().text.to_string();
    let payload: Value = serde_json::from_str(&text)?;
    assert_eq!(payload["sum"], 42);
    // Internal cost accounting never leaks downstream.
    assert!(payload.get("models_metrics").is_none());

    // The call was audited.
    state.audit.shutdown().await;
    let totals = state.db.call_totals(1)?;
    assert_eq!(totals.total, 1);
    assert_eq!(totals.success, 1);

    state.manager.disconnect_all().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failed_call_is_audited_as_error() -> Result<()> {
    let state = test_state();
    // Known to the repository but unreachable.
    let mut config = ServerConfig::new("down", "http://127.0.0.1:9/mcp");
    config.timeout_ms = 300;
    state.db.upsert_server(&config)?;

    let err = state
        .manager
        .call_tool("down:foo", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        mcp_router::error::RouterError::ServerDisconnected(_)
    ));

    state.audit.shutdown().await;
    let totals = state.db.call_totals(1)?;
    assert_eq!(totals.total, 1);
    assert_eq!(totals.error, 1);

    state.manager.disconnect_all().await;
    Ok(())
}

// ============================================================================
// Credit gate
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_credit_denial_blocks_forward_and_track() -> Result<()> {
    let (url, add_calls, _upstream) = start_upstream().await?;
    let mock = UserManagementMock::new(false, 0, 50);
    let um_url = start_user_management(mock.clone()).await?;

    let state = test_state_with(RouterConfig {
        user_management_api: Some(um_url),
        user_management_api_key: Some("admin".to_string()),
        enable_audit_log: true,
        ..Default::default()
    });
    register(&state, "calc", &url).await;

    let err = with_identity(keyed_identity(), async {
        state
            .registry
            .dispatch("calc:add", json!({"a": 1, "b": 2}))
            .await
            .unwrap()
            .unwrap_err()
    })
    .await;

    // Message carries both remaining values.
    let message = err.to_string();
    assert!(message.contains('0'));
    assert!(message.contains("50"));

    // Quota was consulted once; the tool itself never ran; nothing tracked.
    assert_eq!(mock.quota_calls.lock().await.len(), 1);
    assert_eq!(add_calls.load(Ordering::SeqCst), 0);
    assert!(mock.track_calls.lock().await.is_empty());

    state.manager.disconnect_all().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_credit_allowed_tracks_actuals() -> Result<()> {
    let (url, add_calls, _upstream) = start_upstream().await?;
    let mock = UserManagementMock::new(true, 9000, 90000);
    let um_url = start_user_management(mock.clone()).await?;

    let state = test_state_with(RouterConfig {
        user_management_api: Some(um_url),
        user_management_api_key: Some("admin".to_string()),
        ..Default::default()
    });
    register(&state, "calc", &url).await;

    let result = with_identity(keyed_identity(), async {
        state
            .registry
            .dispatch("calc:add", json!({"a": 2, "b": 3}))
            .await
            .unwrap()
            .unwrap()
    })
    .await;
    let text = result.content[0].as_text().unwrap().text.to_string();
    assert!(text.contains("\"sum\":5"));
    assert_eq!(add_calls.load(Ordering::SeqCst), 1);

    // Quota used the quoted estimate.
    let quota_calls = mock.quota_calls.lock().await;
    assert_eq!(quota_calls.len(), 1);
    assert_eq!(quota_calls[0]["inputTokens"], 1000);
    assert_eq!(quota_calls[0]["outputTokens"], 500);
    drop(quota_calls);

    // Tracking used the actuals from models_metrics and kept the quote in
    // metadata.
    let track_calls = mock.track_calls.lock().await;
    assert_eq!(track_calls.len(), 1);
    let track = &track_calls[0];
    assert_eq!(track["inputTokens"], 100);
    assert_eq!(track["outputTokens"], 20);
    assert_eq!(track["usage"], 120);
    assert_eq!(track["metadata"]["success"], true);
    assert_eq!(track["metadata"]["toolName"], "add");
    assert_eq!(track["metadata"]["quotedInputTokens"], 1000);
    assert_eq!(track["metadata"]["userId"], "u1");

    state.manager.disconnect_all().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_anonymous_caller_bypasses_credit_gate() -> Result<()> {
    let (url, add_calls, _upstream) = start_upstream().await?;
    let mock = UserManagementMock::new(false, 0, 0);
    let um_url = start_user_management(mock.clone()).await?;

    let state = test_state_with(RouterConfig {
        user_management_api: Some(um_url),
        user_management_api_key: Some("admin".to_string()),
        ..Default::default()
    });
    register(&state, "calc", &url).await;

    // No identity scope at all: forwarded directly, never priced.
    let result = state
        .registry
        .dispatch("calc:add", json!({"a": 1, "b": 1}))
        .await
        .unwrap()
        .unwrap();
    assert_ne!(result.is_error, Some(true));
    assert_eq!(add_calls.load(Ordering::SeqCst), 1);
    assert!(mock.quota_calls.lock().await.is_empty());
    assert!(mock.track_calls.lock().await.is_empty());

    state.manager.disconnect_all().await;
    Ok(())
}

// ============================================================================
// Health transitions
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_ping_failures_disconnect_and_clear_tools() -> Result<()> {
    let (url, _, upstream) = start_upstream().await?;
    let state = test_state_with(RouterConfig {
        max_ping_failures: 2,
        ..Default::default()
    });

    let mut config = ServerConfig::new("calc", &url);
    config.timeout_ms = 1_000;
    let status = state.manager.connect(config).await?;
    assert!(status.connected);
    assert_eq!(status.tools_count, 2);

    // A healthy server answers an on-demand ping.
    state.manager.ping("calc").await?;
    assert!(state.manager.ping("ghost").await.is_err());

    // Kill the upstream, then drive the health loop by hand.
    upstream.abort();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    state.manager.health_tick().await;
    let status = state.manager.get_status("calc").await.unwrap();
    assert!(status.connected, "one failure must not trip the breaker");
    assert_eq!(status.consecutive_ping_failures, 1);

    state.manager.health_tick().await;
    let status = state.manager.get_status("calc").await.unwrap();
    assert!(!status.connected);
    assert_eq!(status.tools_count, 0);
    assert!(status
        .last_error
        .as_deref()
        .unwrap_or_default()
        .contains("consecutive"));
    // The immediate auto-reconnect was attempted and failed.
    assert!(status.reconnect_attempts >= 1);

    state.manager.disconnect_all().await;
    Ok(())
}

// ============================================================================
// Cross-instance sync
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_cross_instance_sync() -> Result<()> {
    let (url, _, _upstream) = start_upstream().await?;

    // Two instances sharing one store file.
    let dir = tempfile::tempdir()?;
    let db_path = dir.path().join("shared.db");
    let db1 = Arc::new(Database::open(&db_path)?);
    let db2 = Arc::new(Database::open(&db_path)?);

    let state1 = SharedState::new(
        RouterConfig {
            instance_id: Some("i1".to_string()),
            ..Default::default()
        },
        db1,
    )?;
    let state2 = SharedState::new(
        RouterConfig {
            instance_id: Some("i2".to_string()),
            ..Default::default()
        },
        db2,
    )?;

    // Register on instance 1 only.
    register(&state1, "calc", &url).await;
    assert!(state2.manager.get_status("calc").await.is_none());

    // Instance 2 applies the event on its next poll.
    let applied = sync::poll_once(&state2).await?;
    assert_eq!(applied, 1);
    let status = state2.manager.get_status("calc").await.expect("synced");
    assert!(status.connected);
    assert!(state2.registry.contains("calc:add").await);
    assert!(!state2.registry.contains("calc:quote").await);

    // After the publisher self-acks, both instances are in processed_by.
    sync::poll_once(&state1).await?;
    let pending_1 = state1.db.fetch_unprocessed_sync_events("i1", 100)?;
    let pending_2 = state2.db.fetch_unprocessed_sync_events("i2", 100)?;
    assert!(pending_1.is_empty());
    assert!(pending_2.is_empty());

    // Applying the same poll again is a no-op (at-most-once).
    assert_eq!(sync::poll_once(&state2).await?, 0);

    // Unregister propagates the same way.
    ops::unregister_server(&state1, "calc").await?;
    sync::poll_once(&state2).await?;
    assert!(state2.manager.get_status("calc").await.is_none());
    assert!(!state2.registry.contains("calc:add").await);

    state1.manager.disconnect_all().await;
    state2.manager.disconnect_all().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_reconciliation_attaches_missing_servers() -> Result<()> {
    let (url, _, _upstream) = start_upstream().await?;

    let dir = tempfile::tempdir()?;
    let db_path = dir.path().join("shared.db");
    let db1 = Arc::new(Database::open(&db_path)?);
    let db2 = Arc::new(Database::open(&db_path)?);

    let state1 = SharedState::new(
        RouterConfig {
            instance_id: Some("i1".to_string()),
            // Event log off: reconciliation alone must converge.
            enable_event_log: false,
            ..Default::default()
        },
        db1,
    )?;
    let state2 = SharedState::new(
        RouterConfig {
            instance_id: Some("i2".to_string()),
            enable_event_log: false,
            ..Default::default()
        },
        db2,
    )?;

    register(&state1, "calc", &url).await;
    assert_eq!(sync::poll_once(&state2).await?, 0);
    assert!(state2.manager.get_status("calc").await.is_none());

    sync::reconcile_once(&state2).await?;
    assert!(state2.manager.is_connected("calc").await);
    assert!(state2.registry.contains("calc:add").await);

    state1.manager.disconnect_all().await;
    state2.manager.disconnect_all().await;
    Ok(())
}

// ============================================================================
// Full chain over HTTP: client -> router -> upstream
// ============================================================================

async fn serve_router(state: Arc<SharedState>) -> Result<String> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    let router = rest::build_router(state);
    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    Ok(format!("http://127.0.0.1:{}", port))
}

#[tokio::test(flavor = "multi_thread")]
async fn test_mcp_client_sees_aggregated_catalog() -> Result<()> {
    let (url, _, _upstream) = start_upstream().await?;
    let state = test_state();
    register(&state, "calc", &url).await;

    let base = serve_router(state.clone()).await?;
    let transport =
        rmcp::transport::StreamableHttpClientTransport::from_uri(format!("{}/mcp", base));
    let client = ().serve(transport).await?;

    let listed = client.list_tools(Default::default()).await?;
    let names: Vec<String> = listed.tools.iter().map(|t| t.name.to_string()).collect();
    assert!(names.contains(&"calc:add".to_string()));
    assert!(names.contains(&"router:list-servers".to_string()));
    assert!(!names.contains(&"calc:stats".to_string()));

    // Call an aggregated tool end to end.
    let result = client
        .call_tool(CallToolRequestParam {
            name: "calc:add".into(),
            arguments: json!({"a": 20, "b": 22}).as_object().cloned(),
        })
        .await?;
    let text = result.content[0].as_text().unwrap().text.to_string();
    assert!(text.contains("\"sum\":42"));
    assert!(!text.contains("models_metrics"));

    // Filtered control tools are not callable downstream.
    let missing = client
        .call_tool(CallToolRequestParam {
            name: "calc:stats".into(),
            arguments: None,
        })
        .await;
    assert!(missing.is_err(), "calc:stats must be unknown downstream");

    client.cancellation_token().cancel();
    state.manager.disconnect_all().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_rest_surface() -> Result<()> {
    let (url, _, _upstream) = start_upstream().await?;
    let state = test_state();
    let base = serve_router(state.clone()).await?;
    let http = reqwest::Client::new();

    // Register over HTTP.
    let response = http
        .post(format!("{}/register", base))
        .json(&json!({ "name": "calc", "url": url }))
        .send()
        .await?;
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await?;
    assert_eq!(body["success"], true);
    assert_eq!(body["stats"]["connectedServers"], 1);

    // Invalid name -> 400.
    let response = http
        .post(format!("{}/register", base))
        .json(&json!({ "name": "bad name", "url": url }))
        .send()
        .await?;
    assert_eq!(response.status(), 400);

    // Conflict -> 409.
    let response = http
        .post(format!("{}/register", base))
        .json(&json!({ "name": "calc", "url": "http://127.0.0.1:1/mcp" }))
        .send()
        .await?;
    assert_eq!(response.status(), 409);
    let body: Value = response.json().await?;
    assert!(body["message"].as_str().unwrap().contains("Name/URL conflict"));

    // Health and config.
    let health: Value = http
        .get(format!("{}/health", base))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(health["status"], "ok");
    assert_eq!(health["store"]["connected"], true);

    let config: Value = http
        .get(format!("{}/config", base))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(config["separator"], ":");

    // Stats fan-out with permissive CORS.
    let response = http
        .get(format!("{}/stats", base))
        .header("origin", "http://elsewhere.example")
        .send()
        .await?;
    assert_eq!(response.status(), 200);
    assert_eq!(
        response
            .headers()
            .get("access-control-allow-origin")
            .and_then(|v| v.to_str().ok()),
        Some("*")
    );
    let stats: Value = response.json().await?;
    assert!(stats.get("calc").is_some());

    // Unknown unregister -> 404.
    let response = http
        .delete(format!("{}/register/ghost", base))
        .send()
        .await?;
    assert_eq!(response.status(), 404);

    // Unregister -> 200.
    let response = http
        .delete(format!("{}/register/calc", base))
        .send()
        .await?;
    assert_eq!(response.status(), 200);

    // Non-MCP method on /mcp -> 405 with the JSON-RPC error body.
    let response = http.put(format!("{}/mcp", base)).send().await?;
    assert_eq!(response.status(), 405);
    let body: Value = response.json().await?;
    assert_eq!(body["error"]["code"], -32000);
    assert_eq!(body["error"]["message"], "Method not allowed.");
    assert_eq!(body["id"], Value::Null);

    state.manager.disconnect_all().await;
    Ok(())
}
