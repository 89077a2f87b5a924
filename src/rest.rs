//! REST surface and HTTP wiring.
//!
//! The admin routes (`/register`, `/health`, `/config`, `/stats`) sit next
//! to the MCP endpoint at `/mcp` on one listener. Non-MCP methods on `/mcp`
//! get the JSON-RPC flavored 405 body; `/stats` always permits CORS so
//! dashboards can poll it cross-origin.

use std::sync::Arc;

use axum::{
    extract::{Path, Request, State},
    http::{Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::context::identity_middleware;
use crate::error::RouterError;
use crate::mcp_server::mcp_service;
use crate::ops::{self, RegisterRequest};
use crate::state::SharedState;

fn error_response(error: &RouterError) -> Response {
    let status =
        StatusCode::from_u16(error.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        Json(json!({
            "success": false,
            "error": error.code(),
            "message": error.to_string(),
        })),
    )
        .into_response()
}

/// POST /register — register an upstream server.
async fn register_handler(
    State(state): State<Arc<SharedState>>,
    Json(request): Json<RegisterRequest>,
) -> Response {
    match ops::register_server(&state, request).await {
        Ok(result) => {
            let message = if result.status.connected {
                format!(
                    "Server '{}' registered with {} tools",
                    result.server.name, result.tools_registered
                )
            } else {
                format!(
                    "Server '{}' registered; connection pending ({})",
                    result.server.name,
                    result.status.last_error.as_deref().unwrap_or("unknown error")
                )
            };
            (
                StatusCode::OK,
                Json(json!({
                    "success": true,
                    "message": message,
                    "server": result.server,
                    "stats": ops::router_stats(&state).await,
                })),
            )
                .into_response()
        }
        Err(error) => error_response(&error),
    }
}

/// DELETE /register/{serverName} — unregister an upstream server.
async fn unregister_handler(
    State(state): State<Arc<SharedState>>,
    Path(server_name): Path<String>,
) -> Response {
    match ops::unregister_server(&state, &server_name).await {
        Ok(removed) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "message": format!("Server '{}' unregistered", server_name),
                "toolsRemoved": removed,
            })),
        )
            .into_response(),
        Err(error) => error_response(&error),
    }
}

/// GET /health — liveness plus store health and router stats.
async fn health_handler(State(state): State<Arc<SharedState>>) -> Response {
    let store = match state.db.health_check() {
        Ok(latency_ms) => json!({ "connected": true, "latencyMs": latency_ms }),
        Err(e) => json!({ "connected": false, "error": e.to_string() }),
    };
    Json(json!({
        "status": "ok",
        "name": state.config.name,
        "version": state.config.version,
        "instanceId": state.instance_id,
        "time": chrono::Utc::now().to_rfc3339(),
        "store": store,
        "stats": ops::router_stats(&state).await,
    }))
    .into_response()
}

/// GET /config — sanitized echo of the running configuration.
async fn config_handler(State(state): State<Arc<SharedState>>) -> Json<Value> {
    Json(state.config.sanitized())
}

/// GET /stats — fan out stats calls to all upstreams that expose one.
async fn stats_handler(State(state): State<Arc<SharedState>>) -> Json<Value> {
    Json(ops::aggregate_stats(&state).await)
}

/// Reject non-MCP methods on `/mcp` with the JSON-RPC 405 body.
async fn mcp_method_guard(request: Request, next: Next) -> Response {
    let method = request.method();
    if method == Method::POST || method == Method::GET || method == Method::DELETE {
        next.run(request).await
    } else {
        (
            StatusCode::METHOD_NOT_ALLOWED,
            Json(json!({
                "jsonrpc": "2.0",
                "error": { "code": -32000, "message": "Method not allowed." },
                "id": null,
            })),
        )
            .into_response()
    }
}

/// Build the full HTTP router: REST admin surface plus the MCP endpoint.
pub fn build_router(state: Arc<SharedState>) -> Router {
    let stats_routes = Router::new()
        .route("/stats", get(stats_handler))
        .layer(CorsLayer::permissive());

    let mcp_routes = Router::new()
        .nest_service("/mcp", mcp_service(state.clone()))
        .layer(axum::middleware::from_fn(mcp_method_guard))
        .layer(axum::middleware::from_fn(identity_middleware));

    Router::new()
        .route("/register", post(register_handler))
        .route("/register/{serverName}", delete(unregister_handler))
        .route("/health", get(health_handler))
        .route("/config", get(config_handler))
        .merge(stats_routes)
        .merge(mcp_routes)
        .with_state(state)
}

/// Bind and serve until `shutdown` resolves.
pub async fn serve(
    state: Arc<SharedState>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", state.config.port)).await?;
    info!(port = state.config.port, "router listening");
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
