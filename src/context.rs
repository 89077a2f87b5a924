//! Request-scoped caller identity.
//!
//! The downstream MCP transport gives tool handlers no place to thread the
//! caller's API key through, so identity rides a task-local scope installed
//! by HTTP middleware before the request enters the MCP service. Components
//! that need it (credit gate, audit buffer) read the current scope; code
//! running outside a request (health loop, sync engine) sees an anonymous
//! identity.

use axum::{extract::Request, middleware::Next, response::Response};
use tokio::task_local;

/// Identity attached to one client request.
#[derive(Debug, Clone, Default)]
pub struct RequestIdentity {
    /// Bearer token presented by the caller, if any.
    pub api_key: Option<String>,
    /// Resolved user id, when the outer auth layer supplies one.
    pub user_id: Option<String>,
    /// Resolved user email, when the outer auth layer supplies one.
    pub user_email: Option<String>,
    /// Correlation id for logs and audit rows.
    pub request_id: String,
}

impl RequestIdentity {
    /// First 8 characters of the API key, for audit rows.
    pub fn api_key_prefix(&self) -> Option<String> {
        self.api_key
            .as_ref()
            .map(|k| k.chars().take(8).collect::<String>())
    }
}

task_local! {
    static IDENTITY: RequestIdentity;
}

/// Read the identity of the current request, or an anonymous default when
/// called outside a request scope.
pub fn current_identity() -> RequestIdentity {
    IDENTITY
        .try_with(|id| id.clone())
        .unwrap_or_default()
}

/// Run `fut` with `identity` as the ambient request identity.
pub async fn with_identity<F, T>(identity: RequestIdentity, fut: F) -> T
where
    F: std::future::Future<Output = T>,
{
    IDENTITY.scope(identity, fut).await
}

/// Axum middleware: derive a [`RequestIdentity`] from request headers and
/// scope the rest of the pipeline under it.
pub async fn identity_middleware(request: Request, next: Next) -> Response {
    let identity = identity_from_headers(request.headers());
    with_identity(identity, next.run(request)).await
}

fn identity_from_headers(headers: &axum::http::HeaderMap) -> RequestIdentity {
    let api_key = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());

    let header_str = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string())
            .filter(|v| !v.is_empty())
    };

    RequestIdentity {
        api_key,
        user_id: header_str("x-user-id"),
        user_email: header_str("x-user-email"),
        request_id: header_str("x-request-id").unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
    }
}
