//! Error taxonomy for router operations.
//!
//! Each variant maps to one HTTP status on the REST surface and one MCP
//! error shape on the tool surface. Store and buffer failures are not part
//! of this taxonomy: they are logged where they occur and never surfaced.

use thiserror::Error;

/// Errors surfaced by admin operations and tool invocations.
#[derive(Debug, Error)]
pub enum RouterError {
    /// Missing required field, malformed URL, or name-regex violation.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An existing, differently-URLed server already holds the name.
    #[error("Name/URL conflict: '{name}' is already registered with URL {existing_url}")]
    NameUrlConflict { name: String, existing_url: String },

    /// Unregister/reconnect/ping of an unknown server name.
    #[error("server '{0}' not found")]
    ServerNotFound(String),

    /// Call against a known upstream that stayed down after one reconnect attempt.
    #[error("server '{0}' is disconnected")]
    ServerDisconnected(String),

    /// Error surfaced by the upstream MCP call.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// Credit-gate key validation failed.
    #[error("invalid API key")]
    InvalidApiKey,

    /// Quota check returned `allowed=false`.
    #[error("insufficient credits: {remaining_daily} daily / {remaining_monthly} monthly remaining")]
    InsufficientCredits {
        remaining_daily: i64,
        remaining_monthly: i64,
    },

    /// Any otherwise-unclassified failure.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl RouterError {
    /// HTTP status for the REST surface.
    pub fn http_status(&self) -> u16 {
        match self {
            RouterError::InvalidInput(_) => 400,
            RouterError::InvalidApiKey => 401,
            RouterError::InsufficientCredits { .. } => 402,
            RouterError::ServerNotFound(_) => 404,
            RouterError::NameUrlConflict { .. } => 409,
            RouterError::ServerDisconnected(_)
            | RouterError::Upstream(_)
            | RouterError::Internal(_) => 500,
        }
    }

    /// Stable machine-readable code used in REST bodies and audit rows.
    pub fn code(&self) -> &'static str {
        match self {
            RouterError::InvalidInput(_) => "invalid_input",
            RouterError::NameUrlConflict { .. } => "name_url_conflict",
            RouterError::ServerNotFound(_) => "server_not_found",
            RouterError::ServerDisconnected(_) => "server_disconnected",
            RouterError::Upstream(_) => "upstream_error",
            RouterError::InvalidApiKey => "invalid_api_key",
            RouterError::InsufficientCredits { .. } => "insufficient_credits",
            RouterError::Internal(_) => "internal_error",
        }
    }
}

/// Convenience alias for fallible router operations.
pub type RouterResult<T> = Result<T, RouterError>;
