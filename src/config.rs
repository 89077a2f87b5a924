//! Router configuration, loaded from environment variables.
//!
//! Every knob has a default so a bare `mcp-router` starts on port 4000 with
//! a local SQLite store and no credit enforcement.

use std::env;

/// Router configuration
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// HTTP listen port for the MCP endpoint and REST surface
    pub port: u16,
    /// Server name advertised to downstream MCP clients
    pub name: String,
    /// Server version advertised to downstream MCP clients
    pub version: String,
    /// Separator between server name and tool name in aggregated names
    pub separator: String,
    /// Whether bearer-token auth is enforced on the outer surface
    pub auth_enabled: bool,
    /// Base URL of the user-management (credits) service
    pub user_management_api: Option<String>,
    /// Admin key for the user-management service
    pub user_management_api_key: Option<String>,
    /// Path to the shared SQLite store
    pub database_url: String,
    /// Apply the schema on startup
    pub run_migrations: bool,
    /// Persist sync events / server events
    pub enable_event_log: bool,
    /// Persist tool-call audit rows
    pub enable_audit_log: bool,
    /// Record tool-call arguments in audit rows
    pub log_arguments: bool,
    /// Record tool-call responses in audit rows
    pub log_responses: bool,
    /// Health-check interval in milliseconds
    pub ping_interval_ms: u64,
    /// Consecutive ping failures before a server is marked disconnected
    pub max_ping_failures: u32,
    /// Stable instance identity; generated when unset
    pub instance_id: Option<String>,
    /// Sync event poll interval in milliseconds
    pub sync_poll_interval_ms: u64,
    /// Repository reconciliation interval in milliseconds
    pub sync_interval_ms: u64,
    /// Sync event cleanup interval in milliseconds
    pub sync_cleanup_interval_ms: u64,
    /// Sync event retention in hours
    pub sync_event_retention_hours: i64,
    /// Audit retention in days
    pub audit_retention_days: i64,
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env_str(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match env_str(key).as_deref() {
        Some("true") | Some("1") => true,
        Some("false") | Some("0") => false,
        _ => default,
    }
}

impl RouterConfig {
    /// Load configuration from the environment.
    pub fn from_env() -> Self {
        Self {
            port: env_parse("ROUTER_PORT", 4000),
            name: env_str("ROUTER_NAME").unwrap_or_else(|| "mcp-router".to_string()),
            version: env_str("ROUTER_VERSION")
                .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string()),
            separator: env_str("TOOL_NAME_SEPARATOR").unwrap_or_else(|| ":".to_string()),
            auth_enabled: env_bool("AUTH_ENABLED", false),
            user_management_api: env_str("USER_MANAGEMENT_API"),
            user_management_api_key: env_str("USER_MANAGEMENT_API_KEY"),
            database_url: env_str("DATABASE_URL").unwrap_or_else(|| "mcp-router.db".to_string()),
            run_migrations: env_bool("RUN_MIGRATIONS", true),
            enable_event_log: env_bool("ENABLE_EVENT_LOG", true),
            enable_audit_log: env_bool("ENABLE_AUDIT_LOG", false),
            log_arguments: env_bool("LOG_ARGUMENTS", true),
            log_responses: env_bool("LOG_RESPONSES", true),
            ping_interval_ms: env_parse("PING_INTERVAL_MS", 30_000),
            max_ping_failures: env_parse("MAX_PING_FAILURES", 3),
            instance_id: env_str("INSTANCE_ID"),
            sync_poll_interval_ms: env_parse("SYNC_POLL_INTERVAL_MS", 5_000),
            sync_interval_ms: env_parse("SYNC_INTERVAL_MS", 30_000),
            sync_cleanup_interval_ms: env_parse("SYNC_CLEANUP_INTERVAL_MS", 3_600_000),
            sync_event_retention_hours: env_parse("SYNC_EVENT_RETENTION_HOURS", 24),
            audit_retention_days: env_parse("AUDIT_RETENTION_DAYS", 30),
        }
    }

    /// Sanitized echo of the running config for `GET /config`.
    ///
    /// Secrets are reduced to a presence flag.
    pub fn sanitized(&self) -> serde_json::Value {
        serde_json::json!({
            "port": self.port,
            "name": self.name,
            "version": self.version,
            "separator": self.separator,
            "authEnabled": self.auth_enabled,
            "userManagementApi": self.user_management_api,
            "userManagementApiKeySet": self.user_management_api_key.is_some(),
            "databaseUrl": self.database_url,
            "enableEventLog": self.enable_event_log,
            "enableAuditLog": self.enable_audit_log,
            "pingIntervalMs": self.ping_interval_ms,
            "maxPingFailures": self.max_ping_failures,
            "syncPollIntervalMs": self.sync_poll_interval_ms,
            "syncIntervalMs": self.sync_interval_ms,
            "syncEventRetentionHours": self.sync_event_retention_hours,
            "auditRetentionDays": self.audit_retention_days,
        })
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            port: 4000,
            name: "mcp-router".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            separator: ":".to_string(),
            auth_enabled: false,
            user_management_api: None,
            user_management_api_key: None,
            database_url: "mcp-router.db".to_string(),
            run_migrations: true,
            enable_event_log: true,
            enable_audit_log: false,
            log_arguments: true,
            log_responses: true,
            ping_interval_ms: 30_000,
            max_ping_failures: 3,
            instance_id: None,
            sync_poll_interval_ms: 5_000,
            sync_interval_ms: 30_000,
            sync_cleanup_interval_ms: 3_600_000,
            sync_event_retention_hours: 24,
            audit_retention_days: 30,
        }
    }
}
