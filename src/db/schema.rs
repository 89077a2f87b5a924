//! Database schema definitions
//!
//! All CREATE TABLE statements for the router store. UUIDv7 TEXT primary
//! keys (time-sortable), INTEGER millisecond timestamps, JSON-in-TEXT for
//! structured columns (`sync_events.processed_by`, event details).

/// Schema version for migrations
pub const SCHEMA_VERSION: i32 = 3; // 3: api_key_prefix on tool_calls, processed_at on sync_events

/// Complete schema SQL
pub const SCHEMA: &str = r#"
--------------------------------------------------------------------------------
-- SERVERS
-- Upstream MCP server configs. Soft-deleted via deleted_at; the live name
-- space is enforced by a partial unique index so a deleted name can be reused.
--------------------------------------------------------------------------------

CREATE TABLE IF NOT EXISTS servers (
    id TEXT PRIMARY KEY,                    -- UUIDv7
    name TEXT NOT NULL,                     -- ^[A-Za-z0-9_-]+$
    url TEXT NOT NULL,                      -- absolute MCP endpoint URL
    description TEXT,
    enabled INTEGER NOT NULL DEFAULT 1,
    auto_reconnect INTEGER NOT NULL DEFAULT 1,
    timeout_ms INTEGER NOT NULL DEFAULT 30000,
    retry_attempts INTEGER NOT NULL DEFAULT 3,
    created_at INTEGER NOT NULL,            -- Unix timestamp ms
    updated_at INTEGER NOT NULL,
    deleted_at INTEGER                      -- NULL = live
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_servers_live_name
    ON servers(name) WHERE deleted_at IS NULL;

--------------------------------------------------------------------------------
-- SERVER EVENTS
-- Connection lifecycle observations, flushed in batches by the event buffer.
--------------------------------------------------------------------------------

CREATE TABLE IF NOT EXISTS server_events (
    id TEXT PRIMARY KEY,                    -- UUIDv7
    server_id TEXT,                         -- NULL when the server row is unknown
    server_name TEXT NOT NULL,
    event_type TEXT NOT NULL,               -- 'connected', 'disconnected', 'error',
                                            -- 'registered', 'unregistered',
                                            -- 'tool_loaded', 'health_check'
    details TEXT,                           -- JSON
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_server_events_name ON server_events(server_name);
CREATE INDEX IF NOT EXISTS idx_server_events_created ON server_events(created_at);

--------------------------------------------------------------------------------
-- TOOL CALLS
-- One audit row per forwarded call, success or error, flushed in batches.
--------------------------------------------------------------------------------

CREATE TABLE IF NOT EXISTS tool_calls (
    id TEXT PRIMARY KEY,                    -- UUIDv7
    server_name TEXT NOT NULL,
    tool_name TEXT NOT NULL,                -- original (un-namespaced) name
    arguments TEXT,                         -- JSON, NULL when log_arguments=false
    response TEXT,                          -- JSON/text, NULL when log_responses=false
    duration_ms INTEGER NOT NULL,
    status TEXT NOT NULL,                   -- 'success' or 'error'
    error_message TEXT,
    user_id TEXT,
    user_email TEXT,
    api_key_prefix TEXT,                    -- first 8 chars only
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tool_calls_created ON tool_calls(created_at);
CREATE INDEX IF NOT EXISTS idx_tool_calls_server_tool ON tool_calls(server_name, tool_name);

--------------------------------------------------------------------------------
-- SYNC EVENTS
-- Append-only cross-instance log. processed_by is a JSON array of instance
-- ids; an instance's poll anti-joins against it with json_each.
--------------------------------------------------------------------------------

CREATE TABLE IF NOT EXISTS sync_events (
    id TEXT PRIMARY KEY,                    -- UUIDv7
    event_type TEXT NOT NULL,               -- 'REGISTERED', 'UNREGISTERED', 'UPDATED',
                                            -- 'RECONNECTED', 'DISCONNECTED'
    event_data TEXT NOT NULL,               -- JSON payload, authoritative for handlers
    instance_id TEXT NOT NULL,              -- publisher
    created_at INTEGER NOT NULL,
    processed_by TEXT NOT NULL DEFAULT '[]',
    processed_at INTEGER                    -- stamped on first acknowledgement
);

CREATE INDEX IF NOT EXISTS idx_sync_events_created ON sync_events(created_at);
"#;
