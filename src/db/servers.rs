//! Server repository: CRUD over upstream server configs.
//!
//! Rows are soft-deleted so audit history keeps its join key; `upsert_server`
//! merges by name and resurrects a soft-deleted row in place, preserving its
//! id. Only `cleanup_deleted_servers` removes rows for good.

use super::{new_id, now_ms, Database};
use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

/// Configuration of one upstream MCP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub id: String,
    pub name: String,
    pub url: String,
    pub description: Option<String>,
    pub enabled: bool,
    pub auto_reconnect: bool,
    pub timeout_ms: u64,
    pub retry_attempts: u32,
    pub created_at: i64,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
}

impl ServerConfig {
    /// Create a new config with the standard defaults (enabled,
    /// auto-reconnect, 30 s timeout, 3 retries).
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        let now = now_ms();
        Self {
            id: new_id(),
            name: name.into(),
            url: url.into(),
            description: None,
            enabled: true,
            auto_reconnect: true,
            timeout_ms: 30_000,
            retry_attempts: 3,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }
}

fn config_from_row(row: &Row<'_>) -> rusqlite::Result<ServerConfig> {
    Ok(ServerConfig {
        id: row.get(0)?,
        name: row.get(1)?,
        url: row.get(2)?,
        description: row.get(3)?,
        enabled: row.get::<_, i64>(4)? != 0,
        auto_reconnect: row.get::<_, i64>(5)? != 0,
        timeout_ms: row.get::<_, i64>(6)? as u64,
        retry_attempts: row.get::<_, i64>(7)? as u32,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
        deleted_at: row.get(10)?,
    })
}

const SERVER_COLUMNS: &str = "id, name, url, description, enabled, auto_reconnect, \
     timeout_ms, retry_attempts, created_at, updated_at, deleted_at";

impl Database {
    /// Insert or update a server config, merging by name.
    ///
    /// A live row with the same name is updated in place; a soft-deleted row
    /// is resurrected (deleted_at cleared) keeping its id. Returns the stored
    /// row including the assigned id.
    pub fn upsert_server(&self, config: &ServerConfig) -> Result<ServerConfig> {
        let now = now_ms();
        let existing = self.find_server_row_by_name(&config.name, true)?;

        match existing {
            Some(row) => {
                let conn = self.conn()?;
                conn.execute(
                    r#"
                    UPDATE servers
                    SET url = ?2, description = ?3, enabled = ?4, auto_reconnect = ?5,
                        timeout_ms = ?6, retry_attempts = ?7, updated_at = ?8, deleted_at = NULL
                    WHERE id = ?1
                    "#,
                    params![
                        row.id,
                        config.url,
                        config.description,
                        config.enabled as i64,
                        config.auto_reconnect as i64,
                        config.timeout_ms as i64,
                        config.retry_attempts as i64,
                        now,
                    ],
                )
                .context("failed to update server")?;
                drop(conn);
                self.find_server_by_name(&config.name)?
                    .context("updated server row vanished")
            }
            None => {
                let id = new_id();
                let conn = self.conn()?;
                conn.execute(
                    r#"
                    INSERT INTO servers
                        (id, name, url, description, enabled, auto_reconnect,
                         timeout_ms, retry_attempts, created_at, updated_at, deleted_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, NULL)
                    "#,
                    params![
                        id,
                        config.name,
                        config.url,
                        config.description,
                        config.enabled as i64,
                        config.auto_reconnect as i64,
                        config.timeout_ms as i64,
                        config.retry_attempts as i64,
                        now,
                        now,
                    ],
                )
                .context("failed to insert server")?;
                drop(conn);
                self.find_server_by_name(&config.name)?
                    .context("inserted server row vanished")
            }
        }
    }

    /// Find a live (non-deleted) server by name.
    pub fn find_server_by_name(&self, name: &str) -> Result<Option<ServerConfig>> {
        self.find_server_row_by_name(name, false)
    }

    fn find_server_row_by_name(
        &self,
        name: &str,
        include_deleted: bool,
    ) -> Result<Option<ServerConfig>> {
        let conn = self.conn()?;
        let sql = if include_deleted {
            // Prefer the live row, then the most recently touched tombstone.
            format!(
                "SELECT {SERVER_COLUMNS} FROM servers WHERE name = ?1 \
                 ORDER BY (deleted_at IS NULL) DESC, updated_at DESC LIMIT 1"
            )
        } else {
            format!("SELECT {SERVER_COLUMNS} FROM servers WHERE name = ?1 AND deleted_at IS NULL")
        };
        let mut stmt = conn
            .prepare(&sql)
            .context("failed to prepare server query")?;

        let config = stmt
            .query_row(params![name], config_from_row)
            .optional()
            .context("failed to query server by name")?;

        Ok(config)
    }

    /// List live servers; disabled rows are excluded unless requested.
    pub fn find_all_servers(&self, include_disabled: bool) -> Result<Vec<ServerConfig>> {
        let conn = self.conn()?;
        let sql = if include_disabled {
            format!("SELECT {SERVER_COLUMNS} FROM servers WHERE deleted_at IS NULL ORDER BY name")
        } else {
            format!(
                "SELECT {SERVER_COLUMNS} FROM servers \
                 WHERE deleted_at IS NULL AND enabled = 1 ORDER BY name"
            )
        };
        let mut stmt = conn
            .prepare(&sql)
            .context("failed to prepare servers query")?;

        let servers = stmt
            .query([])?
            .mapped(config_from_row)
            .collect::<Result<Vec<_>, _>>()
            .context("failed to list servers")?;

        Ok(servers)
    }

    /// Toggle a live server's enabled flag. Returns false for unknown names.
    pub fn set_server_enabled(&self, name: &str, enabled: bool) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE servers SET enabled = ?2, updated_at = ?3 \
                 WHERE name = ?1 AND deleted_at IS NULL",
                params![name, enabled as i64, now_ms()],
            )
            .context("failed to set server enabled")?;
        Ok(changed > 0)
    }

    /// Soft-delete a server by id. Returns whether a row changed.
    pub fn soft_delete_server(&self, id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE servers SET deleted_at = ?2, updated_at = ?2 \
                 WHERE id = ?1 AND deleted_at IS NULL",
                params![id, now_ms()],
            )
            .context("failed to soft-delete server")?;
        Ok(changed > 0)
    }

    /// Hard-delete rows soft-deleted more than `days_old` days ago.
    ///
    /// The cutoff is computed here and bound as a plain integer.
    pub fn cleanup_deleted_servers(&self, days_old: i64) -> Result<usize> {
        let cutoff = now_ms() - days_old * 86_400_000;
        let conn = self.conn()?;
        let removed = conn
            .execute(
                "DELETE FROM servers WHERE deleted_at IS NOT NULL AND deleted_at < ?1",
                params![cutoff],
            )
            .context("failed to clean up deleted servers")?;
        Ok(removed)
    }
}
