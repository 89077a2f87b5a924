//! Tool-call audit rows, server events, and the analytics queries over them.
//!
//! Rows arrive in batches from the buffers (see `crate::buffers`); each
//! batch is written in a single transaction so a flush either lands whole
//! or not at all.

use super::{new_id, now_ms, Database};
use anyhow::{Context, Result};
use rusqlite::params;
use serde::{Deserialize, Serialize};

/// One audited tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRow {
    pub id: String,
    pub server_name: String,
    pub tool_name: String,
    pub arguments: Option<String>,
    pub response: Option<String>,
    pub duration_ms: i64,
    pub status: String,
    pub error_message: Option<String>,
    pub user_id: Option<String>,
    pub user_email: Option<String>,
    pub api_key_prefix: Option<String>,
    pub created_at: i64,
}

impl ToolCallRow {
    pub fn new(server_name: impl Into<String>, tool_name: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            server_name: server_name.into(),
            tool_name: tool_name.into(),
            arguments: None,
            response: None,
            duration_ms: 0,
            status: "success".to_string(),
            error_message: None,
            user_id: None,
            user_email: None,
            api_key_prefix: None,
            created_at: now_ms(),
        }
    }
}

/// One server lifecycle observation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEventRow {
    pub id: String,
    pub server_id: Option<String>,
    pub server_name: String,
    pub event_type: String,
    pub details: Option<serde_json::Value>,
    pub created_at: i64,
}

impl ServerEventRow {
    pub fn new(server_name: impl Into<String>, event_type: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            server_id: None,
            server_name: server_name.into(),
            event_type: event_type.into(),
            details: None,
            created_at: now_ms(),
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Aggregate counts over a look-back window.
#[derive(Debug, Clone, Serialize)]
pub struct CallTotals {
    pub total: i64,
    pub success: i64,
    pub error: i64,
}

/// Per-tool aggregate used by the analytics queries.
#[derive(Debug, Clone, Serialize)]
pub struct ToolAggregate {
    pub server_name: String,
    pub tool_name: String,
    pub calls: i64,
    pub avg_duration_ms: f64,
    pub error_rate: f64,
}

impl Database {
    /// Insert a batch of audit rows in one transaction.
    pub fn insert_tool_calls(&self, rows: &[ToolCallRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn()?;
        let tx = conn.transaction().context("failed to begin audit batch")?;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO tool_calls
                    (id, server_name, tool_name, arguments, response, duration_ms,
                     status, error_message, user_id, user_email, api_key_prefix, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                "#,
            )?;
            for row in rows {
                stmt.execute(params![
                    row.id,
                    row.server_name,
                    row.tool_name,
                    row.arguments,
                    row.response,
                    row.duration_ms,
                    row.status,
                    row.error_message,
                    row.user_id,
                    row.user_email,
                    row.api_key_prefix,
                    row.created_at,
                ])?;
            }
        }
        tx.commit().context("failed to commit audit batch")?;
        Ok(())
    }

    /// Insert a batch of server events in one transaction.
    pub fn insert_server_events(&self, rows: &[ServerEventRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn()?;
        let tx = conn.transaction().context("failed to begin event batch")?;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO server_events (id, server_id, server_name, event_type, details, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
            )?;
            for row in rows {
                stmt.execute(params![
                    row.id,
                    row.server_id,
                    row.server_name,
                    row.event_type,
                    row.details.as_ref().map(|d| d.to_string()),
                    row.created_at,
                ])?;
            }
        }
        tx.commit().context("failed to commit event batch")?;
        Ok(())
    }

    /// Total / success / error counts over the last `window_hours`.
    pub fn call_totals(&self, window_hours: i64) -> Result<CallTotals> {
        let cutoff = now_ms() - window_hours * 3_600_000;
        let conn = self.conn()?;
        conn.query_row(
            r#"
            SELECT COUNT(*),
                   COALESCE(SUM(status = 'success'), 0),
                   COALESCE(SUM(status = 'error'), 0)
            FROM tool_calls WHERE created_at >= ?1
            "#,
            params![cutoff],
            |row| {
                Ok(CallTotals {
                    total: row.get(0)?,
                    success: row.get(1)?,
                    error: row.get(2)?,
                })
            },
        )
        .context("failed to query call totals")
    }

    /// Most-called tools over the window.
    pub fn most_used_tools(&self, window_hours: i64, limit: usize) -> Result<Vec<ToolAggregate>> {
        self.tool_aggregates(
            window_hours,
            limit,
            1,
            "calls DESC, server_name, tool_name",
        )
    }

    /// Slowest tools by average duration; only tools with at least 6 calls
    /// in the window are ranked.
    pub fn slowest_tools(&self, window_hours: i64, limit: usize) -> Result<Vec<ToolAggregate>> {
        self.tool_aggregates(
            window_hours,
            limit,
            6,
            "avg_duration_ms DESC, server_name, tool_name",
        )
    }

    /// Tools with the highest error rate; only tools with at least 11 calls
    /// in the window are ranked.
    pub fn error_prone_tools(&self, window_hours: i64, limit: usize) -> Result<Vec<ToolAggregate>> {
        self.tool_aggregates(
            window_hours,
            limit,
            11,
            "error_rate DESC, server_name, tool_name",
        )
    }

    fn tool_aggregates(
        &self,
        window_hours: i64,
        limit: usize,
        min_calls: i64,
        order_by: &str,
    ) -> Result<Vec<ToolAggregate>> {
        let cutoff = now_ms() - window_hours * 3_600_000;
        let conn = self.conn()?;
        let sql = format!(
            r#"
            SELECT server_name, tool_name,
                   COUNT(*) AS calls,
                   AVG(duration_ms) AS avg_duration_ms,
                   AVG(status = 'error') AS error_rate
            FROM tool_calls
            WHERE created_at >= ?1
            GROUP BY server_name, tool_name
            HAVING calls >= ?2
            ORDER BY {order_by}
            LIMIT ?3
            "#
        );
        let mut stmt = conn
            .prepare(&sql)
            .context("failed to prepare tool aggregate query")?;

        let aggregates = stmt
            .query(params![cutoff, min_calls, limit as i64])?
            .mapped(|row| {
                Ok(ToolAggregate {
                    server_name: row.get(0)?,
                    tool_name: row.get(1)?,
                    calls: row.get(2)?,
                    avg_duration_ms: row.get(3)?,
                    error_rate: row.get(4)?,
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .context("failed to query tool aggregates")?;

        Ok(aggregates)
    }
}
