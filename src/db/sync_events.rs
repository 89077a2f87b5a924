//! Append-only sync event log.
//!
//! Each router instance publishes its successful admin operations here and
//! polls for events published by peers. `processed_by` holds the set of
//! instance ids that have applied an event; the poll query anti-joins
//! against it with `json_each` so every instance keeps its own cursor
//! without coordination.

use super::{new_id, now_ms, Database};
use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

/// Kinds of registry changes propagated between instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncEventType {
    Registered,
    Unregistered,
    Updated,
    Reconnected,
    Disconnected,
}

impl SyncEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncEventType::Registered => "REGISTERED",
            SyncEventType::Unregistered => "UNREGISTERED",
            SyncEventType::Updated => "UPDATED",
            SyncEventType::Reconnected => "RECONNECTED",
            SyncEventType::Disconnected => "DISCONNECTED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "REGISTERED" => Some(SyncEventType::Registered),
            "UNREGISTERED" => Some(SyncEventType::Unregistered),
            "UPDATED" => Some(SyncEventType::Updated),
            "RECONNECTED" => Some(SyncEventType::Reconnected),
            "DISCONNECTED" => Some(SyncEventType::Disconnected),
            _ => None,
        }
    }
}

/// One row of the sync event log.
#[derive(Debug, Clone)]
pub struct SyncEventRow {
    pub id: String,
    pub event_type: String,
    pub event_data: serde_json::Value,
    pub instance_id: String,
    pub created_at: i64,
    pub processed_by: Vec<String>,
    pub processed_at: Option<i64>,
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<SyncEventRow> {
    let data: String = row.get(2)?;
    let processed: String = row.get(5)?;
    Ok(SyncEventRow {
        id: row.get(0)?,
        event_type: row.get(1)?,
        event_data: serde_json::from_str(&data).unwrap_or(serde_json::Value::Null),
        instance_id: row.get(3)?,
        created_at: row.get(4)?,
        processed_by: serde_json::from_str(&processed).unwrap_or_default(),
        processed_at: row.get(6)?,
    })
}

impl Database {
    /// Append a sync event published by `instance_id`. Returns the event id.
    pub fn append_sync_event(
        &self,
        event_type: SyncEventType,
        event_data: &serde_json::Value,
        instance_id: &str,
    ) -> Result<String> {
        let id = new_id();
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO sync_events (id, event_type, event_data, instance_id, created_at, processed_by)
            VALUES (?1, ?2, ?3, ?4, ?5, '[]')
            "#,
            params![
                id,
                event_type.as_str(),
                event_data.to_string(),
                instance_id,
                now_ms(),
            ],
        )
        .context("failed to append sync event")?;
        Ok(id)
    }

    /// Fetch up to `limit` events not yet acknowledged by `instance_id`,
    /// oldest first. Includes this instance's own events so it can self-ack.
    pub fn fetch_unprocessed_sync_events(
        &self,
        instance_id: &str,
        limit: usize,
    ) -> Result<Vec<SyncEventRow>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                r#"
                SELECT id, event_type, event_data, instance_id, created_at, processed_by, processed_at
                FROM sync_events
                WHERE NOT EXISTS (
                    SELECT 1 FROM json_each(sync_events.processed_by) WHERE value = ?1
                )
                ORDER BY created_at ASC, id ASC
                LIMIT ?2
                "#,
            )
            .context("failed to prepare sync event poll")?;

        let events = stmt
            .query(params![instance_id, limit as i64])?
            .mapped(event_from_row)
            .collect::<Result<Vec<_>, _>>()
            .context("failed to poll sync events")?;

        Ok(events)
    }

    /// Record that `instance_id` has applied event `id`.
    ///
    /// Appends to the processed set and stamps `processed_at` on the first
    /// acknowledgement. Idempotent.
    pub fn acknowledge_sync_event(&self, id: &str, instance_id: &str) -> Result<()> {
        let conn = self.conn()?;

        let row: Option<(String, Option<i64>)> = conn
            .query_row(
                "SELECT processed_by, processed_at FROM sync_events WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("failed to read sync event for ack")?;

        let Some((processed, processed_at)) = row else {
            // Already cleaned up; nothing to record.
            return Ok(());
        };

        let mut processed_by: Vec<String> = serde_json::from_str(&processed).unwrap_or_default();
        if processed_by.iter().any(|p| p == instance_id) {
            return Ok(());
        }
        processed_by.push(instance_id.to_string());

        let first_ack = processed_at.is_none();
        conn.execute(
            "UPDATE sync_events SET processed_by = ?2, \
             processed_at = COALESCE(processed_at, ?3) WHERE id = ?1",
            params![
                id,
                serde_json::to_string(&processed_by)?,
                if first_ack { Some(now_ms()) } else { processed_at },
            ],
        )
        .context("failed to acknowledge sync event")?;

        Ok(())
    }

    /// Delete events older than `retention_hours`. Returns rows removed.
    pub fn cleanup_sync_events(&self, retention_hours: i64) -> Result<usize> {
        let cutoff = now_ms() - retention_hours * 3_600_000;
        let conn = self.conn()?;
        let removed = conn
            .execute(
                "DELETE FROM sync_events WHERE created_at < ?1",
                params![cutoff],
            )
            .context("failed to clean up sync events")?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_append_and_poll() -> Result<()> {
        let db = Database::in_memory()?;

        db.append_sync_event(SyncEventType::Registered, &json!({"name": "calc"}), "i1")?;
        db.append_sync_event(SyncEventType::Updated, &json!({"name": "calc"}), "i1")?;

        let events = db.fetch_unprocessed_sync_events("i2", 100)?;
        assert_eq!(events.len(), 2);
        // Oldest first.
        assert_eq!(events[0].event_type, "REGISTERED");
        assert_eq!(events[1].event_type, "UPDATED");
        assert_eq!(events[0].event_data["name"], "calc");
        Ok(())
    }

    #[test]
    fn test_ack_hides_event_from_that_instance_only() -> Result<()> {
        let db = Database::in_memory()?;

        let id = db.append_sync_event(SyncEventType::Registered, &json!({"name": "s"}), "i1")?;
        db.acknowledge_sync_event(&id, "i2")?;

        assert!(db.fetch_unprocessed_sync_events("i2", 100)?.is_empty());
        // Publisher still sees it until self-ack.
        assert_eq!(db.fetch_unprocessed_sync_events("i1", 100)?.len(), 1);

        db.acknowledge_sync_event(&id, "i1")?;
        assert!(db.fetch_unprocessed_sync_events("i1", 100)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_ack_is_idempotent_and_stamps_first_processed_at() -> Result<()> {
        let db = Database::in_memory()?;

        let id = db.append_sync_event(SyncEventType::Registered, &json!({}), "i1")?;
        db.acknowledge_sync_event(&id, "i2")?;
        db.acknowledge_sync_event(&id, "i2")?;
        db.acknowledge_sync_event(&id, "i3")?;

        let conn = db.conn()?;
        let (processed, stamped): (String, Option<i64>) = conn.query_row(
            "SELECT processed_by, processed_at FROM sync_events WHERE id = ?1",
            params![id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let processed_by: Vec<String> = serde_json::from_str(&processed)?;
        assert_eq!(processed_by, vec!["i2".to_string(), "i3".to_string()]);
        assert!(stamped.is_some());
        Ok(())
    }

    #[test]
    fn test_ack_of_cleaned_up_event_is_noop() -> Result<()> {
        let db = Database::in_memory()?;
        db.acknowledge_sync_event("gone", "i1")?;
        Ok(())
    }

    #[test]
    fn test_cleanup_respects_retention() -> Result<()> {
        let db = Database::in_memory()?;

        let id = db.append_sync_event(SyncEventType::Registered, &json!({}), "i1")?;
        db.append_sync_event(SyncEventType::Updated, &json!({}), "i1")?;

        {
            let conn = db.conn()?;
            conn.execute(
                "UPDATE sync_events SET created_at = created_at - 25 * 3600000 WHERE id = ?1",
                params![id],
            )?;
        }

        assert_eq!(db.cleanup_sync_events(24)?, 1);
        assert_eq!(db.fetch_unprocessed_sync_events("i2", 100)?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_poll_limit() -> Result<()> {
        let db = Database::in_memory()?;
        for i in 0..7 {
            db.append_sync_event(SyncEventType::Registered, &json!({ "n": i }), "i1")?;
        }
        assert_eq!(db.fetch_unprocessed_sync_events("i2", 5)?.len(), 5);
        Ok(())
    }
}
