//! Shared relational store for the router.
//!
//! Persists server configs, sync events, server events, and tool-call audit
//! rows. Uses SQLite with UUIDv7 primary keys; several router instances
//! cooperate by opening the same database file. The Sync Engine treats the
//! store's append order as the source of truth for cross-instance ordering.

mod schema;

pub mod audit;
pub mod servers;
pub mod sync_events;

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

pub use schema::{SCHEMA, SCHEMA_VERSION};

/// Generate a new UUIDv7 (time-sorted)
pub fn new_id() -> String {
    Uuid::now_v7().to_string()
}

/// Get current Unix timestamp in milliseconds
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time went backwards")
        .as_millis() as i64
}

/// Database handle (thread-safe via Mutex)
#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Acquire the database connection, converting PoisonError to anyhow::Error.
    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("database lock poisoned: {}", e))
    }

    /// Open or create database at path, applying the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, true)
    }

    /// Open the database, optionally skipping schema application.
    ///
    /// With `run_migrations` false the stored schema must already be
    /// current (an external migration runner owns it in that deployment);
    /// an out-of-date store is refused rather than silently used.
    pub fn open_with(path: impl AsRef<Path>, run_migrations: bool) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("failed to open database at {:?}", path.as_ref()))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .context("failed to set busy timeout")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        if run_migrations {
            db.init()?;
        } else {
            db.verify_schema()?;
        }
        Ok(db)
    }

    /// Open in-memory database (for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init()?;
        Ok(db)
    }

    /// Initialize schema and run migrations
    fn init(&self) -> Result<()> {
        let version = self.get_schema_version()?;

        if version < SCHEMA_VERSION {
            self.conn()?
                .execute_batch(SCHEMA)
                .context("failed to create schema")?;
            self.set_schema_version(SCHEMA_VERSION)?;
            tracing::info!("initialized database schema version {}", SCHEMA_VERSION);
        }

        Ok(())
    }

    /// Require the stored schema to be current without touching it.
    fn verify_schema(&self) -> Result<()> {
        let version = self.get_schema_version()?;
        if version < SCHEMA_VERSION {
            anyhow::bail!(
                "store schema is version {} but {} is required; \
                 enable RUN_MIGRATIONS or migrate externally",
                version,
                SCHEMA_VERSION
            );
        }
        Ok(())
    }

    /// Liveness probe for `GET /health`: a trivial query plus its latency.
    pub fn health_check(&self) -> Result<i64> {
        let start = std::time::Instant::now();
        let conn = self.conn()?;
        let _: i64 = conn
            .query_row("SELECT 1", [], |row| row.get(0))
            .context("store health query failed")?;
        Ok(start.elapsed().as_millis() as i64)
    }

    /// Get current schema version from user_version pragma
    fn get_schema_version(&self) -> Result<i32> {
        let conn = self.conn()?;
        let version: i32 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .context("failed to get schema version")?;
        Ok(version)
    }

    /// Set schema version using user_version pragma
    fn set_schema_version(&self, version: i32) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(&format!("PRAGMA user_version = {}", version), [])
            .context("failed to set schema version")?;
        Ok(())
    }
}
