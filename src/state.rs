//! Shared router state.
//!
//! One bundle wiring the store, buffers, connection manager, registry, and
//! credit gate together, shared by the MCP endpoint, the REST surface, and
//! the sync engine.

use std::sync::Arc;

use anyhow::Result;
use tracing::warn;

use crate::buffers::{AuditBuffer, EventBuffer};
use crate::config::RouterConfig;
use crate::credit::CreditGate;
use crate::db::sync_events::SyncEventType;
use crate::db::Database;
use crate::registry::ToolRegistry;
use crate::upstream::ConnectionManager;

/// Everything a request handler or background loop needs.
pub struct SharedState {
    pub config: RouterConfig,
    pub db: Arc<Database>,
    pub event_buffer: Arc<EventBuffer>,
    pub audit: Arc<AuditBuffer>,
    pub manager: Arc<ConnectionManager>,
    pub registry: Arc<ToolRegistry>,
    pub gate: Arc<CreditGate>,
    /// This process's identity in the sync event log.
    pub instance_id: String,
}

impl SharedState {
    /// Wire up the full component stack over an already-opened store.
    pub fn new(config: RouterConfig, db: Arc<Database>) -> Result<Arc<Self>> {
        let event_buffer = Arc::new(EventBuffer::new(db.clone(), config.enable_event_log));
        let audit = Arc::new(AuditBuffer::new(
            db.clone(),
            config.enable_audit_log,
            config.log_arguments,
            config.log_responses,
        ));
        let manager = Arc::new(ConnectionManager::new(
            &config,
            Some(db.clone()),
            event_buffer.clone(),
            audit.clone(),
        ));
        let registry = Arc::new(ToolRegistry::new(config.separator.clone()));
        let gate = Arc::new(CreditGate::new(manager.clone(), &config));
        let instance_id = config
            .instance_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        Ok(Arc::new(Self {
            config,
            db,
            event_buffer,
            audit,
            manager,
            registry,
            gate,
            instance_id,
        }))
    }

    /// Publish a sync event for peers. Failures are logged, never surfaced;
    /// reconciliation covers a missed publication.
    pub fn publish_sync(&self, event_type: SyncEventType, event_data: serde_json::Value) {
        if !self.config.enable_event_log {
            return;
        }
        if let Err(e) = self
            .db
            .append_sync_event(event_type, &event_data, &self.instance_id)
        {
            warn!(event = event_type.as_str(), error = %e, "failed to publish sync event");
        }
    }
}
