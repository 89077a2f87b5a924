//! Multi-instance sync engine.
//!
//! Several router instances share one store. Each instance publishes its
//! admin operations to the sync event log (see `SharedState::publish_sync`)
//! and runs three loops here: a poller applying peer events, a
//! reconciliation pass that converges local state on the repository, and a
//! cleanup pass expiring old events. The event log is the fast path;
//! reconciliation is the correctness backstop.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::db::servers::ServerConfig;
use crate::db::sync_events::{SyncEventRow, SyncEventType};
use crate::ops;
use crate::state::SharedState;
use crate::upstream::Backoff;

/// Maximum events applied per poll.
const POLL_BATCH: usize = 100;

/// Background synchronization between router instances.
pub struct SyncEngine {
    state: Arc<SharedState>,
    cancel: CancellationToken,
}

impl SyncEngine {
    pub fn new(state: Arc<SharedState>) -> Self {
        Self {
            state,
            cancel: CancellationToken::new(),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.state.instance_id
    }

    /// Spawn the poll, reconcile, and cleanup loops.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        let config = &self.state.config;
        info!(
            instance = %self.state.instance_id,
            poll_ms = config.sync_poll_interval_ms,
            sync_ms = config.sync_interval_ms,
            "sync engine started"
        );
        vec![
            self.spawn_poll_loop(Duration::from_millis(config.sync_poll_interval_ms)),
            self.spawn_reconcile_loop(Duration::from_millis(config.sync_interval_ms)),
            self.spawn_cleanup_loop(Duration::from_millis(config.sync_cleanup_interval_ms)),
        ]
    }

    /// Stop all loops.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    fn spawn_poll_loop(&self, interval: Duration) -> JoinHandle<()> {
        let state = self.state.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            // Store errors stretch the next poll out with jitter instead of
            // hammering a down database every tick.
            let mut backoff = Backoff::new(interval, Duration::from_secs(60));
            let mut delay = interval;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => break,
                }
                match poll_once(&state).await {
                    Ok(applied) => {
                        backoff.record_success();
                        delay = interval;
                        if applied > 0 {
                            debug!(applied, "applied sync events");
                        }
                    }
                    Err(e) => {
                        delay = backoff.record_failure();
                        warn!(error = %e, failures = backoff.failures(), "sync poll failed");
                    }
                }
            }
        })
    }

    fn spawn_reconcile_loop(&self, interval: Duration) -> JoinHandle<()> {
        let state = self.state.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = cancel.cancelled() => break,
                }
                if let Err(e) = reconcile_once(&state).await {
                    warn!(error = %e, "reconciliation failed");
                }
            }
        })
    }

    fn spawn_cleanup_loop(&self, interval: Duration) -> JoinHandle<()> {
        let state = self.state.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = cancel.cancelled() => break,
                }
                match cleanup_once(&state) {
                    Ok(removed) if removed > 0 => {
                        debug!(removed, "expired old sync events")
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "sync event cleanup failed"),
                }
            }
        })
    }
}

/// Apply one batch of pending peer events. Returns how many were applied
/// (own events are acknowledged without acting).
pub async fn poll_once(state: &SharedState) -> Result<usize> {
    let events = state
        .db
        .fetch_unprocessed_sync_events(&state.instance_id, POLL_BATCH)?;

    let mut applied = 0;
    for event in events {
        if event.instance_id != state.instance_id {
            apply_event(state, &event).await;
            applied += 1;
        }
        // Acknowledge in all cases so subsequent polls skip the event;
        // a handler failure is repaired by reconciliation, not by replay.
        if let Err(e) = state
            .db
            .acknowledge_sync_event(&event.id, &state.instance_id)
        {
            warn!(event = %event.id, error = %e, "failed to acknowledge sync event");
        }
    }
    Ok(applied)
}

/// Dispatch one peer event against local state. Idempotent per event type;
/// the event's own payload is authoritative (the publisher's row may not be
/// visible yet).
async fn apply_event(state: &SharedState, event: &SyncEventRow) {
    let Some(event_type) = SyncEventType::parse(&event.event_type) else {
        warn!(event = %event.id, kind = %event.event_type, "unknown sync event type");
        return;
    };
    let name = event
        .event_data
        .get("name")
        .and_then(serde_json::Value::as_str)
        .unwrap_or_default()
        .to_string();
    if name.is_empty() {
        warn!(event = %event.id, "sync event without server name");
        return;
    }

    debug!(event = event_type.as_str(), server = %name, publisher = %event.instance_id, "applying sync event");

    match event_type {
        SyncEventType::Registered | SyncEventType::Updated => {
            if state.manager.get_status(&name).await.is_some() {
                return;
            }
            let config: ServerConfig = match serde_json::from_value(event.event_data.clone()) {
                Ok(config) => config,
                Err(e) => {
                    warn!(event = %event.id, error = %e, "sync payload unparseable");
                    return;
                }
            };
            if let Err(e) = ops::attach_server(state, config).await {
                warn!(server = %name, error = %e, "failed to attach synced server");
            }
        }
        SyncEventType::Unregistered => {
            if state.manager.get_status(&name).await.is_some() {
                state.registry.unregister_tools_for(&name).await;
                if let Err(e) = state.manager.disconnect(&name).await {
                    warn!(server = %name, error = %e, "failed to disconnect synced server");
                }
            }
        }
        SyncEventType::Reconnected => {
            if let Some(status) = state.manager.get_status(&name).await {
                if !status.connected {
                    match state.manager.reconnect(&name).await {
                        Ok(status) if status.connected => {
                            ops::register_tools(state, &name).await;
                        }
                        Ok(_) => {}
                        Err(e) => warn!(server = %name, error = %e, "synced reconnect failed"),
                    }
                }
            }
        }
        SyncEventType::Disconnected => {
            if let Some(status) = state.manager.get_status(&name).await {
                if status.connected {
                    state.registry.unregister_tools_for(&name).await;
                    if let Err(e) = state.manager.disconnect(&name).await {
                        warn!(server = %name, error = %e, "synced disconnect failed");
                    }
                }
            }
        }
    }
}

/// Converge local state on the repository: connect missing enabled servers,
/// reconnect down ones.
pub async fn reconcile_once(state: &SharedState) -> Result<()> {
    let servers = state.db.find_all_servers(false)?;

    for config in servers {
        let name = config.name.clone();
        match state.manager.get_status(&name).await {
            None => {
                debug!(server = %name, "reconciliation attaching missing server");
                if let Err(e) = ops::attach_server(state, config).await {
                    warn!(server = %name, error = %e, "reconciliation attach failed");
                }
            }
            Some(status) if !status.connected => {
                debug!(server = %name, "reconciliation reconnecting down server");
                match state.manager.reconnect(&name).await {
                    Ok(status) if status.connected => {
                        ops::register_tools(state, &name).await;
                    }
                    Ok(_) => {}
                    Err(e) => warn!(server = %name, error = %e, "reconciliation reconnect failed"),
                }
            }
            Some(_) => {}
        }
    }
    Ok(())
}

/// Expire events past the retention window.
pub fn cleanup_once(state: &SharedState) -> Result<usize> {
    Ok(state
        .db
        .cleanup_sync_events(state.config.sync_event_retention_hours)?)
}
