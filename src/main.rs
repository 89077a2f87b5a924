//! mcp-router - aggregating router for MCP upstream servers
//!
//! Loads configuration from the environment, restores registered servers
//! from the shared store, and serves the MCP endpoint plus the REST admin
//! surface until interrupted.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use mcp_router::config::RouterConfig;
use mcp_router::db::Database;
use mcp_router::ops;
use mcp_router::rest;
use mcp_router::state::SharedState;
use mcp_router::sync::SyncEngine;
use mcp_router::upstream::RouterEvent;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("mcp_router=info".parse()?),
        )
        .init();

    let config = RouterConfig::from_env();
    info!(name = %config.name, port = config.port, "starting mcp-router");

    info!("opening store at {}", config.database_url);
    let db = Arc::new(
        Database::open_with(&config.database_url, config.run_migrations)
            .context("failed to open store")?,
    );

    let state = SharedState::new(config, db)?;
    info!(instance = %state.instance_id, "instance identity assigned");

    // Log connection lifecycle transitions from the broadcast channel.
    spawn_event_logger(&state);

    // Restore every enabled server before serving so the first catalog
    // a client sees is complete.
    let saved = state.db.find_all_servers(false)?;
    info!("{} servers to restore from store", saved.len());
    for config in saved {
        let name = config.name.clone();
        match ops::attach_server(&state, config).await {
            Ok(status) if status.connected => {
                info!(server = %name, tools = status.tools_count, "restored")
            }
            Ok(status) => warn!(
                server = %name,
                error = status.last_error.as_deref().unwrap_or("unknown"),
                "restore pending; health loop will retry"
            ),
            Err(e) => warn!(server = %name, error = %e, "restore failed"),
        }
    }

    // Background flushers for the audit/event buffers.
    let flusher_cancel = CancellationToken::new();
    let event_flusher = state.event_buffer.spawn_flush_loop(flusher_cancel.clone());
    let audit_flusher = state.audit.spawn_flush_loop(flusher_cancel.clone());

    // Cross-instance sync.
    let sync = SyncEngine::new(state.clone());
    let sync_tasks = sync.start();

    // Serve until interrupted.
    rest::serve(state.clone(), async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
    })
    .await?;

    // Graceful shutdown: stop pollers, close transports, flush buffers.
    sync.shutdown();
    for task in sync_tasks {
        task.abort();
    }
    state.manager.disconnect_all().await;
    flusher_cancel.cancel();
    let _ = event_flusher.await;
    let _ = audit_flusher.await;
    state.event_buffer.shutdown().await;
    state.audit.shutdown().await;

    info!("shutdown complete");
    Ok(())
}

fn spawn_event_logger(state: &Arc<SharedState>) {
    let mut events = state.manager.subscribe();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match &event {
                RouterEvent::Connected {
                    name, tool_count, ..
                } => info!(server = %name, tools = tool_count, "upstream connected"),
                RouterEvent::Disconnected { name, reason } => {
                    warn!(server = %name, reason = %reason, "upstream disconnected")
                }
                RouterEvent::ConnectionError { name, error } => {
                    warn!(server = %name, error = %error, "upstream error")
                }
                _ => {}
            }
        }
    });
}
