//! Downstream tool registry.
//!
//! Owns the catalog the downstream MCP server advertises and the mapping
//! from aggregated tool name to forwarding handler. Handlers are
//! indirected through their own map so a handler swap (same schema) is an
//! O(1) pointer update invisible to downstream clients, while a schema
//! change replaces the registration and bumps the catalog generation that
//! backs the `listChanged` capability.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use rmcp::model::{CallToolResult, Content, Tool};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::RouterResult;
use crate::shape::Shape;
use crate::upstream::AggregatedTool;

/// Boxed async forwarding handler for one aggregated tool.
pub type ToolHandler =
    Arc<dyn Fn(serde_json::Value) -> BoxFuture<'static, RouterResult<CallToolResult>> + Send + Sync>;

struct RegisteredTool {
    /// The downstream-visible registration (name, description, schema).
    tool: Tool,
    /// Canonical converted shape; registrations compare this, not raw JSON.
    shape_canonical: String,
}

/// What one registration pass changed.
#[derive(Debug, Default, Clone)]
pub struct RegisterOutcome {
    /// Newly registered tool names.
    pub added: Vec<String>,
    /// Re-registered names (schema changed).
    pub replaced: Vec<String>,
    /// Handler-only swaps (schema unchanged, catalog untouched).
    pub updated: usize,
}

/// Source-of-truth for the downstream-visible tool catalog.
pub struct ToolRegistry {
    separator: String,
    registered: RwLock<HashMap<String, RegisteredTool>>,
    handlers: RwLock<HashMap<String, ToolHandler>>,
    /// Bumped on every catalog-visible change; the downstream server
    /// compares generations to decide when a list changed.
    generation: AtomicU64,
}

impl ToolRegistry {
    pub fn new(separator: impl Into<String>) -> Self {
        Self {
            separator: separator.into(),
            registered: RwLock::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Register or refresh one server's aggregated tools.
    ///
    /// `factory` builds the forwarding handler for a tool; the registry
    /// decides per tool whether that handler lands in a fresh registration,
    /// replaces a stale one, or is hot-swapped behind an unchanged one.
    pub async fn register_tools_for(
        &self,
        tools: &[AggregatedTool],
        factory: &(dyn Fn(&AggregatedTool) -> ToolHandler + Send + Sync),
    ) -> RegisterOutcome {
        let mut outcome = RegisterOutcome::default();
        let mut registered = self.registered.write().await;
        let mut handlers = self.handlers.write().await;

        for aggregated in tools {
            let shape = Shape::from_schema(&serde_json::Value::Object(
                (*aggregated.input_schema).clone(),
            ));
            let canonical = shape.canonical();
            let handler = factory(aggregated);

            match registered.get(&aggregated.name) {
                Some(existing) if existing.shape_canonical == canonical => {
                    // Invisible update: swap the indirection target only.
                    handlers.insert(aggregated.name.clone(), handler);
                    outcome.updated += 1;
                }
                Some(_) => {
                    registered.remove(&aggregated.name);
                    registered.insert(
                        aggregated.name.clone(),
                        RegisteredTool {
                            tool: downstream_tool(aggregated),
                            shape_canonical: canonical,
                        },
                    );
                    handlers.insert(aggregated.name.clone(), handler);
                    outcome.replaced.push(aggregated.name.clone());
                }
                None => {
                    registered.insert(
                        aggregated.name.clone(),
                        RegisteredTool {
                            tool: downstream_tool(aggregated),
                            shape_canonical: canonical,
                        },
                    );
                    handlers.insert(aggregated.name.clone(), handler);
                    outcome.added.push(aggregated.name.clone());
                }
            }
        }

        if !outcome.added.is_empty() || !outcome.replaced.is_empty() {
            self.generation.fetch_add(1, Ordering::SeqCst);
        }

        info!(
            added = outcome.added.len(),
            replaced = outcome.replaced.len(),
            updated = outcome.updated,
            "registry pass applied"
        );
        outcome
    }

    /// Remove every tool registered under `{server}{separator}`.
    ///
    /// Returns the removed names.
    pub async fn unregister_tools_for(&self, server: &str) -> Vec<String> {
        let prefix = format!("{}{}", server, self.separator);
        let mut registered = self.registered.write().await;
        let mut handlers = self.handlers.write().await;

        let removed: Vec<String> = registered
            .keys()
            .filter(|name| name.starts_with(&prefix))
            .cloned()
            .collect();

        for name in &removed {
            registered.remove(name);
            handlers.remove(name);
        }

        if !removed.is_empty() {
            self.generation.fetch_add(1, Ordering::SeqCst);
            debug!(server = %server, removed = removed.len(), "unregistered tools");
        }
        removed
    }

    /// Snapshot of the advertised catalog, sorted by name.
    pub async fn list_tools(&self) -> Vec<Tool> {
        let registered = self.registered.read().await;
        let mut tools: Vec<Tool> = registered.values().map(|r| r.tool.clone()).collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// Invoke the current handler for `name`. `None` when unregistered.
    ///
    /// Successful results get internal metrics keys stripped before they
    /// leave the router.
    pub async fn dispatch(
        &self,
        name: &str,
        args: serde_json::Value,
    ) -> Option<RouterResult<CallToolResult>> {
        let handler = {
            let handlers = self.handlers.read().await;
            handlers.get(name).cloned()
        }?;
        Some(handler(args).await.map(strip_internal_metrics))
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.registered.read().await.contains_key(name)
    }

    pub async fn len(&self) -> usize {
        self.registered.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.registered.read().await.is_empty()
    }

    /// Catalog generation; changes exactly when the visible list changes.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}

fn downstream_tool(aggregated: &AggregatedTool) -> Tool {
    Tool::new(
        aggregated.name.clone(),
        aggregated.description.clone(),
        aggregated.input_schema.clone(),
    )
}

/// Strip `models_metrics` / `modelsMetrics` from a successful result.
///
/// These carry internal cost accounting consumed by the credit gate and
/// must not leak downstream. Error results pass through untouched.
pub fn strip_internal_metrics(mut result: CallToolResult) -> CallToolResult {
    if result.is_error.unwrap_or(false) {
        return result;
    }

    if let Some(first) = result.content.first() {
        if let Some(text) = first.as_text() {
            if let Ok(serde_json::Value::Object(mut obj)) =
                serde_json::from_str::<serde_json::Value>(&text.text)
            {
                let had_metrics = obj.remove("models_metrics").is_some()
                    | obj.remove("modelsMetrics").is_some();
                if had_metrics {
                    let cleaned = serde_json::Value::Object(obj).to_string();
                    result.content[0] = Content::text(cleaned);
                }
            }
        }
    }

    if let Some(serde_json::Value::Object(structured)) = result.structured_content.as_mut() {
        if let Some(inner) = structured.get_mut("result") {
            match inner {
                serde_json::Value::Object(obj) => {
                    obj.remove("models_metrics");
                    obj.remove("modelsMetrics");
                }
                serde_json::Value::String(s) => {
                    if let Ok(serde_json::Value::Object(mut obj)) =
                        serde_json::from_str::<serde_json::Value>(s)
                    {
                        let had_metrics = obj.remove("models_metrics").is_some()
                            | obj.remove("modelsMetrics").is_some();
                        if had_metrics {
                            *s = serde_json::Value::Object(obj).to_string();
                        }
                    }
                }
                _ => {}
            }
        }
    }

    result
}
