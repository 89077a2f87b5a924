//! Upstream MCP connections: lifecycle, discovery, routing, health.
//!
//! Uses rmcp (official Rust MCP SDK) with streamable HTTP transport.

mod backoff;
mod events;
mod manager;

pub use backoff::Backoff;
pub use events::{RouterEvent, RouterEventReceiver, RouterEventSender};
pub use manager::{
    first_text, AggregatedTool, ConnectionManager, McpService, ServerStatus,
};
