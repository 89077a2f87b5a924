//! mcp-router - protocol-aggregating router for MCP
//!
//! One downstream MCP endpoint re-exporting the tools of many upstream MCP
//! servers under namespaced names, with live reconnection, a shared-store
//! sync protocol for running several router instances, and optional
//! per-API-key credit enforcement on forwarded calls.

pub mod buffers;
pub mod config;
pub mod context;
pub mod credit;
pub mod db;
pub mod error;
pub mod mcp_server;
pub mod ops;
pub mod registry;
pub mod rest;
pub mod shape;
pub mod state;
pub mod sync;
pub mod upstream;
