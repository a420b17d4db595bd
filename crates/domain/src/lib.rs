//! `conduit-domain` — shared types for the Conduit tool-protocol subsystem.
//!
//! These are the lightweight structs that cross crate boundaries: server
//! connection configs (deserialized by the host's config loader) and the
//! provider-agnostic tool descriptor surfaced to the agent loop. The actual
//! client logic lives in `conduit-mcp-client`.

pub mod config;
pub mod tool;

// Re-exports for convenience.
pub use config::{dedupe_servers, McpServerConfig, McpTransportKind};
pub use tool::ToolDescriptor;
