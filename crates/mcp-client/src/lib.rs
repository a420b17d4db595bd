//! `conduit-mcp-client` — managed MCP (Model Context Protocol) client.
//!
//! This crate provides:
//! - JSON-RPC 2.0 envelope types and a tolerant newline-delimited wire codec.
//! - Two transports behind one trait: stdio (spawned child process) and SSE
//!   (HTTP event stream), selected by a factory on the configured kind.
//! - An [`McpManager`] that owns one connection per configured server and
//!   orchestrates connect-with-retry, tool discovery, namespaced
//!   aggregation and dispatch.
//!
//! # Usage
//!
//! ```rust,ignore
//! use conduit_mcp_client::{ManagerSettings, McpManager};
//!
//! let manager = McpManager::new(ManagerSettings::default());
//! manager.initialize(server_configs).await; // never fails
//!
//! for tool in manager.available_tools() {
//!     println!("{}", tool.name); // mcp__{server}__{tool}
//! }
//!
//! let outcome = manager.call_tool("filesystem", "read_file", json!({"path": "/tmp/x"})).await;
//! manager.shutdown().await;
//! ```

pub mod backoff;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod manager;
pub mod pending;
pub mod protocol;
pub mod transport;

// Re-exports for convenience.
pub use backoff::RetryPolicy;
pub use config::{McpServerConfig, McpTransportKind};
pub use connection::ConnectionStatus;
pub use error::{McpError, TransportError};
pub use manager::{ManagerSettings, McpManager, ServerStatus};
pub use protocol::{McpToolDef, ToolOutcome};
pub use conduit_domain::tool::ToolDescriptor;
