//! Error taxonomy for the MCP client subsystem.
//!
//! Low-level transport and parse failures are always wrapped into an
//! [`McpError`] before they cross the manager boundary. `initialize` and
//! `call_tool` additionally convert errors into degraded connection status
//! or `{error}` outcomes, so callers never need a `try`/`catch` around
//! routine operation.

use serde_json::Value;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Transport layer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Errors raised inside a transport adapter.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("HTTP: {0}")]
    Http(String),

    #[error("transport closed")]
    Closed,

    #[error("transport failed: {0}")]
    Failed(String),

    #[error("transport not supported: {0}")]
    Unsupported(String),
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Client errors
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Failure categories surfaced by the connection manager.
#[derive(Debug, thiserror::Error)]
pub enum McpError {
    /// Connecting (or reconnecting) to a server failed.
    #[error("server '{server}': connection failed: {source}")]
    Connection {
        server: String,
        #[source]
        source: TransportError,
    },

    /// A tool invocation failed on an otherwise healthy connection.
    #[error("server '{server}', tool '{tool}': {message}")]
    Tool {
        server: String,
        tool: String,
        message: String,
    },

    /// An unknown server or tool was referenced.
    #[error("unknown {kind} '{name}' ({context})")]
    NotFound {
        kind: &'static str,
        name: String,
        context: String,
    },

    /// No response arrived within the operation's budget.
    #[error("server '{server}': {operation} timed out after {timeout_ms}ms")]
    Timeout {
        server: String,
        operation: String,
        timeout_ms: u64,
    },

    /// A response arrived but violated the expected envelope.
    #[error("server '{server}': invalid response: {message}")]
    InvalidResponse {
        server: String,
        message: String,
        raw: Option<Value>,
    },
}

/// Render a server-name list for "unknown server" messages.
pub(crate) fn known_servers_hint(mut names: Vec<String>) -> String {
    if names.is_empty() {
        return "no servers configured".to_string();
    }
    names.sort();
    format!("known servers: {}", names.join(", "))
}
