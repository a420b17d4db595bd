//! MCP (Model Context Protocol) server configuration types.
//!
//! These are lightweight config structs used to deserialize the `[mcp]`
//! section of a host config. The client logic that consumes them lives in
//! the `conduit-mcp-client` crate.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Configuration for a single MCP server connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    /// Unique name for this server (used in tool namespacing: `mcp__{name}__{tool}`).
    pub name: String,

    /// Transport kind (`"stdio"` or `"sse"`).
    #[serde(default)]
    pub transport: McpTransportKind,

    /// The command to spawn (e.g. `"npx"`). Stdio transport only.
    #[serde(default)]
    pub command: String,

    /// Arguments to pass to the command.
    #[serde(default)]
    pub args: Vec<String>,

    /// Environment variables overlaid onto the parent environment for the
    /// spawned process. For SSE servers these are sent as HTTP headers.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Endpoint URL. SSE transport only.
    #[serde(default)]
    pub url: Option<String>,

    /// Per-server override for the tool-call timeout, in milliseconds.
    #[serde(default)]
    pub tool_timeout_ms: Option<u64>,
}

/// Transport kind for connecting to an MCP server.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum McpTransportKind {
    #[default]
    Stdio,
    Sse,
}

/// Collapse an ordered server list to one entry per name.
///
/// The loader emits local-scope entries before global-scope ones, so keeping
/// the first occurrence gives local configs precedence on a name collision.
pub fn dedupe_servers(servers: Vec<McpServerConfig>) -> Vec<McpServerConfig> {
    let mut seen = std::collections::HashSet::new();
    servers
        .into_iter()
        .filter(|s| seen.insert(s.name.clone()))
        .collect()
}
