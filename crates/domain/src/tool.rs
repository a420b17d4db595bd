use serde::{Deserialize, Serialize};

/// Tool definition exposed to the agent loop (provider-agnostic).
///
/// Tools discovered from MCP servers are converted to this shape with a
/// namespaced `name` before leaving the client subsystem.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's parameters.
    pub parameters: serde_json::Value,
}
