//! JSON-RPC envelope and MCP payload types.
//!
//! Each message on the wire is a single line of JSON (newline-delimited).
//! Requests carry an `id` and expect a response; lines without an `id` are
//! server-initiated chatter and are tolerated, never fatal.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Envelopes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A JSON-RPC 2.0 request (has an `id` — expects a response).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// A JSON-RPC 2.0 response.
///
/// The `jsonrpc` tag is optional on the inbound side: some servers omit it
/// and the correlation id is all we actually need.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<String>,
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

/// What a correlated request ultimately resolves to: the `result` value, or
/// the `error` object. An absent `result` resolves to `Null`.
pub type RpcReply = Result<Value, JsonRpcError>;

impl JsonRpcResponse {
    pub fn into_reply(self) -> RpcReply {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JSON-RPC error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for JsonRpcError {}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// MCP payloads
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A single tool definition returned by `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct McpToolDef {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_schema")]
    pub input_schema: Value,
}

fn default_schema() -> Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

/// The result payload from `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsListResult {
    pub tools: Vec<McpToolDef>,
}

/// Build the `tools/call` params for one invocation.
pub fn tool_call_params(tool: &str, arguments: Value) -> Value {
    serde_json::json!({ "name": tool, "arguments": arguments })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool outcome normalization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// What a tool call resolves to, regardless of how the server shaped its
/// reply. Serializes as `{"result": …}`, `{"error": …}` or `{"partial": …}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ToolOutcome {
    #[serde(rename = "result")]
    Success(Value),
    #[serde(rename = "error")]
    Failure(String),
    #[serde(rename = "partial")]
    Partial(Value),
}

impl ToolOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, ToolOutcome::Failure(_))
    }
}

/// Placeholder for servers that return nothing at all.
const EMPTY_RESULT_PLACEHOLDER: &str = "ok";

/// Convert a raw `tools/call` result into a [`ToolOutcome`].
///
/// Servers disagree on reply shape; one explicit case per known shape,
/// with an exhaustive wrap-as-result fallback:
/// - absent / `null` / `{}` — synthetic success placeholder
/// - `{content: [{type:"text", text}, …]}` — text fragments joined with
///   newlines; `isError: true` flips the outcome to a failure
/// - already-shaped `{result}` / `{error}` / `{partial}` — passed through
/// - anything else — wrapped as a success value
pub fn normalize_tool_result(raw: Option<Value>) -> ToolOutcome {
    let value = match raw {
        None | Some(Value::Null) => {
            return ToolOutcome::Success(Value::String(EMPTY_RESULT_PLACEHOLDER.into()))
        }
        Some(v) => v,
    };

    if let Some(obj) = value.as_object() {
        if obj.is_empty() {
            return ToolOutcome::Success(Value::String(EMPTY_RESULT_PLACEHOLDER.into()));
        }

        if let Some(content) = obj.get("content").and_then(Value::as_array) {
            let text = extract_text_content(content);
            let is_error = obj.get("isError").and_then(Value::as_bool).unwrap_or(false);
            return if is_error {
                ToolOutcome::Failure(text)
            } else {
                ToolOutcome::Success(Value::String(text))
            };
        }

        if let Some(result) = obj.get("result") {
            return ToolOutcome::Success(result.clone());
        }
        if let Some(error) = obj.get("error") {
            return ToolOutcome::Failure(error_to_message(error));
        }
        if let Some(partial) = obj.get("partial") {
            return ToolOutcome::Partial(partial.clone());
        }
    }

    ToolOutcome::Success(value)
}

/// Extract and join the text fragments of a content-block array.
pub fn extract_text_content(content: &[Value]) -> String {
    content
        .iter()
        .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|block| block.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Render an already-shaped `error` value as a message string.
fn error_to_message(error: &Value) -> String {
    match error {
        Value::String(s) => s.clone(),
        other => other
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| other.to_string()),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
