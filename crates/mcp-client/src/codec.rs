//! Wire codec: assembles newline-delimited JSON messages from raw byte
//! chunks and classifies each complete line.
//!
//! The codec is deliberately tolerant — servers leak log lines onto stdout,
//! split messages across writes, and occasionally omit the `jsonrpc` tag.
//! Nothing a server prints can make the codec fail; the worst case is a
//! [`WireEvent::Garbage`] diagnostic.

use serde_json::Value;

use crate::protocol::{JsonRpcError, JsonRpcResponse, RpcReply};

/// Upper bound on the unterminated tail we are willing to buffer. A server
/// that streams forever without a newline gets its tail flushed as garbage
/// instead of growing the buffer without bound.
const MAX_BUFFERED_BYTES: usize = 1024 * 1024;

/// One classified line from the server.
#[derive(Debug, Clone, PartialEq)]
pub enum WireEvent {
    /// A protocol-handshake marker: the server is ready for requests.
    Ready,
    /// A correlated response envelope.
    Reply { id: u64, reply: RpcReply },
    /// Valid JSON that matches no envelope we know (push output, logs).
    Stray(Value),
    /// A line that is not JSON at all.
    Garbage(String),
}

/// Line assembler with a persistent partial-line tail.
#[derive(Default)]
pub struct LineCodec {
    buf: String,
}

impl LineCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and classify every complete line it yields.
    ///
    /// The trailing unterminated portion is kept for the next call.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<WireEvent> {
        self.buf.push_str(&String::from_utf8_lossy(chunk));

        let mut events = Vec::new();
        while let Some(pos) = self.buf.find('\n') {
            let line: String = self.buf.drain(..=pos).collect();
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            events.push(classify(line));
        }

        if self.buf.len() > MAX_BUFFERED_BYTES {
            tracing::warn!(
                buffered = self.buf.len(),
                "flushing oversized unterminated line"
            );
            events.push(WireEvent::Garbage(std::mem::take(&mut self.buf)));
        }

        events
    }

    /// Bytes currently held back as an incomplete line.
    pub fn pending_bytes(&self) -> usize {
        self.buf.len()
    }
}

/// Classify one complete line.
pub(crate) fn classify(line: &str) -> WireEvent {
    let value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(_) => return WireEvent::Garbage(line.to_string()),
    };

    // Handshake markers first: an explicit `ready` field, or an
    // initialize-style response announcing the server's identity.
    if is_handshake(&value) {
        return WireEvent::Ready;
    }

    if let Some(id) = value.get("id").and_then(Value::as_u64) {
        return WireEvent::Reply {
            id,
            reply: reply_from_value(value),
        };
    }

    WireEvent::Stray(value)
}

fn is_handshake(value: &Value) -> bool {
    value.get("ready").is_some()
        || value.pointer("/result/protocolVersion").is_some()
        || value.pointer("/result/serverInfo").is_some()
        || value.pointer("/result/capabilities").is_some()
}

/// Build the reply for an envelope that carries an `id`.
///
/// A malformed `error` object still rejects, with a synthesized error that
/// preserves the raw payload.
fn reply_from_value(value: Value) -> RpcReply {
    match serde_json::from_value::<JsonRpcResponse>(value.clone()) {
        Ok(resp) => resp.into_reply(),
        Err(_) => match value.get("error") {
            Some(raw_error) => Err(JsonRpcError {
                code: -32700,
                message: "malformed error object".to_string(),
                data: Some(raw_error.clone()),
            }),
            None => Ok(value.get("result").cloned().unwrap_or(Value::Null)),
        },
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
