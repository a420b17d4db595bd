//! Transport layer: the byte channels that carry protocol messages.
//!
//! One [`TransportAdapter`] trait, two implementations:
//! - **Stdio**: spawn a child process, newline-delimited JSON over
//!   stdin/stdout, readiness probed on stderr.
//! - **Sse**: persistent HTTP event stream for inbound messages, POST for
//!   outbound.
//!
//! [`connect_transport`] picks the implementation from the server config.
//! Both adapters report lifecycle through the same closed set of
//! [`TransportEvent`]s, consumed by the connection's event pump.

pub mod sse;
pub mod stdio;

pub use sse::SseTransport;
pub use stdio::StdioTransport;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::codec::WireEvent;
use crate::error::TransportError;
use crate::pending::PendingRequests;
use conduit_domain::config::{McpServerConfig, McpTransportKind};

/// Lifecycle events a transport reports to its connection.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The server signalled (or is assumed) ready to accept requests.
    Ready,
    /// Server chatter worth keeping in the connection diagnostics.
    Log(String),
    /// The transport failed; the connection should be marked errored.
    Error(String),
    /// The byte stream closed.
    Exit,
}

/// A live channel to one server.
#[async_trait]
pub trait TransportAdapter: Send + Sync {
    /// Deliver one serialized JSON-RPC message.
    async fn send(&self, payload: String) -> Result<(), TransportError>;

    /// Tear the transport down (kill the process / abort the stream).
    async fn close(&self);
}

/// A freshly-built adapter plus the event stream it reports on.
pub struct TransportParts {
    pub adapter: Arc<dyn TransportAdapter>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Build the adapter matching the config's transport kind.
///
/// Replies received by the transport are routed straight into `pending`;
/// everything else surfaces on the event stream.
pub async fn connect_transport(
    config: &McpServerConfig,
    pending: Arc<PendingRequests>,
) -> Result<TransportParts, TransportError> {
    match config.transport {
        McpTransportKind::Stdio => StdioTransport::spawn(config, pending),
        McpTransportKind::Sse => SseTransport::connect(config, pending).await,
    }
}

/// Route classified wire events: replies into the pending table, everything
/// else onto the connection's event stream.
pub(crate) fn route_wire_events(
    events: Vec<WireEvent>,
    pending: &PendingRequests,
    events_tx: &mpsc::UnboundedSender<TransportEvent>,
) {
    for event in events {
        match event {
            WireEvent::Ready => {
                let _ = events_tx.send(TransportEvent::Ready);
            }
            WireEvent::Reply { id, reply } => {
                if !pending.complete(id, reply) {
                    tracing::debug!(id, "dropping reply with no pending request");
                }
            }
            WireEvent::Stray(value) => {
                tracing::debug!(message = %value, "unsolicited server message");
                let _ = events_tx.send(TransportEvent::Log(format!("server message: {value}")));
            }
            WireEvent::Garbage(line) => {
                // Compatibility shim: a lone pending request may accept a
                // non-JSON line as its textual answer.
                if pending.complete_sole(&line) {
                    tracing::debug!(line = %line, "non-JSON line resolved the only pending request");
                } else {
                    let _ = events_tx.send(TransportEvent::Log(format!("unparseable line: {line}")));
                }
            }
        }
    }
}
