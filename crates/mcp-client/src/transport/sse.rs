//! SSE transport: inbound messages arrive on a persistent HTTP event
//! stream, outbound requests are POSTed to the same URL.
//!
//! SSE events are `\n\n`-delimited blocks; we only care about their `data:`
//! lines, each of which is handed to the wire codec as one line. The open
//! stream itself is the readiness signal — no probing needed. Configured
//! `env` entries ride along as HTTP headers (API keys and the like).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{route_wire_events, TransportAdapter, TransportEvent, TransportParts};
use crate::codec::{classify, LineCodec};
use crate::error::TransportError;
use crate::pending::PendingRequests;
use conduit_domain::config::McpServerConfig;

pub struct SseTransport {
    http: reqwest::Client,
    url: String,
    headers: Vec<(String, String)>,
    pending: Arc<PendingRequests>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    stream_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl SseTransport {
    /// Open the event stream and wire up the inbound pump.
    pub async fn connect(
        config: &McpServerConfig,
        pending: Arc<PendingRequests>,
    ) -> Result<TransportParts, TransportError> {
        let url = match config.url.as_deref() {
            Some(url) if !url.is_empty() => url.to_string(),
            _ => {
                return Err(TransportError::Unsupported(
                    "sse transport requires a url".into(),
                ))
            }
        };
        let headers: Vec<(String, String)> = config
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let http = reqwest::Client::new();
        let mut request = http.get(&url).header("Accept", "text/event-stream");
        for (key, value) in &headers {
            request = request.header(key.as_str(), value.as_str());
        }
        let response = request
            .send()
            .await
            .map_err(|e| TransportError::Http(format!("event stream connect failed: {e}")))?;
        if !response.status().is_success() {
            return Err(TransportError::Http(format!(
                "event stream returned HTTP {}",
                response.status()
            )));
        }

        tracing::debug!(url = %url, "event stream open");

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        // Connection open is the readiness signal.
        let _ = events_tx.send(TransportEvent::Ready);

        let stream_task = tokio::spawn(pump_event_stream(
            response,
            pending.clone(),
            events_tx.clone(),
        ));

        let adapter = Arc::new(Self {
            http,
            url,
            headers,
            pending,
            events_tx,
            stream_task: parking_lot::Mutex::new(Some(stream_task)),
            closed: AtomicBool::new(false),
        });
        Ok(TransportParts {
            adapter,
            events: events_rx,
        })
    }
}

/// Read the event stream, draining complete `data:` payloads into the codec.
async fn pump_event_stream(
    mut response: reqwest::Response,
    pending: Arc<PendingRequests>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
) {
    let mut buffer = String::new();
    let mut codec = LineCodec::new();
    loop {
        match response.chunk().await {
            Ok(Some(bytes)) => {
                buffer.push_str(&String::from_utf8_lossy(&bytes));
                for payload in drain_data_payloads(&mut buffer) {
                    let line = format!("{payload}\n");
                    route_wire_events(codec.feed(line.as_bytes()), &pending, &events_tx);
                }
            }
            Ok(None) => {
                // Stream ended — flush a trailing partial event, if any.
                if !buffer.trim().is_empty() {
                    buffer.push_str("\n\n");
                    for payload in drain_data_payloads(&mut buffer) {
                        let line = format!("{payload}\n");
                        route_wire_events(codec.feed(line.as_bytes()), &pending, &events_tx);
                    }
                }
                let _ = events_tx.send(TransportEvent::Exit);
                break;
            }
            Err(e) => {
                let _ = events_tx.send(TransportEvent::Error(format!("event stream failed: {e}")));
                break;
            }
        }
    }
    pending.fail_all("event stream closed");
}

/// Extract complete `data:` payloads from an SSE buffer.
///
/// Events are delimited by `\n\n`; `event:`, `id:` and `retry:` lines are
/// ignored. The buffer is drained in place, leaving any trailing partial
/// event for the next call.
fn drain_data_payloads(buffer: &mut String) -> Vec<String> {
    let mut payloads = Vec::new();

    while let Some(pos) = buffer.find("\n\n") {
        let block: String = buffer.drain(..pos).collect();
        buffer.drain(..2);

        for line in block.lines() {
            let line = line.trim();
            if let Some(data) = line.strip_prefix("data:") {
                let data = data.trim();
                if !data.is_empty() {
                    payloads.push(data.to_string());
                }
            }
        }
    }

    payloads
}

#[async_trait]
impl TransportAdapter for SseTransport {
    async fn send(&self, payload: String) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let mut request = self
            .http
            .post(&self.url)
            .header("Content-Type", "application/json")
            .body(payload);
        for (key, value) in &self.headers {
            request = request.header(key.as_str(), value.as_str());
        }
        let response = request
            .send()
            .await
            .map_err(|e| TransportError::Http(format!("request POST failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Http(format!(
                "request POST returned HTTP {status}"
            )));
        }

        // Some servers answer inline instead of over the stream; feed any
        // JSON-looking body through the same routing.
        let body = response.text().await.unwrap_or_default();
        let trimmed = body.trim();
        if trimmed.starts_with('{') {
            route_wire_events(vec![classify(trimmed)], &self.pending, &self.events_tx);
        }
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let task = self.stream_task.lock().take();
        if let Some(task) = task {
            task.abort();
        }
        tracing::debug!(url = %self.url, "event stream closed");
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
