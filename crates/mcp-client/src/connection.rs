//! A single server connection: transport handle, status, tool cache and
//! diagnostics, plus the correlated request path.
//!
//! Status only ever moves along
//! `connecting → {connected, error}`, `connected → {disconnected, error}`,
//! `{disconnected, error} → connecting` (explicit retry). `error` is sticky:
//! a later close event never downgrades it to `disconnected`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{McpError, TransportError};
use crate::manager::ManagerSettings;
use crate::pending::PendingRequests;
use crate::protocol::{JsonRpcRequest, McpToolDef, RpcReply, ToolsListResult};
use crate::transport::{connect_transport, TransportAdapter, TransportEvent, TransportParts};
use conduit_domain::config::McpServerConfig;

/// Cap on the cumulative diagnostic text we keep per connection; oldest
/// text is trimmed first.
const DIAGNOSTICS_CAP: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Error => "error",
        };
        f.write_str(s)
    }
}

pub struct Connection {
    config: McpServerConfig,
    pending: Arc<PendingRequests>,
    state: parking_lot::Mutex<ConnState>,
}

struct ConnState {
    status: ConnectionStatus,
    transport: Option<Arc<dyn TransportAdapter>>,
    tools: Vec<McpToolDef>,
    diagnostics: String,
    attempts: u32,
    last_attempt: Option<Instant>,
    pump: Option<JoinHandle<()>>,
}

impl Connection {
    pub(crate) fn new(config: McpServerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            pending: Arc::new(PendingRequests::new()),
            state: parking_lot::Mutex::new(ConnState {
                status: ConnectionStatus::Connecting,
                transport: None,
                tools: Vec::new(),
                diagnostics: String::new(),
                attempts: 0,
                last_attempt: None,
                pump: None,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub(crate) fn config(&self) -> &McpServerConfig {
        &self.config
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state.lock().status
    }

    pub fn tools(&self) -> Vec<McpToolDef> {
        self.state.lock().tools.clone()
    }

    pub fn diagnostics(&self) -> String {
        self.state.lock().diagnostics.clone()
    }

    pub fn attempts(&self) -> u32 {
        self.state.lock().attempts
    }

    pub fn last_attempt(&self) -> Option<Instant> {
        self.state.lock().last_attempt
    }

    /// Append one line of diagnostic text, trimming the oldest on overflow.
    pub(crate) fn note(&self, line: &str) {
        let mut st = self.state.lock();
        if !st.diagnostics.is_empty() {
            st.diagnostics.push('\n');
        }
        st.diagnostics.push_str(line);
        if st.diagnostics.len() > DIAGNOSTICS_CAP {
            let mut cut = st.diagnostics.len() - DIAGNOSTICS_CAP;
            while !st.diagnostics.is_char_boundary(cut) {
                cut += 1;
            }
            st.diagnostics.drain(..cut);
        }
    }

    pub(crate) fn mark_error(&self) {
        self.state.lock().status = ConnectionStatus::Error;
    }

    /// A closed stream downgrades a healthy connection only; `error` is
    /// sticky and an in-flight connect cycle keeps its `connecting` status.
    pub(crate) fn mark_closed(&self) {
        let mut st = self.state.lock();
        if st.status == ConnectionStatus::Connected {
            st.status = ConnectionStatus::Disconnected;
        }
    }

    /// Start an explicit retry cycle. Returns `false` (no-op) unless the
    /// connection is currently `disconnected` or `error`.
    pub(crate) fn begin_reconnect(&self) -> bool {
        let mut st = self.state.lock();
        match st.status {
            ConnectionStatus::Disconnected | ConnectionStatus::Error => {
                st.status = ConnectionStatus::Connecting;
                true
            }
            ConnectionStatus::Connecting | ConnectionStatus::Connected => false,
        }
    }

    // ── connect ────────────────────────────────────────────────────

    /// One connect attempt: build the transport, wait for readiness,
    /// discover tools, mark connected. On failure the transport is torn
    /// down again so a retry starts clean.
    pub(crate) async fn establish(self: Arc<Self>, settings: &ManagerSettings) -> Result<(), McpError> {
        let result = Arc::clone(&self).try_establish(settings).await;
        if result.is_err() {
            self.teardown().await;
        }
        result
    }

    async fn try_establish(self: Arc<Self>, settings: &ManagerSettings) -> Result<(), McpError> {
        let server = self.config.name.clone();
        {
            let mut st = self.state.lock();
            st.status = ConnectionStatus::Connecting;
            st.attempts += 1;
            st.last_attempt = Some(Instant::now());
        }

        let TransportParts { adapter, mut events } =
            match connect_transport(&self.config, self.pending.clone()).await {
                Ok(parts) => parts,
                Err(e) => {
                    self.note(&format!("connect failed: {e}"));
                    return Err(McpError::Connection { server, source: e });
                }
            };
        self.state.lock().transport = Some(adapter);

        // Readiness: first of {explicit signal, optimistic timeout, death}.
        let assume_ready = tokio::time::sleep(Duration::from_millis(settings.ready_timeout_ms));
        tokio::pin!(assume_ready);
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(TransportEvent::Ready) => {
                        tracing::debug!(server = %server, "server signalled ready");
                        break;
                    }
                    Some(TransportEvent::Log(line)) => self.note(&line),
                    Some(TransportEvent::Error(message)) => {
                        self.note(&message);
                        return Err(McpError::Connection {
                            server,
                            source: TransportError::Failed(message),
                        });
                    }
                    Some(TransportEvent::Exit) | None => {
                        self.note("server exited before becoming ready");
                        return Err(McpError::Connection {
                            server,
                            source: TransportError::Closed,
                        });
                    }
                },
                _ = &mut assume_ready => {
                    // Servers that never announce themselves still get a
                    // chance; a dead transport will fail the next send.
                    tracing::debug!(server = %server, "no readiness signal; assuming ready");
                    break;
                }
            }
        }

        // Hand lifecycle tracking to the long-lived pump.
        let pump = tokio::spawn(pump_events(self.clone(), events));
        self.state.lock().pump = Some(pump);

        // Discover tools. Only a failure to *send* the request condemns the
        // connection; a timeout or error reply just leaves the cache empty.
        match self.discover_tools(settings.list_timeout_ms).await {
            Ok(count) => {
                tracing::info!(server = %server, tools = count, "server connected");
            }
            Err(McpError::Connection { source, .. }) => {
                self.note(&format!("tools/list could not be sent: {source}"));
                return Err(McpError::Connection { server, source });
            }
            Err(e) => {
                tracing::warn!(server = %server, error = %e, "tool discovery failed; continuing without tools");
                self.note(&format!("tool discovery failed: {e}"));
            }
        }

        let connected = {
            let mut st = self.state.lock();
            if st.status == ConnectionStatus::Connecting {
                st.status = ConnectionStatus::Connected;
                true
            } else {
                false
            }
        };
        if !connected {
            return Err(McpError::Connection {
                server,
                source: TransportError::Failed("transport died during setup".into()),
            });
        }
        Ok(())
    }

    /// Run `tools/list` and replace the cache.
    pub(crate) async fn discover_tools(&self, timeout_ms: u64) -> Result<usize, McpError> {
        let server = self.config.name.clone();
        let reply = self.request("tools/list", None, timeout_ms).await?;
        let value = reply.map_err(|rpc| McpError::Tool {
            server: server.clone(),
            tool: "tools/list".into(),
            message: rpc.to_string(),
        })?;
        let listed: ToolsListResult =
            serde_json::from_value(value.clone()).map_err(|e| McpError::InvalidResponse {
                server: server.clone(),
                message: format!("tools/list result did not parse: {e}"),
                raw: Some(value),
            })?;
        let count = listed.tools.len();
        self.state.lock().tools = listed.tools;
        Ok(count)
    }

    // ── request path ───────────────────────────────────────────────

    /// Send one correlated request and wait for its reply.
    pub(crate) async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout_ms: u64,
    ) -> Result<RpcReply, McpError> {
        let server = self.config.name.clone();
        let transport = self
            .state
            .lock()
            .transport
            .clone()
            .ok_or_else(|| McpError::Connection {
                server: server.clone(),
                source: TransportError::Closed,
            })?;

        let (id, rx) = self.pending.register();
        let request = JsonRpcRequest::new(id, method, params);
        let payload = match serde_json::to_string(&request) {
            Ok(payload) => payload,
            Err(e) => {
                self.pending.cancel(id);
                return Err(McpError::Connection {
                    server,
                    source: TransportError::Json(e),
                });
            }
        };

        tracing::debug!(server = %server, id, method, "sending request");
        if let Err(e) = transport.send(payload).await {
            self.pending.cancel(id);
            return Err(McpError::Connection { server, source: e });
        }

        match tokio::time::timeout(Duration::from_millis(timeout_ms), rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => {
                // Waiter dropped without a reply: the table was torn down.
                self.pending.cancel(id);
                Err(McpError::Connection {
                    server,
                    source: TransportError::Closed,
                })
            }
            Err(_) => {
                // Stop waiting locally; a late reply finds no entry and is
                // dropped by the table.
                self.pending.cancel(id);
                Err(McpError::Timeout {
                    server,
                    operation: method.to_string(),
                    timeout_ms,
                })
            }
        }
    }

    /// Number of requests currently awaiting a reply.
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    // ── teardown ───────────────────────────────────────────────────

    /// Release the transport and reject everything in flight. Status is
    /// left to the caller (shutdown discards the record, reconnect has
    /// already moved it to `connecting`).
    pub(crate) async fn teardown(&self) {
        let (transport, pump) = {
            let mut st = self.state.lock();
            (st.transport.take(), st.pump.take())
        };
        if let Some(pump) = pump {
            pump.abort();
        }
        self.pending.fail_all("connection closed");
        if let Some(transport) = transport {
            transport.close().await;
        }
    }
}

/// Long-lived consumer of transport events for an established connection.
async fn pump_events(conn: Arc<Connection>, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            // Late or repeated readiness signals are harmless.
            TransportEvent::Ready => {}
            TransportEvent::Log(line) => conn.note(&line),
            TransportEvent::Error(message) => {
                tracing::warn!(server = %conn.name(), message = %message, "transport error");
                conn.note(&message);
                conn.mark_error();
            }
            TransportEvent::Exit => {
                tracing::info!(server = %conn.name(), "server connection closed");
                conn.note("transport closed");
                conn.mark_closed();
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
