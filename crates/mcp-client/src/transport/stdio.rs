//! Stdio transport: spawn a child process and speak newline-delimited
//! JSON-RPC over its stdin/stdout.
//!
//! stdout bytes feed the wire codec; replies land in the pending table.
//! stderr is drained for diagnostics and probed for a readiness
//! announcement ("ready", "running" or "started", case-insensitive) —
//! many servers print one before they accept requests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::{mpsc, Mutex};

use super::{route_wire_events, TransportAdapter, TransportEvent, TransportParts};
use crate::codec::LineCodec;
use crate::error::TransportError;
use crate::pending::PendingRequests;
use conduit_domain::config::McpServerConfig;

/// Read granularity for the stdout pump.
const READ_CHUNK_BYTES: usize = 4096;

fn ready_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(ready|running|started)\b").expect("readiness pattern compiles")
    })
}

pub struct StdioTransport {
    stdin: Mutex<ChildStdin>,
    child: Mutex<Child>,
    closed: AtomicBool,
}

impl StdioTransport {
    /// Spawn the configured command with the parent environment overlaid
    /// with the server's own variables, and wire up the pump tasks.
    pub fn spawn(
        config: &McpServerConfig,
        pending: Arc<PendingRequests>,
    ) -> Result<TransportParts, TransportError> {
        let mut cmd = tokio::process::Command::new(&config.command);
        cmd.args(&config.args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|e| TransportError::Spawn {
            command: config.command.clone(),
            source: e,
        })?;

        let stdin = child.stdin.take().ok_or_else(|| broken_pipe("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| broken_pipe("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| broken_pipe("stderr"))?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();

        tokio::spawn(pump_stdout(stdout, pending, events_tx.clone()));
        tokio::spawn(pump_stderr(stderr, events_tx));

        tracing::debug!(command = %config.command, "spawned stdio server");

        let adapter = Arc::new(Self {
            stdin: Mutex::new(stdin),
            child: Mutex::new(child),
            closed: AtomicBool::new(false),
        });
        Ok(TransportParts {
            adapter,
            events: events_rx,
        })
    }
}

fn broken_pipe(stream: &str) -> TransportError {
    TransportError::Io(std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        format!("failed to capture child {stream}"),
    ))
}

/// Read stdout chunks into the codec and route whatever comes out.
async fn pump_stdout(
    mut stdout: ChildStdout,
    pending: Arc<PendingRequests>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
) {
    let mut codec = LineCodec::new();
    let mut chunk = [0u8; READ_CHUNK_BYTES];
    loop {
        match stdout.read(&mut chunk).await {
            Ok(0) => {
                let _ = events_tx.send(TransportEvent::Exit);
                break;
            }
            Ok(n) => route_wire_events(codec.feed(&chunk[..n]), &pending, &events_tx),
            Err(e) => {
                let _ = events_tx.send(TransportEvent::Error(format!("stdout read failed: {e}")));
                break;
            }
        }
    }
    // The stream can no longer answer anyone.
    pending.fail_all("server closed the connection");
}

/// Drain stderr: every line becomes a diagnostic, the first line matching
/// the readiness pattern flips the connection ready.
async fn pump_stderr(stderr: ChildStderr, events_tx: mpsc::UnboundedSender<TransportEvent>) {
    let mut lines = BufReader::new(stderr).lines();
    let mut announced = false;
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        tracing::debug!(line = %line, "server stderr");
        let _ = events_tx.send(TransportEvent::Log(format!("stderr: {line}")));
        if !announced && ready_regex().is_match(line) {
            announced = true;
            let _ = events_tx.send(TransportEvent::Ready);
        }
    }
}

#[async_trait]
impl TransportAdapter for StdioTransport {
    async fn send(&self, payload: String) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(payload.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut child = self.child.lock().await;
        match child.kill().await {
            Ok(()) => tracing::debug!("stdio server killed"),
            Err(e) => tracing::warn!(error = %e, "failed to kill stdio server"),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
