//! Connection manager: owns every server connection and orchestrates
//! connect-with-retry, tool aggregation and dispatch.
//!
//! The manager's surface never panics and never propagates errors for
//! routine operation: `initialize` degrades failed servers to an `error`
//! status, `call_tool` resolves to an `{error}` outcome. One server's
//! failure is isolated from the others.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::task::JoinSet;

use crate::backoff::RetryPolicy;
use crate::connection::{Connection, ConnectionStatus};
use crate::error::{known_servers_hint, McpError, TransportError};
use crate::protocol::{normalize_tool_result, tool_call_params, ToolOutcome};
use conduit_domain::config::{dedupe_servers, McpServerConfig};
use conduit_domain::tool::ToolDescriptor;

/// Namespace prefix and delimiter for aggregated tool names:
/// `mcp__{server}__{tool}`.
const TOOL_NAMESPACE: &str = "mcp";
const TOOL_NAME_DELIMITER: &str = "__";

/// LLM providers reject tool names longer than this; overlong qualified
/// names are truncated with a digest suffix to stay unique.
const MAX_TOOL_NAME_LENGTH: usize = 64;
const HASH_SUFFIX_LENGTH: usize = 12;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Settings
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Timeouts and retry policy, injected at construction.
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// How long to wait for a readiness signal before assuming the server
    /// is ready anyway.
    pub ready_timeout_ms: u64,
    /// Budget for the `tools/list` discovery request.
    pub list_timeout_ms: u64,
    /// Default budget for `tools/call` (per-server config may override).
    pub call_timeout_ms: u64,
    pub retry: RetryPolicy,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            ready_timeout_ms: 5_000,
            list_timeout_ms: 5_000,
            call_timeout_ms: 30_000,
            retry: RetryPolicy::default(),
        }
    }
}

/// Point-in-time view of one server connection.
#[derive(Debug, Clone)]
pub struct ServerStatus {
    pub name: String,
    pub status: ConnectionStatus,
    pub tool_count: usize,
    pub attempts: u32,
    pub last_attempt: Option<Instant>,
    pub diagnostics: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// McpManager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Manager that owns all MCP server connections.
pub struct McpManager {
    settings: ManagerSettings,
    /// Registry keyed by server name. Guarded by a synchronous lock so a
    /// check-then-set of a connection's status is atomic; never held
    /// across an await.
    connections: parking_lot::Mutex<HashMap<String, Arc<Connection>>>,
}

impl Default for McpManager {
    fn default() -> Self {
        Self::new(ManagerSettings::default())
    }
}

impl McpManager {
    pub fn new(settings: ManagerSettings) -> Self {
        Self {
            settings,
            connections: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Connect every configured server, concurrently.
    ///
    /// The list is deduplicated by name (first occurrence wins — the loader
    /// orders local scope first). Each server connects independently: one
    /// failure never aborts another, and a failed server still gets a
    /// registry entry with `error` status and readable diagnostics. Returns
    /// once every attempt has settled; never fails.
    pub async fn initialize(&self, servers: Vec<McpServerConfig>) {
        let servers = dedupe_servers(servers);
        let mut join = JoinSet::new();

        for config in servers {
            let conn = {
                let mut registry = self.connections.lock();
                match registry.get(&config.name) {
                    Some(existing) => {
                        // `connecting` doubles as the mutual-exclusion flag:
                        // a server already connecting or connected is left
                        // alone.
                        if !existing.begin_reconnect() {
                            tracing::debug!(
                                server = %config.name,
                                "already connecting or connected; skipping"
                            );
                            continue;
                        }
                        existing.clone()
                    }
                    None => {
                        let conn = Connection::new(config.clone());
                        registry.insert(config.name.clone(), conn.clone());
                        conn
                    }
                }
            };

            let settings = self.settings.clone();
            join.spawn(async move {
                if let Err(e) = connect_with_retry(&conn, &settings).await {
                    tracing::warn!(server = %conn.name(), error = %e, "server failed to connect");
                }
            });
        }

        while let Some(result) = join.join_next().await {
            if let Err(e) = result {
                tracing::warn!(error = %e, "connect task failed");
            }
        }
    }

    /// All tools of all `connected` servers, under qualified names.
    pub fn available_tools(&self) -> Vec<ToolDescriptor> {
        let connections = self.sorted_connections();

        let mut used = HashSet::new();
        let mut tools = Vec::new();
        for conn in connections {
            if conn.status() != ConnectionStatus::Connected {
                continue;
            }
            for tool in conn.tools() {
                let name = qualify_tool_name(conn.name(), &tool.name);
                if !used.insert(name.clone()) {
                    tracing::warn!(tool = %name, "skipping duplicated tool name");
                    continue;
                }
                tools.push(ToolDescriptor {
                    name,
                    description: tool.description,
                    parameters: tool.input_schema,
                });
            }
        }
        tools
    }

    /// Map a qualified `mcp__{server}__{tool}` name back to its parts.
    ///
    /// Server names may themselves contain underscores, so known names are
    /// matched longest-first.
    pub fn resolve_tool_name(&self, qualified: &str) -> Option<(String, String)> {
        let stripped =
            qualified.strip_prefix(&format!("{TOOL_NAMESPACE}{TOOL_NAME_DELIMITER}"))?;
        let registry = self.connections.lock();
        let mut names: Vec<&String> = registry.keys().collect();
        names.sort_by_key(|name| std::cmp::Reverse(name.len()));
        for name in names {
            if let Some(rest) = stripped.strip_prefix(name.as_str()) {
                if let Some(tool) = rest.strip_prefix(TOOL_NAME_DELIMITER) {
                    return Some((name.clone(), tool.to_string()));
                }
            }
        }
        None
    }

    /// Invoke a tool on a server. Resolves to an outcome in every case —
    /// unknown server, degraded connection, transport failure and timeout
    /// all become `{error}` values rather than panics or `Err`s.
    pub async fn call_tool(&self, server: &str, tool: &str, arguments: Value) -> ToolOutcome {
        let conn = {
            let registry = self.connections.lock();
            match registry.get(server) {
                Some(conn) => conn.clone(),
                None => {
                    let known = registry.keys().cloned().collect();
                    let err = McpError::NotFound {
                        kind: "server",
                        name: server.to_string(),
                        context: known_servers_hint(known),
                    };
                    return ToolOutcome::Failure(err.to_string());
                }
            }
        };

        let status = conn.status();
        if status != ConnectionStatus::Connected {
            let diagnostics = conn.diagnostics();
            let detail = if diagnostics.is_empty() {
                String::new()
            } else {
                format!("; {diagnostics}")
            };
            return ToolOutcome::Failure(format!("server '{server}' is {status}{detail}"));
        }

        let timeout_ms = conn
            .config()
            .tool_timeout_ms
            .unwrap_or(self.settings.call_timeout_ms);
        let params = tool_call_params(tool, arguments);

        match conn.request("tools/call", Some(params), timeout_ms).await {
            Ok(Ok(result)) => normalize_tool_result(Some(result)),
            Ok(Err(rpc)) => {
                let err = McpError::Tool {
                    server: server.to_string(),
                    tool: tool.to_string(),
                    message: rpc.to_string(),
                };
                ToolOutcome::Failure(err.to_string())
            }
            Err(e) => ToolOutcome::Failure(e.to_string()),
        }
    }

    /// Explicitly retry a `disconnected`/`error` server. A server that is
    /// already connecting or connected is left alone.
    pub async fn reconnect(&self, server: &str) -> Result<(), McpError> {
        let conn = {
            let registry = self.connections.lock();
            match registry.get(server) {
                Some(conn) => conn.clone(),
                None => {
                    return Err(McpError::NotFound {
                        kind: "server",
                        name: server.to_string(),
                        context: "reconnect".into(),
                    })
                }
            }
        };
        if !conn.begin_reconnect() {
            return Ok(());
        }
        connect_with_retry(&conn, &self.settings).await
    }

    /// Re-run tool discovery on a connected server and replace its cache.
    pub async fn refresh_tools(&self, server: &str) -> Result<usize, McpError> {
        let conn = {
            let registry = self.connections.lock();
            match registry.get(server) {
                Some(conn) => conn.clone(),
                None => {
                    return Err(McpError::NotFound {
                        kind: "server",
                        name: server.to_string(),
                        context: "refresh tools".into(),
                    })
                }
            }
        };
        if conn.status() != ConnectionStatus::Connected {
            return Err(McpError::Connection {
                server: server.to_string(),
                source: TransportError::Closed,
            });
        }
        conn.discover_tools(self.settings.list_timeout_ms).await
    }

    /// Per-server snapshots, sorted by name.
    pub fn server_statuses(&self) -> Vec<ServerStatus> {
        self.sorted_connections()
            .iter()
            .map(|conn| ServerStatus {
                name: conn.name().to_string(),
                status: conn.status(),
                tool_count: conn.tools().len(),
                attempts: conn.attempts(),
                last_attempt: conn.last_attempt(),
                diagnostics: conn.diagnostics(),
            })
            .collect()
    }

    /// Tear everything down: reject in-flight requests, close every
    /// transport (each independently — one failure cannot block the rest)
    /// and clear the registry. Idempotent, and the manager can be
    /// re-initialized afterwards.
    pub async fn shutdown(&self) {
        let connections: Vec<Arc<Connection>> = {
            let mut registry = self.connections.lock();
            registry.drain().map(|(_, conn)| conn).collect()
        };
        if connections.is_empty() {
            return;
        }
        futures_util::future::join_all(connections.iter().map(|conn| conn.teardown())).await;
        tracing::info!(servers = connections.len(), "manager shut down");
    }

    fn sorted_connections(&self) -> Vec<Arc<Connection>> {
        let registry = self.connections.lock();
        let mut connections: Vec<_> = registry.values().cloned().collect();
        connections.sort_by(|a, b| a.name().cmp(b.name()));
        connections
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Connect with retry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Attempt to connect up to `retry.max_attempts` times with jittered
/// exponential back-off in between. Exhaustion marks the connection
/// `error` and returns the last attempt's failure.
async fn connect_with_retry(
    conn: &Arc<Connection>,
    settings: &ManagerSettings,
) -> Result<(), McpError> {
    // A stale transport from an earlier cycle must not leak.
    conn.teardown().await;

    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match Arc::clone(conn).establish(settings).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                tracing::warn!(
                    server = %conn.name(),
                    attempt,
                    error = %e,
                    "connect attempt failed"
                );
                conn.note(&format!("attempt {attempt} failed: {e}"));
                if settings.retry.exhausted(attempt) {
                    conn.mark_error();
                    return Err(e);
                }
                tokio::time::sleep(settings.retry.delay_after(attempt)).await;
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool name qualification
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Qualify a tool name as `mcp__{server}__{tool}`, truncating with a
/// digest suffix when the result would exceed [`MAX_TOOL_NAME_LENGTH`].
fn qualify_tool_name(server: &str, tool: &str) -> String {
    let qualified =
        format!("{TOOL_NAMESPACE}{TOOL_NAME_DELIMITER}{server}{TOOL_NAME_DELIMITER}{tool}");
    if qualified.len() <= MAX_TOOL_NAME_LENGTH {
        return qualified;
    }

    let digest = Sha256::digest(qualified.as_bytes());
    let hex = format!("{digest:x}");
    let suffix = &hex[..HASH_SUFFIX_LENGTH];

    let mut cut = MAX_TOOL_NAME_LENGTH - HASH_SUFFIX_LENGTH;
    while !qualified.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}{}", &qualified[..cut], suffix)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;
    use std::time::Duration;

    use serde_json::json;

    use conduit_domain::config::McpTransportKind;

    fn quick_settings() -> ManagerSettings {
        ManagerSettings {
            ready_timeout_ms: 400,
            list_timeout_ms: 2_000,
            call_timeout_ms: 2_000,
            retry: RetryPolicy {
                max_attempts: 1,
                initial_delay: Duration::from_millis(50),
                ..Default::default()
            },
        }
    }

    fn stdio_config(name: &str, command: &str, args: Vec<String>) -> McpServerConfig {
        McpServerConfig {
            name: name.into(),
            transport: McpTransportKind::Stdio,
            command: command.into(),
            args,
            env: StdHashMap::new(),
            url: None,
            tool_timeout_ms: None,
        }
    }

    #[test]
    fn qualify_short_names() {
        assert_eq!(qualify_tool_name("echo", "echo"), "mcp__echo__echo");
        assert_eq!(qualify_tool_name("fs", "read_file"), "mcp__fs__read_file");
    }

    #[test]
    fn qualify_overlong_names_are_capped_and_distinct() {
        let a = qualify_tool_name(
            "my_server",
            "extremely_lengthy_tool_name_that_surpasses_all_reasonable_limits",
        );
        let b = qualify_tool_name(
            "my_server",
            "yet_another_extremely_lengthy_tool_name_that_surpasses_all_reasonable_limits",
        );
        assert_eq!(a.len(), MAX_TOOL_NAME_LENGTH);
        assert_eq!(b.len(), MAX_TOOL_NAME_LENGTH);
        assert_ne!(a, b);
        assert!(a.starts_with("mcp__my_server__"));
    }

    #[test]
    fn default_settings_match_contract() {
        let s = ManagerSettings::default();
        assert_eq!(s.ready_timeout_ms, 5_000);
        assert_eq!(s.list_timeout_ms, 5_000);
        assert_eq!(s.call_timeout_ms, 30_000);
        assert_eq!(s.retry.max_attempts, 3);
    }

    #[tokio::test]
    async fn call_tool_unknown_server_never_panics() {
        let manager = McpManager::default();
        let outcome = manager.call_tool("ghost", "anything", json!({})).await;
        match outcome {
            ToolOutcome::Failure(msg) => {
                assert!(msg.contains("unknown server 'ghost'"));
                assert!(msg.contains("no servers configured"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn initialize_dedupes_by_first_occurrence() {
        let manager = McpManager::new(quick_settings());
        manager
            .initialize(vec![
                stdio_config("dup", "conduit-missing-local", vec![]),
                stdio_config("dup", "conduit-missing-global", vec![]),
            ])
            .await;

        let statuses = manager.server_statuses();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].name, "dup");
        assert_eq!(statuses[0].status, ConnectionStatus::Error);
        assert_eq!(statuses[0].attempts, 1);
        // The local-scope (first) config was the one attempted.
        assert!(statuses[0].diagnostics.contains("conduit-missing-local"));
        assert!(!statuses[0].diagnostics.contains("conduit-missing-global"));
    }

    #[tokio::test]
    async fn failed_server_is_listed_as_known() {
        let manager = McpManager::new(quick_settings());
        manager
            .initialize(vec![stdio_config("broken", "conduit-missing-cmd", vec![])])
            .await;

        let outcome = manager.call_tool("ghost", "x", json!({})).await;
        match outcome {
            ToolOutcome::Failure(msg) => assert!(msg.contains("known servers: broken")),
            other => panic!("expected failure, got {other:?}"),
        }

        // The broken server itself reports its degraded status.
        let outcome = manager.call_tool("broken", "x", json!({})).await;
        match outcome {
            ToolOutcome::Failure(msg) => {
                assert!(msg.contains("'broken' is error"));
                assert!(msg.contains("conduit-missing-cmd"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn resolve_qualified_names_longest_server_first() {
        let manager = McpManager::new(quick_settings());
        manager
            .initialize(vec![
                stdio_config("my", "conduit-missing-a", vec![]),
                stdio_config("my_server", "conduit-missing-b", vec![]),
            ])
            .await;

        assert_eq!(
            manager.resolve_tool_name("mcp__my_server__read_file"),
            Some(("my_server".into(), "read_file".into()))
        );
        assert_eq!(
            manager.resolve_tool_name("mcp__my__tool"),
            Some(("my".into(), "tool".into()))
        );
        assert_eq!(manager.resolve_tool_name("not_qualified"), None);
        assert_eq!(manager.resolve_tool_name("mcp__unknown__tool"), None);
    }

    // ── process-backed tests (fake servers as shell scripts) ───────

    #[cfg(unix)]
    mod process {
        use super::*;
        use conduit_domain::tool::ToolDescriptor;

        const ECHO_SERVER: &str = r##"
echo "echo server ready" >&2
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed 's/.*"id":\([0-9]*\).*/\1/')
  case "$line" in
    *tools/list*) printf '%s\n' '{"jsonrpc":"2.0","id":'"$id"',"result":{"tools":[{"name":"echo","description":"echoes input","inputSchema":{}}]}}' ;;
    *tools/call*) printf '%s\n' '{"jsonrpc":"2.0","id":'"$id"',"result":{"content":[{"type":"text","text":"hi"}]}}' ;;
  esac
done
"##;

        fn write_script(dir: &tempfile::TempDir, name: &str, body: &str) -> String {
            let path = dir.path().join(name);
            std::fs::write(&path, body).unwrap();
            path.to_string_lossy().into_owned()
        }

        #[tokio::test]
        async fn end_to_end_stdio_echo_server() {
            let dir = tempfile::tempdir().unwrap();
            let script = write_script(&dir, "echo-server.sh", ECHO_SERVER);

            let manager = McpManager::new(quick_settings());
            manager
                .initialize(vec![stdio_config("echo", "sh", vec![script])])
                .await;

            assert_eq!(
                manager.server_statuses()[0].status,
                ConnectionStatus::Connected
            );
            assert_eq!(
                manager.available_tools(),
                vec![ToolDescriptor {
                    name: "mcp__echo__echo".into(),
                    description: "echoes input".into(),
                    parameters: json!({}),
                }]
            );

            let outcome = manager.call_tool("echo", "echo", json!({"message": "hi"})).await;
            assert_eq!(outcome, ToolOutcome::Success(json!("hi")));

            manager.shutdown().await;
        }

        #[tokio::test]
        async fn server_without_readiness_signal_still_connects() {
            // Same server, but completely silent on stderr: the optimistic
            // readiness fallback must kick in instead of hanging.
            let script_body = r##"
while IFS= read -r line; do
  case "$line" in
    *tools/list*) printf '%s\n' '{"id":1,"result":{"tools":[{"name":"quiet"}]}}' ;;
  esac
done
"##;
            let dir = tempfile::tempdir().unwrap();
            let script = write_script(&dir, "quiet-server.sh", script_body);

            let manager = McpManager::new(quick_settings());
            let started = std::time::Instant::now();
            manager
                .initialize(vec![stdio_config("quiet", "sh", vec![script])])
                .await;

            let statuses = manager.server_statuses();
            assert_eq!(statuses[0].status, ConnectionStatus::Connected);
            assert_eq!(statuses[0].tool_count, 1);
            // Bounded by the readiness timeout, not hanging indefinitely.
            assert!(started.elapsed() < Duration::from_secs(5));
            manager.shutdown().await;
        }

        #[tokio::test]
        async fn out_of_order_replies_reach_their_own_callers() {
            // After discovery (id 1), the server reads both calls (ids 2
            // and 3) before answering in reverse order.
            let script_body = r##"
echo "ready" >&2
IFS= read -r line1
printf '%s\n' '{"id":1,"result":{"tools":[{"name":"a"},{"name":"b"}]}}'
IFS= read -r line2
IFS= read -r line3
printf '%s\n' '{"id":3,"result":{"content":[{"type":"text","text":"reply-3"}]}}'
printf '%s\n' '{"id":2,"result":{"content":[{"type":"text","text":"reply-2"}]}}'
while IFS= read -r line; do :; done
"##;
            let dir = tempfile::tempdir().unwrap();
            let script = write_script(&dir, "ooo-server.sh", script_body);

            let manager = McpManager::new(quick_settings());
            manager
                .initialize(vec![stdio_config("ooo", "sh", vec![script])])
                .await;
            assert_eq!(
                manager.server_statuses()[0].status,
                ConnectionStatus::Connected
            );

            let (first, second) = tokio::join!(
                manager.call_tool("ooo", "a", json!({})),
                manager.call_tool("ooo", "b", json!({})),
            );
            assert_eq!(first, ToolOutcome::Success(json!("reply-2")));
            assert_eq!(second, ToolOutcome::Success(json!("reply-3")));

            manager.shutdown().await;
        }

        #[tokio::test]
        async fn timed_out_call_frees_its_slot_and_late_reply_is_dropped() {
            let script_body = r##"
echo "ready" >&2
IFS= read -r line
printf '%s\n' '{"id":1,"result":{"tools":[{"name":"sleepy"}]}}'
IFS= read -r line
sleep 1
printf '%s\n' '{"id":2,"result":{"content":[{"type":"text","text":"late"}]}}'
IFS= read -r line
printf '%s\n' '{"id":3,"result":{"content":[{"type":"text","text":"prompt"}]}}'
while IFS= read -r line; do :; done
"##;
            let dir = tempfile::tempdir().unwrap();
            let script = write_script(&dir, "slow-server.sh", script_body);

            let mut config = stdio_config("slow", "sh", vec![script]);
            config.tool_timeout_ms = Some(200);

            let manager = McpManager::new(quick_settings());
            manager.initialize(vec![config]).await;

            let outcome = manager.call_tool("slow", "sleepy", json!({})).await;
            match outcome {
                ToolOutcome::Failure(msg) => {
                    assert!(msg.contains("timed out after 200ms"), "got: {msg}");
                }
                other => panic!("expected timeout failure, got {other:?}"),
            }

            // The table slot is freed immediately.
            let pending = {
                let registry = manager.connections.lock();
                registry.get("slow").unwrap().clone()
            };
            assert_eq!(pending.pending_requests(), 0);

            // Let the late reply for id 2 arrive; it must be dropped
            // without disturbing the next call.
            tokio::time::sleep(Duration::from_millis(1_200)).await;
            let outcome = manager.call_tool("slow", "sleepy", json!({})).await;
            assert_eq!(outcome, ToolOutcome::Success(json!("prompt")));

            manager.shutdown().await;
        }

        #[tokio::test]
        async fn retry_succeeds_on_second_attempt_after_one_backoff() {
            // First run exits immediately; every run after finds the marker
            // file and behaves like a real server.
            let script_body = r##"
marker="$1"
if [ -f "$marker" ]; then
  echo "server ready" >&2
  while IFS= read -r line; do
    case "$line" in
      *tools/list*) printf '%s\n' '{"id":1,"result":{"tools":[]}}' ;;
    esac
  done
else
  : > "$marker"
  exit 1
fi
"##;
            let dir = tempfile::tempdir().unwrap();
            let script = write_script(&dir, "flaky-server.sh", script_body);
            let marker = dir.path().join("came-up").to_string_lossy().into_owned();

            let settings = ManagerSettings {
                retry: RetryPolicy::default(), // 3 attempts, 500ms base
                ..quick_settings()
            };
            let manager = McpManager::new(settings);

            let started = std::time::Instant::now();
            manager
                .initialize(vec![stdio_config("flaky", "sh", vec![script, marker])])
                .await;
            let elapsed = started.elapsed();

            let statuses = manager.server_statuses();
            assert_eq!(statuses[0].status, ConnectionStatus::Connected);
            assert_eq!(statuses[0].attempts, 2);
            // Exactly one backoff delay: 500ms base + up to 200ms jitter.
            assert!(elapsed >= Duration::from_millis(450), "elapsed: {elapsed:?}");
            assert!(elapsed < Duration::from_secs(2), "elapsed: {elapsed:?}");

            manager.shutdown().await;
        }

        #[tokio::test]
        async fn tools_only_from_connected_servers() {
            let dir = tempfile::tempdir().unwrap();
            let script = write_script(&dir, "echo-server.sh", ECHO_SERVER);

            let manager = McpManager::new(quick_settings());
            manager
                .initialize(vec![
                    stdio_config("echo", "sh", vec![script]),
                    stdio_config("broken", "conduit-missing-cmd", vec![]),
                ])
                .await;

            let tools = manager.available_tools();
            assert!(!tools.is_empty());
            assert!(tools.iter().all(|t| t.name.starts_with("mcp__echo__")));

            let statuses = manager.server_statuses();
            assert_eq!(statuses.len(), 2);
            let by_name: StdHashMap<_, _> =
                statuses.iter().map(|s| (s.name.as_str(), s.status)).collect();
            assert_eq!(by_name["echo"], ConnectionStatus::Connected);
            assert_eq!(by_name["broken"], ConnectionStatus::Error);

            manager.shutdown().await;
        }

        #[tokio::test]
        async fn shutdown_is_idempotent_and_reinitializable() {
            let dir = tempfile::tempdir().unwrap();
            let script = write_script(&dir, "echo-server.sh", ECHO_SERVER);

            let manager = McpManager::new(quick_settings());
            manager
                .initialize(vec![stdio_config("echo", "sh", vec![script.clone()])])
                .await;
            assert!(!manager.available_tools().is_empty());

            manager.shutdown().await;
            manager.shutdown().await;

            assert!(manager.server_statuses().is_empty());
            let outcome = manager.call_tool("echo", "echo", json!({})).await;
            match outcome {
                ToolOutcome::Failure(msg) => assert!(msg.contains("unknown server 'echo'")),
                other => panic!("expected failure, got {other:?}"),
            }

            // The manager is reusable after shutdown.
            manager
                .initialize(vec![stdio_config("echo", "sh", vec![script])])
                .await;
            assert_eq!(
                manager.server_statuses()[0].status,
                ConnectionStatus::Connected
            );
            manager.shutdown().await;
        }

        #[tokio::test]
        async fn refresh_tools_replaces_the_cache() {
            let dir = tempfile::tempdir().unwrap();
            let script = write_script(&dir, "echo-server.sh", ECHO_SERVER);

            let manager = McpManager::new(quick_settings());
            manager
                .initialize(vec![stdio_config("echo", "sh", vec![script])])
                .await;

            let count = manager.refresh_tools("echo").await.unwrap();
            assert_eq!(count, 1);
            assert_eq!(manager.available_tools().len(), 1);

            let err = manager.refresh_tools("ghost").await.unwrap_err();
            assert!(matches!(err, McpError::NotFound { .. }));

            manager.shutdown().await;
        }

        #[tokio::test]
        async fn reconnect_after_server_death() {
            // The first tools/call makes the server exit; reconnect brings
            // up a fresh process.
            // Request ids keep counting across reconnect cycles, so this
            // server echoes whatever id it was sent.
            let script_body = r##"
echo "ready" >&2
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed 's/.*"id":\([0-9]*\).*/\1/')
  case "$line" in
    *tools/list*) printf '%s\n' '{"id":'"$id"',"result":{"tools":[{"name":"die"}]}}' ;;
    *tools/call*) exit 0 ;;
  esac
done
"##;
            let dir = tempfile::tempdir().unwrap();
            let script = write_script(&dir, "mortal-server.sh", script_body);

            let mut config = stdio_config("mortal", "sh", vec![script]);
            config.tool_timeout_ms = Some(300);

            let manager = McpManager::new(quick_settings());
            manager.initialize(vec![config]).await;
            assert_eq!(
                manager.server_statuses()[0].status,
                ConnectionStatus::Connected
            );

            // The call never gets an answer; the exit tears the pipe down.
            let outcome = manager.call_tool("mortal", "die", json!({})).await;
            assert!(outcome.is_failure());

            // Give the exit event a moment to land, then retry explicitly.
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert_eq!(
                manager.server_statuses()[0].status,
                ConnectionStatus::Disconnected
            );

            manager.reconnect("mortal").await.unwrap();
            assert_eq!(
                manager.server_statuses()[0].status,
                ConnectionStatus::Connected
            );

            // Reconnecting a healthy server is a no-op.
            manager.reconnect("mortal").await.unwrap();

            let err = manager.reconnect("ghost").await.unwrap_err();
            assert!(matches!(err, McpError::NotFound { .. }));

            manager.shutdown().await;
        }
    }

    // ── SSE end-to-end against an in-process server ────────────────

    mod sse_end_to_end {
        use super::*;
        use axum::extract::State;
        use axum::http::StatusCode;
        use axum::response::sse::{Event, Sse};
        use axum::routing::get;
        use axum::Router;
        use futures_util::Stream;
        use std::convert::Infallible;
        use tokio::sync::broadcast;

        async fn stream_handler(
            State(tx): State<broadcast::Sender<String>>,
        ) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
            let rx = tx.subscribe();
            let stream = futures_util::stream::unfold(rx, |mut rx| async move {
                match rx.recv().await {
                    Ok(message) => Some((Ok(Event::default().data(message)), rx)),
                    Err(_) => None,
                }
            });
            Sse::new(stream)
        }

        async fn post_handler(
            State(tx): State<broadcast::Sender<String>>,
            body: String,
        ) -> StatusCode {
            let request: Value = serde_json::from_str(&body).unwrap_or(Value::Null);
            let id = request["id"].clone();
            let response = match request["method"].as_str() {
                Some("tools/list") => json!({
                    "jsonrpc": "2.0", "id": id,
                    "result": {"tools": [{"name": "ping", "description": "pong", "inputSchema": {}}]}
                }),
                Some("tools/call") => json!({
                    "jsonrpc": "2.0", "id": id,
                    "result": {"content": [{"type": "text", "text": "pong"}]}
                }),
                _ => json!({
                    "jsonrpc": "2.0", "id": id,
                    "error": {"code": -32601, "message": "method not found"}
                }),
            };
            let _ = tx.send(response.to_string());
            StatusCode::ACCEPTED
        }

        #[tokio::test]
        async fn end_to_end_sse_server() {
            let (tx, _keepalive) = broadcast::channel::<String>(16);
            let app = Router::new()
                .route("/mcp", get(stream_handler).post(post_handler))
                .with_state(tx);
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(async move {
                let _ = axum::serve(listener, app).await;
            });

            let config = McpServerConfig {
                name: "remote".into(),
                transport: McpTransportKind::Sse,
                command: String::new(),
                args: vec![],
                env: StdHashMap::new(),
                url: Some(format!("http://{addr}/mcp")),
                tool_timeout_ms: None,
            };

            let manager = McpManager::new(quick_settings());
            manager.initialize(vec![config]).await;

            let statuses = manager.server_statuses();
            assert_eq!(statuses[0].status, ConnectionStatus::Connected);

            let tools = manager.available_tools();
            assert_eq!(tools.len(), 1);
            assert_eq!(tools[0].name, "mcp__remote__ping");
            assert_eq!(tools[0].description, "pong");

            let outcome = manager.call_tool("remote", "ping", json!({})).await;
            assert_eq!(outcome, ToolOutcome::Success(json!("pong")));

            manager.shutdown().await;
        }
    }
}
