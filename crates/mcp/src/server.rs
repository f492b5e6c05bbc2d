//! Tool-server process lifecycle: spawn, handshake, health, restart, stop.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex as SyncMutex, RwLock};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{Mutex, broadcast, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result, StartStage};
use crate::protocol::{
    CallToolParams, InitializeParams, InitializeResult, ListToolsResult, ServerNotification,
    ToolSpec,
};
use crate::transport::Transport;

/// Default timeout for the initialize handshake.
pub const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default interval between health checks.
pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(30);

/// Timeout for the lightweight health-check RPC.
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Recent stderr lines kept per server for diagnostics.
const STDERR_TAIL_LINES: usize = 100;

/// A unique identifier for a tool server. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerId(pub Uuid);

impl ServerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ServerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ServerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ServerId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Bounded-retry restart policy.
///
/// At most `max_restarts` restarts are permitted within a rolling `window`;
/// exceeding the budget stops the server permanently.
#[derive(Debug, Clone, Copy)]
pub struct RestartPolicy {
    pub max_restarts: u32,
    pub window: Duration,
    pub backoff_base: Duration,
    pub backoff_factor: u32,
    pub backoff_cap: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            window: Duration::from_secs(60),
            backoff_base: Duration::from_secs(1),
            backoff_factor: 2,
            backoff_cap: Duration::from_secs(30),
        }
    }
}

/// Configuration for one tool server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
    pub restart_policy: RestartPolicy,
    pub health_interval: Duration,
    pub init_timeout: Duration,
}

impl ServerConfig {
    pub fn new(command: impl Into<String>) -> Self {
        let command = command.into();
        Self {
            name: command.clone(),
            command,
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            restart_policy: RestartPolicy::default(),
            health_interval: DEFAULT_HEALTH_INTERVAL,
            init_timeout: DEFAULT_INIT_TIMEOUT,
        }
    }
}

/// Tool-server lifecycle states. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    Starting,
    Initializing,
    Ready,
    Degraded,
    Restarting,
    Stopping,
    Stopped,
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServerState::Starting => "starting",
            ServerState::Initializing => "initializing",
            ServerState::Ready => "ready",
            ServerState::Degraded => "degraded",
            ServerState::Restarting => "restarting",
            ServerState::Stopping => "stopping",
            ServerState::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

/// Lifecycle events emitted by a tool server.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    Ready,
    Degraded,
    Restarting { attempt: u32 },
    RestartExhausted,
    Stopped,
}

#[derive(Debug)]
struct Link {
    transport: Arc<Transport>,
    child: Child,
}

/// A managed tool-server subprocess.
///
/// Created via [`ToolServer::start`], which returns only after the child has
/// completed the initialize handshake and reported its tools. A supervision
/// task watches transport death and runs periodic health checks, restarting
/// the child within the configured [`RestartPolicy`].
#[derive(Debug)]
pub struct ToolServer {
    id: ServerId,
    config: ServerConfig,
    started_at: DateTime<Utc>,
    state: RwLock<ServerState>,
    link: Mutex<Option<Link>>,
    tools: RwLock<Option<Vec<ToolSpec>>>,
    ready_at: RwLock<Option<DateTime<Utc>>>,
    consecutive_failures: AtomicU32,
    restarts: SyncMutex<VecDeque<Instant>>,
    stderr_tail: Arc<SyncMutex<VecDeque<String>>>,
    events: broadcast::Sender<ServerEvent>,
}

impl ToolServer {
    /// Spawn the child, run the handshake, and hand the server to its
    /// supervisor. On failure the error is tagged with the failing stage
    /// (`spawn`, `init`, or `list`) and the child is gone.
    pub async fn start(config: ServerConfig) -> Result<Arc<ToolServer>> {
        let (events, _) = broadcast::channel(32);
        let server = Arc::new(ToolServer {
            id: ServerId::new(),
            config,
            started_at: Utc::now(),
            state: RwLock::new(ServerState::Starting),
            link: Mutex::new(None),
            tools: RwLock::new(None),
            ready_at: RwLock::new(None),
            consecutive_failures: AtomicU32::new(0),
            restarts: SyncMutex::new(VecDeque::new()),
            stderr_tail: Arc::new(SyncMutex::new(VecDeque::new())),
            events,
        });

        info!(id = %server.id, command = %server.config.command, "starting tool server");
        if let Err(e) = server.launch().await {
            server.kill_current().await;
            server.set_state(ServerState::Stopped);
            return Err(e);
        }

        let supervised = Arc::clone(&server);
        tokio::spawn(supervise(supervised));
        Ok(server)
    }

    pub fn id(&self) -> ServerId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn state(&self) -> ServerState {
        *self.state.read()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn ready_at(&self) -> Option<DateTime<Utc>> {
        *self.ready_at.read()
    }

    /// Declared tools, frozen after the first successful `tools/list`.
    pub fn tools(&self) -> Vec<ToolSpec> {
        self.tools.read().clone().unwrap_or_default()
    }

    /// Restarts currently counted against the rolling window.
    pub fn restart_count(&self) -> u32 {
        self.restarts.lock().len() as u32
    }

    /// Recent stderr output, oldest first.
    pub fn stderr_tail(&self) -> Vec<String> {
        self.stderr_tail.lock().iter().cloned().collect()
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    /// Invoke a declared tool. Undeclared tool names fail with
    /// [`Error::UnknownTool`] without touching the wire.
    pub async fn invoke(&self, tool: &str, args: Value, timeout: Duration) -> Result<Value> {
        match self.state() {
            ServerState::Ready | ServerState::Degraded => {}
            ServerState::Stopping | ServerState::Stopped => return Err(Error::Stopped),
            other => return Err(Error::NotReady(other.to_string())),
        }

        let declared = self
            .tools
            .read()
            .as_ref()
            .is_some_and(|tools| tools.iter().any(|t| t.name == tool));
        if !declared {
            return Err(Error::UnknownTool(tool.to_string()));
        }

        let transport = self.transport().await.ok_or(Error::TransportClosed)?;
        let params = serde_json::to_value(CallToolParams {
            name: tool.to_string(),
            arguments: args,
        })?;
        transport.call("tools/call", Some(params), timeout).await
    }

    /// One lightweight round-trip to confirm the server is responsive.
    pub async fn health_check(&self) -> Result<()> {
        let transport = self.transport().await.ok_or(Error::TransportClosed)?;
        transport
            .call("tools/list", None, HEALTH_TIMEOUT)
            .await
            .map(|_| ())
    }

    /// Graceful stop: best-effort `shutdown` notification, close stdin, wait
    /// up to `grace` for the child to exit, then terminate forcibly. All
    /// pending invocations fail with `transport closed`.
    pub async fn stop(&self, grace: Duration) {
        if matches!(self.state(), ServerState::Stopping | ServerState::Stopped) {
            return;
        }
        self.set_state(ServerState::Stopping);

        let link = self.link.lock().await.take();
        if let Some(Link { transport, mut child }) = link {
            let _ = transport.notify("shutdown", None);
            // Let the writer flush the shutdown line before tearing down.
            tokio::time::sleep(Duration::from_millis(50)).await;
            transport.close().await;
            if tokio::time::timeout(grace, child.wait()).await.is_err() {
                warn!(id = %self.id, "child did not exit within grace, killing");
                let _ = child.kill().await;
            }
        }

        self.set_state(ServerState::Stopped);
        let _ = self.events.send(ServerEvent::Stopped);
        info!(id = %self.id, "tool server stopped");
    }

    // --- internal ---

    fn set_state(&self, state: ServerState) {
        *self.state.write() = state;
    }

    async fn transport(&self) -> Option<Arc<Transport>> {
        self.link.lock().await.as_ref().map(|l| l.transport.clone())
    }

    async fn kill_current(&self) {
        if let Some(Link { transport, mut child }) = self.link.lock().await.take() {
            transport.close().await;
            let _ = child.kill().await;
        }
    }

    /// Move to `state` unless the server is already stopping or stopped.
    fn transition(&self, state: ServerState) -> bool {
        let mut current = self.state.write();
        if matches!(*current, ServerState::Stopping | ServerState::Stopped) {
            return false;
        }
        *current = state;
        true
    }

    /// Spawn the child and run the handshake. Shared by initial start and
    /// restart; the caller owns state transitions on failure.
    async fn launch(&self) -> Result<()> {
        if !self.transition(ServerState::Starting) {
            return Err(Error::Stopped);
        }

        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .envs(&self.config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.config.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn()?;
        let stdin = child.stdin.take().ok_or_else(|| Error::StartFailed {
            stage: StartStage::Spawn,
            reason: "failed to capture stdin".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| Error::StartFailed {
            stage: StartStage::Spawn,
            reason: "failed to capture stdout".to_string(),
        })?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_stderr(stderr, self.stderr_tail.clone(), self.id));
        }

        let (transport, notifications) = Transport::new(stdin, stdout);
        let transport = Arc::new(transport);
        tokio::spawn(drain_notifications(notifications, self.id));
        {
            let mut link = self.link.lock().await;
            if matches!(self.state(), ServerState::Stopping | ServerState::Stopped) {
                transport.close().await;
                let _ = child.kill().await;
                return Err(Error::Stopped);
            }
            *link = Some(Link {
                transport: transport.clone(),
                child,
            });
        }

        if !self.transition(ServerState::Initializing) {
            self.kill_current().await;
            return Err(Error::Stopped);
        }
        let params = serde_json::to_value(InitializeParams::default())?;
        let init = transport
            .call("initialize", Some(params), self.config.init_timeout)
            .await
            .map_err(|e| Error::StartFailed {
                stage: StartStage::Init,
                reason: e.to_string(),
            })?;
        if let Ok(result) = serde_json::from_value::<InitializeResult>(init) {
            debug!(
                id = %self.id,
                server = %result.server_info.name,
                protocol = %result.protocol_version,
                "initialize handshake complete"
            );
        }
        let _ = transport.notify("notifications/initialized", None);

        let listed = transport
            .call("tools/list", None, self.config.init_timeout)
            .await
            .map_err(|e| Error::StartFailed {
                stage: StartStage::List,
                reason: e.to_string(),
            })?;
        let listed: ListToolsResult =
            serde_json::from_value(listed).map_err(|e| Error::StartFailed {
                stage: StartStage::List,
                reason: e.to_string(),
            })?;

        // Declared tools freeze after the first successful list; a restart
        // handshake reporting a different set marks the server degraded.
        let degraded = {
            let mut slot = self.tools.write();
            match slot.as_ref() {
                None => {
                    *slot = Some(listed.tools);
                    false
                }
                Some(frozen) => !same_tool_names(frozen, &listed.tools),
            }
        };

        self.consecutive_failures.store(0, Ordering::Relaxed);
        if degraded {
            warn!(id = %self.id, "declared tools changed across restart");
            if !self.transition(ServerState::Degraded) {
                self.kill_current().await;
                return Err(Error::Stopped);
            }
            let _ = self.events.send(ServerEvent::Degraded);
        } else {
            if !self.transition(ServerState::Ready) {
                self.kill_current().await;
                return Err(Error::Stopped);
            }
            *self.ready_at.write() = Some(Utc::now());
            let _ = self.events.send(ServerEvent::Ready);
        }
        Ok(())
    }

    /// Restart loop. Returns `Err(RestartExhausted)` once the rolling-window
    /// budget is spent, after transitioning to permanent `Stopped`.
    async fn recover(&self) -> Result<()> {
        loop {
            if matches!(self.state(), ServerState::Stopping | ServerState::Stopped) {
                return Err(Error::Stopped);
            }
            let attempt = {
                let mut restarts = self.restarts.lock();
                restart_attempt(&mut restarts, &self.config.restart_policy, Instant::now())
            };
            let Some(attempt) = attempt else {
                warn!(id = %self.id, "restart budget exhausted, stopping permanently");
                self.kill_current().await;
                self.set_state(ServerState::Stopped);
                let _ = self.events.send(ServerEvent::RestartExhausted);
                let _ = self.events.send(ServerEvent::Stopped);
                return Err(Error::RestartExhausted);
            };

            if !self.transition(ServerState::Restarting) {
                return Err(Error::Stopped);
            }
            let _ = self.events.send(ServerEvent::Restarting { attempt });
            self.kill_current().await;

            let delay = backoff_delay(&self.config.restart_policy, attempt);
            let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=250));
            tokio::time::sleep(delay + jitter).await;

            match self.launch().await {
                Ok(()) => {
                    info!(id = %self.id, attempt, "restarted");
                    return Ok(());
                }
                Err(e) => {
                    warn!(id = %self.id, attempt, "restart failed: {e}");
                }
            }
        }
    }
}

/// Claim a restart slot against the rolling window, pruning expired entries.
fn restart_attempt(
    restarts: &mut VecDeque<Instant>,
    policy: &RestartPolicy,
    now: Instant,
) -> Option<u32> {
    while let Some(front) = restarts.front() {
        if now.duration_since(*front) > policy.window {
            restarts.pop_front();
        } else {
            break;
        }
    }
    if restarts.len() as u32 >= policy.max_restarts {
        return None;
    }
    restarts.push_back(now);
    Some(restarts.len() as u32)
}

/// Exponential backoff without jitter: base × factor^(attempt−1), capped.
fn backoff_delay(policy: &RestartPolicy, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    policy
        .backoff_base
        .saturating_mul(policy.backoff_factor.saturating_pow(exp))
        .min(policy.backoff_cap)
}

fn same_tool_names(a: &[ToolSpec], b: &[ToolSpec]) -> bool {
    let names = |tools: &[ToolSpec]| -> HashSet<String> {
        tools.iter().map(|t| t.name.clone()).collect()
    };
    names(a) == names(b)
}

/// Watch for transport death and run periodic health checks, restarting
/// within policy. Exits once the server reaches `Stopped`.
async fn supervise(server: Arc<ToolServer>) {
    let mut health = tokio::time::interval(server.config.health_interval);
    health.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    health.tick().await;

    loop {
        if matches!(server.state(), ServerState::Stopping | ServerState::Stopped) {
            break;
        }
        let transport = server.transport().await;
        let died = async {
            match &transport {
                Some(t) => t.wait_closed().await,
                None => std::future::pending().await,
            }
        };

        let failed = tokio::select! {
            _ = health.tick() => {
                match server.health_check().await {
                    Ok(()) => {
                        server.consecutive_failures.store(0, Ordering::Relaxed);
                        false
                    }
                    Err(e) => {
                        warn!(id = %server.id, "health check failed: {e}");
                        true
                    }
                }
            }
            _ = died => {
                warn!(id = %server.id, "transport died");
                true
            }
        };

        if matches!(server.state(), ServerState::Stopping | ServerState::Stopped) {
            break;
        }
        if failed {
            server.consecutive_failures.fetch_add(1, Ordering::Relaxed);
            if server.recover().await.is_err() {
                break;
            }
        }
    }
    debug!(id = %server.id, "supervisor exiting");
}

async fn drain_stderr(stderr: ChildStderr, tail: Arc<SyncMutex<VecDeque<String>>>, id: ServerId) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(id = %id, "stderr: {line}");
        let mut tail = tail.lock();
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
}

async fn drain_notifications(mut rx: mpsc::UnboundedReceiver<ServerNotification>, id: ServerId) {
    while let Some(note) = rx.recv().await {
        debug!(id = %id, method = %note.method, "server notification");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max: u32, window_secs: u64) -> RestartPolicy {
        RestartPolicy {
            max_restarts: max,
            window: Duration::from_secs(window_secs),
            ..RestartPolicy::default()
        }
    }

    #[test]
    fn restart_window_admits_up_to_budget() {
        let policy = policy(3, 60);
        let mut restarts = VecDeque::new();
        let now = Instant::now();
        assert_eq!(restart_attempt(&mut restarts, &policy, now), Some(1));
        assert_eq!(restart_attempt(&mut restarts, &policy, now), Some(2));
        assert_eq!(restart_attempt(&mut restarts, &policy, now), Some(3));
        assert_eq!(restart_attempt(&mut restarts, &policy, now), None);
    }

    #[test]
    fn restart_window_expires_old_entries() {
        let policy = policy(2, 60);
        let mut restarts = VecDeque::new();
        let start = Instant::now();
        assert_eq!(restart_attempt(&mut restarts, &policy, start), Some(1));
        assert_eq!(restart_attempt(&mut restarts, &policy, start), Some(2));
        assert_eq!(restart_attempt(&mut restarts, &policy, start), None);

        let later = start + Duration::from_secs(61);
        assert_eq!(restart_attempt(&mut restarts, &policy, later), Some(1));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RestartPolicy::default();
        assert_eq!(backoff_delay(&policy, 1), Duration::from_secs(1));
        assert_eq!(backoff_delay(&policy, 2), Duration::from_secs(2));
        assert_eq!(backoff_delay(&policy, 3), Duration::from_secs(4));
        assert_eq!(backoff_delay(&policy, 6), Duration::from_secs(30));
        assert_eq!(backoff_delay(&policy, 20), Duration::from_secs(30));
    }

    #[test]
    fn tool_sets_compare_by_name() {
        let tool = |name: &str| ToolSpec {
            name: name.to_string(),
            description: None,
            input_schema: serde_json::Value::Null,
        };
        assert!(same_tool_names(
            &[tool("a"), tool("b")],
            &[tool("b"), tool("a")]
        ));
        assert!(!same_tool_names(&[tool("a")], &[tool("a"), tool("b")]));
    }

    #[test]
    fn server_config_defaults() {
        let config = ServerConfig::new("mcp-filesystem");
        assert_eq!(config.name, "mcp-filesystem");
        assert_eq!(config.restart_policy.max_restarts, 5);
        assert_eq!(config.health_interval, DEFAULT_HEALTH_INTERVAL);
    }
}
