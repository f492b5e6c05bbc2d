//! Lifecycle tests against stub tool servers implemented as `sh` scripts
//! speaking the newline-delimited JSON-RPC protocol on stdio.

use std::time::Duration;

use mcp::{Error, RestartPolicy, ServerConfig, ServerEvent, ServerState, StartStage, ToolServer};

/// A well-behaved stub: answers the handshake and echoes `tools/call`.
/// When `QM_DIE_AFTER_LIST` names a path, the stub exits right after its
/// first `tools/list` reply unless that path already exists (creating it),
/// which simulates a crash on every run where the marker is absent.
const STUB: &str = r#"
while IFS= read -r line; do
  case "$line" in *'"id":'*) ;; *) continue;; esac
  id=${line#*'"id":'}
  id=${id%%,*}
  case "$line" in
    *'"method":"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","capabilities":{"tools":{}},"serverInfo":{"name":"stub","version":"0.0.0"}}}\n' "$id";;
    *'"method":"tools/list"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"echo","description":"Echo back","inputSchema":{"type":"object"}}]}}\n' "$id"
      if [ -n "$QM_DIE_AFTER_LIST" ] && [ ! -f "$QM_DIE_AFTER_LIST" ]; then
        if [ "$QM_DIE_ALWAYS" = "1" ]; then exit 0; fi
        : > "$QM_DIE_AFTER_LIST"
        exit 0
      fi;;
    *'"method":"tools/call"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"pong"}]}}\n' "$id";;
  esac
done
"#;

fn stub_config() -> ServerConfig {
    let mut config = ServerConfig::new("sh");
    config.name = "stub".to_string();
    config.args = vec!["-c".to_string(), STUB.to_string()];
    config
}

fn fast_restarts() -> RestartPolicy {
    RestartPolicy {
        max_restarts: 5,
        window: Duration::from_secs(60),
        backoff_base: Duration::from_millis(10),
        backoff_factor: 2,
        backoff_cap: Duration::from_millis(50),
    }
}

async fn wait_for<F: Fn() -> bool>(what: &str, deadline: Duration, check: F) {
    let start = tokio::time::Instant::now();
    while !check() {
        if start.elapsed() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn start_handshake_and_invoke() {
    let server = ToolServer::start(stub_config()).await.unwrap();
    assert_eq!(server.state(), ServerState::Ready);
    assert!(server.ready_at().is_some());

    let tools = server.tools();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name, "echo");

    let result = server
        .invoke("echo", serde_json::json!({"msg": "hi"}), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(result["content"][0]["text"], "pong");

    server.stop(Duration::from_secs(2)).await;
    assert_eq!(server.state(), ServerState::Stopped);
}

#[tokio::test]
async fn invoke_undeclared_tool_fails_without_wire_call() {
    let server = ToolServer::start(stub_config()).await.unwrap();

    let outcome = server
        .invoke("not_a_tool", serde_json::Value::Null, Duration::from_secs(1))
        .await;
    assert!(matches!(outcome, Err(Error::UnknownTool(name)) if name == "not_a_tool"));

    server.stop(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn invoke_after_stop_fails() {
    let server = ToolServer::start(stub_config()).await.unwrap();
    server.stop(Duration::from_secs(2)).await;

    let outcome = server
        .invoke("echo", serde_json::Value::Null, Duration::from_secs(1))
        .await;
    assert!(matches!(outcome, Err(Error::Stopped)));
}

#[tokio::test]
async fn spawn_failure_is_stage_tagged() {
    let config = ServerConfig::new("/nonexistent/quartermaster-test-binary");
    let err = ToolServer::start(config).await.unwrap_err();
    assert_eq!(err.start_stage(), Some(StartStage::Spawn));
}

#[tokio::test]
async fn init_timeout_is_stage_tagged() {
    // Reads requests but never answers.
    let mut config = ServerConfig::new("sh");
    config.args = vec!["-c".to_string(), "while IFS= read -r l; do :; done".to_string()];
    config.init_timeout = Duration::from_millis(200);

    let err = ToolServer::start(config).await.unwrap_err();
    assert_eq!(err.start_stage(), Some(StartStage::Init));
}

#[tokio::test]
async fn crash_triggers_restart_preserving_identity_and_tools() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("ran-once");

    let mut config = stub_config();
    config.env.insert(
        "QM_DIE_AFTER_LIST".to_string(),
        marker.display().to_string(),
    );
    config.restart_policy = fast_restarts();
    config.health_interval = Duration::from_millis(100);

    let server = ToolServer::start(config).await.unwrap();
    let id = server.id();
    let tools_before = server.tools();

    // The stub exits right after the first handshake; the supervisor should
    // bring it back and the second run stays alive.
    wait_for("restart to complete", Duration::from_secs(10), || {
        server.restart_count() >= 1 && server.state() == ServerState::Ready
    })
    .await;

    assert_eq!(server.id(), id);
    assert_eq!(server.tools(), tools_before);

    let result = server
        .invoke("echo", serde_json::json!({}), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(result["content"][0]["text"], "pong");

    server.stop(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn restart_storm_exhausts_budget_and_stops_permanently() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("never-created");

    let mut config = stub_config();
    config.env.insert(
        "QM_DIE_AFTER_LIST".to_string(),
        marker.display().to_string(),
    );
    config.env.insert("QM_DIE_ALWAYS".to_string(), "1".to_string());
    config.restart_policy = RestartPolicy {
        max_restarts: 2,
        ..fast_restarts()
    };
    config.health_interval = Duration::from_millis(100);

    let server = ToolServer::start(config).await.unwrap();
    let mut events = server.subscribe();

    let mut saw_restarting = false;
    let mut saw_exhausted = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    while !saw_exhausted {
        let event = tokio::time::timeout_at(deadline, events.recv())
            .await
            .expect("restart exhaustion within deadline")
            .expect("event stream open");
        match event {
            ServerEvent::Restarting { .. } => saw_restarting = true,
            ServerEvent::RestartExhausted => saw_exhausted = true,
            _ => {}
        }
    }
    assert!(saw_restarting);

    wait_for("permanent stop", Duration::from_secs(5), || {
        server.state() == ServerState::Stopped
    })
    .await;
}
