//! End-to-end tests: registry routing, the acquisition pipeline, and the
//! control loop, against stub tool servers implemented as `sh` scripts.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use acquire::{Candidate, Catalog, CatalogEntry, Error as AcquireError, Fetcher, InstallStage, RunSpec};
use mcp::ServerConfig;
use runtime::{AcquireOptions, Event, Outcome, Settings, SupervisorBuilder};
use variety::{CapabilityDescriptor, EnvironmentSnapshot, Priority};

const STUB: &str = r#"
while IFS= read -r line; do
  case "$line" in *'"id":'*) ;; *) continue;; esac
  id=${line#*'"id":'}
  id=${id%%,*}
  case "$line" in
    *'"method":"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","capabilities":{"tools":{}},"serverInfo":{"name":"stub","version":"0.0.0"}}}\n' "$id";;
    *'"method":"tools/list"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"%s","description":"stub tool","inputSchema":{"type":"object"}}]}}\n' "$id" "${QM_TOOL:-echo}";;
    *'"method":"tools/call"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"pong"}]}}\n' "$id";;
  esac
done
"#;

fn stub_server_config(name: &str, tool: &str) -> ServerConfig {
    let mut config = ServerConfig::new("sh");
    config.name = name.to_string();
    config.args = vec!["-c".to_string(), STUB.to_string()];
    config.env.insert("QM_TOOL".to_string(), tool.to_string());
    config
}

/// Catalog returning a fixed candidate list regardless of term.
struct FakeCatalog {
    entries: Vec<CatalogEntry>,
}

impl FakeCatalog {
    fn with_packages(packages: &[(&str, f64)]) -> Arc<Self> {
        let entries = packages
            .iter()
            .map(|(name, popularity)| CatalogEntry {
                name: name.to_string(),
                version: "1.0.0".to_string(),
                description: "stub tool server".to_string(),
                keywords: vec![
                    "mcp".to_string(),
                    "web".to_string(),
                    "search".to_string(),
                    "filesystem".to_string(),
                    "tools".to_string(),
                ],
                popularity: *popularity,
                last_updated: Utc::now(),
            })
            .collect();
        Arc::new(Self { entries })
    }
}

#[async_trait]
impl Catalog for FakeCatalog {
    fn name(&self) -> &str {
        "fake"
    }

    async fn search(&self, _term: &str) -> acquire::Result<Vec<CatalogEntry>> {
        Ok(self.entries.clone())
    }
}

/// Catalog that answers slowly, for coalescing tests.
struct SlowCatalog {
    inner: Arc<FakeCatalog>,
    delay: Duration,
}

#[async_trait]
impl Catalog for SlowCatalog {
    fn name(&self) -> &str {
        "slow"
    }

    async fn search(&self, term: &str) -> acquire::Result<Vec<CatalogEntry>> {
        tokio::time::sleep(self.delay).await;
        self.inner.search(term).await
    }
}

/// Fetcher whose run spec launches the stub with a chosen tool name.
struct StubFetcher {
    tool: String,
    fail_names: HashSet<String>,
}

impl StubFetcher {
    fn new(tool: &str) -> Arc<Self> {
        Arc::new(Self {
            tool: tool.to_string(),
            fail_names: HashSet::new(),
        })
    }

    fn failing_for(tool: &str, names: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            tool: tool.to_string(),
            fail_names: names.iter().map(|s| s.to_string()).collect(),
        })
    }
}

#[async_trait]
impl Fetcher for StubFetcher {
    async fn fetch(&self, candidate: &Candidate, dest: &Path) -> acquire::Result<()> {
        if self.fail_names.contains(&candidate.name) {
            return Err(AcquireError::install(
                InstallStage::Fetch,
                "synthetic install failure",
            ));
        }
        std::fs::write(dest.join("installed"), b"ok")
            .map_err(|e| AcquireError::install(InstallStage::Fetch, e.to_string()))
    }

    fn run_spec(&self, _candidate: &Candidate, dest: &Path) -> RunSpec {
        let mut env = HashMap::new();
        env.insert("QM_TOOL".to_string(), self.tool.clone());
        RunSpec {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), STUB.to_string()],
            env,
            cwd: Some(dest.to_path_buf()),
        }
    }
}

fn test_settings(install_root: &Path) -> Settings {
    Settings {
        tick_interval: Duration::from_millis(50),
        install_root: install_root.to_path_buf(),
        ..Settings::default()
    }
}

fn search_descriptor() -> CapabilityDescriptor {
    CapabilityDescriptor::new("search", Priority::High, ["web", "search"])
}

async fn wait_until<F: Fn() -> bool>(what: &str, deadline: Duration, check: F) {
    let start = tokio::time::Instant::now();
    while !check() {
        if start.elapsed() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn registry_roundtrip_bind_resolve_invoke_unbind() {
    let root = tempfile::tempdir().unwrap();
    let (supervisor, _daemon) = SupervisorBuilder::new(test_settings(root.path())).build();

    let id = supervisor
        .manager()
        .start_server(stub_server_config("stub", "echo"))
        .await
        .unwrap();

    assert_eq!(supervisor.refresh(), 1);
    let binding = supervisor.registry().resolve("echo").unwrap();
    assert_eq!(binding.server_id, id);
    assert_eq!(binding.tool, "echo");

    let result = supervisor
        .invoke("echo", serde_json::json!({"q": 1}), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(result["content"][0]["text"], "pong");

    assert!(supervisor.registry().unbind("echo"));
    assert!(matches!(
        supervisor.registry().resolve("echo"),
        Err(runtime::Error::NotBound(_))
    ));

    supervisor.manager().stop_server(&id).await.unwrap();
}

#[tokio::test]
async fn rebind_replaces_atomically_with_no_stale_window() {
    let root = tempfile::tempdir().unwrap();
    let (supervisor, _daemon) = SupervisorBuilder::new(test_settings(root.path())).build();

    let first = supervisor
        .manager()
        .start_server(stub_server_config("first", "echo"))
        .await
        .unwrap();
    let second = supervisor
        .manager()
        .start_server(stub_server_config("second", "echo"))
        .await
        .unwrap();

    // Convention refresh: earliest-started server wins the shared name.
    supervisor.refresh();
    assert_eq!(supervisor.registry().resolve("echo").unwrap().server_id, first);

    // Explicit rebind replaces in one step.
    supervisor.registry().bind("echo", second, "echo").unwrap();
    assert_eq!(supervisor.registry().resolve("echo").unwrap().server_id, second);

    supervisor.manager().stop_all().await;
}

#[tokio::test]
async fn stopping_a_server_drops_its_bindings() {
    let root = tempfile::tempdir().unwrap();
    let (supervisor, _daemon) = SupervisorBuilder::new(test_settings(root.path())).build();

    let id = supervisor
        .manager()
        .start_server(stub_server_config("stub", "fs.list"))
        .await
        .unwrap();
    supervisor.refresh();
    assert!(supervisor.registry().resolve("fs.list").is_ok());

    supervisor.manager().stop_server(&id).await.unwrap();

    let outcome = supervisor
        .invoke("fs.list", serde_json::Value::Null, Duration::from_secs(1))
        .await;
    assert!(matches!(outcome, Err(runtime::Error::NotBound(_))));
    assert!(supervisor.list_servers().is_empty());
}

#[tokio::test]
async fn acquisition_binds_tool_and_kind_names() {
    let root = tempfile::tempdir().unwrap();
    let (supervisor, _daemon) = SupervisorBuilder::new(test_settings(root.path()))
        .catalogs(vec![FakeCatalog::with_packages(&[("mcp-search", 0.9)]) as Arc<dyn Catalog>])
        .fetcher(StubFetcher::new("web.search"))
        .build();

    let record = supervisor
        .acquire(vec![search_descriptor()], AcquireOptions::default())
        .await;
    assert!(record.outcome.is_ok(), "outcome: {:?}", record.outcome);
    let server_id = record.server_id.expect("server id on success");

    // Both the tool name and the descriptor kind resolve to the new server.
    assert_eq!(
        supervisor.registry().resolve("web.search").unwrap().server_id,
        server_id
    );
    assert_eq!(
        supervisor.registry().resolve("search").unwrap().tool,
        "web.search"
    );

    // The server's result comes back verbatim.
    let result = supervisor
        .invoke("web.search", serde_json::json!({"query": "x"}), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(result["content"][0]["text"], "pong");

    supervisor.manager().stop_all().await;
}

#[tokio::test]
async fn pipeline_moves_to_next_candidate_on_install_failure() {
    let root = tempfile::tempdir().unwrap();
    let (supervisor, _daemon) = SupervisorBuilder::new(test_settings(root.path()))
        .catalogs(vec![FakeCatalog::with_packages(&[
            ("mcp-best", 0.9),
            ("mcp-backup", 0.4),
        ]) as Arc<dyn Catalog>])
        .fetcher(StubFetcher::failing_for("web.search", &["mcp-best"]))
        .build();

    let record = supervisor
        .acquire(vec![search_descriptor()], AcquireOptions::default())
        .await;

    assert!(record.outcome.is_ok(), "outcome: {:?}", record.outcome);
    assert_eq!(record.attempts.len(), 2);
    assert!(record.attempts[0].candidate.starts_with("mcp-best"));
    assert!(matches!(
        record.attempts[0].outcome,
        runtime::AttemptOutcome::Failed { ref stage, .. } if stage == "install"
    ));
    assert!(matches!(record.attempts[1].outcome, runtime::AttemptOutcome::Ok));

    supervisor.manager().stop_all().await;
}

#[tokio::test]
async fn empty_discovery_fails_at_discover_stage() {
    let root = tempfile::tempdir().unwrap();
    let (supervisor, _daemon) = SupervisorBuilder::new(test_settings(root.path())).build();

    let record = supervisor
        .acquire(vec![search_descriptor()], AcquireOptions::default())
        .await;
    match record.outcome {
        Outcome::Failed { ref stage, ref reason } => {
            assert_eq!(stage, "discover");
            assert_eq!(reason, "none");
        }
        ref other => panic!("unexpected outcome {other:?}"),
    }
}

#[tokio::test]
async fn acquisition_is_idempotent_for_bound_kinds() {
    let root = tempfile::tempdir().unwrap();
    let (supervisor, _daemon) = SupervisorBuilder::new(test_settings(root.path()))
        .catalogs(vec![FakeCatalog::with_packages(&[("mcp-search", 0.9)]) as Arc<dyn Catalog>])
        .fetcher(StubFetcher::new("web.search"))
        .build();

    let first = supervisor
        .acquire(vec![search_descriptor()], AcquireOptions::default())
        .await;
    assert!(matches!(first.outcome, Outcome::Ok { existing: false }));

    let second = supervisor
        .acquire(vec![search_descriptor()], AcquireOptions::default())
        .await;
    assert!(matches!(second.outcome, Outcome::Ok { existing: true }));
    assert_eq!(supervisor.list_servers().len(), 1);

    supervisor.manager().stop_all().await;
}

#[tokio::test]
async fn overlapping_acquisitions_coalesce_to_one_pipeline() {
    let root = tempfile::tempdir().unwrap();
    let slow = Arc::new(SlowCatalog {
        inner: FakeCatalog::with_packages(&[("mcp-search", 0.9)]),
        delay: Duration::from_millis(300),
    });
    let (supervisor, _daemon) = SupervisorBuilder::new(test_settings(root.path()))
        .catalogs(vec![slow as Arc<dyn Catalog>])
        .fetcher(StubFetcher::new("web.search"))
        .build();

    let a = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move {
            supervisor
                .acquire(vec![search_descriptor()], AcquireOptions::default())
                .await
        })
    };
    let b = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move {
            // Same kind, different terms: still coalesces on the kind.
            let d = CapabilityDescriptor::new("search", Priority::Medium, ["lookup"]);
            supervisor.acquire(vec![d], AcquireOptions::default()).await
        })
    };

    let (a, b) = (a.await.unwrap(), b.await.unwrap());
    assert_eq!(a.acquisition_id, b.acquisition_id);
    assert_eq!(supervisor.list_servers().len(), 1);

    supervisor.manager().stop_all().await;
}

#[tokio::test]
async fn surplus_tick_reports_without_acquiring() {
    let root = tempfile::tempdir().unwrap();
    let (supervisor, daemon) = SupervisorBuilder::new(test_settings(root.path()))
        .catalogs(vec![FakeCatalog::with_packages(&[("mcp-search", 0.9)]) as Arc<dyn Catalog>])
        .fetcher(StubFetcher::new("web.search"))
        .baseline(variety::SystemSnapshot {
            operations: 500,
            ..variety::SystemSnapshot::default()
        })
        .build();

    let mut events = supervisor.subscribe();
    let shutdown = CancellationToken::new();
    let driver = tokio::spawn(daemon.run(shutdown.clone()));

    let mut saw_report = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_millis(200), events.recv()).await {
            Ok(Ok(Event::GapReport { report })) => {
                assert!(report.ratio >= 1.0);
                saw_report = true;
                break;
            }
            Ok(Ok(Event::AcquisitionStarted { .. })) => panic!("surplus tick acquired"),
            _ => {}
        }
    }
    assert!(saw_report, "no gap report observed");
    assert!(supervisor.status().recent_acquisitions.is_empty());

    shutdown.cancel();
    driver.await.unwrap();
}

#[tokio::test]
async fn gap_tick_drives_acquisition_to_binding() {
    let root = tempfile::tempdir().unwrap();
    let environment = EnvironmentSnapshot {
        factors: (0..200).map(|i| format!("f{i}")).collect(),
        ..EnvironmentSnapshot::default()
    };
    let (supervisor, daemon) = SupervisorBuilder::new(test_settings(root.path()))
        .catalogs(vec![FakeCatalog::with_packages(&[("mcp-files", 0.9)]) as Arc<dyn Catalog>])
        .fetcher(StubFetcher::new("file.read"))
        .environment(environment)
        .build();

    let shutdown = CancellationToken::new();
    let driver = tokio::spawn(daemon.run(shutdown.clone()));

    let registry = supervisor.registry().clone();
    wait_until(
        "gap-driven binding of operational_capabilities",
        Duration::from_secs(15),
        move || registry.resolve("operational_capabilities").is_ok(),
    )
    .await;

    let binding = supervisor
        .registry()
        .resolve("operational_capabilities")
        .unwrap();
    assert_eq!(binding.tool, "file.read");

    shutdown.cancel();
    driver.await.unwrap();
    // Shutdown force-terminates outstanding tool servers.
    assert!(supervisor.list_servers().is_empty());
}

#[tokio::test]
async fn injected_gap_bypasses_calculator_and_binds() {
    let root = tempfile::tempdir().unwrap();
    // Surplus baseline: ticks alone would never acquire.
    let (supervisor, daemon) = SupervisorBuilder::new(test_settings(root.path()))
        .catalogs(vec![FakeCatalog::with_packages(&[("mcp-search", 0.9)]) as Arc<dyn Catalog>])
        .fetcher(StubFetcher::new("web.search"))
        .baseline(variety::SystemSnapshot {
            operations: 500,
            ..variety::SystemSnapshot::default()
        })
        .build();

    let shutdown = CancellationToken::new();
    let driver = tokio::spawn(daemon.run(shutdown.clone()));

    supervisor.inject(vec![search_descriptor()]).unwrap();

    let registry = supervisor.registry().clone();
    wait_until("injected binding", Duration::from_secs(15), move || {
        registry.resolve("web.search").is_ok()
    })
    .await;

    let result = supervisor
        .invoke("web.search", serde_json::json!({"query": "x"}), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(result["content"][0]["text"], "pong");

    shutdown.cancel();
    driver.await.unwrap();
}

#[tokio::test]
async fn status_composes_report_servers_and_history() {
    let root = tempfile::tempdir().unwrap();
    let (supervisor, _daemon) = SupervisorBuilder::new(test_settings(root.path()))
        .catalogs(vec![FakeCatalog::with_packages(&[("mcp-search", 0.9)]) as Arc<dyn Catalog>])
        .fetcher(StubFetcher::new("web.search"))
        .build();

    supervisor
        .acquire(vec![search_descriptor()], AcquireOptions::default())
        .await;

    let status = supervisor.status();
    assert_eq!(status.servers.len(), 1);
    assert!(!status.capabilities.is_empty());
    assert_eq!(status.recent_acquisitions.len(), 1);
    assert!(!status.advisory);
    assert!(status.in_flight.is_empty());

    supervisor.manager().stop_all().await;
}
