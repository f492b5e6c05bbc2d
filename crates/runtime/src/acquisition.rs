//! The acquisition pipeline: descriptor in, bound capability out.
//!
//! Stages: discover → select → install → spawn → handshake → bind. The
//! pipeline walks candidates in rank order and moves to the next on any
//! stage failure; every attempt is recorded. Concurrent acquisitions whose
//! descriptor kinds overlap coalesce onto one running pipeline.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use mcp::{RestartPolicy, ServerConfig, ServerId, StartStage};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use acquire::{Candidate, Discovery, Installation, Installer};
use variety::CapabilityDescriptor;

use crate::events::{Event, EventBus};
use crate::manager::ServerManager;
use crate::registry::CapabilityRegistry;

/// Retained acquisition records.
const HISTORY_LIMIT: usize = 64;

/// Knobs for one acquisition.
#[derive(Debug, Clone, Copy)]
pub struct AcquireOptions {
    /// Re-run the pipeline even when every descriptor kind is already
    /// bound, and force reinstallation of candidates.
    pub force: bool,
    /// How many ranked candidates to try before giving up.
    pub top_k: usize,
}

impl Default for AcquireOptions {
    fn default() -> Self {
        Self {
            force: false,
            top_k: 3,
        }
    }
}

/// Per-candidate outcome within one acquisition.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Ok,
    Failed { stage: String, reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct Attempt {
    pub candidate: String,
    #[serde(flatten)]
    pub outcome: AttemptOutcome,
}

/// Final outcome of one acquisition.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Ok {
        /// True when the descriptors were already satisfied and no
        /// pipeline ran.
        existing: bool,
    },
    Failed {
        stage: String,
        reason: String,
    },
}

impl Outcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, Outcome::Ok { .. })
    }
}

/// The durable trace of one acquisition, kept in a bounded ring.
#[derive(Debug, Clone, Serialize)]
pub struct AcquisitionRecord {
    pub acquisition_id: Uuid,
    pub descriptors: Vec<CapabilityDescriptor>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub attempts: Vec<Attempt>,
    pub outcome: Outcome,
    pub server_id: Option<ServerId>,
    pub capabilities: Vec<String>,
}

/// Defaults applied to servers spawned by the pipeline.
#[derive(Debug, Clone, Copy)]
pub struct SpawnDefaults {
    pub restart_policy: RestartPolicy,
    pub health_interval: Duration,
    pub init_timeout: Duration,
}

impl Default for SpawnDefaults {
    fn default() -> Self {
        Self {
            restart_policy: RestartPolicy::default(),
            health_interval: mcp::DEFAULT_HEALTH_INTERVAL,
            init_timeout: mcp::DEFAULT_INIT_TIMEOUT,
        }
    }
}

pub struct AcquisitionPipeline {
    discovery: Arc<Discovery>,
    installer: Arc<Installer>,
    manager: Arc<ServerManager>,
    registry: Arc<CapabilityRegistry>,
    bus: EventBus,
    defaults: SpawnDefaults,
    history: Mutex<VecDeque<AcquisitionRecord>>,
    inflight: Mutex<HashMap<String, watch::Receiver<Option<AcquisitionRecord>>>>,
}

impl AcquisitionPipeline {
    pub fn new(
        discovery: Arc<Discovery>,
        installer: Arc<Installer>,
        manager: Arc<ServerManager>,
        registry: Arc<CapabilityRegistry>,
        bus: EventBus,
        defaults: SpawnDefaults,
    ) -> Arc<Self> {
        Arc::new(Self {
            discovery,
            installer,
            manager,
            registry,
            bus,
            defaults,
            history: Mutex::new(VecDeque::new()),
            inflight: Mutex::new(HashMap::new()),
        })
    }

    /// Acquire the capabilities described by `descriptors`.
    ///
    /// Never returns an error: failures are encoded in the record's
    /// outcome, tagged with the stage that exhausted the pipeline.
    pub async fn acquire(
        &self,
        descriptors: Vec<CapabilityDescriptor>,
        opts: AcquireOptions,
    ) -> AcquisitionRecord {
        let descriptors = dedupe_by_kind(descriptors);
        if descriptors.is_empty() {
            return self.finish(
                Uuid::new_v4(),
                Vec::new(),
                Utc::now(),
                Vec::new(),
                Outcome::Failed {
                    stage: "discover".to_string(),
                    reason: "no descriptors".to_string(),
                },
                None,
                Vec::new(),
            );
        }

        // Idempotence: a descriptor set whose kinds all resolve to live
        // servers is already satisfied.
        if !opts.force && self.already_satisfied(&descriptors) {
            let now = Utc::now();
            let kinds = kinds_of(&descriptors);
            return self.finish(
                Uuid::new_v4(),
                descriptors,
                now,
                Vec::new(),
                Outcome::Ok { existing: true },
                None,
                kinds,
            );
        }

        // Overlapping kinds coalesce: attach to the running pipeline and
        // share its outcome instead of starting a duplicate.
        enum Claim {
            Run(watch::Sender<Option<AcquisitionRecord>>),
            Attach(watch::Receiver<Option<AcquisitionRecord>>),
        }
        let claim = {
            let mut inflight = self.inflight.lock();
            match descriptors
                .iter()
                .find_map(|d| inflight.get(&d.kind).cloned())
            {
                Some(rx) => Claim::Attach(rx),
                None => {
                    let (tx, rx) = watch::channel(None);
                    for d in &descriptors {
                        inflight.insert(d.kind.clone(), rx.clone());
                    }
                    Claim::Run(tx)
                }
            }
        };

        let tx = match claim {
            Claim::Attach(mut rx) => loop {
                if let Some(record) = rx.borrow_and_update().clone() {
                    return record;
                }
                if rx.changed().await.is_err() {
                    // The running pipeline vanished without an outcome.
                    return self.finish(
                        Uuid::new_v4(),
                        descriptors,
                        Utc::now(),
                        Vec::new(),
                        Outcome::Failed {
                            stage: "coalesce".to_string(),
                            reason: "originating acquisition disappeared".to_string(),
                        },
                        None,
                        Vec::new(),
                    );
                }
            },
            Claim::Run(tx) => tx,
        };

        let record = self.run(descriptors.clone(), opts).await;
        {
            let mut inflight = self.inflight.lock();
            for d in &descriptors {
                inflight.remove(&d.kind);
            }
        }
        let _ = tx.send(Some(record.clone()));
        record
    }

    /// Most recent records, newest first.
    pub fn history(&self, limit: usize) -> Vec<AcquisitionRecord> {
        self.history
            .lock()
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    /// Descriptor kinds with a pipeline currently running.
    pub fn in_flight_kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.inflight.lock().keys().cloned().collect();
        kinds.sort();
        kinds
    }

    fn already_satisfied(&self, descriptors: &[CapabilityDescriptor]) -> bool {
        descriptors
            .iter()
            .all(|d| self.registry.resolve(&d.kind).is_ok())
    }

    async fn run(
        &self,
        descriptors: Vec<CapabilityDescriptor>,
        opts: AcquireOptions,
    ) -> AcquisitionRecord {
        let acquisition_id = Uuid::new_v4();
        let started_at = Utc::now();
        let kinds = kinds_of(&descriptors);
        info!(%acquisition_id, kinds = ?kinds, "acquisition started");
        self.bus.publish(Event::AcquisitionStarted {
            acquisition_id,
            kinds,
        });

        let candidates = self.discovery.discover(&descriptors).await;
        if candidates.is_empty() {
            warn!(%acquisition_id, "discovery produced no candidates");
            return self.finish(
                acquisition_id,
                descriptors,
                started_at,
                Vec::new(),
                Outcome::Failed {
                    stage: "discover".to_string(),
                    reason: "none".to_string(),
                },
                None,
                Vec::new(),
            );
        }

        let mut attempts = Vec::new();
        for candidate in candidates.into_iter().take(opts.top_k) {
            let coordinate = candidate.coordinate();
            match self.try_candidate(&candidate, &descriptors, opts.force).await {
                Ok((server_id, capabilities)) => {
                    attempts.push(Attempt {
                        candidate: coordinate,
                        outcome: AttemptOutcome::Ok,
                    });
                    info!(%acquisition_id, %server_id, ?capabilities, "acquisition succeeded");
                    return self.finish(
                        acquisition_id,
                        descriptors,
                        started_at,
                        attempts,
                        Outcome::Ok { existing: false },
                        Some(server_id),
                        capabilities,
                    );
                }
                Err((stage, reason)) => {
                    warn!(%acquisition_id, candidate = coordinate, stage, "candidate failed: {reason}");
                    attempts.push(Attempt {
                        candidate: coordinate,
                        outcome: AttemptOutcome::Failed { stage, reason },
                    });
                }
            }
        }

        let reasons = attempts
            .iter()
            .map(|a| match &a.outcome {
                AttemptOutcome::Failed { stage, reason } => {
                    format!("{} failed at {stage}: {reason}", a.candidate)
                }
                AttemptOutcome::Ok => format!("{} ok", a.candidate),
            })
            .collect::<Vec<_>>()
            .join("; ");
        self.finish(
            acquisition_id,
            descriptors,
            started_at,
            attempts,
            Outcome::Failed {
                stage: "pipeline_exhausted".to_string(),
                reason: reasons,
            },
            None,
            Vec::new(),
        )
    }

    /// Install → spawn → handshake → bind for a single candidate. The error
    /// carries the stage tag for the attempt record.
    async fn try_candidate(
        &self,
        candidate: &Candidate,
        descriptors: &[CapabilityDescriptor],
        force: bool,
    ) -> std::result::Result<(ServerId, Vec<String>), (String, String)> {
        let installation = self
            .installer
            .install(candidate, force)
            .await
            .map_err(|e| ("install".to_string(), e.to_string()))?;

        let config = self.server_config(candidate, &installation);
        let server_id = self.manager.start_server(config).await.map_err(|e| {
            let stage = match &e {
                crate::error::Error::Mcp(m) => match m.start_stage() {
                    Some(StartStage::Spawn) => "spawn",
                    _ => "handshake",
                },
                _ => "spawn",
            };
            (stage.to_string(), e.to_string())
        })?;

        let Some(server) = self.manager.get(&server_id) else {
            return Err(("spawn".to_string(), "server vanished after start".to_string()));
        };
        let tools = server.tools();

        let mut bound = Vec::new();
        for tool in &tools {
            if descriptors.iter().any(|d| descriptor_matches_tool(d, &tool.name)) {
                if self.registry.bind(&tool.name, server_id, &tool.name).is_ok() {
                    bound.push(tool.name.clone());
                }
            }
        }
        for descriptor in descriptors {
            if let Some(best) = best_tool_for(descriptor, &tools.iter().map(|t| t.name.as_str()).collect::<Vec<_>>()) {
                if self.registry.bind(&descriptor.kind, server_id, best).is_ok() {
                    bound.push(descriptor.kind.clone());
                }
            }
        }

        if bound.is_empty() {
            // Spawned but useless for these descriptors: tear it down.
            let _ = self.manager.stop_server(&server_id).await;
            return Err((
                "bind".to_string(),
                "no declared tool satisfies a descriptor".to_string(),
            ));
        }
        Ok((server_id, bound))
    }

    fn server_config(&self, candidate: &Candidate, installation: &Installation) -> ServerConfig {
        let spec = &installation.run_spec;
        ServerConfig {
            name: candidate.name.clone(),
            command: spec.command.clone(),
            args: spec.args.clone(),
            env: spec.env.clone(),
            cwd: spec.cwd.clone(),
            restart_policy: self.defaults.restart_policy,
            health_interval: self.defaults.health_interval,
            init_timeout: self.defaults.init_timeout,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        acquisition_id: Uuid,
        descriptors: Vec<CapabilityDescriptor>,
        started_at: DateTime<Utc>,
        attempts: Vec<Attempt>,
        outcome: Outcome,
        server_id: Option<ServerId>,
        capabilities: Vec<String>,
    ) -> AcquisitionRecord {
        let record = AcquisitionRecord {
            acquisition_id,
            descriptors,
            started_at,
            finished_at: Utc::now(),
            attempts,
            outcome,
            server_id,
            capabilities,
        };
        {
            let mut history = self.history.lock();
            if history.len() == HISTORY_LIMIT {
                history.pop_front();
            }
            history.push_back(record.clone());
        }
        self.bus.publish(Event::AcquisitionFinished {
            record: record.clone(),
        });
        record
    }
}

fn kinds_of(descriptors: &[CapabilityDescriptor]) -> Vec<String> {
    descriptors.iter().map(|d| d.kind.clone()).collect()
}

fn dedupe_by_kind(descriptors: Vec<CapabilityDescriptor>) -> Vec<CapabilityDescriptor> {
    let mut seen = std::collections::HashSet::new();
    descriptors
        .into_iter()
        .filter(|d| seen.insert(d.kind.clone()))
        .collect()
}

/// Whether a declared tool satisfies a descriptor: its name (or a name
/// token) overlaps a search term or the descriptor kind. Tokens shorter
/// than three characters are ignored to keep the overlap meaningful.
fn descriptor_matches_tool(descriptor: &CapabilityDescriptor, tool: &str) -> bool {
    match_strength(descriptor, tool) > 0
}

fn match_strength(descriptor: &CapabilityDescriptor, tool: &str) -> usize {
    let tool_lc = tool.to_lowercase();
    let tokens: Vec<&str> = tool_lc
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| t.len() >= 3)
        .collect();

    let mut strength = 0;
    for term in &descriptor.search_terms {
        let term = term.to_lowercase();
        if tool_lc.contains(&term)
            || tokens
                .iter()
                .any(|tok| term.contains(tok) || tok.contains(term.as_str()))
        {
            strength += 1;
        }
    }
    let kind = descriptor.kind.to_lowercase();
    if tool_lc.contains(&kind) || tokens.iter().any(|tok| kind.contains(tok)) {
        strength += 1;
    }
    strength
}

/// The declared tool that best satisfies a descriptor, if any does.
fn best_tool_for<'a>(descriptor: &CapabilityDescriptor, tools: &[&'a str]) -> Option<&'a str> {
    tools
        .iter()
        .map(|t| (*t, match_strength(descriptor, t)))
        .filter(|(_, strength)| *strength > 0)
        .max_by_key(|(_, strength)| *strength)
        .map(|(tool, _)| tool)
}
