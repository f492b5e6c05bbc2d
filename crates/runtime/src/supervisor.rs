//! The supervisor facade: one object wiring the manager, registry,
//! discovery, installer, pipeline, variety monitor, and control loop
//! together. Outer surfaces (an HTTP router, the CLI) talk to this and
//! nothing else.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use acquire::{Catalog, Discovery, DiscoveryConfig, Fetcher, Installer};
use mcp::ServerConfig;
use variety::{
    CapabilityDescriptor, EnvironmentSnapshot, Subsystem, SubsystemProbe, SystemSnapshot,
    VarietyConfig, VarietyReport, snapshot_from,
};

use crate::acquisition::{AcquireOptions, AcquisitionPipeline, AcquisitionRecord, SpawnDefaults};
use crate::daemon::{Daemon, Dispatcher};
use crate::error::{Error, Result};
use crate::events::{Event, EventBus};
use crate::manager::{ServerManager, ServerView};
use crate::registry::{CapabilityBinding, CapabilityRegistry};
use crate::settings::Settings;

const INJECT_QUEUE: usize = 16;

/// Gathers the two snapshots and produces gap reports on demand.
pub struct VarietyMonitor {
    probe: Arc<dyn SubsystemProbe>,
    environment: RwLock<EnvironmentSnapshot>,
    config: VarietyConfig,
}

impl VarietyMonitor {
    pub fn new(
        probe: Arc<dyn SubsystemProbe>,
        environment: EnvironmentSnapshot,
        config: VarietyConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            probe,
            environment: RwLock::new(environment),
            config,
        })
    }

    pub fn report(&self) -> VarietyReport {
        let system = snapshot_from(&*self.probe);
        let environment = self.environment.read().clone();
        variety::report(&system, &environment, &self.config)
    }

    /// Replace the environment model (operator-declared).
    pub fn set_environment(&self, environment: EnvironmentSnapshot) {
        *self.environment.write() = environment;
    }
}

/// Default probe: counts what the supervisor itself can see. A baseline
/// from configuration covers sub-systems with external collaborators.
pub struct RegistryProbe {
    manager: Arc<ServerManager>,
    registry: Arc<CapabilityRegistry>,
    baseline: SystemSnapshot,
}

impl SubsystemProbe for RegistryProbe {
    fn capability_count(&self, subsystem: Subsystem) -> variety::Result<u32> {
        let own = match subsystem {
            Subsystem::Operations => self.registry.list().len() as u32,
            Subsystem::Coordination => self.manager.servers().len() as u32,
            // The control loop and its threshold policy count themselves.
            Subsystem::Control | Subsystem::Policy => 1,
            Subsystem::Intelligence => 0,
        };
        Ok(own + self.baseline.count(subsystem))
    }
}

/// Composed status for the outside world.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub variety: VarietyReport,
    pub servers: Vec<ServerView>,
    pub capabilities: Vec<CapabilityBinding>,
    pub in_flight: Vec<String>,
    pub recent_acquisitions: Vec<AcquisitionRecord>,
    /// Raised after repeated acquisition failures; informational only.
    pub advisory: bool,
}

/// Everything needed to build a [`Supervisor`].
pub struct SupervisorBuilder {
    pub settings: Settings,
    pub catalogs: Vec<Arc<dyn Catalog>>,
    pub fetcher: Arc<dyn Fetcher>,
    pub discovery: DiscoveryConfig,
    pub variety: VarietyConfig,
    pub environment: EnvironmentSnapshot,
    pub baseline: SystemSnapshot,
}

impl SupervisorBuilder {
    pub fn new(settings: Settings) -> Self {
        let discovery = DiscoveryConfig {
            cache_ttl: settings.discovery_cache_ttl,
            ..DiscoveryConfig::default()
        };
        Self {
            settings,
            catalogs: Vec::new(),
            fetcher: Arc::new(acquire::CommandFetcher::default()),
            discovery,
            variety: VarietyConfig::default(),
            environment: EnvironmentSnapshot::default(),
            baseline: SystemSnapshot::default(),
        }
    }

    pub fn catalogs(mut self, catalogs: Vec<Arc<dyn Catalog>>) -> Self {
        self.catalogs = catalogs;
        self
    }

    pub fn fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn environment(mut self, environment: EnvironmentSnapshot) -> Self {
        self.environment = environment;
        self
    }

    pub fn variety(mut self, config: VarietyConfig) -> Self {
        self.variety = config;
        self
    }

    pub fn baseline(mut self, baseline: SystemSnapshot) -> Self {
        self.baseline = baseline;
        self
    }

    /// Wire everything together. The returned [`Daemon`] must be driven by
    /// the caller (`daemon.run(shutdown)`); the supervisor is usable
    /// immediately.
    pub fn build(self) -> (Arc<Supervisor>, Daemon) {
        let bus = EventBus::new();
        let manager = ServerManager::new(bus.clone(), self.settings.stop_grace);
        let registry = CapabilityRegistry::new(manager.clone(), bus.clone());
        registry.spawn_pruner();

        let discovery = Arc::new(Discovery::new(self.catalogs, self.discovery));
        let installer = Arc::new(Installer::new(
            self.settings.install_root.clone(),
            self.fetcher,
        ));
        let defaults = SpawnDefaults {
            restart_policy: self.settings.restart_policy,
            health_interval: self.settings.health_interval,
            init_timeout: self.settings.init_timeout,
        };
        let pipeline = AcquisitionPipeline::new(
            discovery,
            installer,
            manager.clone(),
            registry.clone(),
            bus.clone(),
            defaults,
        );

        let monitor = VarietyMonitor::new(
            Arc::new(RegistryProbe {
                manager: manager.clone(),
                registry: registry.clone(),
                baseline: self.baseline,
            }),
            self.environment,
            self.variety,
        );

        let advisory = Arc::new(AtomicBool::new(false));
        let dispatcher = Dispatcher::new(pipeline.clone(), &self.settings, advisory.clone());
        let (inject_tx, inject_rx) = mpsc::channel(INJECT_QUEUE);

        let daemon = Daemon::new(
            monitor.clone(),
            manager.clone(),
            dispatcher,
            bus.clone(),
            self.settings.clone(),
            inject_rx,
        );

        let supervisor = Arc::new(Supervisor {
            settings: self.settings,
            bus,
            manager,
            registry,
            pipeline,
            monitor,
            inject_tx,
            advisory,
        });
        (supervisor, daemon)
    }
}

/// The core's public face: list, invoke, inject, acquire, refresh, status.
pub struct Supervisor {
    settings: Settings,
    bus: EventBus,
    manager: Arc<ServerManager>,
    registry: Arc<CapabilityRegistry>,
    pipeline: Arc<AcquisitionPipeline>,
    monitor: Arc<VarietyMonitor>,
    inject_tx: mpsc::Sender<Vec<CapabilityDescriptor>>,
    advisory: Arc<AtomicBool>,
}

impl Supervisor {
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn manager(&self) -> &Arc<ServerManager> {
        &self.manager
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn monitor(&self) -> &Arc<VarietyMonitor> {
        &self.monitor
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.bus.subscribe()
    }

    pub fn list_servers(&self) -> Vec<ServerView> {
        self.manager.list()
    }

    pub fn list_capabilities(&self) -> Vec<CapabilityBinding> {
        self.registry.list()
    }

    /// Route a capability invocation to its bound server.
    pub async fn invoke(&self, capability: &str, args: Value, timeout: Duration) -> Result<Value> {
        self.registry.invoke(capability, args, timeout).await
    }

    /// Hand a descriptor set to the control loop, bypassing the
    /// calculator. Fails if the daemon is gone or its queue is full.
    pub fn inject(&self, descriptors: Vec<CapabilityDescriptor>) -> Result<()> {
        self.inject_tx
            .try_send(descriptors)
            .map_err(|_| Error::InjectRejected)
    }

    /// Run the acquisition pipeline directly and wait for its record.
    pub async fn acquire(
        &self,
        descriptors: Vec<CapabilityDescriptor>,
        opts: AcquireOptions,
    ) -> AcquisitionRecord {
        self.pipeline.acquire(descriptors, opts).await
    }

    /// Re-bind capabilities from the live servers' declared tools.
    pub fn refresh(&self) -> usize {
        self.registry.refresh()
    }

    pub fn status(&self) -> StatusReport {
        StatusReport {
            variety: self.monitor.report(),
            servers: self.manager.list(),
            capabilities: self.registry.list(),
            in_flight: self.pipeline.in_flight_kinds(),
            recent_acquisitions: self.pipeline.history(10),
            advisory: self.advisory.load(Ordering::Relaxed),
        }
    }

    /// Start operator-declared tool servers and bind their tools by
    /// convention. Individual failures are logged, not fatal.
    pub async fn start_configured(&self, configs: Vec<ServerConfig>) {
        for config in configs {
            let name = config.name.clone();
            match self.manager.start_server(config).await {
                Ok(id) => info!(%id, name, "configured server started"),
                Err(e) => warn!(name, "configured server failed to start: {e}"),
            }
        }
        self.registry.refresh();
    }

    /// Drain bus events into the journal until the bus closes. Runs
    /// detached; journal errors are logged and do not affect the core.
    pub fn attach_journal(&self, journal: storage::Journal) {
        let mut events = self.bus.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if let Err(e) = journal.append(event.name(), &event) {
                            warn!("journal append failed: {e}");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "journal lagged behind the bus");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
}
