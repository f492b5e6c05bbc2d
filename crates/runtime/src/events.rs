//! The supervisor's event bus.
//!
//! Server lifecycle changes, gap reports, and acquisition outcomes are all
//! published here; downstream consumers (journal, status surfaces,
//! introspection layers) subscribe and build on top.

use mcp::ServerId;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;
use variety::VarietyReport;

use crate::acquisition::AcquisitionRecord;

const BUS_CAPACITY: usize = 256;

/// Everything observable about the supervisor, as one event stream.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    ServerStarted {
        server_id: ServerId,
        name: String,
    },
    ServerReady {
        server_id: ServerId,
    },
    ServerDegraded {
        server_id: ServerId,
    },
    ServerRestarting {
        server_id: ServerId,
        attempt: u32,
    },
    ServerRestartExhausted {
        server_id: ServerId,
    },
    ServerStopped {
        server_id: ServerId,
    },
    /// The server has been removed from the manager; bindings referring to
    /// it are dropped by the registry.
    ServerGone {
        server_id: ServerId,
    },
    CapabilityBound {
        capability: String,
        server_id: ServerId,
        tool: String,
    },
    CapabilityUnbound {
        capability: String,
    },
    GapReport {
        report: VarietyReport,
    },
    AcquisitionStarted {
        acquisition_id: Uuid,
        kinds: Vec<String>,
    },
    AcquisitionFinished {
        record: AcquisitionRecord,
    },
}

impl Event {
    /// Canonical name, used as the journal `kind` column.
    pub fn name(&self) -> &'static str {
        match self {
            Event::ServerStarted { .. } => "server_started",
            Event::ServerReady { .. } => "server_ready",
            Event::ServerDegraded { .. } => "server_degraded",
            Event::ServerRestarting { .. } => "server_restarting",
            Event::ServerRestartExhausted { .. } => "server_restart_exhausted",
            Event::ServerStopped { .. } => "server_stopped",
            Event::ServerGone { .. } => "server_gone",
            Event::CapabilityBound { .. } => "capability_bound",
            Event::CapabilityUnbound { .. } => "capability_unbound",
            Event::GapReport { .. } => "gap_report",
            Event::AcquisitionStarted { .. } => "acquisition_started",
            Event::AcquisitionFinished { .. } => "acquisition_finished",
        }
    }
}

/// Broadcast bus. Publishing never blocks; slow subscribers lag and skip.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, event: Event) {
        debug!(event = event.name(), "bus");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
