//! Quartermaster runtime — the closed-loop capability-acquisition engine.
//!
//! [`SupervisorBuilder`] wires the pieces: the [`ServerManager`] owning
//! tool-server subprocesses, the [`CapabilityRegistry`] routing
//! invocations, the [`AcquisitionPipeline`] turning capability descriptors
//! into bound capabilities, and the [`Daemon`] that closes the loop on a
//! variety-gap signal.

mod acquisition;
mod daemon;
mod error;
mod events;
mod manager;
mod registry;
mod settings;
mod supervisor;

// Error types
pub use error::{Error, Result};

// Events
pub use events::{Event, EventBus};

// Server manager
pub use manager::{ServerManager, ServerView};

// Capability registry & router
pub use registry::{CapabilityBinding, CapabilityRegistry};

// Acquisition pipeline
pub use acquisition::{
    AcquireOptions, AcquisitionPipeline, AcquisitionRecord, Attempt, AttemptOutcome, Outcome,
    SpawnDefaults,
};

// Control loop
pub use daemon::Daemon;

// Settings
pub use settings::Settings;

// Facade
pub use supervisor::{
    RegistryProbe, StatusReport, Supervisor, SupervisorBuilder, VarietyMonitor,
};
