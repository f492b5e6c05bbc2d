//! Variety calculation in the cybernetic sense.
//!
//! Core principle: **the gap report is a pure function of its snapshots.**
//! Equal inputs produce equal numbers and an identical critical-area
//! ordering, so control decisions downstream are reproducible and
//! test-comparable.

mod calculator;
mod descriptor;
mod probe;
mod rules;
mod snapshot;

pub use calculator::{
    EnvironmentComponents, VarietyConfig, VarietyReport, environment_components,
    environmental_variety, report, system_variety,
};
pub use descriptor::{CapabilityDescriptor, Priority, descriptor_for, project};
pub use probe::{Error, Result, SubsystemProbe, snapshot_from};
pub use rules::{AreaRule, Condition, CriticalArea, RuleContext, default_rules};
pub use snapshot::{EnvironmentSnapshot, Subsystem, SystemSnapshot, VarietyWeights};
