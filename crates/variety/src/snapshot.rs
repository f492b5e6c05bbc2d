//! Input snapshots and weights for the variety calculation.

use serde::{Deserialize, Serialize};

/// The five control-hierarchy sub-systems whose capability counts make up
/// operational variety.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subsystem {
    Operations,
    Coordination,
    Control,
    Intelligence,
    Policy,
}

impl Subsystem {
    pub const ALL: [Subsystem; 5] = [
        Subsystem::Operations,
        Subsystem::Coordination,
        Subsystem::Control,
        Subsystem::Intelligence,
        Subsystem::Policy,
    ];
}

impl std::fmt::Display for Subsystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Subsystem::Operations => "operations",
            Subsystem::Coordination => "coordination",
            Subsystem::Control => "control",
            Subsystem::Intelligence => "intelligence",
            Subsystem::Policy => "policy",
        };
        write!(f, "{s}")
    }
}

/// Capability counts per sub-system.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemSnapshot {
    pub operations: u32,
    pub coordination: u32,
    pub control: u32,
    pub intelligence: u32,
    pub policy: u32,
}

impl SystemSnapshot {
    pub fn count(&self, subsystem: Subsystem) -> u32 {
        match subsystem {
            Subsystem::Operations => self.operations,
            Subsystem::Coordination => self.coordination,
            Subsystem::Control => self.control,
            Subsystem::Intelligence => self.intelligence,
            Subsystem::Policy => self.policy,
        }
    }

    pub fn set(&mut self, subsystem: Subsystem, count: u32) {
        match subsystem {
            Subsystem::Operations => self.operations = count,
            Subsystem::Coordination => self.coordination = count,
            Subsystem::Control => self.control = count,
            Subsystem::Intelligence => self.intelligence = count,
            Subsystem::Policy => self.policy = count,
        }
    }
}

/// Observed environment state feeding the demand side of the gap.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentSnapshot {
    /// Distinct external factors the system must respond to.
    pub factors: Vec<String>,
    /// Pairwise interactions between factors; each counts double.
    pub interactions: Vec<(String, String)>,
    /// Aspects of the environment with no current model.
    pub unknowns: Vec<String>,
    /// Amplifier on unknowns, ≥ 0.
    pub volatility: f64,
    /// Changes observed in the recent window.
    pub recent_changes: Vec<String>,
    /// Direction and steepness of the change rate.
    pub trend: f64,
    /// External systems this one depends on.
    pub dependencies: Vec<String>,
    /// Amplifier on dependencies, ≥ 0.
    pub coupling: f64,
}

/// Weights applied to the sub-system counts and the environment factors.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VarietyWeights {
    pub operations: f64,
    pub coordination: f64,
    pub control: f64,
    pub intelligence: f64,
    pub policy: f64,
    pub complexity: f64,
    pub uncertainty: f64,
    pub rate_of_change: f64,
    pub interdependencies: f64,
}

impl Default for VarietyWeights {
    fn default() -> Self {
        Self {
            operations: 1.0,
            coordination: 1.0,
            control: 1.0,
            intelligence: 1.0,
            policy: 1.0,
            complexity: 1.0,
            uncertainty: 1.0,
            rate_of_change: 1.0,
            interdependencies: 1.0,
        }
    }
}

impl VarietyWeights {
    pub fn subsystem(&self, subsystem: Subsystem) -> f64 {
        match subsystem {
            Subsystem::Operations => self.operations,
            Subsystem::Coordination => self.coordination,
            Subsystem::Control => self.control,
            Subsystem::Intelligence => self.intelligence,
            Subsystem::Policy => self.policy,
        }
    }
}
