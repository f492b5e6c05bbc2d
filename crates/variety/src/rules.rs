//! Critical-area rules.
//!
//! Each rule pairs a condition with an area tag. Rules are evaluated in
//! declaration order and the report lists matching areas in that same
//! order, so the output is stable across runs with equal inputs.

use serde::{Deserialize, Serialize};

use crate::calculator::EnvironmentComponents;
use crate::snapshot::{Subsystem, SystemSnapshot};

/// Areas in which the system may lack requisite variety.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CriticalArea {
    OperationalCapabilities,
    EnvironmentalSensing,
    AdaptiveControl,
    CoordinationPatterns,
}

impl std::fmt::Display for CriticalArea {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CriticalArea::OperationalCapabilities => "operational_capabilities",
            CriticalArea::EnvironmentalSensing => "environmental_sensing",
            CriticalArea::AdaptiveControl => "adaptive_control",
            CriticalArea::CoordinationPatterns => "coordination_patterns",
        };
        write!(f, "{s}")
    }
}

/// Inputs a condition may inspect.
#[derive(Debug, Clone, Copy)]
pub struct RuleContext<'a> {
    pub ratio: f64,
    pub absolute_gap: f64,
    pub components: EnvironmentComponents,
    pub system: &'a SystemSnapshot,
}

/// Condition vocabulary for area rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "when", rename_all = "snake_case")]
pub enum Condition {
    RatioBelow { value: f64 },
    GapAbove { value: f64 },
    ComplexityAbove { value: f64 },
    UncertaintyAbove { value: f64 },
    RateOfChangeAbove { value: f64 },
    InterdependenciesAbove { value: f64 },
    SubsystemBelow { subsystem: Subsystem, count: u32 },
}

impl Condition {
    pub fn holds(&self, ctx: &RuleContext<'_>) -> bool {
        match self {
            Condition::RatioBelow { value } => ctx.ratio < *value,
            Condition::GapAbove { value } => ctx.absolute_gap > *value,
            Condition::ComplexityAbove { value } => ctx.components.complexity > *value,
            Condition::UncertaintyAbove { value } => ctx.components.uncertainty > *value,
            Condition::RateOfChangeAbove { value } => ctx.components.rate_of_change > *value,
            Condition::InterdependenciesAbove { value } => {
                ctx.components.interdependencies > *value
            }
            Condition::SubsystemBelow { subsystem, count } => {
                ctx.system.count(*subsystem) < *count
            }
        }
    }
}

/// One rule: when the condition holds, the area is critical.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AreaRule {
    pub area: CriticalArea,
    #[serde(flatten)]
    pub condition: Condition,
}

/// Default rule set, in report order.
pub fn default_rules() -> Vec<AreaRule> {
    vec![
        AreaRule {
            area: CriticalArea::OperationalCapabilities,
            condition: Condition::RatioBelow { value: 0.75 },
        },
        AreaRule {
            area: CriticalArea::EnvironmentalSensing,
            condition: Condition::UncertaintyAbove { value: 8.0 },
        },
        AreaRule {
            area: CriticalArea::AdaptiveControl,
            condition: Condition::RateOfChangeAbove { value: 6.0 },
        },
        AreaRule {
            area: CriticalArea::CoordinationPatterns,
            condition: Condition::InterdependenciesAbove { value: 6.0 },
        },
    ]
}
