//! Capability descriptors and the projection from critical areas.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::rules::CriticalArea;

/// Acquisition priority of a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Medium,
    Low,
}

/// A structured request for a missing capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    pub kind: String,
    pub priority: Priority,
    pub search_terms: BTreeSet<String>,
}

impl CapabilityDescriptor {
    pub fn new<I, S>(kind: impl Into<String>, priority: Priority, terms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kind: kind.into(),
            priority,
            search_terms: terms.into_iter().map(Into::into).collect(),
        }
    }
}

/// The descriptor a critical area projects to. One static table; the kind
/// always equals the area tag so acquired capabilities land under a
/// predictable name.
pub fn descriptor_for(area: CriticalArea) -> CapabilityDescriptor {
    match area {
        CriticalArea::OperationalCapabilities => CapabilityDescriptor::new(
            "operational_capabilities",
            Priority::High,
            ["tools", "filesystem", "shell"],
        ),
        CriticalArea::EnvironmentalSensing => CapabilityDescriptor::new(
            "environmental_sensing",
            Priority::Medium,
            ["search", "fetch", "monitoring"],
        ),
        CriticalArea::AdaptiveControl => CapabilityDescriptor::new(
            "adaptive_control",
            Priority::Medium,
            ["automation", "workflow", "control"],
        ),
        CriticalArea::CoordinationPatterns => CapabilityDescriptor::new(
            "coordination_patterns",
            Priority::Low,
            ["messaging", "queue", "coordination"],
        ),
    }
}

/// Project a report's critical areas to descriptors, preserving order.
pub fn project(areas: &[CriticalArea]) -> Vec<CapabilityDescriptor> {
    areas.iter().map(|a| descriptor_for(*a)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_matches_area_tag() {
        for area in [
            CriticalArea::OperationalCapabilities,
            CriticalArea::EnvironmentalSensing,
            CriticalArea::AdaptiveControl,
            CriticalArea::CoordinationPatterns,
        ] {
            assert_eq!(descriptor_for(area).kind, area.to_string());
        }
    }

    #[test]
    fn projection_preserves_order() {
        let areas = [
            CriticalArea::AdaptiveControl,
            CriticalArea::OperationalCapabilities,
        ];
        let descriptors = project(&areas);
        assert_eq!(descriptors[0].kind, "adaptive_control");
        assert_eq!(descriptors[1].kind, "operational_capabilities");
    }

    #[test]
    fn search_terms_are_ordered_and_deduplicated() {
        let d = CapabilityDescriptor::new("search", Priority::High, ["web", "search", "web"]);
        let terms: Vec<&str> = d.search_terms.iter().map(String::as_str).collect();
        assert_eq!(terms, vec!["search", "web"]);
    }
}
