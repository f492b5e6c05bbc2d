//! The gap report: operational variety, environmental variety, ratio, and
//! critical areas.

use serde::{Deserialize, Serialize};

use crate::rules::{AreaRule, CriticalArea, RuleContext, default_rules};
use crate::snapshot::{EnvironmentSnapshot, Subsystem, SystemSnapshot, VarietyWeights};

/// Configuration for the calculator: one weights table, one rule list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VarietyConfig {
    pub weights: VarietyWeights,
    pub rules: Vec<AreaRule>,
}

impl Default for VarietyConfig {
    fn default() -> Self {
        Self {
            weights: VarietyWeights::default(),
            rules: default_rules(),
        }
    }
}

/// The four weighted factors of environmental variety.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EnvironmentComponents {
    pub complexity: f64,
    pub uncertainty: f64,
    pub rate_of_change: f64,
    pub interdependencies: f64,
}

/// The calculator's output. See the invariant on the crate root: equal
/// inputs produce an equal report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VarietyReport {
    pub system_variety: f64,
    pub environmental_variety: f64,
    pub ratio: f64,
    pub absolute_gap: f64,
    pub critical_areas: Vec<CriticalArea>,
    pub recommendations: Vec<String>,
}

/// Raw (unweighted) environment components.
pub fn environment_components(env: &EnvironmentSnapshot) -> EnvironmentComponents {
    EnvironmentComponents {
        complexity: env.factors.len() as f64 + 2.0 * env.interactions.len() as f64,
        uncertainty: env.unknowns.len() as f64 * (1.0 + env.volatility),
        rate_of_change: env.recent_changes.len() as f64 * env.trend,
        interdependencies: env.dependencies.len() as f64 * (1.0 + env.coupling),
    }
}

/// Weighted sum of the sub-system capability counts.
pub fn system_variety(system: &SystemSnapshot, weights: &VarietyWeights) -> f64 {
    Subsystem::ALL
        .into_iter()
        .map(|s| system.count(s) as f64 * weights.subsystem(s))
        .sum()
}

/// Weighted sum of the environment components.
pub fn environmental_variety(env: &EnvironmentSnapshot, weights: &VarietyWeights) -> f64 {
    let c = environment_components(env);
    c.complexity * weights.complexity
        + c.uncertainty * weights.uncertainty
        + c.rate_of_change * weights.rate_of_change
        + c.interdependencies * weights.interdependencies
}

/// Compute the full gap report.
pub fn report(
    system: &SystemSnapshot,
    env: &EnvironmentSnapshot,
    config: &VarietyConfig,
) -> VarietyReport {
    let system_v = system_variety(system, &config.weights);
    let environmental_v = environmental_variety(env, &config.weights);
    let absolute_gap = environmental_v - system_v;
    let ratio = system_v / environmental_v.max(1.0);

    let ctx = RuleContext {
        ratio,
        absolute_gap,
        components: environment_components(env),
        system,
    };
    let mut critical_areas: Vec<CriticalArea> = Vec::new();
    for rule in &config.rules {
        if rule.condition.holds(&ctx) && !critical_areas.contains(&rule.area) {
            critical_areas.push(rule.area);
        }
    }

    let recommendations = recommendations(ratio, &critical_areas);

    VarietyReport {
        system_variety: system_v,
        environmental_variety: environmental_v,
        ratio,
        absolute_gap,
        critical_areas,
        recommendations,
    }
}

fn recommendations(ratio: f64, areas: &[CriticalArea]) -> Vec<String> {
    if ratio >= 1.0 {
        return vec![
            "System has requisite variety".to_string(),
            "Continue monitoring".to_string(),
        ];
    }
    if areas.is_empty() {
        return vec!["Variety below parity; monitor the trend".to_string()];
    }
    areas
        .iter()
        .map(|area| format!("Acquire capabilities for {area}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::Condition;

    fn env_with(unknowns: usize, volatility: f64) -> EnvironmentSnapshot {
        EnvironmentSnapshot {
            unknowns: (0..unknowns).map(|i| format!("u{i}")).collect(),
            volatility,
            ..EnvironmentSnapshot::default()
        }
    }

    #[test]
    fn component_formulas() {
        let env = EnvironmentSnapshot {
            factors: vec!["a".into(), "b".into(), "c".into()],
            interactions: vec![("a".into(), "b".into())],
            unknowns: vec!["x".into(), "y".into()],
            volatility: 0.5,
            recent_changes: vec!["r".into()],
            trend: 2.0,
            dependencies: vec!["d".into(), "e".into()],
            coupling: 1.0,
        };
        let c = environment_components(&env);
        assert_eq!(c.complexity, 5.0);
        assert_eq!(c.uncertainty, 3.0);
        assert_eq!(c.rate_of_change, 2.0);
        assert_eq!(c.interdependencies, 4.0);
    }

    #[test]
    fn system_variety_applies_weights() {
        let system = SystemSnapshot {
            operations: 4,
            coordination: 2,
            control: 1,
            intelligence: 0,
            policy: 1,
        };
        let weights = VarietyWeights {
            operations: 2.0,
            ..VarietyWeights::default()
        };
        assert_eq!(system_variety(&system, &weights), 12.0);
    }

    #[test]
    fn ratio_denominator_is_floored_at_one() {
        let system = SystemSnapshot {
            operations: 3,
            ..SystemSnapshot::default()
        };
        let report = report(&system, &EnvironmentSnapshot::default(), &VarietyConfig::default());
        assert_eq!(report.environmental_variety, 0.0);
        assert_eq!(report.ratio, 3.0);
    }

    #[test]
    fn surplus_report_has_no_critical_areas() {
        // system variety 120 vs environmental 100: ratio 1.2.
        let system = SystemSnapshot {
            operations: 120,
            ..SystemSnapshot::default()
        };
        let env = EnvironmentSnapshot {
            factors: (0..100).map(|i| format!("f{i}")).collect(),
            ..EnvironmentSnapshot::default()
        };
        let report = report(&system, &env, &VarietyConfig::default());
        assert_eq!(report.system_variety, 120.0);
        assert_eq!(report.environmental_variety, 100.0);
        assert_eq!(report.ratio, 1.2);
        assert!(report.critical_areas.is_empty());
        assert_eq!(
            report.recommendations,
            vec![
                "System has requisite variety".to_string(),
                "Continue monitoring".to_string(),
            ]
        );
    }

    #[test]
    fn gap_flags_operational_capabilities() {
        // environmental 200 vs system 100: ratio 0.5.
        let system = SystemSnapshot {
            operations: 100,
            ..SystemSnapshot::default()
        };
        let env = EnvironmentSnapshot {
            factors: (0..200).map(|i| format!("f{i}")).collect(),
            ..EnvironmentSnapshot::default()
        };
        let report = report(&system, &env, &VarietyConfig::default());
        assert_eq!(report.ratio, 0.5);
        assert_eq!(report.absolute_gap, 100.0);
        assert_eq!(
            report.critical_areas,
            vec![CriticalArea::OperationalCapabilities]
        );
    }

    #[test]
    fn critical_areas_follow_rule_declaration_order() {
        let config = VarietyConfig {
            weights: VarietyWeights::default(),
            rules: vec![
                AreaRule {
                    area: CriticalArea::EnvironmentalSensing,
                    condition: Condition::UncertaintyAbove { value: 1.0 },
                },
                AreaRule {
                    area: CriticalArea::OperationalCapabilities,
                    condition: Condition::RatioBelow { value: 0.75 },
                },
                // Duplicate area: first match wins, no duplicate entry.
                AreaRule {
                    area: CriticalArea::EnvironmentalSensing,
                    condition: Condition::UncertaintyAbove { value: 0.5 },
                },
            ],
        };
        let report = report(
            &SystemSnapshot::default(),
            &env_with(4, 1.0),
            &config,
        );
        assert_eq!(
            report.critical_areas,
            vec![
                CriticalArea::EnvironmentalSensing,
                CriticalArea::OperationalCapabilities,
            ]
        );
    }

    #[test]
    fn report_is_pure() {
        let system = SystemSnapshot {
            operations: 7,
            intelligence: 2,
            ..SystemSnapshot::default()
        };
        let env = env_with(5, 0.25);
        let config = VarietyConfig::default();
        assert_eq!(report(&system, &env, &config), report(&system, &env, &config));
    }
}
