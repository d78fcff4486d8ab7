//! Component failure modes and the rules that propagate their symptoms.

use crate::identifiers::ComponentId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Severity {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Severity {
    /// High and critical failures take the component out of service;
    /// lower severities only degrade it.
    pub fn is_outage(self) -> bool {
        self >= Severity::High
    }
}

/// A named way a component can fail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureModeDefinition {
    pub name: String,
    pub trigger: FailureTrigger,
    #[serde(default)]
    pub severity: Severity,
    /// Reproducible with the same seed.
    #[serde(default = "default_true")]
    pub deterministic: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub propagation: Option<FailurePropagation>,
}

fn default_true() -> bool {
    true
}

impl FailureModeDefinition {
    pub fn new(name: impl Into<String>, trigger: FailureTrigger, severity: Severity) -> Self {
        Self {
            name: name.into(),
            trigger,
            severity,
            deterministic: true,
            propagation: None,
        }
    }

    pub fn with_propagation(mut self, propagation: FailurePropagation) -> Self {
        self.propagation = Some(propagation);
        self
    }

    /// Propagation rules, empty if none are declared.
    pub fn rules(&self) -> &[PropagationRule] {
        self.propagation.as_ref().map_or(&[], |p| p.rules.as_slice())
    }
}

/// What makes a failure mode fire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum FailureTrigger {
    /// Calls to `dependency_id` failed at least `failure_count` times in the
    /// rolling window.
    DependencyFailure {
        dependency_id: ComponentId,
        failure_count: u32,
    },
    /// Rolling p99 latency above the threshold.
    LatencySpike { threshold_ms: f64 },
    /// Rolling error rate above the threshold.
    ErrorRate { threshold: f64 },
    /// Utilization of `resource` (cpu, memory, connections, queue) at or
    /// above the threshold (0-1).
    ResourceExhaustion { resource: String, threshold: f64 },
    /// Fires once at a fixed time.
    Scheduled { at_ms: f64 },
    /// Fires with the given probability at every check.
    Probabilistic { probability: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PropagationType {
    CascadingTimeout,
    Backpressure,
    ResourceExhaustion,
    SplitBrain,
    StaleReads,
    DataLoss,
    ThunderingHerd,
    ConfigDrift,
    SecurityCascade,
}

/// How a failure spreads beyond the failing component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailurePropagation {
    pub propagation_type: PropagationType,
    #[serde(default)]
    pub rules: Vec<PropagationRule>,
}

/// A condition over rolling metrics paired with a delayed effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropagationRule {
    pub condition: PropagationCondition,
    pub effect: PropagationEffect,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<f64>,
}

impl PropagationRule {
    pub fn new(condition: PropagationCondition, effect: PropagationEffect) -> Self {
        Self {
            condition,
            effect,
            delay_ms: None,
        }
    }

    pub fn with_delay_ms(mut self, delay_ms: f64) -> Self {
        self.delay_ms = Some(delay_ms);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum PropagationCondition {
    /// At least `threshold` direct dependencies are failing.
    DependencyFailures { threshold: u32 },
    ErrorRateExceeded { threshold: f64 },
    LatencyExceeded { threshold_ms: f64 },
    QueueDepthExceeded { threshold: f64 },
    /// At least `threshold` timeouts within the last `window_ms`.
    TimeoutCount { threshold: u32, window_ms: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum PropagationEffect {
    IncreaseLatency { factor: f64 },
    IncreaseErrorRate { rate: f64 },
    TriggerCircuitBreaker,
    RejectRequests,
    CascadeToDependents,
    TriggerFailover,
}

impl PropagationEffect {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::IncreaseLatency { .. } => "increase-latency",
            Self::IncreaseErrorRate { .. } => "increase-error-rate",
            Self::TriggerCircuitBreaker => "trigger-circuit-breaker",
            Self::RejectRequests => "reject-requests",
            Self::CascadeToDependents => "cascade-to-dependents",
            Self::TriggerFailover => "trigger-failover",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_json_shape() {
        let json = r#"{
            "condition": {"type": "timeout-count", "threshold": 5, "windowMs": 1000},
            "effect": {"type": "increase-latency", "factor": 2.5},
            "delayMs": 200
        }"#;
        let rule: PropagationRule = serde_json::from_str(json).unwrap();
        assert_eq!(
            rule.condition,
            PropagationCondition::TimeoutCount {
                threshold: 5,
                window_ms: 1000.0
            }
        );
        assert_eq!(rule.effect.kind(), "increase-latency");
        assert_eq!(rule.delay_ms, Some(200.0));
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical.is_outage());
        assert!(Severity::High.is_outage());
        assert!(!Severity::Medium.is_outage());
    }

    #[test]
    fn test_unit_effects_parse() {
        let effect: PropagationEffect =
            serde_json::from_str(r#"{"type":"cascade-to-dependents"}"#).unwrap();
        assert_eq!(effect, PropagationEffect::CascadeToDependents);
    }
}
