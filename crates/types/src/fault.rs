//! Scheduled fault injections.

use crate::distribution::DistributionConfig;
use crate::identifiers::{ComponentId, EdgeId, FaultId, RegionId};
use serde::{Deserialize, Serialize};

/// Comparison used by fault conditions and scaling triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComparisonOperator {
    Gt,
    Lt,
    Eq,
    Gte,
    Lte,
}

impl ComparisonOperator {
    /// Evaluate `lhs <op> rhs`.
    pub fn holds(self, lhs: f64, rhs: f64) -> bool {
        match self {
            Self::Gt => lhs > rhs,
            Self::Lt => lhs < rhs,
            Self::Eq => (lhs - rhs).abs() <= f64::EPSILON * lhs.abs().max(rhs.abs()).max(1.0),
            Self::Gte => lhs >= rhs,
            Self::Lte => lhs <= rhs,
        }
    }

    /// Whether the operator tests for values going up.
    pub fn is_upper_bound(self) -> bool {
        matches!(self, Self::Gt | Self::Gte)
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Self::Gt => ">",
            Self::Lt => "<",
            Self::Eq => "==",
            Self::Gte => ">=",
            Self::Lte => "<=",
        }
    }
}

/// A threshold over a runtime metric.
///
/// Without a component id the metric is read from run-wide totals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaultCondition {
    pub metric: String,
    pub operator: ComparisonOperator,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component_id: Option<ComponentId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum FaultTiming {
    Deterministic {
        at_ms: f64,
    },
    /// Re-checked every `check_interval_ms` until it fires once.
    Probabilistic {
        probability: f64,
        check_interval_ms: f64,
    },
    Conditional {
        condition: FaultCondition,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum FaultDuration {
    Permanent,
    Fixed { duration_ms: f64 },
    UntilCondition { condition: FaultCondition },
}

/// What a fault does while active.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum FaultSpec {
    Latency { added_ms: DistributionConfig },
    Error { error_rate: f64, error_code: String },
    PacketLoss { loss_rate: f64 },
    BandwidthLimit { limit_mbps: f64 },
    CpuStress { utilization_percent: f64 },
    MemoryStress { utilization_percent: f64 },
    DiskFull { percent_full: f64 },
    ConnectionLimit { max_connections: u32 },
    DnsFailure,
    CertificateExpiry,
    ClockSkew { skew_ms: f64 },
    /// Cut the scope off from these component or region ids.
    NetworkPartition { partition_with: Vec<String> },
    ProcessCrash,
    SlowStart { delay_ms: f64 },
}

impl FaultSpec {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Latency { .. } => "latency",
            Self::Error { .. } => "error",
            Self::PacketLoss { .. } => "packet-loss",
            Self::BandwidthLimit { .. } => "bandwidth-limit",
            Self::CpuStress { .. } => "cpu-stress",
            Self::MemoryStress { .. } => "memory-stress",
            Self::DiskFull { .. } => "disk-full",
            Self::ConnectionLimit { .. } => "connection-limit",
            Self::DnsFailure => "dns-failure",
            Self::CertificateExpiry => "certificate-expiry",
            Self::ClockSkew { .. } => "clock-skew",
            Self::NetworkPartition { .. } => "network-partition",
            Self::ProcessCrash => "process-crash",
            Self::SlowStart { .. } => "slow-start",
        }
    }

    /// Whether the fault is meaningful on an edge.
    pub fn applies_to_edges(&self) -> bool {
        matches!(
            self,
            Self::Latency { .. }
                | Self::Error { .. }
                | Self::PacketLoss { .. }
                | Self::BandwidthLimit { .. }
                | Self::NetworkPartition { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum FaultScope {
    Component {
        component_id: ComponentId,
    },
    Edge {
        edge_id: EdgeId,
    },
    Region {
        region_id: RegionId,
    },
    /// `percentage` is 0-100.
    PercentageOfReplicas {
        component_id: ComponentId,
        percentage: f64,
    },
}

/// A fault with its schedule and target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaultInjection {
    pub id: FaultId,
    #[serde(default)]
    pub name: String,
    pub timing: FaultTiming,
    pub duration: FaultDuration,
    pub fault: FaultSpec,
    pub scope: FaultScope,
}

impl FaultInjection {
    /// A fault on one component at a fixed time for a fixed duration.
    pub fn on_component(
        id: impl Into<FaultId>,
        component: impl Into<ComponentId>,
        fault: FaultSpec,
        at_ms: f64,
        duration_ms: f64,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.as_str().to_string(),
            id,
            timing: FaultTiming::Deterministic { at_ms },
            duration: FaultDuration::Fixed { duration_ms },
            fault,
            scope: FaultScope::Component {
                component_id: component.into(),
            },
        }
    }

    pub fn with_scope(mut self, scope: FaultScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_duration(mut self, duration: FaultDuration) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_timing(mut self, timing: FaultTiming) -> Self {
        self.timing = timing;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_json_shape() {
        let json = r#"{
            "id": "cache-expire",
            "name": "Mass cache expiry",
            "timing": {"type": "deterministic", "atMs": 10000},
            "duration": {"type": "fixed", "durationMs": 1},
            "fault": {"type": "process-crash"},
            "scope": {"type": "component", "componentId": "cache"}
        }"#;
        let fault: FaultInjection = serde_json::from_str(json).unwrap();
        assert_eq!(fault.fault, FaultSpec::ProcessCrash);
        assert_eq!(
            fault.scope,
            FaultScope::Component {
                component_id: ComponentId::new("cache")
            }
        );
        assert_eq!(fault.duration, FaultDuration::Fixed { duration_ms: 1.0 });
    }

    #[test]
    fn test_operators() {
        assert!(ComparisonOperator::Gt.holds(2.0, 1.0));
        assert!(!ComparisonOperator::Gt.holds(1.0, 1.0));
        assert!(ComparisonOperator::Gte.holds(1.0, 1.0));
        assert!(ComparisonOperator::Eq.holds(0.1 + 0.2, 0.3));
        assert!(!ComparisonOperator::Lte.is_upper_bound());
    }

    #[test]
    fn test_edge_applicability() {
        assert!(FaultSpec::PacketLoss { loss_rate: 0.1 }.applies_to_edges());
        assert!(!FaultSpec::ProcessCrash.applies_to_edges());
    }
}
