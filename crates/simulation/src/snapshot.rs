//! Named metrics read by fault conditions, scenario waits and invariant
//! expressions.
//!
//! Conditions in the input refer to metrics by loose names (`error_rate`,
//! `errorRate`, `p99`, ...). They are resolved once into a [`Metric`] and
//! read through a [`MetricSource`], which the kernel implements over its live
//! state and tests implement over a map.

use archsim_types::{ComponentId, FaultCondition};
use std::collections::BTreeMap;

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Metric {
    ErrorRate,
    LatencyP50,
    LatencyP95,
    LatencyP99,
    Rps,
    QueueDepth,
    ActiveRequests,
    Utilization,
    Memory,
    Replicas,
    ReadyReplicas,
    Available,
    StaleReads,
    WriteConflicts,
    WritesLost,
    ReplicationLagMs,
    Timeouts,
}

impl Metric {
    pub const ALL: [Metric; 17] = [
        Metric::ErrorRate,
        Metric::LatencyP50,
        Metric::LatencyP95,
        Metric::LatencyP99,
        Metric::Rps,
        Metric::QueueDepth,
        Metric::ActiveRequests,
        Metric::Utilization,
        Metric::Memory,
        Metric::Replicas,
        Metric::ReadyReplicas,
        Metric::Available,
        Metric::StaleReads,
        Metric::WriteConflicts,
        Metric::WritesLost,
        Metric::ReplicationLagMs,
        Metric::Timeouts,
    ];

    /// Resolve a metric name, ignoring case, `_` and `-`.
    pub fn parse(name: &str) -> Result<Self, ConfigError> {
        let normalized: String = name
            .chars()
            .filter(|c| *c != '_' && *c != '-' && *c != '.')
            .flat_map(char::to_lowercase)
            .collect();
        let metric = match normalized.as_str() {
            "errorrate" | "errors" => Metric::ErrorRate,
            "latencyp50" | "p50" | "medianlatency" => Metric::LatencyP50,
            "latencyp95" | "p95" => Metric::LatencyP95,
            "latencyp99" | "p99" | "latency" => Metric::LatencyP99,
            "rps" | "throughput" | "throughputrps" | "requestspersecond" => Metric::Rps,
            "queuedepth" | "queuelength" | "backlog" => Metric::QueueDepth,
            "activerequests" | "inflight" | "concurrency" => Metric::ActiveRequests,
            "cpu" | "cpuutilization" | "utilization" => Metric::Utilization,
            "memory" | "memoryutilization" => Metric::Memory,
            "replicas" => Metric::Replicas,
            "readyreplicas" | "healthyreplicas" => Metric::ReadyReplicas,
            "available" | "availability" | "up" => Metric::Available,
            "stalereads" => Metric::StaleReads,
            "writeconflicts" => Metric::WriteConflicts,
            "writeslost" | "dataloss" | "lostwrites" => Metric::WritesLost,
            "replicationlag" | "replicationlagms" | "lag" => Metric::ReplicationLagMs,
            "timeouts" | "timeoutcount" => Metric::Timeouts,
            _ => return Err(ConfigError::UnknownMetric(name.to_string())),
        };
        Ok(metric)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Metric::ErrorRate => "error_rate",
            Metric::LatencyP50 => "latency_p50",
            Metric::LatencyP95 => "latency_p95",
            Metric::LatencyP99 => "latency_p99",
            Metric::Rps => "rps",
            Metric::QueueDepth => "queue_depth",
            Metric::ActiveRequests => "active_requests",
            Metric::Utilization => "utilization",
            Metric::Memory => "memory",
            Metric::Replicas => "replicas",
            Metric::ReadyReplicas => "ready_replicas",
            Metric::Available => "available",
            Metric::StaleReads => "stale_reads",
            Metric::WriteConflicts => "write_conflicts",
            Metric::WritesLost => "writes_lost",
            Metric::ReplicationLagMs => "replication_lag_ms",
            Metric::Timeouts => "timeouts",
        }
    }
}

/// Read access to current metric values.
///
/// `component == None` asks for the system-wide value. `None` is returned
/// when the metric has no value yet (an empty window, an unknown component).
pub trait MetricSource {
    fn metric(&self, metric: Metric, component: Option<&ComponentId>) -> Option<f64>;
}

/// Fixed values, keyed by metric and optional component.
#[derive(Debug, Clone, Default)]
pub struct StaticMetrics {
    values: BTreeMap<(Metric, Option<ComponentId>), f64>,
}

impl StaticMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, metric: Metric, component: Option<&str>, value: f64) -> Self {
        self.set(metric, component, value);
        self
    }

    pub fn set(&mut self, metric: Metric, component: Option<&str>, value: f64) {
        self.values
            .insert((metric, component.map(ComponentId::new)), value);
    }
}

impl MetricSource for StaticMetrics {
    fn metric(&self, metric: Metric, component: Option<&ComponentId>) -> Option<f64> {
        self.values.get(&(metric, component.cloned())).copied()
    }
}

/// Check that a condition names a known metric.
pub fn validate_condition(condition: &FaultCondition) -> Result<(), ConfigError> {
    Metric::parse(&condition.metric).map(|_| ())
}

/// Whether `condition` holds now. A metric without a value never holds.
pub fn condition_holds(condition: &FaultCondition, source: &dyn MetricSource) -> bool {
    let Ok(metric) = Metric::parse(&condition.metric) else {
        return false;
    };
    source
        .metric(metric, condition.component_id.as_ref())
        .is_some_and(|value| condition.operator.holds(value, condition.value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use archsim_types::ComparisonOperator;

    #[test]
    fn test_metric_names_are_loose() {
        for name in ["error_rate", "errorRate", "ERROR-RATE"] {
            assert_eq!(Metric::parse(name), Ok(Metric::ErrorRate));
        }
        assert_eq!(Metric::parse("p99"), Ok(Metric::LatencyP99));
        assert_eq!(
            Metric::parse("vibes"),
            Err(ConfigError::UnknownMetric("vibes".into()))
        );
    }

    #[test]
    fn test_condition_against_component_value() {
        let source = StaticMetrics::new().with(Metric::ErrorRate, Some("api"), 0.4);
        let mut condition = FaultCondition {
            metric: "error_rate".into(),
            operator: ComparisonOperator::Gt,
            value: 0.3,
            component_id: Some(ComponentId::new("api")),
        };
        assert!(condition_holds(&condition, &source));

        condition.component_id = None;
        assert!(!condition_holds(&condition, &source), "no global value");
    }
}
