//! The value a simulation run produces.
//!
//! Nothing in here depends on wall-clock time, so two runs with the same
//! seed and input serialize to identical bytes.

use crate::event::{Event, EventKind};
use crate::request::RequestTrace;
use archsim_types::{ComponentId, EdgeId, Hash, InvariantId, SimTime, ViolationPolicy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How the run ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum RunStatus {
    /// Drained to the configured duration or an empty queue.
    Completed,
    /// A `fail-simulation` invariant was violated.
    Aborted {
        invariant_id: InvariantId,
        at: SimTime,
        reason: String,
    },
    /// Stopped through a cancellation token.
    Cancelled { at: SimTime },
    /// Hit the configured event budget.
    EventBudgetExhausted { processed: u64 },
}

// ═══════════════════════════════════════════════════════════════════════════
// Traces
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventTraces {
    pub events: Vec<Event>,
    pub total_events: u64,
    pub sampling_rate: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestTraces {
    pub traces: Vec<RequestTrace>,
    pub total_requests: u64,
    pub sampling_rate: f64,
}

// ═══════════════════════════════════════════════════════════════════════════
// Metrics
// ═══════════════════════════════════════════════════════════════════════════

/// Latency distribution in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencySummary {
    pub p50: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
    pub p999: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub std_dev: f64,
    pub samples: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Throughput {
    pub requests_per_second: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub messages_per_second: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_per_second: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Availability {
    pub successful_requests: u64,
    pub total_requests: u64,
    pub availability_percent: f64,
    pub uptime_ms: f64,
    pub downtime_ms: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorMetrics {
    pub error_rate: f64,
    pub errors_by_type: BTreeMap<String, u64>,
    pub timeout_rate: f64,
    pub rejection_rate: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Saturation {
    pub cpu_utilization: f64,
    pub memory_utilization: f64,
    pub queue_length: f64,
    pub queue_utilization: f64,
    pub connection_pool_utilization: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Durability {
    pub writes_attempted: u64,
    pub writes_succeeded: u64,
    pub writes_lost: u64,
    /// Lag per replica in milliseconds.
    pub replica_lag: Vec<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Consistency {
    pub replication_lag_ms: f64,
    pub stale_reads: u64,
    pub write_conflicts: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recovery {
    /// Mean time to recovery, ms.
    pub mttr: f64,
    /// Mean time between failures, ms.
    pub mtbf: f64,
    pub failure_count: u64,
    pub recovery_count: u64,
}

/// Aggregated metrics for the whole run or one component.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsDefinition {
    pub latency: LatencySummary,
    pub throughput: Throughput,
    pub availability: Availability,
    pub errors: ErrorMetrics,
    pub saturation: Saturation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub durability: Option<Durability>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consistency: Option<Consistency>,
    pub recovery: Recovery,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeMetrics {
    pub calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub retries: u64,
    /// Lost to partitions or packet loss.
    pub dropped: u64,
    /// Failed fast by an open circuit breaker.
    pub short_circuited: u64,
    pub breaker_opens: u64,
    pub error_rate: f64,
    pub network_latency: LatencySummary,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsOutput {
    pub global: MetricsDefinition,
    pub per_component: BTreeMap<ComponentId, MetricsDefinition>,
    pub per_edge: BTreeMap<EdgeId, EdgeMetrics>,
}

// ═══════════════════════════════════════════════════════════════════════════
// Time series and heatmaps
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalSeries {
    pub throughput_rps: Vec<f64>,
    pub latency_p50: Vec<f64>,
    pub latency_p99: Vec<f64>,
    pub error_rate: Vec<f64>,
    pub active_requests: Vec<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentSeries {
    pub queue_length: Vec<f64>,
    pub active_requests: Vec<f64>,
    pub replicas: Vec<f64>,
    pub throughput_rps: Vec<f64>,
    pub latency_p99: Vec<f64>,
    pub cpu_utilization: Vec<f64>,
    pub memory_utilization: Vec<f64>,
    pub error_rate: Vec<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeSeriesOutput {
    /// Bucket start times in ms.
    pub timestamps: Vec<f64>,
    /// Milliseconds between points.
    pub resolution: f64,
    pub global: GlobalSeries,
    pub components: BTreeMap<ComponentId, ComponentSeries>,
}

/// `values[time][component]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heatmap {
    pub timestamps: Vec<f64>,
    pub component_ids: Vec<ComponentId>,
    pub values: Vec<Vec<f64>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heatmaps {
    pub load_heatmap: Heatmap,
    pub latency_heatmap: Heatmap,
    pub error_heatmap: Heatmap,
}

// ═══════════════════════════════════════════════════════════════════════════
// Causal graph
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CausalNodeType {
    Failure,
    Effect,
    Recovery,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CausalNode {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: CausalNodeType,
    pub component_id: ComponentId,
    /// Milliseconds since start.
    pub timestamp: f64,
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CausalEdgeType {
    Caused,
    Mitigated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CausalEdge {
    pub from: String,
    pub to: String,
    #[serde(rename = "type")]
    pub edge_type: CausalEdgeType,
    pub delay_ms: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CausalGraph {
    pub nodes: Vec<CausalNode>,
    pub edges: Vec<CausalEdge>,
}

// ═══════════════════════════════════════════════════════════════════════════
// Findings
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvariantViolation {
    pub invariant_id: InvariantId,
    pub invariant_name: String,
    /// Milliseconds since start.
    pub violated_at: f64,
    pub details: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_cause: Option<String>,
    pub affected_components: Vec<ComponentId>,
    pub policy: ViolationPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SloType {
    Latency,
    ErrorRate,
    Availability,
    Throughput,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FindingSeverity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SloBreach {
    pub component_id: ComponentId,
    pub slo_type: SloType,
    pub threshold: f64,
    /// Worst value observed while breached.
    pub actual_value: f64,
    pub breach_start_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub breach_end_ms: Option<f64>,
    pub duration_ms: f64,
    pub severity: FindingSeverity,
    pub affected_requests: u64,
    /// Distinct users behind the affected requests.
    pub estimated_user_impact: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AntiPattern {
    MonolithicSharedDb,
    SyncRpcLongOps,
    UnlimitedRetries,
    InfiniteTtlMutable,
    OverSharding,
    DistributedTransaction,
    BlockingEventHandler,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AntiPatternDetection {
    pub anti_pattern: AntiPattern,
    /// Component or edge ids.
    pub detected_at: Vec<String>,
    pub severity: FindingSeverity,
    pub recommendation: String,
}

// ═══════════════════════════════════════════════════════════════════════════
// Verification
// ═══════════════════════════════════════════════════════════════════════════

/// `L = λW` for one component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LittlesLawCheck {
    pub component_id: ComponentId,
    pub arrival_rate_per_sec: f64,
    pub mean_latency_ms: f64,
    pub expected_in_flight: f64,
    pub observed_in_flight: f64,
    pub relative_error: f64,
    pub holds: bool,
}

/// Every arrival is accounted for exactly once.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConservationCheck {
    pub arrivals: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub rejected: u64,
    pub in_flight: u64,
    pub holds: bool,
}

/// Drained order respects timestamps and causal parents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CausalOrderCheck {
    pub events_checked: u64,
    pub violations: u64,
    pub holds: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationResults {
    pub littles_law: Vec<LittlesLawCheck>,
    pub request_conservation: ConservationCheck,
    pub causal_order: CausalOrderCheck,
}

// ═══════════════════════════════════════════════════════════════════════════
// Reproducibility and run metadata
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReproducibilitySpec {
    pub seed: String,
    /// Hash of `deterministic_config`.
    pub config_hash: Hash,
    /// Running hash over every drained event, sampled or not.
    pub trace_hash: Hash,
    /// The serialized input the run was built from.
    pub deterministic_config: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunMetadata {
    /// How same-timestamp propagation effects are ordered.
    pub propagation_tie_break: String,
    /// How overlapping fault and propagation effects combine.
    pub effect_stacking: String,
    pub events_processed: u64,
    pub events_by_kind: BTreeMap<EventKind, u64>,
    pub max_queue_depth: u64,
}

/// Everything a run produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationOutput {
    pub run_id: String,
    pub seed: String,
    pub status: RunStatus,
    pub simulated_duration_ms: f64,
    pub event_traces: EventTraces,
    pub request_traces: RequestTraces,
    pub metrics: MetricsOutput,
    pub time_series: TimeSeriesOutput,
    pub heatmaps: Heatmaps,
    pub causal_graph: CausalGraph,
    pub invariant_violations: Vec<InvariantViolation>,
    pub slo_breaches: Vec<SloBreach>,
    pub anti_patterns_detected: Vec<AntiPatternDetection>,
    pub verification: VerificationResults,
    pub reproducibility_spec: ReproducibilitySpec,
    pub metadata: RunMetadata,
}

impl SimulationOutput {
    pub fn is_aborted(&self) -> bool {
        matches!(self.status, RunStatus::Aborted { .. })
    }

    /// Number of drained events of `kind`, independent of trace sampling.
    pub fn event_count(&self, kind: EventKind) -> u64 {
        self.metadata.events_by_kind.get(&kind).copied().unwrap_or(0)
    }

    /// Sampled events of `kind`.
    pub fn events_of(&self, kind: EventKind) -> impl Iterator<Item = &Event> {
        self.event_traces.events.iter().filter(move |e| e.kind == kind)
    }

    pub fn component_metrics(&self, id: &str) -> Option<&MetricsDefinition> {
        self.metrics.per_component.get(&ComponentId::new(id))
    }

    pub fn has_anti_pattern(&self, pattern: AntiPattern) -> bool {
        self.anti_patterns_detected
            .iter()
            .any(|d| d.anti_pattern == pattern)
    }
}
