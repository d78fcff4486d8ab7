//! Events drained by the simulation kernel.

use crate::request::{CallOutcome, RequestSpec};
use archsim_types::{
    CallId, ComponentId, EdgeId, EventId, FaultId, InvariantId, PropagationEffect, RequestId,
    SimTime,
};
use serde::{Deserialize, Serialize};

/// Priority levels for event ordering within the same timestamp.
///
/// Lower values are processed first. Fault and propagation control runs
/// before request traffic so that a fault activated at `t` is visible to a
/// request arriving at `t`; notifications and metric snapshots observe the
/// state the other events left behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[repr(u8)]
pub enum EventPriority {
    /// Fault activation, deactivation and checks.
    FaultControl = 0,

    /// Delayed propagation effects and their reverts.
    Propagation = 1,

    /// Model timers, timeouts, retries and periodic checks.
    Timer = 2,

    /// Request arrivals, completions and outcomes.
    Request = 3,

    /// Observations emitted by models (cache hits, breaker transitions, ...).
    Notification = 4,

    /// Metric snapshots.
    Metrics = 5,
}

impl EventPriority {
    pub const COUNT: usize = 6;
}

/// Type tag of an event.
///
/// The first block mirrors the event vocabulary of the input schema; the
/// last block holds kernel-internal control events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    // ═══════════════════════════════════════════════════════════════════════
    // Request lifecycle
    // ═══════════════════════════════════════════════════════════════════════
    RequestArrival,
    RequestQueued,
    RequestDequeued,
    ProcessingStart,
    ProcessingComplete,
    RequestForwarded,
    RequestTimeout,
    RequestError,
    RequestRetry,
    RequestComplete,
    RequestRejected,

    // ═══════════════════════════════════════════════════════════════════════
    // Component, network and queue conditions
    // ═══════════════════════════════════════════════════════════════════════
    NodeFailure,
    NodeRecovery,
    NodeDegraded,
    NetworkPartition,
    LatencySpike,
    PacketLoss,
    BandwidthThrottle,
    BacklogBuildup,
    QueueFull,
    QueueDrained,

    // ═══════════════════════════════════════════════════════════════════════
    // Deployment and scaling
    // ═══════════════════════════════════════════════════════════════════════
    ConfigRollout,
    DeploymentStart,
    DeploymentComplete,
    DeploymentRollback,
    ScaleUp,
    ScaleDown,
    ColdStart,
    ScaleComplete,

    // ═══════════════════════════════════════════════════════════════════════
    // Storage, consistency and security
    // ═══════════════════════════════════════════════════════════════════════
    DbFailover,
    ReplicationLag,
    DbConnectionPoolExhausted,
    ReconciliationEvent,
    StaleRead,
    WriteConflict,
    SecurityBreach,
    AuthFailure,
    RateLimitExceeded,
    ScheduledJob,
    CronTrigger,
    StorageFull,
    StorageThrottled,
    SchemaChange,
    SchemaIncompatible,

    // ═══════════════════════════════════════════════════════════════════════
    // Circuit breakers, caches, metrics
    // ═══════════════════════════════════════════════════════════════════════
    CircuitOpen,
    CircuitHalfOpen,
    CircuitClose,
    CacheHit,
    CacheMiss,
    CacheEviction,
    CacheStampede,
    MetricsSnapshot,
    SloBreach,
    AlertTriggered,

    // ═══════════════════════════════════════════════════════════════════════
    // Kernel control
    // ═══════════════════════════════════════════════════════════════════════
    FaultActivate,
    FaultDeactivate,
    FaultCheck,
    PropagationEffect,
    PropagationCleared,
    HealthCheck,
    FailureModeCheck,
    AutoscaleCheck,
    InvariantCheck,
    LifecycleStart,
    LifecycleStop,
    ModelTimer,
    ScenarioStep,
}

impl EventKind {
    /// Default priority of events of this kind.
    pub fn priority(self) -> EventPriority {
        use EventKind::*;
        match self {
            FaultActivate | FaultDeactivate | FaultCheck | LifecycleStart | LifecycleStop
            | ScenarioStep => EventPriority::FaultControl,
            PropagationEffect | PropagationCleared => EventPriority::Propagation,
            RequestTimeout | RequestRetry | ModelTimer | HealthCheck | FailureModeCheck
            | AutoscaleCheck | InvariantCheck | ScaleComplete | DeploymentStart
            | DeploymentComplete => EventPriority::Timer,
            RequestArrival | ProcessingComplete | RequestComplete | RequestError
            | RequestRejected => EventPriority::Request,
            MetricsSnapshot => EventPriority::Metrics,
            _ => EventPriority::Notification,
        }
    }

    /// Whether the event only exists to drive the kernel.
    pub fn is_internal(self) -> bool {
        use EventKind::*;
        matches!(
            self,
            FaultActivate
                | FaultDeactivate
                | FaultCheck
                | PropagationEffect
                | PropagationCleared
                | HealthCheck
                | FailureModeCheck
                | AutoscaleCheck
                | InvariantCheck
                | LifecycleStart
                | LifecycleStop
                | ModelTimer
                | ScenarioStep
        )
    }

    /// Kinds a call outcome is reported as.
    pub fn is_outcome(self) -> bool {
        matches!(
            self,
            EventKind::RequestComplete
                | EventKind::RequestError
                | EventKind::RequestTimeout
                | EventKind::RequestRejected
        )
    }

    /// The `snake_case` wire name.
    pub fn as_str(self) -> &'static str {
        use EventKind::*;
        match self {
            RequestArrival => "request_arrival",
            RequestQueued => "request_queued",
            RequestDequeued => "request_dequeued",
            ProcessingStart => "processing_start",
            ProcessingComplete => "processing_complete",
            RequestForwarded => "request_forwarded",
            RequestTimeout => "request_timeout",
            RequestError => "request_error",
            RequestRetry => "request_retry",
            RequestComplete => "request_complete",
            RequestRejected => "request_rejected",
            NodeFailure => "node_failure",
            NodeRecovery => "node_recovery",
            NodeDegraded => "node_degraded",
            NetworkPartition => "network_partition",
            LatencySpike => "latency_spike",
            PacketLoss => "packet_loss",
            BandwidthThrottle => "bandwidth_throttle",
            BacklogBuildup => "backlog_buildup",
            QueueFull => "queue_full",
            QueueDrained => "queue_drained",
            ConfigRollout => "config_rollout",
            DeploymentStart => "deployment_start",
            DeploymentComplete => "deployment_complete",
            DeploymentRollback => "deployment_rollback",
            ScaleUp => "scale_up",
            ScaleDown => "scale_down",
            ColdStart => "cold_start",
            ScaleComplete => "scale_complete",
            DbFailover => "db_failover",
            ReplicationLag => "replication_lag",
            DbConnectionPoolExhausted => "db_connection_pool_exhausted",
            ReconciliationEvent => "reconciliation_event",
            StaleRead => "stale_read",
            WriteConflict => "write_conflict",
            SecurityBreach => "security_breach",
            AuthFailure => "auth_failure",
            RateLimitExceeded => "rate_limit_exceeded",
            ScheduledJob => "scheduled_job",
            CronTrigger => "cron_trigger",
            StorageFull => "storage_full",
            StorageThrottled => "storage_throttled",
            SchemaChange => "schema_change",
            SchemaIncompatible => "schema_incompatible",
            CircuitOpen => "circuit_open",
            CircuitHalfOpen => "circuit_half_open",
            CircuitClose => "circuit_close",
            CacheHit => "cache_hit",
            CacheMiss => "cache_miss",
            CacheEviction => "cache_eviction",
            CacheStampede => "cache_stampede",
            MetricsSnapshot => "metrics_snapshot",
            SloBreach => "slo_breach",
            AlertTriggered => "alert_triggered",
            FaultActivate => "fault_activate",
            FaultDeactivate => "fault_deactivate",
            FaultCheck => "fault_check",
            PropagationEffect => "propagation_effect",
            PropagationCleared => "propagation_cleared",
            HealthCheck => "health_check",
            FailureModeCheck => "failure_mode_check",
            AutoscaleCheck => "autoscale_check",
            InvariantCheck => "invariant_check",
            LifecycleStart => "lifecycle_start",
            LifecycleStop => "lifecycle_stop",
            ModelTimer => "model_timer",
            ScenarioStep => "scenario_step",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Timers a behavior model can set on itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "timer", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ModelTimer {
    /// Periodic probe of load-balancer targets.
    HealthCheck,
    /// A consumer of `lane` became free.
    Dequeue { lane: usize },
    /// An in-flight message was not acknowledged in time.
    VisibilityExpired { lane: usize, message: u64 },
    /// The oldest message of a partial batch waited long enough.
    BatchWait { lane: usize },
    /// Primary/replica role swap finished.
    FailoverComplete { new_primary: usize },
    /// A propagation effect asked the component to fail over.
    FailoverRequested,
    /// Retry a producer blocked on a full queue.
    Unblock,
    /// A query waited too long for a pooled connection.
    ConnectionWait { call: CallId },
}

/// What a fault-control event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FaultPhase {
    /// Evaluate whether a pending fault activates.
    Activation,
    /// Evaluate whether an active fault expires.
    Deactivation,
}

/// Identity of one propagation rule: component, failure mode, rule index.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleKey {
    pub component: ComponentId,
    pub mode: usize,
    pub rule: usize,
}

/// Periodic checks driven by the kernel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "check", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum CheckTarget {
    FailureModes { component: ComponentId },
    Autoscale { component: ComponentId },
    Invariant { invariant: InvariantId },
    Invariants,
}

/// Type-specific event data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum EventPayload {
    None,

    /// A new external request produced by the workload generator.
    Arrival { spec: RequestSpec },

    /// A call being delivered to, or processed by, its component.
    Call { call: CallId },

    /// A child call resolved; delivered to the parent's component.
    Outcome { call: CallId, outcome: CallOutcome },

    /// The caller's deadline for `call` expired.
    Timeout { call: CallId },

    /// Re-send a failed call over the same edge.
    Retry {
        parent: CallId,
        edge: EdgeId,
        attempt: u32,
    },

    /// A model-owned timer.
    Timer { timer: ModelTimer },

    Fault { fault: FaultId, phase: FaultPhase },

    /// A propagation effect scheduled for `target`.
    Propagation {
        cause: RuleKey,
        /// Index of the rule, within the cause's failure mode, whose effect this is.
        rule: usize,
        target: ComponentId,
        effect: PropagationEffect,
        depth: u32,
        visited: Vec<ComponentId>,
    },

    /// A propagation rule stopped holding; revert what it applied.
    PropagationCleared { cause: RuleKey },

    Check { target: CheckTarget },

    Breaker { edge: EdgeId, state: String },

    Scale {
        previous_replicas: u32,
        new_replicas: u32,
        trigger: String,
    },

    Deployment { version: String },

    Failover {
        previous_primary: usize,
        new_primary: usize,
        replication_lag_ms: f64,
        data_loss_risk: bool,
    },

    Backlog { depth: u64, max_depth: u64 },

    /// A message handed to a consumer; feeds ordering checks.
    Message {
        topic: ComponentId,
        ordering_key: Option<String>,
        sent_at: SimTime,
        receives: u32,
    },

    Cache { key: String },

    /// Free-form detail for notifications.
    Note { detail: String },

    /// Index into the compiled scenario timeline.
    Step { index: usize },
}

/// An immutable scheduled occurrence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: EventId,
    pub time: SimTime,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub priority: EventPriority,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<ComponentId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<ComponentId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<RequestId>,
    /// Event whose handling scheduled this one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caused_by: Option<EventId>,
    pub data: EventPayload,
}

impl Event {
    /// A new event with the kind's default priority and no routing.
    pub fn new(id: EventId, time: SimTime, kind: EventKind, data: EventPayload) -> Self {
        Self {
            id,
            time,
            kind,
            priority: kind.priority(),
            source: None,
            target: None,
            request: None,
            caused_by: None,
            data,
        }
    }

    pub fn with_priority(mut self, priority: EventPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_source(mut self, source: ComponentId) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_target(mut self, target: ComponentId) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_request(mut self, request: RequestId) -> Self {
        self.request = Some(request);
        self
    }

    pub fn caused_by(mut self, parent: Option<EventId>) -> Self {
        self.caused_by = parent;
        self
    }
}
