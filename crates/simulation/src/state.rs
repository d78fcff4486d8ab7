//! Kernel-owned runtime state.
//!
//! Created when a run starts and dropped when it ends. Behavior models read
//! it through their context; only the kernel (and the fault, propagation,
//! failure-mode and autoscale engines it drives) writes to it.

use archsim_core::RuleKey;
use archsim_types::{
    CallId, ComponentConfig, ComponentDefinition, ComponentId, DistributionConfig, EdgeId,
    FaultId, FaultSpec, PropagationEffect, RequestId, SimTime,
};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::breaker::CircuitBreaker;
use crate::graph::ArchitectureGraph;

/// Fewer samples than this and the window reports no error rate.
pub const MIN_WINDOW_SAMPLES: usize = 10;

/// A caller treats a dependency at or above this error rate as failing.
pub const FAILING_ERROR_RATE: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaLifecycle {
    Starting,
    Ready,
    Draining,
    Terminated,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Replica {
    pub state: ReplicaLifecycle,
    /// When a `Starting` replica becomes ready.
    pub ready_at: SimTime,
    /// Crash faults holding this replica down. Empty when it is up.
    pub crashed_by: BTreeSet<FaultId>,
    /// Rolling-restart window during a deployment.
    pub restart: Option<(SimTime, SimTime)>,
}

impl Replica {
    pub fn ready() -> Self {
        Self {
            state: ReplicaLifecycle::Ready,
            ready_at: SimTime::ZERO,
            crashed_by: BTreeSet::new(),
            restart: None,
        }
    }

    pub fn starting(ready_at: SimTime) -> Self {
        Self {
            state: ReplicaLifecycle::Starting,
            ready_at,
            crashed_by: BTreeSet::new(),
            restart: None,
        }
    }

    pub fn is_crashed(&self) -> bool {
        !self.crashed_by.is_empty()
    }

    pub fn is_live(&self) -> bool {
        matches!(
            self.state,
            ReplicaLifecycle::Starting | ReplicaLifecycle::Ready
        )
    }

    pub fn is_ready(&self, now: SimTime) -> bool {
        if self.is_crashed() {
            return false;
        }
        if let Some((from, until)) = self.restart {
            if now >= from && now < until {
                return false;
            }
        }
        match self.state {
            ReplicaLifecycle::Ready => true,
            ReplicaLifecycle::Starting => self.ready_at <= now,
            _ => false,
        }
    }
}

/// A fault applied to a component, optionally to a subset of its replicas.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedFault {
    pub spec: FaultSpec,
    pub replicas: Option<BTreeSet<usize>>,
}

impl AppliedFault {
    pub fn covers(&self, replica: Option<usize>) -> bool {
        match (&self.replicas, replica) {
            (None, _) => true,
            (Some(set), Some(r)) => set.contains(&r),
            (Some(_), None) => false,
        }
    }
}

/// Combined effect of every active fault and propagated effect on a target.
///
/// Error rates add (capped at 1), latency factors multiply, packet loss
/// combines as independent drops, capacity limits take the tightest value.
#[derive(Debug, Clone, PartialEq)]
pub struct FaultEffects {
    pub error_rate: f64,
    pub error_code: Option<String>,
    pub added_latency: Vec<DistributionConfig>,
    pub latency_factor: f64,
    pub packet_loss: f64,
    pub bandwidth_mbps: Option<f64>,
    pub cpu_stress: f64,
    pub memory_stress: f64,
    pub disk_full: f64,
    pub connection_limit: Option<u32>,
    pub dns_failure: bool,
    pub certificate_expired: bool,
    pub clock_skew_ms: f64,
    pub partitioned_with: BTreeSet<String>,
    pub slow_start_ms: f64,
    pub reject: bool,
}

impl Default for FaultEffects {
    fn default() -> Self {
        Self {
            error_rate: 0.0,
            error_code: None,
            added_latency: Vec::new(),
            latency_factor: 1.0,
            packet_loss: 0.0,
            bandwidth_mbps: None,
            cpu_stress: 0.0,
            memory_stress: 0.0,
            disk_full: 0.0,
            connection_limit: None,
            dns_failure: false,
            certificate_expired: false,
            clock_skew_ms: 0.0,
            partitioned_with: BTreeSet::new(),
            slow_start_ms: 0.0,
            reject: false,
        }
    }
}

impl FaultEffects {
    /// Fold one fault into the total.
    pub fn apply(&mut self, spec: &FaultSpec) {
        match spec {
            FaultSpec::Latency { added_ms } => self.added_latency.push(added_ms.clone()),
            FaultSpec::Error {
                error_rate,
                error_code,
            } => {
                self.error_rate = (self.error_rate + error_rate).min(1.0);
                self.error_code.get_or_insert_with(|| error_code.clone());
            }
            FaultSpec::PacketLoss { loss_rate } => {
                self.packet_loss = 1.0 - (1.0 - self.packet_loss) * (1.0 - loss_rate.clamp(0.0, 1.0));
            }
            FaultSpec::BandwidthLimit { limit_mbps } => {
                self.bandwidth_mbps = Some(
                    self.bandwidth_mbps
                        .map_or(*limit_mbps, |current| current.min(*limit_mbps)),
                );
            }
            FaultSpec::CpuStress {
                utilization_percent,
            } => self.cpu_stress = self.cpu_stress.max(*utilization_percent),
            FaultSpec::MemoryStress {
                utilization_percent,
            } => self.memory_stress = self.memory_stress.max(*utilization_percent),
            FaultSpec::DiskFull { percent_full } => {
                self.disk_full = self.disk_full.max(*percent_full)
            }
            FaultSpec::ConnectionLimit { max_connections } => {
                self.connection_limit = Some(
                    self.connection_limit
                        .map_or(*max_connections, |c| c.min(*max_connections)),
                );
            }
            FaultSpec::DnsFailure => self.dns_failure = true,
            FaultSpec::CertificateExpiry => self.certificate_expired = true,
            FaultSpec::ClockSkew { skew_ms } => self.clock_skew_ms += skew_ms,
            FaultSpec::NetworkPartition { partition_with } => {
                self.partitioned_with.extend(partition_with.iter().cloned());
            }
            // Tracked on the replicas themselves.
            FaultSpec::ProcessCrash => {}
            FaultSpec::SlowStart { delay_ms } => self.slow_start_ms = self.slow_start_ms.max(*delay_ms),
        }
    }

    /// Fold a propagated effect into the total.
    pub fn apply_propagated(&mut self, effect: &PropagationEffect) {
        match effect {
            PropagationEffect::IncreaseLatency { factor } => self.latency_factor *= factor.max(0.0),
            PropagationEffect::IncreaseErrorRate { rate } => {
                self.error_rate = (self.error_rate + rate).min(1.0);
                self.error_code
                    .get_or_insert_with(|| "propagated-failure".to_string());
            }
            PropagationEffect::RejectRequests => self.reject = true,
            PropagationEffect::TriggerCircuitBreaker
            | PropagationEffect::CascadeToDependents
            | PropagationEffect::TriggerFailover => {}
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Sample {
    at: SimTime,
    latency_us: u64,
    error: bool,
}

/// Recent call outcomes at one component (or globally).
#[derive(Debug, Clone)]
pub struct RollingWindow {
    width_us: u64,
    samples: VecDeque<Sample>,
    latencies: BTreeMap<u64, u32>,
    errors: usize,
    timeouts: VecDeque<SimTime>,
    child_failures: VecDeque<(SimTime, ComponentId)>,
}

impl RollingWindow {
    pub fn new(width_ms: f64) -> Self {
        Self {
            width_us: archsim_types::millis_to_micros(width_ms).max(1),
            samples: VecDeque::new(),
            latencies: BTreeMap::new(),
            errors: 0,
            timeouts: VecDeque::new(),
            child_failures: VecDeque::new(),
        }
    }

    pub fn record(&mut self, now: SimTime, latency_us: u64, error: bool) {
        self.prune(now);
        self.samples.push_back(Sample {
            at: now,
            latency_us,
            error,
        });
        *self.latencies.entry(latency_us).or_insert(0) += 1;
        if error {
            self.errors += 1;
        }
    }

    /// A call this component made timed out.
    pub fn record_timeout(&mut self, now: SimTime) {
        self.prune(now);
        self.timeouts.push_back(now);
    }

    /// A call this component made to `dependency` failed.
    pub fn record_child_failure(&mut self, now: SimTime, dependency: ComponentId) {
        self.prune(now);
        self.child_failures.push_back((now, dependency));
    }

    /// Drop everything older than the window.
    pub fn prune(&mut self, now: SimTime) {
        let cutoff = SimTime(now.0.saturating_sub(self.width_us));
        while let Some(front) = self.samples.front() {
            if front.at >= cutoff {
                break;
            }
            let sample = *front;
            self.samples.pop_front();
            if let Some(count) = self.latencies.get_mut(&sample.latency_us) {
                *count -= 1;
                if *count == 0 {
                    self.latencies.remove(&sample.latency_us);
                }
            }
            if sample.error {
                self.errors -= 1;
            }
        }
        while self.timeouts.front().is_some_and(|t| *t < cutoff) {
            self.timeouts.pop_front();
        }
        while self.child_failures.front().is_some_and(|(t, _)| *t < cutoff) {
            self.child_failures.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn error_count(&self) -> usize {
        self.errors
    }

    /// `None` until the window holds enough samples to be meaningful.
    pub fn error_rate(&self) -> Option<f64> {
        if self.samples.len() < MIN_WINDOW_SAMPLES {
            None
        } else {
            Some(self.errors as f64 / self.samples.len() as f64)
        }
    }

    /// Latency quantile in milliseconds.
    pub fn quantile_ms(&self, q: f64) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let rank = ((q.clamp(0.0, 1.0) * self.samples.len() as f64).ceil() as usize).max(1);
        let mut seen = 0usize;
        for (latency, count) in &self.latencies {
            seen += *count as usize;
            if seen >= rank {
                return Some(archsim_types::micros_to_millis(*latency));
            }
        }
        None
    }

    pub fn p99_ms(&self) -> Option<f64> {
        self.quantile_ms(0.99)
    }

    /// Completed calls per second over the window.
    pub fn rps(&self, now: SimTime) -> f64 {
        let span_us = self.width_us.min(now.as_micros().max(1));
        self.samples.len() as f64 / (span_us as f64 / 1_000_000.0)
    }

    pub fn timeouts_within(&self, now: SimTime, window_us: u64) -> u32 {
        let cutoff = SimTime(now.0.saturating_sub(window_us));
        self.timeouts.iter().filter(|t| **t >= cutoff).count() as u32
    }

    pub fn failures_from(&self, dependency: &ComponentId) -> u32 {
        self.child_failures
            .iter()
            .filter(|(_, d)| d == dependency)
            .count() as u32
    }
}

/// Runtime of one component.
#[derive(Debug, Clone)]
pub struct ComponentRuntime {
    pub replicas: Vec<Replica>,
    /// Inside its lifecycle window.
    pub online: bool,
    pub faults: BTreeMap<FaultId, AppliedFault>,
    /// Propagated effects keyed by (cause, rule index).
    pub propagated: BTreeMap<(RuleKey, usize), PropagationEffect>,
    /// Failure modes currently causing an outage.
    pub mode_outages: BTreeSet<usize>,
    /// Failure modes currently degrading the component.
    pub mode_degraded: BTreeSet<usize>,
    pub window: RollingWindow,
    pub version: String,
    cursor: usize,
}

impl ComponentRuntime {
    pub fn new(def: &ComponentDefinition, window_ms: f64) -> Self {
        let mut count = def.initial_replicas() as usize;
        if let ComponentConfig::Database(db) = &def.config {
            if let Some(replication) = &db.replication {
                count = count.max(1 + replication.replicas as usize);
            }
        }
        Self {
            replicas: vec![Replica::ready(); count.max(1)],
            online: def.lifecycle.start_time.map_or(true, |t| t <= 0.0),
            faults: BTreeMap::new(),
            propagated: BTreeMap::new(),
            mode_outages: BTreeSet::new(),
            mode_degraded: BTreeSet::new(),
            window: RollingWindow::new(window_ms),
            version: def.lifecycle.deploy_version.clone(),
            cursor: 0,
        }
    }

    /// Effects seen by `replica` (or by the component as a whole).
    pub fn effects(&self, replica: Option<usize>) -> FaultEffects {
        let mut effects = FaultEffects::default();
        for applied in self.faults.values().filter(|f| f.covers(replica)) {
            effects.apply(&applied.spec);
        }
        for effect in self.propagated.values() {
            effects.apply_propagated(effect);
        }
        if !self.mode_degraded.is_empty() {
            effects.latency_factor *= 2.0;
        }
        if effects.cpu_stress > 0.0 {
            effects.latency_factor *= 1.0 + effects.cpu_stress / 100.0;
        }
        effects
    }

    pub fn has_outage(&self) -> bool {
        !self.mode_outages.is_empty()
    }

    pub fn ready_replicas(&self, now: SimTime) -> Vec<usize> {
        self.replicas
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_ready(now))
            .map(|(i, _)| i)
            .collect()
    }

    pub fn live_replicas(&self) -> usize {
        self.replicas.iter().filter(|r| r.is_live()).count()
    }

    pub fn is_available(&self, now: SimTime) -> bool {
        self.online && !self.has_outage() && self.replicas.iter().any(|r| r.is_ready(now))
    }

    /// A caller's view: down, or failing at least half its recent calls.
    pub fn is_failing(&self, now: SimTime) -> bool {
        !self.is_available(now)
            || self
                .window
                .error_rate()
                .is_some_and(|rate| rate >= FAILING_ERROR_RATE)
    }

    /// Round-robin over ready replicas.
    pub fn pick_replica(&mut self, now: SimTime) -> Option<usize> {
        let ready = self.ready_replicas(now);
        if ready.is_empty() {
            return None;
        }
        let pick = ready[self.cursor % ready.len()];
        self.cursor = self.cursor.wrapping_add(1);
        Some(pick)
    }

    /// Earliest time a starting replica becomes ready, if any is starting.
    pub fn next_ready_at(&self, now: SimTime) -> Option<SimTime> {
        self.replicas
            .iter()
            .filter(|r| r.state == ReplicaLifecycle::Starting && !r.is_crashed())
            .map(|r| r.ready_at.max(now))
            .min()
    }

    /// Promote starting replicas whose start-up finished.
    pub fn settle(&mut self, now: SimTime) {
        for replica in &mut self.replicas {
            if replica.state == ReplicaLifecycle::Starting && replica.ready_at <= now {
                replica.state = ReplicaLifecycle::Ready;
            }
        }
    }
}

/// Runtime of one edge.
#[derive(Debug, Clone, Default)]
pub struct EdgeRuntime {
    pub breaker: Option<CircuitBreaker>,
    pub faults: BTreeMap<FaultId, FaultSpec>,
    /// Propagation rules holding the breaker open.
    pub forced: BTreeSet<RuleKey>,
}

impl EdgeRuntime {
    pub fn effects(&self) -> FaultEffects {
        let mut effects = FaultEffects::default();
        for spec in self.faults.values() {
            effects.apply(spec);
        }
        effects
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeState {
    pub components: BTreeMap<ComponentId, ComponentRuntime>,
    pub edges: BTreeMap<EdgeId, EdgeRuntime>,
}

impl RuntimeState {
    pub fn new(graph: &ArchitectureGraph, window_ms: f64) -> Self {
        let components = graph
            .components()
            .map(|def| (def.id.clone(), ComponentRuntime::new(def, window_ms)))
            .collect();
        let edges = graph
            .edges()
            .map(|edge| {
                let breaker = edge
                    .circuit_breaker
                    .as_ref()
                    .filter(|cb| cb.enabled)
                    .map(|cb| CircuitBreaker::new(cb.clone()));
                (
                    edge.id.clone(),
                    EdgeRuntime {
                        breaker,
                        ..Default::default()
                    },
                )
            })
            .collect();
        Self { components, edges }
    }

    pub fn component(&self, id: &ComponentId) -> Option<&ComponentRuntime> {
        self.components.get(id)
    }

    pub fn component_mut(&mut self, id: &ComponentId) -> Option<&mut ComponentRuntime> {
        self.components.get_mut(id)
    }

    pub fn is_available(&self, id: &ComponentId, now: SimTime) -> bool {
        self.components
            .get(id)
            .is_some_and(|c| c.is_available(now))
    }

    pub fn is_failing(&self, id: &ComponentId, now: SimTime) -> bool {
        self.components.get(id).map_or(true, |c| c.is_failing(now))
    }
}

/// Monotonic id sources.
#[derive(Debug, Clone, Default)]
pub struct IdAllocator {
    next_call: u64,
    next_request: u64,
    next_message: u64,
}

impl IdAllocator {
    pub fn call(&mut self) -> CallId {
        self.next_call += 1;
        CallId(self.next_call)
    }

    pub fn request(&mut self) -> RequestId {
        self.next_request += 1;
        RequestId(self.next_request)
    }

    pub fn message(&mut self) -> u64 {
        self.next_message += 1;
        self.next_message
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use archsim_types::ComponentType;

    #[test]
    fn test_effects_stack() {
        let mut effects = FaultEffects::default();
        effects.apply(&FaultSpec::Error {
            error_rate: 0.3,
            error_code: "boom".into(),
        });
        effects.apply(&FaultSpec::Error {
            error_rate: 0.9,
            error_code: "bang".into(),
        });
        effects.apply(&FaultSpec::PacketLoss { loss_rate: 0.5 });
        effects.apply(&FaultSpec::PacketLoss { loss_rate: 0.5 });
        effects.apply_propagated(&PropagationEffect::IncreaseLatency { factor: 2.0 });
        effects.apply_propagated(&PropagationEffect::IncreaseLatency { factor: 3.0 });

        assert_eq!(effects.error_rate, 1.0);
        assert_eq!(effects.error_code.as_deref(), Some("boom"));
        assert!((effects.packet_loss - 0.75).abs() < 1e-12);
        assert_eq!(effects.latency_factor, 6.0);
    }

    #[test]
    fn test_window_error_rate_needs_samples() {
        let mut window = RollingWindow::new(1_000.0);
        for i in 0..9 {
            window.record(SimTime::from_millis(i), 1_000, i % 2 == 0);
        }
        assert_eq!(window.error_rate(), None);
        window.record(SimTime::from_millis(9), 1_000, false);
        assert_eq!(window.error_rate(), Some(0.5));
    }

    #[test]
    fn test_window_prunes_old_samples() {
        let mut window = RollingWindow::new(100.0);
        window.record(SimTime::from_millis(0), 5_000, true);
        window.record(SimTime::from_millis(150), 2_000, false);
        assert_eq!(window.len(), 1);
        assert_eq!(window.error_count(), 0);
        assert_eq!(window.p99_ms(), Some(2.0));
    }

    #[test]
    fn test_window_quantile() {
        let mut window = RollingWindow::new(10_000.0);
        for ms in 1..=100u64 {
            window.record(SimTime::from_millis(ms), ms * 1_000, false);
        }
        assert_eq!(window.quantile_ms(0.5), Some(50.0));
        assert_eq!(window.p99_ms(), Some(99.0));
    }

    #[test]
    fn test_replica_readiness() {
        let now = SimTime::from_millis(100);
        assert!(Replica::ready().is_ready(now));
        assert!(!Replica::starting(SimTime::from_millis(200)).is_ready(now));
        assert!(Replica::starting(SimTime::from_millis(50)).is_ready(now));

        let mut crashed = Replica::ready();
        crashed.crashed_by.insert(FaultId::new("f"));
        assert!(!crashed.is_ready(now));

        let mut restarting = Replica::ready();
        restarting.restart = Some((SimTime::from_millis(90), SimTime::from_millis(110)));
        assert!(!restarting.is_ready(now));
        assert!(restarting.is_ready(SimTime::from_millis(110)));
    }

    #[test]
    fn test_partial_crash_keeps_component_available() {
        let def = ComponentDefinition::new("api", ComponentType::Microservice);
        let mut runtime = ComponentRuntime::new(&def, 1_000.0);
        runtime.replicas.push(Replica::ready());
        runtime.replicas[0].crashed_by.insert(FaultId::new("crash"));

        let now = SimTime::ZERO;
        assert!(runtime.is_available(now));
        assert_eq!(runtime.pick_replica(now), Some(1));
        assert_eq!(runtime.pick_replica(now), Some(1));

        runtime.replicas[1].crashed_by.insert(FaultId::new("crash"));
        assert!(!runtime.is_available(now));
        assert!(runtime.is_failing(now));
    }
}
