//! Fault injection engine.
//!
//! Each injection moves through `pending → active → expired` exactly once.
//! The engine decides *when* (timing and duration rules) and performs the
//! runtime mutation; the kernel turns the returned [`FaultSchedule`]s into
//! events so activation and expiry are ordinary entries in the trace.
//!
//! Faults on the same target compose: every active fault keeps its own entry
//! in the target's active set and effects are folded when read. Process
//! crashes hold a replica down while any crash fault covering it is active;
//! it comes back when the last one expires.

use archsim_core::{EventKind, FaultPhase};
use archsim_types::{
    ComponentId, EdgeId, FaultDuration, FaultId, FaultInjection, FaultScope, FaultSpec,
    FaultTiming, SimTime,
};
use indexmap::IndexMap;
use std::collections::BTreeSet;
use tracing::debug;

use crate::error::ConfigError;
use crate::graph::ArchitectureGraph;
use crate::rng::DeterministicRng;
use crate::snapshot::{condition_holds, validate_condition, MetricSource};
use crate::state::{AppliedFault, RuntimeState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultStatus {
    Pending,
    Active { since: SimTime },
    Expired,
}

/// An event the kernel should schedule for a fault.
#[derive(Debug, Clone, PartialEq)]
pub struct FaultSchedule {
    pub fault: FaultId,
    pub phase: FaultPhase,
    /// `FaultActivate`, `FaultDeactivate` or `FaultCheck`.
    pub kind: EventKind,
    pub at: SimTime,
}

/// Something worth recording in the trace when a fault changes state.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub kind: EventKind,
    pub component: Option<ComponentId>,
    pub detail: String,
}

/// What an activation or deactivation touched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FaultChange {
    pub components: Vec<ComponentId>,
    pub edges: Vec<EdgeId>,
    pub observations: Vec<Observation>,
}

/// Result of a periodic check.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckOutcome {
    /// The phase should happen now.
    Fire,
    /// Check again later.
    Again(FaultSchedule),
    /// The fault is no longer waiting for this phase.
    Stale,
}

#[derive(Debug, Clone)]
struct TrackedFault {
    injection: FaultInjection,
    status: FaultStatus,
    rng: DeterministicRng,
}

#[derive(Debug, Clone)]
pub struct FaultEngine {
    faults: IndexMap<FaultId, TrackedFault>,
    poll_ms: f64,
}

impl FaultEngine {
    /// Validate `injections` against the graph and track them as pending.
    ///
    /// Condition-based rules are polled every `poll_ms`.
    pub fn new(
        injections: Vec<FaultInjection>,
        graph: &ArchitectureGraph,
        root: &DeterministicRng,
        poll_ms: f64,
    ) -> Result<Self, ConfigError> {
        let mut engine = Self {
            faults: IndexMap::new(),
            poll_ms: poll_ms.max(1.0),
        };
        for injection in injections {
            engine.track(injection, graph, root)?;
        }
        Ok(engine)
    }

    fn track(
        &mut self,
        injection: FaultInjection,
        graph: &ArchitectureGraph,
        root: &DeterministicRng,
    ) -> Result<(), ConfigError> {
        validate(&injection, graph)?;
        if self.faults.contains_key(&injection.id) {
            return Err(ConfigError::InvalidFault {
                fault: injection.id.clone(),
                reason: "duplicate fault id".to_string(),
            });
        }
        let rng = root.fork_labeled(&format!("fault:{}", injection.id.as_str()), 0);
        self.faults.insert(
            injection.id.clone(),
            TrackedFault {
                injection,
                status: FaultStatus::Pending,
                rng,
            },
        );
        Ok(())
    }

    /// First event for every fault known at start.
    pub fn initial_schedule(&self) -> Vec<FaultSchedule> {
        self.faults
            .values()
            .map(|f| self.activation_schedule(&f.injection, SimTime::ZERO))
            .collect()
    }

    /// Track a fault injected while the run is in progress. Its timing is
    /// measured from `now`.
    pub fn inject(
        &mut self,
        injection: FaultInjection,
        graph: &ArchitectureGraph,
        root: &DeterministicRng,
        now: SimTime,
    ) -> Result<FaultSchedule, ConfigError> {
        let schedule = self.activation_schedule(&injection, now);
        self.track(injection, graph, root)?;
        Ok(schedule)
    }

    fn activation_schedule(&self, injection: &FaultInjection, base: SimTime) -> FaultSchedule {
        let (kind, at) = match &injection.timing {
            FaultTiming::Deterministic { at_ms } => (EventKind::FaultActivate, base.plus_millis(*at_ms)),
            FaultTiming::Probabilistic {
                check_interval_ms, ..
            } => (EventKind::FaultCheck, base.plus_millis(*check_interval_ms)),
            FaultTiming::Conditional { .. } => (EventKind::FaultCheck, base.plus_millis(self.poll_ms)),
        };
        FaultSchedule {
            fault: injection.id.clone(),
            phase: FaultPhase::Activation,
            kind,
            at,
        }
    }

    pub fn status(&self, id: &FaultId) -> Option<FaultStatus> {
        self.faults.get(id).map(|f| f.status)
    }

    /// Evaluate a probabilistic or conditional rule.
    pub fn check(
        &mut self,
        id: &FaultId,
        phase: FaultPhase,
        now: SimTime,
        source: &dyn MetricSource,
    ) -> CheckOutcome {
        let poll_ms = self.poll_ms;
        let Some(tracked) = self.faults.get_mut(id) else {
            return CheckOutcome::Stale;
        };
        let again = |interval_ms: f64| {
            CheckOutcome::Again(FaultSchedule {
                fault: id.clone(),
                phase,
                kind: EventKind::FaultCheck,
                at: now.plus_millis(interval_ms),
            })
        };
        match phase {
            FaultPhase::Activation => {
                if tracked.status != FaultStatus::Pending {
                    return CheckOutcome::Stale;
                }
                match &tracked.injection.timing {
                    FaultTiming::Probabilistic {
                        probability,
                        check_interval_ms,
                    } => {
                        if tracked.rng.chance(*probability) {
                            CheckOutcome::Fire
                        } else {
                            again(*check_interval_ms)
                        }
                    }
                    FaultTiming::Conditional { condition } => {
                        if condition_holds(condition, source) {
                            CheckOutcome::Fire
                        } else {
                            again(poll_ms)
                        }
                    }
                    FaultTiming::Deterministic { .. } => CheckOutcome::Fire,
                }
            }
            FaultPhase::Deactivation => {
                if !matches!(tracked.status, FaultStatus::Active { .. }) {
                    return CheckOutcome::Stale;
                }
                match &tracked.injection.duration {
                    FaultDuration::UntilCondition { condition } => {
                        if condition_holds(condition, source) {
                            CheckOutcome::Fire
                        } else {
                            again(poll_ms)
                        }
                    }
                    _ => CheckOutcome::Fire,
                }
            }
        }
    }

    /// Apply a pending fault to its scope. Returns what changed and, for
    /// faults that end, the event that ends them.
    pub fn activate(
        &mut self,
        id: &FaultId,
        now: SimTime,
        graph: &ArchitectureGraph,
        state: &mut RuntimeState,
    ) -> Option<(FaultChange, Option<FaultSchedule>)> {
        let poll_ms = self.poll_ms;
        let tracked = self.faults.get_mut(id)?;
        if tracked.status != FaultStatus::Pending {
            return None;
        }
        tracked.status = FaultStatus::Active { since: now };
        let injection = &tracked.injection;
        let spec = injection.fault.clone();

        let mut change = FaultChange::default();
        match &injection.scope {
            FaultScope::Component { component_id } => {
                apply_to_component(state, id, component_id, &spec, None);
                change.components.push(component_id.clone());
            }
            FaultScope::Region { region_id } => {
                for component in graph.components_in_region(region_id) {
                    apply_to_component(state, id, &component, &spec, None);
                    change.components.push(component);
                }
            }
            FaultScope::PercentageOfReplicas {
                component_id,
                percentage,
            } => {
                let total = state
                    .component(component_id)
                    .map_or(0, |runtime| runtime.replicas.len());
                let chosen = choose_replicas(total, *percentage, &mut tracked.rng);
                apply_to_component(state, id, component_id, &spec, Some(chosen));
                change.components.push(component_id.clone());
            }
            FaultScope::Edge { edge_id } => {
                if let Some(edge) = state.edges.get_mut(edge_id) {
                    edge.faults.insert(id.clone(), spec.clone());
                }
                change.edges.push(edge_id.clone());
            }
        }

        let kind = match &spec {
            FaultSpec::ProcessCrash => EventKind::NodeFailure,
            FaultSpec::NetworkPartition { .. } => EventKind::NetworkPartition,
            FaultSpec::Latency { .. } => EventKind::LatencySpike,
            FaultSpec::PacketLoss { .. } => EventKind::PacketLoss,
            FaultSpec::BandwidthLimit { .. } => EventKind::BandwidthThrottle,
            _ => EventKind::NodeDegraded,
        };
        let detail = format!("{} injected by {}", spec.kind(), id.as_str());
        change.observations = observations(&change, kind, &detail);

        debug!(
            fault = id.as_str(),
            kind = spec.kind(),
            components = change.components.len(),
            edges = change.edges.len(),
            "fault activated"
        );

        let end = match &injection.duration {
            FaultDuration::Permanent => None,
            FaultDuration::Fixed { duration_ms } => Some(FaultSchedule {
                fault: id.clone(),
                phase: FaultPhase::Deactivation,
                kind: EventKind::FaultDeactivate,
                at: now.plus_millis(*duration_ms),
            }),
            FaultDuration::UntilCondition { .. } => Some(FaultSchedule {
                fault: id.clone(),
                phase: FaultPhase::Deactivation,
                kind: EventKind::FaultCheck,
                at: now.plus_millis(poll_ms),
            }),
        };
        Some((change, end))
    }

    /// Revert an active fault.
    pub fn deactivate(&mut self, id: &FaultId, state: &mut RuntimeState) -> Option<FaultChange> {
        let tracked = self.faults.get_mut(id)?;
        if !matches!(tracked.status, FaultStatus::Active { .. }) {
            return None;
        }
        tracked.status = FaultStatus::Expired;

        let mut change = FaultChange::default();
        let mut recovered = Vec::new();
        for (component_id, runtime) in state.components.iter_mut() {
            if runtime.faults.remove(id).is_some() {
                let mut released = false;
                for replica in &mut runtime.replicas {
                    if replica.crashed_by.remove(id) && !replica.is_crashed() {
                        released = true;
                    }
                }
                if released {
                    recovered.push(component_id.clone());
                }
                change.components.push(component_id.clone());
            }
        }
        for (edge_id, runtime) in state.edges.iter_mut() {
            if runtime.faults.remove(id).is_some() {
                change.edges.push(edge_id.clone());
            }
        }

        let spec = &tracked.injection.fault;
        if matches!(spec, FaultSpec::ProcessCrash) && !recovered.is_empty() {
            let detail = format!("{} cleared by expiry of {}", spec.kind(), id.as_str());
            change.observations = recovered
                .into_iter()
                .map(|component| Observation {
                    kind: EventKind::NodeRecovery,
                    component: Some(component),
                    detail: detail.clone(),
                })
                .collect();
        }
        debug!(fault = id.as_str(), kind = spec.kind(), "fault expired");
        Some(change)
    }
}

fn observations(change: &FaultChange, kind: EventKind, detail: &str) -> Vec<Observation> {
    if change.components.is_empty() {
        return vec![Observation {
            kind,
            component: None,
            detail: detail.to_string(),
        }];
    }
    change
        .components
        .iter()
        .map(|c| Observation {
            kind,
            component: Some(c.clone()),
            detail: detail.to_string(),
        })
        .collect()
}

fn apply_to_component(
    state: &mut RuntimeState,
    id: &FaultId,
    component: &ComponentId,
    spec: &FaultSpec,
    replicas: Option<BTreeSet<usize>>,
) {
    let Some(runtime) = state.component_mut(component) else {
        return;
    };
    let applied = AppliedFault {
        spec: spec.clone(),
        replicas,
    };
    if matches!(spec, FaultSpec::ProcessCrash) {
        for (index, replica) in runtime.replicas.iter_mut().enumerate() {
            if applied.covers(Some(index)) {
                replica.crashed_by.insert(id.clone());
            }
        }
    }
    runtime.faults.insert(id.clone(), applied);
}

/// `ceil(total * percentage / 100)` distinct replica indexes.
fn choose_replicas(total: usize, percentage: f64, rng: &mut DeterministicRng) -> BTreeSet<usize> {
    let wanted = ((total as f64 * percentage / 100.0).ceil() as usize).min(total);
    let mut pool: Vec<usize> = (0..total).collect();
    let mut chosen = BTreeSet::new();
    for i in 0..wanted {
        let j = i + rng.below(total - i);
        pool.swap(i, j);
        chosen.insert(pool[i]);
    }
    chosen
}

/// Reject injections that reference unknown targets or carry impossible
/// parameters.
pub fn validate(injection: &FaultInjection, graph: &ArchitectureGraph) -> Result<(), ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidFault {
        fault: injection.id.clone(),
        reason,
    };
    let unit = |name: &str, v: f64| {
        if (0.0..=1.0).contains(&v) {
            Ok(())
        } else {
            Err(invalid(format!("{name} must be within 0-1, got {v}")))
        }
    };
    let percent = |name: &str, v: f64| {
        if (0.0..=100.0).contains(&v) {
            Ok(())
        } else {
            Err(invalid(format!("{name} must be within 0-100, got {v}")))
        }
    };

    match &injection.scope {
        FaultScope::Component { component_id } => {
            if graph.component(component_id).is_none() {
                return Err(invalid(format!("unknown component {}", component_id.as_str())));
            }
        }
        FaultScope::Edge { edge_id } => {
            if graph.edge(edge_id).is_none() {
                return Err(invalid(format!("unknown edge {}", edge_id.as_str())));
            }
            if !injection.fault.applies_to_edges() {
                return Err(invalid(format!(
                    "{} faults cannot target an edge",
                    injection.fault.kind()
                )));
            }
        }
        FaultScope::Region { region_id } => {
            if graph.components_in_region(region_id).is_empty() {
                return Err(invalid(format!(
                    "region {} has no components",
                    region_id.as_str()
                )));
            }
        }
        FaultScope::PercentageOfReplicas {
            component_id,
            percentage,
        } => {
            if graph.component(component_id).is_none() {
                return Err(invalid(format!("unknown component {}", component_id.as_str())));
            }
            if !(*percentage > 0.0 && *percentage <= 100.0) {
                return Err(invalid(format!(
                    "percentage must be within (0, 100], got {percentage}"
                )));
            }
        }
    }

    match &injection.timing {
        FaultTiming::Deterministic { at_ms } => {
            if !(at_ms.is_finite() && *at_ms >= 0.0) {
                return Err(invalid(format!("atMs must be non-negative, got {at_ms}")));
            }
        }
        FaultTiming::Probabilistic {
            probability,
            check_interval_ms,
        } => {
            unit("probability", *probability)?;
            if !(check_interval_ms.is_finite() && *check_interval_ms > 0.0) {
                return Err(invalid(format!(
                    "checkIntervalMs must be positive, got {check_interval_ms}"
                )));
            }
        }
        FaultTiming::Conditional { condition } => validate_condition(condition)?,
    }

    match &injection.duration {
        FaultDuration::Permanent => {}
        FaultDuration::Fixed { duration_ms } => {
            if !(duration_ms.is_finite() && *duration_ms > 0.0) {
                return Err(invalid(format!(
                    "durationMs must be positive, got {duration_ms}"
                )));
            }
        }
        FaultDuration::UntilCondition { condition } => validate_condition(condition)?,
    }

    match &injection.fault {
        FaultSpec::Latency { added_ms } => added_ms.validate().map_err(invalid)?,
        FaultSpec::Error { error_rate, .. } => unit("errorRate", *error_rate)?,
        FaultSpec::PacketLoss { loss_rate } => unit("lossRate", *loss_rate)?,
        FaultSpec::BandwidthLimit { limit_mbps } => {
            if !(*limit_mbps > 0.0) {
                return Err(invalid(format!("limitMbps must be positive, got {limit_mbps}")));
            }
        }
        FaultSpec::CpuStress {
            utilization_percent,
        }
        | FaultSpec::MemoryStress {
            utilization_percent,
        } => percent("utilizationPercent", *utilization_percent)?,
        FaultSpec::DiskFull { percent_full } => percent("percentFull", *percent_full)?,
        FaultSpec::SlowStart { delay_ms } => {
            if !(delay_ms.is_finite() && *delay_ms >= 0.0) {
                return Err(invalid(format!("delayMs must be non-negative, got {delay_ms}")));
            }
        }
        FaultSpec::ConnectionLimit { .. }
        | FaultSpec::DnsFailure
        | FaultSpec::CertificateExpiry
        | FaultSpec::ClockSkew { .. }
        | FaultSpec::NetworkPartition { .. }
        | FaultSpec::ProcessCrash => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{Metric, StaticMetrics};
    use archsim_types::{
        ComparisonOperator, ComponentDefinition, ComponentType, EdgeDefinition, FaultCondition,
        ResourceSpec, SystemArchitecture,
    };

    fn graph() -> ArchitectureGraph {
        let arch = SystemArchitecture::new("faults")
            .with_component(
                ComponentDefinition::new("api", ComponentType::Microservice)
                    .with_dependencies(["db"])
                    .with_region("eu")
                    .with_resources(ResourceSpec {
                        replicas: 4,
                        ..Default::default()
                    }),
            )
            .with_component(ComponentDefinition::new("db", ComponentType::RelationalDb).with_region("eu"))
            .with_edge(EdgeDefinition::new("api-db", "api", "db"));
        ArchitectureGraph::new(arch).unwrap()
    }

    fn engine(injections: Vec<FaultInjection>) -> (ArchitectureGraph, RuntimeState, FaultEngine) {
        let graph = graph();
        let state = RuntimeState::new(&graph, 10_000.0);
        let engine = FaultEngine::new(
            injections,
            &graph,
            &DeterministicRng::from_seed_str("faults"),
            1_000.0,
        )
        .unwrap();
        (graph, state, engine)
    }

    fn crash(id: &str, at_ms: f64) -> FaultInjection {
        FaultInjection::on_component(id, "api", FaultSpec::ProcessCrash, at_ms, 5_000.0)
    }

    #[test]
    fn test_deterministic_lifecycle() {
        let (graph, mut state, mut engine) = engine(vec![crash("crash", 1_000.0)]);
        let initial = engine.initial_schedule();
        assert_eq!(initial[0].kind, EventKind::FaultActivate);
        assert_eq!(initial[0].at, SimTime::from_millis(1_000));

        let id = FaultId::new("crash");
        let now = SimTime::from_millis(1_000);
        let (change, end) = engine.activate(&id, now, &graph, &mut state).unwrap();
        assert_eq!(change.components, vec![ComponentId::new("api")]);
        assert_eq!(change.observations[0].kind, EventKind::NodeFailure);
        assert_eq!(end.unwrap().at, SimTime::from_millis(6_000));
        assert!(!state.is_available(&ComponentId::new("api"), now));

        engine.deactivate(&id, &mut state).unwrap();
        assert!(state.is_available(&ComponentId::new("api"), now));
        assert_eq!(engine.status(&id), Some(FaultStatus::Expired));
        assert!(engine.activate(&id, now, &graph, &mut state).is_none());
    }

    #[test]
    fn test_overlapping_crashes_hold_replicas_separately() {
        let (graph, mut state, mut engine) =
            engine(vec![crash("first", 0.0), crash("second", 0.0)]);
        let now = SimTime::ZERO;
        engine.activate(&FaultId::new("first"), now, &graph, &mut state);
        engine.activate(&FaultId::new("second"), now, &graph, &mut state);

        engine.deactivate(&FaultId::new("second"), &mut state);
        assert!(!state.is_available(&ComponentId::new("api"), now), "first still holds");
        engine.deactivate(&FaultId::new("first"), &mut state);
        assert!(state.is_available(&ComponentId::new("api"), now));
    }

    #[test]
    fn test_later_crash_keeps_replica_down_after_earlier_expires() {
        let (graph, mut state, mut engine) =
            engine(vec![crash("first", 0.0), crash("second", 0.0)]);
        let now = SimTime::ZERO;
        engine.activate(&FaultId::new("first"), now, &graph, &mut state);
        engine.activate(&FaultId::new("second"), now, &graph, &mut state);

        let change = engine.deactivate(&FaultId::new("first"), &mut state).unwrap();
        assert!(!state.is_available(&ComponentId::new("api"), now), "second still holds");
        assert!(change.observations.is_empty());

        let change = engine.deactivate(&FaultId::new("second"), &mut state).unwrap();
        assert!(state.is_available(&ComponentId::new("api"), now));
        assert_eq!(change.observations.len(), 1);
        assert_eq!(change.observations[0].kind, EventKind::NodeRecovery);
    }

    #[test]
    fn test_percentage_scope_crashes_subset() {
        let fault = crash("half", 0.0).with_scope(FaultScope::PercentageOfReplicas {
            component_id: ComponentId::new("api"),
            percentage: 50.0,
        });
        let (graph, mut state, mut engine) = engine(vec![fault]);
        engine.activate(&FaultId::new("half"), SimTime::ZERO, &graph, &mut state);
        let runtime = state.component(&ComponentId::new("api")).unwrap();
        let crashed = runtime.replicas.iter().filter(|r| r.is_crashed()).count();
        assert_eq!(crashed, 2);
        assert!(runtime.is_available(SimTime::ZERO));
    }

    #[test]
    fn test_region_scope_hits_every_component() {
        let fault = crash("eu-down", 0.0).with_scope(FaultScope::Region {
            region_id: "eu".into(),
        });
        let (graph, mut state, mut engine) = engine(vec![fault]);
        let (change, _) = engine
            .activate(&FaultId::new("eu-down"), SimTime::ZERO, &graph, &mut state)
            .unwrap();
        assert_eq!(change.components.len(), 2);
    }

    #[test]
    fn test_conditional_activation_polls_until_true() {
        let fault = crash("cond", 0.0).with_timing(FaultTiming::Conditional {
            condition: FaultCondition {
                metric: "error_rate".into(),
                operator: ComparisonOperator::Gte,
                value: 0.5,
                component_id: Some(ComponentId::new("db")),
            },
        });
        let (_, _, mut engine) = engine(vec![fault]);
        let id = FaultId::new("cond");
        let now = SimTime::from_millis(1_000);

        let calm = StaticMetrics::new().with(Metric::ErrorRate, Some("db"), 0.1);
        match engine.check(&id, FaultPhase::Activation, now, &calm) {
            CheckOutcome::Again(next) => assert_eq!(next.at, SimTime::from_millis(2_000)),
            other => panic!("expected another check, got {other:?}"),
        }
        let failing = StaticMetrics::new().with(Metric::ErrorRate, Some("db"), 0.7);
        assert_eq!(
            engine.check(&id, FaultPhase::Activation, now, &failing),
            CheckOutcome::Fire
        );
    }

    #[test]
    fn test_validation_rejects_bad_scope_and_values() {
        let graph = graph();
        let unknown = FaultInjection::on_component("f", "ghost", FaultSpec::ProcessCrash, 0.0, 1.0);
        assert!(validate(&unknown, &graph).is_err());

        let crash_on_edge = crash("f", 0.0).with_scope(FaultScope::Edge {
            edge_id: "api-db".into(),
        });
        assert!(validate(&crash_on_edge, &graph).is_err());

        let bad_rate = FaultInjection::on_component(
            "f",
            "api",
            FaultSpec::Error {
                error_rate: 1.5,
                error_code: "500".into(),
            },
            0.0,
            1.0,
        );
        assert!(validate(&bad_rate, &graph).is_err());
    }
}
