//! Failure-mode triggers.
//!
//! Every component with failure modes is checked once per health-check
//! interval, plus once at each scheduled trigger time. A mode whose trigger
//! starts holding takes the component down (severity high or critical) or
//! degrades it (doubles service time); when the trigger stops holding the
//! component recovers.

use archsim_core::{CheckTarget, EventKind, EventPayload};
use archsim_types::{ComponentId, FailureTrigger, SimTime};
use std::collections::BTreeMap;
use tracing::debug;

use crate::event_queue::Followup;
use crate::graph::ArchitectureGraph;
use crate::rng::DeterministicRng;
use crate::snapshot::{Metric, MetricSource};
use crate::state::RuntimeState;

/// Utilization of the resources a `resource-exhaustion` trigger can name,
/// each 0-1.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceUsage {
    pub cpu: f64,
    pub memory: f64,
    pub connections: f64,
    pub queue: f64,
    pub disk: f64,
}

impl ResourceUsage {
    pub fn get(&self, resource: &str) -> Option<f64> {
        match resource.to_ascii_lowercase().as_str() {
            "cpu" => Some(self.cpu),
            "memory" | "mem" => Some(self.memory),
            "connections" | "connection-pool" | "connection_pool" | "pool" => {
                Some(self.connections)
            }
            "queue" | "queue-depth" | "queue_depth" => Some(self.queue),
            "disk" | "storage" => Some(self.disk),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct ModeState {
    active: bool,
    /// When a probabilistic trigger last fired.
    fired_at: Option<SimTime>,
}

/// What a check changed.
#[derive(Debug, Clone, Default)]
pub struct ModeCheck {
    pub followups: Vec<Followup>,
    /// The component's failure state changed.
    pub changed: bool,
}

#[derive(Debug, Clone)]
pub struct FailureModeEngine {
    modes: BTreeMap<(ComponentId, usize), ModeState>,
    rngs: BTreeMap<ComponentId, DeterministicRng>,
    next_periodic: BTreeMap<ComponentId, SimTime>,
}

impl FailureModeEngine {
    pub fn new(graph: &ArchitectureGraph, root: &DeterministicRng) -> Self {
        let mut modes = BTreeMap::new();
        let mut rngs = BTreeMap::new();
        for def in graph.components().filter(|d| !d.failure_modes.is_empty()) {
            for index in 0..def.failure_modes.len() {
                modes.insert(
                    (def.id.clone(), index),
                    ModeState {
                        active: false,
                        fired_at: None,
                    },
                );
            }
            rngs.insert(
                def.id.clone(),
                root.fork_labeled(&format!("failure-modes:{}", def.id.as_str()), 0),
            );
        }
        Self {
            modes,
            rngs,
            next_periodic: BTreeMap::new(),
        }
    }

    /// First periodic check of every component with failure modes, plus a
    /// check at every scheduled trigger.
    pub fn initial_schedule(&mut self, graph: &ArchitectureGraph) -> Vec<Followup> {
        let mut followups = Vec::new();
        for def in graph.components().filter(|d| !d.failure_modes.is_empty()) {
            let first = SimTime::ZERO.plus_millis(def.health_check.interval_ms.max(1.0));
            self.next_periodic.insert(def.id.clone(), first);
            followups.push(check_at(first, &def.id));
            for mode in &def.failure_modes {
                if let FailureTrigger::Scheduled { at_ms } = mode.trigger {
                    followups.push(check_at(SimTime::from_millis_f64(at_ms), &def.id));
                }
            }
        }
        followups
    }

    #[cfg(test)]
    pub fn is_active(&self, component: &ComponentId, mode: usize) -> bool {
        self.modes
            .get(&(component.clone(), mode))
            .is_some_and(|m| m.active)
    }

    /// Evaluate every failure mode of `component`.
    pub fn check(
        &mut self,
        component: &ComponentId,
        now: SimTime,
        graph: &ArchitectureGraph,
        state: &mut RuntimeState,
        source: &dyn MetricSource,
        usage: ResourceUsage,
    ) -> ModeCheck {
        let mut result = ModeCheck::default();
        let Some(def) = graph.component(component) else {
            return result;
        };
        let interval_ms = def.health_check.interval_ms.max(1.0);
        let hold_us = archsim_types::millis_to_micros(
            interval_ms * def.health_check.healthy_threshold.max(1) as f64,
        );

        if self
            .next_periodic
            .get(component)
            .is_some_and(|next| now >= *next)
        {
            let next = now.plus_millis(interval_ms);
            self.next_periodic.insert(component.clone(), next);
            result.followups.push(check_at(next, component));
        }

        for (index, mode) in def.failure_modes.iter().enumerate() {
            let key = (component.clone(), index);
            let Some(mode_state) = self.modes.get_mut(&key) else {
                continue;
            };
            let holds = match &mode.trigger {
                FailureTrigger::DependencyFailure {
                    dependency_id,
                    failure_count,
                } => state.component(component).is_some_and(|runtime| {
                    *failure_count > 0 && runtime.window.failures_from(dependency_id) >= *failure_count
                }),
                FailureTrigger::LatencySpike { threshold_ms } => source
                    .metric(Metric::LatencyP99, Some(component))
                    .is_some_and(|p99| p99 > *threshold_ms),
                FailureTrigger::ErrorRate { threshold } => source
                    .metric(Metric::ErrorRate, Some(component))
                    .is_some_and(|rate| rate >= *threshold),
                FailureTrigger::ResourceExhaustion {
                    resource,
                    threshold,
                } => usage.get(resource).is_some_and(|used| used >= *threshold),
                FailureTrigger::Scheduled { at_ms } => {
                    let at = SimTime::from_millis_f64(*at_ms);
                    now >= at && now.micros_since(at) < hold_us
                }
                FailureTrigger::Probabilistic { probability } => {
                    let still_held = mode_state
                        .fired_at
                        .is_some_and(|at| now.micros_since(at) < hold_us);
                    if still_held {
                        true
                    } else if let Some(rng) = self.rngs.get_mut(component) {
                        let fired = rng.chance(*probability);
                        mode_state.fired_at = fired.then_some(now);
                        fired
                    } else {
                        false
                    }
                }
            };
            if holds == mode_state.active {
                continue;
            }
            mode_state.active = holds;
            result.changed = true;

            let Some(runtime) = state.component_mut(component) else {
                continue;
            };
            let kind = if holds {
                if mode.severity.is_outage() {
                    runtime.mode_outages.insert(index);
                    EventKind::NodeFailure
                } else {
                    runtime.mode_degraded.insert(index);
                    EventKind::NodeDegraded
                }
            } else {
                runtime.mode_outages.remove(&index);
                runtime.mode_degraded.remove(&index);
                EventKind::NodeRecovery
            };
            debug!(
                component = component.as_str(),
                mode = mode.name.as_str(),
                kind = kind.as_str(),
                "failure mode changed"
            );
            result.followups.push(
                Followup::new(
                    now,
                    kind,
                    EventPayload::Note {
                        detail: format!("failure mode {}", mode.name),
                    },
                )
                .on(component.clone()),
            );
        }
        result
    }
}

fn check_at(at: SimTime, component: &ComponentId) -> Followup {
    Followup::new(
        at,
        EventKind::FailureModeCheck,
        EventPayload::Check {
            target: CheckTarget::FailureModes {
                component: component.clone(),
            },
        },
    )
    .on(component.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::StaticMetrics;
    use archsim_types::{ComponentDefinition, ComponentType, FailureModeDefinition, Severity, SystemArchitecture};

    fn setup(mode: FailureModeDefinition) -> (ArchitectureGraph, RuntimeState, FailureModeEngine) {
        let arch = SystemArchitecture::new("modes").with_component(
            ComponentDefinition::new("api", ComponentType::Microservice).with_failure_mode(mode),
        );
        let graph = ArchitectureGraph::new(arch).unwrap();
        let state = RuntimeState::new(&graph, 10_000.0);
        let engine = FailureModeEngine::new(&graph, &DeterministicRng::from_seed_str("modes"));
        (graph, state, engine)
    }

    fn api() -> ComponentId {
        ComponentId::new("api")
    }

    #[test]
    fn test_error_rate_outage_and_recovery() {
        let mode = FailureModeDefinition::new(
            "overload",
            FailureTrigger::ErrorRate { threshold: 0.3 },
            Severity::Critical,
        );
        let (graph, mut state, mut engine) = setup(mode);
        let now = SimTime::from_millis(1_000);

        let failing = StaticMetrics::new().with(Metric::ErrorRate, Some("api"), 0.6);
        let check = engine.check(&api(), now, &graph, &mut state, &failing, ResourceUsage::default());
        assert!(check.changed);
        assert!(check.followups.iter().any(|f| f.kind == EventKind::NodeFailure));
        assert!(!state.is_available(&api(), now));

        let healthy = StaticMetrics::new().with(Metric::ErrorRate, Some("api"), 0.0);
        let check = engine.check(&api(), now, &graph, &mut state, &healthy, ResourceUsage::default());
        assert!(check.followups.iter().any(|f| f.kind == EventKind::NodeRecovery));
        assert!(state.is_available(&api(), now));
    }

    #[test]
    fn test_low_severity_only_degrades() {
        let mode = FailureModeDefinition::new(
            "cpu-hot",
            FailureTrigger::ResourceExhaustion {
                resource: "cpu".into(),
                threshold: 0.9,
            },
            Severity::Low,
        );
        let (graph, mut state, mut engine) = setup(mode);
        let usage = ResourceUsage {
            cpu: 0.95,
            ..Default::default()
        };
        engine.check(&api(), SimTime::ZERO, &graph, &mut state, &StaticMetrics::new(), usage);
        let runtime = state.component(&api()).unwrap();
        assert!(runtime.is_available(SimTime::ZERO));
        assert_eq!(runtime.effects(None).latency_factor, 2.0);
    }

    #[test]
    fn test_scheduled_trigger_holds_for_a_while() {
        let mode = FailureModeDefinition::new(
            "nightly-gc",
            FailureTrigger::Scheduled { at_ms: 5_000.0 },
            Severity::High,
        );
        let (graph, mut state, mut engine) = setup(mode);
        let initial = engine.initial_schedule(&graph);
        assert!(initial.iter().any(|f| f.at == SimTime::from_millis(5_000)));

        let metrics = StaticMetrics::new();
        let usage = ResourceUsage::default();
        engine.check(&api(), SimTime::from_millis(5_000), &graph, &mut state, &metrics, usage);
        assert!(engine.is_active(&api(), 0));
        // Default health check: 1000ms interval, healthy threshold 2.
        engine.check(&api(), SimTime::from_millis(6_500), &graph, &mut state, &metrics, usage);
        assert!(engine.is_active(&api(), 0));
        engine.check(&api(), SimTime::from_millis(7_000), &graph, &mut state, &metrics, usage);
        assert!(!engine.is_active(&api(), 0));
    }

    #[test]
    fn test_periodic_check_reschedules_once() {
        let mode = FailureModeDefinition::new(
            "slow",
            FailureTrigger::LatencySpike { threshold_ms: 100.0 },
            Severity::Medium,
        );
        let (graph, mut state, mut engine) = setup(mode);
        engine.initial_schedule(&graph);
        let metrics = StaticMetrics::new();
        let at = SimTime::from_millis(1_000);
        let first = engine.check(&api(), at, &graph, &mut state, &metrics, ResourceUsage::default());
        assert_eq!(first.followups.len(), 1);
        assert_eq!(first.followups[0].at, SimTime::from_millis(2_000));
        let again = engine.check(&api(), at, &graph, &mut state, &metrics, ResourceUsage::default());
        assert!(again.followups.is_empty());
    }
}
