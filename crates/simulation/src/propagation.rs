//! Failure propagation.
//!
//! Rules attached to failure modes are evaluated after every state mutation
//! on the touched components and their direct dependents. Evaluation never
//! mutates anything: a rule whose condition turns true schedules a
//! `propagation_effect` event `delayMs` later, and a rule whose condition
//! turns false schedules a `propagation_cleared` event. The kernel hands
//! those events back to [`PropagationEngine::apply`] and
//! [`PropagationEngine::clear`].
//!
//! Rules are visited in component declaration order, then failure-mode and
//! rule order, so same-timestamp effects are scheduled (and drained) in that
//! order.

use archsim_core::{EventKind, EventPayload, ModelTimer, RuleKey};
use archsim_types::{
    millis_to_micros, ComponentId, PropagationCondition, PropagationEffect, PropagationRule,
    SimTime,
};
use std::collections::BTreeSet;
use tracing::debug;

use crate::event_queue::Followup;
use crate::graph::ArchitectureGraph;
use crate::snapshot::{Metric, MetricSource};
use crate::state::RuntimeState;

/// Recorded in run metadata.
pub const TIE_BREAK: &str =
    "declaration order: component, then failure mode, then rule; FIFO among equal timestamps";

#[derive(Debug, Clone, Default)]
pub struct PropagationEngine {
    holding: BTreeSet<RuleKey>,
    max_depth: u32,
}

impl PropagationEngine {
    pub fn new(max_depth: u32) -> Self {
        Self {
            holding: BTreeSet::new(),
            max_depth,
        }
    }

    /// Re-evaluate the rules of `touched` and their direct dependents.
    pub fn evaluate(
        &mut self,
        touched: &[ComponentId],
        now: SimTime,
        graph: &ArchitectureGraph,
        state: &RuntimeState,
        source: &dyn MetricSource,
    ) -> Vec<Followup> {
        let mut wanted: BTreeSet<&ComponentId> = touched.iter().collect();
        for id in touched {
            wanted.extend(graph.dependents_of(id));
        }

        let mut followups = Vec::new();
        for def in graph.components().filter(|c| wanted.contains(&c.id)) {
            for (mode_index, mode) in def.failure_modes.iter().enumerate() {
                for (rule_index, rule) in mode.rules().iter().enumerate() {
                    let key = RuleKey {
                        component: def.id.clone(),
                        mode: mode_index,
                        rule: rule_index,
                    };
                    let holds = condition_holds(&rule.condition, &def.id, now, graph, state, source);
                    let was = self.holding.contains(&key);
                    if holds && !was {
                        debug!(
                            component = def.id.as_str(),
                            mode = mode.name.as_str(),
                            effect = rule.effect.kind(),
                            "propagation rule fired"
                        );
                        followups.push(effect_followup(
                            key.clone(),
                            rule_index,
                            rule,
                            def.id.clone(),
                            0,
                            vec![def.id.clone()],
                            now,
                        ));
                        self.holding.insert(key);
                    } else if !holds && was {
                        debug!(
                            component = def.id.as_str(),
                            mode = mode.name.as_str(),
                            "propagation rule cleared"
                        );
                        self.holding.remove(&key);
                        followups.push(
                            Followup::new(
                                now,
                                EventKind::PropagationCleared,
                                EventPayload::PropagationCleared { cause: key },
                            )
                            .on(def.id.clone()),
                        );
                    }
                }
            }
        }
        followups
    }

    /// Apply a delivered effect. Effects whose rule stopped holding while
    /// they were in flight are dropped.
    ///
    /// Returns the events to schedule and the components whose runtime
    /// changed.
    #[allow(clippy::too_many_arguments)]
    pub fn apply(
        &mut self,
        cause: &RuleKey,
        rule: usize,
        target: &ComponentId,
        effect: &PropagationEffect,
        depth: u32,
        visited: &[ComponentId],
        now: SimTime,
        graph: &ArchitectureGraph,
        state: &mut RuntimeState,
        source: &dyn MetricSource,
    ) -> (Vec<Followup>, Vec<ComponentId>) {
        if !self.holding.contains(cause) {
            return (Vec::new(), Vec::new());
        }
        let mut followups = Vec::new();
        let mut touched = Vec::new();
        let note = |detail: String| EventPayload::Note { detail };

        match effect {
            PropagationEffect::IncreaseLatency { .. }
            | PropagationEffect::IncreaseErrorRate { .. }
            | PropagationEffect::RejectRequests => {
                if let Some(runtime) = state.component_mut(target) {
                    runtime
                        .propagated
                        .insert((cause.clone(), rule), effect.clone());
                    touched.push(target.clone());
                    followups.push(
                        Followup::new(
                            now,
                            EventKind::NodeDegraded,
                            note(format!(
                                "{} from {}",
                                effect.kind(),
                                cause.component.as_str()
                            )),
                        )
                        .on(target.clone()),
                    );
                }
            }
            PropagationEffect::TriggerCircuitBreaker => {
                for edge_id in graph.incoming_edges(target) {
                    let Some(edge) = state.edges.get_mut(edge_id) else {
                        continue;
                    };
                    let newly_forced = edge.forced.insert(cause.clone()) && edge.forced.len() == 1;
                    let tripped = edge
                        .breaker
                        .as_mut()
                        .is_some_and(|breaker| breaker.force_open(now));
                    if newly_forced || tripped {
                        followups.push(
                            Followup::new(
                                now,
                                EventKind::CircuitOpen,
                                EventPayload::Breaker {
                                    edge: edge_id.clone(),
                                    state: "open".to_string(),
                                },
                            )
                            .on(target.clone()),
                        );
                    }
                }
            }
            PropagationEffect::TriggerFailover => {
                followups.push(
                    Followup::new(
                        now,
                        EventKind::ModelTimer,
                        EventPayload::Timer {
                            timer: ModelTimer::FailoverRequested,
                        },
                    )
                    .on(target.clone()),
                );
            }
            PropagationEffect::CascadeToDependents => {
                let rules = graph
                    .component(&cause.component)
                    .and_then(|def| def.failure_modes.get(cause.mode))
                    .map(|mode| mode.rules().to_vec())
                    .unwrap_or_default();
                if depth >= self.max_depth {
                    return (followups, touched);
                }
                for dependent in graph.dependents_of(target) {
                    if visited.contains(dependent) {
                        continue;
                    }
                    let mut path = visited.to_vec();
                    path.push(dependent.clone());
                    for (index, next) in rules.iter().enumerate() {
                        if condition_holds(&next.condition, dependent, now, graph, state, source) {
                            debug!(
                                from = target.as_str(),
                                to = dependent.as_str(),
                                depth = depth + 1,
                                effect = next.effect.kind(),
                                "failure cascaded"
                            );
                            followups.push(effect_followup(
                                cause.clone(),
                                index,
                                next,
                                dependent.clone(),
                                depth + 1,
                                path.clone(),
                                now,
                            ));
                        }
                    }
                }
            }
        }
        (followups, touched)
    }

    /// Revert everything `cause` applied.
    pub fn clear(
        &mut self,
        cause: &RuleKey,
        now: SimTime,
        state: &mut RuntimeState,
    ) -> (Vec<Followup>, Vec<ComponentId>) {
        let mut followups = Vec::new();
        let mut touched = Vec::new();
        for (id, runtime) in state.components.iter_mut() {
            let before = runtime.propagated.len();
            runtime.propagated.retain(|(key, _), _| key != cause);
            if runtime.propagated.len() != before {
                touched.push(id.clone());
            }
        }
        for (edge_id, edge) in state.edges.iter_mut() {
            if edge.forced.remove(cause) && edge.forced.is_empty() {
                followups.push(Followup::new(
                    now,
                    EventKind::CircuitClose,
                    EventPayload::Breaker {
                        edge: edge_id.clone(),
                        state: "closed".to_string(),
                    },
                ));
            }
        }
        (followups, touched)
    }
}

fn effect_followup(
    cause: RuleKey,
    rule: usize,
    definition: &PropagationRule,
    target: ComponentId,
    depth: u32,
    visited: Vec<ComponentId>,
    now: SimTime,
) -> Followup {
    let at = now.plus_micros(millis_to_micros(definition.delay_ms.unwrap_or(0.0)));
    Followup::new(
        at,
        EventKind::PropagationEffect,
        EventPayload::Propagation {
            cause,
            rule,
            target: target.clone(),
            effect: definition.effect.clone(),
            depth,
            visited,
        },
    )
    .on(target)
}

/// Whether `condition` holds on `component` now.
pub fn condition_holds(
    condition: &PropagationCondition,
    component: &ComponentId,
    now: SimTime,
    graph: &ArchitectureGraph,
    state: &RuntimeState,
    source: &dyn MetricSource,
) -> bool {
    match condition {
        PropagationCondition::DependencyFailures { threshold } => {
            let failing = graph
                .dependencies_of(component)
                .iter()
                .filter(|dep| state.is_failing(dep, now))
                .count();
            *threshold > 0 && failing >= *threshold as usize
        }
        PropagationCondition::ErrorRateExceeded { threshold } => source
            .metric(Metric::ErrorRate, Some(component))
            .is_some_and(|rate| rate > *threshold),
        PropagationCondition::LatencyExceeded { threshold_ms } => source
            .metric(Metric::LatencyP99, Some(component))
            .is_some_and(|p99| p99 > *threshold_ms),
        PropagationCondition::QueueDepthExceeded { threshold } => source
            .metric(Metric::QueueDepth, Some(component))
            .is_some_and(|depth| depth > *threshold),
        PropagationCondition::TimeoutCount {
            threshold,
            window_ms,
        } => state.component(component).is_some_and(|runtime| {
            *threshold > 0
                && runtime
                    .window
                    .timeouts_within(now, millis_to_micros(*window_ms))
                    >= *threshold
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::StaticMetrics;
    use std::collections::VecDeque;
    use archsim_types::{
        ComponentDefinition, ComponentType, FailureModeDefinition, FailurePropagation,
        FailureTrigger, FaultId, PropagationType, Severity, SystemArchitecture,
    };

    fn mode(rules: Vec<PropagationRule>) -> FailureModeDefinition {
        FailureModeDefinition::new(
            "dependency-down",
            FailureTrigger::ErrorRate { threshold: 0.5 },
            Severity::Medium,
        )
        .with_propagation(FailurePropagation {
            propagation_type: PropagationType::CascadingTimeout,
            rules,
        })
    }

    fn setup(api_rules: Vec<PropagationRule>) -> (ArchitectureGraph, RuntimeState) {
        let arch = SystemArchitecture::new("prop")
            .with_component(
                ComponentDefinition::new("web", ComponentType::Microservice).with_dependencies(["api"]),
            )
            .with_component(
                ComponentDefinition::new("api", ComponentType::Microservice)
                    .with_dependencies(["db"])
                    .with_failure_mode(mode(api_rules)),
            )
            .with_component(ComponentDefinition::new("db", ComponentType::RelationalDb));
        let graph = ArchitectureGraph::new(arch).unwrap();
        let state = RuntimeState::new(&graph, 10_000.0);
        (graph, state)
    }

    fn crash(state: &mut RuntimeState, id: &str, down: bool) {
        let runtime = state.component_mut(&ComponentId::new(id)).unwrap();
        for replica in &mut runtime.replicas {
            replica.crashed_by = down.then(|| FaultId::new("crash")).into_iter().collect();
        }
    }

    fn payload_parts(f: &Followup) -> (RuleKey, usize, ComponentId, PropagationEffect, u32, Vec<ComponentId>) {
        match &f.payload {
            EventPayload::Propagation {
                cause,
                rule,
                target,
                effect,
                depth,
                visited,
            } => (
                cause.clone(),
                *rule,
                target.clone(),
                effect.clone(),
                *depth,
                visited.clone(),
            ),
            other => panic!("not a propagation payload: {other:?}"),
        }
    }

    #[test]
    fn test_dependency_failure_fires_once_then_clears() {
        let rule = PropagationRule::new(
            PropagationCondition::DependencyFailures { threshold: 1 },
            PropagationEffect::IncreaseLatency { factor: 3.0 },
        )
        .with_delay_ms(200.0);
        let (graph, mut state) = setup(vec![rule]);
        let mut engine = PropagationEngine::new(4);
        let metrics = StaticMetrics::new();
        let now = SimTime::from_millis(1_000);
        let db = [ComponentId::new("db")];

        crash(&mut state, "db", true);
        let fired = engine.evaluate(&db, now, &graph, &state, &metrics);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].kind, EventKind::PropagationEffect);
        assert_eq!(fired[0].at, SimTime::from_millis(1_200));
        assert!(engine.evaluate(&db, now, &graph, &state, &metrics).is_empty(), "no refire");

        let (cause, rule, target, effect, depth, visited) = payload_parts(&fired[0]);
        engine.apply(&cause, rule, &target, &effect, depth, &visited, now, &graph, &mut state, &metrics);
        let api = state.component(&ComponentId::new("api")).unwrap();
        assert_eq!(api.effects(None).latency_factor, 3.0);

        crash(&mut state, "db", false);
        let cleared = engine.evaluate(&db, now, &graph, &state, &metrics);
        assert_eq!(cleared[0].kind, EventKind::PropagationCleared);
        let (_, touched) = engine.clear(&cause, now, &mut state);
        assert_eq!(touched, vec![ComponentId::new("api")]);
        let api = state.component(&ComponentId::new("api")).unwrap();
        assert_eq!(api.effects(None).latency_factor, 1.0);
    }

    #[test]
    fn test_effect_dropped_when_rule_cleared_in_flight() {
        let rule = PropagationRule::new(
            PropagationCondition::DependencyFailures { threshold: 1 },
            PropagationEffect::RejectRequests,
        )
        .with_delay_ms(500.0);
        let (graph, mut state) = setup(vec![rule]);
        let mut engine = PropagationEngine::new(4);
        let metrics = StaticMetrics::new();
        let db = [ComponentId::new("db")];

        crash(&mut state, "db", true);
        let fired = engine.evaluate(&db, SimTime::ZERO, &graph, &state, &metrics);
        crash(&mut state, "db", false);
        engine.evaluate(&db, SimTime::ZERO, &graph, &state, &metrics);

        let (cause, rule, target, effect, depth, visited) = payload_parts(&fired[0]);
        let (followups, touched) = engine.apply(
            &cause, rule, &target, &effect, depth, &visited, SimTime::ZERO, &graph, &mut state, &metrics,
        );
        assert!(followups.is_empty() && touched.is_empty());
        assert!(!state.component(&ComponentId::new("api")).unwrap().effects(None).reject);
    }

    #[test]
    fn test_cascade_reaches_dependents_within_depth() {
        let rules = vec![
            PropagationRule::new(
                PropagationCondition::ErrorRateExceeded { threshold: 0.5 },
                PropagationEffect::CascadeToDependents,
            ),
            PropagationRule::new(
                PropagationCondition::ErrorRateExceeded { threshold: 0.5 },
                PropagationEffect::IncreaseErrorRate { rate: 0.2 },
            ),
        ];
        let (graph, mut state) = setup(rules);
        let metrics = StaticMetrics::new()
            .with(Metric::ErrorRate, Some("api"), 0.9)
            .with(Metric::ErrorRate, Some("web"), 0.9);
        let api = [ComponentId::new("api")];

        let mut engine = PropagationEngine::new(4);
        let fired = engine.evaluate(&api, SimTime::ZERO, &graph, &state, &metrics);
        assert_eq!(fired.len(), 2);
        let (cause, rule, target, effect, depth, visited) = payload_parts(&fired[0]);
        assert_eq!(effect, PropagationEffect::CascadeToDependents);

        let (cascaded, _) = engine.apply(
            &cause, rule, &target, &effect, depth, &visited, SimTime::ZERO, &graph, &mut state, &metrics,
        );
        let targets: Vec<_> = cascaded.iter().map(|f| payload_parts(f)).collect();
        assert_eq!(targets.len(), 2);
        assert!(targets.iter().all(|(_, _, t, _, d, v)| t.as_str() == "web"
            && *d == 1
            && v == &vec![ComponentId::new("api"), ComponentId::new("web")]));

        let mut shallow = PropagationEngine::new(0);
        shallow.evaluate(&api, SimTime::ZERO, &graph, &state, &metrics);
        let (none, _) = shallow.apply(
            &cause, rule, &target, &effect, depth, &visited, SimTime::ZERO, &graph, &mut state, &metrics,
        );
        assert!(none.is_empty());
    }

    /// Apply every effect `first` leads to, breadth first. Returns the
    /// targets and depths in application order.
    fn drain(
        engine: &mut PropagationEngine,
        first: Vec<Followup>,
        graph: &ArchitectureGraph,
        state: &mut RuntimeState,
        metrics: &StaticMetrics,
    ) -> Vec<(String, u32)> {
        let mut pending: VecDeque<Followup> = first.into();
        let mut applied = Vec::new();
        while let Some(next) = pending.pop_front() {
            assert!(applied.len() < 64, "cascade did not stop: {applied:?}");
            let (cause, rule, target, effect, depth, visited) = payload_parts(&next);
            applied.push((target.as_str().to_string(), depth));
            let (more, _) = engine.apply(
                &cause, rule, &target, &effect, depth, &visited, SimTime::ZERO, graph, state, metrics,
            );
            pending.extend(more.into_iter().filter(|f| f.kind == EventKind::PropagationEffect));
        }
        applied
    }

    #[test]
    fn test_cascade_around_a_cycle_visits_each_component_once() {
        let cascade = PropagationRule::new(
            PropagationCondition::ErrorRateExceeded { threshold: 0.5 },
            PropagationEffect::CascadeToDependents,
        );
        // a -> b -> c -> a
        let arch = SystemArchitecture::new("ring")
            .with_component(
                ComponentDefinition::new("a", ComponentType::Microservice)
                    .with_dependencies(["b"])
                    .with_failure_mode(mode(vec![cascade])),
            )
            .with_component(
                ComponentDefinition::new("b", ComponentType::Microservice).with_dependencies(["c"]),
            )
            .with_component(
                ComponentDefinition::new("c", ComponentType::Microservice).with_dependencies(["a"]),
            );
        let graph = ArchitectureGraph::new(arch).unwrap();
        let mut state = RuntimeState::new(&graph, 10_000.0);
        let metrics = StaticMetrics::new()
            .with(Metric::ErrorRate, Some("a"), 0.9)
            .with(Metric::ErrorRate, Some("b"), 0.9)
            .with(Metric::ErrorRate, Some("c"), 0.9);
        let a = [ComponentId::new("a")];

        let mut engine = PropagationEngine::new(16);
        let fired = engine.evaluate(&a, SimTime::ZERO, &graph, &state, &metrics);
        assert_eq!(fired.len(), 1);
        let applied = drain(&mut engine, fired, &graph, &mut state, &metrics);
        assert_eq!(
            applied,
            vec![("a".to_string(), 0), ("c".to_string(), 1), ("b".to_string(), 2)]
        );

        let mut shallow = PropagationEngine::new(1);
        let fired = shallow.evaluate(&a, SimTime::ZERO, &graph, &state, &metrics);
        let applied = drain(&mut shallow, fired, &graph, &mut state, &metrics);
        assert_eq!(applied, vec![("a".to_string(), 0), ("c".to_string(), 1)]);
    }

    #[test]
    fn test_breaker_effect_forces_incoming_edges() {
        let rule = PropagationRule::new(
            PropagationCondition::DependencyFailures { threshold: 1 },
            PropagationEffect::TriggerCircuitBreaker,
        );
        let (graph, mut state) = setup(vec![rule]);
        let mut engine = PropagationEngine::new(4);
        let metrics = StaticMetrics::new();
        crash(&mut state, "db", true);
        let fired = engine.evaluate(&[ComponentId::new("db")], SimTime::ZERO, &graph, &state, &metrics);
        let (cause, rule, target, effect, depth, visited) = payload_parts(&fired[0]);

        let (opened, _) = engine.apply(
            &cause, rule, &target, &effect, depth, &visited, SimTime::ZERO, &graph, &mut state, &metrics,
        );
        assert_eq!(opened.len(), 1);
        assert_eq!(opened[0].kind, EventKind::CircuitOpen);

        let (closed, _) = engine.clear(&cause, SimTime::ZERO, &mut state);
        assert_eq!(closed[0].kind, EventKind::CircuitClose);
        assert!(state.edges.values().all(|e| e.forced.is_empty()));
    }
}
