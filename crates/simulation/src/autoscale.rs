//! Horizontal autoscaling.
//!
//! Components with a horizontal policy and at least one trigger are checked
//! every second. A trigger must hold for its `durationSec` before it counts.
//! Upper-bound triggers (`gt`, `gte`) scale up by `scaleUpStep`; scale-down
//! happens when a lower-bound trigger holds, or when every upper-bound
//! metric has stayed below half its threshold for the same duration. Both
//! directions respect their cooldowns and the replica bounds.
//!
//! New replicas start cold and only take traffic once `ScaleComplete` fires.

use archsim_core::{CheckTarget, EventKind, EventPayload};
use archsim_types::{
    ComponentId, HorizontalScaling, ScalingMetric, ScalingTrigger, SimTime,
};
use std::collections::BTreeMap;
use tracing::debug;

use crate::event_queue::Followup;
use crate::graph::ArchitectureGraph;
use crate::snapshot::{Metric, MetricSource};
use crate::state::{Replica, ReplicaLifecycle, RuntimeState};

/// Period of autoscale checks.
pub const CHECK_INTERVAL_MS: f64 = 1_000.0;

#[derive(Debug, Clone)]
struct Scaler {
    policy: HorizontalScaling,
    held_since: Vec<Option<SimTime>>,
    calm_since: Option<SimTime>,
    last_up: Option<SimTime>,
    last_down: Option<SimTime>,
}

/// Result of one check.
#[derive(Debug, Clone, Default)]
pub struct ScaleDecision {
    pub followups: Vec<Followup>,
    /// Replicas were added or removed.
    pub changed: bool,
}

#[derive(Debug, Clone, Default)]
pub struct AutoscaleEngine {
    scalers: BTreeMap<ComponentId, Scaler>,
}

impl AutoscaleEngine {
    pub fn new(graph: &ArchitectureGraph) -> Self {
        let scalers = graph
            .components()
            .filter_map(|def| {
                let policy = def.scaling.horizontal()?;
                if policy.triggers.is_empty() {
                    return None;
                }
                Some((
                    def.id.clone(),
                    Scaler {
                        policy: policy.clone(),
                        held_since: vec![None; policy.triggers.len()],
                        calm_since: None,
                        last_up: None,
                        last_down: None,
                    },
                ))
            })
            .collect();
        Self { scalers }
    }

    pub fn initial_schedule(&self) -> Vec<Followup> {
        self.scalers
            .keys()
            .map(|id| check_at(SimTime::ZERO.plus_millis(CHECK_INTERVAL_MS), id))
            .collect()
    }

    pub fn check(
        &mut self,
        component: &ComponentId,
        now: SimTime,
        state: &mut RuntimeState,
        source: &dyn MetricSource,
    ) -> ScaleDecision {
        let mut decision = ScaleDecision::default();
        let Some(scaler) = self.scalers.get_mut(component) else {
            return decision;
        };
        decision
            .followups
            .push(check_at(now.plus_millis(CHECK_INTERVAL_MS), component));

        let mut scale_up: Option<&ScalingTrigger> = None;
        let mut scale_down: Option<&ScalingTrigger> = None;
        let mut all_calm = true;
        let mut any_upper = false;
        for (index, trigger) in scaler.policy.triggers.iter().enumerate() {
            let value = read(trigger, component, source);
            let holds = value.is_some_and(|v| trigger.operator.holds(v, trigger.threshold));
            let since = &mut scaler.held_since[index];
            if holds {
                since.get_or_insert(now);
            } else {
                *since = None;
            }
            let sustained = since.is_some_and(|t| sustained_for(t, now, trigger.duration_sec));

            if trigger.operator.is_upper_bound() {
                any_upper = true;
                if sustained && scale_up.is_none() {
                    scale_up = Some(trigger);
                }
                if !value.is_some_and(|v| v < trigger.threshold / 2.0) {
                    all_calm = false;
                }
            } else if sustained && scale_down.is_none() {
                scale_down = Some(trigger);
            }
        }
        if any_upper && all_calm {
            scaler.calm_since.get_or_insert(now);
        } else {
            scaler.calm_since = None;
        }
        let longest = scaler
            .policy
            .triggers
            .iter()
            .map(|t| t.duration_sec)
            .fold(0.0, f64::max);
        let calm = scaler
            .calm_since
            .is_some_and(|t| sustained_for(t, now, longest));

        let Some(runtime) = state.component_mut(component) else {
            return decision;
        };
        let live = runtime.live_replicas() as u32;
        let policy = &scaler.policy;

        if let Some(trigger) = scale_up {
            let cooled = scaler
                .last_up
                .map_or(true, |t| sustained_for(t, now, policy.scale_up_cooldown_sec));
            if cooled && live < policy.max_replicas {
                let target = (live + policy.scale_up_step.max(1)).min(policy.max_replicas);
                let label = describe(trigger);
                debug!(
                    component = component.as_str(),
                    from = live,
                    to = target,
                    trigger = label.as_str(),
                    "scaling up"
                );
                let slow_start = runtime.effects(None).slow_start_ms;
                let ready_at = now.plus_millis(policy.cold_start_ms + slow_start);
                decision
                    .followups
                    .extend(grow(component, runtime, live, target, now, ready_at, &label));
                scaler.last_up = Some(now);
                decision.changed = true;
            }
        } else if scale_down.is_some() || calm {
            let cooled = scaler
                .last_down
                .map_or(true, |t| sustained_for(t, now, policy.scale_down_cooldown_sec))
                && scaler
                    .last_up
                    .map_or(true, |t| sustained_for(t, now, policy.scale_down_cooldown_sec));
            let floor = policy.min_replicas.max(1);
            if cooled && live > floor {
                let target = live.saturating_sub(policy.scale_down_step.max(1)).max(floor);
                let label = scale_down.map_or_else(|| "load below half of scale-up thresholds".to_string(), describe);
                debug!(
                    component = component.as_str(),
                    from = live,
                    to = target,
                    trigger = label.as_str(),
                    "scaling down"
                );
                decision
                    .followups
                    .push(shrink(component, runtime, live, target, now, &label));
                scaler.last_down = Some(now);
                decision.changed = true;
            }
        }
        decision
    }
}

/// Set the replica count of `component` directly.
pub fn scale_to(
    component: &ComponentId,
    replicas: u32,
    now: SimTime,
    graph: &ArchitectureGraph,
    state: &mut RuntimeState,
) -> Vec<Followup> {
    let cold_start_ms = graph
        .component(component)
        .and_then(|def| def.scaling.horizontal())
        .map_or(0.0, |h| h.cold_start_ms);
    let Some(runtime) = state.component_mut(component) else {
        return Vec::new();
    };
    let live = runtime.live_replicas() as u32;
    let target = replicas.max(1);
    let label = "manual".to_string();
    if target > live {
        let ready_at = now.plus_millis(cold_start_ms + runtime.effects(None).slow_start_ms);
        grow(component, runtime, live, target, now, ready_at, &label)
    } else if target < live {
        vec![shrink(component, runtime, live, target, now, &label)]
    } else {
        Vec::new()
    }
}

fn grow(
    component: &ComponentId,
    runtime: &mut crate::state::ComponentRuntime,
    live: u32,
    target: u32,
    now: SimTime,
    ready_at: SimTime,
    label: &str,
) -> Vec<Followup> {
    for _ in live..target {
        runtime.replicas.push(Replica::starting(ready_at));
    }
    let scale = EventPayload::Scale {
        previous_replicas: live,
        new_replicas: target,
        trigger: label.to_string(),
    };
    vec![
        Followup::new(now, EventKind::ScaleUp, scale.clone()).on(component.clone()),
        Followup::new(
            now,
            EventKind::ColdStart,
            EventPayload::Note {
                detail: format!("{} replicas starting", target - live),
            },
        )
        .on(component.clone()),
        Followup::new(ready_at, EventKind::ScaleComplete, scale).on(component.clone()),
    ]
}

/// Terminate the newest live replicas.
fn shrink(
    component: &ComponentId,
    runtime: &mut crate::state::ComponentRuntime,
    live: u32,
    target: u32,
    now: SimTime,
    label: &str,
) -> Followup {
    let mut remove = live - target;
    for replica in runtime.replicas.iter_mut().rev() {
        if remove == 0 {
            break;
        }
        if replica.is_live() {
            replica.state = ReplicaLifecycle::Terminated;
            remove -= 1;
        }
    }
    Followup::new(
        now,
        EventKind::ScaleDown,
        EventPayload::Scale {
            previous_replicas: live,
            new_replicas: target,
            trigger: label.to_string(),
        },
    )
    .on(component.clone())
}

fn read(trigger: &ScalingTrigger, component: &ComponentId, source: &dyn MetricSource) -> Option<f64> {
    let metric = match trigger.metric {
        ScalingMetric::Cpu => Metric::Utilization,
        ScalingMetric::Memory => Metric::Memory,
        ScalingMetric::QueueDepth => Metric::QueueDepth,
        ScalingMetric::Rps => Metric::Rps,
        ScalingMetric::LatencyP99 => Metric::LatencyP99,
        ScalingMetric::Custom => Metric::parse(trigger.custom_metric_name.as_deref()?).ok()?,
    };
    source.metric(metric, Some(component))
}

fn sustained_for(since: SimTime, now: SimTime, seconds: f64) -> bool {
    now.micros_since(since) >= archsim_types::millis_to_micros(seconds * 1_000.0)
}

fn describe(trigger: &ScalingTrigger) -> String {
    let metric = match trigger.metric {
        ScalingMetric::Cpu => "cpu",
        ScalingMetric::Memory => "memory",
        ScalingMetric::QueueDepth => "queue-depth",
        ScalingMetric::Rps => "rps",
        ScalingMetric::LatencyP99 => "latency-p99",
        ScalingMetric::Custom => trigger.custom_metric_name.as_deref().unwrap_or("custom"),
    };
    format!("{metric} {} {}", trigger.operator.symbol(), trigger.threshold)
}

fn check_at(at: SimTime, component: &ComponentId) -> Followup {
    Followup::new(
        at,
        EventKind::AutoscaleCheck,
        EventPayload::Check {
            target: CheckTarget::Autoscale {
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
    use archsim_types::{
        ComparisonOperator, ComponentDefinition, ComponentType, ScalingPolicy, ScalingType,
        SystemArchitecture,
    };

    fn policy(duration_sec: f64) -> HorizontalScaling {
        HorizontalScaling {
            min_replicas: 2,
            max_replicas: 4,
            triggers: vec![ScalingTrigger {
                metric: ScalingMetric::Cpu,
                custom_metric_name: None,
                threshold: 70.0,
                operator: ComparisonOperator::Gt,
                duration_sec,
            }],
            scale_up_cooldown_sec: 10.0,
            scale_down_cooldown_sec: 30.0,
            scale_up_step: 1,
            scale_down_step: 1,
            cold_start_ms: 2_000.0,
        }
    }

    fn setup(h: HorizontalScaling) -> (ArchitectureGraph, RuntimeState, AutoscaleEngine) {
        let arch = SystemArchitecture::new("scale").with_component(
            ComponentDefinition::new("api", ComponentType::Microservice).with_scaling(ScalingPolicy {
                scaling_type: ScalingType::Horizontal,
                horizontal: Some(h),
            }),
        );
        let graph = ArchitectureGraph::new(arch).unwrap();
        let state = RuntimeState::new(&graph, 10_000.0);
        let engine = AutoscaleEngine::new(&graph);
        (graph, state, engine)
    }

    fn api() -> ComponentId {
        ComponentId::new("api")
    }

    fn cpu(value: f64) -> StaticMetrics {
        StaticMetrics::new().with(Metric::Utilization, Some("api"), value)
    }

    #[test]
    fn test_scale_up_after_sustained_load_with_cold_start() {
        let (_, mut state, mut engine) = setup(policy(2.0));
        assert_eq!(state.component(&api()).unwrap().live_replicas(), 2);

        let hot = cpu(90.0);
        let first = engine.check(&api(), SimTime::from_millis(1_000), &mut state, &hot);
        assert!(!first.changed, "not sustained yet");
        let second = engine.check(&api(), SimTime::from_millis(3_000), &mut state, &hot);
        assert!(second.changed);
        let kinds: Vec<_> = second.followups.iter().map(|f| f.kind).collect();
        assert!(kinds.contains(&EventKind::ScaleUp));
        assert!(kinds.contains(&EventKind::ColdStart));
        let complete = second
            .followups
            .iter()
            .find(|f| f.kind == EventKind::ScaleComplete)
            .unwrap();
        assert_eq!(complete.at, SimTime::from_millis(5_000));

        let runtime = state.component(&api()).unwrap();
        assert_eq!(runtime.live_replicas(), 3);
        assert_eq!(runtime.ready_replicas(SimTime::from_millis(4_000)).len(), 2);
        assert_eq!(runtime.ready_replicas(SimTime::from_millis(5_000)).len(), 3);
    }

    #[test]
    fn test_cooldown_and_max_bound() {
        let (_, mut state, mut engine) = setup(policy(0.0));
        let hot = cpu(95.0);
        assert!(engine.check(&api(), SimTime::from_millis(1_000), &mut state, &hot).changed);
        assert!(!engine.check(&api(), SimTime::from_millis(5_000), &mut state, &hot).changed);
        assert!(engine.check(&api(), SimTime::from_millis(11_000), &mut state, &hot).changed);
        assert!(!engine.check(&api(), SimTime::from_millis(30_000), &mut state, &hot).changed);
        assert_eq!(state.component(&api()).unwrap().live_replicas(), 4);
    }

    #[test]
    fn test_scale_down_when_calm_but_not_below_min() {
        let (graph, mut state, mut engine) = setup(policy(0.0));
        scale_to(&api(), 3, SimTime::ZERO, &graph, &mut state);
        let idle = cpu(10.0);
        let down = engine.check(&api(), SimTime::from_millis(1_000), &mut state, &idle);
        assert!(down.followups.iter().any(|f| f.kind == EventKind::ScaleDown));
        assert_eq!(state.component(&api()).unwrap().live_replicas(), 2);
        assert!(!engine.check(&api(), SimTime::from_millis(60_000), &mut state, &idle).changed);
    }
}
