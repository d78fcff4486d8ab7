//! Load balancers and reverse proxies.

use archsim_core::{Action, CallOutcome, EventKind, EventPayload, ModelTimer};
use archsim_types::{
    CallId, ComponentConfig, ComponentDefinition, ComponentId, Hash, HealthCheckConfig,
    LoadBalancerConfig, LoadBalancingAlgorithm, SimTime,
};
use std::collections::BTreeMap;
use tracing::debug;

use super::{propagate_failure, BehaviorModel, ModelContext, ModelLoad};

#[derive(Debug, Clone, Default)]
struct TargetHealth {
    healthy: bool,
    consecutive_ok: u32,
    consecutive_failed: u32,
}

#[derive(Debug)]
pub struct LoadBalancerModel {
    config: LoadBalancerConfig,
    health: BTreeMap<ComponentId, TargetHealth>,
    connections: BTreeMap<ComponentId, u64>,
    sticky: BTreeMap<String, (ComponentId, SimTime)>,
    routed: BTreeMap<CallId, ComponentId>,
    cursor: usize,
    active: u64,
}

impl LoadBalancerModel {
    pub fn new(def: &ComponentDefinition) -> Self {
        let config = match &def.config {
            ComponentConfig::LoadBalancer(lb) => lb.clone(),
            _ => LoadBalancerConfig {
                health_check: def.health_check.clone(),
                ..Default::default()
            },
        };
        Self {
            config,
            health: BTreeMap::new(),
            connections: BTreeMap::new(),
            sticky: BTreeMap::new(),
            routed: BTreeMap::new(),
            cursor: 0,
            active: 0,
        }
    }

    fn health_check(&self) -> &HealthCheckConfig {
        &self.config.health_check
    }

    fn is_healthy(&self, target: &ComponentId) -> bool {
        self.health.get(target).map_or(true, |h| h.healthy)
    }

    pub fn healthy_targets(&self, ctx: &ModelContext<'_>) -> Vec<ComponentId> {
        ctx.dependencies()
            .iter()
            .filter(|t| self.is_healthy(t))
            .cloned()
            .collect()
    }

    fn choose(&mut self, ctx: &mut ModelContext<'_>, user: &str) -> Option<ComponentId> {
        let targets = self.healthy_targets(ctx);
        if targets.is_empty() {
            return None;
        }

        let sticky_ttl_us = self
            .config
            .sticky_session
            .as_ref()
            .filter(|s| s.enabled)
            .map(|s| archsim_types::millis_to_micros(s.ttl_ms));
        if sticky_ttl_us.is_some() {
            if let Some((target, expires)) = self.sticky.get(user) {
                if *expires > ctx.now && targets.contains(target) {
                    return Some(target.clone());
                }
            }
        }

        let pick = match self.config.algorithm {
            LoadBalancingAlgorithm::RoundRobin => {
                let t = targets[self.cursor % targets.len()].clone();
                self.cursor = self.cursor.wrapping_add(1);
                t
            }
            LoadBalancingAlgorithm::LeastConnections => {
                // Ties go to declaration order.
                let mut best = targets[0].clone();
                let mut best_load = u64::MAX;
                for t in &targets {
                    let load = self.connections.get(t).copied().unwrap_or(0);
                    if load < best_load {
                        best = t.clone();
                        best_load = load;
                    }
                }
                best
            }
            LoadBalancingAlgorithm::Weighted => {
                let weights: Vec<f64> = targets
                    .iter()
                    .map(|t| self.config.weights.get(t.as_str()).copied().unwrap_or(1.0).max(0.0))
                    .collect();
                let total: f64 = weights.iter().sum();
                if total <= 0.0 {
                    targets[0].clone()
                } else {
                    let mut point = ctx.rng.next() * total;
                    let mut chosen = targets[targets.len() - 1].clone();
                    for (t, w) in targets.iter().zip(&weights) {
                        if point < *w {
                            chosen = t.clone();
                            break;
                        }
                        point -= w;
                    }
                    chosen
                }
            }
            LoadBalancingAlgorithm::IpHash => {
                let h = Hash::from_bytes(user.as_bytes()).as_u64();
                targets[(h % targets.len() as u64) as usize].clone()
            }
            LoadBalancingAlgorithm::Random => targets[ctx.rng.below(targets.len())].clone(),
        };

        if let Some(ttl) = sticky_ttl_us {
            self.sticky
                .insert(user.to_string(), (pick.clone(), ctx.now.plus_micros(ttl)));
        }
        Some(pick)
    }

    fn schedule_probe(&self) -> Action {
        Action::after(
            EventKind::ModelTimer,
            archsim_types::millis_to_micros(self.health_check().interval_ms.max(1.0)),
            EventPayload::Timer {
                timer: ModelTimer::HealthCheck,
            },
        )
    }

    /// Probe every target once and apply the healthy/unhealthy thresholds.
    fn probe(&mut self, ctx: &ModelContext<'_>) -> Vec<Action> {
        let healthy_after = self.health_check().healthy_threshold.max(1);
        let unhealthy_after = self.health_check().unhealthy_threshold.max(1);
        let mut actions = Vec::new();
        for target in ctx.dependencies() {
            let ok = !ctx.state.is_failing(target, ctx.now);
            let entry = self.health.entry(target.clone()).or_insert(TargetHealth {
                healthy: true,
                ..Default::default()
            });
            if ok {
                entry.consecutive_ok += 1;
                entry.consecutive_failed = 0;
                if !entry.healthy && entry.consecutive_ok >= healthy_after {
                    entry.healthy = true;
                    debug!(lb = ctx.id.as_str(), target = target.as_str(), "target back in rotation");
                    actions.push(Action::emit(
                        EventKind::NodeRecovery,
                        EventPayload::Note {
                            detail: format!("{} healthy at {}", target.as_str(), ctx.id.as_str()),
                        },
                    ));
                }
            } else {
                entry.consecutive_failed += 1;
                entry.consecutive_ok = 0;
                if entry.healthy && entry.consecutive_failed >= unhealthy_after {
                    entry.healthy = false;
                    debug!(lb = ctx.id.as_str(), target = target.as_str(), "target removed from rotation");
                    actions.push(Action::emit(
                        EventKind::NodeDegraded,
                        EventPayload::Note {
                            detail: format!(
                                "{} unhealthy at {}",
                                target.as_str(),
                                ctx.id.as_str()
                            ),
                        },
                    ));
                }
            }
        }
        actions
    }
}

impl BehaviorModel for LoadBalancerModel {
    fn on_start(&mut self, _ctx: &mut ModelContext<'_>) -> Vec<Action> {
        vec![self.schedule_probe()]
    }

    fn on_arrival(&mut self, ctx: &mut ModelContext<'_>, call: CallId) -> Vec<Action> {
        self.active += 1;
        let replica = ctx.call(call).and_then(|c| c.replica);
        let base = ctx.sample_ms(&self.config.processing_latency.clone());
        let delay = ctx.service_time_us(base, replica);
        vec![Action::after(
            EventKind::ProcessingComplete,
            delay,
            EventPayload::Call { call },
        )]
    }

    fn on_processing_complete(
        &mut self,
        ctx: &mut ModelContext<'_>,
        call: CallId,
    ) -> Vec<Action> {
        self.active = self.active.saturating_sub(1);
        if ctx.lost_replica(call) {
            return vec![Action::resolve(call, CallOutcome::error("node-failure"))];
        }
        let user = ctx
            .request_of(call)
            .map(|r| r.spec.user.clone())
            .unwrap_or_default();
        match self.choose(ctx, &user) {
            Some(target) => {
                *self.connections.entry(target.clone()).or_insert(0) += 1;
                self.routed.insert(call, target.clone());
                vec![Action::forward(call, target)]
            }
            None => vec![Action::resolve(
                call,
                CallOutcome::error("no-healthy-upstream"),
            )],
        }
    }

    fn on_child_outcome(
        &mut self,
        _ctx: &mut ModelContext<'_>,
        parent: CallId,
        _child: CallId,
        outcome: &CallOutcome,
    ) -> Vec<Action> {
        let Some(target) = self.routed.remove(&parent) else {
            return Vec::new();
        };
        if let Some(count) = self.connections.get_mut(&target) {
            *count = count.saturating_sub(1);
        }
        vec![Action::resolve(parent, propagate_failure(outcome))]
    }

    fn on_timer(&mut self, ctx: &mut ModelContext<'_>, timer: &ModelTimer) -> Vec<Action> {
        match timer {
            ModelTimer::HealthCheck => {
                let mut actions = self.probe(ctx);
                actions.push(self.schedule_probe());
                actions
            }
            _ => Vec::new(),
        }
    }

    fn load(&self) -> ModelLoad {
        ModelLoad {
            queue_depth: 0,
            active: self.active + self.routed.len() as u64,
            capacity: 0,
            queue_capacity: None,
        }
    }
}
