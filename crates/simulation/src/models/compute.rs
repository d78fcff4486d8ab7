//! APIs, microservices, serverless functions and generic compute.

use archsim_core::{Action, CallOutcome, EventKind, EventPayload, ModelTimer, Operation};
use archsim_types::{
    CallId, ComponentConfig, ComponentDefinition, ComponentType, DistributionConfig,
    EndpointSpec, ServerlessConfig, SimTime,
};
use std::collections::{BTreeSet, VecDeque};
use tracing::trace;

use super::{BehaviorModel, ModelContext, ModelLoad, Pipeline};
use crate::rate_limiter::TokenBucket;

#[derive(Debug)]
enum Flavor {
    Api {
        endpoints: Vec<EndpointSpec>,
        limiter: Option<TokenBucket>,
    },
    Serverless(ServerlessConfig),
    Plain {
        latency: DistributionConfig,
        error_rate: f64,
    },
}

/// Slot-limited processing followed by sequential dependency calls.
#[derive(Debug)]
pub struct ComputeModel {
    flavor: Flavor,
    concurrency: u32,
    max_queue: Option<u32>,
    active: u64,
    capacity: u64,
    waiting: VecDeque<CallId>,
    pipeline: Pipeline,
    /// Idempotency keys of writes already applied, when deduplicating.
    applied: Option<BTreeSet<String>>,
}

impl ComputeModel {
    pub fn new(def: &ComponentDefinition) -> Self {
        let flavor = match &def.config {
            ComponentConfig::Api(api) => Flavor::Api {
                endpoints: api.endpoints.clone(),
                limiter: api.rate_limit.as_ref().map(|rl| {
                    TokenBucket::new(rl.burst_size, rl.requests_per_second, SimTime::ZERO)
                }),
            },
            ComponentConfig::Serverless(cfg) => Flavor::Serverless(cfg.clone()),
            ComponentConfig::Microservice(cfg) => Flavor::Plain {
                latency: cfg.processing_latency.clone(),
                error_rate: 0.0,
            },
            ComponentConfig::Generic(cfg) => Flavor::Plain {
                latency: cfg.processing_latency.clone(),
                error_rate: cfg.error_rate,
            },
            _ => Flavor::Plain {
                latency: DistributionConfig::constant(1.0),
                error_rate: 0.0,
            },
        };
        let deduplicates = def.component_type == ComponentType::IdempotencyManager
            || def.has_tag("idempotent");
        Self {
            flavor,
            concurrency: def.resources.concurrency.max(1),
            max_queue: def.resources.max_queue,
            active: 0,
            capacity: def.resources.concurrency.max(1) as u64,
            waiting: VecDeque::new(),
            pipeline: Pipeline::default(),
            applied: deduplicates.then(BTreeSet::new),
        }
    }

    fn refresh_capacity(&mut self, ctx: &ModelContext<'_>) {
        self.capacity = match &self.flavor {
            Flavor::Serverless(cfg) => {
                (cfg.concurrency.reserved + cfg.concurrency.max_burst).max(1) as u64
            }
            _ => self.concurrency as u64 * ctx.ready_replicas().max(1) as u64,
        };
    }

    fn endpoint(&self, ctx: &ModelContext<'_>, call: CallId) -> Option<&EndpointSpec> {
        let Flavor::Api { endpoints, .. } = &self.flavor else {
            return None;
        };
        let request_type = ctx
            .request_of(call)
            .and_then(|r| r.spec.request_type.as_deref());
        if let Some(found) = request_type.and_then(|t| endpoints.iter().find(|e| e.path == t)) {
            return Some(found);
        }
        let is_write = ctx.call(call).is_some_and(|c| c.op == Operation::Write);
        endpoints
            .iter()
            .find(|e| e.method.is_write() == is_write)
            .or_else(|| endpoints.first())
    }

    fn base_latency(&self, ctx: &mut ModelContext<'_>, call: CallId) -> f64 {
        let dist = match &self.flavor {
            Flavor::Api { .. } => self.endpoint(ctx, call).map(|e| e.latency.clone()),
            Flavor::Serverless(cfg) => Some(cfg.processing_latency.clone()),
            Flavor::Plain { latency, .. } => Some(latency.clone()),
        };
        dist.map_or(5.0, |d| ctx.sample_ms(&d))
    }

    fn error_rate(&self, ctx: &ModelContext<'_>, call: CallId) -> f64 {
        match &self.flavor {
            Flavor::Api { .. } => self.endpoint(ctx, call).map_or(0.0, |e| e.error_rate),
            Flavor::Plain { error_rate, .. } => *error_rate,
            Flavor::Serverless(_) => 0.0,
        }
    }

    /// Extra start-up time, if this invocation lands on a cold instance.
    fn cold_start_ms(&self, ctx: &mut ModelContext<'_>) -> Option<f64> {
        let Flavor::Serverless(cfg) = &self.flavor else {
            return None;
        };
        let warm_pool = cfg
            .provisioned
            .as_ref()
            .filter(|p| p.enabled)
            .map_or(0, |p| p.min_instances as u64);
        if self.active <= warm_pool && warm_pool > 0 {
            return None;
        }
        let cold = ctx.ready_replicas() == 0 || ctx.rng.chance(cfg.cold_start.probability);
        cold.then(|| ctx.sample_ms(&cfg.cold_start.duration_distribution))
    }

    fn begin(&mut self, ctx: &mut ModelContext<'_>, call: CallId) -> Vec<Action> {
        self.active += 1;
        let mut actions = Vec::new();
        let mut base = self.base_latency(ctx, call);
        if let Some(cold) = self.cold_start_ms(ctx) {
            base += cold;
            if let Some(c) = ctx.call(call) {
                actions.push(Action::emit_for(
                    EventKind::ColdStart,
                    c.request,
                    EventPayload::Note {
                        detail: format!("cold start {cold:.1}ms"),
                    },
                ));
            }
        }
        let replica = ctx.call(call).and_then(|c| c.replica);
        let delay_us = ctx.service_time_us(base, replica);
        actions.push(Action::after(
            EventKind::ProcessingComplete,
            delay_us,
            EventPayload::Call { call },
        ));
        actions
    }

    fn drain_waiting(&mut self, ctx: &mut ModelContext<'_>) -> Vec<Action> {
        let mut actions = Vec::new();
        while self.active < self.capacity {
            let Some(next) = self.waiting.pop_front() else {
                break;
            };
            if let Some(c) = ctx.call(next) {
                actions.push(Action::emit_for(
                    EventKind::RequestDequeued,
                    c.request,
                    EventPayload::Call { call: next },
                ));
            }
            actions.extend(self.begin(ctx, next));
        }
        actions
    }

    /// Writes whose idempotency key was applied before succeed without
    /// doing the work again.
    fn is_duplicate(&mut self, ctx: &ModelContext<'_>, call: CallId) -> bool {
        let Some(applied) = self.applied.as_mut() else {
            return false;
        };
        if !ctx.call(call).is_some_and(|c| c.op == Operation::Write) {
            return false;
        }
        let Some(key) = ctx
            .request_of(call)
            .and_then(|r| r.attribute("idempotencyKey"))
        else {
            return false;
        };
        !applied.insert(key.to_string())
    }
}

impl BehaviorModel for ComputeModel {
    fn on_arrival(&mut self, ctx: &mut ModelContext<'_>, call: CallId) -> Vec<Action> {
        let Some(request) = ctx.call(call).map(|c| c.request) else {
            return Vec::new();
        };
        self.refresh_capacity(ctx);

        if let Flavor::Api {
            limiter: Some(bucket),
            ..
        } = &mut self.flavor
        {
            if !bucket.try_acquire(ctx.now) {
                return vec![
                    Action::emit_for(EventKind::RateLimitExceeded, request, EventPayload::None),
                    Action::resolve(call, CallOutcome::rejected("rate-limited")),
                ];
            }
        }

        if self.is_duplicate(ctx, call) {
            trace!(component = ctx.id.as_str(), %call, "duplicate write absorbed");
            return vec![Action::resolve(call, CallOutcome::success())];
        }

        if self.active < self.capacity {
            return self.begin(ctx, call);
        }

        if matches!(self.flavor, Flavor::Serverless(_)) {
            return vec![
                Action::emit_for(EventKind::RateLimitExceeded, request, EventPayload::None),
                Action::resolve(call, CallOutcome::rejected("throttled")),
            ];
        }

        let has_room = self
            .max_queue
            .map_or(true, |max| (self.waiting.len() as u64) < max as u64);
        if has_room {
            self.waiting.push_back(call);
            vec![Action::emit_for(
                EventKind::RequestQueued,
                request,
                EventPayload::Call { call },
            )]
        } else {
            vec![
                Action::emit_for(
                    EventKind::QueueFull,
                    request,
                    EventPayload::Backlog {
                        depth: self.waiting.len() as u64,
                        max_depth: self.max_queue.unwrap_or(0) as u64,
                    },
                ),
                Action::resolve(call, CallOutcome::rejected("queue-full")),
            ]
        }
    }

    fn on_processing_complete(
        &mut self,
        ctx: &mut ModelContext<'_>,
        call: CallId,
    ) -> Vec<Action> {
        self.active = self.active.saturating_sub(1);
        self.refresh_capacity(ctx);

        let mut actions = if ctx.lost_replica(call) {
            vec![Action::resolve(call, CallOutcome::error("node-failure"))]
        } else {
            let error_rate = self.error_rate(ctx, call);
            if ctx.rng.chance(error_rate) {
                vec![Action::resolve(call, CallOutcome::error("internal-error"))]
            } else {
                self.pipeline.start(ctx, call)
            }
        };
        actions.extend(self.drain_waiting(ctx));
        actions
    }

    fn on_child_outcome(
        &mut self,
        ctx: &mut ModelContext<'_>,
        parent: CallId,
        _child: CallId,
        outcome: &CallOutcome,
    ) -> Vec<Action> {
        self.pipeline.advance(ctx, parent, outcome)
    }

    fn on_timer(&mut self, _ctx: &mut ModelContext<'_>, _timer: &ModelTimer) -> Vec<Action> {
        Vec::new()
    }

    fn on_runtime_change(&mut self, ctx: &mut ModelContext<'_>) -> Vec<Action> {
        self.refresh_capacity(ctx);
        self.drain_waiting(ctx)
    }

    fn load(&self) -> ModelLoad {
        ModelLoad {
            queue_depth: self.waiting.len() as u64,
            active: self.active,
            capacity: self.capacity,
            queue_capacity: self.max_queue.map(u64::from),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use archsim_types::{
        ApiConfig, ColdStartSpec, HttpMethod, RateLimitSpec, ResourceSpec, SystemArchitecture,
    };

    fn single(def: ComponentDefinition) -> Harness {
        Harness::new(SystemArchitecture::new("compute").with_component(def))
    }

    #[test]
    fn test_slots_then_queue_then_reject() {
        let def = ComponentDefinition::new("svc", ComponentType::Microservice).with_resources(
            ResourceSpec {
                concurrency: 1,
                max_queue: Some(1),
                ..Default::default()
            },
        );
        let mut h = single(def.clone());
        let mut model = ComputeModel::new(&def);

        let a = h.call("svc", Operation::Read, "k", "u");
        let b = h.call("svc", Operation::Read, "k", "u");
        let c = h.call("svc", Operation::Read, "k", "u");

        let first = h.with("svc", |ctx| model.on_arrival(ctx, a));
        assert_eq!(scheduled(&first).len(), 1);
        let second = h.with("svc", |ctx| model.on_arrival(ctx, b));
        assert_eq!(emitted(&second), vec![EventKind::RequestQueued]);
        let third = h.with("svc", |ctx| model.on_arrival(ctx, c));
        assert_eq!(resolved(&third), vec![(c, CallOutcome::rejected("queue-full"))]);

        // Finishing `a` resolves it and starts `b`.
        let done = h.with("svc", |ctx| model.on_processing_complete(ctx, a));
        assert_eq!(resolved(&done), vec![(a, CallOutcome::success())]);
        assert!(emitted(&done).contains(&EventKind::RequestDequeued));
        assert_eq!(model.load().active, 1);
        assert_eq!(model.load().queue_depth, 0);
    }

    #[test]
    fn test_api_rate_limit_rejects_past_burst() {
        let def = ComponentDefinition::new("api", ComponentType::Api).with_config(
            ComponentConfig::Api(ApiConfig {
                endpoints: vec![EndpointSpec {
                    path: "/items".into(),
                    method: HttpMethod::Get,
                    latency: DistributionConfig::constant(2.0),
                    error_rate: 0.0,
                }],
                rate_limit: Some(RateLimitSpec {
                    requests_per_second: 1.0,
                    burst_size: 2.0,
                }),
            }),
        );
        let mut h = single(def.clone());
        let mut model = ComputeModel::new(&def);

        let outcomes: Vec<_> = (0..3)
            .map(|_| {
                let call = h.call("api", Operation::Read, "k", "u");
                h.with("api", |ctx| model.on_arrival(ctx, call))
            })
            .collect();
        assert_eq!(scheduled(&outcomes[0]), vec![(EventKind::ProcessingComplete, 2_000)]);
        assert!(emitted(&outcomes[2]).contains(&EventKind::RateLimitExceeded));
    }

    #[test]
    fn test_serverless_always_cold_when_probability_one() {
        let def = ComponentDefinition::new("fn", ComponentType::ServerlessFunction).with_config(
            ComponentConfig::Serverless(ServerlessConfig {
                cold_start: ColdStartSpec {
                    probability: 1.0,
                    duration_distribution: DistributionConfig::constant(300.0),
                },
                processing_latency: DistributionConfig::constant(20.0),
                ..Default::default()
            }),
        );
        let mut h = single(def.clone());
        let mut model = ComputeModel::new(&def);
        let call = h.call("fn", Operation::Read, "k", "u");

        let actions = h.with("fn", |ctx| model.on_arrival(ctx, call));
        assert!(emitted(&actions).contains(&EventKind::ColdStart));
        assert_eq!(scheduled(&actions), vec![(EventKind::ProcessingComplete, 320_000)]);
    }

    #[test]
    fn test_idempotent_component_absorbs_duplicate_writes() {
        let def = ComponentDefinition::new("idem", ComponentType::IdempotencyManager);
        let mut h = single(def.clone());
        let mut model = ComputeModel::new(&def);

        let call = h.call("idem", Operation::Write, "k", "u");
        let first = h.with("idem", |ctx| model.on_arrival(ctx, call));
        assert_eq!(scheduled(&first).len(), 1);

        // A retry of the same request carries the same idempotency key.
        let retry = h.ids.call();
        let mut copy = h.calls[&call].clone();
        copy.id = retry;
        copy.attempt = 2;
        h.calls.insert(retry, copy);
        let second = h.with("idem", |ctx| model.on_arrival(ctx, retry));
        assert_eq!(resolved(&second), vec![(retry, CallOutcome::success())]);
    }
}
