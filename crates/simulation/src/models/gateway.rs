//! API gateways: admission rate limiting, authentication and request
//! transformation in front of a pipeline of dependencies.

use archsim_core::{Action, CallOutcome, EventKind, EventPayload};
use archsim_types::{CallId, ComponentConfig, ComponentDefinition, GatewayConfig, SimTime};
use std::collections::BTreeMap;

use super::{BehaviorModel, ModelContext, ModelLoad, Pipeline};
use crate::rate_limiter::{KeyedRateLimiter, TokenBucket};

/// Cost of validating credentials that are not cached.
const AUTH_LATENCY_MS: f64 = 5.0;

#[derive(Debug)]
enum Limiter {
    Shared(Option<TokenBucket>),
    PerUser(KeyedRateLimiter),
}

#[derive(Debug)]
pub struct GatewayModel {
    config: GatewayConfig,
    limiter: Limiter,
    auth_cache: BTreeMap<String, SimTime>,
    pipeline: Pipeline,
    active: u64,
}

impl GatewayModel {
    pub fn new(def: &ComponentDefinition) -> Self {
        let config = match &def.config {
            ComponentConfig::Gateway(gw) => gw.clone(),
            _ => GatewayConfig::default(),
        };
        let limit = &config.rate_limit;
        let limiter = if limit.per_user {
            Limiter::PerUser(KeyedRateLimiter::new(
                limit.burst_size,
                limit.requests_per_second,
            ))
        } else {
            // The bucket is created on the first arrival so that it starts full.
            Limiter::Shared(None)
        };
        Self {
            config,
            limiter,
            auth_cache: BTreeMap::new(),
            pipeline: Pipeline::default(),
            active: 0,
        }
    }

    fn admit(&mut self, user: &str, now: SimTime) -> bool {
        let limit = &self.config.rate_limit;
        match &mut self.limiter {
            Limiter::PerUser(keyed) => keyed.try_acquire(user, now),
            Limiter::Shared(bucket) => bucket
                .get_or_insert_with(|| {
                    TokenBucket::new(limit.burst_size, limit.requests_per_second, now)
                })
                .try_acquire(now),
        }
    }

    fn authenticates(&self) -> bool {
        let auth = &self.config.authentication;
        auth.required || !auth.methods.is_empty()
    }

    /// Latency of checking `user`'s credentials; free while cached.
    fn auth_cost_ms(&mut self, user: &str, now: SimTime) -> f64 {
        if self
            .auth_cache
            .get(user)
            .is_some_and(|expires| *expires > now)
        {
            return 0.0;
        }
        let ttl = self.config.authentication.cache_ttl_ms;
        if ttl > 0.0 {
            self.auth_cache.insert(user.to_string(), now.plus_millis(ttl));
        }
        AUTH_LATENCY_MS
    }
}

impl BehaviorModel for GatewayModel {
    fn on_arrival(&mut self, ctx: &mut ModelContext<'_>, call: CallId) -> Vec<Action> {
        let Some((request, user)) = ctx
            .request_of(call)
            .map(|r| (r.id, r.spec.user.clone()))
        else {
            return Vec::new();
        };
        if !self.admit(&user, ctx.now) {
            return vec![
                Action::emit_for(
                    EventKind::RateLimitExceeded,
                    request,
                    EventPayload::Note {
                        detail: format!("{} over its rate limit", ctx.id.as_str()),
                    },
                ),
                Action::resolve(call, CallOutcome::rejected("rate-limited")),
            ];
        }

        let mut actions = Vec::new();
        let mut base_ms = 0.0;
        if self.authenticates() {
            base_ms += self.auth_cost_ms(&user, ctx.now);
            actions.push(Action::Authenticate { request });
        }
        let transform = &self.config.transformation;
        if transform.request_transform || transform.response_transform {
            base_ms += transform.latency_ms;
        }

        self.active += 1;
        let replica = ctx.call(call).and_then(|c| c.replica);
        let delay = ctx.service_time_us(base_ms, replica);
        actions.push(Action::after(
            EventKind::ProcessingComplete,
            delay,
            EventPayload::Call { call },
        ));
        actions
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
        self.pipeline.start(ctx, call)
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

    fn load(&self) -> ModelLoad {
        ModelLoad {
            queue_depth: 0,
            active: self.active + self.pipeline.in_flight() as u64,
            capacity: 0,
            queue_capacity: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use archsim_core::Operation;
    use archsim_types::{
        AuthMethod, AuthenticationSpec, ComponentId, ComponentType, GatewayRateLimit,
        SystemArchitecture,
    };

    fn gateway(config: GatewayConfig) -> (ComponentDefinition, Harness) {
        let def = ComponentDefinition::new("gw", ComponentType::ApiGateway)
            .with_config(ComponentConfig::Gateway(config))
            .with_dependencies(["svc"]);
        let arch = SystemArchitecture::new("gw")
            .with_component(def.clone())
            .with_component(ComponentDefinition::new("svc", ComponentType::Microservice));
        (def, Harness::new(arch))
    }

    fn limited(rps: f64, burst: f64, per_user: bool) -> GatewayConfig {
        GatewayConfig {
            rate_limit: GatewayRateLimit {
                requests_per_second: rps,
                burst_size: burst,
                per_user,
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_burst_beyond_bucket_is_rejected() {
        let (def, mut h) = gateway(limited(10.0, 10.0, false));
        let mut model = GatewayModel::new(&def);
        let mut rejected = 0;
        for _ in 0..15 {
            let call = h.call("gw", Operation::Read, "k", "u");
            let actions = h.with("gw", |ctx| model.on_arrival(ctx, call));
            if emitted(&actions).contains(&EventKind::RateLimitExceeded) {
                assert_eq!(resolved(&actions), vec![(call, CallOutcome::rejected("rate-limited"))]);
                rejected += 1;
            }
        }
        assert_eq!(rejected, 5);
    }

    #[test]
    fn test_per_user_buckets_are_independent() {
        let (def, mut h) = gateway(limited(1.0, 1.0, true));
        let mut model = GatewayModel::new(&def);
        let mut admitted = |user: &str, h: &mut Harness| {
            let call = h.call("gw", Operation::Read, "k", user);
            let actions = h.with("gw", |ctx| model.on_arrival(ctx, call));
            resolved(&actions).is_empty()
        };
        assert!(admitted("alice", &mut h));
        assert!(!admitted("alice", &mut h));
        assert!(admitted("bob", &mut h));
    }

    #[test]
    fn test_cached_credentials_skip_auth_latency() {
        let (def, mut h) = gateway(GatewayConfig {
            authentication: AuthenticationSpec {
                required: true,
                methods: vec![AuthMethod::Jwt],
                cache_ttl_ms: 60_000.0,
            },
            ..Default::default()
        });
        let mut model = GatewayModel::new(&def);

        let first = h.call("gw", Operation::Read, "k", "u");
        let cold = h.with("gw", |ctx| model.on_arrival(ctx, first));
        assert!(cold
            .iter()
            .any(|a| matches!(a, Action::Authenticate { .. })));
        assert_eq!(scheduled(&cold), vec![(EventKind::ProcessingComplete, 5_000)]);

        let second = h.call("gw", Operation::Read, "k", "u");
        let warm = h.with("gw", |ctx| model.on_arrival(ctx, second));
        assert_eq!(scheduled(&warm), vec![(EventKind::ProcessingComplete, 0)]);
    }

    #[test]
    fn test_admitted_request_goes_to_upstream() {
        let (def, mut h) = gateway(GatewayConfig::default());
        let mut model = GatewayModel::new(&def);
        let call = h.call("gw", Operation::Read, "k", "u");
        h.with("gw", |ctx| model.on_arrival(ctx, call));
        let actions = h.with("gw", |ctx| model.on_processing_complete(ctx, call));
        assert_eq!(forwarded(&actions), vec![(call, ComponentId::new("svc"))]);
    }
}
