//! Component behavior models.
//!
//! A model reacts to calls and timers on one component and answers with
//! [`Action`]s. It reads the world through a [`ModelContext`] and never
//! touches the event queue, edges, timeouts or retries itself.
//!
//! Models are selected per component from its [`BehaviorFamily`]:
//!
//! | Family        | Model                    |
//! |---------------|--------------------------|
//! | compute       | [`ComputeModel`]         |
//! | source        | [`ComputeModel`]         |
//! | queue/stream  | [`QueueModel`]           |
//! | cache/cdn     | [`CacheModel`]           |
//! | load balancer | [`LoadBalancerModel`]    |
//! | database      | [`DatabaseModel`]        |
//! | gateway       | [`GatewayModel`]         |

mod cache;
mod compute;
mod database;
mod gateway;
mod load_balancer;
mod queue;

pub use cache::CacheModel;
pub use compute::ComputeModel;
pub use database::DatabaseModel;
pub use gateway::GatewayModel;
pub use load_balancer::LoadBalancerModel;
pub use queue::QueueModel;

use archsim_core::{Action, Call, CallOutcome, ModelTimer, Request, RequestStatus};
use archsim_types::{
    BehaviorFamily, CallId, ComponentDefinition, ComponentId, DistributionConfig, RequestId,
    SimTime,
};
use std::collections::BTreeMap;

use crate::config::SimulationConfig;
use crate::distribution;
use crate::graph::ArchitectureGraph;
use crate::rng::DeterministicRng;
use crate::state::{ComponentRuntime, FaultEffects, IdAllocator, RuntimeState};

/// Instantaneous load of a component, for autoscaling and saturation.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ModelLoad {
    /// Work waiting for a slot (requests, messages, pool waiters).
    pub queue_depth: u64,
    /// Work being processed.
    pub active: u64,
    /// Processing slots; 0 when the model has no notion of slots.
    pub capacity: u64,
    /// Bound on `queue_depth`, if any.
    pub queue_capacity: Option<u64>,
}

impl ModelLoad {
    /// Busy share of processing slots, 0-1.
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            (self.active as f64 / self.capacity as f64).min(1.0)
        }
    }

    pub fn queue_utilization(&self) -> f64 {
        match self.queue_capacity {
            Some(cap) if cap > 0 => (self.queue_depth as f64 / cap as f64).min(1.0),
            _ => 0.0,
        }
    }
}

/// Durability and consistency counters kept by storage models.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StorageStats {
    pub writes_attempted: u64,
    pub writes_succeeded: u64,
    pub writes_lost: u64,
    pub stale_reads: u64,
    pub write_conflicts: u64,
    /// Every sampled replica lag, in milliseconds.
    pub replica_lag_ms: Vec<f64>,
    pub pool_in_use: u32,
    pub pool_max: u32,
}

impl StorageStats {
    pub fn mean_lag_ms(&self) -> f64 {
        if self.replica_lag_ms.is_empty() {
            0.0
        } else {
            self.replica_lag_ms.iter().sum::<f64>() / self.replica_lag_ms.len() as f64
        }
    }
}

/// Read-only view of the world handed to a model, plus the model's own
/// random stream and the id allocator.
pub struct ModelContext<'a> {
    pub now: SimTime,
    pub id: &'a ComponentId,
    pub def: &'a ComponentDefinition,
    pub graph: &'a ArchitectureGraph,
    pub state: &'a RuntimeState,
    pub config: &'a SimulationConfig,
    pub calls: &'a BTreeMap<CallId, Call>,
    pub requests: &'a BTreeMap<RequestId, Request>,
    pub rng: &'a mut DeterministicRng,
    pub ids: &'a mut IdAllocator,
}

impl ModelContext<'_> {
    pub fn runtime(&self) -> Option<&ComponentRuntime> {
        self.state.component(self.id)
    }

    pub fn call(&self, id: CallId) -> Option<&Call> {
        self.calls.get(&id)
    }

    pub fn request_of(&self, call: CallId) -> Option<&Request> {
        self.calls
            .get(&call)
            .and_then(|c| self.requests.get(&c.request))
    }

    pub fn dependencies(&self) -> &[ComponentId] {
        self.graph.dependencies_of(self.id)
    }

    pub fn effects(&self, replica: Option<usize>) -> FaultEffects {
        self.runtime()
            .map(|r| r.effects(replica))
            .unwrap_or_default()
    }

    pub fn ready_replicas(&self) -> usize {
        self.runtime()
            .map_or(0, |r| r.ready_replicas(self.now).len())
    }

    /// Draw from a distribution, in milliseconds, never negative.
    pub fn sample_ms(&mut self, dist: &DistributionConfig) -> f64 {
        distribution::sample(dist, self.rng).max(0.0)
    }

    /// Service time of `base_ms` of work on `replica`, in microseconds,
    /// after fault latency, propagated slow-downs and the latency hook.
    pub fn service_time_us(&mut self, base_ms: f64, replica: Option<usize>) -> u64 {
        let effects = self.effects(replica);
        let mut ms = base_ms.max(0.0);
        for extra in &effects.added_latency {
            ms += distribution::sample(extra, self.rng).max(0.0);
        }
        ms *= effects.latency_factor;

        let hooks = &self.def.fault_injection;
        if hooks.enabled {
            if let Some(hook) = hooks.latency_injection.as_ref().filter(|h| h.enabled) {
                if self.rng.chance(hook.percent_affected / 100.0) {
                    ms += distribution::sample(&hook.added_latency_ms, self.rng).max(0.0);
                }
            }
        }
        archsim_types::millis_to_micros(ms)
    }

    /// The replica serving `call` crashed, or the component went down,
    /// while the call was being processed.
    pub fn lost_replica(&self, call: CallId) -> bool {
        let Some(runtime) = self.runtime() else {
            return true;
        };
        if !runtime.online || runtime.has_outage() {
            return true;
        }
        self.calls
            .get(&call)
            .and_then(|c| c.replica)
            .and_then(|r| runtime.replicas.get(r))
            .is_some_and(|replica| replica.is_crashed())
    }
}

/// Contract every behavior model implements.
pub trait BehaviorModel {
    /// Called once before the first event.
    fn on_start(&mut self, _ctx: &mut ModelContext<'_>) -> Vec<Action> {
        Vec::new()
    }

    /// A call was delivered and passed the kernel's admission checks.
    fn on_arrival(&mut self, ctx: &mut ModelContext<'_>, call: CallId) -> Vec<Action>;

    /// A `processing_complete` scheduled by this model fired.
    fn on_processing_complete(&mut self, ctx: &mut ModelContext<'_>, call: CallId)
        -> Vec<Action>;

    /// A call forwarded from `parent` came back.
    fn on_child_outcome(
        &mut self,
        ctx: &mut ModelContext<'_>,
        parent: CallId,
        child: CallId,
        outcome: &CallOutcome,
    ) -> Vec<Action>;

    fn on_timer(&mut self, _ctx: &mut ModelContext<'_>, _timer: &ModelTimer) -> Vec<Action> {
        Vec::new()
    }

    /// Faults, failure modes, scaling or lifecycle changed this component.
    fn on_runtime_change(&mut self, _ctx: &mut ModelContext<'_>) -> Vec<Action> {
        Vec::new()
    }

    fn load(&self) -> ModelLoad;

    fn storage(&self) -> Option<StorageStats> {
        None
    }
}

/// The closed set of behavior models.
#[derive(Debug)]
pub enum Behavior {
    Compute(ComputeModel),
    Queue(QueueModel),
    Cache(CacheModel),
    LoadBalancer(LoadBalancerModel),
    Database(DatabaseModel),
    Gateway(GatewayModel),
}

impl Behavior {
    pub fn for_component(def: &ComponentDefinition) -> Self {
        match def.family() {
            BehaviorFamily::Compute | BehaviorFamily::Source => {
                Behavior::Compute(ComputeModel::new(def))
            }
            BehaviorFamily::Queue => Behavior::Queue(QueueModel::new(def)),
            BehaviorFamily::Cache => Behavior::Cache(CacheModel::new(def)),
            BehaviorFamily::LoadBalancer => Behavior::LoadBalancer(LoadBalancerModel::new(def)),
            BehaviorFamily::Database => Behavior::Database(DatabaseModel::new(def)),
            BehaviorFamily::Gateway => Behavior::Gateway(GatewayModel::new(def)),
        }
    }

    fn model(&mut self) -> &mut dyn BehaviorModel {
        match self {
            Behavior::Compute(m) => m,
            Behavior::Queue(m) => m,
            Behavior::Cache(m) => m,
            Behavior::LoadBalancer(m) => m,
            Behavior::Database(m) => m,
            Behavior::Gateway(m) => m,
        }
    }

    fn model_ref(&self) -> &dyn BehaviorModel {
        match self {
            Behavior::Compute(m) => m,
            Behavior::Queue(m) => m,
            Behavior::Cache(m) => m,
            Behavior::LoadBalancer(m) => m,
            Behavior::Database(m) => m,
            Behavior::Gateway(m) => m,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Behavior::Compute(_) => "compute",
            Behavior::Queue(_) => "queue",
            Behavior::Cache(_) => "cache",
            Behavior::LoadBalancer(_) => "load-balancer",
            Behavior::Database(_) => "database",
            Behavior::Gateway(_) => "gateway",
        }
    }
}

impl BehaviorModel for Behavior {
    fn on_start(&mut self, ctx: &mut ModelContext<'_>) -> Vec<Action> {
        self.model().on_start(ctx)
    }

    fn on_arrival(&mut self, ctx: &mut ModelContext<'_>, call: CallId) -> Vec<Action> {
        self.model().on_arrival(ctx, call)
    }

    fn on_processing_complete(
        &mut self,
        ctx: &mut ModelContext<'_>,
        call: CallId,
    ) -> Vec<Action> {
        self.model().on_processing_complete(ctx, call)
    }

    fn on_child_outcome(
        &mut self,
        ctx: &mut ModelContext<'_>,
        parent: CallId,
        child: CallId,
        outcome: &CallOutcome,
    ) -> Vec<Action> {
        self.model().on_child_outcome(ctx, parent, child, outcome)
    }

    fn on_timer(&mut self, ctx: &mut ModelContext<'_>, timer: &ModelTimer) -> Vec<Action> {
        self.model().on_timer(ctx, timer)
    }

    fn on_runtime_change(&mut self, ctx: &mut ModelContext<'_>) -> Vec<Action> {
        self.model().on_runtime_change(ctx)
    }

    fn load(&self) -> ModelLoad {
        self.model_ref().load()
    }

    fn storage(&self) -> Option<StorageStats> {
        self.model_ref().storage()
    }
}

/// Outcome a parent reports when a child it depends on failed.
///
/// The root deadline is the only source of a `Timeout` status; a child
/// timeout surfaces as an error of the parent.
pub fn propagate_failure(child: &CallOutcome) -> CallOutcome {
    match child.status {
        RequestStatus::Success => CallOutcome::success(),
        RequestStatus::Rejected => CallOutcome::rejected(child.error_label()),
        RequestStatus::Timeout | RequestStatus::Error => CallOutcome::error(child.error_label()),
    }
}

/// Sequential forwarding through a component's dependencies.
///
/// Each call visits the dependencies in declaration order and stops at the
/// first failure.
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    stages: BTreeMap<CallId, usize>,
}

impl Pipeline {
    pub fn start(&mut self, ctx: &ModelContext<'_>, call: CallId) -> Vec<Action> {
        match ctx.dependencies().first() {
            None => vec![Action::resolve(call, CallOutcome::success())],
            Some(first) => {
                self.stages.insert(call, 0);
                vec![Action::forward(call, first.clone())]
            }
        }
    }

    /// Continue after a child outcome. Empty if `parent` is not ours.
    pub fn advance(
        &mut self,
        ctx: &ModelContext<'_>,
        parent: CallId,
        outcome: &CallOutcome,
    ) -> Vec<Action> {
        let Some(stage) = self.stages.remove(&parent) else {
            return Vec::new();
        };
        if !outcome.is_success() {
            return vec![Action::resolve(parent, propagate_failure(outcome))];
        }
        let next = stage + 1;
        match ctx.dependencies().get(next) {
            Some(target) => {
                self.stages.insert(parent, next);
                vec![Action::forward(parent, target.clone())]
            }
            None => vec![Action::resolve(parent, CallOutcome::success())],
        }
    }

    pub fn contains(&self, call: CallId) -> bool {
        self.stages.contains_key(&call)
    }

    pub fn in_flight(&self) -> usize {
        self.stages.len()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! A hand-built context for model unit tests.

    use super::*;
    use archsim_core::{Operation, RequestSpec};
    use archsim_types::SystemArchitecture;

    pub struct Harness {
        pub graph: ArchitectureGraph,
        pub state: RuntimeState,
        pub config: SimulationConfig,
        pub calls: BTreeMap<CallId, Call>,
        pub requests: BTreeMap<RequestId, Request>,
        pub rng: DeterministicRng,
        pub ids: IdAllocator,
        pub now: SimTime,
    }

    impl Harness {
        pub fn new(architecture: SystemArchitecture) -> Self {
            let graph = match ArchitectureGraph::new(architecture) {
                Ok(graph) => graph,
                Err(e) => panic!("invalid test architecture: {e}"),
            };
            let state = RuntimeState::new(&graph, 10_000.0);
            Self {
                graph,
                state,
                config: SimulationConfig::default(),
                calls: BTreeMap::new(),
                requests: BTreeMap::new(),
                rng: DeterministicRng::from_seed_str("model-tests"),
                ids: IdAllocator::default(),
                now: SimTime::ZERO,
            }
        }

        /// Register a call of a fresh request at `component`.
        pub fn call(&mut self, component: &str, op: Operation, key: &str, user: &str) -> CallId {
            let id = self.ids.call();
            let request_id = self.ids.request();
            let spec = RequestSpec {
                op,
                key: key.to_string(),
                user: user.to_string(),
                size_bytes: 1024,
                request_type: None,
                metadata: BTreeMap::new(),
            };
            self.requests
                .insert(request_id, Request::new(request_id, self.now, spec, id));
            self.calls.insert(
                id,
                Call {
                    id,
                    request: request_id,
                    component: ComponentId::new(component),
                    parent: None,
                    edge: None,
                    caller: None,
                    op,
                    key: key.to_string(),
                    attempt: 1,
                    sent_at: self.now,
                    arrived_at: self.now,
                    started_at: None,
                    network_us: 0,
                    replica: Some(0),
                    detached: false,
                    abandoned: false,
                    outcome: None,
                },
            );
            id
        }

        pub fn with<R>(
            &mut self,
            component: &str,
            f: impl FnOnce(&mut ModelContext<'_>) -> R,
        ) -> R {
            let id = ComponentId::new(component);
            let def = match self.graph.component(&id) {
                Some(def) => def.clone(),
                None => panic!("unknown component {component}"),
            };
            let mut ctx = ModelContext {
                now: self.now,
                id: &id,
                def: &def,
                graph: &self.graph,
                state: &self.state,
                config: &self.config,
                calls: &self.calls,
                requests: &self.requests,
                rng: &mut self.rng,
                ids: &mut self.ids,
            };
            f(&mut ctx)
        }
    }

    pub fn resolved(actions: &[Action]) -> Vec<(CallId, CallOutcome)> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Resolve { call, outcome } => Some((*call, outcome.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn forwarded(actions: &[Action]) -> Vec<(CallId, ComponentId)> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Forward { from, target } => Some((*from, target.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn emitted(actions: &[Action]) -> Vec<archsim_core::EventKind> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Emit { kind, .. } => Some(*kind),
                _ => None,
            })
            .collect()
    }

    pub fn scheduled(actions: &[Action]) -> Vec<(archsim_core::EventKind, u64)> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Schedule { kind, delay_us, .. } => Some((*kind, *delay_us)),
                _ => None,
            })
            .collect()
    }
}
