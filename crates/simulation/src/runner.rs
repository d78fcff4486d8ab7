//! Simulation runner that drains the event queue.
//!
//! The runner owns every piece of run state: the queue and clock, the
//! runtime state of components and edges, the behavior models, the engines
//! (faults, propagation, failure modes, autoscaling, scenarios) and the
//! observers (metrics, invariants, causal graph). Each drained event is
//! dispatched to exactly one handler; handlers turn model [`Action`]s and
//! engine [`Followup`]s into new events.

use archsim_core::{
    Action, Call, CallOutcome, CausalOrderCheck, CheckTarget, ConservationCheck, Event, EventKind,
    EventPayload, EventTraces, FaultPhase, Operation, ReproducibilitySpec, Request,
    RequestStatus, RequestTraces, RunMetadata, RunStatus, SimulationOutput, SpanStatus, TraceSpan,
    VerificationResults,
};
use archsim_types::{
    micros_to_millis, millis_to_micros, BackoffType, CallId, ComponentConfig, ComponentDefinition,
    ComponentId, ComposedScenario, EdgeDefinition, EdgeId, EventId, FaultId, FaultInjection, Hash,
    HashStream, RequestId, SimTime, SystemArchitecture, WorkloadProfile,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

use crate::antipattern;
use crate::autoscale::{self, AutoscaleEngine};
use crate::breaker::Transition;
use crate::causal::CausalTracker;
use crate::config::SimulationConfig;
use crate::error::{ConfigError, SimulationError};
use crate::event_queue::{EventKey, EventQueue, Followup};
use crate::expression::Predicates;
use crate::failure_mode::{FailureModeEngine, ResourceUsage};
use crate::fault::{CheckOutcome, FaultChange, FaultEngine, FaultSchedule};
use crate::graph::ArchitectureGraph;
use crate::invariants::{CheckContext, InvariantChecker};
use crate::metrics::{ComponentSample, EdgeResult, MetricsCollector};
use crate::models::{Behavior, BehaviorModel, ModelContext, ModelLoad, StorageStats};
use crate::network::{self, Transit};
use crate::propagation::{self, PropagationEngine};
use crate::rng::DeterministicRng;
use crate::scenario::{Directive, ScenarioPlan, ScenarioTimeline};
use crate::snapshot::{Metric, MetricSource, StaticMetrics};
use crate::state::{FaultEffects, IdAllocator, RollingWindow, RuntimeState};

/// Poll interval of probabilistic and conditional fault rules without one.
pub const FAULT_POLL_MS: f64 = 100.0;

/// Error label of a call refused by an open circuit breaker.
const CIRCUIT_OPEN: &str = "circuit-open";

/// Share of memory a component uses with no work in flight, in percent.
const MEMORY_BASELINE_PERCENT: f64 = 20.0;

const EFFECT_STACKING: &str =
    "error rates add (capped at 1); latency factors multiply; packet loss combines as independent drops";

/// Everything a run is built from. Serialized, this is the run's
/// deterministic configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationInput {
    pub architecture: SystemArchitecture,
    /// Falls back to the architecture's default workload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workload: Option<WorkloadProfile>,
    #[serde(default)]
    pub faults: Vec<FaultInjection>,
    /// Falls back to the architecture's simulation defaults.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<SimulationConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario: Option<ComposedScenario>,
}

impl SimulationInput {
    pub fn new(architecture: SystemArchitecture) -> Self {
        Self {
            architecture,
            workload: None,
            faults: Vec::new(),
            config: None,
            scenario: None,
        }
    }

    pub fn with_workload(mut self, workload: WorkloadProfile) -> Self {
        self.workload = Some(workload);
        self
    }

    pub fn with_fault(mut self, fault: FaultInjection) -> Self {
        self.faults.push(fault);
        self
    }

    pub fn with_config(mut self, config: SimulationConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_scenario(mut self, scenario: ComposedScenario) -> Self {
        self.scenario = Some(scenario);
        self
    }
}

/// Cooperative cancellation, checked between events.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Statistics about a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimulationStats {
    /// Total events drained.
    pub events_processed: u64,
    /// Events drained by type.
    pub events_by_kind: BTreeMap<EventKind, u64>,
    /// Largest number of pending events seen.
    pub max_queue_depth: u64,
    pub requests_started: u64,
    pub requests_succeeded: u64,
    pub requests_failed: u64,
    pub requests_timed_out: u64,
    pub requests_rejected: u64,
    /// Requests without an outcome yet.
    pub requests_active: u64,
    /// Calls lost on the wire.
    pub calls_dropped: u64,
    /// Calls refused by an open breaker.
    pub calls_short_circuited: u64,
    pub retries: u64,
}

struct ModelSlot {
    behavior: Behavior,
    rng: DeterministicRng,
}

/// Where a settled call's outcome goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    /// Back over the edge, after the response path latency.
    Return,
    /// Back to the caller after a fixed delay.
    After(u64),
    /// Nowhere; only the caller's deadline notices.
    Silent,
}

/// Metric view over the runner's fields, borrowed one by one so the rest of
/// the runner stays mutable.
macro_rules! live {
    ($runner:ident) => {
        LiveMetrics {
            now: $runner.queue.now(),
            graph: &$runner.graph,
            state: &$runner.state,
            models: &$runner.models,
            global: &$runner.global,
            active_requests: $runner.stats.requests_active,
            window_us: $runner.window_us,
        }
    };
}

/// Deterministic discrete-event simulation runner.
///
/// Build one from a [`SimulationInput`], optionally attach a scenario,
/// predicates or a cancellation token, then [`run`](Self::run) it.
///
/// Given the same input, every run drains the same events in the same
/// order and produces the same output, including the trace hash.
pub struct SimulationRunner {
    graph: Arc<ArchitectureGraph>,
    config: SimulationConfig,
    deterministic_config: String,
    config_hash: Hash,
    root_rng: DeterministicRng,
    queue: EventQueue,
    end: SimTime,
    window_us: u64,

    state: RuntimeState,
    models: BTreeMap<ComponentId, ModelSlot>,
    edge_rngs: BTreeMap<EdgeId, DeterministicRng>,
    retry_rng: DeterministicRng,
    sample_rng: DeterministicRng,
    ids: IdAllocator,

    calls: BTreeMap<CallId, Call>,
    requests: BTreeMap<RequestId, Request>,
    request_calls: BTreeMap<RequestId, Vec<CallId>>,
    dequeued_at: BTreeMap<CallId, SimTime>,
    /// Deadlines callers are waiting on.
    awaiting: BTreeMap<CallId, EventKey>,

    workload: crate::workload::WorkloadGenerator,
    pending_arrival: Option<EventKey>,
    faults: FaultEngine,
    propagation: PropagationEngine,
    failure_modes: FailureModeEngine,
    autoscale: AutoscaleEngine,
    timeline: Option<ScenarioTimeline>,

    metrics: MetricsCollector,
    invariants: InvariantChecker,
    causal: CausalTracker,
    global: RollingWindow,
    /// Components whose metrics moved while handling the current event.
    touched: BTreeSet<ComponentId>,

    trace_hasher: HashStream,
    /// Drained events that still have children in the queue: drain time and
    /// pending child count.
    open_parents: BTreeMap<EventId, (SimTime, u64)>,
    causal_violations: u64,
    last_time: SimTime,
    sampled_events: Vec<Event>,
    sampled_requests: Vec<archsim_core::RequestTrace>,
    requests_sealed: u64,

    stats: SimulationStats,
    cancel: CancellationToken,
    current: Option<EventId>,
    started: bool,
    status: Option<RunStatus>,
}

impl SimulationRunner {
    /// Validate `input` and build a runner ready to start at time zero.
    pub fn new(input: SimulationInput) -> Result<Self, SimulationError> {
        let deterministic_config =
            serde_json::to_string(&input).map_err(|e| ConfigError::Encoding(e.to_string()))?;
        let config_hash = Hash::from_bytes(deterministic_config.as_bytes());

        let SimulationInput {
            architecture,
            workload,
            faults,
            config,
            scenario,
        } = input;
        let graph = ArchitectureGraph::new(architecture)?;
        let config = config.unwrap_or_else(|| SimulationConfig::from_global(graph.global()));
        config.validate()?;
        let profile = workload
            .or_else(|| graph.global().default_workload.clone())
            .ok_or_else(|| {
                ConfigError::InvalidWorkload(
                    "no workload given and the architecture declares no default".to_string(),
                )
            })?;

        let root_rng = DeterministicRng::from_seed_str(&config.seed);
        let workload = crate::workload::WorkloadGenerator::new(
            profile,
            graph.entry_components().to_vec(),
            &config,
            root_rng.fork_labeled("workload", 0),
        )?;
        let faults = FaultEngine::new(faults, &graph, &root_rng, FAULT_POLL_MS)?;
        let invariants = InvariantChecker::new(
            graph.invariants(),
            &graph,
            Predicates::default(),
            violation_cap(&config),
        )?;

        let models = graph
            .components()
            .map(|def| {
                let slot = ModelSlot {
                    behavior: Behavior::for_component(def),
                    rng: root_rng.fork_labeled(&format!("component:{}", def.id.as_str()), 0),
                };
                (def.id.clone(), slot)
            })
            .collect();
        let edge_rngs = graph
            .edges()
            .map(|edge| {
                let rng = root_rng.fork_labeled(&format!("edge:{}", edge.id.as_str()), 0);
                (edge.id.clone(), rng)
            })
            .collect();
        let metrics = MetricsCollector::new(
            graph
                .components()
                .map(|def| (def.id.clone(), def.slo.clone()))
                .collect(),
            graph.edges().map(|edge| edge.id.clone()),
            config.metrics_resolution_ms,
            config.warmup_ms,
        );

        let runner = Self {
            state: RuntimeState::new(&graph, config.rolling_window_ms),
            failure_modes: FailureModeEngine::new(&graph, &root_rng),
            autoscale: AutoscaleEngine::new(&graph),
            propagation: PropagationEngine::new(config.max_cascade_depth),
            global: RollingWindow::new(config.rolling_window_ms),
            end: SimTime::from_millis_f64(config.duration_ms),
            window_us: millis_to_micros(config.rolling_window_ms),
            retry_rng: root_rng.fork_labeled("retries", 0),
            sample_rng: root_rng.fork_labeled("sampling", 0),
            graph: Arc::new(graph),
            config,
            deterministic_config,
            config_hash,
            root_rng,
            queue: EventQueue::new(),
            models,
            edge_rngs,
            ids: IdAllocator::default(),
            calls: BTreeMap::new(),
            requests: BTreeMap::new(),
            request_calls: BTreeMap::new(),
            dequeued_at: BTreeMap::new(),
            awaiting: BTreeMap::new(),
            workload,
            pending_arrival: None,
            faults,
            timeline: None,
            metrics,
            invariants,
            causal: CausalTracker::new(),
            touched: BTreeSet::new(),
            trace_hasher: HashStream::new(),
            open_parents: BTreeMap::new(),
            causal_violations: 0,
            last_time: SimTime::ZERO,
            sampled_events: Vec::new(),
            sampled_requests: Vec::new(),
            requests_sealed: 0,
            stats: SimulationStats::default(),
            cancel: CancellationToken::new(),
            current: None,
            started: false,
            status: None,
        };

        match scenario {
            Some(scenario) => runner.with_scenario(ScenarioPlan::from(scenario)),
            None => Ok(runner),
        }
    }

    /// Replace the predicates custom invariants may name.
    pub fn with_predicates(mut self, predicates: Predicates) -> Result<Self, SimulationError> {
        self.ensure_not_started("predicates")?;
        self.invariants = InvariantChecker::new(
            self.graph.invariants(),
            &self.graph,
            predicates,
            violation_cap(&self.config),
        )?;
        Ok(self)
    }

    /// Drive a composed scenario alongside the workload.
    pub fn with_scenario(mut self, plan: ScenarioPlan) -> Result<Self, SimulationError> {
        self.ensure_not_started("scenario")?;
        plan.validate(&self.graph)?;
        for fault in plan.fault_ids() {
            if self.faults.status(fault).is_some() {
                return Err(ConfigError::InvalidScenario {
                    scenario: plan.id.clone(),
                    reason: format!("fault {} is already part of the run", fault.as_str()),
                }
                .into());
            }
        }
        for invariant in plan.invariants() {
            self.invariants.validate(invariant, &self.graph)?;
        }
        self.timeline = Some(plan.compile());
        Ok(self)
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    fn ensure_not_started(&self, what: &str) -> Result<(), SimulationError> {
        if self.started {
            return Err(ConfigError::InvalidConfig(format!(
                "cannot attach a {what} to a run that already started"
            ))
            .into());
        }
        Ok(())
    }

    pub fn now(&self) -> SimTime {
        self.queue.now()
    }

    pub fn stats(&self) -> &SimulationStats {
        &self.stats
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// Whether the run reached a terminal status.
    pub fn is_finished(&self) -> bool {
        self.status.is_some()
    }

    /// Run to completion and build the output.
    pub fn run(mut self) -> Result<SimulationOutput, SimulationError> {
        self.run_until(self.end)?;
        self.finish()
    }

    /// Drain events up to and including `until` (capped at the configured
    /// duration), or until the run stops.
    pub fn run_until(&mut self, until: SimTime) -> Result<(), SimulationError> {
        self.start()?;
        let horizon = until.min(self.end);

        while self.status.is_none() {
            if self.cancel.is_cancelled() {
                info!(at = %self.queue.now(), "simulation cancelled");
                self.status = Some(RunStatus::Cancelled {
                    at: self.queue.now(),
                });
                break;
            }

            match self.queue.peek_time() {
                Some(time) if time <= horizon => {}
                Some(time) if time <= self.end => return Ok(()),
                _ => {
                    if self.queue.now() < self.end {
                        self.queue.advance_to(self.end)?;
                    }
                    self.status = Some(RunStatus::Completed);
                    break;
                }
            }

            if let Some(max) = self.config.max_events {
                if self.stats.events_processed >= max {
                    info!(processed = self.stats.events_processed, "event budget exhausted");
                    self.status = Some(RunStatus::EventBudgetExhausted {
                        processed: self.stats.events_processed,
                    });
                    break;
                }
            }

            let Some(event) = self.queue.pop_next() else {
                continue;
            };
            self.process(event)?;

            if let Some(abort) = self.invariants.abort() {
                info!(
                    invariant = abort.invariant.as_str(),
                    at = %abort.at,
                    "simulation aborted by invariant"
                );
                self.status = Some(RunStatus::Aborted {
                    invariant_id: abort.invariant.clone(),
                    at: abort.at,
                    reason: abort.reason.clone(),
                });
            }
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Start-up
    // ═══════════════════════════════════════════════════════════════════════

    fn start(&mut self) -> Result<(), SimulationError> {
        if self.started {
            return Ok(());
        }
        self.started = true;
        info!(
            architecture = %self.graph.architecture().id,
            seed = %self.config.seed,
            duration_ms = self.config.duration_ms,
            components = self.models.len(),
            workload = self.workload.profile().kind(),
            "simulation started"
        );

        let graph = Arc::clone(&self.graph);
        for def in graph.components() {
            self.invoke(&def.id, |model, ctx| model.on_start(ctx))?;
            if !self.state.is_available(&def.id, SimTime::ZERO) {
                self.metrics.set_available(&def.id, SimTime::ZERO, false);
            }
            if let Some(start) = def.lifecycle.start_time.filter(|t| *t > 0.0) {
                let event = self
                    .event(SimTime::from_millis_f64(start), EventKind::LifecycleStart, EventPayload::None)
                    .with_target(def.id.clone());
                self.push(event)?;
            }
            if let Some(stop) = def.lifecycle.stop_time {
                let event = self
                    .event(SimTime::from_millis_f64(stop), EventKind::LifecycleStop, EventPayload::None)
                    .with_target(def.id.clone());
                self.push(event)?;
            }
        }
        self.refresh_system_availability();

        for schedule in self.faults.initial_schedule() {
            self.schedule_fault(schedule)?;
        }
        let followups = self.failure_modes.initial_schedule(&graph);
        self.schedule_followups(followups)?;
        let followups = self.autoscale.initial_schedule();
        self.schedule_followups(followups)?;
        let followups = self.invariants.initial_schedule();
        self.schedule_followups(followups)?;
        if let Some(timeline) = self.timeline.as_mut() {
            let followups = timeline.start(SimTime::ZERO);
            self.schedule_followups(followups)?;
        }

        let first = SimTime::from_millis_f64(self.config.metrics_resolution_ms);
        if first <= self.end {
            let event = self.event(first, EventKind::MetricsSnapshot, EventPayload::None);
            self.push(event)?;
        }
        self.schedule_next_arrival()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Scheduling
    // ═══════════════════════════════════════════════════════════════════════

    /// A new event caused by the event being handled.
    fn event(&mut self, at: SimTime, kind: EventKind, payload: EventPayload) -> Event {
        Event::new(self.queue.next_id(), at, kind, payload).caused_by(self.current)
    }

    fn push(&mut self, event: Event) -> Result<EventKey, SimulationError> {
        let parent = event.caused_by;
        let key = self.queue.schedule(event)?;
        if let Some(entry) = parent.and_then(|p| self.open_parents.get_mut(&p)) {
            entry.1 += 1;
        }
        Ok(key)
    }

    /// Drop a pending event.
    fn cancel_event(&mut self, key: &EventKey) {
        if let Some(parent) = self.queue.cancel(key).and_then(|e| e.caused_by) {
            self.child_settled(parent);
        }
    }

    /// A child of `parent` was drained or cancelled.
    fn child_settled(&mut self, parent: EventId) {
        let Some(entry) = self.open_parents.get_mut(&parent) else {
            return;
        };
        entry.1 = entry.1.saturating_sub(1);
        if entry.1 == 0 && self.current != Some(parent) {
            self.open_parents.remove(&parent);
        }
    }

    fn schedule_followups(&mut self, followups: Vec<Followup>) -> Result<(), SimulationError> {
        for followup in followups {
            let Followup {
                at,
                kind,
                target,
                payload,
            } = followup;
            let mut event = self.event(at, kind, payload);
            let breaker_ends = match &event.data {
                EventPayload::Breaker { edge, .. } => self
                    .graph
                    .edge(edge)
                    .map(|def| (def.source.clone(), def.target.clone())),
                _ => None,
            };
            match breaker_ends {
                Some((source, edge_target)) => {
                    event.source = Some(source);
                    event.target = Some(target.unwrap_or(edge_target));
                }
                None => event.target = target,
            }
            self.push(event)?;
        }
        Ok(())
    }

    fn schedule_fault(&mut self, schedule: FaultSchedule) -> Result<(), SimulationError> {
        let event = self.event(
            schedule.at,
            schedule.kind,
            EventPayload::Fault {
                fault: schedule.fault,
                phase: schedule.phase,
            },
        );
        self.push(event).map(|_| ())
    }

    fn schedule_next_arrival(&mut self) -> Result<(), SimulationError> {
        self.pending_arrival = None;
        let Some(arrival) = self.workload.next_arrival(self.end) else {
            return Ok(());
        };
        let event = self
            .event(
                arrival.at,
                EventKind::RequestArrival,
                EventPayload::Arrival { spec: arrival.spec },
            )
            .with_target(arrival.entry);
        self.pending_arrival = Some(self.push(event)?);
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Event dispatch
    // ═══════════════════════════════════════════════════════════════════════

    fn process(&mut self, event: Event) -> Result<(), SimulationError> {
        self.observe(&event)?;
        self.current = Some(event.id);
        trace!(
            id = %event.id,
            kind = event.kind.as_str(),
            time = %event.time,
            target = event.target.as_ref().map(|t| t.as_str()),
            "drain"
        );

        let Event {
            kind, target, data, ..
        } = event;

        if let EventPayload::Message { .. } = &data {
            let live = live!(self);
            let ctx = CheckContext {
                now: self.queue.now(),
                metrics: &live,
                active_causes: self.causal.active_causes(),
            };
            self.invariants.on_delivery(&data, &ctx);
            if let Some(component) = &target {
                self.metrics.record_dequeue(component);
            }
        }

        match data {
            EventPayload::Arrival { spec } => {
                self.schedule_next_arrival()?;
                if let Some(entry) = target {
                    self.start_request(entry, spec)?;
                }
            }
            EventPayload::Call { call } => match kind {
                EventKind::RequestArrival => self.admit(call)?,
                EventKind::ProcessingComplete => {
                    if let Some(component) = target {
                        self.invoke(&component, |model, ctx| {
                            model.on_processing_complete(ctx, call)
                        })?;
                    }
                }
                EventKind::RequestDequeued => {
                    self.dequeued_at.insert(call, self.queue.now());
                    if let Some(component) = &target {
                        self.metrics.record_dequeue(component);
                    }
                }
                _ => {}
            },
            EventPayload::Outcome { call, outcome } => self.deliver_outcome(call, outcome, false)?,
            EventPayload::Timeout { call } => self.on_timeout(call)?,
            EventPayload::Retry {
                parent,
                edge,
                attempt,
            } => self.retry(parent, edge, attempt)?,
            EventPayload::Timer { timer } => {
                if let Some(component) = target {
                    self.invoke(&component, |model, ctx| model.on_timer(ctx, &timer))?;
                }
            }
            EventPayload::Fault { fault, phase } => self.on_fault(kind, fault, phase)?,
            EventPayload::Propagation {
                cause,
                rule,
                target: affected,
                effect,
                depth,
                visited,
            } => {
                let now = self.queue.now();
                let components: Vec<ComponentId> = self.graph.component_ids().cloned().collect();
                let snapshot = capture(&live!(self), &components);
                let (followups, changed) = self.propagation.apply(
                    &cause,
                    rule,
                    &affected,
                    &effect,
                    depth,
                    &visited,
                    now,
                    &self.graph,
                    &mut self.state,
                    &snapshot,
                );
                self.schedule_followups(followups)?;
                self.runtime_changed(&changed)?;
            }
            EventPayload::PropagationCleared { cause } => {
                let now = self.queue.now();
                debug!(
                    component = cause.component.as_str(),
                    "propagation rule cleared"
                );
                let (followups, changed) = self.propagation.clear(&cause, now, &mut self.state);
                self.schedule_followups(followups)?;
                self.runtime_changed(&changed)?;
            }
            EventPayload::Check { target: check } => self.on_check(check)?,
            EventPayload::Breaker { edge, .. } => {
                if kind == EventKind::CircuitOpen {
                    self.metrics.record_breaker_open(&edge);
                }
            }
            EventPayload::Scale { .. } => {
                if kind == EventKind::ScaleComplete {
                    if let Some(component) = target {
                        self.runtime_changed(&[component])?;
                    }
                }
            }
            EventPayload::Deployment { version } => {
                if let Some(component) = target {
                    match kind {
                        EventKind::DeploymentStart => self.start_deployment(component, version)?,
                        EventKind::DeploymentComplete => {
                            self.complete_deployment(component, version)?
                        }
                        _ => {}
                    }
                }
            }
            EventPayload::Step { index } => self.on_step(index)?,
            EventPayload::None => match kind {
                EventKind::LifecycleStart | EventKind::LifecycleStop => {
                    if let Some(component) = target {
                        self.on_lifecycle(component, kind == EventKind::LifecycleStart)?;
                    }
                }
                EventKind::MetricsSnapshot => self.on_snapshot()?,
                EventKind::HealthCheck => {
                    if let Some(component) = target {
                        self.runtime_changed(&[component])?;
                    }
                }
                _ => self.on_notification(kind, target.as_ref()),
            },
            EventPayload::Note { .. } => self.on_notification(kind, target.as_ref()),
            EventPayload::Failover { .. }
            | EventPayload::Backlog { .. }
            | EventPayload::Message { .. }
            | EventPayload::Cache { .. } => {}
        }

        self.flush_touched()?;
        self.stats.max_queue_depth = self.stats.max_queue_depth.max(self.queue.len() as u64);
        if let Some(id) = self.current.take() {
            if self.open_parents.get(&id).is_some_and(|(_, pending)| *pending == 0) {
                self.open_parents.remove(&id);
            }
        }
        Ok(())
    }

    /// Bookkeeping every drained event goes through, sampled or not.
    fn observe(&mut self, event: &Event) -> Result<(), SimulationError> {
        let ordered = event.time >= self.last_time
            && event.caused_by.map_or(true, |parent| {
                self.open_parents
                    .get(&parent)
                    .is_some_and(|(at, _)| *at <= event.time)
            });
        if !ordered {
            self.causal_violations += 1;
        }
        self.last_time = event.time;
        if let Some(parent) = event.caused_by {
            self.child_settled(parent);
        }
        self.open_parents.insert(event.id, (event.time, 0));

        let bytes = serde_json::to_vec(event).map_err(|e| ConfigError::Encoding(e.to_string()))?;
        self.trace_hasher.update(&bytes);

        self.causal.observe(event);
        self.stats.events_processed += 1;
        *self.stats.events_by_kind.entry(event.kind).or_insert(0) += 1;
        if keep(&mut self.sample_rng, self.config.trace_sampling_rate) {
            self.sampled_events.push(event.clone());
        }
        Ok(())
    }

    /// Run a model hook on `component` and apply what it asks for.
    fn invoke<F>(&mut self, component: &ComponentId, hook: F) -> Result<(), SimulationError>
    where
        F: FnOnce(&mut Behavior, &mut ModelContext<'_>) -> Vec<Action>,
    {
        let graph = Arc::clone(&self.graph);
        let Some(def) = graph.component(component) else {
            return Ok(());
        };
        let Some(slot) = self.models.get_mut(component) else {
            return Ok(());
        };
        let mut ctx = ModelContext {
            now: self.queue.now(),
            id: &def.id,
            def,
            graph: &graph,
            state: &self.state,
            config: &self.config,
            calls: &self.calls,
            requests: &self.requests,
            rng: &mut slot.rng,
            ids: &mut self.ids,
        };
        let actions = hook(&mut slot.behavior, &mut ctx);
        self.apply_actions(component, actions)
    }

    fn apply_actions(
        &mut self,
        acting: &ComponentId,
        actions: Vec<Action>,
    ) -> Result<(), SimulationError> {
        let now = self.queue.now();
        for action in actions {
            match action {
                Action::Schedule {
                    kind,
                    delay_us,
                    payload,
                } => {
                    let request = match &payload {
                        EventPayload::Call { call } => self.calls.get(call).map(|c| c.request),
                        _ => None,
                    };
                    let mut event = self
                        .event(now.plus_micros(delay_us), kind, payload)
                        .with_target(acting.clone());
                    event.request = request;
                    self.push(event)?;
                }
                Action::Forward { from, target } => self.forward(from, acting, target)?,
                Action::Open {
                    call,
                    request,
                    op,
                    key,
                } => self.open_holder(call, request, op, key, acting),
                Action::Resolve { call, outcome } => self.settle_call(call, outcome, Route::Return)?,
                Action::Emit {
                    kind,
                    request,
                    payload,
                } => {
                    let mut event = self
                        .event(now, kind, payload)
                        .with_source(acting.clone())
                        .with_target(acting.clone());
                    event.request = request;
                    self.push(event)?;
                }
                Action::Authenticate { request } => {
                    if let Some(request) = self.requests.get_mut(&request) {
                        request.authenticated = true;
                    }
                }
                Action::RecordWrite { call } => {
                    let Some(request) = self
                        .calls
                        .get(&call)
                        .and_then(|c| self.requests.get(&c.request))
                    else {
                        continue;
                    };
                    let live = live!(self);
                    let ctx = CheckContext {
                        now,
                        metrics: &live,
                        active_causes: self.causal.active_causes(),
                    };
                    self.invariants.on_write(acting, request, &ctx);
                }
            }
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Requests and calls
    // ═══════════════════════════════════════════════════════════════════════

    fn start_request(
        &mut self,
        entry: ComponentId,
        spec: archsim_core::RequestSpec,
    ) -> Result<(), SimulationError> {
        let now = self.queue.now();
        let id = self.ids.request();
        let root = self.ids.call();
        let mut request = Request::new(id, now, spec, root);
        request.outstanding = 1;
        let call = Call {
            id: root,
            request: id,
            component: entry.clone(),
            parent: None,
            edge: None,
            caller: None,
            op: request.spec.op,
            key: request.spec.key.clone(),
            attempt: 1,
            sent_at: now,
            arrived_at: now,
            started_at: None,
            network_us: 0,
            replica: None,
            detached: false,
            abandoned: false,
            outcome: None,
        };
        self.requests.insert(id, request);
        self.calls.insert(root, call);
        self.request_calls.insert(id, vec![root]);
        self.stats.requests_started += 1;
        self.stats.requests_active += 1;

        let deadline = now.plus_millis(self.graph.global().timeouts.default_request_timeout_ms);
        let event = self
            .event(deadline, EventKind::RequestTimeout, EventPayload::Timeout { call: root })
            .with_target(entry)
            .with_request(id);
        let key = self.push(event)?;
        self.awaiting.insert(root, key);

        self.admit(root)
    }

    /// Register a call a component opens on its own behalf.
    fn open_holder(
        &mut self,
        id: CallId,
        request: RequestId,
        op: Operation,
        key: String,
        acting: &ComponentId,
    ) {
        let now = self.queue.now();
        let Some(owner) = self.requests.get_mut(&request) else {
            return;
        };
        owner.outstanding += 1;
        self.request_calls.entry(request).or_default().push(id);
        self.calls.insert(
            id,
            Call {
                id,
                request,
                component: acting.clone(),
                parent: None,
                edge: None,
                caller: None,
                op,
                key,
                attempt: 1,
                sent_at: now,
                arrived_at: now,
                started_at: Some(now),
                network_us: 0,
                replica: None,
                detached: false,
                abandoned: false,
                outcome: None,
            },
        );
    }

    /// A call opened by its own component rather than sent by a caller.
    fn is_holder(&self, call: &Call) -> bool {
        call.parent.is_none()
            && self
                .requests
                .get(&call.request)
                .is_some_and(|r| r.root != call.id)
    }

    /// Create a child of `parent` bound for `target`.
    fn spawn(
        &mut self,
        parent: CallId,
        target: ComponentId,
        edge: Option<EdgeId>,
        attempt: u32,
        detached: bool,
    ) -> Option<CallId> {
        let now = self.queue.now();
        let (request, caller, op, key) = {
            let parent = self.calls.get(&parent)?;
            (
                parent.request,
                parent.component.clone(),
                parent.op,
                parent.key.clone(),
            )
        };
        let id = self.ids.call();
        self.requests.get_mut(&request)?.outstanding += 1;
        self.request_calls.entry(request).or_default().push(id);
        self.calls.insert(
            id,
            Call {
                id,
                request,
                component: target,
                parent: Some(parent),
                edge,
                caller: Some(caller),
                op,
                key,
                attempt,
                sent_at: now,
                arrived_at: now,
                started_at: None,
                network_us: 0,
                replica: None,
                detached,
                abandoned: false,
                outcome: None,
            },
        );
        Some(id)
    }

    fn forward(
        &mut self,
        from: CallId,
        caller: &ComponentId,
        target: ComponentId,
    ) -> Result<(), SimulationError> {
        let Some(parent) = self.calls.get(&from) else {
            return Ok(());
        };
        if parent.is_resolved() {
            return Ok(());
        }
        let holder = self.is_holder(parent);
        let edge = self.graph.edge_to(caller, &target);
        let detached = !holder && edge.is_some_and(|e| e.is_async());
        let edge = edge.map(|e| e.id.clone());
        let Some(child) = self.spawn(from, target, edge, 1, detached) else {
            return Ok(());
        };
        self.send(child)
    }

    fn retry(&mut self, parent: CallId, edge: EdgeId, attempt: u32) -> Result<(), SimulationError> {
        if self.calls.get(&parent).map_or(true, |c| c.is_resolved()) {
            return Ok(());
        }
        let Some(target) = self.graph.edge(&edge).map(|e| e.target.clone()) else {
            return Ok(());
        };
        trace!(call = %parent, edge = edge.as_str(), attempt, "retrying call");
        let Some(child) = self.spawn(parent, target, Some(edge), attempt, false) else {
            return Ok(());
        };
        self.send(child)
    }

    /// Put a call on the wire towards its component.
    fn send(&mut self, child: CallId) -> Result<(), SimulationError> {
        let now = self.queue.now();
        let Some(call) = self.calls.get(&child) else {
            return Ok(());
        };
        let (parent, target, request, detached) =
            (call.parent, call.component.clone(), call.request, call.detached);
        let graph = Arc::clone(&self.graph);
        let Some(edge) = call.edge.as_ref().and_then(|id| graph.edge(id)) else {
            return self.schedule_arrival(child, now);
        };

        self.metrics.record_edge_call(&edge.id);
        if detached {
            if let (Some(parent), Some(caller)) = (parent, self.calls.get(&child).and_then(|c| c.caller.clone())) {
                let ack = self
                    .event(
                        now,
                        EventKind::RequestForwarded,
                        EventPayload::Outcome {
                            call: child,
                            outcome: CallOutcome::success(),
                        },
                    )
                    .with_target(caller)
                    .with_request(request);
                trace!(call = %child, parent = %parent, "asynchronous send acknowledged");
                self.push(ack)?;
            }
        }

        if !self.admit_on_edge(edge)? {
            self.stats.calls_short_circuited += 1;
            self.metrics
                .record_edge_result(&edge.id, EdgeResult::ShortCircuited, None);
            return self.settle_call(child, CallOutcome::rejected(CIRCUIT_OPEN), Route::After(0));
        }

        let effects = self.transit_effects(edge);
        let region = |id: &ComponentId| graph.component(id).map(|c| c.region.as_str()).unwrap_or("");
        let partitioned =
            network::is_partitioned(&self.state, edge, region(&edge.source), region(&edge.target));
        let size_bytes = self.requests.get(&request).map_or(0, |r| r.spec.size_bytes);
        let rng = self
            .edge_rngs
            .entry(edge.id.clone())
            .or_insert_with(|| self.root_rng.fork_labeled(&format!("edge:{}", edge.id.as_str()), 0));

        match network::transit(edge, &effects, partitioned, size_bytes, rng) {
            Transit::Delivered { latency_us, .. } => {
                if let Some(call) = self.calls.get_mut(&child) {
                    call.network_us = latency_us;
                }
                if !detached {
                    self.arm_deadline(child, &target)?;
                }
                self.schedule_arrival(child, now.plus_micros(latency_us))
            }
            Transit::Dropped => {
                self.stats.calls_dropped += 1;
                self.metrics
                    .record_edge_result(&edge.id, EdgeResult::Dropped, None);
                if !detached {
                    self.arm_deadline(child, &target)?;
                }
                self.settle_call(child, CallOutcome::error("dropped"), Route::Silent)
            }
            Transit::Refused => {
                self.settle_call(child, CallOutcome::error("partitioned"), Route::After(0))
            }
            Transit::Failed { error, latency_us } => {
                self.settle_call(child, CallOutcome::error(error), Route::After(latency_us))
            }
        }
    }

    /// Ask the edge's breaker, or a propagation rule holding it open,
    /// whether a call may pass.
    fn admit_on_edge(&mut self, edge: &EdgeDefinition) -> Result<bool, SimulationError> {
        let now = self.queue.now();
        let Some(runtime) = self.state.edges.get_mut(&edge.id) else {
            return Ok(true);
        };
        if !runtime.forced.is_empty() {
            return Ok(false);
        }
        let Some(breaker) = runtime.breaker.as_mut() else {
            return Ok(true);
        };
        let (admitted, transition) = breaker.admit(now);
        if let Some(transition) = transition {
            self.breaker_event(edge, transition)?;
        }
        Ok(admitted)
    }

    fn breaker_event(
        &mut self,
        edge: &EdgeDefinition,
        transition: Transition,
    ) -> Result<(), SimulationError> {
        let kind = match transition {
            Transition::Opened => EventKind::CircuitOpen,
            Transition::HalfOpened => EventKind::CircuitHalfOpen,
            Transition::Closed => EventKind::CircuitClose,
        };
        let state = self
            .state
            .edges
            .get(&edge.id)
            .and_then(|e| e.breaker.as_ref())
            .map_or("closed", |b| b.state().as_str());
        debug!(edge = edge.id.as_str(), state, "circuit breaker transition");
        let event = self
            .event(
                self.queue.now(),
                kind,
                EventPayload::Breaker {
                    edge: edge.id.clone(),
                    state: state.to_string(),
                },
            )
            .with_source(edge.source.clone())
            .with_target(edge.target.clone());
        self.push(event).map(|_| ())
    }

    /// Edge faults plus wire-level faults on the receiving component.
    fn transit_effects(&self, edge: &EdgeDefinition) -> FaultEffects {
        let mut effects = self
            .state
            .edges
            .get(&edge.id)
            .map(|e| e.effects())
            .unwrap_or_default();
        if let Some(target) = self.state.component(&edge.target) {
            let local = target.effects(None);
            effects.packet_loss = 1.0 - (1.0 - effects.packet_loss) * (1.0 - local.packet_loss);
            effects.bandwidth_mbps = match (effects.bandwidth_mbps, local.bandwidth_mbps) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
        }
        effects
    }

    fn arm_deadline(&mut self, call: CallId, target: &ComponentId) -> Result<(), SimulationError> {
        let timeout_ms = match self.graph.component(target).map(|def| &def.config) {
            Some(ComponentConfig::Serverless(serverless)) if serverless.timeout > 0.0 => {
                serverless.timeout
            }
            _ => self.graph.global().timeouts.default_request_timeout_ms,
        };
        let Some(caller) = self.calls.get(&call).and_then(|c| c.caller.clone()) else {
            return Ok(());
        };
        let request = self.calls.get(&call).map(|c| c.request);
        let mut event = self
            .event(
                self.queue.now().plus_millis(timeout_ms),
                EventKind::RequestTimeout,
                EventPayload::Timeout { call },
            )
            .with_target(caller);
        event.request = request;
        let key = self.push(event)?;
        self.awaiting.insert(call, key);
        Ok(())
    }

    fn schedule_arrival(&mut self, call: CallId, at: SimTime) -> Result<(), SimulationError> {
        let Some(record) = self.calls.get_mut(&call) else {
            return Ok(());
        };
        record.arrived_at = at;
        let (component, caller, request) =
            (record.component.clone(), record.caller.clone(), record.request);
        let mut event = self
            .event(at, EventKind::RequestArrival, EventPayload::Call { call })
            .with_target(component)
            .with_request(request);
        event.source = caller;
        self.push(event).map(|_| ())
    }

    /// A call reached its component: kernel-level checks, then the model.
    fn admit(&mut self, id: CallId) -> Result<(), SimulationError> {
        let now = self.queue.now();
        let Some(call) = self.calls.get(&id) else {
            return Ok(());
        };
        if call.is_resolved() {
            return Ok(());
        }
        let component = call.component.clone();
        let caller = call.caller.clone();
        if let Some(request) = self.requests.get(&call.request) {
            let live = live!(self);
            let ctx = CheckContext {
                now,
                metrics: &live,
                active_causes: self.causal.active_causes(),
            };
            self.invariants
                .on_arrival(&component, caller.as_ref(), request, &self.graph, &ctx);
        }

        let replica = self.state.component_mut(&component).and_then(|runtime| {
            if runtime.online && !runtime.has_outage() {
                runtime.pick_replica(now)
            } else {
                None
            }
        });
        if let Some(call) = self.calls.get_mut(&id) {
            call.started_at = Some(now);
            call.arrived_at = now;
            call.replica = replica;
        }
        self.metrics.call_started(id, &component, now);

        let Some(replica) = replica else {
            return self.settle_call(id, CallOutcome::error("unavailable"), Route::Return);
        };
        if let Some(outcome) = self.injected_failure(&component, replica) {
            return self.settle_call(id, outcome, Route::Return);
        }
        self.invoke(&component, |model, ctx| model.on_arrival(ctx, id))
    }

    /// Failures the component's faults and fault hooks impose on an
    /// arriving call.
    fn injected_failure(&mut self, component: &ComponentId, replica: usize) -> Option<CallOutcome> {
        let effects = self.state.component(component)?.effects(Some(replica));
        if effects.reject {
            return Some(CallOutcome::rejected("load-shed"));
        }
        if effects.dns_failure {
            return Some(CallOutcome::error("dns-failure"));
        }
        if effects.certificate_expired {
            return Some(CallOutcome::error("certificate-expired"));
        }
        let rng = &mut self.models.get_mut(component)?.rng;
        if effects.error_rate > 0.0 && rng.chance(effects.error_rate) {
            let code = effects
                .error_code
                .unwrap_or_else(|| "injected-error".to_string());
            return Some(CallOutcome::error(code));
        }
        let hooks = &self.graph.component(component)?.fault_injection;
        let hook = hooks
            .error_injection
            .as_ref()
            .filter(|hook| hooks.enabled && hook.enabled)?;
        if !rng.chance(hook.error_rate) {
            return None;
        }
        let code = if hook.error_types.is_empty() {
            "injected-error".to_string()
        } else {
            hook.error_types[rng.below(hook.error_types.len())].clone()
        };
        Some(CallOutcome::error(code))
    }

    /// Finish a call at its component and send the outcome on its way.
    fn settle_call(
        &mut self,
        id: CallId,
        outcome: CallOutcome,
        route: Route,
    ) -> Result<(), SimulationError> {
        let now = self.queue.now();
        let Some(record) = self.calls.get_mut(&id) else {
            return Ok(());
        };
        if record.outcome.is_some() {
            return Ok(());
        }
        record.outcome = Some(outcome.clone());
        let call = record.clone();
        let holder = self.is_holder(&call);

        let (user, counted) = self.requests.get(&call.request).map_or_else(
            || (String::new(), false),
            |r| {
                let warmup = SimTime::from_millis_f64(self.config.warmup_ms);
                (r.spec.user.clone(), r.created_at >= warmup)
            },
        );
        self.metrics.call_finished(
            id,
            now,
            outcome.status,
            outcome.error_type.as_deref(),
            &user,
            counted,
        );

        if let Some(started) = call.started_at {
            if !holder {
                if let Some(runtime) = self.state.component_mut(&call.component) {
                    runtime
                        .window
                        .record(now, now.micros_since(started), !outcome.is_success());
                }
                self.touched.insert(call.component.clone());
            }
            let span = self.span(&call, started, &outcome);
            if let Some(request) = self.requests.get_mut(&call.request) {
                request.spans.push(span);
            }
        }
        if let Some(request) = self.requests.get_mut(&call.request) {
            request.outstanding = request.outstanding.saturating_sub(1);
        }

        if call.detached {
            if let Some(edge) = &call.edge {
                if outcome.error_type.as_deref() != Some(CIRCUIT_OPEN) {
                    let result = if outcome.is_success() {
                        EdgeResult::Success
                    } else {
                        EdgeResult::Failure
                    };
                    self.metrics
                        .record_edge_result(edge, result, Some(call.network_us));
                }
            }
        } else if let (Some(_), Some(caller)) = (call.parent, call.caller.clone()) {
            let delay = match route {
                Route::Silent => None,
                Route::After(delay) => Some(delay),
                Route::Return => Some(self.return_latency(call.edge.as_ref())),
            };
            if let Some(delay) = delay {
                let event = self
                    .event(
                        now.plus_micros(delay),
                        outcome_kind(outcome.status),
                        EventPayload::Outcome {
                            call: id,
                            outcome: outcome.clone(),
                        },
                    )
                    .with_source(call.component.clone())
                    .with_target(caller)
                    .with_request(call.request);
                self.push(event)?;
            }
        } else if !holder {
            if let Some(key) = self.awaiting.remove(&id) {
                self.cancel_event(&key);
            }
            self.finish_request(call.request, &outcome);
        }

        self.maybe_seal(call.request);
        Ok(())
    }

    fn return_latency(&mut self, edge: Option<&EdgeId>) -> u64 {
        let Some(edge) = edge.and_then(|id| self.graph.edge(id)) else {
            return 0;
        };
        let effects = self
            .state
            .edges
            .get(&edge.id)
            .map(|e| e.effects())
            .unwrap_or_default();
        match self.edge_rngs.get_mut(&edge.id) {
            Some(rng) => network::return_latency_us(edge, &effects, rng),
            None => 0,
        }
    }

    fn span(&self, call: &Call, started: SimTime, outcome: &CallOutcome) -> TraceSpan {
        let now = self.queue.now();
        let dequeued = self
            .dequeued_at
            .get(&call.id)
            .copied()
            .unwrap_or(started)
            .clamp(started, now);
        let mut tags = BTreeMap::new();
        tags.insert("attempt".to_string(), call.attempt.to_string());
        if let Some(replica) = call.replica {
            tags.insert("replica".to_string(), replica.to_string());
        }
        if let Some(edge) = &call.edge {
            tags.insert("edge".to_string(), edge.as_str().to_string());
        }
        TraceSpan {
            span_id: format!("span-{}", call.id.0),
            parent_span_id: call.parent.map(|p| format!("span-{}", p.0)),
            component_id: call.component.clone(),
            operation_name: call.op.as_str().to_string(),
            start_time: started,
            end_time: now,
            duration_ms: micros_to_millis(now.micros_since(started)),
            queue_time_ms: micros_to_millis(dequeued.micros_since(started)),
            processing_time_ms: micros_to_millis(now.micros_since(dequeued)),
            network_time_ms: micros_to_millis(call.network_us),
            status: if outcome.is_success() {
                SpanStatus::Ok
            } else {
                SpanStatus::Error
            },
            error_type: outcome.error_type.clone(),
            tags,
        }
    }

    /// A child's outcome reached its caller.
    fn deliver_outcome(
        &mut self,
        child: CallId,
        outcome: CallOutcome,
        via_timeout: bool,
    ) -> Result<(), SimulationError> {
        let now = self.queue.now();
        let Some(call) = self.calls.get(&child) else {
            return Ok(());
        };
        let (Some(parent), Some(caller)) = (call.parent, call.caller.clone()) else {
            return Ok(());
        };
        if call.detached {
            return self.invoke(&caller, |model, ctx| {
                model.on_child_outcome(ctx, parent, child, &outcome)
            });
        }
        if call.abandoned && !via_timeout {
            return Ok(());
        }
        let (component, edge_id, attempt, network_us, request) = (
            call.component.clone(),
            call.edge.clone(),
            call.attempt,
            call.network_us,
            call.request,
        );
        if !via_timeout {
            if let Some(key) = self.awaiting.remove(&child) {
                self.cancel_event(&key);
            }
        }

        let short_circuited = outcome.error_type.as_deref() == Some(CIRCUIT_OPEN);
        let graph = Arc::clone(&self.graph);
        let edge = edge_id.as_ref().and_then(|id| graph.edge(id));
        if let Some(edge) = edge.filter(|_| !short_circuited) {
            if !via_timeout {
                let result = if outcome.is_success() {
                    EdgeResult::Success
                } else {
                    EdgeResult::Failure
                };
                self.metrics
                    .record_edge_result(&edge.id, result, Some(network_us));
            }
            let transition = self
                .state
                .edges
                .get_mut(&edge.id)
                .and_then(|e| e.breaker.as_mut())
                .and_then(|b| b.record(outcome.is_success(), now));
            if let Some(transition) = transition {
                self.breaker_event(edge, transition)?;
            }
        }

        if !outcome.is_success() {
            if let Some(runtime) = self.state.component_mut(&caller) {
                runtime.window.record_child_failure(now, component);
            }
            self.touched.insert(caller.clone());

            if let Some(edge) = edge.filter(|_| !short_circuited) {
                if let Some(delay_ms) = self.retry_delay(edge, attempt, &outcome) {
                    if let Some(request) = self.requests.get_mut(&request) {
                        request.retries += 1;
                    }
                    self.metrics.record_retry(&edge.id);
                    self.stats.retries += 1;
                    let event = self
                        .event(
                            now.plus_millis(delay_ms),
                            EventKind::RequestRetry,
                            EventPayload::Retry {
                                parent,
                                edge: edge.id.clone(),
                                attempt: attempt + 1,
                            },
                        )
                        .with_target(caller)
                        .with_request(request);
                    self.push(event)?;
                    return Ok(());
                }
            }
        }

        self.invoke(&caller, |model, ctx| {
            model.on_child_outcome(ctx, parent, child, &outcome)
        })
    }

    /// Backoff before the next attempt over `edge`, if the failure is
    /// retried. The edge's own policy wins over the global one.
    fn retry_delay(
        &mut self,
        edge: &EdgeDefinition,
        attempt: u32,
        outcome: &CallOutcome,
    ) -> Option<f64> {
        let global = &self.graph.global().retry_policy;
        let exponent = attempt.saturating_sub(1).min(30) as i32;
        let (max_attempts, delay_ms) = match &edge.retry {
            Some(policy) if policy.enabled => {
                if !policy.retryable_errors.is_empty()
                    && !policy
                        .retryable_errors
                        .iter()
                        .any(|e| e == outcome.error_label())
                {
                    return None;
                }
                let factor = policy.backoff_multiplier.max(1.0).powi(exponent);
                (policy.max_attempts, policy.backoff_ms * factor)
            }
            Some(_) => return None,
            None => {
                let delay = match global.backoff_type {
                    BackoffType::Exponential => global.base_delay_ms * 2f64.powi(exponent),
                    BackoffType::Linear => global.base_delay_ms * attempt as f64,
                    BackoffType::Constant => global.base_delay_ms,
                };
                (global.max_attempts, delay)
            }
        };
        if attempt >= max_attempts {
            return None;
        }
        let mut delay_ms = delay_ms.max(0.0);
        if global.max_delay_ms > 0.0 {
            delay_ms = delay_ms.min(global.max_delay_ms);
        }
        let jitter = global.jitter_factor.clamp(0.0, 1.0);
        if jitter > 0.0 {
            delay_ms *= 1.0 + jitter * (2.0 * self.retry_rng.next() - 1.0);
        }
        Some(delay_ms.max(0.0))
    }

    /// A caller's deadline for `call` passed.
    fn on_timeout(&mut self, id: CallId) -> Result<(), SimulationError> {
        let now = self.queue.now();
        self.awaiting.remove(&id);
        let Some(call) = self.calls.get_mut(&id) else {
            return Ok(());
        };
        if call.abandoned {
            return Ok(());
        }
        call.abandoned = true;
        let (parent, caller, component, edge, request) = (
            call.parent,
            call.caller.clone(),
            call.component.clone(),
            call.edge.clone(),
            call.request,
        );

        if parent.is_none() {
            // The client gave up; the call keeps running to completion.
            if let Some(runtime) = self.state.component_mut(&component) {
                runtime.window.record_timeout(now);
            }
            self.touched.insert(component);
            self.finish_request(request, &CallOutcome::timeout());
            return Ok(());
        }

        if let Some(caller) = &caller {
            if let Some(runtime) = self.state.component_mut(caller) {
                runtime.window.record_timeout(now);
            }
            self.touched.insert(caller.clone());
        }
        if let Some(edge) = &edge {
            self.metrics.record_edge_result(edge, EdgeResult::Timeout, None);
        }
        trace!(call = %id, component = component.as_str(), "call timed out");
        self.deliver_outcome(id, CallOutcome::timeout(), true)
    }

    /// Give a request its final status, once.
    fn finish_request(&mut self, id: RequestId, outcome: &CallOutcome) {
        let now = self.queue.now();
        let Some(request) = self.requests.get_mut(&id) else {
            return;
        };
        if request.outcome.is_some() {
            return;
        }
        request.outcome = Some(outcome.clone());
        request.resolved_at = Some(now);
        let latency_us = now.micros_since(request.created_at);

        self.stats.requests_active = self.stats.requests_active.saturating_sub(1);
        match outcome.status {
            RequestStatus::Success => self.stats.requests_succeeded += 1,
            RequestStatus::Error => self.stats.requests_failed += 1,
            RequestStatus::Timeout => self.stats.requests_timed_out += 1,
            RequestStatus::Rejected => self.stats.requests_rejected += 1,
        }
        self.global.record(now, latency_us, !outcome.is_success());
        if outcome.status == RequestStatus::Timeout {
            self.global.record_timeout(now);
        }
        trace!(request = %id, status = outcome.status.as_str(), "request resolved");
    }

    fn maybe_seal(&mut self, id: RequestId) {
        if self.requests.get(&id).is_some_and(|r| r.is_complete()) {
            self.seal(id);
        }
    }

    /// Turn a finished request into a trace and forget its calls.
    fn seal(&mut self, id: RequestId) {
        let Some(request) = self.requests.remove(&id) else {
            return;
        };
        let user = request.spec.user.clone();
        let size_bytes = request.spec.size_bytes;
        let resolved = request.outcome.is_some();
        let trace = request.seal(self.queue.now());
        if resolved {
            self.metrics.record_request(&trace, &user, size_bytes);
        }
        for call in self.request_calls.remove(&id).unwrap_or_default() {
            self.calls.remove(&call);
            self.dequeued_at.remove(&call);
        }
        self.requests_sealed += 1;
        if keep(&mut self.sample_rng, self.config.request_sampling_rate) {
            self.sampled_requests.push(trace);
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Faults, propagation, checks
    // ═══════════════════════════════════════════════════════════════════════

    fn on_fault(
        &mut self,
        kind: EventKind,
        fault: FaultId,
        phase: FaultPhase,
    ) -> Result<(), SimulationError> {
        match kind {
            EventKind::FaultActivate => self.activate_fault(&fault),
            EventKind::FaultDeactivate => self.deactivate_fault(&fault),
            EventKind::FaultCheck => {
                let now = self.queue.now();
                let outcome = {
                    let live = live!(self);
                    self.faults.check(&fault, phase, now, &live)
                };
                match outcome {
                    CheckOutcome::Fire => match phase {
                        FaultPhase::Activation => self.activate_fault(&fault),
                        FaultPhase::Deactivation => self.deactivate_fault(&fault),
                    },
                    CheckOutcome::Again(schedule) => self.schedule_fault(schedule),
                    CheckOutcome::Stale => Ok(()),
                }
            }
            _ => Ok(()),
        }
    }

    fn activate_fault(&mut self, fault: &FaultId) -> Result<(), SimulationError> {
        let now = self.queue.now();
        let Some((change, ending)) = self.faults.activate(fault, now, &self.graph, &mut self.state)
        else {
            return Ok(());
        };
        debug!(
            fault = fault.as_str(),
            components = change.components.len(),
            edges = change.edges.len(),
            "fault activated"
        );
        self.fault_changed(change)?;
        match ending {
            Some(schedule) => self.schedule_fault(schedule),
            None => Ok(()),
        }
    }

    fn deactivate_fault(&mut self, fault: &FaultId) -> Result<(), SimulationError> {
        let now = self.queue.now();
        let Some(change) = self.faults.deactivate(fault, &mut self.state) else {
            return Ok(());
        };
        debug!(fault = fault.as_str(), "fault deactivated");
        self.causal.fault_cleared(fault, now);
        self.fault_changed(change)
    }

    fn fault_changed(&mut self, change: FaultChange) -> Result<(), SimulationError> {
        let now = self.queue.now();
        for observation in change.observations {
            let mut event = self.event(
                now,
                observation.kind,
                EventPayload::Note {
                    detail: observation.detail,
                },
            );
            event.target = observation.component;
            self.push(event)?;
        }
        let mut components = change.components;
        for edge in &change.edges {
            if let Some(def) = self.graph.edge(edge) {
                components.push(def.source.clone());
                components.push(def.target.clone());
            }
        }
        components.sort();
        components.dedup();
        self.runtime_changed(&components)
    }

    fn on_check(&mut self, check: CheckTarget) -> Result<(), SimulationError> {
        let now = self.queue.now();
        match check {
            CheckTarget::FailureModes { component } => {
                let (snapshot, usage) = {
                    let live = live!(self);
                    (
                        capture(&live, std::slice::from_ref(&component)),
                        live.usage(&component),
                    )
                };
                let result = self.failure_modes.check(
                    &component,
                    now,
                    &self.graph,
                    &mut self.state,
                    &snapshot,
                    usage,
                );
                self.schedule_followups(result.followups)?;
                if result.changed {
                    debug!(component = component.as_str(), "failure mode state changed");
                    self.runtime_changed(&[component])?;
                }
            }
            CheckTarget::Autoscale { component } => {
                let snapshot = capture(&live!(self), std::slice::from_ref(&component));
                let decision = self
                    .autoscale
                    .check(&component, now, &mut self.state, &snapshot);
                self.schedule_followups(decision.followups)?;
                if decision.changed {
                    self.runtime_changed(&[component])?;
                }
            }
            CheckTarget::Invariant { invariant } => {
                let followup = {
                    let live = live!(self);
                    let ctx = CheckContext {
                        now,
                        metrics: &live,
                        active_causes: self.causal.active_causes(),
                    };
                    self.invariants.check_slo(&invariant, &ctx)
                };
                self.schedule_followups(followup.into_iter().collect())?;
            }
            CheckTarget::Invariants => {
                let followup = {
                    let live = live!(self);
                    let ctx = CheckContext {
                        now,
                        metrics: &live,
                        active_causes: self.causal.active_causes(),
                    };
                    self.invariants.check_expressions(&ctx)
                };
                self.schedule_followups(vec![followup])?;
            }
        }
        Ok(())
    }

    /// Re-evaluate propagation rules around every component whose metrics
    /// or runtime moved while handling the current event.
    fn flush_touched(&mut self) -> Result<(), SimulationError> {
        if self.touched.is_empty() {
            return Ok(());
        }
        let touched: Vec<ComponentId> = std::mem::take(&mut self.touched).into_iter().collect();
        let now = self.queue.now();
        let followups = {
            let live = live!(self);
            self.propagation
                .evaluate(&touched, now, &self.graph, &self.state, &live)
        };
        self.schedule_followups(followups)
    }

    /// Let models, metrics and propagation see a runtime change.
    fn runtime_changed(&mut self, components: &[ComponentId]) -> Result<(), SimulationError> {
        let now = self.queue.now();
        for id in components {
            if let Some(runtime) = self.state.component_mut(id) {
                runtime.settle(now);
            }
            self.invoke(id, |model, ctx| model.on_runtime_change(ctx))?;
            let available = self.state.is_available(id, now);
            self.metrics.set_available(id, now, available);
            self.touched.insert(id.clone());
        }
        self.refresh_system_availability();
        Ok(())
    }

    fn refresh_system_availability(&mut self) {
        let now = self.queue.now();
        let up = self
            .graph
            .entry_components()
            .iter()
            .all(|id| self.state.is_available(id, now));
        self.metrics.set_system_available(now, up);
    }

    fn on_notification(&mut self, kind: EventKind, target: Option<&ComponentId>) {
        let relevant = matches!(
            kind,
            EventKind::NodeFailure
                | EventKind::NodeRecovery
                | EventKind::NodeDegraded
                | EventKind::NetworkPartition
        );
        if let (true, Some(component)) = (relevant, target) {
            let now = self.queue.now();
            let available = self.state.is_available(component, now);
            self.metrics.set_available(component, now, available);
            self.refresh_system_availability();
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Lifecycle, deployments, scenarios, snapshots
    // ═══════════════════════════════════════════════════════════════════════

    fn on_lifecycle(&mut self, component: ComponentId, online: bool) -> Result<(), SimulationError> {
        if let Some(runtime) = self.state.component_mut(&component) {
            runtime.online = online;
        }
        debug!(component = component.as_str(), online, "component lifecycle");
        self.runtime_changed(&[component])
    }

    /// Restart live replicas one after another, one health-check cycle each.
    fn start_deployment(
        &mut self,
        component: ComponentId,
        version: String,
    ) -> Result<(), SimulationError> {
        let now = self.queue.now();
        let Some(def) = self.graph.component(&component) else {
            return Ok(());
        };
        let step_ms = restart_ms(def);
        let Some(runtime) = self.state.component_mut(&component) else {
            return Ok(());
        };
        let mut restarted = 0u32;
        for replica in runtime.replicas.iter_mut().filter(|r| r.is_live()) {
            let from = now.plus_millis(step_ms * restarted as f64);
            let until = now.plus_millis(step_ms * (restarted + 1) as f64);
            replica.restart = Some((from, until));
            restarted += 1;
        }
        debug!(
            component = component.as_str(),
            version = %version,
            replicas = restarted,
            "rolling deployment started"
        );
        for step in 0..=restarted {
            let event = self
                .event(
                    now.plus_millis(step_ms * step as f64),
                    EventKind::HealthCheck,
                    EventPayload::None,
                )
                .with_target(component.clone());
            self.push(event)?;
        }
        let event = self
            .event(
                now.plus_millis(step_ms * restarted as f64),
                EventKind::DeploymentComplete,
                EventPayload::Deployment { version },
            )
            .with_target(component);
        self.push(event).map(|_| ())
    }

    fn complete_deployment(
        &mut self,
        component: ComponentId,
        version: String,
    ) -> Result<(), SimulationError> {
        if let Some(runtime) = self.state.component_mut(&component) {
            runtime.version = version;
            for replica in &mut runtime.replicas {
                replica.restart = None;
            }
        }
        self.runtime_changed(&[component])
    }

    fn on_step(&mut self, index: usize) -> Result<(), SimulationError> {
        let now = self.queue.now();
        let Some(timeline) = self.timeline.as_mut() else {
            return Ok(());
        };
        let live = LiveMetrics {
            now,
            graph: &self.graph,
            state: &self.state,
            models: &self.models,
            global: &self.global,
            active_requests: self.stats.requests_active,
            window_us: self.window_us,
        };
        let result = timeline.advance(index, now, &live);
        for directive in result.directives {
            self.apply_directive(directive)?;
        }
        self.schedule_followups(result.followups)
    }

    fn apply_directive(&mut self, directive: Directive) -> Result<(), SimulationError> {
        let now = self.queue.now();
        match directive {
            Directive::InjectFault(injection) => {
                debug!(fault = injection.id.as_str(), "scenario injects fault");
                let schedule = self
                    .faults
                    .inject(injection, &self.graph, &self.root_rng, now)?;
                self.schedule_fault(schedule)
            }
            Directive::ChangeTraffic(profile) => {
                debug!(workload = profile.kind(), "scenario changes traffic");
                self.workload.switch_to(profile, now)?;
                if let Some(key) = self.pending_arrival.take() {
                    self.cancel_event(&key);
                }
                self.schedule_next_arrival()
            }
            Directive::Scale {
                component_id,
                replicas,
            } => {
                let followups =
                    autoscale::scale_to(&component_id, replicas, now, &self.graph, &mut self.state);
                self.schedule_followups(followups)?;
                self.runtime_changed(&[component_id])
            }
            Directive::Deploy {
                component_id,
                new_version,
            } => {
                let event = self
                    .event(
                        now,
                        EventKind::DeploymentStart,
                        EventPayload::Deployment {
                            version: new_version,
                        },
                    )
                    .with_target(component_id);
                self.push(event).map(|_| ())
            }
            Directive::Assert(invariant) => {
                let followups = {
                    let live = live!(self);
                    let ctx = CheckContext {
                        now,
                        metrics: &live,
                        active_causes: self.causal.active_causes(),
                    };
                    self.invariants.activate(&invariant, &self.graph, &ctx)?
                };
                self.schedule_followups(followups)
            }
        }
    }

    fn on_snapshot(&mut self) -> Result<(), SimulationError> {
        let now = self.queue.now();
        let samples = {
            let live = live!(self);
            self.graph
                .components()
                .map(|def| live.sample(&def.id))
                .collect()
        };
        self.metrics
            .snapshot(now, samples, self.stats.requests_active);
        let next = now.plus_millis(self.config.metrics_resolution_ms);
        if next <= self.end && next > now {
            let event = self.event(next, EventKind::MetricsSnapshot, EventPayload::None);
            self.push(event)?;
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Output
    // ═══════════════════════════════════════════════════════════════════════

    fn finish(mut self) -> Result<SimulationOutput, SimulationError> {
        let status = self.status.clone().unwrap_or(RunStatus::Completed);
        let end = self.queue.now();
        {
            let live = live!(self);
            let ctx = CheckContext {
                now: end,
                metrics: &live,
                active_causes: self.causal.active_causes(),
            };
            self.invariants.check_end(&ctx);
        }

        let in_flight = self
            .requests
            .values()
            .filter(|r| r.outcome.is_none())
            .count() as u64;
        let leftovers: Vec<RequestId> = self
            .requests
            .iter()
            .filter(|(_, r)| r.outcome.is_some())
            .map(|(id, _)| *id)
            .collect();
        for id in leftovers {
            self.seal(id);
        }

        let storage: BTreeMap<ComponentId, StorageStats> = self
            .models
            .iter()
            .filter_map(|(id, slot)| slot.behavior.storage().map(|s| (id.clone(), s)))
            .collect();
        let collected = self.metrics.finish(end, &storage);

        let mut anti_patterns = antipattern::detect_static(&self.graph);
        anti_patterns.extend(antipattern::detect(&self.graph, &collected.metrics));

        let stats = &self.stats;
        let resolved = stats.requests_succeeded
            + stats.requests_failed
            + stats.requests_timed_out
            + stats.requests_rejected;
        let conservation = ConservationCheck {
            arrivals: stats.requests_started,
            succeeded: stats.requests_succeeded,
            failed: stats.requests_failed,
            timed_out: stats.requests_timed_out,
            rejected: stats.requests_rejected,
            in_flight,
            holds: resolved + in_flight == stats.requests_started,
        };
        let causal_order = CausalOrderCheck {
            events_checked: stats.events_processed,
            violations: self.causal_violations,
            holds: self.causal_violations == 0,
        };

        let trace_hash = self.trace_hasher.finish();
        let hex = self.config_hash.to_hex();
        let run_id = format!(
            "{}-{}",
            self.graph.architecture().id,
            &hex[..hex.len().min(12)]
        );

        info!(
            run_id = %run_id,
            status = ?status,
            events = stats.events_processed,
            requests = stats.requests_started,
            succeeded = stats.requests_succeeded,
            simulated_ms = end.as_millis_f64(),
            "simulation finished"
        );
        let suppressed = self.invariants.suppressed();
        if suppressed > 0 {
            warn!(
                suppressed,
                cap = self.config.max_violations_per_invariant,
                "invariant violations over the per-invariant cap were counted but not recorded"
            );
        }

        Ok(SimulationOutput {
            run_id,
            seed: self.config.seed.clone(),
            status,
            simulated_duration_ms: end.as_millis_f64(),
            event_traces: EventTraces {
                events: self.sampled_events,
                total_events: stats.events_processed,
                sampling_rate: self.config.trace_sampling_rate,
            },
            request_traces: RequestTraces {
                traces: self.sampled_requests,
                total_requests: self.requests_sealed,
                sampling_rate: self.config.request_sampling_rate,
            },
            metrics: collected.metrics,
            time_series: collected.time_series,
            heatmaps: collected.heatmaps,
            causal_graph: self.causal.finish(),
            invariant_violations: self.invariants.into_violations(),
            slo_breaches: collected.slo_breaches,
            anti_patterns_detected: anti_patterns,
            verification: VerificationResults {
                littles_law: collected.littles_law,
                request_conservation: conservation,
                causal_order,
            },
            reproducibility_spec: ReproducibilitySpec {
                seed: self.config.seed.clone(),
                config_hash: self.config_hash,
                trace_hash,
                deterministic_config: self.deterministic_config,
            },
            metadata: RunMetadata {
                propagation_tie_break: propagation::TIE_BREAK.to_string(),
                effect_stacking: EFFECT_STACKING.to_string(),
                events_processed: stats.events_processed,
                events_by_kind: stats.events_by_kind.clone(),
                max_queue_depth: stats.max_queue_depth,
            },
        })
    }
}

fn violation_cap(config: &SimulationConfig) -> u32 {
    u32::try_from(config.max_violations_per_invariant).unwrap_or(u32::MAX)
}

/// Length of one rolling-restart step.
fn restart_ms(def: &ComponentDefinition) -> f64 {
    let check = &def.health_check;
    (check.interval_ms.max(0.0) * check.healthy_threshold.max(1) as f64).max(1.0)
}

fn outcome_kind(status: RequestStatus) -> EventKind {
    match status {
        RequestStatus::Success => EventKind::RequestComplete,
        RequestStatus::Error => EventKind::RequestError,
        RequestStatus::Timeout => EventKind::RequestTimeout,
        RequestStatus::Rejected => EventKind::RequestRejected,
    }
}

fn keep(rng: &mut DeterministicRng, rate: f64) -> bool {
    rate >= 1.0 || (rate > 0.0 && rng.chance(rate))
}

fn flag(value: bool) -> f64 {
    if value {
        1.0
    } else {
        0.0
    }
}

fn cpu_percent(load: &ModelLoad, effects: &FaultEffects) -> f64 {
    (load.utilization() * 100.0)
        .max(effects.cpu_stress)
        .min(100.0)
}

/// Baseline footprint plus work in flight and queued, or the injected
/// pressure if higher.
fn memory_percent(load: &ModelLoad, effects: &FaultEffects) -> f64 {
    let busy = 0.5 * (load.utilization() + load.queue_utilization());
    let footprint = MEMORY_BASELINE_PERCENT + (100.0 - MEMORY_BASELINE_PERCENT) * busy;
    footprint.max(effects.memory_stress).min(100.0)
}

fn pool_utilization(storage: Option<&StorageStats>) -> Option<f64> {
    storage
        .filter(|s| s.pool_max > 0)
        .map(|s| (s.pool_in_use as f64 / s.pool_max as f64).min(1.0))
}

/// Freeze every metric of `components` and of the system, for engines that
/// read metrics while mutating runtime state.
fn capture(live: &LiveMetrics<'_>, components: &[ComponentId]) -> StaticMetrics {
    let mut snapshot = StaticMetrics::new();
    for metric in Metric::ALL {
        if let Some(value) = live.metric(metric, None) {
            snapshot.set(metric, None, value);
        }
        for id in components {
            if let Some(value) = live.metric(metric, Some(id)) {
                snapshot.set(metric, Some(id.as_str()), value);
            }
        }
    }
    snapshot
}

/// Metrics read straight from runtime state and models.
struct LiveMetrics<'a> {
    now: SimTime,
    graph: &'a ArchitectureGraph,
    state: &'a RuntimeState,
    models: &'a BTreeMap<ComponentId, ModelSlot>,
    global: &'a RollingWindow,
    active_requests: u64,
    window_us: u64,
}

impl LiveMetrics<'_> {
    fn component(&self, metric: Metric, id: &ComponentId) -> Option<f64> {
        let runtime = self.state.component(id)?;
        let model = &self.models.get(id)?.behavior;
        let load = model.load();
        let effects = runtime.effects(None);
        let value = match metric {
            Metric::ErrorRate => runtime.window.error_rate()?,
            Metric::LatencyP50 => runtime.window.quantile_ms(0.5)?,
            Metric::LatencyP95 => runtime.window.quantile_ms(0.95)?,
            Metric::LatencyP99 => runtime.window.p99_ms()?,
            Metric::Rps => runtime.window.rps(self.now),
            Metric::QueueDepth => load.queue_depth as f64,
            Metric::ActiveRequests => load.active as f64,
            Metric::Utilization => cpu_percent(&load, &effects),
            Metric::Memory => memory_percent(&load, &effects),
            Metric::Replicas => runtime.live_replicas() as f64,
            Metric::ReadyReplicas => runtime.ready_replicas(self.now).len() as f64,
            Metric::Available => flag(runtime.is_available(self.now)),
            Metric::StaleReads => model.storage()?.stale_reads as f64,
            Metric::WriteConflicts => model.storage()?.write_conflicts as f64,
            Metric::WritesLost => model.storage()?.writes_lost as f64,
            Metric::ReplicationLagMs => model.storage()?.mean_lag_ms(),
            Metric::Timeouts => runtime.window.timeouts_within(self.now, self.window_us) as f64,
        };
        Some(value)
    }

    fn system(&self, metric: Metric) -> Option<f64> {
        match metric {
            Metric::ErrorRate => self.global.error_rate(),
            Metric::LatencyP50 => self.global.quantile_ms(0.5),
            Metric::LatencyP95 => self.global.quantile_ms(0.95),
            Metric::LatencyP99 => self.global.p99_ms(),
            Metric::Rps => Some(self.global.rps(self.now)),
            Metric::ActiveRequests => Some(self.active_requests as f64),
            Metric::Timeouts => {
                Some(self.global.timeouts_within(self.now, self.window_us) as f64)
            }
            Metric::Available => Some(flag(
                self.graph
                    .entry_components()
                    .iter()
                    .all(|id| self.state.is_available(id, self.now)),
            )),
            Metric::Utilization | Metric::Memory => {
                let values: Vec<f64> = self
                    .graph
                    .component_ids()
                    .filter_map(|id| self.component(metric, id))
                    .collect();
                (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
            }
            _ => self
                .graph
                .component_ids()
                .filter_map(|id| self.component(metric, id))
                .reduce(|a, b| a + b),
        }
    }

    /// Resource pressure of `id`, each 0-1.
    fn usage(&self, id: &ComponentId) -> ResourceUsage {
        let Some((runtime, slot)) = self.state.component(id).zip(self.models.get(id)) else {
            return ResourceUsage::default();
        };
        let load = slot.behavior.load();
        let effects = runtime.effects(None);
        let storage = slot.behavior.storage();
        ResourceUsage {
            cpu: cpu_percent(&load, &effects) / 100.0,
            memory: memory_percent(&load, &effects) / 100.0,
            connections: pool_utilization(storage.as_ref()).unwrap_or_else(|| load.utilization()),
            queue: load.queue_utilization(),
            disk: (effects.disk_full / 100.0).clamp(0.0, 1.0),
        }
    }

    fn sample(&self, id: &ComponentId) -> ComponentSample {
        let runtime = self.state.component(id);
        let slot = self.models.get(id);
        let load = slot.map(|s| s.behavior.load()).unwrap_or_default();
        let effects = runtime.map(|r| r.effects(None)).unwrap_or_default();
        let storage = slot.and_then(|s| s.behavior.storage());
        ComponentSample {
            component: id.clone(),
            queue_depth: load.queue_depth,
            active: load.active,
            ready_replicas: runtime.map_or(0, |r| r.ready_replicas(self.now).len() as u64),
            cpu: cpu_percent(&load, &effects),
            memory: memory_percent(&load, &effects),
            queue_utilization: load.queue_utilization(),
            pool_utilization: pool_utilization(storage.as_ref()).unwrap_or(0.0),
            available: runtime.is_some_and(|r| r.is_available(self.now)),
        }
    }
}

impl MetricSource for LiveMetrics<'_> {
    fn metric(&self, metric: Metric, component: Option<&ComponentId>) -> Option<f64> {
        match component {
            Some(id) => self.component(metric, id),
            None => self.system(metric),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use archsim_types::{ComponentType, DistributionConfig, FaultSpec};

    fn pipeline() -> SystemArchitecture {
        SystemArchitecture::new("pipeline")
            .with_component(ComponentDefinition::new("api", ComponentType::Api))
            .with_component(ComponentDefinition::new("db", ComponentType::RelationalDb))
            .with_edge(
                EdgeDefinition::new("api-db", "api", "db")
                    .with_latency(DistributionConfig::constant(1.0)),
            )
    }

    fn input(seed: &str) -> SimulationInput {
        SimulationInput::new(pipeline())
            .with_workload(WorkloadProfile::constant(50.0))
            .with_config(SimulationConfig::new(seed).with_duration_ms(2_000.0))
    }

    #[test]
    fn test_run_completes_and_conserves_requests() {
        let output = SimulationRunner::new(input("conserve"))
            .unwrap()
            .run()
            .unwrap();
        assert_eq!(output.status, RunStatus::Completed);
        assert_eq!(output.simulated_duration_ms, 2_000.0);
        let conservation = &output.verification.request_conservation;
        assert!(conservation.arrivals > 50);
        assert!(conservation.holds, "{conservation:?}");
        assert!(output.verification.causal_order.holds);
    }

    #[test]
    fn test_same_seed_same_trace_hash() {
        let a = SimulationRunner::new(input("same")).unwrap().run().unwrap();
        let b = SimulationRunner::new(input("same")).unwrap().run().unwrap();
        let c = SimulationRunner::new(input("other")).unwrap().run().unwrap();
        assert_eq!(a.reproducibility_spec.trace_hash, b.reproducibility_spec.trace_hash);
        assert_eq!(a.reproducibility_spec.config_hash, b.reproducibility_spec.config_hash);
        assert_ne!(a.reproducibility_spec.trace_hash, c.reproducibility_spec.trace_hash);
    }

    #[test]
    fn test_only_parents_with_pending_children_are_kept() {
        let mut runner = SimulationRunner::new(input("parents")).unwrap();
        runner.run_until(SimTime::from_millis(1_500)).unwrap();

        assert!(runner.stats().events_processed > 100);
        assert!(runner.open_parents.len() <= runner.queue.len());
        assert!(runner.open_parents.values().all(|(_, pending)| *pending > 0));
        assert_eq!(runner.causal_violations, 0);

        let output = runner.run().unwrap();
        assert!(output.verification.causal_order.holds);
    }

    #[test]
    fn test_missing_workload_is_a_config_error() {
        let input = SimulationInput::new(pipeline());
        let err = SimulationRunner::new(input).err().unwrap();
        assert!(matches!(
            err,
            SimulationError::Config(ConfigError::InvalidWorkload(_))
        ));
    }

    #[test]
    fn test_event_budget_stops_run() {
        let input = input("budget").with_config(
            SimulationConfig::new("budget")
                .with_duration_ms(2_000.0)
                .with_max_events(25),
        );
        let output = SimulationRunner::new(input).unwrap().run().unwrap();
        assert_eq!(output.status, RunStatus::EventBudgetExhausted { processed: 25 });
        assert_eq!(output.metadata.events_processed, 25);
    }

    #[test]
    fn test_cancelled_before_start() {
        let token = CancellationToken::new();
        token.cancel();
        let output = SimulationRunner::new(input("cancel"))
            .unwrap()
            .with_cancellation(token)
            .run()
            .unwrap();
        assert_eq!(output.status, RunStatus::Cancelled { at: SimTime::ZERO });
    }

    #[test]
    fn test_crashed_dependency_fails_requests() {
        let input = input("crash").with_fault(FaultInjection::on_component(
            "db-crash",
            "db",
            FaultSpec::ProcessCrash,
            500.0,
            1_000.0,
        ));
        let output = SimulationRunner::new(input).unwrap().run().unwrap();
        assert!(output.event_count(EventKind::FaultActivate) == 1);
        assert!(output.event_count(EventKind::FaultDeactivate) == 1);
        assert!(output.verification.request_conservation.failed > 0);
        assert!(output.verification.request_conservation.holds);
    }

    #[test]
    fn test_run_until_pauses_and_resumes() {
        let mut runner = SimulationRunner::new(input("pause")).unwrap();
        runner.run_until(SimTime::from_millis(500)).unwrap();
        assert!(!runner.is_finished());
        assert!(runner.now() <= SimTime::from_millis(500));
        let drained = runner.stats().events_processed;
        assert!(drained > 0);
        let output = runner.run().unwrap();
        assert!(output.metadata.events_processed > drained);
    }

    #[test]
    fn test_live_metrics_memory_tracks_load() {
        let idle = ModelLoad::default();
        let busy = ModelLoad {
            queue_depth: 10,
            active: 4,
            capacity: 4,
            queue_capacity: Some(10),
        };
        let effects = FaultEffects::default();
        assert_eq!(memory_percent(&idle, &effects), MEMORY_BASELINE_PERCENT);
        assert_eq!(memory_percent(&busy, &effects), 100.0);
        let stressed = FaultEffects {
            memory_stress: 95.0,
            ..FaultEffects::default()
        };
        assert_eq!(memory_percent(&idle, &stressed), 95.0);
    }
}
