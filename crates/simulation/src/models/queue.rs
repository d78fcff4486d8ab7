//! Queues and streams.
//!
//! Producers are acknowledged as soon as their message is stored. Each
//! message keeps its request open through a call the queue owns until a
//! consumer acknowledges it, it is dead-lettered, or it is lost.
//!
//! A queue delivers to each downstream dependency on its own lane (fan-out),
//! or consumes internally when it has none. A stream has one lane per
//! consumer group.

use archsim_core::{Action, CallOutcome, EventKind, EventPayload, ModelTimer};
use archsim_types::{
    BackpressurePolicy, BatchingSpec, CallId, ComponentConfig, ComponentDefinition,
    ComponentId, DeliveryGuarantee, DistributionConfig, MessageOrdering, QueueConfig, RequestId,
    SimTime,
};
use std::collections::{BTreeMap, VecDeque};
use tracing::debug;

use super::{BehaviorModel, ModelContext, ModelLoad};
use crate::rate_limiter::TokenBucket;

#[derive(Debug, Clone)]
struct Message {
    call: CallId,
    request: RequestId,
    key: String,
    sent_at: SimTime,
    receives: u32,
}

#[derive(Debug, Clone)]
struct LaneSpec {
    target: Option<ComponentId>,
    consumers: u32,
    latency: DistributionConfig,
}

#[derive(Debug)]
struct Lane {
    spec: LaneSpec,
    busy: u32,
    pending: VecDeque<Message>,
    inflight: usize,
    batch_timer: bool,
}

#[derive(Debug)]
struct Delivery {
    lane: usize,
    lead: CallId,
    messages: Vec<Message>,
}

#[derive(Debug)]
enum LaneSource {
    Queue { consumers: u32, latency: DistributionConfig },
    Stream(Vec<LaneSpec>),
}

#[derive(Debug)]
pub struct QueueModel {
    source: LaneSource,
    lanes: Vec<Lane>,
    capacity: u64,
    delivery: DeliveryGuarantee,
    ordering: MessageOrdering,
    visibility_ms: f64,
    max_receives: u32,
    batching: Option<BatchingSpec>,
    backpressure: BackpressurePolicy,
    write_limiter: Option<TokenBucket>,
    blocked: VecDeque<CallId>,
    unblock_pending: bool,
    backlog_flagged: bool,
    deliveries: BTreeMap<u64, Delivery>,
    by_lead: BTreeMap<CallId, u64>,
    dead_lettered: u64,
}

impl QueueModel {
    pub fn new(def: &ComponentDefinition) -> Self {
        match &def.config {
            ComponentConfig::Stream(stream) => {
                let groups = stream
                    .consumer_groups
                    .iter()
                    .enumerate()
                    .map(|(i, g)| LaneSpec {
                        target: def.dependencies.get(i).cloned(),
                        consumers: g.consumers,
                        latency: g.processing_latency.clone(),
                    })
                    .collect::<Vec<_>>();
                let mut model = Self::from_queue(&QueueConfig {
                    consumers: stream.partitions.max(1),
                    ..QueueConfig::default()
                });
                if !groups.is_empty() {
                    model.source = LaneSource::Stream(groups);
                }
                model.capacity = u64::MAX;
                model.write_limiter = (stream.throughput.max_write_rps > 0.0).then(|| {
                    TokenBucket::new(
                        stream.throughput.max_write_rps,
                        stream.throughput.max_write_rps,
                        SimTime::ZERO,
                    )
                });
                model
            }
            ComponentConfig::Queue(queue) => Self::from_queue(queue),
            _ => Self::from_queue(&QueueConfig::default()),
        }
    }

    fn from_queue(cfg: &QueueConfig) -> Self {
        let max_receives = cfg
            .dead_letter
            .as_ref()
            .filter(|d| d.enabled)
            .map_or(cfg.visibility.max_receives, |d| d.max_receives)
            .max(1);
        Self {
            source: LaneSource::Queue {
                consumers: cfg.consumers,
                latency: cfg.consumer_latency.clone(),
            },
            lanes: Vec::new(),
            capacity: cfg.capacity.max_messages.max(1),
            delivery: cfg.delivery,
            ordering: cfg.ordering,
            visibility_ms: cfg.visibility.timeout_ms,
            max_receives,
            batching: cfg.batching.clone().filter(|b| b.enabled && b.max_size > 1),
            backpressure: cfg.backpressure,
            write_limiter: None,
            blocked: VecDeque::new(),
            unblock_pending: false,
            backlog_flagged: false,
            deliveries: BTreeMap::new(),
            by_lead: BTreeMap::new(),
            dead_lettered: 0,
        }
    }

    fn ensure_lanes(&mut self, ctx: &ModelContext<'_>) {
        if !self.lanes.is_empty() {
            return;
        }
        let specs = match &self.source {
            LaneSource::Stream(groups) => groups.clone(),
            LaneSource::Queue { consumers, latency } => {
                let deps = ctx.dependencies();
                if deps.is_empty() {
                    vec![LaneSpec {
                        target: None,
                        consumers: *consumers,
                        latency: latency.clone(),
                    }]
                } else {
                    deps.iter()
                        .map(|d| LaneSpec {
                            target: Some(d.clone()),
                            consumers: *consumers,
                            latency: latency.clone(),
                        })
                        .collect()
                }
            }
        };
        self.lanes = specs
            .into_iter()
            .map(|spec| Lane {
                spec,
                busy: 0,
                pending: VecDeque::new(),
                inflight: 0,
                batch_timer: false,
            })
            .collect();
    }

    /// Messages stored on the fullest lane.
    fn depth(&self) -> u64 {
        self.lanes
            .iter()
            .map(|l| (l.pending.len() + l.inflight) as u64)
            .max()
            .unwrap_or(0)
    }

    fn pending(&self) -> u64 {
        self.lanes.iter().map(|l| l.pending.len() as u64).sum()
    }

    pub fn dead_lettered(&self) -> u64 {
        self.dead_lettered
    }

    fn enqueue(&mut self, ctx: &mut ModelContext<'_>, producer: CallId) -> Vec<Action> {
        let Some(call) = ctx.call(producer).cloned() else {
            return Vec::new();
        };
        let mut actions = Vec::new();
        for lane in &mut self.lanes {
            let holder = ctx.ids.call();
            actions.push(Action::Open {
                call: holder,
                request: call.request,
                op: call.op,
                key: call.key.clone(),
            });
            lane.pending.push_back(Message {
                call: holder,
                request: call.request,
                key: call.key.clone(),
                sent_at: ctx.now,
                receives: 0,
            });
        }
        actions.push(Action::emit_for(
            EventKind::RequestQueued,
            call.request,
            EventPayload::Call { call: producer },
        ));
        actions.push(Action::resolve(producer, CallOutcome::success()));

        let depth = self.depth();
        if !self.backlog_flagged && self.capacity != u64::MAX && depth * 5 >= self.capacity * 4 {
            self.backlog_flagged = true;
            actions.push(Action::emit(
                EventKind::BacklogBuildup,
                EventPayload::Backlog {
                    depth,
                    max_depth: self.capacity,
                },
            ));
        }
        for lane in 0..self.lanes.len() {
            actions.extend(self.dispatch(ctx, lane, false));
        }
        actions
    }

    fn dispatch(&mut self, ctx: &mut ModelContext<'_>, index: usize, flush: bool) -> Vec<Action> {
        let mut actions = Vec::new();
        let batch_size = self.batching.as_ref().map_or(1, |b| b.max_size.max(1) as usize);
        let mut flush = flush;
        loop {
            let lane = &mut self.lanes[index];
            if lane.busy >= lane.spec.consumers || lane.pending.is_empty() {
                break;
            }
            if batch_size > 1 && lane.pending.len() < batch_size && !flush {
                if !lane.batch_timer {
                    lane.batch_timer = true;
                    let wait_ms = self.batching.as_ref().map_or(0.0, |b| b.max_wait_ms);
                    actions.push(Action::after(
                        EventKind::ModelTimer,
                        archsim_types::millis_to_micros(wait_ms),
                        EventPayload::Timer {
                            timer: ModelTimer::BatchWait { lane: index },
                        },
                    ));
                }
                break;
            }
            flush = false;

            let take = batch_size.min(lane.pending.len());
            let mut messages = Vec::with_capacity(take);
            for _ in 0..take {
                let next = match self.ordering {
                    MessageOrdering::Fifo => lane.pending.pop_front(),
                    MessageOrdering::Unordered => {
                        let at = ctx.rng.below(lane.pending.len());
                        lane.pending.remove(at)
                    }
                };
                if let Some(mut message) = next {
                    message.receives += 1;
                    messages.push(message);
                }
            }
            let Some(lead) = messages.first().map(|m| m.call) else {
                break;
            };
            lane.busy += 1;
            lane.inflight += messages.len();

            for message in &messages {
                actions.push(Action::emit_for(
                    EventKind::RequestDequeued,
                    message.request,
                    EventPayload::Message {
                        topic: ctx.id.clone(),
                        ordering_key: Some(message.key.clone()),
                        sent_at: message.sent_at,
                        receives: message.receives,
                    },
                ));
            }

            let token = ctx.ids.message();
            match lane.spec.target.clone() {
                Some(target) => {
                    actions.push(Action::forward(lead, target));
                    if self.delivery != DeliveryGuarantee::AtMostOnce {
                        actions.push(Action::after(
                            EventKind::ModelTimer,
                            archsim_types::millis_to_micros(self.visibility_ms),
                            EventPayload::Timer {
                                timer: ModelTimer::VisibilityExpired {
                                    lane: index,
                                    message: token,
                                },
                            },
                        ));
                    }
                }
                None => {
                    let latency = lane.spec.latency.clone();
                    let base = ctx.sample_ms(&latency);
                    let delay = ctx.service_time_us(base, None);
                    actions.push(Action::after(
                        EventKind::ProcessingComplete,
                        delay,
                        EventPayload::Call { call: lead },
                    ));
                }
            }
            self.by_lead.insert(lead, token);
            self.deliveries.insert(
                token,
                Delivery {
                    lane: index,
                    lead,
                    messages,
                },
            );
        }
        actions
    }

    /// A delivery attempt failed: redeliver, dead-letter or drop.
    fn fail(&mut self, ctx: &ModelContext<'_>, lane: usize, message: Message) -> Vec<Action> {
        if self.delivery == DeliveryGuarantee::AtMostOnce {
            return vec![Action::resolve(message.call, CallOutcome::error("message-lost"))];
        }
        if message.receives >= self.max_receives {
            self.dead_lettered += 1;
            debug!(queue = ctx.id.as_str(), call = %message.call, receives = message.receives, "message dead-lettered");
            return vec![Action::resolve(message.call, CallOutcome::error("dead-lettered"))];
        }
        let pending = &mut self.lanes[lane].pending;
        match self.ordering {
            MessageOrdering::Fifo => pending.push_front(message),
            MessageOrdering::Unordered => pending.push_back(message),
        }
        Vec::new()
    }

    fn settle(
        &mut self,
        ctx: &mut ModelContext<'_>,
        token: u64,
        outcome: &CallOutcome,
    ) -> Vec<Action> {
        let Some(delivery) = self.deliveries.remove(&token) else {
            return Vec::new();
        };
        if self.by_lead.get(&delivery.lead) == Some(&token) {
            self.by_lead.remove(&delivery.lead);
        }
        let lane = delivery.lane;
        self.lanes[lane].busy = self.lanes[lane].busy.saturating_sub(1);
        self.lanes[lane].inflight = self.lanes[lane]
            .inflight
            .saturating_sub(delivery.messages.len());

        let mut actions = Vec::new();
        for message in delivery.messages {
            if outcome.is_success() {
                actions.push(Action::resolve(message.call, CallOutcome::success()));
            } else {
                actions.extend(self.fail(ctx, lane, message));
            }
        }
        actions.extend(self.dispatch(ctx, lane, false));

        if self.backlog_flagged && self.pending() == 0 {
            self.backlog_flagged = false;
            actions.push(Action::emit(EventKind::QueueDrained, EventPayload::None));
        }
        if !self.blocked.is_empty() && !self.unblock_pending && self.depth() < self.capacity {
            self.unblock_pending = true;
            actions.push(Action::after(
                EventKind::ModelTimer,
                0,
                EventPayload::Timer {
                    timer: ModelTimer::Unblock,
                },
            ));
        }
        actions
    }
}

impl BehaviorModel for QueueModel {
    fn on_start(&mut self, ctx: &mut ModelContext<'_>) -> Vec<Action> {
        self.ensure_lanes(ctx);
        Vec::new()
    }

    fn on_arrival(&mut self, ctx: &mut ModelContext<'_>, call: CallId) -> Vec<Action> {
        self.ensure_lanes(ctx);
        let Some(request) = ctx.call(call).map(|c| c.request) else {
            return Vec::new();
        };
        if let Some(limiter) = self.write_limiter.as_mut() {
            if !limiter.try_acquire(ctx.now) {
                return vec![
                    Action::emit_for(EventKind::RateLimitExceeded, request, EventPayload::None),
                    Action::resolve(call, CallOutcome::rejected("throttled")),
                ];
            }
        }
        let depth = self.depth();
        if depth >= self.capacity {
            let full = Action::emit_for(
                EventKind::QueueFull,
                request,
                EventPayload::Backlog {
                    depth,
                    max_depth: self.capacity,
                },
            );
            return match self.backpressure {
                BackpressurePolicy::Reject => {
                    vec![full, Action::resolve(call, CallOutcome::rejected("queue-full"))]
                }
                BackpressurePolicy::Block => {
                    self.blocked.push_back(call);
                    vec![full]
                }
            };
        }
        self.enqueue(ctx, call)
    }

    fn on_processing_complete(
        &mut self,
        ctx: &mut ModelContext<'_>,
        call: CallId,
    ) -> Vec<Action> {
        let Some(token) = self.by_lead.get(&call).copied() else {
            return Vec::new();
        };
        self.settle(ctx, token, &CallOutcome::success())
    }

    fn on_child_outcome(
        &mut self,
        ctx: &mut ModelContext<'_>,
        parent: CallId,
        _child: CallId,
        outcome: &CallOutcome,
    ) -> Vec<Action> {
        let Some(token) = self.by_lead.get(&parent).copied() else {
            return Vec::new();
        };
        self.settle(ctx, token, outcome)
    }

    fn on_timer(&mut self, ctx: &mut ModelContext<'_>, timer: &ModelTimer) -> Vec<Action> {
        match timer {
            ModelTimer::BatchWait { lane } if *lane < self.lanes.len() => {
                self.lanes[*lane].batch_timer = false;
                self.dispatch(ctx, *lane, true)
            }
            ModelTimer::VisibilityExpired { message, .. } => {
                if self.deliveries.contains_key(message) {
                    self.settle(ctx, *message, &CallOutcome::error("visibility-timeout"))
                } else {
                    Vec::new()
                }
            }
            ModelTimer::Unblock => {
                self.unblock_pending = false;
                let mut actions = Vec::new();
                while self.depth() < self.capacity {
                    let Some(producer) = self.blocked.pop_front() else {
                        break;
                    };
                    actions.extend(self.enqueue(ctx, producer));
                }
                actions
            }
            _ => Vec::new(),
        }
    }

    fn load(&self) -> ModelLoad {
        ModelLoad {
            queue_depth: self.depth(),
            active: self.lanes.iter().map(|l| l.busy as u64).sum(),
            capacity: self.lanes.iter().map(|l| l.spec.consumers as u64).sum(),
            queue_capacity: (self.capacity != u64::MAX).then_some(self.capacity),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use archsim_core::Operation;
    use archsim_types::{ComponentType, QueueCapacity, SystemArchitecture};

    fn queue(capacity: u64, consumers: u32, backpressure: BackpressurePolicy) -> ComponentDefinition {
        ComponentDefinition::new("q", ComponentType::Queue).with_config(ComponentConfig::Queue(
            QueueConfig {
                capacity: QueueCapacity {
                    max_messages: capacity,
                    max_message_size: 1024,
                },
                consumers,
                backpressure,
                ..Default::default()
            },
        ))
    }

    #[test]
    fn test_full_queue_rejects_with_queue_full() {
        let def = queue(2, 0, BackpressurePolicy::Reject);
        let mut h = Harness::new(SystemArchitecture::new("q").with_component(def.clone()));
        let mut model = QueueModel::new(&def);

        let mut last = Vec::new();
        for _ in 0..3 {
            let call = h.call("q", Operation::Write, "k", "u");
            last = h.with("q", |ctx| model.on_arrival(ctx, call));
        }
        let kinds = emitted(&last);
        assert!(kinds.contains(&EventKind::QueueFull));
        assert_eq!(resolved(&last)[0].1, CallOutcome::rejected("queue-full"));
        assert_eq!(model.load().queue_depth, 2);
    }

    #[test]
    fn test_producer_acked_and_message_held_open() {
        let def = queue(10, 1, BackpressurePolicy::Reject);
        let mut h = Harness::new(SystemArchitecture::new("q").with_component(def.clone()));
        let mut model = QueueModel::new(&def);
        let call = h.call("q", Operation::Write, "k", "u");

        let actions = h.with("q", |ctx| model.on_arrival(ctx, call));
        assert!(actions.iter().any(|a| matches!(a, Action::Open { .. })));
        assert_eq!(resolved(&actions), vec![(call, CallOutcome::success())]);
        // Internal consumer picked the message up right away.
        assert!(emitted(&actions).contains(&EventKind::RequestDequeued));
        assert_eq!(scheduled(&actions)[0].0, EventKind::ProcessingComplete);
    }

    #[test]
    fn test_failed_delivery_is_redelivered_then_dead_lettered() {
        let def = ComponentDefinition::new("q", ComponentType::Queue)
            .with_config(ComponentConfig::Queue(QueueConfig {
                visibility: archsim_types::VisibilitySpec {
                    timeout_ms: 1_000.0,
                    max_receives: 2,
                },
                ..Default::default()
            }))
            .with_dependencies(["worker"]);
        let arch = SystemArchitecture::new("q")
            .with_component(def.clone())
            .with_component(ComponentDefinition::new("worker", ComponentType::Microservice));
        let mut h = Harness::new(arch);
        let mut model = QueueModel::new(&def);
        h.with("q", |ctx| model.on_start(ctx));

        let call = h.call("q", Operation::Write, "k", "u");
        let actions = h.with("q", |ctx| model.on_arrival(ctx, call));
        let (lead, target) = forwarded(&actions)[0].clone();
        assert_eq!(target, ComponentId::new("worker"));

        // First failure: redelivered over the same holder call.
        let retry = h.with("q", |ctx| {
            model.on_child_outcome(ctx, lead, CallId(999), &CallOutcome::error("boom"))
        });
        assert_eq!(forwarded(&retry), vec![(lead, ComponentId::new("worker"))]);

        // Second failure reaches maxReceives.
        let dead = h.with("q", |ctx| {
            model.on_child_outcome(ctx, lead, CallId(1000), &CallOutcome::error("boom"))
        });
        assert_eq!(resolved(&dead), vec![(lead, CallOutcome::error("dead-lettered"))]);
        assert_eq!(model.dead_lettered(), 1);
    }

    #[test]
    fn test_batching_waits_for_full_batch() {
        let def = ComponentDefinition::new("q", ComponentType::Queue).with_config(
            ComponentConfig::Queue(QueueConfig {
                batching: Some(BatchingSpec {
                    enabled: true,
                    max_size: 2,
                    max_wait_ms: 50.0,
                }),
                ..Default::default()
            }),
        );
        let mut h = Harness::new(SystemArchitecture::new("q").with_component(def.clone()));
        let mut model = QueueModel::new(&def);

        let a = h.call("q", Operation::Write, "a", "u");
        let first = h.with("q", |ctx| model.on_arrival(ctx, a));
        assert_eq!(scheduled(&first), vec![(EventKind::ModelTimer, 50_000)]);

        let b = h.call("q", Operation::Write, "b", "u");
        let second = h.with("q", |ctx| model.on_arrival(ctx, b));
        let dequeued = emitted(&second)
            .into_iter()
            .filter(|k| *k == EventKind::RequestDequeued)
            .count();
        assert_eq!(dequeued, 2);
        assert_eq!(model.load().active, 1);
    }
}
