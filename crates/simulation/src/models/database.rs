//! Databases and other stateful stores.
//!
//! Replica 0 starts as the primary. Writes go to the primary; reads are
//! served by whichever replica the kernel routed the call to and may be
//! stale while that replica lags.

use archsim_core::{Action, CallOutcome, EventKind, EventPayload, ModelTimer, Operation};
use archsim_types::{
    CallId, ComponentConfig, ComponentDefinition, DatabaseConfig, ReplicationMode, SimTime,
};
use std::collections::{BTreeMap, VecDeque};
use tracing::debug;

use super::{BehaviorModel, ModelContext, ModelLoad, StorageStats};

/// Lag above which replication is reported.
const LAG_REPORT_MS: f64 = 1_000.0;

/// Failover time used when a failover is requested without a failover spec.
const DEFAULT_FAILOVER_MS: f64 = 1_000.0;

/// How long recent writes are remembered for data-loss accounting.
const WRITE_MEMORY_MS: f64 = 60_000.0;

#[derive(Debug)]
pub struct DatabaseModel {
    config: DatabaseConfig,
    pool_max: u32,
    pool_in_use: u32,
    waiting: VecDeque<CallId>,
    exhausted: bool,
    primary: usize,
    lag_ms: BTreeMap<usize, f64>,
    last_write: BTreeMap<String, SimTime>,
    recent_writes: VecDeque<SimTime>,
    failing_over: bool,
    split_brain: bool,
    stats: StorageStats,
}

impl DatabaseModel {
    pub fn new(def: &ComponentDefinition) -> Self {
        let config = match &def.config {
            ComponentConfig::Database(db) => db.clone(),
            _ => DatabaseConfig::default(),
        };
        let pool_max = config.connection_pool.max_connections.max(1);
        Self {
            config,
            pool_max,
            pool_in_use: 0,
            waiting: VecDeque::new(),
            exhausted: false,
            primary: 0,
            lag_ms: BTreeMap::new(),
            last_write: BTreeMap::new(),
            recent_writes: VecDeque::new(),
            failing_over: false,
            split_brain: false,
            stats: StorageStats {
                pool_max,
                ..Default::default()
            },
        }
    }

    pub fn primary(&self) -> usize {
        self.primary
    }

    fn refresh_pool(&mut self, ctx: &ModelContext<'_>) {
        let configured = self.config.connection_pool.max_connections.max(1);
        self.pool_max = ctx
            .effects(None)
            .connection_limit
            .map_or(configured, |limit| limit.min(configured));
        self.stats.pool_max = self.pool_max;
    }

    fn primary_down(&self, ctx: &ModelContext<'_>) -> bool {
        ctx.runtime()
            .and_then(|r| r.replicas.get(self.primary))
            .map_or(true, |replica| !replica.is_ready(ctx.now))
    }

    fn start(&mut self, ctx: &mut ModelContext<'_>, call: CallId) -> Vec<Action> {
        let Some((request, op, replica)) = ctx.call(call).map(|c| (c.request, c.op, c.replica))
        else {
            return Vec::new();
        };
        let mut actions = Vec::new();
        let mut slowdown = 1.0;

        let base = if op == Operation::Write {
            self.stats.writes_attempted += 1;
            if self.failing_over || self.primary_down(ctx) {
                return vec![Action::resolve(call, CallOutcome::error("primary-unavailable"))];
            }
            let disk = ctx.effects(Some(self.primary)).disk_full;
            if disk >= 100.0 {
                return vec![
                    Action::emit_for(EventKind::StorageFull, request, EventPayload::None),
                    Action::resolve(call, CallOutcome::error("storage-full")),
                ];
            }
            if disk >= 90.0 {
                slowdown = 3.0;
                actions.push(Action::emit_for(
                    EventKind::StorageThrottled,
                    request,
                    EventPayload::None,
                ));
            }
            let dist = self.config.query_latency.write.clone();
            ctx.sample_ms(&dist)
        } else {
            let dist = self
                .config
                .query_latency
                .indexed_read
                .clone()
                .unwrap_or_else(|| self.config.query_latency.read.clone());
            ctx.sample_ms(&dist)
        };

        self.pool_in_use += 1;
        let serving = if op == Operation::Write {
            Some(self.primary)
        } else {
            replica
        };
        let delay = ctx.service_time_us(base * slowdown, serving);
        actions.push(Action::after(
            EventKind::ProcessingComplete,
            delay,
            EventPayload::Call { call },
        ));
        actions
    }

    fn apply_write(&mut self, ctx: &mut ModelContext<'_>, call: CallId) -> Vec<Action> {
        let Some((request, key)) = ctx.call(call).map(|c| (c.request, c.key.clone())) else {
            return Vec::new();
        };
        let mut actions = vec![Action::RecordWrite { call }];
        self.stats.writes_succeeded += 1;
        self.last_write.insert(key, ctx.now);
        self.recent_writes.push_back(ctx.now);
        let horizon = archsim_types::millis_to_micros(WRITE_MEMORY_MS);
        while self
            .recent_writes
            .front()
            .is_some_and(|t| ctx.now.micros_since(*t) > horizon)
        {
            self.recent_writes.pop_front();
        }

        if self.split_brain {
            self.stats.write_conflicts += 1;
            actions.push(Action::emit_for(
                EventKind::WriteConflict,
                request,
                EventPayload::Note {
                    detail: "write accepted on both sides of a partition".to_string(),
                },
            ));
        }

        if let Some(replication) = self.config.replication.clone() {
            let replicas = ctx.runtime().map_or(0, |r| r.replicas.len());
            for r in (0..replicas).filter(|r| *r != self.primary) {
                let lag = match replication.mode {
                    ReplicationMode::Sync => 0.0,
                    _ => ctx.sample_ms(&replication.lag_distribution),
                };
                self.lag_ms.insert(r, lag);
                self.stats.replica_lag_ms.push(lag);
                if lag > LAG_REPORT_MS {
                    actions.push(Action::emit_for(
                        EventKind::ReplicationLag,
                        request,
                        EventPayload::Note {
                            detail: format!("replica {r} lagging {lag:.0}ms"),
                        },
                    ));
                }
            }
        }
        actions
    }

    fn check_staleness(&mut self, ctx: &ModelContext<'_>, call: CallId) -> Vec<Action> {
        let Some(c) = ctx.call(call) else {
            return Vec::new();
        };
        let Some(replica) = c.replica.filter(|r| *r != self.primary) else {
            return Vec::new();
        };
        let lag_us = archsim_types::millis_to_micros(self.lag_ms.get(&replica).copied().unwrap_or(0.0));
        let stale = self
            .last_write
            .get(&c.key)
            .is_some_and(|written| written.plus_micros(lag_us) > ctx.now);
        if !stale {
            return Vec::new();
        }
        self.stats.stale_reads += 1;
        vec![Action::emit_for(
            EventKind::StaleRead,
            c.request,
            EventPayload::Cache { key: c.key.clone() },
        )]
    }

    fn release(&mut self, ctx: &mut ModelContext<'_>) -> Vec<Action> {
        let mut actions = Vec::new();
        while self.pool_in_use < self.pool_max {
            let Some(next) = self.waiting.pop_front() else {
                break;
            };
            actions.extend(self.start(ctx, next));
        }
        if self.waiting.is_empty() {
            self.exhausted = false;
        }
        actions
    }

    fn begin_failover(&mut self, ctx: &ModelContext<'_>, requested: bool) -> Vec<Action> {
        if self.failing_over {
            return Vec::new();
        }
        let delay_ms = match &self.config.failover {
            Some(spec) if spec.automatic_failover || requested => {
                spec.detection_time_ms + spec.failover_time_ms
            }
            None if requested => DEFAULT_FAILOVER_MS,
            _ => return Vec::new(),
        };
        let Some(candidate) = ctx.runtime().and_then(|r| {
            r.ready_replicas(ctx.now)
                .into_iter()
                .find(|i| *i != self.primary)
        }) else {
            return Vec::new();
        };
        self.failing_over = true;
        debug!(db = ctx.id.as_str(), from = self.primary, to = candidate, delay_ms, "failover started");
        vec![Action::after(
            EventKind::ModelTimer,
            archsim_types::millis_to_micros(delay_ms),
            EventPayload::Timer {
                timer: ModelTimer::FailoverComplete {
                    new_primary: candidate,
                },
            },
        )]
    }

    fn complete_failover(&mut self, ctx: &ModelContext<'_>, new_primary: usize) -> Vec<Action> {
        self.failing_over = false;
        let previous = self.primary;
        self.primary = new_primary;
        let lag = self.lag_ms.get(&new_primary).copied().unwrap_or(0.0);
        let asynchronous = self
            .config
            .replication
            .as_ref()
            .is_some_and(|r| r.mode != ReplicationMode::Sync);
        let data_loss_risk = asynchronous && lag > 0.0;
        if data_loss_risk {
            let window = archsim_types::millis_to_micros(lag);
            let lost = self
                .recent_writes
                .iter()
                .filter(|t| ctx.now.micros_since(**t) <= window)
                .count() as u64;
            self.stats.writes_lost += lost;
        }
        self.lag_ms.insert(new_primary, 0.0);
        debug!(db = ctx.id.as_str(), previous, new_primary, lag_ms = lag, data_loss_risk, "failover complete");
        vec![Action::emit(
            EventKind::DbFailover,
            EventPayload::Failover {
                previous_primary: previous,
                new_primary,
                replication_lag_ms: lag,
                data_loss_risk,
            },
        )]
    }
}

impl BehaviorModel for DatabaseModel {
    fn on_arrival(&mut self, ctx: &mut ModelContext<'_>, call: CallId) -> Vec<Action> {
        self.refresh_pool(ctx);
        if self.pool_in_use < self.pool_max {
            return self.start(ctx, call);
        }
        let Some(request) = ctx.call(call).map(|c| c.request) else {
            return Vec::new();
        };
        self.waiting.push_back(call);
        let mut actions = Vec::new();
        if !self.exhausted {
            self.exhausted = true;
            actions.push(Action::emit_for(
                EventKind::DbConnectionPoolExhausted,
                request,
                EventPayload::Backlog {
                    depth: self.waiting.len() as u64,
                    max_depth: self.pool_max as u64,
                },
            ));
        }
        actions.push(Action::after(
            EventKind::ModelTimer,
            archsim_types::millis_to_micros(self.config.connection_pool.connection_timeout_ms),
            EventPayload::Timer {
                timer: ModelTimer::ConnectionWait { call },
            },
        ));
        actions
    }

    fn on_processing_complete(
        &mut self,
        ctx: &mut ModelContext<'_>,
        call: CallId,
    ) -> Vec<Action> {
        self.pool_in_use = self.pool_in_use.saturating_sub(1);
        let is_write = ctx.call(call).is_some_and(|c| c.op == Operation::Write);

        let mut actions = if ctx.lost_replica(call) {
            vec![Action::resolve(call, CallOutcome::error("node-failure"))]
        } else if is_write && (self.failing_over || self.primary_down(ctx)) {
            vec![Action::resolve(call, CallOutcome::error("primary-unavailable"))]
        } else {
            let mut done = if is_write {
                self.apply_write(ctx, call)
            } else {
                self.check_staleness(ctx, call)
            };
            done.push(Action::resolve(call, CallOutcome::success()));
            done
        };
        actions.extend(self.release(ctx));
        actions
    }

    fn on_child_outcome(
        &mut self,
        _ctx: &mut ModelContext<'_>,
        _parent: CallId,
        _child: CallId,
        _outcome: &CallOutcome,
    ) -> Vec<Action> {
        Vec::new()
    }

    fn on_timer(&mut self, ctx: &mut ModelContext<'_>, timer: &ModelTimer) -> Vec<Action> {
        match timer {
            ModelTimer::ConnectionWait { call } => {
                let before = self.waiting.len();
                self.waiting.retain(|c| c != call);
                if self.waiting.len() < before {
                    vec![Action::resolve(*call, CallOutcome::error("pool-timeout"))]
                } else {
                    Vec::new()
                }
            }
            ModelTimer::FailoverRequested => self.begin_failover(ctx, true),
            ModelTimer::FailoverComplete { new_primary } => {
                self.complete_failover(ctx, *new_primary)
            }
            _ => Vec::new(),
        }
    }

    fn on_runtime_change(&mut self, ctx: &mut ModelContext<'_>) -> Vec<Action> {
        self.refresh_pool(ctx);
        self.split_brain = self.config.replication.is_some()
            && !ctx.effects(None).partitioned_with.is_empty();
        let mut actions = if self.primary_down(ctx) {
            self.begin_failover(ctx, false)
        } else {
            Vec::new()
        };
        actions.extend(self.release(ctx));
        actions
    }

    fn load(&self) -> ModelLoad {
        ModelLoad {
            queue_depth: self.waiting.len() as u64,
            active: self.pool_in_use as u64,
            capacity: self.pool_max as u64,
            queue_capacity: None,
        }
    }

    fn storage(&self) -> Option<StorageStats> {
        Some(StorageStats {
            pool_in_use: self.pool_in_use,
            ..self.stats.clone()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use archsim_types::{
        ComponentType, ConnectionPoolSpec, DistributionConfig, FailoverSpec, FaultId,
        ReplicationSpec, SystemArchitecture,
    };

    fn db(config: DatabaseConfig) -> (ComponentDefinition, Harness) {
        let def = ComponentDefinition::new("db", ComponentType::RelationalDb)
            .with_config(ComponentConfig::Database(config));
        let h = Harness::new(SystemArchitecture::new("db").with_component(def.clone()));
        (def, h)
    }

    fn replicated(mode: ReplicationMode, lag_ms: f64) -> DatabaseConfig {
        DatabaseConfig {
            replication: Some(ReplicationSpec {
                mode,
                replicas: 1,
                lag_distribution: DistributionConfig::constant(lag_ms),
            }),
            failover: Some(FailoverSpec {
                automatic_failover: true,
                detection_time_ms: 100.0,
                failover_time_ms: 400.0,
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_pool_exhaustion_then_wait_timeout() {
        let (def, mut h) = db(DatabaseConfig {
            connection_pool: ConnectionPoolSpec {
                max_connections: 1,
                connection_timeout_ms: 250.0,
                ..Default::default()
            },
            ..Default::default()
        });
        let mut model = DatabaseModel::new(&def);
        let a = h.call("db", Operation::Read, "k", "u");
        let b = h.call("db", Operation::Read, "k", "u");

        h.with("db", |ctx| model.on_arrival(ctx, a));
        let queued = h.with("db", |ctx| model.on_arrival(ctx, b));
        assert!(emitted(&queued).contains(&EventKind::DbConnectionPoolExhausted));
        assert_eq!(scheduled(&queued), vec![(EventKind::ModelTimer, 250_000)]);

        let timeout = h.with("db", |ctx| {
            model.on_timer(ctx, &ModelTimer::ConnectionWait { call: b })
        });
        assert_eq!(resolved(&timeout), vec![(b, CallOutcome::error("pool-timeout"))]);
    }

    #[test]
    fn test_read_from_lagging_replica_is_stale() {
        let (def, mut h) = db(replicated(ReplicationMode::Async, 500.0));
        let mut model = DatabaseModel::new(&def);

        let write = h.call("db", Operation::Write, "k", "u");
        h.with("db", |ctx| model.on_arrival(ctx, write));
        let applied = h.with("db", |ctx| model.on_processing_complete(ctx, write));
        assert!(applied.contains(&Action::RecordWrite { call: write }));

        h.now = SimTime::from_millis(100);
        let read = h.call("db", Operation::Read, "k", "u");
        if let Some(c) = h.calls.get_mut(&read) {
            c.replica = Some(1);
        }
        h.with("db", |ctx| model.on_arrival(ctx, read));
        let served = h.with("db", |ctx| model.on_processing_complete(ctx, read));
        assert!(emitted(&served).contains(&EventKind::StaleRead));
        assert_eq!(model.storage().map(|s| s.stale_reads), Some(1));
    }

    #[test]
    fn test_primary_crash_fails_over_and_loses_async_writes() {
        let (def, mut h) = db(replicated(ReplicationMode::Async, 2_000.0));
        let mut model = DatabaseModel::new(&def);

        let write = h.call("db", Operation::Write, "k", "u");
        h.with("db", |ctx| model.on_arrival(ctx, write));
        h.with("db", |ctx| model.on_processing_complete(ctx, write));

        if let Some(runtime) = h.state.component_mut(&def.id) {
            runtime.replicas[0].crashed_by.insert(FaultId::new("crash"));
        }
        let started = h.with("db", |ctx| model.on_runtime_change(ctx));
        assert_eq!(scheduled(&started), vec![(EventKind::ModelTimer, 500_000)]);

        // Writes fail while the roles swap.
        let blocked = h.call("db", Operation::Write, "k2", "u");
        let rejected = h.with("db", |ctx| model.on_arrival(ctx, blocked));
        assert_eq!(
            resolved(&rejected),
            vec![(blocked, CallOutcome::error("primary-unavailable"))]
        );

        h.now = SimTime::from_millis(500);
        let done = h.with("db", |ctx| {
            model.on_timer(ctx, &ModelTimer::FailoverComplete { new_primary: 1 })
        });
        assert_eq!(emitted(&done), vec![EventKind::DbFailover]);
        assert_eq!(model.primary(), 1);
        assert_eq!(model.storage().map(|s| s.writes_lost), Some(1));
    }

    #[test]
    fn test_full_disk_fails_writes() {
        let (def, mut h) = db(DatabaseConfig::default());
        let mut model = DatabaseModel::new(&def);
        if let Some(runtime) = h.state.component_mut(&def.id) {
            runtime.faults.insert(
                FaultId::new("disk"),
                crate::state::AppliedFault {
                    spec: archsim_types::FaultSpec::DiskFull {
                        percent_full: 100.0,
                    },
                    replicas: None,
                },
            );
        }
        let write = h.call("db", Operation::Write, "k", "u");
        let actions = h.with("db", |ctx| model.on_arrival(ctx, write));
        assert!(emitted(&actions).contains(&EventKind::StorageFull));
        assert_eq!(resolved(&actions), vec![(write, CallOutcome::error("storage-full"))]);
    }
}
