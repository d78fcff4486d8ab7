//! Caches and CDNs.
//!
//! Hit or miss is decided either by the configured hit rate, scaled by how
//! warm the cache is since its last flush, or, with `trackEntries`, by the
//! keys actually stored. Misses go to the first dependency (the origin).

use archsim_core::{Action, CallOutcome, EventKind, EventPayload, Operation};
use archsim_types::{
    CallId, ComponentConfig, ComponentDefinition, EvictionPolicy, HitMissLatency, SimTime,
};
use std::collections::BTreeMap;
use tracing::debug;

use super::{propagate_failure, BehaviorModel, ModelContext, ModelLoad};
use crate::state::ComponentRuntime;

#[derive(Debug, Clone)]
struct Entry {
    inserted_at: SimTime,
    last_used: SimTime,
    uses: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lookup {
    Hit,
    Miss,
}

#[derive(Debug)]
pub struct CacheModel {
    hit_rate: f64,
    latency: HitMissLatency,
    track_entries: bool,
    coalesce_misses: bool,
    warmup_ms: f64,
    max_keys: u64,
    eviction: EvictionPolicy,
    ttl_ms: f64,
    flushed_at: Option<SimTime>,
    was_down: bool,
    entries: BTreeMap<String, Entry>,
    lookups: BTreeMap<CallId, Lookup>,
    /// Calls waiting on an origin fetch, by key. The first is the fetcher.
    fetches: BTreeMap<String, Vec<CallId>>,
    fetch_keys: BTreeMap<CallId, String>,
    active: u64,
}

impl CacheModel {
    pub fn new(def: &ComponentDefinition) -> Self {
        let (hit_rate, latency, track, coalesce, warmup_ms, max_keys, eviction, ttl_ms) =
            match &def.config {
                ComponentConfig::Cache(c) => (
                    c.hit_rate,
                    c.latency.clone(),
                    c.track_entries,
                    c.coalesce_misses,
                    c.warmup_ms,
                    c.capacity.max_keys,
                    c.eviction,
                    c.default_ttl_ms,
                ),
                ComponentConfig::Cdn(c) => (
                    c.hit_rate,
                    c.latency.clone(),
                    false,
                    false,
                    10_000.0,
                    u64::MAX,
                    EvictionPolicy::Ttl,
                    c.caching.default_ttl_sec * 1_000.0,
                ),
                _ => {
                    let c = archsim_types::CacheConfig::default();
                    (
                        c.hit_rate,
                        c.latency,
                        c.track_entries,
                        c.coalesce_misses,
                        c.warmup_ms,
                        c.capacity.max_keys,
                        c.eviction,
                        c.default_ttl_ms,
                    )
                }
            };
        Self {
            hit_rate,
            latency,
            track_entries: track,
            coalesce_misses: coalesce,
            warmup_ms,
            max_keys: max_keys.max(1),
            eviction,
            ttl_ms,
            flushed_at: None,
            was_down: false,
            entries: BTreeMap::new(),
            lookups: BTreeMap::new(),
            fetches: BTreeMap::new(),
            fetch_keys: BTreeMap::new(),
            active: 0,
        }
    }

    /// Share of the steady-state hit rate reachable `now`.
    fn warmth(&self, now: SimTime) -> f64 {
        match self.flushed_at {
            None => 1.0,
            Some(_) if self.warmup_ms <= 0.0 => 1.0,
            Some(at) => {
                let elapsed_ms = archsim_types::micros_to_millis(now.micros_since(at));
                (elapsed_ms / self.warmup_ms).min(1.0)
            }
        }
    }

    fn is_fresh(&self, entry: &Entry, now: SimTime) -> bool {
        self.ttl_ms <= 0.0
            || archsim_types::micros_to_millis(now.micros_since(entry.inserted_at)) < self.ttl_ms
    }

    fn lookup(&mut self, ctx: &mut ModelContext<'_>, key: &str) -> Lookup {
        if self.track_entries {
            let now = ctx.now;
            let fresh = self.entries.get(key).is_some_and(|e| self.is_fresh(e, now));
            if fresh {
                if let Some(entry) = self.entries.get_mut(key) {
                    entry.last_used = now;
                    entry.uses += 1;
                }
                Lookup::Hit
            } else {
                self.entries.remove(key);
                Lookup::Miss
            }
        } else if ctx.rng.chance(self.hit_rate * self.warmth(ctx.now)) {
            Lookup::Hit
        } else {
            Lookup::Miss
        }
    }

    fn victim(&self, ctx: &mut ModelContext<'_>) -> Option<String> {
        let pick_min = |score: &dyn Fn(&Entry) -> (u64, u64)| {
            self.entries
                .iter()
                .min_by_key(|(_, e)| score(e))
                .map(|(k, _)| k.clone())
        };
        match self.eviction {
            EvictionPolicy::Lru => pick_min(&|e| (e.last_used.0, e.inserted_at.0)),
            EvictionPolicy::Lfu => pick_min(&|e| (e.uses, e.last_used.0)),
            EvictionPolicy::Fifo | EvictionPolicy::Ttl => {
                pick_min(&|e| (e.inserted_at.0, e.last_used.0))
            }
            EvictionPolicy::Random => {
                let index = ctx.rng.below(self.entries.len());
                self.entries.keys().nth(index).cloned()
            }
        }
    }

    fn populate(&mut self, ctx: &mut ModelContext<'_>, key: &str) -> Vec<Action> {
        if !self.track_entries {
            return Vec::new();
        }
        let mut actions = Vec::new();
        if !self.entries.contains_key(key) && self.entries.len() as u64 >= self.max_keys {
            if let Some(victim) = self.victim(ctx) {
                self.entries.remove(&victim);
                actions.push(Action::emit(
                    EventKind::CacheEviction,
                    EventPayload::Cache { key: victim },
                ));
            }
        }
        self.entries.insert(
            key.to_string(),
            Entry {
                inserted_at: ctx.now,
                last_used: ctx.now,
                uses: 1,
            },
        );
        actions
    }

    fn flush(&mut self, now: SimTime) {
        self.entries.clear();
        self.flushed_at = Some(now);
    }

    pub fn entries(&self) -> usize {
        self.entries.len()
    }

    /// Finish every call waiting on the fetch of `key`.
    fn finish_fetch(&mut self, key: &str, outcome: &CallOutcome) -> Vec<Action> {
        let waiters = self.fetches.remove(key).unwrap_or_default();
        waiters
            .into_iter()
            .map(|call| {
                self.fetch_keys.remove(&call);
                Action::resolve(call, propagate_failure(outcome))
            })
            .collect()
    }
}

impl BehaviorModel for CacheModel {
    fn on_arrival(&mut self, ctx: &mut ModelContext<'_>, call: CallId) -> Vec<Action> {
        let Some((request, op, key, replica)) = ctx
            .call(call)
            .map(|c| (c.request, c.op, c.key.clone(), c.replica))
        else {
            return Vec::new();
        };
        self.active += 1;
        let mut actions = Vec::new();

        let lookup = if op == Operation::Write {
            // Writes invalidate and go through to the origin.
            self.entries.remove(&key);
            Lookup::Miss
        } else {
            let lookup = self.lookup(ctx, &key);
            let kind = match lookup {
                Lookup::Hit => EventKind::CacheHit,
                Lookup::Miss => EventKind::CacheMiss,
            };
            actions.push(Action::emit_for(kind, request, EventPayload::Cache { key }));
            lookup
        };
        self.lookups.insert(call, lookup);

        let dist = match lookup {
            Lookup::Hit => self.latency.hit.clone(),
            Lookup::Miss => self.latency.miss.clone(),
        };
        let base = ctx.sample_ms(&dist);
        let delay = ctx.service_time_us(base, replica);
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
        let Some(lookup) = self.lookups.remove(&call) else {
            return Vec::new();
        };
        if ctx.lost_replica(call) {
            return vec![Action::resolve(call, CallOutcome::error("node-failure"))];
        }
        if lookup == Lookup::Hit {
            return vec![Action::resolve(call, CallOutcome::success())];
        }
        let Some(origin) = ctx.dependencies().first().cloned() else {
            return vec![Action::resolve(call, CallOutcome::success())];
        };
        let Some((request, key, op)) = ctx.call(call).map(|c| (c.request, c.key.clone(), c.op))
        else {
            return Vec::new();
        };

        let mut actions = Vec::new();
        if op == Operation::Read {
            if let Some(waiters) = self.fetches.get_mut(&key) {
                if self.coalesce_misses {
                    waiters.push(call);
                    self.fetch_keys.insert(call, key);
                    return actions;
                }
                if waiters.len() == 1 {
                    debug!(cache = ctx.id.as_str(), key = %key, "concurrent misses on one key");
                    actions.push(Action::emit_for(
                        EventKind::CacheStampede,
                        request,
                        EventPayload::Cache { key: key.clone() },
                    ));
                }
                waiters.push(call);
                self.fetch_keys.insert(call, key);
                actions.push(Action::forward(call, origin));
                return actions;
            }
            self.fetches.insert(key.clone(), vec![call]);
        }
        self.fetch_keys.insert(call, key);
        actions.push(Action::forward(call, origin));
        actions
    }

    fn on_child_outcome(
        &mut self,
        ctx: &mut ModelContext<'_>,
        parent: CallId,
        _child: CallId,
        outcome: &CallOutcome,
    ) -> Vec<Action> {
        let Some(key) = self.fetch_keys.remove(&parent) else {
            return Vec::new();
        };
        let is_read = ctx.call(parent).is_some_and(|c| c.op == Operation::Read);
        let mut actions = Vec::new();
        if outcome.is_success() && is_read {
            actions.extend(self.populate(ctx, &key));
        }
        if self.coalesce_misses && is_read {
            actions.extend(self.finish_fetch(&key, outcome));
            return actions;
        }
        if let Some(waiters) = self.fetches.get_mut(&key) {
            waiters.retain(|c| *c != parent);
            if waiters.is_empty() {
                self.fetches.remove(&key);
            }
        }
        actions.push(Action::resolve(parent, propagate_failure(outcome)));
        actions
    }

    fn on_runtime_change(&mut self, ctx: &mut ModelContext<'_>) -> Vec<Action> {
        let down = is_down(ctx.runtime(), ctx.now);
        if down && !self.was_down {
            debug!(cache = ctx.id.as_str(), entries = self.entries.len(), "cache flushed");
            self.flush(ctx.now);
        }
        self.was_down = down;
        Vec::new()
    }

    fn load(&self) -> ModelLoad {
        ModelLoad {
            queue_depth: 0,
            active: self.active + self.fetch_keys.len() as u64,
            capacity: 0,
            queue_capacity: None,
        }
    }
}

/// Down, or any replica lost to a crash.
fn is_down(runtime: Option<&ComponentRuntime>, now: SimTime) -> bool {
    runtime.map_or(true, |r| {
        !r.is_available(now) || r.replicas.iter().any(|replica| replica.is_crashed())
    })
}
