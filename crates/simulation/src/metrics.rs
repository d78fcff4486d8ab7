//! Metrics collection.
//!
//! The collector is a passive observer: the kernel reports sealed requests,
//! resolved calls, edge outcomes, availability transitions and periodic load
//! snapshots, and [`MetricsCollector::finish`] folds them into aggregate
//! metrics, time series, heatmaps, SLO breaches and the inputs of Little's
//! law.
//!
//! Latency percentiles come from `hdrhistogram` at microsecond precision.
//! Aggregates skip requests created during warmup; time series cover the
//! whole run.

use archsim_core::{
    Availability, ComponentSeries, Consistency, Durability, EdgeMetrics, ErrorMetrics,
    FindingSeverity, GlobalSeries, Heatmap, Heatmaps, LatencySummary, LittlesLawCheck,
    MetricsDefinition, MetricsOutput, Recovery, RequestStatus, RequestTrace, Saturation,
    SloBreach, SloType, Throughput, TimeSeriesOutput,
};
use archsim_types::{
    micros_to_millis, millis_to_micros, CallId, ComponentId, EdgeId, SimTime, SloConfig,
};
use hdrhistogram::Histogram;
use std::collections::{BTreeMap, BTreeSet};

use crate::models::StorageStats;

/// Components need at least this many finished calls for a Little's law
/// check.
pub const LITTLES_LAW_MIN_CALLS: u64 = 30;

/// Relative error within which Little's law is considered to hold.
pub const LITTLES_LAW_TOLERANCE: f64 = 0.1;

/// Latency histogram in microseconds.
#[derive(Debug, Clone)]
pub struct LatencyHistogram(Histogram<u64>);

impl Default for LatencyHistogram {
    fn default() -> Self {
        // Three significant figures is always a valid precision.
        Self(Histogram::new(3).expect("histogram creation should succeed"))
    }
}

impl LatencyHistogram {
    pub fn record(&mut self, latency_us: u64) {
        self.0.saturating_record(latency_us);
    }

    pub fn summary(&self) -> LatencySummary {
        if self.0.is_empty() {
            return LatencySummary::default();
        }
        let q = |quantile: f64| micros_to_millis(self.0.value_at_quantile(quantile));
        LatencySummary {
            p50: q(0.5),
            p90: q(0.9),
            p95: q(0.95),
            p99: q(0.99),
            p999: q(0.999),
            min: micros_to_millis(self.0.min()),
            max: micros_to_millis(self.0.max()),
            mean: self.0.mean() / 1_000.0,
            std_dev: self.0.stdev() / 1_000.0,
            samples: self.0.len(),
        }
    }
}

/// How a call over an edge ended, from the caller's side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeResult {
    Success,
    Failure,
    Timeout,
    Dropped,
    ShortCircuited,
}

/// Load of one component at a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentSample {
    pub component: ComponentId,
    pub queue_depth: u64,
    pub active: u64,
    pub ready_replicas: u64,
    /// Percent.
    pub cpu: f64,
    /// Percent.
    pub memory: f64,
    /// 0-1.
    pub queue_utilization: f64,
    /// 0-1.
    pub pool_utilization: f64,
    pub available: bool,
}

#[derive(Debug, Clone, Default)]
struct Counters {
    total: u64,
    success: u64,
    errors: u64,
    timeouts: u64,
    rejected: u64,
    errors_by_type: BTreeMap<String, u64>,
}

impl Counters {
    fn record(&mut self, status: RequestStatus, label: Option<&str>) {
        self.total += 1;
        match status {
            RequestStatus::Success => self.success += 1,
            RequestStatus::Error => self.errors += 1,
            RequestStatus::Timeout => self.timeouts += 1,
            RequestStatus::Rejected => self.rejected += 1,
        }
        if status != RequestStatus::Success {
            let label = label.unwrap_or(status.as_str()).to_string();
            *self.errors_by_type.entry(label).or_insert(0) += 1;
        }
    }

    fn errors(&self) -> ErrorMetrics {
        let rate = |n: u64| if self.total == 0 { 0.0 } else { n as f64 / self.total as f64 };
        ErrorMetrics {
            error_rate: rate(self.total - self.success),
            errors_by_type: self.errors_by_type.clone(),
            timeout_rate: rate(self.timeouts),
            rejection_rate: rate(self.rejected),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Uptime {
    available: bool,
    since: SimTime,
    up_us: u64,
    down_us: u64,
    failures: u64,
    recoveries: u64,
    repair_us: u64,
}

impl Uptime {
    fn set(&mut self, now: SimTime, available: bool) {
        if available == self.available {
            return;
        }
        let span = now.micros_since(self.since);
        if self.available {
            self.up_us += span;
            self.failures += 1;
        } else {
            self.down_us += span;
            self.recoveries += 1;
            self.repair_us += span;
        }
        self.available = available;
        self.since = now;
    }

    fn close(&mut self, end: SimTime) {
        let span = end.micros_since(self.since);
        if self.available {
            self.up_us += span;
        } else {
            self.down_us += span;
        }
        self.since = end;
    }

    fn recovery(&self) -> Recovery {
        Recovery {
            mttr: if self.recoveries == 0 {
                0.0
            } else {
                micros_to_millis(self.repair_us) / self.recoveries as f64
            },
            mtbf: micros_to_millis(self.up_us) / self.failures.max(1) as f64,
            failure_count: self.failures,
            recovery_count: self.recoveries,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct SaturationSums {
    samples: u64,
    cpu: f64,
    memory: f64,
    queue_length: f64,
    queue_utilization: f64,
    pool_utilization: f64,
}

impl SaturationSums {
    fn add(&mut self, s: &ComponentSample) {
        self.samples += 1;
        self.cpu += s.cpu;
        self.memory += s.memory;
        self.queue_length += s.queue_depth as f64;
        self.queue_utilization += s.queue_utilization;
        self.pool_utilization += s.pool_utilization;
    }

    fn mean(&self) -> Saturation {
        let n = self.samples.max(1) as f64;
        Saturation {
            cpu_utilization: self.cpu / n,
            memory_utilization: self.memory / n,
            queue_length: self.queue_length / n,
            queue_utilization: self.queue_utilization / n,
            connection_pool_utilization: self.pool_utilization / n,
        }
    }
}

/// Time-weighted in-flight count, for Little's law.
#[derive(Debug, Clone, Default)]
struct Occupancy {
    in_flight: u64,
    area: u128,
    last_change: SimTime,
    arrivals: u64,
    finished: u64,
    latency_us_total: u128,
}

impl Occupancy {
    fn advance(&mut self, now: SimTime) {
        self.area += self.in_flight as u128 * now.micros_since(self.last_change) as u128;
        self.last_change = now;
    }
}

/// One time-series bucket.
#[derive(Debug, Clone, Default)]
struct Bucket {
    completions: u64,
    errors: u64,
    latencies: Vec<u64>,
    users: BTreeSet<String>,
    error_users: BTreeSet<String>,
    sample: Option<ComponentSample>,
    snapshots: u64,
    available_snapshots: u64,
}

impl Bucket {
    fn record(&mut self, latency_us: u64, success: bool, user: &str) {
        self.completions += 1;
        self.latencies.push(latency_us);
        if !self.users.contains(user) {
            self.users.insert(user.to_string());
        }
        if !success {
            self.errors += 1;
            if !self.error_users.contains(user) {
                self.error_users.insert(user.to_string());
            }
        }
    }

    fn error_rate(&self) -> f64 {
        if self.completions == 0 {
            0.0
        } else {
            self.errors as f64 / self.completions as f64
        }
    }

    /// Latency quantile in milliseconds.
    fn quantile_ms(&self, q: f64) -> f64 {
        if self.latencies.is_empty() {
            return 0.0;
        }
        let mut sorted = self.latencies.clone();
        sorted.sort_unstable();
        let rank = ((q * sorted.len() as f64).ceil() as usize).clamp(1, sorted.len());
        micros_to_millis(sorted[rank - 1])
    }
}

#[derive(Debug, Clone, Default)]
struct ComponentStats {
    latency: LatencyHistogram,
    counters: Counters,
    uptime: Uptime,
    saturation: SaturationSums,
    occupancy: Occupancy,
    dequeued: u64,
    buckets: Vec<Bucket>,
}

#[derive(Debug, Clone, Default)]
struct EdgeStats {
    metrics: EdgeMetrics,
    network: LatencyHistogram,
}

/// Everything the collector produces at the end of a run.
#[derive(Debug, Clone, Default)]
pub struct CollectedMetrics {
    pub metrics: MetricsOutput,
    pub time_series: TimeSeriesOutput,
    pub heatmaps: Heatmaps,
    pub slo_breaches: Vec<SloBreach>,
    pub littles_law: Vec<LittlesLawCheck>,
}

#[derive(Debug, Clone)]
pub struct MetricsCollector {
    resolution_us: u64,
    warmup: SimTime,
    order: Vec<ComponentId>,
    slos: BTreeMap<ComponentId, SloConfig>,
    global_latency: LatencyHistogram,
    global: Counters,
    global_bytes: u64,
    global_buckets: Vec<Bucket>,
    active_requests: Vec<u64>,
    system: Uptime,
    components: BTreeMap<ComponentId, ComponentStats>,
    edges: BTreeMap<EdgeId, EdgeStats>,
    open_calls: BTreeMap<CallId, (ComponentId, SimTime)>,
}

impl MetricsCollector {
    /// `components` in declaration order, with their SLOs.
    pub fn new(
        components: Vec<(ComponentId, SloConfig)>,
        edges: impl IntoIterator<Item = EdgeId>,
        resolution_ms: f64,
        warmup_ms: f64,
    ) -> Self {
        let mut stats = BTreeMap::new();
        let mut slos = BTreeMap::new();
        let mut order = Vec::new();
        for (id, slo) in components {
            let mut component = ComponentStats::default();
            component.uptime.available = true;
            stats.insert(id.clone(), component);
            if !slo.is_empty() {
                slos.insert(id.clone(), slo);
            }
            order.push(id);
        }
        Self {
            resolution_us: millis_to_micros(resolution_ms).max(1),
            warmup: SimTime::from_millis_f64(warmup_ms),
            order,
            slos,
            global_latency: LatencyHistogram::default(),
            global: Counters::default(),
            global_bytes: 0,
            global_buckets: Vec::new(),
            active_requests: Vec::new(),
            system: Uptime {
                available: true,
                ..Default::default()
            },
            components: stats,
            edges: edges
                .into_iter()
                .map(|id| (id, EdgeStats::default()))
                .collect(),
            open_calls: BTreeMap::new(),
        }
    }

    fn bucket_index(&self, at: SimTime) -> usize {
        (at.as_micros() / self.resolution_us) as usize
    }

    fn bucket(buckets: &mut Vec<Bucket>, index: usize) -> &mut Bucket {
        if buckets.len() <= index {
            buckets.resize_with(index + 1, Bucket::default);
        }
        &mut buckets[index]
    }

    /// A request sealed.
    pub fn record_request(&mut self, trace: &RequestTrace, user: &str, size_bytes: u64) {
        let latency_us = trace.end_time.micros_since(trace.start_time);
        let index = self.bucket_index(trace.end_time);
        Self::bucket(&mut self.global_buckets, index).record(
            latency_us,
            trace.status.is_success(),
            user,
        );
        if trace.start_time < self.warmup {
            return;
        }
        self.global_latency.record(latency_us);
        self.global.record(trace.status, trace.error_details.as_deref());
        self.global_bytes += size_bytes;
    }

    /// A call reached `component` and passed admission or was turned away
    /// there.
    pub fn call_started(&mut self, call: CallId, component: &ComponentId, now: SimTime) {
        if let Some(stats) = self.components.get_mut(component) {
            stats.occupancy.advance(now);
            stats.occupancy.in_flight += 1;
            stats.occupancy.arrivals += 1;
            self.open_calls.insert(call, (component.clone(), now));
        }
    }

    /// A call resolved at its component.
    pub fn call_finished(
        &mut self,
        call: CallId,
        now: SimTime,
        status: RequestStatus,
        label: Option<&str>,
        user: &str,
        counted: bool,
    ) {
        let Some((component, arrived)) = self.open_calls.remove(&call) else {
            return;
        };
        let index = self.bucket_index(now);
        let Some(stats) = self.components.get_mut(&component) else {
            return;
        };
        let latency_us = now.micros_since(arrived);
        stats.occupancy.advance(now);
        stats.occupancy.in_flight = stats.occupancy.in_flight.saturating_sub(1);
        stats.occupancy.finished += 1;
        stats.occupancy.latency_us_total += latency_us as u128;
        Self::bucket(&mut stats.buckets, index).record(latency_us, status.is_success(), user);
        if counted {
            stats.latency.record(latency_us);
            stats.counters.record(status, label);
        }
    }

    pub fn record_edge_call(&mut self, edge: &EdgeId) {
        if let Some(stats) = self.edges.get_mut(edge) {
            stats.metrics.calls += 1;
        }
    }

    pub fn record_edge_result(&mut self, edge: &EdgeId, result: EdgeResult, network_us: Option<u64>) {
        let Some(stats) = self.edges.get_mut(edge) else {
            return;
        };
        let m = &mut stats.metrics;
        match result {
            EdgeResult::Success => m.successes += 1,
            EdgeResult::Failure => m.failures += 1,
            EdgeResult::Timeout => m.timeouts += 1,
            EdgeResult::Dropped => m.dropped += 1,
            EdgeResult::ShortCircuited => m.short_circuited += 1,
        }
        if let Some(us) = network_us {
            stats.network.record(us);
        }
    }

    pub fn record_retry(&mut self, edge: &EdgeId) {
        if let Some(stats) = self.edges.get_mut(edge) {
            stats.metrics.retries += 1;
        }
    }

    pub fn record_breaker_open(&mut self, edge: &EdgeId) {
        if let Some(stats) = self.edges.get_mut(edge) {
            stats.metrics.breaker_opens += 1;
        }
    }

    pub fn record_dequeue(&mut self, component: &ComponentId) {
        if let Some(stats) = self.components.get_mut(component) {
            stats.dequeued += 1;
        }
    }

    /// Availability of `component` may have changed.
    pub fn set_available(&mut self, component: &ComponentId, now: SimTime, available: bool) {
        if let Some(stats) = self.components.get_mut(component) {
            stats.uptime.set(now, available);
        }
    }

    /// Availability of the system as a whole may have changed.
    pub fn set_system_available(&mut self, now: SimTime, available: bool) {
        self.system.set(now, available);
    }

    /// Periodic load snapshot, taken at the end of a bucket.
    pub fn snapshot(&mut self, now: SimTime, samples: Vec<ComponentSample>, active_requests: u64) {
        let index = (now.as_micros().saturating_sub(1) / self.resolution_us) as usize;
        if self.active_requests.len() <= index {
            self.active_requests.resize(index + 1, 0);
        }
        self.active_requests[index] = active_requests;
        for sample in samples {
            let Some(stats) = self.components.get_mut(&sample.component) else {
                continue;
            };
            if now >= self.warmup {
                stats.saturation.add(&sample);
            }
            let bucket = Self::bucket(&mut stats.buckets, index);
            bucket.snapshots += 1;
            if sample.available {
                bucket.available_snapshots += 1;
            }
            bucket.sample = Some(sample);
        }
    }

    /// Fold everything into the output sections.
    pub fn finish(
        mut self,
        end: SimTime,
        storage: &BTreeMap<ComponentId, StorageStats>,
    ) -> CollectedMetrics {
        let measured_s = (micros_to_millis(end.micros_since(self.warmup)) / 1_000.0).max(1e-9);
        let run_s = (end.as_millis_f64() / 1_000.0).max(1e-9);
        let buckets = (end.as_micros().div_ceil(self.resolution_us) as usize).max(1);
        let resolution_ms = micros_to_millis(self.resolution_us);
        let timestamps: Vec<f64> = (0..buckets).map(|i| i as f64 * resolution_ms).collect();
        let per_second = |count: u64| count as f64 / (resolution_ms / 1_000.0);

        self.system.close(end);
        for stats in self.components.values_mut() {
            stats.uptime.close(end);
            stats.occupancy.advance(end);
        }

        // Per-component aggregates.
        let mut per_component = BTreeMap::new();
        let mut littles_law = Vec::new();
        for (id, stats) in &self.components {
            let store = storage.get(id);
            let definition = MetricsDefinition {
                latency: stats.latency.summary(),
                throughput: Throughput {
                    requests_per_second: stats.counters.total as f64 / measured_s,
                    messages_per_second: (stats.dequeued > 0).then(|| stats.dequeued as f64 / run_s),
                    bytes_per_second: None,
                },
                availability: Availability {
                    successful_requests: stats.counters.success,
                    total_requests: stats.counters.total,
                    availability_percent: uptime_percent(&stats.uptime),
                    uptime_ms: micros_to_millis(stats.uptime.up_us),
                    downtime_ms: micros_to_millis(stats.uptime.down_us),
                },
                errors: stats.counters.errors(),
                saturation: stats.saturation.mean(),
                durability: store.map(|s| Durability {
                    writes_attempted: s.writes_attempted,
                    writes_succeeded: s.writes_succeeded,
                    writes_lost: s.writes_lost,
                    replica_lag: s.replica_lag_ms.clone(),
                }),
                consistency: store.map(|s| Consistency {
                    replication_lag_ms: s.mean_lag_ms(),
                    stale_reads: s.stale_reads,
                    write_conflicts: s.write_conflicts,
                }),
                recovery: stats.uptime.recovery(),
            };
            per_component.insert(id.clone(), definition);

            let occupancy = &stats.occupancy;
            if occupancy.finished >= LITTLES_LAW_MIN_CALLS {
                let arrival_rate = occupancy.arrivals as f64 / run_s;
                let mean_latency_ms =
                    occupancy.latency_us_total as f64 / occupancy.finished as f64 / 1_000.0;
                let expected = arrival_rate * mean_latency_ms / 1_000.0;
                let observed = occupancy.area as f64 / end.as_micros().max(1) as f64;
                let relative_error = (expected - observed).abs() / expected.max(observed).max(1e-9);
                littles_law.push(LittlesLawCheck {
                    component_id: id.clone(),
                    arrival_rate_per_sec: arrival_rate,
                    mean_latency_ms,
                    expected_in_flight: expected,
                    observed_in_flight: observed,
                    relative_error,
                    holds: relative_error <= LITTLES_LAW_TOLERANCE,
                });
            }
        }

        // Global aggregates.
        let mut global_saturation = SaturationSums::default();
        for stats in self.components.values() {
            let mean = stats.saturation.mean();
            global_saturation.samples += 1;
            global_saturation.cpu += mean.cpu_utilization;
            global_saturation.memory += mean.memory_utilization;
            global_saturation.queue_length += mean.queue_length;
            global_saturation.queue_utilization += mean.queue_utilization;
            global_saturation.pool_utilization += mean.connection_pool_utilization;
        }
        let (failures, recoveries, repair_us) = self.components.values().fold(
            (0, 0, 0u64),
            |(f, r, us), s| (f + s.uptime.failures, r + s.uptime.recoveries, us + s.uptime.repair_us),
        );
        let durable: Vec<&StorageStats> = storage.values().collect();
        let global = MetricsDefinition {
            latency: self.global_latency.summary(),
            throughput: Throughput {
                requests_per_second: self.global.total as f64 / measured_s,
                messages_per_second: None,
                bytes_per_second: Some(self.global_bytes as f64 / measured_s),
            },
            availability: Availability {
                successful_requests: self.global.success,
                total_requests: self.global.total,
                availability_percent: if self.global.total == 0 {
                    100.0
                } else {
                    self.global.success as f64 / self.global.total as f64 * 100.0
                },
                uptime_ms: micros_to_millis(self.system.up_us),
                downtime_ms: micros_to_millis(self.system.down_us),
            },
            errors: self.global.errors(),
            saturation: global_saturation.mean(),
            durability: (!durable.is_empty()).then(|| Durability {
                writes_attempted: durable.iter().map(|s| s.writes_attempted).sum(),
                writes_succeeded: durable.iter().map(|s| s.writes_succeeded).sum(),
                writes_lost: durable.iter().map(|s| s.writes_lost).sum(),
                replica_lag: durable.iter().flat_map(|s| s.replica_lag_ms.iter().copied()).collect(),
            }),
            consistency: (!durable.is_empty()).then(|| Consistency {
                replication_lag_ms: durable.iter().map(|s| s.mean_lag_ms()).fold(0.0, f64::max),
                stale_reads: durable.iter().map(|s| s.stale_reads).sum(),
                write_conflicts: durable.iter().map(|s| s.write_conflicts).sum(),
            }),
            recovery: Recovery {
                mttr: if recoveries == 0 {
                    0.0
                } else {
                    micros_to_millis(repair_us) / recoveries as f64
                },
                mtbf: micros_to_millis(self.system.up_us) / failures.max(1) as f64,
                failure_count: failures,
                recovery_count: recoveries,
            },
        };

        let per_edge = self
            .edges
            .iter()
            .map(|(id, stats)| {
                let mut m = stats.metrics.clone();
                let resolved = m.successes + m.failures + m.timeouts + m.dropped + m.short_circuited;
                m.error_rate = if resolved == 0 {
                    0.0
                } else {
                    (resolved - m.successes) as f64 / resolved as f64
                };
                m.network_latency = stats.network.summary();
                (id.clone(), m)
            })
            .collect();

        // Time series.
        let mut global_series = GlobalSeries::default();
        for i in 0..buckets {
            let bucket = self.global_buckets.get(i).cloned().unwrap_or_default();
            global_series.throughput_rps.push(per_second(bucket.completions));
            global_series.latency_p50.push(bucket.quantile_ms(0.5));
            global_series.latency_p99.push(bucket.quantile_ms(0.99));
            global_series.error_rate.push(bucket.error_rate());
            global_series
                .active_requests
                .push(self.active_requests.get(i).copied().unwrap_or(0) as f64);
        }
        let mut component_series = BTreeMap::new();
        for (id, stats) in &self.components {
            let mut series = ComponentSeries::default();
            for i in 0..buckets {
                let empty = Bucket::default();
                let bucket = stats.buckets.get(i).unwrap_or(&empty);
                let sample = bucket.sample.as_ref();
                series.queue_length.push(sample.map_or(0.0, |s| s.queue_depth as f64));
                series.active_requests.push(sample.map_or(0.0, |s| s.active as f64));
                series.replicas.push(sample.map_or(0.0, |s| s.ready_replicas as f64));
                series.cpu_utilization.push(sample.map_or(0.0, |s| s.cpu));
                series.memory_utilization.push(sample.map_or(0.0, |s| s.memory));
                series.throughput_rps.push(per_second(bucket.completions));
                series.latency_p99.push(bucket.quantile_ms(0.99));
                series.error_rate.push(bucket.error_rate());
            }
            component_series.insert(id.clone(), series);
        }

        let heatmap = |pick: fn(&ComponentSeries) -> &Vec<f64>| Heatmap {
            timestamps: timestamps.clone(),
            component_ids: self.order.clone(),
            values: (0..buckets)
                .map(|i| {
                    self.order
                        .iter()
                        .map(|id| {
                            component_series
                                .get(id)
                                .and_then(|s| pick(s).get(i).copied())
                                .unwrap_or(0.0)
                        })
                        .collect()
                })
                .collect(),
        };
        let heatmaps = Heatmaps {
            load_heatmap: heatmap(|s| &s.throughput_rps),
            latency_heatmap: heatmap(|s| &s.latency_p99),
            error_heatmap: heatmap(|s| &s.error_rate),
        };

        let slo_breaches = self.slo_breaches(buckets, resolution_ms);

        CollectedMetrics {
            metrics: MetricsOutput {
                global,
                per_component,
                per_edge,
            },
            time_series: TimeSeriesOutput {
                timestamps,
                resolution: resolution_ms,
                global: global_series,
                components: component_series,
            },
            heatmaps,
            slo_breaches,
            littles_law,
        }
    }

    fn slo_breaches(&self, buckets: usize, resolution_ms: f64) -> Vec<SloBreach> {
        let first = self.bucket_index(self.warmup);
        let mut breaches = Vec::new();
        for (id, slo) in &self.slos {
            let Some(stats) = self.components.get(id) else {
                continue;
            };
            let empty = Bucket::default();
            let at = |i: usize| stats.buckets.get(i).unwrap_or(&empty);

            let mut checks: Vec<Check> = Vec::new();
            for (threshold, q) in [
                (slo.latency_p50_ms, 0.5),
                (slo.latency_p95_ms, 0.95),
                (slo.latency_p99_ms, 0.99),
            ] {
                if let Some(threshold) = threshold {
                    checks.push(Check {
                        slo_type: SloType::Latency,
                        threshold,
                        upper: true,
                        value: Box::new(move |b: &Bucket| {
                            (b.completions > 0).then(|| b.quantile_ms(q))
                        }),
                        errors_only: false,
                    });
                }
            }
            if let Some(threshold) = slo.error_rate {
                checks.push(Check {
                    slo_type: SloType::ErrorRate,
                    threshold,
                    upper: true,
                    value: Box::new(|b: &Bucket| (b.completions > 0).then(|| b.error_rate())),
                    errors_only: true,
                });
            }
            if let Some(threshold) = slo.availability {
                checks.push(Check {
                    slo_type: SloType::Availability,
                    threshold,
                    upper: false,
                    value: Box::new(|b: &Bucket| {
                        (b.snapshots > 0)
                            .then(|| b.available_snapshots as f64 / b.snapshots as f64)
                    }),
                    errors_only: false,
                });
            }
            if let Some(threshold) = slo.throughput_min {
                let seconds = resolution_ms / 1_000.0;
                checks.push(Check {
                    slo_type: SloType::Throughput,
                    threshold,
                    upper: false,
                    value: Box::new(move |b: &Bucket| Some(b.completions as f64 / seconds)),
                    errors_only: false,
                });
            }

            for check in &checks {
                let mut open: Option<OpenBreach> = None;
                for i in first..buckets {
                    let bucket = at(i);
                    let breached = (check.value)(bucket).filter(|v| {
                        if check.upper {
                            *v > check.threshold
                        } else {
                            *v < check.threshold
                        }
                    });
                    match breached {
                        Some(v) => open
                            .get_or_insert_with(|| OpenBreach::new(i))
                            .extend(bucket, v, check),
                        None => {
                            if let Some(done) = open.take() {
                                breaches.push(done.close(id, check, Some(i), resolution_ms));
                            }
                        }
                    }
                }
                if let Some(done) = open.take() {
                    breaches.push(done.close(id, check, None, resolution_ms));
                }
            }
        }
        breaches.sort_by(|a, b| {
            a.breach_start_ms
                .total_cmp(&b.breach_start_ms)
                .then_with(|| a.component_id.cmp(&b.component_id))
        });
        breaches
    }
}

struct Check {
    slo_type: SloType,
    threshold: f64,
    /// Breached above the threshold; otherwise below it.
    upper: bool,
    value: Box<dyn Fn(&Bucket) -> Option<f64>>,
    errors_only: bool,
}

struct OpenBreach {
    start: usize,
    worst: Option<f64>,
    requests: u64,
    users: BTreeSet<String>,
}

impl OpenBreach {
    fn new(start: usize) -> Self {
        Self {
            start,
            worst: None,
            requests: 0,
            users: BTreeSet::new(),
        }
    }

    fn extend(&mut self, bucket: &Bucket, value: f64, check: &Check) {
        self.worst = Some(match self.worst {
            None => value,
            Some(w) if check.upper => w.max(value),
            Some(w) => w.min(value),
        });
        if check.errors_only {
            self.requests += bucket.errors;
            self.users.extend(bucket.error_users.iter().cloned());
        } else {
            self.requests += bucket.completions;
            self.users.extend(bucket.users.iter().cloned());
        }
    }

    fn close(self, component: &ComponentId, check: &Check, end: Option<usize>, resolution_ms: f64) -> SloBreach {
        let worst = self.worst.unwrap_or(check.threshold);
        let start_ms = self.start as f64 * resolution_ms;
        let end_ms = end.map(|i| i as f64 * resolution_ms);
        let duration_ms = end_ms.map_or(resolution_ms, |e| e - start_ms);
        let critical = if check.upper {
            worst >= check.threshold * 2.0
        } else if check.slo_type == SloType::Availability {
            (1.0 - worst) >= (1.0 - check.threshold) * 2.0
        } else {
            worst <= check.threshold / 2.0
        };
        SloBreach {
            component_id: component.clone(),
            slo_type: check.slo_type,
            threshold: check.threshold,
            actual_value: worst,
            breach_start_ms: start_ms,
            breach_end_ms: end_ms,
            duration_ms,
            severity: if critical {
                FindingSeverity::Critical
            } else {
                FindingSeverity::Warning
            },
            affected_requests: self.requests,
            estimated_user_impact: self.users.len() as u64,
        }
    }
}

fn uptime_percent(uptime: &Uptime) -> f64 {
    let total = uptime.up_us + uptime.down_us;
    if total == 0 {
        100.0
    } else {
        uptime.up_us as f64 / total as f64 * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collector(slo: SloConfig) -> MetricsCollector {
        MetricsCollector::new(
            vec![(ComponentId::new("api"), slo)],
            [EdgeId::new("e")],
            1_000.0,
            0.0,
        )
    }

    fn api() -> ComponentId {
        ComponentId::new("api")
    }

    fn call(c: &mut MetricsCollector, id: u64, start_ms: u64, end_ms: u64, status: RequestStatus) {
        c.call_started(CallId(id), &api(), SimTime::from_millis(start_ms));
        c.call_finished(
            CallId(id),
            SimTime::from_millis(end_ms),
            status,
            None,
            &format!("user-{}", id % 3),
            true,
        );
    }

    #[test]
    fn test_histogram_summary_in_millis() {
        let mut h = LatencyHistogram::default();
        for ms in 1..=100u64 {
            h.record(ms * 1_000);
        }
        let s = h.summary();
        assert_eq!(s.samples, 100);
        assert!((s.p50 - 50.0).abs() < 0.1, "p50 was {}", s.p50);
        assert!((s.p99 - 99.0).abs() < 0.1, "p99 was {}", s.p99);
        assert!((s.min - 1.0).abs() < 0.01);
    }

    #[test]
    fn test_mttr_from_availability_transitions() {
        let mut c = collector(SloConfig::default());
        c.set_available(&api(), SimTime::from_millis(1_000), false);
        c.set_available(&api(), SimTime::from_millis(1_000), false);
        c.set_available(&api(), SimTime::from_millis(3_000), true);
        let out = c.finish(SimTime::from_millis(10_000), &BTreeMap::new());
        let m = &out.metrics.per_component[&api()];
        assert_eq!(m.recovery.failure_count, 1);
        assert_eq!(m.recovery.recovery_count, 1);
        assert_eq!(m.recovery.mttr, 2_000.0);
        assert_eq!(m.availability.downtime_ms, 2_000.0);
        assert_eq!(m.availability.availability_percent, 80.0);
    }

    #[test]
    fn test_littles_law_on_steady_calls() {
        let mut c = collector(SloConfig::default());
        // One call every 100ms, each taking 50ms: L = 10/s * 0.05s = 0.5.
        for i in 0..100u64 {
            call(&mut c, i, i * 100, i * 100 + 50, RequestStatus::Success);
        }
        let out = c.finish(SimTime::from_millis(10_000), &BTreeMap::new());
        let check = &out.littles_law[0];
        assert!((check.expected_in_flight - 0.5).abs() < 1e-9);
        assert!((check.observed_in_flight - 0.5).abs() < 1e-9);
        assert!(check.holds);
    }

    #[test]
    fn test_slo_breach_spans_consecutive_buckets() {
        let mut c = collector(SloConfig {
            error_rate: Some(0.1),
            ..Default::default()
        });
        let mut id = 0;
        for second in 0..5u64 {
            for k in 0..10u64 {
                id += 1;
                let failing = (1..3).contains(&second);
                let status = if failing { RequestStatus::Error } else { RequestStatus::Success };
                let start = second * 1_000 + k * 50;
                call(&mut c, id, start, start + 10, status);
            }
        }
        let out = c.finish(SimTime::from_millis(5_000), &BTreeMap::new());
        assert_eq!(out.slo_breaches.len(), 1);
        let breach = &out.slo_breaches[0];
        assert_eq!(breach.slo_type, SloType::ErrorRate);
        assert_eq!(breach.breach_start_ms, 1_000.0);
        assert_eq!(breach.breach_end_ms, Some(3_000.0));
        assert_eq!(breach.duration_ms, 2_000.0);
        assert_eq!(breach.affected_requests, 20);
        assert_eq!(breach.estimated_user_impact, 3);
        assert_eq!(breach.severity, FindingSeverity::Critical);
    }

    #[test]
    fn test_edge_error_rate_and_series_length() {
        let mut c = collector(SloConfig::default());
        let e = EdgeId::new("e");
        c.record_edge_call(&e);
        c.record_edge_result(&e, EdgeResult::Success, Some(2_000));
        c.record_edge_call(&e);
        c.record_edge_result(&e, EdgeResult::Dropped, None);
        let out = c.finish(SimTime::from_millis(2_500), &BTreeMap::new());
        assert_eq!(out.metrics.per_edge[&e].error_rate, 0.5);
        assert_eq!(out.time_series.timestamps, vec![0.0, 1_000.0, 2_000.0]);
        assert_eq!(out.heatmaps.load_heatmap.values.len(), 3);
    }
}
