//! Concurrent misses on a hot key, with and without request coalescing.

use archsim_core::{EventKind, SimulationOutput, SloType};
use archsim_simulation::{SimulationConfig, SimulationInput, SimulationRunner};
use archsim_test_helpers::{fixtures, steady};
use archsim_types::{ComponentConfig, SloConfig, SystemArchitecture};

/// p99 latency budget on the database behind the cache.
const DB_P99_SLO_MS: f64 = 100.0;

/// Every request reads the same key, far faster than the origin answers.
fn run(coalesce: bool) -> SimulationOutput {
    let input = SimulationInput::new(fixtures::cache_aside(coalesce))
        .with_workload(steady(200.0))
        .with_config(
            SimulationConfig::new("hot-key")
                .with_duration_ms(1_000.0)
                .with_keys(1, 0.0)
                .with_read_ratio(1.0),
        );
    SimulationRunner::new(input).unwrap().run().unwrap()
}

fn reached(output: &SimulationOutput, id: &str) -> u64 {
    output
        .component_metrics(id)
        .unwrap()
        .availability
        .total_requests
}

#[test]
fn test_uncoalesced_misses_stampede_the_origin() {
    let output = run(false);
    assert!(output.event_count(EventKind::CacheMiss) > 1);
    assert!(output.event_count(EventKind::CacheStampede) >= 1);
    assert!(output.event_count(EventKind::CacheHit) > 0);
    assert!(reached(&output, "db") > 1);
}

#[test]
fn test_coalesced_misses_share_one_fetch() {
    let output = run(true);
    assert_eq!(output.event_count(EventKind::CacheStampede), 0);
    assert!(output.event_count(EventKind::CacheHit) > 0);
    assert!(reached(&output, "db") * 10 < reached(&output, "cache"));
    assert!(output.verification.request_conservation.holds);
}

#[test]
fn test_coalescing_reduces_origin_load() {
    let plain = run(false);
    let coalesced = run(true);
    assert!(reached(&coalesced, "db") < reached(&plain, "db"));
}

/// The cache-aside fixture with a two-connection database that carries a
/// p99 latency SLO.
fn guarded_origin(coalesce: bool) -> SystemArchitecture {
    let mut arch = fixtures::cache_aside(coalesce);
    for component in &mut arch.components {
        if component.id.as_str() != "db" {
            continue;
        }
        if let ComponentConfig::Database(db) = &mut component.config {
            db.connection_pool.max_connections = 2;
        }
        component.slo = SloConfig {
            latency_p99_ms: Some(DB_P99_SLO_MS),
            ..SloConfig::default()
        };
    }
    arch
}

/// Crash the cache at 10 s for 5 s, then watch the cold restart. The warmup
/// hides the cold start at time zero.
fn crash_and_recover(coalesce: bool) -> SimulationOutput {
    let input = SimulationInput::new(guarded_origin(coalesce))
        .with_workload(steady(200.0))
        .with_fault(fixtures::crash("cache", 10_000.0, 5_000.0))
        .with_config(
            SimulationConfig::new("cache-crash")
                .with_duration_ms(16_000.0)
                .with_warmup_ms(5_000.0)
                .with_keys(1, 0.0)
                .with_read_ratio(1.0),
        );
    SimulationRunner::new(input).unwrap().run().unwrap()
}

fn db_latency_breaches(output: &SimulationOutput) -> Vec<f64> {
    output
        .slo_breaches
        .iter()
        .filter(|b| b.component_id.as_str() == "db" && b.slo_type == SloType::Latency)
        .map(|b| b.breach_start_ms)
        .collect()
}

#[test]
fn test_cold_restart_without_coalescing_breaches_origin_slo() {
    let output = crash_and_recover(false);
    assert!(output.event_count(EventKind::CacheStampede) >= 1);
    let breaches = db_latency_breaches(&output);
    assert!(!breaches.is_empty(), "{:?}", output.slo_breaches);
    assert!(breaches.iter().all(|start| *start >= 5_000.0), "{breaches:?}");
}

#[test]
fn test_cold_restart_with_coalescing_keeps_origin_within_slo() {
    let output = crash_and_recover(true);
    assert_eq!(output.event_count(EventKind::CacheStampede), 0);
    assert!(db_latency_breaches(&output).is_empty(), "{:?}", output.slo_breaches);
    assert!(output.verification.request_conservation.holds);
}
