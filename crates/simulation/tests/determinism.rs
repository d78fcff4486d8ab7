//! Tests for deterministic runs.
//!
//! The same input and seed must reproduce the same drained trace, whether
//! the run goes in one call, in chunks, from a replayed config, or on the
//! rayon pool.

use archsim_core::{EventKind, RunStatus, SimulationOutput};
use archsim_simulation::{
    run_all, DeterministicRng, SimulationConfig, SimulationInput, SimulationRunner,
    WorkloadGenerator,
};
use archsim_test_helpers::{fixtures, steady};
use archsim_types::{
    ComponentConfig, ComponentDefinition, ComponentId, ComponentType, DatabaseConfig, DistributionConfig,
    MicroserviceConfig, QueryLatency, SimTime, SystemArchitecture, WorkloadProfile,
};
use tracing_test::traced_test;

fn input(seed: &str) -> SimulationInput {
    SimulationInput::new(fixtures::api_db())
        .with_workload(steady(100.0))
        .with_fault(fixtures::errors("db", 0.2, 300.0, 600.0))
        .with_config(SimulationConfig::new(seed).with_duration_ms(1_500.0))
}

fn run(input: SimulationInput) -> SimulationOutput {
    SimulationRunner::new(input).unwrap().run().unwrap()
}

#[traced_test]
#[test]
fn test_same_seed_same_results() {
    let a = run(input("replay"));
    let b = run(input("replay"));

    assert_eq!(a.status, RunStatus::Completed);
    assert_eq!(a.reproducibility_spec.trace_hash, b.reproducibility_spec.trace_hash);
    assert_eq!(a.metadata.events_processed, b.metadata.events_processed);
    assert_eq!(a.verification.request_conservation, b.verification.request_conservation);
    assert_eq!(a.metrics.global, b.metrics.global);
}

#[test]
fn test_different_seed_different_trace() {
    let a = run(input("seed-a"));
    let b = run(input("seed-b"));
    assert_ne!(a.reproducibility_spec.trace_hash, b.reproducibility_spec.trace_hash);
    assert_ne!(a.reproducibility_spec.config_hash, b.reproducibility_spec.config_hash);
}

#[test]
fn test_chunked_run_matches_single_run() {
    let whole = run(input("chunks"));

    let mut runner = SimulationRunner::new(input("chunks")).unwrap();
    runner.run_until(SimTime::from_millis(250)).unwrap();
    runner.run_until(SimTime::from_millis(700)).unwrap();
    runner.run_until(SimTime::from_millis(1_100)).unwrap();
    let chunked = runner.run().unwrap();

    assert_eq!(
        whole.reproducibility_spec.trace_hash,
        chunked.reproducibility_spec.trace_hash
    );
    assert_eq!(whole.metadata.events_processed, chunked.metadata.events_processed);
}

#[test]
fn test_replay_from_deterministic_config() {
    let original = run(input("replay-config"));
    let replayed: SimulationInput =
        serde_json::from_str(&original.reproducibility_spec.deterministic_config).unwrap();
    let again = run(replayed);

    assert_eq!(
        original.reproducibility_spec.config_hash,
        again.reproducibility_spec.config_hash
    );
    assert_eq!(
        original.reproducibility_spec.trace_hash,
        again.reproducibility_spec.trace_hash
    );
}

#[test]
fn test_parallel_runs_match_sequential_runs() {
    let seeds = ["p-1", "p-2", "p-3", "p-4"];
    let parallel = run_all(seeds.iter().map(|s| input(s)).collect());

    assert_eq!(parallel.len(), seeds.len());
    for (seed, result) in seeds.iter().zip(parallel) {
        let parallel = result.unwrap();
        let sequential = run(input(seed));
        assert_eq!(parallel.seed, *seed);
        assert_eq!(
            parallel.reproducibility_spec.trace_hash,
            sequential.reproducibility_spec.trace_hash
        );
    }
}

/// `users -> api -> db` with random service times, optionally with an
/// `audit` service declared between them that no traffic reaches.
fn storefront(with_audit: bool) -> SystemArchitecture {
    let mut arch = SystemArchitecture::new("storefront")
        .with_component(
            ComponentDefinition::new("users", ComponentType::UserSource).with_dependencies(["api"]),
        )
        .with_component(fixtures::service("api", 2.0).with_dependencies(["db"]));
    if with_audit {
        arch = arch.with_component(
            ComponentDefinition::new("audit", ComponentType::Microservice).with_config(
                ComponentConfig::Microservice(MicroserviceConfig {
                    stateful: false,
                    processing_latency: DistributionConfig::exponential_mean(3.0),
                }),
            ),
        );
    }
    arch.with_component(
        ComponentDefinition::new("db", ComponentType::RelationalDb).with_config(
            ComponentConfig::Database(DatabaseConfig {
                query_latency: QueryLatency {
                    read: DistributionConfig::exponential_mean(5.0),
                    write: DistributionConfig::exponential_mean(10.0),
                    indexed_read: None,
                },
                ..DatabaseConfig::default()
            }),
        ),
    )
}

fn db_timeline(output: &SimulationOutput) -> Vec<(SimTime, EventKind)> {
    output
        .event_traces
        .events
        .iter()
        .filter(|e| e.target.as_ref().is_some_and(|t| t.as_str() == "db"))
        .map(|e| (e.time, e.kind))
        .collect()
}

#[test]
fn test_unrelated_component_leaves_other_streams_alone() {
    let run_storefront = |with_audit: bool| {
        run(SimulationInput::new(storefront(with_audit))
            .with_workload(steady(50.0))
            .with_config(SimulationConfig::new("isolation").with_duration_ms(1_000.0)))
    };
    let plain = run_storefront(false);
    let audited = run_storefront(true);

    let plain_db = plain.component_metrics("db").unwrap();
    assert!(plain_db.latency.max > plain_db.latency.p50, "db draws vary");
    assert_eq!(plain_db.latency, audited.component_metrics("db").unwrap().latency);
    assert_eq!(
        plain.verification.request_conservation,
        audited.verification.request_conservation
    );
    assert!(!db_timeline(&plain).is_empty());
    assert_eq!(db_timeline(&plain), db_timeline(&audited));
    assert_eq!(audited.component_metrics("audit").map_or(0, |m| m.availability.total_requests), 0);
}

#[test]
fn test_restarted_workload_replays_the_same_arrivals() {
    let config = SimulationConfig::new("restart");
    let mut generator = WorkloadGenerator::new(
        WorkloadProfile::steady(80.0),
        vec![ComponentId::new("api"), ComponentId::new("web")],
        &config,
        DeterministicRng::from_seed_str("restart"),
    )
    .unwrap();
    let horizon = SimTime::from_millis(500);
    let drain = |generator: &mut WorkloadGenerator| {
        std::iter::from_fn(|| generator.next_arrival(horizon)).collect::<Vec<_>>()
    };

    let first = drain(&mut generator);
    assert!(first.len() > 10);
    assert!(generator.next_arrival(horizon).is_none());

    generator.restart();
    assert_eq!(drain(&mut generator), first);
}
