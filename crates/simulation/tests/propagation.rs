//! Failure propagation through the dependency graph.

use archsim_core::{EventKind, SimulationOutput};
use archsim_simulation::{SimulationConfig, SimulationInput, SimulationRunner, TIE_BREAK};
use archsim_test_helpers::{fixtures, steady};
use archsim_types::{PropagationCondition, PropagationEffect, PropagationRule};
use tracing_test::traced_test;

fn run(effect: PropagationEffect, seed: &str) -> SimulationOutput {
    let rule = PropagationRule::new(PropagationCondition::DependencyFailures { threshold: 1 }, effect)
        .with_delay_ms(50.0);
    let input = SimulationInput::new(fixtures::cascade(vec![rule]))
        .with_workload(steady(100.0))
        .with_fault(fixtures::crash("db", 500.0, 1_000.0))
        .with_config(SimulationConfig::new(seed).with_duration_ms(3_000.0));
    SimulationRunner::new(input).unwrap().run().unwrap()
}

#[traced_test]
#[test]
fn test_failing_dependency_makes_dependent_shed_load() {
    let output = run(PropagationEffect::RejectRequests, "shed");
    let conservation = &output.verification.request_conservation;

    assert!(output.event_count(EventKind::PropagationEffect) >= 1);
    assert!(output.event_count(EventKind::PropagationCleared) >= 1);
    assert!(conservation.holds, "{conservation:?}");
    assert!(conservation.failed + conservation.rejected > 0);

    let api = output.component_metrics("api").unwrap();
    assert!(api.errors.errors_by_type.contains_key("load-shed"), "{api:?}");
    assert_eq!(output.metadata.propagation_tie_break, TIE_BREAK);
}

#[test]
fn test_propagated_latency_slows_the_dependent() {
    let slowed = run(PropagationEffect::IncreaseLatency { factor: 10.0 }, "latency");
    let baseline = run(PropagationEffect::IncreaseLatency { factor: 1.0 }, "latency");

    assert!(slowed.event_count(EventKind::PropagationEffect) >= 1);
    let p99 = |o: &SimulationOutput| o.component_metrics("api").unwrap().latency.p99;
    assert!(p99(&slowed) > p99(&baseline));
}

#[test]
fn test_propagation_is_deterministic() {
    let a = run(PropagationEffect::RejectRequests, "same");
    let b = run(PropagationEffect::RejectRequests, "same");
    assert_eq!(a.reproducibility_spec.trace_hash, b.reproducibility_spec.trace_hash);
    assert_eq!(
        a.event_count(EventKind::PropagationEffect),
        b.event_count(EventKind::PropagationEffect)
    );
}
