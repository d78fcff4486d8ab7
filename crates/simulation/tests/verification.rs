//! Post-run verification: Little's law, request conservation and causal
//! order.

use archsim_core::SimulationOutput;
use archsim_simulation::{SimulationConfig, SimulationInput, SimulationRunner};
use archsim_test_helpers::{fixtures, steady};

fn run(input: SimulationInput) -> SimulationOutput {
    SimulationRunner::new(input).unwrap().run().unwrap()
}

#[test]
fn test_steady_pipeline_passes_every_check() {
    let output = run(SimulationInput::new(fixtures::api_db())
        .with_workload(steady(100.0))
        .with_config(SimulationConfig::new("verify").with_duration_ms(5_000.0)));
    let verification = &output.verification;

    assert!(verification.request_conservation.holds);
    assert_eq!(verification.request_conservation.failed, 0);
    assert!(verification.causal_order.holds);
    assert_eq!(verification.causal_order.violations, 0);
    assert!(verification.causal_order.events_checked > 0);

    let ids: Vec<&str> = verification
        .littles_law
        .iter()
        .map(|check| check.component_id.as_str())
        .collect();
    assert!(ids.contains(&"api"), "{ids:?}");
    assert!(ids.contains(&"db"), "{ids:?}");
    for check in &verification.littles_law {
        assert!(check.arrival_rate_per_sec > 0.0, "{check:?}");
        assert!(check.mean_latency_ms > 0.0, "{check:?}");
    }
}

#[test]
fn test_conservation_holds_under_faults() {
    let output = run(SimulationInput::new(fixtures::api_db())
        .with_workload(steady(200.0))
        .with_fault(fixtures::crash("db", 200.0, 300.0))
        .with_fault(fixtures::errors("api", 0.3, 800.0, 400.0))
        .with_config(SimulationConfig::new("conserve").with_duration_ms(1_500.0)));
    let conservation = &output.verification.request_conservation;

    assert!(conservation.holds, "{conservation:?}");
    assert_eq!(
        conservation.arrivals,
        conservation.succeeded
            + conservation.failed
            + conservation.timed_out
            + conservation.rejected
            + conservation.in_flight
    );
    assert!(conservation.failed > 0);
    assert!(output.verification.causal_order.holds);
}

#[test]
fn test_event_traces_account_for_every_event() {
    let output = run(SimulationInput::new(fixtures::api_db())
        .with_workload(steady(50.0))
        .with_config(
            SimulationConfig::new("sampled")
                .with_duration_ms(1_000.0)
                .with_trace_sampling(0.5),
        ));
    let drained: u64 = output.metadata.events_by_kind.values().sum();
    assert_eq!(drained, output.metadata.events_processed);
    assert_eq!(output.event_traces.total_events, output.metadata.events_processed);
    assert!((output.event_traces.events.len() as u64) < output.event_traces.total_events);
}
