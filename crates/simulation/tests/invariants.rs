//! Invariant policies: logged violations, and runs aborted by a violation.

use archsim_core::{RunStatus, SimulationOutput};
use archsim_simulation::{SimulationConfig, SimulationInput, SimulationRunner};
use archsim_test_helpers::{fixtures, steady};
use archsim_types::ViolationPolicy;
use tracing_test::traced_test;

fn run_with(policy: ViolationPolicy, error_rate: f64, config: SimulationConfig) -> SimulationOutput {
    let arch = fixtures::api_db().with_invariant(fixtures::error_rate_slo(0.1, 500.0, policy));
    let input = SimulationInput::new(arch)
        .with_workload(steady(100.0))
        .with_fault(fixtures::errors("db", error_rate, 0.0, 2_500.0))
        .with_config(config);
    SimulationRunner::new(input).unwrap().run().unwrap()
}

fn run(policy: ViolationPolicy, error_rate: f64) -> SimulationOutput {
    run_with(policy, error_rate, SimulationConfig::new("slo").with_duration_ms(3_000.0))
}

#[traced_test]
#[test]
fn test_fail_simulation_aborts_the_run() {
    let output = run(ViolationPolicy::FailSimulation, 1.0);

    match &output.status {
        RunStatus::Aborted { invariant_id, .. } => {
            assert_eq!(invariant_id.as_str(), "error-rate-slo");
        }
        other => panic!("expected an abort, got {other:?}"),
    }
    assert!(output.is_aborted());
    assert!(output.simulated_duration_ms < 3_000.0);
    assert!(output
        .invariant_violations
        .iter()
        .any(|v| v.policy == ViolationPolicy::FailSimulation));
}

#[test]
fn test_logged_violations_let_the_run_finish() {
    let output = run(ViolationPolicy::Log, 1.0);

    assert_eq!(output.status, RunStatus::Completed);
    assert!(!output.invariant_violations.is_empty());
    assert!(output
        .invariant_violations
        .iter()
        .all(|v| v.invariant_id.as_str() == "error-rate-slo" && v.policy == ViolationPolicy::Log));
}

#[test]
fn test_healthy_run_has_no_violations() {
    let output = run(ViolationPolicy::FailSimulation, 0.0);
    assert_eq!(output.status, RunStatus::Completed);
    assert!(output.invariant_violations.is_empty());
}

#[traced_test]
#[test]
fn test_violations_past_the_cap_are_not_recorded() {
    let uncapped = run(ViolationPolicy::Log, 1.0);
    assert!(uncapped.invariant_violations.len() > 1);

    let capped = run_with(
        ViolationPolicy::Log,
        1.0,
        SimulationConfig::new("slo")
            .with_duration_ms(3_000.0)
            .with_max_violations_per_invariant(1),
    );
    assert_eq!(capped.status, RunStatus::Completed);
    assert_eq!(capped.invariant_violations.len(), 1);
    assert_eq!(
        capped.invariant_violations[0],
        uncapped.invariant_violations[0]
    );
}
