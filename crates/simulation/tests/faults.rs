//! Scheduled faults: crashes, latency, DNS failures and partitions.

use archsim_core::{EventKind, SimulationOutput};
use archsim_simulation::{SimulationConfig, SimulationInput, SimulationRunner};
use archsim_test_helpers::{fixtures, steady};
use archsim_types::{FaultInjection, FaultSpec, SimTime};
use tracing_test::traced_test;

fn run(fault: FaultInjection, duration_ms: f64) -> SimulationOutput {
    run_faults(vec![fault], 50.0, duration_ms)
}

fn run_faults(faults: Vec<FaultInjection>, rps: f64, duration_ms: f64) -> SimulationOutput {
    let mut input = SimulationInput::new(fixtures::api_db()).with_workload(steady(rps));
    for fault in faults {
        input = input.with_fault(fault);
    }
    let input = input.with_config(SimulationConfig::new("faults").with_duration_ms(duration_ms));
    SimulationRunner::new(input).unwrap().run().unwrap()
}

fn db_crash(id: &str, at_ms: f64, duration_ms: f64) -> FaultInjection {
    FaultInjection::on_component(id, "db", FaultSpec::ProcessCrash, at_ms, duration_ms)
}

#[traced_test]
#[test]
fn test_crash_fails_requests_until_recovery() {
    let output = run(fixtures::crash("db", 500.0, 500.0), 2_000.0);
    let conservation = &output.verification.request_conservation;

    assert_eq!(output.event_count(EventKind::FaultActivate), 1);
    assert_eq!(output.event_count(EventKind::FaultDeactivate), 1);
    assert!(conservation.holds, "{conservation:?}");
    assert!(conservation.failed > 0);
    // Traffic before and after the outage still succeeds.
    assert!(conservation.succeeded > conservation.failed);

    let db = output.component_metrics("db").unwrap();
    assert!(db.errors.errors_by_type.contains_key("unavailable"), "{db:?}");
}

#[test]
fn test_overlapping_crashes_keep_db_down_until_the_last_expires() {
    // first: 100-500ms, second: 200-800ms
    let second_alone = run_faults(vec![db_crash("second", 200.0, 600.0)], 100.0, 1_000.0);
    let both = run_faults(
        vec![db_crash("first", 100.0, 400.0), db_crash("second", 200.0, 600.0)],
        100.0,
        1_000.0,
    );
    let alone = &second_alone.verification.request_conservation;
    let overlapped = &both.verification.request_conservation;

    assert!(overlapped.holds, "{overlapped:?}");
    assert!(overlapped.failed > alone.failed, "{overlapped:?} vs {alone:?}");
    assert_eq!(both.event_count(EventKind::FaultDeactivate), 2);
    let recoveries: Vec<_> = both.events_of(EventKind::NodeRecovery).collect();
    assert_eq!(recoveries.len(), 1, "{recoveries:?}");
    assert_eq!(recoveries[0].time, SimTime::from_millis(800));
}

#[test]
fn test_latency_fault_slows_the_component() {
    let output = run(fixtures::slow("db", 100.0, 0.0, 5_000.0), 1_000.0);
    let db = output.component_metrics("db").unwrap();
    assert!(db.latency.p50 >= 100.0, "{:?}", db.latency);
    assert!(output.metrics.global.latency.p50 >= 100.0);
    assert_eq!(output.verification.request_conservation.failed, 0);
}

#[test]
fn test_dns_failure_is_reported_by_type() {
    let fault = FaultInjection::on_component("dns", "db", FaultSpec::DnsFailure, 0.0, 500.0);
    let output = run(fault, 1_000.0);
    let db = output.component_metrics("db").unwrap();
    assert!(db.errors.errors_by_type.contains_key("dns-failure"), "{db:?}");
    assert!(output.verification.request_conservation.failed > 0);
}

#[test]
fn test_partition_cuts_the_edge() {
    let fault = FaultInjection::on_component(
        "split",
        "api",
        FaultSpec::NetworkPartition {
            partition_with: vec!["db".to_string()],
        },
        0.0,
        1_000.0,
    );
    let output = run(fault, 2_000.0);
    let conservation = &output.verification.request_conservation;

    assert!(output.event_count(EventKind::NetworkPartition) >= 1);
    assert!(conservation.failed > 0);
    assert!(conservation.succeeded > 0);
    let db = output.component_metrics("db").unwrap();
    assert!(db.availability.total_requests < conservation.arrivals);
}
