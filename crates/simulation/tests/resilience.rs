//! Circuit breakers and retries on edges.

use archsim_core::{EdgeMetrics, EventKind, SimulationOutput};
use archsim_simulation::{SimulationConfig, SimulationInput, SimulationRunner};
use archsim_test_helpers::{fixtures, steady};
use archsim_types::{CircuitBreakerConfig, EdgeId, EdgeRetryPolicy, SystemArchitecture};
use tracing_test::traced_test;

fn run(arch: SystemArchitecture, seed: &str, error_rate: f64) -> SimulationOutput {
    let input = SimulationInput::new(arch)
        .with_workload(steady(100.0))
        .with_fault(fixtures::errors("db", error_rate, 500.0, 1_000.0))
        .with_config(SimulationConfig::new(seed).with_duration_ms(3_000.0));
    SimulationRunner::new(input).unwrap().run().unwrap()
}

fn edge<'a>(output: &'a SimulationOutput, id: &str) -> &'a EdgeMetrics {
    output.metrics.per_edge.get(&EdgeId::new(id)).unwrap()
}

fn breaker() -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        enabled: true,
        failure_threshold: 3,
        recovery_window_ms: 500.0,
        half_open_requests: 1,
    }
}

fn retry(max_attempts: u32, retryable_errors: Vec<String>) -> EdgeRetryPolicy {
    EdgeRetryPolicy {
        enabled: true,
        max_attempts,
        backoff_ms: 10.0,
        backoff_multiplier: 2.0,
        retryable_errors,
    }
}

#[traced_test]
#[test]
fn test_breaker_opens_short_circuits_and_closes() {
    let output = run(
        fixtures::api_db_with(|e| e.with_circuit_breaker(breaker())),
        "breaker",
        1.0,
    );

    assert!(output.event_count(EventKind::CircuitOpen) >= 1);
    assert!(output.event_count(EventKind::CircuitClose) >= 1);

    let metrics = edge(&output, "api-db");
    assert!(metrics.short_circuited > 0, "{metrics:?}");
    assert!(metrics.breaker_opens >= 1);
    // Short-circuited calls never reach the wire.
    assert!(metrics.successes + metrics.failures < metrics.calls);
    assert!(output.verification.request_conservation.holds);
}

#[test]
fn test_breaker_spares_the_failing_dependency() {
    let open = run(
        fixtures::api_db_with(|e| e.with_circuit_breaker(breaker())),
        "spare",
        1.0,
    );
    let plain = run(fixtures::api_db(), "spare", 1.0);

    let reached = |o: &SimulationOutput| {
        o.component_metrics("db")
            .unwrap()
            .availability
            .total_requests
    };
    assert!(reached(&open) < reached(&plain));
}

#[test]
fn test_retries_recover_transient_errors() {
    let retried = run(
        fixtures::api_db_with(|e| e.with_retry(retry(3, Vec::new()))),
        "retries",
        0.5,
    );
    let single = run(fixtures::api_db(), "retries", 0.5);

    let metrics = edge(&retried, "api-db");
    assert!(metrics.retries > 0);
    // Retries still pending at the horizon are counted but never drained.
    assert!(metrics.retries >= retried.event_count(EventKind::RequestRetry));
    assert!(retried.event_count(EventKind::RequestRetry) > 0);

    assert_eq!(edge(&single, "api-db").retries, 0);
    assert!(
        retried.verification.request_conservation.failed
            < single.verification.request_conservation.failed
    );
}

#[test]
fn test_retry_only_listed_errors() {
    let output = run(
        fixtures::api_db_with(|e| e.with_retry(retry(3, vec!["timeout".to_string()]))),
        "listed",
        1.0,
    );
    assert_eq!(edge(&output, "api-db").retries, 0);
    assert_eq!(output.event_count(EventKind::RequestRetry), 0);
    assert!(output.verification.request_conservation.failed > 0);
}
