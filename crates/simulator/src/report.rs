//! Human-readable reports printed after a run.

use std::time::Duration;

use archsim_core::{RunStatus, SimulationOutput};
use archsim_simulation::sweep::SweepSummary;
use archsim_simulation::{DesignComparison, RunSummary};

/// One finished run plus the wall-clock time it took.
#[derive(Debug, Clone)]
pub struct RunReport<'a> {
    pub output: &'a SimulationOutput,
    pub wall_duration: Duration,
}

/// One-line description of how a run ended.
pub fn status_line(status: &RunStatus) -> String {
    match status {
        RunStatus::Completed => "completed".to_string(),
        RunStatus::Aborted {
            invariant_id,
            at,
            reason,
        } => format!("aborted at {at} by {}: {reason}", invariant_id.as_str()),
        RunStatus::Cancelled { at } => format!("cancelled at {at}"),
        RunStatus::EventBudgetExhausted { processed } => {
            format!("event budget exhausted after {processed} events")
        }
    }
}

impl RunReport<'_> {
    pub fn print_summary(&self) {
        let output = self.output;
        let global = &output.metrics.global;
        let conservation = &output.verification.request_conservation;

        println!("\n═══════════════════════════════════════════");
        println!("          ARCHITECTURE SIMULATION          ");
        println!("═══════════════════════════════════════════");
        println!();
        println!("Run:     {}", output.run_id);
        println!("Seed:    {}", output.seed);
        println!("Status:  {}", status_line(&output.status));
        println!();
        println!("Requests:");
        println!("  Arrivals:   {}", conservation.arrivals);
        println!("  Succeeded:  {}", conservation.succeeded);
        println!("  Failed:     {}", conservation.failed);
        println!("  Timed out:  {}", conservation.timed_out);
        println!("  Rejected:   {}", conservation.rejected);
        println!("  In-flight:  {} (at cutoff)", conservation.in_flight);
        println!();
        println!("Throughput: {:.2} req/s", global.throughput.requests_per_second);
        println!("Availability: {:.3}%", global.availability.availability_percent);
        println!("Error rate: {:.4}", global.errors.error_rate);
        println!();
        println!("Latency:");
        println!("  P50:  {:.3}ms", global.latency.p50);
        println!("  P90:  {:.3}ms", global.latency.p90);
        println!("  P99:  {:.3}ms", global.latency.p99);
        println!("  Max:  {:.3}ms", global.latency.max);
        println!("  Avg:  {:.3}ms", global.latency.mean);
        println!();

        if !output.metrics.per_component.is_empty() {
            println!("Components:");
            for (id, metrics) in &output.metrics.per_component {
                println!(
                    "  {:<20} {:>8} req  p99 {:>9.3}ms  errors {:>6.2}%",
                    id.as_str(),
                    metrics.availability.total_requests,
                    metrics.latency.p99,
                    metrics.errors.error_rate * 100.0
                );
            }
            println!();
        }

        let edges: Vec<_> = output
            .metrics
            .per_edge
            .iter()
            .filter(|(_, m)| m.retries > 0 || m.short_circuited > 0 || m.dropped > 0)
            .collect();
        if !edges.is_empty() {
            println!("Edges:");
            for (id, m) in edges {
                println!(
                    "  {:<20} calls {:>7}  retries {:>5}  short-circuited {:>5}  dropped {:>5}",
                    id.as_str(),
                    m.calls,
                    m.retries,
                    m.short_circuited,
                    m.dropped
                );
            }
            println!();
        }

        if !output.invariant_violations.is_empty() {
            println!("Invariant violations: {}", output.invariant_violations.len());
            for violation in output.invariant_violations.iter().take(10) {
                println!(
                    "  [{:.0}ms] {}: {}",
                    violation.violated_at,
                    violation.invariant_id.as_str(),
                    violation.details
                );
            }
            println!();
        }
        if !output.slo_breaches.is_empty() {
            println!("SLO breaches:");
            for breach in &output.slo_breaches {
                println!(
                    "  {} {:?} {:.3} > {:.3} for {:.0}ms",
                    breach.component_id.as_str(),
                    breach.slo_type,
                    breach.actual_value,
                    breach.threshold,
                    breach.duration_ms
                );
            }
            println!();
        }
        if !output.anti_patterns_detected.is_empty() {
            println!("Anti-patterns:");
            for detection in &output.anti_patterns_detected {
                println!(
                    "  {:?} at {}: {}",
                    detection.anti_pattern,
                    detection.detected_at.join(", "),
                    detection.recommendation
                );
            }
            println!();
        }

        let verification = &output.verification;
        let littles_law_failures = verification
            .littles_law
            .iter()
            .filter(|check| !check.holds)
            .count();
        println!("Verification:");
        println!("  Conservation:  {}", verdict(conservation.holds));
        println!("  Causal order:  {}", verdict(verification.causal_order.holds));
        println!(
            "  Little's law:  {}/{} components hold",
            verification.littles_law.len() - littles_law_failures,
            verification.littles_law.len()
        );
        println!();
        println!("Trace hash:  {}", output.reproducibility_spec.trace_hash);
        println!(
            "Duration: {:.2}s (simulated: {:.3}s, {} events)",
            self.wall_duration.as_secs_f64(),
            output.simulated_duration_ms / 1_000.0,
            output.metadata.events_processed
        );
        println!("═══════════════════════════════════════════\n");
    }
}

fn verdict(holds: bool) -> &'static str {
    if holds {
        "ok"
    } else {
        "VIOLATED"
    }
}

pub fn print_comparison(comparison: &DesignComparison) {
    println!("\n=== Design Comparison ===");
    println!(
        "{:<12} {:>10} {:>10} {:>10} {:>12}",
        "", "p50 ms", "p99 ms", "errors", "avail %"
    );
    for (label, s) in [
        ("baseline", &comparison.baseline),
        ("candidate", &comparison.candidate),
    ] {
        println!(
            "{:<12} {:>10.3} {:>10.3} {:>10.4} {:>12.3}",
            label, s.latency_p50_ms, s.latency_p99_ms, s.error_rate, s.availability_percent
        );
    }
    let d = &comparison.delta;
    println!(
        "{:<12} {:>+10.3} {:>+10.3} {:>+10.4} {:>+12.3}",
        "delta", d.latency_p50_ms, d.latency_p99_ms, d.error_rate, d.availability_percent
    );
    println!("Preferred: {:?}\n", comparison.preferred);
}

pub fn print_sweep(runs: &[RunSummary], summary: &SweepSummary) {
    println!("\n=== Seed Sweep ({} runs) ===", summary.runs);
    for run in runs {
        println!(
            "  {:<16} p99 {:>9.3}ms  errors {:>7.4}  {}",
            run.seed,
            run.latency_p99_ms,
            run.error_rate,
            if run.completed { "" } else { "(incomplete)" }
        );
    }
    println!();
    println!(
        "p99:    mean {:.3}ms, worst {:.3}ms",
        summary.mean_latency_p99_ms, summary.worst_latency_p99_ms
    );
    println!(
        "errors: mean {:.4}, worst {:.4}",
        summary.mean_error_rate, summary.worst_error_rate
    );
    if summary.incomplete > 0 {
        println!("incomplete runs: {}", summary.incomplete);
    }
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use archsim_types::{InvariantId, SimTime};

    #[test]
    fn test_status_lines() {
        assert_eq!(status_line(&RunStatus::Completed), "completed");
        let aborted = RunStatus::Aborted {
            invariant_id: InvariantId::new("slo"),
            at: SimTime::from_millis(1_500),
            reason: "error rate 0.5".to_string(),
        };
        let line = status_line(&aborted);
        assert!(line.starts_with("aborted at"));
        assert!(line.contains("slo: error rate 0.5"));
        assert_eq!(
            status_line(&RunStatus::EventBudgetExhausted { processed: 7 }),
            "event budget exhausted after 7 events"
        );
    }
}
