//! Parallel execution of independent runs.
//!
//! Every run owns its queue, random source and graph, so runs share nothing
//! and fan out over the rayon pool. Results come back in input order.

use archsim_core::{RunStatus, SimulationOutput};
use rayon::prelude::*;
use serde::Serialize;
use tracing::info;

use crate::error::SimulationError;
use crate::runner::{SimulationInput, SimulationRunner};

/// Error rates closer than this count as equal when picking a winner.
const ERROR_RATE_TOLERANCE: f64 = 0.001;

/// Run every input to completion, in parallel.
pub fn run_all(inputs: Vec<SimulationInput>) -> Vec<Result<SimulationOutput, SimulationError>> {
    info!(runs = inputs.len(), "starting parallel runs");
    inputs
        .into_par_iter()
        .map(|input| SimulationRunner::new(input)?.run())
        .collect()
}

/// Run `input` once per seed.
pub fn seed_sweep<S: AsRef<str>>(
    input: &SimulationInput,
    seeds: &[S],
) -> Vec<Result<SimulationOutput, SimulationError>> {
    let inputs = seeds
        .iter()
        .map(|seed| {
            let mut input = input.clone();
            let config = input
                .config
                .take()
                .unwrap_or_else(|| {
                    crate::config::SimulationConfig::from_global(&input.architecture.global_config)
                })
                .with_seed(seed.as_ref());
            input.config = Some(config);
            input
        })
        .collect();
    run_all(inputs)
}

/// Headline numbers of one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub run_id: String,
    pub seed: String,
    pub completed: bool,
    pub latency_p50_ms: f64,
    pub latency_p99_ms: f64,
    pub error_rate: f64,
    pub availability_percent: f64,
    pub throughput_rps: f64,
    pub invariant_violations: usize,
    pub slo_breaches: usize,
    pub anti_patterns: usize,
}

impl From<&SimulationOutput> for RunSummary {
    fn from(output: &SimulationOutput) -> Self {
        let global = &output.metrics.global;
        Self {
            run_id: output.run_id.clone(),
            seed: output.seed.clone(),
            completed: output.status == RunStatus::Completed,
            latency_p50_ms: global.latency.p50,
            latency_p99_ms: global.latency.p99,
            error_rate: global.errors.error_rate,
            availability_percent: global.availability.availability_percent,
            throughput_rps: global.throughput.requests_per_second,
            invariant_violations: output.invariant_violations.len(),
            slo_breaches: output.slo_breaches.len(),
            anti_patterns: output.anti_patterns_detected.len(),
        }
    }
}

/// Which design of a comparison came out ahead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Preferred {
    Baseline,
    Candidate,
    Tie,
}

/// Candidate minus baseline.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryDelta {
    pub latency_p50_ms: f64,
    pub latency_p99_ms: f64,
    pub error_rate: f64,
    pub availability_percent: f64,
    pub throughput_rps: f64,
}

/// Two designs run under the same workload, faults and seed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DesignComparison {
    pub baseline: RunSummary,
    pub candidate: RunSummary,
    pub delta: SummaryDelta,
    pub preferred: Preferred,
}

impl DesignComparison {
    pub fn new(baseline: RunSummary, candidate: RunSummary) -> Self {
        let delta = SummaryDelta {
            latency_p50_ms: candidate.latency_p50_ms - baseline.latency_p50_ms,
            latency_p99_ms: candidate.latency_p99_ms - baseline.latency_p99_ms,
            error_rate: candidate.error_rate - baseline.error_rate,
            availability_percent: candidate.availability_percent - baseline.availability_percent,
            throughput_rps: candidate.throughput_rps - baseline.throughput_rps,
        };
        // Fewer errors first, then the lower tail.
        let preferred = if delta.error_rate < -ERROR_RATE_TOLERANCE {
            Preferred::Candidate
        } else if delta.error_rate > ERROR_RATE_TOLERANCE {
            Preferred::Baseline
        } else if delta.latency_p99_ms < 0.0 {
            Preferred::Candidate
        } else if delta.latency_p99_ms > 0.0 {
            Preferred::Baseline
        } else {
            Preferred::Tie
        };
        Self {
            baseline,
            candidate,
            delta,
            preferred,
        }
    }
}

/// Run two designs side by side and compare their headline numbers.
pub fn compare(
    baseline: SimulationInput,
    candidate: SimulationInput,
) -> Result<DesignComparison, SimulationError> {
    let (a, b) = rayon::join(
        || SimulationRunner::new(baseline)?.run(),
        || SimulationRunner::new(candidate)?.run(),
    );
    let comparison = DesignComparison::new(RunSummary::from(&a?), RunSummary::from(&b?));
    info!(preferred = ?comparison.preferred, "design comparison finished");
    Ok(comparison)
}

/// Spread of headline numbers over a sweep.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepSummary {
    pub runs: usize,
    pub incomplete: usize,
    pub mean_latency_p99_ms: f64,
    pub worst_latency_p99_ms: f64,
    pub mean_error_rate: f64,
    pub worst_error_rate: f64,
}

pub fn summarize(outputs: &[SimulationOutput]) -> SweepSummary {
    let summaries: Vec<RunSummary> = outputs.iter().map(RunSummary::from).collect();
    let n = summaries.len().max(1) as f64;
    SweepSummary {
        runs: summaries.len(),
        incomplete: summaries.iter().filter(|s| !s.completed).count(),
        mean_latency_p99_ms: summaries.iter().map(|s| s.latency_p99_ms).sum::<f64>() / n,
        worst_latency_p99_ms: summaries
            .iter()
            .map(|s| s.latency_p99_ms)
            .fold(0.0, f64::max),
        mean_error_rate: summaries.iter().map(|s| s.error_rate).sum::<f64>() / n,
        worst_error_rate: summaries.iter().map(|s| s.error_rate).fold(0.0, f64::max),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(error_rate: f64, p99: f64) -> RunSummary {
        RunSummary {
            run_id: "r".into(),
            seed: "s".into(),
            completed: true,
            latency_p50_ms: 1.0,
            latency_p99_ms: p99,
            error_rate,
            availability_percent: 100.0 * (1.0 - error_rate),
            throughput_rps: 100.0,
            invariant_violations: 0,
            slo_breaches: 0,
            anti_patterns: 0,
        }
    }

    #[test]
    fn test_fewer_errors_wins_over_latency() {
        let comparison = DesignComparison::new(summary(0.10, 20.0), summary(0.01, 80.0));
        assert_eq!(comparison.preferred, Preferred::Candidate);
        assert!(comparison.delta.latency_p99_ms > 0.0);
    }

    #[test]
    fn test_equal_errors_fall_back_to_tail_latency() {
        let comparison = DesignComparison::new(summary(0.0100, 20.0), summary(0.0105, 40.0));
        assert_eq!(comparison.preferred, Preferred::Baseline);
        let tie = DesignComparison::new(summary(0.0, 20.0), summary(0.0, 20.0));
        assert_eq!(tie.preferred, Preferred::Tie);
    }
}
