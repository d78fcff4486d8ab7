//! archsim CLI
//!
//! Run deterministic architecture simulations from JSON scenario files.
//!
//! # Example
//!
//! ```bash
//! # Run a scenario with the seed it was saved with
//! archsim run checkout.json
//!
//! # Override the seed and duration, write the full output as JSON
//! archsim run checkout.json --seed 42 --duration-ms 120000 --json -o out.json
//!
//! # Run 20 seeds in parallel and summarize the spread
//! archsim sweep checkout.json --runs 20
//!
//! # Compare two designs under the same seed
//! archsim compare monolith.json split.json --seed 7
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use archsim_simulation::sweep::summarize;
use archsim_simulation::{compare, seed_sweep, RunSummary, SimulationRunner};
use archsim_simulator::{
    load, print_comparison, print_sweep, write_json, Overrides, RunReport, ScenarioError,
};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// archsim
///
/// Runs deterministic discrete-event simulations of distributed-system
/// architectures. The same scenario and seed always produce the same trace.
#[derive(Parser, Debug)]
#[command(name = "archsim")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one scenario and print a report
    Run {
        /// Scenario file (JSON)
        scenario: PathBuf,

        #[command(flatten)]
        overrides: OverrideArgs,

        /// Print the full output as JSON instead of a report
        #[arg(long)]
        json: bool,

        /// Write the JSON output to this file instead of stdout
        #[arg(short = 'o', long, requires = "json")]
        output: Option<PathBuf>,
    },

    /// Run one scenario under many seeds in parallel
    Sweep {
        /// Scenario file (JSON)
        scenario: PathBuf,

        /// Number of seeds to run
        #[arg(short = 'n', long, default_value = "10")]
        runs: usize,

        /// Seed prefix; seeds are `<prefix>-0`, `<prefix>-1`, ... When omitted,
        /// a random prefix is used.
        #[arg(long)]
        seed_prefix: Option<String>,

        /// Simulated duration in milliseconds
        #[arg(short = 'd', long)]
        duration_ms: Option<f64>,

        /// Print the run summaries as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run two designs under the same workload and seed
    Compare {
        /// Baseline scenario file (JSON)
        baseline: PathBuf,

        /// Candidate scenario file (JSON)
        candidate: PathBuf,

        #[command(flatten)]
        overrides: OverrideArgs,

        /// Print the comparison as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args, Debug, Clone)]
struct OverrideArgs {
    /// Seed for reproducible results. When omitted, the scenario's own seed is used.
    #[arg(long)]
    seed: Option<String>,

    /// Simulated duration in milliseconds
    #[arg(short = 'd', long)]
    duration_ms: Option<f64>,

    /// Fraction of events kept in the event trace (0.0-1.0)
    #[arg(long)]
    trace_sampling: Option<f64>,

    /// Stop after this many events
    #[arg(long)]
    max_events: Option<u64>,
}

impl From<OverrideArgs> for Overrides {
    fn from(args: OverrideArgs) -> Self {
        Self {
            seed: args.seed,
            duration_ms: args.duration_ms,
            trace_sampling: args.trace_sampling,
            max_events: args.max_events,
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,archsim_simulation=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match execute(cli.command) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn execute(command: Command) -> Result<ExitCode, ScenarioError> {
    match command {
        Command::Run {
            scenario,
            overrides,
            json,
            output,
        } => {
            let input = Overrides::from(overrides).apply(load(&scenario)?);
            info!(scenario = %scenario.display(), "starting run");

            let started = Instant::now();
            let result = SimulationRunner::new(input)?.run()?;
            let wall_duration = started.elapsed();

            if json {
                write_json(&result, output.as_deref())?;
            } else {
                RunReport {
                    output: &result,
                    wall_duration,
                }
                .print_summary();
            }
            if result.is_aborted() {
                warn!(run = result.run_id.as_str(), "run aborted by an invariant");
                return Ok(ExitCode::from(2));
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::Sweep {
            scenario,
            runs,
            seed_prefix,
            duration_ms,
            json,
        } => {
            let input = Overrides {
                duration_ms,
                ..Overrides::default()
            }
            .apply(load(&scenario)?);
            let prefix = seed_prefix.unwrap_or_else(|| format!("{:08x}", rand::random::<u32>()));
            let seeds: Vec<String> = (0..runs).map(|i| format!("{prefix}-{i}")).collect();
            info!(runs, prefix = prefix.as_str(), "starting seed sweep");

            let outputs = seed_sweep(&input, &seeds)
                .into_iter()
                .collect::<Result<Vec<_>, _>>()?;
            let summaries: Vec<RunSummary> = outputs.iter().map(RunSummary::from).collect();
            let summary = summarize(&outputs);

            if json {
                write_json(&summaries, None)?;
            } else {
                print_sweep(&summaries, &summary);
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::Compare {
            baseline,
            candidate,
            overrides,
            json,
        } => {
            let overrides = Overrides::from(overrides);
            let a = overrides.apply(load(&baseline)?);
            let b = overrides.apply(load(&candidate)?);
            let comparison = compare(a, b)?;

            if json {
                write_json(&comparison, None)?;
            } else {
                print_comparison(&comparison);
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}
