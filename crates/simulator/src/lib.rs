//! archsim command-line driver.
//!
//! Loads scenario files, runs them on `archsim-simulation` and prints what
//! happened:
//!
//! - **Scenario files**: JSON [`SimulationInput`]s, with command-line
//!   overrides for seed, duration and sampling
//! - **Reports**: headline metrics, findings and verification results
//! - **Sweeps and comparisons**: many seeds, or two designs side by side
//!
//! # Example
//!
//! ```ignore
//! use archsim_simulator::{scenario, RunReport};
//! use std::path::Path;
//! use std::time::Instant;
//!
//! let input = scenario::load(Path::new("checkout.json"))?;
//! let started = Instant::now();
//! let output = archsim_simulation::simulate(input)?;
//! RunReport { output: &output, wall_duration: started.elapsed() }.print_summary();
//! ```
//!
//! [`SimulationInput`]: archsim_simulation::SimulationInput

pub mod report;
pub mod scenario;

pub use report::{print_comparison, print_sweep, status_line, RunReport};
pub use scenario::{load, write_json, Overrides, ScenarioError};
