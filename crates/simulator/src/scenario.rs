//! Scenario files and command-line overrides.
//!
//! A scenario file is the JSON form of a [`SimulationInput`]: an
//! architecture plus optional workload, faults, config and composed
//! scenario. The `deterministic_config` of any run's output is itself a
//! valid scenario file, so runs can be replayed from their output.

use std::fs;
use std::path::{Path, PathBuf};

use archsim_simulation::{SimulationConfig, SimulationError, SimulationInput};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid scenario {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode output: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Simulation(#[from] SimulationError),
}

/// Load a scenario file.
pub fn load(path: &Path) -> Result<SimulationInput, ScenarioError> {
    let text = fs::read_to_string(path).map_err(|source| ScenarioError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let input: SimulationInput =
        serde_json::from_str(&text).map_err(|source| ScenarioError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    debug!(
        path = %path.display(),
        architecture = input.architecture.id.as_str(),
        faults = input.faults.len(),
        "loaded scenario"
    );
    Ok(input)
}

/// Write `value` as pretty JSON to `path`, or to stdout when `path` is `None`.
pub fn write_json<T: Serialize>(value: &T, path: Option<&Path>) -> Result<(), ScenarioError> {
    let text = serde_json::to_string_pretty(value)?;
    match path {
        Some(path) => fs::write(path, text).map_err(|source| ScenarioError::Write {
            path: path.to_path_buf(),
            source,
        }),
        None => {
            println!("{text}");
            Ok(())
        }
    }
}

/// Settings given on the command line that win over the scenario file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Overrides {
    pub seed: Option<String>,
    pub duration_ms: Option<f64>,
    pub trace_sampling: Option<f64>,
    pub max_events: Option<u64>,
}

impl Overrides {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Fold the overrides into `input`'s config. An input without a config
    /// starts from its architecture's global settings.
    pub fn apply(&self, mut input: SimulationInput) -> SimulationInput {
        if self.is_empty() {
            return input;
        }
        let mut config = input
            .config
            .take()
            .unwrap_or_else(|| SimulationConfig::from_global(&input.architecture.global_config));
        if let Some(seed) = &self.seed {
            config = config.with_seed(seed.clone());
        }
        if let Some(ms) = self.duration_ms {
            config = config.with_duration_ms(ms);
        }
        if let Some(rate) = self.trace_sampling {
            config = config.with_trace_sampling(rate);
        }
        if let Some(max) = self.max_events {
            config = config.with_max_events(max);
        }
        input.config = Some(config);
        input
    }
}
