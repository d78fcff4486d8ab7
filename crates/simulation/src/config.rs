//! Run configuration.

use archsim_types::GlobalConfig;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Configuration for a simulation run.
///
/// Everything that influences the event trace lives here or in the input
/// architecture, so that the pair hashes to the run's `configHash`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SimulationConfig {
    /// Root seed. Any string; hashed into the root random key.
    pub seed: String,

    /// Simulated time to run for.
    pub duration_ms: f64,

    /// Initial period excluded from aggregate metrics.
    pub warmup_ms: f64,

    /// Width of time-series buckets and period of metric snapshots.
    pub metrics_resolution_ms: f64,

    /// Width of the rolling window behind error-rate and latency triggers.
    pub rolling_window_ms: f64,

    /// Fraction of events kept in the event trace.
    pub trace_sampling_rate: f64,

    /// Fraction of sealed requests kept in the request traces.
    pub request_sampling_rate: f64,

    /// Hops a cascading propagation effect may travel.
    pub max_cascade_depth: u32,

    /// Fraction of generated requests that are reads.
    pub read_ratio: f64,

    /// Number of distinct keys requests are drawn from.
    pub key_space: u64,

    /// Skew of key popularity; 0 is uniform.
    pub key_skew: f64,

    /// Number of distinct users requests are drawn from.
    pub user_space: u64,

    /// Stop after this many events, if set.
    pub max_events: Option<u64>,

    /// Violations recorded per invariant before further ones are only counted.
    pub max_violations_per_invariant: usize,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: "0".to_string(),
            duration_ms: 60_000.0,
            warmup_ms: 0.0,
            metrics_resolution_ms: 1_000.0,
            rolling_window_ms: 10_000.0,
            trace_sampling_rate: 1.0,
            request_sampling_rate: 1.0,
            max_cascade_depth: 8,
            read_ratio: 0.8,
            key_space: 1_000,
            key_skew: 0.0,
            user_space: 100,
            max_events: None,
            max_violations_per_invariant: 100,
        }
    }
}

impl SimulationConfig {
    /// Create a configuration with the given seed and default settings.
    pub fn new(seed: impl Into<String>) -> Self {
        Self {
            seed: seed.into(),
            ..Default::default()
        }
    }

    /// Defaults taken from an architecture's global settings.
    pub fn from_global(global: &GlobalConfig) -> Self {
        let defaults = &global.simulation;
        Self {
            seed: defaults.default_seed.clone(),
            duration_ms: defaults.default_duration_ms,
            warmup_ms: defaults.warmup_ms,
            ..Default::default()
        }
    }

    /// Set the seed.
    pub fn with_seed(mut self, seed: impl Into<String>) -> Self {
        self.seed = seed.into();
        self
    }

    /// Set the simulated duration.
    pub fn with_duration_ms(mut self, duration_ms: f64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    /// Set the warmup period.
    pub fn with_warmup_ms(mut self, warmup_ms: f64) -> Self {
        self.warmup_ms = warmup_ms;
        self
    }

    /// Set the time-series resolution.
    pub fn with_metrics_resolution_ms(mut self, resolution_ms: f64) -> Self {
        self.metrics_resolution_ms = resolution_ms;
        self
    }

    /// Set the rolling window width.
    pub fn with_rolling_window_ms(mut self, window_ms: f64) -> Self {
        self.rolling_window_ms = window_ms;
        self
    }

    /// Set the event trace sampling rate.
    pub fn with_trace_sampling(mut self, rate: f64) -> Self {
        self.trace_sampling_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Set the request trace sampling rate.
    pub fn with_request_sampling(mut self, rate: f64) -> Self {
        self.request_sampling_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Set the cascade depth limit.
    pub fn with_max_cascade_depth(mut self, depth: u32) -> Self {
        self.max_cascade_depth = depth;
        self
    }

    /// Set the read ratio.
    pub fn with_read_ratio(mut self, ratio: f64) -> Self {
        self.read_ratio = ratio.clamp(0.0, 1.0);
        self
    }

    /// Set the key space and its skew.
    pub fn with_keys(mut self, key_space: u64, key_skew: f64) -> Self {
        self.key_space = key_space;
        self.key_skew = key_skew;
        self
    }

    /// Set the number of distinct users.
    pub fn with_user_space(mut self, users: u64) -> Self {
        self.user_space = users;
        self
    }

    /// Stop after a fixed number of events.
    pub fn with_max_events(mut self, max_events: u64) -> Self {
        self.max_events = Some(max_events);
        self
    }

    /// Record at most `cap` violations of each invariant.
    pub fn with_max_violations_per_invariant(mut self, cap: usize) -> Self {
        self.max_violations_per_invariant = cap;
        self
    }

    /// Reject settings the kernel cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = |name: &str, v: f64| {
            if v.is_finite() && v > 0.0 {
                Ok(())
            } else {
                Err(ConfigError::InvalidConfig(format!(
                    "{name} must be positive, got {v}"
                )))
            }
        };
        positive("durationMs", self.duration_ms)?;
        positive("metricsResolutionMs", self.metrics_resolution_ms)?;
        positive("rollingWindowMs", self.rolling_window_ms)?;
        if !(self.warmup_ms.is_finite() && self.warmup_ms >= 0.0) {
            return Err(ConfigError::InvalidConfig(format!(
                "warmupMs must be non-negative, got {}",
                self.warmup_ms
            )));
        }
        if !(self.key_skew.is_finite() && self.key_skew >= 0.0) {
            return Err(ConfigError::InvalidConfig(format!(
                "keySkew must be non-negative, got {}",
                self.key_skew
            )));
        }
        if self.key_space == 0 || self.user_space == 0 {
            return Err(ConfigError::InvalidConfig(
                "keySpace and userSpace must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_global_takes_run_defaults() {
        let mut global = GlobalConfig::default();
        global.simulation.default_seed = "abc".into();
        global.simulation.default_duration_ms = 5_000.0;
        global.simulation.warmup_ms = 500.0;

        let config = SimulationConfig::from_global(&global);
        assert_eq!(config.seed, "abc");
        assert_eq!(config.duration_ms, 5_000.0);
        assert_eq!(config.warmup_ms, 500.0);
        assert_eq!(config.rolling_window_ms, 10_000.0);
    }

    #[test]
    fn test_validate_rejects_zero_duration() {
        let config = SimulationConfig::default().with_duration_ms(0.0);
        assert!(matches!(config.validate(), Err(ConfigError::InvalidConfig(_))));
        assert!(SimulationConfig::default().validate().is_ok());
    }

    #[test]
    fn test_sampling_is_clamped() {
        let config = SimulationConfig::new("s").with_trace_sampling(3.0);
        assert_eq!(config.trace_sampling_rate, 1.0);
    }
}
