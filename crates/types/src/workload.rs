//! Traffic profiles.

use crate::distribution::{DistributionConfig, Interpolation};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Milliseconds in one hour of a diurnal cycle, unless compressed.
pub const HOUR_MS: f64 = 3_600_000.0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArrivalDistribution {
    /// Fixed inter-arrival interval.
    Constant,
    /// Exponential inter-arrival times.
    #[default]
    Poisson,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RampType {
    #[default]
    Linear,
    Exponential,
}

/// One recorded arrival for replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordedArrival {
    pub offset_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_type: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// One point of a custom rate schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RatePoint {
    pub at_ms: f64,
    pub rps: f64,
}

/// How requests arrive over time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum WorkloadProfile {
    SteadyState {
        requests_per_second: f64,
        #[serde(default)]
        distribution: ArrivalDistribution,
    },
    Spike {
        base_rps: f64,
        spike_rps: f64,
        spike_start_ms: f64,
        spike_duration_ms: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ramp_up_ms: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ramp_down_ms: Option<f64>,
    },
    Diurnal {
        base_rps: f64,
        /// One multiplier per hour of the day.
        hourly_multipliers: Vec<f64>,
        #[serde(default)]
        timezone: String,
        /// Simulated length of one hour; defaults to a real hour.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hour_duration_ms: Option<f64>,
    },
    Sawtooth {
        min_rps: f64,
        max_rps: f64,
        period_ms: f64,
        #[serde(default)]
        ramp_type: RampType,
    },
    Bursty {
        base_rps: f64,
        burst_rps: f64,
        burst_duration_ms: f64,
        /// Gap between the end of one burst and the start of the next.
        burst_interval_distribution: DistributionConfig,
    },
    LongTail {
        /// Request size in bytes.
        request_size_distribution: DistributionConfig,
        base_rps: f64,
    },
    Replay {
        recorded_events: Vec<RecordedArrival>,
        /// 2.0 replays twice as fast.
        time_scale: f64,
    },
    Custom {
        schedule: Vec<RatePoint>,
        #[serde(default)]
        interpolation: Interpolation,
    },
}

impl WorkloadProfile {
    /// Poisson arrivals at a fixed rate.
    pub fn steady(requests_per_second: f64) -> Self {
        Self::SteadyState {
            requests_per_second,
            distribution: ArrivalDistribution::Poisson,
        }
    }

    /// Evenly spaced arrivals at a fixed rate.
    pub fn constant(requests_per_second: f64) -> Self {
        Self::SteadyState {
            requests_per_second,
            distribution: ArrivalDistribution::Constant,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::SteadyState { .. } => "steady-state",
            Self::Spike { .. } => "spike",
            Self::Diurnal { .. } => "diurnal",
            Self::Sawtooth { .. } => "sawtooth",
            Self::Bursty { .. } => "bursty",
            Self::LongTail { .. } => "long-tail",
            Self::Replay { .. } => "replay",
            Self::Custom { .. } => "custom",
        }
    }

    /// Check structural constraints the generator relies on.
    pub fn validate(&self) -> Result<(), String> {
        fn rate(name: &str, v: f64) -> Result<(), String> {
            if v.is_finite() && v >= 0.0 {
                Ok(())
            } else {
                Err(format!("{name} must be a non-negative rate, got {v}"))
            }
        }
        match self {
            Self::SteadyState {
                requests_per_second,
                ..
            } => rate("requestsPerSecond", *requests_per_second),
            Self::Spike {
                base_rps,
                spike_rps,
                spike_duration_ms,
                ..
            } => {
                rate("baseRps", *base_rps)?;
                rate("spikeRps", *spike_rps)?;
                rate("spikeDurationMs", *spike_duration_ms)
            }
            Self::Diurnal {
                base_rps,
                hourly_multipliers,
                hour_duration_ms,
                ..
            } => {
                rate("baseRps", *base_rps)?;
                if hourly_multipliers.len() != 24 {
                    return Err(format!(
                        "diurnal workload needs 24 hourly multipliers, got {}",
                        hourly_multipliers.len()
                    ));
                }
                hourly_multipliers
                    .iter()
                    .try_for_each(|m| rate("hourly multiplier", *m))?;
                match hour_duration_ms {
                    Some(h) if !(h.is_finite() && *h > 0.0) => {
                        Err(format!("hourDurationMs must be positive, got {h}"))
                    }
                    _ => Ok(()),
                }
            }
            Self::Sawtooth {
                min_rps,
                max_rps,
                period_ms,
                ..
            } => {
                rate("minRps", *min_rps)?;
                rate("maxRps", *max_rps)?;
                if !(period_ms.is_finite() && *period_ms > 0.0) {
                    return Err(format!("periodMs must be positive, got {period_ms}"));
                }
                Ok(())
            }
            Self::Bursty {
                base_rps,
                burst_rps,
                burst_interval_distribution,
                ..
            } => {
                rate("baseRps", *base_rps)?;
                rate("burstRps", *burst_rps)?;
                burst_interval_distribution.validate()
            }
            Self::LongTail {
                request_size_distribution,
                base_rps,
            } => {
                rate("baseRps", *base_rps)?;
                request_size_distribution.validate()
            }
            Self::Replay { time_scale, .. } => {
                if time_scale.is_finite() && *time_scale > 0.0 {
                    Ok(())
                } else {
                    Err(format!("timeScale must be positive, got {time_scale}"))
                }
            }
            Self::Custom { schedule, .. } => {
                if schedule.is_empty() {
                    return Err("custom workload needs at least one schedule point".into());
                }
                schedule.iter().try_for_each(|p| rate("rps", p.rps))
            }
        }
    }
}

impl Default for WorkloadProfile {
    fn default() -> Self {
        Self::steady(100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_tags() {
        let json = r#"{"type":"steady-state","requestsPerSecond":50,"distribution":"constant"}"#;
        let profile: WorkloadProfile = serde_json::from_str(json).unwrap();
        assert_eq!(profile, WorkloadProfile::constant(50.0));

        let json = r#"{"type":"spike","baseRps":100,"spikeRps":1000,"spikeStartMs":5000,
                       "spikeDurationMs":60000,"rampUpMs":1000}"#;
        let profile: WorkloadProfile = serde_json::from_str(json).unwrap();
        assert_eq!(profile.kind(), "spike");
        assert!(profile.validate().is_ok());
    }

    #[test]
    fn test_diurnal_needs_24_multipliers() {
        let profile = WorkloadProfile::Diurnal {
            base_rps: 10.0,
            hourly_multipliers: vec![1.0; 23],
            timezone: "UTC".into(),
            hour_duration_ms: None,
        };
        assert!(profile.validate().is_err());
    }
}
