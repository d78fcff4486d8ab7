//! Tagged probability distribution descriptors.
//!
//! These are pure descriptions; sampling lives in the simulation kernel so
//! that every draw routes through a deterministic random source.

use serde::{Deserialize, Serialize};

/// A probability distribution family with its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum DistributionConfig {
    /// Always the same value.
    Constant { value: f64 },
    /// Uniform on `[min, max)`.
    Uniform { min: f64, max: f64 },
    /// Gaussian, optionally clipped to `[min, max]`.
    Normal {
        mean: f64,
        std_dev: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<f64>,
    },
    /// `exp(N(mu, sigma))`.
    LogNormal { mu: f64, sigma: f64 },
    /// Exponential with the given rate (mean `1 / rate`).
    Exponential { rate: f64 },
    /// Poisson counts with mean `lambda`.
    Poisson { lambda: f64 },
    /// Weibull with shape `k` and scale `lambda`.
    Weibull { shape: f64, scale: f64 },
    /// Gamma with shape and rate (mean `shape / rate`).
    Gamma { shape: f64, rate: f64 },
    /// Beta on `[0, 1]`, optionally clipped to `[min, max]`.
    Beta {
        alpha: f64,
        beta: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<f64>,
    },
    /// Pareto type I with shape `alpha` and scale `x_m`.
    Pareto { shape: f64, scale: f64 },
    /// Resampling of observed values.
    Empirical {
        samples: Vec<f64>,
        interpolation: Interpolation,
    },
    /// Weighted mixture of sub-distributions.
    Mixture { components: Vec<MixtureComponent> },
}

/// How to map a uniform draw onto sorted empirical samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Interpolation {
    /// Linear interpolation between adjacent samples.
    #[default]
    Linear,
    /// Pick the sample at the floor index.
    Step,
}

/// One weighted branch of a mixture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MixtureComponent {
    pub weight: f64,
    pub distribution: DistributionConfig,
}

impl DistributionConfig {
    /// A distribution that always yields `value`.
    pub fn constant(value: f64) -> Self {
        Self::Constant { value }
    }

    /// Uniform on `[min, max)`.
    pub fn uniform(min: f64, max: f64) -> Self {
        Self::Uniform { min, max }
    }

    /// Exponential with the given mean.
    pub fn exponential_mean(mean: f64) -> Self {
        Self::Exponential { rate: 1.0 / mean }
    }

    /// Unclipped normal.
    pub fn normal(mean: f64, std_dev: f64) -> Self {
        Self::Normal {
            mean,
            std_dev,
            min: None,
            max: None,
        }
    }

    /// Short tag name, used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Constant { .. } => "constant",
            Self::Uniform { .. } => "uniform",
            Self::Normal { .. } => "normal",
            Self::LogNormal { .. } => "log-normal",
            Self::Exponential { .. } => "exponential",
            Self::Poisson { .. } => "poisson",
            Self::Weibull { .. } => "weibull",
            Self::Gamma { .. } => "gamma",
            Self::Beta { .. } => "beta",
            Self::Pareto { .. } => "pareto",
            Self::Empirical { .. } => "empirical",
            Self::Mixture { .. } => "mixture",
        }
    }

    /// Check that the parameters describe a samplable distribution.
    pub fn validate(&self) -> Result<(), String> {
        fn finite(name: &str, v: f64) -> Result<(), String> {
            if v.is_finite() {
                Ok(())
            } else {
                Err(format!("{name} must be finite, got {v}"))
            }
        }
        fn positive(name: &str, v: f64) -> Result<(), String> {
            if v.is_finite() && v > 0.0 {
                Ok(())
            } else {
                Err(format!("{name} must be positive, got {v}"))
            }
        }
        fn bounds(min: Option<f64>, max: Option<f64>) -> Result<(), String> {
            if let (Some(lo), Some(hi)) = (min, max) {
                if lo > hi {
                    return Err(format!("min ({lo}) must not exceed max ({hi})"));
                }
            }
            Ok(())
        }

        match self {
            Self::Constant { value } => finite("value", *value),
            Self::Uniform { min, max } => {
                finite("min", *min)?;
                finite("max", *max)?;
                bounds(Some(*min), Some(*max))
            }
            Self::Normal {
                mean,
                std_dev,
                min,
                max,
            } => {
                finite("mean", *mean)?;
                if !(std_dev.is_finite() && *std_dev >= 0.0) {
                    return Err(format!("stdDev must be non-negative, got {std_dev}"));
                }
                bounds(*min, *max)
            }
            Self::LogNormal { mu, sigma } => {
                finite("mu", *mu)?;
                if !(sigma.is_finite() && *sigma >= 0.0) {
                    return Err(format!("sigma must be non-negative, got {sigma}"));
                }
                Ok(())
            }
            Self::Exponential { rate } => positive("rate", *rate),
            Self::Poisson { lambda } => positive("lambda", *lambda),
            Self::Weibull { shape, scale } | Self::Pareto { shape, scale } => {
                positive("shape", *shape)?;
                positive("scale", *scale)
            }
            Self::Gamma { shape, rate } => {
                positive("shape", *shape)?;
                positive("rate", *rate)
            }
            Self::Beta {
                alpha,
                beta,
                min,
                max,
            } => {
                positive("alpha", *alpha)?;
                positive("beta", *beta)?;
                bounds(*min, *max)
            }
            Self::Empirical { samples, .. } => {
                if samples.is_empty() {
                    return Err("empirical distribution needs at least one sample".into());
                }
                samples.iter().try_for_each(|s| finite("sample", *s))
            }
            Self::Mixture { components } => {
                if components.is_empty() {
                    return Err("mixture needs at least one component".into());
                }
                let mut total = 0.0;
                for component in components {
                    if !(component.weight.is_finite() && component.weight >= 0.0) {
                        return Err(format!(
                            "mixture weight must be non-negative, got {}",
                            component.weight
                        ));
                    }
                    total += component.weight;
                    component.distribution.validate()?;
                }
                if total <= 0.0 {
                    return Err("mixture weights must not all be zero".into());
                }
                Ok(())
            }
        }
    }

    /// Analytic mean where one exists; used by static analysis only.
    pub fn approximate_mean(&self) -> Option<f64> {
        match self {
            Self::Constant { value } => Some(*value),
            Self::Uniform { min, max } => Some((min + max) / 2.0),
            Self::Normal { mean, .. } => Some(*mean),
            Self::LogNormal { mu, sigma } => Some((mu + sigma * sigma / 2.0).exp()),
            Self::Exponential { rate } => Some(1.0 / rate),
            Self::Poisson { lambda } => Some(*lambda),
            Self::Gamma { shape, rate } => Some(shape / rate),
            Self::Beta { alpha, beta, .. } => Some(alpha / (alpha + beta)),
            Self::Pareto { shape, scale } if *shape > 1.0 => Some(shape * scale / (shape - 1.0)),
            Self::Empirical { samples, .. } if !samples.is_empty() => {
                Some(samples.iter().sum::<f64>() / samples.len() as f64)
            }
            Self::Mixture { components } => {
                let total: f64 = components.iter().map(|c| c.weight).sum();
                if total <= 0.0 {
                    return None;
                }
                components.iter().try_fold(0.0, |acc, c| {
                    c.distribution
                        .approximate_mean()
                        .map(|m| acc + m * c.weight / total)
                })
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_tagged_forms() {
        let normal: DistributionConfig =
            serde_json::from_str(r#"{"type":"normal","mean":10,"stdDev":2,"min":0}"#).unwrap();
        assert_eq!(
            normal,
            DistributionConfig::Normal {
                mean: 10.0,
                std_dev: 2.0,
                min: Some(0.0),
                max: None
            }
        );

        let lognormal: DistributionConfig =
            serde_json::from_str(r#"{"type":"log-normal","mu":-0.5,"sigma":0.3}"#).unwrap();
        assert_eq!(lognormal.kind(), "log-normal");
    }

    #[test]
    fn test_validate_rejects_bad_parameters() {
        assert!(DistributionConfig::Exponential { rate: 0.0 }.validate().is_err());
        assert!(DistributionConfig::uniform(5.0, 1.0).validate().is_err());
        assert!(DistributionConfig::Empirical {
            samples: vec![],
            interpolation: Interpolation::Step
        }
        .validate()
        .is_err());
        assert!(DistributionConfig::Mixture {
            components: vec![MixtureComponent {
                weight: 0.0,
                distribution: DistributionConfig::constant(1.0)
            }]
        }
        .validate()
        .is_err());
        assert!(DistributionConfig::normal(1.0, 0.5).validate().is_ok());
    }

    #[test]
    fn test_mixture_mean_normalizes_weights() {
        let mixture = DistributionConfig::Mixture {
            components: vec![
                MixtureComponent {
                    weight: 3.0,
                    distribution: DistributionConfig::constant(10.0),
                },
                MixtureComponent {
                    weight: 1.0,
                    distribution: DistributionConfig::constant(30.0),
                },
            ],
        };
        assert_eq!(mixture.approximate_mean(), Some(15.0));
    }
}
