//! Sampling of distribution descriptors.
//!
//! All draws come from a [`DeterministicRng`]. Parameters are validated when
//! the architecture is loaded, so sampling itself never fails; degenerate
//! values that slip through (e.g. a zero rate) produce 0.

use archsim_types::{DistributionConfig, Interpolation};
use std::f64::consts::TAU;

use crate::rng::DeterministicRng;

/// Draw one value from `dist`.
pub fn sample(dist: &DistributionConfig, rng: &mut DeterministicRng) -> f64 {
    match dist {
        DistributionConfig::Constant { value } => *value,

        DistributionConfig::Uniform { min, max } => min + (max - min) * rng.next(),

        DistributionConfig::Normal {
            mean,
            std_dev,
            min,
            max,
        } => clip(mean + std_dev * standard_normal(rng), *min, *max),

        DistributionConfig::LogNormal { mu, sigma } => (mu + sigma * standard_normal(rng)).exp(),

        DistributionConfig::Exponential { rate } => exponential(*rate, rng),

        DistributionConfig::Poisson { lambda } => poisson(*lambda, rng),

        DistributionConfig::Weibull { shape, scale } => {
            if *shape <= 0.0 {
                return 0.0;
            }
            scale * (-(1.0 - rng.next()).ln()).powf(1.0 / shape)
        }

        DistributionConfig::Gamma { shape, rate } => {
            if *rate <= 0.0 {
                return 0.0;
            }
            gamma(*shape, rng) / rate
        }

        DistributionConfig::Beta {
            alpha,
            beta,
            min,
            max,
        } => {
            let x = gamma(*alpha, rng);
            let y = gamma(*beta, rng);
            let value = if x + y > 0.0 { x / (x + y) } else { 0.5 };
            clip(value, *min, *max)
        }

        DistributionConfig::Pareto { shape, scale } => {
            if *shape <= 0.0 {
                return *scale;
            }
            scale / (1.0 - rng.next()).powf(1.0 / shape)
        }

        DistributionConfig::Empirical {
            samples,
            interpolation,
        } => empirical(samples, *interpolation, rng),

        DistributionConfig::Mixture { components } => {
            let total: f64 = components.iter().map(|c| c.weight.max(0.0)).sum();
            if components.is_empty() || total <= 0.0 {
                return 0.0;
            }
            let mut pick = rng.next() * total;
            for component in components {
                let weight = component.weight.max(0.0);
                if pick < weight {
                    return sample(&component.distribution, rng);
                }
                pick -= weight;
            }
            // Rounding left `pick` just above the last bucket.
            components
                .iter()
                .rev()
                .find(|c| c.weight > 0.0)
                .map_or(0.0, |c| sample(&c.distribution, rng))
        }
    }
}

fn clip(value: f64, min: Option<f64>, max: Option<f64>) -> f64 {
    let value = min.map_or(value, |lo| value.max(lo));
    max.map_or(value, |hi| value.min(hi))
}

/// Box-Muller transform.
fn standard_normal(rng: &mut DeterministicRng) -> f64 {
    let u1 = 1.0 - rng.next(); // (0, 1]
    let u2 = rng.next();
    (-2.0 * u1.ln()).sqrt() * (TAU * u2).cos()
}

fn exponential(rate: f64, rng: &mut DeterministicRng) -> f64 {
    if rate <= 0.0 {
        return 0.0;
    }
    -(1.0 - rng.next()).ln() / rate
}

fn poisson(lambda: f64, rng: &mut DeterministicRng) -> f64 {
    if lambda <= 0.0 {
        return 0.0;
    }
    if lambda < 30.0 {
        // Knuth
        let limit = (-lambda).exp();
        let mut k = 0u64;
        let mut p = 1.0;
        loop {
            p *= rng.next();
            if p <= limit {
                return k as f64;
            }
            k += 1;
        }
    }
    (lambda + lambda.sqrt() * standard_normal(rng)).round().max(0.0)
}

/// Marsaglia-Tsang, unit rate.
fn gamma(shape: f64, rng: &mut DeterministicRng) -> f64 {
    if shape <= 0.0 {
        return 0.0;
    }
    if shape < 1.0 {
        let boost = rng.next().powf(1.0 / shape);
        return gamma(shape + 1.0, rng) * boost;
    }
    let d = shape - 1.0 / 3.0;
    let c = 1.0 / (9.0 * d).sqrt();
    loop {
        let x = standard_normal(rng);
        let v = (1.0 + c * x).powi(3);
        if v <= 0.0 {
            continue;
        }
        let u = rng.next();
        if u < 1.0 - 0.0331 * x.powi(4) || u.ln() < 0.5 * x * x + d * (1.0 - v + v.ln()) {
            return d * v;
        }
    }
}

fn empirical(samples: &[f64], interpolation: Interpolation, rng: &mut DeterministicRng) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(f64::total_cmp);
    let u = rng.next();
    match interpolation {
        Interpolation::Step => {
            let index = ((u * sorted.len() as f64) as usize).min(sorted.len() - 1);
            sorted[index]
        }
        Interpolation::Linear => {
            if sorted.len() == 1 {
                return sorted[0];
            }
            let position = u * (sorted.len() - 1) as f64;
            let lower = position.floor() as usize;
            let upper = (lower + 1).min(sorted.len() - 1);
            let fraction = position - lower as f64;
            sorted[lower] + (sorted[upper] - sorted[lower]) * fraction
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use archsim_types::MixtureComponent;

    fn mean_of(dist: &DistributionConfig, n: usize) -> f64 {
        let mut rng = DeterministicRng::from_seed_str("distribution-tests");
        (0..n).map(|_| sample(dist, &mut rng)).sum::<f64>() / n as f64
    }

    #[test]
    fn test_constant_and_uniform_bounds() {
        let mut rng = DeterministicRng::from_seed_str("bounds");
        assert_eq!(sample(&DistributionConfig::constant(4.5), &mut rng), 4.5);
        for _ in 0..1_000 {
            let x = sample(&DistributionConfig::uniform(2.0, 3.0), &mut rng);
            assert!((2.0..3.0).contains(&x));
        }
    }

    #[test]
    fn test_normal_clip() {
        let dist = DistributionConfig::Normal {
            mean: 0.0,
            std_dev: 10.0,
            min: Some(-1.0),
            max: Some(1.0),
        };
        let mut rng = DeterministicRng::from_seed_str("clip");
        for _ in 0..1_000 {
            let x = sample(&dist, &mut rng);
            assert!((-1.0..=1.0).contains(&x));
        }
    }

    #[test]
    fn test_sample_means_are_plausible() {
        let exp = mean_of(&DistributionConfig::exponential_mean(20.0), 20_000);
        assert!((exp - 20.0).abs() < 1.0, "exponential mean {exp}");

        let gamma = mean_of(&DistributionConfig::Gamma { shape: 2.0, rate: 0.5 }, 20_000);
        assert!((gamma - 4.0).abs() < 0.2, "gamma mean {gamma}");

        let poisson = mean_of(&DistributionConfig::Poisson { lambda: 4.0 }, 20_000);
        assert!((poisson - 4.0).abs() < 0.15, "poisson mean {poisson}");

        let normal = mean_of(&DistributionConfig::normal(50.0, 5.0), 20_000);
        assert!((normal - 50.0).abs() < 0.3, "normal mean {normal}");
    }

    #[test]
    fn test_pareto_never_below_scale() {
        let dist = DistributionConfig::Pareto { shape: 1.5, scale: 10.0 };
        let mut rng = DeterministicRng::from_seed_str("pareto");
        for _ in 0..1_000 {
            assert!(sample(&dist, &mut rng) >= 10.0);
        }
    }

    #[test]
    fn test_empirical_step_returns_samples() {
        let dist = DistributionConfig::Empirical {
            samples: vec![30.0, 10.0, 20.0],
            interpolation: Interpolation::Step,
        };
        let mut rng = DeterministicRng::from_seed_str("empirical");
        for _ in 0..200 {
            let x = sample(&dist, &mut rng);
            assert!([10.0, 20.0, 30.0].contains(&x));
        }
    }

    #[test]
    fn test_empirical_linear_stays_in_range() {
        let dist = DistributionConfig::Empirical {
            samples: vec![1.0, 5.0],
            interpolation: Interpolation::Linear,
        };
        let mut rng = DeterministicRng::from_seed_str("linear");
        for _ in 0..200 {
            let x = sample(&dist, &mut rng);
            assert!((1.0..=5.0).contains(&x));
        }
    }

    #[test]
    fn test_mixture_respects_zero_weight() {
        let dist = DistributionConfig::Mixture {
            components: vec![
                MixtureComponent {
                    weight: 0.0,
                    distribution: DistributionConfig::constant(1_000.0),
                },
                MixtureComponent {
                    weight: 2.0,
                    distribution: DistributionConfig::constant(1.0),
                },
            ],
        };
        let mut rng = DeterministicRng::from_seed_str("mixture");
        for _ in 0..200 {
            assert_eq!(sample(&dist, &mut rng), 1.0);
        }
    }
}
