//! Lazy arrival generation for traffic profiles.
//!
//! The generator hands out one arrival at a time; the kernel schedules the
//! next arrival when the previous one is drained, so the event queue never
//! holds more than one pending arrival. Profile time is measured from the
//! moment the profile was installed, which lets a scenario swap profiles
//! mid-run.

use archsim_core::{Operation, RequestSpec};
use archsim_types::{
    ArrivalDistribution, ComponentId, Interpolation, RampType, RatePoint, SimTime,
    WorkloadProfile, HOUR_MS,
};
use std::collections::BTreeMap;

use crate::config::SimulationConfig;
use crate::distribution;
use crate::error::ConfigError;
use crate::rng::{DeterministicRng, RngCheckpoint};

/// Step used to skip over periods with a zero arrival rate.
const IDLE_PROBE_MS: f64 = 10.0;

const DEFAULT_REQUEST_BYTES: u64 = 1_024;

/// One generated request, not yet scheduled.
#[derive(Debug, Clone, PartialEq)]
pub struct Arrival {
    pub at: SimTime,
    pub entry: ComponentId,
    pub spec: RequestSpec,
}

#[derive(Debug, Clone, Copy)]
struct BurstWindow {
    start_ms: f64,
    end_ms: f64,
}

/// How generated requests pick keys, users and operations.
#[derive(Debug, Clone, PartialEq)]
struct RequestMix {
    read_ratio: f64,
    key_space: u64,
    key_skew: f64,
    user_space: u64,
}

#[derive(Debug, Clone)]
pub struct WorkloadGenerator {
    profile: WorkloadProfile,
    entries: Vec<ComponentId>,
    mix: RequestMix,
    rng: DeterministicRng,
    initial: RngCheckpoint,
    origin: SimTime,
    cursor: SimTime,
    next_entry: usize,
    replay: Vec<usize>,
    replay_index: usize,
    burst: Option<BurstWindow>,
}

impl WorkloadGenerator {
    pub fn new(
        profile: WorkloadProfile,
        entries: Vec<ComponentId>,
        config: &SimulationConfig,
        rng: DeterministicRng,
    ) -> Result<Self, ConfigError> {
        profile.validate().map_err(ConfigError::InvalidWorkload)?;
        if entries.is_empty() {
            return Err(ConfigError::InvalidWorkload(
                "architecture has no entry component to send traffic to".to_string(),
            ));
        }
        let initial = rng.checkpoint();
        let mut generator = Self {
            profile,
            entries,
            mix: RequestMix {
                read_ratio: config.read_ratio.clamp(0.0, 1.0),
                key_space: config.key_space.max(1),
                key_skew: config.key_skew,
                user_space: config.user_space.max(1),
            },
            rng,
            initial,
            origin: SimTime::ZERO,
            cursor: SimTime::ZERO,
            next_entry: 0,
            replay: Vec::new(),
            replay_index: 0,
            burst: None,
        };
        generator.reset_profile_state();
        Ok(generator)
    }

    pub fn profile(&self) -> &WorkloadProfile {
        &self.profile
    }

    /// Rewind to the state right after construction.
    pub fn restart(&mut self) {
        self.rng.restore(&self.initial);
        self.origin = SimTime::ZERO;
        self.cursor = SimTime::ZERO;
        self.next_entry = 0;
        self.reset_profile_state();
    }

    /// Replace the profile from `now` on.
    pub fn switch_to(&mut self, profile: WorkloadProfile, now: SimTime) -> Result<(), ConfigError> {
        profile.validate().map_err(ConfigError::InvalidWorkload)?;
        self.profile = profile;
        self.origin = now;
        self.cursor = now;
        self.reset_profile_state();
        Ok(())
    }

    fn reset_profile_state(&mut self) {
        self.replay_index = 0;
        self.replay.clear();
        self.burst = None;
        if let WorkloadProfile::Replay {
            recorded_events, ..
        } = &self.profile
        {
            let mut order: Vec<usize> = (0..recorded_events.len()).collect();
            // Stable: equal offsets keep recording order.
            order.sort_by(|a, b| {
                recorded_events[*a]
                    .offset_ms
                    .total_cmp(&recorded_events[*b].offset_ms)
            });
            self.replay = order;
        }
    }

    /// Next arrival strictly before `horizon`, or `None` when the profile
    /// has nothing more to send in time.
    pub fn next_arrival(&mut self, horizon: SimTime) -> Option<Arrival> {
        let at = match &self.profile {
            WorkloadProfile::Replay { .. } => self.next_replay_time()?,
            _ => self.next_rate_time(horizon)?,
        };
        if at >= horizon {
            return None;
        }
        self.cursor = at;
        let entry = self.entries[self.next_entry % self.entries.len()].clone();
        self.next_entry = self.next_entry.wrapping_add(1);
        let spec = self.request_spec();
        Some(Arrival { at, entry, spec })
    }

    fn next_replay_time(&mut self) -> Option<SimTime> {
        let WorkloadProfile::Replay {
            recorded_events,
            time_scale,
        } = &self.profile
        else {
            return None;
        };
        let index = *self.replay.get(self.replay_index)?;
        let offset = recorded_events[index].offset_ms.max(0.0) * time_scale;
        self.replay_index += 1;
        Some(self.origin.plus_millis(offset).max(self.cursor))
    }

    fn next_rate_time(&mut self, horizon: SimTime) -> Option<SimTime> {
        let constant = matches!(
            self.profile,
            WorkloadProfile::SteadyState {
                distribution: ArrivalDistribution::Constant,
                ..
            }
        );
        let mut t = self.cursor;
        loop {
            if t >= horizon {
                return None;
            }
            let rate = self.rate_at(t);
            if rate <= 0.0 || !rate.is_finite() {
                t = t.plus_millis(IDLE_PROBE_MS);
                continue;
            }
            let gap_ms = if constant {
                1_000.0 / rate
            } else {
                -(1.0 - self.rng.next()).ln() * 1_000.0 / rate
            };
            // Never schedule two arrivals on the same microsecond.
            let gap_us = archsim_types::millis_to_micros(gap_ms).max(1);
            return Some(t.plus_micros(gap_us));
        }
    }

    /// Arrival rate in requests per second at `at`.
    pub fn rate_at(&mut self, at: SimTime) -> f64 {
        let t = archsim_types::micros_to_millis(at.micros_since(self.origin));
        match &self.profile {
            WorkloadProfile::SteadyState {
                requests_per_second,
                ..
            } => *requests_per_second,
            WorkloadProfile::Spike {
                base_rps,
                spike_rps,
                spike_start_ms,
                spike_duration_ms,
                ramp_up_ms,
                ramp_down_ms,
            } => spike_rate(
                t,
                *base_rps,
                *spike_rps,
                *spike_start_ms,
                *spike_duration_ms,
                ramp_up_ms.unwrap_or(0.0),
                ramp_down_ms.unwrap_or(0.0),
            ),
            WorkloadProfile::Diurnal {
                base_rps,
                hourly_multipliers,
                hour_duration_ms,
                ..
            } => {
                let hour_ms = hour_duration_ms.unwrap_or(HOUR_MS);
                let hour = (t / hour_ms).floor() as usize % 24;
                base_rps * hourly_multipliers.get(hour).copied().unwrap_or(1.0)
            }
            WorkloadProfile::Sawtooth {
                min_rps,
                max_rps,
                period_ms,
                ramp_type,
            } => {
                let phase = (t % period_ms) / period_ms;
                let shape = match ramp_type {
                    RampType::Linear => phase,
                    RampType::Exponential => (3.0 * phase).exp_m1() / 3.0_f64.exp_m1(),
                };
                min_rps + (max_rps - min_rps) * shape
            }
            WorkloadProfile::Bursty {
                base_rps,
                burst_rps,
                burst_duration_ms,
                burst_interval_distribution,
            } => {
                let (base, burst, duration) = (*base_rps, *burst_rps, *burst_duration_ms);
                let interval = burst_interval_distribution.clone();
                let window = self.burst_window(t, duration, &interval);
                if t >= window.start_ms && t < window.end_ms {
                    burst
                } else {
                    base
                }
            }
            WorkloadProfile::LongTail { base_rps, .. } => *base_rps,
            WorkloadProfile::Replay { .. } => 0.0,
            WorkloadProfile::Custom {
                schedule,
                interpolation,
            } => custom_rate(schedule, *interpolation, t),
        }
    }

    /// The burst window covering or following `t`.
    fn burst_window(
        &mut self,
        t: f64,
        duration_ms: f64,
        interval: &archsim_types::DistributionConfig,
    ) -> BurstWindow {
        let mut window = match self.burst {
            Some(window) => window,
            None => {
                let start = distribution::sample(interval, &mut self.rng).max(0.0);
                BurstWindow {
                    start_ms: start,
                    end_ms: start + duration_ms.max(0.0),
                }
            }
        };
        while t >= window.end_ms {
            // Intervals are measured between burst starts, at least one burst long.
            let gap = distribution::sample(interval, &mut self.rng).max(duration_ms).max(IDLE_PROBE_MS);
            window.start_ms += gap;
            window.end_ms = window.start_ms + duration_ms.max(0.0);
        }
        self.burst = Some(window);
        window
    }

    fn request_spec(&mut self) -> RequestSpec {
        let op = if self.rng.chance(self.mix.read_ratio) {
            Operation::Read
        } else {
            Operation::Write
        };
        let key_index = if self.mix.key_skew > 0.0 {
            // Power-law popularity: low indexes are hot.
            let u = self.rng.next();
            ((self.mix.key_space as f64 * u.powf(1.0 + self.mix.key_skew)) as u64)
                .min(self.mix.key_space - 1)
        } else {
            self.rng.below(self.mix.key_space as usize) as u64
        };
        let user = self.rng.below(self.mix.user_space as usize);

        let mut spec = RequestSpec {
            op,
            key: format!("key-{key_index}"),
            user: format!("user-{user}"),
            size_bytes: DEFAULT_REQUEST_BYTES,
            request_type: None,
            metadata: BTreeMap::new(),
        };
        match &self.profile {
            WorkloadProfile::LongTail {
                request_size_distribution,
                ..
            } => {
                let size = distribution::sample(request_size_distribution, &mut self.rng);
                spec.size_bytes = size.max(1.0) as u64;
            }
            WorkloadProfile::Replay {
                recorded_events, ..
            } => {
                let played = self
                    .replay_index
                    .checked_sub(1)
                    .and_then(|i| self.replay.get(i))
                    .and_then(|i| recorded_events.get(*i));
                if let Some(record) = played {
                    spec.request_type = record.request_type.clone();
                    spec.metadata = record.metadata.clone();
                }
            }
            _ => {}
        }
        spec
    }
}

fn spike_rate(
    t: f64,
    base: f64,
    spike: f64,
    start: f64,
    duration: f64,
    ramp_up: f64,
    ramp_down: f64,
) -> f64 {
    let end = start + duration;
    if t < start {
        base
    } else if t < start + ramp_up {
        base + (spike - base) * (t - start) / ramp_up
    } else if t < end {
        spike
    } else if t < end + ramp_down {
        spike + (base - spike) * (t - end) / ramp_down
    } else {
        base
    }
}

fn custom_rate(schedule: &[RatePoint], interpolation: Interpolation, t: f64) -> f64 {
    let Some(first) = schedule.first() else {
        return 0.0;
    };
    if t < first.at_ms {
        return first.rps;
    }
    let after = schedule.iter().position(|p| p.at_ms > t);
    match after {
        None => schedule.last().map_or(0.0, |p| p.rps),
        Some(i) => {
            let prev = &schedule[i - 1];
            let next = &schedule[i];
            match interpolation {
                Interpolation::Step => prev.rps,
                Interpolation::Linear => {
                    let span = next.at_ms - prev.at_ms;
                    if span <= 0.0 {
                        next.rps
                    } else {
                        prev.rps + (next.rps - prev.rps) * (t - prev.at_ms) / span
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use archsim_types::{DistributionConfig, RecordedArrival};

    fn generator(profile: WorkloadProfile) -> WorkloadGenerator {
        WorkloadGenerator::new(
            profile,
            vec![ComponentId::new("a"), ComponentId::new("b")],
            &SimulationConfig::default(),
            DeterministicRng::from_seed_str("workload"),
        )
        .unwrap()
    }

    fn drain(generator: &mut WorkloadGenerator, horizon_ms: u64) -> Vec<Arrival> {
        let horizon = SimTime::from_millis(horizon_ms);
        std::iter::from_fn(|| generator.next_arrival(horizon)).collect()
    }

    #[test]
    fn test_constant_rate_is_evenly_spaced() {
        let mut generator = generator(WorkloadProfile::constant(100.0));
        let arrivals = drain(&mut generator, 1_000);
        assert_eq!(arrivals.len(), 99);
        assert_eq!(arrivals[0].at, SimTime::from_millis(10));
        assert_eq!(arrivals[1].at, SimTime::from_millis(20));
        assert_eq!(arrivals[0].entry, ComponentId::new("a"));
        assert_eq!(arrivals[1].entry, ComponentId::new("b"));
    }

    #[test]
    fn test_poisson_count_near_rate() {
        let mut generator = generator(WorkloadProfile::steady(200.0));
        let count = drain(&mut generator, 10_000).len();
        assert!((1_800..2_200).contains(&count), "got {count}");
    }

    #[test]
    fn test_restart_replays_identical_stream() {
        let mut generator = generator(WorkloadProfile::steady(50.0));
        let first = drain(&mut generator, 2_000);
        generator.restart();
        let second = drain(&mut generator, 2_000);
        assert_eq!(first, second);
    }

    #[test]
    fn test_spike_ramps() {
        let mut generator = generator(WorkloadProfile::Spike {
            base_rps: 10.0,
            spike_rps: 110.0,
            spike_start_ms: 1_000.0,
            spike_duration_ms: 1_000.0,
            ramp_up_ms: Some(100.0),
            ramp_down_ms: None,
        });
        assert_eq!(generator.rate_at(SimTime::from_millis(500)), 10.0);
        assert_eq!(generator.rate_at(SimTime::from_millis(1_050)), 60.0);
        assert_eq!(generator.rate_at(SimTime::from_millis(1_500)), 110.0);
        assert_eq!(generator.rate_at(SimTime::from_millis(2_000)), 10.0);
    }

    #[test]
    fn test_diurnal_uses_hour_multiplier() {
        let mut multipliers = vec![1.0; 24];
        multipliers[2] = 3.0;
        let mut generator = generator(WorkloadProfile::Diurnal {
            base_rps: 10.0,
            hourly_multipliers: multipliers,
            timezone: String::new(),
            hour_duration_ms: Some(1_000.0),
        });
        assert_eq!(generator.rate_at(SimTime::from_millis(2_500)), 30.0);
        assert_eq!(generator.rate_at(SimTime::from_millis(26_500)), 30.0);
    }

    #[test]
    fn test_custom_schedule_interpolates() {
        let schedule = vec![
            RatePoint { at_ms: 0.0, rps: 0.0 },
            RatePoint { at_ms: 1_000.0, rps: 100.0 },
        ];
        let mut linear = generator(WorkloadProfile::Custom {
            schedule: schedule.clone(),
            interpolation: Interpolation::Linear,
        });
        assert_eq!(linear.rate_at(SimTime::from_millis(250)), 25.0);
        let mut step = generator(WorkloadProfile::Custom {
            schedule,
            interpolation: Interpolation::Step,
        });
        assert_eq!(step.rate_at(SimTime::from_millis(250)), 0.0);
        assert_eq!(step.rate_at(SimTime::from_millis(5_000)), 100.0);
    }

    #[test]
    fn test_replay_scales_offsets_and_keeps_metadata() {
        let record = |offset_ms: f64, kind: &str| RecordedArrival {
            offset_ms,
            request_type: Some(kind.to_string()),
            metadata: BTreeMap::new(),
        };
        let mut generator = generator(WorkloadProfile::Replay {
            recorded_events: vec![record(200.0, "late"), record(100.0, "early")],
            time_scale: 2.0,
        });
        let arrivals = drain(&mut generator, 1_000);
        assert_eq!(arrivals.len(), 2);
        assert_eq!(arrivals[0].at, SimTime::from_millis(200));
        assert_eq!(arrivals[0].spec.request_type.as_deref(), Some("early"));
        assert_eq!(arrivals[1].at, SimTime::from_millis(400));
    }

    #[test]
    fn test_zero_rate_yields_nothing() {
        let mut generator = generator(WorkloadProfile::constant(0.0));
        assert!(drain(&mut generator, 1_000).is_empty());
    }

    #[test]
    fn test_switch_rebases_profile_time() {
        let mut generator = generator(WorkloadProfile::constant(10.0));
        generator
            .switch_to(WorkloadProfile::constant(1_000.0), SimTime::from_millis(500))
            .unwrap();
        let next = generator.next_arrival(SimTime::from_millis(1_000)).unwrap();
        assert_eq!(next.at, SimTime::from_millis(501));
    }

    #[test]
    fn test_bursty_alternates_rates() {
        let mut generator = generator(WorkloadProfile::Bursty {
            base_rps: 1.0,
            burst_rps: 100.0,
            burst_duration_ms: 100.0,
            burst_interval_distribution: DistributionConfig::constant(1_000.0),
        });
        assert_eq!(generator.rate_at(SimTime::from_millis(500)), 1.0);
        assert_eq!(generator.rate_at(SimTime::from_millis(1_050)), 100.0);
        assert_eq!(generator.rate_at(SimTime::from_millis(1_500)), 1.0);
        assert_eq!(generator.rate_at(SimTime::from_millis(2_050)), 100.0);
    }
}
