//! Per-edge circuit breaker.

use archsim_types::{CircuitBreakerConfig, SimTime};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half-open",
        }
    }
}

/// A state change the kernel reports as an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Opened,
    HalfOpened,
    Closed,
}

/// Closed → open after `failureThreshold` consecutive failures; open
/// short-circuits for `recoveryWindowMs`; half-open admits
/// `halfOpenRequests` probes; a probe success closes, a probe failure reopens.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: SimTime,
    probes_admitted: u32,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: SimTime::ZERO,
            probes_admitted: 0,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == BreakerState::Open
    }

    /// Whether a call may pass at `now`.
    pub fn admit(&mut self, now: SimTime) -> (bool, Option<Transition>) {
        match self.state {
            BreakerState::Closed => (true, None),
            BreakerState::Open => {
                let reopen_at = self.opened_at.plus_millis(self.config.recovery_window_ms);
                if now >= reopen_at {
                    self.state = BreakerState::HalfOpen;
                    self.probes_admitted = 1;
                    (true, Some(Transition::HalfOpened))
                } else {
                    (false, None)
                }
            }
            BreakerState::HalfOpen => {
                if self.probes_admitted < self.config.half_open_requests.max(1) {
                    self.probes_admitted += 1;
                    (true, None)
                } else {
                    (false, None)
                }
            }
        }
    }

    /// Record the outcome of an admitted call.
    pub fn record(&mut self, success: bool, now: SimTime) -> Option<Transition> {
        match self.state {
            BreakerState::Closed => {
                if success {
                    self.consecutive_failures = 0;
                    None
                } else {
                    self.consecutive_failures += 1;
                    if self.consecutive_failures >= self.config.failure_threshold.max(1) {
                        self.trip(now);
                        Some(Transition::Opened)
                    } else {
                        None
                    }
                }
            }
            BreakerState::HalfOpen => {
                if success {
                    self.state = BreakerState::Closed;
                    self.consecutive_failures = 0;
                    self.probes_admitted = 0;
                    Some(Transition::Closed)
                } else {
                    self.trip(now);
                    Some(Transition::Opened)
                }
            }
            // Late outcomes of calls admitted before the trip.
            BreakerState::Open => None,
        }
    }

    /// Open regardless of the failure count. Returns whether the state changed.
    pub fn force_open(&mut self, now: SimTime) -> bool {
        let changed = self.state != BreakerState::Open;
        self.trip(now);
        changed
    }

    fn trip(&mut self, now: SimTime) {
        self.state = BreakerState::Open;
        self.opened_at = now;
        self.probes_admitted = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, window_ms: f64) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            enabled: true,
            failure_threshold: threshold,
            recovery_window_ms: window_ms,
            half_open_requests: 1,
        })
    }

    #[test]
    fn test_opens_after_threshold() {
        let mut cb = breaker(3, 1_000.0);
        let t = SimTime::from_millis(10);
        assert_eq!(cb.record(false, t), None);
        assert_eq!(cb.record(false, t), None);
        assert_eq!(cb.record(false, t), Some(Transition::Opened));
        assert_eq!(cb.admit(t), (false, None));
    }

    #[test]
    fn test_success_resets_consecutive_count() {
        let mut cb = breaker(2, 1_000.0);
        let t = SimTime::ZERO;
        cb.record(false, t);
        cb.record(true, t);
        assert_eq!(cb.record(false, t), None);
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn test_half_open_probe_closes_on_success() {
        let mut cb = breaker(1, 1_000.0);
        cb.record(false, SimTime::ZERO);
        assert_eq!(cb.admit(SimTime::from_millis(999)), (false, None));

        let later = SimTime::from_millis(1_000);
        assert_eq!(cb.admit(later), (true, Some(Transition::HalfOpened)));
        // Only one probe at a time.
        assert_eq!(cb.admit(later), (false, None));
        assert_eq!(cb.record(true, later), Some(Transition::Closed));
        assert_eq!(cb.admit(later), (true, None));
    }

    #[test]
    fn test_half_open_probe_failure_reopens() {
        let mut cb = breaker(1, 500.0);
        cb.record(false, SimTime::ZERO);
        let probe_at = SimTime::from_millis(600);
        cb.admit(probe_at);
        assert_eq!(cb.record(false, probe_at), Some(Transition::Opened));
        // Window restarts from the probe failure.
        assert_eq!(cb.admit(SimTime::from_millis(1_000)), (false, None));
        assert_eq!(
            cb.admit(SimTime::from_millis(1_100)),
            (true, Some(Transition::HalfOpened))
        );
    }
}
