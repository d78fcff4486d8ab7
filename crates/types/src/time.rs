//! Simulated logical time.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Microseconds per millisecond.
pub const MICROS_PER_MILLI: u64 = 1_000;

/// A point in simulated time, in microseconds since simulation start.
///
/// Integer microseconds avoid floating-point drift when millions of delays
/// are accumulated.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SimTime(pub u64);

impl SimTime {
    /// Simulation start.
    pub const ZERO: Self = SimTime(0);

    /// Latest representable time.
    pub const MAX: Self = SimTime(u64::MAX);

    /// Create from whole microseconds.
    pub const fn from_micros(micros: u64) -> Self {
        SimTime(micros)
    }

    /// Create from whole milliseconds.
    pub const fn from_millis(millis: u64) -> Self {
        SimTime(millis.saturating_mul(MICROS_PER_MILLI))
    }

    /// Create from fractional milliseconds, rounding to the nearest microsecond.
    pub fn from_millis_f64(millis: f64) -> Self {
        SimTime(millis_to_micros(millis))
    }

    /// Raw microseconds.
    pub const fn as_micros(self) -> u64 {
        self.0
    }

    /// Milliseconds as a float, for reporting.
    pub fn as_millis_f64(self) -> f64 {
        self.0 as f64 / MICROS_PER_MILLI as f64
    }

    /// Whole milliseconds, truncated.
    pub const fn as_millis(self) -> u64 {
        self.0 / MICROS_PER_MILLI
    }

    /// Add a delay in microseconds.
    pub const fn plus_micros(self, micros: u64) -> Self {
        SimTime(self.0.saturating_add(micros))
    }

    /// Add a delay in fractional milliseconds.
    pub fn plus_millis(self, millis: f64) -> Self {
        self.plus_micros(millis_to_micros(millis))
    }

    /// Microseconds elapsed since `earlier` (zero if `earlier` is later).
    pub const fn micros_since(self, earlier: SimTime) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl fmt::Display for SimTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}ms", self.as_millis_f64())
    }
}

/// Convert fractional milliseconds to whole microseconds.
///
/// Negative and NaN inputs map to zero; delays are never negative.
pub fn millis_to_micros(millis: f64) -> u64 {
    if millis.is_nan() || millis <= 0.0 {
        return 0;
    }
    let micros = (millis * MICROS_PER_MILLI as f64).round();
    if micros >= u64::MAX as f64 {
        u64::MAX
    } else {
        micros as u64
    }
}

/// Convert whole microseconds to fractional milliseconds.
pub fn micros_to_millis(micros: u64) -> f64 {
    micros as f64 / MICROS_PER_MILLI as f64
}
