//! Test helpers for archsim - small reference architectures and faults.
//!
//! The fixtures are tiny: two or three components with
//! constant latencies, so tests can reason about exact timings and counts.
//!
//! # Example
//!
//! ```rust
//! use archsim_test_helpers::{fixtures, steady};
//!
//! let arch = fixtures::api_db();
//! assert_eq!(arch.components.len(), 2);
//! let workload = steady(100.0);
//! assert_eq!(workload.kind(), "steady-state");
//! ```

pub mod fixtures;

use std::collections::BTreeMap;

use archsim_types::{DistributionConfig, RecordedArrival, WorkloadProfile};

/// Constant latency of `ms` milliseconds.
pub fn fixed_ms(ms: f64) -> DistributionConfig {
    DistributionConfig::constant(ms)
}

/// Evenly spaced arrivals at `rps`, so request counts are predictable.
pub fn steady(rps: f64) -> WorkloadProfile {
    WorkloadProfile::constant(rps)
}

/// `count` requests that all arrive at time zero.
pub fn burst(count: usize) -> WorkloadProfile {
    WorkloadProfile::Replay {
        recorded_events: (0..count)
            .map(|_| RecordedArrival {
                offset_ms: 0.0,
                request_type: None,
                metadata: BTreeMap::new(),
            })
            .collect(),
        time_scale: 1.0,
    }
}
