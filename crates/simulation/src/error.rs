//! Kernel error types.
//!
//! Simulated failures (crashes, timeouts, partitions) are events and never
//! show up here. These errors mean the input is malformed or the kernel
//! itself misbehaved.

use archsim_core::EventKind;
use archsim_types::{ComponentId, ComponentType, EdgeId, FaultId, InvariantId, SimTime};
use thiserror::Error;

/// Malformed input, reported before any event is drained.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("duplicate component id {0}")]
    DuplicateComponent(ComponentId),

    #[error("duplicate edge id {0}")]
    DuplicateEdge(EdgeId),

    #[error("edge {edge} references unknown component {component}")]
    DanglingEdge { edge: EdgeId, component: ComponentId },

    #[error("{component} depends on unknown component {dependency}")]
    UnknownDependency {
        component: ComponentId,
        dependency: ComponentId,
    },

    #[error("{component} of type {component_type:?} cannot use a {config} configuration")]
    IncompatibleConfig {
        component: ComponentId,
        component_type: ComponentType,
        config: &'static str,
    },

    #[error("invalid distribution at {location}: {reason}")]
    InvalidDistribution { location: String, reason: String },

    #[error("invalid workload: {0}")]
    InvalidWorkload(String),

    #[error("fault {fault}: {reason}")]
    InvalidFault { fault: FaultId, reason: String },

    #[error("invariant {invariant}: {reason}")]
    InvalidInvariant {
        invariant: InvariantId,
        reason: String,
    },

    #[error("unknown metric '{0}'")]
    UnknownMetric(String),

    #[error("scenario {scenario}: {reason}")]
    InvalidScenario { scenario: String, reason: String },

    #[error("invalid simulation config: {0}")]
    InvalidConfig(String),

    #[error("failed to encode input: {0}")]
    Encoding(String),
}

/// The event queue was asked to violate time ordering.
///
/// Always a kernel or model bug; the run aborts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulingError {
    #[error("{kind} scheduled at {at} before current time {now}")]
    EventInPast {
        kind: EventKind,
        at: SimTime,
        now: SimTime,
    },

    #[error("clock cannot move backward from {now} to {to}")]
    ClockRegression { now: SimTime, to: SimTime },
}

/// Anything that stops a run from producing output.
#[derive(Debug, Error)]
pub enum SimulationError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Scheduling(#[from] SchedulingError),
}
