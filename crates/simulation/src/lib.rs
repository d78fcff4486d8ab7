//! Deterministic discrete-event simulation of distributed-system
//! architectures.
//!
//! This crate runs a declarative architecture (components, edges, patterns)
//! under a workload and a fault schedule, and reports what happened: every
//! event, request traces, metrics, invariant violations and a causal graph.
//! Given the same input and seed, it produces identical results every run,
//! down to the hash of the drained event trace.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                  SimulationRunner                       │
//! │                                                         │
//! │  ┌────────────────────────────────────────────────────┐ │
//! │  │     Event Queue (BTreeMap<EventKey, Event>)        │ │
//! │  │     Ordered by: time, priority, sequence           │ │
//! │  └────────────────────────┬───────────────────────────┘ │
//! │                           │                             │
//! │                           ▼                             │
//! │  ┌────────────────────────────────────────────────────┐ │
//! │  │  models: BTreeMap<ComponentId, Behavior>           │ │
//! │  │  engines: faults, propagation, failure modes,      │ │
//! │  │           autoscaling, scenario timeline           │ │
//! │  └────────────────────────┬───────────────────────────┘ │
//! │                           │                             │
//! │                           ▼                             │
//! │  ┌────────────────────────────────────────────────────┐ │
//! │  │  Actions / Followups → schedule new events         │ │
//! │  │  Observers: metrics, invariants, causal graph      │ │
//! │  └────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod antipattern;
mod autoscale;
mod breaker;
mod causal;
mod config;
pub mod distribution;
mod error;
mod event_queue;
pub mod expression;
mod failure_mode;
mod fault;
pub mod graph;
mod invariants;
mod metrics;
pub mod models;
mod network;
mod propagation;
mod rate_limiter;
pub mod rng;
mod runner;
pub mod scenario;
pub mod snapshot;
pub mod state;
pub mod sweep;
pub mod workload;

pub use breaker::{BreakerState, CircuitBreaker};
pub use config::SimulationConfig;
pub use error::{ConfigError, SchedulingError, SimulationError};
pub use event_queue::{EventKey, EventQueue, Followup};
pub use expression::{Predicate, PredicateContext, Predicates};
pub use graph::ArchitectureGraph;
pub use propagation::TIE_BREAK;
pub use rate_limiter::{KeyedRateLimiter, TokenBucket};
pub use rng::DeterministicRng;
pub use runner::{
    CancellationToken, SimulationInput, SimulationRunner, SimulationStats, FAULT_POLL_MS,
};
pub use scenario::{ScenarioPlan, ScenarioTimeline};
pub use snapshot::{Metric, MetricSource, StaticMetrics};
pub use sweep::{compare, run_all, seed_sweep, DesignComparison, RunSummary};
pub use workload::{Arrival, WorkloadGenerator};

/// Run `input` to completion.
pub fn simulate(
    input: SimulationInput,
) -> Result<archsim_core::SimulationOutput, SimulationError> {
    SimulationRunner::new(input)?.run()
}
