//! Core types for the archsim kernel.
//!
//! This crate provides the runtime vocabulary shared by the kernel, the
//! behavior models and consumers of a run:
//!
//! - [`Event`]: an immutable scheduled occurrence with a priority
//! - [`Action`]: what a behavior model asks the kernel to do
//! - [`Call`] / [`Request`]: in-flight request records and their traces
//! - [`SimulationOutput`]: everything a finished run reports
//!
//! # Design Philosophy
//!
//! Behavior models are pure with respect to the kernel: they receive a call
//! or timer plus a read-only view of the world and return [`Action`]s. The
//! kernel owns the event queue, edges, timeouts and retries, which keeps
//! every side effect in one place and every run replayable from its seed.

mod action;
mod event;
mod output;
mod request;

pub use action::Action;
pub use event::{
    CheckTarget, Event, EventKind, EventPayload, EventPriority, FaultPhase, ModelTimer, RuleKey,
};
pub use output::{
    AntiPattern, AntiPatternDetection, Availability, CausalEdge, CausalEdgeType, CausalGraph,
    CausalNode, CausalNodeType, CausalOrderCheck, ComponentSeries, ConservationCheck, Consistency,
    Durability, EdgeMetrics, ErrorMetrics, EventTraces, FindingSeverity, GlobalSeries, Heatmap,
    Heatmaps, InvariantViolation, LatencySummary, LittlesLawCheck, MetricsDefinition,
    MetricsOutput, Recovery, ReproducibilitySpec, RequestTraces, RunMetadata, RunStatus,
    Saturation, SimulationOutput, SloBreach, SloType, Throughput, TimeSeriesOutput,
    VerificationResults,
};
pub use request::{
    Call, CallOutcome, Operation, Request, RequestSpec, RequestStatus, RequestTrace, SpanStatus,
    TraceSpan,
};
