//! Input data model for the architecture simulator.
//!
//! This crate provides the types an authoring tool hands to the kernel:
//!
//! - **Primitives**: simulated time, content hashes, identifiers
//! - **Architecture**: components, edges, type-specific configs, global config
//! - **Behavior inputs**: distributions, failure modes, propagation rules
//! - **Run inputs**: workload profiles, fault injections, invariants, scenarios
//!
//! # Design Philosophy
//!
//! Everything here is plain data with `serde` derives and no simulation
//! logic. Maps are ordered so that the JSON encoding of an input (and
//! therefore its content hash) is stable across runs.

mod hash;
mod identifiers;
mod time;

mod architecture;
mod component_config;
mod distribution;
mod failure;
mod fault;
mod invariant;
mod scenario;
mod workload;

pub use hash::{Hash, HashStream, HexError};
pub use identifiers::{CallId, ComponentId, EdgeId, EventId, FaultId, InvariantId, RegionId, RequestId};
pub use time::{micros_to_millis, millis_to_micros, SimTime, MICROS_PER_MILLI};

pub use architecture::{
    ArchitecturalPattern, BackoffType, BandwidthSpec, BehaviorFamily, CircuitBreakerConfig,
    ComponentDefinition, ComponentType, ConnectionType, EdgeDefinition, EdgeRetryPolicy,
    ErrorInjectionHook, FailureAction, FaultInjectionHooks, GlobalConfig, GlobalRetryPolicy,
    HealthCheckConfig, HealthCheckProtocol, HorizontalScaling, LatencyInjectionHook, Lifecycle,
    NetworkPolicies, NetworkSpec, PatternApplication, Protocol, RegionDefinition, ResourceSpec,
    ScalingMetric, ScalingPolicy, ScalingTrigger, ScalingType, SecurityConfig, SimulationDefaults,
    SloConfig, SystemArchitecture, TimeoutDefaults,
};
pub use component_config::{
    ApiConfig, AuthMethod, AuthenticationSpec, BackpressurePolicy, BatchingSpec, CacheCapacity,
    CacheConfig, CacheEngine, CdnCaching, CdnConfig, ColdStartSpec, ComponentConfig,
    ConnectionPoolSpec, ConsumerGroup, DatabaseConfig, DatabaseEngine, DeadLetterSpec,
    DeliveryGuarantee, EndpointSpec, EvictionPolicy, FailoverSpec, GatewayConfig,
    GatewayRateLimit, GenericConfig, HitMissLatency, HttpMethod, LoadBalancerConfig,
    LoadBalancingAlgorithm, MessageOrdering, MicroserviceConfig, ProvisionedSpec, QueryLatency,
    QueueCapacity, QueueConfig, RateLimitSpec, ReplicationMode, ReplicationSpec,
    ServerlessConcurrency, ServerlessConfig, ServerlessRuntime, ShardingSpec, StickySession,
    StreamConfig, StreamRetention, StreamThroughput, TransformationSpec, VisibilitySpec,
};
pub use distribution::{DistributionConfig, Interpolation, MixtureComponent};
pub use failure::{
    FailureModeDefinition, FailurePropagation, FailureTrigger, PropagationCondition,
    PropagationEffect, PropagationRule, PropagationType, Severity,
};
pub use fault::{
    ComparisonOperator, FaultCondition, FaultDuration, FaultInjection, FaultScope, FaultSpec,
    FaultTiming,
};
pub use invariant::{InvariantCheck, InvariantType, SimulationInvariant, SloMetric, ViolationPolicy};
pub use scenario::{ComposedScenario, ScenarioStep};
pub use workload::{
    ArrivalDistribution, RampType, RatePoint, RecordedArrival, WorkloadProfile, HOUR_MS,
};
