//! Fixture builders for architectures, faults and invariants.
//!
//! Component ids are short and fixed (`api`, `db`, `cache`, ...) so tests
//! can refer to them by name.

use archsim_types::{
    CacheConfig, ComponentConfig, ComponentDefinition, ComponentType, DatabaseConfig,
    EdgeDefinition, FailureModeDefinition, FailurePropagation, FailureTrigger, FaultInjection,
    FaultSpec, GatewayConfig, GatewayRateLimit, InvariantCheck, InvariantType, MicroserviceConfig,
    PropagationRule, PropagationType, QueryLatency, QueueCapacity, QueueConfig, Severity,
    SimulationInvariant, SloMetric, SystemArchitecture, ViolationPolicy,
};

use crate::fixed_ms;

/// A stateless service that spends `ms` on every request.
pub fn service(id: &str, ms: f64) -> ComponentDefinition {
    ComponentDefinition::new(id, ComponentType::Microservice).with_config(
        ComponentConfig::Microservice(MicroserviceConfig {
            stateful: false,
            processing_latency: fixed_ms(ms),
        }),
    )
}

/// A relational database answering reads in `read_ms` and writes in twice that.
pub fn database(id: &str, read_ms: f64) -> ComponentDefinition {
    ComponentDefinition::new(id, ComponentType::RelationalDb).with_config(
        ComponentConfig::Database(DatabaseConfig {
            query_latency: QueryLatency {
                read: fixed_ms(read_ms),
                write: fixed_ms(read_ms * 2.0),
                indexed_read: None,
            },
            ..DatabaseConfig::default()
        }),
    )
}

/// `api -> db` over a 1 ms edge.
pub fn api_db() -> SystemArchitecture {
    api_db_with(|edge| edge)
}

/// `api -> db`, with the edge shaped by `shape` (breaker, retries, ...).
pub fn api_db_with(shape: impl FnOnce(EdgeDefinition) -> EdgeDefinition) -> SystemArchitecture {
    SystemArchitecture::new("api-db")
        .with_component(service("api", 5.0))
        .with_component(database("db", 5.0))
        .with_edge(shape(
            EdgeDefinition::new("api-db", "api", "db").with_latency(fixed_ms(1.0)),
        ))
}

/// A single queue named `orders` holding at most `capacity` messages, with no
/// consumers draining it.
pub fn bounded_queue(capacity: u64) -> SystemArchitecture {
    let config = QueueConfig {
        capacity: QueueCapacity {
            max_messages: capacity,
            max_message_size: 0,
        },
        consumers: 0,
        ..QueueConfig::default()
    };
    SystemArchitecture::new("bounded-queue").with_component(
        ComponentDefinition::new("orders", ComponentType::Queue)
            .with_config(ComponentConfig::Queue(config)),
    )
}

/// A lone gateway admitting `rps` requests per second with a bucket of `burst`.
pub fn rate_limited_gateway(rps: f64, burst: f64) -> SystemArchitecture {
    let config = GatewayConfig {
        rate_limit: GatewayRateLimit {
            requests_per_second: rps,
            burst_size: burst,
            per_user: false,
        },
        ..GatewayConfig::default()
    };
    SystemArchitecture::new("gateway").with_component(
        ComponentDefinition::new("gateway", ComponentType::ApiGateway)
            .with_config(ComponentConfig::Gateway(config)),
    )
}

/// `cache -> db` where the cache tracks real entries that never expire and
/// the origin is slow (50 ms), so concurrent misses overlap.
pub fn cache_aside(coalesce_misses: bool) -> SystemArchitecture {
    let config = CacheConfig {
        default_ttl_ms: 0.0,
        track_entries: true,
        coalesce_misses,
        ..CacheConfig::default()
    };
    SystemArchitecture::new("cache-aside")
        .with_component(
            ComponentDefinition::new("cache", ComponentType::Cache)
                .with_config(ComponentConfig::Cache(config))
                .with_dependencies(["db"]),
        )
        .with_component(database("db", 50.0))
}

/// `web -> api -> db` where `api` carries one failure mode with `rules`.
///
/// The mode's own trigger never fires within a test run; only its
/// propagation rules matter.
pub fn cascade(rules: Vec<PropagationRule>) -> SystemArchitecture {
    let mode = FailureModeDefinition::new(
        "db-outage",
        FailureTrigger::LatencySpike {
            threshold_ms: 1.0e9,
        },
        Severity::Medium,
    )
    .with_propagation(FailurePropagation {
        propagation_type: PropagationType::CascadingTimeout,
        rules,
    });
    SystemArchitecture::new("cascade")
        .with_component(service("web", 1.0).with_dependencies(["api"]))
        .with_component(
            service("api", 2.0)
                .with_dependencies(["db"])
                .with_failure_mode(mode),
        )
        .with_component(database("db", 5.0))
}

/// Crash every replica of `component` for `duration_ms`.
pub fn crash(component: &str, at_ms: f64, duration_ms: f64) -> FaultInjection {
    FaultInjection::on_component(
        format!("crash-{component}"),
        component,
        FaultSpec::ProcessCrash,
        at_ms,
        duration_ms,
    )
}

/// Fail `rate` of the calls reaching `component` with `injected-error`.
pub fn errors(component: &str, rate: f64, at_ms: f64, duration_ms: f64) -> FaultInjection {
    FaultInjection::on_component(
        format!("errors-{component}"),
        component,
        FaultSpec::Error {
            error_rate: rate,
            error_code: "injected-error".to_string(),
        },
        at_ms,
        duration_ms,
    )
}

/// Add `added_ms` of latency to every call reaching `component`.
pub fn slow(component: &str, added_ms: f64, at_ms: f64, duration_ms: f64) -> FaultInjection {
    FaultInjection::on_component(
        format!("slow-{component}"),
        component,
        FaultSpec::Latency {
            added_ms: fixed_ms(added_ms),
        },
        at_ms,
        duration_ms,
    )
}

/// System-wide error-rate SLO checked every `window_ms`.
pub fn error_rate_slo(threshold: f64, window_ms: f64, policy: ViolationPolicy) -> SimulationInvariant {
    SimulationInvariant::new(
        "error-rate-slo",
        InvariantType::Slo,
        InvariantCheck::Slo {
            metric: SloMetric::ErrorRate,
            threshold,
            window_ms,
        },
        policy,
    )
}
