//! Architecture graph definition: components, edges, and global settings.

use crate::component_config::ComponentConfig;
use crate::distribution::DistributionConfig;
use crate::failure::FailureModeDefinition;
use crate::fault::ComparisonOperator;
use crate::identifiers::{ComponentId, EdgeId, RegionId};
use crate::invariant::SimulationInvariant;
use crate::workload::WorkloadProfile;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ═══════════════════════════════════════════════════════════════════════════
// Component taxonomy
// ═══════════════════════════════════════════════════════════════════════════

/// Every component type the simulator understands.
///
/// The type tag selects a [`BehaviorFamily`]; many tags share a family and
/// differ only in how they are labelled and analysed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ComponentType {
    // Compute
    Api,
    Microservice,
    Sidecar,
    BatchWorker,
    ServerlessFunction,
    BackgroundWorker,
    Container,
    Vm,
    EdgeWorker,
    GpuNode,

    // Network & edge
    LoadBalancerL4,
    LoadBalancerL7,
    GlobalTrafficManager,
    NatGateway,
    TransitGateway,
    VpnGateway,
    Cdn,
    ApiGateway,
    ServiceMeshControl,
    ServiceMeshData,
    ReverseProxy,
    HighPerfNic,

    // Storage & data
    RelationalDb,
    NosqlDocument,
    NosqlKeyvalue,
    NosqlWideColumn,
    ObjectStorage,
    BlockStorage,
    DistributedFs,
    Cache,
    SearchIndex,
    TimeseriesDb,
    ColumnarOlap,
    GraphDb,
    DataWarehouse,
    ArchiveStorage,
    SchemaRegistry,
    CdcService,
    BackupService,
    Kms,

    // Messaging & streaming
    Queue,
    Pubsub,
    Stream,
    EventBus,
    EventStore,
    MessageBroker,
    TaskQueue,

    // Orchestration & control plane
    K8sControlPlane,
    K8sNodePool,
    ContainerRegistry,
    ServiceRegistry,
    ConfigStore,
    SecretsManager,
    ClusterAutoscaler,
    Scheduler,
    CicdRunner,
    IacEngine,
    ContainerRuntime,

    // Security & identity
    Iam,
    Waf,
    Firewall,
    Bastion,
    CertificateAuthority,
    SecretsRotation,
    Dlp,
    IdentityProvider,
    Siem,
    TokenManager,

    // Observability
    Logging,
    Tracing,
    MetricsStore,
    Alerting,
    Dashboard,
    Rum,
    SyntheticMonitor,
    HealthChecker,
    Profiler,

    // DevOps & delivery
    ArtifactRepo,
    BuildSystem,
    FeatureFlags,
    DeploymentController,
    ChaosFramework,
    PolicyEngine,
    PipelineSecrets,

    // Data infrastructure
    EtlPipeline,
    StreamingAnalytics,
    FeatureStore,
    ModelServing,
    MlTraining,

    // Real-time & media
    WebsocketGateway,
    PushNotification,
    Transcoder,
    SignalingServer,
    Sfu,
    Mcu,
    TurnServer,
    WebrtcMesh,

    // External & integration
    WebhookGateway,
    SaasAdapter,
    PaymentGateway,
    ExternalAuth,

    // DNS & certificates
    DnsAuthoritative,
    DnsInternal,
    CertDistributor,
    AcmeServer,

    // Consensus & coordination
    Etcd,
    ConsulKv,
    LeaderElection,
    DistributedLock,
    Zookeeper,

    // Auxiliary
    MeshTelemetry,
    RateLimiter,
    CircuitBreaker,
    Bulkhead,
    IdempotencyManager,
    RequestTracker,
    BackpressureController,
    TokenBucket,

    // Traffic source and opaque externals
    UserSource,
    ExternalDependency,
}

/// Behavior model family a component is simulated with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BehaviorFamily {
    /// Traffic origin; never receives calls.
    Source,
    /// Stateless request/response processing.
    Compute,
    /// Buffered asynchronous delivery (queues and streams).
    Queue,
    /// Hit/miss caching in front of an origin.
    Cache,
    /// Target selection over downstream components.
    LoadBalancer,
    /// Read/write storage with replication and failover.
    Database,
    /// Rate limiting and authentication at the edge.
    Gateway,
}

impl ComponentType {
    /// The behavior family this type tag maps to when the configuration
    /// does not pin one.
    pub fn family(self) -> BehaviorFamily {
        use ComponentType::*;
        match self {
            UserSource => BehaviorFamily::Source,

            LoadBalancerL4 | LoadBalancerL7 | GlobalTrafficManager | ReverseProxy => {
                BehaviorFamily::LoadBalancer
            }

            ApiGateway | WebsocketGateway | WebhookGateway | RateLimiter | TokenBucket => {
                BehaviorFamily::Gateway
            }

            Cache | Cdn => BehaviorFamily::Cache,

            RelationalDb | NosqlDocument | NosqlKeyvalue | NosqlWideColumn | ObjectStorage
            | BlockStorage | DistributedFs | SearchIndex | TimeseriesDb | ColumnarOlap
            | GraphDb | DataWarehouse | ArchiveStorage | Etcd | ConsulKv | Zookeeper => {
                BehaviorFamily::Database
            }

            Queue | Pubsub | Stream | EventBus | EventStore | MessageBroker | TaskQueue => {
                BehaviorFamily::Queue
            }

            _ => BehaviorFamily::Compute,
        }
    }

    /// Whether this is a storage type (used by anti-pattern analysis).
    pub fn is_storage(self) -> bool {
        self.family() == BehaviorFamily::Database
    }

    /// Whether this is a messaging type.
    pub fn is_messaging(self) -> bool {
        self.family() == BehaviorFamily::Queue
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Component definition
// ═══════════════════════════════════════════════════════════════════════════

/// A node in the architecture graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentDefinition {
    pub id: ComponentId,
    #[serde(rename = "type")]
    pub component_type: ComponentType,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub region: RegionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,
    #[serde(default)]
    pub config: ComponentConfig,
    #[serde(default)]
    pub resources: ResourceSpec,
    #[serde(default)]
    pub lifecycle: Lifecycle,
    /// Direct dependencies (outgoing calls), in call order.
    #[serde(default)]
    pub dependencies: Vec<ComponentId>,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    #[serde(default)]
    pub slo: SloConfig,
    #[serde(default)]
    pub fault_injection: FaultInjectionHooks,
    #[serde(default)]
    pub scaling: ScalingPolicy,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub failure_modes: Vec<FailureModeDefinition>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl ComponentDefinition {
    /// A component with default settings for everything but id and type.
    pub fn new(id: impl Into<ComponentId>, component_type: ComponentType) -> Self {
        let id = id.into();
        Self {
            name: id.as_str().to_string(),
            id,
            component_type,
            region: RegionId::default(),
            zone: None,
            config: ComponentConfig::default(),
            resources: ResourceSpec::default(),
            lifecycle: Lifecycle::default(),
            dependencies: Vec::new(),
            health_check: HealthCheckConfig::default(),
            slo: SloConfig::default(),
            fault_injection: FaultInjectionHooks::default(),
            scaling: ScalingPolicy::default(),
            security: SecurityConfig::default(),
            failure_modes: Vec::new(),
            tags: Vec::new(),
            annotations: BTreeMap::new(),
        }
    }

    pub fn with_config(mut self, config: ComponentConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_dependencies<I, T>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<ComponentId>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_region(mut self, region: impl Into<RegionId>) -> Self {
        self.region = region.into();
        self
    }

    pub fn with_slo(mut self, slo: SloConfig) -> Self {
        self.slo = slo;
        self
    }

    pub fn with_scaling(mut self, scaling: ScalingPolicy) -> Self {
        self.scaling = scaling;
        self
    }

    pub fn with_resources(mut self, resources: ResourceSpec) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_failure_mode(mut self, mode: FailureModeDefinition) -> Self {
        self.failure_modes.push(mode);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    /// The family this component is simulated as.
    ///
    /// A type-specific configuration wins over the type tag.
    pub fn family(&self) -> BehaviorFamily {
        self.config
            .family()
            .unwrap_or_else(|| self.component_type.family())
    }

    /// Replica count at simulation start.
    pub fn initial_replicas(&self) -> u32 {
        self.scaling.initial_replicas().max(self.resources.replicas).max(1)
    }
}

/// Resource limits of a single replica.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceSpec {
    /// CPU request, e.g. `"500m"` or `"2"`.
    pub cpu: String,
    /// Memory request, e.g. `"1024Mi"`.
    pub memory: String,
    /// Concurrent requests one replica can process.
    pub concurrency: u32,
    /// Requests allowed to wait for a slot per replica; `None` is unbounded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_queue: Option<u32>,
    /// Static replica count for components without horizontal scaling.
    pub replicas: u32,
}

impl Default for ResourceSpec {
    fn default() -> Self {
        Self {
            cpu: "1".to_string(),
            memory: "1024Mi".to_string(),
            concurrency: 64,
            max_queue: None,
            replicas: 1,
        }
    }
}

/// When the component is online, relative to simulation start.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Lifecycle {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_time: Option<f64>,
    pub deploy_version: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HealthCheckProtocol {
    #[default]
    Http,
    Tcp,
    Grpc,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureAction {
    #[default]
    RemoveFromLb,
    Restart,
    AlertOnly,
}

/// Health-check policy, used by load balancers and failure-mode checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HealthCheckConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    pub protocol: HealthCheckProtocol,
    pub interval_ms: f64,
    pub timeout_ms: f64,
    pub healthy_threshold: u32,
    pub unhealthy_threshold: u32,
    pub failure_action: FailureAction,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            protocol: HealthCheckProtocol::Http,
            interval_ms: 1_000.0,
            timeout_ms: 500.0,
            healthy_threshold: 2,
            unhealthy_threshold: 3,
            failure_action: FailureAction::RemoveFromLb,
        }
    }
}

/// Service-level objectives for one component.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SloConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_p50_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_p95_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_p99_ms: Option<f64>,
    /// Maximum acceptable error rate (0-1).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_rate: Option<f64>,
    /// Target availability (0-1).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub availability: Option<f64>,
    /// Minimum requests per second.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub throughput_min: Option<f64>,
}

impl SloConfig {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// Built-in fault hooks, active for the whole run when enabled.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FaultInjectionHooks {
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_injection: Option<LatencyInjectionHook>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_injection: Option<ErrorInjectionHook>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencyInjectionHook {
    pub enabled: bool,
    /// Share of requests affected (0-100).
    pub percent_affected: f64,
    pub added_latency_ms: DistributionConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInjectionHook {
    pub enabled: bool,
    pub error_rate: f64,
    #[serde(default)]
    pub error_types: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScalingType {
    #[default]
    None,
    Horizontal,
    Vertical,
    Both,
}

/// Scaling policy; only horizontal scaling is simulated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScalingPolicy {
    #[serde(rename = "type")]
    pub scaling_type: ScalingType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub horizontal: Option<HorizontalScaling>,
}

impl ScalingPolicy {
    /// Horizontal settings if horizontal scaling is enabled.
    pub fn horizontal(&self) -> Option<&HorizontalScaling> {
        match self.scaling_type {
            ScalingType::Horizontal | ScalingType::Both => self.horizontal.as_ref(),
            _ => None,
        }
    }

    fn initial_replicas(&self) -> u32 {
        self.horizontal().map_or(1, |h| h.min_replicas.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HorizontalScaling {
    pub min_replicas: u32,
    pub max_replicas: u32,
    pub triggers: Vec<ScalingTrigger>,
    pub scale_up_cooldown_sec: f64,
    pub scale_down_cooldown_sec: f64,
    pub scale_up_step: u32,
    pub scale_down_step: u32,
    /// Time for a new replica to become ready.
    pub cold_start_ms: f64,
}

impl Default for HorizontalScaling {
    fn default() -> Self {
        Self {
            min_replicas: 1,
            max_replicas: 10,
            triggers: Vec::new(),
            scale_up_cooldown_sec: 30.0,
            scale_down_cooldown_sec: 120.0,
            scale_up_step: 1,
            scale_down_step: 1,
            cold_start_ms: 5_000.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScalingMetric {
    /// Busy share of processing slots, in percent.
    Cpu,
    /// Memory utilization, in percent.
    Memory,
    /// Requests waiting for a slot.
    QueueDepth,
    /// Arrivals per second.
    Rps,
    /// Rolling p99 latency in milliseconds.
    LatencyP99,
    Custom,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalingTrigger {
    pub metric: ScalingMetric,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_metric_name: Option<String>,
    pub threshold: f64,
    pub operator: ComparisonOperator,
    /// Seconds the condition must hold before acting.
    #[serde(default)]
    pub duration_sec: f64,
}

/// Access rules checked by security invariants.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SecurityConfig {
    pub auth_required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_policies: Option<NetworkPolicies>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkPolicies {
    pub allow_from: Vec<ComponentId>,
    pub deny_from: Vec<ComponentId>,
}

impl NetworkPolicies {
    /// Whether calls from `caller` are permitted.
    pub fn permits(&self, caller: &ComponentId) -> bool {
        if self.deny_from.contains(caller) {
            return false;
        }
        self.allow_from.is_empty() || self.allow_from.contains(caller)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Edges
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionType {
    /// Caller waits for the response.
    #[default]
    Sync,
    /// Caller continues once the call is sent.
    Async,
    Streaming,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Protocol {
    #[default]
    Http,
    Grpc,
    Tcp,
    Websocket,
    Kafka,
    Sqs,
    Custom,
}

/// A directed connection between two components.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeDefinition {
    pub id: EdgeId,
    pub source: ComponentId,
    pub target: ComponentId,
    #[serde(default)]
    pub connection_type: ConnectionType,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub network: NetworkSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<EdgeRetryPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    /// Load distribution weight for multi-target routing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl EdgeDefinition {
    /// A synchronous edge with default network settings.
    pub fn new(
        id: impl Into<EdgeId>,
        source: impl Into<ComponentId>,
        target: impl Into<ComponentId>,
    ) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            connection_type: ConnectionType::Sync,
            protocol: Protocol::Http,
            network: NetworkSpec::default(),
            retry: None,
            circuit_breaker: None,
            weight: None,
            label: None,
        }
    }

    pub fn with_latency(mut self, latency: DistributionConfig) -> Self {
        self.network.latency = latency;
        self
    }

    pub fn with_retry(mut self, retry: EdgeRetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_circuit_breaker(mut self, breaker: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(breaker);
        self
    }

    pub fn with_connection_type(mut self, connection_type: ConnectionType) -> Self {
        self.connection_type = connection_type;
        self
    }

    pub fn is_async(&self) -> bool {
        self.connection_type == ConnectionType::Async
    }
}

/// Per-edge network behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkSpec {
    /// One-way latency in milliseconds.
    pub latency: DistributionConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bandwidth: Option<BandwidthSpec>,
    /// Probability a request is lost in transit (0-1).
    pub packet_loss: f64,
    /// Extra latency added on top of `latency`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jitter: Option<DistributionConfig>,
}

impl Default for NetworkSpec {
    fn default() -> Self {
        Self {
            latency: DistributionConfig::constant(1.0),
            bandwidth: None,
            packet_loss: 0.0,
            jitter: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BandwidthSpec {
    pub limit_mbps: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub burst_mbps: Option<f64>,
}

/// Retry policy attached to one edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EdgeRetryPolicy {
    pub enabled: bool,
    /// Total attempts including the first.
    pub max_attempts: u32,
    pub backoff_ms: f64,
    pub backoff_multiplier: f64,
    /// Error codes that are retried; empty retries every failure.
    pub retryable_errors: Vec<String>,
}

impl Default for EdgeRetryPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            backoff_ms: 100.0,
            backoff_multiplier: 2.0,
            retryable_errors: Vec::new(),
        }
    }
}

/// Circuit breaker attached to one edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,
    /// Consecutive failures that open the breaker.
    pub failure_threshold: u32,
    /// Time the breaker stays open before admitting probes.
    pub recovery_window_ms: f64,
    /// Probes admitted while half-open.
    pub half_open_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            recovery_window_ms: 30_000.0,
            half_open_requests: 1,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Global configuration and the architecture itself
// ═══════════════════════════════════════════════════════════════════════════

/// Run-wide defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GlobalConfig {
    pub simulation: SimulationDefaults,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_workload: Option<WorkloadProfile>,
    pub timeouts: TimeoutDefaults,
    pub retry_policy: GlobalRetryPolicy,
    pub regions: Vec<RegionDefinition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SimulationDefaults {
    pub default_duration_ms: f64,
    pub warmup_ms: f64,
    pub default_seed: String,
    pub time_resolution_microseconds: u64,
}

impl Default for SimulationDefaults {
    fn default() -> Self {
        Self {
            default_duration_ms: 60_000.0,
            warmup_ms: 0.0,
            default_seed: "0".to_string(),
            time_resolution_microseconds: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimeoutDefaults {
    pub default_request_timeout_ms: f64,
    pub default_connect_timeout_ms: f64,
}

impl Default for TimeoutDefaults {
    fn default() -> Self {
        Self {
            default_request_timeout_ms: 30_000.0,
            default_connect_timeout_ms: 1_000.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackoffType {
    #[default]
    Exponential,
    Linear,
    Constant,
}

/// Fallback retry policy for edges without their own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GlobalRetryPolicy {
    /// Total attempts including the first; 1 disables retries.
    pub max_attempts: u32,
    pub backoff_type: BackoffType,
    pub base_delay_ms: f64,
    pub max_delay_ms: f64,
    /// Fraction of the delay randomized (0-1).
    pub jitter_factor: f64,
}

impl Default for GlobalRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff_type: BackoffType::Exponential,
            base_delay_ms: 100.0,
            max_delay_ms: 10_000.0,
            jitter_factor: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegionDefinition {
    pub id: RegionId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub zones: Vec<String>,
}

/// Architectural patterns declared on the design.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArchitecturalPattern {
    Cqrs,
    EventSourcing,
    SagaChoreography,
    SagaOrchestration,
    MaterializedViews,
    CircuitBreaker,
    Bulkhead,
    RetryExponential,
    Backpressure,
    RateLimiting,
    BlueGreen,
    Canary,
    CanaryAnalysis,
    Strangler,
    Ambassador,
    Sidecar,
    Bff,
    AntiCorruptionLayer,
    AutoscaleQueueDepth,
    LeaderFollower,
    ReadReplicas,
    CacheAside,
    WriteThrough,
    WriteBehind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternApplication {
    pub pattern: ArchitecturalPattern,
    /// Component ids the pattern applies to.
    #[serde(default)]
    pub applied_to: Vec<String>,
}

/// The complete input design.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SystemArchitecture {
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub components: Vec<ComponentDefinition>,
    pub edges: Vec<EdgeDefinition>,
    pub patterns: Vec<PatternApplication>,
    pub global_config: GlobalConfig,
    pub invariants: Vec<SimulationInvariant>,
    pub tags: Vec<String>,
}

impl SystemArchitecture {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            version: "1".to_string(),
            ..Self::default()
        }
    }

    pub fn with_component(mut self, component: ComponentDefinition) -> Self {
        self.components.push(component);
        self
    }

    pub fn with_edge(mut self, edge: EdgeDefinition) -> Self {
        self.edges.push(edge);
        self
    }

    pub fn with_invariant(mut self, invariant: SimulationInvariant) -> Self {
        self.invariants.push(invariant);
        self
    }

    pub fn component(&self, id: &ComponentId) -> Option<&ComponentDefinition> {
        self.components.iter().find(|c| &c.id == id)
    }

    pub fn component_mut(&mut self, id: &ComponentId) -> Option<&mut ComponentDefinition> {
        self.components.iter_mut().find(|c| &c.id == id)
    }

    /// Whether `pattern` is declared on `component`.
    pub fn has_pattern(&self, pattern: ArchitecturalPattern, component: &ComponentId) -> bool {
        self.patterns
            .iter()
            .any(|p| p.pattern == pattern && p.applied_to.iter().any(|c| c == component.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component_config::{CacheConfig, ComponentConfig, DatabaseConfig};

    #[test]
    fn test_type_tags_use_kebab_case() {
        let parsed: ComponentType = serde_json::from_str("\"load-balancer-l7\"").unwrap();
        assert_eq!(parsed, ComponentType::LoadBalancerL7);
        let parsed: ComponentType = serde_json::from_str("\"k8s-control-plane\"").unwrap();
        assert_eq!(parsed, ComponentType::K8sControlPlane);
        assert_eq!(
            serde_json::to_string(&ComponentType::NosqlKeyvalue).unwrap(),
            "\"nosql-keyvalue\""
        );
    }

    #[test]
    fn test_family_prefers_config_over_tag() {
        let plain = ComponentDefinition::new("svc", ComponentType::Container);
        assert_eq!(plain.family(), BehaviorFamily::Compute);

        let db = ComponentDefinition::new("orders", ComponentType::RelationalDb);
        assert_eq!(db.family(), BehaviorFamily::Database);

        let cache = ComponentDefinition::new("c", ComponentType::Cache)
            .with_config(ComponentConfig::Cache(CacheConfig::default()));
        assert_eq!(cache.family(), BehaviorFamily::Cache);

        let odd = ComponentDefinition::new("x", ComponentType::Vm)
            .with_config(ComponentConfig::Database(DatabaseConfig::default()));
        assert_eq!(odd.family(), BehaviorFamily::Database);
    }

    #[test]
    fn test_minimal_component_json_fills_defaults() {
        let json = r#"{"id":"api","type":"api","dependencies":["db"]}"#;
        let component: ComponentDefinition = serde_json::from_str(json).unwrap();
        assert_eq!(component.dependencies, vec![ComponentId::new("db")]);
        assert_eq!(component.resources.concurrency, 64);
        assert_eq!(component.initial_replicas(), 1);
        assert_eq!(component.region.as_str(), "default");
    }

    #[test]
    fn test_network_policy() {
        let policy = NetworkPolicies {
            allow_from: vec![ComponentId::new("gw")],
            deny_from: vec![],
        };
        assert!(policy.permits(&ComponentId::new("gw")));
        assert!(!policy.permits(&ComponentId::new("api")));
    }
}
