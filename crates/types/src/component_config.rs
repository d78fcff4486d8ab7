//! Type-specific component configuration.

use crate::architecture::{BehaviorFamily, HealthCheckConfig};
use crate::distribution::DistributionConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Tunables for one component, tagged by the model they configure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ComponentConfig {
    Api(ApiConfig),
    Microservice(MicroserviceConfig),
    LoadBalancer(LoadBalancerConfig),
    Database(DatabaseConfig),
    Cache(CacheConfig),
    Queue(QueueConfig),
    Stream(StreamConfig),
    Serverless(ServerlessConfig),
    Cdn(CdnConfig),
    Gateway(GatewayConfig),
    Generic(GenericConfig),
}

impl Default for ComponentConfig {
    fn default() -> Self {
        ComponentConfig::Generic(GenericConfig::default())
    }
}

impl ComponentConfig {
    /// Family pinned by this configuration; `None` for generic configs.
    pub fn family(&self) -> Option<BehaviorFamily> {
        match self {
            Self::Api(_) | Self::Microservice(_) | Self::Serverless(_) => {
                Some(BehaviorFamily::Compute)
            }
            Self::LoadBalancer(_) => Some(BehaviorFamily::LoadBalancer),
            Self::Database(_) => Some(BehaviorFamily::Database),
            Self::Cache(_) | Self::Cdn(_) => Some(BehaviorFamily::Cache),
            Self::Queue(_) | Self::Stream(_) => Some(BehaviorFamily::Queue),
            Self::Gateway(_) => Some(BehaviorFamily::Gateway),
            Self::Generic(_) => None,
        }
    }

    /// Tag name, used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Api(_) => "api",
            Self::Microservice(_) => "microservice",
            Self::LoadBalancer(_) => "load-balancer",
            Self::Database(_) => "database",
            Self::Cache(_) => "cache",
            Self::Queue(_) => "queue",
            Self::Stream(_) => "stream",
            Self::Serverless(_) => "serverless",
            Self::Cdn(_) => "cdn",
            Self::Gateway(_) => "gateway",
            Self::Generic(_) => "generic",
        }
    }

    /// Every distribution embedded in the configuration, for validation.
    pub fn distributions(&self) -> Vec<&DistributionConfig> {
        match self {
            Self::Api(c) => c.endpoints.iter().map(|e| &e.latency).collect(),
            Self::Microservice(c) => vec![&c.processing_latency],
            Self::LoadBalancer(c) => vec![&c.processing_latency],
            Self::Database(c) => {
                let mut out = vec![&c.query_latency.read, &c.query_latency.write];
                out.extend(c.query_latency.indexed_read.as_ref());
                out.extend(c.replication.as_ref().map(|r| &r.lag_distribution));
                out
            }
            Self::Cache(c) => vec![&c.latency.hit, &c.latency.miss],
            Self::Queue(c) => vec![&c.consumer_latency],
            Self::Stream(c) => c
                .consumer_groups
                .iter()
                .map(|g| &g.processing_latency)
                .collect(),
            Self::Serverless(c) => vec![&c.processing_latency, &c.cold_start.duration_distribution],
            Self::Cdn(c) => vec![&c.latency.hit, &c.latency.miss],
            Self::Gateway(_) => Vec::new(),
            Self::Generic(c) => vec![&c.processing_latency],
        }
    }
}

// ─── compute ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Delete,
    Patch,
}

impl HttpMethod {
    /// Whether requests with this method mutate state.
    pub fn is_write(self) -> bool {
        !matches!(self, HttpMethod::Get)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointSpec {
    pub path: String,
    #[serde(default)]
    pub method: HttpMethod,
    pub latency: DistributionConfig,
    #[serde(default)]
    pub error_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitSpec {
    pub requests_per_second: f64,
    pub burst_size: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApiConfig {
    pub endpoints: Vec<EndpointSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MicroserviceConfig {
    pub stateful: bool,
    pub processing_latency: DistributionConfig,
}

impl Default for MicroserviceConfig {
    fn default() -> Self {
        Self {
            stateful: false,
            processing_latency: DistributionConfig::constant(5.0),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServerlessRuntime {
    #[default]
    Nodejs,
    Python,
    Java,
    Go,
    Dotnet,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColdStartSpec {
    pub probability: f64,
    pub duration_distribution: DistributionConfig,
}

impl Default for ColdStartSpec {
    fn default() -> Self {
        Self {
            probability: 0.0,
            duration_distribution: DistributionConfig::constant(0.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerlessConcurrency {
    /// Concurrent executions always available.
    pub reserved: u32,
    /// Additional executions allowed above `reserved`.
    pub max_burst: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionedSpec {
    pub enabled: bool,
    pub min_instances: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerlessConfig {
    pub runtime: ServerlessRuntime,
    /// Memory in MB.
    pub memory: u32,
    /// Execution timeout in ms.
    pub timeout: f64,
    pub cold_start: ColdStartSpec,
    pub concurrency: ServerlessConcurrency,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provisioned: Option<ProvisionedSpec>,
    pub processing_latency: DistributionConfig,
}

impl Default for ServerlessConfig {
    fn default() -> Self {
        Self {
            runtime: ServerlessRuntime::Nodejs,
            memory: 512,
            timeout: 30_000.0,
            cold_start: ColdStartSpec::default(),
            concurrency: ServerlessConcurrency {
                reserved: 100,
                max_burst: 0,
            },
            provisioned: None,
            processing_latency: DistributionConfig::constant(20.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GenericConfig {
    pub processing_latency: DistributionConfig,
    pub error_rate: f64,
    pub custom: BTreeMap<String, serde_json::Value>,
}

impl Default for GenericConfig {
    fn default() -> Self {
        Self {
            processing_latency: DistributionConfig::constant(1.0),
            error_rate: 0.0,
            custom: BTreeMap::new(),
        }
    }
}

// ─── load balancer ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoadBalancingAlgorithm {
    #[default]
    RoundRobin,
    LeastConnections,
    Weighted,
    IpHash,
    Random,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StickySession {
    pub enabled: bool,
    pub ttl_ms: f64,
    #[serde(default)]
    pub cookie_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoadBalancerConfig {
    pub algorithm: LoadBalancingAlgorithm,
    pub health_check: HealthCheckConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sticky_session: Option<StickySession>,
    /// Target component id to weight, for the weighted algorithm.
    pub weights: BTreeMap<String, f64>,
    /// Per-request overhead of the balancer itself.
    pub processing_latency: DistributionConfig,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            algorithm: LoadBalancingAlgorithm::RoundRobin,
            health_check: HealthCheckConfig::default(),
            sticky_session: None,
            weights: BTreeMap::new(),
            processing_latency: DistributionConfig::constant(0.5),
        }
    }
}

// ─── database ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DatabaseEngine {
    #[default]
    Postgres,
    Mysql,
    Mongodb,
    Dynamodb,
    Cassandra,
    Redis,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionPoolSpec {
    pub min_connections: u32,
    pub max_connections: u32,
    pub connection_timeout_ms: f64,
    pub idle_timeout_ms: f64,
}

impl Default for ConnectionPoolSpec {
    fn default() -> Self {
        Self {
            min_connections: 1,
            max_connections: 100,
            connection_timeout_ms: 1_000.0,
            idle_timeout_ms: 60_000.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReplicationMode {
    Sync,
    #[default]
    Async,
    SemiSync,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationSpec {
    pub mode: ReplicationMode,
    /// Read replicas in addition to the primary.
    pub replicas: u32,
    pub lag_distribution: DistributionConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardingSpec {
    pub enabled: bool,
    pub shard_count: u32,
    #[serde(default)]
    pub shard_key: String,
    #[serde(default)]
    pub rebalance_throttle_rps: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryLatency {
    pub read: DistributionConfig,
    pub write: DistributionConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indexed_read: Option<DistributionConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailoverSpec {
    pub automatic_failover: bool,
    pub detection_time_ms: f64,
    pub failover_time_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DatabaseConfig {
    pub engine: DatabaseEngine,
    pub connection_pool: ConnectionPoolSpec,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replication: Option<ReplicationSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sharding: Option<ShardingSpec>,
    pub query_latency: QueryLatency,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failover: Option<FailoverSpec>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            engine: DatabaseEngine::Postgres,
            connection_pool: ConnectionPoolSpec::default(),
            replication: None,
            sharding: None,
            query_latency: QueryLatency {
                read: DistributionConfig::constant(5.0),
                write: DistributionConfig::constant(10.0),
                indexed_read: None,
            },
            failover: None,
        }
    }
}

// ─── cache / cdn ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheEngine {
    #[default]
    Redis,
    Memcached,
    Local,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EvictionPolicy {
    #[default]
    Lru,
    Lfu,
    Fifo,
    Random,
    Ttl,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheCapacity {
    pub max_keys: u64,
    #[serde(default)]
    pub max_memory_mb: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HitMissLatency {
    pub hit: DistributionConfig,
    pub miss: DistributionConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheConfig {
    pub engine: CacheEngine,
    pub capacity: CacheCapacity,
    pub eviction: EvictionPolicy,
    /// Entry lifetime; zero never expires.
    pub default_ttl_ms: f64,
    /// Expected hit rate of a warm cache (0-1).
    pub hit_rate: f64,
    pub latency: HitMissLatency,
    /// Model real entries instead of sampling `hit_rate`.
    pub track_entries: bool,
    /// Share one origin fetch between concurrent misses on a key.
    pub coalesce_misses: bool,
    /// Time for the hit rate to recover after the cache is flushed.
    pub warmup_ms: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            engine: CacheEngine::Redis,
            capacity: CacheCapacity {
                max_keys: 10_000,
                max_memory_mb: 1_024.0,
            },
            eviction: EvictionPolicy::Lru,
            default_ttl_ms: 60_000.0,
            hit_rate: 0.9,
            latency: HitMissLatency {
                hit: DistributionConfig::constant(1.0),
                miss: DistributionConfig::constant(1.0),
            },
            track_entries: false,
            coalesce_misses: false,
            warmup_ms: 10_000.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CdnCaching {
    pub default_ttl_sec: f64,
    pub max_ttl_sec: f64,
    #[serde(default)]
    pub cache_key_policy: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CdnConfig {
    pub caching: CdnCaching,
    pub hit_rate: f64,
    pub latency: HitMissLatency,
    pub edge_locations: Vec<String>,
}

impl Default for CdnConfig {
    fn default() -> Self {
        Self {
            caching: CdnCaching {
                default_ttl_sec: 3_600.0,
                max_ttl_sec: 86_400.0,
                cache_key_policy: Vec::new(),
            },
            hit_rate: 0.95,
            latency: HitMissLatency {
                hit: DistributionConfig::constant(5.0),
                miss: DistributionConfig::constant(5.0),
            },
            edge_locations: Vec::new(),
        }
    }
}

// ─── queue / stream ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeliveryGuarantee {
    AtMostOnce,
    #[default]
    AtLeastOnce,
    ExactlyOnce,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageOrdering {
    #[default]
    Fifo,
    Unordered,
}

/// What a full queue does to producers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackpressurePolicy {
    /// Reject the message immediately.
    #[default]
    Reject,
    /// Hold the producer until space frees up.
    Block,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueCapacity {
    pub max_messages: u64,
    #[serde(default)]
    pub max_message_size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisibilitySpec {
    pub timeout_ms: f64,
    pub max_receives: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterSpec {
    pub enabled: bool,
    pub max_receives: u32,
    #[serde(default)]
    pub queue_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchingSpec {
    pub enabled: bool,
    pub max_size: u32,
    pub max_wait_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueConfig {
    pub capacity: QueueCapacity,
    pub delivery: DeliveryGuarantee,
    pub ordering: MessageOrdering,
    pub visibility: VisibilitySpec,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dead_letter: Option<DeadLetterSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batching: Option<BatchingSpec>,
    /// Concurrent consumers; zero leaves messages in the queue.
    pub consumers: u32,
    pub backpressure: BackpressurePolicy,
    /// Consumer work when the queue has no downstream component.
    pub consumer_latency: DistributionConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: QueueCapacity {
                max_messages: 10_000,
                max_message_size: 262_144,
            },
            delivery: DeliveryGuarantee::AtLeastOnce,
            ordering: MessageOrdering::Fifo,
            visibility: VisibilitySpec {
                timeout_ms: 30_000.0,
                max_receives: 5,
            },
            dead_letter: None,
            batching: None,
            consumers: 1,
            backpressure: BackpressurePolicy::Reject,
            consumer_latency: DistributionConfig::constant(1.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamRetention {
    pub time_ms: f64,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamThroughput {
    /// Zero is unlimited.
    pub max_write_rps: f64,
    pub max_read_rps: f64,
    #[serde(default)]
    pub max_bytes_per_second: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerGroup {
    pub group_id: String,
    pub consumers: u32,
    pub processing_latency: DistributionConfig,
    #[serde(default)]
    pub commit_interval_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamConfig {
    pub partitions: u32,
    pub replication_factor: u32,
    pub retention: StreamRetention,
    pub throughput: StreamThroughput,
    pub consumer_groups: Vec<ConsumerGroup>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            partitions: 1,
            replication_factor: 1,
            retention: StreamRetention {
                time_ms: 86_400_000.0,
                size_bytes: 0,
            },
            throughput: StreamThroughput {
                max_write_rps: 0.0,
                max_read_rps: 0.0,
                max_bytes_per_second: 0.0,
            },
            consumer_groups: Vec::new(),
        }
    }
}

// ─── gateway ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayRateLimit {
    pub requests_per_second: f64,
    pub burst_size: f64,
    /// One bucket per user instead of one shared bucket.
    #[serde(default)]
    pub per_user: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMethod {
    ApiKey,
    Jwt,
    Oauth,
    Mtls,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthenticationSpec {
    pub required: bool,
    pub methods: Vec<AuthMethod>,
    pub cache_ttl_ms: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransformationSpec {
    pub request_transform: bool,
    pub response_transform: bool,
    pub latency_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewayConfig {
    pub rate_limit: GatewayRateLimit,
    pub authentication: AuthenticationSpec,
    pub transformation: TransformationSpec,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            rate_limit: GatewayRateLimit {
                requests_per_second: 1_000.0,
                burst_size: 1_000.0,
                per_user: false,
            },
            authentication: AuthenticationSpec::default(),
            transformation: TransformationSpec::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tagged_config_with_partial_fields() {
        let json = r#"{"type":"queue","capacity":{"maxMessages":5},"consumers":0}"#;
        let config: ComponentConfig = serde_json::from_str(json).unwrap();
        let ComponentConfig::Queue(queue) = config else {
            panic!("expected queue config");
        };
        assert_eq!(queue.capacity.max_messages, 5);
        assert_eq!(queue.consumers, 0);
        assert_eq!(queue.backpressure, BackpressurePolicy::Reject);
    }

    #[test]
    fn test_gateway_rate_limit_parses() {
        let json = r#"{"type":"gateway","rateLimit":{"requestsPerSecond":10,"burstSize":10}}"#;
        let config: ComponentConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.family(), Some(BehaviorFamily::Gateway));
        let ComponentConfig::Gateway(gateway) = config else {
            panic!("expected gateway config");
        };
        assert!(!gateway.rate_limit.per_user);
        assert_eq!(gateway.rate_limit.burst_size, 10.0);
    }

    #[test]
    fn test_generic_is_default_and_unpinned() {
        let config = ComponentConfig::default();
        assert_eq!(config.kind(), "generic");
        assert_eq!(config.family(), None);
    }
}
