//! Anti-pattern detection.
//!
//! Structural checks run over the architecture before the first event;
//! runtime checks refine them from the metrics of a finished run (a retry
//! storm, a saturated shared database, a sync call that turned out slow).

use archsim_core::{AntiPattern, AntiPatternDetection, FindingSeverity, MetricsOutput};
use archsim_types::{
    ArchitecturalPattern, BehaviorFamily, ComponentConfig, ComponentDefinition, ConnectionType,
    EdgeDefinition,
};
use std::collections::BTreeSet;

use crate::graph::ArchitectureGraph;

/// Mean latency above which a synchronous call is a long operation.
pub const LONG_OP_MS: f64 = 1_000.0;

/// Attempts above which a retry policy is treated as unbounded.
pub const MAX_SANE_ATTEMPTS: u32 = 5;

/// Shard count above which a database is over-sharded.
pub const MAX_SHARDS: u32 = 64;

/// Retries per call above which an edge is in a retry storm.
pub const RETRY_STORM_RATIO: f64 = 0.5;

/// Calls an edge needs before its retry ratio is trusted.
const RETRY_STORM_MIN_CALLS: u64 = 50;

/// Connection-pool utilization at which a shared database counts as
/// contended.
const CONTENDED_POOL: f64 = 0.8;

fn family(def: &ComponentDefinition) -> BehaviorFamily {
    def.family()
}

fn is_sync(edge: &EdgeDefinition) -> bool {
    edge.connection_type == ConnectionType::Sync
}

/// Mean processing latency the configuration promises, if any.
fn expected_latency_ms(def: &ComponentDefinition) -> Option<f64> {
    match &def.config {
        ComponentConfig::Microservice(c) => c.processing_latency.approximate_mean(),
        ComponentConfig::Serverless(c) => c.processing_latency.approximate_mean(),
        ComponentConfig::Generic(c) => c.processing_latency.approximate_mean(),
        ComponentConfig::Api(c) => c
            .endpoints
            .iter()
            .filter_map(|e| e.latency.approximate_mean())
            .reduce(f64::max),
        ComponentConfig::Database(c) => c.query_latency.write.approximate_mean(),
        _ => None,
    }
}

fn detection(
    anti_pattern: AntiPattern,
    detected_at: Vec<String>,
    severity: FindingSeverity,
    recommendation: &str,
) -> AntiPatternDetection {
    AntiPatternDetection {
        anti_pattern,
        detected_at,
        severity,
        recommendation: recommendation.to_string(),
    }
}

/// Anti-patterns visible in the architecture itself.
pub fn detect_static(graph: &ArchitectureGraph) -> Vec<AntiPatternDetection> {
    let mut found = Vec::new();

    for def in graph.components() {
        match family(def) {
            BehaviorFamily::Database => {
                // Distinct services calling one database.
                let callers: BTreeSet<&str> = graph
                    .incoming_edges(&def.id)
                    .iter()
                    .filter_map(|id| graph.edge(id))
                    .filter_map(|e| graph.component(&e.source))
                    .filter(|c| family(c) == BehaviorFamily::Compute)
                    .map(|c| c.id.as_str())
                    .collect();
                if callers.len() >= 2
                    && !graph.has_pattern(ArchitecturalPattern::Cqrs, &def.id)
                {
                    let mut at = vec![def.id.as_str().to_string()];
                    at.extend(callers.iter().map(|c| c.to_string()));
                    found.push(detection(
                        AntiPattern::MonolithicSharedDb,
                        at,
                        if callers.len() >= 3 {
                            FindingSeverity::Critical
                        } else {
                            FindingSeverity::Warning
                        },
                        "Give each service its own datastore and share data through APIs or events",
                    ));
                }
                if let ComponentConfig::Database(cfg) = &def.config {
                    if let Some(sharding) = cfg.sharding.as_ref().filter(|s| s.enabled) {
                        if sharding.shard_count > MAX_SHARDS {
                            found.push(detection(
                                AntiPattern::OverSharding,
                                vec![def.id.as_str().to_string()],
                                if sharding.shard_count > MAX_SHARDS * 4 {
                                    FindingSeverity::Critical
                                } else {
                                    FindingSeverity::Warning
                                },
                                "Reduce the shard count; cross-shard queries and rebalancing dominate at this size",
                            ));
                        }
                    }
                }
            }
            BehaviorFamily::Cache => {
                let ComponentConfig::Cache(cfg) = &def.config else {
                    continue;
                };
                if cfg.default_ttl_ms > 0.0 {
                    continue;
                }
                // Cached data is mutable when the cache fronts a database.
                let fronts_database = graph
                    .dependencies_of(&def.id)
                    .iter()
                    .chain(graph.dependents_of(&def.id).iter().flat_map(|caller| {
                        graph.dependencies_of(caller).iter()
                    }))
                    .filter_map(|id| graph.component(id))
                    .any(|c| family(c) == BehaviorFamily::Database);
                if fronts_database {
                    found.push(detection(
                        AntiPattern::InfiniteTtlMutable,
                        vec![def.id.as_str().to_string()],
                        if graph.has_pattern(ArchitecturalPattern::WriteThrough, &def.id) {
                            FindingSeverity::Warning
                        } else {
                            FindingSeverity::Critical
                        },
                        "Set a TTL or invalidate entries on write",
                    ));
                }
            }
            BehaviorFamily::Compute => {
                let sync_db_targets: BTreeSet<&str> = graph
                    .edges()
                    .filter(|e| e.source == def.id && is_sync(e))
                    .filter_map(|e| graph.component(&e.target))
                    .filter(|c| family(c) == BehaviorFamily::Database)
                    .map(|c| c.id.as_str())
                    .collect();
                let saga = graph.has_pattern(ArchitecturalPattern::SagaOrchestration, &def.id)
                    || graph.has_pattern(ArchitecturalPattern::SagaChoreography, &def.id);
                if sync_db_targets.len() >= 2 && !saga {
                    let mut at = vec![def.id.as_str().to_string()];
                    at.extend(sync_db_targets.iter().map(|c| c.to_string()));
                    found.push(detection(
                        AntiPattern::DistributedTransaction,
                        at,
                        FindingSeverity::Warning,
                        "Replace the cross-database transaction with a saga and compensating actions",
                    ));
                }

                let consumes_events = graph
                    .incoming_edges(&def.id)
                    .iter()
                    .filter_map(|id| graph.edge(id))
                    .filter_map(|e| graph.component(&e.source))
                    .any(|c| family(c) == BehaviorFamily::Queue);
                if consumes_events {
                    let blocking: Vec<String> = graph
                        .edges()
                        .filter(|e| e.source == def.id && is_sync(e))
                        .filter(|e| {
                            graph.component(&e.target).is_some_and(|c| {
                                matches!(
                                    family(c),
                                    BehaviorFamily::Compute | BehaviorFamily::Gateway
                                )
                            })
                        })
                        .map(|e| e.id.as_str().to_string())
                        .collect();
                    if !blocking.is_empty() {
                        let mut at = vec![def.id.as_str().to_string()];
                        at.extend(blocking);
                        found.push(detection(
                            AntiPattern::BlockingEventHandler,
                            at,
                            FindingSeverity::Warning,
                            "Publish follow-up events instead of calling services synchronously from a handler",
                        ));
                    }
                }
            }
            _ => {}
        }
    }

    for edge in graph.edges() {
        if is_sync(edge) {
            let slow = graph
                .component(&edge.target)
                .and_then(expected_latency_ms)
                .filter(|ms| *ms >= LONG_OP_MS);
            if let Some(ms) = slow {
                found.push(detection(
                    AntiPattern::SyncRpcLongOps,
                    vec![edge.id.as_str().to_string()],
                    if ms >= LONG_OP_MS * 5.0 {
                        FindingSeverity::Critical
                    } else {
                        FindingSeverity::Warning
                    },
                    "Make the call asynchronous (queue + callback or polling)",
                ));
            }
        }

        if let Some(retry) = edge.retry.as_ref().filter(|r| r.enabled) {
            let unbounded = retry.max_attempts > MAX_SANE_ATTEMPTS;
            let unprotected = edge.circuit_breaker.as_ref().map_or(true, |cb| !cb.enabled)
                && retry.backoff_multiplier <= 1.0
                && retry.max_attempts > 2;
            if unbounded || unprotected {
                found.push(detection(
                    AntiPattern::UnlimitedRetries,
                    vec![edge.id.as_str().to_string()],
                    FindingSeverity::Warning,
                    "Cap attempts, back off exponentially with jitter and add a circuit breaker",
                ));
            }
        }
    }

    let global = &graph.global().retry_policy;
    if global.max_attempts > MAX_SANE_ATTEMPTS {
        found.push(detection(
            AntiPattern::UnlimitedRetries,
            vec!["global".to_string()],
            FindingSeverity::Warning,
            "Lower the default retry attempts",
        ));
    }

    sort(&mut found);
    found
}

/// Static findings refined by the metrics of a run.
pub fn detect(graph: &ArchitectureGraph, metrics: &MetricsOutput) -> Vec<AntiPatternDetection> {
    let mut found = detect_static(graph);

    for (edge_id, edge_metrics) in &metrics.per_edge {
        if edge_metrics.calls < RETRY_STORM_MIN_CALLS {
            continue;
        }
        let ratio = edge_metrics.retries as f64 / edge_metrics.calls as f64;
        if ratio < RETRY_STORM_RATIO {
            continue;
        }
        let at = edge_id.as_str().to_string();
        match found
            .iter_mut()
            .find(|d| d.anti_pattern == AntiPattern::UnlimitedRetries && d.detected_at == [at.clone()])
        {
            Some(existing) => existing.severity = FindingSeverity::Critical,
            None => found.push(detection(
                AntiPattern::UnlimitedRetries,
                vec![at],
                FindingSeverity::Critical,
                "Retry storm observed: cap attempts and add a circuit breaker or retry budget",
            )),
        }
    }

    for edge in graph.edges().filter(|e| is_sync(e)) {
        let Some(target) = metrics.per_component.get(&edge.target) else {
            continue;
        };
        if target.latency.samples == 0 || target.latency.p50 < LONG_OP_MS {
            continue;
        }
        let at = vec![edge.id.as_str().to_string()];
        if !found
            .iter()
            .any(|d| d.anti_pattern == AntiPattern::SyncRpcLongOps && d.detected_at == at)
        {
            found.push(detection(
                AntiPattern::SyncRpcLongOps,
                at,
                FindingSeverity::Warning,
                "Observed latency makes this synchronous call a long operation; make it asynchronous",
            ));
        }
    }

    for d in found
        .iter_mut()
        .filter(|d| d.anti_pattern == AntiPattern::MonolithicSharedDb)
    {
        let contended = d
            .detected_at
            .first()
            .and_then(|db| {
                metrics
                    .per_component
                    .iter()
                    .find(|(id, _)| id.as_str() == db.as_str())
            })
            .is_some_and(|(_, m)| m.saturation.connection_pool_utilization >= CONTENDED_POOL);
        if contended {
            d.severity = FindingSeverity::Critical;
        }
    }

    sort(&mut found);
    found
}

fn sort(found: &mut [AntiPatternDetection]) {
    found.sort_by(|a, b| {
        a.anti_pattern
            .cmp(&b.anti_pattern)
            .then_with(|| a.detected_at.cmp(&b.detected_at))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use archsim_core::{EdgeMetrics, MetricsDefinition};
    use archsim_types::{
        CacheConfig, ComponentType, DatabaseConfig, DistributionConfig, EdgeRetryPolicy, EdgeId,
        MicroserviceConfig, PatternApplication, ShardingSpec, SystemArchitecture,
    };

    fn service(id: &str, latency_ms: f64) -> ComponentDefinition {
        ComponentDefinition::new(id, ComponentType::Microservice).with_config(
            ComponentConfig::Microservice(MicroserviceConfig {
                stateful: false,
                processing_latency: DistributionConfig::constant(latency_ms),
            }),
        )
    }

    fn db(id: &str) -> ComponentDefinition {
        ComponentDefinition::new(id, ComponentType::RelationalDb)
            .with_config(ComponentConfig::Database(DatabaseConfig::default()))
    }

    fn kinds(found: &[AntiPatternDetection]) -> Vec<AntiPattern> {
        found.iter().map(|d| d.anti_pattern).collect()
    }

    #[test]
    fn test_shared_db_and_distributed_transaction() {
        let arch = SystemArchitecture::new("shop")
            .with_component(service("orders", 5.0))
            .with_component(service("billing", 5.0))
            .with_component(db("main-db"))
            .with_component(db("ledger-db"))
            .with_edge(EdgeDefinition::new("o-db", "orders", "main-db"))
            .with_edge(EdgeDefinition::new("b-db", "billing", "main-db"))
            .with_edge(EdgeDefinition::new("b-ledger", "billing", "ledger-db"));
        let found = detect_static(&ArchitectureGraph::new(arch).unwrap());
        assert_eq!(
            kinds(&found),
            vec![AntiPattern::MonolithicSharedDb, AntiPattern::DistributedTransaction]
        );
        assert_eq!(found[0].detected_at, vec!["main-db", "billing", "orders"]);
    }

    #[test]
    fn test_saga_pattern_suppresses_distributed_transaction() {
        let mut arch = SystemArchitecture::new("saga")
            .with_component(service("billing", 5.0))
            .with_component(db("a"))
            .with_component(db("b"))
            .with_edge(EdgeDefinition::new("e1", "billing", "a"))
            .with_edge(EdgeDefinition::new("e2", "billing", "b"));
        arch.patterns.push(PatternApplication {
            pattern: ArchitecturalPattern::SagaOrchestration,
            applied_to: vec!["billing".into()],
        });
        assert!(detect_static(&ArchitectureGraph::new(arch).unwrap()).is_empty());
    }

    #[test]
    fn test_edge_level_patterns() {
        let mut sharded = DatabaseConfig::default();
        sharded.sharding = Some(ShardingSpec {
            enabled: true,
            shard_count: 512,
            shard_key: "id".into(),
            rebalance_throttle_rps: 0.0,
        });
        let mut cache = CacheConfig::default();
        cache.default_ttl_ms = 0.0;
        let arch = SystemArchitecture::new("edges")
            .with_component(service("api", 5.0))
            .with_component(service("report", 3_000.0))
            .with_component(
                ComponentDefinition::new("cache", ComponentType::Cache)
                    .with_config(ComponentConfig::Cache(cache)),
            )
            .with_component(
                ComponentDefinition::new("db", ComponentType::RelationalDb)
                    .with_config(ComponentConfig::Database(sharded)),
            )
            .with_edge(EdgeDefinition::new("api-report", "api", "report").with_retry(
                EdgeRetryPolicy {
                    max_attempts: 20,
                    ..Default::default()
                },
            ))
            .with_edge(EdgeDefinition::new("api-cache", "api", "cache"))
            .with_edge(EdgeDefinition::new("cache-db", "cache", "db"));
        let found = detect_static(&ArchitectureGraph::new(arch).unwrap());
        let kinds = kinds(&found);
        assert!(kinds.contains(&AntiPattern::SyncRpcLongOps));
        assert!(kinds.contains(&AntiPattern::UnlimitedRetries));
        assert!(kinds.contains(&AntiPattern::OverSharding));
        assert!(kinds.contains(&AntiPattern::InfiniteTtlMutable));
        let shards = found
            .iter()
            .find(|d| d.anti_pattern == AntiPattern::OverSharding)
            .unwrap();
        assert_eq!(shards.severity, FindingSeverity::Critical);
    }

    #[test]
    fn test_blocking_event_handler() {
        let arch = SystemArchitecture::new("events")
            .with_component(ComponentDefinition::new("q", ComponentType::Queue))
            .with_component(service("handler", 5.0))
            .with_component(service("profile", 5.0))
            .with_edge(EdgeDefinition::new("q-h", "q", "handler"))
            .with_edge(EdgeDefinition::new("h-p", "handler", "profile"));
        let found = detect_static(&ArchitectureGraph::new(arch).unwrap());
        assert_eq!(kinds(&found), vec![AntiPattern::BlockingEventHandler]);
        assert_eq!(found[0].detected_at, vec!["handler", "h-p"]);
    }

    #[test]
    fn test_runtime_retry_storm() {
        let arch = SystemArchitecture::new("storm")
            .with_component(service("a", 5.0))
            .with_component(service("b", 5.0))
            .with_edge(EdgeDefinition::new("a-b", "a", "b"));
        let graph = ArchitectureGraph::new(arch).unwrap();
        let mut metrics = MetricsOutput::default();
        metrics.per_edge.insert(
            EdgeId::new("a-b"),
            EdgeMetrics {
                calls: 200,
                retries: 150,
                ..Default::default()
            },
        );
        metrics
            .per_component
            .insert("b".into(), MetricsDefinition::default());
        let found = detect(&graph, &metrics);
        assert_eq!(kinds(&found), vec![AntiPattern::UnlimitedRetries]);
        assert_eq!(found[0].severity, FindingSeverity::Critical);
    }
}
