//! Edge transit: latency, jitter, bandwidth, loss and partitions.

use archsim_types::{ComponentId, EdgeDefinition, FaultSpec};

use crate::distribution;
use crate::rng::DeterministicRng;
use crate::state::{FaultEffects, RuntimeState};

/// What happened to a call on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Transit {
    /// The call reaches the target after `latency_us`.
    Delivered { latency_us: u64, throttled: bool },
    /// Silently lost; only the caller's deadline notices.
    Dropped,
    /// The ends cannot reach each other; the caller fails fast.
    Refused,
    /// An injected edge error fails the call after `latency_us`.
    Failed { error: String, latency_us: u64 },
}

/// Whether a partition separates the two ends of `edge`.
pub fn is_partitioned(
    state: &RuntimeState,
    edge: &EdgeDefinition,
    source_region: &str,
    target_region: &str,
) -> bool {
    let edge_cut = state.edges.get(&edge.id).is_some_and(|runtime| {
        runtime
            .faults
            .values()
            .any(|spec| matches!(spec, FaultSpec::NetworkPartition { .. }))
    });
    if edge_cut {
        return true;
    }
    let cut = |from: &ComponentId, other: &ComponentId, other_region: &str| {
        state.component(from).is_some_and(|runtime| {
            let effects = runtime.effects(None);
            effects.partitioned_with.contains(other.as_str())
                || effects.partitioned_with.contains(other_region)
        })
    };
    cut(&edge.source, &edge.target, target_region) || cut(&edge.target, &edge.source, source_region)
}

/// Send `size_bytes` over `edge` under the edge's active faults.
pub fn transit(
    edge: &EdgeDefinition,
    effects: &FaultEffects,
    partitioned: bool,
    size_bytes: u64,
    rng: &mut DeterministicRng,
) -> Transit {
    if partitioned {
        return Transit::Refused;
    }
    let loss = 1.0 - (1.0 - edge.network.packet_loss.clamp(0.0, 1.0)) * (1.0 - effects.packet_loss);
    if rng.chance(loss) {
        return Transit::Dropped;
    }

    let mut ms = one_way_ms(edge, effects, rng);
    let limit = match (edge.network.bandwidth.as_ref(), effects.bandwidth_mbps) {
        (Some(spec), Some(fault)) => Some(spec.limit_mbps.min(fault)),
        (Some(spec), None) => Some(spec.limit_mbps),
        (None, fault) => fault,
    };
    if let Some(mbps) = limit.filter(|l| *l > 0.0) {
        ms += size_bytes as f64 * 8.0 / (mbps * 1_000.0);
    }
    let latency_us = archsim_types::millis_to_micros(ms);

    if rng.chance(effects.error_rate) {
        return Transit::Failed {
            error: effects
                .error_code
                .clone()
                .unwrap_or_else(|| "network-error".to_string()),
            latency_us,
        };
    }
    Transit::Delivered {
        latency_us,
        throttled: effects.bandwidth_mbps.is_some(),
    }
}

/// Latency of the response path; responses are never lost.
pub fn return_latency_us(
    edge: &EdgeDefinition,
    effects: &FaultEffects,
    rng: &mut DeterministicRng,
) -> u64 {
    archsim_types::millis_to_micros(one_way_ms(edge, effects, rng))
}

fn one_way_ms(edge: &EdgeDefinition, effects: &FaultEffects, rng: &mut DeterministicRng) -> f64 {
    let mut ms = distribution::sample(&edge.network.latency, rng).max(0.0);
    if let Some(jitter) = &edge.network.jitter {
        ms = (ms + distribution::sample(jitter, rng)).max(0.0);
    }
    for extra in &effects.added_latency {
        ms += distribution::sample(extra, rng).max(0.0);
    }
    ms * effects.latency_factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use archsim_types::{BandwidthSpec, DistributionConfig};

    fn edge() -> EdgeDefinition {
        EdgeDefinition::new("e", "a", "b").with_latency(DistributionConfig::constant(2.0))
    }

    #[test]
    fn test_constant_latency_delivery() {
        let mut rng = DeterministicRng::from_seed_str("net");
        let result = transit(&edge(), &FaultEffects::default(), false, 1024, &mut rng);
        assert_eq!(
            result,
            Transit::Delivered {
                latency_us: 2_000,
                throttled: false
            }
        );
    }

    #[test]
    fn test_bandwidth_adds_transfer_time() {
        let mut e = edge();
        // 1 Mbps: 1000 bytes = 8000 bits = 8 ms.
        e.network.bandwidth = Some(BandwidthSpec {
            limit_mbps: 1.0,
            burst_mbps: None,
        });
        let mut rng = DeterministicRng::from_seed_str("net");
        let result = transit(&e, &FaultEffects::default(), false, 1_000, &mut rng);
        assert_eq!(
            result,
            Transit::Delivered {
                latency_us: 10_000,
                throttled: false
            }
        );
    }

    #[test]
    fn test_total_loss_drops_and_partition_refuses() {
        let mut rng = DeterministicRng::from_seed_str("net");
        let effects = FaultEffects {
            packet_loss: 1.0,
            ..Default::default()
        };
        assert_eq!(transit(&edge(), &effects, false, 1, &mut rng), Transit::Dropped);
        assert_eq!(transit(&edge(), &effects, true, 1, &mut rng), Transit::Refused);
    }

    #[test]
    fn test_injected_edge_error() {
        let mut rng = DeterministicRng::from_seed_str("net");
        let mut effects = FaultEffects::default();
        effects.apply(&FaultSpec::Error {
            error_rate: 1.0,
            error_code: "503".into(),
        });
        assert_eq!(
            transit(&edge(), &effects, false, 1, &mut rng),
            Transit::Failed {
                error: "503".into(),
                latency_us: 2_000
            }
        );
    }
}
