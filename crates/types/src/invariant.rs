//! Invariants checked while a simulation runs.

use crate::identifiers::InvariantId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InvariantType {
    Idempotency,
    CausalOrdering,
    Consistency,
    Security,
    Slo,
    DataIntegrity,
    Custom,
}

/// What happens when an invariant is violated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ViolationPolicy {
    #[default]
    Log,
    Alert,
    /// Stop the run and mark the output as aborted.
    FailSimulation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SloMetric {
    LatencyP95,
    LatencyP99,
    ErrorRate,
    Availability,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum InvariantCheck {
    /// Writes with the same key must not be applied twice at `scope`.
    Idempotency {
        scope: String,
        /// Path to the key in request attributes, e.g. `$.idempotencyKey`.
        key_extractor: String,
    },
    /// Messages of one ordering key must leave `topic` in send order.
    CausalOrdering {
        topic: String,
        ordering_key: String,
        allowed_reordering_ms: f64,
    },
    /// `metric(component) op value`, or a named check such as
    /// `no_write_conflicts`.
    Consistency { expression: String, scope: String },
    /// `no-request-without-auth` or `network-policy` over the scoped
    /// components.
    Security { rule: String, scope: Vec<String> },
    Slo {
        metric: SloMetric,
        threshold: f64,
        window_ms: f64,
    },
    /// A registered predicate, called by name (`checkDataIntegrity()`).
    Custom { validator_code: String },
}

/// A named invariant with its violation policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationInvariant {
    pub id: InvariantId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type")]
    pub invariant_type: InvariantType,
    pub check: InvariantCheck,
    #[serde(default)]
    pub on_violation: ViolationPolicy,
}

impl SimulationInvariant {
    pub fn new(
        id: impl Into<InvariantId>,
        invariant_type: InvariantType,
        check: InvariantCheck,
        on_violation: ViolationPolicy,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.as_str().to_string(),
            id,
            description: String::new(),
            invariant_type,
            check,
            on_violation,
        }
    }
}
