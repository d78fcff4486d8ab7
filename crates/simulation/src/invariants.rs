//! Invariant checking.
//!
//! Idempotency, message ordering and security rules are checked as the
//! events that could break them happen. SLO invariants are checked every
//! `windowMs`; consistency and custom expressions once per
//! [`CHECK_INTERVAL_MS`]. Everything periodic is checked once more when the
//! run ends.
//!
//! A violation is recorded under the invariant's policy: `log` and `alert`
//! only annotate the output, `fail-simulation` asks the kernel to stop.

use archsim_core::{CheckTarget, EventKind, EventPayload, InvariantViolation, Request};
use archsim_types::{
    ComponentId, InvariantCheck, InvariantId, SimTime, SimulationInvariant, SloMetric,
    ViolationPolicy,
};
use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::error::ConfigError;
use crate::event_queue::Followup;
use crate::expression::{Expr, Predicates};
use crate::graph::ArchitectureGraph;
use crate::snapshot::{Metric, MetricSource};

/// Period of expression checks.
pub const CHECK_INTERVAL_MS: f64 = 1_000.0;

/// What a check can see besides the event that triggered it.
pub struct CheckContext<'a> {
    pub now: SimTime,
    pub metrics: &'a dyn MetricSource,
    /// Faults and failure modes active right now, used as the root cause.
    pub active_causes: &'a [String],
}

impl CheckContext<'_> {
    fn root_cause(&self) -> Option<String> {
        (!self.active_causes.is_empty()).then(|| self.active_causes.join(", "))
    }
}

/// A `fail-simulation` violation that stopped the run.
#[derive(Debug, Clone, PartialEq)]
pub struct Abort {
    pub invariant: InvariantId,
    pub at: SimTime,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SecurityRule {
    /// Components requiring auth only see authenticated requests.
    AuthRequired,
    /// Calls respect the target's allow and deny lists.
    NetworkPolicy,
}

#[derive(Debug, Clone)]
enum Compiled {
    Idempotency {
        scope: Option<ComponentId>,
        key_path: String,
        applied: BTreeMap<String, SimTime>,
    },
    Ordering {
        topic: ComponentId,
        allowed_us: u64,
        /// Latest send time delivered per ordering key.
        latest: BTreeMap<String, SimTime>,
    },
    Slo {
        metric: SloMetric,
        threshold: f64,
        window_ms: f64,
    },
    Expression {
        expr: Expr,
        scope: Option<ComponentId>,
    },
    Security {
        rule: SecurityRule,
        scope: Vec<ComponentId>,
    },
}

#[derive(Debug, Clone)]
struct Entry {
    def: SimulationInvariant,
    compiled: Compiled,
    reported: u32,
    suppressed: u64,
}

impl Entry {
    fn in_scope(scope: &[ComponentId], component: &ComponentId) -> bool {
        scope.is_empty() || scope.contains(component)
    }
}

#[derive(Debug, Clone)]
pub struct InvariantChecker {
    entries: Vec<Entry>,
    predicates: Predicates,
    max_per_invariant: u32,
    violations: Vec<InvariantViolation>,
    abort: Option<Abort>,
}

/// `scope` strings meaning "every component".
fn global_scope(scope: &str) -> bool {
    matches!(scope.trim(), "" | "*" | "global" | "all" | "system")
}

impl InvariantChecker {
    pub fn new(
        invariants: &[SimulationInvariant],
        graph: &ArchitectureGraph,
        predicates: Predicates,
        max_per_invariant: u32,
    ) -> Result<Self, ConfigError> {
        let mut entries: Vec<Entry> = Vec::with_capacity(invariants.len());
        for def in invariants {
            if entries.iter().any(|e| e.def.id == def.id) {
                return Err(invalid(def, "duplicate invariant id"));
            }
            entries.push(Entry {
                def: def.clone(),
                compiled: compile(def, graph, &predicates)?,
                reported: 0,
                suppressed: 0,
            });
        }
        Ok(Self {
            entries,
            predicates,
            max_per_invariant,
            violations: Vec::new(),
            abort: None,
        })
    }

    /// Check that `def` would be accepted, without installing it.
    pub fn validate(
        &self,
        def: &SimulationInvariant,
        graph: &ArchitectureGraph,
    ) -> Result<(), ConfigError> {
        compile(def, graph, &self.predicates).map(|_| ())
    }

    /// Install `def` mid-run, or re-check it if already installed.
    ///
    /// Periodic invariants are evaluated immediately; the returned events
    /// continue checking them from `ctx.now`.
    pub fn activate(
        &mut self,
        def: &SimulationInvariant,
        graph: &ArchitectureGraph,
        ctx: &CheckContext<'_>,
    ) -> Result<Vec<Followup>, ConfigError> {
        if let Some(index) = self.entries.iter().position(|e| e.def.id == def.id) {
            self.evaluate(index, ctx);
            return Ok(Vec::new());
        }
        let had_expressions = self
            .entries
            .iter()
            .any(|e| matches!(e.compiled, Compiled::Expression { .. }));
        let compiled = compile(def, graph, &self.predicates)?;
        self.entries.push(Entry {
            def: def.clone(),
            compiled,
            reported: 0,
            suppressed: 0,
        });
        let index = self.entries.len() - 1;
        self.evaluate(index, ctx);

        let mut followups = Vec::new();
        match self.entries[index].compiled {
            Compiled::Slo { window_ms, .. } => followups.push(check_at(
                ctx.now.plus_millis(window_ms),
                CheckTarget::Invariant {
                    invariant: def.id.clone(),
                },
            )),
            Compiled::Expression { .. } if !had_expressions => followups.push(check_at(
                ctx.now.plus_millis(CHECK_INTERVAL_MS),
                CheckTarget::Invariants,
            )),
            _ => {}
        }
        Ok(followups)
    }

    fn evaluate(&mut self, index: usize, ctx: &CheckContext<'_>) {
        match self.entries[index].compiled {
            Compiled::Slo { .. } => self.evaluate_slo(index, ctx),
            Compiled::Expression { .. } => self.evaluate_expression(index, ctx),
            _ => {}
        }
    }

    /// First check of every SLO invariant, and of the expression set.
    pub fn initial_schedule(&self) -> Vec<Followup> {
        let mut followups = Vec::new();
        for entry in &self.entries {
            if let Compiled::Slo { window_ms, .. } = entry.compiled {
                followups.push(check_at(
                    SimTime::ZERO.plus_millis(window_ms),
                    CheckTarget::Invariant {
                        invariant: entry.def.id.clone(),
                    },
                ));
            }
        }
        if self
            .entries
            .iter()
            .any(|e| matches!(e.compiled, Compiled::Expression { .. }))
        {
            followups.push(check_at(
                SimTime::ZERO.plus_millis(CHECK_INTERVAL_MS),
                CheckTarget::Invariants,
            ));
        }
        followups
    }

    pub fn abort(&self) -> Option<&Abort> {
        self.abort.as_ref()
    }

    #[cfg(test)]
    pub fn violations(&self) -> &[InvariantViolation] {
        &self.violations
    }

    pub fn into_violations(self) -> Vec<InvariantViolation> {
        self.violations
    }

    /// Violations beyond the per-invariant cap, which were counted but not
    /// recorded.
    pub fn suppressed(&self) -> u64 {
        self.entries.iter().map(|e| e.suppressed).sum()
    }

    /// A write was applied to durable state at `component`.
    pub fn on_write(&mut self, component: &ComponentId, request: &Request, ctx: &CheckContext<'_>) {
        for index in 0..self.entries.len() {
            let Compiled::Idempotency {
                scope,
                key_path,
                applied,
            } = &mut self.entries[index].compiled
            else {
                continue;
            };
            if scope.as_ref().is_some_and(|s| s != component) {
                continue;
            }
            let key = request
                .attribute(key_path)
                .map(str::to_string)
                .unwrap_or_else(|| request.id.to_string());
            let scoped_key = format!("{}/{}", component.as_str(), key);
            if let Some(first) = applied.get(&scoped_key).copied() {
                let details = format!(
                    "write with key {key} applied again at {} (first applied at {first})",
                    component.as_str()
                );
                self.report(index, details, vec![component.clone()], ctx);
            } else {
                applied.insert(scoped_key, ctx.now);
            }
        }
    }

    /// A message was handed to a consumer of `event`'s topic.
    pub fn on_delivery(&mut self, payload: &EventPayload, ctx: &CheckContext<'_>) {
        let EventPayload::Message {
            topic,
            ordering_key: Some(ordering_key),
            sent_at,
            ..
        } = payload
        else {
            return;
        };
        for index in 0..self.entries.len() {
            let Compiled::Ordering {
                topic: watched,
                allowed_us,
                latest,
            } = &mut self.entries[index].compiled
            else {
                continue;
            };
            if watched != topic {
                continue;
            }
            match latest.get(ordering_key).copied() {
                Some(newest) if newest.micros_since(*sent_at) > *allowed_us => {
                    let details = format!(
                        "message of key {ordering_key} sent at {sent_at} delivered after one sent at {newest}"
                    );
                    self.report(index, details, vec![topic.clone()], ctx);
                }
                Some(newest) if newest >= *sent_at => {}
                _ => {
                    latest.insert(ordering_key.clone(), *sent_at);
                }
            }
        }
    }

    /// A call reached `component`.
    pub fn on_arrival(
        &mut self,
        component: &ComponentId,
        caller: Option<&ComponentId>,
        request: &Request,
        graph: &ArchitectureGraph,
        ctx: &CheckContext<'_>,
    ) {
        let Some(def) = graph.component(component) else {
            return;
        };
        for index in 0..self.entries.len() {
            let Compiled::Security { rule, scope } = &self.entries[index].compiled else {
                continue;
            };
            if !Entry::in_scope(scope, component) {
                continue;
            }
            let details = match rule {
                SecurityRule::AuthRequired
                    if def.security.auth_required && !request.authenticated =>
                {
                    format!(
                        "{} reached {} without authentication",
                        request.id,
                        component.as_str()
                    )
                }
                SecurityRule::NetworkPolicy => {
                    let Some(caller) = caller else { continue };
                    let permitted = def
                        .security
                        .network_policies
                        .as_ref()
                        .map_or(true, |policies| policies.permits(caller));
                    if permitted {
                        continue;
                    }
                    format!(
                        "{} called {} against its network policy",
                        caller.as_str(),
                        component.as_str()
                    )
                }
                _ => continue,
            };
            let mut affected = vec![component.clone()];
            affected.extend(caller.cloned());
            self.report(index, details, affected, ctx);
        }
    }

    /// Periodic check of one SLO invariant. Returns the next check.
    pub fn check_slo(&mut self, id: &InvariantId, ctx: &CheckContext<'_>) -> Option<Followup> {
        let index = self.entries.iter().position(|e| &e.def.id == id)?;
        let Compiled::Slo { window_ms, .. } = self.entries[index].compiled else {
            return None;
        };
        self.evaluate_slo(index, ctx);
        Some(check_at(
            ctx.now.plus_millis(window_ms),
            CheckTarget::Invariant {
                invariant: id.clone(),
            },
        ))
    }

    /// Periodic check of every expression invariant. Returns the next check.
    pub fn check_expressions(&mut self, ctx: &CheckContext<'_>) -> Followup {
        self.evaluate_expressions(ctx);
        check_at(ctx.now.plus_millis(CHECK_INTERVAL_MS), CheckTarget::Invariants)
    }

    /// Final check of everything periodic.
    pub fn check_end(&mut self, ctx: &CheckContext<'_>) {
        for index in 0..self.entries.len() {
            if matches!(self.entries[index].compiled, Compiled::Slo { .. }) {
                self.evaluate_slo(index, ctx);
            }
        }
        self.evaluate_expressions(ctx);
    }

    fn evaluate_slo(&mut self, index: usize, ctx: &CheckContext<'_>) {
        let Compiled::Slo {
            metric, threshold, ..
        } = self.entries[index].compiled
        else {
            return;
        };
        let (value, breached, unit) = match metric {
            SloMetric::LatencyP95 | SloMetric::LatencyP99 => {
                let m = if metric == SloMetric::LatencyP95 {
                    Metric::LatencyP95
                } else {
                    Metric::LatencyP99
                };
                let Some(v) = ctx.metrics.metric(m, None) else {
                    return;
                };
                (v, v > threshold, "ms")
            }
            SloMetric::ErrorRate => {
                let Some(v) = ctx.metrics.metric(Metric::ErrorRate, None) else {
                    return;
                };
                (v, v > threshold, "")
            }
            SloMetric::Availability => {
                let Some(v) = ctx.metrics.metric(Metric::Available, None) else {
                    return;
                };
                // Thresholds are accepted as a fraction or a percentage.
                let target = if threshold > 1.0 { threshold / 100.0 } else { threshold };
                (v, v < target, "")
            }
        };
        if breached {
            let details = format!("{metric:?} at {value:.4}{unit} against threshold {threshold}{unit}");
            self.report(index, details, Vec::new(), ctx);
        }
    }

    fn evaluate_expressions(&mut self, ctx: &CheckContext<'_>) {
        for index in 0..self.entries.len() {
            self.evaluate_expression(index, ctx);
        }
    }

    fn evaluate_expression(&mut self, index: usize, ctx: &CheckContext<'_>) {
        let Compiled::Expression { expr, scope } = &self.entries[index].compiled else {
            return;
        };
        let holds = expr.holds(ctx.now, scope.as_ref(), ctx.metrics, &self.predicates);
        if holds != Some(false) {
            return;
        }
        let source = match &self.entries[index].def.check {
            InvariantCheck::Consistency { expression, .. } => expression.clone(),
            InvariantCheck::Custom { validator_code } => validator_code.clone(),
            _ => String::new(),
        };
        let mut affected: Vec<ComponentId> = expr.components().into_iter().cloned().collect();
        affected.extend(scope.iter().cloned());
        affected.sort();
        affected.dedup();
        self.report(index, format!("`{source}` does not hold"), affected, ctx);
    }

    fn report(
        &mut self,
        index: usize,
        details: String,
        affected_components: Vec<ComponentId>,
        ctx: &CheckContext<'_>,
    ) {
        let entry = &mut self.entries[index];
        let policy = entry.def.on_violation;
        if policy == ViolationPolicy::FailSimulation && self.abort.is_none() {
            self.abort = Some(Abort {
                invariant: entry.def.id.clone(),
                at: ctx.now,
                reason: details.clone(),
            });
        }
        if entry.reported >= self.max_per_invariant {
            entry.suppressed += 1;
            return;
        }
        entry.reported += 1;
        match policy {
            ViolationPolicy::Alert | ViolationPolicy::FailSimulation => warn!(
                invariant = entry.def.id.as_str(),
                at = %ctx.now,
                details = details.as_str(),
                "invariant violated"
            ),
            ViolationPolicy::Log => info!(
                invariant = entry.def.id.as_str(),
                at = %ctx.now,
                details = details.as_str(),
                "invariant violated"
            ),
        }
        self.violations.push(InvariantViolation {
            invariant_id: entry.def.id.clone(),
            invariant_name: entry.def.name.clone(),
            violated_at: ctx.now.as_millis_f64(),
            details,
            root_cause: ctx.root_cause(),
            affected_components,
            policy,
        });
    }
}

fn compile(
    def: &SimulationInvariant,
    graph: &ArchitectureGraph,
    predicates: &Predicates,
) -> Result<Compiled, ConfigError> {
    let known = |id: &ComponentId| -> Result<(), ConfigError> {
        if graph.component(id).is_some() {
            Ok(())
        } else {
            Err(invalid(def, &format!("unknown component {}", id.as_str())))
        }
    };
    let compiled = match &def.check {
        InvariantCheck::Idempotency {
            scope,
            key_extractor,
        } => {
            let scope = (!global_scope(scope)).then(|| ComponentId::new(scope.trim()));
            if let Some(id) = &scope {
                known(id)?;
            }
            if key_extractor.trim().is_empty() {
                return Err(invalid(def, "empty key extractor"));
            }
            Compiled::Idempotency {
                scope,
                key_path: key_extractor.trim().to_string(),
                applied: BTreeMap::new(),
            }
        }
        InvariantCheck::CausalOrdering {
            topic,
            allowed_reordering_ms,
            ..
        } => {
            let topic = ComponentId::new(topic.as_str());
            known(&topic)?;
            if !allowed_reordering_ms.is_finite() || *allowed_reordering_ms < 0.0 {
                return Err(invalid(def, "allowedReorderingMs must be non-negative"));
            }
            Compiled::Ordering {
                topic,
                allowed_us: archsim_types::millis_to_micros(*allowed_reordering_ms),
                latest: BTreeMap::new(),
            }
        }
        InvariantCheck::Slo {
            metric,
            threshold,
            window_ms,
        } => {
            if !window_ms.is_finite() || *window_ms <= 0.0 {
                return Err(invalid(def, "windowMs must be positive"));
            }
            if !threshold.is_finite() || *threshold < 0.0 {
                return Err(invalid(def, "threshold must be non-negative"));
            }
            Compiled::Slo {
                metric: *metric,
                threshold: *threshold,
                window_ms: *window_ms,
            }
        }
        InvariantCheck::Consistency { expression, scope } => {
            let expr =
                Expr::compile(expression, predicates).map_err(|reason| invalid(def, &reason))?;
            let scope = (!global_scope(scope)).then(|| ComponentId::new(scope.trim()));
            for id in expr.components().into_iter().chain(scope.as_ref()) {
                known(id)?;
            }
            Compiled::Expression { expr, scope }
        }
        InvariantCheck::Custom { validator_code } => {
            let expr = Expr::compile(validator_code, predicates)
                .map_err(|reason| invalid(def, &reason))?;
            for id in expr.components() {
                known(id)?;
            }
            Compiled::Expression { expr, scope: None }
        }
        InvariantCheck::Security { rule, scope } => {
            let rule = match rule.as_str() {
                "no-request-without-auth" | "auth-required" => SecurityRule::AuthRequired,
                "network-policy" | "network-policies" => SecurityRule::NetworkPolicy,
                other => return Err(invalid(def, &format!("unknown security rule {other}"))),
            };
            let scope: Vec<ComponentId> = scope
                .iter()
                .filter(|s| !global_scope(s))
                .map(|s| ComponentId::new(s.trim()))
                .collect();
            for id in &scope {
                known(id)?;
            }
            Compiled::Security { rule, scope }
        }
    };
    Ok(compiled)
}

fn invalid(def: &SimulationInvariant, reason: &str) -> ConfigError {
    ConfigError::InvalidInvariant {
        invariant: def.id.clone(),
        reason: reason.to_string(),
    }
}

fn check_at(at: SimTime, target: CheckTarget) -> Followup {
    Followup::new(at, EventKind::InvariantCheck, EventPayload::Check { target })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::StaticMetrics;
    use archsim_core::{Operation, RequestSpec};
    use archsim_types::{
        CallId, ComponentDefinition, ComponentType, InvariantType, NetworkPolicies, RequestId,
        SystemArchitecture,
    };

    fn graph() -> ArchitectureGraph {
        let mut db = ComponentDefinition::new("db", ComponentType::RelationalDb);
        db.security.network_policies = Some(NetworkPolicies {
            allow_from: vec![ComponentId::new("api")],
            deny_from: Vec::new(),
        });
        let mut api = ComponentDefinition::new("api", ComponentType::Microservice);
        api.security.auth_required = true;
        ArchitectureGraph::new(
            SystemArchitecture::new("inv")
                .with_component(api)
                .with_component(db)
                .with_component(ComponentDefinition::new("q", ComponentType::Queue))
                .with_component(ComponentDefinition::new("batch", ComponentType::Microservice)),
        )
        .unwrap()
    }

    fn checker(check: InvariantCheck, policy: ViolationPolicy) -> InvariantChecker {
        let invariant = SimulationInvariant::new("inv-1", InvariantType::Custom, check, policy);
        InvariantChecker::new(&[invariant], &graph(), Predicates::default(), 100).unwrap()
    }

    fn request(id: u64) -> Request {
        let spec = RequestSpec {
            op: Operation::Write,
            key: "k1".into(),
            user: "u1".into(),
            size_bytes: 0,
            request_type: None,
            metadata: Default::default(),
        };
        Request::new(RequestId(id), SimTime::ZERO, spec, CallId(id))
    }

    fn ctx<'a>(now_ms: u64, metrics: &'a StaticMetrics) -> CheckContext<'a> {
        CheckContext {
            now: SimTime::from_millis(now_ms),
            metrics,
            active_causes: &[],
        }
    }

    #[test]
    fn test_duplicate_write_violates_idempotency() {
        let mut c = checker(
            InvariantCheck::Idempotency {
                scope: "db".into(),
                key_extractor: "$.idempotencyKey".into(),
            },
            ViolationPolicy::Alert,
        );
        let metrics = StaticMetrics::new();
        let db = ComponentId::new("db");
        c.on_write(&db, &request(1), &ctx(10, &metrics));
        c.on_write(&db, &request(2), &ctx(20, &metrics));
        assert!(c.violations().is_empty());
        c.on_write(&db, &request(1), &ctx(30, &metrics));
        assert_eq!(c.violations().len(), 1);
        assert_eq!(c.violations()[0].violated_at, 30.0);
        assert!(c.abort().is_none());
    }

    #[test]
    fn test_reordered_delivery_beyond_allowance() {
        let mut c = checker(
            InvariantCheck::CausalOrdering {
                topic: "q".into(),
                ordering_key: "$.orderId".into(),
                allowed_reordering_ms: 5.0,
            },
            ViolationPolicy::Log,
        );
        let metrics = StaticMetrics::new();
        let message = |sent_ms: u64| EventPayload::Message {
            topic: ComponentId::new("q"),
            ordering_key: Some("order-1".into()),
            sent_at: SimTime::from_millis(sent_ms),
            receives: 1,
        };
        c.on_delivery(&message(100), &ctx(110, &metrics));
        c.on_delivery(&message(97), &ctx(111, &metrics));
        assert!(c.violations().is_empty(), "within allowance");
        c.on_delivery(&message(50), &ctx(112, &metrics));
        assert_eq!(c.violations().len(), 1);
    }

    #[test]
    fn test_fail_simulation_sets_abort() {
        let mut c = checker(
            InvariantCheck::Slo {
                metric: SloMetric::ErrorRate,
                threshold: 0.1,
                window_ms: 1_000.0,
            },
            ViolationPolicy::FailSimulation,
        );
        let initial = c.initial_schedule();
        assert_eq!(initial.len(), 1);
        assert_eq!(initial[0].at, SimTime::from_millis(1_000));

        let healthy = StaticMetrics::new().with(Metric::ErrorRate, None, 0.05);
        let next = c.check_slo(&InvariantId::new("inv-1"), &ctx(1_000, &healthy));
        assert_eq!(next.map(|f| f.at), Some(SimTime::from_millis(2_000)));
        assert!(c.abort().is_none());

        let failing = StaticMetrics::new().with(Metric::ErrorRate, None, 0.4);
        c.check_slo(&InvariantId::new("inv-1"), &ctx(2_000, &failing));
        let abort = c.abort().unwrap();
        assert_eq!(abort.invariant, InvariantId::new("inv-1"));
        assert_eq!(abort.at, SimTime::from_millis(2_000));
    }

    #[test]
    fn test_security_rules() {
        let mut c = checker(
            InvariantCheck::Security {
                rule: "no-request-without-auth".into(),
                scope: Vec::new(),
            },
            ViolationPolicy::Log,
        );
        let metrics = StaticMetrics::new();
        let g = graph();
        let mut req = request(1);
        c.on_arrival(&ComponentId::new("api"), None, &req, &g, &ctx(1, &metrics));
        assert_eq!(c.violations().len(), 1);
        req.authenticated = true;
        c.on_arrival(&ComponentId::new("api"), None, &req, &g, &ctx(2, &metrics));
        assert_eq!(c.violations().len(), 1);

        let mut c = checker(
            InvariantCheck::Security {
                rule: "network-policy".into(),
                scope: vec!["db".into()],
            },
            ViolationPolicy::Log,
        );
        let db = ComponentId::new("db");
        c.on_arrival(&db, Some(&ComponentId::new("api")), &req, &g, &ctx(3, &metrics));
        assert!(c.violations().is_empty());
        c.on_arrival(&db, Some(&ComponentId::new("batch")), &req, &g, &ctx(4, &metrics));
        assert_eq!(c.violations().len(), 1);
        assert_eq!(c.violations()[0].affected_components.len(), 2);
    }

    #[test]
    fn test_expression_with_root_cause_and_cap() {
        let invariant = SimulationInvariant::new(
            "consistency",
            InvariantType::Consistency,
            InvariantCheck::Consistency {
                expression: "no_write_conflicts".into(),
                scope: "db".into(),
            },
            ViolationPolicy::Log,
        );
        let mut c =
            InvariantChecker::new(&[invariant], &graph(), Predicates::default(), 2).unwrap();
        let metrics = StaticMetrics::new().with(Metric::WriteConflicts, Some("db"), 1.0);
        let causes = vec!["fault db-partition".to_string()];
        for now in 1..=4 {
            c.check_expressions(&CheckContext {
                now: SimTime::from_millis(now * 1_000),
                metrics: &metrics,
                active_causes: &causes,
            });
        }
        assert_eq!(c.violations().len(), 2);
        assert_eq!(c.suppressed(), 2);
        assert_eq!(
            c.violations()[0].root_cause.as_deref(),
            Some("fault db-partition")
        );
    }

    #[test]
    fn test_activate_mid_run() {
        let mut c = InvariantChecker::new(&[], &graph(), Predicates::default(), 10).unwrap();
        let slo = SimulationInvariant::new(
            "p99",
            InvariantType::Slo,
            InvariantCheck::Slo {
                metric: SloMetric::LatencyP99,
                threshold: 200.0,
                window_ms: 5_000.0,
            },
            ViolationPolicy::Log,
        );
        let slow = StaticMetrics::new().with(Metric::LatencyP99, None, 900.0);
        let followups = c.activate(&slo, &graph(), &ctx(12_000, &slow)).unwrap();
        assert_eq!(c.violations().len(), 1, "checked on activation");
        assert_eq!(followups.len(), 1);
        assert_eq!(followups[0].at, SimTime::from_millis(17_000));

        // Asserting the same invariant again re-checks it without a new chain.
        let followups = c.activate(&slo, &graph(), &ctx(13_000, &slow)).unwrap();
        assert!(followups.is_empty());
        assert_eq!(c.violations().len(), 2);
    }

    #[test]
    fn test_rejects_bad_definitions() {
        let bad = [
            InvariantCheck::Consistency {
                expression: "stale_reads(nowhere) == 0".into(),
                scope: "".into(),
            },
            InvariantCheck::Security {
                rule: "vibes".into(),
                scope: Vec::new(),
            },
            InvariantCheck::Slo {
                metric: SloMetric::LatencyP99,
                threshold: 100.0,
                window_ms: 0.0,
            },
            InvariantCheck::Custom {
                validator_code: "undefinedCheck()".into(),
            },
        ];
        for check in bad {
            let invariant =
                SimulationInvariant::new("bad", InvariantType::Custom, check, ViolationPolicy::Log);
            assert!(matches!(
                InvariantChecker::new(&[invariant], &graph(), Predicates::default(), 10),
                Err(ConfigError::InvalidInvariant { .. })
            ));
        }
    }
}
