//! Composed scenarios.
//!
//! A [`ScenarioPlan`] is a tree of step lists joined in sequence or in
//! parallel. Before the run it is compiled into a [`ScenarioTimeline`], a
//! flat list of operations linked by `next` pointers where parallel parts
//! become a fork and a counting join. The kernel walks the timeline one
//! `ScenarioStep` event at a time, so every step is an entry in the trace.

use archsim_core::{EventKind, EventPayload};
use archsim_types::{
    ComparisonOperator, ComponentId, ComposedScenario, DistributionConfig, FaultCondition,
    FaultId, FaultInjection, FaultScope, FaultSpec, InvariantCheck, InvariantType, RegionId,
    ScenarioStep, SimTime, SimulationInvariant, SloMetric, ViolationPolicy, WorkloadProfile,
};
use std::collections::BTreeMap;
use tracing::debug;

use crate::error::ConfigError;
use crate::event_queue::Followup;
use crate::fault;
use crate::graph::ArchitectureGraph;
use crate::snapshot::{condition_holds, validate_condition, MetricSource};

/// Poll period of `wait-for-condition` steps.
pub const CONDITION_POLL_MS: f64 = 100.0;

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Steps(Vec<ScenarioStep>),
    Seq(Vec<Node>),
    Par(Vec<Node>),
}

impl Node {
    fn visit<'a>(&'a self, out: &mut Vec<&'a ScenarioStep>) {
        match self {
            Node::Steps(steps) => out.extend(steps.iter()),
            Node::Seq(nodes) | Node::Par(nodes) => {
                for node in nodes {
                    node.visit(out);
                }
            }
        }
    }

    fn map_steps(&mut self, f: &mut impl FnMut(&mut ScenarioStep)) {
        match self {
            Node::Steps(steps) => steps.iter_mut().for_each(&mut *f),
            Node::Seq(nodes) | Node::Par(nodes) => {
                for node in nodes {
                    node.map_steps(f);
                }
            }
        }
    }
}

/// A scenario built from composed parts.
#[derive(Debug, Clone, PartialEq)]
pub struct ScenarioPlan {
    pub id: String,
    pub name: String,
    root: Node,
}

impl From<ComposedScenario> for ScenarioPlan {
    fn from(scenario: ComposedScenario) -> Self {
        Self {
            id: scenario.id,
            name: scenario.name,
            root: Node::Steps(scenario.steps),
        }
    }
}

impl ScenarioPlan {
    /// Run `next` after this plan has finished.
    pub fn then(self, next: impl Into<ScenarioPlan>) -> Self {
        let next = next.into();
        Self {
            id: format!("{}+{}", self.id, next.id),
            name: format!("{} then {}", self.name, next.name),
            root: Node::Seq(vec![self.root, next.root]),
        }
    }

    /// Run `other` alongside this plan. The result finishes when both have.
    pub fn parallel(self, other: impl Into<ScenarioPlan>) -> Self {
        Self::combine(vec![self, other.into()])
    }

    /// Run every plan at once.
    pub fn combine(plans: Vec<ScenarioPlan>) -> Self {
        let id = plans
            .iter()
            .map(|p| p.id.as_str())
            .collect::<Vec<_>>()
            .join("|");
        let name = plans
            .iter()
            .map(|p| p.name.as_str())
            .collect::<Vec<_>>()
            .join(" with ");
        Self {
            id,
            name,
            root: Node::Par(plans.into_iter().map(|p| p.root).collect()),
        }
    }

    /// Run this plan `times` times back to back.
    ///
    /// Fault ids of the copies after the first are suffixed with `#n` so the
    /// injections stay distinct.
    pub fn repeat(self, times: usize) -> Self {
        let copies = (0..times.max(1))
            .map(|n| {
                let mut root = self.root.clone();
                if n > 0 {
                    root.map_steps(&mut |step| {
                        if let ScenarioStep::InjectFault { fault } = step {
                            fault.id = FaultId::new(format!("{}#{n}", fault.id.as_str()));
                        }
                    });
                }
                root
            })
            .collect();
        Self {
            id: format!("{}x{}", self.id, times.max(1)),
            name: self.name,
            root: Node::Seq(copies),
        }
    }

    /// Every step in declaration order.
    pub fn steps(&self) -> Vec<&ScenarioStep> {
        let mut out = Vec::new();
        self.root.visit(&mut out);
        out
    }

    /// Check every step against the architecture.
    ///
    /// Invariants in `assert` steps are compiled by the invariant checker
    /// and are not checked here.
    pub fn validate(&self, graph: &ArchitectureGraph) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidScenario {
            scenario: self.id.clone(),
            reason,
        };
        let mut faults: Vec<&FaultId> = Vec::new();
        for step in self.steps() {
            match step {
                ScenarioStep::InjectFault { fault } => {
                    fault::validate(fault, graph)?;
                    if faults.contains(&&fault.id) {
                        return Err(invalid(format!(
                            "fault {} injected twice",
                            fault.id.as_str()
                        )));
                    }
                    faults.push(&fault.id);
                }
                ScenarioStep::Wait { duration_ms } => {
                    if !duration_ms.is_finite() || *duration_ms < 0.0 {
                        return Err(invalid(format!("wait of {duration_ms}ms")));
                    }
                }
                ScenarioStep::WaitForCondition {
                    condition,
                    timeout_ms,
                } => {
                    validate_condition(condition)?;
                    if !timeout_ms.is_finite() || *timeout_ms < 0.0 {
                        return Err(invalid(format!("condition timeout of {timeout_ms}ms")));
                    }
                    if let Some(id) = &condition.component_id {
                        known(graph, id).map_err(invalid)?;
                    }
                }
                ScenarioStep::ChangeTraffic { new_workload } => {
                    new_workload.validate().map_err(ConfigError::InvalidWorkload)?;
                }
                ScenarioStep::Deploy {
                    component_id,
                    new_version,
                } => {
                    known(graph, component_id).map_err(invalid)?;
                    if new_version.trim().is_empty() {
                        return Err(invalid("deploy without a version".to_string()));
                    }
                }
                ScenarioStep::Scale {
                    component_id,
                    replicas,
                } => {
                    known(graph, component_id).map_err(invalid)?;
                    if *replicas == 0 {
                        return Err(invalid(format!(
                            "scale of {} to zero replicas",
                            component_id.as_str()
                        )));
                    }
                }
                ScenarioStep::Assert { .. } => {}
            }
        }
        Ok(())
    }

    /// Fault ids this plan injects.
    pub fn fault_ids(&self) -> Vec<&FaultId> {
        self.steps()
            .into_iter()
            .filter_map(|step| match step {
                ScenarioStep::InjectFault { fault } => Some(&fault.id),
                _ => None,
            })
            .collect()
    }

    /// Invariants this plan asserts.
    pub fn invariants(&self) -> Vec<&SimulationInvariant> {
        self.steps()
            .into_iter()
            .filter_map(|step| match step {
                ScenarioStep::Assert { invariant } => Some(invariant),
                _ => None,
            })
            .collect()
    }

    pub fn compile(&self) -> ScenarioTimeline {
        let mut ops = Vec::new();
        let entry = emit(&self.root, None, &mut ops);
        ScenarioTimeline {
            id: self.id.clone(),
            ops,
            entry,
            arrivals: BTreeMap::new(),
            deadlines: BTreeMap::new(),
            finished: false,
        }
    }
}

fn known(graph: &ArchitectureGraph, id: &ComponentId) -> Result<(), String> {
    match graph.component(id) {
        Some(_) => Ok(()),
        None => Err(format!("unknown component {}", id.as_str())),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Op {
    Step(ScenarioStep),
    Fork(Vec<usize>),
    Join { expected: usize },
}

#[derive(Debug, Clone, PartialEq)]
struct Slot {
    op: Op,
    next: Option<usize>,
}

/// Lay out `node` so that it continues at `next`. Returns its entry point.
fn emit(node: &Node, next: Option<usize>, ops: &mut Vec<Slot>) -> Option<usize> {
    match node {
        Node::Steps(steps) => steps.iter().rev().fold(next, |next, step| {
            ops.push(Slot {
                op: Op::Step(step.clone()),
                next,
            });
            Some(ops.len() - 1)
        }),
        Node::Seq(nodes) => nodes
            .iter()
            .rev()
            .fold(next, |next, node| emit(node, next, ops)),
        Node::Par(nodes) if nodes.is_empty() => next,
        Node::Par(nodes) => {
            ops.push(Slot {
                op: Op::Join {
                    expected: nodes.len(),
                },
                next,
            });
            let join = ops.len() - 1;
            let branches = nodes
                .iter()
                .map(|node| emit(node, Some(join), ops).unwrap_or(join))
                .collect();
            ops.push(Slot {
                op: Op::Fork(branches),
                next: None,
            });
            Some(ops.len() - 1)
        }
    }
}

/// Something the kernel must do on behalf of a step.
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    InjectFault(FaultInjection),
    ChangeTraffic(WorkloadProfile),
    Deploy {
        component_id: ComponentId,
        new_version: String,
    },
    Scale {
        component_id: ComponentId,
        replicas: u32,
    },
    Assert(SimulationInvariant),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepResult {
    pub directives: Vec<Directive>,
    pub followups: Vec<Followup>,
}

/// A compiled scenario being walked by the kernel.
#[derive(Debug, Clone, PartialEq)]
pub struct ScenarioTimeline {
    id: String,
    ops: Vec<Slot>,
    entry: Option<usize>,
    arrivals: BTreeMap<usize, usize>,
    /// Deadlines of condition waits in progress.
    deadlines: BTreeMap<usize, SimTime>,
    finished: bool,
}

fn step_at(at: SimTime, index: usize) -> Followup {
    Followup::new(at, EventKind::ScenarioStep, EventPayload::Step { index })
}

impl ScenarioTimeline {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Whether the last step has run.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Component a step acts on, used as the target of its event.
    pub fn target_of(&self, index: usize) -> Option<&ComponentId> {
        match &self.ops.get(index)?.op {
            Op::Step(ScenarioStep::Deploy { component_id, .. })
            | Op::Step(ScenarioStep::Scale { component_id, .. }) => Some(component_id),
            Op::Step(ScenarioStep::WaitForCondition { condition, .. }) => {
                condition.component_id.as_ref()
            }
            _ => None,
        }
    }

    /// The first step, scheduled at `now`.
    pub fn start(&mut self, now: SimTime) -> Vec<Followup> {
        match self.entry {
            Some(index) => vec![self.followup(now, index)],
            None => {
                self.finished = true;
                Vec::new()
            }
        }
    }

    fn followup(&self, at: SimTime, index: usize) -> Followup {
        let step = step_at(at, index);
        match self.target_of(index) {
            Some(target) => step.on(target.clone()),
            None => step,
        }
    }

    fn proceed(&mut self, index: usize, at: SimTime, result: &mut StepResult) {
        match self.ops[index].next {
            Some(next) => result.followups.push(self.followup(at, next)),
            None => {
                debug!(scenario = %self.id, "scenario finished");
                self.finished = true;
            }
        }
    }

    /// Run the operation at `index`.
    pub fn advance(&mut self, index: usize, now: SimTime, metrics: &dyn MetricSource) -> StepResult {
        let mut result = StepResult::default();
        let Some(slot) = self.ops.get(index) else {
            return result;
        };
        match slot.op.clone() {
            Op::Fork(branches) => {
                for branch in branches {
                    result.followups.push(self.followup(now, branch));
                }
            }
            Op::Join { expected } => {
                let arrived = self.arrivals.entry(index).or_insert(0);
                *arrived += 1;
                if *arrived >= expected {
                    self.arrivals.remove(&index);
                    self.proceed(index, now, &mut result);
                }
            }
            Op::Step(ScenarioStep::Wait { duration_ms }) => {
                self.proceed(index, now.plus_millis(duration_ms), &mut result);
            }
            Op::Step(ScenarioStep::WaitForCondition {
                condition,
                timeout_ms,
            }) => {
                let deadline = *self
                    .deadlines
                    .entry(index)
                    .or_insert_with(|| now.plus_millis(timeout_ms));
                if condition_holds(&condition, metrics) {
                    self.deadlines.remove(&index);
                    self.proceed(index, now, &mut result);
                } else if now >= deadline {
                    debug!(
                        scenario = %self.id,
                        metric = %condition.metric,
                        "condition not met before timeout"
                    );
                    self.deadlines.remove(&index);
                    self.proceed(index, now, &mut result);
                } else {
                    let poll = now.plus_millis(CONDITION_POLL_MS).min(deadline);
                    result.followups.push(self.followup(poll, index));
                }
            }
            Op::Step(ScenarioStep::InjectFault { fault }) => {
                result.directives.push(Directive::InjectFault(fault));
                self.proceed(index, now, &mut result);
            }
            Op::Step(ScenarioStep::ChangeTraffic { new_workload }) => {
                result.directives.push(Directive::ChangeTraffic(new_workload));
                self.proceed(index, now, &mut result);
            }
            Op::Step(ScenarioStep::Deploy {
                component_id,
                new_version,
            }) => {
                result.directives.push(Directive::Deploy {
                    component_id,
                    new_version,
                });
                self.proceed(index, now, &mut result);
            }
            Op::Step(ScenarioStep::Scale {
                component_id,
                replicas,
            }) => {
                result.directives.push(Directive::Scale {
                    component_id,
                    replicas,
                });
                self.proceed(index, now, &mut result);
            }
            Op::Step(ScenarioStep::Assert { invariant }) => {
                result.directives.push(Directive::Assert(invariant));
                self.proceed(index, now, &mut result);
            }
        }
        result
    }
}

/// Ids of the built-in scenarios.
pub const BUILTIN_SCENARIOS: [&str; 6] = [
    "cache-stampede",
    "db-primary-crash",
    "network-partition",
    "auth-outage",
    "traffic-spike-cold-start",
    "rolling-deploy",
];

/// A ready-made scenario against conventionally named components.
///
/// Fault times are measured from the step that injects them.
pub fn builtin(id: &str) -> Option<ComposedScenario> {
    let scenario = match id {
        "cache-stampede" => ComposedScenario::new(id, "Cache stampede")
            .step(ScenarioStep::InjectFault {
                fault: FaultInjection::on_component(
                    "cache-flush",
                    "cache",
                    FaultSpec::ProcessCrash,
                    10_000.0,
                    1.0,
                ),
            })
            .step(ScenarioStep::Wait {
                duration_ms: 15_000.0,
            })
            .step(ScenarioStep::Assert {
                invariant: SimulationInvariant::new(
                    "origin-not-overloaded",
                    InvariantType::Slo,
                    InvariantCheck::Slo {
                        metric: SloMetric::LatencyP99,
                        threshold: 1_000.0,
                        window_ms: 5_000.0,
                    },
                    ViolationPolicy::Log,
                ),
            }),
        "db-primary-crash" => ComposedScenario::new(id, "Database primary crash")
            .step(ScenarioStep::Wait {
                duration_ms: 5_000.0,
            })
            .step(ScenarioStep::InjectFault {
                fault: FaultInjection::on_component(
                    "db-crash",
                    "db-primary",
                    FaultSpec::ProcessCrash,
                    0.0,
                    30_000.0,
                ),
            })
            .step(ScenarioStep::Wait {
                duration_ms: 35_000.0,
            })
            .step(ScenarioStep::Assert {
                invariant: SimulationInvariant::new(
                    "data-not-lost",
                    InvariantType::DataIntegrity,
                    InvariantCheck::Custom {
                        validator_code: "checkDataIntegrity()".into(),
                    },
                    ViolationPolicy::FailSimulation,
                ),
            }),
        "network-partition" => ComposedScenario::new(id, "Network partition")
            .step(ScenarioStep::InjectFault {
                fault: FaultInjection::on_component(
                    "region-split",
                    "db-cluster",
                    FaultSpec::NetworkPartition {
                        partition_with: vec!["region-b".into()],
                    },
                    10_000.0,
                    60_000.0,
                )
                .with_scope(FaultScope::Region {
                    region_id: RegionId::new("region-a"),
                }),
            })
            .step(ScenarioStep::Wait {
                duration_ms: 75_000.0,
            })
            .step(ScenarioStep::Assert {
                invariant: SimulationInvariant::new(
                    "no-split-brain",
                    InvariantType::Consistency,
                    InvariantCheck::Consistency {
                        expression: "no_write_conflicts".into(),
                        scope: "db-cluster".into(),
                    },
                    ViolationPolicy::FailSimulation,
                ),
            }),
        "auth-outage" => ComposedScenario::new(id, "Auth service outage")
            .step(ScenarioStep::InjectFault {
                fault: FaultInjection::on_component(
                    "auth-down",
                    "auth-service",
                    FaultSpec::Error {
                        error_rate: 1.0,
                        error_code: "503".into(),
                    },
                    5_000.0,
                    120_000.0,
                ),
            })
            .step(ScenarioStep::Wait {
                duration_ms: 125_000.0,
            }),
        "traffic-spike-cold-start" => ComposedScenario::new(id, "Traffic spike with cold starts")
            .step(ScenarioStep::ChangeTraffic {
                new_workload: WorkloadProfile::Spike {
                    base_rps: 100.0,
                    spike_rps: 1_000.0,
                    spike_start_ms: 5_000.0,
                    spike_duration_ms: 60_000.0,
                    ramp_up_ms: Some(1_000.0),
                    ramp_down_ms: None,
                },
            })
            .step(ScenarioStep::Wait {
                duration_ms: 70_000.0,
            })
            .step(ScenarioStep::Assert {
                invariant: SimulationInvariant::new(
                    "autoscale-handled",
                    InvariantType::Slo,
                    InvariantCheck::Slo {
                        metric: SloMetric::LatencyP99,
                        threshold: 500.0,
                        window_ms: 60_000.0,
                    },
                    ViolationPolicy::Log,
                ),
            }),
        "rolling-deploy" => ComposedScenario::new(id, "Rolling deploy under load")
            .step(ScenarioStep::Deploy {
                component_id: "api".into(),
                new_version: "v2".into(),
            })
            .step(ScenarioStep::WaitForCondition {
                condition: FaultCondition {
                    metric: "ready_replicas".into(),
                    operator: ComparisonOperator::Gte,
                    value: 1.0,
                    component_id: Some("api".into()),
                },
                timeout_ms: 30_000.0,
            })
            .step(ScenarioStep::InjectFault {
                fault: FaultInjection::on_component(
                    "v2-latency",
                    "api",
                    FaultSpec::Latency {
                        added_ms: DistributionConfig::exponential_mean(50.0),
                    },
                    0.0,
                    20_000.0,
                ),
            })
            .step(ScenarioStep::Wait {
                duration_ms: 20_000.0,
            }),
        _ => return None,
    };
    Some(scenario)
}

/// Ready-made scenarios whose steps only touch components in `graph`.
pub fn applicable_builtins(graph: &ArchitectureGraph) -> Vec<ComposedScenario> {
    BUILTIN_SCENARIOS
        .iter()
        .filter_map(|id| builtin(id))
        .filter(|scenario| ScenarioPlan::from(scenario.clone()).validate(graph).is_ok())
        .collect()
}
