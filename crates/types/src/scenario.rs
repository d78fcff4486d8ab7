//! Composed scenarios: ordered steps over faults, traffic and assertions.

use crate::fault::{FaultCondition, FaultInjection};
use crate::identifiers::ComponentId;
use crate::invariant::SimulationInvariant;
use crate::workload::WorkloadProfile;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ScenarioStep {
    InjectFault {
        fault: FaultInjection,
    },
    Wait {
        duration_ms: f64,
    },
    WaitForCondition {
        condition: FaultCondition,
        timeout_ms: f64,
    },
    ChangeTraffic {
        new_workload: WorkloadProfile,
    },
    Deploy {
        component_id: ComponentId,
        new_version: String,
    },
    Scale {
        component_id: ComponentId,
        replicas: u32,
    },
    Assert {
        invariant: SimulationInvariant,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComposedScenario {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub steps: Vec<ScenarioStep>,
}

impl ComposedScenario {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            steps: Vec::new(),
        }
    }

    pub fn step(mut self, step: ScenarioStep) -> Self {
        self.steps.push(step);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_tags() {
        let json = r#"[
            {"type": "wait", "durationMs": 5000},
            {"type": "scale", "componentId": "api", "replicas": 4},
            {"type": "change-traffic", "newWorkload": {"type": "steady-state", "requestsPerSecond": 10}}
        ]"#;
        let steps: Vec<ScenarioStep> = serde_json::from_str(json).unwrap();
        assert_eq!(steps[0], ScenarioStep::Wait { duration_ms: 5000.0 });
        assert!(matches!(steps[1], ScenarioStep::Scale { replicas: 4, .. }));
        assert!(matches!(steps[2], ScenarioStep::ChangeTraffic { .. }));
    }
}
