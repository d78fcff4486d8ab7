//! Causal graph of failures, their effects and recoveries.
//!
//! Every drained event inherits the causal node of the event that scheduled
//! it. A failure observation with no causal ancestor becomes a root
//! `failure` node; one that descends from another node becomes an `effect`
//! linked by a `caused` edge. Recoveries close every open node on their
//! component through `mitigated` edges.

use archsim_core::{
    CausalEdge, CausalEdgeType, CausalGraph, CausalNode, CausalNodeType, Event, EventKind,
    EventPayload,
};
use archsim_types::{ComponentId, EventId, FaultId, SimTime};
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
struct OpenNode {
    id: String,
    kind: EventKind,
    component: ComponentId,
    root: bool,
    description: String,
}

#[derive(Debug, Clone, Default)]
pub struct CausalTracker {
    nodes: Vec<CausalNode>,
    edges: Vec<CausalEdge>,
    /// Causal node each event descends from.
    origin: BTreeMap<EventId, usize>,
    /// Fault-activation events whose children are the fault's observations.
    activations: BTreeMap<EventId, FaultId>,
    open: Vec<OpenNode>,
    by_fault: BTreeMap<FaultId, Vec<String>>,
    causes: Vec<String>,
}

fn is_failure(kind: EventKind) -> bool {
    use EventKind::*;
    matches!(
        kind,
        NodeFailure
            | NodeDegraded
            | NetworkPartition
            | LatencySpike
            | PacketLoss
            | BandwidthThrottle
            | CircuitOpen
            | DbFailover
            | QueueFull
            | CacheStampede
            | DbConnectionPoolExhausted
            | StorageFull
    )
}

fn is_recovery(kind: EventKind) -> bool {
    matches!(kind, EventKind::NodeRecovery | EventKind::CircuitClose)
}

impl CausalTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Descriptions of the root failures that are still open.
    pub fn active_causes(&self) -> &[String] {
        &self.causes
    }

    /// Record `event` as drained.
    pub fn observe(&mut self, event: &Event) {
        let inherited = event.caused_by.and_then(|p| self.origin.get(&p).copied());

        if event.kind == EventKind::FaultActivate {
            if let EventPayload::Fault { fault, .. } = &event.data {
                self.activations.insert(event.id, fault.clone());
            }
        }

        let Some(component) = event.target.clone().or_else(|| event.source.clone()) else {
            if let Some(node) = inherited {
                self.origin.insert(event.id, node);
            }
            return;
        };

        if is_recovery(event.kind) {
            self.recover(&component, event.time, &describe(event, &component));
            return;
        }

        if !is_failure(event.kind) {
            if let Some(node) = inherited {
                self.origin.insert(event.id, node);
            }
            return;
        }

        // One open node per kind and component.
        if let Some(existing) = self
            .open
            .iter()
            .find(|o| o.kind == event.kind && o.component == component)
        {
            if let Some(index) = self.nodes.iter().position(|n| n.id == existing.id) {
                self.origin.insert(event.id, index);
            }
            return;
        }

        let fault = event
            .caused_by
            .and_then(|p| self.activations.get(&p))
            .cloned();
        // Breakers and overload rarely descend from a fault by event
        // lineage; attribute them to what is already broken downstream.
        let parent = inherited.or_else(|| {
            if fault.is_some() {
                return None;
            }
            self.open
                .iter()
                .rev()
                .find(|o| o.component == component)
                .and_then(|o| self.nodes.iter().position(|n| n.id == o.id))
        });

        let description = match &fault {
            Some(fault) => format!("fault {} on {}", fault.as_str(), component.as_str()),
            None => describe(event, &component),
        };
        let (node_type, prefix) = match parent {
            Some(_) => (CausalNodeType::Effect, "effect"),
            None => (CausalNodeType::Failure, "failure"),
        };
        let id = format!("{prefix}-{}", self.nodes.len() + 1);
        let timestamp = event.time.as_millis_f64();
        if let Some(parent) = parent {
            let from = &self.nodes[parent];
            self.edges.push(CausalEdge {
                from: from.id.clone(),
                to: id.clone(),
                edge_type: CausalEdgeType::Caused,
                delay_ms: (timestamp - from.timestamp).max(0.0),
            });
        }
        self.nodes.push(CausalNode {
            id: id.clone(),
            node_type,
            component_id: component.clone(),
            timestamp,
            description: description.clone(),
        });
        self.origin.insert(event.id, self.nodes.len() - 1);
        if let Some(fault) = fault {
            self.by_fault.entry(fault).or_default().push(id.clone());
        }
        self.open.push(OpenNode {
            id,
            kind: event.kind,
            component,
            root: parent.is_none(),
            description,
        });
        self.refresh_causes();
    }

    /// `fault` was deactivated.
    pub fn fault_cleared(&mut self, fault: &FaultId, now: SimTime) {
        let Some(ids) = self.by_fault.remove(fault) else {
            return;
        };
        let components: Vec<ComponentId> = self
            .open
            .iter()
            .filter(|o| ids.contains(&o.id))
            .map(|o| o.component.clone())
            .collect();
        for component in components {
            let description = format!("fault {} cleared on {}", fault.as_str(), component.as_str());
            self.recover(&component, now, &description);
        }
    }

    fn recover(&mut self, component: &ComponentId, now: SimTime, description: &str) {
        let (closed, still_open): (Vec<OpenNode>, Vec<OpenNode>) = std::mem::take(&mut self.open)
            .into_iter()
            .partition(|o| &o.component == component);
        self.open = still_open;
        if closed.is_empty() {
            return;
        }
        let timestamp = now.as_millis_f64();
        let id = format!("recovery-{}", self.nodes.len() + 1);
        for node in &closed {
            let from_time = self
                .nodes
                .iter()
                .find(|n| n.id == node.id)
                .map_or(timestamp, |n| n.timestamp);
            self.edges.push(CausalEdge {
                from: node.id.clone(),
                to: id.clone(),
                edge_type: CausalEdgeType::Mitigated,
                delay_ms: (timestamp - from_time).max(0.0),
            });
        }
        self.nodes.push(CausalNode {
            id,
            node_type: CausalNodeType::Recovery,
            component_id: component.clone(),
            timestamp,
            description: description.to_string(),
        });
        self.refresh_causes();
    }

    fn refresh_causes(&mut self) {
        self.causes = self
            .open
            .iter()
            .filter(|o| o.root)
            .map(|o| o.description.clone())
            .collect();
    }

    pub fn finish(self) -> CausalGraph {
        CausalGraph {
            nodes: self.nodes,
            edges: self.edges,
        }
    }
}

fn describe(event: &Event, component: &ComponentId) -> String {
    match &event.data {
        EventPayload::Note { detail } => {
            format!("{} on {}: {detail}", event.kind.as_str(), component.as_str())
        }
        EventPayload::Breaker { edge, .. } => {
            format!("{} on edge {}", event.kind.as_str(), edge.as_str())
        }
        _ => format!("{} on {}", event.kind.as_str(), component.as_str()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use archsim_core::FaultPhase;

    fn event(id: u64, ms: u64, kind: EventKind, target: &str, parent: Option<u64>) -> Event {
        Event::new(EventId(id), SimTime::from_millis(ms), kind, EventPayload::None)
            .with_target(ComponentId::new(target))
            .caused_by(parent.map(EventId))
    }

    #[test]
    fn test_fault_chain_and_recovery() {
        let mut tracker = CausalTracker::new();
        let activate = Event::new(
            EventId(1),
            SimTime::from_millis(100),
            EventKind::FaultActivate,
            EventPayload::Fault {
                fault: FaultId::new("db-crash"),
                phase: FaultPhase::Activation,
            },
        );
        tracker.observe(&activate);
        tracker.observe(&event(2, 100, EventKind::NodeFailure, "db", Some(1)));
        assert_eq!(tracker.active_causes(), ["fault db-crash on db".to_string()]);

        // A propagation check descends from the failure and degrades the api.
        tracker.observe(&event(3, 100, EventKind::FailureModeCheck, "api", Some(2)));
        tracker.observe(&event(4, 150, EventKind::NodeDegraded, "api", Some(3)));

        tracker.fault_cleared(&FaultId::new("db-crash"), SimTime::from_millis(400));
        assert!(tracker.active_causes().is_empty());

        let graph = tracker.finish();
        let types: Vec<CausalNodeType> = graph.nodes.iter().map(|n| n.node_type).collect();
        assert_eq!(
            types,
            vec![
                CausalNodeType::Failure,
                CausalNodeType::Effect,
                CausalNodeType::Recovery
            ]
        );
        assert_eq!(graph.edges[0].edge_type, CausalEdgeType::Caused);
        assert_eq!(graph.edges[0].delay_ms, 50.0);
        assert_eq!(graph.edges[1].edge_type, CausalEdgeType::Mitigated);
        assert_eq!(graph.edges[1].delay_ms, 300.0);
    }

    #[test]
    fn test_breaker_attributed_to_open_failure_on_target() {
        let mut tracker = CausalTracker::new();
        tracker.observe(&event(1, 10, EventKind::NodeFailure, "db", None));
        tracker.observe(&event(2, 30, EventKind::CircuitOpen, "db", Some(99)));
        tracker.observe(&event(3, 40, EventKind::CircuitOpen, "db", None));
        tracker.observe(&event(4, 90, EventKind::NodeRecovery, "db", None));

        let graph = tracker.finish();
        assert_eq!(graph.nodes.len(), 3, "repeated open is deduplicated");
        assert_eq!(graph.nodes[1].node_type, CausalNodeType::Effect);
        let mitigated = graph
            .edges
            .iter()
            .filter(|e| e.edge_type == CausalEdgeType::Mitigated)
            .count();
        assert_eq!(mitigated, 2);
    }
}
