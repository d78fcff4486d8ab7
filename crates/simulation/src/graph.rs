//! Validated, indexed view of an architecture.

use archsim_types::{
    ArchitecturalPattern, BehaviorFamily, ComponentConfig, ComponentDefinition, ComponentId,
    DistributionConfig, EdgeDefinition, EdgeId, GlobalConfig, RegionId, SimulationInvariant,
    SystemArchitecture,
};
use indexmap::IndexMap;
use std::collections::BTreeMap;

use crate::error::ConfigError;

/// The architecture after validation, with dependency indexes.
///
/// Immutable once built. Components and edges keep their declaration order,
/// which is the order every deterministic iteration in the kernel uses.
#[derive(Debug, Clone)]
pub struct ArchitectureGraph {
    architecture: SystemArchitecture,
    components: IndexMap<ComponentId, ComponentDefinition>,
    edges: IndexMap<EdgeId, EdgeDefinition>,
    dependencies: BTreeMap<ComponentId, Vec<ComponentId>>,
    dependents: BTreeMap<ComponentId, Vec<ComponentId>>,
    between: BTreeMap<(ComponentId, ComponentId), Vec<EdgeId>>,
    incoming: BTreeMap<ComponentId, Vec<EdgeId>>,
    entries: Vec<ComponentId>,
}

impl ArchitectureGraph {
    /// Validate `architecture` and build the indexes.
    ///
    /// A declared dependency with no edge gets an implicit synchronous edge
    /// `implicit:<from>-><to>` with default network settings.
    pub fn new(architecture: SystemArchitecture) -> Result<Self, ConfigError> {
        let mut components = IndexMap::new();
        for component in &architecture.components {
            if components
                .insert(component.id.clone(), component.clone())
                .is_some()
            {
                return Err(ConfigError::DuplicateComponent(component.id.clone()));
            }
        }

        let mut edges = IndexMap::new();
        for edge in &architecture.edges {
            for end in [&edge.source, &edge.target] {
                if !components.contains_key(end) {
                    return Err(ConfigError::DanglingEdge {
                        edge: edge.id.clone(),
                        component: end.clone(),
                    });
                }
            }
            if edges.insert(edge.id.clone(), edge.clone()).is_some() {
                return Err(ConfigError::DuplicateEdge(edge.id.clone()));
            }
        }

        for component in components.values() {
            check_config(component)?;
            for dependency in &component.dependencies {
                if !components.contains_key(dependency) {
                    return Err(ConfigError::UnknownDependency {
                        component: component.id.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
        }

        // Implicit edges for dependencies declared without one.
        let mut implicit = Vec::new();
        for component in components.values() {
            for dependency in &component.dependencies {
                let covered = edges
                    .values()
                    .any(|e| e.source == component.id && &e.target == dependency);
                if !covered {
                    let id = format!("implicit:{}->{}", component.id.as_str(), dependency.as_str());
                    implicit.push(EdgeDefinition::new(id, component.id.clone(), dependency.clone()));
                }
            }
        }
        for edge in implicit {
            if edges.insert(edge.id.clone(), edge.clone()).is_some() {
                return Err(ConfigError::DuplicateEdge(edge.id));
            }
        }

        for edge in edges.values() {
            let location = format!("edge:{}", edge.id.as_str());
            check_distribution(&location, &edge.network.latency)?;
            if let Some(jitter) = &edge.network.jitter {
                check_distribution(&location, jitter)?;
            }
        }

        let mut dependencies: BTreeMap<ComponentId, Vec<ComponentId>> = BTreeMap::new();
        for component in components.values() {
            let mut deps = component.dependencies.clone();
            for edge in edges.values().filter(|e| e.source == component.id) {
                if !deps.contains(&edge.target) {
                    deps.push(edge.target.clone());
                }
            }
            dependencies.insert(component.id.clone(), deps);
        }

        let mut dependents: BTreeMap<ComponentId, Vec<ComponentId>> = components
            .keys()
            .map(|id| (id.clone(), Vec::new()))
            .collect();
        for (source, deps) in &dependencies {
            for target in deps {
                if let Some(list) = dependents.get_mut(target) {
                    if !list.contains(source) {
                        list.push(source.clone());
                    }
                }
            }
        }

        let mut between: BTreeMap<(ComponentId, ComponentId), Vec<EdgeId>> = BTreeMap::new();
        let mut incoming: BTreeMap<ComponentId, Vec<EdgeId>> = BTreeMap::new();
        for edge in edges.values() {
            between
                .entry((edge.source.clone(), edge.target.clone()))
                .or_default()
                .push(edge.id.clone());
            incoming
                .entry(edge.target.clone())
                .or_default()
                .push(edge.id.clone());
        }

        let entries = entry_components(&components, &dependencies, &dependents);

        Ok(Self {
            architecture,
            components,
            edges,
            dependencies,
            dependents,
            between,
            incoming,
            entries,
        })
    }

    /// The architecture as it was handed in.
    pub fn architecture(&self) -> &SystemArchitecture {
        &self.architecture
    }

    pub fn component(&self, id: &ComponentId) -> Option<&ComponentDefinition> {
        self.components.get(id)
    }

    /// Components in declaration order.
    pub fn components(&self) -> impl Iterator<Item = &ComponentDefinition> {
        self.components.values()
    }

    pub fn component_ids(&self) -> impl Iterator<Item = &ComponentId> {
        self.components.keys()
    }

    pub fn edge(&self, id: &EdgeId) -> Option<&EdgeDefinition> {
        self.edges.get(id)
    }

    /// Edges in declaration order, implicit edges last.
    pub fn edges(&self) -> impl Iterator<Item = &EdgeDefinition> {
        self.edges.values()
    }

    pub fn dependencies_of(&self, id: &ComponentId) -> &[ComponentId] {
        self.dependencies.get(id).map_or(&[], Vec::as_slice)
    }

    pub fn dependents_of(&self, id: &ComponentId) -> &[ComponentId] {
        self.dependents.get(id).map_or(&[], Vec::as_slice)
    }

    pub fn edges_between(&self, from: &ComponentId, to: &ComponentId) -> &[EdgeId] {
        self.between
            .get(&(from.clone(), to.clone()))
            .map_or(&[], Vec::as_slice)
    }

    /// The first edge from `from` to `to`.
    pub fn edge_to(&self, from: &ComponentId, to: &ComponentId) -> Option<&EdgeDefinition> {
        self.edges_between(from, to)
            .first()
            .and_then(|id| self.edges.get(id))
    }

    /// Edges whose target is `id`.
    pub fn incoming_edges(&self, id: &ComponentId) -> &[EdgeId] {
        self.incoming.get(id).map_or(&[], Vec::as_slice)
    }

    pub fn components_in_region(&self, region: &RegionId) -> Vec<ComponentId> {
        self.components
            .values()
            .filter(|c| &c.region == region)
            .map(|c| c.id.clone())
            .collect()
    }

    /// Components that receive generated traffic.
    pub fn entry_components(&self) -> &[ComponentId] {
        &self.entries
    }

    pub fn global(&self) -> &GlobalConfig {
        &self.architecture.global_config
    }

    pub fn invariants(&self) -> &[SimulationInvariant] {
        &self.architecture.invariants
    }

    pub fn has_pattern(&self, pattern: ArchitecturalPattern, component: &ComponentId) -> bool {
        self.architecture.has_pattern(pattern, component)
    }
}

fn entry_components(
    components: &IndexMap<ComponentId, ComponentDefinition>,
    dependencies: &BTreeMap<ComponentId, Vec<ComponentId>>,
    dependents: &BTreeMap<ComponentId, Vec<ComponentId>>,
) -> Vec<ComponentId> {
    let mut entries: Vec<ComponentId> = Vec::new();
    for source in components
        .values()
        .filter(|c| c.family() == BehaviorFamily::Source)
    {
        for dep in dependencies.get(&source.id).into_iter().flatten() {
            if !entries.contains(dep) {
                entries.push(dep.clone());
            }
        }
    }
    if entries.is_empty() {
        entries = components
            .values()
            .filter(|c| c.family() != BehaviorFamily::Source)
            .filter(|c| dependents.get(&c.id).map_or(true, Vec::is_empty))
            .map(|c| c.id.clone())
            .collect();
    }
    if entries.is_empty() {
        entries.extend(components.keys().next().cloned());
    }
    entries
}

fn check_config(component: &ComponentDefinition) -> Result<(), ConfigError> {
    let type_family = component.component_type.family();
    let compatible = match (type_family, component.config.family()) {
        (_, None) => true,
        (BehaviorFamily::Source, Some(_)) => false,
        (BehaviorFamily::Compute, Some(_)) => true,
        (family, Some(config_family)) => family == config_family,
    };
    if !compatible {
        return Err(ConfigError::IncompatibleConfig {
            component: component.id.clone(),
            component_type: component.component_type,
            config: component.config.kind(),
        });
    }

    let location = format!("component:{}", component.id.as_str());
    for dist in component.config.distributions() {
        check_distribution(&location, dist)?;
    }
    if let Some(hook) = &component.fault_injection.latency_injection {
        check_distribution(&location, &hook.added_latency_ms)?;
    }
    if let ComponentConfig::Cache(cache) = &component.config {
        if !(0.0..=1.0).contains(&cache.hit_rate) {
            return Err(ConfigError::InvalidDistribution {
                location,
                reason: format!("hitRate must be within [0, 1], got {}", cache.hit_rate),
            });
        }
    }
    Ok(())
}

fn check_distribution(location: &str, dist: &DistributionConfig) -> Result<(), ConfigError> {
    dist.validate()
        .map_err(|reason| ConfigError::InvalidDistribution {
            location: location.to_string(),
            reason,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use archsim_types::{CacheConfig, ComponentType, DatabaseConfig};

    fn three_tier() -> SystemArchitecture {
        SystemArchitecture::new("shop")
            .with_component(
                ComponentDefinition::new("users", ComponentType::UserSource)
                    .with_dependencies(["api"]),
            )
            .with_component(
                ComponentDefinition::new("api", ComponentType::Microservice)
                    .with_dependencies(["cache"]),
            )
            .with_component(
                ComponentDefinition::new("cache", ComponentType::Cache)
                    .with_config(ComponentConfig::Cache(CacheConfig::default())),
            )
            .with_component(
                ComponentDefinition::new("db", ComponentType::RelationalDb)
                    .with_config(ComponentConfig::Database(DatabaseConfig::default())),
            )
            .with_edge(EdgeDefinition::new("cache-db", "cache", "db"))
    }

    #[test]
    fn test_dependencies_union_edges_and_declared() {
        let graph = ArchitectureGraph::new(three_tier()).unwrap();
        let cache = ComponentId::new("cache");
        let db = ComponentId::new("db");
        assert_eq!(graph.dependencies_of(&cache), &[db.clone()]);
        assert_eq!(graph.dependents_of(&db), &[cache.clone()]);
        assert_eq!(graph.entry_components(), &[ComponentId::new("api")]);
    }

    #[test]
    fn test_implicit_edges_for_declared_dependencies() {
        let graph = ArchitectureGraph::new(three_tier()).unwrap();
        let edge = graph
            .edge_to(&ComponentId::new("api"), &ComponentId::new("cache"))
            .unwrap();
        assert_eq!(edge.id.as_str(), "implicit:api->cache");
        assert_eq!(
            graph.edges_between(&ComponentId::new("cache"), &ComponentId::new("db")),
            &[EdgeId::new("cache-db")]
        );
    }

    #[test]
    fn test_dangling_edge_rejected() {
        let arch = three_tier().with_edge(EdgeDefinition::new("bad", "api", "ghost"));
        assert_eq!(
            ArchitectureGraph::new(arch).unwrap_err(),
            ConfigError::DanglingEdge {
                edge: EdgeId::new("bad"),
                component: ComponentId::new("ghost"),
            }
        );
    }

    #[test]
    fn test_duplicate_component_rejected() {
        let arch = three_tier()
            .with_component(ComponentDefinition::new("api", ComponentType::Microservice));
        assert!(matches!(
            ArchitectureGraph::new(arch),
            Err(ConfigError::DuplicateComponent(_))
        ));
    }

    #[test]
    fn test_incompatible_config_rejected() {
        let arch = SystemArchitecture::new("x").with_component(
            ComponentDefinition::new("db", ComponentType::RelationalDb)
                .with_config(ComponentConfig::Cache(CacheConfig::default())),
        );
        assert!(matches!(
            ArchitectureGraph::new(arch),
            Err(ConfigError::IncompatibleConfig { config: "cache", .. })
        ));
    }

    #[test]
    fn test_invalid_edge_distribution_rejected() {
        let arch = three_tier().with_edge(
            EdgeDefinition::new("slow", "api", "db")
                .with_latency(DistributionConfig::Exponential { rate: -1.0 }),
        );
        match ArchitectureGraph::new(arch) {
            Err(ConfigError::InvalidDistribution { location, .. }) => {
                assert_eq!(location, "edge:slow")
            }
            other => panic!("expected invalid distribution, got {other:?}"),
        }
    }

    #[test]
    fn test_cycles_are_allowed() {
        let arch = SystemArchitecture::new("ring")
            .with_component(
                ComponentDefinition::new("a", ComponentType::Microservice).with_dependencies(["b"]),
            )
            .with_component(
                ComponentDefinition::new("b", ComponentType::Microservice).with_dependencies(["a"]),
            );
        let graph = ArchitectureGraph::new(arch).unwrap();
        // Nothing lacks dependents; the first component takes the traffic.
        assert_eq!(graph.entry_components(), &[ComponentId::new("a")]);
    }
}
