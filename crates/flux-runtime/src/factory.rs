//! Component factory
//!
//! Builds balancers from declarative component profiles (JSON) and
//! supplies per-type defaults when no profile is available. The
//! factory validates the decision graph at build time and wires the
//! component against the shared registry, breaker manager, end-node
//! system, and timeout manager.

use crate::{
    balancer::{BalanceAlgorithm, BalancerConfig, ComponentBalancer},
    breaker::{BreakerConfig, BreakerManager},
    endnode::EndNodeSystem,
    engine::EngineFactory,
    registry::ComponentRegistry,
    timeout::TimeoutManager,
};
use flux_common::{ComponentType, EngineType, SimError, SimResult};
use flux_graph::{GraphSpec, NodeKind, NodeSpec, ProbabilityConfig, RoutingKind};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

/// Declarative description of one component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentProfile {
    /// Component id, unique within the simulation
    pub id: String,
    /// Component type
    #[serde(rename = "type")]
    pub component_type: ComponentType,
    /// Human-readable name
    #[serde(default)]
    pub name: String,
    /// Free-form description
    #[serde(default)]
    pub description: String,
    /// Balancer configuration
    #[serde(default)]
    pub load_balancer: BalancerConfig,
    /// Engines each instance must wire; derived from the graph when empty
    #[serde(default)]
    pub required_engines: Vec<EngineType>,
    /// Named latency profiles per engine (consumed by engine factories)
    #[serde(default)]
    pub engine_profiles: HashMap<EngineType, String>,
    /// Complexity level per engine
    #[serde(default)]
    pub complexity_levels: HashMap<EngineType, u32>,
    /// The component's routing graph
    pub decision_graph: GraphSpec,
    /// Breaker protecting dispatches *to* this component
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<BreakerConfig>,
    /// Upper bound on concurrently processing operations
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_ops: usize,
    /// Input queue capacity override (0 keeps the balancer default)
    #[serde(default)]
    pub queue_capacity: usize,
    /// Engine tick budget
    #[serde(default = "default_tick_timeout", with = "flux_common::serde_millis")]
    pub tick_timeout: Duration,
}

fn default_max_concurrent() -> usize {
    100
}

fn default_tick_timeout() -> Duration {
    Duration::from_millis(100)
}

impl ComponentProfile {
    /// The default profile for a component type, used when no profile
    /// file is found.
    pub fn default_for(id: &str, component_type: ComponentType) -> Self {
        let (load_balancer, decision_graph) = match component_type {
            ComponentType::Cache => (
                // caches default to a single fixed instance, no balancing
                BalancerConfig::default(),
                cache_graph(),
            ),
            ComponentType::WebServer => (
                BalancerConfig {
                    algorithm: BalanceAlgorithm::RoundRobin,
                    min_instances: 2,
                    max_instances: 4,
                    auto_scaling: true,
                    ..Default::default()
                },
                pipeline_graph(&[
                    ("render", EngineType::Cpu),
                    ("deliver", EngineType::Network),
                ]),
            ),
            ComponentType::Database => (
                BalancerConfig {
                    algorithm: BalanceAlgorithm::LeastConnections,
                    min_instances: 1,
                    max_instances: 2,
                    ..Default::default()
                },
                pipeline_graph(&[
                    ("parse", EngineType::Cpu),
                    ("read_page", EngineType::Storage),
                ]),
            ),
            ComponentType::LoadBalancer => (
                BalancerConfig {
                    algorithm: BalanceAlgorithm::Hybrid,
                    min_instances: 2,
                    max_instances: 8,
                    auto_scaling: true,
                    ..Default::default()
                },
                pipeline_graph(&[("route", EngineType::Network)]),
            ),
            ComponentType::Cpu => single_engine(EngineType::Cpu),
            ComponentType::Memory => single_engine(EngineType::Memory),
            ComponentType::Storage => single_engine(EngineType::Storage),
            ComponentType::Network => single_engine(EngineType::Network),
            ComponentType::Custom => single_engine(EngineType::Cpu),
        };
        Self {
            id: id.to_string(),
            component_type,
            name: id.to_string(),
            description: String::new(),
            load_balancer,
            required_engines: Vec::new(),
            engine_profiles: HashMap::new(),
            complexity_levels: HashMap::new(),
            decision_graph,
            circuit_breaker: None,
            max_concurrent_ops: default_max_concurrent(),
            queue_capacity: 0,
            tick_timeout: default_tick_timeout(),
        }
    }

    /// Engines the profile requires: the explicit list, or every
    /// engine the graph mentions.
    pub fn engines(&self) -> Vec<EngineType> {
        if !self.required_engines.is_empty() {
            return self.required_engines.clone();
        }
        let mut engines: Vec<EngineType> = Vec::new();
        for node in self.decision_graph.nodes.values() {
            if let Some(engine) = node.engine {
                if !engines.contains(&engine) {
                    engines.push(engine);
                }
            }
        }
        engines
    }
}

fn engine_node(engine: EngineType, next: &str) -> NodeSpec {
    NodeSpec {
        kind: NodeKind::Engine,
        engine: Some(engine),
        conditions: BTreeMap::from([("default".to_string(), next.to_string())]),
        next: None,
        routing_type: RoutingKind::Standard,
        probability_config: None,
        state_config: None,
    }
}

fn end_node() -> NodeSpec {
    NodeSpec {
        kind: NodeKind::End,
        engine: None,
        conditions: BTreeMap::new(),
        next: None,
        routing_type: RoutingKind::Standard,
        probability_config: None,
        state_config: None,
    }
}

/// Linear pipeline: each named engine feeds the next, the last feeds
/// the end node.
fn pipeline_graph(stages: &[(&str, EngineType)]) -> GraphSpec {
    let mut nodes = BTreeMap::new();
    for (i, (name, engine)) in stages.iter().enumerate() {
        let next = stages.get(i + 1).map(|(n, _)| *n).unwrap_or("done");
        nodes.insert(name.to_string(), engine_node(*engine, next));
    }
    nodes.insert("done".to_string(), end_node());
    GraphSpec {
        name: String::new(),
        start_node: stages[0].0.to_string(),
        end_nodes: vec!["done".to_string()],
        nodes,
        external_targets: vec![],
    }
}

/// The default cache graph: a lookup whose outcome is drawn from the
/// cache hit rate, then a memory or storage pass.
fn cache_graph() -> GraphSpec {
    let mut nodes = BTreeMap::new();
    nodes.insert(
        "cache_check".to_string(),
        NodeSpec {
            kind: NodeKind::Engine,
            engine: Some(EngineType::Cpu),
            conditions: BTreeMap::from([
                ("cache_hit".to_string(), "memory_lookup".to_string()),
                ("cache_miss".to_string(), "storage_access".to_string()),
            ]),
            next: None,
            routing_type: RoutingKind::ProbabilityBased,
            probability_config: Some(ProbabilityConfig {
                distribution: "cache_hit_rate".to_string(),
                rate: 0.8,
                outcomes: None,
            }),
            state_config: None,
        },
    );
    nodes.insert("memory_lookup".to_string(), engine_node(EngineType::Memory, "done"));
    nodes.insert("storage_access".to_string(), engine_node(EngineType::Storage, "done"));
    nodes.insert("done".to_string(), end_node());
    GraphSpec {
        name: String::new(),
        start_node: "cache_check".to_string(),
        end_nodes: vec!["done".to_string()],
        nodes,
        external_targets: vec![],
    }
}

fn single_engine(engine: EngineType) -> (BalancerConfig, GraphSpec) {
    (
        BalancerConfig::default(),
        pipeline_graph(&[("work", engine)]),
    )
}

/// Builds components and connects them to the shared runtime services.
pub struct ComponentFactory {
    registry: Arc<ComponentRegistry>,
    breakers: Arc<BreakerManager>,
    endnodes: Arc<EndNodeSystem>,
    timeouts: Arc<TimeoutManager>,
    engine_factory: Arc<dyn EngineFactory>,
}

impl ComponentFactory {
    /// Factory wiring components against the given runtime services.
    pub fn new(
        registry: Arc<ComponentRegistry>,
        breakers: Arc<BreakerManager>,
        endnodes: Arc<EndNodeSystem>,
        timeouts: Arc<TimeoutManager>,
        engine_factory: Arc<dyn EngineFactory>,
    ) -> Self {
        Self { registry, breakers, endnodes, timeouts, engine_factory }
    }

    /// Build a balancer from a profile. The graph is compiled and
    /// validated here; a bad profile never becomes a running component.
    pub fn build(&self, profile: &ComponentProfile) -> SimResult<Arc<ComponentBalancer>> {
        let engines = profile.engines();
        let mut graph_spec = profile.decision_graph.clone();
        if graph_spec.name.is_empty() {
            graph_spec.name = profile.id.clone();
        }
        let graph = flux_graph::DecisionGraph::compile(graph_spec)?;

        if let Some(breaker) = &profile.circuit_breaker {
            self.breakers.configure(&profile.id, breaker.clone());
        }

        let mut config = profile.load_balancer.clone();
        if profile.queue_capacity > 0 {
            config.input_capacity = profile.queue_capacity;
        }

        let balancer = ComponentBalancer::new(
            profile.id.clone(),
            profile.component_type,
            config,
            graph,
            engines,
            profile.complexity_levels.clone(),
            Arc::clone(&self.registry),
            Arc::clone(&self.breakers),
            Arc::clone(&self.endnodes),
            Arc::clone(&self.timeouts),
            Arc::clone(&self.engine_factory),
        )?;
        tracing::debug!(component = %profile.id, "component built from profile");
        Ok(Arc::new(balancer))
    }

    /// Parse a JSON profile and build it.
    pub fn from_json(&self, json: &str) -> SimResult<(ComponentProfile, Arc<ComponentBalancer>)> {
        let profile: ComponentProfile = serde_json::from_str(json)
            .map_err(|e| SimError::Config(format!("invalid component profile: {e}")))?;
        let balancer = self.build(&profile)?;
        Ok((profile, balancer))
    }

    /// Build a component from its type defaults.
    pub fn build_default(
        &self,
        id: &str,
        component_type: ComponentType,
    ) -> SimResult<(ComponentProfile, Arc<ComponentBalancer>)> {
        let profile = ComponentProfile::default_for(id, component_type);
        let balancer = self.build(&profile)?;
        Ok((profile, balancer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endnode::EndNodeConfig;
    use crate::engine::FixedLatencyFactory;

    fn factory() -> ComponentFactory {
        let registry = Arc::new(ComponentRegistry::new());
        let endnodes = Arc::new(EndNodeSystem::new(
            EndNodeConfig::default(),
            Arc::clone(&registry),
        ));
        let timeouts = Arc::new(TimeoutManager::new(Arc::clone(&endnodes)));
        ComponentFactory::new(
            registry,
            Arc::new(BreakerManager::new(BreakerConfig::default())),
            endnodes,
            timeouts,
            Arc::new(FixedLatencyFactory::default()),
        )
    }

    #[test]
    fn test_every_type_default_builds() {
        let factory = factory();
        for (i, component_type) in [
            ComponentType::WebServer,
            ComponentType::Database,
            ComponentType::Cache,
            ComponentType::LoadBalancer,
            ComponentType::Cpu,
            ComponentType::Memory,
            ComponentType::Storage,
            ComponentType::Network,
            ComponentType::Custom,
        ]
        .iter()
        .enumerate()
        {
            let id = format!("component-{i}");
            factory.build_default(&id, *component_type).unwrap();
        }
    }

    #[test]
    fn test_cache_default_is_single_fixed_instance() {
        let profile = ComponentProfile::default_for("cache-1", ComponentType::Cache);
        assert_eq!(profile.load_balancer.algorithm, BalanceAlgorithm::None);
        assert_eq!(profile.load_balancer.min_instances, 1);
        assert_eq!(profile.load_balancer.max_instances, 1);
        assert!(!profile.load_balancer.auto_scaling);
        assert_eq!(
            profile.engines(),
            vec![EngineType::Cpu, EngineType::Memory, EngineType::Storage]
        );
    }

    #[test]
    fn test_profile_json_roundtrip() {
        let json = r#"{
            "id": "web",
            "type": "web_server",
            "name": "Web tier",
            "load_balancer": {
                "algorithm": "round_robin",
                "min_instances": 3,
                "max_instances": 3,
                "auto_scaling": false
            },
            "required_engines": ["cpu", "network"],
            "complexity_levels": {"cpu": 2},
            "decision_graph": {
                "start_node": "render",
                "end_nodes": ["done"],
                "nodes": {
                    "render": {"type": "engine", "engine": "cpu",
                               "conditions": {"default": "deliver"}},
                    "deliver": {"type": "engine", "engine": "network",
                                "conditions": {"default": "done"}},
                    "done": {"type": "end"}
                }
            },
            "queue_capacity": 64
        }"#;
        let factory = factory();
        let (profile, balancer) = factory.from_json(json).unwrap();
        assert_eq!(profile.load_balancer.min_instances, 3);
        assert_eq!(profile.complexity_levels[&EngineType::Cpu], 2);
        assert_eq!(balancer.config().input_capacity, 64);
        assert_eq!(balancer.component_id(), "web");
    }

    #[test]
    fn test_health_based_alias_parses() {
        let json = r#"{"algorithm": "health_based"}"#;
        let config: BalancerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.algorithm, BalanceAlgorithm::HealthAware);
    }

    #[test]
    fn test_invalid_graph_is_rejected() {
        let factory = factory();
        let mut profile = ComponentProfile::default_for("web", ComponentType::WebServer);
        profile.decision_graph.start_node = "missing".into();
        assert!(matches!(factory.build(&profile), Err(SimError::Config(_))));
    }

    #[test]
    fn test_engines_derived_from_graph() {
        let profile = ComponentProfile::default_for("db", ComponentType::Database);
        assert_eq!(profile.engines(), vec![EngineType::Cpu, EngineType::Storage]);
    }
}
