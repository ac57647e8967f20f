//! Fluxsim Decision Graph Engine
//!
//! A decision graph drives a request through the engines of one
//! component. Nodes are engines, decision branches, or terminal end
//! markers; edges carry routing conditions. Graphs are compiled once
//! at load time (conditions parsed into ASTs, state tables compiled,
//! configuration validated) and evaluated lock-free on the hot path,
//! except for the seedable PRNG used by probability nodes.

#![warn(missing_docs)]

pub mod condition;
pub mod custom;
pub mod probability;
pub mod state_routing;

pub use condition::Condition;
pub use custom::{CustomLogicRegistry, CustomRoute};
pub use probability::ProbabilityConfig;
pub use state_routing::{CompiledStateRouting, StateConfig, SystemState};

use flux_common::{EngineType, Operation, OperationResult, SimError, SimResult};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Hard cap on nodes visited in one graph execution. Exceeding it is a
/// fatal routing error and points at a cycle in the configuration.
pub const MAX_TRAVERSAL: usize = 100;

/// Destination aliases that terminate a request.
pub const END_ALIASES: [&str; 3] = ["end", "end_node", "complete"];

/// Whether a destination name is a terminal alias.
pub fn is_end_alias(name: &str) -> bool {
    END_ALIASES.contains(&name)
}

/// Kind of a graph node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// Runs an engine; traversal resumes when its result arrives
    Engine,
    /// Pure routing branch, no engine work
    Decision,
    /// Terminal marker
    End,
}

/// Routing strategy of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingKind {
    /// Evaluate conditions in order, then the default edge
    #[default]
    Standard,
    /// Draw from a distribution, route on the outcome name
    ProbabilityBased,
    /// Route on sampled system state
    DynamicStateBased,
    /// Invoke a registered function keyed by node id
    CustomLogic,
}

/// Declarative node description, as found in component profiles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Node kind
    #[serde(rename = "type")]
    pub kind: NodeKind,
    /// Engine to run, for engine nodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<EngineType>,
    /// Condition expression to destination, in evaluation order
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub conditions: BTreeMap<String, String>,
    /// Default destination when no condition matches
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    /// Routing strategy; standard when omitted
    #[serde(default)]
    pub routing_type: RoutingKind,
    /// Distribution config for probability routing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probability_config: Option<ProbabilityConfig>,
    /// State table for dynamic state-based routing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_config: Option<StateConfig>,
}

/// Declarative graph description, as found in component profiles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphSpec {
    /// Graph name, for logs and captured state
    #[serde(default)]
    pub name: String,
    /// Node the first operation of a request enters through
    pub start_node: String,
    /// Node ids that terminate a request
    #[serde(default)]
    pub end_nodes: Vec<String>,
    /// Node id to node description
    pub nodes: BTreeMap<String, NodeSpec>,
    /// Component ids this graph is allowed to hand requests to
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub external_targets: Vec<String>,
}

/// Where a routing decision sends a request next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// An engine in the same instance
    Engine {
        /// Graph node the request is now at
        node: String,
        /// Engine that must run next
        engine: EngineType,
    },
    /// Another component, dispatched through its circuit breaker
    External(String),
    /// A terminal end node
    End(String),
}

/// One edge out of a node: the raw condition name (matched verbatim by
/// probability routing), its compiled form, and the destination.
#[derive(Debug, Clone)]
struct Route {
    raw: String,
    condition: Condition,
    dest: String,
}

#[derive(Debug, Clone)]
struct CompiledNode {
    kind: NodeKind,
    engine: Option<EngineType>,
    routes: Vec<Route>,
    next: Option<String>,
    routing: RoutingKind,
    probability: Option<ProbabilityConfig>,
    state: Option<CompiledStateRouting>,
}

/// A compiled, evaluable decision graph.
#[derive(Debug)]
pub struct DecisionGraph {
    name: String,
    start_node: String,
    end_nodes: HashSet<String>,
    nodes: HashMap<String, CompiledNode>,
    external: HashSet<String>,
    rng: Mutex<StdRng>,
    custom: CustomLogicRegistry,
    spec: GraphSpec,
}

impl DecisionGraph {
    /// Compile and validate a graph spec.
    pub fn compile(spec: GraphSpec) -> SimResult<Self> {
        Self::validate(&spec)?;

        let mut nodes = HashMap::with_capacity(spec.nodes.len());
        for (id, node) in &spec.nodes {
            let mut routes = Vec::with_capacity(node.conditions.len());
            let mut default_route = None;
            for (expr, dest) in &node.conditions {
                let route = Route {
                    raw: expr.clone(),
                    condition: Condition::parse(expr)?,
                    dest: dest.clone(),
                };
                // `default` always evaluates last, whatever the map order
                if route.condition.is_default() {
                    default_route = Some(route);
                } else {
                    routes.push(route);
                }
            }
            routes.extend(default_route);

            let state = node
                .state_config
                .as_ref()
                .map(CompiledStateRouting::compile)
                .transpose()?;

            nodes.insert(
                id.clone(),
                CompiledNode {
                    kind: node.kind,
                    engine: node.engine,
                    routes,
                    next: node.next.clone(),
                    routing: node.routing_type,
                    probability: node.probability_config.clone(),
                    state,
                },
            );
        }

        Ok(Self {
            name: spec.name.clone(),
            start_node: spec.start_node.clone(),
            end_nodes: spec.end_nodes.iter().cloned().collect(),
            external: spec.external_targets.iter().cloned().collect(),
            nodes,
            rng: Mutex::new(StdRng::from_entropy()),
            custom: CustomLogicRegistry::new(),
            spec,
        })
    }

    /// Replace the PRNG with a seeded one, for replayable runs.
    pub fn with_seed(self, seed: u64) -> Self {
        *self.rng.lock() = StdRng::seed_from_u64(seed);
        self
    }

    /// Graph name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Start node id.
    pub fn start_node(&self) -> &str {
        &self.start_node
    }

    /// The custom-logic registry for this graph.
    pub fn custom(&self) -> &CustomLogicRegistry {
        &self.custom
    }

    /// The declarative spec this graph was compiled from.
    pub fn spec(&self) -> &GraphSpec {
        &self.spec
    }

    /// Reject structurally invalid graphs at load time.
    ///
    /// Every edge target must resolve to a node, a terminal alias, a
    /// declared end node, a bare engine type, or a declared external
    /// component; anything else is a dangling edge.
    pub fn validate(spec: &GraphSpec) -> SimResult<()> {
        if spec.start_node.is_empty() {
            return Err(SimError::Config("graph has no start node".into()));
        }
        if !spec.nodes.contains_key(&spec.start_node) {
            return Err(SimError::Config(format!(
                "start node {} is not defined",
                spec.start_node
            )));
        }
        let known = |target: &str| {
            spec.nodes.contains_key(target)
                || is_end_alias(target)
                || spec.end_nodes.iter().any(|e| e == target)
                || target.parse::<EngineType>().is_ok()
                || spec.external_targets.iter().any(|e| e == target)
        };
        for (id, node) in &spec.nodes {
            if node.kind == NodeKind::Engine && node.engine.is_none() {
                return Err(SimError::Config(format!(
                    "engine node {id} declares no engine type"
                )));
            }
            if node.routing_type == RoutingKind::ProbabilityBased
                && node.probability_config.is_none()
            {
                return Err(SimError::Config(format!(
                    "probability node {id} has no probability_config"
                )));
            }
            if node.routing_type == RoutingKind::DynamicStateBased && node.state_config.is_none() {
                return Err(SimError::Config(format!(
                    "state-routing node {id} has no state_config"
                )));
            }
            for dest in node.conditions.values() {
                if !known(dest) {
                    return Err(SimError::Config(format!(
                        "dangling edge {id} -> {dest}"
                    )));
                }
            }
            if let Some(next) = &node.next {
                if !known(next) {
                    return Err(SimError::Config(format!("dangling edge {id} -> {next}")));
                }
            }
            if let Some(state) = &node.state_config {
                for dest in state.conditions.values().chain(state.fallback.iter()) {
                    if !known(dest) {
                        return Err(SimError::Config(format!(
                            "dangling edge {id} -> {dest}"
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Destination for a request entering the graph at the start node.
    pub fn entry(&self, op: &Operation, state: &SystemState) -> SimResult<Destination> {
        let mut visits = 0;
        self.resolve(self.start_node.clone(), op, None, state, &mut visits)
    }

    /// Destination after an engine at `node_id` produced `result`.
    pub fn route_from(
        &self,
        node_id: &str,
        op: &Operation,
        result: &OperationResult,
        state: &SystemState,
    ) -> SimResult<Destination> {
        let node = self.nodes.get(node_id).ok_or_else(|| {
            SimError::Routing(format!("unknown node {node_id} in graph {}", self.name))
        })?;
        let mut visits = 1;
        let target = self.evaluate_node(node_id, node, op, Some(result), state)?;
        self.resolve(target, op, Some(result), state, &mut visits)
    }

    /// Walk decision nodes until the destination is an engine, an
    /// external component, or an end node.
    fn resolve(
        &self,
        mut target: String,
        op: &Operation,
        result: Option<&OperationResult>,
        state: &SystemState,
        visits: &mut usize,
    ) -> SimResult<Destination> {
        loop {
            *visits += 1;
            if *visits > MAX_TRAVERSAL {
                return Err(SimError::Routing(format!(
                    "graph {} traversal exceeded {MAX_TRAVERSAL} nodes at {target}",
                    self.name
                )));
            }
            if is_end_alias(&target) || self.end_nodes.contains(&target) {
                return Ok(Destination::End(target));
            }
            if let Some(node) = self.nodes.get(&target) {
                match node.kind {
                    NodeKind::End => return Ok(Destination::End(target)),
                    NodeKind::Engine => {
                        let engine = node.engine.ok_or_else(|| {
                            SimError::Routing(format!("engine node {target} has no engine"))
                        })?;
                        return Ok(Destination::Engine { node: target, engine });
                    }
                    NodeKind::Decision => {
                        let next = self.evaluate_node(&target, node, op, result, state)?;
                        target = next;
                        continue;
                    }
                }
            }
            if let Ok(engine) = target.parse::<EngineType>() {
                return Ok(Destination::Engine { node: target, engine });
            }
            if self.external.contains(&target) {
                return Ok(Destination::External(target));
            }
            return Err(SimError::Routing(format!(
                "unknown destination {target} in graph {}",
                self.name
            )));
        }
    }

    fn evaluate_node(
        &self,
        id: &str,
        node: &CompiledNode,
        op: &Operation,
        result: Option<&OperationResult>,
        state: &SystemState,
    ) -> SimResult<String> {
        match node.routing {
            RoutingKind::Standard => self.standard_route(id, node, op, result),
            RoutingKind::ProbabilityBased => {
                let config = node.probability.as_ref().ok_or_else(|| {
                    SimError::Routing(format!("probability node {id} has no config"))
                })?;
                let outcome = {
                    let mut rng = self.rng.lock();
                    config.draw(&mut *rng)?.to_string()
                };
                node.routes
                    .iter()
                    .find(|r| r.raw == outcome)
                    .map(|r| r.dest.clone())
                    .ok_or_else(|| {
                        SimError::Routing(format!("node {id} has no route for outcome {outcome}"))
                    })
            }
            RoutingKind::DynamicStateBased => {
                let table = node.state.as_ref().ok_or_else(|| {
                    SimError::Routing(format!("state node {id} has no state table"))
                })?;
                if let Some(dest) = table.evaluate(state) {
                    return Ok(dest.to_string());
                }
                if let Some(fallback) = &table.fallback {
                    return Ok(fallback.clone());
                }
                self.standard_route(id, node, op, result)
            }
            RoutingKind::CustomLogic => {
                if let Some(dest) = self.custom.evaluate(id, op, result) {
                    return Ok(dest);
                }
                tracing::trace!(node = id, "no custom logic registered, using standard routing");
                self.standard_route(id, node, op, result)
            }
        }
    }

    fn standard_route(
        &self,
        id: &str,
        node: &CompiledNode,
        op: &Operation,
        result: Option<&OperationResult>,
    ) -> SimResult<String> {
        for route in &node.routes {
            if route.condition.eval(op, result) {
                return Ok(route.dest.clone());
            }
        }
        if let Some(next) = &node.next {
            return Ok(next.clone());
        }
        Err(SimError::Routing(format!(
            "no matching condition at node {id} in graph {}",
            self.name
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn engine_node(engine: EngineType, conditions: &[(&str, &str)]) -> NodeSpec {
        NodeSpec {
            kind: NodeKind::Engine,
            engine: Some(engine),
            conditions: conditions
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
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

    fn cache_graph() -> GraphSpec {
        GraphSpec {
            name: "cache".into(),
            start_node: "cache_check".into(),
            end_nodes: vec!["done".into()],
            nodes: BTreeMap::from([
                (
                    "cache_check".into(),
                    NodeSpec {
                        kind: NodeKind::Engine,
                        engine: Some(EngineType::Cpu),
                        conditions: BTreeMap::from([
                            ("cache_hit".into(), "memory_lookup".into()),
                            ("cache_miss".into(), "storage_access".into()),
                        ]),
                        next: None,
                        routing_type: RoutingKind::ProbabilityBased,
                        probability_config: Some(ProbabilityConfig {
                            distribution: "cache_hit_rate".into(),
                            rate: 0.8,
                            outcomes: None,
                        }),
                        state_config: None,
                    },
                ),
                (
                    "memory_lookup".into(),
                    engine_node(EngineType::Memory, &[("default", "done")]),
                ),
                (
                    "storage_access".into(),
                    engine_node(EngineType::Storage, &[("default", "done")]),
                ),
                ("done".into(), end_node()),
            ]),
            external_targets: vec![],
        }
    }

    fn op() -> Operation {
        Operation::new("op1", "read_request").with_data_size(32_000)
    }

    fn ok_result() -> OperationResult {
        OperationResult::success(&op(), Duration::from_millis(5), Some(serde_json::json!({})))
    }

    #[test]
    fn test_validate_rejects_missing_start() {
        let mut spec = cache_graph();
        spec.start_node = "nope".into();
        assert!(matches!(DecisionGraph::compile(spec), Err(SimError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_dangling_edge() {
        let mut spec = cache_graph();
        spec.nodes.insert(
            "bad".into(),
            engine_node(EngineType::Cpu, &[("default", "missing_node")]),
        );
        let err = DecisionGraph::compile(spec).unwrap_err();
        assert!(err.to_string().contains("dangling edge"));
    }

    #[test]
    fn test_validate_accepts_external_targets() {
        let mut spec = cache_graph();
        spec.external_targets = vec!["db".into()];
        spec.nodes.insert(
            "handoff".into(),
            engine_node(EngineType::Network, &[("default", "db")]),
        );
        assert!(DecisionGraph::compile(spec).is_ok());
    }

    #[test]
    fn test_entry_resolves_start_engine() {
        let graph = DecisionGraph::compile(cache_graph()).unwrap();
        let dest = graph.entry(&op(), &SystemState::default()).unwrap();
        assert_eq!(
            dest,
            Destination::Engine { node: "cache_check".into(), engine: EngineType::Cpu }
        );
    }

    #[test]
    fn test_probability_routing_deterministic_with_seed() {
        let a = DecisionGraph::compile(cache_graph()).unwrap().with_seed(42);
        let b = DecisionGraph::compile(cache_graph()).unwrap().with_seed(42);
        for _ in 0..50 {
            let da = a
                .route_from("cache_check", &op(), &ok_result(), &SystemState::default())
                .unwrap();
            let db = b
                .route_from("cache_check", &op(), &ok_result(), &SystemState::default())
                .unwrap();
            assert_eq!(da, db);
        }
    }

    #[test]
    fn test_probability_routing_degenerate_rates() {
        let mut spec = cache_graph();
        spec.nodes.get_mut("cache_check").unwrap().probability_config =
            Some(ProbabilityConfig {
                distribution: "cache_hit_rate".into(),
                rate: 1.0,
                outcomes: None,
            });
        let graph = DecisionGraph::compile(spec).unwrap().with_seed(1);
        let dest = graph
            .route_from("cache_check", &op(), &ok_result(), &SystemState::default())
            .unwrap();
        assert_eq!(
            dest,
            Destination::Engine { node: "memory_lookup".into(), engine: EngineType::Memory }
        );

        let mut spec = cache_graph();
        spec.nodes.get_mut("cache_check").unwrap().probability_config =
            Some(ProbabilityConfig {
                distribution: "cache_hit_rate".into(),
                rate: 0.0,
                outcomes: None,
            });
        let graph = DecisionGraph::compile(spec).unwrap().with_seed(1);
        let dest = graph
            .route_from("cache_check", &op(), &ok_result(), &SystemState::default())
            .unwrap();
        assert_eq!(
            dest,
            Destination::Engine { node: "storage_access".into(), engine: EngineType::Storage }
        );
    }

    #[test]
    fn test_route_to_end() {
        let graph = DecisionGraph::compile(cache_graph()).unwrap();
        let dest = graph
            .route_from("memory_lookup", &op(), &ok_result(), &SystemState::default())
            .unwrap();
        assert_eq!(dest, Destination::End("done".into()));
    }

    #[test]
    fn test_traversal_guard_trips_on_cycle() {
        let decision = |next: &str| NodeSpec {
            kind: NodeKind::Decision,
            engine: None,
            conditions: BTreeMap::from([("default".to_string(), next.to_string())]),
            next: None,
            routing_type: RoutingKind::Standard,
            probability_config: None,
            state_config: None,
        };
        let spec = GraphSpec {
            name: "cyclic".into(),
            start_node: "a".into(),
            end_nodes: vec![],
            nodes: BTreeMap::from([
                ("a".to_string(), decision("b")),
                ("b".to_string(), decision("a")),
            ]),
            external_targets: vec![],
        };
        let graph = DecisionGraph::compile(spec).unwrap();
        let err = graph.entry(&op(), &SystemState::default()).unwrap_err();
        assert!(err.to_string().contains("exceeded 100 nodes"), "{err}");
    }

    #[test]
    fn test_state_routing_fallback_chain() {
        let spec = GraphSpec {
            name: "stateful".into(),
            start_node: "router".into(),
            end_nodes: vec!["done".into()],
            nodes: BTreeMap::from([
                (
                    "router".to_string(),
                    NodeSpec {
                        kind: NodeKind::Decision,
                        engine: None,
                        conditions: BTreeMap::new(),
                        next: None,
                        routing_type: RoutingKind::DynamicStateBased,
                        probability_config: None,
                        state_config: Some(StateConfig {
                            conditions: BTreeMap::from([(
                                "system_load > 0.8".to_string(),
                                "shed".to_string(),
                            )]),
                            fallback: Some("work".to_string()),
                        }),
                    },
                ),
                ("shed".to_string(), end_node()),
                ("work".to_string(), engine_node(EngineType::Cpu, &[("default", "done")])),
                ("done".to_string(), end_node()),
            ]),
            external_targets: vec![],
        };
        let graph = DecisionGraph::compile(spec).unwrap();

        let busy = SystemState { system_load: 0.9, ..Default::default() };
        assert_eq!(graph.entry(&op(), &busy).unwrap(), Destination::End("shed".into()));

        let calm = SystemState::default();
        assert_eq!(
            graph.entry(&op(), &calm).unwrap(),
            Destination::Engine { node: "work".into(), engine: EngineType::Cpu }
        );
    }

    #[test]
    fn test_custom_logic_with_fallback_to_standard() {
        let mut spec = cache_graph();
        {
            let node = spec.nodes.get_mut("memory_lookup").unwrap();
            node.routing_type = RoutingKind::CustomLogic;
        }
        let graph = DecisionGraph::compile(spec).unwrap();
        graph.custom().register("memory_lookup", |op, _| {
            (op.priority > 8).then(|| "storage_access".to_string())
        });

        // priority below the custom threshold: standard routing applies
        let dest = graph
            .route_from("memory_lookup", &op(), &ok_result(), &SystemState::default())
            .unwrap();
        assert_eq!(dest, Destination::End("done".into()));

        // priority above: custom logic redirects
        let vip = op().with_priority(9);
        let dest = graph
            .route_from("memory_lookup", &vip, &ok_result(), &SystemState::default())
            .unwrap();
        assert_eq!(
            dest,
            Destination::Engine { node: "storage_access".into(), engine: EngineType::Storage }
        );
    }

    #[test]
    fn test_graph_spec_json_roundtrip() {
        let spec = cache_graph();
        let json = serde_json::to_string(&spec).unwrap();
        let back: GraphSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back.start_node, "cache_check");
        assert_eq!(back.nodes.len(), 4);
        assert!(DecisionGraph::compile(back).is_ok());
    }
}
