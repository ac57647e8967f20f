//! State capture
//!
//! Snapshots the runtime (components, instances, queues, graphs,
//! metrics) into a serializable document and writes it through a
//! pluggable sink. Restoring rebuilds components from their captured
//! profiles into a fresh runtime whose component and queue states
//! compare equal modulo timestamps.

use crate::{
    balancer::BalanceAlgorithm,
    channel_len,
    factory::ComponentProfile,
    runtime::{Simulation, SimulationConfig},
};
use flux_common::{
    metrics::RoutingMetricsSnapshot, BufferStatus, ComponentType, EngineType, SimError, SimResult,
};
use flux_graph::GraphSpec;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Captured state of one component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentState {
    /// Component id
    pub id: String,
    /// Component type
    #[serde(rename = "type")]
    pub component_type: ComponentType,
    /// Selection algorithm in use
    pub algorithm: BalanceAlgorithm,
    /// Instances at capture time
    pub instance_count: usize,
    /// Instance floor
    pub min_instances: usize,
    /// Instance ceiling
    pub max_instances: usize,
    /// Registry health at capture time
    pub health: f64,
    /// Registry buffer status at capture time
    pub buffer_status: BufferStatus,
    /// Profile the component was built from
    pub profile: ComponentProfile,
}

/// Captured state of one bounded queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueState {
    /// Queue id (component id or instance id)
    pub id: String,
    /// Bounded capacity
    pub capacity: usize,
    /// Items queued at capture time
    pub depth: usize,
    /// Fill fraction at capture time
    pub fill: f64,
}

/// Captured state of one engine's output queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineState {
    /// `<instance>-<engine>`
    pub id: String,
    /// Engine kind
    #[serde(rename = "type")]
    pub engine: EngineType,
    /// Routing counters at capture time
    pub routing: RoutingMetricsSnapshot,
}

/// Runtime-wide counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemMetricsState {
    /// Requests that reached the success sink
    pub completed: u64,
    /// Requests that reached the error sink
    pub failed: u64,
    /// Requests recorded as timeouts
    pub timeouts: u64,
    /// Error-node re-injections
    pub retries: u64,
}

/// System-level section of a snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemMeta {
    /// Runtime configuration knobs
    pub configuration: BTreeMap<String, serde_json::Value>,
    /// Decision graph of every component
    pub system_graphs: BTreeMap<String, GraphSpec>,
    /// Free-form settings
    pub global_settings: BTreeMap<String, serde_json::Value>,
    /// Runtime-wide counters
    pub metrics: SystemMetricsState,
}

/// One captured simulation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemSnapshot {
    /// Simulation id
    pub simulation_id: String,
    /// Per-component state
    pub components: BTreeMap<String, ComponentState>,
    /// Per-EOQ state
    pub engines: BTreeMap<String, EngineState>,
    /// Per-queue state
    pub queues: BTreeMap<String, QueueState>,
    /// System-level section
    pub system: SystemMeta,
    /// Capture timestamp
    pub captured_at: DateTime<Utc>,
}

impl SystemSnapshot {
    /// Equality modulo timestamps and counters: the structural state
    /// of components and queues.
    pub fn equivalent(&self, other: &Self) -> bool {
        self.simulation_id == other.simulation_id
            && self.components == other.components
            && self.queues == other.queues
    }
}

/// Capture the current state of a simulation without stopping it.
pub fn capture(sim: &Simulation) -> SystemSnapshot {
    let mut components = BTreeMap::new();
    let mut queues = BTreeMap::new();
    let mut engines = BTreeMap::new();
    let mut system_graphs = BTreeMap::new();

    for id in sim.component_ids() {
        let (Some(balancer), Some(profile)) = (sim.component(&id), sim.profile(&id)) else {
            continue;
        };
        let config = balancer.config();
        components.insert(
            id.clone(),
            ComponentState {
                id: id.clone(),
                component_type: balancer.component_type(),
                algorithm: config.algorithm,
                instance_count: balancer.instance_count(),
                min_instances: config.min_instances,
                max_instances: config.max_instances,
                health: sim.registry().health(&id),
                buffer_status: sim.registry().load(&id),
                profile: profile.clone(),
            },
        );

        let input = balancer.sender();
        queues.insert(
            id.clone(),
            QueueState {
                id: id.clone(),
                capacity: input.max_capacity(),
                depth: channel_len(&input),
                fill: crate::channel_fill(&input),
            },
        );

        for instance in balancer.instances() {
            queues.insert(
                instance.id().to_string(),
                QueueState {
                    id: instance.id().to_string(),
                    capacity: config.instance_capacity,
                    depth: instance.input_len(),
                    fill: instance.input_fill(),
                },
            );
            for engine in profile.engines() {
                if let Some(eoq) = instance.output_queue(engine) {
                    let engine_id = format!("{}-{}", instance.id(), engine);
                    engines.insert(
                        engine_id.clone(),
                        EngineState {
                            id: engine_id,
                            engine,
                            routing: eoq.metrics().snapshot(),
                        },
                    );
                }
            }
        }
        system_graphs.insert(id.clone(), balancer.graph().spec().clone());
    }

    let endnode_metrics = sim.endnodes().metrics();
    SystemSnapshot {
        simulation_id: sim.id().to_string(),
        components,
        engines,
        queues,
        system: SystemMeta {
            configuration: BTreeMap::new(),
            system_graphs,
            global_settings: BTreeMap::new(),
            metrics: SystemMetricsState {
                completed: endnode_metrics.completed.get(),
                failed: endnode_metrics.failed.get(),
                timeouts: endnode_metrics.timeouts.get(),
                retries: endnode_metrics.retries.get(),
            },
        },
        captured_at: Utc::now(),
    }
}

/// Rebuild a fresh, not-yet-started simulation from a snapshot.
pub fn restore(snapshot: &SystemSnapshot, mut config: SimulationConfig) -> SimResult<Simulation> {
    config.simulation_id = snapshot.simulation_id.clone();
    let sim = Simulation::new(config);
    for state in snapshot.components.values() {
        sim.add_component(state.profile.clone())?;
    }
    Ok(sim)
}

/// Where captured snapshots go.
pub trait StateSink: Send + Sync {
    /// Persist a snapshot, replacing any prior capture of the same
    /// simulation.
    fn store(&self, snapshot: &SystemSnapshot) -> SimResult<()>;

    /// Load the last capture of a simulation, if any.
    fn load(&self, simulation_id: &str) -> SimResult<Option<SystemSnapshot>>;
}

/// Directory of `<simulation_id>.json` documents.
pub struct FileSink {
    dir: PathBuf,
}

impl FileSink {
    /// Sink writing into `dir`, created on first store.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, simulation_id: &str) -> PathBuf {
        self.dir.join(format!("{simulation_id}.json"))
    }
}

impl StateSink for FileSink {
    fn store(&self, snapshot: &SystemSnapshot) -> SimResult<()> {
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| SimError::Sink(format!("create {}: {e}", self.dir.display())))?;
        let json = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| SimError::Sink(format!("encode snapshot: {e}")))?;
        let path = self.path_for(&snapshot.simulation_id);
        std::fs::write(&path, json)
            .map_err(|e| SimError::Sink(format!("write {}: {e}", path.display())))?;
        tracing::debug!(simulation = %snapshot.simulation_id, path = %path.display(), "snapshot stored");
        Ok(())
    }

    fn load(&self, simulation_id: &str) -> SimResult<Option<SystemSnapshot>> {
        let path = self.path_for(simulation_id);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SimError::Sink(format!("read {}: {e}", path.display()))),
        };
        let snapshot = serde_json::from_slice(&bytes)
            .map_err(|e| SimError::Sink(format!("decode {}: {e}", path.display())))?;
        Ok(Some(snapshot))
    }
}

/// In-memory sink, mostly for tests.
#[derive(Default)]
pub struct MemorySink {
    snapshots: DashMap<String, SystemSnapshot>,
}

impl MemorySink {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored snapshots.
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    /// Whether the sink is empty.
    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

impl StateSink for MemorySink {
    fn store(&self, snapshot: &SystemSnapshot) -> SimResult<()> {
        self.snapshots
            .insert(snapshot.simulation_id.clone(), snapshot.clone());
        Ok(())
    }

    fn load(&self, simulation_id: &str) -> SimResult<Option<SystemSnapshot>> {
        Ok(self.snapshots.get(simulation_id).map(|s| s.clone()))
    }
}
