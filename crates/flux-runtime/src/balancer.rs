//! Component load balancer
//!
//! Accepts operations on a single bounded input, distributes them to
//! instances of one component, and owns auto-scaling. When a balancer
//! owns a single fixed instance it is "invisible": a direct O(1)
//! pass-through. With auto-scaling on or more than one instance it
//! applies the configured selection algorithm.

use crate::{
    breaker::BreakerManager,
    endnode::EndNodeSystem,
    engine::EngineFactory,
    instance::{ComponentInstance, InstanceContext},
    registry::ComponentRegistry,
    timeout::TimeoutManager,
    Envelope, BALANCER_INPUT_CAPACITY, INSTANCE_INPUT_CAPACITY,
};
use flux_common::{ComponentType, Counter, EngineType, Operation, Request, SimError, SimResult};
use flux_graph::DecisionGraph;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Instance selection algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceAlgorithm {
    /// Advance an index modulo the instance count
    RoundRobin,
    /// Smallest input-channel length wins, first on ties
    LeastConnections,
    /// Rolling counter converging to the configured weight ratios
    Weighted,
    /// Highest health above 0.5; may scale up when all are unhealthy
    #[serde(alias = "health_based")]
    HealthAware,
    /// 0.5·health + 0.3·(1−load) + 0.2·(1−active/max_connections)
    Hybrid,
    /// Single-instance pass-through (round-robin if misconfigured
    /// with several instances)
    #[default]
    None,
}

/// Balancer configuration, as found in component profiles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerConfig {
    /// Selection algorithm
    pub algorithm: BalanceAlgorithm,
    /// Lower bound on the instance count
    pub min_instances: usize,
    /// Upper bound on the instance count
    pub max_instances: usize,
    /// Whether the scaling loop runs
    pub auto_scaling: bool,
    /// Aggregate input fill above which the balancer scales up
    pub scale_up_threshold: f64,
    /// Aggregate input fill below which the balancer scales down
    pub scale_down_threshold: f64,
    /// Minimum time between scale-ups
    #[serde(with = "flux_common::serde_millis")]
    pub scale_up_cooldown: Duration,
    /// Minimum time between scale-downs
    #[serde(with = "flux_common::serde_millis")]
    pub scale_down_cooldown: Duration,
    /// Per-instance weights for the weighted algorithm
    pub instance_weights: Vec<u32>,
    /// Weight for instances beyond the configured list
    pub default_weight: u32,
    /// Connection budget used by the hybrid score
    pub max_connections: usize,
    /// Capacity of the balancer input channel
    pub input_capacity: usize,
    /// Capacity of each instance input channel
    pub instance_capacity: usize,
    /// Interval between scaling evaluations
    #[serde(with = "flux_common::serde_millis")]
    pub scale_check_interval: Duration,
    /// Selection retries before an operation goes to the error sink
    pub dispatch_retries: u32,
    /// Per-instance drain deadline on stop
    #[serde(with = "flux_common::serde_millis")]
    pub stop_deadline: Duration,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            algorithm: BalanceAlgorithm::None,
            min_instances: 1,
            max_instances: 1,
            auto_scaling: false,
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.2,
            scale_up_cooldown: Duration::from_secs(60),
            scale_down_cooldown: Duration::from_secs(120),
            instance_weights: Vec::new(),
            default_weight: 1,
            max_connections: 100,
            input_capacity: BALANCER_INPUT_CAPACITY,
            instance_capacity: INSTANCE_INPUT_CAPACITY,
            scale_check_interval: Duration::from_millis(500),
            dispatch_retries: 3,
            stop_deadline: Duration::from_secs(2),
        }
    }
}

/// Balancer counters.
#[derive(Debug, Default)]
pub struct BalancerMetrics {
    /// Operations accepted at the input
    pub submitted: Counter,
    /// Operations refused at the input
    pub rejected: Counter,
    /// Operations that exhausted selection retries
    pub dispatch_failures: Counter,
    /// Scale-up actions
    pub scale_ups: Counter,
    /// Scale-down actions
    pub scale_downs: Counter,
}

/// Instance set and scaling clock, guarded by one write lock so
/// manual and automatic scaling serialize.
struct Scaling {
    instances: Vec<Arc<ComponentInstance>>,
    last_scale_up: Option<Instant>,
    last_scale_down: Option<Instant>,
    next_index: usize,
}

/// Load balancer owning every instance of one component.
pub struct ComponentBalancer {
    component_id: String,
    component_type: ComponentType,
    config: BalancerConfig,
    graph: Arc<DecisionGraph>,
    engines: Vec<EngineType>,
    complexity: HashMap<EngineType, u32>,
    registry: Arc<ComponentRegistry>,
    breakers: Arc<BreakerManager>,
    endnodes: Arc<EndNodeSystem>,
    timeouts: Arc<TimeoutManager>,
    engine_factory: Arc<dyn EngineFactory>,
    input_tx: mpsc::Sender<Envelope>,
    input_rx: Mutex<Option<mpsc::Receiver<Envelope>>>,
    scaling: RwLock<Scaling>,
    rr_cursor: AtomicUsize,
    weighted_counter: AtomicU64,
    running: AtomicBool,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    metrics: BalancerMetrics,
}

impl ComponentBalancer {
    /// Build a balancer for one component. Instances are created when
    /// `start()` runs.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        component_id: String,
        component_type: ComponentType,
        config: BalancerConfig,
        graph: DecisionGraph,
        engines: Vec<EngineType>,
        complexity: HashMap<EngineType, u32>,
        registry: Arc<ComponentRegistry>,
        breakers: Arc<BreakerManager>,
        endnodes: Arc<EndNodeSystem>,
        timeouts: Arc<TimeoutManager>,
        engine_factory: Arc<dyn EngineFactory>,
    ) -> SimResult<Self> {
        if component_id.is_empty() {
            return Err(SimError::Config("component id is empty".into()));
        }
        if config.min_instances == 0 {
            return Err(SimError::Config("min_instances must be at least 1".into()));
        }
        if config.min_instances > config.max_instances {
            return Err(SimError::Config(format!(
                "min_instances {} exceeds max_instances {}",
                config.min_instances, config.max_instances
            )));
        }
        if engines.is_empty() {
            return Err(SimError::Config(format!(
                "component {component_id} declares no engines"
            )));
        }
        let (input_tx, input_rx) = mpsc::channel(config.input_capacity);
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            component_id,
            component_type,
            config,
            graph: Arc::new(graph),
            engines,
            complexity,
            registry,
            breakers,
            endnodes,
            timeouts,
            engine_factory,
            input_tx,
            input_rx: Mutex::new(Some(input_rx)),
            scaling: RwLock::new(Scaling {
                instances: Vec::new(),
                last_scale_up: None,
                last_scale_down: None,
                next_index: 0,
            }),
            rr_cursor: AtomicUsize::new(0),
            weighted_counter: AtomicU64::new(0),
            running: AtomicBool::new(false),
            shutdown,
            tasks: Mutex::new(Vec::new()),
            metrics: BalancerMetrics::default(),
        })
    }

    /// Component this balancer serves.
    pub fn component_id(&self) -> &str {
        &self.component_id
    }

    /// Component type.
    pub fn component_type(&self) -> ComponentType {
        self.component_type
    }

    /// Balancer configuration.
    pub fn config(&self) -> &BalancerConfig {
        &self.config
    }

    /// The component's decision graph.
    pub fn graph(&self) -> &Arc<DecisionGraph> {
        &self.graph
    }

    /// Balancer counters.
    pub fn metrics(&self) -> &BalancerMetrics {
        &self.metrics
    }

    /// Clone of the input channel, as registered with the registry.
    pub fn sender(&self) -> mpsc::Sender<Envelope> {
        self.input_tx.clone()
    }

    /// Current instance count.
    pub fn instance_count(&self) -> usize {
        self.scaling.read().instances.len()
    }

    /// Snapshot of the current instances.
    pub fn instances(&self) -> Vec<Arc<ComponentInstance>> {
        self.scaling.read().instances.clone()
    }

    /// When the balancer last scaled up.
    pub fn last_scale_up(&self) -> Option<Instant> {
        self.scaling.read().last_scale_up
    }

    /// When the balancer last scaled down.
    pub fn last_scale_down(&self) -> Option<Instant> {
        self.scaling.read().last_scale_down
    }

    /// Average input fill across ready instances.
    pub fn aggregate_fill(&self) -> f64 {
        let scaling = self.scaling.read();
        if scaling.instances.is_empty() {
            return 0.0;
        }
        scaling.instances.iter().map(|i| i.input_fill()).sum::<f64>()
            / scaling.instances.len() as f64
    }

    /// Whether selection applies at all: a single fixed instance is an
    /// invisible pass-through.
    pub fn is_visible(&self) -> bool {
        self.config.auto_scaling || self.instance_count() > 1
    }

    /// Queue an operation, or fail fast when the input is full or the
    /// system is draining.
    pub fn submit(&self, mut operation: Operation, request: Arc<Request>) -> SimResult<()> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(SimError::Lifecycle(format!(
                "balancer {} is not running",
                self.component_id
            )));
        }
        if self.endnodes.is_draining() {
            self.endnodes.metrics().refused_draining.inc();
            return Err(SimError::Lifecycle("system is draining".into()));
        }
        if operation.component_id.is_empty() {
            operation.component_id = self.component_id.clone();
        }
        if operation.request_id.is_empty() {
            operation.request_id = request.id.to_string();
        }
        let envelope = Envelope::new(operation, request);
        self.timeouts.register(&envelope);
        match self.input_tx.try_send(envelope) {
            Ok(()) => {
                self.metrics.submitted.inc();
                self.endnodes.request_started();
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(envelope))
            | Err(mpsc::error::TrySendError::Closed(envelope)) => {
                self.timeouts.cancel(&envelope.request.id);
                self.metrics.rejected.inc();
                Err(SimError::channel_full(&self.component_id))
            }
        }
    }

    /// Create the initial instances, register with the registry, and
    /// spawn the distributor (and the scaling loop when enabled).
    /// Balancers are shared as `Arc`, so this takes the handle.
    pub fn start(balancer: &Arc<Self>) -> SimResult<()> {
        if balancer.running.swap(true, Ordering::SeqCst) {
            return Err(SimError::Lifecycle(format!(
                "balancer {} already started",
                balancer.component_id
            )));
        }
        let Some(input_rx) = balancer.input_rx.lock().take() else {
            balancer.running.store(false, Ordering::SeqCst);
            return Err(SimError::Lifecycle(format!(
                "balancer {} cannot be restarted",
                balancer.component_id
            )));
        };

        {
            let mut scaling = balancer.scaling.write();
            for _ in 0..balancer.config.min_instances {
                balancer.create_instance(&mut scaling);
            }
        }
        balancer
            .registry
            .register(&balancer.component_id, balancer.input_tx.clone());

        let mut tasks = balancer.tasks.lock();
        tasks.push(spawn_distributor(Arc::clone(balancer), input_rx));
        if balancer.config.auto_scaling {
            tasks.push(spawn_scaler(Arc::clone(balancer)));
        }
        tracing::info!(
            component = %balancer.component_id,
            instances = balancer.instance_count(),
            algorithm = ?balancer.config.algorithm,
            "balancer started"
        );
        Ok(())
    }

    /// Unregister, stop distribution, and drain every instance.
    pub async fn stop(&self) -> SimResult<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(SimError::Lifecycle(format!(
                "balancer {} is not running",
                self.component_id
            )));
        }
        self.registry.unregister(&self.component_id);
        let _ = self.shutdown.send(true);
        let handles: Vec<_> = self.tasks.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }

        let instances: Vec<_> = {
            let mut scaling = self.scaling.write();
            scaling.instances.drain(..).collect()
        };
        for instance in instances {
            if let Err(err) = instance.stop(self.config.stop_deadline).await {
                tracing::warn!(component = %self.component_id, %err, "instance stop failed");
            }
        }
        tracing::info!(component = %self.component_id, "balancer stopped");
        Ok(())
    }

    /// Hand an envelope to an instance, retrying a bounded number of
    /// times before giving the operation to the error sink.
    fn dispatch(&self, mut envelope: Envelope) {
        let mut last_err = None;
        for _ in 0..=self.config.dispatch_retries {
            let instance = match self.select_instance(true) {
                Ok(instance) => instance,
                Err(err) => {
                    last_err = Some(err);
                    break;
                }
            };
            match instance.input().try_send(envelope) {
                Ok(()) => return,
                Err(mpsc::error::TrySendError::Full(env))
                | Err(mpsc::error::TrySendError::Closed(env)) => {
                    envelope = env;
                    last_err = Some(SimError::channel_full(instance.id()));
                }
            }
        }
        let err = last_err
            .unwrap_or_else(|| SimError::Routing("no instance accepted the operation".into()));
        self.metrics.dispatch_failures.inc();
        self.timeouts.cancel(&envelope.request.id);
        self.endnodes.route_error(envelope, &err);
    }

    /// Pick an instance per the configured algorithm. `may_scale`
    /// allows health-aware selection to create one new instance when
    /// every existing one is unhealthy.
    fn select_instance(&self, may_scale: bool) -> SimResult<Arc<ComponentInstance>> {
        let scaling = self.scaling.read();
        let ready: Vec<&Arc<ComponentInstance>> =
            scaling.instances.iter().filter(|i| i.is_ready()).collect();
        if ready.is_empty() {
            return Err(SimError::Routing(format!(
                "no ready instances for {}",
                self.component_id
            )));
        }
        // invisible pass-through
        if ready.len() == 1 && !self.config.auto_scaling {
            return Ok(Arc::clone(ready[0]));
        }

        let chosen = match self.config.algorithm {
            BalanceAlgorithm::RoundRobin | BalanceAlgorithm::None => {
                let index = self.rr_cursor.fetch_add(1, Ordering::Relaxed) % ready.len();
                Arc::clone(ready[index])
            }
            BalanceAlgorithm::LeastConnections => {
                let least = ready
                    .iter()
                    .min_by_key(|i| i.input_len())
                    .expect("ready is non-empty");
                Arc::clone(least)
            }
            BalanceAlgorithm::Weighted => {
                let weights: Vec<u64> = (0..ready.len())
                    .map(|i| {
                        self.config
                            .instance_weights
                            .get(i)
                            .copied()
                            .unwrap_or(self.config.default_weight)
                            .max(1) as u64
                    })
                    .collect();
                let total: u64 = weights.iter().sum();
                let mut slot = self.weighted_counter.fetch_add(1, Ordering::Relaxed) % total;
                let mut index = 0;
                for (i, w) in weights.iter().enumerate() {
                    if slot < *w {
                        index = i;
                        break;
                    }
                    slot -= w;
                }
                Arc::clone(ready[index])
            }
            BalanceAlgorithm::HealthAware => {
                let best = ready
                    .iter()
                    .max_by(|a, b| a.health().total_cmp(&b.health()))
                    .expect("ready is non-empty");
                if best.health() > 0.5 {
                    Arc::clone(best)
                } else {
                    drop(scaling);
                    if may_scale
                        && self.config.auto_scaling
                        && self.instance_count() < self.config.max_instances
                    {
                        tracing::warn!(
                            component = %self.component_id,
                            "all instances unhealthy, scaling up"
                        );
                        let mut scaling = self.scaling.write();
                        self.create_instance(&mut scaling);
                        scaling.last_scale_up = Some(Instant::now());
                        self.metrics.scale_ups.inc();
                        drop(scaling);
                        return self.select_instance(false);
                    }
                    return Err(SimError::Routing(format!(
                        "no healthy instance for {}",
                        self.component_id
                    )));
                }
            }
            BalanceAlgorithm::Hybrid => {
                let score = |i: &Arc<ComponentInstance>| {
                    let active = i.input_len() as f64;
                    let budget = self.config.max_connections.max(1) as f64;
                    0.5 * i.health()
                        + 0.3 * (1.0 - i.input_fill())
                        + 0.2 * (1.0 - (active / budget).min(1.0))
                };
                let best = ready
                    .iter()
                    .max_by(|a, b| score(a).total_cmp(&score(b)))
                    .expect("ready is non-empty");
                Arc::clone(best)
            }
        };
        Ok(chosen)
    }

    /// One scaling evaluation: sample fill, refresh instance health,
    /// then apply thresholds, cooldowns, and floors.
    pub fn evaluate_scaling(&self) {
        let fill = {
            let scaling = self.scaling.read();
            if scaling.instances.is_empty() {
                return;
            }
            let mut total = 0.0;
            for instance in &scaling.instances {
                let f = instance.input_fill();
                instance.set_health(1.0 - f);
                total += f;
            }
            total / scaling.instances.len() as f64
        };
        self.apply_scaling_decision(fill);
    }

    /// Scaling decision for an observed aggregate fill.
    pub fn apply_scaling_decision(&self, fill: f64) {
        let now = Instant::now();
        let mut scaling = self.scaling.write();
        let count = scaling.instances.len();

        let up_ready = scaling
            .last_scale_up
            .map(|t| now.duration_since(t) >= self.config.scale_up_cooldown)
            .unwrap_or(true);
        if fill > self.config.scale_up_threshold && up_ready && count < self.config.max_instances {
            self.create_instance(&mut scaling);
            scaling.last_scale_up = Some(now);
            self.metrics.scale_ups.inc();
            tracing::info!(
                component = %self.component_id,
                fill,
                instances = scaling.instances.len(),
                "scaled up"
            );
            return;
        }

        let down_ready = scaling
            .last_scale_down
            .map(|t| now.duration_since(t) >= self.config.scale_down_cooldown)
            .unwrap_or(true);
        if fill < self.config.scale_down_threshold
            && down_ready
            && count > self.config.min_instances
        {
            let retired = scaling.instances.pop().expect("count > min >= 1");
            scaling.last_scale_down = Some(now);
            self.metrics.scale_downs.inc();
            tracing::info!(
                component = %self.component_id,
                fill,
                instances = scaling.instances.len(),
                retiring = retired.id(),
                "scaled down"
            );
            let deadline = self.config.stop_deadline;
            tokio::spawn(async move {
                let _ = retired.stop(deadline).await;
            });
        }
    }

    /// Manually add an instance. A call at the max floor is a no-op.
    pub fn scale_up(&self) -> SimResult<usize> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(SimError::Lifecycle(format!(
                "balancer {} is not running",
                self.component_id
            )));
        }
        let mut scaling = self.scaling.write();
        if scaling.instances.len() >= self.config.max_instances {
            return Ok(scaling.instances.len());
        }
        self.create_instance(&mut scaling);
        scaling.last_scale_up = Some(Instant::now());
        self.metrics.scale_ups.inc();
        Ok(scaling.instances.len())
    }

    /// Manually retire an instance. A call at the min floor is a no-op.
    pub fn scale_down(&self) -> SimResult<usize> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(SimError::Lifecycle(format!(
                "balancer {} is not running",
                self.component_id
            )));
        }
        let mut scaling = self.scaling.write();
        if scaling.instances.len() <= self.config.min_instances {
            return Ok(scaling.instances.len());
        }
        let retired = scaling.instances.pop().expect("len > min >= 1");
        scaling.last_scale_down = Some(Instant::now());
        self.metrics.scale_downs.inc();
        let deadline = self.config.stop_deadline;
        tokio::spawn(async move {
            let _ = retired.stop(deadline).await;
        });
        Ok(scaling.instances.len())
    }

    /// Create one instance under the scaling write lock.
    fn create_instance(&self, scaling: &mut Scaling) {
        scaling.next_index += 1;
        let ctx = InstanceContext {
            component_id: self.component_id.clone(),
            graph: Arc::clone(&self.graph),
            registry: Arc::clone(&self.registry),
            breakers: Arc::clone(&self.breakers),
            endnodes: Arc::clone(&self.endnodes),
            timeouts: Arc::clone(&self.timeouts),
            engine_factory: Arc::clone(&self.engine_factory),
            engines: self.engines.clone(),
            complexity: self.complexity.clone(),
            input_capacity: self.config.instance_capacity,
        };
        let instance = ComponentInstance::spawn(&ctx, scaling.next_index);
        scaling.instances.push(instance);
    }
}

fn spawn_distributor(
    balancer: Arc<ComponentBalancer>,
    mut input: mpsc::Receiver<Envelope>,
) -> JoinHandle<()> {
    let mut shutdown = balancer.shutdown.subscribe();
    tokio::spawn(async move {
        loop {
            let envelope = tokio::select! {
                _ = shutdown.changed() => break,
                received = input.recv() => match received {
                    Some(envelope) => envelope,
                    None => break,
                },
            };
            balancer.dispatch(envelope);
        }
    })
}

fn spawn_scaler(balancer: Arc<ComponentBalancer>) -> JoinHandle<()> {
    let mut shutdown = balancer.shutdown.subscribe();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(balancer.config.scale_check_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tick.tick() => balancer.evaluate_scaling(),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerConfig;
    use crate::endnode::EndNodeConfig;
    use crate::engine::FixedLatencyFactory;
    use flux_common::RequestStatus;
    use flux_graph::{GraphSpec, NodeKind, NodeSpec, RoutingKind};
    use std::collections::BTreeMap;

    fn simple_graph() -> GraphSpec {
        GraphSpec {
            name: "web".into(),
            start_node: "work".into(),
            end_nodes: vec!["done".into()],
            nodes: BTreeMap::from([
                (
                    "work".to_string(),
                    NodeSpec {
                        kind: NodeKind::Engine,
                        engine: Some(EngineType::Cpu),
                        conditions: BTreeMap::from([(
                            "default".to_string(),
                            "done".to_string(),
                        )]),
                        next: None,
                        routing_type: RoutingKind::Standard,
                        probability_config: None,
                        state_config: None,
                    },
                ),
                (
                    "done".to_string(),
                    NodeSpec {
                        kind: NodeKind::End,
                        engine: None,
                        conditions: BTreeMap::new(),
                        next: None,
                        routing_type: RoutingKind::Standard,
                        probability_config: None,
                        state_config: None,
                    },
                ),
            ]),
            external_targets: vec![],
        }
    }

    fn balancer_with(config: BalancerConfig) -> Arc<ComponentBalancer> {
        let registry = Arc::new(ComponentRegistry::new());
        let endnodes = Arc::new(EndNodeSystem::new(
            EndNodeConfig::default(),
            Arc::clone(&registry),
        ));
        let timeouts = Arc::new(TimeoutManager::new(Arc::clone(&endnodes)));
        Arc::new(
            ComponentBalancer::new(
                "web".into(),
                ComponentType::WebServer,
                config,
                DecisionGraph::compile(simple_graph()).unwrap(),
                vec![EngineType::Cpu],
                HashMap::new(),
                registry,
                Arc::new(BreakerManager::new(BreakerConfig::default())),
                endnodes,
                timeouts,
                Arc::new(FixedLatencyFactory::new(Duration::from_micros(50))),
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_config_validation() {
        let registry = Arc::new(ComponentRegistry::new());
        let endnodes = Arc::new(EndNodeSystem::new(
            EndNodeConfig::default(),
            Arc::clone(&registry),
        ));
        let timeouts = Arc::new(TimeoutManager::new(Arc::clone(&endnodes)));
        let result = ComponentBalancer::new(
            "web".into(),
            ComponentType::WebServer,
            BalancerConfig { min_instances: 3, max_instances: 2, ..Default::default() },
            DecisionGraph::compile(simple_graph()).unwrap(),
            vec![EngineType::Cpu],
            HashMap::new(),
            registry,
            Arc::new(BreakerManager::new(BreakerConfig::default())),
            endnodes,
            timeouts,
            Arc::new(FixedLatencyFactory::default()),
        );
        assert!(matches!(result, Err(SimError::Config(_))));
    }

    #[tokio::test]
    async fn test_instance_count_stays_within_bounds() {
        let balancer = balancer_with(BalancerConfig {
            algorithm: BalanceAlgorithm::RoundRobin,
            min_instances: 1,
            max_instances: 2,
            ..Default::default()
        });
        ComponentBalancer::start(&balancer).unwrap();
        assert_eq!(balancer.instance_count(), 1);

        assert_eq!(balancer.scale_up().unwrap(), 2);
        // at the max floor: no-op
        assert_eq!(balancer.scale_up().unwrap(), 2);
        assert_eq!(balancer.scale_down().unwrap(), 1);
        // at the min floor: no-op
        assert_eq!(balancer.scale_down().unwrap(), 1);

        balancer.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_round_robin_spreads_evenly() {
        let balancer = balancer_with(BalancerConfig {
            algorithm: BalanceAlgorithm::RoundRobin,
            min_instances: 3,
            max_instances: 3,
            ..Default::default()
        });
        ComponentBalancer::start(&balancer).unwrap();

        for i in 0..6 {
            let op = Operation::new(format!("op{i}"), "read_request");
            balancer.submit(op, Arc::new(Request::new(Default::default()))).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        let counts: Vec<u64> =
            balancer.instances().iter().map(|i| i.accepted_count()).collect();
        assert_eq!(counts, vec![2, 2, 2]);
        assert!(balancer.last_scale_up().is_none());
        balancer.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_full_input_returns_routing_error() {
        let balancer = balancer_with(BalancerConfig {
            input_capacity: 2,
            ..Default::default()
        });
        // running flag on, but no distributor draining the input
        balancer.running.store(true, Ordering::SeqCst);

        for i in 0..2 {
            let op = Operation::new(format!("op{i}"), "read_request");
            balancer.submit(op, Arc::new(Request::new(Default::default()))).unwrap();
        }
        let op = Operation::new("op-overflow", "read_request");
        let err = balancer
            .submit(op, Arc::new(Request::new(Default::default())))
            .unwrap_err();
        assert!(matches!(err, SimError::Routing(_)));
        assert_eq!(balancer.metrics().rejected.get(), 1);
    }

    #[tokio::test]
    async fn test_auto_scale_up_and_cooldown() {
        let balancer = balancer_with(BalancerConfig {
            algorithm: BalanceAlgorithm::RoundRobin,
            min_instances: 1,
            max_instances: 3,
            auto_scaling: true,
            scale_up_cooldown: Duration::from_secs(60),
            ..Default::default()
        });
        ComponentBalancer::start(&balancer).unwrap();

        // high fill on a fresh balancer scales up once
        balancer.apply_scaling_decision(0.9);
        assert_eq!(balancer.instance_count(), 2);
        let first = balancer.last_scale_up().expect("timestamp refreshed");

        // inside the cooldown nothing happens
        balancer.apply_scaling_decision(0.95);
        assert_eq!(balancer.instance_count(), 2);
        assert_eq!(balancer.last_scale_up(), Some(first));

        balancer.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_auto_scale_down_respects_min() {
        let balancer = balancer_with(BalancerConfig {
            algorithm: BalanceAlgorithm::RoundRobin,
            min_instances: 1,
            max_instances: 3,
            auto_scaling: true,
            scale_down_cooldown: Duration::from_millis(0),
            ..Default::default()
        });
        ComponentBalancer::start(&balancer).unwrap();
        balancer.scale_up().unwrap();
        assert_eq!(balancer.instance_count(), 2);

        balancer.apply_scaling_decision(0.0);
        assert_eq!(balancer.instance_count(), 1);
        // at the min floor the decision is a no-op
        balancer.apply_scaling_decision(0.0);
        assert_eq!(balancer.instance_count(), 1);

        balancer.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_health_aware_scales_when_all_unhealthy() {
        let balancer = balancer_with(BalancerConfig {
            algorithm: BalanceAlgorithm::HealthAware,
            min_instances: 2,
            max_instances: 3,
            auto_scaling: true,
            ..Default::default()
        });
        ComponentBalancer::start(&balancer).unwrap();
        for instance in balancer.instances() {
            instance.set_health(0.3);
        }

        let chosen = balancer.select_instance(true).unwrap();
        assert_eq!(balancer.instance_count(), 3);
        assert!(chosen.health() > 0.5);

        balancer.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_weighted_selection_follows_ratios() {
        let balancer = balancer_with(BalancerConfig {
            algorithm: BalanceAlgorithm::Weighted,
            min_instances: 2,
            max_instances: 2,
            instance_weights: vec![3, 1],
            ..Default::default()
        });
        ComponentBalancer::start(&balancer).unwrap();

        let mut counts = [0usize; 2];
        let instances = balancer.instances();
        for _ in 0..40 {
            let chosen = balancer.select_instance(true).unwrap();
            let index = instances.iter().position(|i| i.id() == chosen.id()).unwrap();
            counts[index] += 1;
        }
        assert_eq!(counts, [30, 10]);

        balancer.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_end_to_end_completion() {
        let balancer = balancer_with(BalancerConfig {
            algorithm: BalanceAlgorithm::LeastConnections,
            min_instances: 2,
            max_instances: 2,
            ..Default::default()
        });
        ComponentBalancer::start(&balancer).unwrap();

        let request = Arc::new(Request::new(Default::default()));
        balancer
            .submit(Operation::new("op1", "read_request"), Arc::clone(&request))
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while !request.is_terminal() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(request.status(), RequestStatus::Completed);
        balancer.stop().await.unwrap();
    }
}
