//! Component instance
//!
//! One running copy of a component: a bounded input channel, one
//! engine worker per required engine, one output queue per engine, and
//! an egress forwarder that hands terminal envelopes to the end-node
//! system. Ready/shutdown flags are atomics so dispatchers can skip
//! locks on the hot path.

use crate::{
    breaker::BreakerManager,
    channel_fill, channel_len,
    endnode::EndNodeSystem,
    engine::{spawn_worker, EngineFactory},
    output_queue::EngineOutputQueue,
    registry::ComponentRegistry,
    timeout::TimeoutManager,
    Envelope, ENGINE_INPUT_CAPACITY, EOQ_INPUT_CAPACITY,
};
use flux_common::{Counter, EngineType, OperationResult, SimError, SimResult};
use flux_graph::{DecisionGraph, Destination, SystemState};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Everything a balancer hands to each instance it creates.
pub(crate) struct InstanceContext {
    pub component_id: String,
    pub graph: Arc<DecisionGraph>,
    pub registry: Arc<ComponentRegistry>,
    pub breakers: Arc<BreakerManager>,
    pub endnodes: Arc<EndNodeSystem>,
    pub timeouts: Arc<TimeoutManager>,
    pub engine_factory: Arc<dyn EngineFactory>,
    pub engines: Vec<EngineType>,
    pub complexity: HashMap<EngineType, u32>,
    pub input_capacity: usize,
}

/// One running copy of a component.
pub struct ComponentInstance {
    id: String,
    component_id: String,
    input_tx: mpsc::Sender<Envelope>,
    output_tx: mpsc::Sender<Envelope>,
    engine_txs: HashMap<EngineType, mpsc::Sender<Envelope>>,
    eoq_txs: HashMap<EngineType, mpsc::Sender<(Envelope, OperationResult)>>,
    eoqs: HashMap<EngineType, Arc<EngineOutputQueue>>,
    graph: Arc<DecisionGraph>,
    registry: Arc<ComponentRegistry>,
    breakers: Arc<BreakerManager>,
    endnodes: Arc<EndNodeSystem>,
    timeouts: Arc<TimeoutManager>,
    health: RwLock<f64>,
    accepted: Counter,
    busy: Arc<AtomicUsize>,
    ready: AtomicBool,
    shutting_down: AtomicBool,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ComponentInstance {
    /// Build and start instance number `index` of a component: wire
    /// engine workers and their output queues, then spawn the intake
    /// and egress loops.
    pub(crate) fn spawn(ctx: &InstanceContext, index: usize) -> Arc<Self> {
        let id = format!("{}-instance-{}", ctx.component_id, index);
        let (input_tx, input_rx) = mpsc::channel(ctx.input_capacity);
        let (output_tx, output_rx) = mpsc::channel(ctx.input_capacity);
        let (shutdown, _) = watch::channel(false);

        let mut engine_txs = HashMap::new();
        let mut engine_rxs = HashMap::new();
        let mut eoq_txs = HashMap::new();
        let mut eoq_rxs = HashMap::new();
        for &engine in &ctx.engines {
            let (etx, erx) = mpsc::channel(ENGINE_INPUT_CAPACITY);
            let (qtx, qrx) = mpsc::channel(EOQ_INPUT_CAPACITY);
            engine_txs.insert(engine, etx);
            engine_rxs.insert(engine, erx);
            eoq_txs.insert(engine, qtx);
            eoq_rxs.insert(engine, qrx);
        }

        let mut eoqs = HashMap::new();
        for &engine in &ctx.engines {
            eoqs.insert(
                engine,
                Arc::new(EngineOutputQueue::new(
                    id.clone(),
                    ctx.component_id.clone(),
                    engine,
                    Arc::clone(&ctx.graph),
                    engine_txs.clone(),
                    output_tx.clone(),
                    Arc::clone(&ctx.registry),
                    Arc::clone(&ctx.breakers),
                    Arc::clone(&ctx.endnodes),
                    Arc::clone(&ctx.timeouts),
                )),
            );
        }

        let instance = Arc::new(Self {
            id: id.clone(),
            component_id: ctx.component_id.clone(),
            input_tx,
            output_tx,
            engine_txs,
            eoq_txs: eoq_txs.clone(),
            eoqs: eoqs.clone(),
            graph: Arc::clone(&ctx.graph),
            registry: Arc::clone(&ctx.registry),
            breakers: Arc::clone(&ctx.breakers),
            endnodes: Arc::clone(&ctx.endnodes),
            timeouts: Arc::clone(&ctx.timeouts),
            health: RwLock::new(1.0),
            accepted: Counter::new(0),
            busy: Arc::new(AtomicUsize::new(0)),
            ready: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        });

        let mut tasks = Vec::new();
        for &engine in &ctx.engines {
            let complexity = ctx.complexity.get(&engine).copied().unwrap_or(1);
            let model = ctx.engine_factory.create(engine, &ctx.component_id, complexity);
            tasks.push(spawn_worker(
                model,
                engine_rxs.remove(&engine).expect("engine input wired above"),
                eoq_txs.remove(&engine).expect("eoq input wired above"),
                Arc::clone(&ctx.endnodes),
                Arc::clone(&instance.busy),
                instance.shutdown.subscribe(),
            ));
            let eoq = Arc::clone(&eoqs[&engine]);
            tasks.push(eoq.spawn(
                eoq_rxs.remove(&engine).expect("eoq output wired above"),
                instance.shutdown.subscribe(),
            ));
        }
        tasks.push(Self::spawn_intake(Arc::clone(&instance), input_rx));
        tasks.push(Self::spawn_egress(Arc::clone(&instance), output_rx));
        *instance.tasks.lock() = tasks;

        instance.ready.store(true, Ordering::SeqCst);
        tracing::info!(instance = %id, "instance started");
        instance
    }

    fn spawn_intake(instance: Arc<Self>, mut input: mpsc::Receiver<Envelope>) -> JoinHandle<()> {
        let mut shutdown = instance.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                let envelope = tokio::select! {
                    _ = shutdown.changed() => break,
                    received = input.recv() => match received {
                        Some(envelope) => envelope,
                        None => break,
                    },
                };
                instance.accept(envelope);
            }
        })
    }

    fn spawn_egress(instance: Arc<Self>, mut output: mpsc::Receiver<Envelope>) -> JoinHandle<()> {
        let mut shutdown = instance.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                let envelope = tokio::select! {
                    _ = shutdown.changed() => break,
                    received = output.recv() => match received {
                        Some(envelope) => envelope,
                        None => break,
                    },
                };
                if let Err(err) = instance.endnodes.route_by_status(envelope) {
                    tracing::warn!(instance = %instance.id, %err, "egress routing failed");
                }
            }
        })
    }

    /// Route one accepted envelope into the graph's entry destination.
    fn accept(&self, envelope: Envelope) {
        let request = &envelope.request;
        if request.is_terminal() {
            return;
        }
        self.accepted.inc();
        request.enter_component(&self.component_id);

        let state = SystemState {
            system_load: self.registry.fill(&self.component_id),
            memory_usage: channel_fill(&self.input_tx),
            ..Default::default()
        };
        match self.graph.entry(&envelope.operation, &state) {
            Ok(Destination::Engine { node, engine }) => {
                let Some(tx) = self.engine_txs.get(&engine) else {
                    let err = SimError::Routing(format!(
                        "engine {engine} is not wired in instance {}",
                        self.id
                    ));
                    self.endnodes.route_error(envelope, &err);
                    return;
                };
                request.enter_engine(engine.as_str(), &node);
                if let Err(mpsc::error::TrySendError::Full(envelope))
                | Err(mpsc::error::TrySendError::Closed(envelope)) = tx.try_send(envelope)
                {
                    let err = SimError::channel_full(&format!("engine {engine}"));
                    self.endnodes.route_error(envelope, &err);
                }
            }
            Ok(Destination::External(target)) => {
                let backup = envelope.clone();
                if let Err(err) = self.breakers.dispatch(&self.registry, &target, envelope) {
                    self.endnodes.route_error(backup, &err);
                }
            }
            Ok(Destination::End(node)) => {
                request.set_node(&node);
                request.complete();
                self.timeouts.cancel(&request.id);
                if let Err(mpsc::error::TrySendError::Full(envelope))
                | Err(mpsc::error::TrySendError::Closed(envelope)) =
                    self.output_tx.try_send(envelope)
                {
                    let _ = self.endnodes.route_by_status(envelope);
                }
            }
            Err(err) => {
                self.endnodes.route_error(envelope, &err);
            }
        }
    }

    /// Instance id, `<component>-instance-<n>`.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Clone of the input channel.
    pub fn input(&self) -> mpsc::Sender<Envelope> {
        self.input_tx.clone()
    }

    /// Queued operations in the input channel.
    pub fn input_len(&self) -> usize {
        channel_len(&self.input_tx)
    }

    /// Fill fraction of the input channel.
    pub fn input_fill(&self) -> f64 {
        channel_fill(&self.input_tx)
    }

    /// Operations queued or processing anywhere inside the instance.
    pub fn pending(&self) -> usize {
        channel_len(&self.input_tx)
            + channel_len(&self.output_tx)
            + self.engine_txs.values().map(channel_len).sum::<usize>()
            + self.eoq_txs.values().map(channel_len).sum::<usize>()
            + self.busy.load(Ordering::SeqCst)
    }

    /// Operations this instance has accepted.
    pub fn accepted_count(&self) -> u64 {
        self.accepted.get()
    }

    /// Health score in [0,1].
    pub fn health(&self) -> f64 {
        *self.health.read()
    }

    /// Update the health score, clamped into [0,1].
    pub fn set_health(&self, health: f64) {
        *self.health.write() = flux_common::clamp_health(health);
    }

    /// Whether the instance accepts new work.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst) && !self.shutting_down.load(Ordering::SeqCst)
    }

    /// Output queue for an engine, if wired.
    pub fn output_queue(&self, engine: EngineType) -> Option<Arc<EngineOutputQueue>> {
        self.eoqs.get(&engine).cloned()
    }

    /// Stop the instance: refuse new work, let in-flight operations
    /// finish up to `deadline`, then cancel the actor tasks.
    pub async fn stop(&self, deadline: Duration) -> SimResult<()> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return Err(SimError::Lifecycle(format!(
                "instance {} already stopping",
                self.id
            )));
        }
        self.ready.store(false, Ordering::SeqCst);

        let until = Instant::now() + deadline;
        while self.pending() > 0 && Instant::now() < until {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        if self.pending() > 0 {
            tracing::warn!(instance = %self.id, pending = self.pending(), "stop deadline hit");
        }

        let _ = self.shutdown.send(true);
        let handles: Vec<_> = self.tasks.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        tracing::info!(instance = %self.id, "instance stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerConfig;
    use crate::endnode::EndNodeConfig;
    use crate::engine::FixedLatencyFactory;
    use flux_common::{Operation, Request, RequestStatus};
    use flux_graph::{GraphSpec, NodeKind, NodeSpec, RoutingKind};
    use std::collections::BTreeMap;

    fn linear_graph() -> GraphSpec {
        let engine_node = |engine: EngineType, next: &str| NodeSpec {
            kind: NodeKind::Engine,
            engine: Some(engine),
            conditions: BTreeMap::from([("default".to_string(), next.to_string())]),
            next: None,
            routing_type: RoutingKind::Standard,
            probability_config: None,
            state_config: None,
        };
        GraphSpec {
            name: "cache".into(),
            start_node: "lookup".into(),
            end_nodes: vec!["done".into()],
            nodes: BTreeMap::from([
                ("lookup".to_string(), engine_node(EngineType::Cpu, "store")),
                ("store".to_string(), engine_node(EngineType::Memory, "done")),
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

    fn context() -> InstanceContext {
        let registry = Arc::new(ComponentRegistry::new());
        let endnodes = Arc::new(EndNodeSystem::new(
            EndNodeConfig::default(),
            Arc::clone(&registry),
        ));
        InstanceContext {
            component_id: "cache".into(),
            graph: Arc::new(DecisionGraph::compile(linear_graph()).unwrap()),
            registry,
            breakers: Arc::new(BreakerManager::new(BreakerConfig::default())),
            timeouts: Arc::new(TimeoutManager::new(Arc::clone(&endnodes))),
            endnodes,
            engine_factory: Arc::new(FixedLatencyFactory::new(Duration::from_micros(50))),
            engines: vec![EngineType::Cpu, EngineType::Memory],
            complexity: HashMap::new(),
            input_capacity: 16,
        }
    }

    async fn wait_terminal(request: &Arc<Request>) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !request.is_terminal() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_request_traverses_both_engines() {
        let ctx = context();
        let instance = ComponentInstance::spawn(&ctx, 1);
        assert_eq!(instance.id(), "cache-instance-1");
        assert!(instance.is_ready());

        let op = Operation::new("op1", "read_request").with_data_size(32_000);
        let request = Arc::new(Request::tracked(Default::default()));
        ctx.endnodes.request_started();
        instance.input().try_send(Envelope::new(op, Arc::clone(&request))).unwrap();

        wait_terminal(&request).await;
        assert_eq!(request.status(), RequestStatus::Completed);
        assert_eq!(request.component_count(), 1);
        assert_eq!(request.engine_count(), 2);

        // the egress forwarder records the request asynchronously
        let deadline = Instant::now() + Duration::from_secs(1);
        while ctx.endnodes.record(&request.id).is_none() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let record = ctx.endnodes.record(&request.id).expect("terminal record");
        assert_eq!(record.end_node, "success");

        instance.stop(Duration::from_millis(500)).await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_drains_in_flight_work() {
        let ctx = context();
        let instance = ComponentInstance::spawn(&ctx, 1);

        let mut requests = Vec::new();
        for i in 0..5 {
            let op = Operation::new(format!("op{i}"), "read_request");
            let request = Arc::new(Request::new(Default::default()));
            ctx.endnodes.request_started();
            instance.input().try_send(Envelope::new(op, Arc::clone(&request))).unwrap();
            requests.push(request);
        }

        instance.stop(Duration::from_secs(2)).await.unwrap();
        assert!(!instance.is_ready());
        for request in &requests {
            assert_eq!(request.status(), RequestStatus::Completed);
        }
    }

    #[tokio::test]
    async fn test_double_stop_is_a_lifecycle_error() {
        let ctx = context();
        let instance = ComponentInstance::spawn(&ctx, 1);
        instance.stop(Duration::from_millis(100)).await.unwrap();
        assert!(matches!(
            instance.stop(Duration::from_millis(100)).await,
            Err(SimError::Lifecycle(_))
        ));
    }
}
