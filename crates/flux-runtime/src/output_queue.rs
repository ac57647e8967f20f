//! Engine output queue
//!
//! Exactly one EOQ exists per (instance, engine) pair. It is the
//! single routing point after an engine runs: it receives the
//! (envelope, result) pair, updates the request's position, consults
//! the decision graph, and dispatches to the next engine in the same
//! instance, to another component through its circuit breaker, or to
//! a terminal end node.

use crate::{
    breaker::BreakerManager, channel_fill, endnode::EndNodeSystem,
    registry::ComponentRegistry, timeout::TimeoutManager, Envelope,
};
use flux_common::{
    metrics::RoutingMetrics, EngineType, OperationResult, SimError,
};
use flux_graph::{DecisionGraph, Destination, SystemState};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Routing point for one engine of one instance.
pub struct EngineOutputQueue {
    instance_id: String,
    component_id: String,
    engine: EngineType,
    graph: Arc<DecisionGraph>,
    engines: HashMap<EngineType, mpsc::Sender<Envelope>>,
    output: mpsc::Sender<Envelope>,
    registry: Arc<ComponentRegistry>,
    breakers: Arc<BreakerManager>,
    endnodes: Arc<EndNodeSystem>,
    timeouts: Arc<TimeoutManager>,
    metrics: RoutingMetrics,
}

impl EngineOutputQueue {
    /// Queue for `engine` inside `instance_id`.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        instance_id: String,
        component_id: String,
        engine: EngineType,
        graph: Arc<DecisionGraph>,
        engines: HashMap<EngineType, mpsc::Sender<Envelope>>,
        output: mpsc::Sender<Envelope>,
        registry: Arc<ComponentRegistry>,
        breakers: Arc<BreakerManager>,
        endnodes: Arc<EndNodeSystem>,
        timeouts: Arc<TimeoutManager>,
    ) -> Self {
        Self {
            instance_id,
            component_id,
            engine,
            graph,
            engines,
            output,
            registry,
            breakers,
            endnodes,
            timeouts,
            metrics: RoutingMetrics::default(),
        }
    }

    /// Engine this queue belongs to.
    pub fn engine(&self) -> EngineType {
        self.engine
    }

    /// Routing counters.
    pub fn metrics(&self) -> &RoutingMetrics {
        &self.metrics
    }

    /// Spawn the queue's dispatch loop.
    pub(crate) fn spawn(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<(Envelope, OperationResult)>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let (envelope, result) = tokio::select! {
                    _ = shutdown.changed() => break,
                    received = rx.recv() => match received {
                        Some(pair) => pair,
                        None => break,
                    },
                };
                self.handle(envelope, result);
            }
            tracing::debug!(
                instance = %self.instance_id,
                engine = %self.engine,
                "output queue stopped"
            );
        })
    }

    /// Route one engine result.
    fn handle(&self, envelope: Envelope, result: OperationResult) {
        let started = Instant::now();
        let request = Arc::clone(&envelope.request);

        // expired requests were already diverted by the timeout manager
        if request.is_terminal() {
            self.metrics.timeouts.inc();
            return;
        }

        let position = request.position();
        let from_node = if position.node.is_empty() {
            self.graph.start_node().to_string()
        } else {
            position.node
        };

        let state = self.sample_state();
        match self.graph.route_from(&from_node, &envelope.operation, &result, &state) {
            Ok(Destination::Engine { node, engine }) => {
                self.forward_internal(envelope, node, engine);
            }
            Ok(Destination::External(target)) => {
                self.forward_external(envelope, &target);
            }
            Ok(Destination::End(node)) => {
                self.terminate(envelope, &result, &node);
            }
            Err(err) => {
                self.metrics.errors.inc();
                self.timeouts.cancel(&request.id);
                self.endnodes.route_error(envelope, &err);
            }
        }
        self.metrics.record_decision(started.elapsed());
    }

    fn forward_internal(&self, envelope: Envelope, node: String, engine: EngineType) {
        let Some(tx) = self.engines.get(&engine) else {
            let err = SimError::Routing(format!(
                "engine {engine} is not wired in instance {}",
                self.instance_id
            ));
            self.metrics.errors.inc();
            self.endnodes.route_error(envelope, &err);
            return;
        };
        envelope.request.enter_engine(engine.as_str(), &node);
        match tx.try_send(envelope) {
            Ok(()) => {
                self.metrics.internal.inc();
            }
            Err(mpsc::error::TrySendError::Full(envelope))
            | Err(mpsc::error::TrySendError::Closed(envelope)) => {
                let err = SimError::channel_full(&format!("engine {engine}"));
                self.metrics.errors.inc();
                self.timeouts.cancel(&envelope.request.id);
                self.endnodes.route_error(envelope, &err);
            }
        }
    }

    fn forward_external(&self, envelope: Envelope, target: &str) {
        // keep a handle so a failed dispatch can still reach the error sink
        let backup = envelope.clone();
        match self.breakers.dispatch(&self.registry, target, envelope) {
            Ok(()) => {
                self.metrics.external.inc();
            }
            Err(err) => {
                self.metrics.errors.inc();
                self.timeouts.cancel(&backup.request.id);
                self.endnodes.route_error(backup, &err);
            }
        }
    }

    fn terminate(&self, envelope: Envelope, result: &OperationResult, node: &str) {
        let request = &envelope.request;
        request.set_node(node);
        if result.success {
            request.complete();
        } else {
            let err = SimError::EngineFailure {
                engine: self.engine.to_string(),
                reason: "engine reported failure".into(),
            };
            request.fail(err.to_string());
        }
        self.timeouts.cancel(&request.id);
        self.metrics.terminal.inc();
        match self.output.try_send(envelope) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(envelope))
            | Err(mpsc::error::TrySendError::Closed(envelope)) => {
                // egress is saturated; record the terminal state directly
                let _ = self.endnodes.route_by_status(envelope);
            }
        }
    }

    /// Sample the signals dynamic state-based routing reads: component
    /// load from the registry, memory pressure from the engine inputs,
    /// and latency from this queue's rolling average.
    fn sample_state(&self) -> SystemState {
        let engine_fill = if self.engines.is_empty() {
            0.0
        } else {
            self.engines.values().map(channel_fill).sum::<f64>() / self.engines.len() as f64
        };
        let latency_ms = self.metrics.latency_us.get() / 1000.0;
        SystemState {
            system_load: self.registry.fill(&self.component_id),
            memory_usage: engine_fill,
            storage_latency: latency_ms,
            network_latency: latency_ms,
            peak_hours: false,
        }
    }
}
