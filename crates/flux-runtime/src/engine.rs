//! Engine surface
//!
//! Engines are black boxes to the routing plane: they consume an
//! operation and eventually produce a result. The runtime only needs
//! the `EngineModel` trait; `FixedLatencyEngine` is the deterministic
//! model wired in by default so factories and tests have something
//! concrete to run.

use crate::{endnode::EndNodeSystem, Envelope};
use flux_common::{EngineType, Operation, OperationResult, SimError};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// A latency model for one engine kind.
#[async_trait]
pub trait EngineModel: Send + Sync {
    /// Which engine kind this model simulates.
    fn engine_type(&self) -> EngineType;

    /// Process one operation and produce its result.
    async fn process(&self, op: &Operation) -> OperationResult;
}

/// Creates engine models when a balancer wires a new instance.
pub trait EngineFactory: Send + Sync {
    /// Model for `engine` inside `component_id`, scaled by the
    /// profile's complexity level.
    fn create(&self, engine: EngineType, component_id: &str, complexity: u32)
        -> Arc<dyn EngineModel>;
}

/// Deterministic engine model: complexity-scaled latency with optional
/// seeded failure injection.
pub struct FixedLatencyEngine {
    engine: EngineType,
    latency: Duration,
    failure_rate: f64,
    rng: Mutex<StdRng>,
}

impl FixedLatencyEngine {
    /// Model for `engine` sleeping `latency` per operation.
    pub fn new(engine: EngineType, latency: Duration) -> Self {
        Self {
            engine,
            latency,
            failure_rate: 0.0,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Inject failures at `rate` (0.0 never, 1.0 always).
    pub fn with_failure_rate(mut self, rate: f64) -> Self {
        self.failure_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Seed the failure-injection PRNG for replayable runs.
    pub fn with_seed(self, seed: u64) -> Self {
        *self.rng.lock() = StdRng::seed_from_u64(seed);
        self
    }
}

#[async_trait]
impl EngineModel for FixedLatencyEngine {
    fn engine_type(&self) -> EngineType {
        self.engine
    }

    async fn process(&self, op: &Operation) -> OperationResult {
        tokio::time::sleep(self.latency).await;
        let failed = self.failure_rate > 0.0 && {
            let mut rng = self.rng.lock();
            rng.gen_range(0.0..1.0) < self.failure_rate
        };
        if failed {
            OperationResult::failure(op, self.latency)
        } else {
            OperationResult::success(op, self.latency, op.data.clone())
                .with_metric("latency_ms", self.latency.as_secs_f64() * 1000.0)
        }
    }
}

/// Default factory producing `FixedLatencyEngine`s.
pub struct FixedLatencyFactory {
    base_latency: Duration,
    failure_rate: f64,
    seed: Option<u64>,
}

impl FixedLatencyFactory {
    /// Factory with a base per-operation latency.
    pub fn new(base_latency: Duration) -> Self {
        Self { base_latency, failure_rate: 0.0, seed: None }
    }

    /// Inject failures at `rate` into every created engine.
    pub fn with_failure_rate(mut self, rate: f64) -> Self {
        self.failure_rate = rate;
        self
    }

    /// Seed every created engine for replayable runs.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

impl Default for FixedLatencyFactory {
    fn default() -> Self {
        Self::new(Duration::from_micros(200))
    }
}

impl EngineFactory for FixedLatencyFactory {
    fn create(
        &self,
        engine: EngineType,
        _component_id: &str,
        complexity: u32,
    ) -> Arc<dyn EngineModel> {
        let latency = self.base_latency.saturating_mul(complexity.max(1));
        let mut model = FixedLatencyEngine::new(engine, latency).with_failure_rate(self.failure_rate);
        if let Some(seed) = self.seed {
            model = model.with_seed(seed);
        }
        Arc::new(model)
    }
}

/// Spawn the worker task for one engine of one instance: pull
/// envelopes from the engine input, run the model, deliver the result
/// into the engine's output queue. `busy` counts the operation while
/// it is inside the model so instance draining can see it.
pub(crate) fn spawn_worker(
    model: Arc<dyn EngineModel>,
    mut input: mpsc::Receiver<Envelope>,
    eoq: mpsc::Sender<(Envelope, OperationResult)>,
    endnodes: Arc<EndNodeSystem>,
    busy: Arc<AtomicUsize>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let envelope = tokio::select! {
                _ = shutdown.changed() => break,
                received = input.recv() => match received {
                    Some(envelope) => envelope,
                    None => break,
                },
            };
            busy.fetch_add(1, Ordering::SeqCst);
            // a request the timeout manager already expired is not worth
            // engine time
            if !envelope.request.is_terminal() {
                let result = model.process(&envelope.operation).await;
                if let Err(mpsc::error::TrySendError::Full(pair)) =
                    eoq.try_send((envelope, result))
                {
                    let (envelope, _) = pair;
                    let err = SimError::channel_full(&format!(
                        "{} output queue",
                        model.engine_type()
                    ));
                    endnodes.route_error(envelope, &err);
                }
            }
            busy.fetch_sub(1, Ordering::SeqCst);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fixed_latency_success() {
        let model = FixedLatencyEngine::new(EngineType::Cpu, Duration::from_millis(1));
        let op = Operation::new("op1", "read_request");
        let result = model.process(&op).await;
        assert!(result.success);
        assert_eq!(result.operation_type, "read_request");
        assert!(result.metrics.contains_key("latency_ms"));
    }

    #[tokio::test]
    async fn test_failure_injection_is_replayable() {
        async fn run(seed: u64) -> Vec<bool> {
            let op = Operation::new("op1", "read_request");
            let model = FixedLatencyEngine::new(EngineType::Cpu, Duration::ZERO)
                .with_failure_rate(0.5)
                .with_seed(seed);
            let mut outcomes = Vec::new();
            for _ in 0..20 {
                outcomes.push(model.process(&op).await.success);
            }
            outcomes
        }
        assert_eq!(run(9).await, run(9).await);
    }

    #[test]
    fn test_factory_scales_latency_with_complexity() {
        let factory = FixedLatencyFactory::new(Duration::from_millis(2));
        let model = factory.create(EngineType::Storage, "db", 5);
        assert_eq!(model.engine_type(), EngineType::Storage);
    }
}
