//! Fluxsim Runtime - the request routing and dispatch plane
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        COMPONENT BALANCER                        │
//! │      input (bounded) | selection | auto-scaling | instances      │
//! └───────────────┬──────────────────────────────────────────────────┘
//!                 │
//! ┌───────────────▼──────────────────────────────────────────────────┐
//! │                       COMPONENT INSTANCE                         │
//! │   input → decision graph entry → engine input → engine worker    │
//! │                                        │                         │
//! │                            ┌───────────▼───────────┐             │
//! │                            │   ENGINE OUTPUT QUEUE │             │
//! │                            │  graph → classify →   │             │
//! │                            │  engine | breaker |   │             │
//! │                            │  end node             │             │
//! └────────────────────────────┴───────────┬───────────┴─────────────┘
//!                                          │
//!            ┌─────────────────────────────▼────────────────────────┐
//!            │  GLOBAL REGISTRY | CIRCUIT BREAKERS | END-NODE SYSTEM│
//!            └──────────────────────────────────────────────────────┘
//! ```
//!
//! Every long-running actor is a tokio task; actors communicate only
//! through bounded mpsc channels, and every hot-path send is a
//! `try_send` that surfaces a routing error on a full channel.

#![warn(missing_docs)]

pub mod balancer;
pub mod breaker;
pub mod endnode;
pub mod engine;
pub mod factory;
pub mod instance;
pub mod output_queue;
pub mod registry;
pub mod runtime;
pub mod state;
pub mod timeout;

pub use balancer::{BalanceAlgorithm, BalancerConfig, ComponentBalancer};
pub use breaker::{BreakerConfig, BreakerManager, BreakerState, CircuitBreaker};
pub use endnode::{EndNodeConfig, EndNodeSystem};
pub use engine::{EngineFactory, EngineModel, FixedLatencyEngine, FixedLatencyFactory};
pub use factory::{ComponentFactory, ComponentProfile};
pub use instance::ComponentInstance;
pub use output_queue::EngineOutputQueue;
pub use registry::ComponentRegistry;
pub use runtime::{Simulation, SimulationConfig};
pub use state::{capture, restore, FileSink, MemorySink, StateSink, SystemSnapshot};
pub use timeout::TimeoutManager;

use flux_common::{Operation, Request};
use std::sync::Arc;

/// Default capacity of a component balancer's input channel.
pub const BALANCER_INPUT_CAPACITY: usize = 1000;
/// Default capacity of an instance's input channel.
pub const INSTANCE_INPUT_CAPACITY: usize = 100;
/// Default capacity of an engine's input channel.
pub const ENGINE_INPUT_CAPACITY: usize = 100;
/// Default capacity of an engine output queue.
pub const EOQ_INPUT_CAPACITY: usize = 1000;
/// Default capacity of an end node's input channel.
pub const ENDNODE_INPUT_CAPACITY: usize = 1000;

/// The unit that travels through channels: an operation plus the
/// request it belongs to. The request is shared by reference so every
/// component observes the same journey state.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// The operation being processed
    pub operation: Operation,
    /// The request the operation belongs to
    pub request: Arc<Request>,
}

impl Envelope {
    /// Wrap an operation and its request.
    pub fn new(operation: Operation, request: Arc<Request>) -> Self {
        Self { operation, request }
    }
}

/// Fill fraction of a bounded mpsc sender: 0.0 empty, 1.0 full.
pub(crate) fn channel_fill<T>(tx: &tokio::sync::mpsc::Sender<T>) -> f64 {
    let max = tx.max_capacity();
    if max == 0 {
        return 0.0;
    }
    1.0 - tx.capacity() as f64 / max as f64
}

/// Number of queued items in a bounded mpsc sender.
pub(crate) fn channel_len<T>(tx: &tokio::sync::mpsc::Sender<T>) -> usize {
    tx.max_capacity() - tx.capacity()
}
