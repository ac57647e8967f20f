//! Request journey state
//!
//! A request is the end-to-end unit flowing across components. It is
//! shared by reference (`Arc<Request>`): every component that touches it
//! observes the same data record and position markers.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;
use uuid::Uuid;

/// Lifecycle status of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    /// In flight
    Active,
    /// Parked while a named subflow runs
    WaitingForSubflow,
    /// Reached a success end node
    Completed,
    /// Failed, timed out, or was rejected
    Failed,
}

/// Mutable payload shared by every component a request touches.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestData {
    /// Originating user
    pub user_id: String,
    /// Logical operation name (e.g. `checkout`)
    pub operation: String,
    /// Opaque payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    /// Result slot written by auth components
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_result: Option<serde_json::Value>,
    /// Result slot written by inventory components
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inventory_result: Option<serde_json::Value>,
    /// Result slot written by payment components
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_result: Option<serde_json::Value>,
}

/// Ordered list of named flows a request traverses in sequence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowChain {
    /// Flow names, in traversal order
    pub flows: Vec<String>,
    /// Index of the flow currently executing
    pub cursor: usize,
    /// Per-flow results keyed by flow name
    #[serde(default)]
    pub results: HashMap<String, serde_json::Value>,
}

impl FlowChain {
    /// Chain over the given flow names.
    pub fn new(flows: Vec<String>) -> Self {
        Self { flows, cursor: 0, results: HashMap::new() }
    }

    /// Name of the flow at the cursor, if any remain.
    pub fn current(&self) -> Option<&str> {
        self.flows.get(self.cursor).map(String::as_str)
    }

    /// Record the current flow's result and advance. Returns the next
    /// flow name, or `None` when the chain is exhausted.
    pub fn advance(&mut self, result: serde_json::Value) -> Option<&str> {
        if let Some(name) = self.flows.get(self.cursor) {
            self.results.insert(name.clone(), result);
            self.cursor += 1;
        }
        self.current()
    }

    /// Whether every flow in the chain has completed.
    pub fn is_exhausted(&self) -> bool {
        self.cursor >= self.flows.len()
    }
}

/// One step of a tracked request's journey.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    /// Component the request was in
    pub component: String,
    /// Engine within the component, if any
    pub engine: Option<String>,
    /// Graph node, if any
    pub node: Option<String>,
    /// When the step was recorded
    pub at: Instant,
}

/// Position markers: where the request currently sits.
#[derive(Debug, Clone, Default)]
pub struct Position {
    /// Current component id
    pub component: String,
    /// Current engine name
    pub engine: String,
    /// Current decision-graph node id
    pub node: String,
}

/// A synthetic request flowing through the simulated architecture.
///
/// All mutable fields use interior mutability so the request can be
/// shared across actors without copying. History is appended only at
/// the request's current EOQ, so it is totally ordered.
#[derive(Debug)]
pub struct Request {
    /// Unique request id
    pub id: Uuid,
    /// Shared data record
    pub data: RwLock<RequestData>,
    /// Flow chain for multi-flow journeys
    pub flow_chain: RwLock<FlowChain>,
    history: Option<RwLock<Vec<HistoryEntry>>>,
    component_count: AtomicU32,
    engine_count: AtomicU32,
    position: RwLock<Position>,
    status: RwLock<RequestStatus>,
    /// When the request entered the system
    pub started_at: Instant,
    ended_at: RwLock<Option<Instant>>,
    failure: RwLock<Option<String>>,
}

impl Request {
    /// Create an untracked request.
    pub fn new(data: RequestData) -> Self {
        Self::build(data, false)
    }

    /// Create a request with history tracking enabled.
    pub fn tracked(data: RequestData) -> Self {
        Self::build(data, true)
    }

    fn build(data: RequestData, tracked: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            data: RwLock::new(data),
            flow_chain: RwLock::new(FlowChain::default()),
            history: tracked.then(|| RwLock::new(Vec::new())),
            component_count: AtomicU32::new(0),
            engine_count: AtomicU32::new(0),
            position: RwLock::new(Position::default()),
            status: RwLock::new(RequestStatus::Active),
            started_at: Instant::now(),
            ended_at: RwLock::new(None),
            failure: RwLock::new(None),
        }
    }

    /// Whether history tracking is enabled.
    pub fn is_tracked(&self) -> bool {
        self.history.is_some()
    }

    /// Record entry into a component. Increments the component counter
    /// only when the component differs from the current position.
    pub fn enter_component(&self, component: &str) {
        let mut pos = self.position.write();
        if pos.component != component {
            pos.component = component.to_string();
            pos.engine.clear();
            pos.node.clear();
            self.component_count.fetch_add(1, Ordering::Relaxed);
            self.record(component, None, None);
        }
    }

    /// Record entry into an engine of the current component.
    pub fn enter_engine(&self, engine: &str, node: &str) {
        let mut pos = self.position.write();
        pos.engine = engine.to_string();
        pos.node = node.to_string();
        self.engine_count.fetch_add(1, Ordering::Relaxed);
        let component = pos.component.clone();
        drop(pos);
        self.record(&component, Some(engine), Some(node));
    }

    /// Update the current graph node without touching counters.
    pub fn set_node(&self, node: &str) {
        self.position.write().node = node.to_string();
    }

    fn record(&self, component: &str, engine: Option<&str>, node: Option<&str>) {
        if let Some(history) = &self.history {
            history.write().push(HistoryEntry {
                component: component.to_string(),
                engine: engine.map(str::to_string),
                node: node.map(str::to_string),
                at: Instant::now(),
            });
        }
    }

    /// Snapshot of the position markers.
    pub fn position(&self) -> Position {
        self.position.read().clone()
    }

    /// Number of distinct components entered.
    pub fn component_count(&self) -> u32 {
        self.component_count.load(Ordering::Relaxed)
    }

    /// Number of engine passes.
    pub fn engine_count(&self) -> u32 {
        self.engine_count.load(Ordering::Relaxed)
    }

    /// Copy of the history log; empty when tracking is off.
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.history.as_ref().map(|h| h.read().clone()).unwrap_or_default()
    }

    /// Current status.
    pub fn status(&self) -> RequestStatus {
        *self.status.read()
    }

    /// Park the request while a subflow runs.
    pub fn wait_for_subflow(&self) {
        *self.status.write() = RequestStatus::WaitingForSubflow;
    }

    /// Resume an active journey after a subflow completes.
    pub fn resume(&self) {
        let mut status = self.status.write();
        if *status == RequestStatus::WaitingForSubflow {
            *status = RequestStatus::Active;
        }
    }

    /// Mark the request completed. Idempotent; a terminal status is
    /// never overwritten.
    pub fn complete(&self) {
        let mut status = self.status.write();
        if matches!(*status, RequestStatus::Active | RequestStatus::WaitingForSubflow) {
            *status = RequestStatus::Completed;
            *self.ended_at.write() = Some(Instant::now());
        }
    }

    /// Mark the request failed with a reason. Idempotent.
    pub fn fail(&self, reason: impl Into<String>) {
        let mut status = self.status.write();
        if matches!(*status, RequestStatus::Active | RequestStatus::WaitingForSubflow) {
            *status = RequestStatus::Failed;
            *self.ended_at.write() = Some(Instant::now());
            *self.failure.write() = Some(reason.into());
        }
    }

    /// Failure reason, if the request failed.
    pub fn failure(&self) -> Option<String> {
        self.failure.read().clone()
    }

    /// Put a failed request back in flight for an error retry.
    pub fn reactivate(&self) {
        let mut status = self.status.write();
        if *status == RequestStatus::Failed {
            *status = RequestStatus::Active;
            *self.ended_at.write() = None;
            *self.failure.write() = None;
        }
    }

    /// Whether the request reached a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self.status(), RequestStatus::Completed | RequestStatus::Failed)
    }

    /// When the request reached a terminal status.
    pub fn ended_at(&self) -> Option<Instant> {
        *self.ended_at.read()
    }
}
