//! End-node system
//!
//! Terminal sinks for completed, failed, and timed-out requests. Each
//! typed end node owns a bounded input and a processor task. The
//! system also owns draining on shutdown, the periodic cleanup of old
//! request records, and error classification with optional retry.

use crate::{registry::ComponentRegistry, Envelope, ENDNODE_INPUT_CAPACITY};
use flux_common::{Counter, RequestStatus, SimError, SimResult};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// End-node system tuning.
#[derive(Debug, Clone)]
pub struct EndNodeConfig {
    /// How long `stop()` waits for in-flight requests to terminate
    pub drain_timeout: Duration,
    /// Interval between cleanup passes
    pub cleanup_interval: Duration,
    /// How long terminal request records are retained
    pub request_retention: Duration,
    /// Whether the error end node re-injects recoverable failures
    pub error_retry_enabled: bool,
    /// Re-injections allowed per operation
    pub max_error_retries: u32,
    /// Base delay before a re-injection
    pub error_retry_delay: Duration,
    /// Capacity of each end node's input channel
    pub node_capacity: usize,
}

impl Default for EndNodeConfig {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(5),
            cleanup_interval: Duration::from_secs(5),
            request_retention: Duration::from_secs(60),
            error_retry_enabled: false,
            max_error_retries: 3,
            error_retry_delay: Duration::from_millis(100),
            node_capacity: ENDNODE_INPUT_CAPACITY,
        }
    }
}

/// Kinds of terminal sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndNodeKind {
    /// Requests that completed successfully
    Success,
    /// Failed requests; classifies and may retry
    Error,
    /// Requests expired by the timeout manager
    Timeout,
    /// Requests discarded during cleanup
    Cleanup,
    /// User-defined sink
    Custom,
}

impl EndNodeKind {
    fn for_name(name: &str) -> Self {
        match name {
            "success" => Self::Success,
            "error" => Self::Error,
            "timeout" => Self::Timeout,
            "cleanup" => Self::Cleanup,
            _ => Self::Custom,
        }
    }
}

/// Error category assigned by the error end node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Graph produced no usable destination
    Routing,
    /// Inter-component dispatch failed
    Dispatch,
    /// An engine reported failure
    Engine,
    /// Deadline exceeded
    Timeout,
    /// A bounded channel was full
    Congestion,
    /// Everything else
    Internal,
}

/// Severity of a classified error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    /// Expected during normal operation
    Info,
    /// Degraded but recoverable
    Warning,
    /// Needs operator attention
    Critical,
}

/// Classification the error end node assigns to a failure.
#[derive(Debug, Clone)]
pub struct ErrorClassification {
    /// Category
    pub category: ErrorCategory,
    /// Severity
    pub severity: ErrorSeverity,
    /// Whether a retry has a chance of succeeding
    pub recoverable: bool,
    /// Delay before a retry
    pub retry_delay: Duration,
}

/// Classify a failure reason string.
pub fn classify(reason: &str, base_delay: Duration) -> ErrorClassification {
    let (category, severity, recoverable, delay) = if reason.contains("timed out") {
        (ErrorCategory::Timeout, ErrorSeverity::Critical, true, base_delay * 2)
    } else if reason.contains("channel full") {
        (ErrorCategory::Congestion, ErrorSeverity::Warning, true, base_delay)
    } else if reason.contains("circuit breaker") {
        (ErrorCategory::Dispatch, ErrorSeverity::Warning, true, base_delay * 2)
    } else if reason.contains("engine failure") {
        (ErrorCategory::Engine, ErrorSeverity::Warning, true, base_delay)
    } else if reason.contains("dispatch error") {
        (ErrorCategory::Dispatch, ErrorSeverity::Warning, false, base_delay)
    } else if reason.contains("routing error") {
        (ErrorCategory::Routing, ErrorSeverity::Warning, false, base_delay)
    } else {
        (ErrorCategory::Internal, ErrorSeverity::Critical, false, base_delay)
    };
    ErrorClassification { category, severity, recoverable, retry_delay: delay }
}

/// Terminal record of one request.
#[derive(Debug, Clone)]
pub struct CompletedRecord {
    /// Request id
    pub request_id: Uuid,
    /// Terminal status
    pub status: RequestStatus,
    /// End node that recorded the request
    pub end_node: String,
    /// Distinct components the request entered
    pub component_count: u32,
    /// Engine passes
    pub engine_count: u32,
    /// Failure reason, if any
    pub error: Option<String>,
    /// When the record was written
    pub finished_at: Instant,
}

/// End-node counters.
#[derive(Debug, Default)]
pub struct EndNodeMetrics {
    /// Requests that reached the success sink
    pub completed: Counter,
    /// Requests that reached the error sink
    pub failed: Counter,
    /// Requests recorded as timeouts
    pub timeouts: Counter,
    /// Operations re-injected by the error end node
    pub retries: Counter,
    /// Records purged by the cleanup manager
    pub purged: Counter,
    /// Submissions refused while draining
    pub refused_draining: Counter,
}

struct EndJob {
    envelope: Envelope,
    node: String,
    kind: EndNodeKind,
    error: Option<String>,
}

/// State shared between the system handle and its processor tasks.
struct Core {
    config: EndNodeConfig,
    registry: Arc<ComponentRegistry>,
    records: DashMap<Uuid, CompletedRecord>,
    retry_counts: DashMap<String, u32>,
    metrics: EndNodeMetrics,
    draining: AtomicBool,
    in_flight: AtomicI64,
}

impl Core {
    fn finish(&self, job: EndJob) {
        let request = &job.envelope.request;
        // a request arriving here without a terminal status completed
        request.complete();
        let status = request.status();
        match (job.kind, status) {
            (EndNodeKind::Timeout, _) => {}
            (_, RequestStatus::Failed) => {
                self.metrics.failed.inc();
            }
            _ => {
                self.metrics.completed.inc();
            }
        }
        self.records.insert(
            request.id,
            CompletedRecord {
                request_id: request.id,
                status,
                end_node: job.node,
                component_count: request.component_count(),
                engine_count: request.engine_count(),
                error: job.error,
                finished_at: Instant::now(),
            },
        );
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) < 1 {
            self.in_flight.store(0, Ordering::SeqCst);
        }
    }

    fn purge_old_records(&self) {
        let retention = self.config.request_retention;
        let before = self.records.len();
        self.records.retain(|_, record| record.finished_at.elapsed() < retention);
        let purged = before - self.records.len();
        if purged > 0 {
            self.metrics.purged.add(purged as u64);
            tracing::debug!(purged, "cleanup purged request records");
        }
    }
}

async fn process_job(core: &Arc<Core>, job: EndJob) {
    if job.kind == EndNodeKind::Error && try_retry(core, &job) {
        return;
    }
    core.finish(job);
}

/// Error retry: recoverable failures are re-injected at the
/// operation's entry component after the classified delay.
fn try_retry(core: &Arc<Core>, job: &EndJob) -> bool {
    if !core.config.error_retry_enabled || core.draining.load(Ordering::SeqCst) {
        return false;
    }
    let reason = job.error.clone().unwrap_or_default();
    let class = classify(&reason, core.config.error_retry_delay);
    if !class.recoverable {
        return false;
    }
    let op = &job.envelope.operation;
    let attempts = core.retry_counts.get(&op.id).map(|c| *c).unwrap_or(0);
    if attempts >= core.config.max_error_retries {
        return false;
    }
    let Some(entry) = core.registry.channel(&op.component_id) else {
        return false;
    };

    core.retry_counts.insert(op.id.clone(), attempts + 1);
    core.metrics.retries.inc();
    tracing::info!(
        operation = %op.id,
        attempt = attempts + 1,
        component = %op.component_id,
        category = ?class.category,
        "re-injecting failed operation"
    );

    let envelope = job.envelope.clone();
    let core = Arc::clone(core);
    let delay = class.retry_delay;
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        envelope.request.reactivate();
        if let Err(e) = entry.try_send(envelope) {
            let envelope = match e {
                mpsc::error::TrySendError::Full(env)
                | mpsc::error::TrySendError::Closed(env) => env,
            };
            envelope.request.fail("retry re-injection failed");
            core.finish(EndJob {
                error: envelope.request.failure(),
                envelope,
                node: "error".to_string(),
                kind: EndNodeKind::Error,
            });
        }
    });
    true
}

/// Terminal sinks plus draining, cleanup, and error retry.
pub struct EndNodeSystem {
    core: Arc<Core>,
    nodes: RwLock<HashMap<String, (EndNodeKind, mpsc::Sender<EndJob>)>>,
    running: AtomicBool,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl EndNodeSystem {
    /// System with the standard node set (success, error, timeout,
    /// cleanup). Nodes come alive when `start()` spawns processors.
    pub fn new(config: EndNodeConfig, registry: Arc<ComponentRegistry>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            core: Arc::new(Core {
                config,
                registry,
                records: DashMap::new(),
                retry_counts: DashMap::new(),
                metrics: EndNodeMetrics::default(),
                draining: AtomicBool::new(false),
                in_flight: AtomicI64::new(0),
            }),
            nodes: RwLock::new(HashMap::new()),
            running: AtomicBool::new(false),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the standard processors and the cleanup manager.
    pub fn start(&self) -> SimResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(SimError::Lifecycle("end-node system already started".into()));
        }
        self.core.draining.store(false, Ordering::SeqCst);
        for name in ["success", "error", "timeout", "cleanup"] {
            self.spawn_node(name);
        }
        self.spawn_cleanup();
        tracing::info!("end-node system started");
        Ok(())
    }

    /// Add a custom terminal sink.
    pub fn add_custom_node(&self, name: &str) -> SimResult<()> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(SimError::Lifecycle("end-node system not running".into()));
        }
        self.spawn_node(name);
        Ok(())
    }

    fn spawn_node(&self, name: &str) {
        let kind = EndNodeKind::for_name(name);
        let (tx, mut rx) = mpsc::channel::<EndJob>(self.core.config.node_capacity);
        self.nodes.write().insert(name.to_string(), (kind, tx));
        let core = Arc::clone(&self.core);
        let mut shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                let job = tokio::select! {
                    _ = shutdown.changed() => break,
                    job = rx.recv() => match job {
                        Some(job) => job,
                        None => break,
                    },
                };
                process_job(&core, job).await;
            }
        });
        self.tasks.lock().push(handle);
    }

    fn spawn_cleanup(&self) {
        let core = Arc::clone(&self.core);
        let mut shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(core.config.cleanup_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tick.tick() => core.purge_old_records(),
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    /// Drop terminal records older than the retention window.
    pub fn purge_old_records(&self) {
        self.core.purge_old_records();
    }

    /// Refuse new ingress and wait for in-flight requests to finish,
    /// then stop every processor.
    pub async fn stop(&self) -> SimResult<()> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(SimError::Lifecycle("end-node system not running".into()));
        }
        self.core.draining.store(true, Ordering::SeqCst);
        tracing::info!("end-node system draining");

        let deadline = Instant::now() + self.core.config.drain_timeout;
        while self.core.in_flight.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let leftover = self.core.in_flight.load(Ordering::SeqCst);
        if leftover > 0 {
            tracing::warn!(leftover, "drain timeout hit with requests still in flight");
        }

        self.running.store(false, Ordering::SeqCst);
        let _ = self.shutdown.send(true);
        self.nodes.write().clear();
        let handles: Vec<_> = self.tasks.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        let _ = self.shutdown.send(false);
        tracing::info!("end-node system stopped");
        Ok(())
    }

    /// Whether ingress should refuse new work.
    pub fn is_draining(&self) -> bool {
        self.core.draining.load(Ordering::SeqCst)
    }

    /// Called by the ingress when a request is accepted.
    pub fn request_started(&self) {
        self.core.in_flight.fetch_add(1, Ordering::SeqCst);
    }

    /// Requests currently between ingress and a terminal record.
    pub fn in_flight(&self) -> i64 {
        self.core.in_flight.load(Ordering::SeqCst)
    }

    /// Counter access.
    pub fn metrics(&self) -> &EndNodeMetrics {
        &self.core.metrics
    }

    /// Terminal record for a request, if still retained.
    pub fn record(&self, request_id: &Uuid) -> Option<CompletedRecord> {
        self.core.records.get(request_id).map(|r| r.clone())
    }

    /// Number of retained terminal records.
    pub fn record_count(&self) -> usize {
        self.core.records.len()
    }

    /// Route a request directly to a named end node.
    pub fn route_to(&self, envelope: Envelope, node: &str) -> SimResult<()> {
        let entry = self.nodes.read().get(node).map(|(kind, tx)| (*kind, tx.clone()));
        match entry {
            Some((kind, tx)) => {
                let job = EndJob {
                    error: envelope.request.failure(),
                    envelope,
                    node: node.to_string(),
                    kind,
                };
                tx.try_send(job).map_err(|e| {
                    let job = match e {
                        mpsc::error::TrySendError::Full(job)
                        | mpsc::error::TrySendError::Closed(job) => job,
                    };
                    // never lose the terminal record, even on a full sink
                    self.core.finish(job);
                    SimError::channel_full(&format!("end node {node}"))
                })
            }
            None => {
                // processors not running (unit scope); record inline
                self.core.finish(EndJob {
                    error: envelope.request.failure(),
                    envelope,
                    node: node.to_string(),
                    kind: EndNodeKind::for_name(node),
                });
                Ok(())
            }
        }
    }

    /// Route by the request's terminal status: completed requests to
    /// the success sink, failed ones to the error sink.
    pub fn route_by_status(&self, envelope: Envelope) -> SimResult<()> {
        let node = match envelope.request.status() {
            RequestStatus::Failed => "error",
            _ => "success",
        };
        self.route_to(envelope, node)
    }

    /// Mark the request failed with `err` and hand it to the error sink.
    pub fn route_error(&self, envelope: Envelope, err: &SimError) {
        envelope.request.fail(err.to_string());
        tracing::debug!(request = %envelope.request.id, %err, "request routed to error end node");
        let _ = self.route_to(envelope, "error");
    }

    /// Mark the request timed out and hand it to the timeout sink.
    pub fn route_timeout(&self, envelope: Envelope) {
        envelope.request.fail(format!("request {} timed out", envelope.request.id));
        self.core.metrics.timeouts.inc();
        let _ = self.route_to(envelope, "timeout");
    }
}
