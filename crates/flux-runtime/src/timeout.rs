//! Per-request deadline enforcement
//!
//! Every request accepted at a component ingress is registered here
//! with a deadline. A background sweeper expires overdue requests and
//! diverts them to the timeout sink, independently of actor
//! cancellation.

use crate::{endnode::EndNodeSystem, Envelope};
use flux_common::{Counter, SimError, SimResult};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Default per-request deadline.
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(30);
/// Default sweep interval.
pub const SWEEP_INTERVAL: Duration = Duration::from_millis(100);

struct Pending {
    envelope: Envelope,
    expires_at: Instant,
}

/// Registers in-flight requests and expires the overdue ones.
pub struct TimeoutManager {
    deadline: Duration,
    sweep_interval: Duration,
    pending: Arc<DashMap<Uuid, Pending>>,
    endnodes: Arc<EndNodeSystem>,
    expired: Arc<Counter>,
    running: AtomicBool,
    shutdown: watch::Sender<bool>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

/// One sweep pass over the pending map.
fn sweep_pass(pending: &DashMap<Uuid, Pending>, endnodes: &EndNodeSystem, expired: &Counter) {
    let now = Instant::now();
    let overdue: Vec<Uuid> = pending
        .iter()
        .filter(|entry| entry.expires_at <= now)
        .map(|entry| *entry.key())
        .collect();
    for id in overdue {
        let Some((_, entry)) = pending.remove(&id) else {
            continue;
        };
        if entry.envelope.request.is_terminal() {
            continue;
        }
        expired.inc();
        tracing::warn!(request = %id, "request exceeded its deadline");
        endnodes.route_timeout(entry.envelope);
    }
}

impl TimeoutManager {
    /// Manager expiring requests after the default 30s deadline.
    pub fn new(endnodes: Arc<EndNodeSystem>) -> Self {
        Self::with_deadline(endnodes, DEFAULT_DEADLINE)
    }

    /// Manager with a custom deadline.
    pub fn with_deadline(endnodes: Arc<EndNodeSystem>, deadline: Duration) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            deadline,
            sweep_interval: SWEEP_INTERVAL,
            pending: Arc::new(DashMap::new()),
            endnodes,
            expired: Arc::new(Counter::new(0)),
            running: AtomicBool::new(false),
            shutdown,
            sweeper: Mutex::new(None),
        }
    }

    /// Override the sweep interval (tests use short deadlines).
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Track a request until it is cancelled or expires.
    pub fn register(&self, envelope: &Envelope) {
        self.pending.insert(
            envelope.request.id,
            Pending {
                envelope: envelope.clone(),
                expires_at: Instant::now() + self.deadline,
            },
        );
    }

    /// Stop tracking a request that reached an end node.
    pub fn cancel(&self, request_id: &Uuid) {
        self.pending.remove(request_id);
    }

    /// Number of tracked requests.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// One sweep pass: divert every overdue request to the timeout sink.
    pub fn sweep(&self) {
        sweep_pass(&self.pending, &self.endnodes, &self.expired);
    }

    /// Requests expired so far.
    pub fn expired_count(&self) -> u64 {
        self.expired.get()
    }

    /// Start the background sweeper.
    pub fn start(&self) -> SimResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(SimError::Lifecycle("timeout manager already started".into()));
        }
        let pending = Arc::clone(&self.pending);
        let endnodes = Arc::clone(&self.endnodes);
        let expired = Arc::clone(&self.expired);
        let interval = self.sweep_interval;
        let mut shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tick.tick() => sweep_pass(&pending, &endnodes, &expired),
                }
            }
        });
        *self.sweeper.lock() = Some(handle);
        Ok(())
    }

    /// Stop the background sweeper.
    pub async fn stop(&self) -> SimResult<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(SimError::Lifecycle("timeout manager not running".into()));
        }
        let _ = self.shutdown.send(true);
        let sweeper = self.sweeper.lock().take();
        if let Some(handle) = sweeper {
            let _ = handle.await;
        }
        let _ = self.shutdown.send(false);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endnode::EndNodeConfig;
    use crate::registry::ComponentRegistry;
    use flux_common::{Operation, Request, RequestStatus};

    fn make() -> (Arc<TimeoutManager>, Arc<EndNodeSystem>) {
        let endnodes = Arc::new(EndNodeSystem::new(
            EndNodeConfig::default(),
            Arc::new(ComponentRegistry::new()),
        ));
        let manager = Arc::new(
            TimeoutManager::with_deadline(Arc::clone(&endnodes), Duration::from_millis(20))
                .with_sweep_interval(Duration::from_millis(5)),
        );
        (manager, endnodes)
    }

    fn envelope() -> Envelope {
        Envelope::new(
            Operation::new("op1", "read_request"),
            Arc::new(Request::new(Default::default())),
        )
    }

    #[tokio::test]
    async fn test_overdue_request_is_expired() {
        let (manager, endnodes) = make();
        let env = envelope();
        let request = Arc::clone(&env.request);
        endnodes.request_started();
        manager.register(&env);

        tokio::time::sleep(Duration::from_millis(30)).await;
        manager.sweep();

        assert_eq!(manager.pending_count(), 0);
        assert_eq!(manager.expired_count(), 1);
        assert_eq!(request.status(), RequestStatus::Failed);
        assert!(request.failure().unwrap().contains("timed out"));
        assert_eq!(endnodes.metrics().timeouts.get(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_request_is_not_expired() {
        let (manager, _endnodes) = make();
        let env = envelope();
        manager.register(&env);
        manager.cancel(&env.request.id);

        tokio::time::sleep(Duration::from_millis(30)).await;
        manager.sweep();
        assert_eq!(manager.expired_count(), 0);
    }

    #[tokio::test]
    async fn test_completed_request_is_skipped() {
        let (manager, _endnodes) = make();
        let env = envelope();
        env.request.complete();
        manager.register(&env);

        tokio::time::sleep(Duration::from_millis(30)).await;
        manager.sweep();
        assert_eq!(manager.expired_count(), 0);
        assert_eq!(manager.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_background_sweeper() {
        let (manager, _endnodes) = make();
        manager.start().unwrap();
        let env = envelope();
        let request = Arc::clone(&env.request);
        manager.register(&env);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(request.status(), RequestStatus::Failed);
        manager.stop().await.unwrap();
    }
}
