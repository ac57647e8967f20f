//! Circuit breakers for inter-component dispatch
//!
//! One breaker exists per target component, created lazily by the
//! manager. State reads are frequent and mutations rare, so the state
//! machine sits behind a reader-writer lock; the half-open single-trial
//! rule is serialized through the same lock.

use crate::{registry::ComponentRegistry, Envelope};
use flux_common::{Counter, SimError, SimResult};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Breaker tuning per target component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the breaker open
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close it again
    pub success_threshold: u32,
    /// Wall-clock time an open breaker waits before allowing a trial
    #[serde(with = "flux_common::serde_millis")]
    pub timeout: Duration,
    /// Attempts the error end node may re-inject for one operation
    pub max_retries: u32,
    /// Delay before an error retry is re-injected
    #[serde(with = "flux_common::serde_millis")]
    pub retry_delay: Duration,
    /// Component to try instead while this breaker is open
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<String>,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_delay: Duration::from_millis(100),
            fallback: None,
        }
    }
}

/// Breaker state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Calls pass through; failures are counted
    Closed,
    /// Calls are rejected until the timeout elapses
    Open,
    /// One trial call at a time probes the target
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failures: u32,
    successes: u32,
    last_failure: Option<Instant>,
    trial_in_flight: bool,
}

/// Per-target circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    target: String,
    config: BreakerConfig,
    inner: RwLock<Inner>,
    /// Calls rejected while open
    pub rejected: Counter,
    /// Open transitions
    pub trips: Counter,
}

impl CircuitBreaker {
    /// Breaker for `target` with the given config.
    pub fn new(target: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            target: target.into(),
            config,
            inner: RwLock::new(Inner {
                state: BreakerState::Closed,
                failures: 0,
                successes: 0,
                last_failure: None,
                trial_in_flight: false,
            }),
            rejected: Counter::new(0),
            trips: Counter::new(0),
        }
    }

    /// Target component this breaker protects.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Breaker configuration.
    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Current state. An open breaker whose timeout has elapsed still
    /// reads as open until the next attempt probes it.
    pub fn state(&self) -> BreakerState {
        self.inner.read().state
    }

    /// Consecutive failure count.
    pub fn failures(&self) -> u32 {
        self.inner.read().failures
    }

    /// Gate one dispatch attempt. Returns an error when the breaker is
    /// open (and its timeout has not elapsed) or when a half-open trial
    /// is already in flight.
    pub fn begin_attempt(&self) -> SimResult<()> {
        let mut inner = self.inner.write();
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let elapsed = inner
                    .last_failure
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed >= self.config.timeout {
                    inner.state = BreakerState::HalfOpen;
                    inner.successes = 0;
                    inner.trial_in_flight = true;
                    tracing::info!(target = %self.target, "circuit breaker half-open, probing");
                    Ok(())
                } else {
                    self.rejected.inc();
                    Err(SimError::breaker_open(&self.target))
                }
            }
            BreakerState::HalfOpen => {
                if inner.trial_in_flight {
                    self.rejected.inc();
                    Err(SimError::breaker_open(&self.target))
                } else {
                    inner.trial_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Record a successful dispatch.
    pub fn record_success(&self) {
        let mut inner = self.inner.write();
        match inner.state {
            BreakerState::Closed => inner.failures = 0,
            BreakerState::HalfOpen => {
                inner.trial_in_flight = false;
                inner.successes += 1;
                if inner.successes >= self.config.success_threshold {
                    inner.state = BreakerState::Closed;
                    inner.failures = 0;
                    inner.successes = 0;
                    inner.last_failure = None;
                    tracing::info!(target = %self.target, "circuit breaker closed");
                }
            }
            // success observed for an attempt admitted before the trip
            BreakerState::Open => {}
        }
    }

    /// Record a failed dispatch.
    pub fn record_failure(&self) {
        let mut inner = self.inner.write();
        match inner.state {
            BreakerState::Closed => {
                inner.failures += 1;
                inner.last_failure = Some(Instant::now());
                if inner.failures >= self.config.failure_threshold {
                    inner.state = BreakerState::Open;
                    self.trips.inc();
                    tracing::warn!(
                        target = %self.target,
                        failures = inner.failures,
                        "circuit breaker opened"
                    );
                }
            }
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.failures = 1;
                inner.successes = 0;
                inner.trial_in_flight = false;
                inner.last_failure = Some(Instant::now());
                self.trips.inc();
                tracing::warn!(target = %self.target, "half-open trial failed, reopening");
            }
            BreakerState::Open => {
                inner.last_failure = Some(Instant::now());
            }
        }
    }
}

/// Lazily creates and shares one breaker per dispatch target.
#[derive(Debug)]
pub struct BreakerManager {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    default_config: BreakerConfig,
}

impl BreakerManager {
    /// Manager handing out breakers with `default_config`.
    pub fn new(default_config: BreakerConfig) -> Self {
        Self { breakers: DashMap::new(), default_config }
    }

    /// The breaker for `target`, created on first use.
    pub fn breaker(&self, target: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(target.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(target, self.default_config.clone()))
            })
            .clone()
    }

    /// Install a specifically configured breaker for `target`.
    pub fn configure(&self, target: &str, config: BreakerConfig) {
        self.breakers
            .insert(target.to_string(), Arc::new(CircuitBreaker::new(target, config)));
    }

    /// Dispatch an envelope to `target` through its breaker. While the
    /// breaker is open, a configured fallback component is tried once.
    pub fn dispatch(
        &self,
        registry: &ComponentRegistry,
        target: &str,
        envelope: Envelope,
    ) -> SimResult<()> {
        match self.attempt(registry, target, envelope) {
            Ok(()) => Ok(()),
            Err((err, Some(envelope))) => {
                let fallback = self.breaker(target).config().fallback.clone();
                match fallback {
                    Some(fallback) if matches!(err, SimError::Dispatch(_)) => {
                        tracing::debug!(target, fallback = %fallback, "retrying via fallback");
                        self.attempt(registry, &fallback, envelope).map_err(|(e, _)| e)
                    }
                    _ => Err(err),
                }
            }
            Err((err, None)) => Err(err),
        }
    }

    /// One gated try-send. On failure the envelope is handed back so a
    /// fallback can reuse it.
    fn attempt(
        &self,
        registry: &ComponentRegistry,
        target: &str,
        envelope: Envelope,
    ) -> Result<(), (SimError, Option<Envelope>)> {
        let breaker = self.breaker(target);
        if let Err(err) = breaker.begin_attempt() {
            return Err((err, Some(envelope)));
        }
        let Some(tx) = registry.channel(target) else {
            breaker.record_failure();
            return Err((
                SimError::Dispatch(format!("component {target} is not registered")),
                Some(envelope),
            ));
        };
        match tx.try_send(envelope) {
            Ok(()) => {
                breaker.record_success();
                Ok(())
            }
            Err(tokio::sync::mpsc::error::TrySendError::Full(envelope)) => {
                breaker.record_failure();
                Err((SimError::channel_full(target), Some(envelope)))
            }
            Err(tokio::sync::mpsc::error::TrySendError::Closed(envelope)) => {
                breaker.record_failure();
                Err((
                    SimError::Dispatch(format!("component {target} input is closed")),
                    Some(envelope),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 5,
            success_threshold: 3,
            timeout: Duration::from_millis(50),
            ..Default::default()
        }
    }

    #[test]
    fn test_trips_after_failure_threshold() {
        let b = CircuitBreaker::new("db", quick_config());
        for _ in 0..4 {
            b.begin_attempt().unwrap();
            b.record_failure();
            assert_eq!(b.state(), BreakerState::Closed);
        }
        b.begin_attempt().unwrap();
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);

        let err = b.begin_attempt().unwrap_err();
        assert_eq!(
            err.to_string(),
            "dispatch error: circuit breaker is OPEN for component db"
        );
    }

    #[test]
    fn test_half_open_recovery() {
        let b = CircuitBreaker::new("db", quick_config());
        for _ in 0..5 {
            b.begin_attempt().unwrap();
            b.record_failure();
        }
        assert_eq!(b.state(), BreakerState::Open);

        std::thread::sleep(Duration::from_millis(60));
        // first attempt after the timeout probes half-open
        b.begin_attempt().unwrap();
        assert_eq!(b.state(), BreakerState::HalfOpen);
        b.record_success();
        for _ in 0..2 {
            b.begin_attempt().unwrap();
            b.record_success();
        }
        assert_eq!(b.state(), BreakerState::Closed);
        assert_eq!(b.failures(), 0);
    }

    #[test]
    fn test_half_open_failure_reopens_with_one_failure() {
        let b = CircuitBreaker::new("db", quick_config());
        for _ in 0..5 {
            b.begin_attempt().unwrap();
            b.record_failure();
        }
        std::thread::sleep(Duration::from_millis(60));
        b.begin_attempt().unwrap();
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
        assert_eq!(b.failures(), 1);
    }

    #[test]
    fn test_half_open_serializes_trials() {
        let b = CircuitBreaker::new("db", quick_config());
        for _ in 0..5 {
            b.begin_attempt().unwrap();
            b.record_failure();
        }
        std::thread::sleep(Duration::from_millis(60));
        b.begin_attempt().unwrap(); // trial in flight
        assert!(b.begin_attempt().is_err()); // concurrent caller rejected
        b.record_success();
        assert!(b.begin_attempt().is_ok()); // next trial admitted
    }

    #[tokio::test]
    async fn test_manager_dispatch_and_fallback() {
        let registry = ComponentRegistry::new();
        let manager = BreakerManager::new(quick_config());

        let (db_tx, mut db_rx) = tokio::sync::mpsc::channel(4);
        let (cache_tx, mut cache_rx) = tokio::sync::mpsc::channel(4);
        registry.register("db", db_tx);
        registry.register("db-replica", cache_tx);

        manager.configure(
            "db",
            BreakerConfig {
                failure_threshold: 1,
                fallback: Some("db-replica".into()),
                ..quick_config()
            },
        );

        let envelope = || {
            Envelope::new(
                flux_common::Operation::new("op1", "query"),
                Arc::new(flux_common::Request::new(Default::default())),
            )
        };

        // healthy dispatch lands on db
        manager.dispatch(&registry, "db", envelope()).unwrap();
        assert!(db_rx.try_recv().is_ok());

        // trip the db breaker, next dispatch falls back to the replica
        manager.breaker("db").begin_attempt().unwrap();
        manager.breaker("db").record_failure();
        manager.dispatch(&registry, "db", envelope()).unwrap();
        assert!(cache_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_unregistered_target_counts_as_failure() {
        let registry = ComponentRegistry::new();
        let manager = BreakerManager::new(quick_config());
        let envelope = Envelope::new(
            flux_common::Operation::new("op1", "query"),
            Arc::new(flux_common::Request::new(Default::default())),
        );
        let err = manager.dispatch(&registry, "ghost", envelope).unwrap_err();
        assert!(matches!(err, SimError::Dispatch(_)));
        assert_eq!(manager.breaker("ghost").failures(), 1);
    }
}
