//! Metrics primitives for the routing plane

use crate::Counter;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponentially weighted moving average with 0.9/0.1 weights.
#[derive(Debug, Default)]
pub struct Ewma {
    value: RwLock<Option<f64>>,
}

impl Ewma {
    /// Smoothing factor applied to the previous value.
    const DECAY: f64 = 0.9;

    /// Create an empty average.
    pub const fn new() -> Self {
        Self { value: RwLock::new(None) }
    }

    /// Fold a sample into the average.
    pub fn record(&self, sample: f64) {
        let mut value = self.value.write();
        *value = Some(match *value {
            Some(prev) => prev * Self::DECAY + sample * (1.0 - Self::DECAY),
            None => sample,
        });
    }

    /// Current average, or 0.0 before the first sample.
    pub fn get(&self) -> f64 {
        self.value.read().unwrap_or(0.0)
    }
}

/// Per-EOQ routing counters.
#[derive(Debug, Default)]
pub struct RoutingMetrics {
    /// Total routing decisions taken
    pub decisions: Counter,
    /// Dispatches to an engine in the same instance
    pub internal: Counter,
    /// Dispatches to another component
    pub external: Counter,
    /// Dispatches to an end node
    pub terminal: Counter,
    /// Routing failures
    pub errors: Counter,
    /// Requests expired by the timeout manager
    pub timeouts: Counter,
    /// Rolling average routing latency (microseconds)
    pub latency_us: Ewma,
}

impl RoutingMetrics {
    /// Record a completed routing decision and its latency.
    pub fn record_decision(&self, latency: Duration) {
        self.decisions.inc();
        self.latency_us.record(latency.as_micros() as f64);
    }

    /// Take a serializable snapshot.
    pub fn snapshot(&self) -> RoutingMetricsSnapshot {
        RoutingMetricsSnapshot {
            decisions: self.decisions.get(),
            internal: self.internal.get(),
            external: self.external.get(),
            terminal: self.terminal.get(),
            errors: self.errors.get(),
            timeouts: self.timeouts.get(),
            avg_latency_us: self.latency_us.get(),
        }
    }
}

/// Point-in-time copy of `RoutingMetrics`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoutingMetricsSnapshot {
    /// Total routing decisions taken
    pub decisions: u64,
    /// Dispatches to an engine in the same instance
    pub internal: u64,
    /// Dispatches to another component
    pub external: u64,
    /// Dispatches to an end node
    pub terminal: u64,
    /// Routing failures
    pub errors: u64,
    /// Requests expired by the timeout manager
    pub timeouts: u64,
    /// Rolling average routing latency (microseconds)
    pub avg_latency_us: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ewma_weights() {
        let ewma = Ewma::new();
        ewma.record(100.0);
        assert_eq!(ewma.get(), 100.0);
        ewma.record(200.0);
        // 0.9 * 100 + 0.1 * 200
        assert!((ewma.get() - 110.0).abs() < 1e-9);
    }

    #[test]
    fn test_routing_snapshot() {
        let m = RoutingMetrics::default();
        m.record_decision(Duration::from_micros(50));
        m.internal.inc();
        m.errors.inc();
        let snap = m.snapshot();
        assert_eq!(snap.decisions, 1);
        assert_eq!(snap.internal, 1);
        assert_eq!(snap.errors, 1);
        assert_eq!(snap.avg_latency_us, 50.0);
    }
}
