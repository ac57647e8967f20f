//! Fluxsim Common - Shared types for the simulation runtime
//!
//! This crate provides the vocabulary shared by every part of the
//! request routing and dispatch plane:
//! - Operation and result wire records
//! - Request journey state (shared by reference, never copied)
//! - Error taxonomy
//! - Metrics primitives (atomic counters, EWMA latency)

#![warn(missing_docs)]

pub mod error;
pub mod metrics;
pub mod operation;
pub mod request;

pub use error::{SimError, SimResult};
pub use operation::{Operation, OperationResult};
pub use request::{FlowChain, Request, RequestData, RequestStatus};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Kind of simulated service component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentType {
    /// Front-end web server
    WebServer,
    /// Database service
    Database,
    /// Cache service
    Cache,
    /// Dedicated load-balancer component
    LoadBalancer,
    /// Raw CPU component
    Cpu,
    /// Raw memory component
    Memory,
    /// Raw storage component
    Storage,
    /// Raw network component
    Network,
    /// User-defined component
    Custom,
}

impl fmt::Display for ComponentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::WebServer => "web_server",
            Self::Database => "database",
            Self::Cache => "cache",
            Self::LoadBalancer => "load_balancer",
            Self::Cpu => "cpu",
            Self::Memory => "memory",
            Self::Storage => "storage",
            Self::Network => "network",
            Self::Custom => "custom",
        };
        f.write_str(s)
    }
}

/// Processing engine kind inside a component instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineType {
    /// Compute engine
    Cpu,
    /// Memory engine
    Memory,
    /// Storage engine
    Storage,
    /// Network engine
    Network,
}

impl EngineType {
    /// All engine kinds, in dispatch order.
    pub const ALL: [EngineType; 4] = [Self::Cpu, Self::Memory, Self::Storage, Self::Network];

    /// Wire name of the engine kind.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Memory => "memory",
            Self::Storage => "storage",
            Self::Network => "network",
        }
    }
}

impl fmt::Display for EngineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineType {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cpu" => Ok(Self::Cpu),
            "memory" => Ok(Self::Memory),
            "storage" => Ok(Self::Storage),
            "network" => Ok(Self::Network),
            other => Err(SimError::Config(format!("unknown engine type: {other}"))),
        }
    }
}

/// Coarse load classification of a component's input channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferStatus {
    /// Fill below 20%
    Normal,
    /// Fill 20-40%
    Warning,
    /// Fill 40-60%
    High,
    /// Fill 60-80%
    Overflow,
    /// Fill 80-90%
    Critical,
    /// Fill at or above 90%, or component unknown
    Emergency,
}

impl BufferStatus {
    /// Classify an input-channel fill fraction.
    pub fn from_fill(fill: f64) -> Self {
        match fill {
            f if f < 0.2 => Self::Normal,
            f if f < 0.4 => Self::Warning,
            f if f < 0.6 => Self::High,
            f if f < 0.8 => Self::Overflow,
            f if f < 0.9 => Self::Critical,
            _ => Self::Emergency,
        }
    }
}

/// Clamp a health score into [0, 1].
#[inline]
pub fn clamp_health(h: f64) -> f64 {
    h.clamp(0.0, 1.0)
}

/// Serde adapter storing a `Duration` as integer milliseconds, the
/// format component profiles use.
pub mod serde_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    /// Serialize as milliseconds.
    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        (d.as_millis() as u64).serialize(s)
    }

    /// Deserialize from milliseconds.
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Lock-free monotonic counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    /// Create a counter starting at `value`.
    pub const fn new(value: u64) -> Self {
        Self(AtomicU64::new(value))
    }

    /// Increment and return the previous value.
    #[inline]
    pub fn inc(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }

    /// Add `val` and return the previous value.
    #[inline]
    pub fn add(&self, val: u64) -> u64 {
        self.0.fetch_add(val, Ordering::Relaxed)
    }

    /// Current value.
    #[inline]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_status_bands() {
        assert_eq!(BufferStatus::from_fill(0.0), BufferStatus::Normal);
        assert_eq!(BufferStatus::from_fill(0.19), BufferStatus::Normal);
        assert_eq!(BufferStatus::from_fill(0.2), BufferStatus::Warning);
        assert_eq!(BufferStatus::from_fill(0.45), BufferStatus::High);
        assert_eq!(BufferStatus::from_fill(0.65), BufferStatus::Overflow);
        assert_eq!(BufferStatus::from_fill(0.85), BufferStatus::Critical);
        assert_eq!(BufferStatus::from_fill(0.9), BufferStatus::Emergency);
        assert_eq!(BufferStatus::from_fill(1.0), BufferStatus::Emergency);
    }

    #[test]
    fn test_health_clamp() {
        assert_eq!(clamp_health(-0.5), 0.0);
        assert_eq!(clamp_health(0.5), 0.5);
        assert_eq!(clamp_health(1.5), 1.0);
    }

    #[test]
    fn test_engine_type_roundtrip() {
        for et in EngineType::ALL {
            assert_eq!(et.as_str().parse::<EngineType>().unwrap(), et);
        }
        assert!("gpu".parse::<EngineType>().is_err());
    }

    #[test]
    fn test_counter() {
        let c = Counter::new(0);
        assert_eq!(c.inc(), 0);
        assert_eq!(c.add(5), 1);
        assert_eq!(c.get(), 6);
    }
}
