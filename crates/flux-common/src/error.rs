//! Error types for the simulation runtime

use thiserror::Error;

/// Simulation runtime error type
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SimError {
    /// No matching condition, unknown destination, full channel or
    /// a graph cycle guard trip while routing a request
    #[error("routing error: {0}")]
    Routing(String),

    /// Inter-component dispatch failed (breaker open, target missing)
    #[error("dispatch error: {0}")]
    Dispatch(String),

    /// An engine reported an unsuccessful result
    #[error("engine failure in {engine}: {reason}")]
    EngineFailure {
        /// Engine that produced the failing result
        engine: String,
        /// Failure detail
        reason: String,
    },

    /// Request exceeded its deadline
    #[error("request {0} timed out")]
    Timeout(String),

    /// Invalid configuration rejected at load time
    #[error("config error: {0}")]
    Config(String),

    /// Start on a running actor, stop on a stopped actor
    #[error("lifecycle error: {0}")]
    Lifecycle(String),

    /// A state sink failed to store or load a snapshot
    #[error("state sink error: {0}")]
    Sink(String),
}

impl SimError {
    /// Routing error for a full destination channel.
    pub fn channel_full(target: &str) -> Self {
        Self::Routing(format!("input channel full for {target}"))
    }

    /// Dispatch error for an open circuit breaker.
    pub fn breaker_open(target: &str) -> Self {
        Self::Dispatch(format!("circuit breaker is OPEN for component {target}"))
    }
}

/// Result type for the simulation runtime
pub type SimResult<T> = Result<T, SimError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breaker_open_message() {
        let err = SimError::breaker_open("db");
        assert_eq!(
            err.to_string(),
            "dispatch error: circuit breaker is OPEN for component db"
        );
    }
}
