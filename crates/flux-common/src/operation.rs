//! Operation wire records
//!
//! The `Operation` and `OperationResult` records are the canonical
//! messages exchanged between components and engines.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// The unit of work an engine processes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    /// Operation identifier
    pub id: String,
    /// Operation type (e.g. `read_request`, `write_request`, `query`)
    #[serde(rename = "type")]
    pub op_type: String,
    /// Opaque payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Id of the request this operation belongs to
    pub request_id: String,
    /// Component the operation entered the system through
    pub component_id: String,
    /// Priority, 0-10; values above 5 are treated as high priority
    pub priority: u8,
    /// Complexity hint consumed by engine latency models
    pub complexity: u32,
    /// Payload size in bytes
    pub data_size: u64,
    /// Submission timestamp
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Free-form metadata
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Operation {
    /// Create an operation with defaults for the optional fields.
    pub fn new(id: impl Into<String>, op_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            op_type: op_type.into(),
            data: None,
            request_id: String::new(),
            component_id: String::new(),
            priority: 0,
            complexity: 1,
            data_size: 0,
            timestamp: chrono::Utc::now(),
            metadata: HashMap::new(),
        }
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Set the payload size in bytes.
    pub fn with_data_size(mut self, data_size: u64) -> Self {
        self.data_size = data_size;
        self
    }

    /// Set the complexity hint.
    pub fn with_complexity(mut self, complexity: u32) -> Self {
        self.complexity = complexity;
        self
    }

    /// Set the payload.
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Attach a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Whether the operation type is a database query.
    pub fn is_database_query(&self) -> bool {
        matches!(self.op_type.as_str(), "read_request" | "write_request" | "query")
    }
}

/// Result an engine produces for one operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationResult {
    /// Type of the operation that produced this result
    pub operation_type: String,
    /// Whether the engine succeeded
    pub success: bool,
    /// Simulated processing time
    pub processing_time: Duration,
    /// Result payload, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Engine-reported metrics
    #[serde(default)]
    pub metrics: HashMap<String, f64>,
}

impl OperationResult {
    /// Successful result carrying `data`.
    pub fn success(op: &Operation, processing_time: Duration, data: Option<serde_json::Value>) -> Self {
        Self {
            operation_type: op.op_type.clone(),
            success: true,
            processing_time,
            data,
            metrics: HashMap::new(),
        }
    }

    /// Failed result.
    pub fn failure(op: &Operation, processing_time: Duration) -> Self {
        Self {
            operation_type: op.op_type.clone(),
            success: false,
            processing_time,
            data: None,
            metrics: HashMap::new(),
        }
    }

    /// Attach a metric.
    pub fn with_metric(mut self, key: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(key.into(), value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_query_types() {
        for t in ["read_request", "write_request", "query"] {
            assert!(Operation::new("op1", t).is_database_query());
        }
        assert!(!Operation::new("op1", "render").is_database_query());
    }

    #[test]
    fn test_operation_serde() {
        let op = Operation::new("op1", "read_request")
            .with_priority(7)
            .with_data_size(32_000);
        let json = serde_json::to_string(&op).unwrap();
        assert!(json.contains("\"type\":\"read_request\""));
        let back: Operation = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, "op1");
        assert_eq!(back.priority, 7);
        assert_eq!(back.data_size, 32_000);
    }
}
