//! Dynamic state-based routing
//!
//! State nodes route on sampled system state rather than on the
//! operation itself. The sample is taken by the caller (the EOQ reads
//! registry health and instance metrics) at evaluation time.

use flux_common::{SimError, SimResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// System state sampled at evaluation time.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SystemState {
    /// Aggregate load of the component, in [0,1]
    pub system_load: f64,
    /// Memory pressure, in [0,1]
    pub memory_usage: f64,
    /// Observed storage latency in milliseconds
    pub storage_latency: f64,
    /// Observed network latency in milliseconds
    pub network_latency: f64,
    /// Whether the simulated clock is inside peak hours
    pub peak_hours: bool,
}

/// Configuration of a state-routing node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateConfig {
    /// Ordered map of state condition expression to destination
    pub conditions: BTreeMap<String, String>,
    /// Destination when no condition matches
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<String>,
}

/// A parsed state condition, e.g. `system_load > 0.8` or `peak_hours`.
#[derive(Debug, Clone, PartialEq)]
pub struct StateCondition {
    variable: StateVariable,
    op: StateOp,
    threshold: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StateVariable {
    SystemLoad,
    MemoryUsage,
    StorageLatency,
    NetworkLatency,
    PeakHours,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StateOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Truthy,
}

impl StateCondition {
    /// Parse a state condition expression.
    pub fn parse(expr: &str) -> SimResult<Self> {
        let expr = expr.trim();
        let tokens: Vec<&str> = expr.split_whitespace().collect();
        let (variable, op, threshold) = match tokens.as_slice() {
            [var] => (*var, StateOp::Truthy, 0.0),
            [var, op, value] => {
                let op = match *op {
                    "<" => StateOp::Lt,
                    "<=" => StateOp::Le,
                    ">" => StateOp::Gt,
                    ">=" => StateOp::Ge,
                    "==" => StateOp::Eq,
                    other => {
                        return Err(SimError::Config(format!(
                            "unknown operator in state condition: {other}"
                        )))
                    }
                };
                let threshold = match *value {
                    "true" => 1.0,
                    "false" => 0.0,
                    v => v.parse::<f64>().map_err(|_| {
                        SimError::Config(format!("non-numeric state threshold: {v}"))
                    })?,
                };
                (*var, op, threshold)
            }
            _ => {
                return Err(SimError::Config(format!(
                    "unparseable state condition: {expr}"
                )))
            }
        };

        let variable = match variable {
            "system_load" => StateVariable::SystemLoad,
            "memory_usage" => StateVariable::MemoryUsage,
            "storage_latency" => StateVariable::StorageLatency,
            "network_latency" => StateVariable::NetworkLatency,
            "peak_hours" => StateVariable::PeakHours,
            other => {
                return Err(SimError::Config(format!(
                    "unknown state variable: {other}"
                )))
            }
        };

        Ok(Self { variable, op, threshold })
    }

    /// Evaluate against a state sample.
    pub fn eval(&self, state: &SystemState) -> bool {
        let value = match self.variable {
            StateVariable::SystemLoad => state.system_load,
            StateVariable::MemoryUsage => state.memory_usage,
            StateVariable::StorageLatency => state.storage_latency,
            StateVariable::NetworkLatency => state.network_latency,
            StateVariable::PeakHours => {
                if state.peak_hours {
                    1.0
                } else {
                    0.0
                }
            }
        };
        match self.op {
            StateOp::Lt => value < self.threshold,
            StateOp::Le => value <= self.threshold,
            StateOp::Gt => value > self.threshold,
            StateOp::Ge => value >= self.threshold,
            StateOp::Eq => value == self.threshold,
            StateOp::Truthy => value != 0.0,
        }
    }
}

/// Compiled state-routing table: parsed conditions in evaluation order.
#[derive(Debug, Clone)]
pub struct CompiledStateRouting {
    routes: Vec<(StateCondition, String)>,
    /// Destination when no condition matches
    pub fallback: Option<String>,
}

impl CompiledStateRouting {
    /// Compile a state config, parsing every condition once.
    pub fn compile(config: &StateConfig) -> SimResult<Self> {
        let routes = config
            .conditions
            .iter()
            .map(|(expr, dest)| Ok((StateCondition::parse(expr)?, dest.clone())))
            .collect::<SimResult<Vec<_>>>()?;
        Ok(Self {
            routes,
            fallback: config.fallback.clone(),
        })
    }

    /// First matching destination for the sample, if any.
    pub fn evaluate(&self, state: &SystemState) -> Option<&str> {
        self.routes
            .iter()
            .find(|(cond, _)| cond.eval(state))
            .map(|(_, dest)| dest.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_eval() {
        let overload = StateCondition::parse("system_load > 0.8").unwrap();
        let peak = StateCondition::parse("peak_hours").unwrap();

        let calm = SystemState { system_load: 0.2, ..Default::default() };
        let busy = SystemState { system_load: 0.9, peak_hours: true, ..Default::default() };

        assert!(!overload.eval(&calm));
        assert!(overload.eval(&busy));
        assert!(!peak.eval(&calm));
        assert!(peak.eval(&busy));
    }

    #[test]
    fn test_compiled_routing_with_fallback() {
        let config = StateConfig {
            conditions: BTreeMap::from([
                ("memory_usage > 0.9".to_string(), "disk_path".to_string()),
                ("system_load > 0.8".to_string(), "shed_load".to_string()),
            ]),
            fallback: Some("normal_path".to_string()),
        };
        let compiled = CompiledStateRouting::compile(&config).unwrap();

        let hot = SystemState { memory_usage: 0.95, ..Default::default() };
        assert_eq!(compiled.evaluate(&hot), Some("disk_path"));

        let calm = SystemState::default();
        assert_eq!(compiled.evaluate(&calm), None);
        assert_eq!(compiled.fallback.as_deref(), Some("normal_path"));
    }

    #[test]
    fn test_bad_expressions_rejected() {
        assert!(StateCondition::parse("cpu_load > 0.5").is_err());
        assert!(StateCondition::parse("system_load >> 0.5").is_err());
        assert!(StateCondition::parse("system_load > warm").is_err());
    }
}
