//! Routing condition language
//!
//! Conditions are parsed once into a small AST when the graph is loaded
//! and evaluated against `(Operation, Option<OperationResult>)` on the
//! hot path. Two forms exist:
//!
//! - named conditions (`success`, `cache_hit`, `high_priority`, ...)
//! - comparisons (`operation.priority >= 5`) over dotted paths rooted at
//!   `operation.`, `result.` or `metrics.`
//!
//! Compounds join parts with ` && ` or ` || `; mixing the two operators
//! in one expression is rejected at parse time.

use flux_common::{Operation, OperationResult, SimError, SimResult};
use std::time::Duration;

/// Priority above which an operation counts as high priority.
pub const HIGH_PRIORITY_THRESHOLD: u8 = 5;
/// Byte size above which a payload counts as large.
pub const LARGE_DATA_BYTES: u64 = 1_000_000;
/// Byte size below which a payload counts as small.
pub const SMALL_DATA_BYTES: u64 = 64_000;
/// Processing time above which a result counts as a timeout.
pub const TIMEOUT_PROCESSING: Duration = Duration::from_secs(1);

/// A compiled routing condition.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// One of the built-in named conditions
    Named(NamedCondition),
    /// `variable op literal`
    Compare(Comparison),
    /// Conjunction, evaluated left to right
    All(Vec<Condition>),
    /// Disjunction, evaluated left to right
    Any(Vec<Condition>),
}

/// Built-in condition vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamedCondition {
    /// result.success is true
    Success,
    /// result.success is false
    Failure,
    /// successful result carrying data
    CacheHit,
    /// no result, failed result, or result without data
    CacheMiss,
    /// operation.priority > 5
    HighPriority,
    /// operation.data_size > 1,000,000
    LargeData,
    /// operation.data_size < 64,000
    SmallData,
    /// result.processing_time > 1s
    Timeout,
    /// operation type is read_request, write_request or query
    DatabaseQuery,
    /// always true
    Default,
}

/// Comparison operators. `==`/`!=` coerce numeric strings; the strict
/// forms require matching types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    /// `==`
    Eq,
    /// `===`
    StrictEq,
    /// `!=`
    Ne,
    /// `!==`
    StrictNe,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
}

impl CmpOp {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "==" => Some(Self::Eq),
            "===" => Some(Self::StrictEq),
            "!=" => Some(Self::Ne),
            "!==" => Some(Self::StrictNe),
            "<" => Some(Self::Lt),
            "<=" => Some(Self::Le),
            ">" => Some(Self::Gt),
            ">=" => Some(Self::Ge),
            _ => None,
        }
    }
}

/// Root of a dotted variable path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathRoot {
    /// Fields of the operation record
    Operation,
    /// Fields of the prior engine result
    Result,
    /// Entries of the result's metrics map
    Metrics,
}

/// A single `variable op literal` comparison.
#[derive(Debug, Clone, PartialEq)]
pub struct Comparison {
    root: PathRoot,
    segments: Vec<String>,
    op: CmpOp,
    literal: Literal,
}

/// Literal operand of a comparison.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    /// Numeric literal (all numbers compare as f64)
    Number(f64),
    /// `true` / `false`
    Bool(bool),
    /// Quoted or bare string
    Str(String),
}

impl Literal {
    fn parse(s: &str) -> Self {
        if let Some(stripped) = s
            .strip_prefix('\'')
            .and_then(|s| s.strip_suffix('\''))
            .or_else(|| s.strip_prefix('"').and_then(|s| s.strip_suffix('"')))
        {
            return Self::Str(stripped.to_string());
        }
        match s {
            "true" => Self::Bool(true),
            "false" => Self::Bool(false),
            _ => s
                .parse::<f64>()
                .map(Self::Number)
                .unwrap_or_else(|_| Self::Str(s.to_string())),
        }
    }

    fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Str(s) => s.parse().ok(),
            Self::Bool(_) => None,
        }
    }
}

impl Condition {
    /// Parse a condition expression into its AST.
    pub fn parse(expr: &str) -> SimResult<Self> {
        let expr = expr.trim();
        if expr.is_empty() {
            return Err(SimError::Config("empty condition".into()));
        }
        let has_and = expr.contains(" && ");
        let has_or = expr.contains(" || ");
        if has_and && has_or {
            return Err(SimError::Config(format!(
                "mixing && and || is not supported, split into multiple conditions: {expr}"
            )));
        }
        if has_and {
            let parts = expr
                .split(" && ")
                .map(Self::parse_single)
                .collect::<SimResult<Vec<_>>>()?;
            return Ok(Self::All(parts));
        }
        if has_or {
            let parts = expr
                .split(" || ")
                .map(Self::parse_single)
                .collect::<SimResult<Vec<_>>>()?;
            return Ok(Self::Any(parts));
        }
        Self::parse_single(expr)
    }

    fn parse_single(expr: &str) -> SimResult<Self> {
        let expr = expr.trim();
        let named = match expr {
            "success" => Some(NamedCondition::Success),
            "failure" => Some(NamedCondition::Failure),
            "cache_hit" => Some(NamedCondition::CacheHit),
            "cache_miss" => Some(NamedCondition::CacheMiss),
            "high_priority" => Some(NamedCondition::HighPriority),
            "large_data" => Some(NamedCondition::LargeData),
            "small_data" => Some(NamedCondition::SmallData),
            "timeout" => Some(NamedCondition::Timeout),
            "database_query" => Some(NamedCondition::DatabaseQuery),
            "default" => Some(NamedCondition::Default),
            _ => None,
        };
        if let Some(named) = named {
            return Ok(Self::Named(named));
        }
        Self::parse_comparison(expr)
    }

    fn parse_comparison(expr: &str) -> SimResult<Self> {
        let tokens: Vec<&str> = expr.splitn(3, ' ').collect();
        let [variable, op, literal] = tokens.as_slice() else {
            return Err(SimError::Config(format!("unparseable condition: {expr}")));
        };
        let op = CmpOp::parse(op)
            .ok_or_else(|| SimError::Config(format!("unknown operator in condition: {expr}")))?;

        let mut segments: Vec<&str> = variable.split('.').collect();
        if segments.len() < 2 {
            return Err(SimError::Config(format!(
                "condition variable must be rooted at operation./result./metrics.: {variable}"
            )));
        }
        let root = match segments.remove(0) {
            "operation" => PathRoot::Operation,
            "result" => PathRoot::Result,
            "metrics" => PathRoot::Metrics,
            other => {
                return Err(SimError::Config(format!("unknown condition root: {other}")));
            }
        };

        Ok(Self::Compare(Comparison {
            root,
            segments: segments.into_iter().map(str::to_string).collect(),
            op,
            literal: Literal::parse(literal.trim()),
        }))
    }

    /// Evaluate against an operation and its optional prior result.
    pub fn eval(&self, op: &Operation, result: Option<&OperationResult>) -> bool {
        match self {
            Self::Named(named) => named.eval(op, result),
            Self::Compare(cmp) => cmp.eval(op, result),
            Self::All(parts) => parts.iter().all(|c| c.eval(op, result)),
            Self::Any(parts) => parts.iter().any(|c| c.eval(op, result)),
        }
    }

    /// Whether this is the always-true `default` condition.
    pub fn is_default(&self) -> bool {
        matches!(self, Self::Named(NamedCondition::Default))
    }
}

impl NamedCondition {
    fn eval(&self, op: &Operation, result: Option<&OperationResult>) -> bool {
        match self {
            Self::Success => result.is_some_and(|r| r.success),
            Self::Failure => result.is_some_and(|r| !r.success),
            Self::CacheHit => result.is_some_and(|r| r.success && r.data.is_some()),
            Self::CacheMiss => !result.is_some_and(|r| r.success && r.data.is_some()),
            Self::HighPriority => op.priority > HIGH_PRIORITY_THRESHOLD,
            Self::LargeData => op.data_size > LARGE_DATA_BYTES,
            Self::SmallData => op.data_size < SMALL_DATA_BYTES,
            Self::Timeout => result.is_some_and(|r| r.processing_time > TIMEOUT_PROCESSING),
            Self::DatabaseQuery => op.is_database_query(),
            Self::Default => true,
        }
    }
}

impl Comparison {
    fn eval(&self, op: &Operation, result: Option<&OperationResult>) -> bool {
        let Some(value) = self.resolve(op, result) else {
            return false;
        };
        match self.op {
            CmpOp::Eq => loose_eq(&value, &self.literal),
            CmpOp::Ne => !loose_eq(&value, &self.literal),
            CmpOp::StrictEq => value == self.literal,
            CmpOp::StrictNe => value != self.literal,
            CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge => {
                let (Some(a), Some(b)) = (value.as_number(), self.literal.as_number()) else {
                    return false;
                };
                match self.op {
                    CmpOp::Lt => a < b,
                    CmpOp::Le => a <= b,
                    CmpOp::Gt => a > b,
                    CmpOp::Ge => a >= b,
                    _ => unreachable!(),
                }
            }
        }
    }

    fn resolve(&self, op: &Operation, result: Option<&OperationResult>) -> Option<Literal> {
        let head = self.segments.first().map(String::as_str)?;
        match self.root {
            PathRoot::Operation => match head {
                "priority" => Some(Literal::Number(op.priority as f64)),
                "complexity" => Some(Literal::Number(op.complexity as f64)),
                "data_size" => Some(Literal::Number(op.data_size as f64)),
                "id" => Some(Literal::Str(op.id.clone())),
                "type" => Some(Literal::Str(op.op_type.clone())),
                "metadata" => {
                    let key = self.segments.get(1)?;
                    op.metadata.get(key).map(|v| Literal::Str(v.clone()))
                }
                "data" => op.data.as_ref().and_then(|d| json_path(d, &self.segments[1..])),
                _ => None,
            },
            PathRoot::Result => {
                let result = result?;
                match head {
                    "success" => Some(Literal::Bool(result.success)),
                    "processing_time" => {
                        Some(Literal::Number(result.processing_time.as_secs_f64()))
                    }
                    "operation_type" => Some(Literal::Str(result.operation_type.clone())),
                    "data" => result
                        .data
                        .as_ref()
                        .and_then(|d| json_path(d, &self.segments[1..])),
                    _ => None,
                }
            }
            PathRoot::Metrics => result?.metrics.get(head).map(|v| Literal::Number(*v)),
        }
    }
}

fn json_path(value: &serde_json::Value, segments: &[String]) -> Option<Literal> {
    let mut current = value;
    for seg in segments {
        current = current.get(seg)?;
    }
    match current {
        serde_json::Value::Bool(b) => Some(Literal::Bool(*b)),
        serde_json::Value::Number(n) => n.as_f64().map(Literal::Number),
        serde_json::Value::String(s) => Some(Literal::Str(s.clone())),
        _ => None,
    }
}

fn loose_eq(a: &Literal, b: &Literal) -> bool {
    if a == b {
        return true;
    }
    match (a.as_number(), b.as_number()) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}
