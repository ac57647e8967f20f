//! Custom routing logic registry
//!
//! Nodes with `custom_logic` routing look up a function by node id at
//! evaluation time. A missing function falls back to standard routing.

use flux_common::{Operation, OperationResult};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// A custom routing function: returns the destination, or `None` to
/// fall back to standard routing.
pub type CustomRoute =
    Arc<dyn Fn(&Operation, Option<&OperationResult>) -> Option<String> + Send + Sync>;

/// Registry of custom routing functions keyed by node id.
#[derive(Default)]
pub struct CustomLogicRegistry {
    routes: RwLock<HashMap<String, CustomRoute>>,
}

impl CustomLogicRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a function for a node id, replacing any existing one.
    pub fn register<F>(&self, node_id: impl Into<String>, f: F)
    where
        F: Fn(&Operation, Option<&OperationResult>) -> Option<String> + Send + Sync + 'static,
    {
        self.routes.write().insert(node_id.into(), Arc::new(f));
    }

    /// Invoke the function for `node_id`, if one is registered.
    pub fn evaluate(
        &self,
        node_id: &str,
        op: &Operation,
        result: Option<&OperationResult>,
    ) -> Option<String> {
        let f = self.routes.read().get(node_id).cloned()?;
        f(op, result)
    }

    /// Whether a function is registered for `node_id`.
    pub fn contains(&self, node_id: &str) -> bool {
        self.routes.read().contains_key(node_id)
    }
}

impl std::fmt::Debug for CustomLogicRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CustomLogicRegistry")
            .field("nodes", &self.routes.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_evaluate() {
        let registry = CustomLogicRegistry::new();
        registry.register("vip_check", |op, _| {
            (op.priority > 8).then(|| "fast_lane".to_string())
        });

        let vip = Operation::new("op1", "read_request").with_priority(9);
        let normal = Operation::new("op2", "read_request").with_priority(1);

        assert_eq!(
            registry.evaluate("vip_check", &vip, None),
            Some("fast_lane".to_string())
        );
        assert_eq!(registry.evaluate("vip_check", &normal, None), None);
        assert_eq!(registry.evaluate("missing", &vip, None), None);
    }
}
