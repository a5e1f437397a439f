//! Registry for NodeAction instances keyed by node type

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::nodes::action::NodeAction;

/// Registry for node actions
#[derive(Clone)]
pub struct ActionRegistry {
    actions: Arc<RwLock<HashMap<String, Arc<dyn NodeAction>>>>,
}

impl ActionRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            actions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Registry preloaded with the built-in node types
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        crate::nodes::builtin::register_builtins(&registry);
        registry
    }

    /// Register an action, replacing any action with the same name
    pub fn register(&self, action: Arc<dyn NodeAction>) {
        let mut actions = self.actions.write();
        actions.insert(action.name().to_string(), action);
    }

    /// Get an action by name
    pub fn get(&self, name: &str) -> Option<Arc<dyn NodeAction>> {
        let actions = self.actions.read();
        actions.get(name).cloned()
    }

    /// Check if an action is registered
    pub fn contains(&self, name: &str) -> bool {
        let actions = self.actions.read();
        actions.contains_key(name)
    }

    /// List all registered action names, sorted
    pub fn list(&self) -> Vec<String> {
        let actions = self.actions.read();
        let mut names: Vec<String> = actions.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
