//! Node actions: the executable behind a node type
//!
//! Actions read their resolved inputs, do their work and return output slots.
//! They never touch the queue or the cache directly.

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::executor::progress::ProgressHandle;

/// Context for a single node invocation
#[derive(Clone)]
pub struct NodeCtx {
    /// Correlation id of the prompt being executed
    pub prompt_id: String,
    /// Node ID within the prompt graph
    pub node_id: String,
    pub class_type: String,
    /// Inputs with every link replaced by the upstream output value
    pub inputs: Map<String, Value>,
    /// Side-channel data submitted with the prompt
    pub extra_data: Value,
    /// Reports progress and observes the interrupt flag
    pub progress: ProgressHandle,
}

impl NodeCtx {
    /// Get input value by key
    pub fn get_input<T: serde::de::DeserializeOwned>(&self, key: &str) -> anyhow::Result<T> {
        let value = self
            .inputs
            .get(key)
            .ok_or_else(|| anyhow::anyhow!("Input '{}' not found", key))?;
        serde_json::from_value(value.clone())
            .map_err(|e| anyhow::anyhow!("Failed to deserialize input '{}': {}", key, e))
    }

    /// Get optional input value
    pub fn get_input_opt<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> anyhow::Result<Option<T>> {
        match self.inputs.get(key) {
            Some(value) if !value.is_null() => {
                let parsed = serde_json::from_value(value.clone())
                    .map_err(|e| anyhow::anyhow!("Failed to deserialize input '{}': {}", key, e))?;
                Ok(Some(parsed))
            }
            _ => Ok(None),
        }
    }
}

/// Output from node execution
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeOutput {
    /// One value per output slot, addressed by links as `[node_id, slot]`
    pub values: Vec<Value>,
    /// Payload surfaced to clients through `executed` events and history
    pub ui: Option<Value>,
}

impl NodeOutput {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values, ui: None }
    }

    /// Output with a single slot
    pub fn single(value: Value) -> Self {
        Self::new(vec![value])
    }

    pub fn with_ui(mut self, ui: Value) -> Self {
        self.ui = Some(ui);
        self
    }
}

/// Executable behind a node type.
///
/// `execute` runs on the worker thread and is never called concurrently with
/// another node. An action that is interrupted through its progress handle
/// must return the error; its output is then not cached. Side effects an
/// action performs before returning an error are not rolled back.
#[async_trait]
pub trait NodeAction: Send + Sync {
    /// Node type name used as `class_type` in prompts
    fn name(&self) -> &str;

    /// Execute the node action
    async fn execute(&self, ctx: &NodeCtx) -> anyhow::Result<NodeOutput>;

    /// Number of output slots links may reference
    fn output_count(&self) -> usize {
        1
    }

    /// Output nodes are executed when a prompt does not name its outputs
    fn is_output_node(&self) -> bool {
        false
    }

    /// Outputs reference resident models; cached entries are dropped once
    /// those models are unloaded
    fn holds_resources(&self) -> bool {
        false
    }

    /// Optional: JSON schema applied to the node's literal inputs
    fn input_schema(&self) -> Option<Value> {
        None
    }

    /// Optional: value folded into the cache key for state that lives outside
    /// the graph, such as a file's modification time
    fn fingerprint(&self, _inputs: &Map<String, Value>) -> Option<Value> {
        None
    }
}
