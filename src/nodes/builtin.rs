//! Built-in node types used by the worker binary and the tests

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::nodes::action::{NodeAction, NodeCtx, NodeOutput};
use crate::nodes::registry::ActionRegistry;

pub fn register_builtins(registry: &ActionRegistry) {
    registry.register(Arc::new(ConstAction));
    registry.register(Arc::new(AddAction));
    registry.register(Arc::new(OutputAction));
}

/// Emits its `value` input unchanged
pub struct ConstAction;

#[async_trait]
impl NodeAction for ConstAction {
    fn name(&self) -> &str {
        "const"
    }

    async fn execute(&self, ctx: &NodeCtx) -> anyhow::Result<NodeOutput> {
        let value: Value = ctx.get_input("value")?;
        Ok(NodeOutput::single(value))
    }

    fn input_schema(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "required": ["value"]
        }))
    }
}

/// Sums inputs `a` and `b`. Integers stay integers.
pub struct AddAction;

#[async_trait]
impl NodeAction for AddAction {
    fn name(&self) -> &str {
        "add"
    }

    async fn execute(&self, ctx: &NodeCtx) -> anyhow::Result<NodeOutput> {
        let a: Value = ctx.get_input("a")?;
        let b: Value = ctx.get_input("b")?;
        tracing::debug!("add node {}: {} + {}", ctx.node_id, a, b);

        if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
            let sum = x
                .checked_add(y)
                .ok_or_else(|| anyhow::anyhow!("integer overflow adding {} and {}", x, y))?;
            return Ok(NodeOutput::single(json!(sum)));
        }
        match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => Ok(NodeOutput::single(json!(x + y))),
            _ => Err(anyhow::anyhow!("add expects numbers, got {} and {}", a, b)),
        }
    }

    fn input_schema(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "properties": {
                "a": { "type": "number" },
                "b": { "type": "number" }
            }
        }))
    }
}

/// Surfaces its `value` input as a UI payload
pub struct OutputAction;

#[async_trait]
impl NodeAction for OutputAction {
    fn name(&self) -> &str {
        "output"
    }

    async fn execute(&self, ctx: &NodeCtx) -> anyhow::Result<NodeOutput> {
        let value: Value = ctx.get_input("value")?;
        Ok(NodeOutput::single(value.clone()).with_ui(json!({ "value": [value] })))
    }

    fn is_output_node(&self) -> bool {
        true
    }
}
