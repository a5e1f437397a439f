//! Prompt graph model: node id → `{class_type, inputs}`

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::core::errors::{ExecutorError, Result};

/// A node as submitted in a prompt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub class_type: String,
    #[serde(default)]
    pub inputs: Map<String, Value>,
}

impl NodeSpec {
    pub fn new(class_type: impl Into<String>) -> Self {
        Self {
            class_type: class_type.into(),
            inputs: Map::new(),
        }
    }

    /// Builder-style literal or link input
    pub fn input(mut self, name: impl Into<String>, value: Value) -> Self {
        self.inputs.insert(name.into(), value);
        self
    }

    /// Builder-style link input to `node_id`'s output `slot`
    pub fn link(self, name: impl Into<String>, node_id: impl Into<String>, slot: usize) -> Self {
        self.input(name, json!([node_id.into(), slot]))
    }

    /// Inputs classified into literals and links
    pub fn parsed_inputs(&self) -> impl Iterator<Item = (&str, InputValue<'_>)> {
        self.inputs
            .iter()
            .map(|(name, value)| (name.as_str(), InputValue::parse(value)))
    }

    /// Upstream node ids this node links to
    pub fn upstream(&self) -> impl Iterator<Item = &str> {
        self.parsed_inputs().filter_map(|(_, input)| match input {
            InputValue::Link { node_id, .. } => Some(node_id),
            InputValue::Literal(_) => None,
        })
    }
}

/// A single input value: either a literal or a `[node_id, slot]` link
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InputValue<'a> {
    Literal(&'a Value),
    Link { node_id: &'a str, slot: usize },
}

impl<'a> InputValue<'a> {
    /// A two element array of a string and a non-negative integer is a link
    pub fn parse(value: &'a Value) -> Self {
        if let Some([Value::String(node_id), slot]) = value.as_array().map(Vec::as_slice) {
            if let Some(slot) = slot.as_u64() {
                return Self::Link {
                    node_id,
                    slot: slot as usize,
                };
            }
        }
        Self::Literal(value)
    }
}

/// A submitted graph
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Prompt {
    pub nodes: BTreeMap<String, NodeSpec>,
}

fn prompt_schema() -> Value {
    json!({
        "type": "object",
        "minProperties": 1,
        "additionalProperties": {
            "type": "object",
            "required": ["class_type"],
            "properties": {
                "class_type": { "type": "string", "minLength": 1 },
                "inputs": { "type": "object" }
            }
        }
    })
}

impl Prompt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_node(mut self, node_id: impl Into<String>, node: NodeSpec) -> Self {
        self.nodes.insert(node_id.into(), node);
        self
    }

    /// Parse a prompt from JSON, checking its shape first
    pub fn from_value(value: &Value) -> Result<Self> {
        let validator = jsonschema::validator_for(&prompt_schema())
            .map_err(|e| ExecutorError::internal(format!("Failed to compile prompt schema: {}", e)))?;
        if let Err(error) = validator.validate(value) {
            return Err(ExecutorError::validation(format!("Invalid prompt: {}", error)));
        }
        Ok(serde_json::from_value(value.clone())?)
    }

    pub fn get(&self, node_id: &str) -> Option<&NodeSpec> {
        self.nodes.get(node_id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Node ids that parse as integers sort numerically and before all others,
/// which sort lexicographically
pub fn compare_node_ids(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y).then_with(|| a.cmp(b)),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

/// Node id ordered with [`compare_node_ids`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderedNodeId(pub String);

impl Ord for OrderedNodeId {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_node_ids(&self.0, &other.0)
    }
}

impl PartialOrd for OrderedNodeId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_links_and_literals() {
        let link = json!(["4", 1]);
        assert_eq!(
            InputValue::parse(&link),
            InputValue::Link {
                node_id: "4",
                slot: 1
            }
        );
        let pair = json!([1, 2]);
        assert_eq!(InputValue::parse(&pair), InputValue::Literal(&pair));
        let negative = json!(["4", -1]);
        assert_eq!(InputValue::parse(&negative), InputValue::Literal(&negative));
    }

    #[test]
    fn test_from_value_checks_shape() {
        let prompt = Prompt::from_value(&json!({
            "1": {"class_type": "const", "inputs": {"value": 5}},
            "2": {"class_type": "add", "inputs": {"a": ["1", 0], "b": ["1", 0]}}
        }))
        .unwrap();
        assert_eq!(prompt.len(), 2);
        assert_eq!(prompt.get("2").unwrap().upstream().collect::<Vec<_>>(), vec!["1", "1"]);

        let err = Prompt::from_value(&json!({"1": {"inputs": {}}})).unwrap_err();
        assert!(matches!(err, ExecutorError::Validation { .. }));
        assert!(Prompt::from_value(&json!({})).is_err());
        assert!(Prompt::from_value(&json!([1, 2])).is_err());
    }

    #[test]
    fn test_node_id_ordering() {
        let mut ids = vec!["10", "b", "2", "a", "1"];
        ids.sort_by(|a, b| compare_node_ids(a, b));
        assert_eq!(ids, vec!["1", "2", "10", "a", "b"]);
    }
}
