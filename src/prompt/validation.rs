//! Prompt validation and execution ordering

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap, HashSet};

use crate::core::errors::{ExecutorError, Result};
use crate::nodes::registry::ActionRegistry;
use crate::prompt::graph::{InputValue, OrderedNodeId, Prompt};

/// Validated prompt: the nodes to visit in execution order and the outputs
/// to surface
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionPlan {
    /// Every node the outputs depend on, in stable topological order
    pub order: Vec<String>,
    pub outputs: Vec<String>,
}

/// Validates a prompt and orders the nodes the requested outputs depend on.
///
/// An empty `requested_outputs` selects every output node in the prompt.
pub fn plan_execution(
    prompt: &Prompt,
    registry: &ActionRegistry,
    requested_outputs: &[String],
) -> Result<ExecutionPlan> {
    if prompt.is_empty() {
        return Err(ExecutorError::validation("Prompt has no nodes"));
    }

    for (node_id, node) in &prompt.nodes {
        if !registry.contains(&node.class_type) {
            return Err(ExecutorError::validation_node(
                format!(
                    "Node type '{}' for node '{}' is not registered",
                    node.class_type, node_id
                ),
                node_id.clone(),
            ));
        }
    }

    let outputs = select_outputs(prompt, registry, requested_outputs)?;
    let needed = collect_needed(prompt, &outputs);

    for node_id in &needed {
        validate_node(prompt, registry, node_id)?;
    }

    detect_cycle(prompt, &needed)?;
    let order = stable_order(prompt, &needed)?;

    Ok(ExecutionPlan { order, outputs })
}

fn select_outputs(
    prompt: &Prompt,
    registry: &ActionRegistry,
    requested_outputs: &[String],
) -> Result<Vec<String>> {
    let mut outputs: Vec<String> = Vec::new();
    if requested_outputs.is_empty() {
        for (node_id, node) in &prompt.nodes {
            if registry
                .get(&node.class_type)
                .map_or(false, |action| action.is_output_node())
            {
                outputs.push(node_id.clone());
            }
        }
        if outputs.is_empty() {
            return Err(ExecutorError::validation("Prompt has no outputs"));
        }
    } else {
        for node_id in requested_outputs {
            if prompt.get(node_id).is_none() {
                return Err(ExecutorError::validation_node(
                    format!("Requested output node '{}' not found", node_id),
                    node_id.clone(),
                ));
            }
            if !outputs.contains(node_id) {
                outputs.push(node_id.clone());
            }
        }
    }
    outputs.sort_by(|a, b| crate::prompt::graph::compare_node_ids(a, b));
    Ok(outputs)
}

/// Outputs plus everything they transitively link to. Dangling links are
/// skipped here and reported by `validate_node`.
fn collect_needed(prompt: &Prompt, outputs: &[String]) -> HashSet<String> {
    let mut needed = HashSet::new();
    let mut stack: Vec<&str> = outputs.iter().map(String::as_str).collect();
    while let Some(node_id) = stack.pop() {
        if !needed.insert(node_id.to_string()) {
            continue;
        }
        if let Some(node) = prompt.get(node_id) {
            stack.extend(node.upstream().filter(|id| prompt.get(id).is_some()));
        }
    }
    needed
}

fn validate_node(prompt: &Prompt, registry: &ActionRegistry, node_id: &str) -> Result<()> {
    let node = prompt
        .get(node_id)
        .ok_or_else(|| ExecutorError::validation_node("Node not found", node_id))?;

    let mut literals = Map::new();
    for (name, input) in node.parsed_inputs() {
        match input {
            InputValue::Literal(value) => {
                literals.insert(name.to_string(), value.clone());
            }
            InputValue::Link {
                node_id: upstream,
                slot,
            } => {
                let source = prompt.get(upstream).ok_or_else(|| {
                    ExecutorError::validation_node(
                        format!(
                            "Input '{}' of node '{}' links to missing node '{}'",
                            name, node_id, upstream
                        ),
                        node_id,
                    )
                })?;
                let slots = registry
                    .get(&source.class_type)
                    .map_or(0, |action| action.output_count());
                if slot >= slots {
                    return Err(ExecutorError::validation_node(
                        format!(
                            "Input '{}' of node '{}' links to output {} of node '{}', which has {} outputs",
                            name, node_id, slot, upstream, slots
                        ),
                        node_id,
                    ));
                }
            }
        }
    }

    let schema = registry
        .get(&node.class_type)
        .and_then(|action| action.input_schema());
    if let Some(schema) = schema {
        let validator = jsonschema::validator_for(&schema).map_err(|e| {
            ExecutorError::validation_node(
                format!("Failed to compile input schema for '{}': {}", node.class_type, e),
                node_id,
            )
        })?;
        let instance = Value::Object(literals);
        if let Err(error) = validator.validate(&instance) {
            return Err(ExecutorError::validation_node(
                format!("Invalid inputs for node '{}': {}", node_id, error),
                node_id,
            ));
        }
    }
    Ok(())
}

fn build_graph<'a>(
    prompt: &'a Prompt,
    needed: &HashSet<String>,
) -> (DiGraph<&'a str, ()>, HashMap<&'a str, NodeIndex>) {
    let mut graph = DiGraph::new();
    let mut indices = HashMap::new();
    for node_id in prompt.nodes.keys().filter(|id| needed.contains(*id)) {
        indices.insert(node_id.as_str(), graph.add_node(node_id.as_str()));
    }
    for (node_id, node) in prompt.nodes.iter().filter(|(id, _)| needed.contains(*id)) {
        for upstream in node.upstream() {
            if let (Some(&from), Some(&to)) = (indices.get(upstream), indices.get(node_id.as_str())) {
                graph.add_edge(from, to, ());
            }
        }
    }
    (graph, indices)
}

fn detect_cycle(prompt: &Prompt, needed: &HashSet<String>) -> Result<()> {
    let (graph, _) = build_graph(prompt, needed);
    if let Err(cycle) = toposort(&graph, None) {
        let node_id = graph[cycle.node_id()].to_string();
        return Err(ExecutorError::validation_node(
            format!("Prompt contains a cycle through node '{}'", node_id),
            node_id,
        ));
    }
    Ok(())
}

/// Kahn traversal taking the smallest ready node id first
fn stable_order(prompt: &Prompt, needed: &HashSet<String>) -> Result<Vec<String>> {
    let mut pending_inputs: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

    for (node_id, node) in prompt.nodes.iter().filter(|(id, _)| needed.contains(*id)) {
        let upstream: BTreeSet<&str> = node.upstream().collect();
        pending_inputs.insert(node_id.as_str(), upstream.len());
        for source in upstream {
            dependents.entry(source).or_default().push(node_id.as_str());
        }
    }

    let mut ready: BTreeSet<OrderedNodeId> = pending_inputs
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(id, _)| OrderedNodeId(id.to_string()))
        .collect();

    let mut order = Vec::with_capacity(pending_inputs.len());
    while let Some(OrderedNodeId(node_id)) = ready.pop_first() {
        if let Some(children) = dependents.get(node_id.as_str()) {
            for child in children {
                if let Some(count) = pending_inputs.get_mut(child) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(OrderedNodeId(child.to_string()));
                    }
                }
            }
        }
        order.push(node_id);
    }

    if order.len() != pending_inputs.len() {
        return Err(ExecutorError::validation("Prompt contains a cycle"));
    }
    Ok(order)
}
