pub mod graph;
pub mod validation;

pub use graph::{compare_node_ids, InputValue, NodeSpec, Prompt};
pub use validation::{plan_execution, ExecutionPlan};
