pub mod action;
pub mod builtin;
pub mod registry;

pub use action::{NodeAction, NodeCtx, NodeOutput};
pub use builtin::{AddAction, ConstAction, OutputAction};
pub use registry::ActionRegistry;
