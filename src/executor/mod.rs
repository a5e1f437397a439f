pub mod executor;
pub mod progress;

pub use executor::{ExecutionReport, PromptExecutor};
pub use progress::ProgressHandle;
