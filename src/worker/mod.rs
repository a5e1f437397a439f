pub mod reclaim;
pub mod worker;

pub use reclaim::ReclaimTimer;
pub use worker::{PromptWorker, StepReport, WorkerHandle, WorkerState};
