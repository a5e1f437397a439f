pub mod job;
pub mod prompt_queue;

pub use job::{
    ExecutionStatus, HistoryEntry, Job, JobOutputs, JobState, MessageKind, NodeResult,
    QueueEntry, StatusMessage, StatusOutcome,
};
pub use prompt_queue::{JobQueue, QueueSnapshot};
