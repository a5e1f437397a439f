//! Single-node prompt executor.
//!
//! Prompts are graphs of typed nodes. They are queued by priority and run one
//! at a time on a dedicated worker thread that reuses cached node outputs,
//! honors interrupt and memory-release requests, and reclaims memory on a
//! debounce.

// Core infrastructure modules
pub mod core;

pub mod events;
pub mod executor;
pub mod flags;
pub mod models;
pub mod nodes;
pub mod prompt;
pub mod queue;
pub mod server;
pub mod worker;

// Re-exports for convenience
pub use core::config::WorkerConfig;
pub use core::errors::{ExecutorError, Result};
pub use events::{Event, EventEnvelope, EventSink, Notifier};
pub use executor::{ExecutionReport, PromptExecutor};
pub use flags::{Flag, FlagChannel};
pub use models::{ModelManager, ResidentModels};
pub use nodes::{ActionRegistry, NodeAction, NodeCtx, NodeOutput};
pub use prompt::{NodeSpec, Prompt};
pub use queue::{ExecutionStatus, Job, JobQueue, StatusOutcome};
pub use server::{PromptServer, SubmitRequest, SubmitResponse};
pub use worker::{PromptWorker, ReclaimTimer, WorkerHandle};
