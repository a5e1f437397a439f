//! Submission, query and control surface shared by all callers
//!
//! Everything here runs on caller threads and only touches the queue and
//! the flag channel; prompt work happens on the worker thread.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::info;

use crate::core::config::WorkerConfig;
use crate::core::errors::Result;
use crate::core::memory::CacheConfig;
use crate::events::{Event, Notifier};
use crate::executor::PromptExecutor;
use crate::flags::{Flag, FlagChannel};
use crate::models::ModelManager;
use crate::nodes::ActionRegistry;
use crate::prompt::{plan_execution, Prompt};
use crate::queue::{HistoryEntry, Job, JobQueue, JobState, QueueEntry};
use crate::worker::{PromptWorker, WorkerHandle};

/// A prompt submission
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubmitRequest {
    pub prompt: Value,
    /// Generated when absent
    #[serde(default)]
    pub prompt_id: Option<String>,
    /// Explicit priority number; lower runs first. Leaves the counter alone.
    #[serde(default)]
    pub number: Option<i64>,
    /// Run before everything already queued. Ignored when `number` is set.
    #[serde(default)]
    pub front: bool,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub extra_data: Map<String, Value>,
    /// Node ids to surface; empty selects all output nodes
    #[serde(default)]
    pub outputs: Vec<String>,
}

impl SubmitRequest {
    pub fn new(prompt: Value) -> Self {
        Self {
            prompt,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmitResponse {
    pub prompt_id: String,
    pub number: i64,
    pub node_errors: Map<String, Value>,
}

/// Snapshot for `get_queue_state`
#[derive(Debug, Clone, Serialize)]
pub struct QueueState {
    pub running: Option<String>,
    pub pending: Vec<QueueEntry>,
}

pub struct PromptServer {
    config: WorkerConfig,
    queue: Arc<JobQueue>,
    flags: Arc<FlagChannel>,
    notifier: Notifier,
    registry: ActionRegistry,
    number: AtomicI64,
}

impl PromptServer {
    pub fn new(config: WorkerConfig, registry: ActionRegistry, notifier: Notifier) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            queue: Arc::new(JobQueue::new(config.max_history_size)),
            flags: Arc::new(FlagChannel::new()),
            config,
            notifier,
            registry,
            number: AtomicI64::new(0),
        })
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn flags(&self) -> &Arc<FlagChannel> {
        &self.flags
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// Worker sharing this server's queue, flags, registry and notifier
    pub fn build_worker(&self, models: Arc<dyn ModelManager>) -> Result<PromptWorker> {
        let executor = PromptExecutor::new(
            self.registry.clone(),
            self.flags.clone(),
            self.notifier.clone(),
            models.clone(),
            CacheConfig::from_worker_config(&self.config),
        )?;
        Ok(PromptWorker::new(
            &self.config,
            self.queue.clone(),
            self.flags.clone(),
            executor,
            self.notifier.clone(),
            models,
        ))
    }

    pub fn spawn_worker(&self, models: Arc<dyn ModelManager>) -> Result<WorkerHandle> {
        self.build_worker(models)?.spawn()
    }

    /// Validate and queue a prompt
    pub fn submit(&self, request: SubmitRequest) -> Result<SubmitResponse> {
        let prompt = Prompt::from_value(&request.prompt)?;
        plan_execution(&prompt, &self.registry, &request.outputs)?;

        let number = match request.number {
            Some(number) => number,
            None => {
                let counter = self.number.fetch_add(1, Ordering::SeqCst);
                if request.front {
                    -counter
                } else {
                    counter
                }
            }
        };

        let prompt_id = request
            .prompt_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let mut extra_data = request.extra_data;
        if let Some(client_id) = request.client_id {
            extra_data.insert("client_id".to_string(), Value::String(client_id));
        }

        let job = Job::new(prompt_id.clone(), prompt)
            .with_extra_data(extra_data)
            .with_outputs(request.outputs);
        self.queue.push(job, number)?;
        info!("Accepted prompt {} with number {}", prompt_id, number);
        self.publish_status();

        Ok(SubmitResponse {
            prompt_id,
            number,
            node_errors: Map::new(),
        })
    }

    pub fn publish_status(&self) {
        self.notifier.publish(
            Event::Status {
                queue_remaining: self.queue.get_tasks_remaining(),
            },
            None,
        );
    }

    pub fn get_queue_state(&self) -> QueueState {
        let snapshot = self.queue.get_current_queue();
        QueueState {
            running: snapshot.running.first().map(|job| job.prompt_id.clone()),
            pending: snapshot.pending,
        }
    }

    pub fn get_history(&self, limit: Option<usize>) -> Vec<HistoryEntry> {
        self.queue.get_history(limit)
    }

    pub fn get_history_item(&self, prompt_id: &str) -> Option<HistoryEntry> {
        self.queue.get_history_item(prompt_id)
    }

    pub fn get_tasks_remaining(&self) -> usize {
        self.queue.get_tasks_remaining()
    }

    pub fn job_state(&self, prompt_id: &str) -> Option<JobState> {
        self.queue.job_state(prompt_id)
    }

    /// Interrupt the running prompt. With `prompt_id`, only if that prompt is
    /// the one running. Returns whether the interrupt was raised.
    pub fn request_interrupt(&self, prompt_id: Option<&str>) -> bool {
        if let Some(target) = prompt_id {
            match self.queue.running_prompt_id() {
                Some(running) if running == target => {}
                _ => {
                    info!("Interrupt for {} ignored, not running", target);
                    return false;
                }
            }
        }
        self.flags.set_interrupt();
        true
    }

    pub fn request_free_memory(&self) {
        self.set_flag(Flag::FreeMemory, true);
    }

    pub fn request_unload_models(&self) {
        self.set_flag(Flag::UnloadModels, true);
    }

    /// Set a control flag and wake the worker so it is handled promptly
    pub fn set_flag(&self, flag: Flag, value: bool) {
        self.flags.set_flag(flag, value);
        self.queue.nudge();
    }

    pub fn delete_pending(&self, prompt_id: &str) -> bool {
        let deleted = self.queue.delete_queue_item(prompt_id);
        if deleted {
            self.publish_status();
        }
        deleted
    }

    pub fn wipe_pending(&self) -> usize {
        let removed = self.queue.wipe_queue();
        self.publish_status();
        removed
    }

    pub fn delete_history(&self, prompt_id: &str) -> bool {
        self.queue.delete_history_item(prompt_id)
    }

    pub fn wipe_history(&self) {
        self.queue.wipe_history();
    }
}
