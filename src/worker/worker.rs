//! The single worker thread: pops prompts, runs them, drains control flags
//! and reclaims memory on a debounce.

use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::runtime::Runtime;
use tracing::{debug, error, info};

use crate::core::config::WorkerConfig;
use crate::core::errors::{ExecutorError, Result};
use crate::events::{Event, Notifier};
use crate::executor::PromptExecutor;
use crate::flags::FlagChannel;
use crate::models::ModelManager;
use crate::queue::{JobQueue, StatusOutcome};
use crate::worker::reclaim::ReclaimTimer;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Running { prompt_id: String },
    /// Recording the result and draining control flags
    Draining { prompt_id: String },
}

/// What one loop iteration did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepReport {
    /// Prompt executed in this step and how it ended
    pub job: Option<(String, StatusOutcome)>,
    pub unloaded_models: bool,
    pub freed_memory: bool,
    pub reclaimed: bool,
}

pub struct PromptWorker {
    queue: Arc<JobQueue>,
    flags: Arc<FlagChannel>,
    executor: PromptExecutor,
    notifier: Notifier,
    models: Arc<dyn ModelManager>,
    timer: ReclaimTimer,
    max_idle_wait: Duration,
    thread_name: String,
    state: Arc<Mutex<WorkerState>>,
}

/// Errors from the queue mean the worker lost track of the in-flight job
fn in_flight_corruption(err: ExecutorError) -> ExecutorError {
    if err.is_fatal() {
        err
    } else {
        ExecutorError::internal(format!("In-flight job lost: {}", err))
    }
}

impl PromptWorker {
    pub fn new(
        config: &WorkerConfig,
        queue: Arc<JobQueue>,
        flags: Arc<FlagChannel>,
        executor: PromptExecutor,
        notifier: Notifier,
        models: Arc<dyn ModelManager>,
    ) -> Self {
        Self {
            queue,
            flags,
            executor,
            notifier,
            models,
            timer: ReclaimTimer::started_at(config.gc_collect_interval(), Instant::now()),
            max_idle_wait: config.max_idle_wait(),
            thread_name: config.worker_thread_name.clone(),
            state: Arc::new(Mutex::new(WorkerState::Idle)),
        }
    }

    pub fn executor(&self) -> &PromptExecutor {
        &self.executor
    }

    pub fn state(&self) -> WorkerState {
        self.state.lock().clone()
    }

    pub fn timer(&self) -> &ReclaimTimer {
        &self.timer
    }

    fn set_state(&self, state: WorkerState) {
        *self.state.lock() = state;
    }

    /// One loop iteration: wait for a prompt (at most until the next
    /// reclamation is due), run it, then handle flags and reclamation.
    pub fn step(&mut self, runtime: &Runtime) -> Result<StepReport> {
        let mut report = StepReport::default();
        let timeout = self.timer.next_wait(Instant::now(), self.max_idle_wait);

        if let Some(entry) = self.queue.pop(timeout) {
            let job = entry.job;
            let prompt_id = job.prompt_id.clone();
            self.set_state(WorkerState::Running {
                prompt_id: prompt_id.clone(),
            });
            self.flags.clear_interrupt();

            let started = Instant::now();
            let result = runtime.block_on(self.executor.execute(
                &job.prompt,
                &prompt_id,
                &job.outputs_to_execute,
                &job.extra_data,
            ));
            self.timer.mark_needed();

            self.set_state(WorkerState::Draining {
                prompt_id: prompt_id.clone(),
            });
            let status = result.status();
            let outcome = status.outcome;
            self.queue
                .complete(&prompt_id, result.outputs, status)
                .map_err(in_flight_corruption)?;
            self.notifier.publish(
                Event::Executing {
                    prompt_id: prompt_id.clone(),
                    node: None,
                },
                job.client_id(),
            );
            self.queue.ack(&prompt_id).map_err(in_flight_corruption)?;
            self.notifier.publish(
                Event::Status {
                    queue_remaining: self.queue.get_tasks_remaining(),
                },
                None,
            );
            info!(
                "Prompt executed in {:.2} seconds",
                started.elapsed().as_secs_f64()
            );
            report.job = Some((prompt_id, outcome));
        }

        let flags = self.flags.get_flags_and_clear();
        if flags.unload_models() {
            self.models.unload_all_models();
            self.timer.force();
            report.unloaded_models = true;
        }
        if flags.free_memory() {
            self.executor.reset();
            self.timer.force();
            report.freed_memory = true;
        }

        let now = Instant::now();
        if self.timer.is_due(now) {
            self.reclaim(now);
            report.reclaimed = true;
        }

        self.set_state(WorkerState::Idle);
        Ok(report)
    }

    fn reclaim(&mut self, now: Instant) {
        debug!("Reclaiming memory");
        self.models.soft_empty_cache();
        self.executor.compact_cache();
        self.timer.record_pass(now);
    }

    /// Loop until the queue is closed
    pub fn run(mut self) -> Result<()> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| ExecutorError::io("build worker runtime", e))?;
        info!("Prompt worker started");
        while !self.queue.is_closed() {
            self.step(&runtime)?;
        }
        info!("Prompt worker stopped");
        Ok(())
    }

    /// Run the loop on a dedicated thread. A fatal error or a panic outside
    /// node code aborts the process.
    pub fn spawn(self) -> Result<WorkerHandle> {
        let queue = self.queue.clone();
        let state = self.state.clone();
        let thread = thread::Builder::new()
            .name(self.thread_name.clone())
            .spawn(move || match panic::catch_unwind(AssertUnwindSafe(move || self.run())) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    error!("Prompt worker failed: {}", err);
                    if err.is_fatal() {
                        std::process::abort();
                    }
                }
                Err(_) => {
                    error!("Prompt worker panicked, aborting");
                    std::process::abort();
                }
            })
            .map_err(|e| ExecutorError::io("spawn worker thread", e))?;
        Ok(WorkerHandle {
            thread,
            queue,
            state,
        })
    }
}

pub struct WorkerHandle {
    thread: JoinHandle<()>,
    queue: Arc<JobQueue>,
    state: Arc<Mutex<WorkerState>>,
}

impl WorkerHandle {
    pub fn state(&self) -> WorkerState {
        self.state.lock().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Close the queue and wait for the current prompt to finish
    pub fn shutdown(self) -> Result<()> {
        self.queue.close();
        self.thread
            .join()
            .map_err(|_| ExecutorError::internal("worker thread panicked"))
    }
}
