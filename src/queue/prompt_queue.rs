//! Priority queue of prompts with in-flight tracking and bounded history
//!
//! Single consumer: only the worker calls `pop`, `complete` and `ack`.

use parking_lot::{Condvar, Mutex};
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::core::errors::{ExecutorError, Result};
use crate::queue::job::{ExecutionStatus, HistoryEntry, Job, JobOutputs, JobState, QueueEntry};

#[derive(Debug)]
struct RunningJob {
    job: Arc<Job>,
    completed: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: BinaryHeap<QueueEntry>,
    pending_ids: HashSet<String>,
    running: HashMap<String, RunningJob>,
    history: VecDeque<HistoryEntry>,
    next_sequence: u64,
    /// Pushed and not yet acknowledged or deleted
    unfinished: usize,
    /// Set by `nudge`, consumed by the next `pop`
    nudged: bool,
    closed: bool,
}

impl QueueState {
    fn finish_one(&mut self) -> bool {
        self.unfinished = self.unfinished.saturating_sub(1);
        self.unfinished == 0
    }
}

/// Read-only view of queued and running work
#[derive(Debug, Clone)]
pub struct QueueSnapshot {
    pub running: Vec<Arc<Job>>,
    /// Pending entries in the order they will be popped
    pub pending: Vec<QueueEntry>,
}

pub struct JobQueue {
    state: Mutex<QueueState>,
    not_empty: Condvar,
    all_done: Condvar,
    max_history_size: usize,
}

impl JobQueue {
    pub fn new(max_history_size: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            not_empty: Condvar::new(),
            all_done: Condvar::new(),
            max_history_size: max_history_size.max(1),
        }
    }

    /// Queue a job. Lower `priority` runs first. Never blocks.
    pub fn push(&self, mut job: Job, priority: i64) -> Result<Arc<Job>> {
        let mut state = self.state.lock();
        if state.pending_ids.contains(&job.prompt_id) || state.running.contains_key(&job.prompt_id)
        {
            return Err(ExecutorError::duplicate_job(job.prompt_id));
        }

        job.sequence = state.next_sequence;
        state.next_sequence += 1;
        let job = Arc::new(job);
        state.pending_ids.insert(job.prompt_id.clone());
        state.pending.push(QueueEntry {
            priority,
            sequence: job.sequence,
            job: job.clone(),
        });
        state.unfinished += 1;
        debug!(
            "Queued prompt {} (priority {}, sequence {})",
            job.prompt_id, priority, job.sequence
        );
        drop(state);

        self.not_empty.notify_one();
        Ok(job)
    }

    /// Take the next job, waiting up to `timeout`.
    ///
    /// Returns `None` on timeout, or early when the queue is empty and a
    /// `nudge` arrived since the previous `pop`. Either way the nudge is
    /// consumed.
    pub fn pop(&self, timeout: Duration) -> Option<QueueEntry> {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.state.lock();

        while state.pending.is_empty() || state.closed {
            if state.nudged || state.closed {
                state.nudged = false;
                return None;
            }
            match deadline {
                Some(deadline) => {
                    if self.not_empty.wait_until(&mut state, deadline).timed_out()
                        && state.pending.is_empty()
                    {
                        state.nudged = false;
                        return None;
                    }
                }
                None => self.not_empty.wait(&mut state),
            }
        }

        state.nudged = false;
        let entry = state.pending.pop()?;
        state.pending_ids.remove(&entry.job.prompt_id);
        state.running.insert(
            entry.job.prompt_id.clone(),
            RunningJob {
                job: entry.job.clone(),
                completed: false,
            },
        );
        Some(entry)
    }

    /// Make the current or next `pop` return promptly so the worker can look
    /// at control flags
    pub fn nudge(&self) {
        self.state.lock().nudged = true;
        self.not_empty.notify_all();
    }

    /// Stop handing out work. `pop` returns `None` from now on; pending jobs
    /// stay queued.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.not_empty.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Record the terminal status of an in-flight job. Callable once per job.
    pub fn complete(
        &self,
        prompt_id: &str,
        outputs: JobOutputs,
        status: ExecutionStatus,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if !state.running.contains_key(prompt_id)
            && state.history.iter().any(|h| h.job.prompt_id == prompt_id)
        {
            return Err(ExecutorError::duplicate_completion(prompt_id));
        }
        let running = state
            .running
            .get_mut(prompt_id)
            .ok_or_else(|| ExecutorError::unknown_job(prompt_id))?;
        if running.completed {
            return Err(ExecutorError::duplicate_completion(prompt_id));
        }
        running.completed = true;
        let job = running.job.clone();

        state.history.retain(|h| h.job.prompt_id != prompt_id);
        state.history.push_back(HistoryEntry {
            job,
            outputs,
            status,
        });
        while state.history.len() > self.max_history_size {
            state.history.pop_front();
        }
        Ok(())
    }

    /// Mark an in-flight job as fully processed. It must be completed first.
    pub fn ack(&self, prompt_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        match state.running.get(prompt_id) {
            Some(running) if running.completed => {}
            Some(_) => {
                return Err(ExecutorError::internal(format!(
                    "Prompt {} acknowledged before completion",
                    prompt_id
                )))
            }
            None => return Err(ExecutorError::unknown_job(prompt_id)),
        }
        state.running.remove(prompt_id);
        if state.finish_one() {
            self.all_done.notify_all();
        }
        Ok(())
    }

    /// Block until every pushed job is acknowledged or deleted. `None` waits
    /// forever. Returns false on timeout.
    pub fn join(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let mut state = self.state.lock();
        while state.unfinished > 0 {
            match deadline {
                Some(deadline) => {
                    if self.all_done.wait_until(&mut state, deadline).timed_out() {
                        return state.unfinished == 0;
                    }
                }
                None => self.all_done.wait(&mut state),
            }
        }
        true
    }

    pub fn get_current_queue(&self) -> QueueSnapshot {
        let state = self.state.lock();
        let mut running: Vec<Arc<Job>> = state.running.values().map(|r| r.job.clone()).collect();
        running.sort_by_key(|job| job.sequence);
        let mut pending: Vec<QueueEntry> = state.pending.iter().cloned().collect();
        pending.sort_by_key(|e| (e.priority, e.sequence));
        QueueSnapshot { running, pending }
    }

    /// Pending plus in-flight jobs
    pub fn get_tasks_remaining(&self) -> usize {
        let state = self.state.lock();
        state.pending.len() + state.running.len()
    }

    /// The `max_items` most recent history entries, oldest first
    pub fn get_history(&self, max_items: Option<usize>) -> Vec<HistoryEntry> {
        let state = self.state.lock();
        let take = max_items.unwrap_or(state.history.len()).min(state.history.len());
        state
            .history
            .iter()
            .skip(state.history.len() - take)
            .cloned()
            .collect()
    }

    pub fn get_history_item(&self, prompt_id: &str) -> Option<HistoryEntry> {
        let state = self.state.lock();
        state
            .history
            .iter()
            .find(|h| h.job.prompt_id == prompt_id)
            .cloned()
    }

    pub fn delete_history_item(&self, prompt_id: &str) -> bool {
        let mut state = self.state.lock();
        let before = state.history.len();
        state.history.retain(|h| h.job.prompt_id != prompt_id);
        state.history.len() != before
    }

    pub fn wipe_history(&self) {
        self.state.lock().history.clear();
    }

    /// Remove a still-pending job. False once it is in flight or finished.
    pub fn delete_queue_item(&self, prompt_id: &str) -> bool {
        let mut state = self.state.lock();
        if !state.pending_ids.remove(prompt_id) {
            return false;
        }
        state.pending.retain(|e| e.job.prompt_id != prompt_id);
        if state.finish_one() {
            self.all_done.notify_all();
        }
        true
    }

    /// Remove every pending job; the in-flight job is unaffected
    pub fn wipe_queue(&self) -> usize {
        let mut state = self.state.lock();
        let removed = state.pending.len();
        state.pending.clear();
        state.pending_ids.clear();
        state.unfinished = state.unfinished.saturating_sub(removed);
        if removed > 0 {
            warn!("Wiped {} pending prompts", removed);
        }
        if state.unfinished == 0 {
            self.all_done.notify_all();
        }
        removed
    }

    pub fn job_state(&self, prompt_id: &str) -> Option<JobState> {
        let state = self.state.lock();
        if state.pending_ids.contains(prompt_id) {
            return Some(JobState::Pending);
        }
        if let Some(running) = state.running.get(prompt_id) {
            return Some(if running.completed {
                JobState::Completed
            } else {
                JobState::Running
            });
        }
        state
            .history
            .iter()
            .find(|h| h.job.prompt_id == prompt_id)
            .map(|h| JobState::History(h.status.outcome))
    }

    /// Id of the job currently in flight, if any
    pub fn running_prompt_id(&self) -> Option<String> {
        self.state.lock().running.keys().next().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::Prompt;
    use crate::queue::job::StatusOutcome;
    use std::thread;

    fn job(id: &str) -> Job {
        Job::new(id, Prompt::new())
    }

    #[test]
    fn test_pop_times_out_when_empty() {
        let queue = JobQueue::new(10);
        let start = Instant::now();
        assert!(queue.pop(Duration::from_millis(20)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_nudge_wakes_pop() {
        let queue = Arc::new(JobQueue::new(10));
        let q = queue.clone();
        let waiter = thread::spawn(move || q.pop(Duration::from_secs(30)));
        thread::sleep(Duration::from_millis(50));
        queue.nudge();
        assert!(waiter.join().unwrap().is_none());
    }

    #[test]
    fn test_nudge_before_pop_is_kept() {
        let queue = JobQueue::new(10);
        queue.nudge();
        let start = Instant::now();
        assert!(queue.pop(Duration::from_secs(30)).is_none());
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(queue.pop(Duration::from_millis(20)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_push_wakes_blocked_pop() {
        let queue = Arc::new(JobQueue::new(10));
        let q = queue.clone();
        let waiter = thread::spawn(move || q.pop(Duration::from_secs(30)));
        thread::sleep(Duration::from_millis(50));
        queue.push(job("a"), 0).unwrap();
        let entry = waiter.join().unwrap().unwrap();
        assert_eq!(entry.job.prompt_id, "a");
        assert_eq!(queue.job_state("a"), Some(JobState::Running));
    }

    #[test]
    fn test_close_stops_pop() {
        let queue = JobQueue::new(10);
        queue.push(job("a"), 0).unwrap();
        queue.close();
        assert!(queue.pop(Duration::from_secs(30)).is_none());
        assert_eq!(queue.job_state("a"), Some(JobState::Pending));
    }

    #[test]
    fn test_duplicate_push_rejected() {
        let queue = JobQueue::new(10);
        queue.push(job("a"), 0).unwrap();
        assert!(matches!(
            queue.push(job("a"), 1),
            Err(ExecutorError::DuplicateJob { .. })
        ));
    }

    #[test]
    fn test_ack_requires_completion() {
        let queue = JobQueue::new(10);
        queue.push(job("a"), 0).unwrap();
        queue.pop(Duration::ZERO).unwrap();
        assert!(queue.ack("a").unwrap_err().is_fatal());
        queue
            .complete("a", JobOutputs::new(), ExecutionStatus::success(vec![]))
            .unwrap();
        assert_eq!(queue.job_state("a"), Some(JobState::Completed));
        queue.ack("a").unwrap();
        assert_eq!(
            queue.job_state("a"),
            Some(JobState::History(StatusOutcome::Success))
        );
        assert!(matches!(
            queue.ack("a"),
            Err(ExecutorError::UnknownJob { .. })
        ));
    }

    #[test]
    fn test_complete_unknown_job() {
        let queue = JobQueue::new(10);
        assert!(matches!(
            queue.complete("nope", JobOutputs::new(), ExecutionStatus::success(vec![])),
            Err(ExecutorError::UnknownJob { .. })
        ));
    }
}
