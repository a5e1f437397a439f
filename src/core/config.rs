use crate::core::errors::{ExecutorError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Worker, queue and cache tuning parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Minimum seconds between two memory reclamation passes
    pub gc_collect_interval_secs: f64,
    /// Longest the worker blocks waiting for work when nothing is due
    pub max_idle_wait_secs: f64,
    /// Number of finished prompts kept in history
    pub max_history_size: usize,
    /// Cache entries not used by the last N prompts are pruned
    pub cache_retain_jobs: u64,
    /// Hard cap on node output cache entries
    pub max_cache_entries: usize,
    /// Capacity of the broadcast event channel
    pub event_buffer: usize,
    pub worker_thread_name: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            gc_collect_interval_secs: 10.0,
            max_idle_wait_secs: 1000.0,
            max_history_size: 10_000,
            cache_retain_jobs: 1,
            max_cache_entries: 10_000,
            event_buffer: 1024,
            worker_thread_name: "prompt-worker".to_string(),
        }
    }
}

impl WorkerConfig {
    /// Load configuration from a YAML file. Missing keys keep their defaults.
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ExecutorError::io(format!("read config {}", path.display()), e))?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: WorkerConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates configuration values
    pub fn validate(&self) -> Result<()> {
        if Duration::try_from_secs_f64(self.gc_collect_interval_secs).is_err() {
            return Err(ExecutorError::configuration_field(
                "gc_collect_interval_secs must be a non-negative number of seconds in range",
                "gc_collect_interval_secs",
            ));
        }
        if self.max_idle_wait_secs <= 0.0
            || Duration::try_from_secs_f64(self.max_idle_wait_secs).is_err()
        {
            return Err(ExecutorError::configuration_field(
                "max_idle_wait_secs must be greater than 0 and in range",
                "max_idle_wait_secs",
            ));
        }
        if self.max_history_size == 0 {
            return Err(ExecutorError::configuration_field(
                "max_history_size must be greater than 0",
                "max_history_size",
            ));
        }
        if self.cache_retain_jobs == 0 {
            return Err(ExecutorError::configuration_field(
                "cache_retain_jobs must be greater than 0",
                "cache_retain_jobs",
            ));
        }
        if self.max_cache_entries == 0 {
            return Err(ExecutorError::configuration_field(
                "max_cache_entries must be greater than 0",
                "max_cache_entries",
            ));
        }
        if self.event_buffer == 0 {
            return Err(ExecutorError::configuration_field(
                "event_buffer must be greater than 0",
                "event_buffer",
            ));
        }
        if self.worker_thread_name.trim().is_empty() {
            return Err(ExecutorError::configuration_field(
                "worker_thread_name cannot be empty",
                "worker_thread_name",
            ));
        }
        Ok(())
    }

    pub fn gc_collect_interval(&self) -> Duration {
        secs_to_duration(self.gc_collect_interval_secs)
    }

    pub fn max_idle_wait(&self) -> Duration {
        secs_to_duration(self.max_idle_wait_secs)
    }

    pub fn with_gc_collect_interval(mut self, interval: Duration) -> Self {
        self.gc_collect_interval_secs = interval.as_secs_f64();
        self
    }

    pub fn with_max_idle_wait(mut self, wait: Duration) -> Self {
        self.max_idle_wait_secs = wait.as_secs_f64();
        self
    }

    pub fn with_max_history_size(mut self, size: usize) -> Self {
        self.max_history_size = size;
        self
    }

    pub fn with_cache_retain_jobs(mut self, jobs: u64) -> Self {
        self.cache_retain_jobs = jobs;
        self
    }

    pub fn with_max_cache_entries(mut self, entries: usize) -> Self {
        self.max_cache_entries = entries;
        self
    }
}

/// Clamps instead of panicking on values `validate` would reject
fn secs_to_duration(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(Duration::MAX)
}
