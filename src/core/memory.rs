use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tracing::debug;

use crate::core::config::WorkerConfig;
use crate::core::errors::{ExecutorError, Result};

/// Identity of a node's output, derived from its type and resolved inputs
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CacheKey(pub u64);

impl CacheKey {
    /// Hash a canonical JSON signature into a key.
    ///
    /// serde_json objects keep their keys sorted, so equal signatures always
    /// serialize to the same text.
    pub fn from_signature(signature: &Value) -> Result<Self> {
        let canonical = serde_json::to_string(signature)?;
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        canonical.hash(&mut hasher);
        Ok(Self(hasher.finish()))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Configuration for cache behavior
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of entries
    pub max_entries: usize,
    /// Entries not used by the last N prompts are pruned
    pub retain_jobs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            retain_jobs: 1,
        }
    }
}

impl CacheConfig {
    pub fn from_worker_config(config: &WorkerConfig) -> Self {
        Self {
            max_entries: config.max_cache_entries,
            retain_jobs: config.cache_retain_jobs,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_entries == 0 {
            return Err(ExecutorError::configuration("max_entries cannot be zero"));
        }
        if self.retain_jobs == 0 {
            return Err(ExecutorError::configuration("retain_jobs cannot be zero"));
        }
        Ok(())
    }
}

/// Output slots of one node plus its UI payload
#[derive(Debug, Clone, PartialEq)]
pub struct CachedOutput {
    pub values: Arc<Vec<Value>>,
    pub ui: Option<Value>,
}

#[derive(Debug)]
struct CacheEntry {
    output: CachedOutput,
    /// Model residency generation the output depends on, if any
    generation: Option<u64>,
    last_used_job: u64,
    last_used_tick: u64,
    size_bytes: usize,
}

/// Estimate memory size of a JSON value
pub fn estimate_size(value: &Value) -> usize {
    match value {
        Value::Null => 8,
        Value::Bool(_) => 8,
        Value::Number(_) => 16,
        Value::String(s) => s.len() + 24,
        Value::Array(arr) => arr.iter().map(estimate_size).sum::<usize>() + 24,
        Value::Object(obj) => {
            obj.iter()
                .map(|(k, v)| k.len() + estimate_size(v))
                .sum::<usize>()
                + 24
        }
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub total_entries: usize,
    pub total_size_bytes: usize,
    pub hit_count: u64,
    pub miss_count: u64,
    /// Entries dropped by pruning
    pub eviction_count: u64,
    /// Entries dropped because their models were unloaded
    pub invalidation_count: u64,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hit_count + self.miss_count;
        if total == 0 {
            0.0
        } else {
            self.hit_count as f64 / total as f64
        }
    }
}

/// Node outputs kept across prompts, owned by the executor.
///
/// Not thread-safe on its own; only the worker thread touches it.
#[derive(Debug)]
pub struct NodeOutputCache {
    entries: HashMap<CacheKey, CacheEntry>,
    config: CacheConfig,
    stats: CacheStats,
    tick: u64,
}

impl NodeOutputCache {
    pub fn new(config: CacheConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            entries: HashMap::new(),
            config,
            stats: CacheStats::default(),
            tick: 0,
        })
    }

    /// Look up an entry for prompt number `job`.
    ///
    /// An entry produced under an older model residency generation is
    /// evicted and reported as a miss.
    pub fn get(&mut self, key: &CacheKey, generation: u64, job: u64) -> Option<CachedOutput> {
        let stale = match self.entries.get(key) {
            Some(entry) => entry.generation.map_or(false, |g| g != generation),
            None => {
                self.stats.miss_count += 1;
                return None;
            }
        };
        if stale {
            debug!("Cache entry {} invalidated by model unload", key);
            self.remove(key);
            self.stats.invalidation_count += 1;
            self.stats.miss_count += 1;
            return None;
        }

        self.tick += 1;
        let tick = self.tick;
        let entry = self.entries.get_mut(key)?;
        entry.last_used_job = job;
        entry.last_used_tick = tick;
        self.stats.hit_count += 1;
        Some(entry.output.clone())
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn insert(
        &mut self,
        key: CacheKey,
        output: CachedOutput,
        generation: Option<u64>,
        job: u64,
    ) {
        self.tick += 1;
        let size_bytes = output.values.iter().map(estimate_size).sum::<usize>()
            + output.ui.as_ref().map_or(0, estimate_size);
        let entry = CacheEntry {
            output,
            generation,
            last_used_job: job,
            last_used_tick: self.tick,
            size_bytes,
        };
        if let Some(old) = self.entries.insert(key, entry) {
            self.stats.total_size_bytes -= old.size_bytes;
        }
        self.stats.total_size_bytes += size_bytes;
        self.stats.total_entries = self.entries.len();
    }

    fn remove(&mut self, key: &CacheKey) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                self.stats.total_size_bytes -= entry.size_bytes;
                self.stats.total_entries = self.entries.len();
                true
            }
            None => false,
        }
    }

    /// Drop entries unused by the last `retain_jobs` prompts, then the least
    /// recently used ones above `max_entries`. Returns how many were dropped.
    pub fn prune(&mut self, current_job: u64) -> usize {
        let retain = self.config.retain_jobs;
        let expired: Vec<CacheKey> = self
            .entries
            .iter()
            .filter(|(_, entry)| current_job.saturating_sub(entry.last_used_job) >= retain)
            .map(|(key, _)| *key)
            .collect();
        let mut dropped = 0;
        for key in expired {
            if self.remove(&key) {
                dropped += 1;
            }
        }

        if self.entries.len() > self.config.max_entries {
            let mut by_age: Vec<(u64, CacheKey)> = self
                .entries
                .iter()
                .map(|(key, entry)| (entry.last_used_tick, *key))
                .collect();
            by_age.sort_unstable();
            let excess = self.entries.len() - self.config.max_entries;
            for (_, key) in by_age.into_iter().take(excess) {
                if self.remove(&key) {
                    dropped += 1;
                }
            }
        }

        if dropped > 0 {
            debug!("Pruned {} cache entries, {} remain", dropped, self.entries.len());
        }
        self.stats.eviction_count += dropped as u64;
        dropped
    }

    /// Release spare capacity after a reclamation pass
    pub fn compact(&mut self) {
        self.entries.shrink_to_fit();
    }

    /// Drop every entry
    pub fn clear(&mut self) {
        self.entries.clear();
        self.entries.shrink_to_fit();
        self.stats.total_entries = 0;
        self.stats.total_size_bytes = 0;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.clone()
    }
}
