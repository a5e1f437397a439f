// Core infrastructure shared by the queue, executor and worker

pub mod config;
pub mod errors;
pub mod memory;

// Re-export commonly used types
pub use config::WorkerConfig;
pub use errors::{ExecutorError, Result};
pub use memory::{CacheConfig, CacheKey, CacheStats, CachedOutput, NodeOutputCache};
