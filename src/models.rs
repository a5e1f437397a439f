//! Model residency seen from the worker
//!
//! The worker only needs to unload models, return spare device memory and
//! know whether anything was unloaded since a cache entry was produced.

use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

pub trait ModelManager: Send + Sync {
    /// Unload every resident model's weights
    fn unload_all_models(&self);

    /// Hand unused allocator memory back to the device
    fn soft_empty_cache(&self);

    /// Changes whenever resident models are unloaded. Cache entries that
    /// reference models are valid only for the generation they were made in.
    fn residency_generation(&self) -> u64;
}

/// In-process model set tracking what is loaded and how often memory was
/// reclaimed
#[derive(Debug, Default)]
pub struct ResidentModels {
    loaded: Mutex<BTreeSet<String>>,
    generation: AtomicU64,
    unload_count: AtomicU64,
    soft_empty_count: AtomicU64,
}

impl ResidentModels {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a model as resident
    pub fn load(&self, name: impl Into<String>) {
        self.loaded.lock().insert(name.into());
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.loaded.lock().contains(name)
    }

    pub fn loaded(&self) -> Vec<String> {
        self.loaded.lock().iter().cloned().collect()
    }

    pub fn unload_count(&self) -> u64 {
        self.unload_count.load(Ordering::SeqCst)
    }

    pub fn soft_empty_count(&self) -> u64 {
        self.soft_empty_count.load(Ordering::SeqCst)
    }
}

impl ModelManager for ResidentModels {
    fn unload_all_models(&self) {
        let unloaded = std::mem::take(&mut *self.loaded.lock());
        info!("Unloading {} models", unloaded.len());
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.unload_count.fetch_add(1, Ordering::SeqCst);
    }

    fn soft_empty_cache(&self) {
        self.soft_empty_count.fetch_add(1, Ordering::SeqCst);
    }

    fn residency_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}
