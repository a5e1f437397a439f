//! Control flags shared between request handlers and the worker
//!
//! Flags are last-writer-wins and drained atomically by the worker. The
//! interrupt flag lives behind the same mutex but is not drained with them.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

use crate::core::errors::ExecutorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Flag {
    /// Unload every resident model
    UnloadModels,
    /// Drop the node output cache (and, by default, unload models)
    FreeMemory,
}

impl Flag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Flag::UnloadModels => "unload_models",
            Flag::FreeMemory => "free_memory",
        }
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Flag {
    type Err = ExecutorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unload_models" => Ok(Flag::UnloadModels),
            "free_memory" => Ok(Flag::FreeMemory),
            other => Err(ExecutorError::validation(format!("Unknown flag '{}'", other))),
        }
    }
}

/// Snapshot of drained flags
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Flags {
    values: HashMap<Flag, bool>,
}

impl Flags {
    pub fn get(&self, flag: Flag) -> Option<bool> {
        self.values.get(&flag).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn free_memory(&self) -> bool {
        self.get(Flag::FreeMemory).unwrap_or(false)
    }

    /// Defaults to the value of `free_memory` when not set explicitly
    pub fn unload_models(&self) -> bool {
        self.get(Flag::UnloadModels)
            .unwrap_or_else(|| self.free_memory())
    }
}

#[derive(Debug, Default)]
struct FlagState {
    flags: HashMap<Flag, bool>,
    interrupted: bool,
}

/// Mutex-guarded flag set plus the process interrupt flag
#[derive(Debug, Default)]
pub struct FlagChannel {
    state: Mutex<FlagState>,
}

impl FlagChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_flag(&self, flag: Flag, value: bool) {
        debug!("Flag {} set to {}", flag, value);
        self.state.lock().flags.insert(flag, value);
    }

    /// Read and reset all flags in one step
    pub fn get_flags_and_clear(&self) -> Flags {
        let values = std::mem::take(&mut self.state.lock().flags);
        Flags { values }
    }

    pub fn set_interrupt(&self) {
        self.state.lock().interrupted = true;
    }

    pub fn clear_interrupt(&self) {
        self.state.lock().interrupted = false;
    }

    pub fn is_interrupted(&self) -> bool {
        self.state.lock().interrupted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_writer_wins_and_clear() {
        let channel = FlagChannel::new();
        channel.set_flag(Flag::FreeMemory, false);
        channel.set_flag(Flag::FreeMemory, true);

        let flags = channel.get_flags_and_clear();
        assert!(flags.free_memory());
        assert!(flags.unload_models());
        assert!(channel.get_flags_and_clear().is_empty());
    }

    #[test]
    fn test_unload_explicit_overrides_default() {
        let channel = FlagChannel::new();
        channel.set_flag(Flag::FreeMemory, true);
        channel.set_flag(Flag::UnloadModels, false);
        let flags = channel.get_flags_and_clear();
        assert!(flags.free_memory());
        assert!(!flags.unload_models());

        channel.set_flag(Flag::UnloadModels, true);
        let flags = channel.get_flags_and_clear();
        assert!(!flags.free_memory());
        assert!(flags.unload_models());
    }

    #[test]
    fn test_interrupt_not_drained_with_flags() {
        let channel = FlagChannel::new();
        channel.set_interrupt();
        let _ = channel.get_flags_and_clear();
        assert!(channel.is_interrupted());
        channel.clear_interrupt();
        assert!(!channel.is_interrupted());
    }

    #[test]
    fn test_parse_flag_names() {
        assert_eq!("free_memory".parse::<Flag>().unwrap(), Flag::FreeMemory);
        assert_eq!("unload_models".parse::<Flag>().unwrap(), Flag::UnloadModels);
        assert!("reboot".parse::<Flag>().is_err());
    }
}
