//! Jobs, queue entries and terminal status records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::prompt::Prompt;

/// A submitted prompt. Immutable once queued.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Job {
    /// Assigned by the queue on push
    pub sequence: u64,
    pub prompt_id: String,
    pub prompt: Prompt,
    /// Side-channel data, e.g. the submitting client's id
    pub extra_data: Map<String, Value>,
    /// Node ids whose outputs are surfaced; empty selects all output nodes
    pub outputs_to_execute: Vec<String>,
}

impl Job {
    pub fn new(prompt_id: impl Into<String>, prompt: Prompt) -> Self {
        Self {
            sequence: 0,
            prompt_id: prompt_id.into(),
            prompt,
            extra_data: Map::new(),
            outputs_to_execute: Vec::new(),
        }
    }

    pub fn with_extra_data(mut self, extra_data: Map<String, Value>) -> Self {
        self.extra_data = extra_data;
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.extra_data
            .insert("client_id".to_string(), Value::String(client_id.into()));
        self
    }

    pub fn with_outputs(mut self, outputs: Vec<String>) -> Self {
        self.outputs_to_execute = outputs;
        self
    }

    /// Client events for this job are addressed to
    pub fn client_id(&self) -> Option<&str> {
        self.extra_data.get("client_id").and_then(Value::as_str)
    }
}

/// A job waiting in the queue.
///
/// Ordered so that a max-heap pops the lowest priority number first, then
/// the earliest sequence.
#[derive(Debug, Clone, Serialize)]
pub struct QueueEntry {
    pub priority: i64,
    pub sequence: u64,
    pub job: Arc<Job>,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl Eq for QueueEntry {}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusOutcome {
    Pending,
    Success,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    ExecutionStart,
    ExecutionCached,
    ExecutionError,
    ExecutionInterrupted,
    ExecutionSuccess,
}

/// One diagnostic entry recorded while a job ran
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusMessage {
    pub kind: MessageKind,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
}

impl StatusMessage {
    pub fn new(kind: MessageKind, data: Value) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            data,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStatus {
    pub outcome: StatusOutcome,
    pub completed: bool,
    pub messages: Vec<StatusMessage>,
}

impl ExecutionStatus {
    pub fn success(messages: Vec<StatusMessage>) -> Self {
        Self {
            outcome: StatusOutcome::Success,
            completed: true,
            messages,
        }
    }

    pub fn error(messages: Vec<StatusMessage>) -> Self {
        Self {
            outcome: StatusOutcome::Error,
            completed: false,
            messages,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == StatusOutcome::Success
    }

    /// First message of a kind
    pub fn message(&self, kind: MessageKind) -> Option<&StatusMessage> {
        self.messages.iter().find(|m| m.kind == kind)
    }
}

/// Surfaced output of a single node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeResult {
    pub values: Vec<Value>,
    pub ui: Option<Value>,
}

pub type JobOutputs = BTreeMap<String, NodeResult>;

/// A finished job as kept in history
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub job: Arc<Job>,
    pub outputs: JobOutputs,
    pub status: ExecutionStatus,
}

/// Where a job currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    /// Completed, waiting for the worker's acknowledgement
    Completed,
    History(StatusOutcome),
}
