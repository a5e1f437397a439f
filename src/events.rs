//! Events published while prompts are queued and executed
//!
//! Every event is wrapped in an envelope with a sequence number, a timestamp
//! and the client it is addressed to. Previews are binary frames and only
//! reach sinks that understand them.

use async_broadcast::{InactiveReceiver, Receiver, Sender, TrySendError};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Binary frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum BinaryEventType {
    PreviewImage = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PreviewFormat {
    Jpeg,
    Png,
}

impl PreviewFormat {
    fn code(&self) -> u32 {
        match self {
            PreviewFormat::Jpeg => 1,
            PreviewFormat::Png => 2,
        }
    }
}

/// Encoded preview image reported by a node
#[derive(Debug, Clone, PartialEq)]
pub struct PreviewImage {
    pub format: PreviewFormat,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Event {
    Status {
        queue_remaining: usize,
    },
    ExecutionStart {
        prompt_id: String,
    },
    /// Nodes served from the cache in this run
    ExecutionCached {
        prompt_id: String,
        nodes: Vec<String>,
    },
    /// `node` is `None` once the worker is free again
    Executing {
        prompt_id: String,
        node: Option<String>,
    },
    Progress {
        prompt_id: String,
        node: Option<String>,
        value: u64,
        max: u64,
    },
    Executed {
        prompt_id: String,
        node: String,
        output: Value,
    },
    ExecutionSuccess {
        prompt_id: String,
    },
    /// `node_id` is `None` when the prompt failed validation
    ExecutionError {
        prompt_id: String,
        node_id: Option<String>,
        node_type: Option<String>,
        executed: Vec<String>,
        exception_message: String,
        current_inputs: Value,
    },
    ExecutionInterrupted {
        prompt_id: String,
        node_id: Option<String>,
        node_type: Option<String>,
        executed: Vec<String>,
    },
    #[serde(skip)]
    Preview(PreviewImage),
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Status { .. } => "status",
            Event::ExecutionStart { .. } => "execution_start",
            Event::ExecutionCached { .. } => "execution_cached",
            Event::Executing { .. } => "executing",
            Event::Progress { .. } => "progress",
            Event::Executed { .. } => "executed",
            Event::ExecutionSuccess { .. } => "execution_success",
            Event::ExecutionError { .. } => "execution_error",
            Event::ExecutionInterrupted { .. } => "execution_interrupted",
            Event::Preview(_) => "preview",
        }
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, Event::Preview(_))
    }

    /// Binary frame: big-endian event type, then the payload
    pub fn encode_binary(&self) -> Option<Vec<u8>> {
        match self {
            Event::Preview(image) => {
                let mut frame = Vec::with_capacity(8 + image.data.len());
                frame.extend_from_slice(&(BinaryEventType::PreviewImage as u32).to_be_bytes());
                frame.extend_from_slice(&image.format.code().to_be_bytes());
                frame.extend_from_slice(&image.data);
                Some(frame)
            }
            _ => None,
        }
    }
}

/// Event envelope with metadata
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventEnvelope {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    /// Client the event is addressed to; `None` means broadcast
    pub client_id: Option<String>,
    #[serde(flatten)]
    pub event: Event,
}

impl EventEnvelope {
    /// JSON form of a text event; binary events have none
    pub fn to_json(&self) -> Option<Value> {
        if self.event.is_binary() {
            return None;
        }
        serde_json::to_value(self).ok()
    }
}

/// Event sink trait for emitting events
pub trait EventSink: Send + Sync {
    /// Emit an event
    fn emit(&self, envelope: &EventEnvelope);
}

/// A simple logging event sink
pub struct LoggingEventSink;

impl EventSink for LoggingEventSink {
    fn emit(&self, envelope: &EventEnvelope) {
        tracing::debug!(
            "Event #{} {} for {:?}",
            envelope.sequence,
            envelope.event.kind(),
            envelope.client_id
        );
    }
}

/// A buffering event sink that collects events
#[derive(Default)]
pub struct BufferingEventSink {
    events: Arc<RwLock<Vec<EventEnvelope>>>,
}

impl BufferingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_events(&self) -> Vec<EventEnvelope> {
        self.events.read().clone()
    }

    /// Events of one kind, in publication order
    pub fn events_of(&self, kind: &str) -> Vec<Event> {
        self.events
            .read()
            .iter()
            .filter(|envelope| envelope.event.kind() == kind)
            .map(|envelope| envelope.event.clone())
            .collect()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.events
            .read()
            .iter()
            .map(|envelope| envelope.event.kind())
            .collect()
    }

    pub fn clear(&self) {
        self.events.write().clear();
    }
}

impl EventSink for BufferingEventSink {
    fn emit(&self, envelope: &EventEnvelope) {
        self.events.write().push(envelope.clone());
    }
}

/// Fans events out to async subscribers, dropping the oldest when full
pub struct BroadcastEventSink {
    sender: Sender<EventEnvelope>,
    receiver: InactiveReceiver<EventEnvelope>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (mut tx, rx) = async_broadcast::broadcast(capacity.max(1));
        tx.set_overflow(true);
        Self {
            sender: tx,
            receiver: rx.deactivate(),
        }
    }

    /// Receives every event published after this call
    pub fn subscribe(&self) -> Receiver<EventEnvelope> {
        self.receiver.activate_cloned()
    }
}

impl EventSink for BroadcastEventSink {
    fn emit(&self, envelope: &EventEnvelope) {
        match self.sender.try_broadcast(envelope.clone()) {
            Ok(_) => {}
            // nobody is listening
            Err(TrySendError::Inactive(_)) => {}
            Err(e) => tracing::debug!("Dropping event #{}: {}", envelope.sequence, e),
        }
    }
}

/// Publishes events to every registered sink
#[derive(Clone, Default)]
pub struct Notifier {
    sinks: Arc<Vec<Arc<dyn EventSink>>>,
    sequence: Arc<AtomicU64>,
}

impl Notifier {
    /// Notifier without sinks
    pub fn new() -> Self {
        Self::default()
    }

    /// Notifier that only logs
    pub fn logging() -> Self {
        Self::new().with_sink(Arc::new(LoggingEventSink))
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        Arc::make_mut(&mut self.sinks).push(sink);
        self
    }

    /// Wrap and deliver an event. Returns its sequence number.
    pub fn publish(&self, event: Event, client_id: Option<&str>) -> u64 {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let envelope = EventEnvelope {
            sequence,
            timestamp: Utc::now(),
            client_id: client_id.map(str::to_string),
            event,
        };
        for sink in self.sinks.iter() {
            sink.emit(&envelope);
        }
        sequence
    }
}
