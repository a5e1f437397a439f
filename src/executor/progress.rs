use std::sync::Arc;

use crate::core::errors::{ExecutorError, Result};
use crate::events::{Event, Notifier, PreviewImage};
use crate::flags::FlagChannel;

/// Handed to each node so long-running work can report progress and stop
/// when the prompt is interrupted
#[derive(Clone)]
pub struct ProgressHandle {
    flags: Arc<FlagChannel>,
    notifier: Notifier,
    prompt_id: String,
    node_id: Option<String>,
    client_id: Option<String>,
}

impl ProgressHandle {
    pub fn new(
        flags: Arc<FlagChannel>,
        notifier: Notifier,
        prompt_id: impl Into<String>,
        node_id: Option<String>,
        client_id: Option<String>,
    ) -> Self {
        Self {
            flags,
            notifier,
            prompt_id: prompt_id.into(),
            node_id,
            client_id,
        }
    }

    /// Err once an interrupt has been requested
    pub fn check_interrupt(&self) -> Result<()> {
        if self.flags.is_interrupted() {
            return Err(ExecutorError::interrupted(self.node_id.clone()));
        }
        Ok(())
    }

    pub fn report(&self, value: u64, max: u64) -> Result<()> {
        self.check_interrupt()?;
        self.notifier.publish(
            Event::Progress {
                prompt_id: self.prompt_id.clone(),
                node: self.node_id.clone(),
                value,
                max,
            },
            self.client_id.as_deref(),
        );
        Ok(())
    }

    /// Progress followed by a binary preview frame
    pub fn report_with_preview(&self, value: u64, max: u64, preview: PreviewImage) -> Result<()> {
        self.report(value, max)?;
        self.notifier
            .publish(Event::Preview(preview), self.client_id.as_deref());
        Ok(())
    }
}
