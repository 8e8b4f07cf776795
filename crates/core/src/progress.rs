//! Progress events and the progress arithmetic shared by scheduler and observers.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::scheduling::TaskStatus;
use crate::types::{DbId, Timestamp};

/// Prefix of the session id that routes a task's events to its subscribers.
pub const SESSION_PREFIX: &str = "synthesis_";

/// Session id under which a task's progress events are published.
pub fn session_id_for_task(task_id: DbId) -> String {
    format!("{SESSION_PREFIX}{task_id}")
}

/// Integer completion percentage, rounded down and clamped to 100.
///
/// A task with no segments reports 0.
pub fn progress_percent(completed: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    ((completed.min(total) * 100) / total) as u8
}

/// One progress notification produced by the scheduler.
///
/// Ephemeral: delivered to the session's current subscribers and never
/// persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub session_id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub status: TaskStatus,
    pub progress: u8,
    pub message: String,
    /// Structured, event-specific payload.
    pub data: serde_json::Value,
    pub timestamp: Timestamp,
}

impl ProgressEvent {
    pub fn new(
        session_id: impl Into<String>,
        event_type: impl Into<String>,
        status: TaskStatus,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            event_type: event_type.into(),
            status,
            progress: 0,
            message: String::new(),
            data: serde_json::Value::Object(Default::default()),
            timestamp: Utc::now(),
        }
    }

    pub fn with_progress(mut self, progress: u8) -> Self {
        self.progress = progress.min(100);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}
