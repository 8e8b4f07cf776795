//! Synthesis task scheduling constants, statuses, and the task state machine.
//!
//! Lives in `core` so the store, the scheduler, and the broadcaster agree on
//! one definition of what a status means and which transitions are legal.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Smallest accepted concurrency window.
pub const MIN_BATCH_SIZE: usize = 1;

/// Largest accepted concurrency window.
pub const MAX_BATCH_SIZE: usize = 50;

/// Retry budget used when a plan does not specify one.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Upper bound on a plan's retry budget.
pub const MAX_RETRIES_LIMIT: u32 = 10;

/// Error message recorded on a task that was cancelled by a caller.
pub const CANCELLED_REASON: &str = "cancelled";

// ---------------------------------------------------------------------------
// Statuses
// ---------------------------------------------------------------------------

/// Lifecycle status of a synthesis task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    /// Completed and Failed admit no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Processing status of a single text segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentStatus {
    Pending,
    Completed,
    Failed,
}

impl SegmentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SegmentStatus::Pending => "pending",
            SegmentStatus::Completed => "completed",
            SegmentStatus::Failed => "failed",
        }
    }

    /// A terminal segment is immutable and skipped by later passes.
    pub fn is_terminal(self) -> bool {
        !matches!(self, SegmentStatus::Pending)
    }
}

impl fmt::Display for SegmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a requested concurrency window size.
pub fn validate_batch_size(batch_size: usize) -> Result<(), CoreError> {
    if !(MIN_BATCH_SIZE..=MAX_BATCH_SIZE).contains(&batch_size) {
        return Err(CoreError::Validation(format!(
            "batch_size must be between {MIN_BATCH_SIZE} and {MAX_BATCH_SIZE}, got {batch_size}"
        )));
    }
    Ok(())
}

/// Validate a requested retry budget.
pub fn validate_max_retries(max_retries: u32) -> Result<(), CoreError> {
    if max_retries > MAX_RETRIES_LIMIT {
        return Err(CoreError::Validation(format!(
            "max_retries must not exceed {MAX_RETRIES_LIMIT}, got {max_retries}"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

pub mod state_machine {
    use super::TaskStatus;
    use crate::error::CoreError;

    /// Returns the set of statuses reachable from `from`.
    ///
    /// Terminal states return an empty slice.
    pub fn valid_transitions(from: TaskStatus) -> &'static [TaskStatus] {
        match from {
            // start, cancel
            TaskStatus::Pending => &[TaskStatus::Running, TaskStatus::Failed],
            // systemic retry, pause observed, drained, cancel/exhausted/no output
            TaskStatus::Running => &[
                TaskStatus::Pending,
                TaskStatus::Paused,
                TaskStatus::Completed,
                TaskStatus::Failed,
            ],
            // resume, cancel
            TaskStatus::Paused => &[TaskStatus::Pending, TaskStatus::Failed],
            TaskStatus::Completed | TaskStatus::Failed => &[],
        }
    }

    /// Check whether a transition from `from` to `to` is valid.
    pub fn can_transition(from: TaskStatus, to: TaskStatus) -> bool {
        valid_transitions(from).contains(&to)
    }

    /// Validate a state transition.
    pub fn validate_transition(from: TaskStatus, to: TaskStatus) -> Result<(), CoreError> {
        if can_transition(from, to) {
            Ok(())
        } else {
            Err(CoreError::InvalidTransition {
                from: from.as_str(),
                to: to.as_str(),
            })
        }
    }
}
