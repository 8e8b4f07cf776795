//! Progress event type constants emitted by the task scheduler.
//!
//! Carried in the `type` field of every [`ProgressEvent`](crate::progress::ProgressEvent)
//! so observers can tell lifecycle transitions apart from window updates.

/// The scheduler transitioned a task to Running.
pub const EVENT_TASK_STARTED: &str = "task_started";

/// A window of segments drained; progress was recomputed.
pub const EVENT_WINDOW_COMPLETED: &str = "window_completed";

/// A systemic failure was observed and a retry was scheduled.
pub const EVENT_TASK_RETRYING: &str = "task_retrying";

/// The execution loop observed a pause request at a window boundary.
pub const EVENT_TASK_PAUSED: &str = "task_paused";

/// A paused task was put back in the queue.
pub const EVENT_TASK_RESUMED: &str = "task_resumed";

/// All segments are terminal and at least one succeeded.
pub const EVENT_TASK_COMPLETED: &str = "task_completed";

/// The task reached the Failed state (cancelled, exhausted, or no output).
pub const EVENT_TASK_FAILED: &str = "task_failed";
