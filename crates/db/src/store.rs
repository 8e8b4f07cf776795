//! The narrow read/write interface the scheduler persists through.

use async_trait::async_trait;
use voxweave_core::scheduling::{SegmentStatus, TaskStatus};
use voxweave_core::types::DbId;

use crate::models::segment::{NewSegment, TextSegment};
use crate::models::task::{NewTask, SynthesisTask};

/// Errors returned by a [`JobStore`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: DbId },

    /// Terminal segments never change again.
    #[error("segment {segment_id} is already {status}")]
    SegmentImmutable {
        segment_id: DbId,
        status: SegmentStatus,
    },

    #[error("store backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Durable record of tasks and segments.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new Pending task.
    async fn create_task(&self, input: NewTask) -> StoreResult<SynthesisTask>;

    async fn get_task(&self, id: DbId) -> StoreResult<Option<SynthesisTask>>;

    /// All tasks of a project, newest first.
    async fn list_project_tasks(&self, project_id: DbId) -> StoreResult<Vec<SynthesisTask>>;

    /// The project's task that is not yet Completed or Failed, if any.
    async fn find_unfinished_task(&self, project_id: DbId) -> StoreResult<Option<SynthesisTask>>;

    /// Overwrite the full task record.
    async fn save_task(&self, task: &SynthesisTask) -> StoreResult<()>;

    /// Set status and progress, stamping start/completion times as they first occur.
    async fn update_task_status(&self, id: DbId, status: TaskStatus, progress: u8)
        -> StoreResult<()>;

    async fn append_failed_segment(
        &self,
        task_id: DbId,
        segment_id: DbId,
        error: &str,
    ) -> StoreResult<()>;

    /// Remove a task and its segments. Returns `false` if it did not exist.
    async fn delete_task(&self, id: DbId) -> StoreResult<bool>;

    /// Persist a task's segments and record their ids on the task.
    async fn create_segments(
        &self,
        task_id: DbId,
        segments: Vec<NewSegment>,
    ) -> StoreResult<Vec<TextSegment>>;

    /// A task's segments ordered by `order_index`.
    async fn list_segments(&self, task_id: DbId) -> StoreResult<Vec<TextSegment>>;

    /// Record a segment's outcome. Fails with [`StoreError::SegmentImmutable`]
    /// if the segment is already terminal.
    async fn update_segment(
        &self,
        id: DbId,
        status: SegmentStatus,
        artifact_ref: Option<&str>,
        error: Option<&str>,
    ) -> StoreResult<()>;
}
