use voxweave_core::error::CoreError;
use voxweave_core::scheduling::TaskStatus;
use voxweave_core::types::DbId;
use voxweave_db::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// Malformed plan or parameters. Never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("project {project_id} already has unfinished task {task_id}")]
    SchedulingConflict { project_id: DbId, task_id: DbId },

    #[error("task {0} not found")]
    NotFound(DbId),

    #[error("cannot {operation} task {task_id} while it is {status}")]
    InvalidState {
        task_id: DbId,
        status: TaskStatus,
        operation: &'static str,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("internal scheduler error: {0}")]
    Internal(String),
}

impl From<CoreError> for SchedulerError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Validation(msg) => SchedulerError::Validation(msg),
            CoreError::NotFound { id, .. } => SchedulerError::NotFound(id),
            other => SchedulerError::Internal(other.to_string()),
        }
    }
}
