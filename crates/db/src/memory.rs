//! In-process [`JobStore`] backed by hash maps behind a single `RwLock`.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use voxweave_core::scheduling::{SegmentStatus, TaskStatus};
use voxweave_core::types::DbId;

use crate::models::segment::{NewSegment, TextSegment};
use crate::models::task::{FailedSegment, NewTask, SynthesisTask};
use crate::store::{JobStore, StoreError, StoreResult};

#[derive(Default)]
struct Tables {
    tasks: HashMap<DbId, SynthesisTask>,
    segments: HashMap<DbId, TextSegment>,
    next_task_id: DbId,
    next_segment_id: DbId,
}

impl Tables {
    fn task_mut(&mut self, id: DbId) -> StoreResult<&mut SynthesisTask> {
        self.tasks
            .get_mut(&id)
            .ok_or(StoreError::NotFound { entity: "task", id })
    }
}

/// Volatile job store. Records live as long as the process.
#[derive(Default)]
pub struct MemoryJobStore {
    tables: RwLock<Tables>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create_task(&self, input: NewTask) -> StoreResult<SynthesisTask> {
        let mut tables = self.tables.write().await;
        tables.next_task_id += 1;
        let task = SynthesisTask::pending(tables.next_task_id, input);
        tables.tasks.insert(task.id, task.clone());
        tracing::debug!(task_id = task.id, project_id = task.project_id, "Task created");
        Ok(task)
    }

    async fn get_task(&self, id: DbId) -> StoreResult<Option<SynthesisTask>> {
        Ok(self.tables.read().await.tasks.get(&id).cloned())
    }

    async fn list_project_tasks(&self, project_id: DbId) -> StoreResult<Vec<SynthesisTask>> {
        let tables = self.tables.read().await;
        let mut tasks: Vec<_> = tables
            .tasks
            .values()
            .filter(|t| t.project_id == project_id)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(tasks)
    }

    async fn find_unfinished_task(&self, project_id: DbId) -> StoreResult<Option<SynthesisTask>> {
        let tables = self.tables.read().await;
        Ok(tables
            .tasks
            .values()
            .find(|t| t.project_id == project_id && !t.status.is_terminal())
            .cloned())
    }

    async fn save_task(&self, task: &SynthesisTask) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let slot = tables.task_mut(task.id)?;
        *slot = task.clone();
        slot.updated_at = Utc::now();
        Ok(())
    }

    async fn update_task_status(
        &self,
        id: DbId,
        status: TaskStatus,
        progress: u8,
    ) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let task = tables.task_mut(id)?;
        let now = Utc::now();
        task.status = status;
        task.progress = progress;
        if status == TaskStatus::Running && task.started_at.is_none() {
            task.started_at = Some(now);
        }
        if status.is_terminal() {
            task.completed_at = Some(now);
            task.processing_time_secs = task.duration_secs();
        }
        task.updated_at = now;
        Ok(())
    }

    async fn append_failed_segment(
        &self,
        task_id: DbId,
        segment_id: DbId,
        error: &str,
    ) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let task = tables.task_mut(task_id)?;
        task.failed_segments.push(FailedSegment {
            segment_id,
            error: error.to_string(),
            timestamp: Utc::now(),
        });
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_task(&self, id: DbId) -> StoreResult<bool> {
        let mut tables = self.tables.write().await;
        let Some(task) = tables.tasks.remove(&id) else {
            return Ok(false);
        };
        for segment_id in &task.segment_ids {
            tables.segments.remove(segment_id);
        }
        Ok(true)
    }

    async fn create_segments(
        &self,
        task_id: DbId,
        segments: Vec<NewSegment>,
    ) -> StoreResult<Vec<TextSegment>> {
        let mut tables = self.tables.write().await;
        if !tables.tasks.contains_key(&task_id) {
            return Err(StoreError::NotFound {
                entity: "task",
                id: task_id,
            });
        }

        let now = Utc::now();
        let mut created = Vec::with_capacity(segments.len());
        for input in segments {
            tables.next_segment_id += 1;
            let segment = TextSegment {
                id: tables.next_segment_id,
                task_id,
                order_index: input.order_index,
                text: input.text,
                speaker: input.speaker,
                voice_id: input.voice_id,
                status: SegmentStatus::Pending,
                artifact_ref: None,
                error_message: None,
                updated_at: now,
            };
            tables.segments.insert(segment.id, segment.clone());
            created.push(segment);
        }
        created.sort_by_key(|s| s.order_index);

        let task = tables.task_mut(task_id)?;
        task.segment_ids = created.iter().map(|s| s.id).collect();
        task.total_segments = created.len();
        Ok(created)
    }

    async fn list_segments(&self, task_id: DbId) -> StoreResult<Vec<TextSegment>> {
        let tables = self.tables.read().await;
        let mut segments: Vec<_> = tables
            .segments
            .values()
            .filter(|s| s.task_id == task_id)
            .cloned()
            .collect();
        segments.sort_by_key(|s| s.order_index);
        Ok(segments)
    }

    async fn update_segment(
        &self,
        id: DbId,
        status: SegmentStatus,
        artifact_ref: Option<&str>,
        error: Option<&str>,
    ) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let segment = tables
            .segments
            .get_mut(&id)
            .ok_or(StoreError::NotFound {
                entity: "segment",
                id,
            })?;
        if segment.status.is_terminal() {
            return Err(StoreError::SegmentImmutable {
                segment_id: id,
                status: segment.status,
            });
        }
        segment.status = status;
        segment.artifact_ref = artifact_ref.map(str::to_string);
        segment.error_message = error.map(str::to_string);
        segment.updated_at = Utc::now();
        Ok(())
    }
}
