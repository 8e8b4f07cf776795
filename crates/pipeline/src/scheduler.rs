//! Task lifecycle and the per-task execution loop.
//!
//! Each started task is driven by exactly one spawned loop, which is the
//! only writer of that task's record until it releases the task (pause or
//! a terminal state). Control operations never touch a record a loop owns;
//! they flip the loop's [`TaskControl`] and let it act at the next window
//! boundary.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use voxweave_core::event_types::{
    EVENT_TASK_COMPLETED, EVENT_TASK_FAILED, EVENT_TASK_PAUSED, EVENT_TASK_RESUMED,
    EVENT_TASK_RETRYING, EVENT_TASK_STARTED, EVENT_WINDOW_COMPLETED,
};
use voxweave_core::plan::TaskPlan;
use voxweave_core::progress::{progress_percent, session_id_for_task, ProgressEvent};
use voxweave_core::scheduling::{
    state_machine, validate_batch_size, SegmentStatus, TaskStatus, CANCELLED_REASON,
};
use voxweave_core::types::{DbId, Timestamp};
use voxweave_db::models::segment::{NewSegment, TextSegment};
use voxweave_db::models::task::{FailedSegment, NewTask, OutputArtifact, SynthesisTask};
use voxweave_db::JobStore;
use voxweave_engine::{ArtifactMerger, SynthesisEngineClient};
use voxweave_events::ProgressBroadcaster;

use crate::config::SchedulerConfig;
use crate::error::SchedulerError;
use crate::merge::ordered_artifacts;
use crate::window::{dispatch_window, is_systemic, UnitOutcome};

/// Signals from control operations to a running loop.
#[derive(Default)]
struct TaskControl {
    pause: AtomicBool,
    cancel: CancellationToken,
}

/// How one pass over the pending segments ended.
enum PassOutcome {
    Drained,
    Paused,
    Cancelled,
    Systemic(String),
}

// ---------------------------------------------------------------------------
// TaskSummary
// ---------------------------------------------------------------------------

/// Read model for status displays.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSummary {
    pub task_id: DbId,
    pub project_id: DbId,
    pub status: TaskStatus,
    pub progress: u8,
    pub total_segments: usize,
    pub completed_segments: usize,
    pub failed_segments: usize,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Percentage of processed segments that succeeded.
    pub success_rate: f64,
    /// Completed, but with at least one failed segment.
    pub degraded: bool,
    pub estimated_remaining_secs: Option<i64>,
    pub processing_time_secs: Option<i64>,
    pub final_artifact: Option<String>,
    pub error_message: Option<String>,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
}

impl From<&SynthesisTask> for TaskSummary {
    fn from(task: &SynthesisTask) -> Self {
        Self {
            task_id: task.id,
            project_id: task.project_id,
            status: task.status,
            progress: task.progress,
            total_segments: task.total_segments,
            completed_segments: task.completed_segments,
            failed_segments: task.failed_count(),
            retry_count: task.retry_count,
            max_retries: task.max_retries,
            success_rate: task.success_rate(),
            degraded: task.is_degraded(),
            estimated_remaining_secs: task.estimated_remaining_secs(),
            processing_time_secs: task.processing_time_secs.or_else(|| task.duration_secs()),
            final_artifact: task.final_artifact.clone(),
            error_message: task.error_message.clone(),
            started_at: task.started_at,
            completed_at: task.completed_at,
        }
    }
}

fn invalid(task: &SynthesisTask, operation: &'static str) -> SchedulerError {
    SchedulerError::InvalidState {
        task_id: task.id,
        status: task.status,
        operation,
    }
}

fn failed_ids(task: &SynthesisTask) -> Vec<DbId> {
    task.failed_segments.iter().map(|f| f.segment_id).collect()
}

// ---------------------------------------------------------------------------
// TaskScheduler
// ---------------------------------------------------------------------------

pub struct TaskScheduler {
    store: Arc<dyn JobStore>,
    engine: Arc<dyn SynthesisEngineClient>,
    merger: Arc<dyn ArtifactMerger>,
    broadcaster: Arc<ProgressBroadcaster>,
    config: SchedulerConfig,
    /// Live loops by task id. Guarded together with every status change
    /// made outside a loop.
    controls: Mutex<HashMap<DbId, Arc<TaskControl>>>,
    /// Serializes the unfinished-task check with task creation.
    creation_lock: Mutex<()>,
}

impl TaskScheduler {
    pub fn new(
        store: Arc<dyn JobStore>,
        engine: Arc<dyn SynthesisEngineClient>,
        merger: Arc<dyn ArtifactMerger>,
        broadcaster: Arc<ProgressBroadcaster>,
        config: SchedulerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            engine,
            merger,
            broadcaster,
            config,
            controls: Mutex::new(HashMap::new()),
            creation_lock: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    // -- lifecycle ------------------------------------------------------------

    /// Validate `plan` and persist it as a Pending task with one segment row
    /// per planned segment.
    ///
    /// Each segment's speaker is resolved to a voice now; segments left
    /// without a voice fail individually at run time.
    pub async fn create_task(
        &self,
        project_id: DbId,
        plan: TaskPlan,
        batch_size: usize,
    ) -> Result<SynthesisTask, SchedulerError> {
        validate_batch_size(batch_size)?;
        plan.check()?;

        let segments: Vec<NewSegment> = plan
            .segments
            .iter()
            .map(|s| NewSegment {
                order_index: s.order_index,
                text: s.text.clone(),
                speaker: s.speaker.clone(),
                voice_id: plan.voices.resolve(s.speaker.as_deref()),
            })
            .collect();
        let unresolved = segments.iter().filter(|s| s.voice_id.is_none()).count();

        let _guard = self.creation_lock.lock().await;
        if let Some(existing) = self.store.find_unfinished_task(project_id).await? {
            return Err(SchedulerError::SchedulingConflict {
                project_id,
                task_id: existing.id,
            });
        }

        let max_retries = plan.max_retries;
        let task = self
            .store
            .create_task(NewTask {
                project_id,
                plan,
                batch_size,
                max_retries,
            })
            .await?;
        self.store.create_segments(task.id, segments).await?;
        let task = self.load(task.id).await?;

        tracing::info!(
            task_id = task.id,
            project_id,
            segments = task.total_segments,
            batch_size,
            unresolved_voices = unresolved,
            "Synthesis task created",
        );
        Ok(task)
    }

    /// Move a Pending task to Running and spawn its execution loop.
    ///
    /// Returns as soon as the loop is spawned.
    pub async fn start(self: &Arc<Self>, task_id: DbId) -> Result<(), SchedulerError> {
        let mut controls = self.controls.lock().await;
        let task = self.load(task_id).await?;
        if task.status != TaskStatus::Pending || controls.contains_key(&task_id) {
            return Err(invalid(&task, "start"));
        }
        self.launch(&mut controls, task).await
    }

    /// Ask a Running task to stop after its in-flight window drains.
    pub async fn pause(&self, task_id: DbId) -> Result<(), SchedulerError> {
        let controls = self.controls.lock().await;
        let task = self.load(task_id).await?;
        match controls.get(&task_id) {
            Some(control) if task.status == TaskStatus::Running => {
                control.pause.store(true, Ordering::SeqCst);
                tracing::info!(task_id, "Pause requested");
                Ok(())
            }
            _ => Err(invalid(&task, "pause")),
        }
    }

    /// Put a Paused task back through Pending and restart it.
    ///
    /// Segments already Completed are skipped by the new loop.
    pub async fn resume(self: &Arc<Self>, task_id: DbId) -> Result<(), SchedulerError> {
        let mut controls = self.controls.lock().await;
        let mut task = self.load(task_id).await?;
        if task.status != TaskStatus::Paused || controls.contains_key(&task_id) {
            return Err(invalid(&task, "resume"));
        }

        state_machine::validate_transition(task.status, TaskStatus::Pending)?;
        self.store
            .update_task_status(task_id, TaskStatus::Pending, task.progress)
            .await?;
        task.status = TaskStatus::Pending;
        tracing::info!(task_id, completed = task.completed_segments, "Synthesis resumed");
        self.emit(
            &task,
            EVENT_TASK_RESUMED,
            "Synthesis resumed",
            json!({ "completed_segments": task.completed_segments }),
        )
        .await;

        self.launch(&mut controls, task).await
    }

    /// Cancel a non-terminal task.
    ///
    /// A task with a live loop is failed by that loop at its next window
    /// boundary, or immediately if it is waiting out a retry backoff. A loop
    /// that has already drained its segments checks again before merging and
    /// before completing, so an accepted cancel never ends in Completed. A
    /// task without a loop is failed here.
    pub async fn cancel(&self, task_id: DbId) -> Result<(), SchedulerError> {
        let controls = self.controls.lock().await;
        let mut task = self.load(task_id).await?;
        if task.status.is_terminal() {
            return Err(invalid(&task, "cancel"));
        }

        if let Some(control) = controls.get(&task_id) {
            control.cancel.cancel();
            tracing::info!(task_id, status = %task.status, "Cancellation requested");
            return Ok(());
        }

        task.error_message = Some(CANCELLED_REASON.to_string());
        self.transition(&mut task, TaskStatus::Failed).await?;
        drop(controls);

        tracing::info!(task_id, "Synthesis cancelled");
        self.emit(
            &task,
            EVENT_TASK_FAILED,
            "Synthesis cancelled",
            json!({ "error": CANCELLED_REASON, "failed_segments": failed_ids(&task) }),
        )
        .await;
        Ok(())
    }

    /// Remove a task and its segments. Refused while a loop owns the task.
    pub async fn delete_task(&self, task_id: DbId) -> Result<(), SchedulerError> {
        let controls = self.controls.lock().await;
        let task = self.load(task_id).await?;
        if task.status == TaskStatus::Running || controls.contains_key(&task_id) {
            return Err(invalid(&task, "delete"));
        }
        self.store.delete_task(task_id).await?;
        tracing::info!(task_id, project_id = task.project_id, "Synthesis task deleted");
        Ok(())
    }

    // -- queries --------------------------------------------------------------

    pub async fn get_task(&self, task_id: DbId) -> Result<SynthesisTask, SchedulerError> {
        self.load(task_id).await
    }

    pub async fn list_project_tasks(
        &self,
        project_id: DbId,
    ) -> Result<Vec<SynthesisTask>, SchedulerError> {
        Ok(self.store.list_project_tasks(project_id).await?)
    }

    pub async fn task_summary(&self, task_id: DbId) -> Result<TaskSummary, SchedulerError> {
        let task = self.load(task_id).await?;
        Ok(TaskSummary::from(&task))
    }

    /// Segment rows of a task in order-index order.
    pub async fn segments(&self, task_id: DbId) -> Result<Vec<TextSegment>, SchedulerError> {
        self.load(task_id).await?;
        Ok(self.store.list_segments(task_id).await?)
    }

    // -- loop management ------------------------------------------------------

    async fn launch(
        self: &Arc<Self>,
        controls: &mut HashMap<DbId, Arc<TaskControl>>,
        task: SynthesisTask,
    ) -> Result<(), SchedulerError> {
        state_machine::validate_transition(task.status, TaskStatus::Running)?;
        self.store
            .update_task_status(task.id, TaskStatus::Running, task.progress)
            .await?;

        let control = Arc::new(TaskControl::default());
        controls.insert(task.id, Arc::clone(&control));

        let scheduler = Arc::clone(self);
        let task_id = task.id;
        tokio::spawn(async move {
            scheduler.run(task_id, control).await;
        });
        Ok(())
    }

    async fn run(self: Arc<Self>, task_id: DbId, control: Arc<TaskControl>) {
        if let Err(e) = self.drive(task_id, &control).await {
            tracing::error!(task_id, error = %e, "Synthesis loop aborted");
            self.abort(task_id, &format!("internal error: {e}")).await;
        }
    }

    /// Last-resort failure path when the loop itself errored.
    async fn abort(&self, task_id: DbId, reason: &str) {
        let mut controls = self.controls.lock().await;
        controls.remove(&task_id);

        let recorded = async {
            let mut task = self.load(task_id).await?;
            if task.status.is_terminal() {
                return Ok(None);
            }
            task.error_message = Some(reason.to_string());
            task.current_segment = None;
            self.store.save_task(&task).await?;
            self.store
                .update_task_status(task_id, TaskStatus::Failed, task.progress)
                .await?;
            task.status = TaskStatus::Failed;
            Ok::<_, SchedulerError>(Some(task))
        }
        .await;
        drop(controls);

        match recorded {
            Ok(Some(task)) => {
                self.emit(&task, EVENT_TASK_FAILED, reason, json!({ "error": reason }))
                    .await;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!(task_id, error = %e, "Failed to record aborted task");
            }
        }
    }

    async fn drive(&self, task_id: DbId, control: &TaskControl) -> Result<(), SchedulerError> {
        let mut task = self.load(task_id).await?;
        tracing::info!(
            task_id,
            total = task.total_segments,
            completed = task.completed_segments,
            batch_size = task.batch_size,
            "Synthesis loop started",
        );
        self.emit(
            &task,
            EVENT_TASK_STARTED,
            format!("Synthesis started: {} segments", task.total_segments),
            json!({
                "total_segments": task.total_segments,
                "completed_segments": task.completed_segments,
                "batch_size": task.batch_size,
            }),
        )
        .await;

        loop {
            match self.run_pass(&mut task, control).await? {
                PassOutcome::Drained => return self.finalize(task, control).await,
                PassOutcome::Cancelled => {
                    return self.fail(task, CANCELLED_REASON.to_string()).await;
                }
                PassOutcome::Paused => {
                    task.current_segment = None;
                    self.release(&mut task, TaskStatus::Paused).await?;
                    tracing::info!(task_id, progress = task.progress, "Synthesis paused");
                    self.emit(
                        &task,
                        EVENT_TASK_PAUSED,
                        format!(
                            "Paused after {} of {} segments",
                            task.completed_segments, task.total_segments
                        ),
                        json!({ "completed_segments": task.completed_segments }),
                    )
                    .await;
                    return Ok(());
                }
                PassOutcome::Systemic(error) => {
                    if task.retry_count >= task.max_retries {
                        let reason = format!(
                            "engine unavailable after {} retries: {error}",
                            task.retry_count
                        );
                        return self.fail(task, reason).await;
                    }

                    task.retry_count += 1;
                    task.current_segment = None;
                    self.transition(&mut task, TaskStatus::Pending).await?;

                    let delay = self.config.backoff_for(task.retry_count);
                    tracing::warn!(
                        task_id,
                        retry = task.retry_count,
                        max_retries = task.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Systemic engine failure, retrying",
                    );
                    self.emit(
                        &task,
                        EVENT_TASK_RETRYING,
                        format!(
                            "Engine unavailable, retry {}/{}",
                            task.retry_count, task.max_retries
                        ),
                        json!({
                            "retry_count": task.retry_count,
                            "max_retries": task.max_retries,
                            "delay_ms": delay.as_millis() as u64,
                            "error": error,
                        }),
                    )
                    .await;

                    tokio::select! {
                        _ = control.cancel.cancelled() => {
                            return self.fail(task, CANCELLED_REASON.to_string()).await;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }

                    self.transition(&mut task, TaskStatus::Running).await?;
                    self.emit(
                        &task,
                        EVENT_TASK_STARTED,
                        format!("Retry {} of {}", task.retry_count, task.max_retries),
                        json!({
                            "retry_count": task.retry_count,
                            "completed_segments": task.completed_segments,
                        }),
                    )
                    .await;
                }
            }
        }
    }

    /// Dispatch every still-pending segment, one window at a time.
    async fn run_pass(
        &self,
        task: &mut SynthesisTask,
        control: &TaskControl,
    ) -> Result<PassOutcome, SchedulerError> {
        let pending: Vec<TextSegment> = self
            .store
            .list_segments(task.id)
            .await?
            .into_iter()
            .filter(|s| s.status == SegmentStatus::Pending)
            .collect();
        let batch_size = task.batch_size.max(1);
        let windows = pending.len().div_ceil(batch_size);

        for (index, window) in pending.chunks(batch_size).enumerate() {
            if index > 0 && !self.config.window_pause.is_zero() {
                tokio::select! {
                    _ = control.cancel.cancelled() => {}
                    _ = tokio::time::sleep(self.config.window_pause) => {}
                }
            }
            if control.cancel.is_cancelled() {
                return Ok(PassOutcome::Cancelled);
            }
            if control.pause.load(Ordering::SeqCst) {
                return Ok(PassOutcome::Paused);
            }

            task.current_segment = window.first().map(|s| s.id);
            tracing::debug!(
                task_id = task.id,
                window = index + 1,
                windows,
                size = window.len(),
                "Dispatching window",
            );
            let outcomes = dispatch_window(
                self.engine.as_ref(),
                window,
                &task.plan.params,
                self.config.engine_timeout,
            )
            .await;

            if is_systemic(&outcomes) {
                let (unroutable, called): (Vec<_>, Vec<_>) =
                    outcomes.into_iter().partition(UnitOutcome::is_unroutable);
                if !unroutable.is_empty() {
                    // Segments with no voice fail now; the rest stay pending for the retry.
                    self.record_outcomes(task, unroutable).await?;
                    self.store.save_task(task).await?;
                }
                let error = called
                    .iter()
                    .find_map(|o| o.result.as_ref().err())
                    .map(ToString::to_string)
                    .unwrap_or_default();
                return Ok(PassOutcome::Systemic(error));
            }
            self.apply_window(task, outcomes).await?;
        }
        Ok(PassOutcome::Drained)
    }

    /// Record a drained window's outcomes, then publish the new progress.
    async fn apply_window(
        &self,
        task: &mut SynthesisTask,
        outcomes: Vec<UnitOutcome>,
    ) -> Result<(), SchedulerError> {
        let (completed, failed) = self.record_outcomes(task, outcomes).await?;

        task.progress = task
            .progress
            .max(progress_percent(task.completed_segments, task.total_segments));
        self.store.save_task(task).await?;

        let processed = task.completed_segments + task.failed_count();
        self.emit(
            task,
            EVENT_WINDOW_COMPLETED,
            format!("{processed}/{} segments processed", task.total_segments),
            json!({
                "completed": completed,
                "failed": failed,
                "completed_segments": task.completed_segments,
                "failed_segments": task.failed_count(),
                "total_segments": task.total_segments,
            }),
        )
        .await;
        Ok(())
    }

    /// Persist each outcome on its segment and fold it into `task`.
    ///
    /// Returns the completed and failed segment ids. The task record itself
    /// is not saved.
    async fn record_outcomes(
        &self,
        task: &mut SynthesisTask,
        outcomes: Vec<UnitOutcome>,
    ) -> Result<(Vec<DbId>, Vec<DbId>), SchedulerError> {
        let mut completed = Vec::new();
        let mut failed = Vec::new();

        for outcome in outcomes {
            match outcome.result {
                Ok(output) => {
                    self.store
                        .update_segment(
                            outcome.segment_id,
                            SegmentStatus::Completed,
                            Some(&output.artifact_ref),
                            None,
                        )
                        .await?;
                    task.completed_segments += 1;
                    task.output_artifacts.push(OutputArtifact {
                        segment_id: outcome.segment_id,
                        order_index: outcome.order_index,
                        artifact_ref: output.artifact_ref,
                        duration_secs: output.duration_secs,
                    });
                    completed.push(outcome.segment_id);
                }
                Err(error) => {
                    let message = error.to_string();
                    tracing::warn!(
                        task_id = task.id,
                        segment_id = outcome.segment_id,
                        error = %message,
                        "Segment failed",
                    );
                    self.store
                        .update_segment(
                            outcome.segment_id,
                            SegmentStatus::Failed,
                            None,
                            Some(&message),
                        )
                        .await?;
                    self.store
                        .append_failed_segment(task.id, outcome.segment_id, &message)
                        .await?;
                    task.failed_segments.push(FailedSegment {
                        segment_id: outcome.segment_id,
                        error: message,
                        timestamp: Utc::now(),
                    });
                    failed.push(outcome.segment_id);
                }
            }
        }
        Ok((completed, failed))
    }

    /// Merge and complete a drained task. A cancel that lands before the
    /// Completed transition still wins.
    async fn finalize(
        &self,
        mut task: SynthesisTask,
        control: &TaskControl,
    ) -> Result<(), SchedulerError> {
        task.current_segment = None;
        if control.cancel.is_cancelled() {
            return self.fail(task, CANCELLED_REASON.to_string()).await;
        }
        if task.completed_segments == 0 {
            let reason = format!("all {} segments failed", task.failed_count());
            return self.fail(task, reason).await;
        }

        let mut final_artifact = None;
        if task.plan.merge_audio {
            let segments = self.store.list_segments(task.id).await?;
            let ordered = ordered_artifacts(&segments);
            match self.merger.merge(&ordered).await {
                Ok(artifact) => final_artifact = Some(artifact),
                Err(e) => return self.fail(task, format!("merge failed: {e}")).await,
            }
        }

        let mut controls = self.controls.lock().await;
        if control.cancel.is_cancelled() {
            drop(controls);
            return self.fail(task, CANCELLED_REASON.to_string()).await;
        }
        task.final_artifact = final_artifact;
        task.progress = 100;
        self.transition(&mut task, TaskStatus::Completed).await?;
        controls.remove(&task.id);
        drop(controls);

        tracing::info!(
            task_id = task.id,
            completed = task.completed_segments,
            failed = task.failed_count(),
            degraded = task.is_degraded(),
            "Synthesis completed",
        );
        self.emit(
            &task,
            EVENT_TASK_COMPLETED,
            format!(
                "Synthesis completed: {}/{} segments",
                task.completed_segments, task.total_segments
            ),
            json!({
                "final_artifact": task.final_artifact,
                "completed_segments": task.completed_segments,
                "failed_segments": failed_ids(&task),
                "degraded": task.is_degraded(),
                "success_rate": task.success_rate(),
                "processing_time_secs": task.processing_time_secs,
            }),
        )
        .await;
        Ok(())
    }

    async fn fail(&self, mut task: SynthesisTask, reason: String) -> Result<(), SchedulerError> {
        task.current_segment = None;
        task.error_message = Some(reason.clone());
        self.release(&mut task, TaskStatus::Failed).await?;
        tracing::warn!(task_id = task.id, reason = %reason, "Synthesis failed");
        self.emit(
            &task,
            EVENT_TASK_FAILED,
            format!("Synthesis failed: {reason}"),
            json!({
                "error": reason,
                "completed_segments": task.completed_segments,
                "failed_segments": failed_ids(&task),
            }),
        )
        .await;
        Ok(())
    }

    // -- persistence ----------------------------------------------------------

    async fn load(&self, task_id: DbId) -> Result<SynthesisTask, SchedulerError> {
        self.store
            .get_task(task_id)
            .await?
            .ok_or(SchedulerError::NotFound(task_id))
    }

    /// Persist the in-memory record, move it to `to`, and reload the
    /// stamped row.
    async fn transition(
        &self,
        task: &mut SynthesisTask,
        to: TaskStatus,
    ) -> Result<(), SchedulerError> {
        state_machine::validate_transition(task.status, to)?;
        self.store.save_task(task).await?;
        self.store.update_task_status(task.id, to, task.progress).await?;
        *task = self.load(task.id).await?;
        Ok(())
    }

    /// Final transition of a loop. The status change and the removal of
    /// the loop's control happen under one lock.
    async fn release(
        &self,
        task: &mut SynthesisTask,
        to: TaskStatus,
    ) -> Result<(), SchedulerError> {
        let mut controls = self.controls.lock().await;
        self.transition(task, to).await?;
        controls.remove(&task.id);
        Ok(())
    }

    async fn emit(
        &self,
        task: &SynthesisTask,
        event_type: &str,
        message: impl Into<String>,
        data: serde_json::Value,
    ) {
        let session_id = session_id_for_task(task.id);
        let event = ProgressEvent::new(session_id.clone(), event_type, task.status)
            .with_progress(task.progress)
            .with_message(message)
            .with_data(data);
        self.broadcaster.publish(&session_id, &event).await;
    }
}
