//! Synthesis task records and the derived statistics shown to callers.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use voxweave_core::plan::TaskPlan;
use voxweave_core::scheduling::TaskStatus;
use voxweave_core::types::{DbId, Timestamp};

/// A segment that failed during execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedSegment {
    pub segment_id: DbId,
    pub error: String,
    pub timestamp: Timestamp,
}

/// A per-segment artifact produced by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputArtifact {
    pub segment_id: DbId,
    pub order_index: i32,
    pub artifact_ref: String,
    pub duration_secs: f64,
}

/// A synthesis task record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisTask {
    pub id: DbId,
    pub project_id: DbId,
    pub plan: TaskPlan,
    /// Segment ids in order-index order.
    pub segment_ids: Vec<DbId>,
    /// Concurrency window.
    pub batch_size: usize,
    pub status: TaskStatus,
    pub progress: u8,
    pub total_segments: usize,
    pub completed_segments: usize,
    /// Last segment whose outcome was applied.
    pub current_segment: Option<DbId>,
    pub failed_segments: Vec<FailedSegment>,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub output_artifacts: Vec<OutputArtifact>,
    pub final_artifact: Option<String>,
    pub processing_time_secs: Option<i64>,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub updated_at: Timestamp,
}

/// Input for [`JobStore::create_task`](crate::JobStore::create_task).
#[derive(Debug, Clone)]
pub struct NewTask {
    pub project_id: DbId,
    pub plan: TaskPlan,
    pub batch_size: usize,
    pub max_retries: u32,
}

impl SynthesisTask {
    /// Build a fresh Pending record for `input` with the given id.
    pub fn pending(id: DbId, input: NewTask) -> Self {
        let now = Utc::now();
        Self {
            id,
            project_id: input.project_id,
            total_segments: input.plan.segments.len(),
            plan: input.plan,
            segment_ids: Vec::new(),
            batch_size: input.batch_size,
            status: TaskStatus::Pending,
            progress: 0,
            completed_segments: 0,
            current_segment: None,
            failed_segments: Vec::new(),
            error_message: None,
            retry_count: 0,
            max_retries: input.max_retries,
            output_artifacts: Vec::new(),
            final_artifact: None,
            processing_time_secs: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    pub fn failed_count(&self) -> usize {
        self.failed_segments.len()
    }

    /// Completed with at least one segment skipped.
    pub fn is_degraded(&self) -> bool {
        self.status == TaskStatus::Completed && !self.failed_segments.is_empty()
    }

    /// Percentage of processed segments that succeeded.
    pub fn success_rate(&self) -> f64 {
        let processed = self.completed_segments + self.failed_count();
        if processed == 0 {
            return 0.0;
        }
        (self.completed_segments as f64 / processed as f64) * 100.0
    }

    /// Seconds between start and completion (or now, while unfinished).
    pub fn duration_secs(&self) -> Option<i64> {
        let started = self.started_at?;
        let end = self.completed_at.unwrap_or_else(Utc::now);
        Some((end - started).num_seconds())
    }

    /// Remaining time extrapolated from the average time per completed segment.
    pub fn estimated_remaining_secs(&self) -> Option<i64> {
        if self.completed_segments == 0 {
            return None;
        }
        let elapsed = self.duration_secs()?;
        let remaining = self
            .total_segments
            .saturating_sub(self.completed_segments + self.failed_count());
        if remaining == 0 {
            return Some(0);
        }
        let per_segment = elapsed as f64 / self.completed_segments as f64;
        Some((per_segment * remaining as f64) as i64)
    }
}
