//! Text segment records: the unit of synthesis work within a task.

use serde::{Deserialize, Serialize};
use voxweave_core::scheduling::SegmentStatus;
use voxweave_core::types::{DbId, Timestamp};

/// A text segment row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextSegment {
    pub id: DbId,
    pub task_id: DbId,
    /// Defines the segment's position in the final artifact.
    pub order_index: i32,
    pub text: String,
    pub speaker: Option<String>,
    /// Resolved voice profile; `None` means the plan had no voice for this speaker.
    pub voice_id: Option<DbId>,
    pub status: SegmentStatus,
    pub artifact_ref: Option<String>,
    pub error_message: Option<String>,
    pub updated_at: Timestamp,
}

/// Input for [`JobStore::create_segments`](crate::JobStore::create_segments).
#[derive(Debug, Clone)]
pub struct NewSegment {
    pub order_index: i32,
    pub text: String,
    pub speaker: Option<String>,
    pub voice_id: Option<DbId>,
}
