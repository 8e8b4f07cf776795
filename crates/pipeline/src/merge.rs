//! Final artifact ordering.

use voxweave_core::scheduling::SegmentStatus;
use voxweave_db::models::segment::TextSegment;

/// Artifacts of completed segments, sorted by order index.
///
/// Failed and still-pending segments are skipped. The result depends only
/// on the segments' order indexes, never on the order they finished in.
pub fn ordered_artifacts(segments: &[TextSegment]) -> Vec<String> {
    let mut completed: Vec<&TextSegment> = segments
        .iter()
        .filter(|s| s.status == SegmentStatus::Completed)
        .collect();
    completed.sort_by_key(|s| s.order_index);
    completed
        .into_iter()
        .filter_map(|s| s.artifact_ref.clone())
        .collect()
}
