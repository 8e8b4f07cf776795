//! Window dispatch: one concurrent engine call per segment, one outcome per call.
//!
//! Every unit produces its own [`UnitOutcome`]; an error in one unit never
//! cancels or unwinds its siblings. The scheduler inspects the whole
//! outcome slice afterwards to tell per-segment failures from a systemic
//! outage.

use std::time::Duration;

use futures::future::join_all;
use voxweave_core::plan::SynthesisParams;
use voxweave_core::types::DbId;
use voxweave_db::models::segment::TextSegment;
use voxweave_engine::{EngineError, SynthesisEngineClient, SynthesisOutput, SynthesisRequest};

/// Why a single segment could not be synthesized.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SegmentError {
    /// A resource the segment needs (its voice) is missing.
    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl SegmentError {
    pub fn is_transient(&self) -> bool {
        match self {
            SegmentError::ResourceNotFound(_) => false,
            SegmentError::Engine(e) => e.is_transient(),
        }
    }

    /// Whether the engine was called at all for this unit.
    pub fn reached_engine(&self) -> bool {
        !matches!(self, SegmentError::ResourceNotFound(_))
    }
}

#[derive(Debug, Clone)]
pub struct UnitOutcome {
    pub segment_id: DbId,
    pub order_index: i32,
    pub result: Result<SynthesisOutput, SegmentError>,
}

/// Run every segment of `window` concurrently and collect all outcomes.
///
/// Outcomes come back in window order regardless of completion order.
pub async fn dispatch_window(
    engine: &dyn SynthesisEngineClient,
    window: &[TextSegment],
    params: &SynthesisParams,
    timeout: Duration,
) -> Vec<UnitOutcome> {
    join_all(
        window
            .iter()
            .map(|segment| run_unit(engine, segment, params, timeout)),
    )
    .await
}

async fn run_unit(
    engine: &dyn SynthesisEngineClient,
    segment: &TextSegment,
    params: &SynthesisParams,
    timeout: Duration,
) -> UnitOutcome {
    let result = match segment.voice_id {
        None => Err(SegmentError::ResourceNotFound(format!(
            "no voice assigned for speaker {}",
            segment.speaker.as_deref().unwrap_or("<narrator>")
        ))),
        Some(voice_id) => {
            let request = SynthesisRequest {
                text: segment.text.clone(),
                voice_id,
                params: params.clone(),
            };
            match tokio::time::timeout(timeout, engine.synthesize(request)).await {
                Ok(result) => result.map_err(SegmentError::from),
                Err(_) => Err(SegmentError::Engine(EngineError::Timeout(timeout))),
            }
        }
    };

    UnitOutcome {
        segment_id: segment.id,
        order_index: segment.order_index,
        result,
    }
}

impl UnitOutcome {
    /// Failed before any engine call was made.
    pub fn is_unroutable(&self) -> bool {
        matches!(&self.result, Err(e) if !e.reached_engine())
    }
}

/// A window is systemic when at least one unit called the engine and every
/// such unit failed with a transient error. Units that never reached the
/// engine do not count either way.
pub fn is_systemic(outcomes: &[UnitOutcome]) -> bool {
    let mut called = outcomes.iter().filter(|o| !o.is_unroutable()).peekable();
    called.peek().is_some()
        && called.all(|o| matches!(&o.result, Err(e) if e.is_transient()))
}
