//! Collaborator traits and the engine error taxonomy.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use voxweave_core::plan::SynthesisParams;
use voxweave_core::types::DbId;

/// One unit of synthesis work.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SynthesisRequest {
    pub text: String,
    pub voice_id: DbId,
    #[serde(rename = "parameters")]
    pub params: SynthesisParams,
}

/// Result of a successful synthesis call.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SynthesisOutput {
    pub artifact_ref: String,
    /// Audio length in seconds.
    #[serde(rename = "duration")]
    pub duration_secs: f64,
}

/// Errors from a synthesis call.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    /// The request never reached the engine (DNS, connect, reset).
    #[error("network error: {0}")]
    Network(String),

    #[error("engine call timed out after {0:?}")]
    Timeout(Duration),

    /// The engine answered but cannot serve requests right now.
    #[error("engine unavailable: {0}")]
    Unavailable(String),

    /// The engine understood the request and refused this input.
    #[error("engine rejected input: {0}")]
    Rejected(String),

    #[error("voice profile {0} not found")]
    VoiceNotFound(DbId),
}

impl EngineError {
    /// Network trouble, timeouts, and unavailability may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::Network(_) | EngineError::Timeout(_) | EngineError::Unavailable(_)
        )
    }
}

/// Errors from final artifact assembly.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MergeError {
    #[error("nothing to merge")]
    NoArtifacts,

    #[error("merge request failed: {0}")]
    Request(String),

    #[error("merge rejected ({status}): {body}")]
    Rejected { status: u16, body: String },
}

/// Performs one unit of synthesis work against the remote engine.
#[async_trait]
pub trait SynthesisEngineClient: Send + Sync {
    async fn synthesize(&self, request: SynthesisRequest) -> Result<SynthesisOutput, EngineError>;
}

/// Concatenates ordered artifacts into one final artifact.
#[async_trait]
pub trait ArtifactMerger: Send + Sync {
    /// `ordered` is already sorted into final playback order.
    async fn merge(&self, ordered: &[String]) -> Result<String, MergeError>;
}
