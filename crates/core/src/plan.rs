//! Synthesis plan: the validated configuration a caller supplies to create a task.
//!
//! Field ranges are declared with `validator` derives; cross-field rules
//! (unique order indexes, retry budget) are checked by [`TaskPlan::check`].

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::CoreError;
use crate::scheduling::{validate_max_retries, DEFAULT_MAX_RETRIES};
use crate::types::DbId;

fn default_true() -> bool {
    true
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

// ---------------------------------------------------------------------------
// Engine parameters
// ---------------------------------------------------------------------------

/// Per-call parameters forwarded to the synthesis engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct SynthesisParams {
    #[validate(range(min = 0.5, max = 2.0))]
    pub speed: f32,
    #[validate(range(min = 0.5, max = 2.0))]
    pub pitch: f32,
    #[validate(range(min = 0.1, max = 2.0))]
    pub volume: f32,
    #[validate(range(min = 8000, max = 48000))]
    pub sample_rate: u32,
    #[validate(length(min = 1, max = 8))]
    pub audio_format: String,
}

impl Default for SynthesisParams {
    fn default() -> Self {
        Self {
            speed: 1.0,
            pitch: 1.0,
            volume: 1.0,
            sample_rate: 22050,
            audio_format: "wav".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Voice mapping
// ---------------------------------------------------------------------------

/// Binds one named speaker to a voice profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct CharacterVoice {
    #[validate(length(min = 1))]
    pub name: String,
    pub voice_id: DbId,
}

/// Speaker-to-voice resolution table for a plan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
pub struct VoiceMapping {
    #[serde(default)]
    #[validate(nested)]
    pub characters: Vec<CharacterVoice>,
    #[serde(default)]
    pub default_voice_id: Option<DbId>,
}

impl VoiceMapping {
    /// Resolve the voice for a speaker, falling back to the default voice.
    ///
    /// Returns `None` when neither the speaker nor a default is mapped; the
    /// segment then fails at run time with a missing-resource error.
    pub fn resolve(&self, speaker: Option<&str>) -> Option<DbId> {
        speaker
            .and_then(|name| {
                self.characters
                    .iter()
                    .find(|c| c.name == name)
                    .map(|c| c.voice_id)
            })
            .or(self.default_voice_id)
    }
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// One unit of text to synthesize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct SegmentPlan {
    /// Position of this segment in the final artifact.
    pub order_index: i32,
    #[validate(length(min = 1))]
    pub text: String,
    /// Detected speaker, resolved through the plan's [`VoiceMapping`].
    #[serde(default)]
    pub speaker: Option<String>,
}

/// A complete job plan as supplied by a caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct TaskPlan {
    #[validate(length(min = 1))]
    #[validate(nested)]
    pub segments: Vec<SegmentPlan>,
    #[serde(default)]
    #[validate(nested)]
    pub voices: VoiceMapping,
    #[serde(default)]
    #[validate(nested)]
    pub params: SynthesisParams,
    /// Whether the scheduler should assemble a final artifact.
    #[serde(default = "default_true")]
    pub merge_audio: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl TaskPlan {
    /// Build a plan with default voices and parameters.
    pub fn new(segments: Vec<SegmentPlan>) -> Self {
        Self {
            segments,
            voices: VoiceMapping::default(),
            params: SynthesisParams::default(),
            merge_audio: true,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_voices(mut self, voices: VoiceMapping) -> Self {
        self.voices = voices;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_merge(mut self, merge_audio: bool) -> Self {
        self.merge_audio = merge_audio;
        self
    }

    /// Run field-level and cross-field validation.
    pub fn check(&self) -> Result<(), CoreError> {
        self.validate()?;
        validate_max_retries(self.max_retries)?;

        let mut seen = HashSet::with_capacity(self.segments.len());
        for segment in &self.segments {
            if !seen.insert(segment.order_index) {
                return Err(CoreError::Validation(format!(
                    "duplicate segment order_index {}",
                    segment.order_index
                )));
            }
        }
        Ok(())
    }
}
