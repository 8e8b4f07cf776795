//! REST client for a synthesis engine exposing `/synthesize` and `/merge`.
//!
//! HTTP status codes are mapped onto [`EngineError`] so the scheduler can
//! classify failures without knowing anything about HTTP.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use voxweave_core::types::DbId;

use crate::client::{
    ArtifactMerger, EngineError, MergeError, SynthesisEngineClient, SynthesisOutput,
    SynthesisRequest,
};

/// HTTP client for a single synthesis engine instance.
pub struct HttpEngineClient {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct MergeResponse {
    artifact_ref: String,
}

impl HttpEngineClient {
    /// Create a client for the engine at `base_url`, e.g. `http://tts:9880`.
    ///
    /// `timeout` bounds every request made by this client.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::Network(e.to_string()))?;
        Ok(Self::with_client(client, base_url, timeout))
    }

    /// Create a client reusing an existing [`reqwest::Client`].
    pub fn with_client(
        client: reqwest::Client,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn classify_transport(&self, err: reqwest::Error) -> EngineError {
        if err.is_timeout() {
            EngineError::Timeout(self.timeout)
        } else if err.is_decode() {
            EngineError::Unavailable(format!("malformed engine response: {err}"))
        } else {
            EngineError::Network(err.to_string())
        }
    }
}

/// Map a non-2xx engine response onto the error taxonomy.
pub fn classify_status(status: u16, body: String, voice_id: DbId) -> EngineError {
    match status {
        404 => EngineError::VoiceNotFound(voice_id),
        408 | 429 => EngineError::Unavailable(format!("({status}) {body}")),
        400..=499 => EngineError::Rejected(format!("({status}) {body}")),
        _ => EngineError::Unavailable(format!("({status}) {body}")),
    }
}

#[async_trait]
impl SynthesisEngineClient for HttpEngineClient {
    async fn synthesize(&self, request: SynthesisRequest) -> Result<SynthesisOutput, EngineError> {
        let response = self
            .client
            .post(format!("{}/synthesize", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| self.classify_transport(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::debug!(status = status.as_u16(), body = %body, "Engine refused synthesis");
            return Err(classify_status(status.as_u16(), body, request.voice_id));
        }

        response
            .json::<SynthesisOutput>()
            .await
            .map_err(|e| self.classify_transport(e))
    }
}

#[async_trait]
impl ArtifactMerger for HttpEngineClient {
    async fn merge(&self, ordered: &[String]) -> Result<String, MergeError> {
        if ordered.is_empty() {
            return Err(MergeError::NoArtifacts);
        }

        let response = self
            .client
            .post(format!("{}/merge", self.base_url))
            .json(&serde_json::json!({ "artifacts": ordered }))
            .send()
            .await
            .map_err(|e| MergeError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MergeError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let merged = response
            .json::<MergeResponse>()
            .await
            .map_err(|e| MergeError::Request(e.to_string()))?;
        tracing::info!(
            artifact_ref = %merged.artifact_ref,
            parts = ordered.len(),
            "Artifacts merged",
        );
        Ok(merged.artifact_ref)
    }
}
