//! Synthesis engine and artifact merger collaborators.
//!
//! Defines the [`SynthesisEngineClient`] and [`ArtifactMerger`] seams the
//! scheduler drives, the error taxonomy used to tell transient engine
//! trouble from permanent input rejection, and [`HttpEngineClient`], a
//! REST implementation of both.

pub mod client;
pub mod http;

pub use client::{
    ArtifactMerger, EngineError, MergeError, SynthesisEngineClient, SynthesisOutput,
    SynthesisRequest,
};
pub use http::HttpEngineClient;
