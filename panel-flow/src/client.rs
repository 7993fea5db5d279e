//! Boundary traits for the remote generative-AI endpoint.
//!
//! Implementations convert every remote fault into an in-band value:
//! `specialist_analysis` settles with [`SpecialistOutcome::Failed`],
//! `synthesis` with `Err(message)`. Nothing crosses this boundary as a
//! panic or an unhandled error, so the orchestrator can treat each call
//! uniformly as a settlement.

use crate::chat::ChatTranscript;
use crate::error::Result;
use crate::model::{AttachedImage, PatientHistory, SpecialistAnalysis, SpecialistOutcome, Specialty};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::mpsc;

/// One increment of a streamed chat response. A stream is a sequence of
/// `Delta` chunks followed by exactly one terminal `Done` or `Error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ChatEvent {
    Delta(String),
    Done,
    Error(String),
}

/// A stateful chat session pre-seeded with the case context. Each send
/// is an independent call; there is no reconnect on failure, and a
/// failed stream leaves the session usable for the next message.
#[async_trait]
pub trait ChatHandle: Send + Sync {
    /// Send one user message and stream the response into `events`.
    /// The implementation must emit a terminal event even on failure.
    async fn send(&self, message: &str, events: mpsc::Sender<ChatEvent>);

    /// Snapshot of the accumulated transcript, terminal error messages
    /// included.
    async fn transcript(&self) -> ChatTranscript;
}

/// Client for the remote analysis endpoint.
#[async_trait]
pub trait AnalysisClient: Send + Sync {
    /// Run one specialist analysis. Defined to never fail: remote and
    /// parse errors settle as [`SpecialistOutcome::Failed`].
    async fn specialist_analysis(
        &self,
        specialty: Specialty,
        report_text: &str,
        history: &PatientHistory,
        image: Option<&AttachedImage>,
    ) -> SpecialistOutcome;

    /// Run the single synthesis call over the successful analyses.
    /// Faults settle as `Err` with a human-readable message.
    async fn synthesis(
        &self,
        analyses: &BTreeMap<Specialty, SpecialistAnalysis>,
        report_text: &str,
        history: &PatientHistory,
    ) -> std::result::Result<String, String>;

    /// Open a chat session seeded with `context` as system instruction.
    async fn open_chat(&self, context: String) -> Result<Box<dyn ChatHandle>>;
}
