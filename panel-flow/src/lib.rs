pub mod chat;
pub mod client;
pub mod error;
pub mod model;
pub mod orchestrator;
pub mod prompts;
pub mod store;

// Re-export commonly used types
pub use chat::{CHAT_GREETING, CHAT_STREAM_FAILURE, ChatMessage, ChatRole, ChatTranscript};
pub use client::{AnalysisClient, ChatEvent, ChatHandle};
pub use error::{PanelError, Result};
pub use model::{
    AttachedImage, CasePhase, CaseState, CaseSubmission, FinalReport, PatientHistory,
    ReportStatus, SpecialistAnalysis, SpecialistOutcome, SpecialistReport, Specialty,
};
pub use orchestrator::{Orchestrator, OrchestratorConfig};
pub use store::{CaseEvent, CaseStore};
