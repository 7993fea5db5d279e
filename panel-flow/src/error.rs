use thiserror::Error;

#[derive(Error, Debug)]
pub enum PanelError {
    #[error("Case not found: {0}")]
    CaseNotFound(String),

    #[error("Empty submission: {0}")]
    EmptySubmission(String),

    #[error("Chat not available: {0}")]
    ChatUnavailable(String),

    #[error("Chat session error: {0}")]
    ChatSession(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PanelError>;
