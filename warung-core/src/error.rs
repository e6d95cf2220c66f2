use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Error taxonomy for the orchestration pipeline.
///
/// Only `Transient` is a candidate for automatic retry. `InvariantViolation`
/// marks a programming-bug class (illegal state transition, flush with no
/// open buffer) and must surface loudly instead of being retried.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("channel send failed: {0}")]
    Channel(String),
}

impl PipelineError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Channel(_))
    }

    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, Self::InvariantViolation(_))
    }
}

impl From<rusqlite::Error> for PipelineError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Transient(format!("sqlite: {e}"))
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(e: serde_json::Error) -> Self {
        Self::InvariantViolation(format!("payload codec: {e}"))
    }
}

impl From<tokio::task::JoinError> for PipelineError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Transient(format!("blocking task: {e}"))
    }
}
