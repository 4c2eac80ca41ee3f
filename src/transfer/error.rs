use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("Invalid state transition: {from} -> {to}")]
    Invalid { from: String, to: String },

    #[error("Retries exhausted after {retry_count} attempts")]
    RetriesExhausted { retry_count: u32 },

    #[error("Unknown status: {0}")]
    UnknownStatus(String),
}

pub type TransitionResult<T> = Result<T, TransitionError>;
