use thiserror::Error;

#[derive(Error, Debug)]
pub enum JudgeError {
    #[error("Invalid submission: {0}")]
    InvalidSubmission(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl JudgeError {
    /// Infrastructure faults are retryable and end a job in `error`,
    /// never in a judged state.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            JudgeError::Storage(_) | JudgeError::Serialization(_) | JudgeError::Internal(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, JudgeError>;
