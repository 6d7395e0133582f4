use tempo_core::TempoError;
use thiserror::Error;

/// Errors raised by the execution and job-definition stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A stored JSON column (steps, definition) could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No recurring job with the given ID exists in the store.
    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    #[error("Invalid job: {0}")]
    InvalidJob(String),
}

impl From<StoreError> for TempoError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Database(e) => TempoError::Database(e.to_string()),
            StoreError::Serialization(e) => TempoError::Serialization(e),
            StoreError::JobNotFound { id } => TempoError::NotFound { kind: "job", id },
            StoreError::InvalidJob(msg) => TempoError::config(msg),
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
