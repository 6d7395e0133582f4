use thiserror::Error;

#[derive(Debug, Error)]
pub enum TempoError {
    /// Invalid job or step definition. Raised before anything runs and never retried.
    #[error("Configuration error: {}", .errors.join("; "))]
    Configuration { errors: Vec<String> },

    #[error("Step '{step_id}' failed: {reason}")]
    StepExecution { step_id: String, reason: String },

    #[error("Timed out after {secs}s: {what}")]
    Timeout { what: String, secs: u64 },

    #[error("No agent available: {0}")]
    NoAgentAvailable(String),

    #[error("Execution cancelled: {0}")]
    Cancelled(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TempoError {
    /// Shorthand for a configuration error carrying a single message.
    pub fn config(msg: impl Into<String>) -> Self {
        TempoError::Configuration {
            errors: vec![msg.into()],
        }
    }

    /// Short error code string returned to HTTP and agent clients.
    pub fn code(&self) -> &'static str {
        match self {
            TempoError::Configuration { .. } => "CONFIGURATION_ERROR",
            TempoError::StepExecution { .. } => "STEP_EXECUTION_ERROR",
            TempoError::Timeout { .. } => "TIMEOUT",
            TempoError::NoAgentAvailable(_) => "NO_AGENT_AVAILABLE",
            TempoError::Cancelled(_) => "CANCELLED",
            TempoError::NotFound { .. } => "NOT_FOUND",
            TempoError::AuthFailed(_) => "AUTH_FAILED",
            TempoError::InvalidTransition { .. } => "INVALID_TRANSITION",
            TempoError::Database(_) => "DATABASE_ERROR",
            TempoError::Serialization(_) => "SERIALIZATION_ERROR",
            TempoError::Io(_) => "IO_ERROR",
            TempoError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, TempoError>;
