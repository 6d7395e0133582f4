use tempo_core::TempoError;
use thiserror::Error;

/// Errors raised by the agent registry and dispatcher.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Token is malformed, forged or expired.
    #[error("Invalid agent token: {0}")]
    InvalidToken(String),

    /// The caller authenticated as a different agent than the one that owns the record.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Invalid assignment transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("No agent available: {0}")]
    NoAgentAvailable(String),

    #[error("Pool '{pool}' is full ({max} agents)")]
    PoolFull { pool: String, max: u32 },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl From<AgentError> for TempoError {
    fn from(e: AgentError) -> Self {
        match e {
            AgentError::Database(e) => TempoError::Database(e.to_string()),
            AgentError::NotFound { kind, id } => TempoError::NotFound { kind, id },
            AgentError::InvalidToken(msg) | AgentError::Forbidden(msg) => TempoError::AuthFailed(msg),
            AgentError::InvalidTransition { from, to } => TempoError::InvalidTransition { from, to },
            AgentError::NoAgentAvailable(msg) => TempoError::NoAgentAvailable(msg),
            other @ (AgentError::PoolFull { .. } | AgentError::InvalidRequest(_)) => {
                TempoError::config(other.to_string())
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;
