use tempo_core::TempoError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StepError {
    /// The step's configuration map could not be parsed or failed validation.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("{0}")]
    Failed(String),

    #[error("exited with code {code}: {stderr}")]
    NonZeroExit { code: i32, stderr: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cancelled")]
    Cancelled,
}

impl StepError {
    pub fn into_tempo(self, step_id: &str) -> TempoError {
        match self {
            StepError::InvalidConfig(msg) => TempoError::config(format!("step '{step_id}': {msg}")),
            StepError::Cancelled => TempoError::Cancelled(format!("step '{step_id}'")),
            other => TempoError::StepExecution {
                step_id: step_id.to_string(),
                reason: other.to_string(),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, StepError>;
