use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Gateway unreachable (connect failure or timeout). Worth retrying.
    #[error("Gateway unavailable: {0}")]
    Unavailable(String),

    /// Token rejected; the worker must register again.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("API error ({status} {code}): {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Not registered")]
    NotRegistered,
}

pub type Result<T> = std::result::Result<T, WorkerError>;
