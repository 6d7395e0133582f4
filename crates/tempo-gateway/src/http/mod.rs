pub mod admin;
pub mod agent;
pub mod health;
pub mod jobs;

use axum::http::StatusCode;
use axum::Json;
use tempo_agents::AgentError;
use tempo_core::TempoError;
use tempo_protocol::ErrorBody;
use tracing::warn;

/// Every handler fails with a status and the shared error envelope.
pub type ApiError = (StatusCode, Json<ErrorBody>);
pub type ApiResult<T> = Result<Json<T>, ApiError>;

pub fn tempo_error(e: TempoError) -> ApiError {
    let status = match &e {
        TempoError::Configuration { .. } => StatusCode::BAD_REQUEST,
        TempoError::NotFound { .. } => StatusCode::NOT_FOUND,
        TempoError::AuthFailed(_) => StatusCode::UNAUTHORIZED,
        TempoError::InvalidTransition { .. } => StatusCode::CONFLICT,
        TempoError::NoAgentAvailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        warn!(code = e.code(), error = %e, "request failed");
    }
    (status, Json(ErrorBody::from(&e)))
}

pub fn agent_error(e: AgentError) -> ApiError {
    match e {
        AgentError::Forbidden(msg) => (StatusCode::FORBIDDEN, Json(ErrorBody::new("FORBIDDEN", msg))),
        e @ AgentError::PoolFull { .. } => {
            (StatusCode::CONFLICT, Json(ErrorBody::new("POOL_FULL", e.to_string())))
        }
        other => tempo_error(other.into()),
    }
}
