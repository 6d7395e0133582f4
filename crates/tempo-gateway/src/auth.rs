//! Bearer-token checks for the two kinds of caller: operators (admin token
//! from config) and agents (HMAC tokens minted at registration).

use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use chrono::Utc;
use tempo_core::AgentId;
use tempo_protocol::ErrorBody;
use tracing::debug;

use crate::app::AppState;
use crate::http::{agent_error, ApiError};

pub fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// Engine and admin routes. Open when no admin token is configured.
pub fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = state.config.gateway.admin_token.as_deref() else {
        return Ok(());
    };
    match extract_bearer(headers) {
        Some(token) if token == expected => Ok(()),
        _ => Err(unauthorized("Unauthorized. Set 'Authorization: Bearer <admin-token>' header.")),
    }
}

/// Agent routes. Returns the agent the token was issued to.
pub fn require_agent(state: &AppState, headers: &HeaderMap) -> Result<AgentId, ApiError> {
    let token = extract_bearer(headers).ok_or_else(|| unauthorized("missing agent token"))?;
    state.signer.verify(token, Utc::now()).map_err(|e| {
        debug!(error = %e, "agent token rejected");
        agent_error(e)
    })
}

fn unauthorized(message: &str) -> ApiError {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorBody::new("AUTH_FAILED", message)),
    )
}
