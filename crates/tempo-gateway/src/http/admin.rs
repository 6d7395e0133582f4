//! Fleet administration: approval, removal and pools.

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use std::sync::Arc;
use serde::Deserialize;
use tempo_agents::{Agent, AgentPool};
use tempo_core::AgentId;
use tempo_protocol::Ack;

use super::{agent_error, ApiResult};
use crate::app::AppState;
use crate::auth::require_admin;

/// GET /api/agents
pub async fn list_agents(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Vec<Agent>> {
    require_admin(&state, &headers)?;
    Ok(Json(state.dispatcher.registry().list()))
}

/// POST /api/agents/{id}/approve
pub async fn approve_agent(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Agent> {
    require_admin(&state, &headers)?;
    let agent = state
        .dispatcher
        .registry()
        .set_approved(&AgentId::from(id), true)
        .map_err(agent_error)?;
    Ok(Json(agent))
}

/// POST /api/agents/{id}/revoke: stops new work; running assignments finish.
pub async fn revoke_agent(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Agent> {
    require_admin(&state, &headers)?;
    let agent = state
        .dispatcher
        .registry()
        .set_approved(&AgentId::from(id), false)
        .map_err(agent_error)?;
    Ok(Json(agent))
}

#[derive(Debug, Deserialize)]
pub struct ActiveRequest {
    pub active: bool,
}

/// POST /api/agents/{id}/active: an inactive agent keeps its registration
/// but receives no work.
pub async fn set_agent_active(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<ActiveRequest>,
) -> ApiResult<Agent> {
    require_admin(&state, &headers)?;
    let agent = state
        .dispatcher
        .registry()
        .set_active(&AgentId::from(id), req.active)
        .map_err(agent_error)?;
    Ok(Json(agent))
}

/// DELETE /api/agents/{id}
pub async fn remove_agent(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Ack> {
    require_admin(&state, &headers)?;
    state
        .dispatcher
        .registry()
        .remove(&AgentId::from(id))
        .map_err(agent_error)?;
    Ok(Json(Ack::ok()))
}

/// GET /api/pools
pub async fn list_pools(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Vec<AgentPool>> {
    require_admin(&state, &headers)?;
    Ok(Json(state.dispatcher.registry().pools()))
}

/// POST /api/pools: create or update.
pub async fn create_pool(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(pool): Json<AgentPool>,
) -> ApiResult<AgentPool> {
    require_admin(&state, &headers)?;
    let pool = state
        .dispatcher
        .registry()
        .upsert_pool(pool)
        .map_err(agent_error)?;
    Ok(Json(pool))
}
