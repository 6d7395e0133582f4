//! Agent protocol endpoints. Everything except `register` needs the bearer
//! token returned by `register`, and an agent can only touch its own records.

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use chrono::Utc;
use std::sync::Arc;
use tempo_agents::{AgentStatus, Heartbeat, Registration, RegistrationStatus, ResultReport};
use tempo_core::AssignmentId;
use tempo_protocol::{
    Ack, AssignmentPayload, HeartbeatAck, HeartbeatRequest, PollQuery, PollResponse,
    RegisterRequest, RegisterResponse, RegisterStatus, StatusUpdateRequest, SubmitResultRequest,
    WorkerState,
};
use tracing::info;

use super::{agent_error, ApiResult};
use crate::app::AppState;
use crate::auth::require_agent;

/// POST /api/agent/register
pub async fn register(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterRequest>,
) -> ApiResult<RegisterResponse> {
    let now = Utc::now();
    let (agent, status) = state
        .dispatcher
        .registry()
        .register(
            Registration {
                agent_id: req.agent_id,
                agent_name: req.agent_name,
                hostname: req.hostname,
                ip_address: req.ip_address,
                capabilities: req.capabilities,
                max_parallel_jobs: req.max_parallel_jobs,
                pool: req.pool,
            },
            now,
        )
        .map_err(agent_error)?;
    let token = state.signer.issue(&agent.agent_id, now).map_err(agent_error)?;

    info!(agent_id = %agent.agent_id, pool = %agent.pool, approved = agent.is_approved, "agent registered");
    Ok(Json(RegisterResponse {
        status: match status {
            RegistrationStatus::Created => RegisterStatus::Created,
            RegistrationStatus::Updated => RegisterStatus::Updated,
        },
        token,
        expires_in: state.signer.ttl_secs(),
        approved: agent.is_approved,
        heartbeat_interval_secs: Some(state.config.agents.heartbeat_interval_secs),
    }))
}

/// POST /api/agent/heartbeat
pub async fn heartbeat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<HeartbeatRequest>,
) -> ApiResult<HeartbeatAck> {
    let agent_id = require_agent(&state, &headers)?;
    if agent_id != req.agent_id {
        return Err(agent_error(tempo_agents::AgentError::Forbidden(format!(
            "token for {agent_id} cannot report for {}",
            req.agent_id
        ))));
    }

    let status = match req.status {
        WorkerState::Online => AgentStatus::Online,
        WorkerState::Maintenance => AgentStatus::Maintenance,
        WorkerState::Error => AgentStatus::Error,
    };
    state
        .dispatcher
        .registry()
        .heartbeat(
            &agent_id,
            Heartbeat {
                status: Some(status),
                current_jobs: req.current_jobs,
                cpu_percent: req.cpu_percent,
                memory_percent: req.memory_percent,
                disk_percent: req.disk_percent,
            },
            Utc::now(),
        )
        .map_err(agent_error)?;

    Ok(Json(HeartbeatAck {
        ok: true,
        cancelled_assignments: state.dispatcher.take_revoked(&agent_id),
    }))
}

/// GET /api/agent/assignments?max_jobs=N
pub async fn poll_assignments(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<PollQuery>,
) -> ApiResult<PollResponse> {
    let agent_id = require_agent(&state, &headers)?;
    let max_jobs = usize::try_from(query.max_jobs).unwrap_or(usize::MAX);
    let accepted = state
        .dispatcher
        .poll(&agent_id, max_jobs, Utc::now())
        .map_err(agent_error)?;

    let assignments = accepted
        .into_iter()
        .map(|(a, job)| AssignmentPayload {
            assignment_id: a.assignment_id,
            execution_id: a.execution_id,
            attempt: a.attempt,
            timeout_minutes: a.timeout_minutes,
            assigned_at: a.assigned_at,
            job,
        })
        .collect();
    Ok(Json(PollResponse { assignments }))
}

/// POST /api/agent/assignments/{id}/status
pub async fn update_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(_req): Json<StatusUpdateRequest>,
) -> ApiResult<Ack> {
    let agent_id = require_agent(&state, &headers)?;
    state
        .dispatcher
        .mark_running(&agent_id, &AssignmentId::from(id), Utc::now())
        .map_err(agent_error)?;
    Ok(Json(Ack::ok()))
}

/// POST /api/agent/assignments/{id}/result
pub async fn submit_result(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<SubmitResultRequest>,
) -> ApiResult<Ack> {
    let agent_id = require_agent(&state, &headers)?;
    state
        .dispatcher
        .submit_result(
            &agent_id,
            &AssignmentId::from(id),
            ResultReport {
                status: req.status,
                steps: req.steps,
                error_message: req.error_message,
            },
            Utc::now(),
        )
        .map_err(agent_error)?;
    Ok(Json(Ack::ok()))
}
