//! Engine endpoints: run, schedule, inspect and cancel executions, plus
//! recurring job definitions. All require the admin token.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tempo_core::{ExecutionId, JobDefinition, JobExecutionResult, JobId, TempoError};
use tempo_engine::{QueueStatus, RecurringJob, ScheduleAt};
use tempo_protocol::{Ack, ErrorBody};
use tracing::info;

use super::{tempo_error, ApiResult};
use crate::app::AppState;
use crate::auth::require_admin;

#[derive(Debug, Deserialize)]
pub struct ScheduleRequest {
    pub job: JobDefinition,
    /// `{"kind": "local", "value": "2026-03-08T02:30:00"}` or `{"kind": "at", "value": "<rfc3339>"}`
    pub at: ScheduleAt,
}

#[derive(Debug, Serialize)]
pub struct ScheduleReply {
    pub execution_id: ExecutionId,
}

/// POST /api/jobs/run: runs to completion and returns the result.
pub async fn run_now(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(job): Json<JobDefinition>,
) -> ApiResult<JobExecutionResult> {
    require_admin(&state, &headers)?;
    let result = state.engine.execute_job_now(job).await.map_err(tempo_error)?;
    Ok(Json(result))
}

/// POST /api/jobs/schedule
pub async fn schedule(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<ScheduleRequest>,
) -> ApiResult<ScheduleReply> {
    require_admin(&state, &headers)?;
    let execution_id = state.engine.schedule_job(req.job, req.at).map_err(tempo_error)?;
    Ok(Json(ScheduleReply { execution_id }))
}

/// GET /api/executions/{id}: current status, full result and agent assignments.
pub async fn execution_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Value> {
    require_admin(&state, &headers)?;
    let id = ExecutionId::from(id);
    let result = state.engine.get_execution_status(&id).map_err(tempo_error)?;
    let assignments = state
        .dispatcher
        .history(&id)
        .map_err(|e| tempo_error(e.into()))?;
    Ok(Json(json!({
        "status": result.status,
        "result": result,
        "assignments": assignments,
    })))
}

/// POST /api/executions/{id}/cancel
pub async fn cancel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Value> {
    require_admin(&state, &headers)?;
    let id = ExecutionId::from(id);
    if state.engine.cancel_job(&id) {
        info!(execution_id = %id, "execution cancel requested");
        return Ok(Json(json!({"execution_id": id, "cancelled": true})));
    }
    // Not live: either unknown or already finished.
    let result = state.engine.get_execution_status(&id).map_err(tempo_error)?;
    Err((
        StatusCode::CONFLICT,
        Json(ErrorBody::new(
            "INVALID_TRANSITION",
            format!("execution {id} already finished with status {}", result.status),
        )),
    ))
}

/// GET /api/queues
pub async fn queues(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<BTreeMap<String, QueueStatus>> {
    require_admin(&state, &headers)?;
    Ok(Json(state.engine.get_queue_status()))
}

// ── Recurring definitions ──

/// GET /api/jobs
pub async fn list_recurring(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Vec<RecurringJob>> {
    require_admin(&state, &headers)?;
    let jobs = state.jobs.list().map_err(|e| tempo_error(e.into()))?;
    Ok(Json(jobs))
}

/// POST /api/jobs: store a definition with a `schedule`.
pub async fn create_recurring(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(job): Json<JobDefinition>,
) -> ApiResult<RecurringJob> {
    require_admin(&state, &headers)?;
    // Reject unknown step types now rather than at the first occurrence.
    state.engine.steps().build_job(&job).map_err(tempo_error)?;
    let stored = state
        .jobs
        .add(job, Utc::now())
        .map_err(|e| tempo_error(TempoError::from(e)))?;
    info!(job_id = %stored.job.id, next_run = ?stored.next_run, "recurring job stored");
    Ok(Json(stored))
}

/// DELETE /api/jobs/{id}
pub async fn delete_recurring(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Ack> {
    require_admin(&state, &headers)?;
    state
        .jobs
        .remove(&JobId::from(id))
        .map_err(|e| tempo_error(e.into()))?;
    Ok(Json(Ack::ok()))
}
