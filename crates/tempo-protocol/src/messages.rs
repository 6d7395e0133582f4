use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempo_core::{
    AgentId, AssignmentId, ExecutionId, JobDefinition, JobStatus, StepExecutionResult,
};

// ── Registration ──

/// Agent → Gateway: `POST /api/agent/register`.
/// Wire: `{ "agent_id": "build-01", "hostname": "...", "ip_address": "...", "capabilities": [...], "max_parallel_jobs": 4, "pool": "default" }`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub agent_id: AgentId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    pub hostname: String,
    pub ip_address: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub max_parallel_jobs: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterStatus {
    Created,
    Updated,
}

/// Gateway → Agent: `{ "status": "created", "token": "...", "expires_in": 14400 }`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub status: RegisterStatus,
    pub token: String,
    /// Token lifetime in seconds.
    pub expires_in: u64,
    /// Whether an operator still has to approve this agent before it gets work.
    #[serde(default)]
    pub approved: bool,
    /// How often the gateway expects a heartbeat.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_interval_secs: Option<u64>,
}

// ── Heartbeat ──

/// Self-reported agent health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    #[default]
    Online,
    Maintenance,
    Error,
}

/// Agent → Gateway: `POST /api/agent/heartbeat`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub agent_id: AgentId,
    #[serde(default)]
    pub status: WorkerState,
    #[serde(default)]
    pub current_jobs: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_percent: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_percent: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_percent: Option<f32>,
}

/// Gateway → Agent. `cancelled_assignments` lists work the agent should stop.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatAck {
    pub ok: bool,
    #[serde(default)]
    pub cancelled_assignments: Vec<AssignmentId>,
}

// ── Assignments ──

/// Query string of `GET /api/agent/assignments`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PollQuery {
    #[serde(default = "default_max_jobs")]
    pub max_jobs: u32,
}

fn default_max_jobs() -> u32 {
    1
}

/// One unit of work handed to an agent, with everything needed to run it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentPayload {
    pub assignment_id: AssignmentId,
    pub execution_id: ExecutionId,
    pub attempt: u32,
    pub timeout_minutes: u64,
    pub assigned_at: DateTime<Utc>,
    pub job: JobDefinition,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PollResponse {
    pub assignments: Vec<AssignmentPayload>,
}

/// The only progress an agent reports before its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportedState {
    Running,
}

/// Agent → Gateway: `POST /api/agent/assignments/{id}/status`, `{ "status": "running" }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdateRequest {
    pub status: ReportedState,
}

/// Agent → Gateway: `POST /api/agent/assignments/{id}/result`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResultRequest {
    pub status: JobStatus,
    #[serde(default)]
    pub steps: Vec<StepExecutionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Plain acknowledgement: `{ "ok": true }`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Ack {
    pub ok: bool,
}

impl Ack {
    pub fn ok() -> Self {
        Self { ok: true }
    }
}

// ── Errors ──

/// Error envelope for every non-2xx response.
/// Wire: `{ "error": { "code": "AUTH_FAILED", "message": "..." } }`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorShape,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorShape {
    pub code: String,
    pub message: String,
}

impl ErrorBody {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ErrorShape {
                code: code.into(),
                message: message.into(),
            },
        }
    }
}

impl From<&tempo_core::TempoError> for ErrorBody {
    fn from(e: &tempo_core::TempoError) -> Self {
        Self::new(e.code(), e.to_string())
    }
}
