// Well-known HTTP routes. Paths use axum 0.8 `{param}` captures.

// agent protocol (bearer agent token, except register)
pub const AGENT_REGISTER: &str = "/api/agent/register";
pub const AGENT_HEARTBEAT: &str = "/api/agent/heartbeat";
pub const AGENT_ASSIGNMENTS: &str = "/api/agent/assignments";
pub const AGENT_ASSIGNMENT_STATUS: &str = "/api/agent/assignments/{id}/status";
pub const AGENT_ASSIGNMENT_RESULT: &str = "/api/agent/assignments/{id}/result";

// engine (admin token)
pub const JOBS_RUN: &str = "/api/jobs/run";
pub const JOBS_SCHEDULE: &str = "/api/jobs/schedule";
pub const JOBS: &str = "/api/jobs";
pub const JOB: &str = "/api/jobs/{id}";
pub const EXECUTION: &str = "/api/executions/{id}";
pub const EXECUTION_CANCEL: &str = "/api/executions/{id}/cancel";
pub const QUEUES: &str = "/api/queues";

// fleet admin (admin token)
pub const AGENTS: &str = "/api/agents";
pub const AGENT: &str = "/api/agents/{id}";
pub const AGENT_APPROVE: &str = "/api/agents/{id}/approve";
pub const AGENT_REVOKE: &str = "/api/agents/{id}/revoke";
pub const AGENT_ACTIVE: &str = "/api/agents/{id}/active";
pub const POOLS: &str = "/api/pools";

pub const HEALTH: &str = "/health";

/// Fill a route's `{id}` capture, for clients.
pub fn with_id(route: &str, id: &str) -> String {
    route.replace("{id}", id)
}
