// Verify the agent wire format. Workers in the field are upgraded after the
// gateway, so these shapes must not drift.

use tempo_core::{JobStatus, StepStatus};
use tempo_protocol::routes;
use tempo_protocol::{
    AssignmentPayload, ErrorBody, HeartbeatAck, HeartbeatRequest, PollQuery, RegisterRequest,
    RegisterResponse, RegisterStatus, StatusUpdateRequest, SubmitResultRequest, WorkerState,
};

#[test]
fn register_request_minimal_body() {
    let json = r#"{"agent_id":"build-01","hostname":"build-01.lan","ip_address":"10.0.0.7","max_parallel_jobs":4}"#;
    let req: RegisterRequest = serde_json::from_str(json).unwrap();

    assert_eq!(req.agent_id.as_str(), "build-01");
    assert!(req.capabilities.is_empty());
    assert!(req.pool.is_none());
    assert!(req.agent_name.is_none());
}

#[test]
fn register_response_status_is_lowercase() {
    let res = RegisterResponse {
        status: RegisterStatus::Updated,
        token: "build-01.1700000000.ab12".into(),
        expires_in: 14400,
        approved: false,
        heartbeat_interval_secs: Some(30),
    };
    let json = serde_json::to_string(&res).unwrap();

    assert!(json.contains(r#""status":"updated""#));
    assert!(json.contains(r#""expires_in":14400"#));
}

#[test]
fn heartbeat_defaults_to_online() {
    let json = r#"{"agent_id":"build-01","current_jobs":2,"cpu_percent":41.5,"memory_percent":63.0}"#;
    let hb: HeartbeatRequest = serde_json::from_str(json).unwrap();

    assert_eq!(hb.status, WorkerState::Online);
    assert_eq!(hb.current_jobs, 2);
    assert!(hb.disk_percent.is_none());
    // absent optional metrics stay absent on the way back out
    let out = serde_json::to_string(&hb).unwrap();
    assert!(!out.contains("disk_percent"));
}

#[test]
fn heartbeat_ack_carries_cancellations() {
    let json = r#"{"ok":true,"cancelled_assignments":["a-1","a-2"]}"#;
    let ack: HeartbeatAck = serde_json::from_str(json).unwrap();
    assert_eq!(ack.cancelled_assignments.len(), 2);
    assert_eq!(ack.cancelled_assignments[1].as_str(), "a-2");
}

#[test]
fn poll_query_defaults_to_one_job() {
    let q: PollQuery = serde_json::from_str("{}").unwrap();
    assert_eq!(q.max_jobs, 1);
}

#[test]
fn assignment_payload_embeds_the_job() {
    let json = r#"{
        "assignment_id": "asg-1",
        "execution_id": "exe-1",
        "attempt": 2,
        "timeout_minutes": 60,
        "assigned_at": "2026-03-08T06:59:00Z",
        "job": {
            "name": "nightly",
            "timezone": "America/New_York",
            "steps": [{"step_id": "a", "type": "command", "config": {"command": "true"}}]
        }
    }"#;
    let payload: AssignmentPayload = serde_json::from_str(json).unwrap();

    assert_eq!(payload.attempt, 2);
    assert_eq!(payload.job.timezone, "America/New_York");
    assert_eq!(payload.job.steps[0].step_type, "command");
}

#[test]
fn status_update_only_accepts_running() {
    assert!(serde_json::from_str::<StatusUpdateRequest>(r#"{"status":"running"}"#).is_ok());
    assert!(serde_json::from_str::<StatusUpdateRequest>(r#"{"status":"completed"}"#).is_err());
}

#[test]
fn submit_result_uses_snake_case_statuses() {
    let json = r#"{
        "status": "partial_success",
        "steps": [
            {"step_id": "a", "attempt": 1, "status": "success"},
            {"step_id": "b", "attempt": 1, "status": "failed", "error_message": "exit 1"}
        ]
    }"#;
    let req: SubmitResultRequest = serde_json::from_str(json).unwrap();

    assert_eq!(req.status, JobStatus::PartialSuccess);
    assert_eq!(req.steps[1].status, StepStatus::Failed);
    assert!(req.error_message.is_none());
}

#[test]
fn error_body_shape() {
    let err = tempo_core::TempoError::AuthFailed("token expired".into());
    let json = serde_json::to_string(&ErrorBody::from(&err)).unwrap();

    assert!(json.contains(r#""code":"AUTH_FAILED""#));
    assert!(json.contains("token expired"));
}

#[test]
fn route_ids_are_filled_in() {
    assert_eq!(
        routes::with_id(routes::AGENT_ASSIGNMENT_RESULT, "asg-9"),
        "/api/agent/assignments/asg-9/result"
    );
}
