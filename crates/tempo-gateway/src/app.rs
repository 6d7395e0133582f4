use axum::{
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use tempo_agents::{Dispatcher, TokenSigner};
use tempo_core::config::TempoConfig;
use tempo_engine::{ExecutionEngine, JobStore};
use tempo_protocol::routes;

use crate::http::{admin, agent, health, jobs};

/// Central shared state, passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub config: TempoConfig,
    pub engine: Arc<ExecutionEngine>,
    /// Also owns the agent registry, see [`Dispatcher::registry`].
    pub dispatcher: Arc<Dispatcher>,
    pub jobs: Arc<JobStore>,
    pub signer: TokenSigner,
}

impl AppState {
    pub fn new(
        config: TempoConfig,
        engine: Arc<ExecutionEngine>,
        dispatcher: Arc<Dispatcher>,
        jobs: Arc<JobStore>,
        signer: TokenSigner,
    ) -> Self {
        Self {
            config,
            engine,
            dispatcher,
            jobs,
            signer,
        }
    }
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(routes::HEALTH, get(health::health_handler))
        // agent protocol
        .route(routes::AGENT_REGISTER, post(agent::register))
        .route(routes::AGENT_HEARTBEAT, post(agent::heartbeat))
        .route(routes::AGENT_ASSIGNMENTS, get(agent::poll_assignments))
        .route(routes::AGENT_ASSIGNMENT_STATUS, post(agent::update_status))
        .route(routes::AGENT_ASSIGNMENT_RESULT, post(agent::submit_result))
        // engine
        .route(routes::JOBS_RUN, post(jobs::run_now))
        .route(routes::JOBS_SCHEDULE, post(jobs::schedule))
        .route(routes::JOBS, get(jobs::list_recurring).post(jobs::create_recurring))
        .route(routes::JOB, delete(jobs::delete_recurring))
        .route(routes::EXECUTION, get(jobs::execution_status))
        .route(routes::EXECUTION_CANCEL, post(jobs::cancel))
        .route(routes::QUEUES, get(jobs::queues))
        // fleet admin
        .route(routes::AGENTS, get(admin::list_agents))
        .route(routes::AGENT, delete(admin::remove_agent))
        .route(routes::AGENT_APPROVE, post(admin::approve_agent))
        .route(routes::AGENT_REVOKE, post(admin::revoke_agent))
        .route(routes::AGENT_ACTIVE, post(admin::set_agent_active))
        .route(routes::POOLS, get(admin::list_pools).post(admin::create_pool))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use serde_json::{json, Value};
    use tempo_agents::AgentRegistry;
    use tower::ServiceExt;

    const ADMIN: &str = "admin-secret";

    fn test_app() -> Router {
        let mut config = TempoConfig::default();
        config.gateway.admin_token = Some(ADMIN.to_string());
        let registry = Arc::new(AgentRegistry::new(config.agents.offline_after()));
        let dispatcher = Arc::new(Dispatcher::new(registry, &config.agents));
        let engine = ExecutionEngine::builder(config.engine.clone())
            .dispatcher(dispatcher.clone(), config.agents.max_assignment_attempts)
            .build()
            .unwrap();
        let jobs = Arc::new(JobStore::new(rusqlite::Connection::open_in_memory().unwrap()).unwrap());
        let signer = TokenSigner::new("test-secret", 3600);
        build_router(Arc::new(AppState::new(config, engine, dispatcher, jobs, signer)))
    }

    async fn call(app: &Router, method: Method, uri: &str, token: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        if let Some(t) = token {
            req = req.header("authorization", format!("Bearer {t}"));
        }
        let req = match body {
            Some(b) => req
                .header("content-type", "application/json")
                .body(Body::from(b.to_string()))
                .unwrap(),
            None => req.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        // Extractor rejections come back as plain text.
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        };
        (status, json)
    }

    fn echo_job(name: &str) -> Value {
        json!({
            "name": name,
            "timezone": "Europe/Berlin",
            "steps": [{"step_id": "hello", "type": "echo", "config": {"message": "hi"}}]
        })
    }

    async fn register(app: &Router, id: &str) -> String {
        let (status, body) = call(
            app,
            Method::POST,
            routes::AGENT_REGISTER,
            None,
            Some(json!({
                "agent_id": id,
                "hostname": format!("{id}.lan"),
                "ip_address": "10.0.0.9",
                "capabilities": ["shell"],
                "max_parallel_jobs": 2
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        body["token"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn health_is_open() {
        let app = test_app();
        let (status, body) = call(&app, Method::GET, routes::HEALTH, None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn admin_routes_need_the_admin_token() {
        let app = test_app();
        let (status, body) = call(&app, Method::GET, routes::QUEUES, None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["code"], "AUTH_FAILED");

        let (status, _) = call(&app, Method::GET, routes::QUEUES, Some(ADMIN), None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn run_now_returns_the_finished_result() {
        let app = test_app();
        let (status, body) = call(&app, Method::POST, routes::JOBS_RUN, Some(ADMIN), Some(echo_job("greet"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "success");
        assert_eq!(body["steps"][0]["output"]["message"], "hi");

        let uri = routes::with_id(routes::EXECUTION, body["execution_id"].as_str().unwrap());
        let (status, body) = call(&app, Method::GET, &uri, Some(ADMIN), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "success");
        assert!(body["assignments"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_job_is_a_bad_request_listing_every_problem() {
        let app = test_app();
        let job = json!({
            "name": "broken",
            "timezone": "Mars/Olympus",
            "steps": [{"step_id": "x", "type": "teleport", "config": {}}]
        });
        let (status, body) = call(&app, Method::POST, routes::JOBS_RUN, Some(ADMIN), Some(job)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "CONFIGURATION_ERROR");
        let message = body["error"]["message"].as_str().unwrap();
        assert!(message.contains("Mars/Olympus"));
        assert!(message.contains("teleport"));
    }

    #[tokio::test]
    async fn scheduled_execution_can_be_cancelled_once() {
        let app = test_app();
        let req = json!({
            "job": echo_job("later"),
            "at": {"kind": "local", "value": "2099-01-01T09:00:00"}
        });
        let (status, body) = call(&app, Method::POST, routes::JOBS_SCHEDULE, Some(ADMIN), Some(req)).await;
        assert_eq!(status, StatusCode::OK);
        let id = body["execution_id"].as_str().unwrap().to_string();

        let uri = routes::with_id(routes::EXECUTION_CANCEL, &id);
        let (status, _) = call(&app, Method::POST, &uri, Some(ADMIN), None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = call(&app, Method::POST, &uri, Some(ADMIN), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["code"], "INVALID_TRANSITION");

        let missing = routes::with_id(routes::EXECUTION_CANCEL, "no-such-execution");
        let (status, _) = call(&app, Method::POST, &missing, Some(ADMIN), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn agent_cannot_report_for_another_agent() {
        let app = test_app();
        let token = register(&app, "a1").await;
        register(&app, "a2").await;

        let hb = json!({"agent_id": "a2", "current_jobs": 0});
        let (status, body) = call(&app, Method::POST, routes::AGENT_HEARTBEAT, Some(&token), Some(hb)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"]["code"], "FORBIDDEN");

        let (status, _) = call(&app, Method::GET, routes::AGENT_ASSIGNMENTS, Some("a1.1.deadbeef"), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn recurring_definitions_round_trip() {
        let app = test_app();
        let mut job = echo_job("nightly");
        job["schedule"] = json!({"kind": "daily", "hour": 2, "minute": 30});
        let (status, body) = call(&app, Method::POST, routes::JOBS, Some(ADMIN), Some(job)).await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert!(body["next_run"].is_string());
        let id = body["job"]["id"].as_str().unwrap().to_string();

        let (_, list) = call(&app, Method::GET, routes::JOBS, Some(ADMIN), None).await;
        assert_eq!(list.as_array().unwrap().len(), 1);

        let (status, _) = call(&app, Method::DELETE, &routes::with_id(routes::JOB, &id), Some(ADMIN), None).await;
        assert_eq!(status, StatusCode::OK);
        let (_, list) = call(&app, Method::GET, routes::JOBS, Some(ADMIN), None).await;
        assert!(list.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn remote_job_runs_on_an_approved_agent_over_http() {
        let app = test_app();
        let token = register(&app, "a1").await;
        let approve = routes::with_id(routes::AGENT_APPROVE, "a1");
        let (status, body) = call(&app, Method::POST, &approve, Some(ADMIN), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["is_approved"], true);
        let hb = json!({"agent_id": "a1", "current_jobs": 0, "cpu_percent": 3.5});
        let (status, _) = call(&app, Method::POST, routes::AGENT_HEARTBEAT, Some(&token), Some(hb)).await;
        assert_eq!(status, StatusCode::OK);

        let mut job = echo_job("remote");
        job["execution_type"] = json!("agent");
        job["required_capabilities"] = json!(["shell"]);
        let run = {
            let app = app.clone();
            tokio::spawn(async move { call(&app, Method::POST, routes::JOBS_RUN, Some(ADMIN), Some(job)).await })
        };

        let mut assignment = None;
        for _ in 0..300 {
            assert!(!run.is_finished(), "run finished before the agent got the job");
            let (status, body) = call(&app, Method::GET, "/api/agent/assignments?max_jobs=4", Some(&token), None).await;
            assert_eq!(status, StatusCode::OK);
            if let Some(a) = body["assignments"].as_array().and_then(|a| a.first()) {
                assignment = Some(a.clone());
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let assignment = assignment.expect("no assignment reached the agent within 3s");
        let id = assignment["assignment_id"].as_str().unwrap();
        assert_eq!(assignment["job"]["name"], "remote");

        let uri = routes::with_id(routes::AGENT_ASSIGNMENT_STATUS, id);
        let (status, _) = call(&app, Method::POST, &uri, Some(&token), Some(json!({"status": "running"}))).await;
        assert_eq!(status, StatusCode::OK);

        let result = json!({
            "status": "success",
            "steps": [{"step_id": "hello", "attempt": 1, "status": "success", "output": {"message": "hi"}}]
        });
        let uri = routes::with_id(routes::AGENT_ASSIGNMENT_RESULT, id);
        let (status, _) = call(&app, Method::POST, &uri, Some(&token), Some(result.clone())).await;
        assert_eq!(status, StatusCode::OK);
        // A second result for the same assignment is rejected.
        let (status, _) = call(&app, Method::POST, &uri, Some(&token), Some(result)).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, body) = tokio::time::timeout(std::time::Duration::from_secs(5), run)
            .await
            .expect("run did not finish after the result was submitted")
            .unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "success");
        assert_eq!(body["executed_on_agent"], "a1");
    }
}
