use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tempo_core::AssignmentId;
use tempo_protocol::{
    routes, Ack, ErrorBody, HeartbeatAck, HeartbeatRequest, PollResponse, RegisterRequest,
    RegisterResponse, ReportedState, StatusUpdateRequest, SubmitResultRequest,
};
use tracing::{debug, warn};

use crate::error::{Result, WorkerError};

/// The gateway's agent protocol as seen from a worker.
#[async_trait]
pub trait GatewayApi: Send + Sync {
    async fn register(&self, req: &RegisterRequest) -> Result<RegisterResponse>;

    async fn heartbeat(&self, token: &str, req: &HeartbeatRequest) -> Result<HeartbeatAck>;

    async fn poll(&self, token: &str, max_jobs: u32) -> Result<PollResponse>;

    async fn report_running(&self, token: &str, assignment_id: &AssignmentId) -> Result<()>;

    async fn submit_result(
        &self,
        token: &str,
        assignment_id: &AssignmentId,
        req: &SubmitResultRequest,
    ) -> Result<()>;
}

/// reqwest-backed [`GatewayApi`].
pub struct GatewayClient {
    client: reqwest::Client,
    base_url: String,
}

impl GatewayClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send<T: DeserializeOwned>(&self, req: reqwest::RequestBuilder) -> Result<T> {
        let resp = req.send().await.map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                WorkerError::Unavailable(e.to_string())
            } else {
                WorkerError::Http(e)
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let (code, message) = match serde_json::from_str::<ErrorBody>(&text) {
                Ok(body) => (body.error.code, body.error.message),
                Err(_) => (String::new(), text),
            };
            if status == reqwest::StatusCode::UNAUTHORIZED {
                return Err(WorkerError::Unauthorized(message));
            }
            warn!(status = status.as_u16(), %code, %message, "gateway API error");
            return Err(WorkerError::Api {
                status: status.as_u16(),
                code,
                message,
            });
        }

        resp.json()
            .await
            .map_err(|e| WorkerError::Parse(e.to_string()))
    }
}

#[async_trait]
impl GatewayApi for GatewayClient {
    async fn register(&self, req: &RegisterRequest) -> Result<RegisterResponse> {
        debug!(agent_id = %req.agent_id, "registering with gateway");
        self.send(self.client.post(self.url(routes::AGENT_REGISTER)).json(req))
            .await
    }

    async fn heartbeat(&self, token: &str, req: &HeartbeatRequest) -> Result<HeartbeatAck> {
        self.send(
            self.client
                .post(self.url(routes::AGENT_HEARTBEAT))
                .bearer_auth(token)
                .json(req),
        )
        .await
    }

    async fn poll(&self, token: &str, max_jobs: u32) -> Result<PollResponse> {
        self.send(
            self.client
                .get(self.url(routes::AGENT_ASSIGNMENTS))
                .bearer_auth(token)
                .query(&[("max_jobs", max_jobs)]),
        )
        .await
    }

    async fn report_running(&self, token: &str, assignment_id: &AssignmentId) -> Result<()> {
        let path = routes::with_id(routes::AGENT_ASSIGNMENT_STATUS, assignment_id.as_str());
        let _: Ack = self
            .send(
                self.client
                    .post(self.url(&path))
                    .bearer_auth(token)
                    .json(&StatusUpdateRequest {
                        status: ReportedState::Running,
                    }),
            )
            .await?;
        Ok(())
    }

    async fn submit_result(
        &self,
        token: &str,
        assignment_id: &AssignmentId,
        req: &SubmitResultRequest,
    ) -> Result<()> {
        let path = routes::with_id(routes::AGENT_ASSIGNMENT_RESULT, assignment_id.as_str());
        let _: Ack = self
            .send(self.client.post(self.url(&path)).bearer_auth(token).json(req))
            .await?;
        Ok(())
    }
}
