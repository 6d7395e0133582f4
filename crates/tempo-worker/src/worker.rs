use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempo_core::config::{WorkerConfig, DEFAULT_STEP_TIMEOUT_SECS, HEARTBEAT_INTERVAL_SECS};
use tempo_core::{AgentId, AssignmentId, JobStatus};
use tempo_protocol::{
    AssignmentPayload, HeartbeatAck, HeartbeatRequest, RegisterRequest, RegisterResponse,
    SubmitResultRequest, WorkerState,
};
use tempo_steps::{run_sequence, ExecutionContext, SequenceOutcome, StepRegistry};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::client::GatewayApi;
use crate::error::{Result, WorkerError};
use crate::host;

/// One remote agent: registration, heartbeats, polling and job execution.
///
/// Each accepted assignment runs on its own task; the number in flight never
/// exceeds `max_parallel_jobs` because polls only ask for free slots.
pub struct Worker {
    api: Arc<dyn GatewayApi>,
    config: WorkerConfig,
    agent_id: AgentId,
    steps: StepRegistry,
    token: Mutex<Option<String>>,
    heartbeat_secs: AtomicU64,
    running: Mutex<HashMap<AssignmentId, CancellationToken>>,
}

impl Worker {
    pub fn new(api: Arc<dyn GatewayApi>, config: WorkerConfig, steps: StepRegistry) -> Self {
        let agent_id = AgentId::from(config.agent_id.clone().unwrap_or_else(host::hostname));
        Self {
            api,
            config,
            agent_id,
            steps,
            token: Mutex::new(None),
            heartbeat_secs: AtomicU64::new(HEARTBEAT_INTERVAL_SECS),
            running: Mutex::new(HashMap::new()),
        }
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    /// Assignments currently executing.
    pub fn running(&self) -> usize {
        self.running.lock().unwrap().len()
    }

    #[instrument(skip(self), fields(agent_id = %self.agent_id))]
    pub async fn register(&self) -> Result<RegisterResponse> {
        let req = RegisterRequest {
            agent_id: self.agent_id.clone(),
            agent_name: self.config.agent_name.clone(),
            hostname: host::hostname(),
            ip_address: host::local_ip(),
            capabilities: self.config.capabilities.clone(),
            max_parallel_jobs: self.config.max_parallel_jobs.max(1),
            pool: Some(self.config.pool.clone()),
        };
        let resp = self.api.register(&req).await?;
        *self.token.lock().unwrap() = Some(resp.token.clone());
        if let Some(secs) = resp.heartbeat_interval_secs {
            self.heartbeat_secs.store(secs.max(1), Ordering::Relaxed);
        }
        if resp.approved {
            info!(status = ?resp.status, "registered");
        } else {
            warn!(status = ?resp.status, "registered, waiting for operator approval");
        }
        Ok(resp)
    }

    /// Report liveness and load; stop any assignment the gateway revoked.
    pub async fn heartbeat_once(&self) -> Result<HeartbeatAck> {
        let req = HeartbeatRequest {
            agent_id: self.agent_id.clone(),
            status: WorkerState::Online,
            current_jobs: u32::try_from(self.running()).unwrap_or(u32::MAX),
            cpu_percent: host::cpu_percent(),
            memory_percent: host::memory_percent(),
            disk_percent: None,
        };
        let req = &req;
        let ack = self
            .authed(|token| async move { self.api.heartbeat(&token, req).await })
            .await?;

        let running = self.running.lock().unwrap();
        for id in &ack.cancelled_assignments {
            if let Some(cancel) = running.get(id) {
                info!(assignment_id = %id, "assignment revoked by gateway");
                cancel.cancel();
            }
        }
        Ok(ack)
    }

    /// Ask for as many assignments as there are free slots and start them.
    pub async fn poll_once(self: &Arc<Self>) -> Result<Vec<JoinHandle<()>>> {
        let free = self
            .config
            .max_parallel_jobs
            .max(1)
            .saturating_sub(u32::try_from(self.running()).unwrap_or(u32::MAX));
        if free == 0 {
            return Ok(Vec::new());
        }

        let resp = self
            .authed(|token| async move { self.api.poll(&token, free).await })
            .await?;

        let mut handles = Vec::with_capacity(resp.assignments.len());
        for payload in resp.assignments {
            info!(
                assignment_id = %payload.assignment_id,
                execution_id = %payload.execution_id,
                job = %payload.job.name,
                "assignment accepted"
            );
            self.running
                .lock()
                .unwrap()
                .insert(payload.assignment_id.clone(), CancellationToken::new());
            let worker = Arc::clone(self);
            handles.push(tokio::spawn(async move { worker.execute(payload).await }));
        }
        Ok(handles)
    }

    /// Main loop. Registers (with backoff), then heartbeats and polls until
    /// `shutdown` broadcasts `true`.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = Duration::from_secs(1);
        loop {
            match self.register().await {
                Ok(_) => break,
                Err(e) => warn!(retry_in = ?backoff, "registration failed: {e}"),
            }
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
            backoff = (backoff * 2).min(Duration::from_secs(60));
        }

        let heartbeats = tokio::spawn(Arc::clone(&self).heartbeat_loop(shutdown.clone()));
        let mut poll = tokio::time::interval(Duration::from_secs(self.config.poll_interval_secs.max(1)));
        info!(agent_id = %self.agent_id, "worker started");
        loop {
            tokio::select! {
                _ = poll.tick() => {
                    if let Err(e) = self.poll_once().await {
                        warn!("poll failed: {e}");
                    }
                }
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        info!("worker shutting down");
                        break;
                    }
                }
            }
        }

        for cancel in self.running.lock().unwrap().values() {
            cancel.cancel();
        }
        let _ = heartbeats.await;
    }

    // ---- private helpers ----

    async fn heartbeat_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let secs = self.heartbeat_secs.load(Ordering::Relaxed);
        let mut interval = tokio::time::interval(Duration::from_secs(secs));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.heartbeat_once().await {
                        warn!("heartbeat failed: {e}");
                    }
                }
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Run one assignment to completion and report it.
    async fn execute(&self, payload: AssignmentPayload) {
        let AssignmentPayload {
            assignment_id,
            execution_id,
            attempt,
            job,
            ..
        } = payload;
        let id = &assignment_id;
        let cancel = self
            .running
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .unwrap_or_default();

        if let Err(e) = self
            .authed(|token| async move { self.api.report_running(&token, id).await })
            .await
        {
            // The gateway will time the assignment out and reassign it.
            warn!(assignment_id = %id, "could not start assignment: {e}");
            self.running.lock().unwrap().remove(id);
            return;
        }

        let outcome = match self.steps.build_job(&job) {
            Ok(steps) => {
                let mut ctx = ExecutionContext::new(execution_id, job.id.clone(), attempt, cancel);
                let default_timeout = Duration::from_secs(DEFAULT_STEP_TIMEOUT_SECS);
                run_sequence(&job, &steps, &mut ctx, default_timeout).await
            }
            Err(e) => SequenceOutcome {
                status: JobStatus::Failed,
                steps: Vec::new(),
                error: Some(e.to_string()),
            },
        };
        info!(assignment_id = %id, status = %outcome.status, "assignment finished");

        let req = SubmitResultRequest {
            status: outcome.status,
            steps: outcome.steps,
            error_message: outcome.error,
        };
        let req = &req;
        match self
            .authed(|token| async move { self.api.submit_result(&token, id, req).await })
            .await
        {
            Ok(()) => {}
            Err(WorkerError::Api { status: 409, message, .. }) => {
                info!(assignment_id = %id, "result not accepted: {message}");
            }
            Err(e) => error!(assignment_id = %id, "failed to submit result: {e}"),
        }
        self.running.lock().unwrap().remove(id);
    }

    /// Call `op` with the current token, registering again once if it is rejected.
    async fn authed<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let token = self.current_token()?;
        match op(token).await {
            Err(WorkerError::Unauthorized(reason)) => {
                warn!(%reason, "token rejected, registering again");
                self.register().await?;
                op(self.current_token()?).await
            }
            other => other,
        }
    }

    fn current_token(&self) -> Result<String> {
        self.token
            .lock()
            .unwrap()
            .clone()
            .ok_or(WorkerError::NotRegistered)
    }
}
