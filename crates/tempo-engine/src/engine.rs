use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tempo_agents::Dispatcher;
use tempo_core::config::EngineConfig;
use tempo_core::timezone::resolve_local;
use tempo_core::{
    AgentId, AssignmentId, ExecutionId, ExecutionType, JobDefinition, JobExecutionResult,
    JobStatus, Result, StepExecutionResult, TempoError,
};
use tempo_steps::{run_sequence, ExecutionContext, StepRegistry};
use tokio::runtime::Handle;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::queue::{JobRunner, QueueStatus, QueuedJob, TimezoneQueue};
use crate::remote::RemoteExecutor;
use crate::store::{ExecutionStore, MemoryExecutionStore};

/// When a scheduled job should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ScheduleAt {
    /// Wall-clock time in the job's own timezone.
    Local(NaiveDateTime),
    /// Absolute instant.
    At(DateTime<Utc>),
}

/// What one attempt produced, local or remote.
#[derive(Debug, Clone)]
pub struct AttemptOutcome {
    pub status: JobStatus,
    pub steps: Vec<StepExecutionResult>,
    pub error: Option<String>,
    /// Agent and assignment that ran the attempt, for remote jobs.
    pub placed: Option<(AgentId, AssignmentId)>,
}

/// An execution the engine still owns: queued, running or retrying.
struct LiveExecution {
    result: JobExecutionResult,
    cancel: CancellationToken,
    /// Set while the execution waits in this timezone's queue.
    queued: Option<String>,
}

/// Assembles an [`ExecutionEngine`].
pub struct EngineBuilder {
    config: EngineConfig,
    steps: StepRegistry,
    store: Arc<dyn ExecutionStore>,
    remote: Option<RemoteExecutor>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            steps: StepRegistry::builtin(),
            store: Arc::new(MemoryExecutionStore::new()),
            remote: None,
        }
    }

    pub fn steps(mut self, steps: StepRegistry) -> Self {
        self.steps = steps;
        self
    }

    pub fn store(mut self, store: Arc<dyn ExecutionStore>) -> Self {
        self.store = store;
        self
    }

    /// Enable `execution_type = agent` jobs.
    pub fn dispatcher(mut self, dispatcher: Arc<Dispatcher>, max_assignment_attempts: u32) -> Self {
        self.remote = Some(RemoteExecutor::new(dispatcher, max_assignment_attempts));
        self
    }

    /// Must be called inside a Tokio runtime; queues and the blocking façade
    /// spawn onto it.
    pub fn build(self) -> Result<Arc<ExecutionEngine>> {
        let runtime = Handle::try_current()
            .map_err(|e| TempoError::Internal(format!("engine needs a tokio runtime: {e}")))?;
        let (shutdown, _) = watch::channel(false);
        Ok(Arc::new_cyclic(|me| ExecutionEngine {
            me: me.clone(),
            config: self.config,
            steps: self.steps,
            store: self.store,
            remote: self.remote,
            queues: Mutex::new(HashMap::new()),
            live: Mutex::new(HashMap::new()),
            runtime,
            shutdown,
        }))
    }
}

/// Runs jobs now or at a time, locally or on agents, and tracks every
/// execution until its result is stored.
pub struct ExecutionEngine {
    me: Weak<ExecutionEngine>,
    config: EngineConfig,
    steps: StepRegistry,
    store: Arc<dyn ExecutionStore>,
    remote: Option<RemoteExecutor>,
    queues: Mutex<HashMap<String, Arc<TimezoneQueue>>>,
    live: Mutex<HashMap<ExecutionId, LiveExecution>>,
    runtime: Handle,
    shutdown: watch::Sender<bool>,
}

impl ExecutionEngine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.store
    }

    pub fn steps(&self) -> &StepRegistry {
        &self.steps
    }

    /// Run `job` immediately and wait for its final result.
    ///
    /// An invalid definition is rejected with `Configuration` before anything runs.
    #[instrument(skip(self, job), fields(job = %job.name))]
    pub async fn execute_job_now(&self, job: JobDefinition) -> Result<JobExecutionResult> {
        let rx = self.start_now(job)?;
        rx.await
            .map_err(|_| TempoError::Internal("execution task ended without a result".to_string()))
    }

    /// Blocking form of [`execute_job_now`](Self::execute_job_now).
    ///
    /// Must not be called from inside an async task.
    pub fn execute_job_now_blocking(&self, job: JobDefinition) -> Result<JobExecutionResult> {
        let rx = self.start_now(job)?;
        rx.blocking_recv()
            .map_err(|_| TempoError::Internal("execution task ended without a result".to_string()))
    }

    /// Queue `job` on its timezone's queue and return the new execution id.
    ///
    /// Wall-clock times in a DST gap move forward by the gap; ambiguous
    /// times take the earlier instant.
    #[instrument(skip(self, job), fields(job = %job.name, timezone = %job.timezone))]
    pub fn schedule_job(&self, job: JobDefinition, at: ScheduleAt) -> Result<ExecutionId> {
        self.validate(&job)?;
        let deadline = match at {
            ScheduleAt::Local(local) => resolve_local(&job.timezone, local)?,
            ScheduleAt::At(instant) => instant,
        };

        let execution_id = ExecutionId::new();
        let queue = self.queue_for(&job.timezone)?;
        self.register(&execution_id, &job, Some(job.timezone.clone()));
        queue.push(QueuedJob {
            execution_id: execution_id.clone(),
            job,
            deadline,
        });
        info!(execution_id = %execution_id, %deadline, "job scheduled");
        Ok(execution_id)
    }

    /// Cancel a queued or running execution.
    ///
    /// Returns `false` when the execution is unknown or already finished.
    /// A queued execution is finalized `Cancelled` without running; a running
    /// one stops at the next step boundary.
    pub fn cancel_job(&self, execution_id: &ExecutionId) -> bool {
        let queued = {
            let mut live = self.live.lock().unwrap();
            let Some(entry) = live.get_mut(execution_id) else {
                return false;
            };
            entry.cancel.cancel();
            if entry.result.status != JobStatus::Pending {
                info!(execution_id = %execution_id, "cancellation requested");
                return true;
            }

            // Stored before the live entry goes, so status lookups and a
            // racing `claim` always find one or the other.
            let mut result = entry.result.clone();
            if let Err(e) = result.finish(JobStatus::Cancelled, Some("cancelled before start".to_string())) {
                error!(execution_id = %execution_id, "cannot finalize cancelled execution: {e}");
            }
            self.persist(&result);
            live.remove(execution_id).and_then(|entry| entry.queued)
        };

        if let Some(timezone) = &queued {
            if let Some(queue) = self.queues.lock().unwrap().get(timezone) {
                queue.remove(execution_id);
            }
        }
        info!(execution_id = %execution_id, "queued execution cancelled");
        true
    }

    /// Current state of a live execution, or the stored result of a past one.
    pub fn get_execution_status(&self, execution_id: &ExecutionId) -> Result<JobExecutionResult> {
        if let Some(entry) = self.live.lock().unwrap().get(execution_id) {
            return Ok(entry.result.clone());
        }
        self.store
            .load_result(execution_id)?
            .ok_or_else(|| TempoError::NotFound {
                kind: "execution",
                id: execution_id.to_string(),
            })
    }

    /// Depth, activity and limits of every timezone queue created so far.
    pub fn get_queue_status(&self) -> BTreeMap<String, QueueStatus> {
        self.queues
            .lock()
            .unwrap()
            .iter()
            .map(|(tz, q)| (tz.clone(), q.status()))
            .collect()
    }

    /// Stop every queue loop. Running executions finish on their own.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    // ---- private helpers ----

    fn validate(&self, job: &JobDefinition) -> Result<()> {
        // Builds every step once so unknown types and bad configs fail here.
        self.steps.build_job(job)?;
        if job.execution_type == ExecutionType::Agent && self.remote.is_none() {
            return Err(TempoError::config(
                "agent execution requested but no dispatcher is configured",
            ));
        }
        Ok(())
    }

    fn start_now(&self, job: JobDefinition) -> Result<oneshot::Receiver<JobExecutionResult>> {
        self.validate(&job)?;
        let engine = self
            .me
            .upgrade()
            .ok_or_else(|| TempoError::Internal("engine is shutting down".to_string()))?;
        let execution_id = ExecutionId::new();
        self.register(&execution_id, &job, None);

        let (tx, rx) = oneshot::channel();
        self.runtime.spawn(async move {
            let result = match engine.run_execution(execution_id.clone(), job).await {
                Some(result) => Some(result),
                // Cancelled before it started; `cancel_job` stored the result.
                None => engine.store.load_result(&execution_id).ok().flatten(),
            };
            if let Some(result) = result {
                let _ = tx.send(result);
            }
        });
        Ok(rx)
    }

    fn register(&self, execution_id: &ExecutionId, job: &JobDefinition, queued: Option<String>) {
        self.live.lock().unwrap().insert(
            execution_id.clone(),
            LiveExecution {
                result: JobExecutionResult::new(execution_id.clone(), job),
                cancel: CancellationToken::new(),
                queued,
            },
        );
    }

    fn queue_for(&self, timezone: &str) -> Result<Arc<TimezoneQueue>> {
        let mut queues = self.queues.lock().unwrap();
        if let Some(q) = queues.get(timezone) {
            return Ok(Arc::clone(q));
        }
        let queue = Arc::new(TimezoneQueue::new(
            timezone,
            self.config.max_concurrent_for(timezone),
        ));
        let runner: Weak<dyn JobRunner> = self.me.clone();
        self.runtime.spawn(Arc::clone(&queue).run(runner, self.shutdown.subscribe()));
        queues.insert(timezone.to_string(), Arc::clone(&queue));
        info!(timezone, "timezone queue created");
        Ok(queue)
    }

    /// Move a registered execution from pending to running.
    ///
    /// Returns `None` if it was cancelled (and finalized) in the meantime.
    fn claim(&self, execution_id: &ExecutionId) -> Option<(JobExecutionResult, CancellationToken)> {
        let mut live = self.live.lock().unwrap();
        let entry = live.get_mut(execution_id)?;
        if entry.result.status != JobStatus::Pending || entry.cancel.is_cancelled() {
            return None;
        }
        entry.queued = None;
        if let Err(e) = entry.result.start() {
            error!(execution_id = %execution_id, "cannot start execution: {e}");
            return None;
        }
        Some((entry.result.clone(), entry.cancel.clone()))
    }

    fn publish(&self, result: &JobExecutionResult) {
        if let Some(entry) = self.live.lock().unwrap().get_mut(&result.execution_id) {
            entry.result = result.clone();
        }
    }

    fn persist(&self, result: &JobExecutionResult) {
        if let Err(e) = self.store.save_result(result) {
            error!(execution_id = %result.execution_id, "failed to store execution result: {e}");
        }
    }

    /// Drive one execution through all of its attempts.
    async fn run_execution(&self, execution_id: ExecutionId, job: JobDefinition) -> Option<JobExecutionResult> {
        let (mut result, cancel) = self.claim(&execution_id)?;
        info!(execution_id = %execution_id, job = %job.name, "execution started");

        let (status, error) = loop {
            let attempt = result.attempt();
            let outcome = self.run_attempt(&job, &execution_id, attempt, &cancel).await;
            for step in outcome.steps {
                result.push_step(step);
            }
            if let Some((agent, assignment)) = outcome.placed {
                result.executed_on_agent = Some(agent);
                result.assignment_id = Some(assignment);
            }

            let retry = outcome.status == JobStatus::Failed
                && result.retry_count < job.max_retries
                && !cancel.is_cancelled();
            if !retry {
                break (outcome.status, outcome.error);
            }

            if let Err(e) = result.begin_retry() {
                error!(execution_id = %execution_id, "cannot retry: {e}");
                break (outcome.status, outcome.error);
            }
            self.publish(&result);
            warn!(
                execution_id = %execution_id,
                retry = result.retry_count,
                max_retries = job.max_retries,
                error = ?outcome.error,
                "attempt failed, retrying"
            );

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(job.retry_delay)) => {}
                _ = cancel.cancelled() => {
                    break (JobStatus::Cancelled, Some("cancelled while waiting to retry".to_string()));
                }
            }
            if let Err(e) = result.start() {
                error!(execution_id = %execution_id, "cannot restart execution: {e}");
                break (JobStatus::Failed, Some(e.to_string()));
            }
            self.publish(&result);
        };

        if let Err(e) = result.finish(status, error) {
            error!(execution_id = %execution_id, "cannot finish execution: {e}");
        }
        self.persist(&result);
        self.live.lock().unwrap().remove(&execution_id);
        info!(
            execution_id = %execution_id,
            status = %result.status,
            retries = result.retry_count,
            ms = ?result.duration_ms,
            "execution finished"
        );
        Some(result)
    }

    async fn run_attempt(
        &self,
        job: &JobDefinition,
        execution_id: &ExecutionId,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> AttemptOutcome {
        match (job.execution_type, &self.remote) {
            (ExecutionType::Agent, Some(remote)) => remote.run(job, execution_id, attempt, cancel).await,
            _ => self.run_local(job, execution_id, attempt, cancel).await,
        }
    }

    async fn run_local(
        &self,
        job: &JobDefinition,
        execution_id: &ExecutionId,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> AttemptOutcome {
        // Fresh step instances per attempt: a step cancelled on timeout stays cancelled.
        let steps = match self.steps.build_job(job) {
            Ok(steps) => steps,
            Err(e) => {
                return AttemptOutcome {
                    status: JobStatus::Failed,
                    steps: Vec::new(),
                    error: Some(e.to_string()),
                    placed: None,
                }
            }
        };
        let mut ctx = ExecutionContext::new(execution_id.clone(), job.id.clone(), attempt, cancel.child_token());
        let default_timeout = Duration::from_secs(self.config.default_step_timeout_secs);
        let outcome = run_sequence(job, &steps, &mut ctx, default_timeout).await;
        AttemptOutcome {
            status: outcome.status,
            steps: outcome.steps,
            error: outcome.error,
            placed: None,
        }
    }
}

#[async_trait]
impl JobRunner for ExecutionEngine {
    async fn run_queued(&self, item: QueuedJob) {
        // `None` means it was cancelled while queued and is already finalized.
        let _ = self.run_execution(item.execution_id, item.job).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempo_core::{StepConfig, StepStatus};

    fn engine() -> Arc<ExecutionEngine> {
        ExecutionEngine::builder(EngineConfig::default()).build().unwrap()
    }

    fn echo(id: &str) -> StepConfig {
        StepConfig::new(id, "echo", json!({"message": id}))
    }

    #[tokio::test]
    async fn invalid_job_is_rejected_before_running() {
        let engine = engine();
        let job = JobDefinition::new(
            "bad",
            "Mars/Olympus",
            vec![StepConfig::new("a", "teleport", json!({}))],
        );

        let err = engine.execute_job_now(job).await.unwrap_err();
        match err {
            TempoError::Configuration { errors } => {
                assert!(errors.iter().any(|e| e.contains("timezone")));
                assert!(errors.iter().any(|e| e.contains("teleport")));
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[tokio::test]
    async fn oversized_job_timeout_is_a_configuration_error() {
        let engine = engine();
        let mut job = JobDefinition::new("endless", "UTC", vec![echo("a")]);
        job.timeout = u64::MAX;

        let err = engine.execute_job_now(job.clone()).await.unwrap_err();
        assert_eq!(err.code(), "CONFIGURATION_ERROR");
        assert!(engine.schedule_job(job, ScheduleAt::At(Utc::now())).is_err());
        assert!(engine.live.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn execution_cancelled_before_claim_still_answers_the_caller() {
        let engine = engine();
        let job = JobDefinition::new("raced", "UTC", vec![echo("a")]);
        let execution_id = ExecutionId::new();
        engine.register(&execution_id, &job, None);
        assert!(engine.cancel_job(&execution_id));

        // Nothing live, the cancelled result is already stored.
        assert!(engine.live.lock().unwrap().is_empty());
        let stored = engine.get_execution_status(&execution_id).unwrap();
        assert_eq!(stored.status, JobStatus::Cancelled);

        assert!(engine.run_execution(execution_id.clone(), job).await.is_none());
        assert_eq!(engine.store.load_result(&execution_id).unwrap(), Some(stored));
    }

    #[tokio::test]
    async fn successful_run_is_stored() {
        let engine = engine();
        let job = JobDefinition::new("ok", "UTC", vec![echo("a"), echo("b")]);

        let result = engine.execute_job_now(job).await.unwrap();
        assert_eq!(result.status, JobStatus::Success);
        assert_eq!(result.successful_steps(), 2);
        assert!(result.start_time.unwrap() <= result.end_time.unwrap());

        let stored = engine.get_execution_status(&result.execution_id).unwrap();
        assert_eq!(stored, result);
    }

    #[tokio::test]
    async fn failed_job_is_retried_with_fresh_attempts() {
        let engine = engine();
        let mut job = JobDefinition::new(
            "flaky",
            "UTC",
            vec![echo("a"), StepConfig::new("b", "command", json!({"command": "exit 3"}))],
        );
        job.max_retries = 2;

        let result = engine.execute_job_now(job).await.unwrap();
        assert_eq!(result.status, JobStatus::Failed);
        assert_eq!(result.retry_count, 2);
        assert_eq!(result.steps.len(), 6);
        for attempt in 1..=3 {
            let statuses: Vec<StepStatus> = result.attempt_steps(attempt).map(|s| s.status).collect();
            assert_eq!(statuses, vec![StepStatus::Success, StepStatus::Failed]);
        }
    }

    #[tokio::test]
    async fn timeout_is_not_retried() {
        let engine = engine();
        let mut job = JobDefinition::new(
            "slow",
            "UTC",
            vec![StepConfig::new("nap", "delay", json!({"duration_ms": 5_000}))],
        );
        job.timeout = 1;
        job.max_retries = 3;

        let result = engine.execute_job_now(job).await.unwrap();
        assert_eq!(result.status, JobStatus::Timeout);
        assert_eq!(result.retry_count, 0);
    }

    #[tokio::test]
    async fn queued_execution_can_be_cancelled_before_it_starts() {
        let engine = engine();
        let job = JobDefinition::new("later", "Asia/Tokyo", vec![echo("a")]);
        let id = engine
            .schedule_job(job, ScheduleAt::At(Utc::now() + chrono::Duration::hours(1)))
            .unwrap();

        assert_eq!(engine.get_execution_status(&id).unwrap().status, JobStatus::Pending);
        assert_eq!(engine.get_queue_status()["Asia/Tokyo"].depth, 1);

        assert!(engine.cancel_job(&id));
        assert!(!engine.cancel_job(&id));
        let result = engine.get_execution_status(&id).unwrap();
        assert_eq!(result.status, JobStatus::Cancelled);
        assert!(result.steps.is_empty());
        assert_eq!(engine.get_queue_status()["Asia/Tokyo"].depth, 0);
    }

    #[tokio::test]
    async fn running_execution_stops_at_the_next_step() {
        let engine = engine();
        let job = JobDefinition::new(
            "long",
            "UTC",
            vec![
                StepConfig::new("nap", "delay", json!({"duration_ms": 300})),
                echo("after"),
            ],
        );
        let id = engine.schedule_job(job, ScheduleAt::At(Utc::now())).unwrap();

        for _ in 0..100 {
            if engine.get_execution_status(&id).unwrap().status == JobStatus::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(engine.cancel_job(&id));

        let mut result = engine.get_execution_status(&id).unwrap();
        for _ in 0..200 {
            if result.status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            result = engine.get_execution_status(&id).unwrap();
        }
        assert_eq!(result.status, JobStatus::Cancelled);
        assert_eq!(result.steps[0].status, StepStatus::Success);
        assert_eq!(result.steps[1].status, StepStatus::Skipped);
    }

    #[tokio::test]
    async fn unknown_execution_is_not_found() {
        let engine = engine();
        let err = engine.get_execution_status(&ExecutionId::new()).unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
        assert!(!engine.cancel_job(&ExecutionId::new()));
    }

    #[test]
    fn blocking_facade_waits_for_the_result() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let engine = rt.block_on(async { engine() });
        let job = JobDefinition::new("sync", "UTC", vec![echo("a")]);

        let result = engine.execute_job_now_blocking(job).unwrap();
        assert_eq!(result.status, JobStatus::Success);
    }
}
