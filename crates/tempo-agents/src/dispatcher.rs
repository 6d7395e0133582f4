use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tempo_core::config::AgentsConfig;
use tempo_core::{
    AgentId, AssignmentId, ExecutionId, JobDefinition, JobStatus, StepExecutionResult,
};
use tokio::sync::{oneshot, watch};
use tracing::{error, info, instrument, warn};

use crate::error::{AgentError, Result};
use crate::registry::AgentRegistry;
use crate::store::AgentStore;
use crate::types::{AgentJobAssignment, AssignmentStatus};

/// Terminal assignments stay queryable in memory this long before pruning.
const TERMINAL_RETENTION_MINUTES: i64 = 60;

/// How an assignment ended, delivered to whoever dispatched it.
#[derive(Debug, Clone, PartialEq)]
pub enum AssignmentOutcome {
    /// The agent reported a final result.
    Completed {
        status: JobStatus,
        steps: Vec<StepExecutionResult>,
        error: Option<String>,
    },
    /// The assignment ended without a result (timeout, cancel, agent loss).
    Lost {
        status: AssignmentStatus,
        reason: String,
    },
}

/// Final result submitted by an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultReport {
    pub status: JobStatus,
    #[serde(default)]
    pub steps: Vec<StepExecutionResult>,
    #[serde(default)]
    pub error_message: Option<String>,
}

struct Entry {
    assignment: AgentJobAssignment,
    job: JobDefinition,
    notify: Option<oneshot::Sender<AssignmentOutcome>>,
}

#[derive(Default)]
struct DispatchState {
    assignments: HashMap<AssignmentId, Entry>,
    /// At most one live assignment per execution.
    live: HashMap<ExecutionId, AssignmentId>,
    /// Assignments an agent still believes it holds; drained by its next heartbeat.
    revoked: HashMap<AgentId, HashSet<AssignmentId>>,
}

/// Binds executions to agents and tracks every assignment to a terminal state.
///
/// Lock order is dispatcher state first, registry second.
pub struct Dispatcher {
    registry: Arc<AgentRegistry>,
    state: Mutex<DispatchState>,
    store: Option<Arc<dyn AgentStore>>,
    accept_timeout: Duration,
    assignment_timeout_minutes: u64,
    sweep_interval: std::time::Duration,
}

impl Dispatcher {
    pub fn new(registry: Arc<AgentRegistry>, config: &AgentsConfig) -> Self {
        Self {
            registry,
            state: Mutex::new(DispatchState::default()),
            store: None,
            accept_timeout: Duration::seconds(
                i64::try_from(config.accept_timeout_secs).unwrap_or(i64::MAX / 1000),
            ),
            assignment_timeout_minutes: config.assignment_timeout_minutes,
            sweep_interval: std::time::Duration::from_secs(config.sweep_interval_secs.max(1)),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn AgentStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// Reserve an agent for `job` and create an `assigned` record.
    ///
    /// The receiver resolves exactly once, when the assignment ends.
    #[instrument(skip(self, job, avoid), fields(job = %job.name))]
    pub fn dispatch(
        &self,
        job: &JobDefinition,
        execution_id: &ExecutionId,
        attempt: u32,
        avoid: &HashSet<AgentId>,
        now: DateTime<Utc>,
    ) -> Result<(AgentJobAssignment, oneshot::Receiver<AssignmentOutcome>)> {
        let mut state = self.state.lock().unwrap();
        if let Some(existing) = state.live.get(execution_id) {
            return Err(AgentError::InvalidRequest(format!(
                "execution {execution_id} already has live assignment {existing}"
            )));
        }

        let agent = self.registry.reserve(job, avoid, now)?;
        let assignment = AgentJobAssignment {
            assignment_id: AssignmentId::new(),
            execution_id: execution_id.clone(),
            agent_id: agent.agent_id.clone(),
            job_id: job.id.clone(),
            attempt,
            status: AssignmentStatus::Assigned,
            priority: job.priority,
            timeout_minutes: self.assignment_timeout_minutes,
            assigned_at: now,
            accepted_at: None,
            started_at: None,
            completed_at: None,
            error_message: None,
        };

        let (tx, rx) = oneshot::channel();
        state
            .live
            .insert(execution_id.clone(), assignment.assignment_id.clone());
        state.assignments.insert(
            assignment.assignment_id.clone(),
            Entry {
                assignment: assignment.clone(),
                job: job.clone(),
                notify: Some(tx),
            },
        );
        drop(state);

        self.persist(&assignment);
        info!(
            assignment_id = %assignment.assignment_id,
            agent_id = %assignment.agent_id,
            execution_id = %execution_id,
            attempt,
            "job assigned"
        );
        Ok((assignment, rx))
    }

    /// Hand up to `max_jobs` pending assignments to `agent_id`, marking them accepted.
    ///
    /// Higher priority first, then oldest.
    pub fn poll(
        &self,
        agent_id: &AgentId,
        max_jobs: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<(AgentJobAssignment, JobDefinition)>> {
        if self.registry.get(agent_id).is_none() {
            return Err(AgentError::NotFound {
                kind: "agent",
                id: agent_id.to_string(),
            });
        }

        let accepted = {
            let mut state = self.state.lock().unwrap();
            let mut pending: Vec<&mut Entry> = state
                .assignments
                .values_mut()
                .filter(|e| {
                    e.assignment.agent_id == *agent_id
                        && e.assignment.status == AssignmentStatus::Assigned
                })
                .collect();
            pending.sort_by(|a, b| {
                b.assignment
                    .priority
                    .cmp(&a.assignment.priority)
                    .then(a.assignment.assigned_at.cmp(&b.assignment.assigned_at))
            });

            let mut accepted = Vec::new();
            for entry in pending.into_iter().take(max_jobs) {
                entry.assignment.transition(AssignmentStatus::Accepted, now)?;
                accepted.push((entry.assignment.clone(), entry.job.clone()));
            }
            accepted
        };

        for (assignment, _) in &accepted {
            self.persist(assignment);
            info!(assignment_id = %assignment.assignment_id, agent_id = %agent_id, "assignment accepted");
        }
        Ok(accepted)
    }

    /// The agent has started running an accepted assignment.
    pub fn mark_running(
        &self,
        agent_id: &AgentId,
        assignment_id: &AssignmentId,
        now: DateTime<Utc>,
    ) -> Result<AgentJobAssignment> {
        let assignment = {
            let mut state = self.state.lock().unwrap();
            let entry = owned_entry(&mut state, agent_id, assignment_id)?;
            entry.assignment.transition(AssignmentStatus::Running, now)?;
            entry.assignment.clone()
        };
        self.persist(&assignment);
        Ok(assignment)
    }

    /// Record the agent's final result and wake the dispatching execution.
    ///
    /// A result for an assignment that already ended (e.g. timed out) is
    /// rejected and changes nothing.
    #[instrument(skip(self, report), fields(status = %report.status))]
    pub fn submit_result(
        &self,
        agent_id: &AgentId,
        assignment_id: &AssignmentId,
        report: ResultReport,
        now: DateTime<Utc>,
    ) -> Result<AgentJobAssignment> {
        if !report.status.is_terminal() {
            return Err(AgentError::InvalidRequest(format!(
                "result status must be terminal, got {}",
                report.status
            )));
        }
        let next = match report.status {
            JobStatus::Success | JobStatus::PartialSuccess => AssignmentStatus::Completed,
            JobStatus::Cancelled => AssignmentStatus::Cancelled,
            _ => AssignmentStatus::Failed,
        };

        let (assignment, notify) = {
            let mut state = self.state.lock().unwrap();
            let entry = owned_entry(&mut state, agent_id, assignment_id)?;
            entry.assignment.transition(next, now)?;
            entry.assignment.error_message = report.error_message.clone();
            let assignment = entry.assignment.clone();
            let notify = entry.notify.take();
            state.live.remove(&assignment.execution_id);
            (assignment, notify)
        };

        self.registry.release(agent_id, assignment.completed_at);
        self.persist(&assignment);
        info!(assignment_id = %assignment_id, agent_id = %agent_id, status = %assignment.status, "assignment finished");

        if let Some(tx) = notify {
            let _ = tx.send(AssignmentOutcome::Completed {
                status: report.status,
                steps: report.steps,
                error: report.error_message,
            });
        }
        Ok(assignment)
    }

    /// Cancel the live assignment of `execution_id`, if any.
    ///
    /// The agent learns about it on its next heartbeat.
    pub fn cancel_execution(&self, execution_id: &ExecutionId, now: DateTime<Utc>) -> bool {
        let id = self.state.lock().unwrap().live.get(execution_id).cloned();
        match id {
            Some(id) => self
                .end(&id, AssignmentStatus::Cancelled, "execution cancelled".to_string(), now)
                .is_ok(),
            None => false,
        }
    }

    /// Time out one live assignment.
    pub fn expire(
        &self,
        assignment_id: &AssignmentId,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<AgentJobAssignment> {
        self.end(assignment_id, AssignmentStatus::Timeout, reason.into(), now)
    }

    /// One maintenance pass at `now`.
    ///
    /// Marks silent agents offline, then times out assignments that were never
    /// accepted, whose agent went offline, or that outlived `timeout_minutes`.
    /// Returns the number of assignments timed out.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        self.registry.reap_at(now);
        let offline_after = self.registry.offline_after();

        let stale: Vec<(AssignmentId, String)> = {
            let mut state = self.state.lock().unwrap();
            let retention = Duration::minutes(TERMINAL_RETENTION_MINUTES);
            state.assignments.retain(|_, e| {
                e.assignment
                    .completed_at
                    .map_or(true, |done| now.signed_duration_since(done) < retention)
            });

            state
                .live
                .values()
                .filter_map(|id| state.assignments.get(id))
                .filter_map(|e| {
                    let a = &e.assignment;
                    let overall = Duration::minutes(i64::try_from(a.timeout_minutes).unwrap_or(i64::MAX / 60_000));
                    let reason = match a.status {
                        AssignmentStatus::Assigned
                            if now.signed_duration_since(a.assigned_at) > self.accept_timeout =>
                        {
                            format!("not accepted within {}s", self.accept_timeout.num_seconds())
                        }
                        AssignmentStatus::Accepted | AssignmentStatus::Running => {
                            let alive = self
                                .registry
                                .get(&a.agent_id)
                                .is_some_and(|agent| agent.is_fresh(now, offline_after));
                            if !alive {
                                format!("agent {} went offline", a.agent_id)
                            } else if now.signed_duration_since(a.assigned_at) > overall {
                                format!("exceeded {} minute assignment timeout", a.timeout_minutes)
                            } else {
                                return None;
                            }
                        }
                        _ => return None,
                    };
                    Some((a.assignment_id.clone(), reason))
                })
                .collect()
        };

        let mut expired = 0;
        for (id, reason) in stale {
            match self.end(&id, AssignmentStatus::Timeout, reason, now) {
                Ok(a) => {
                    warn!(assignment_id = %id, agent_id = %a.agent_id, error = ?a.error_message, "assignment timed out");
                    expired += 1;
                }
                Err(e) => error!(assignment_id = %id, "failed to expire assignment: {e}"),
            }
        }
        expired
    }

    /// Assignments revoked from `agent_id` since its last heartbeat.
    pub fn take_revoked(&self, agent_id: &AgentId) -> Vec<AssignmentId> {
        let mut ids: Vec<AssignmentId> = self
            .state
            .lock()
            .unwrap()
            .revoked
            .remove(agent_id)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    pub fn get(&self, assignment_id: &AssignmentId) -> Result<Option<AgentJobAssignment>> {
        if let Some(e) = self.state.lock().unwrap().assignments.get(assignment_id) {
            return Ok(Some(e.assignment.clone()));
        }
        match &self.store {
            Some(store) => store.load_assignment(assignment_id),
            None => Ok(None),
        }
    }

    /// Live (non-terminal) assignments, oldest first.
    pub fn live(&self) -> Vec<AgentJobAssignment> {
        let state = self.state.lock().unwrap();
        let mut live: Vec<AgentJobAssignment> = state
            .live
            .values()
            .filter_map(|id| state.assignments.get(id))
            .map(|e| e.assignment.clone())
            .collect();
        live.sort_by(|a, b| a.assigned_at.cmp(&b.assigned_at));
        live
    }

    /// Every assignment made for one execution, in dispatch order.
    pub fn history(&self, execution_id: &ExecutionId) -> Result<Vec<AgentJobAssignment>> {
        if let Some(store) = &self.store {
            return store.assignments_for_execution(execution_id);
        }
        let mut all: Vec<AgentJobAssignment> = self
            .state
            .lock()
            .unwrap()
            .assignments
            .values()
            .filter(|e| e.assignment.execution_id == *execution_id)
            .map(|e| e.assignment.clone())
            .collect();
        all.sort_by_key(|a| a.attempt);
        Ok(all)
    }

    /// Run [`sweep_at`](Self::sweep_at) on an interval until `shutdown` broadcasts `true`.
    pub async fn run_maintenance(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(every = ?self.sweep_interval, "assignment sweeper started");
        let mut interval = tokio::time::interval(self.sweep_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep_at(Utc::now());
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("assignment sweeper shutting down");
                        break;
                    }
                }
            }
        }
    }

    // ---- private helpers ----

    /// Move a live assignment to a terminal status without a result.
    fn end(
        &self,
        assignment_id: &AssignmentId,
        status: AssignmentStatus,
        reason: String,
        now: DateTime<Utc>,
    ) -> Result<AgentJobAssignment> {
        let (assignment, notify) = {
            let mut guard = self.state.lock().unwrap();
            let state = &mut *guard;
            let entry = state
                .assignments
                .get_mut(assignment_id)
                .ok_or_else(|| not_found(assignment_id))?;
            entry.assignment.transition(status, now)?;
            entry.assignment.error_message = Some(reason.clone());
            let assignment = entry.assignment.clone();
            let notify = entry.notify.take();
            state.live.remove(&assignment.execution_id);
            state
                .revoked
                .entry(assignment.agent_id.clone())
                .or_default()
                .insert(assignment.assignment_id.clone());
            (assignment, notify)
        };

        self.registry.release(&assignment.agent_id, None);
        self.persist(&assignment);
        if let Some(tx) = notify {
            let _ = tx.send(AssignmentOutcome::Lost { status, reason });
        }
        Ok(assignment)
    }

    fn persist(&self, assignment: &AgentJobAssignment) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save_assignment(assignment) {
                warn!(assignment_id = %assignment.assignment_id, err = %e, "failed to persist assignment");
            }
        }
    }
}

fn owned_entry<'a>(
    state: &'a mut DispatchState,
    agent_id: &AgentId,
    assignment_id: &AssignmentId,
) -> Result<&'a mut Entry> {
    let entry = state
        .assignments
        .get_mut(assignment_id)
        .ok_or_else(|| not_found(assignment_id))?;
    if entry.assignment.agent_id != *agent_id {
        return Err(AgentError::Forbidden(format!(
            "assignment {assignment_id} belongs to another agent"
        )));
    }
    Ok(entry)
}

fn not_found(assignment_id: &AssignmentId) -> AgentError {
    AgentError::NotFound {
        kind: "assignment",
        id: assignment_id.to_string(),
    }
}
