use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tempo_agents::{AgentError, AssignmentOutcome, AssignmentStatus, Dispatcher};
use tempo_core::{AgentId, AssignmentId, ExecutionId, JobDefinition, JobStatus, StepExecutionResult, TempoError};
use tempo_steps::job_deadline;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::engine::AttemptOutcome;

/// Runs `execution_type = agent` attempts through the dispatcher.
pub struct RemoteExecutor {
    dispatcher: Arc<Dispatcher>,
    max_assignment_attempts: u32,
}

impl RemoteExecutor {
    pub fn new(dispatcher: Arc<Dispatcher>, max_assignment_attempts: u32) -> Self {
        Self {
            dispatcher,
            max_assignment_attempts: max_assignment_attempts.max(1),
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// One job attempt on a remote agent.
    ///
    /// An assignment lost to a timeout or a silent agent is reassigned,
    /// preferring agents that have not had it yet, until
    /// `max_assignment_attempts` is spent. The job's own timeout covers the
    /// whole attempt including reassignments.
    #[instrument(skip(self, job, cancel), fields(job = %job.name))]
    pub async fn run(
        &self,
        job: &JobDefinition,
        execution_id: &ExecutionId,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> AttemptOutcome {
        let deadline = job_deadline(job);
        let mut tried = HashSet::new();
        let mut last_loss = None;
        let mut last_assignment = None;

        for round in 1..=self.max_assignment_attempts {
            if cancel.is_cancelled() {
                return cancelled(job, attempt, last_assignment);
            }

            let prior = self
                .dispatcher
                .history(execution_id)
                .map(|h| h.len())
                .unwrap_or(0);
            let assignment_attempt = u32::try_from(prior).unwrap_or(u32::MAX - 1) + 1;
            let (assignment, outcome) =
                match self
                    .dispatcher
                    .dispatch(job, execution_id, assignment_attempt, &tried, Utc::now())
                {
                    Ok(pair) => pair,
                    Err(AgentError::NoAgentAvailable(reason)) => {
                        let reason = match last_loss {
                            Some(loss) => format!("{reason} (after: {loss})"),
                            None => reason,
                        };
                        return failed(job, attempt, TempoError::NoAgentAvailable(reason), last_assignment);
                    }
                    Err(e) => return failed(job, attempt, e.into(), last_assignment),
                };
            tried.insert(assignment.agent_id.clone());
            let placed = Some((assignment.agent_id.clone(), assignment.assignment_id.clone()));
            last_assignment = placed.clone();

            tokio::select! {
                outcome = outcome => match outcome {
                    Ok(AssignmentOutcome::Completed { status, steps, error }) => {
                        info!(agent_id = %assignment.agent_id, %status, "remote attempt finished");
                        return AttemptOutcome {
                            status,
                            steps: fold_steps(job, attempt, steps),
                            error,
                            placed,
                        };
                    }
                    Ok(AssignmentOutcome::Lost { status: AssignmentStatus::Cancelled, .. }) => {
                        return cancelled(job, attempt, placed);
                    }
                    Ok(AssignmentOutcome::Lost { status, reason }) => {
                        warn!(
                            agent_id = %assignment.agent_id,
                            round,
                            %status,
                            %reason,
                            "assignment lost, reassigning"
                        );
                        last_loss = Some(reason);
                    }
                    Err(_) => {
                        return failed(
                            job,
                            attempt,
                            TempoError::Internal("dispatcher dropped the assignment".to_string()),
                            placed,
                        );
                    }
                },
                _ = cancel.cancelled() => {
                    self.dispatcher.cancel_execution(execution_id, Utc::now());
                    return cancelled(job, attempt, placed);
                }
                _ = tokio::time::sleep_until(deadline) => {
                    let reason = format!("job exceeded its {}s timeout", job.timeout);
                    if let Err(e) = self.dispatcher.expire(&assignment.assignment_id, reason.clone(), Utc::now()) {
                        warn!(assignment_id = %assignment.assignment_id, "could not expire assignment: {e}");
                    }
                    return AttemptOutcome {
                        status: JobStatus::Timeout,
                        steps: fold_steps(job, attempt, Vec::new()),
                        error: Some(reason),
                        placed,
                    };
                }
            }
        }

        let reason = format!(
            "gave up after {} assignment attempts{}",
            self.max_assignment_attempts,
            last_loss.map(|l| format!(" (last: {l})")).unwrap_or_default()
        );
        failed(job, attempt, TempoError::NoAgentAvailable(reason), last_assignment)
    }
}

/// Align reported steps with the definition: one entry per defined step, in
/// order, anything unreported recorded as skipped.
fn fold_steps(
    job: &JobDefinition,
    attempt: u32,
    mut reported: Vec<StepExecutionResult>,
) -> Vec<StepExecutionResult> {
    job.steps
        .iter()
        .map(|cfg| {
            match reported.iter().position(|s| s.step_id == cfg.step_id) {
                Some(i) => StepExecutionResult {
                    attempt,
                    ..reported.swap_remove(i)
                },
                None => StepExecutionResult::skipped(cfg.step_id.clone(), attempt),
            }
        })
        .collect()
}

fn failed(
    job: &JobDefinition,
    attempt: u32,
    error: TempoError,
    placed: Option<(AgentId, AssignmentId)>,
) -> AttemptOutcome {
    AttemptOutcome {
        status: JobStatus::Failed,
        steps: fold_steps(job, attempt, Vec::new()),
        error: Some(error.to_string()),
        placed,
    }
}

fn cancelled(
    job: &JobDefinition,
    attempt: u32,
    placed: Option<(AgentId, AssignmentId)>,
) -> AttemptOutcome {
    AttemptOutcome {
        status: JobStatus::Cancelled,
        steps: fold_steps(job, attempt, Vec::new()),
        error: Some("execution cancelled".to_string()),
        placed,
    }
}
