use std::time::Duration;

use tempo_core::{JobDefinition, JobStatus, StepExecutionResult, StepStatus};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::context::ExecutionContext;
use crate::runner::run_step;
use crate::step::Step;

/// What one attempt of a job's step sequence produced.
#[derive(Debug, Clone)]
pub struct SequenceOutcome {
    /// One of `Success`, `PartialSuccess`, `Failed`, `Timeout` or `Cancelled`.
    pub status: JobStatus,
    /// Exactly one entry per defined step; steps that never ran are `Skipped`.
    pub steps: Vec<StepExecutionResult>,
    pub error: Option<String>,
}

/// Run `steps` (built from `job.steps`, same order) strictly one after another.
///
/// Cancellation is checked between steps only; a running step finishes or
/// hits its own timeout. Each step's limit is its own timeout clamped to
/// what remains of the job deadline.
pub async fn run_sequence(
    job: &JobDefinition,
    steps: &[Box<dyn Step>],
    ctx: &mut ExecutionContext,
    default_step_timeout: Duration,
) -> SequenceOutcome {
    let attempt = ctx.attempt();
    let deadline = job_deadline(job);
    let mut results = Vec::with_capacity(job.steps.len());
    let mut tolerated = 0usize;
    let mut halt: Option<(JobStatus, String)> = None;

    for (cfg, step) in job.steps.iter().zip(steps) {
        if ctx.is_cancelled() {
            halt = Some((
                JobStatus::Cancelled,
                format!("cancelled before step '{}'", cfg.step_id),
            ));
            break;
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            halt = Some((JobStatus::Timeout, job_timeout_message(job, &cfg.step_id)));
            break;
        }

        let own = cfg
            .timeout
            .map(Duration::from_secs)
            .or_else(|| step.timeout())
            .unwrap_or(default_step_timeout);
        let capped_by_job = remaining < own;

        let result = run_step(&cfg.step_id, step.as_ref(), ctx, own.min(remaining)).await;
        let status = result.status;
        let error = result.error_message.clone();
        if status == StepStatus::Success {
            if let Some(output) = &result.output {
                ctx.set_output(cfg.step_id.clone(), output.clone());
            }
        }
        results.push(result);

        match status {
            StepStatus::Success => {}
            StepStatus::Timeout if capped_by_job => {
                halt = Some((JobStatus::Timeout, job_timeout_message(job, &cfg.step_id)));
                break;
            }
            StepStatus::Cancelled => {
                halt = Some((
                    JobStatus::Cancelled,
                    format!("step '{}' was cancelled", cfg.step_id),
                ));
                break;
            }
            _ if cfg.continue_on_failure => {
                tolerated += 1;
                info!(
                    execution_id = %ctx.execution_id(),
                    step_id = %cfg.step_id,
                    "step failure tolerated (continue_on_failure)"
                );
            }
            _ => {
                let reason = error.unwrap_or_else(|| status.to_string());
                halt = Some((
                    JobStatus::Failed,
                    format!("step '{}' {}: {reason}", cfg.step_id, status),
                ));
                break;
            }
        }
    }

    // Whatever did not run is recorded as skipped so every step has a row.
    for cfg in job.steps.iter().skip(results.len()) {
        results.push(StepExecutionResult::skipped(cfg.step_id.clone(), attempt));
    }

    let (status, error) = match halt {
        Some((status, msg)) => {
            warn!(execution_id = %ctx.execution_id(), %status, error = %msg, "step sequence halted");
            (status, Some(msg))
        }
        None if tolerated > 0 => (
            JobStatus::PartialSuccess,
            Some(format!("{tolerated} step(s) failed with continue_on_failure")),
        ),
        None => (JobStatus::Success, None),
    };

    SequenceOutcome {
        status,
        steps: results,
        error,
    }
}

/// When the current attempt of `job` must be over.
///
/// A timeout too large for the clock saturates to a deadline decades away.
pub fn job_deadline(job: &JobDefinition) -> Instant {
    let now = Instant::now();
    now.checked_add(job.timeout_duration())
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

const FAR_FUTURE: Duration = Duration::from_secs(30 * 365 * 24 * 60 * 60);

fn job_timeout_message(job: &JobDefinition, step_id: &str) -> String {
    format!("job exceeded its {}s timeout at step '{step_id}'", job.timeout)
}
