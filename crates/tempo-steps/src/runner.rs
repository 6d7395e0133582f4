use std::time::Duration;

use chrono::Utc;
use tempo_core::{StepExecutionResult, StepStatus};
use tracing::{debug, warn};

use crate::context::ExecutionContext;
use crate::error::StepError;
use crate::step::Step;

/// Run one step under `limit` and record what happened.
///
/// A step that overruns `limit` is dropped, asked to `cancel()` if it
/// supports it, and recorded as `Timeout`.
pub async fn run_step(
    step_id: &str,
    step: &dyn Step,
    ctx: &ExecutionContext,
    limit: Duration,
) -> StepExecutionResult {
    let attempt = ctx.attempt();
    let start = Utc::now();
    debug!(execution_id = %ctx.execution_id(), step_id, step_type = step.step_type(), "step started");

    let outcome = tokio::time::timeout(limit, step.execute(ctx)).await;
    let end = Utc::now();
    let base = StepExecutionResult::new(step_id, attempt, StepStatus::Running).timed(start, end);

    match outcome {
        Ok(Ok(output)) => {
            debug!(step_id, ms = base.duration_ms, "step succeeded");
            StepExecutionResult {
                status: StepStatus::Success,
                ..base
            }
            .with_output(output)
        }
        Ok(Err(StepError::Cancelled)) => StepExecutionResult {
            status: StepStatus::Cancelled,
            ..base
        }
        .with_error("step cancelled"),
        Ok(Err(e)) => {
            warn!(execution_id = %ctx.execution_id(), step_id, err = %e, "step failed");
            StepExecutionResult {
                status: StepStatus::Failed,
                ..base
            }
            .with_error(e.to_string())
        }
        Err(_elapsed) => {
            if step.supports_cancel() {
                step.cancel();
            }
            warn!(execution_id = %ctx.execution_id(), step_id, limit_ms = limit.as_millis() as u64, "step timed out");
            StepExecutionResult {
                status: StepStatus::Timeout,
                ..base
            }
            .with_error(format!("step exceeded timeout of {}s", limit.as_secs_f64()))
        }
    }
}
