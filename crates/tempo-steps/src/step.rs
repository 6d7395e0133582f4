use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::context::ExecutionContext;
use crate::error::Result;

/// Contract every step type implements.
///
/// `execute` returns the step's output on success. Timing, timeout
/// enforcement and conversion into a `StepExecutionResult` are handled by
/// [`crate::runner::run_step`].
#[async_trait]
pub trait Step: Send + Sync {
    /// Registry key for this step type (e.g. "command").
    fn step_type(&self) -> &'static str;

    /// Semantic checks beyond parsing. Empty means valid.
    fn validate_config(&self) -> Vec<String>;

    /// Step-specific timeout; `None` defers to the engine default.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    fn supports_cancel(&self) -> bool {
        false
    }

    /// Ask an in-flight `execute` to stop. Only called when `supports_cancel` is true.
    fn cancel(&self) {}

    async fn execute(&self, ctx: &ExecutionContext) -> Result<Value>;
}
