use std::collections::HashMap;

use serde_json::Value;
use tempo_core::{ExecutionId, JobId};
use tokio_util::sync::CancellationToken;

/// Per-attempt state shared by a job's steps.
///
/// Steps read earlier outputs through [`output`](Self::output); the sequence
/// runner records each successful step's output after it finishes. Nothing
/// else is shared between steps.
#[derive(Debug)]
pub struct ExecutionContext {
    execution_id: ExecutionId,
    job_id: JobId,
    attempt: u32,
    outputs: HashMap<String, Value>,
    cancel: CancellationToken,
}

impl ExecutionContext {
    pub fn new(execution_id: ExecutionId, job_id: JobId, attempt: u32, cancel: CancellationToken) -> Self {
        Self {
            execution_id,
            job_id,
            attempt,
            outputs: HashMap::new(),
            cancel,
        }
    }

    pub fn execution_id(&self) -> &ExecutionId {
        &self.execution_id
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn output(&self, step_id: &str) -> Option<&Value> {
        self.outputs.get(step_id)
    }

    pub fn outputs(&self) -> &HashMap<String, Value> {
        &self.outputs
    }

    pub fn set_output(&mut self, step_id: impl Into<String>, value: Value) {
        self.outputs.insert(step_id.into(), value);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}
