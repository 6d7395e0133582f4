use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tempo_core::StepConfig;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{parse_config, step_timeout};
use crate::context::ExecutionContext;
use crate::error::{Result, StepError};
use crate::step::Step;
use crate::truncate::{truncate_middle, DEFAULT_MAX_CHARS};

#[derive(Debug, Deserialize)]
struct CommandConfig {
    command: String,
    #[serde(default)]
    working_dir: Option<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default = "default_max_chars")]
    max_output_chars: usize,
}

fn default_max_chars() -> usize {
    DEFAULT_MAX_CHARS
}

/// Runs a shell command through `sh -c`. A non-zero exit fails the step.
pub struct CommandStep {
    config: CommandConfig,
    timeout: Option<Duration>,
    stop: CancellationToken,
}

impl CommandStep {
    pub const TYPE: &'static str = "command";

    pub fn from_config(cfg: &StepConfig) -> Result<Self> {
        Ok(Self {
            config: parse_config(cfg)?,
            timeout: step_timeout(cfg),
            stop: CancellationToken::new(),
        })
    }
}

#[async_trait]
impl Step for CommandStep {
    fn step_type(&self) -> &'static str {
        Self::TYPE
    }

    fn validate_config(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.config.command.trim().is_empty() {
            errors.push("command must not be empty".to_string());
        }
        if self.config.max_output_chars == 0 {
            errors.push("max_output_chars must be greater than zero".to_string());
        }
        errors
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn supports_cancel(&self) -> bool {
        true
    }

    fn cancel(&self) {
        self.stop.cancel();
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<Value> {
        debug!(execution_id = %ctx.execution_id(), command = %self.config.command, "exec");

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&self.config.command)
            .envs(&self.config.env)
            .env("TEMPO_EXECUTION_ID", ctx.execution_id().as_str())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // The child dies with the future on timeout or cancel.
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }

        let child = cmd.spawn()?;
        let output = tokio::select! {
            out = child.wait_with_output() => out?,
            _ = self.stop.cancelled() => return Err(StepError::Cancelled),
        };

        let exit_code = output.status.code().unwrap_or(-1);
        let max = self.config.max_output_chars;
        let stdout = truncate_middle(String::from_utf8_lossy(&output.stdout).trim_end(), max);
        let stderr = truncate_middle(String::from_utf8_lossy(&output.stderr).trim_end(), max);

        if exit_code != 0 {
            return Err(StepError::NonZeroExit {
                code: exit_code,
                stderr,
            });
        }

        Ok(json!({
            "exit_code": exit_code,
            "stdout": stdout,
            "stderr": stderr,
        }))
    }
}
