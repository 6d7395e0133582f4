use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tempo_core::StepConfig;
use tokio_util::sync::CancellationToken;

use super::{parse_config, step_timeout};
use crate::context::ExecutionContext;
use crate::error::{Result, StepError};
use crate::step::Step;

const MAX_DELAY_MS: u64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Deserialize)]
struct DelayConfig {
    duration_ms: u64,
}

/// Waits for a fixed time. Stops early when cancelled.
pub struct DelayStep {
    duration: Duration,
    timeout: Option<Duration>,
    stop: CancellationToken,
}

impl DelayStep {
    pub const TYPE: &'static str = "delay";

    pub fn from_config(cfg: &StepConfig) -> Result<Self> {
        let parsed: DelayConfig = parse_config(cfg)?;
        Ok(Self {
            duration: Duration::from_millis(parsed.duration_ms),
            timeout: step_timeout(cfg),
            stop: CancellationToken::new(),
        })
    }
}

#[async_trait]
impl Step for DelayStep {
    fn step_type(&self) -> &'static str {
        Self::TYPE
    }

    fn validate_config(&self) -> Vec<String> {
        let ms = self.duration.as_millis() as u64;
        if ms > MAX_DELAY_MS {
            vec![format!("duration_ms {ms} exceeds one day")]
        } else {
            Vec::new()
        }
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

    async fn execute(&self, _ctx: &ExecutionContext) -> Result<Value> {
        tokio::select! {
            _ = tokio::time::sleep(self.duration) => {
                Ok(json!({"slept_ms": self.duration.as_millis() as u64}))
            }
            _ = self.stop.cancelled() => Err(StepError::Cancelled),
        }
    }
}
