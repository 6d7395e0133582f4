//! Built-in step types.

mod command;
mod delay;
mod echo;
mod http;

pub use command::CommandStep;
pub use delay::DelayStep;
pub use echo::EchoStep;
pub use http::HttpStep;

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tempo_core::StepConfig;

use crate::error::StepError;

/// Deserialize a step's config map into its typed settings.
fn parse_config<T: DeserializeOwned>(cfg: &StepConfig) -> Result<T, StepError> {
    serde_json::from_value(Value::Object(cfg.config.clone()))
        .map_err(|e| StepError::InvalidConfig(e.to_string()))
}

fn step_timeout(cfg: &StepConfig) -> Option<Duration> {
    cfg.timeout.map(Duration::from_secs)
}
