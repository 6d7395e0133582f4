use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use tempo_core::StepConfig;
use tracing::debug;

use super::{parse_config, step_timeout};
use crate::context::ExecutionContext;
use crate::error::{Result, StepError};
use crate::step::Step;
use crate::truncate::{truncate_middle, DEFAULT_MAX_CHARS};

#[derive(Debug, Deserialize)]
struct HttpConfig {
    url: String,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    body: Option<Value>,
    /// Exact status to require. Any 2xx passes when unset.
    #[serde(default)]
    expected_status: Option<u16>,
}

fn default_method() -> String {
    "GET".to_string()
}

/// Issues one HTTP request and reports status and body.
pub struct HttpStep {
    config: HttpConfig,
    timeout: Option<Duration>,
    client: reqwest::Client,
}

impl HttpStep {
    pub const TYPE: &'static str = "http";

    pub fn from_config(cfg: &StepConfig) -> Result<Self> {
        Ok(Self {
            config: parse_config(cfg)?,
            timeout: step_timeout(cfg),
            client: reqwest::Client::new(),
        })
    }

    fn method(&self) -> std::result::Result<Method, String> {
        Method::from_bytes(self.config.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| format!("invalid HTTP method '{}'", self.config.method))
    }
}

#[async_trait]
impl Step for HttpStep {
    fn step_type(&self) -> &'static str {
        Self::TYPE
    }

    fn validate_config(&self) -> Vec<String> {
        let mut errors = Vec::new();
        match Url::parse(&self.config.url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {}
            Ok(url) => errors.push(format!("unsupported URL scheme '{}'", url.scheme())),
            Err(e) => errors.push(format!("invalid url: {e}")),
        }
        if let Err(e) = self.method() {
            errors.push(e);
        }
        if let Some(code) = self.config.expected_status {
            if !(100..=599).contains(&code) {
                errors.push(format!("expected_status {code} is not an HTTP status"));
            }
        }
        errors
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<Value> {
        let method = self.method().map_err(StepError::InvalidConfig)?;
        debug!(execution_id = %ctx.execution_id(), %method, url = %self.config.url, "http step");

        let mut req = self.client.request(method, &self.config.url);
        for (name, value) in &self.config.headers {
            req = req.header(name, value);
        }
        if let Some(body) = &self.config.body {
            req = req.json(body);
        }

        let resp = req.send().await?;
        let status = resp.status();
        let text = resp.text().await?;
        let body = truncate_middle(&text, DEFAULT_MAX_CHARS);

        let ok = match self.config.expected_status {
            Some(code) => status.as_u16() == code,
            None => status.is_success(),
        };
        if !ok {
            return Err(StepError::Failed(format!(
                "unexpected status {}: {}",
                status.as_u16(),
                truncate_middle(&text, 500)
            )));
        }

        // Hand structured bodies to later steps as JSON when possible.
        let parsed = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(body));
        Ok(json!({ "status": status.as_u16(), "body": parsed }))
    }
}
