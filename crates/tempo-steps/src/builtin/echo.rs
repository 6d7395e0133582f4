use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tempo_core::StepConfig;

use super::parse_config;
use crate::context::ExecutionContext;
use crate::error::{Result, StepError};
use crate::step::Step;

#[derive(Debug, Deserialize)]
struct EchoConfig {
    message: String,
}

/// Emits a message, filling `{{step_id}}` or `{{step_id.field}}` from earlier outputs.
pub struct EchoStep {
    template: String,
}

impl EchoStep {
    pub const TYPE: &'static str = "echo";

    pub fn from_config(cfg: &StepConfig) -> Result<Self> {
        let parsed: EchoConfig = parse_config(cfg)?;
        Ok(Self {
            template: parsed.message,
        })
    }
}

#[async_trait]
impl Step for EchoStep {
    fn step_type(&self) -> &'static str {
        Self::TYPE
    }

    fn validate_config(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let mut rest = self.template.as_str();
        while let Some(open) = rest.find("{{") {
            match rest[open + 2..].find("}}") {
                Some(close) if !rest[open + 2..open + 2 + close].trim().is_empty() => {
                    rest = &rest[open + 2 + close + 2..];
                }
                Some(_) => {
                    errors.push("empty placeholder '{{}}'".to_string());
                    break;
                }
                None => {
                    errors.push("unterminated placeholder".to_string());
                    break;
                }
            }
        }
        errors
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<Value> {
        let message = render(&self.template, ctx)?;
        Ok(json!({ "message": message }))
    }
}

fn render(template: &str, ctx: &ExecutionContext) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let close = after
            .find("}}")
            .ok_or_else(|| StepError::Failed("unterminated placeholder".to_string()))?;
        out.push_str(&lookup(after[..close].trim(), ctx)?);
        rest = &after[close + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

fn lookup(reference: &str, ctx: &ExecutionContext) -> Result<String> {
    let mut parts = reference.split('.');
    let step_id = parts.next().unwrap_or_default();
    let mut value = ctx
        .output(step_id)
        .ok_or_else(|| StepError::Failed(format!("no output recorded for step '{step_id}'")))?;

    for field in parts {
        value = value
            .get(field)
            .ok_or_else(|| StepError::Failed(format!("output of '{step_id}' has no field '{field}'")))?;
    }

    Ok(match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}
