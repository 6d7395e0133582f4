use std::collections::BTreeMap;

use tempo_core::{JobDefinition, Result, StepConfig, TempoError};

use crate::builtin::{CommandStep, DelayStep, EchoStep, HttpStep};
use crate::error::StepError;
use crate::step::Step;

/// Builds a step from its configuration. Parsing errors surface as `InvalidConfig`.
pub type StepConstructor = fn(&StepConfig) -> std::result::Result<Box<dyn Step>, StepError>;

/// Maps step-type identifiers to constructors.
///
/// Built-ins are registered at compile time by [`StepRegistry::builtin`];
/// embedders can add their own types with [`register`](Self::register).
#[derive(Clone)]
pub struct StepRegistry {
    constructors: BTreeMap<&'static str, StepConstructor>,
}

impl StepRegistry {
    pub fn empty() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }

    /// Registry with every built-in step type.
    pub fn builtin() -> Self {
        let mut reg = Self::empty();
        reg.register(CommandStep::TYPE, command);
        reg.register(HttpStep::TYPE, http);
        reg.register(DelayStep::TYPE, delay);
        reg.register(EchoStep::TYPE, echo);
        reg
    }

    pub fn register(&mut self, step_type: &'static str, ctor: StepConstructor) {
        self.constructors.insert(step_type, ctor);
    }

    pub fn contains(&self, step_type: &str) -> bool {
        self.constructors.contains_key(step_type)
    }

    pub fn types(&self) -> Vec<&'static str> {
        self.constructors.keys().copied().collect()
    }

    /// Construct and validate one step.
    pub fn create(&self, cfg: &StepConfig) -> Result<Box<dyn Step>> {
        self.build(cfg)
            .map_err(|errors| TempoError::Configuration { errors })
    }

    /// Validate the whole job and build every step, collecting all problems.
    ///
    /// Runs before the first step so a bad definition never half-executes.
    pub fn build_job(&self, job: &JobDefinition) -> Result<Vec<Box<dyn Step>>> {
        let mut errors = job.validate();
        let mut steps = Vec::with_capacity(job.steps.len());

        for cfg in &job.steps {
            match self.build(cfg) {
                Ok(step) => steps.push(step),
                Err(mut step_errors) => errors.append(&mut step_errors),
            }
        }

        if errors.is_empty() {
            Ok(steps)
        } else {
            Err(TempoError::Configuration { errors })
        }
    }

    // ---- private helpers ----

    fn build(&self, cfg: &StepConfig) -> std::result::Result<Box<dyn Step>, Vec<String>> {
        let ctor = self.constructors.get(cfg.step_type.as_str()).ok_or_else(|| {
            vec![format!(
                "step '{}': unknown step type '{}'",
                cfg.step_id, cfg.step_type
            )]
        })?;

        let step = ctor(cfg).map_err(|e| vec![format!("step '{}': {e}", cfg.step_id)])?;
        let problems = step.validate_config();
        if problems.is_empty() {
            Ok(step)
        } else {
            Err(problems
                .into_iter()
                .map(|p| format!("step '{}': {p}", cfg.step_id))
                .collect())
        }
    }
}

fn command(cfg: &StepConfig) -> std::result::Result<Box<dyn Step>, StepError> {
    Ok(Box::new(CommandStep::from_config(cfg)?))
}

fn http(cfg: &StepConfig) -> std::result::Result<Box<dyn Step>, StepError> {
    Ok(Box::new(HttpStep::from_config(cfg)?))
}

fn delay(cfg: &StepConfig) -> std::result::Result<Box<dyn Step>, StepError> {
    Ok(Box::new(DelayStep::from_config(cfg)?))
}

fn echo(cfg: &StepConfig) -> std::result::Result<Box<dyn Step>, StepError> {
    Ok(Box::new(EchoStep::from_config(cfg)?))
}

impl Default for StepRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builtin_types_are_registered() {
        let reg = StepRegistry::builtin();
        assert_eq!(reg.types(), vec!["command", "delay", "echo", "http"]);
    }

    #[test]
    fn unknown_type_fails_fast() {
        let reg = StepRegistry::builtin();
        let cfg = StepConfig::new("q", "sql_query", json!({"sql": "select 1"}));
        let err = reg.create(&cfg).err().unwrap();
        assert!(err.to_string().contains("unknown step type 'sql_query'"));
        assert_eq!(err.code(), "CONFIGURATION_ERROR");
    }

    #[test]
    fn build_job_collects_step_and_job_errors() {
        let reg = StepRegistry::builtin();
        let job = JobDefinition::new(
            "bad",
            "UTC",
            vec![
                StepConfig::new("a", "command", json!({"command": ""})),
                StepConfig::new("b", "nope", json!({})),
                StepConfig::new("b", "delay", json!({"duration_ms": 5})),
            ],
        );
        let TempoError::Configuration { errors } = reg.build_job(&job).err().unwrap() else {
            panic!("expected configuration error");
        };
        assert!(errors.iter().any(|e| e.contains("duplicate step_id 'b'")));
        assert!(errors.iter().any(|e| e.starts_with("step 'a'")));
        assert!(errors.iter().any(|e| e.contains("unknown step type 'nope'")));
    }

    #[test]
    fn valid_job_builds_every_step() {
        let reg = StepRegistry::builtin();
        let job = JobDefinition::new(
            "ok",
            "Europe/London",
            vec![
                StepConfig::new("a", "echo", json!({"message": "hi"})),
                StepConfig::new("b", "delay", json!({"duration_ms": 1})),
            ],
        );
        let steps = reg.build_job(&job).unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[1].step_type(), "delay");
    }
}
