//! Task registry: task names mapped to executors and compiled schemas.
//!
//! Registration fails fast. A duplicate name, an uncompilable schema or a
//! command task without a configured command is a configuration error raised
//! before any run starts.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::core::schema::SchemaValidator;
use crate::core::task::{TaskDefinition, TaskKind, TaskPayload};
use crate::error::{OrchestratorError, Result, ValidationError};
use crate::io::config::ExecutorsConfig;
use crate::io::executor::{CommandExecutor, TaskExecutor, TaskRequest};

/// A definition together with its executor and compiled validators.
pub struct RegisteredTask {
    definition: TaskDefinition,
    executor: Arc<dyn TaskExecutor>,
    output: SchemaValidator,
    input: Option<SchemaValidator>,
}

impl RegisteredTask {
    pub fn definition(&self) -> &TaskDefinition {
        &self.definition
    }

    pub fn executor(&self) -> &dyn TaskExecutor {
        self.executor.as_ref()
    }

    /// Check a payload's kind and, when declared, its arguments' shape.
    pub fn check_input(&self, payload: &TaskPayload) -> Result<(), ValidationError> {
        let name = &self.definition.name;
        if payload.kind() != self.definition.kind {
            return Err(ValidationError {
                subject: format!("input of task '{name}'"),
                violations: vec![format!(
                    "expected a {} payload, got {}",
                    self.definition.kind,
                    payload.kind()
                )],
            });
        }
        match &self.input {
            Some(validator) => validator.check(&format!("input of task '{name}'"), payload.arguments()),
            None => Ok(()),
        }
    }

    pub fn check_output(&self, output: &Value) -> Result<(), ValidationError> {
        self.output
            .check(&format!("output of task '{}'", self.definition.name), output)
    }
}

#[derive(Default)]
pub struct TaskRegistry {
    tasks: BTreeMap<String, RegisteredTask>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        definition: TaskDefinition,
        executor: Arc<dyn TaskExecutor>,
    ) -> Result<()> {
        if definition.name.trim().is_empty() {
            return Err(OrchestratorError::Configuration(
                "task name must not be empty".to_string(),
            ));
        }
        if self.tasks.contains_key(&definition.name) {
            return Err(OrchestratorError::Configuration(format!(
                "task '{}' is already registered",
                definition.name
            )));
        }
        let output = SchemaValidator::compile(&definition.output_schema).map_err(|err| {
            OrchestratorError::Configuration(format!(
                "output schema of task '{}': {err}",
                definition.name
            ))
        })?;
        let input = definition
            .input_schema
            .as_ref()
            .map(SchemaValidator::compile)
            .transpose()
            .map_err(|err| {
                OrchestratorError::Configuration(format!(
                    "input schema of task '{}': {err}",
                    definition.name
                ))
            })?;
        debug!(task = %definition.name, kind = %definition.kind, "registered task");
        self.tasks.insert(
            definition.name.clone(),
            RegisteredTask {
                definition,
                executor,
                output,
                input,
            },
        );
        Ok(())
    }

    /// Register an in-process closure as the executor.
    pub fn register_fn<F>(&mut self, definition: TaskDefinition, executor: F) -> Result<()>
    where
        F: Fn(&TaskRequest<'_>) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.register(definition, Arc::new(executor))
    }

    /// Register an `agent` or `skill` task backed by the configured command.
    pub fn register_command(
        &mut self,
        definition: TaskDefinition,
        executors: &ExecutorsConfig,
    ) -> Result<()> {
        let config = match definition.kind {
            TaskKind::Agent => &executors.agent,
            TaskKind::Skill => &executors.skill,
            TaskKind::Function => {
                return Err(OrchestratorError::Configuration(format!(
                    "task '{}' is a function task and needs an in-process executor",
                    definition.name
                )));
            }
        };
        let executor = CommandExecutor::new(config.clone()).map_err(|err| {
            OrchestratorError::Configuration(format!(
                "executors.{} for task '{}': {err:#}",
                definition.kind, definition.name
            ))
        })?;
        self.register(definition, Arc::new(executor))
    }

    pub fn lookup(&self, name: &str) -> Result<&RegisteredTask> {
        self.tasks.get(name).ok_or_else(|| {
            OrchestratorError::Configuration(format!("task '{name}' is not registered"))
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tasks.keys().map(String::as_str)
    }
}
