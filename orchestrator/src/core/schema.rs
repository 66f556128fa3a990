//! JSON Schema validation for task outputs, task inputs and breakpoint resolutions.

use jsonschema::{Draft, Validator};
use serde_json::Value;

use crate::error::{OrchestratorError, Result, ValidationError};

/// A compiled schema, built once at registration time.
pub struct SchemaValidator {
    schema: Value,
    compiled: Validator,
}

impl std::fmt::Debug for SchemaValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaValidator")
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

impl SchemaValidator {
    /// Compile `schema` (Draft 2020-12). An invalid schema is a configuration error.
    pub fn compile(schema: &Value) -> Result<Self> {
        if !schema.is_object() {
            return Err(OrchestratorError::Configuration(format!(
                "schema must be a JSON object, got {schema}"
            )));
        }
        let compiled = jsonschema::options()
            .with_draft(Draft::Draft202012)
            .build(schema)
            .map_err(|err| OrchestratorError::Configuration(format!("invalid schema: {err}")))?;
        Ok(Self {
            schema: schema.clone(),
            compiled,
        })
    }

    /// Check `value`, collecting every violation rather than stopping at the first.
    pub fn check(&self, subject: &str, value: &Value) -> Result<(), ValidationError> {
        let violations: Vec<String> = self
            .compiled
            .iter_errors(value)
            .map(|err| err.to_string())
            .collect();
        if violations.is_empty() {
            return Ok(());
        }
        Err(ValidationError {
            subject: subject.to_string(),
            violations,
        })
    }
}

/// Validate `value` against `schema`, returning the value unchanged on success.
pub fn validate(value: Value, schema: &Value) -> Result<Value> {
    let validator = SchemaValidator::compile(schema)?;
    validator.check("value", &value)?;
    Ok(value)
}
