//! JSON Schema implementation of `SchemaHandler`.
//!
//! Compiled validators are cached by schema text, since the same workflow
//! input schema is checked for every instance a correlation starts.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use synapse_core::schema::{SchemaError, SchemaHandler, ValidationIssue, ValidationResult};

/// Validates documents against JSON Schema (drafts 4 through 2020-12).
#[derive(Default)]
pub struct JsonSchemaHandler {
    validators: DashMap<String, Arc<jsonschema::Validator>>,
}

impl JsonSchemaHandler {
    pub fn new() -> Self {
        Self::default()
    }

    fn validator(&self, schema: &Value) -> Result<Arc<jsonschema::Validator>, SchemaError> {
        let key = schema.to_string();
        if let Some(validator) = self.validators.get(&key) {
            return Ok(validator.clone());
        }
        let validator = jsonschema::validator_for(schema)
            .map_err(|e| SchemaError::InvalidSchema(e.to_string()))?;
        let validator = Arc::new(validator);
        self.validators.insert(key, validator.clone());
        Ok(validator)
    }
}

impl SchemaHandler for JsonSchemaHandler {
    fn supports(&self, format: &str) -> bool {
        format.eq_ignore_ascii_case("json") || format.eq_ignore_ascii_case("jsonschema")
    }

    fn validate(&self, document: &Value, schema: &Value) -> Result<ValidationResult, SchemaError> {
        let validator = self.validator(schema)?;
        let errors = validator
            .iter_errors(document)
            .map(|error| ValidationIssue {
                pointer: error.instance_path.to_string(),
                message: error.to_string(),
            })
            .collect();
        Ok(ValidationResult { errors })
    }
}

impl std::fmt::Debug for JsonSchemaHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonSchemaHandler")
            .field("cached", &self.validators.len())
            .finish()
    }
}
