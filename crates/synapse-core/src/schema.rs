//! Document validation port.
//!
//! One `SchemaHandler` exists per schema language (JSON Schema, XML Schema,
//! Avro...). `SchemaValidator` resolves a `SchemaDefinition` (inline or
//! fetched through the external resource provider) and dispatches to the
//! handler supporting its format.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use synapse_types::workflow::SchemaDefinition;

use crate::external::{read_document, ExternalResourceError, ExternalResourceProvider};

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("no schema handler supports format '{0}'")]
    UnsupportedFormat(String),

    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    #[error("schema definition declares neither a document nor a uri")]
    MissingSchema,

    #[error(transparent)]
    External(#[from] ExternalResourceError),
}

/// A single validation failure, located by JSON pointer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub pointer: String,
    pub message: String,
}

/// Outcome of validating a document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub errors: Vec<ValidationIssue>,
}

impl ValidationResult {
    pub fn success() -> Self {
        Self::default()
    }

    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    /// Errors joined as `pointer: message; ...`.
    pub fn summary(&self) -> String {
        self.errors
            .iter()
            .map(|e| format!("{}: {}", e.pointer, e.message))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Validates documents written in one schema language.
pub trait SchemaHandler: Send + Sync {
    fn supports(&self, format: &str) -> bool;

    fn validate(&self, document: &Value, schema: &Value) -> Result<ValidationResult, SchemaError>;
}

/// Dispatches validation to the registered handlers.
#[derive(Clone)]
pub struct SchemaValidator {
    handlers: Vec<Arc<dyn SchemaHandler>>,
    resources: Arc<dyn ExternalResourceProvider>,
}

impl SchemaValidator {
    pub fn new(resources: Arc<dyn ExternalResourceProvider>) -> Self {
        Self {
            handlers: Vec::new(),
            resources,
        }
    }

    pub fn with_handler(mut self, handler: Arc<dyn SchemaHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    fn handler_for(&self, format: &str) -> Result<&Arc<dyn SchemaHandler>, SchemaError> {
        self.handlers
            .iter()
            .find(|h| h.supports(format))
            .ok_or_else(|| SchemaError::UnsupportedFormat(format.to_string()))
    }

    /// Validate `document` against `definition`.
    pub async fn validate(
        &self,
        document: &Value,
        definition: &SchemaDefinition,
    ) -> Result<ValidationResult, SchemaError> {
        let handler = self.handler_for(&definition.format)?;
        let schema = match (&definition.document, &definition.uri) {
            (Some(inline), _) => inline.clone(),
            (None, Some(uri)) => read_document(self.resources.as_ref(), uri).await?,
            (None, None) => return Err(SchemaError::MissingSchema),
        };
        let result = handler.validate(document, &schema)?;
        if !result.is_success() {
            tracing::debug!(
                format = definition.format.as_str(),
                errors = result.errors.len(),
                "document failed schema validation"
            );
        }
        Ok(result)
    }
}

impl std::fmt::Debug for SchemaValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaValidator")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Checks that every key listed in the schema's `required` array is present.
    pub struct RequiredKeysHandler;

    impl SchemaHandler for RequiredKeysHandler {
        fn supports(&self, format: &str) -> bool {
            format == "json"
        }

        fn validate(&self, document: &Value, schema: &Value) -> Result<ValidationResult, SchemaError> {
            let required = schema
                .get("required")
                .and_then(Value::as_array)
                .ok_or_else(|| SchemaError::InvalidSchema("missing 'required'".to_string()))?;
            let errors = required
                .iter()
                .filter_map(Value::as_str)
                .filter(|key| document.get(*key).is_none())
                .map(|key| ValidationIssue {
                    pointer: String::new(),
                    message: format!("'{key}' is a required property"),
                })
                .collect();
            Ok(ValidationResult { errors })
        }
    }
}
