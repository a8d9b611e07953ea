use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from repository operations (used by trait definitions in synapse-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("{kind} '{name}' not found")]
    NotFound { kind: String, name: String },

    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: String, name: String },

    /// The resource changed since the snapshot the write was computed from.
    ///
    /// Callers must re-read and recompute rather than retry blindly.
    #[error("concurrency conflict on {kind} '{name}': expected version {expected}, found {actual}")]
    Conflict {
        kind: String,
        name: String,
        expected: u64,
        actual: u64,
    },

    #[error("invalid patch: {0}")]
    InvalidPatch(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl RepositoryError {
    /// Whether this error is an optimistic-concurrency conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, RepositoryError::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RepositoryError::NotFound { .. })
    }
}

/// An illegal lifecycle transition: a contract violation, never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot apply '{transition}' to {subject} in status '{from}'")]
pub struct TransitionError {
    /// `instance` or `activity`.
    pub subject: &'static str,
    pub from: String,
    pub transition: &'static str,
}

/// A business or runtime fault recorded in a workflow instance's status.
///
/// Shaped after RFC 7807 problem details: `instance` holds a JSON pointer to
/// the activity that faulted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowError {
    /// Error category (e.g. "communication", "expression", "validation").
    #[serde(rename = "type")]
    pub error_type: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
}

impl WorkflowError {
    pub const COMMUNICATION: &'static str = "communication";
    pub const EXPRESSION: &'static str = "expression";
    pub const VALIDATION: &'static str = "validation";
    pub const RUNTIME: &'static str = "runtime";
    pub const TIMEOUT: &'static str = "timeout";

    pub fn new(error_type: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            title: title.into(),
            status: None,
            detail: None,
            instance: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }
}

impl std::fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.error_type, self.title)?;
        if let Some(detail) = &self.detail {
            write!(f, ": {detail}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repository_error_display() {
        let err = RepositoryError::Query("syntax error".to_string());
        assert_eq!(err.to_string(), "query error: syntax error");
    }

    #[test]
    fn test_conflict_is_detectable() {
        let err = RepositoryError::Conflict {
            kind: "Correlation".to_string(),
            name: "orders.default".to_string(),
            expected: 3,
            actual: 4,
        };
        assert!(err.is_conflict());
        assert!(!err.is_not_found());
        assert!(err.to_string().contains("expected version 3"));
    }

    #[test]
    fn test_transition_error_display() {
        let err = TransitionError {
            subject: "instance",
            from: "pending".to_string(),
            transition: "suspend",
        };
        assert_eq!(
            err.to_string(),
            "cannot apply 'suspend' to instance in status 'pending'"
        );
    }

    #[test]
    fn test_workflow_error_display_includes_detail() {
        let err = WorkflowError::new(WorkflowError::COMMUNICATION, "HTTP call failed")
            .with_status(503)
            .with_detail("service unavailable");
        assert_eq!(
            err.to_string(),
            "[communication] HTTP call failed: service unavailable"
        );
    }

    #[test]
    fn test_workflow_error_serializes_type_field() {
        let err = WorkflowError::new(WorkflowError::RUNTIME, "boom").with_instance("/activities/2");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["type"], "runtime");
        assert_eq!(json["instance"], "/activities/2");
        assert!(json.get("status").is_none());
    }
}
