//! Activity tree nodes recorded in a workflow instance's status.
//!
//! Every state, action, function call, branch and iteration a runtime executes
//! is persisted as an `Activity` so that execution can be resumed after a
//! restart by walking the existing tree instead of re-running it.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{TransitionError, WorkflowError};

/// Well-known activity metadata keys.
pub mod metadata_keys {
    /// Name of the state definition the activity belongs to.
    pub const STATE: &str = "state";
    pub const ACTION: &str = "action";
    pub const FUNCTION: &str = "function";
    pub const BRANCH: &str = "branch";
    /// Zero-based position of an iteration activity.
    pub const ITERATION: &str = "iteration";
    /// Number of invocation attempts made so far.
    pub const ATTEMPTS: &str = "attempts";
    /// Qualified name of the child instance started by a sub-flow.
    pub const SUBFLOW_INSTANCE: &str = "subflow_instance";
    /// Qualified name of the correlation created by a listen activity.
    pub const CORRELATION: &str = "correlation";
    /// Next state selected by a switch state; empty when the workflow ends.
    pub const NEXT: &str = "next";
    /// RFC 3339 instant after which a listen activity times out.
    pub const DEADLINE: &str = "deadline";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    Start,
    State,
    Action,
    Function,
    SubFlow,
    Branch,
    Iteration,
    Listen,
    Sleep,
    End,
}

impl std::fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ActivityKind::Start => "start",
            ActivityKind::State => "state",
            ActivityKind::Action => "action",
            ActivityKind::Function => "function",
            ActivityKind::SubFlow => "sub_flow",
            ActivityKind::Branch => "branch",
            ActivityKind::Iteration => "iteration",
            ActivityKind::Listen => "listen",
            ActivityKind::Sleep => "sleep",
            ActivityKind::End => "end",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Faulted,
    Cancelled,
    Skipped,
}

impl ActivityStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ActivityStatus::Completed
                | ActivityStatus::Faulted
                | ActivityStatus::Cancelled
                | ActivityStatus::Skipped
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityStatus::Pending => "pending",
            ActivityStatus::Running => "running",
            ActivityStatus::Completed => "completed",
            ActivityStatus::Faulted => "faulted",
            ActivityStatus::Cancelled => "cancelled",
            ActivityStatus::Skipped => "skipped",
        }
    }
}

/// One executed (or executing) node of an instance's activity tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    /// UUIDv7, time-sortable.
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ActivityKind,
    /// Name unique among siblings of the same kind; with `parent_id` and
    /// `kind` it forms the idempotent lookup key.
    pub name: String,
    #[serde(default)]
    pub status: ActivityStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WorkflowError>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executed_at: Option<DateTime<Utc>>,
}

impl Activity {
    pub fn new(
        kind: ActivityKind,
        name: impl Into<String>,
        input: Value,
        parent_id: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            kind,
            name: name.into(),
            status: ActivityStatus::Pending,
            parent_id,
            input,
            output: None,
            metadata: BTreeMap::new(),
            error: None,
            created_at: Utc::now(),
            started_at: None,
            executed_at: None,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    pub fn is_child_of(&self, parent_id: Option<&str>) -> bool {
        self.parent_id.as_deref() == parent_id
    }

    fn guard(&self, transition: &'static str, allowed: &[ActivityStatus]) -> Result<(), TransitionError> {
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(TransitionError {
                subject: "activity",
                from: self.status.as_str().to_string(),
                transition,
            })
        }
    }

    /// Pending -> Running. Re-entering a running activity is a no-op.
    pub fn start(&mut self) -> Result<(), TransitionError> {
        if self.status == ActivityStatus::Running {
            return Ok(());
        }
        self.guard("start", &[ActivityStatus::Pending])?;
        self.status = ActivityStatus::Running;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    pub fn complete(&mut self, output: Value) -> Result<(), TransitionError> {
        self.guard("complete", &[ActivityStatus::Running])?;
        self.status = ActivityStatus::Completed;
        self.output = Some(output);
        self.executed_at = Some(Utc::now());
        Ok(())
    }

    pub fn fault(&mut self, error: WorkflowError) -> Result<(), TransitionError> {
        self.guard("fault", &[ActivityStatus::Pending, ActivityStatus::Running])?;
        self.status = ActivityStatus::Faulted;
        self.error = Some(error);
        self.executed_at = Some(Utc::now());
        Ok(())
    }

    pub fn skip(&mut self) -> Result<(), TransitionError> {
        self.guard("skip", &[ActivityStatus::Pending, ActivityStatus::Running])?;
        self.status = ActivityStatus::Skipped;
        self.executed_at = Some(Utc::now());
        Ok(())
    }

    pub fn cancel(&mut self) -> Result<(), TransitionError> {
        self.guard("cancel", &[ActivityStatus::Pending, ActivityStatus::Running])?;
        self.status = ActivityStatus::Cancelled;
        self.executed_at = Some(Utc::now());
        Ok(())
    }
}

/// Lifecycle notifications published while activities are processed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ActivityEvent {
    Created {
        instance: String,
        activity_id: String,
        kind: ActivityKind,
        name: String,
    },
    Started {
        instance: String,
        activity_id: String,
    },
    Completed {
        instance: String,
        activity_id: String,
        output: Value,
    },
    Faulted {
        instance: String,
        activity_id: String,
        error: WorkflowError,
    },
    Skipped {
        instance: String,
        activity_id: String,
    },
    Cancelled {
        instance: String,
        activity_id: String,
    },
}

impl ActivityEvent {
    pub fn activity_id(&self) -> &str {
        match self {
            ActivityEvent::Created { activity_id, .. }
            | ActivityEvent::Started { activity_id, .. }
            | ActivityEvent::Completed { activity_id, .. }
            | ActivityEvent::Faulted { activity_id, .. }
            | ActivityEvent::Skipped { activity_id, .. }
            | ActivityEvent::Cancelled { activity_id, .. } => activity_id,
        }
    }

    pub fn instance(&self) -> &str {
        match self {
            ActivityEvent::Created { instance, .. }
            | ActivityEvent::Started { instance, .. }
            | ActivityEvent::Completed { instance, .. }
            | ActivityEvent::Faulted { instance, .. }
            | ActivityEvent::Skipped { instance, .. }
            | ActivityEvent::Cancelled { instance, .. } => instance,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_activity_lifecycle() {
        let mut activity = Activity::new(ActivityKind::Function, "charge", json!({"amount": 3}), None);
        assert_eq!(activity.status, ActivityStatus::Pending);

        activity.start().unwrap();
        activity.start().unwrap();
        assert_eq!(activity.status, ActivityStatus::Running);
        assert!(activity.started_at.is_some());

        activity.complete(json!({"ok": true})).unwrap();
        assert!(activity.status.is_terminal());
        assert_eq!(activity.output, Some(json!({"ok": true})));
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut activity = Activity::new(ActivityKind::Action, "a", Value::Null, None);
        activity.skip().unwrap();

        let err = activity.start().unwrap_err();
        assert_eq!(err.subject, "activity");
        assert_eq!(err.from, "skipped");
        assert!(activity.cancel().is_err());
        assert!(activity.complete(Value::Null).is_err());
        assert_eq!(activity.status, ActivityStatus::Skipped);
    }

    #[test]
    fn test_complete_requires_running() {
        let mut activity = Activity::new(ActivityKind::State, "s", Value::Null, None);
        assert!(activity.complete(Value::Null).is_err());
        assert!(activity.output.is_none());
    }

    #[test]
    fn test_activity_serde_shape() {
        let activity = Activity::new(ActivityKind::SubFlow, "child", Value::Null, Some("p".into()))
            .with_metadata(metadata_keys::STATE, "charge");
        let json = serde_json::to_value(&activity).unwrap();
        assert_eq!(json["type"], "sub_flow");
        assert_eq!(json["parent_id"], "p");
        assert_eq!(json["metadata"]["state"], "charge");
        assert!(json.get("output").is_none());

        let back: Activity = serde_json::from_value(json).unwrap();
        assert_eq!(back, activity);
        assert!(back.is_child_of(Some("p")));
        assert_eq!(back.meta(metadata_keys::STATE), Some("charge"));
    }

    #[test]
    fn test_activity_event_accessors() {
        let event = ActivityEvent::Skipped {
            instance: "i.ns".into(),
            activity_id: "a1".into(),
        };
        assert_eq!(event.activity_id(), "a1");
        assert_eq!(event.instance(), "i.ns");
        assert_eq!(serde_json::to_value(&event).unwrap()["event"], "skipped");
    }
}
