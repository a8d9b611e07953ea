//! Workflow instance aggregate and its lifecycle reducer.
//!
//! Status changes are expressed as `InstanceEvent`s folded by [`apply`], a
//! pure function that validates the source status before producing the next
//! status value. The `WorkflowInstance` transition methods are thin wrappers
//! that only commit the result when the reducer accepts the event.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::activity::Activity;
use crate::correlation::CorrelationContext;
use crate::error::{TransitionError, WorkflowError};
use crate::resource::{Resource, ResourceMetadata};

// ---------------------------------------------------------------------------
// Resource
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub metadata: ResourceMetadata,
    pub spec: WorkflowInstanceSpec,
    #[serde(default)]
    pub status: WorkflowInstanceStatus,
}

impl Resource for WorkflowInstance {
    const KIND: &'static str = "WorkflowInstance";

    fn metadata(&self) -> &ResourceMetadata {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ResourceMetadata {
        &mut self.metadata
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstanceSpec {
    pub definition: WorkflowReference,
    #[serde(default)]
    pub input: Value,
    /// Context of the correlation that started this instance, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_context: Option<CorrelationContext>,
}

/// Pins an instance to one version of a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowReference {
    pub name: String,
    pub namespace: String,
    pub version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstanceStatus {
    #[serde(rename = "type", default)]
    pub status_type: WorkflowInstanceStatusType,
    /// Worker (runner) that deployed the instance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initialized_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Set when a terminal status is reached.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interruptions: Vec<ExecutionInterruption>,
    /// Append-only activity log.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub activities: Vec<Activity>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<WorkflowError>,
    /// Correlated contexts delivered to waiting activities, keyed by activity id.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub correlation_contexts: BTreeMap<String, CorrelationContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowInstanceStatusType {
    #[default]
    Pending,
    Initializing,
    Deployed,
    Executing,
    Suspended,
    Waiting,
    Awakening,
    Awakened,
    Executed,
    Faulted,
    TimedOut,
    Terminated,
}

impl WorkflowInstanceStatusType {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Executed | Self::Faulted | Self::TimedOut | Self::Terminated
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Initializing => "initializing",
            Self::Deployed => "deployed",
            Self::Executing => "executing",
            Self::Suspended => "suspended",
            Self::Waiting => "waiting",
            Self::Awakening => "awakening",
            Self::Awakened => "awakened",
            Self::Executed => "executed",
            Self::Faulted => "faulted",
            Self::TimedOut => "timed_out",
            Self::Terminated => "terminated",
        }
    }
}

impl std::fmt::Display for WorkflowInstanceStatusType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One suspend (or wait) / resume pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionInterruption {
    pub suspended_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resumed_at: Option<DateTime<Utc>>,
}

impl ExecutionInterruption {
    pub fn has_been_resumed(&self) -> bool {
        self.resumed_at.is_some()
    }
}

// ---------------------------------------------------------------------------
// Reducer
// ---------------------------------------------------------------------------

/// A lifecycle event of a workflow instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum InstanceEvent {
    Initialized,
    Deployed { worker: String },
    Started,
    Suspended,
    Waiting,
    Awakening,
    Resumed,
    Executed { output: Value },
    Faulted { error: WorkflowError },
    TimedOut,
    Terminated,
}

impl InstanceEvent {
    pub fn name(&self) -> &'static str {
        match self {
            InstanceEvent::Initialized => "initialize",
            InstanceEvent::Deployed { .. } => "deploy",
            InstanceEvent::Started => "start",
            InstanceEvent::Suspended => "suspend",
            InstanceEvent::Waiting => "wait",
            InstanceEvent::Awakening => "awake",
            InstanceEvent::Resumed => "resume",
            InstanceEvent::Executed { .. } => "complete",
            InstanceEvent::Faulted { .. } => "fault",
            InstanceEvent::TimedOut => "time out",
            InstanceEvent::Terminated => "terminate",
        }
    }
}

/// Fold one event into a status, returning the next status.
///
/// Fails without side effects when the event is not legal from the current
/// status type.
pub fn apply(
    status: &WorkflowInstanceStatus,
    event: &InstanceEvent,
    at: DateTime<Utc>,
) -> Result<WorkflowInstanceStatus, TransitionError> {
    use WorkflowInstanceStatusType as S;

    let from = status.status_type;
    let illegal = || TransitionError {
        subject: "instance",
        from: from.as_str().to_string(),
        transition: event.name(),
    };

    let mut next = status.clone();
    match (event, from) {
        (InstanceEvent::Initialized, S::Pending) => {
            next.status_type = S::Initializing;
            next.initialized_at = Some(at);
        }
        (InstanceEvent::Deployed { worker }, S::Initializing) => {
            next.status_type = S::Deployed;
            next.worker = Some(worker.clone());
            next.deployed_at = Some(at);
        }
        (InstanceEvent::Deployed { worker }, S::Awakening) => {
            next.status_type = S::Awakened;
            next.worker = Some(worker.clone());
            next.deployed_at = Some(at);
        }
        (InstanceEvent::Started, S::Deployed) => {
            next.status_type = S::Executing;
            next.started_at = Some(at);
        }
        (InstanceEvent::Suspended, S::Executing) => {
            next.status_type = S::Suspended;
            next.interruptions.push(ExecutionInterruption {
                suspended_at: at,
                resumed_at: None,
            });
        }
        (InstanceEvent::Waiting, S::Executing) => {
            next.status_type = S::Waiting;
            next.interruptions.push(ExecutionInterruption {
                suspended_at: at,
                resumed_at: None,
            });
        }
        (InstanceEvent::Awakening, S::Waiting) => {
            next.status_type = S::Awakening;
        }
        (InstanceEvent::Resumed, S::Suspended | S::Awakened) => {
            next.status_type = S::Executing;
            if let Some(open) = next
                .interruptions
                .iter_mut()
                .rev()
                .find(|i| !i.has_been_resumed())
            {
                open.resumed_at = Some(at);
            }
        }
        (InstanceEvent::Executed { output }, S::Executing) => {
            next.status_type = S::Executed;
            next.output = Some(output.clone());
            next.executed_at = Some(at);
        }
        (InstanceEvent::Faulted { error }, s) if !s.is_terminal() => {
            next.status_type = S::Faulted;
            next.errors.push(error.clone());
            next.executed_at = Some(at);
        }
        (InstanceEvent::TimedOut, S::Executing | S::Waiting | S::Suspended) => {
            next.status_type = S::TimedOut;
            next.executed_at = Some(at);
        }
        (InstanceEvent::Terminated, s) if !s.is_terminal() => {
            next.status_type = S::Terminated;
            next.executed_at = Some(at);
        }
        _ => return Err(illegal()),
    }
    next.last_modified = Some(at);
    Ok(next)
}

// ---------------------------------------------------------------------------
// Transition methods
// ---------------------------------------------------------------------------

impl WorkflowInstance {
    pub fn new(metadata: ResourceMetadata, definition: WorkflowReference, input: Value) -> Self {
        Self {
            metadata,
            spec: WorkflowInstanceSpec {
                definition,
                input,
                correlation_context: None,
            },
            status: WorkflowInstanceStatus::default(),
        }
    }

    pub fn status_type(&self) -> WorkflowInstanceStatusType {
        self.status.status_type
    }

    /// Apply an event, committing the new status only on success.
    pub fn transition(&mut self, event: InstanceEvent) -> Result<(), TransitionError> {
        self.status = apply(&self.status, &event, Utc::now())?;
        Ok(())
    }

    pub fn initialize(&mut self) -> Result<(), TransitionError> {
        self.transition(InstanceEvent::Initialized)
    }

    pub fn deploy(&mut self, worker: impl Into<String>) -> Result<(), TransitionError> {
        if self.status_type() != WorkflowInstanceStatusType::Initializing {
            return Err(self.illegal("deploy"));
        }
        self.transition(InstanceEvent::Deployed {
            worker: worker.into(),
        })
    }

    pub fn start(&mut self) -> Result<(), TransitionError> {
        self.transition(InstanceEvent::Started)
    }

    pub fn suspend(&mut self) -> Result<(), TransitionError> {
        self.transition(InstanceEvent::Suspended)
    }

    /// Block on correlated events.
    pub fn wait(&mut self) -> Result<(), TransitionError> {
        self.transition(InstanceEvent::Waiting)
    }

    /// Signal that the events a waiting instance needs have been delivered.
    pub fn awake(&mut self) -> Result<(), TransitionError> {
        self.transition(InstanceEvent::Awakening)
    }

    /// A runner picked up an awakening instance.
    pub fn mark_awakened(&mut self, worker: impl Into<String>) -> Result<(), TransitionError> {
        if self.status_type() != WorkflowInstanceStatusType::Awakening {
            return Err(self.illegal("mark awakened"));
        }
        self.transition(InstanceEvent::Deployed {
            worker: worker.into(),
        })
    }

    pub fn resume(&mut self) -> Result<(), TransitionError> {
        self.transition(InstanceEvent::Resumed)
    }

    pub fn complete(&mut self, output: Value) -> Result<(), TransitionError> {
        self.transition(InstanceEvent::Executed { output })
    }

    pub fn fault(&mut self, error: WorkflowError) -> Result<(), TransitionError> {
        self.transition(InstanceEvent::Faulted { error })
    }

    pub fn time_out(&mut self) -> Result<(), TransitionError> {
        self.transition(InstanceEvent::TimedOut)
    }

    pub fn terminate(&mut self) -> Result<(), TransitionError> {
        self.transition(InstanceEvent::Terminated)
    }

    fn illegal(&self, transition: &'static str) -> TransitionError {
        TransitionError {
            subject: "instance",
            from: self.status_type().as_str().to_string(),
            transition,
        }
    }

    pub fn activity(&self, id: &str) -> Option<&Activity> {
        self.status.activities.iter().find(|a| a.id == id)
    }

    pub fn activity_mut(&mut self, id: &str) -> Option<&mut Activity> {
        self.status.activities.iter_mut().find(|a| a.id == id)
    }

    /// Children of `parent_id` (roots when `None`) in creation order.
    pub fn children(&self, parent_id: Option<&str>) -> impl Iterator<Item = &Activity> {
        self.status
            .activities
            .iter()
            .filter(move |a| a.is_child_of(parent_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pending_instance() -> WorkflowInstance {
        WorkflowInstance::new(
            ResourceMetadata::new("order-42", "default"),
            WorkflowReference {
                name: "orders".to_string(),
                namespace: "default".to_string(),
                version: "1.0.0".to_string(),
            },
            json!({"order_id": 42}),
        )
    }

    fn executing_instance() -> WorkflowInstance {
        let mut instance = pending_instance();
        instance.initialize().unwrap();
        instance.deploy("runner-1.default").unwrap();
        instance.start().unwrap();
        instance
    }

    #[test]
    fn test_happy_path() {
        let mut instance = executing_instance();
        assert_eq!(instance.status_type(), WorkflowInstanceStatusType::Executing);
        assert_eq!(instance.status.worker.as_deref(), Some("runner-1.default"));
        assert!(instance.status.started_at.is_some());

        instance.complete(json!({"done": true})).unwrap();
        assert_eq!(instance.status_type(), WorkflowInstanceStatusType::Executed);
        assert_eq!(instance.status.output, Some(json!({"done": true})));
        assert!(instance.status.executed_at.is_some());
    }

    #[test]
    fn test_suspend_pending_fails_without_mutation() {
        let mut instance = pending_instance();
        let before = instance.status.clone();

        let err = instance.suspend().unwrap_err();
        assert_eq!(err.from, "pending");
        assert_eq!(err.transition, "suspend");
        assert_eq!(instance.status, before);
        assert!(instance.status.interruptions.is_empty());
    }

    #[test]
    fn test_suspend_executing_appends_one_open_interruption() {
        let mut instance = executing_instance();
        instance.suspend().unwrap();

        assert_eq!(instance.status_type(), WorkflowInstanceStatusType::Suspended);
        assert_eq!(instance.status.interruptions.len(), 1);
        assert!(!instance.status.interruptions[0].has_been_resumed());
    }

    #[test]
    fn test_resume_pairs() {
        let mut instance = executing_instance();
        for _ in 0..3 {
            instance.suspend().unwrap();
            instance.resume().unwrap();
        }
        instance.suspend().unwrap();

        let interruptions = &instance.status.interruptions;
        assert_eq!(interruptions.len(), 4);
        assert!(interruptions[..3].iter().all(|i| i.has_been_resumed()));
        assert!(!interruptions[3].has_been_resumed());
    }

    #[test]
    fn test_wait_awake_resume_cycle() {
        let mut instance = executing_instance();
        instance.wait().unwrap();
        assert_eq!(instance.status_type(), WorkflowInstanceStatusType::Waiting);
        assert!(instance.resume().is_err());

        instance.awake().unwrap();
        assert!(instance.deploy("other").is_err());
        instance.mark_awakened("runner-2.default").unwrap();
        assert_eq!(instance.status_type(), WorkflowInstanceStatusType::Awakened);
        assert_eq!(instance.status.worker.as_deref(), Some("runner-2.default"));

        instance.resume().unwrap();
        assert_eq!(instance.status_type(), WorkflowInstanceStatusType::Executing);
        assert!(instance.status.interruptions[0].has_been_resumed());
    }

    #[test]
    fn test_fault_records_error_and_is_terminal() {
        let mut instance = executing_instance();
        instance
            .fault(WorkflowError::new(WorkflowError::RUNTIME, "boom"))
            .unwrap();
        assert_eq!(instance.status_type(), WorkflowInstanceStatusType::Faulted);
        assert_eq!(instance.status.errors.len(), 1);

        assert!(instance.terminate().is_err());
        assert!(instance.fault(WorkflowError::new("x", "y")).is_err());
        assert_eq!(instance.status.errors.len(), 1);
    }

    #[test]
    fn test_terminate_from_any_non_terminal() {
        let mut pending = pending_instance();
        pending.terminate().unwrap();
        assert_eq!(pending.status_type(), WorkflowInstanceStatusType::Terminated);

        let mut waiting = executing_instance();
        waiting.wait().unwrap();
        waiting.terminate().unwrap();
        assert_eq!(waiting.status_type(), WorkflowInstanceStatusType::Terminated);
    }

    #[test]
    fn test_time_out_guards() {
        let mut pending = pending_instance();
        assert!(pending.time_out().is_err());

        let mut suspended = executing_instance();
        suspended.suspend().unwrap();
        suspended.time_out().unwrap();
        assert_eq!(suspended.status_type(), WorkflowInstanceStatusType::TimedOut);
    }

    #[test]
    fn test_reducer_is_pure() {
        let status = WorkflowInstanceStatus::default();
        let at = Utc::now();
        let next = apply(&status, &InstanceEvent::Initialized, at).unwrap();
        assert_eq!(status.status_type, WorkflowInstanceStatusType::Pending);
        assert_eq!(next.status_type, WorkflowInstanceStatusType::Initializing);
        assert_eq!(next.initialized_at, Some(at));
        assert_eq!(next.last_modified, Some(at));
    }

    #[test]
    fn test_status_type_serde() {
        let json = serde_json::to_value(WorkflowInstanceStatusType::TimedOut).unwrap();
        assert_eq!(json, "timed_out");
        let status: WorkflowInstanceStatus = serde_json::from_value(json!({})).unwrap();
        assert_eq!(status.status_type, WorkflowInstanceStatusType::Pending);
    }
}
