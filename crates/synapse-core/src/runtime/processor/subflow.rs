//! Sub-flow activities: run another workflow as a child instance.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::StreamExt;
use serde_json::Value;
use synapse_types::activity::{metadata_keys, Activity};
use synapse_types::error::{RepositoryError, WorkflowError};
use synapse_types::instance::{WorkflowInstance, WorkflowInstanceStatusType, WorkflowReference};
use synapse_types::resource::{labels, LabelSelector, ResourceMetadata};
use synapse_types::workflow::{SubFlowReference, Workflow};
use tokio_util::sync::CancellationToken;

use crate::repository::ResourceRepository;
use crate::runtime::context::WorkflowRuntimeContext;

use super::{short_id, ActivityOutcome, ProcessError};

pub struct SubFlowProcessor<R: ResourceRepository + 'static> {
    pub(super) ctx: Arc<WorkflowRuntimeContext<R>>,
    pub(super) activity: Activity,
    sub_flow: SubFlowReference,
}

impl<R: ResourceRepository + 'static> SubFlowProcessor<R> {
    pub fn new(ctx: Arc<WorkflowRuntimeContext<R>>, sub_flow: SubFlowReference, activity: Activity) -> Self {
        Self {
            ctx,
            activity,
            sub_flow,
        }
    }

    pub(super) async fn run(&mut self, cancel: &CancellationToken) -> Result<ActivityOutcome, ProcessError> {
        let name = self.ensure_child().await?;
        let namespace = self.ctx.namespace().to_string();
        let repo = self.ctx.repository();

        // Subscribe before reading so no transition slips between the two.
        let mut changes = repo.watch::<WorkflowInstance>(Some(&namespace)).await?;
        match repo.get::<WorkflowInstance>(&name, &namespace).await? {
            Some(child) => {
                if let Some(result) = settled(&child) {
                    return result;
                }
            }
            None => return Err(deleted(&name)),
        }

        loop {
            let change = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(ActivityOutcome::Cancelled),
                change = changes.next() => change,
            };
            let Some(change) = change else {
                return Err(ProcessError::Repository(RepositoryError::Connection));
            };
            if change.resource().metadata.name != name {
                continue;
            }
            if change.is_deleted() {
                return Err(deleted(&name));
            }
            if let Some(result) = settled(change.resource()) {
                return result;
            }
        }
    }

    /// Name of the child instance, creating it on first run.
    async fn ensure_child(&mut self) -> Result<String, ProcessError> {
        if let Some(name) = self.activity.meta(metadata_keys::SUBFLOW_INSTANCE) {
            return Ok(name.to_string());
        }
        let namespace = self.ctx.namespace().to_string();
        let repo = self.ctx.repository();

        let existing: Vec<WorkflowInstance> = repo
            .list(
                Some(&namespace),
                &[LabelSelector::equals(labels::PARENT_ACTIVITY, self.activity.id.clone())],
            )
            .await?;
        let name = match existing.into_iter().next() {
            Some(child) => child.metadata.name,
            None => self.create_child(&namespace).await?,
        };

        let entries = BTreeMap::from([(metadata_keys::SUBFLOW_INSTANCE.to_string(), name.clone())]);
        self.activity = self.ctx.annotate_activity(&self.activity.id, entries).await?;
        Ok(name)
    }

    async fn create_child(&self, namespace: &str) -> Result<String, ProcessError> {
        let repo = self.ctx.repository();
        let workflow = repo
            .get::<Workflow>(&self.sub_flow.workflow, namespace)
            .await?
            .ok_or_else(|| {
                ProcessError::fault(
                    WorkflowError::VALIDATION,
                    "unknown sub-flow",
                    format!("workflow '{}' does not exist in '{namespace}'", self.sub_flow.workflow),
                )
            })?;
        let definition = workflow.resolve(self.sub_flow.version.as_deref()).ok_or_else(|| {
            ProcessError::fault(
                WorkflowError::VALIDATION,
                "unknown sub-flow version",
                format!(
                    "workflow '{}' has no version '{}'",
                    self.sub_flow.workflow,
                    self.sub_flow.version.as_deref().unwrap_or("latest")
                ),
            )
        })?;

        let name = format!("{}-{}", self.sub_flow.workflow, short_id(&self.activity.id));
        let metadata = ResourceMetadata::new(name.clone(), namespace)
            .with_label(labels::PARENT_INSTANCE, self.ctx.name())
            .with_label(labels::PARENT_ACTIVITY, self.activity.id.clone());
        let child = WorkflowInstance::new(
            metadata,
            WorkflowReference {
                name: self.sub_flow.workflow.clone(),
                namespace: namespace.to_string(),
                version: definition.version.clone(),
            },
            self.activity.input.clone(),
        );
        match repo.add(&child).await {
            Ok(_) | Err(RepositoryError::AlreadyExists { .. }) => {}
            Err(e) => return Err(e.into()),
        }
        tracing::info!(
            instance = %self.ctx.qualified_name(),
            activity_id = %self.activity.id,
            child = name.as_str(),
            workflow = self.sub_flow.workflow.as_str(),
            version = definition.version.as_str(),
            "sub-flow instance created"
        );
        Ok(name)
    }
}

/// Outcome of a child that reached a terminal status.
fn settled(child: &WorkflowInstance) -> Option<Result<ActivityOutcome, ProcessError>> {
    let qualified = child.metadata.qualified_name();
    match child.status_type() {
        WorkflowInstanceStatusType::Executed => Some(Ok(ActivityOutcome::Completed(
            child.status.output.clone().unwrap_or(Value::Null),
        ))),
        WorkflowInstanceStatusType::Faulted => Some(Err(ProcessError::Fault(
            child.status.errors.last().cloned().unwrap_or_else(|| {
                WorkflowError::new(WorkflowError::RUNTIME, "sub-flow faulted").with_detail(qualified)
            }),
        ))),
        WorkflowInstanceStatusType::TimedOut => Some(Err(ProcessError::fault(
            WorkflowError::TIMEOUT,
            "sub-flow timed out",
            qualified,
        ))),
        WorkflowInstanceStatusType::Terminated => Some(Err(ProcessError::fault(
            WorkflowError::RUNTIME,
            "sub-flow terminated",
            qualified,
        ))),
        _ => None,
    }
}

fn deleted(name: &str) -> ProcessError {
    ProcessError::fault(
        WorkflowError::RUNTIME,
        "sub-flow deleted",
        format!("instance '{name}' no longer exists"),
    )
}
