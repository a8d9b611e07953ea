//! Per-instance runtime context.
//!
//! Owns the latest persisted snapshot of one workflow instance and is the
//! only path through which processors read or extend its activity tree.
//! Every mutation is a clone-mutate-diff-patch against that snapshot; a
//! concurrency conflict re-reads the instance and re-applies the mutation so
//! that guards are always checked against fresh state.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use synapse_types::activity::{Activity, ActivityEvent, ActivityKind};
use synapse_types::error::{RepositoryError, TransitionError, WorkflowError};
use synapse_types::instance::{InstanceEvent, WorkflowInstance, WorkflowInstanceStatusType};
use synapse_types::resource::Resource;
use synapse_types::workflow::WorkflowDefinition;
use tokio::sync::Mutex;

use crate::event::EventBus;
use crate::expression::ExpressionEvaluator;
use crate::repository::{ResourcePatch, ResourceRepository};

use super::function::FunctionInvokerRegistry;
use super::processor::ProcessError;

/// Re-reads attempted after a concurrency conflict before giving up.
pub const MAX_CONFLICT_RETRIES: usize = 5;

// ---------------------------------------------------------------------------
// RuntimeServices
// ---------------------------------------------------------------------------

/// Collaborators shared by every runtime of a worker.
#[derive(Clone)]
pub struct RuntimeServices {
    pub evaluator: Arc<dyn ExpressionEvaluator>,
    pub functions: Arc<FunctionInvokerRegistry>,
    pub events: EventBus,
}

impl RuntimeServices {
    pub fn new(
        evaluator: Arc<dyn ExpressionEvaluator>,
        functions: Arc<FunctionInvokerRegistry>,
        events: EventBus,
    ) -> Self {
        Self {
            evaluator,
            functions,
            events,
        }
    }
}

impl std::fmt::Debug for RuntimeServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeServices")
            .field("functions", &self.functions)
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// WorkflowRuntimeContext
// ---------------------------------------------------------------------------

pub struct WorkflowRuntimeContext<R: ResourceRepository> {
    repo: Arc<R>,
    definition: Arc<WorkflowDefinition>,
    services: RuntimeServices,
    name: String,
    namespace: String,
    qualified_name: String,
    instance: Mutex<WorkflowInstance>,
}

impl<R: ResourceRepository> WorkflowRuntimeContext<R> {
    pub fn new(
        repo: Arc<R>,
        instance: WorkflowInstance,
        definition: Arc<WorkflowDefinition>,
        services: RuntimeServices,
    ) -> Self {
        Self {
            repo,
            definition,
            services,
            name: instance.name().to_string(),
            namespace: instance.namespace().to_string(),
            qualified_name: instance.qualified_name(),
            instance: Mutex::new(instance),
        }
    }

    pub fn repository(&self) -> &Arc<R> {
        &self.repo
    }

    pub fn definition(&self) -> &WorkflowDefinition {
        &self.definition
    }

    pub fn services(&self) -> &RuntimeServices {
        &self.services
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn qualified_name(&self) -> &str {
        &self.qualified_name
    }

    /// The latest snapshot of the instance.
    pub async fn snapshot(&self) -> WorkflowInstance {
        self.instance.lock().await.clone()
    }

    /// Replace the snapshot with the stored instance.
    pub async fn refresh(&self) -> Result<WorkflowInstance, RepositoryError> {
        let mut current = self.instance.lock().await;
        *current = self.load().await?;
        Ok(current.clone())
    }

    async fn load(&self) -> Result<WorkflowInstance, RepositoryError> {
        self.repo
            .get::<WorkflowInstance>(&self.name, &self.namespace)
            .await?
            .ok_or_else(|| RepositoryError::NotFound {
                kind: WorkflowInstance::KIND.to_string(),
                name: self.qualified_name.clone(),
            })
    }

    /// Apply `mutate` to the instance and persist the difference.
    ///
    /// `mutate` may run several times: once per conflict, each time against a
    /// freshly read instance. Its changes are discarded when it fails.
    pub async fn mutate<T, F>(&self, mut mutate: F) -> Result<T, ProcessError>
    where
        T: Send,
        F: FnMut(&mut WorkflowInstance) -> Result<T, ProcessError> + Send,
    {
        let mut current = self.instance.lock().await;
        let mut conflicts = 0;
        loop {
            let mut next = current.clone();
            let value = mutate(&mut next)?;
            let patch = ResourcePatch::diff(&*current, &next)?;
            if patch.is_empty() {
                return Ok(value);
            }
            match self
                .repo
                .patch::<WorkflowInstance>(&self.name, &self.namespace, &patch)
                .await
            {
                Ok(stored) => {
                    *current = stored;
                    return Ok(value);
                }
                Err(e) if e.is_conflict() && conflicts < MAX_CONFLICT_RETRIES => {
                    conflicts += 1;
                    tracing::debug!(
                        instance = %self.qualified_name,
                        conflicts,
                        "instance changed concurrently, re-reading"
                    );
                    *current = self.load().await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Instance lifecycle
    // -----------------------------------------------------------------------

    pub async fn transition(&self, event: InstanceEvent) -> Result<WorkflowInstance, ProcessError> {
        let name = event.name();
        let instance = self
            .mutate(|instance| {
                instance.transition(event.clone())?;
                Ok(instance.clone())
            })
            .await?;
        tracing::info!(
            instance = %self.qualified_name,
            transition = name,
            status = %instance.status_type(),
            "instance transitioned"
        );
        Ok(instance)
    }

    /// Enter `Waiting`, unless a running listen activity already received its
    /// correlated events. Returns whether the instance is now waiting.
    pub async fn wait_unless_delivered(&self) -> Result<bool, ProcessError> {
        let waiting = self
            .mutate(|instance| {
                let delivered = instance.status.activities.iter().any(|a| {
                    a.kind == ActivityKind::Listen
                        && !a.status.is_terminal()
                        && instance.status.correlation_contexts.contains_key(&a.id)
                });
                if delivered {
                    return Ok(false);
                }
                instance.wait()?;
                Ok(true)
            })
            .await?;
        if waiting {
            tracing::info!(instance = %self.qualified_name, "instance waiting for events");
        }
        Ok(waiting)
    }

    // -----------------------------------------------------------------------
    // Activities
    // -----------------------------------------------------------------------

    /// Children of `parent_id` (roots when `None`), in creation order.
    pub async fn get_activities(&self, parent_id: Option<&str>) -> Vec<Activity> {
        self.instance
            .lock()
            .await
            .children(parent_id)
            .cloned()
            .collect()
    }

    pub async fn activity(&self, id: &str) -> Option<Activity> {
        self.instance.lock().await.activity(id).cloned()
    }

    /// JSON pointer of an activity inside the instance document.
    pub async fn activity_pointer(&self, id: &str) -> Option<String> {
        self.instance
            .lock()
            .await
            .status
            .activities
            .iter()
            .position(|a| a.id == id)
            .map(|index| format!("/status/activities/{index}"))
    }

    /// Append a new activity to the log.
    pub async fn create_activity(
        &self,
        kind: ActivityKind,
        name: &str,
        input: Value,
        metadata: BTreeMap<String, String>,
        parent_id: Option<&str>,
    ) -> Result<Activity, ProcessError> {
        let mut activity = Activity::new(kind, name, input, parent_id.map(str::to_string));
        activity.metadata = metadata;
        let created = self
            .mutate(|instance| {
                require_executing(instance, "create activity")?;
                instance.status.activities.push(activity.clone());
                Ok(activity.clone())
            })
            .await?;
        tracing::debug!(
            instance = %self.qualified_name,
            activity_id = %created.id,
            kind = %kind,
            name,
            "activity created"
        );
        self.publish(ActivityEvent::Created {
            instance: self.qualified_name.clone(),
            activity_id: created.id.clone(),
            kind,
            name: name.to_string(),
        });
        Ok(created)
    }

    /// Return the child of `parent_id` with this kind and name, creating it
    /// when it does not exist yet.
    pub async fn ensure_activity(
        &self,
        kind: ActivityKind,
        name: &str,
        input: Value,
        metadata: BTreeMap<String, String>,
        parent_id: Option<&str>,
    ) -> Result<Activity, ProcessError> {
        let existing = {
            let instance = self.instance.lock().await;
            instance
                .children(parent_id)
                .find(|a| a.kind == kind && a.name == name)
                .cloned()
        };
        match existing {
            Some(activity) => {
                tracing::debug!(
                    instance = %self.qualified_name,
                    activity_id = %activity.id,
                    status = activity.status.as_str(),
                    "resuming existing activity"
                );
                Ok(activity)
            }
            None => self.create_activity(kind, name, input, metadata, parent_id).await,
        }
    }

    async fn update_activity<F>(&self, id: &str, mut update: F) -> Result<Activity, ProcessError>
    where
        F: FnMut(&mut Activity) -> Result<(), TransitionError> + Send,
    {
        self.mutate(|instance| {
            require_executing(instance, "update activity")?;
            let activity = instance
                .activity_mut(id)
                .ok_or_else(|| ProcessError::ActivityNotFound(id.to_string()))?;
            update(activity)?;
            Ok(activity.clone())
        })
        .await
    }

    pub async fn start_activity(&self, id: &str) -> Result<Activity, ProcessError> {
        let activity = self.update_activity(id, Activity::start).await?;
        self.publish(ActivityEvent::Started {
            instance: self.qualified_name.clone(),
            activity_id: id.to_string(),
        });
        Ok(activity)
    }

    pub async fn complete_activity(&self, id: &str, output: Value) -> Result<Activity, ProcessError> {
        let activity = self
            .update_activity(id, |a| a.complete(output.clone()))
            .await?;
        tracing::debug!(instance = %self.qualified_name, activity_id = id, "activity completed");
        self.publish(ActivityEvent::Completed {
            instance: self.qualified_name.clone(),
            activity_id: id.to_string(),
            output,
        });
        Ok(activity)
    }

    pub async fn fault_activity(&self, id: &str, error: WorkflowError) -> Result<Activity, ProcessError> {
        let activity = self.update_activity(id, |a| a.fault(error.clone())).await?;
        tracing::warn!(
            instance = %self.qualified_name,
            activity_id = id,
            error = %error,
            "activity faulted"
        );
        self.publish(ActivityEvent::Faulted {
            instance: self.qualified_name.clone(),
            activity_id: id.to_string(),
            error,
        });
        Ok(activity)
    }

    pub async fn skip_activity(&self, id: &str) -> Result<Activity, ProcessError> {
        let activity = self.update_activity(id, Activity::skip).await?;
        self.publish(ActivityEvent::Skipped {
            instance: self.qualified_name.clone(),
            activity_id: id.to_string(),
        });
        Ok(activity)
    }

    pub async fn cancel_activity(&self, id: &str) -> Result<Activity, ProcessError> {
        let activity = self.update_activity(id, Activity::cancel).await?;
        self.publish(ActivityEvent::Cancelled {
            instance: self.qualified_name.clone(),
            activity_id: id.to_string(),
        });
        Ok(activity)
    }

    /// Merge entries into an activity's metadata.
    pub async fn annotate_activity(
        &self,
        id: &str,
        entries: BTreeMap<String, String>,
    ) -> Result<Activity, ProcessError> {
        self.update_activity(id, |a| {
            a.metadata.extend(entries.clone());
            Ok(())
        })
        .await
    }

    /// Cancel every pending or running activity. Returns how many were cancelled.
    pub async fn cancel_open_activities(&self) -> Result<usize, ProcessError> {
        let cancelled = self
            .mutate(|instance| {
                let mut ids = Vec::new();
                for activity in instance.status.activities.iter_mut() {
                    if !activity.status.is_terminal() {
                        activity.cancel()?;
                        ids.push(activity.id.clone());
                    }
                }
                Ok(ids)
            })
            .await?;
        for id in &cancelled {
            self.publish(ActivityEvent::Cancelled {
                instance: self.qualified_name.clone(),
                activity_id: id.clone(),
            });
        }
        Ok(cancelled.len())
    }

    /// Cancel an activity and every open descendant of it.
    pub async fn cancel_activity_tree(&self, root_id: &str) -> Result<usize, ProcessError> {
        let cancelled = self
            .mutate(|instance| {
                require_executing(instance, "cancel activity")?;
                let mut subtree = vec![root_id.to_string()];
                let mut cursor = 0;
                while let Some(id) = subtree.get(cursor).cloned() {
                    subtree.extend(instance.children(Some(&id)).map(|a| a.id.clone()));
                    cursor += 1;
                }
                let mut ids = Vec::new();
                for activity in instance.status.activities.iter_mut() {
                    if subtree.contains(&activity.id) && !activity.status.is_terminal() {
                        activity.cancel()?;
                        ids.push(activity.id.clone());
                    }
                }
                Ok(ids)
            })
            .await?;
        for id in &cancelled {
            self.publish(ActivityEvent::Cancelled {
                instance: self.qualified_name.clone(),
                activity_id: id.clone(),
            });
        }
        Ok(cancelled.len())
    }

    fn publish(&self, event: ActivityEvent) {
        self.services.events.publish(event);
    }

    // -----------------------------------------------------------------------
    // Expressions
    // -----------------------------------------------------------------------

    pub fn evaluate(&self, expression: &str, data: &Value) -> Result<Value, ProcessError> {
        Ok(self.services.evaluator.evaluate(expression, data)?)
    }

    pub fn evaluate_condition(&self, expression: &str, data: &Value) -> Result<bool, ProcessError> {
        Ok(self.services.evaluator.evaluate_condition(expression, data)?)
    }

    pub fn evaluate_template(&self, template: &Value, data: &Value) -> Result<Value, ProcessError> {
        Ok(self.services.evaluator.evaluate_template(template, data)?)
    }
}

impl<R: ResourceRepository> std::fmt::Debug for WorkflowRuntimeContext<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowRuntimeContext")
            .field("instance", &self.qualified_name)
            .field("workflow", &self.definition.id)
            .finish_non_exhaustive()
    }
}

fn require_executing(instance: &WorkflowInstance, transition: &'static str) -> Result<(), TransitionError> {
    if instance.status_type() == WorkflowInstanceStatusType::Executing {
        Ok(())
    } else {
        Err(TransitionError {
            subject: "instance",
            from: instance.status_type().as_str().to_string(),
            transition,
        })
    }
}
