//! Per-correlation event handler.
//!
//! # Execution flow
//!
//! 1. Subscribe to the cloud event bus when started.
//! 2. For each event, re-read the correlation; skip it when completed, when
//!    the selector rejects the event, or when a context already holds it.
//! 3. Feed the event to the first active context that accepts it, otherwise
//!    open a new context keyed by the event id.
//! 4. When the context satisfies the consumption strategy, fire the outcome
//!    (start an instance, or deliver to a waiting one) and mark the context
//!    completed. Ephemeral correlations complete with it.
//! 5. Persist the correlation as a patch; on a version conflict start over
//!    from step 2 with a fresh read.
//!
//! Outcomes are idempotent (deterministic instance names, keyed delivery),
//! so replaying a step after a conflict never starts a workflow twice.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};
use synapse_types::correlation::{
    Correlation, CorrelationContext, CorrelationContextStatus, CorrelationOutcome, CorrelationPhase,
};
use synapse_types::error::RepositoryError;
use synapse_types::event::CloudEvent;
use synapse_types::instance::{WorkflowInstance, WorkflowInstanceStatusType, WorkflowReference};
use synapse_types::resource::{labels, ResourceMetadata};
use synapse_types::workflow::Workflow;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::event::CloudEventBus;
use crate::expression::ExpressionError;
use crate::repository::{ResourcePatch, ResourceRepository};
use crate::schema::{SchemaError, SchemaValidator};

use super::matcher::CorrelationMatcher;

/// Completed contexts kept per correlation for redelivery detection.
pub const MAX_COMPLETED_CONTEXTS: usize = 64;

const MAX_CONFLICT_RETRIES: usize = 8;

/// Back-off between attempts at an event that failed on storage.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(5);

/// Readable part of a started instance's name.
const NAME_PREFIX_LEN: usize = 24;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CorrelationError {
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("invalid outcome: {0}")]
    Validation(String),

    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("expression error: {0}")]
    Expression(#[from] ExpressionError),

    #[error("instance '{0}' to correlate does not exist")]
    TargetNotFound(String),

    #[error("correlation '{0}' kept conflicting, giving up")]
    ConflictRetriesExhausted(String),

    #[error("instance '{instance}' was started for context '{existing}', not '{context}'")]
    InstanceNameTaken {
        instance: String,
        context: String,
        existing: String,
    },
}

impl CorrelationError {
    /// Errors caused by the outcome itself rather than by storage; the
    /// offending context is discarded instead of retried.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::Schema(_)
                | Self::Expression(_)
                | Self::TargetNotFound(_)
                | Self::InstanceNameTaken { .. }
        )
    }
}

// ---------------------------------------------------------------------------
// Services
// ---------------------------------------------------------------------------

/// Shared collaborators of every correlation handler.
#[derive(Clone)]
pub struct CorrelationServices {
    pub matcher: Arc<CorrelationMatcher>,
    pub schemas: Arc<SchemaValidator>,
    pub events: CloudEventBus,
}

impl std::fmt::Debug for CorrelationServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelationServices")
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

/// What handling one event did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventDisposition {
    /// Not relevant to this correlation, or already recorded.
    Ignored,
    /// Recorded into a context that is not yet satisfied.
    Accumulated,
    /// Completed a context and fired the outcome.
    Fired,
    /// Completed a context whose outcome was rejected; the context was dropped.
    Rejected,
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

pub struct CorrelationHandler<R: ResourceRepository + 'static> {
    repo: Arc<R>,
    services: CorrelationServices,
    name: String,
    namespace: String,
    cancel: CancellationToken,
    disposed: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<R: ResourceRepository + 'static> CorrelationHandler<R> {
    pub fn new(repo: Arc<R>, services: CorrelationServices, correlation: &Correlation) -> Self {
        Self {
            repo,
            services,
            name: correlation.metadata.name.clone(),
            namespace: correlation.metadata.namespace.clone(),
            cancel: CancellationToken::new(),
            disposed: AtomicBool::new(false),
            task: Mutex::new(None),
        }
    }

    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.name, self.namespace)
    }

    /// Subscribe to the bus and process events in the background.
    ///
    /// The subscription is taken before this returns, so every event
    /// published afterwards reaches the handler.
    pub fn start(self: &Arc<Self>) {
        if self.is_disposed() {
            return;
        }
        let mut subscription = self.services.events.subscribe();
        let handler = Arc::clone(self);
        let task = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    biased;
                    _ = handler.cancel.cancelled() => break,
                    event = subscription.recv() => event,
                };
                let Some(event) = event else { break };
                match handler.handle_until_applied(&event).await {
                    Some(EventDisposition::Fired) if handler.is_completed().await => {
                        tracing::info!(correlation = %handler.qualified_name(), "correlation completed");
                        break;
                    }
                    Some(_) => {}
                    None => break,
                }
            }
            subscription.unsubscribe();
            tracing::debug!(correlation = %handler.qualified_name(), "correlation handler stopped");
        });
        if let Ok(mut slot) = self.task.lock() {
            *slot = Some(task);
        }
        tracing::info!(correlation = %self.qualified_name(), "correlation handler started");
    }

    /// Stop handling events. Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        tracing::debug!(correlation = %self.qualified_name(), "correlation handler disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Whether the background task has exited.
    pub fn is_finished(&self) -> bool {
        self.task
            .lock()
            .map(|slot| slot.as_ref().is_none_or(JoinHandle::is_finished))
            .unwrap_or(true)
    }

    async fn is_completed(&self) -> bool {
        match self.repo.get::<Correlation>(&self.name, &self.namespace).await {
            Ok(Some(correlation)) => correlation.status.phase == CorrelationPhase::Completed,
            Ok(None) => true,
            Err(_) => false,
        }
    }

    /// Handle `event`, retrying with back-off while storage fails.
    ///
    /// Rejected outcomes are resolved inside `handle_event`, so every error
    /// reaching this loop is worth another attempt. `None` when the handler
    /// is cancelled first.
    async fn handle_until_applied(&self, event: &CloudEvent) -> Option<EventDisposition> {
        let mut delay = RETRY_BASE_DELAY;
        let mut attempt = 1u32;
        loop {
            match self.handle_event(event).await {
                Ok(disposition) => return Some(disposition),
                Err(e) => tracing::warn!(
                    correlation = %self.qualified_name(),
                    event_id = %event.id,
                    attempt,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %e,
                    "failed to handle cloud event, retrying"
                ),
            }
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }
            delay = (delay * 2).min(RETRY_MAX_DELAY);
            attempt += 1;
        }
    }

    /// Handle one event against the stored correlation.
    pub async fn handle_event(&self, event: &CloudEvent) -> Result<EventDisposition, CorrelationError> {
        for _ in 0..MAX_CONFLICT_RETRIES {
            let Some(current) = self.repo.get::<Correlation>(&self.name, &self.namespace).await? else {
                tracing::debug!(correlation = %self.qualified_name(), "correlation deleted, disposing handler");
                self.dispose();
                return Ok(EventDisposition::Ignored);
            };
            let Some((next, disposition)) = self.apply(&current, event).await? else {
                return Ok(EventDisposition::Ignored);
            };

            let patch = ResourcePatch::diff(&current, &next)?;
            match self.repo.patch::<Correlation>(&self.name, &self.namespace, &patch).await {
                Ok(_) => return Ok(disposition),
                Err(RepositoryError::Conflict { .. }) => {
                    tracing::debug!(
                        correlation = %self.qualified_name(),
                        event_id = %event.id,
                        "correlation changed concurrently, retrying"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(CorrelationError::ConflictRetriesExhausted(self.qualified_name()))
    }

    /// Compute the correlation after `event`, firing the outcome when a
    /// context completes. `None` when the event is irrelevant.
    async fn apply(
        &self,
        current: &Correlation,
        event: &CloudEvent,
    ) -> Result<Option<(Correlation, EventDisposition)>, CorrelationError> {
        if current.status.phase == CorrelationPhase::Completed {
            return Ok(None);
        }
        let matcher = &self.services.matcher;
        if !matcher.matches_selector(current.spec.selector.as_ref(), event) {
            return Ok(None);
        }
        if current.status.contexts.iter().any(|c| c.contains_event(&event.id)) {
            tracing::debug!(
                correlation = %self.qualified_name(),
                event_id = %event.id,
                "event already correlated"
            );
            return Ok(None);
        }

        let mut next = current.clone();
        let strategy = &current.spec.events;
        let accepted = next
            .status
            .contexts
            .iter_mut()
            .position(|c| c.status == CorrelationContextStatus::Active && matcher.try_correlate(strategy, c, event));
        let index = match accepted {
            Some(index) => index,
            None => {
                let mut context = CorrelationContext::new(event.id.clone());
                if !matcher.try_correlate(strategy, &mut context, event) {
                    return Ok(None);
                }
                next.status.contexts.push(context);
                next.status.contexts.len() - 1
            }
        };

        let now = Utc::now();
        next.status.last_modified = Some(now);
        if next.status.phase == CorrelationPhase::Pending {
            next.status.phase = CorrelationPhase::Active;
        }

        let context = next.status.contexts[index].clone();
        if !CorrelationMatcher::is_satisfied(strategy, &context) {
            tracing::debug!(
                correlation = %self.qualified_name(),
                context = %context.id,
                event_id = %event.id,
                matched = context.events.len(),
                "event correlated"
            );
            return Ok(Some((next, EventDisposition::Accumulated)));
        }

        let disposition = match self.fire(current, &context).await {
            Ok(()) => {
                next.status.contexts[index].status = CorrelationContextStatus::Completed;
                if current.is_ephemeral() {
                    next.status.phase = CorrelationPhase::Completed;
                }
                EventDisposition::Fired
            }
            Err(e) if e.is_rejection() => {
                tracing::warn!(
                    correlation = %self.qualified_name(),
                    context = %context.id,
                    error = %e,
                    "correlation outcome rejected, discarding context"
                );
                next.status.contexts.remove(index);
                EventDisposition::Rejected
            }
            Err(e) => return Err(e),
        };
        prune_completed(&mut next.status.contexts);
        Ok(Some((next, disposition)))
    }

    async fn fire(&self, correlation: &Correlation, context: &CorrelationContext) -> Result<(), CorrelationError> {
        match &correlation.spec.outcome {
            CorrelationOutcome::Start {
                workflow,
                namespace,
                version,
                input,
            } => {
                let namespace = namespace.as_deref().unwrap_or(&correlation.metadata.namespace);
                self.start_instance(correlation, context, workflow, namespace, version.as_deref(), input.as_ref())
                    .await
            }
            CorrelationOutcome::Correlate {
                instance,
                namespace,
                task,
            } => {
                let namespace = namespace.as_deref().unwrap_or(&correlation.metadata.namespace);
                self.deliver(context, instance, namespace, task).await
            }
        }
    }

    async fn start_instance(
        &self,
        correlation: &Correlation,
        context: &CorrelationContext,
        workflow: &str,
        namespace: &str,
        version: Option<&str>,
        input: Option<&Value>,
    ) -> Result<(), CorrelationError> {
        let resource = self
            .repo
            .get::<Workflow>(workflow, namespace)
            .await?
            .ok_or_else(|| CorrelationError::Validation(format!("workflow '{workflow}.{namespace}' not found")))?;
        let definition = resource.resolve(version).ok_or_else(|| {
            CorrelationError::Validation(format!(
                "workflow '{workflow}.{namespace}' has no version '{}'",
                version.unwrap_or("latest")
            ))
        })?;

        let document = context.to_value();
        let input = match input {
            Some(template) => self.services.matcher.evaluator().evaluate_template(template, &document)?,
            None => document,
        };
        if let Some(schema) = &definition.input_schema {
            let result = self.services.schemas.validate(&input, schema).await?;
            if !result.is_success() {
                return Err(CorrelationError::Validation(format!(
                    "input of '{workflow}' is invalid: {}",
                    result.summary()
                )));
            }
        }

        let name = instance_name(&correlation.metadata.name, &context.id);
        let metadata =
            ResourceMetadata::new(name.clone(), namespace).with_label(labels::CORRELATION, correlation.metadata.name.clone());
        let mut instance = WorkflowInstance::new(
            metadata,
            WorkflowReference {
                name: workflow.to_string(),
                namespace: namespace.to_string(),
                version: definition.version.clone(),
            },
            input,
        );
        instance.spec.correlation_context = Some(context.clone());

        match self.repo.add(&instance).await {
            Ok(_) => tracing::info!(
                correlation = %self.qualified_name(),
                context = %context.id,
                instance = %format!("{name}.{namespace}"),
                workflow,
                version = definition.version.as_str(),
                "workflow instance started from correlation"
            ),
            Err(RepositoryError::AlreadyExists { .. }) => {
                // Deleted since the add: a storage race, retried by the caller.
                let existing = self.repo.get::<WorkflowInstance>(&name, namespace).await?.ok_or_else(|| {
                    RepositoryError::NotFound {
                        kind: "WorkflowInstance".to_string(),
                        name: format!("{name}.{namespace}"),
                    }
                })?;
                let existing = existing.spec.correlation_context.map(|c| c.id).unwrap_or_default();
                if existing != context.id {
                    return Err(CorrelationError::InstanceNameTaken {
                        instance: format!("{name}.{namespace}"),
                        context: context.id.clone(),
                        existing,
                    });
                }
                tracing::debug!(
                    correlation = %self.qualified_name(),
                    instance = name.as_str(),
                    "instance already started for context"
                );
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    async fn deliver(
        &self,
        context: &CorrelationContext,
        instance: &str,
        namespace: &str,
        task: &str,
    ) -> Result<(), CorrelationError> {
        for _ in 0..MAX_CONFLICT_RETRIES {
            let current = self
                .repo
                .get::<WorkflowInstance>(instance, namespace)
                .await?
                .ok_or_else(|| CorrelationError::TargetNotFound(format!("{instance}.{namespace}")))?;
            if current.status_type().is_terminal() {
                return Err(CorrelationError::Validation(format!(
                    "instance '{instance}.{namespace}' already {}",
                    current.status_type().as_str()
                )));
            }

            let mut next = current.clone();
            next.status.correlation_contexts.insert(task.to_string(), context.clone());
            if next.status_type() == WorkflowInstanceStatusType::Waiting {
                if let Err(e) = next.awake() {
                    tracing::warn!(instance, error = %e, "failed to awake instance");
                }
            }
            let patch = ResourcePatch::diff(&current, &next)?;
            if patch.is_empty() {
                return Ok(());
            }
            match self.repo.patch::<WorkflowInstance>(instance, namespace, &patch).await {
                Ok(stored) => {
                    tracing::info!(
                        correlation = %self.qualified_name(),
                        context = %context.id,
                        instance = %format!("{instance}.{namespace}"),
                        task,
                        status = stored.status_type().as_str(),
                        "correlation context delivered"
                    );
                    return Ok(());
                }
                Err(RepositoryError::Conflict { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(CorrelationError::ConflictRetriesExhausted(format!("{instance}.{namespace}")))
    }
}

impl<R: ResourceRepository + 'static> Drop for CorrelationHandler<R> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl<R: ResourceRepository + 'static> std::fmt::Debug for CorrelationHandler<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelationHandler")
            .field("correlation", &self.qualified_name())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Drop the oldest completed contexts beyond `MAX_COMPLETED_CONTEXTS`.
fn prune_completed(contexts: &mut Vec<CorrelationContext>) {
    let completed = contexts
        .iter()
        .filter(|c| c.status == CorrelationContextStatus::Completed)
        .count();
    let mut excess = completed.saturating_sub(MAX_COMPLETED_CONTEXTS);
    contexts.retain(|c| {
        if excess > 0 && c.status == CorrelationContextStatus::Completed {
            excess -= 1;
            return false;
        }
        true
    });
}

/// Name of the instance started for a context: a readable prefix of the
/// context id plus a digest of the whole id, so distinct ids never share
/// a name.
fn instance_name(correlation: &str, context_id: &str) -> String {
    let digest = format!("{:x}", Sha256::digest(context_id.as_bytes()));
    format!("{correlation}-{}-{}", sanitize(context_id), &digest[..12])
}

/// Resource-name-safe rendering of a context id.
fn sanitize(id: &str) -> String {
    let mut name: String = id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .take(NAME_PREFIX_LEN)
        .collect();
    while name.ends_with('-') {
        name.pop();
    }
    if name.is_empty() {
        name.push_str("context");
    }
    name
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicUsize;

    use serde_json::json;
    use synapse_types::correlation::{
        ConsumptionMode, CorrelationKeyDefinition, CorrelationLifetime, CorrelationSpec, EventConsumptionStrategy,
        EventFilter,
    };
    use synapse_types::resource::{LabelSelector, Resource};

    use super::*;
    use crate::expression::WorkflowEvaluator;
    use crate::external::testing::StaticResourceProvider;
    use crate::repository::{update, MemoryResourceRepository, WatchStream};
    use crate::runtime::context::testing::{executing_instance, publish_workflow};
    use crate::schema::testing::RequiredKeysHandler;

    const FULFILMENT: &str = r#"
id: fulfilment
version: 1.0.0
start: ship
input_schema:
  document:
    required: [keys]
states:
  - name: ship
    type: inject
    data: {}
    end: true
"#;

    fn services(events: CloudEventBus) -> CorrelationServices {
        let evaluator = Arc::new(WorkflowEvaluator::new());
        CorrelationServices {
            matcher: Arc::new(CorrelationMatcher::new(evaluator)),
            schemas: Arc::new(
                SchemaValidator::new(Arc::new(StaticResourceProvider::default()))
                    .with_handler(Arc::new(RequiredKeysHandler)),
            ),
            events,
        }
    }

    /// Memory repository whose first `failing_adds` instance inserts fail.
    struct FlakyRepository {
        inner: MemoryResourceRepository,
        failing_adds: AtomicUsize,
    }

    impl ResourceRepository for FlakyRepository {
        async fn get<T: Resource>(&self, name: &str, namespace: &str) -> Result<Option<T>, RepositoryError> {
            self.inner.get(name, namespace).await
        }

        async fn list<T: Resource>(
            &self,
            namespace: Option<&str>,
            selectors: &[LabelSelector],
        ) -> Result<Vec<T>, RepositoryError> {
            self.inner.list(namespace, selectors).await
        }

        async fn add<T: Resource>(&self, resource: &T) -> Result<T, RepositoryError> {
            let fail = T::KIND == WorkflowInstance::KIND
                && self
                    .failing_adds
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
            if fail {
                return Err(RepositoryError::Connection);
            }
            self.inner.add(resource).await
        }

        async fn replace<T: Resource>(&self, resource: &T) -> Result<T, RepositoryError> {
            self.inner.replace(resource).await
        }

        async fn patch<T: Resource>(
            &self,
            name: &str,
            namespace: &str,
            patch: &ResourcePatch,
        ) -> Result<T, RepositoryError> {
            self.inner.patch(name, namespace, patch).await
        }

        async fn delete<T: Resource>(&self, name: &str, namespace: &str) -> Result<bool, RepositoryError> {
            self.inner.delete::<T>(name, namespace).await
        }

        async fn watch<T: Resource>(&self, namespace: Option<&str>) -> Result<WatchStream<T>, RepositoryError> {
            self.inner.watch(namespace).await
        }
    }

    fn filter(event_type: &str) -> EventFilter {
        EventFilter {
            attributes: BTreeMap::from([("type".to_string(), event_type.to_string())]),
            correlate: vec![CorrelationKeyDefinition {
                key: "order".to_string(),
                from: "subject".to_string(),
                expect: None,
            }],
        }
    }

    fn order_correlation(lifetime: CorrelationLifetime, outcome: CorrelationOutcome) -> Correlation {
        Correlation::new(
            ResourceMetadata::new("orders", "default"),
            CorrelationSpec {
                lifetime,
                selector: None,
                events: EventConsumptionStrategy {
                    strategy: ConsumptionMode::All,
                    filters: vec![filter("com.example.order.placed"), filter("com.example.order.paid")],
                },
                outcome,
            },
        )
    }

    fn start_fulfilment() -> CorrelationOutcome {
        CorrelationOutcome::Start {
            workflow: "fulfilment".to_string(),
            namespace: None,
            version: None,
            input: None,
        }
    }

    fn event(id: &str, event_type: &str, order: &str) -> CloudEvent {
        CloudEvent::new(id, "/orders", event_type).with_subject(order)
    }

    async fn handler(
        repo: &Arc<MemoryResourceRepository>,
        correlation: Correlation,
    ) -> CorrelationHandler<MemoryResourceRepository> {
        let stored = repo.add(&correlation).await.unwrap();
        CorrelationHandler::new(Arc::clone(repo), services(CloudEventBus::new()), &stored)
    }

    async fn instances(repo: &MemoryResourceRepository) -> Vec<WorkflowInstance> {
        repo.list(
            Some("default"),
            &[LabelSelector::equals(labels::CORRELATION, "orders")],
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_all_filters_fire_once() {
        let repo = Arc::new(MemoryResourceRepository::new());
        publish_workflow(&repo, FULFILMENT).await;
        let h = handler(&repo, order_correlation(CorrelationLifetime::Durable, start_fulfilment())).await;

        let placed = event("e-1", "com.example.order.placed", "o-1");
        assert_eq!(h.handle_event(&placed).await.unwrap(), EventDisposition::Accumulated);
        assert!(instances(&repo).await.is_empty());

        // A payment for another order opens its own context.
        let other = event("e-2", "com.example.order.paid", "o-2");
        assert_eq!(h.handle_event(&other).await.unwrap(), EventDisposition::Accumulated);
        assert!(instances(&repo).await.is_empty());

        let paid = event("e-3", "com.example.order.paid", "o-1");
        assert_eq!(h.handle_event(&paid).await.unwrap(), EventDisposition::Fired);

        let started = instances(&repo).await;
        assert_eq!(started.len(), 1);
        let instance = &started[0];
        assert_eq!(instance.metadata.name, instance_name("orders", "e-1"));
        assert!(instance.metadata.name.starts_with("orders-e-1-"));
        assert_eq!(instance.status_type(), WorkflowInstanceStatusType::Pending);
        assert_eq!(instance.spec.input["keys"]["order"], "o-1");
        let context = instance.spec.correlation_context.as_ref().unwrap();
        assert_eq!(context.events.len(), 2);

        let stored: Correlation = repo.get("orders", "default").await.unwrap().unwrap();
        assert_eq!(stored.status.phase, CorrelationPhase::Active);
        assert_eq!(stored.active_contexts().count(), 1);
        assert_eq!(stored.status.contexts[0].status, CorrelationContextStatus::Completed);
    }

    #[tokio::test]
    async fn test_redelivery_is_ignored() {
        let repo = Arc::new(MemoryResourceRepository::new());
        publish_workflow(&repo, FULFILMENT).await;
        let h = handler(&repo, order_correlation(CorrelationLifetime::Durable, start_fulfilment())).await;

        h.handle_event(&event("e-1", "com.example.order.placed", "o-1")).await.unwrap();
        let paid = event("e-2", "com.example.order.paid", "o-1");
        assert_eq!(h.handle_event(&paid).await.unwrap(), EventDisposition::Fired);
        let before: Correlation = repo.get("orders", "default").await.unwrap().unwrap();

        assert_eq!(h.handle_event(&paid).await.unwrap(), EventDisposition::Ignored);
        let after: Correlation = repo.get("orders", "default").await.unwrap().unwrap();
        assert_eq!(before.metadata.resource_version, after.metadata.resource_version);
        assert_eq!(instances(&repo).await.len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_input_discards_context() {
        let repo = Arc::new(MemoryResourceRepository::new());
        publish_workflow(&repo, FULFILMENT).await;
        let outcome = CorrelationOutcome::Start {
            workflow: "fulfilment".to_string(),
            namespace: None,
            version: None,
            input: Some(json!({"order": "${ keys.order }"})),
        };
        let h = handler(&repo, order_correlation(CorrelationLifetime::Durable, outcome)).await;

        h.handle_event(&event("e-1", "com.example.order.placed", "o-1")).await.unwrap();
        let paid = event("e-2", "com.example.order.paid", "o-1");
        assert_eq!(h.handle_event(&paid).await.unwrap(), EventDisposition::Rejected);

        assert!(instances(&repo).await.is_empty());
        let stored: Correlation = repo.get("orders", "default").await.unwrap().unwrap();
        assert!(stored.status.contexts.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_workflow_is_rejected() {
        let repo = Arc::new(MemoryResourceRepository::new());
        let h = handler(&repo, order_correlation(CorrelationLifetime::Durable, start_fulfilment())).await;

        h.handle_event(&event("e-1", "com.example.order.placed", "o-1")).await.unwrap();
        let disposition = h.handle_event(&event("e-2", "com.example.order.paid", "o-1")).await.unwrap();
        assert_eq!(disposition, EventDisposition::Rejected);
        assert!(instances(&repo).await.is_empty());
    }

    #[tokio::test]
    async fn test_correlate_delivers_and_awakes_waiting_instance() {
        let repo = Arc::new(MemoryResourceRepository::new());
        let definition = publish_workflow(&repo, FULFILMENT).await;
        let instance = executing_instance(&repo, "run-1", &definition, json!({})).await;
        update(&*repo, &instance, |i| i.wait().unwrap()).await.unwrap();

        let outcome = CorrelationOutcome::Correlate {
            instance: "run-1".to_string(),
            namespace: None,
            task: "activity-1".to_string(),
        };
        let h = handler(&repo, order_correlation(CorrelationLifetime::Ephemeral, outcome)).await;

        h.handle_event(&event("e-1", "com.example.order.placed", "o-1")).await.unwrap();
        h.handle_event(&event("e-2", "com.example.order.paid", "o-1")).await.unwrap();

        let stored: WorkflowInstance = repo.get("run-1", "default").await.unwrap().unwrap();
        assert_eq!(stored.status_type(), WorkflowInstanceStatusType::Awakening);
        assert_eq!(stored.status.correlation_contexts["activity-1"].id, "e-1");

        let correlation: Correlation = repo.get("orders", "default").await.unwrap().unwrap();
        assert_eq!(correlation.status.phase, CorrelationPhase::Completed);

        // A completed ephemeral correlation ignores further events.
        let late = event("e-3", "com.example.order.placed", "o-9");
        assert_eq!(h.handle_event(&late).await.unwrap(), EventDisposition::Ignored);
    }

    #[tokio::test]
    async fn test_started_handler_consumes_bus_and_stops_when_completed() {
        let repo = Arc::new(MemoryResourceRepository::new());
        publish_workflow(&repo, FULFILMENT).await;
        let bus = CloudEventBus::new();
        let stored = repo
            .add(&order_correlation(CorrelationLifetime::Ephemeral, start_fulfilment()))
            .await
            .unwrap();
        let h = Arc::new(CorrelationHandler::new(Arc::clone(&repo), services(bus.clone()), &stored));
        h.start();
        assert_eq!(bus.subscriber_count(), 1);

        bus.publish(event("e-1", "com.example.order.placed", "o-1"));
        bus.publish(event("e-2", "com.example.order.paid", "o-1"));

        for _ in 0..200 {
            if h.is_finished() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(h.is_finished());
        assert_eq!(instances(&repo).await.len(), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_storage_failure_is_retried_until_fired() {
        let inner = MemoryResourceRepository::new();
        publish_workflow(&inner, FULFILMENT).await;
        let repo = Arc::new(FlakyRepository {
            inner,
            failing_adds: AtomicUsize::new(1),
        });
        let bus = CloudEventBus::new();
        let stored = repo
            .add(&order_correlation(CorrelationLifetime::Durable, start_fulfilment()))
            .await
            .unwrap();
        let h = Arc::new(CorrelationHandler::new(Arc::clone(&repo), services(bus.clone()), &stored));
        h.start();

        bus.publish(event("e-1", "com.example.order.placed", "o-1"));
        bus.publish(event("e-2", "com.example.order.paid", "o-1"));

        for _ in 0..200 {
            if !instances(&repo.inner).await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(repo.failing_adds.load(Ordering::SeqCst), 0);
        assert_eq!(instances(&repo.inner).await.len(), 1);

        let correlation: Correlation = repo.get("orders", "default").await.unwrap().unwrap();
        assert_eq!(correlation.status.contexts.len(), 1);
        assert_eq!(correlation.status.contexts[0].status, CorrelationContextStatus::Completed);
        h.dispose();
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent() {
        let repo = Arc::new(MemoryResourceRepository::new());
        let bus = CloudEventBus::new();
        let stored = repo
            .add(&order_correlation(CorrelationLifetime::Durable, start_fulfilment()))
            .await
            .unwrap();
        let h = Arc::new(CorrelationHandler::new(Arc::clone(&repo), services(bus.clone()), &stored));
        h.start();

        h.dispose();
        h.dispose();
        assert!(h.is_disposed());
        for _ in 0..200 {
            if h.is_finished() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(h.is_finished());
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_prune_keeps_most_recent_completed() {
        let mut contexts: Vec<CorrelationContext> = (0..MAX_COMPLETED_CONTEXTS + 3)
            .map(|i| {
                let mut c = CorrelationContext::new(format!("c-{i}"));
                c.status = CorrelationContextStatus::Completed;
                c
            })
            .collect();
        contexts.push(CorrelationContext::new("active"));
        prune_completed(&mut contexts);

        assert_eq!(contexts.len(), MAX_COMPLETED_CONTEXTS + 1);
        assert_eq!(contexts[0].id, "c-3");
        assert_eq!(contexts.last().unwrap().id, "active");
    }

    #[tokio::test]
    async fn test_similar_context_ids_start_distinct_instances() {
        let repo = Arc::new(MemoryResourceRepository::new());
        publish_workflow(&repo, FULFILMENT).await;
        let h = handler(&repo, order_correlation(CorrelationLifetime::Durable, start_fulfilment())).await;

        h.handle_event(&event("EV:1", "com.example.order.placed", "o-1")).await.unwrap();
        let first = h.handle_event(&event("x", "com.example.order.paid", "o-1")).await.unwrap();
        h.handle_event(&event("ev-1", "com.example.order.placed", "o-2")).await.unwrap();
        let second = h.handle_event(&event("y", "com.example.order.paid", "o-2")).await.unwrap();
        assert_eq!((first, second), (EventDisposition::Fired, EventDisposition::Fired));

        let mut orders: Vec<String> = instances(&repo)
            .await
            .iter()
            .map(|i| i.spec.input["keys"]["order"].as_str().unwrap().to_string())
            .collect();
        orders.sort();
        assert_eq!(orders, vec!["o-1", "o-2"]);
    }

    #[tokio::test]
    async fn test_name_held_by_another_context_is_rejected() {
        let repo = Arc::new(MemoryResourceRepository::new());
        let definition = publish_workflow(&repo, FULFILMENT).await;
        let squatter = WorkflowInstance::new(
            ResourceMetadata::new(instance_name("orders", "e-1"), "default"),
            WorkflowReference {
                name: "fulfilment".to_string(),
                namespace: "default".to_string(),
                version: definition.version.clone(),
            },
            json!({}),
        );
        repo.add(&squatter).await.unwrap();
        let h = handler(&repo, order_correlation(CorrelationLifetime::Durable, start_fulfilment())).await;

        h.handle_event(&event("e-1", "com.example.order.placed", "o-1")).await.unwrap();
        let disposition = h.handle_event(&event("e-2", "com.example.order.paid", "o-1")).await.unwrap();
        assert_eq!(disposition, EventDisposition::Rejected);
    }

    #[test]
    fn test_instance_name_is_injective_over_sanitized_ids() {
        let long = "urn:example:orders:2026:region-eu-west:batch-0000000001";
        let other = "urn:example:orders:2026:region-eu-west:batch-0000000002";
        assert_ne!(instance_name("orders", "EV:1"), instance_name("orders", "ev-1"));
        assert_ne!(instance_name("orders", long), instance_name("orders", other));
        assert_eq!(instance_name("orders", "e-1"), instance_name("orders", "e-1"));
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("A1B2-c3"), "a1b2-c3");
        assert_eq!(sanitize("urn:uuid:42/"), "urn-uuid-42");
        assert_eq!(sanitize("///"), "context");
    }
}
