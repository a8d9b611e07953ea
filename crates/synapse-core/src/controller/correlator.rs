//! Correlator controller: runs one handler per owned correlation.
//!
//! # Execution flow
//!
//! 1. Open a watch on correlations, then list the existing ones, so nothing
//!    created between the two is missed.
//! 2. Reconcile each correlation seen: claim it when free, start a
//!    `CorrelationHandler` for it once owned.
//! 3. Dispose handlers of deleted, completed or lost correlations. Completed
//!    ephemeral correlations are deleted.
//! 4. On shutdown: stop the watch loop, dispose every handler and release
//!    every correlation still labelled with this correlator.

use std::sync::Arc;

use dashmap::DashMap;
use futures_util::StreamExt;
use synapse_types::config::CorrelatorConfig;
use synapse_types::correlation::{Correlation, CorrelationPhase};
use synapse_types::resource::{labels, LabelSelector, Resource, WatchEvent};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::correlation::{CorrelationHandler, CorrelationServices};
use crate::repository::ResourceRepository;

use super::claim::{try_claim, try_release, Claimable};
use super::ControllerError;

pub struct CorrelatorController<R: ResourceRepository + 'static> {
    repo: Arc<R>,
    services: CorrelationServices,
    /// Qualified name stamped into the owner label.
    owner: String,
    /// Handlers by qualified correlation name.
    handlers: DashMap<String, Arc<CorrelationHandler<R>>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<R: ResourceRepository + 'static> CorrelatorController<R> {
    pub fn new(repo: Arc<R>, services: CorrelationServices, config: &CorrelatorConfig) -> Arc<Self> {
        Arc::new(Self {
            repo,
            services,
            owner: config.qualified_name(),
            handlers: DashMap::new(),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        })
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Number of correlations currently handled.
    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_handling(&self, qualified_name: &str) -> bool {
        self.handlers.contains_key(qualified_name)
    }

    /// Reconcile existing correlations and keep watching for changes.
    pub async fn start(self: &Arc<Self>) -> Result<(), ControllerError> {
        let mut slot = self.task.lock().await;
        if slot.is_some() {
            return Err(ControllerError::AlreadyStarted);
        }

        let mut changes = self.repo.watch::<Correlation>(None).await?;
        let existing: Vec<Correlation> = self.repo.list(None, &[]).await?;
        for correlation in existing {
            self.reconcile(correlation).await;
        }

        let controller = Arc::clone(self);
        *slot = Some(tokio::spawn(async move {
            loop {
                let change = tokio::select! {
                    biased;
                    _ = controller.cancel.cancelled() => break,
                    change = changes.next() => change,
                };
                match change {
                    Some(WatchEvent::Deleted(correlation)) => controller.forget(&correlation.qualified_name()),
                    Some(WatchEvent::Added(correlation) | WatchEvent::Modified(correlation)) => {
                        controller.reconcile(correlation).await;
                    }
                    None => {
                        tracing::warn!(correlator = controller.owner.as_str(), "correlation watch ended");
                        break;
                    }
                }
            }
        }));
        tracing::info!(correlator = self.owner.as_str(), handlers = self.handlers.len(), "correlator started");
        Ok(())
    }

    async fn reconcile(&self, correlation: Correlation) {
        let name = correlation.qualified_name();
        if let Some(owner) = correlation.owner() {
            if owner != self.owner {
                if self.handlers.contains_key(&name) {
                    tracing::warn!(correlation = name.as_str(), owner, "correlation claimed elsewhere, stopping handler");
                    self.forget(&name);
                }
                return;
            }
        }

        if correlation.status.phase == CorrelationPhase::Completed {
            self.forget(&name);
            if correlation.is_ephemeral() && correlation.is_owned_by(&self.owner) {
                match self
                    .repo
                    .delete::<Correlation>(correlation.name(), correlation.namespace())
                    .await
                {
                    Ok(_) => tracing::info!(correlation = name.as_str(), "completed ephemeral correlation deleted"),
                    Err(e) => tracing::warn!(correlation = name.as_str(), error = %e, "failed to delete correlation"),
                }
            }
            return;
        }

        if self.handlers.contains_key(&name) {
            return;
        }
        let claimed = match try_claim(&*self.repo, &correlation, &self.owner).await {
            Ok(Some(claimed)) => claimed,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(correlation = name.as_str(), error = %e, "failed to claim correlation");
                return;
            }
        };

        let handler = Arc::new(CorrelationHandler::new(
            Arc::clone(&self.repo),
            self.services.clone(),
            &claimed,
        ));
        handler.start();
        self.handlers.insert(name, handler);
    }

    fn forget(&self, name: &str) {
        if let Some((_, handler)) = self.handlers.remove(name) {
            handler.dispose();
        }
    }

    /// Stop every handler and release every owned correlation.
    pub async fn shutdown(&self) -> Result<(), ControllerError> {
        self.cancel.cancel();
        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                tracing::warn!(correlator = self.owner.as_str(), error = %e, "correlator loop panicked");
            }
        }
        for entry in self.handlers.iter() {
            entry.value().dispose();
        }
        self.handlers.clear();

        let owned: Vec<Correlation> = self
            .repo
            .list(None, &[LabelSelector::equals(labels::CORRELATOR, self.owner.clone())])
            .await?;
        let mut released = 0;
        for correlation in &owned {
            match try_release(&*self.repo, correlation, &self.owner).await {
                Ok(true) => released += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!(
                    correlation = %correlation.qualified_name(),
                    error = %e,
                    "failed to release correlation"
                ),
            }
        }
        tracing::info!(correlator = self.owner.as_str(), released, "correlator stopped");
        Ok(())
    }
}

impl<R: ResourceRepository + 'static> std::fmt::Debug for CorrelatorController<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelatorController")
            .field("owner", &self.owner)
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use synapse_types::correlation::{
        ConsumptionMode, CorrelationLifetime, CorrelationOutcome, CorrelationSpec, EventConsumptionStrategy,
        EventFilter,
    };
    use synapse_types::event::CloudEvent;
    use synapse_types::instance::WorkflowInstance;
    use synapse_types::resource::ResourceMetadata;

    use super::*;
    use crate::correlation::CorrelationMatcher;
    use crate::event::CloudEventBus;
    use crate::expression::WorkflowEvaluator;
    use crate::external::testing::StaticResourceProvider;
    use crate::repository::MemoryResourceRepository;
    use crate::runtime::context::testing::{publish_workflow, NOOP_WORKFLOW};
    use crate::schema::SchemaValidator;

    fn services(events: CloudEventBus) -> CorrelationServices {
        CorrelationServices {
            matcher: Arc::new(CorrelationMatcher::new(Arc::new(WorkflowEvaluator::new()))),
            schemas: Arc::new(SchemaValidator::new(Arc::new(StaticResourceProvider::default()))),
            events,
        }
    }

    fn config(name: &str) -> CorrelatorConfig {
        CorrelatorConfig {
            name: name.to_string(),
            namespace: "default".to_string(),
        }
    }

    fn correlation(name: &str, lifetime: CorrelationLifetime) -> Correlation {
        Correlation::new(
            ResourceMetadata::new(name, "default"),
            CorrelationSpec {
                lifetime,
                selector: None,
                events: EventConsumptionStrategy {
                    strategy: ConsumptionMode::One,
                    filters: vec![EventFilter {
                        attributes: BTreeMap::from([("type".to_string(), "com.example.ping".to_string())]),
                        correlate: Vec::new(),
                    }],
                },
                outcome: CorrelationOutcome::Start {
                    workflow: "noop".to_string(),
                    namespace: None,
                    version: None,
                    input: None,
                },
            },
        )
    }

    async fn eventually(condition: impl Fn() -> bool) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_claims_existing_and_new_correlations() {
        let repo = Arc::new(MemoryResourceRepository::new());
        repo.add(&correlation("first", CorrelationLifetime::Durable)).await.unwrap();

        let controller = CorrelatorController::new(Arc::clone(&repo), services(CloudEventBus::new()), &config("c1"));
        controller.start().await.unwrap();
        assert!(controller.is_handling("first.default"));

        repo.add(&correlation("second", CorrelationLifetime::Durable)).await.unwrap();
        eventually(|| controller.is_handling("second.default")).await;

        let stored: Correlation = repo.get("second", "default").await.unwrap().unwrap();
        assert_eq!(stored.owner(), Some("c1.default"));
        assert_eq!(stored.status.phase, CorrelationPhase::Active);

        repo.delete::<Correlation>("second", "default").await.unwrap();
        eventually(|| !controller.is_handling("second.default")).await;
        controller.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_second_correlator_does_not_steal() {
        let repo = Arc::new(MemoryResourceRepository::new());
        repo.add(&correlation("shared", CorrelationLifetime::Durable)).await.unwrap();

        let first = CorrelatorController::new(Arc::clone(&repo), services(CloudEventBus::new()), &config("c1"));
        first.start().await.unwrap();
        let second = CorrelatorController::new(Arc::clone(&repo), services(CloudEventBus::new()), &config("c2"));
        second.start().await.unwrap();

        assert!(first.is_handling("shared.default"));
        assert_eq!(second.handler_count(), 0);

        first.shutdown().await.unwrap();
        second.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_completed_ephemeral_correlation_is_deleted() {
        let repo = Arc::new(MemoryResourceRepository::new());
        publish_workflow(&repo, NOOP_WORKFLOW).await;
        repo.add(&correlation("once", CorrelationLifetime::Ephemeral)).await.unwrap();
        let bus = CloudEventBus::new();

        let controller = CorrelatorController::new(Arc::clone(&repo), services(bus.clone()), &config("c1"));
        controller.start().await.unwrap();
        bus.publish(CloudEvent::new("evt-1", "/tests", "com.example.ping"));

        eventually(|| !controller.is_handling("once.default")).await;
        for _ in 0..400 {
            if repo.get::<Correlation>("once", "default").await.unwrap().is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(repo.get::<Correlation>("once", "default").await.unwrap().is_none());
        let started: Vec<WorkflowInstance> = repo.list(Some("default"), &[]).await.unwrap();
        assert_eq!(started.len(), 1);
        controller.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_releases_claims() {
        let repo = Arc::new(MemoryResourceRepository::new());
        repo.add(&correlation("a", CorrelationLifetime::Durable)).await.unwrap();
        repo.add(&correlation("b", CorrelationLifetime::Durable)).await.unwrap();

        let controller = CorrelatorController::new(Arc::clone(&repo), services(CloudEventBus::new()), &config("c1"));
        controller.start().await.unwrap();
        assert_eq!(controller.handler_count(), 2);

        controller.shutdown().await.unwrap();
        assert_eq!(controller.handler_count(), 0);
        let all: Vec<Correlation> = repo.list(None, &[]).await.unwrap();
        assert!(all.iter().all(|c| c.owner().is_none()));
        assert!(all.iter().all(|c| c.status.phase == CorrelationPhase::Pending));
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let repo = Arc::new(MemoryResourceRepository::new());
        let controller = CorrelatorController::new(repo, services(CloudEventBus::new()), &config("c1"));
        controller.start().await.unwrap();
        assert!(matches!(controller.start().await, Err(ControllerError::AlreadyStarted)));
        controller.shutdown().await.unwrap();
    }
}
