//! In-process resource repository.
//!
//! Stores resources as JSON documents in a `DashMap`. Version checks and
//! writes for one key happen under the map's shard lock, so concurrent
//! writers observe the same compare-and-swap semantics as the SQLite
//! implementation. Watches are served from a broadcast channel.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;
use synapse_types::error::RepositoryError;
use synapse_types::resource::{LabelSelector, Resource, WatchEvent};
use tokio::sync::broadcast;

use super::{from_document, stamp_version, to_document, ResourcePatch, ResourceRepository, WatchStream};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ResourceKey {
    kind: &'static str,
    namespace: String,
    name: String,
}

impl ResourceKey {
    fn new<T: Resource>(name: &str, namespace: &str) -> Self {
        Self {
            kind: T::KIND,
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct StoredEvent {
    kind: &'static str,
    namespace: String,
    event: WatchEvent<Value>,
}

/// `ResourceRepository` backed by process memory.
#[derive(Clone)]
pub struct MemoryResourceRepository {
    documents: Arc<DashMap<ResourceKey, Value>>,
    events: broadcast::Sender<StoredEvent>,
}

impl MemoryResourceRepository {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            documents: Arc::new(DashMap::new()),
            events,
        }
    }

    fn notify(&self, kind: &'static str, namespace: &str, event: WatchEvent<Value>) {
        let _ = self.events.send(StoredEvent {
            kind,
            namespace: namespace.to_string(),
            event,
        });
    }

    fn conflict<T: Resource>(name: &str, expected: u64, actual: u64) -> RepositoryError {
        RepositoryError::Conflict {
            kind: T::KIND.to_string(),
            name: name.to_string(),
            expected,
            actual,
        }
    }

    fn not_found<T: Resource>(name: &str, namespace: &str) -> RepositoryError {
        RepositoryError::NotFound {
            kind: T::KIND.to_string(),
            name: format!("{name}.{namespace}"),
        }
    }
}

impl Default for MemoryResourceRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryResourceRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryResourceRepository")
            .field("resources", &self.documents.len())
            .finish()
    }
}

fn stored_version(document: &Value) -> u64 {
    document
        .pointer("/metadata/resource_version")
        .and_then(Value::as_u64)
        .unwrap_or(0)
}

fn labels_of(document: &Value) -> Option<std::collections::BTreeMap<String, String>> {
    document
        .pointer("/metadata/labels")
        .and_then(|labels| serde_json::from_value(labels.clone()).ok())
}

impl ResourceRepository for MemoryResourceRepository {
    async fn get<T: Resource>(&self, name: &str, namespace: &str) -> Result<Option<T>, RepositoryError> {
        let key = ResourceKey::new::<T>(name, namespace);
        let document = self.documents.get(&key).map(|d| d.value().clone());
        document.map(from_document).transpose()
    }

    async fn list<T: Resource>(
        &self,
        namespace: Option<&str>,
        selectors: &[LabelSelector],
    ) -> Result<Vec<T>, RepositoryError> {
        let mut documents: Vec<Value> = self
            .documents
            .iter()
            .filter(|entry| {
                let key = entry.key();
                key.kind == T::KIND && namespace.is_none_or(|ns| key.namespace == ns)
            })
            .filter(|entry| LabelSelector::matches_all(selectors, labels_of(entry.value()).as_ref()))
            .map(|entry| entry.value().clone())
            .collect();
        documents.sort_by(|a, b| {
            let name = |d: &Value| {
                (
                    d.pointer("/metadata/namespace").and_then(Value::as_str).unwrap_or("").to_string(),
                    d.pointer("/metadata/name").and_then(Value::as_str).unwrap_or("").to_string(),
                )
            };
            name(a).cmp(&name(b))
        });
        documents.into_iter().map(from_document).collect()
    }

    async fn add<T: Resource>(&self, resource: &T) -> Result<T, RepositoryError> {
        let key = ResourceKey::new::<T>(resource.name(), resource.namespace());
        let mut document = to_document(resource)?;
        stamp_version(&mut document, 1);
        match self.documents.entry(key) {
            Entry::Occupied(_) => {
                return Err(RepositoryError::AlreadyExists {
                    kind: T::KIND.to_string(),
                    name: resource.qualified_name(),
                });
            }
            Entry::Vacant(slot) => {
                slot.insert(document.clone());
            }
        }
        self.notify(T::KIND, resource.namespace(), WatchEvent::Added(document.clone()));
        from_document(document)
    }

    async fn replace<T: Resource>(&self, resource: &T) -> Result<T, RepositoryError> {
        let key = ResourceKey::new::<T>(resource.name(), resource.namespace());
        let document = {
            let mut stored = self
                .documents
                .get_mut(&key)
                .ok_or_else(|| Self::not_found::<T>(resource.name(), resource.namespace()))?;
            let actual = stored_version(stored.value());
            if actual != resource.resource_version() {
                return Err(Self::conflict::<T>(resource.name(), resource.resource_version(), actual));
            }
            let mut document = to_document(resource)?;
            stamp_version(&mut document, actual + 1);
            *stored.value_mut() = document.clone();
            document
        };
        self.notify(T::KIND, resource.namespace(), WatchEvent::Modified(document.clone()));
        from_document(document)
    }

    async fn patch<T: Resource>(
        &self,
        name: &str,
        namespace: &str,
        patch: &ResourcePatch,
    ) -> Result<T, RepositoryError> {
        let key = ResourceKey::new::<T>(name, namespace);
        let document = {
            let mut stored = self
                .documents
                .get_mut(&key)
                .ok_or_else(|| Self::not_found::<T>(name, namespace))?;
            let actual = stored_version(stored.value());
            if actual != patch.expected_version {
                return Err(Self::conflict::<T>(name, patch.expected_version, actual));
            }
            let mut document = stored.value().clone();
            patch.apply_to(&mut document)?;
            stamp_version(&mut document, actual + 1);
            // Reject patches that produce an unreadable resource before committing.
            from_document::<T>(document.clone())?;
            *stored.value_mut() = document.clone();
            document
        };
        self.notify(T::KIND, namespace, WatchEvent::Modified(document.clone()));
        from_document(document)
    }

    async fn delete<T: Resource>(&self, name: &str, namespace: &str) -> Result<bool, RepositoryError> {
        let key = ResourceKey::new::<T>(name, namespace);
        match self.documents.remove(&key) {
            Some((_, document)) => {
                self.notify(T::KIND, namespace, WatchEvent::Deleted(document));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn watch<T: Resource>(&self, namespace: Option<&str>) -> Result<WatchStream<T>, RepositoryError> {
        let mut receiver = self.events.subscribe();
        let namespace = namespace.map(str::to_string);
        let stream = async_stream::stream! {
            loop {
                match receiver.recv().await {
                    Ok(stored) => {
                        if stored.kind != T::KIND
                            || namespace.as_deref().is_some_and(|ns| ns != stored.namespace)
                        {
                            continue;
                        }
                        let event = match stored.event {
                            WatchEvent::Added(d) => from_document::<T>(d).map(WatchEvent::Added),
                            WatchEvent::Modified(d) => from_document::<T>(d).map(WatchEvent::Modified),
                            WatchEvent::Deleted(d) => from_document::<T>(d).map(WatchEvent::Deleted),
                        };
                        match event {
                            Ok(event) => yield event,
                            Err(e) => tracing::warn!(kind = T::KIND, error = %e, "skipping undecodable watch event"),
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(kind = T::KIND, skipped, "watch subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::update;
    use futures_util::StreamExt;
    use synapse_types::resource::ResourceMetadata;
    use synapse_types::correlation::{
        Correlation, CorrelationOutcome, CorrelationSpec, EventConsumptionStrategy, EventFilter,
    };

    fn correlation(name: &str) -> Correlation {
        Correlation::new(
            ResourceMetadata::new(name, "default"),
            CorrelationSpec {
                lifetime: Default::default(),
                selector: None,
                events: EventConsumptionStrategy {
                    strategy: Default::default(),
                    filters: vec![EventFilter::default()],
                },
                outcome: CorrelationOutcome::Start {
                    workflow: "wf".to_string(),
                    namespace: None,
                    version: None,
                    input: None,
                },
            },
        )
    }

    #[tokio::test]
    async fn test_add_get_and_duplicate() {
        let repo = MemoryResourceRepository::new();
        let stored = repo.add(&correlation("c1")).await.unwrap();
        assert_eq!(stored.resource_version(), 1);

        let fetched: Correlation = repo.get("c1", "default").await.unwrap().unwrap();
        assert_eq!(fetched.name(), "c1");
        assert!(repo.get::<Correlation>("c1", "other").await.unwrap().is_none());

        let err = repo.add(&correlation("c1")).await.unwrap_err();
        assert!(matches!(err, RepositoryError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_patch_bumps_version_and_detects_conflict() {
        let repo = MemoryResourceRepository::new();
        let v1 = repo.add(&correlation("c1")).await.unwrap();

        let v2 = update(&repo, &v1, |c| c.metadata.set_label("owner", "a")).await.unwrap();
        assert_eq!(v2.resource_version(), 2);
        assert_eq!(v2.metadata.label("owner"), Some("a"));

        // A second writer still holding v1 loses.
        let err = update(&repo, &v1, |c| c.metadata.set_label("owner", "b"))
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let current: Correlation = repo.get("c1", "default").await.unwrap().unwrap();
        assert_eq!(current.metadata.label("owner"), Some("a"));
    }

    #[tokio::test]
    async fn test_replace_is_version_guarded() {
        let repo = MemoryResourceRepository::new();
        let mut v1 = repo.add(&correlation("c1")).await.unwrap();
        v1.metadata.set_label("x", "1");
        let v2 = repo.replace(&v1).await.unwrap();
        assert_eq!(v2.resource_version(), 2);
        assert!(repo.replace(&v1).await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn test_list_filters_namespace_and_labels() {
        let repo = MemoryResourceRepository::new();
        let mut owned = correlation("a");
        owned.metadata.set_label("synapse.io/correlator", "c.default");
        repo.add(&owned).await.unwrap();
        repo.add(&correlation("b")).await.unwrap();
        let mut elsewhere = correlation("c");
        elsewhere.metadata.namespace = "other".to_string();
        repo.add(&elsewhere).await.unwrap();

        let all: Vec<Correlation> = repo.list(None, &[]).await.unwrap();
        assert_eq!(all.len(), 3);

        let unowned: Vec<Correlation> = repo
            .list(Some("default"), &[LabelSelector::NotExists("synapse.io/correlator".into())])
            .await
            .unwrap();
        assert_eq!(unowned.len(), 1);
        assert_eq!(unowned[0].name(), "b");
    }

    #[tokio::test]
    async fn test_delete_and_watch() {
        let repo = MemoryResourceRepository::new();
        let mut watch = repo.watch::<Correlation>(Some("default")).await.unwrap();

        let stored = repo.add(&correlation("c1")).await.unwrap();
        update(&repo, &stored, |c| c.metadata.set_label("k", "v")).await.unwrap();
        assert!(repo.delete::<Correlation>("c1", "default").await.unwrap());
        assert!(!repo.delete::<Correlation>("c1", "default").await.unwrap());

        assert!(matches!(watch.next().await, Some(WatchEvent::Added(_))));
        assert!(matches!(watch.next().await, Some(WatchEvent::Modified(c)) if c.metadata.label("k") == Some("v")));
        assert!(matches!(watch.next().await, Some(WatchEvent::Deleted(_))));
    }

    #[tokio::test]
    async fn test_patch_missing_resource_is_not_found() {
        let repo = MemoryResourceRepository::new();
        let c = correlation("ghost");
        let err = update(&repo, &c, |c| c.metadata.set_label("k", "v")).await.unwrap_err();
        assert!(err.is_not_found());
    }
}
