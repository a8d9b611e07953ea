//! Resource repository port.
//!
//! Defines the storage interface for every resource kind. Writes are
//! optimistic: each carries the `resource_version` it was computed from and
//! fails with `RepositoryError::Conflict` when the stored resource has moved
//! on. The infrastructure layer (synapse-infra) implements this trait with
//! SQLite; `memory` provides an in-process implementation.

pub mod memory;

use std::pin::Pin;

use futures_util::Stream;
use serde_json::Value;
use synapse_types::error::RepositoryError;
use synapse_types::resource::{LabelSelector, Resource, WatchEvent};

pub use memory::MemoryResourceRepository;

/// Stream of change notifications for one resource kind.
pub type WatchStream<T> = Pin<Box<dyn Stream<Item = WatchEvent<T>> + Send>>;

// ---------------------------------------------------------------------------
// Patches
// ---------------------------------------------------------------------------

/// A structural diff between two snapshots of a resource, applied as a
/// compare-and-swap against `expected_version`.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourcePatch {
    pub operations: json_patch::Patch,
    pub expected_version: u64,
}

impl ResourcePatch {
    /// Diff `before` (the snapshot read from the repository) against `after`.
    pub fn diff<T: Resource>(before: &T, after: &T) -> Result<Self, RepositoryError> {
        let left = to_document(before)?;
        let right = to_document(after)?;
        Ok(Self {
            operations: json_patch::diff(&left, &right),
            expected_version: before.resource_version(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.operations.0.is_empty()
    }

    /// Apply the operations to a stored document in place.
    ///
    /// On failure the document may be partially patched; callers apply to a
    /// copy.
    pub fn apply_to(&self, document: &mut Value) -> Result<(), RepositoryError> {
        json_patch::patch(document, &self.operations.0)
            .map_err(|e| RepositoryError::InvalidPatch(e.to_string()))
    }
}

pub fn to_document<T: Resource>(resource: &T) -> Result<Value, RepositoryError> {
    serde_json::to_value(resource).map_err(|e| RepositoryError::Serialization(e.to_string()))
}

pub fn from_document<T: Resource>(document: Value) -> Result<T, RepositoryError> {
    serde_json::from_value(document).map_err(|e| RepositoryError::Serialization(e.to_string()))
}

/// Overwrite `metadata.resource_version` of a stored document.
pub fn stamp_version(document: &mut Value, version: u64) {
    if let Some(metadata) = document.get_mut("metadata").and_then(Value::as_object_mut) {
        metadata.insert("resource_version".to_string(), Value::from(version));
    }
}

// ---------------------------------------------------------------------------
// Repository trait
// ---------------------------------------------------------------------------

/// Repository trait for resource persistence.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait ResourceRepository: Send + Sync {
    /// Get a resource by name and namespace.
    fn get<T: Resource>(
        &self,
        name: &str,
        namespace: &str,
    ) -> impl std::future::Future<Output = Result<Option<T>, RepositoryError>> + Send;

    /// List resources, optionally restricted to a namespace, matching every selector.
    fn list<T: Resource>(
        &self,
        namespace: Option<&str>,
        selectors: &[LabelSelector],
    ) -> impl std::future::Future<Output = Result<Vec<T>, RepositoryError>> + Send;

    /// Insert a new resource. Fails with `AlreadyExists` on a name clash.
    fn add<T: Resource>(
        &self,
        resource: &T,
    ) -> impl std::future::Future<Output = Result<T, RepositoryError>> + Send;

    /// Replace a resource wholesale, guarded by its `resource_version`.
    fn replace<T: Resource>(
        &self,
        resource: &T,
    ) -> impl std::future::Future<Output = Result<T, RepositoryError>> + Send;

    /// Apply a patch, guarded by `patch.expected_version`.
    fn patch<T: Resource>(
        &self,
        name: &str,
        namespace: &str,
        patch: &ResourcePatch,
    ) -> impl std::future::Future<Output = Result<T, RepositoryError>> + Send;

    /// Delete a resource. Returns `true` if it existed.
    fn delete<T: Resource>(
        &self,
        name: &str,
        namespace: &str,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Watch changes to resources of kind `T`, optionally in one namespace.
    fn watch<T: Resource>(
        &self,
        namespace: Option<&str>,
    ) -> impl std::future::Future<Output = Result<WatchStream<T>, RepositoryError>> + Send;
}

/// Clone-mutate-diff-patch cycle against the snapshot `current`.
///
/// Returns the stored result, or `current` unchanged when `mutate` produced
/// no difference. Conflicts are returned to the caller.
pub async fn update<R, T, F>(repo: &R, current: &T, mutate: F) -> Result<T, RepositoryError>
where
    R: ResourceRepository,
    T: Resource,
    F: FnOnce(&mut T),
{
    let mut next = current.clone();
    mutate(&mut next);
    let patch = ResourcePatch::diff(current, &next)?;
    if patch.is_empty() {
        return Ok(current.clone());
    }
    repo.patch::<T>(current.name(), current.namespace(), &patch).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use synapse_types::resource::ResourceMetadata;
    use synapse_types::workflow::{Workflow, WorkflowDefinition};

    fn workflow() -> Workflow {
        let def: WorkflowDefinition = serde_json::from_value(serde_json::json!({
            "id": "greet",
            "version": "1.0.0",
            "start": "hello",
            "states": [{"name": "hello", "type": "inject", "data": {"msg": "hi"}, "end": true}]
        }))
        .unwrap();
        let mut wf = Workflow::new(ResourceMetadata::new("greet", "default"), def);
        wf.metadata.resource_version = 7;
        wf
    }

    #[test]
    fn test_diff_captures_label_change_and_version() {
        let before = workflow();
        let mut after = before.clone();
        after.metadata.set_label("owner", "me");

        let patch = ResourcePatch::diff(&before, &after).unwrap();
        assert_eq!(patch.expected_version, 7);
        assert!(!patch.is_empty());

        let mut doc = to_document(&before).unwrap();
        patch.apply_to(&mut doc).unwrap();
        let patched: Workflow = from_document(doc).unwrap();
        assert_eq!(patched.metadata.label("owner"), Some("me"));
    }

    #[test]
    fn test_identical_snapshots_give_empty_patch() {
        let wf = workflow();
        assert!(ResourcePatch::diff(&wf, &wf.clone()).unwrap().is_empty());
    }

    #[test]
    fn test_stamp_version() {
        let mut doc = to_document(&workflow()).unwrap();
        stamp_version(&mut doc, 9);
        assert_eq!(doc["metadata"]["resource_version"], 9);
    }
}
