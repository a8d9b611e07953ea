//! SQLite implementation of `ResourceRepository`.
//!
//! Each resource is one row in `resources`, keyed by (kind, namespace, name)
//! and holding the serialized document. `resource_version` is stored in its
//! own column so that a compare-and-swap write is a single
//! `UPDATE ... WHERE resource_version = ?`; zero affected rows means another
//! writer got there first.
//!
//! Watches are process-local: every committed write is published on a
//! broadcast channel. Controllers sharing one database file from several
//! processes still converge because each re-reads before writing.

use std::collections::BTreeMap;

use chrono::Utc;
use serde_json::Value;
use sqlx::Row;
use synapse_core::repository::{
    from_document, stamp_version, to_document, ResourcePatch, ResourceRepository, WatchStream,
};
use synapse_types::error::RepositoryError;
use synapse_types::resource::{LabelSelector, Resource, WatchEvent};
use tokio::sync::broadcast;

use super::pool::DatabasePool;

/// Capacity of the local watch channel.
const WATCH_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct StoredEvent {
    kind: &'static str,
    namespace: String,
    event: WatchEvent<Value>,
}

/// SQLite-backed resource repository.
#[derive(Clone)]
pub struct SqliteResourceRepository {
    pool: DatabasePool,
    events: broadcast::Sender<StoredEvent>,
}

impl SqliteResourceRepository {
    pub fn new(pool: DatabasePool) -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self { pool, events }
    }

    fn notify(&self, kind: &'static str, namespace: &str, event: WatchEvent<Value>) {
        let _ = self.events.send(StoredEvent {
            kind,
            namespace: namespace.to_string(),
            event,
        });
    }

    /// Current version of a row, read on the writer so it reflects the
    /// write that just lost.
    async fn stored_version(&self, kind: &str, name: &str, namespace: &str) -> Result<Option<u64>, RepositoryError> {
        let row = sqlx::query(
            "SELECT resource_version FROM resources WHERE kind = ? AND namespace = ? AND name = ?",
        )
        .bind(kind)
        .bind(namespace)
        .bind(name)
        .fetch_optional(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        row.map(|r| r.try_get::<i64, _>("resource_version").map(|v| v as u64))
            .transpose()
            .map_err(|e| RepositoryError::Query(e.to_string()))
    }

    /// CAS write of `document` over `expected`. Maps a lost race to
    /// `Conflict` and a vanished row to `NotFound`.
    async fn swap<T: Resource>(
        &self,
        name: &str,
        namespace: &str,
        expected: u64,
        document: &Value,
    ) -> Result<(), RepositoryError> {
        let body = serde_json::to_string(document)
            .map_err(|e| RepositoryError::Serialization(e.to_string()))?;
        let labels = labels_column(document)?;

        let result = sqlx::query(
            r#"UPDATE resources
               SET document = ?, labels = ?, resource_version = ?, updated_at = ?
               WHERE kind = ? AND namespace = ? AND name = ? AND resource_version = ?"#,
        )
        .bind(&body)
        .bind(&labels)
        .bind((expected + 1) as i64)
        .bind(Utc::now().to_rfc3339())
        .bind(T::KIND)
        .bind(namespace)
        .bind(name)
        .bind(expected as i64)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 1 {
            return Ok(());
        }
        match self.stored_version(T::KIND, name, namespace).await? {
            Some(actual) => Err(RepositoryError::Conflict {
                kind: T::KIND.to_string(),
                name: name.to_string(),
                expected,
                actual,
            }),
            None => Err(not_found::<T>(name, namespace)),
        }
    }
}

impl std::fmt::Debug for SqliteResourceRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteResourceRepository")
            .field("pool", &self.pool)
            .field("watchers", &self.events.receiver_count())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

struct ResourceRow {
    resource_version: i64,
    labels: Option<String>,
    document: String,
}

impl ResourceRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            resource_version: row.try_get("resource_version")?,
            labels: row.try_get("labels")?,
            document: row.try_get("document")?,
        })
    }

    fn labels(&self) -> Result<Option<BTreeMap<String, String>>, RepositoryError> {
        self.labels
            .as_deref()
            .map(|s| {
                serde_json::from_str(s)
                    .map_err(|e| RepositoryError::Query(format!("invalid labels: {e}")))
            })
            .transpose()
    }

    /// Parsed document, with the version column as the source of truth.
    fn into_document(self) -> Result<Value, RepositoryError> {
        let mut document: Value = serde_json::from_str(&self.document)
            .map_err(|e| RepositoryError::Query(format!("invalid document: {e}")))?;
        stamp_version(&mut document, self.resource_version as u64);
        Ok(document)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn labels_column(document: &Value) -> Result<Option<String>, RepositoryError> {
    match document.pointer("/metadata/labels") {
        Some(labels) if !labels.is_null() => serde_json::to_string(labels)
            .map(Some)
            .map_err(|e| RepositoryError::Serialization(e.to_string())),
        _ => Ok(None),
    }
}

fn not_found<T: Resource>(name: &str, namespace: &str) -> RepositoryError {
    RepositoryError::NotFound {
        kind: T::KIND.to_string(),
        name: format!("{name}.{namespace}"),
    }
}

// ---------------------------------------------------------------------------
// ResourceRepository impl
// ---------------------------------------------------------------------------

impl ResourceRepository for SqliteResourceRepository {
    async fn get<T: Resource>(&self, name: &str, namespace: &str) -> Result<Option<T>, RepositoryError> {
        let row = sqlx::query(
            "SELECT resource_version, labels, document FROM resources WHERE kind = ? AND namespace = ? AND name = ?",
        )
        .bind(T::KIND)
        .bind(namespace)
        .bind(name)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let r = ResourceRow::from_row(&row).map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(from_document(r.into_document()?)?))
            }
            None => Ok(None),
        }
    }

    async fn list<T: Resource>(
        &self,
        namespace: Option<&str>,
        selectors: &[LabelSelector],
    ) -> Result<Vec<T>, RepositoryError> {
        let rows = match namespace {
            Some(ns) => {
                sqlx::query(
                    "SELECT resource_version, labels, document FROM resources WHERE kind = ? AND namespace = ? ORDER BY name ASC",
                )
                .bind(T::KIND)
                .bind(ns)
                .fetch_all(&self.pool.reader)
                .await
            }
            None => {
                sqlx::query(
                    "SELECT resource_version, labels, document FROM resources WHERE kind = ? ORDER BY namespace ASC, name ASC",
                )
                .bind(T::KIND)
                .fetch_all(&self.pool.reader)
                .await
            }
        }
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let mut resources = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = ResourceRow::from_row(row).map_err(|e| RepositoryError::Query(e.to_string()))?;
            if !LabelSelector::matches_all(selectors, r.labels()?.as_ref()) {
                continue;
            }
            resources.push(from_document(r.into_document()?)?);
        }
        Ok(resources)
    }

    async fn add<T: Resource>(&self, resource: &T) -> Result<T, RepositoryError> {
        let mut document = to_document(resource)?;
        stamp_version(&mut document, 1);
        let body = serde_json::to_string(&document)
            .map_err(|e| RepositoryError::Serialization(e.to_string()))?;
        let now = Utc::now().to_rfc3339();

        let result = sqlx::query(
            r#"INSERT INTO resources (kind, namespace, name, resource_version, labels, document, created_at, updated_at)
               VALUES (?, ?, ?, 1, ?, ?, ?, ?)
               ON CONFLICT(kind, namespace, name) DO NOTHING"#,
        )
        .bind(T::KIND)
        .bind(resource.namespace())
        .bind(resource.name())
        .bind(labels_column(&document)?)
        .bind(&body)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::AlreadyExists {
                kind: T::KIND.to_string(),
                name: resource.qualified_name(),
            });
        }

        tracing::debug!(kind = T::KIND, resource = %resource.qualified_name(), "resource added");
        self.notify(T::KIND, resource.namespace(), WatchEvent::Added(document.clone()));
        from_document(document)
    }

    async fn replace<T: Resource>(&self, resource: &T) -> Result<T, RepositoryError> {
        let expected = resource.resource_version();
        let mut document = to_document(resource)?;
        stamp_version(&mut document, expected + 1);

        self.swap::<T>(resource.name(), resource.namespace(), expected, &document)
            .await?;

        self.notify(T::KIND, resource.namespace(), WatchEvent::Modified(document.clone()));
        from_document(document)
    }

    async fn patch<T: Resource>(
        &self,
        name: &str,
        namespace: &str,
        patch: &ResourcePatch,
    ) -> Result<T, RepositoryError> {
        let row = sqlx::query(
            "SELECT resource_version, labels, document FROM resources WHERE kind = ? AND namespace = ? AND name = ?",
        )
        .bind(T::KIND)
        .bind(namespace)
        .bind(name)
        .fetch_optional(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?
        .ok_or_else(|| not_found::<T>(name, namespace))?;

        let r = ResourceRow::from_row(&row).map_err(|e| RepositoryError::Query(e.to_string()))?;
        let actual = r.resource_version as u64;
        if actual != patch.expected_version {
            return Err(RepositoryError::Conflict {
                kind: T::KIND.to_string(),
                name: name.to_string(),
                expected: patch.expected_version,
                actual,
            });
        }

        let mut document = r.into_document()?;
        patch.apply_to(&mut document)?;
        stamp_version(&mut document, actual + 1);
        // An unreadable result is rejected before it reaches the table.
        from_document::<T>(document.clone())?;

        self.swap::<T>(name, namespace, actual, &document).await?;

        self.notify(T::KIND, namespace, WatchEvent::Modified(document.clone()));
        from_document(document)
    }

    async fn delete<T: Resource>(&self, name: &str, namespace: &str) -> Result<bool, RepositoryError> {
        let row = sqlx::query(
            "DELETE FROM resources WHERE kind = ? AND namespace = ? AND name = ? RETURNING resource_version, labels, document",
        )
        .bind(T::KIND)
        .bind(namespace)
        .bind(name)
        .fetch_optional(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let Some(row) = row else {
            return Ok(false);
        };
        let r = ResourceRow::from_row(&row).map_err(|e| RepositoryError::Query(e.to_string()))?;
        self.notify(T::KIND, namespace, WatchEvent::Deleted(r.into_document()?));
        Ok(true)
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
    use futures_util::StreamExt;
    use synapse_core::repository::update;
    use synapse_types::resource::ResourceMetadata;
    use synapse_types::workflow::{Workflow, WorkflowDefinition};

    async fn test_repo() -> (tempfile::TempDir, SqliteResourceRepository) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("test.db").display());
        let pool = DatabasePool::new(&url).await.unwrap();
        (dir, SqliteResourceRepository::new(pool))
    }

    fn workflow(name: &str, namespace: &str) -> Workflow {
        let def: WorkflowDefinition = serde_json::from_value(serde_json::json!({
            "id": name,
            "version": "1.0.0",
            "start": "hello",
            "states": [{"name": "hello", "type": "inject", "data": {"msg": "hi"}, "end": true}]
        }))
        .unwrap();
        Workflow::new(ResourceMetadata::new(name, namespace), def)
    }

    #[tokio::test]
    async fn test_add_and_get() {
        let (_dir, repo) = test_repo().await;

        let added = repo.add(&workflow("greet", "default")).await.unwrap();
        assert_eq!(added.metadata.resource_version, 1);

        let loaded: Workflow = repo.get("greet", "default").await.unwrap().unwrap();
        assert_eq!(loaded.metadata.resource_version, 1);
        assert_eq!(loaded.spec.versions.len(), 1);

        let missing: Option<Workflow> = repo.get("greet", "other").await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_add_twice_fails() {
        let (_dir, repo) = test_repo().await;
        repo.add(&workflow("greet", "default")).await.unwrap();

        let err = repo.add(&workflow("greet", "default")).await.unwrap_err();
        assert!(matches!(err, RepositoryError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_patch_bumps_version_and_stale_patch_conflicts() {
        let (_dir, repo) = test_repo().await;
        let v1 = repo.add(&workflow("greet", "default")).await.unwrap();

        let v2 = update(&repo, &v1, |w| w.metadata.set_label("team", "a")).await.unwrap();
        assert_eq!(v2.metadata.resource_version, 2);
        assert_eq!(v2.metadata.label("team"), Some("a"));

        let err = update(&repo, &v1, |w| w.metadata.set_label("team", "b"))
            .await
            .unwrap_err();
        match err {
            RepositoryError::Conflict { expected, actual, .. } => {
                assert_eq!(expected, 1);
                assert_eq!(actual, 2);
            }
            other => panic!("expected conflict, got {other:?}"),
        }

        let stored: Workflow = repo.get("greet", "default").await.unwrap().unwrap();
        assert_eq!(stored.metadata.label("team"), Some("a"));
    }

    #[tokio::test]
    async fn test_concurrent_patches_one_wins() {
        let (_dir, repo) = test_repo().await;
        let v1 = repo.add(&workflow("greet", "default")).await.unwrap();

        let (a, b) = tokio::join!(
            update(&repo, &v1, |w| w.metadata.set_label("owner", "a")),
            update(&repo, &v1, |w| w.metadata.set_label("owner", "b")),
        );
        assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
    }

    #[tokio::test]
    async fn test_replace_and_missing() {
        let (_dir, repo) = test_repo().await;
        let v1 = repo.add(&workflow("greet", "default")).await.unwrap();

        let mut next = v1.clone();
        next.spec.versions.clear();
        let v2 = repo.replace(&next).await.unwrap();
        assert_eq!(v2.metadata.resource_version, 2);
        assert!(v2.spec.versions.is_empty());

        let err = repo.replace(&next).await.unwrap_err();
        assert!(err.is_conflict());

        let err = repo.replace(&workflow("ghost", "default")).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_list_filters_namespace_and_labels() {
        let (_dir, repo) = test_repo().await;
        let mut a = workflow("a", "default");
        a.metadata.set_label("tier", "gold");
        repo.add(&a).await.unwrap();
        repo.add(&workflow("b", "default")).await.unwrap();
        repo.add(&workflow("c", "other")).await.unwrap();

        let all: Vec<Workflow> = repo.list(None, &[]).await.unwrap();
        assert_eq!(all.len(), 3);

        let default: Vec<Workflow> = repo.list(Some("default"), &[]).await.unwrap();
        let names: Vec<&str> = default.iter().map(|w| w.metadata.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);

        let gold: Vec<Workflow> = repo
            .list(None, &[LabelSelector::equals("tier", "gold")])
            .await
            .unwrap();
        assert_eq!(gold.len(), 1);

        let unlabelled: Vec<Workflow> = repo
            .list(None, &[LabelSelector::NotExists("tier".to_string())])
            .await
            .unwrap();
        assert_eq!(unlabelled.len(), 2);
    }

    #[tokio::test]
    async fn test_delete() {
        let (_dir, repo) = test_repo().await;
        repo.add(&workflow("greet", "default")).await.unwrap();

        assert!(repo.delete::<Workflow>("greet", "default").await.unwrap());
        assert!(!repo.delete::<Workflow>("greet", "default").await.unwrap());
        let gone: Option<Workflow> = repo.get("greet", "default").await.unwrap();
        assert!(gone.is_none());
    }

    #[tokio::test]
    async fn test_watch_sees_writes_in_namespace() {
        let (_dir, repo) = test_repo().await;
        let mut watch = repo.watch::<Workflow>(Some("default")).await.unwrap();

        let v1 = repo.add(&workflow("greet", "default")).await.unwrap();
        repo.add(&workflow("elsewhere", "other")).await.unwrap();
        update(&repo, &v1, |w| w.metadata.set_label("x", "1")).await.unwrap();
        repo.delete::<Workflow>("greet", "default").await.unwrap();

        let first = watch.next().await.unwrap();
        assert!(matches!(first, WatchEvent::Added(ref w) if w.metadata.name == "greet"));
        let second = watch.next().await.unwrap();
        assert!(matches!(second, WatchEvent::Modified(ref w) if w.metadata.resource_version == 2));
        let third = watch.next().await.unwrap();
        assert!(third.is_deleted());
    }

    #[tokio::test]
    async fn test_resources_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("persist.db").display());
        {
            let repo = SqliteResourceRepository::new(DatabasePool::new(&url).await.unwrap());
            let v1 = repo.add(&workflow("greet", "default")).await.unwrap();
            update(&repo, &v1, |w| w.metadata.set_label("kept", "yes")).await.unwrap();
        }

        let repo = SqliteResourceRepository::new(DatabasePool::new(&url).await.unwrap());
        let loaded: Workflow = repo.get("greet", "default").await.unwrap().unwrap();
        assert_eq!(loaded.metadata.resource_version, 2);
        assert_eq!(loaded.metadata.label("kept"), Some("yes"));
    }
}
