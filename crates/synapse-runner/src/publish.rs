//! Publishing workflow definitions into the repository.

use synapse_core::repository::{update, ResourceRepository};
use synapse_types::error::RepositoryError;
use synapse_types::resource::ResourceMetadata;
use synapse_types::workflow::{Workflow, WorkflowDefinition};

/// What publishing one definition did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Published {
    Created,
    VersionAdded,
    /// The version already exists; definitions are immutable per version.
    Unchanged,
}

/// Store `definition` as a version of the workflow named by its id.
pub async fn publish_definition<R: ResourceRepository>(
    repo: &R,
    namespace: &str,
    definition: &WorkflowDefinition,
) -> Result<Published, RepositoryError> {
    let existing: Option<Workflow> = repo.get(&definition.id, namespace).await?;
    let Some(workflow) = existing else {
        let workflow = Workflow::new(
            ResourceMetadata::new(definition.id.clone(), namespace),
            definition.clone(),
        );
        repo.add(&workflow).await?;
        tracing::info!(workflow = definition.id.as_str(), version = definition.version.as_str(), "workflow published");
        return Ok(Published::Created);
    };

    match workflow.version(&definition.version) {
        Some(stored) if stored == definition => Ok(Published::Unchanged),
        Some(_) => {
            tracing::warn!(
                workflow = definition.id.as_str(),
                version = definition.version.as_str(),
                "published version differs from file, bump the version to change it"
            );
            Ok(Published::Unchanged)
        }
        None => {
            update(repo, &workflow, |w| w.spec.versions.push(definition.clone())).await?;
            tracing::info!(workflow = definition.id.as_str(), version = definition.version.as_str(), "workflow version added");
            Ok(Published::VersionAdded)
        }
    }
}
