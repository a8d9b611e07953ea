//! Optimistic ownership claims.
//!
//! A controller owns a resource by stamping its qualified name into the
//! resource's owner label through a version-guarded patch. Two controllers
//! racing for the same resource both compute a patch from the same version;
//! the repository accepts exactly one. Conflicts are reported as a lost
//! claim rather than retried here: the caller's watch loop sees the fresh
//! state and tries again if the resource is still free.

use synapse_types::correlation::{Correlation, CorrelationPhase};
use synapse_types::error::RepositoryError;
use synapse_types::instance::{WorkflowInstance, WorkflowInstanceStatusType};
use synapse_types::resource::{labels, Resource};

use crate::repository::{ResourcePatch, ResourceRepository};

/// A resource a controller can take ownership of.
pub trait Claimable: Resource {
    /// Label holding the owner's qualified name.
    const OWNER_LABEL: &'static str;

    /// Whether the resource still awaits its first owner.
    fn is_pending(&self) -> bool;

    /// Move a pending resource into its active lifecycle.
    fn activate(&mut self);

    /// Undo `activate` on release, where the lifecycle allows it.
    fn deactivate(&mut self);

    fn owner(&self) -> Option<&str> {
        self.metadata().label(Self::OWNER_LABEL)
    }

    fn is_owned_by(&self, owner: &str) -> bool {
        self.owner() == Some(owner)
    }
}

impl Claimable for Correlation {
    const OWNER_LABEL: &'static str = labels::CORRELATOR;

    fn is_pending(&self) -> bool {
        self.status.phase == CorrelationPhase::Pending
    }

    fn activate(&mut self) {
        self.status.phase = CorrelationPhase::Active;
    }

    fn deactivate(&mut self) {
        if self.status.phase == CorrelationPhase::Active {
            self.status.phase = CorrelationPhase::Pending;
        }
    }
}

impl Claimable for WorkflowInstance {
    const OWNER_LABEL: &'static str = labels::RUNNER;

    fn is_pending(&self) -> bool {
        self.status_type() == WorkflowInstanceStatusType::Pending
    }

    fn activate(&mut self) {
        if let Err(e) = self.initialize() {
            tracing::warn!(instance = %self.qualified_name(), error = %e, "failed to initialize claimed instance");
        }
    }

    /// Instance lifecycles only move forward; releasing keeps the status.
    fn deactivate(&mut self) {}
}

/// Try to take ownership of `resource` for `owner`.
///
/// Returns the stored resource on success (including when `owner` already
/// holds it), `None` when another owner holds it or a concurrent write won.
pub async fn try_claim<R, T>(repo: &R, resource: &T, owner: &str) -> Result<Option<T>, RepositoryError>
where
    R: ResourceRepository,
    T: Claimable,
{
    let claimed = match resource.owner() {
        Some(current) if current == owner => resource.clone(),
        Some(current) => {
            tracing::debug!(
                kind = T::KIND,
                resource = %resource.qualified_name(),
                owner = current,
                "resource owned by another controller"
            );
            return Ok(None);
        }
        None => {
            let mut next = resource.clone();
            next.metadata_mut().set_label(T::OWNER_LABEL, owner);
            match patch(repo, resource, &next).await? {
                Some(stored) => stored,
                None => return Ok(None),
            }
        }
    };

    if !claimed.is_pending() {
        return Ok(Some(claimed));
    }
    let mut next = claimed.clone();
    next.activate();
    let activated = patch(repo, &claimed, &next).await?;
    if activated.is_some() {
        tracing::info!(kind = T::KIND, resource = %claimed.qualified_name(), owner, "resource claimed");
    }
    Ok(activated)
}

/// Give up ownership of `resource`. Returns whether it was released.
pub async fn try_release<R, T>(repo: &R, resource: &T, owner: &str) -> Result<bool, RepositoryError>
where
    R: ResourceRepository,
    T: Claimable,
{
    if !resource.is_owned_by(owner) {
        return Ok(false);
    }
    let mut next = resource.clone();
    next.metadata_mut().remove_label(T::OWNER_LABEL);
    next.deactivate();
    let released = patch(repo, resource, &next).await?.is_some();
    if released {
        tracing::info!(kind = T::KIND, resource = %resource.qualified_name(), owner, "resource released");
    }
    Ok(released)
}

/// Patch `current` into `next`; `None` on a version conflict.
async fn patch<R, T>(repo: &R, current: &T, next: &T) -> Result<Option<T>, RepositoryError>
where
    R: ResourceRepository,
    T: Resource,
{
    let diff = ResourcePatch::diff(current, next)?;
    if diff.is_empty() {
        return Ok(Some(current.clone()));
    }
    match repo.patch::<T>(current.name(), current.namespace(), &diff).await {
        Ok(stored) => Ok(Some(stored)),
        Err(RepositoryError::Conflict { .. }) => {
            tracing::debug!(kind = T::KIND, resource = %current.qualified_name(), "claim lost to concurrent write");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}
