//! Reconciliation controllers.
//!
//! Controllers list and watch one resource kind, claim the resources they
//! can own, and run a worker per owned resource:
//!
//! - `CorrelatorController`: one `CorrelationHandler` per correlation.
//! - `WorkflowInstanceController`: one `WorkflowRuntime` per instance.
//!
//! Ownership is recorded in a label (see `claim`), so several controller
//! processes can share a repository.

pub mod claim;
pub mod correlator;
pub mod instance;

use synapse_types::error::{RepositoryError, TransitionError};

pub use claim::{try_claim, try_release, Claimable};
pub use correlator::CorrelatorController;
pub use instance::WorkflowInstanceController;

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    #[error("controller already started")]
    AlreadyStarted,
}
