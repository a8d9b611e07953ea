//! Activity processors.
//!
//! Each node of an instance's activity tree is driven by one
//! `ActivityProcessor`: a tagged variant per activity kind sharing a single
//! lifecycle. `process` first consults the persisted record so that a
//! recovered runtime never re-runs finished work, starts the activity, runs
//! the kind-specific logic (recursing into child processors) and finally
//! persists the outcome.

mod action;
mod branch;
mod listen;
mod state;
mod subflow;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use synapse_types::activity::{Activity, ActivityStatus};
use synapse_types::error::{RepositoryError, TransitionError, WorkflowError};
use tokio_util::sync::CancellationToken;

use crate::expression::ExpressionError;
use crate::repository::ResourceRepository;

use super::context::WorkflowRuntimeContext;

pub use action::{ActionProcessor, FunctionProcessor};
pub use branch::{BranchProcessor, IterationProcessor};
pub use listen::ListenProcessor;
pub use state::StateProcessor;
pub use subflow::SubFlowProcessor;

// ---------------------------------------------------------------------------
// Outcome and errors
// ---------------------------------------------------------------------------

/// How processing of an activity ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ActivityOutcome {
    Completed(Value),
    /// The guard condition evaluated false.
    Skipped,
    /// Blocked on correlated events; the activity stays running.
    Waiting,
    /// Processing was interrupted; the activity stays running.
    Cancelled,
}

/// Errors raised while processing activities.
///
/// `Fault` is a business error recorded on the activity and routed through
/// the state's error handlers. The other variants are infrastructure or
/// contract failures and leave the activity as it was.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("activity '{0}' not found")]
    ActivityNotFound(String),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("{0}")]
    Fault(WorkflowError),
}

impl ProcessError {
    /// Transient infrastructure failures that a re-run may overcome.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProcessError::Repository(
                RepositoryError::Conflict { .. } | RepositoryError::Connection | RepositoryError::Query(_)
            )
        )
    }

    pub fn fault(error_type: &str, title: impl Into<String>, detail: impl Into<String>) -> Self {
        ProcessError::Fault(WorkflowError::new(error_type, title).with_detail(detail))
    }
}

impl From<ExpressionError> for ProcessError {
    fn from(e: ExpressionError) -> Self {
        ProcessError::fault(WorkflowError::EXPRESSION, "expression evaluation failed", e.to_string())
    }
}

pub type ProcessFuture<'a> = Pin<Box<dyn Future<Output = Result<ActivityOutcome, ProcessError>> + Send + 'a>>;

// ---------------------------------------------------------------------------
// ActivityProcessor
// ---------------------------------------------------------------------------

pub enum ActivityProcessor<R: ResourceRepository + 'static> {
    State(StateProcessor<R>),
    Action(ActionProcessor<R>),
    Function(FunctionProcessor<R>),
    SubFlow(SubFlowProcessor<R>),
    Branch(BranchProcessor<R>),
    Iteration(IterationProcessor<R>),
    Listen(ListenProcessor<R>),
}

impl<R: ResourceRepository + 'static> ActivityProcessor<R> {
    pub fn activity(&self) -> &Activity {
        match self {
            ActivityProcessor::State(p) => &p.activity,
            ActivityProcessor::Action(p) => &p.activity,
            ActivityProcessor::Function(p) => &p.activity,
            ActivityProcessor::SubFlow(p) => &p.activity,
            ActivityProcessor::Branch(p) => &p.activity,
            ActivityProcessor::Iteration(p) => &p.activity,
            ActivityProcessor::Listen(p) => &p.activity,
        }
    }

    fn activity_mut(&mut self) -> &mut Activity {
        match self {
            ActivityProcessor::State(p) => &mut p.activity,
            ActivityProcessor::Action(p) => &mut p.activity,
            ActivityProcessor::Function(p) => &mut p.activity,
            ActivityProcessor::SubFlow(p) => &mut p.activity,
            ActivityProcessor::Branch(p) => &mut p.activity,
            ActivityProcessor::Iteration(p) => &mut p.activity,
            ActivityProcessor::Listen(p) => &mut p.activity,
        }
    }

    fn context(&self) -> Arc<WorkflowRuntimeContext<R>> {
        let ctx = match self {
            ActivityProcessor::State(p) => &p.ctx,
            ActivityProcessor::Action(p) => &p.ctx,
            ActivityProcessor::Function(p) => &p.ctx,
            ActivityProcessor::SubFlow(p) => &p.ctx,
            ActivityProcessor::Branch(p) => &p.ctx,
            ActivityProcessor::Iteration(p) => &p.ctx,
            ActivityProcessor::Listen(p) => &p.ctx,
        };
        Arc::clone(ctx)
    }

    /// Move a pending activity to `Running`.
    pub async fn initialize(&mut self) -> Result<(), ProcessError> {
        if self.activity().status == ActivityStatus::Pending {
            let ctx = self.context();
            let started = ctx.start_activity(&self.activity().id).await?;
            *self.activity_mut() = started;
        }
        Ok(())
    }

    /// Drive the activity to an outcome.
    ///
    /// Safe to call again on the same activity: terminal activities replay
    /// their recorded outcome and running ones resume from their persisted
    /// children.
    pub fn process(&mut self, cancel: CancellationToken) -> ProcessFuture<'_> {
        Box::pin(async move {
            if let Some(recorded) = recorded_outcome(self.activity())? {
                return Ok(recorded);
            }
            self.initialize().await?;
            let result = match self {
                ActivityProcessor::State(p) => p.run(&cancel).await,
                ActivityProcessor::Action(p) => p.run(&cancel).await,
                ActivityProcessor::Function(p) => p.run(&cancel).await,
                ActivityProcessor::SubFlow(p) => p.run(&cancel).await,
                ActivityProcessor::Branch(p) => p.run(&cancel).await,
                ActivityProcessor::Iteration(p) => p.run(&cancel).await,
                ActivityProcessor::Listen(p) => p.run(&cancel).await,
            };
            self.settle(result).await
        })
    }

    /// Persist the result of `run`.
    async fn settle(
        &mut self,
        result: Result<ActivityOutcome, ProcessError>,
    ) -> Result<ActivityOutcome, ProcessError> {
        let ctx = self.context();
        let id = self.activity().id.clone();
        match result {
            Ok(ActivityOutcome::Completed(output)) => {
                *self.activity_mut() = ctx.complete_activity(&id, output.clone()).await?;
                Ok(ActivityOutcome::Completed(output))
            }
            Ok(ActivityOutcome::Skipped) => {
                *self.activity_mut() = ctx.skip_activity(&id).await?;
                Ok(ActivityOutcome::Skipped)
            }
            Ok(other) => Ok(other),
            Err(ProcessError::Fault(mut error)) => {
                if error.instance.is_none() {
                    error.instance = ctx.activity_pointer(&id).await;
                }
                *self.activity_mut() = ctx.fault_activity(&id, error.clone()).await?;
                Err(ProcessError::Fault(error))
            }
            Err(e) => Err(e),
        }
    }
}

/// Outcome recorded on a terminal activity.
fn recorded_outcome(activity: &Activity) -> Result<Option<ActivityOutcome>, ProcessError> {
    match activity.status {
        ActivityStatus::Pending | ActivityStatus::Running => Ok(None),
        ActivityStatus::Completed => Ok(Some(ActivityOutcome::Completed(
            activity.output.clone().unwrap_or(Value::Null),
        ))),
        ActivityStatus::Skipped => Ok(Some(ActivityOutcome::Skipped)),
        ActivityStatus::Cancelled => Ok(Some(ActivityOutcome::Cancelled)),
        ActivityStatus::Faulted => Err(ProcessError::Fault(activity.error.clone().unwrap_or_else(|| {
            WorkflowError::new(WorkflowError::RUNTIME, format!("activity '{}' faulted", activity.name))
        }))),
    }
}

// ---------------------------------------------------------------------------
// Helpers shared by processors
// ---------------------------------------------------------------------------

/// Fold an action result into state data.
///
/// With a `key` the result is stored under it. Otherwise objects are merged
/// shallowly and any other result replaces the data.
pub(crate) fn merge_state_data(data: &Value, result: Value, key: Option<&str>) -> Value {
    match (data, key) {
        (Value::Object(map), Some(key)) => {
            let mut merged = map.clone();
            merged.insert(key.to_string(), result);
            Value::Object(merged)
        }
        (_, Some(key)) => {
            let mut merged = Map::new();
            merged.insert(key.to_string(), result);
            Value::Object(merged)
        }
        (Value::Object(map), None) => match result {
            Value::Object(extra) => {
                let mut merged = map.clone();
                merged.extend(extra);
                Value::Object(merged)
            }
            Value::Null => data.clone(),
            other => other,
        },
        (_, None) => result,
    }
}

/// Wall-clock delay of `duration` measured from `since` (now when unset).
///
/// Returns `false` when cancelled first.
pub(crate) async fn delay(duration: Duration, since: Option<DateTime<Utc>>, cancel: &CancellationToken) -> bool {
    let elapsed = since
        .and_then(|since| (Utc::now() - since).to_std().ok())
        .unwrap_or_default();
    let remaining = duration.saturating_sub(elapsed);
    if remaining.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(remaining) => true,
    }
}

/// Last segment of an activity id, used to derive stable child resource names.
pub(crate) fn short_id(id: &str) -> &str {
    let start = id.len().saturating_sub(12);
    id.get(start..).unwrap_or(id)
}
