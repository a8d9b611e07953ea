//! Workflow runtime: drives one instance through its states.
//!
//! The `WorkflowRuntime` walks the state machine of an `Executing` instance,
//! recording one root `State` activity per visited state. Because every step
//! is persisted, a runtime started on an instance that was interrupted picks
//! up at the last root state instead of starting over.
//!
//! # Execution flow
//!
//! 1. Ensure the `Start` activity exists.
//! 2. Resume the last root state: re-run it if still open, otherwise route
//!    from its recorded outcome.
//! 3. For each state: process it, then follow the switch decision,
//!    `transition` or `end`. Faults are routed through `on_errors`.
//! 4. A listen that is still waiting parks the instance in `Waiting`.
//! 5. On `end`: apply the output filter, record an `End` activity and
//!    complete the instance.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use chrono::Utc;
use serde_json::Value;
use synapse_types::activity::{metadata_keys, Activity, ActivityKind, ActivityStatus};
use synapse_types::error::{RepositoryError, TransitionError, WorkflowError};
use synapse_types::instance::{InstanceEvent, WorkflowInstance, WorkflowInstanceStatusType};
use synapse_types::workflow::{StateDefinition, StateKind, WorkflowDefinition};
use tokio_util::sync::CancellationToken;

use crate::repository::ResourceRepository;

use super::context::{RuntimeServices, WorkflowRuntimeContext};
use super::processor::{ActivityOutcome, ActivityProcessor, ProcessError, StateProcessor};

// ---------------------------------------------------------------------------
// ExecutionHandle
// ---------------------------------------------------------------------------

/// Why a runtime was asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The worker is going away; the instance stays `Executing` for another
    /// worker to pick up.
    Shutdown,
    Suspend,
    Terminate,
}

/// Remote control for a running `WorkflowRuntime`.
///
/// The first stop request wins; later ones are ignored.
#[derive(Debug, Clone, Default)]
pub struct ExecutionHandle {
    cancel: CancellationToken,
    reason: Arc<OnceLock<StopReason>>,
}

impl ExecutionHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn suspend(&self) {
        self.stop(StopReason::Suspend);
    }

    pub fn terminate(&self) {
        self.stop(StopReason::Terminate);
    }

    pub fn shutdown(&self) {
        self.stop(StopReason::Shutdown);
    }

    fn stop(&self, reason: StopReason) {
        let _ = self.reason.set(reason);
        self.cancel.cancel();
    }

    pub fn reason(&self) -> Option<StopReason> {
        self.reason.get().copied()
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

// ---------------------------------------------------------------------------
// Outcome and errors
// ---------------------------------------------------------------------------

/// Status the instance was left in when `run` returned.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Executed(Value),
    Faulted(WorkflowError),
    TimedOut,
    /// Parked until correlated events arrive.
    Waiting,
    Suspended,
    Terminated,
    /// Stopped by a shutdown; the instance is still `Executing`.
    Interrupted,
}

/// Errors that abort a run without settling the instance.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("invalid definition: {0}")]
    Definition(String),

    #[error("activity '{0}' not found")]
    ActivityNotFound(String),

    #[error("{0}")]
    Fault(WorkflowError),
}

impl RuntimeError {
    /// Whether starting a fresh runtime on the instance may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RuntimeError::Repository(
                RepositoryError::Conflict { .. } | RepositoryError::Connection | RepositoryError::Query(_)
            )
        )
    }
}

impl From<ProcessError> for RuntimeError {
    fn from(e: ProcessError) -> Self {
        match e {
            ProcessError::Transition(e) => RuntimeError::Transition(e),
            ProcessError::ActivityNotFound(id) => RuntimeError::ActivityNotFound(id),
            ProcessError::Repository(e) => RuntimeError::Repository(e),
            ProcessError::Fault(e) => RuntimeError::Fault(e),
        }
    }
}

/// Where execution continues after a state settles.
enum Step {
    Enter { state: String, input: Value },
    Resume(Activity),
    End(Value),
    Fault(WorkflowError),
}

// ---------------------------------------------------------------------------
// WorkflowRuntime
// ---------------------------------------------------------------------------

pub struct WorkflowRuntime<R: ResourceRepository + 'static> {
    ctx: Arc<WorkflowRuntimeContext<R>>,
    handle: ExecutionHandle,
}

impl<R: ResourceRepository + 'static> WorkflowRuntime<R> {
    pub fn new(
        repo: Arc<R>,
        instance: WorkflowInstance,
        definition: Arc<WorkflowDefinition>,
        services: RuntimeServices,
    ) -> Self {
        Self {
            ctx: Arc::new(WorkflowRuntimeContext::new(repo, instance, definition, services)),
            handle: ExecutionHandle::new(),
        }
    }

    /// Drive the runtime through an existing handle, so stop requests issued
    /// before a restart still apply.
    pub fn with_handle(mut self, handle: ExecutionHandle) -> Self {
        self.handle = handle;
        self
    }

    pub fn handle(&self) -> ExecutionHandle {
        self.handle.clone()
    }

    pub fn context(&self) -> &Arc<WorkflowRuntimeContext<R>> {
        &self.ctx
    }

    /// Execute the instance until it settles, parks or is stopped.
    pub async fn run(self) -> Result<ExecutionOutcome, RuntimeError> {
        let snapshot = self.ctx.snapshot().await;
        if snapshot.status_type() != WorkflowInstanceStatusType::Executing {
            return Err(RuntimeError::Transition(TransitionError {
                subject: "instance",
                from: snapshot.status_type().as_str().to_string(),
                transition: "run",
            }));
        }
        tracing::info!(
            instance = %self.ctx.qualified_name(),
            workflow = %self.ctx.definition().id,
            version = %self.ctx.definition().version,
            "workflow runtime started"
        );

        let deadline = self
            .ctx
            .definition()
            .timeout_secs
            .zip(snapshot.status.started_at)
            .and_then(|(secs, started_at)| {
                started_at.checked_add_signed(chrono::Duration::seconds(secs.min(u32::MAX as u64) as i64))
            });

        let result = match deadline {
            Some(deadline) => {
                let remaining = (deadline - Utc::now()).to_std().unwrap_or_default();
                tokio::select! {
                    biased;
                    _ = tokio::time::sleep(remaining) => self.time_out().await,
                    result = self.drive() => result,
                }
            }
            None => self.drive().await,
        };

        match result {
            Ok(outcome) => {
                tracing::info!(
                    instance = %self.ctx.qualified_name(),
                    outcome = outcome_name(&outcome),
                    "workflow runtime finished"
                );
                Ok(outcome)
            }
            Err(e) if e.is_retryable() => Err(e),
            Err(e) => {
                tracing::error!(instance = %self.ctx.qualified_name(), error = %e, "workflow runtime failed");
                let error = match &e {
                    RuntimeError::Fault(error) => error.clone(),
                    other => WorkflowError::new(WorkflowError::RUNTIME, "workflow runtime failed")
                        .with_detail(other.to_string()),
                };
                if self.ctx.snapshot().await.status_type() == WorkflowInstanceStatusType::Executing {
                    if let Err(fault_err) = self.ctx.transition(InstanceEvent::Faulted { error }).await {
                        tracing::warn!(
                            instance = %self.ctx.qualified_name(),
                            error = %fault_err,
                            "failed to fault instance"
                        );
                    }
                }
                Err(e)
            }
        }
    }

    async fn drive(&self) -> Result<ExecutionOutcome, RuntimeError> {
        let cancel = self.handle.cancellation_token();
        self.ensure_started().await?;

        let mut step = self.resume_point().await?;
        loop {
            if cancel.is_cancelled() {
                return self.stopped().await;
            }
            let (state, activity) = match step {
                Step::Enter { state, input } => {
                    let definition = self.state(&state)?;
                    let metadata = BTreeMap::from([(metadata_keys::STATE.to_string(), state.clone())]);
                    let activity = self
                        .ctx
                        .create_activity(ActivityKind::State, &state, input, metadata, None)
                        .await?;
                    (definition, activity)
                }
                Step::Resume(activity) => (self.state(&activity.name)?, activity),
                Step::End(output) => return self.finish(output).await,
                Step::Fault(error) => return self.fault(error).await,
            };

            let input = activity.input.clone();
            let id = activity.id.clone();
            let mut processor = ActivityProcessor::State(StateProcessor::new(Arc::clone(&self.ctx), state.clone(), activity));
            step = match processor.process(cancel.clone()).await {
                Ok(ActivityOutcome::Completed(output)) => next_step(&state, processor.activity(), output),
                Ok(ActivityOutcome::Skipped) => next_step(&state, processor.activity(), input),
                Ok(ActivityOutcome::Waiting) => {
                    if self.ctx.wait_unless_delivered().await? {
                        return Ok(ExecutionOutcome::Waiting);
                    }
                    let activity = self
                        .ctx
                        .activity(&id)
                        .await
                        .ok_or_else(|| RuntimeError::ActivityNotFound(id.clone()))?;
                    Step::Resume(activity)
                }
                Ok(ActivityOutcome::Cancelled) => return self.stopped().await,
                Err(ProcessError::Fault(error)) => route_fault(&state, error, input),
                Err(e) => return Err(e.into()),
            };
        }
    }

    async fn ensure_started(&self) -> Result<(), RuntimeError> {
        let input = self.ctx.snapshot().await.spec.input;
        let start = self
            .ctx
            .ensure_activity(
                ActivityKind::Start,
                &self.ctx.definition().start,
                input.clone(),
                BTreeMap::new(),
                None,
            )
            .await?;
        if !start.status.is_terminal() {
            self.ctx.start_activity(&start.id).await?;
            self.ctx.complete_activity(&start.id, input).await?;
        }
        Ok(())
    }

    /// First step of this run, derived from the last root state activity.
    async fn resume_point(&self) -> Result<Step, RuntimeError> {
        let roots = self.ctx.get_activities(None).await;
        let Some(last) = roots.into_iter().rev().find(|a| a.kind == ActivityKind::State) else {
            let input = self.ctx.snapshot().await.spec.input;
            return Ok(Step::Enter {
                state: self.ctx.definition().start.clone(),
                input,
            });
        };
        let state = self.state(&last.name)?;
        tracing::debug!(
            instance = %self.ctx.qualified_name(),
            state = last.name.as_str(),
            status = last.status.as_str(),
            "resuming from state"
        );
        Ok(match last.status {
            ActivityStatus::Pending | ActivityStatus::Running => Step::Resume(last),
            ActivityStatus::Completed => {
                let output = last.output.clone().unwrap_or(Value::Null);
                next_step(&state, &last, output)
            }
            ActivityStatus::Skipped => {
                let input = last.input.clone();
                next_step(&state, &last, input)
            }
            ActivityStatus::Faulted => {
                let error = last.error.clone().unwrap_or_else(|| {
                    WorkflowError::new(WorkflowError::RUNTIME, format!("state '{}' faulted", last.name))
                });
                route_fault(&state, error, last.input.clone())
            }
            ActivityStatus::Cancelled => Step::Enter {
                state: last.name.clone(),
                input: last.input.clone(),
            },
        })
    }

    fn state(&self, name: &str) -> Result<StateDefinition, RuntimeError> {
        self.ctx
            .definition()
            .state(name)
            .cloned()
            .ok_or_else(|| RuntimeError::Definition(format!("state '{name}' is not defined")))
    }

    async fn finish(&self, data: Value) -> Result<ExecutionOutcome, RuntimeError> {
        let output = match self.ctx.definition().output_filter.as_deref() {
            Some(filter) => match self.ctx.evaluate(filter, &data) {
                Ok(output) => output,
                Err(ProcessError::Fault(error)) => return self.fault(error).await,
                Err(e) => return Err(e.into()),
            },
            None => data,
        };
        let end = self
            .ctx
            .create_activity(ActivityKind::End, "end", output.clone(), BTreeMap::new(), None)
            .await?;
        self.ctx.start_activity(&end.id).await?;
        self.ctx.complete_activity(&end.id, output.clone()).await?;
        self.ctx
            .transition(InstanceEvent::Executed { output: output.clone() })
            .await?;
        Ok(ExecutionOutcome::Executed(output))
    }

    async fn fault(&self, error: WorkflowError) -> Result<ExecutionOutcome, RuntimeError> {
        self.ctx
            .transition(InstanceEvent::Faulted { error: error.clone() })
            .await?;
        Ok(ExecutionOutcome::Faulted(error))
    }

    async fn time_out(&self) -> Result<ExecutionOutcome, RuntimeError> {
        tracing::warn!(instance = %self.ctx.qualified_name(), "workflow execution timed out");
        self.ctx.cancel_open_activities().await?;
        self.ctx.transition(InstanceEvent::TimedOut).await?;
        Ok(ExecutionOutcome::TimedOut)
    }

    async fn stopped(&self) -> Result<ExecutionOutcome, RuntimeError> {
        match self.handle.reason() {
            Some(StopReason::Suspend) => {
                self.ctx.transition(InstanceEvent::Suspended).await?;
                Ok(ExecutionOutcome::Suspended)
            }
            Some(StopReason::Terminate) => {
                self.ctx.cancel_open_activities().await?;
                self.ctx.transition(InstanceEvent::Terminated).await?;
                Ok(ExecutionOutcome::Terminated)
            }
            Some(StopReason::Shutdown) | None => Ok(ExecutionOutcome::Interrupted),
        }
    }
}

/// Route from a completed state: the switch decision, then `end`, then
/// `transition`.
fn next_step(state: &StateDefinition, activity: &Activity, output: Value) -> Step {
    if matches!(state.kind, StateKind::Switch { .. }) {
        match activity.meta(metadata_keys::NEXT) {
            Some("") => return Step::End(output),
            Some(target) => {
                return Step::Enter {
                    state: target.to_string(),
                    input: output,
                };
            }
            None => {}
        }
    }
    match (&state.transition, state.end) {
        (Some(target), false) => Step::Enter {
            state: target.clone(),
            input: output,
        },
        _ => Step::End(output),
    }
}

/// Route a faulted state through its first matching error handler. The
/// handler's target receives the state's input.
fn route_fault(state: &StateDefinition, error: WorkflowError, input: Value) -> Step {
    let Some(handler) = state.on_errors.iter().find(|h| h.handles(&error.error_type)) else {
        return Step::Fault(error);
    };
    tracing::info!(
        state = state.name.as_str(),
        error_type = error.error_type.as_str(),
        "error handled"
    );
    match (&handler.transition, handler.end) {
        (Some(target), false) => Step::Enter {
            state: target.clone(),
            input,
        },
        _ => Step::End(input),
    }
}

fn outcome_name(outcome: &ExecutionOutcome) -> &'static str {
    match outcome {
        ExecutionOutcome::Executed(_) => "executed",
        ExecutionOutcome::Faulted(_) => "faulted",
        ExecutionOutcome::TimedOut => "timed_out",
        ExecutionOutcome::Waiting => "waiting",
        ExecutionOutcome::Suspended => "suspended",
        ExecutionOutcome::Terminated => "terminated",
        ExecutionOutcome::Interrupted => "interrupted",
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
