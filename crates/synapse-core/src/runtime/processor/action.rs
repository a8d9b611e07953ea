//! Action and function-call activities.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use synapse_types::activity::{metadata_keys, Activity, ActivityKind};
use synapse_types::error::WorkflowError;
use synapse_types::workflow::{ActionDefinition, FunctionDefinition, RetryDefinition};
use tokio_util::sync::CancellationToken;

use crate::repository::ResourceRepository;
use crate::runtime::context::WorkflowRuntimeContext;
use crate::runtime::function::FunctionCall;
use crate::runtime::retry::RetryHandler;

use super::{delay, ActivityOutcome, ActivityProcessor, ProcessError, SubFlowProcessor};

// ---------------------------------------------------------------------------
// ActionProcessor
// ---------------------------------------------------------------------------

/// Evaluates an action's guard and delays, runs its function or sub-flow as
/// a child activity and projects the result.
pub struct ActionProcessor<R: ResourceRepository + 'static> {
    pub(super) ctx: Arc<WorkflowRuntimeContext<R>>,
    pub(super) activity: Activity,
    state_name: String,
    action: ActionDefinition,
}

impl<R: ResourceRepository + 'static> ActionProcessor<R> {
    pub fn new(
        ctx: Arc<WorkflowRuntimeContext<R>>,
        state_name: String,
        action: ActionDefinition,
        activity: Activity,
    ) -> Self {
        Self {
            ctx,
            activity,
            state_name,
            action,
        }
    }

    pub(super) async fn run(&mut self, cancel: &CancellationToken) -> Result<ActivityOutcome, ProcessError> {
        let input = self.activity.input.clone();

        if let Some(condition) = &self.action.condition {
            if !self.ctx.evaluate_condition(condition, &input)? {
                tracing::debug!(
                    instance = %self.ctx.qualified_name(),
                    action = self.action.name.as_str(),
                    "action condition not met, skipping"
                );
                return Ok(ActivityOutcome::Skipped);
            }
        }

        let sleep = self.action.sleep.unwrap_or_default();
        if let Some(before_ms) = sleep.before_ms {
            if !delay(Duration::from_millis(before_ms), self.activity.started_at, cancel).await {
                return Ok(ActivityOutcome::Cancelled);
            }
        }

        let filter = self.action.data_filter.clone().unwrap_or_default();
        let action_input = match filter.from_state_data.as_deref() {
            Some(expression) => self.ctx.evaluate(expression, &input)?,
            None => input,
        };

        let mut child = self.child_processor(&action_input).await?;
        let result = match child.process(cancel.clone()).await? {
            ActivityOutcome::Completed(result) => result,
            other => return Ok(other),
        };
        let result = match filter.results.as_deref() {
            Some(expression) => self.ctx.evaluate(expression, &result)?,
            None => result,
        };

        if let Some(after_ms) = sleep.after_ms {
            if !delay(Duration::from_millis(after_ms), child.activity().executed_at, cancel).await {
                return Ok(ActivityOutcome::Cancelled);
            }
        }
        Ok(ActivityOutcome::Completed(result))
    }

    fn child_metadata(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (metadata_keys::STATE.to_string(), self.state_name.clone()),
            (metadata_keys::ACTION.to_string(), self.action.name.clone()),
        ])
    }

    /// Processor for the function or sub-flow this action calls, bound to the
    /// existing child activity when there is one.
    async fn child_processor(&self, input: &Value) -> Result<ActivityProcessor<R>, ProcessError> {
        match (&self.action.function_ref, &self.action.sub_flow_ref) {
            (Some(reference), None) => {
                let definition = self.ctx.definition();
                let function = definition.function(&reference.ref_name).cloned().ok_or_else(|| {
                    ProcessError::fault(
                        WorkflowError::VALIDATION,
                        "unknown function",
                        format!("function '{}' is not defined", reference.ref_name),
                    )
                })?;
                let retry = self
                    .action
                    .retry_ref
                    .as_deref()
                    .and_then(|name| definition.retry(name))
                    .cloned();
                let arguments = if reference.arguments.is_null() {
                    input.clone()
                } else {
                    self.ctx.evaluate_template(&reference.arguments, input)?
                };
                let mut metadata = self.child_metadata();
                metadata.insert(metadata_keys::FUNCTION.to_string(), function.name.clone());
                let activity = self
                    .ctx
                    .ensure_activity(
                        ActivityKind::Function,
                        &reference.ref_name,
                        arguments,
                        metadata,
                        Some(&self.activity.id),
                    )
                    .await?;
                Ok(ActivityProcessor::Function(FunctionProcessor::new(
                    Arc::clone(&self.ctx),
                    function,
                    retry,
                    activity,
                )))
            }
            (None, Some(reference)) => {
                let child_input = match &reference.input {
                    Some(template) => self.ctx.evaluate_template(template, input)?,
                    None => input.clone(),
                };
                let activity = self
                    .ctx
                    .ensure_activity(
                        ActivityKind::SubFlow,
                        &reference.workflow,
                        child_input,
                        self.child_metadata(),
                        Some(&self.activity.id),
                    )
                    .await?;
                Ok(ActivityProcessor::SubFlow(SubFlowProcessor::new(
                    Arc::clone(&self.ctx),
                    reference.clone(),
                    activity,
                )))
            }
            _ => Err(ProcessError::fault(
                WorkflowError::VALIDATION,
                "invalid action",
                format!(
                    "action '{}' must reference exactly one function or sub-flow",
                    self.action.name
                ),
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// FunctionProcessor
// ---------------------------------------------------------------------------

/// Invokes a function through the registry, honouring the action's retry
/// policy for transient failures.
pub struct FunctionProcessor<R: ResourceRepository + 'static> {
    pub(super) ctx: Arc<WorkflowRuntimeContext<R>>,
    pub(super) activity: Activity,
    function: FunctionDefinition,
    retry: Option<RetryDefinition>,
}

impl<R: ResourceRepository + 'static> FunctionProcessor<R> {
    pub fn new(
        ctx: Arc<WorkflowRuntimeContext<R>>,
        function: FunctionDefinition,
        retry: Option<RetryDefinition>,
        activity: Activity,
    ) -> Self {
        Self {
            ctx,
            activity,
            function,
            retry,
        }
    }

    pub(super) async fn run(&mut self, cancel: &CancellationToken) -> Result<ActivityOutcome, ProcessError> {
        let call = FunctionCall {
            function: self.function.clone(),
            arguments: self.activity.input.clone(),
        };
        let mut attempt: u32 = self
            .activity
            .meta(metadata_keys::ATTEMPTS)
            .and_then(|a| a.parse().ok())
            .unwrap_or(0);

        loop {
            attempt += 1;
            let entries = BTreeMap::from([(metadata_keys::ATTEMPTS.to_string(), attempt.to_string())]);
            self.activity = self.ctx.annotate_activity(&self.activity.id, entries).await?;

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(ActivityOutcome::Cancelled),
                result = self.ctx.services().functions.invoke(&call) => result,
            };
            let error = match result {
                Ok(output) => return Ok(ActivityOutcome::Completed(output)),
                Err(error) => error,
            };

            let policy = self
                .retry
                .as_ref()
                .filter(|policy| error.is_transient() && RetryHandler::should_retry(policy, attempt));
            let Some(policy) = policy else {
                return Err(ProcessError::Fault(error.to_workflow_error()));
            };
            let wait = RetryHandler::delay_for(policy, attempt);
            tracing::warn!(
                instance = %self.ctx.qualified_name(),
                function = self.function.name.as_str(),
                attempt,
                max_attempts = policy.max_attempts,
                delay_ms = wait.as_millis() as u64,
                error = %error,
                "function invocation failed, retrying"
            );
            if !delay(wait, None, cancel).await {
                return Ok(ActivityOutcome::Cancelled);
            }
        }
    }
}
