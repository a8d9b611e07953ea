//! State activities: one per visit of a workflow state.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use serde_json::{json, Value};
use synapse_types::activity::{metadata_keys, Activity, ActivityKind};
use synapse_types::error::WorkflowError;
use synapse_types::workflow::{
    ActionDefinition, ActionExecutionMode, BranchDefinition, ParallelCompletion, StateDefinition, StateKind,
};
use tokio_util::sync::CancellationToken;

use crate::repository::ResourceRepository;
use crate::runtime::context::WorkflowRuntimeContext;

use super::{
    delay, merge_state_data, ActionProcessor, ActivityOutcome, ActivityProcessor, BranchProcessor,
    IterationProcessor, ListenProcessor, ProcessError,
};

/// Default state data key receiving for-each outputs.
pub const DEFAULT_OUTPUT_COLLECTION: &str = "results";

pub struct StateProcessor<R: ResourceRepository + 'static> {
    pub(super) ctx: Arc<WorkflowRuntimeContext<R>>,
    pub(super) activity: Activity,
    state: StateDefinition,
}

impl<R: ResourceRepository + 'static> StateProcessor<R> {
    pub fn new(ctx: Arc<WorkflowRuntimeContext<R>>, state: StateDefinition, activity: Activity) -> Self {
        Self { ctx, activity, state }
    }

    pub(super) async fn run(&mut self, cancel: &CancellationToken) -> Result<ActivityOutcome, ProcessError> {
        let data = match self.state.state_data_filter.as_ref().and_then(|f| f.input.as_deref()) {
            Some(filter) => self.ctx.evaluate(filter, &self.activity.input)?,
            None => self.activity.input.clone(),
        };
        tracing::debug!(
            instance = %self.ctx.qualified_name(),
            state = self.state.name.as_str(),
            kind = self.state.kind.type_name(),
            "processing state"
        );

        let outcome = match &self.state.kind {
            StateKind::Operation { action_mode, actions } => {
                run_actions(&self.ctx, &self.activity, &self.state.name, actions, *action_mode, data, cancel).await?
            }
            StateKind::Sleep { duration_ms } => self.sleep(*duration_ms, data, cancel).await?,
            StateKind::Inject { data: injected } => {
                ActivityOutcome::Completed(merge_state_data(&data, injected.clone(), None))
            }
            StateKind::Switch {
                conditions,
                default_transition,
            } => {
                let mut next = None;
                for condition in conditions {
                    if self.ctx.evaluate_condition(&condition.condition, &data)? {
                        next = Some(match (&condition.transition, condition.end) {
                            (_, true) | (None, false) => String::new(),
                            (Some(target), false) => target.clone(),
                        });
                        break;
                    }
                }
                if let Some(next) = next.or_else(|| default_transition.clone()) {
                    let entries = BTreeMap::from([(metadata_keys::NEXT.to_string(), next)]);
                    self.activity = self.ctx.annotate_activity(&self.activity.id, entries).await?;
                }
                ActivityOutcome::Completed(data)
            }
            StateKind::Listen { events, timeout_ms } => {
                let child = self
                    .ctx
                    .ensure_activity(
                        ActivityKind::Listen,
                        &self.state.name,
                        data.clone(),
                        self.child_metadata(),
                        Some(&self.activity.id),
                    )
                    .await?;
                let mut processor = ActivityProcessor::Listen(ListenProcessor::new(
                    Arc::clone(&self.ctx),
                    events.clone(),
                    *timeout_ms,
                    child,
                ));
                match processor.process(cancel.clone()).await? {
                    ActivityOutcome::Completed(result) => {
                        ActivityOutcome::Completed(merge_state_data(&data, result, None))
                    }
                    other => other,
                }
            }
            StateKind::Parallel { branches, completion } => {
                self.parallel(branches, *completion, data, cancel).await?
            }
            StateKind::ForEach {
                input_collection,
                iteration_param,
                actions,
                output_collection,
            } => {
                self.for_each(
                    input_collection,
                    iteration_param,
                    actions,
                    output_collection.as_deref().unwrap_or(DEFAULT_OUTPUT_COLLECTION),
                    data,
                    cancel,
                )
                .await?
            }
        };

        match outcome {
            ActivityOutcome::Completed(output) => {
                let output = match self.state.state_data_filter.as_ref().and_then(|f| f.output.as_deref()) {
                    Some(filter) => self.ctx.evaluate(filter, &output)?,
                    None => output,
                };
                Ok(ActivityOutcome::Completed(output))
            }
            other => Ok(other),
        }
    }

    fn child_metadata(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(metadata_keys::STATE.to_string(), self.state.name.clone())])
    }

    async fn sleep(
        &self,
        duration_ms: u64,
        data: Value,
        cancel: &CancellationToken,
    ) -> Result<ActivityOutcome, ProcessError> {
        let child = self
            .ctx
            .ensure_activity(
                ActivityKind::Sleep,
                &self.state.name,
                json!({ "duration_ms": duration_ms }),
                self.child_metadata(),
                Some(&self.activity.id),
            )
            .await?;
        if !child.status.is_terminal() {
            let child = self.ctx.start_activity(&child.id).await?;
            if !delay(Duration::from_millis(duration_ms), child.started_at, cancel).await {
                return Ok(ActivityOutcome::Cancelled);
            }
            self.ctx.complete_activity(&child.id, Value::Null).await?;
        }
        Ok(ActivityOutcome::Completed(data))
    }

    async fn parallel(
        &self,
        branches: &[BranchDefinition],
        completion: ParallelCompletion,
        data: Value,
        cancel: &CancellationToken,
    ) -> Result<ActivityOutcome, ProcessError> {
        let mut processors = Vec::with_capacity(branches.len());
        for branch in branches {
            let mut metadata = self.child_metadata();
            metadata.insert(metadata_keys::BRANCH.to_string(), branch.name.clone());
            let activity = self
                .ctx
                .ensure_activity(
                    ActivityKind::Branch,
                    &branch.name,
                    data.clone(),
                    metadata,
                    Some(&self.activity.id),
                )
                .await?;
            processors.push(ActivityProcessor::Branch(BranchProcessor::new(
                Arc::clone(&self.ctx),
                self.state.name.clone(),
                branch.clone(),
                activity,
            )));
        }

        match completion {
            ParallelCompletion::All => {
                let results = futures_util::future::join_all(
                    processors.iter_mut().map(|p| p.process(cancel.clone())),
                )
                .await;
                let mut merged = data;
                for result in results {
                    match result? {
                        ActivityOutcome::Completed(output) => merged = merge_state_data(&merged, output, None),
                        ActivityOutcome::Skipped => {}
                        other => return Ok(other),
                    }
                }
                Ok(ActivityOutcome::Completed(merged))
            }
            ParallelCompletion::Any => {
                let losers = cancel.child_token();
                let ids: Vec<String> = processors.iter().map(|p| p.activity().id.clone()).collect();
                let mut winner = None;
                let mut first_error = None;
                {
                    let mut running: FuturesUnordered<_> = processors
                        .iter_mut()
                        .map(|p| p.process(losers.clone()))
                        .collect();
                    while let Some(result) = running.next().await {
                        match result {
                            Ok(ActivityOutcome::Completed(output)) if winner.is_none() => {
                                winner = Some(output);
                                losers.cancel();
                            }
                            Err(e) if first_error.is_none() => first_error = Some(e),
                            _ => {}
                        }
                    }
                }

                if cancel.is_cancelled() {
                    return Ok(ActivityOutcome::Cancelled);
                }
                match winner {
                    Some(output) => {
                        for id in &ids {
                            self.ctx.cancel_activity_tree(id).await?;
                        }
                        Ok(ActivityOutcome::Completed(merge_state_data(&data, output, None)))
                    }
                    None => Err(first_error.unwrap_or_else(|| {
                        ProcessError::Fault(WorkflowError::new(
                            WorkflowError::RUNTIME,
                            format!("no branch of state '{}' completed", self.state.name),
                        ))
                    })),
                }
            }
        }
    }

    async fn for_each(
        &self,
        input_collection: &str,
        iteration_param: &str,
        actions: &[ActionDefinition],
        output_collection: &str,
        data: Value,
        cancel: &CancellationToken,
    ) -> Result<ActivityOutcome, ProcessError> {
        let items = match self.ctx.evaluate(input_collection, &data)? {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            other => {
                return Err(ProcessError::fault(
                    WorkflowError::EXPRESSION,
                    "input collection is not an array",
                    format!("'{input_collection}' evaluated to {other}"),
                ));
            }
        };

        let mut outputs = Vec::with_capacity(items.len());
        for (index, item) in items.into_iter().enumerate() {
            let mut metadata = self.child_metadata();
            metadata.insert(metadata_keys::ITERATION.to_string(), index.to_string());
            let input = merge_state_data(&data, item, Some(iteration_param));
            let activity = self
                .ctx
                .ensure_activity(
                    ActivityKind::Iteration,
                    &index.to_string(),
                    input,
                    metadata,
                    Some(&self.activity.id),
                )
                .await?;
            let mut processor = ActivityProcessor::Iteration(IterationProcessor::new(
                Arc::clone(&self.ctx),
                self.state.name.clone(),
                actions.to_vec(),
                activity,
            ));
            match processor.process(cancel.clone()).await? {
                ActivityOutcome::Completed(output) => outputs.push(output),
                ActivityOutcome::Skipped => {}
                other => return Ok(other),
            }
        }
        Ok(ActivityOutcome::Completed(merge_state_data(
            &data,
            Value::Array(outputs),
            Some(output_collection),
        )))
    }
}

/// Run a list of actions as children of `parent`, folding their results into
/// `data`.
pub(crate) async fn run_actions<R: ResourceRepository + 'static>(
    ctx: &Arc<WorkflowRuntimeContext<R>>,
    parent: &Activity,
    state_name: &str,
    actions: &[ActionDefinition],
    mode: ActionExecutionMode,
    data: Value,
    cancel: &CancellationToken,
) -> Result<ActivityOutcome, ProcessError> {
    let action_processor = |activity: Activity, action: &ActionDefinition| {
        ActivityProcessor::Action(ActionProcessor::new(
            Arc::clone(ctx),
            state_name.to_string(),
            action.clone(),
            activity,
        ))
    };
    let metadata = |action: &ActionDefinition| {
        BTreeMap::from([
            (metadata_keys::STATE.to_string(), state_name.to_string()),
            (metadata_keys::ACTION.to_string(), action.name.clone()),
        ])
    };

    match mode {
        ActionExecutionMode::Sequential => {
            let mut data = data;
            for action in actions {
                let activity = ctx
                    .ensure_activity(
                        ActivityKind::Action,
                        &action.name,
                        data.clone(),
                        metadata(action),
                        Some(&parent.id),
                    )
                    .await?;
                let mut processor = action_processor(activity, action);
                match processor.process(cancel.clone()).await? {
                    ActivityOutcome::Completed(result) => {
                        data = merge_state_data(&data, result, to_state_data(action));
                    }
                    ActivityOutcome::Skipped => {}
                    other => return Ok(other),
                }
            }
            Ok(ActivityOutcome::Completed(data))
        }
        ActionExecutionMode::Parallel => {
            let mut processors = Vec::with_capacity(actions.len());
            for action in actions {
                let activity = ctx
                    .ensure_activity(
                        ActivityKind::Action,
                        &action.name,
                        data.clone(),
                        metadata(action),
                        Some(&parent.id),
                    )
                    .await?;
                processors.push(action_processor(activity, action));
            }
            let results = futures_util::future::join_all(
                processors.iter_mut().map(|p| p.process(cancel.clone())),
            )
            .await;

            let mut merged = data;
            for (action, result) in actions.iter().zip(results) {
                match result? {
                    ActivityOutcome::Completed(output) => {
                        merged = merge_state_data(&merged, output, to_state_data(action));
                    }
                    ActivityOutcome::Skipped => {}
                    other => return Ok(other),
                }
            }
            Ok(ActivityOutcome::Completed(merged))
        }
    }
}

fn to_state_data(action: &ActionDefinition) -> Option<&str> {
    action
        .data_filter
        .as_ref()
        .and_then(|f| f.to_state_data.as_deref())
}
