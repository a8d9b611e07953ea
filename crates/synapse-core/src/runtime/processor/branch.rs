//! Parallel branches and for-each iterations.
//!
//! Both run a list of actions over their own input; they differ only in
//! where the actions come from and how they are ordered.

use std::sync::Arc;

use synapse_types::activity::Activity;
use synapse_types::workflow::{ActionDefinition, ActionExecutionMode, BranchDefinition};
use tokio_util::sync::CancellationToken;

use crate::repository::ResourceRepository;
use crate::runtime::context::WorkflowRuntimeContext;

use super::state::run_actions;
use super::{ActivityOutcome, ProcessError};

pub struct BranchProcessor<R: ResourceRepository + 'static> {
    pub(super) ctx: Arc<WorkflowRuntimeContext<R>>,
    pub(super) activity: Activity,
    state_name: String,
    branch: BranchDefinition,
}

impl<R: ResourceRepository + 'static> BranchProcessor<R> {
    pub fn new(
        ctx: Arc<WorkflowRuntimeContext<R>>,
        state_name: String,
        branch: BranchDefinition,
        activity: Activity,
    ) -> Self {
        Self {
            ctx,
            activity,
            state_name,
            branch,
        }
    }

    pub(super) async fn run(&mut self, cancel: &CancellationToken) -> Result<ActivityOutcome, ProcessError> {
        tracing::debug!(
            instance = %self.ctx.qualified_name(),
            state = self.state_name.as_str(),
            branch = self.branch.name.as_str(),
            "running branch"
        );
        run_actions(
            &self.ctx,
            &self.activity,
            &self.state_name,
            &self.branch.actions,
            self.branch.action_mode,
            self.activity.input.clone(),
            cancel,
        )
        .await
    }
}

/// One element of a for-each state. Actions run sequentially.
pub struct IterationProcessor<R: ResourceRepository + 'static> {
    pub(super) ctx: Arc<WorkflowRuntimeContext<R>>,
    pub(super) activity: Activity,
    state_name: String,
    actions: Vec<ActionDefinition>,
}

impl<R: ResourceRepository + 'static> IterationProcessor<R> {
    pub fn new(
        ctx: Arc<WorkflowRuntimeContext<R>>,
        state_name: String,
        actions: Vec<ActionDefinition>,
        activity: Activity,
    ) -> Self {
        Self {
            ctx,
            activity,
            state_name,
            actions,
        }
    }

    pub(super) async fn run(&mut self, cancel: &CancellationToken) -> Result<ActivityOutcome, ProcessError> {
        run_actions(
            &self.ctx,
            &self.activity,
            &self.state_name,
            &self.actions,
            ActionExecutionMode::Sequential,
            self.activity.input.clone(),
            cancel,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use serde_json::json;
    use synapse_types::activity::{ActivityKind, ActivityStatus};
    use synapse_types::workflow::FunctionKind;

    use crate::repository::MemoryResourceRepository;
    use crate::runtime::context::testing::context;
    use crate::runtime::function::FunctionInvokerRegistry;
    use crate::runtime::function::testing::{communication_error, ScriptedInvoker};
    use crate::runtime::processor::{ActivityOutcome, ActivityProcessor, ProcessError, StateProcessor};
    use tokio_util::sync::CancellationToken;

    const FAN_OUT: &str = r#"
id: fan-out
version: 1.0.0
start: notify
functions:
  - name: send
    type: http
    operation: POST http://notify/send
states:
  - name: notify
    type: parallel
    completion: COMPLETION
    branches:
      - name: email
        actions:
          - name: send-email
            function_ref:
              ref_name: send
            data_filter:
              to_state_data: email
      - name: sms
        actions:
          - name: send-sms
            function_ref:
              ref_name: send
            data_filter:
              to_state_data: sms
    end: true
"#;

    const LOOP: &str = r#"
id: loop
version: 1.0.0
start: each
functions:
  - name: square
    type: expression
    operation: "${ item * item }"
states:
  - name: each
    type: for_each
    input_collection: "${ numbers }"
    iteration_param: item
    output_collection: squares
    actions:
      - name: square-it
        function_ref:
          ref_name: square
          arguments:
            item: "${ item }"
    end: true
"#;

    async fn run_state(
        yaml: &str,
        functions: FunctionInvokerRegistry,
        input: serde_json::Value,
    ) -> (
        Arc<crate::runtime::context::WorkflowRuntimeContext<MemoryResourceRepository>>,
        String,
        Result<ActivityOutcome, ProcessError>,
    ) {
        let repo = Arc::new(MemoryResourceRepository::new());
        let ctx = context(repo, yaml, functions).await;
        let state_def = ctx.definition().states[0].clone();
        let activity = ctx
            .create_activity(ActivityKind::State, &state_def.name, input, BTreeMap::new(), None)
            .await
            .unwrap();
        let id = activity.id.clone();
        let mut processor = ActivityProcessor::State(StateProcessor::new(Arc::clone(&ctx), state_def, activity));
        let outcome = processor.process(CancellationToken::new()).await;
        (ctx, id, outcome)
    }

    fn registry(invoker: Arc<ScriptedInvoker>) -> FunctionInvokerRegistry {
        let mut registry = FunctionInvokerRegistry::new();
        registry.register(invoker);
        registry
    }

    #[tokio::test]
    async fn test_parallel_all_joins_branches() {
        let invoker = Arc::new(ScriptedInvoker::new(FunctionKind::Http, json!("sent")));
        let yaml = FAN_OUT.replace("COMPLETION", "all");
        let (ctx, state_id, outcome) = run_state(&yaml, registry(invoker.clone()), json!({"to": "ops"})).await;

        assert_eq!(
            outcome.unwrap(),
            ActivityOutcome::Completed(json!({"to": "ops", "email": "sent", "sms": "sent"}))
        );
        assert_eq!(invoker.call_count(), 2);
        let branches = ctx.get_activities(Some(&state_id)).await;
        assert_eq!(branches.len(), 2);
        assert!(branches.iter().all(|b| b.kind == ActivityKind::Branch && b.status == ActivityStatus::Completed));
    }

    #[tokio::test]
    async fn test_parallel_all_faults_when_a_branch_faults() {
        let invoker = Arc::new(
            ScriptedInvoker::new(FunctionKind::Http, json!("sent"))
                .then(Err(communication_error("send", Some(404)))),
        );
        let yaml = FAN_OUT.replace("COMPLETION", "all");
        let (ctx, state_id, outcome) = run_state(&yaml, registry(invoker), json!({})).await;

        assert!(matches!(outcome, Err(ProcessError::Fault(_))));
        assert_eq!(ctx.activity(&state_id).await.unwrap().status, ActivityStatus::Faulted);
    }

    #[tokio::test]
    async fn test_parallel_any_takes_first_completion() {
        let invoker = Arc::new(ScriptedInvoker::new(FunctionKind::Http, json!("sent")));
        let yaml = FAN_OUT.replace("COMPLETION", "any");
        let (ctx, state_id, outcome) = run_state(&yaml, registry(invoker), json!({})).await;

        let ActivityOutcome::Completed(output) = outcome.unwrap() else {
            panic!("expected completion");
        };
        assert!(output.get("email").is_some() || output.get("sms").is_some());
        let branches = ctx.get_activities(Some(&state_id)).await;
        assert!(branches.iter().all(|b| b.status.is_terminal()));
        assert!(branches.iter().any(|b| b.status == ActivityStatus::Completed));
    }

    #[tokio::test]
    async fn test_for_each_collects_outputs_in_order() {
        let functions = FunctionInvokerRegistry::with_defaults(Arc::new(crate::expression::WorkflowEvaluator::new()));
        let (ctx, state_id, outcome) = run_state(LOOP, functions, json!({"numbers": [1, 2, 3]})).await;

        let ActivityOutcome::Completed(output) = outcome.unwrap() else {
            panic!("expected completion");
        };
        let squares: Vec<f64> = output["squares"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_f64().unwrap())
            .collect();
        assert_eq!(squares, vec![1.0, 4.0, 9.0]);
        assert!(output.get("item").is_none());

        let iterations = ctx.get_activities(Some(&state_id)).await;
        let names: Vec<_> = iterations.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["0", "1", "2"]);
        assert!(iterations.iter().all(|a| a.kind == ActivityKind::Iteration));
    }

    #[tokio::test]
    async fn test_for_each_rejects_non_array() {
        let functions = FunctionInvokerRegistry::with_defaults(Arc::new(crate::expression::WorkflowEvaluator::new()));
        let (_, _, outcome) = run_state(LOOP, functions, json!({"numbers": "nope"})).await;

        match outcome {
            Err(ProcessError::Fault(error)) => {
                assert_eq!(error.error_type, synapse_types::error::WorkflowError::EXPRESSION)
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
