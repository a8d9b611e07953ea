//! Workflow definition types.
//!
//! A `WorkflowDefinition` is the declarative, versioned description of a
//! state machine: named states joined by transitions, the functions its
//! actions call, retry policies and error handlers. Definitions are stored
//! inside a `Workflow` resource, one entry per published version.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::correlation::EventConsumptionStrategy;
use crate::resource::{Resource, ResourceMetadata};

// ---------------------------------------------------------------------------
// Workflow resource
// ---------------------------------------------------------------------------

/// Stored workflow: every published version of one definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub metadata: ResourceMetadata,
    pub spec: WorkflowSpec,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowSpec {
    #[serde(default)]
    pub versions: Vec<WorkflowDefinition>,
}

impl Workflow {
    pub fn new(metadata: ResourceMetadata, definition: WorkflowDefinition) -> Self {
        Self {
            metadata,
            spec: WorkflowSpec {
                versions: vec![definition],
            },
        }
    }

    /// Find the definition published under an exact version string.
    pub fn version(&self, version: &str) -> Option<&WorkflowDefinition> {
        self.spec.versions.iter().find(|d| d.version == version)
    }

    /// The highest semantic version published. Unparseable versions rank lowest.
    pub fn latest(&self) -> Option<&WorkflowDefinition> {
        self.spec
            .versions
            .iter()
            .max_by(|a, b| match (semver::Version::parse(&a.version), semver::Version::parse(&b.version)) {
                (Ok(a), Ok(b)) => a.cmp(&b),
                (Ok(_), Err(_)) => std::cmp::Ordering::Greater,
                (Err(_), Ok(_)) => std::cmp::Ordering::Less,
                (Err(_), Err(_)) => a.version.cmp(&b.version),
            })
    }

    /// Resolve an exact version, or the latest one when `version` is `None`.
    pub fn resolve(&self, version: Option<&str>) -> Option<&WorkflowDefinition> {
        match version {
            Some(v) => self.version(v),
            None => self.latest(),
        }
    }
}

impl Resource for Workflow {
    const KIND: &'static str = "Workflow";

    fn metadata(&self) -> &ResourceMetadata {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ResourceMetadata {
        &mut self.metadata
    }
}

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// One version of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Identifier shared by all versions of the workflow.
    pub id: String,
    /// Semantic version string (e.g. "1.0.0").
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Name of the state executed first.
    pub start: String,
    /// Schema the instance input must satisfy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<SchemaDefinition>,
    /// Runtime expression projecting the final state data into the output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_filter: Option<String>,
    /// Whole-instance execution timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub functions: Vec<FunctionDefinition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retries: Vec<RetryDefinition>,
    pub states: Vec<StateDefinition>,
}

impl WorkflowDefinition {
    pub fn state(&self, name: &str) -> Option<&StateDefinition> {
        self.states.iter().find(|s| s.name == name)
    }

    pub fn function(&self, name: &str) -> Option<&FunctionDefinition> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn retry(&self, name: &str) -> Option<&RetryDefinition> {
        self.retries.iter().find(|r| r.name == name)
    }
}

/// Schema a document is validated against, inline or external.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDefinition {
    /// Schema language, e.g. `json`, `xml`, `avro`.
    #[serde(default = "default_schema_format")]
    pub format: String,
    /// Inline schema document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<Value>,
    /// Location of a schema fetched at validation time (`file://`, `http(s)://`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
}

fn default_schema_format() -> String {
    "json".to_string()
}

// ---------------------------------------------------------------------------
// Functions
// ---------------------------------------------------------------------------

/// A callable the workflow's actions can reference by name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: FunctionKind,
    /// Kind-specific target:
    /// - `http`: `[METHOD ]url`
    /// - `openapi`: `document-uri#operationId`
    /// - `odata`: `service-uri#EntitySet`
    /// - `expression`: the runtime expression itself
    /// - `grpc`: `endpoint#package.Service#Method`
    /// - `asyncapi`: `document-uri#operationId`
    pub operation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthDefinition>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunctionKind {
    #[default]
    Http,
    #[serde(rename = "openapi")]
    OpenApi,
    Grpc,
    #[serde(rename = "asyncapi")]
    AsyncApi,
    #[serde(rename = "odata")]
    OData,
    Expression,
}

impl FunctionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FunctionKind::Http => "http",
            FunctionKind::OpenApi => "openapi",
            FunctionKind::Grpc => "grpc",
            FunctionKind::AsyncApi => "asyncapi",
            FunctionKind::OData => "odata",
            FunctionKind::Expression => "expression",
        }
    }
}

impl std::fmt::Display for FunctionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Credentials attached to outbound function calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scheme", rename_all = "snake_case")]
pub enum AuthDefinition {
    Basic { username: String, password: String },
    Bearer { token: String },
    #[serde(rename = "oauth2")]
    OAuth2 {
        /// Token endpoint base (the `/oauth2/token` path is not appended).
        authority: String,
        client_id: String,
        client_secret: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        scopes: Vec<String>,
    },
}

// ---------------------------------------------------------------------------
// Retries
// ---------------------------------------------------------------------------

/// Named retry policy referenced from actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryDefinition {
    pub name: String,
    /// Maximum number of attempts including the first (default 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the second attempt (default 1000ms).
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
    /// Back-off multiplier applied per attempt (default 2.0).
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<u64>,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_delay_ms() -> u64 {
    1000
}

fn default_multiplier() -> f64 {
    2.0
}

// ---------------------------------------------------------------------------
// States
// ---------------------------------------------------------------------------

/// A named node of the workflow state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDefinition {
    pub name: String,
    #[serde(flatten)]
    pub kind: StateKind,
    /// Next state once this one completes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition: Option<String>,
    /// Whether the workflow ends after this state.
    #[serde(default)]
    pub end: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_data_filter: Option<StateDataFilter>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_errors: Vec<ErrorHandlerDefinition>,
}

/// State-specific configuration, internally tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StateKind {
    /// Perform one or more actions.
    Operation {
        #[serde(default)]
        action_mode: ActionExecutionMode,
        actions: Vec<ActionDefinition>,
    },
    /// Pause for a fixed duration.
    Sleep { duration_ms: u64 },
    /// Merge static data into the state data.
    Inject { data: Value },
    /// Choose the next state from the first matching condition.
    Switch {
        conditions: Vec<SwitchCondition>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default_transition: Option<String>,
    },
    /// Wait for correlated events.
    Listen {
        events: EventConsumptionStrategy,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
    /// Run branches concurrently.
    Parallel {
        branches: Vec<BranchDefinition>,
        #[serde(default)]
        completion: ParallelCompletion,
    },
    /// Run actions once per element of a collection.
    ForEach {
        /// Runtime expression yielding an array.
        input_collection: String,
        /// Name under which each element is exposed to the actions.
        iteration_param: String,
        actions: Vec<ActionDefinition>,
        /// State data key receiving the iteration outputs (default `results`).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output_collection: Option<String>,
    },
}

impl StateKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            StateKind::Operation { .. } => "operation",
            StateKind::Sleep { .. } => "sleep",
            StateKind::Inject { .. } => "inject",
            StateKind::Switch { .. } => "switch",
            StateKind::Listen { .. } => "listen",
            StateKind::Parallel { .. } => "parallel",
            StateKind::ForEach { .. } => "for_each",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionExecutionMode {
    #[default]
    Sequential,
    Parallel,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParallelCompletion {
    /// Join every branch.
    #[default]
    All,
    /// Proceed with the first branch to complete and cancel the rest.
    Any,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchCondition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub condition: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition: Option<String>,
    #[serde(default)]
    pub end: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchDefinition {
    pub name: String,
    #[serde(default)]
    pub action_mode: ActionExecutionMode,
    pub actions: Vec<ActionDefinition>,
}

/// Projections applied to state data on entry and exit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDataFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

/// Routes a faulted state to a recovery transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorHandlerDefinition {
    /// Error type to catch, or `*` for any.
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition: Option<String>,
    #[serde(default)]
    pub end: bool,
}

impl ErrorHandlerDefinition {
    pub fn handles(&self, error_type: &str) -> bool {
        self.error == "*" || self.error.eq_ignore_ascii_case(error_type)
    }
}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

/// A unit of work inside a state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionDefinition {
    pub name: String,
    /// Runtime expression; the action is skipped when it evaluates falsy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_ref: Option<FunctionReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_flow_ref: Option<SubFlowReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sleep: Option<ActionSleep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_filter: Option<ActionDataFilter>,
    /// Name of a `RetryDefinition` governing function invocation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionReference {
    pub ref_name: String,
    /// Arguments; string leaves may be runtime expressions.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub arguments: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubFlowReference {
    pub workflow: String,
    /// Exact version; latest when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Input of the child instance; the action input when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionSleep {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_ms: Option<u64>,
}

/// How an action reads state data and writes its results back.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionDataFilter {
    /// Expression selecting the action input from state data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_state_data: Option<String>,
    /// Expression projecting the raw result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<String>,
    /// Top-level state data key receiving the results; merged when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_state_data: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORDER_WORKFLOW: &str = r#"
id: order-processing
version: 1.0.0
name: Order processing
start: check
input_schema:
  document:
    type: object
    required: [order_id]
functions:
  - name: charge
    type: openapi
    operation: https://payments.example.com/openapi.json#charge
    auth:
      scheme: oauth2
      authority: https://login.example.com/token
      client_id: synapse
      client_secret: s3cret
      scopes: [payments]
  - name: total
    type: expression
    operation: "${ order.lines | length }"
retries:
  - name: twice
    max_attempts: 2
states:
  - name: check
    type: switch
    conditions:
      - condition: "${ order.total > 100 }"
        transition: charge
    default_transition: done
  - name: charge
    type: operation
    actions:
      - name: charge-card
        function_ref:
          ref_name: charge
          arguments:
            amount: "${ order.total }"
        retry_ref: twice
        sleep:
          before_ms: 10
    transition: await-shipping
    on_errors:
      - error: communication
        transition: done
  - name: await-shipping
    type: listen
    events:
      strategy: all
      filters:
        - attributes:
            type: com.example.shipped
          correlate:
            - key: order
              from: "${ subject }"
    transition: done
  - name: done
    type: inject
    data:
      status: finished
    end: true
"#;

    #[test]
    fn test_parse_realistic_yaml_workflow() {
        let def: WorkflowDefinition = serde_yaml_ng::from_str(ORDER_WORKFLOW).unwrap();
        assert_eq!(def.id, "order-processing");
        assert_eq!(def.states.len(), 4);
        assert_eq!(def.input_schema.as_ref().unwrap().format, "json");

        let charge = def.function("charge").unwrap();
        assert_eq!(charge.kind, FunctionKind::OpenApi);
        assert!(matches!(
            charge.auth,
            Some(AuthDefinition::OAuth2 { ref scopes, .. }) if scopes == &["payments"]
        ));

        let retry = def.retry("twice").unwrap();
        assert_eq!(retry.max_attempts, 2);
        assert_eq!(retry.delay_ms, 1000);
        assert_eq!(retry.multiplier, 2.0);

        let state = def.state("charge").unwrap();
        match &state.kind {
            StateKind::Operation { action_mode, actions } => {
                assert_eq!(*action_mode, ActionExecutionMode::Sequential);
                assert_eq!(actions[0].sleep.unwrap().before_ms, Some(10));
                assert_eq!(
                    actions[0].function_ref.as_ref().unwrap().arguments["amount"],
                    "${ order.total }"
                );
            }
            other => panic!("expected operation state, got {other:?}"),
        }
        assert!(state.on_errors[0].handles("Communication"));
        assert!(def.state("done").unwrap().end);
    }

    #[test]
    fn test_definition_yaml_roundtrip() {
        let def: WorkflowDefinition = serde_yaml_ng::from_str(ORDER_WORKFLOW).unwrap();
        let yaml = serde_yaml_ng::to_string(&def).unwrap();
        let back: WorkflowDefinition = serde_yaml_ng::from_str(&yaml).unwrap();
        assert_eq!(def, back);
    }

    #[test]
    fn test_state_kind_tag() {
        let state: StateDefinition = serde_json::from_value(serde_json::json!({
            "name": "loop",
            "type": "for_each",
            "input_collection": "${ items }",
            "iteration_param": "item",
            "actions": []
        }))
        .unwrap();
        assert_eq!(state.kind.type_name(), "for_each");
        assert!(!state.end);
    }

    #[test]
    fn test_function_kind_defaults_to_http() {
        let f: FunctionDefinition = serde_json::from_value(serde_json::json!({
            "name": "ping",
            "operation": "GET https://example.com/ping"
        }))
        .unwrap();
        assert_eq!(f.kind, FunctionKind::Http);
        assert_eq!(f.kind.to_string(), "http");
    }

    #[test]
    fn test_wildcard_error_handler() {
        let handler = ErrorHandlerDefinition {
            error: "*".to_string(),
            transition: None,
            end: true,
        };
        assert!(handler.handles("runtime"));
        assert!(handler.handles("anything"));
    }

    #[test]
    fn test_workflow_version_lookup() {
        let def: WorkflowDefinition = serde_yaml_ng::from_str(ORDER_WORKFLOW).unwrap();
        let wf = Workflow::new(ResourceMetadata::new("order-processing", "default"), def);
        assert!(wf.version("1.0.0").is_some());
        assert!(wf.version("2.0.0").is_none());
        assert_eq!(Workflow::KIND, "Workflow");
    }

    #[test]
    fn test_latest_uses_semver_ordering() {
        let base: WorkflowDefinition = serde_yaml_ng::from_str(ORDER_WORKFLOW).unwrap();
        let mut wf = Workflow::new(ResourceMetadata::new("order-processing", "default"), base.clone());
        for v in ["1.10.0", "1.9.3"] {
            let mut def = base.clone();
            def.version = v.to_string();
            wf.spec.versions.push(def);
        }
        assert_eq!(wf.latest().unwrap().version, "1.10.0");
        assert_eq!(wf.resolve(Some("1.9.3")).unwrap().version, "1.9.3");
        assert_eq!(wf.resolve(None).unwrap().version, "1.10.0");
    }
}
