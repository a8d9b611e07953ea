//! Function invocation dispatch.
//!
//! Each `FunctionKind` is served by one `FunctionInvoker`. The registry maps
//! kinds to invokers so that adding a protocol is a matter of registering a
//! new implementation; kinds without an invoker fault the calling activity.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use synapse_types::error::WorkflowError;
use synapse_types::workflow::{FunctionDefinition, FunctionKind};

use crate::expression::{ExpressionError, ExpressionEvaluator};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum FunctionError {
    #[error("unsupported function kind '{0}'")]
    Unsupported(FunctionKind),

    #[error("invalid operation for function '{function}': {message}")]
    InvalidOperation { function: String, message: String },

    /// Transport failure or non-success response.
    #[error("function '{function}' failed: {message}")]
    Communication {
        function: String,
        status: Option<u16>,
        message: String,
    },

    #[error("authentication for function '{function}' failed: {message}")]
    Authentication { function: String, message: String },

    #[error(transparent)]
    Expression(#[from] ExpressionError),
}

impl FunctionError {
    /// Whether a retry policy may re-attempt the call.
    pub fn is_transient(&self) -> bool {
        match self {
            FunctionError::Communication { status, .. } => {
                status.is_none_or(|s| s == 408 || s == 429 || s >= 500)
            }
            FunctionError::Authentication { .. } => true,
            _ => false,
        }
    }

    pub fn to_workflow_error(&self) -> WorkflowError {
        let error_type = match self {
            FunctionError::Communication { .. } | FunctionError::Authentication { .. } => {
                WorkflowError::COMMUNICATION
            }
            FunctionError::Expression(_) => WorkflowError::EXPRESSION,
            FunctionError::Unsupported(_) | FunctionError::InvalidOperation { .. } => {
                WorkflowError::RUNTIME
            }
        };
        let mut error = WorkflowError::new(error_type, "function invocation failed")
            .with_detail(self.to_string());
        if let FunctionError::Communication {
            status: Some(status),
            ..
        } = self
        {
            error = error.with_status(*status);
        }
        error
    }
}

// ---------------------------------------------------------------------------
// Invoker trait
// ---------------------------------------------------------------------------

/// A resolved call: the function definition plus evaluated arguments.
#[derive(Debug, Clone)]
pub struct FunctionCall {
    pub function: FunctionDefinition,
    pub arguments: Value,
}

pub type FunctionFuture<'a> = Pin<Box<dyn Future<Output = Result<Value, FunctionError>> + Send + 'a>>;

/// Invokes functions of one kind.
///
/// Object-safe so that invokers from other crates can be registered behind
/// `Arc<dyn FunctionInvoker>`.
pub trait FunctionInvoker: Send + Sync {
    fn kind(&self) -> FunctionKind;

    fn invoke<'a>(&'a self, call: &'a FunctionCall) -> FunctionFuture<'a>;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Maps function kinds to their invokers.
#[derive(Clone, Default)]
pub struct FunctionInvokerRegistry {
    invokers: HashMap<FunctionKind, Arc<dyn FunctionInvoker>>,
}

impl FunctionInvokerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in expression invoker.
    pub fn with_defaults(evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ExpressionFunctionInvoker::new(evaluator)));
        registry
    }

    /// Register an invoker, replacing any previous one of the same kind.
    pub fn register(&mut self, invoker: Arc<dyn FunctionInvoker>) {
        self.invokers.insert(invoker.kind(), invoker);
    }

    pub fn get(&self, kind: FunctionKind) -> Option<&Arc<dyn FunctionInvoker>> {
        self.invokers.get(&kind)
    }

    pub async fn invoke(&self, call: &FunctionCall) -> Result<Value, FunctionError> {
        let invoker = self
            .get(call.function.kind)
            .ok_or(FunctionError::Unsupported(call.function.kind))?;
        tracing::debug!(
            function = call.function.name.as_str(),
            kind = %call.function.kind,
            "invoking function"
        );
        invoker.invoke(call).await
    }
}

impl std::fmt::Debug for FunctionInvokerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<&'static str> = self.invokers.keys().map(FunctionKind::as_str).collect();
        kinds.sort_unstable();
        f.debug_struct("FunctionInvokerRegistry")
            .field("kinds", &kinds)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Expression functions
// ---------------------------------------------------------------------------

/// Evaluates the function's `operation` as a runtime expression over the
/// call arguments.
pub struct ExpressionFunctionInvoker {
    evaluator: Arc<dyn ExpressionEvaluator>,
}

impl ExpressionFunctionInvoker {
    pub fn new(evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        Self { evaluator }
    }
}

impl FunctionInvoker for ExpressionFunctionInvoker {
    fn kind(&self) -> FunctionKind {
        FunctionKind::Expression
    }

    fn invoke<'a>(&'a self, call: &'a FunctionCall) -> FunctionFuture<'a> {
        Box::pin(async move {
            Ok(self
                .evaluator
                .evaluate(&call.function.operation, &call.arguments)?)
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Replays scripted results and counts invocations.
    pub struct ScriptedInvoker {
        kind: FunctionKind,
        results: Mutex<VecDeque<Result<Value, FunctionError>>>,
        fallback: Value,
        pub calls: AtomicUsize,
        pub arguments: Mutex<Vec<Value>>,
    }

    impl ScriptedInvoker {
        /// Always returns `fallback` once the script is exhausted.
        pub fn new(kind: FunctionKind, fallback: Value) -> Self {
            Self {
                kind,
                results: Mutex::new(VecDeque::new()),
                fallback,
                calls: AtomicUsize::new(0),
                arguments: Mutex::new(Vec::new()),
            }
        }

        pub fn then(self, result: Result<Value, FunctionError>) -> Self {
            self.results.lock().unwrap().push_back(result);
            self
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl FunctionInvoker for ScriptedInvoker {
        fn kind(&self) -> FunctionKind {
            self.kind
        }

        fn invoke<'a>(&'a self, call: &'a FunctionCall) -> FunctionFuture<'a> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.arguments.lock().unwrap().push(call.arguments.clone());
            let next = self.results.lock().unwrap().pop_front();
            let fallback = self.fallback.clone();
            Box::pin(async move { next.unwrap_or(Ok(fallback)) })
        }
    }

    pub fn communication_error(function: &str, status: Option<u16>) -> FunctionError {
        FunctionError::Communication {
            function: function.to_string(),
            status,
            message: "connection refused".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ScriptedInvoker;
    use super::*;
    use crate::expression::WorkflowEvaluator;
    use serde_json::json;

    fn function(kind: FunctionKind, operation: &str) -> FunctionDefinition {
        FunctionDefinition {
            name: "f".to_string(),
            kind,
            operation: operation.to_string(),
            auth: None,
        }
    }

    #[tokio::test]
    async fn test_expression_invoker() {
        let registry = FunctionInvokerRegistry::with_defaults(Arc::new(WorkflowEvaluator::new()));
        let call = FunctionCall {
            function: function(FunctionKind::Expression, "${ a + b }"),
            arguments: json!({"a": 2, "b": 3}),
        };
        assert_eq!(registry.invoke(&call).await.unwrap().as_f64(), Some(5.0));
    }

    #[tokio::test]
    async fn test_unsupported_kind() {
        let registry = FunctionInvokerRegistry::new();
        let call = FunctionCall {
            function: function(FunctionKind::Grpc, "svc#Op"),
            arguments: Value::Null,
        };
        let err = registry.invoke(&call).await.unwrap_err();
        assert_eq!(err.to_string(), "unsupported function kind 'grpc'");
        assert!(!err.is_transient());
        assert_eq!(err.to_workflow_error().error_type, WorkflowError::RUNTIME);
    }

    #[tokio::test]
    async fn test_register_replaces_kind() {
        let mut registry = FunctionInvokerRegistry::new();
        registry.register(Arc::new(ScriptedInvoker::new(FunctionKind::Http, json!(1))));
        registry.register(Arc::new(ScriptedInvoker::new(FunctionKind::Http, json!(2))));
        let call = FunctionCall {
            function: function(FunctionKind::Http, "GET http://x"),
            arguments: Value::Null,
        };
        assert_eq!(registry.invoke(&call).await.unwrap(), json!(2));
        assert!(format!("{registry:?}").contains("http"));
    }

    #[test]
    fn test_transient_classification() {
        let err = |status| FunctionError::Communication {
            function: "f".into(),
            status,
            message: "boom".into(),
        };
        assert!(err(None).is_transient());
        assert!(err(Some(503)).is_transient());
        assert!(err(Some(429)).is_transient());
        assert!(!err(Some(404)).is_transient());

        let wf = err(Some(404)).to_workflow_error();
        assert_eq!(wf.error_type, WorkflowError::COMMUNICATION);
        assert_eq!(wf.status, Some(404));
    }
}
