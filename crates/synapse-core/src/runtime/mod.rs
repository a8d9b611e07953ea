//! Workflow execution: per-instance runtime, activity processors and the
//! function invocation seam.

pub mod context;
pub mod executor;
pub mod function;
pub mod processor;
pub mod retry;

pub use context::{RuntimeServices, WorkflowRuntimeContext};
pub use executor::{ExecutionHandle, ExecutionOutcome, RuntimeError, StopReason, WorkflowRuntime};
pub use function::{FunctionCall, FunctionError, FunctionInvoker, FunctionInvokerRegistry};
pub use processor::{ActivityOutcome, ProcessError};
