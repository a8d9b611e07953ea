//! gRPC functions.
//!
//! The operation is `endpoint#package.Service#Method` (a `/` may stand in for
//! the second `#`). Calls are unary and travel over the Connect protocol's
//! JSON encoding: a POST of the arguments to `endpoint/package.Service/Method`,
//! which gRPC servers exposing Connect or gRPC-JSON transcoding accept.
//! Connect error bodies (`{"code", "message"}`) are folded into the error
//! message; the HTTP status still drives retry classification.

use reqwest::Method;
use serde_json::Value;
use synapse_core::runtime::function::FunctionFuture;
use synapse_core::runtime::{FunctionCall, FunctionError, FunctionInvoker};
use synapse_types::workflow::FunctionKind;

use super::HttpFunctionClient;

const PROTOCOL_VERSION_HEADER: &str = "Connect-Protocol-Version";

pub struct GrpcFunctionInvoker {
    client: HttpFunctionClient,
}

/// A resolved unary method.
#[derive(Debug, Clone, PartialEq)]
struct GrpcMethod {
    endpoint: String,
    service: String,
    method: String,
}

impl GrpcMethod {
    fn url(&self) -> String {
        format!("{}/{}/{}", self.endpoint.trim_end_matches('/'), self.service, self.method)
    }
}

impl GrpcFunctionInvoker {
    pub fn new(client: HttpFunctionClient) -> Self {
        Self { client }
    }

    async fn call(&self, call: &FunctionCall) -> Result<Value, FunctionError> {
        let function = &call.function;
        let target = parse_operation(&function.name, &function.operation)?;
        let message = match &call.arguments {
            Value::Null => Value::Object(Default::default()),
            other => other.clone(),
        };

        let request = self
            .client
            .request(Method::POST, &target.url())
            .header(PROTOCOL_VERSION_HEADER, "1")
            .json(&message);
        tracing::debug!(
            function = function.name.as_str(),
            service = target.service.as_str(),
            method = target.method.as_str(),
            "calling gRPC method"
        );

        self.client.send(function, request).await.map_err(connect_error)
    }
}

impl FunctionInvoker for GrpcFunctionInvoker {
    fn kind(&self) -> FunctionKind {
        FunctionKind::Grpc
    }

    fn invoke<'a>(&'a self, call: &'a FunctionCall) -> FunctionFuture<'a> {
        Box::pin(self.call(call))
    }
}

fn parse_operation(function: &str, operation: &str) -> Result<GrpcMethod, FunctionError> {
    let invalid = |message: String| FunctionError::InvalidOperation {
        function: function.to_string(),
        message,
    };

    let (endpoint, target) = operation
        .trim()
        .split_once('#')
        .ok_or_else(|| invalid("expected 'endpoint#package.Service#Method'".to_string()))?;
    if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
        return Err(invalid(format!("'{endpoint}' is not an http(s) endpoint")));
    }
    let (service, method) = target
        .split_once(['#', '/'])
        .filter(|(service, method)| !service.is_empty() && !method.is_empty())
        .ok_or_else(|| invalid(format!("'{target}' does not name a service and a method")))?;

    Ok(GrpcMethod {
        endpoint: endpoint.to_string(),
        service: service.to_string(),
        method: method.to_string(),
    })
}

/// Rewrite a Connect error body into `code: message`.
fn connect_error(error: FunctionError) -> FunctionError {
    match error {
        FunctionError::Communication {
            function,
            status,
            message,
        } => {
            let message = match serde_json::from_str::<Value>(&message) {
                Ok(body) => match (body.get("code").and_then(Value::as_str), body.get("message")) {
                    (Some(code), Some(Value::String(detail))) => format!("{code}: {detail}"),
                    (Some(code), _) => code.to_string(),
                    _ => message,
                },
                Err(_) => message,
            };
            FunctionError::Communication {
                function,
                status,
                message,
            }
        }
        other => other,
    }
}
