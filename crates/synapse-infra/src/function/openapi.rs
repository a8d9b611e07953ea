//! OpenAPI functions.
//!
//! The operation is `document-uri#operationId`. The document (OpenAPI 3 or
//! Swagger 2, JSON or YAML) is fetched once through the external resource
//! provider and cached. Call arguments are matched to the operation's
//! declared parameters by name; whatever is left becomes the request body
//! when the operation accepts one, unless a `body` argument is given.

use std::sync::Arc;

use reqwest::Method;
use serde_json::{Map, Value};
use synapse_core::external::ExternalResourceProvider;
use synapse_core::runtime::function::FunctionFuture;
use synapse_core::runtime::{FunctionCall, FunctionError, FunctionInvoker};
use synapse_types::workflow::FunctionKind;

use super::{apply_server_variables, argument_object, expand_path, origin, scalar_text, DocumentCache, HttpFunctionClient};

const METHODS: [&str; 8] = ["get", "put", "post", "delete", "options", "head", "patch", "trace"];

pub struct OpenApiFunctionInvoker {
    client: HttpFunctionClient,
    documents: DocumentCache,
}

/// An operation located in a document.
#[derive(Debug, Clone, PartialEq)]
struct ResolvedOperation {
    method: Method,
    path: String,
    parameters: Vec<Parameter>,
    accepts_body: bool,
}

#[derive(Debug, Clone, PartialEq)]
struct Parameter {
    name: String,
    location: String,
    required: bool,
}

impl OpenApiFunctionInvoker {
    pub fn new(client: HttpFunctionClient, resources: Arc<dyn ExternalResourceProvider>) -> Self {
        Self {
            client,
            documents: DocumentCache::new(resources, "OpenAPI"),
        }
    }

    async fn call(&self, call: &FunctionCall) -> Result<Value, FunctionError> {
        let function = &call.function;
        let invalid = |message: String| FunctionError::InvalidOperation {
            function: function.name.clone(),
            message,
        };

        let (uri, operation_id) = function
            .operation
            .split_once('#')
            .ok_or_else(|| invalid("expected 'document-uri#operationId'".to_string()))?;
        let document = self.documents.get(&function.name, uri).await?;
        let operation = find_operation(&document, operation_id)
            .ok_or_else(|| invalid(format!("operation '{operation_id}' not found in {uri}")))?;
        let base = base_url(&document, uri).ok_or_else(|| invalid(format!("{uri} declares no usable server url")))?;

        let mut arguments = argument_object(&call.arguments)
            .map_err(|_| invalid("arguments must be an object".to_string()))?;

        let mut query = Vec::new();
        let mut headers = Vec::new();
        let mut body_param = None;
        for param in &operation.parameters {
            let value = match param.location.as_str() {
                // Consumed by path expansion below.
                "path" => continue,
                _ => arguments.remove(&param.name),
            };
            match (param.location.as_str(), value) {
                ("query", Some(v)) => query.push((param.name.clone(), scalar_text(&v))),
                ("header", Some(v)) => headers.push((param.name.clone(), scalar_text(&v))),
                ("body", Some(v)) => body_param = Some(v),
                (_, None) if param.required => {
                    return Err(invalid(format!("missing required parameter '{}'", param.name)));
                }
                _ => {}
            }
        }

        let path = expand_path(&function.name, &operation.path, &mut arguments)?;
        let url = format!("{}{}", base.trim_end_matches('/'), path);
        let mut request = self.client.request(operation.method.clone(), &url);
        if !query.is_empty() {
            request = request.query(&query);
        }
        for (name, value) in &headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = body_param.or_else(|| request_body(&operation, arguments)) {
            request = request.json(&body);
        }

        self.client.send(function, request).await
    }
}

impl FunctionInvoker for OpenApiFunctionInvoker {
    fn kind(&self) -> FunctionKind {
        FunctionKind::OpenApi
    }

    fn invoke<'a>(&'a self, call: &'a FunctionCall) -> FunctionFuture<'a> {
        Box::pin(self.call(call))
    }
}

impl std::fmt::Debug for OpenApiFunctionInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenApiFunctionInvoker")
            .field("documents", &self.documents.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Document navigation
// ---------------------------------------------------------------------------

fn request_body(operation: &ResolvedOperation, mut arguments: Map<String, Value>) -> Option<Value> {
    if !operation.accepts_body {
        return None;
    }
    if let Some(body) = arguments.remove("body") {
        return Some(body);
    }
    (!arguments.is_empty()).then_some(Value::Object(arguments))
}

fn parameters_of(item: &Value) -> Vec<Parameter> {
    item.get("parameters")
        .and_then(Value::as_array)
        .map(|params| {
            params
                .iter()
                .filter_map(|p| {
                    Some(Parameter {
                        name: p.get("name")?.as_str()?.to_string(),
                        location: p.get("in")?.as_str()?.to_string(),
                        required: p.get("required").and_then(Value::as_bool).unwrap_or(false),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn find_operation(document: &Value, operation_id: &str) -> Option<ResolvedOperation> {
    let paths = document.get("paths")?.as_object()?;
    for (path, item) in paths {
        for name in METHODS {
            let Some(operation) = item.get(name) else {
                continue;
            };
            if operation.get("operationId").and_then(Value::as_str) != Some(operation_id) {
                continue;
            }
            // Operation-level parameters override path-level ones.
            let mut parameters = parameters_of(item);
            for param in parameters_of(operation) {
                parameters.retain(|p| !(p.name == param.name && p.location == param.location));
                parameters.push(param);
            }
            let accepts_body = operation.get("requestBody").is_some()
                || parameters.iter().any(|p| p.location == "body");
            return Some(ResolvedOperation {
                method: Method::from_bytes(name.to_ascii_uppercase().as_bytes()).ok()?,
                path: path.clone(),
                parameters,
                accepts_body,
            });
        }
    }
    None
}

/// Server URL of the document: `servers[0]` (OpenAPI 3, variables
/// substituted with their defaults) or `schemes/host/basePath` (Swagger 2).
/// Relative URLs resolve against the document's own origin.
fn base_url(document: &Value, document_uri: &str) -> Option<String> {
    let declared = if let Some(server) = document.pointer("/servers/0") {
        apply_server_variables(server.get("url")?.as_str()?, server)
    } else if let Some(host) = document.get("host").and_then(Value::as_str) {
        let scheme = document
            .pointer("/schemes/0")
            .and_then(Value::as_str)
            .unwrap_or("https");
        let base_path = document.get("basePath").and_then(Value::as_str).unwrap_or("");
        format!("{scheme}://{host}{base_path}")
    } else {
        String::new()
    };

    if declared.starts_with("http://") || declared.starts_with("https://") {
        return Some(declared);
    }
    origin(document_uri).map(|origin| format!("{origin}{declared}"))
}
