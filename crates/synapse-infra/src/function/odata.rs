//! OData functions.
//!
//! The operation is `service-uri#EntitySet`. A `key` argument addresses a
//! single entity (`EntitySet(key)`); the system query options (`$filter`,
//! `$select`, `$expand`, `$orderby`, `$top`, `$skip`, `$count`, `$search`)
//! may be given with or without the `$` prefix. Collection responses are
//! unwrapped from their `value` envelope.

use reqwest::Method;
use serde_json::Value;
use synapse_core::runtime::function::FunctionFuture;
use synapse_core::runtime::{FunctionCall, FunctionError, FunctionInvoker};
use synapse_types::workflow::FunctionKind;

use super::{argument_object, scalar_text, HttpFunctionClient};

const QUERY_OPTIONS: [&str; 8] = ["filter", "select", "expand", "orderby", "top", "skip", "count", "search"];

pub struct ODataFunctionInvoker {
    client: HttpFunctionClient,
}

/// A resolved OData read.
#[derive(Debug, Clone, PartialEq)]
struct ODataQuery {
    url: String,
    options: Vec<(String, String)>,
}

impl ODataFunctionInvoker {
    pub fn new(client: HttpFunctionClient) -> Self {
        Self { client }
    }

    async fn call(&self, call: &FunctionCall) -> Result<Value, FunctionError> {
        let function = &call.function;
        let query = build_query(&function.name, &function.operation, &call.arguments)?;

        let mut request = self
            .client
            .request(Method::GET, &query.url)
            .header("Accept", "application/json");
        if !query.options.is_empty() {
            request = request.query(&query.options);
        }

        let response = self.client.send(function, request).await?;
        Ok(match response {
            Value::Object(mut body) if body.contains_key("value") => {
                body.remove("value").unwrap_or(Value::Null)
            }
            other => other,
        })
    }
}

impl FunctionInvoker for ODataFunctionInvoker {
    fn kind(&self) -> FunctionKind {
        FunctionKind::OData
    }

    fn invoke<'a>(&'a self, call: &'a FunctionCall) -> FunctionFuture<'a> {
        Box::pin(self.call(call))
    }
}

fn build_query(function: &str, operation: &str, arguments: &Value) -> Result<ODataQuery, FunctionError> {
    let invalid = |message: String| FunctionError::InvalidOperation {
        function: function.to_string(),
        message,
    };

    let (service, entity_set) = operation
        .split_once('#')
        .filter(|(service, set)| !service.is_empty() && !set.is_empty())
        .ok_or_else(|| invalid("expected 'service-uri#EntitySet'".to_string()))?;
    let mut arguments =
        argument_object(arguments).map_err(|_| invalid("arguments must be an object".to_string()))?;

    let mut url = format!("{}/{}", service.trim_end_matches('/'), entity_set);
    if let Some(key) = arguments.remove("key") {
        match key {
            Value::String(s) => url.push_str(&format!("('{}')", s.replace('\'', "''"))),
            other => url.push_str(&format!("({other})")),
        }
    }

    let mut options = Vec::new();
    for name in QUERY_OPTIONS {
        let value = arguments
            .remove(&format!("${name}"))
            .or_else(|| arguments.remove(name));
        if let Some(value) = value {
            options.push((format!("${name}"), scalar_text(&value)));
        }
    }
    if !arguments.is_empty() {
        let mut unknown: Vec<&str> = arguments.keys().map(String::as_str).collect();
        unknown.sort_unstable();
        return Err(invalid(format!("unsupported OData arguments: {}", unknown.join(", "))));
    }

    Ok(ODataQuery { url, options })
}
