//! Plain HTTP functions.
//!
//! The operation is `[METHOD ]url`, defaulting to GET. `{name}` placeholders
//! in the URL are filled from the call arguments. Remaining arguments travel
//! as the query string for GET, HEAD and DELETE, and as a JSON body otherwise.

use reqwest::Method;
use serde_json::Value;
use synapse_core::runtime::function::FunctionFuture;
use synapse_core::runtime::{FunctionCall, FunctionError, FunctionInvoker};
use synapse_types::workflow::FunctionKind;

use super::{argument_object, expand_path, scalar_text, HttpFunctionClient};

pub struct HttpFunctionInvoker {
    client: HttpFunctionClient,
}

impl HttpFunctionInvoker {
    pub fn new(client: HttpFunctionClient) -> Self {
        Self { client }
    }

    async fn call(&self, call: &FunctionCall) -> Result<Value, FunctionError> {
        let function = &call.function;
        let (method, template) = parse_operation(&function.name, &function.operation)?;

        let request = match argument_object(&call.arguments) {
            Ok(mut arguments) => {
                let url = expand_path(&function.name, template, &mut arguments)?;
                let request = self.client.request(method.clone(), &url);
                if sends_query(&method) {
                    let query: Vec<(String, String)> = arguments
                        .iter()
                        .map(|(k, v)| (k.clone(), scalar_text(v)))
                        .collect();
                    request.query(&query)
                } else if arguments.is_empty() {
                    request
                } else {
                    request.json(&Value::Object(arguments))
                }
            }
            Err(body) => self.client.request(method, template).json(&body),
        };

        self.client.send(function, request).await
    }
}

impl FunctionInvoker for HttpFunctionInvoker {
    fn kind(&self) -> FunctionKind {
        FunctionKind::Http
    }

    fn invoke<'a>(&'a self, call: &'a FunctionCall) -> FunctionFuture<'a> {
        Box::pin(self.call(call))
    }
}

fn sends_query(method: &Method) -> bool {
    *method == Method::GET || *method == Method::HEAD || *method == Method::DELETE
}

/// Split `[METHOD ]url`.
fn parse_operation<'a>(function: &str, operation: &'a str) -> Result<(Method, &'a str), FunctionError> {
    let operation = operation.trim();
    let (method, url) = match operation.split_once(char::is_whitespace) {
        Some((method, url)) => {
            let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes()).map_err(|_| {
                FunctionError::InvalidOperation {
                    function: function.to_string(),
                    message: format!("invalid HTTP method '{method}'"),
                }
            })?;
            (method, url.trim())
        }
        None => (Method::GET, operation),
    };
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(FunctionError::InvalidOperation {
            function: function.to_string(),
            message: format!("'{url}' is not an http(s) url"),
        });
    }
    Ok((method, url))
}
