//! AsyncAPI functions.
//!
//! The operation is `document-uri#operationId`. The document (AsyncAPI 2 or
//! 3, JSON or YAML) is fetched once and cached. Only sending operations can
//! be invoked: `publish` in AsyncAPI 2, `action: send` in AsyncAPI 3. The
//! message goes to the channel address over the document's first HTTP
//! server as a JSON POST; `{param}` placeholders in the address are filled
//! from the arguments. A `payload` argument is sent as the message, and a
//! `headers` object as request headers; without `payload` the remaining
//! arguments form the message.

use std::sync::Arc;

use reqwest::Method;
use serde_json::Value;
use synapse_core::external::ExternalResourceProvider;
use synapse_core::runtime::function::FunctionFuture;
use synapse_core::runtime::{FunctionCall, FunctionError, FunctionInvoker};
use synapse_types::workflow::FunctionKind;

use super::{apply_server_variables, argument_object, expand_path, scalar_text, DocumentCache, HttpFunctionClient};

pub struct AsyncApiFunctionInvoker {
    client: HttpFunctionClient,
    documents: DocumentCache,
}

/// A sending operation located in a document.
#[derive(Debug, Clone, PartialEq)]
struct ChannelOperation {
    address: String,
}

impl AsyncApiFunctionInvoker {
    pub fn new(client: HttpFunctionClient, resources: Arc<dyn ExternalResourceProvider>) -> Self {
        Self {
            client,
            documents: DocumentCache::new(resources, "AsyncAPI"),
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
        let operation = find_operation(&document, operation_id).map_err(invalid)?;
        let server = http_server(&document).ok_or_else(|| invalid(format!("{uri} declares no http server")))?;

        let mut arguments = argument_object(&call.arguments)
            .map_err(|_| invalid("arguments must be an object".to_string()))?;
        let address = expand_path(&function.name, &operation.address, &mut arguments)?;
        let headers = arguments.remove("headers");
        let payload = match arguments.remove("payload") {
            Some(payload) => payload,
            None => Value::Object(arguments),
        };

        let url = format!("{}/{}", server.trim_end_matches('/'), address.trim_start_matches('/'));
        let mut request = self.client.request(Method::POST, &url).json(&payload);
        if let Some(Value::Object(headers)) = &headers {
            for (name, value) in headers {
                request = request.header(name.as_str(), scalar_text(value));
            }
        }
        tracing::debug!(
            function = function.name.as_str(),
            operation = operation_id,
            channel = address.as_str(),
            "publishing AsyncAPI message"
        );

        self.client.send(function, request).await
    }
}

impl FunctionInvoker for AsyncApiFunctionInvoker {
    fn kind(&self) -> FunctionKind {
        FunctionKind::AsyncApi
    }

    fn invoke<'a>(&'a self, call: &'a FunctionCall) -> FunctionFuture<'a> {
        Box::pin(self.call(call))
    }
}

impl std::fmt::Debug for AsyncApiFunctionInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncApiFunctionInvoker")
            .field("documents", &self.documents.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Document navigation
// ---------------------------------------------------------------------------

fn find_operation(document: &Value, operation_id: &str) -> Result<ChannelOperation, String> {
    let not_found = || format!("operation '{operation_id}' not found");
    let receiving = || format!("operation '{operation_id}' receives messages and cannot be invoked");

    // AsyncAPI 3: operations keyed by id, referencing their channel.
    if let Some(operation) = document.pointer("/operations").and_then(|ops| ops.get(operation_id)) {
        if operation.get("action").and_then(Value::as_str) != Some("send") {
            return Err(receiving());
        }
        let channel = operation
            .pointer("/channel/$ref")
            .and_then(Value::as_str)
            .and_then(|r| r.strip_prefix('#'))
            .and_then(|pointer| document.pointer(pointer))
            .ok_or_else(not_found)?;
        let address = channel.get("address").and_then(Value::as_str).ok_or_else(not_found)?;
        return Ok(ChannelOperation {
            address: address.to_string(),
        });
    }

    // AsyncAPI 2: operations nested under channels.
    let channels = document.get("channels").and_then(Value::as_object).ok_or_else(not_found)?;
    for (address, channel) in channels {
        if channel.pointer("/publish/operationId").and_then(Value::as_str) == Some(operation_id) {
            return Ok(ChannelOperation {
                address: address.clone(),
            });
        }
        if channel.pointer("/subscribe/operationId").and_then(Value::as_str) == Some(operation_id) {
            return Err(receiving());
        }
    }
    Err(not_found())
}

/// Base URL of the first server speaking http(s).
fn http_server(document: &Value) -> Option<String> {
    let servers = document.get("servers")?.as_object()?;
    servers.values().find_map(|server| {
        let protocol = server.get("protocol").and_then(Value::as_str).unwrap_or("");
        if protocol != "http" && protocol != "https" {
            return None;
        }
        let url = match server.get("url").and_then(Value::as_str) {
            Some(url) => url.to_string(),
            None => {
                let host = server.get("host")?.as_str()?;
                let pathname = server.get("pathname").and_then(Value::as_str).unwrap_or("");
                format!("{host}{pathname}")
            }
        };
        let url = apply_server_variables(&url, server);
        Some(if url.contains("://") {
            url
        } else {
            format!("{protocol}://{url}")
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::FileResourceProvider;
    use crate::function::testing::{client, function, header};
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn orders_v2(server: &str) -> Value {
        json!({
            "asyncapi": "2.6.0",
            "servers": {
                "broker": {"url": "kafka.example.com:9092", "protocol": "kafka"},
                "gateway": {"url": "{root}/events", "protocol": "http", "variables": {"root": {"default": server}}}
            },
            "channels": {
                "orders/{region}/placed": {"publish": {"operationId": "placeOrder"}},
                "orders/shipped": {"subscribe": {"operationId": "onShipped"}}
            }
        })
    }

    fn orders_v3(server: &str) -> Value {
        let host = server.trim_start_matches("http://");
        json!({
            "asyncapi": "3.0.0",
            "servers": {"gateway": {"host": host, "pathname": "/events", "protocol": "http"}},
            "channels": {"placed": {"address": "orders/{region}/placed"}},
            "operations": {
                "placeOrder": {"action": "send", "channel": {"$ref": "#/channels/placed"}},
                "onPlaced": {"action": "receive", "channel": {"$ref": "#/channels/placed"}}
            }
        })
    }

    fn write_document(dir: &tempfile::TempDir, doc: &Value) -> String {
        let file = dir.path().join("orders.json");
        std::fs::write(&file, serde_json::to_string(doc).unwrap()).unwrap();
        format!("file://{}", file.display())
    }

    #[test]
    fn test_find_operation_in_both_versions() {
        let v2 = orders_v2("http://localhost");
        assert_eq!(find_operation(&v2, "placeOrder").unwrap().address, "orders/{region}/placed");
        assert!(find_operation(&v2, "onShipped").unwrap_err().contains("receives"));
        assert!(find_operation(&v2, "missing").unwrap_err().contains("not found"));

        let v3 = orders_v3("http://localhost");
        assert_eq!(find_operation(&v3, "placeOrder").unwrap().address, "orders/{region}/placed");
        assert!(find_operation(&v3, "onPlaced").unwrap_err().contains("receives"));
    }

    #[test]
    fn test_http_server_skips_other_protocols() {
        assert_eq!(
            http_server(&orders_v2("http://localhost:9000")).as_deref(),
            Some("http://localhost:9000/events")
        );
        assert_eq!(
            http_server(&orders_v3("http://localhost:9000")).as_deref(),
            Some("http://localhost:9000/events")
        );
        let kafka_only = json!({"servers": {"broker": {"url": "kafka:9092", "protocol": "kafka"}}});
        assert!(http_server(&kafka_only).is_none());
    }

    #[tokio::test]
    async fn test_publish_sends_payload_to_channel() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/events/orders/eu/placed"))
            .and(body_json(json!({"id": "o-1", "total": 12})))
            .respond_with(ResponseTemplate::new(202))
            .expect(2)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let uri = write_document(&dir, &orders_v2(&server.uri()));
        let invoker = AsyncApiFunctionInvoker::new(client(), Arc::new(FileResourceProvider::new()));

        let explicit = FunctionCall {
            function: function(FunctionKind::AsyncApi, &format!("{uri}#placeOrder"), None),
            arguments: json!({
                "region": "eu",
                "headers": {"ce-type": "com.example.order.placed"},
                "payload": {"id": "o-1", "total": 12}
            }),
        };
        assert_eq!(invoker.invoke(&explicit).await.unwrap(), Value::Null);

        let implicit = FunctionCall {
            function: function(FunctionKind::AsyncApi, &format!("{uri}#placeOrder"), None),
            arguments: json!({"region": "eu", "id": "o-1", "total": 12}),
        };
        invoker.invoke(&implicit).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        assert_eq!(header(&requests[0], "ce-type").as_deref(), Some("com.example.order.placed"));
    }

    #[tokio::test]
    async fn test_receiving_operation_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let uri = write_document(&dir, &orders_v3("http://127.0.0.1:9"));
        let invoker = AsyncApiFunctionInvoker::new(client(), Arc::new(FileResourceProvider::new()));
        let call = FunctionCall {
            function: function(FunctionKind::AsyncApi, &format!("{uri}#onPlaced"), None),
            arguments: json!({"region": "eu"}),
        };
        let err = invoker.invoke(&call).await.unwrap_err();
        assert!(matches!(err, FunctionError::InvalidOperation { .. }));
        assert!(!err.is_transient());
    }
}
