//! HTTP-family function invokers.
//!
//! `HttpFunctionInvoker`, `OpenApiFunctionInvoker`, `ODataFunctionInvoker`,
//! `GrpcFunctionInvoker` and `AsyncApiFunctionInvoker` implement core's
//! `FunctionInvoker` port. They share one `HttpFunctionClient` that owns the
//! `reqwest::Client`, applies the function's `auth` block and turns responses
//! into JSON values.

pub mod asyncapi;
pub mod grpc;
pub mod http;
pub mod oauth2;
pub mod odata;
pub mod openapi;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::{Map, Value};
use synapse_core::external::{read_document, ExternalResourceProvider};
use synapse_core::runtime::{FunctionError, FunctionInvokerRegistry};
use synapse_types::config::HttpConfig;
use synapse_types::workflow::{AuthDefinition, FunctionDefinition};

pub use self::asyncapi::AsyncApiFunctionInvoker;
pub use self::grpc::GrpcFunctionInvoker;
pub use self::http::HttpFunctionInvoker;
pub use self::oauth2::{ClientCredentials, OAuth2TokenManager};
pub use self::odata::ODataFunctionInvoker;
pub use self::openapi::OpenApiFunctionInvoker;

// ---------------------------------------------------------------------------
// Shared client
// ---------------------------------------------------------------------------

/// Sends function calls over HTTP with the function's credentials.
#[derive(Clone)]
pub struct HttpFunctionClient {
    http: reqwest::Client,
    tokens: Arc<OAuth2TokenManager>,
}

impl HttpFunctionClient {
    /// Build a client with the configured timeout and user agent.
    pub fn new(config: &HttpConfig) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.as_str())
            .build()?;
        Ok(Self::with_client(http))
    }

    pub fn with_client(http: reqwest::Client) -> Self {
        let tokens = Arc::new(OAuth2TokenManager::new(http.clone()));
        Self { http, tokens }
    }

    /// The underlying client, shared with the HTTP resource provider.
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn tokens(&self) -> &Arc<OAuth2TokenManager> {
        &self.tokens
    }

    pub fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        self.http.request(method, url)
    }

    /// Attach the credentials declared by `function`.
    pub async fn authorize(
        &self,
        function: &FunctionDefinition,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::RequestBuilder, FunctionError> {
        let Some(auth) = &function.auth else {
            return Ok(request);
        };
        Ok(match auth {
            AuthDefinition::Basic { username, password } => {
                request.basic_auth(username, Some(password))
            }
            AuthDefinition::Bearer { token } => request.bearer_auth(token),
            AuthDefinition::OAuth2 {
                authority,
                client_id,
                client_secret,
                scopes,
            } => {
                let credentials = ClientCredentials {
                    authority,
                    client_id,
                    client_secret,
                    scopes,
                };
                let token = self.tokens.token(&function.name, &credentials).await?;
                request.bearer_auth(oauth2::bearer(&token))
            }
        })
    }

    /// Authorize, send and decode.
    ///
    /// Non-2xx responses become `Communication` errors carrying the status.
    /// A 401 also drops the cached OAuth2 token so the retry fetches a new one.
    pub async fn send(
        &self,
        function: &FunctionDefinition,
        request: reqwest::RequestBuilder,
    ) -> Result<Value, FunctionError> {
        let request = self.authorize(function, request).await?;
        let response = request.send().await.map_err(|e| FunctionError::Communication {
            function: function.name.clone(),
            status: e.status().map(|s| s.as_u16()),
            message: e.to_string(),
        })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| FunctionError::Communication {
            function: function.name.clone(),
            status: Some(status.as_u16()),
            message: format!("failed to read response body: {e}"),
        })?;

        if !status.is_success() {
            if status == reqwest::StatusCode::UNAUTHORIZED
                && let Some(AuthDefinition::OAuth2 {
                    authority,
                    client_id,
                    ..
                }) = &function.auth
            {
                self.tokens.invalidate(client_id, authority);
            }
            tracing::debug!(
                function = function.name.as_str(),
                status = status.as_u16(),
                "function call returned an error status"
            );
            return Err(FunctionError::Communication {
                function: function.name.clone(),
                status: Some(status.as_u16()),
                message: truncate(&body, 512),
            });
        }

        Ok(decode_body(&body))
    }
}

impl std::fmt::Debug for HttpFunctionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpFunctionClient")
            .field("tokens", &self.tokens)
            .finish()
    }
}

/// Register every HTTP-family invoker on `registry`.
pub fn register_http_invokers(
    registry: &mut FunctionInvokerRegistry,
    client: HttpFunctionClient,
    resources: Arc<dyn ExternalResourceProvider>,
) {
    registry.register(Arc::new(HttpFunctionInvoker::new(client.clone())));
    registry.register(Arc::new(OpenApiFunctionInvoker::new(client.clone(), Arc::clone(&resources))));
    registry.register(Arc::new(AsyncApiFunctionInvoker::new(client.clone(), resources)));
    registry.register(Arc::new(GrpcFunctionInvoker::new(client.clone())));
    registry.register(Arc::new(ODataFunctionInvoker::new(client)));
}

// ---------------------------------------------------------------------------
// API documents
// ---------------------------------------------------------------------------

/// API descriptions fetched once through the external resource provider.
pub(crate) struct DocumentCache {
    resources: Arc<dyn ExternalResourceProvider>,
    documents: DashMap<String, Arc<Value>>,
    label: &'static str,
}

impl DocumentCache {
    pub(crate) fn new(resources: Arc<dyn ExternalResourceProvider>, label: &'static str) -> Self {
        Self {
            resources,
            documents: DashMap::new(),
            label,
        }
    }

    pub(crate) async fn get(&self, function: &str, uri: &str) -> Result<Arc<Value>, FunctionError> {
        if let Some(doc) = self.documents.get(uri) {
            return Ok(doc.clone());
        }
        let doc = read_document(self.resources.as_ref(), uri)
            .await
            .map_err(|e| FunctionError::Communication {
                function: function.to_string(),
                status: None,
                message: format!("failed to load {} document: {e}", self.label),
            })?;
        tracing::debug!(function, document = uri, kind = self.label, "loaded API document");
        let doc = Arc::new(doc);
        self.documents.insert(uri.to_string(), doc.clone());
        Ok(doc)
    }

    pub(crate) fn len(&self) -> usize {
        self.documents.len()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// JSON when the body parses as JSON, a string otherwise, `null` when empty.
pub(crate) fn decode_body(body: &str) -> Value {
    if body.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(body).unwrap_or_else(|_| Value::String(body.to_string()))
}

fn truncate(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

/// Render a scalar argument for a URL, header or query string.
pub(crate) fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Replace `{name}` placeholders in `template` with arguments, removing the
/// consumed entries from `arguments`.
pub(crate) fn expand_path(
    function: &str,
    template: &str,
    arguments: &mut Map<String, Value>,
) -> Result<String, FunctionError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        let Some(len) = rest[start..].find('}') else {
            break;
        };
        let name = &rest[start + 1..start + len];
        let value = arguments.remove(name).ok_or_else(|| FunctionError::InvalidOperation {
            function: function.to_string(),
            message: format!("missing argument for path parameter '{name}'"),
        })?;
        out.push_str(&rest[..start]);
        out.push_str(&encode_path_segment(&scalar_text(&value)));
        rest = &rest[start + len + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

fn encode_path_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

/// Substitute `{name}` server variables with their declared defaults.
pub(crate) fn apply_server_variables(url: &str, server: &Value) -> String {
    let mut url = url.to_string();
    if let Some(variables) = server.get("variables").and_then(Value::as_object) {
        for (name, variable) in variables {
            if let Some(default) = variable.get("default") {
                url = url.replace(&format!("{{{name}}}"), &scalar_text(default));
            }
        }
    }
    url
}

/// `scheme://authority` of an http(s) URI.
pub(crate) fn origin(uri: &str) -> Option<String> {
    let (scheme, rest) = uri.split_once("://")?;
    if scheme != "http" && scheme != "https" {
        return None;
    }
    let authority = rest.split('/').next()?;
    Some(format!("{scheme}://{authority}"))
}

/// Arguments as an owned object. Non-object arguments are returned in `Err`
/// so callers can send them as a raw body.
pub(crate) fn argument_object(arguments: &Value) -> Result<Map<String, Value>, Value> {
    match arguments {
        Value::Object(map) => Ok(map.clone()),
        Value::Null => Ok(Map::new()),
        other => Err(other.clone()),
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{client, function, header};
    use super::*;
    use serde_json::json;
    use synapse_types::workflow::FunctionKind;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_decode_body() {
        assert_eq!(decode_body(""), Value::Null);
        assert_eq!(decode_body(r#"{"a":1}"#), json!({"a": 1}));
        assert_eq!(decode_body("plain"), json!("plain"));
    }

    #[test]
    fn test_expand_path_consumes_arguments() {
        let mut args = json!({"id": "a b", "version": 2, "extra": true})
            .as_object()
            .cloned()
            .unwrap();
        let path = expand_path("f", "/orders/{id}/v{version}", &mut args).unwrap();
        assert_eq!(path, "/orders/a%20b/v2");
        assert_eq!(args.len(), 1);
        assert!(args.contains_key("extra"));

        let err = expand_path("f", "/orders/{missing}", &mut Map::new()).unwrap_err();
        assert!(matches!(err, FunctionError::InvalidOperation { .. }));
    }

    #[tokio::test]
    async fn test_basic_and_bearer_auth_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&server)
            .await;
        let client = client();

        let basic = function(
            FunctionKind::Http,
            "",
            Some(AuthDefinition::Basic {
                username: "user".to_string(),
                password: "pass".to_string(),
            }),
        );
        client
            .send(&basic, client.request(reqwest::Method::GET, &format!("{}/a", server.uri())))
            .await
            .unwrap();

        let bearer = function(
            FunctionKind::Http,
            "",
            Some(AuthDefinition::Bearer {
                token: "tok".to_string(),
            }),
        );
        client
            .send(&bearer, client.request(reqwest::Method::GET, &format!("{}/b", server.uri())))
            .await
            .unwrap();

        let requests = server.received_requests().await.unwrap();
        assert_eq!(header(&requests[0], "authorization").as_deref(), Some("Basic dXNlcjpwYXNz"));
        assert_eq!(header(&requests[1], "authorization").as_deref(), Some("Bearer tok"));
    }

    #[tokio::test]
    async fn test_error_status_is_communication_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503).set_body_string("down"))
            .mount(&server)
            .await;
        let client = client();

        let err = client
            .send(
                &function(FunctionKind::Http, "", None),
                client.request(reqwest::Method::GET, &server.uri()),
            )
            .await
            .unwrap_err();
        match &err {
            FunctionError::Communication { status, message, .. } => {
                assert_eq!(*status, Some(503));
                assert_eq!(message, "down");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_unauthorized_drops_cached_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"access_token": "t1", "expires_in": 3600})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api"))
            .respond_with(ResponseTemplate::new(401).set_body_string("expired"))
            .mount(&server)
            .await;
        let client = client();
        let f = function(
            FunctionKind::Http,
            "",
            Some(AuthDefinition::OAuth2 {
                authority: format!("{}/token", server.uri()),
                client_id: "synapse".to_string(),
                client_secret: "s3cret".to_string(),
                scopes: vec![],
            }),
        );

        let err = client
            .send(&f, client.request(reqwest::Method::GET, &format!("{}/api", server.uri())))
            .await
            .unwrap_err();
        assert!(matches!(err, FunctionError::Communication { status: Some(401), .. }));

        let requests = server.received_requests().await.unwrap();
        assert_eq!(header(&requests[1], "authorization").as_deref(), Some("Bearer t1"));
        assert_eq!(client.tokens().cached(), 0);
    }
}
