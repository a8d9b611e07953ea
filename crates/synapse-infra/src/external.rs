//! External resource providers for `file://` and `http(s)://` URIs.
//!
//! Both stream the resource in chunks. `CompositeResourceProvider` routes a
//! URI to the first provider that supports it and is what the runner wires
//! into schema validation and OpenAPI document loading.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::StreamExt;
use synapse_core::external::{ByteStream, ExternalResourceError, ExternalResourceProvider};
use tokio::io::AsyncReadExt;

const CHUNK_SIZE: usize = 64 * 1024;

type ReadFuture<'a> = Pin<Box<dyn Future<Output = Result<ByteStream, ExternalResourceError>> + Send + 'a>>;

// ---------------------------------------------------------------------------
// File
// ---------------------------------------------------------------------------

/// Reads `file://` URIs from the local filesystem.
#[derive(Debug, Default, Clone)]
pub struct FileResourceProvider;

impl FileResourceProvider {
    pub fn new() -> Self {
        Self
    }

    fn path_of(uri: &str) -> Option<PathBuf> {
        uri.strip_prefix("file://").map(PathBuf::from)
    }
}

impl ExternalResourceProvider for FileResourceProvider {
    fn supports(&self, uri: &str) -> bool {
        uri.starts_with("file://")
    }

    fn read(&self, uri: &str) -> ReadFuture<'_> {
        let uri = uri.to_string();
        Box::pin(async move {
            let path = Self::path_of(&uri).ok_or_else(|| ExternalResourceError::UnsupportedScheme(uri.clone()))?;
            let mut file = tokio::fs::File::open(&path).await.map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    ExternalResourceError::NotFound { uri: uri.clone() }
                } else {
                    ExternalResourceError::Read {
                        uri: uri.clone(),
                        message: e.to_string(),
                    }
                }
            })?;

            let stream = async_stream::stream! {
                let mut buffer = vec![0u8; CHUNK_SIZE];
                loop {
                    match file.read(&mut buffer).await {
                        Ok(0) => break,
                        Ok(n) => yield Ok(buffer[..n].to_vec()),
                        Err(e) => {
                            yield Err(ExternalResourceError::Read { uri: uri.clone(), message: e.to_string() });
                            break;
                        }
                    }
                }
            };
            Ok(Box::pin(stream) as ByteStream)
        })
    }
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

/// Reads `http://` and `https://` URIs with a GET request.
#[derive(Debug, Clone)]
pub struct HttpResourceProvider {
    http: reqwest::Client,
}

impl HttpResourceProvider {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

impl ExternalResourceProvider for HttpResourceProvider {
    fn supports(&self, uri: &str) -> bool {
        uri.starts_with("http://") || uri.starts_with("https://")
    }

    fn read(&self, uri: &str) -> ReadFuture<'_> {
        let uri = uri.to_string();
        Box::pin(async move {
            let response = self.http.get(&uri).send().await.map_err(|e| ExternalResourceError::Read {
                uri: uri.clone(),
                message: e.to_string(),
            })?;

            let status = response.status();
            if status == reqwest::StatusCode::NOT_FOUND {
                return Err(ExternalResourceError::NotFound { uri });
            }
            if !status.is_success() {
                return Err(ExternalResourceError::Read {
                    uri,
                    message: format!("server returned {status}"),
                });
            }

            let stream = response.bytes_stream().map(move |chunk| {
                chunk.map(|bytes| bytes.to_vec()).map_err(|e| ExternalResourceError::Read {
                    uri: uri.clone(),
                    message: e.to_string(),
                })
            });
            Ok(Box::pin(stream) as ByteStream)
        })
    }
}

// ---------------------------------------------------------------------------
// Composite
// ---------------------------------------------------------------------------

/// Dispatches to the first registered provider supporting a URI.
#[derive(Clone, Default)]
pub struct CompositeResourceProvider {
    providers: Vec<Arc<dyn ExternalResourceProvider>>,
}

impl CompositeResourceProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// File and HTTP providers.
    pub fn with_defaults(http: reqwest::Client) -> Self {
        Self::new()
            .with(Arc::new(FileResourceProvider::new()))
            .with(Arc::new(HttpResourceProvider::new(http)))
    }

    pub fn with(mut self, provider: Arc<dyn ExternalResourceProvider>) -> Self {
        self.providers.push(provider);
        self
    }
}

impl ExternalResourceProvider for CompositeResourceProvider {
    fn supports(&self, uri: &str) -> bool {
        self.providers.iter().any(|p| p.supports(uri))
    }

    fn read(&self, uri: &str) -> ReadFuture<'_> {
        match self.providers.iter().find(|p| p.supports(uri)) {
            Some(provider) => provider.read(uri),
            None => {
                let uri = uri.to_string();
                Box::pin(async move { Err(ExternalResourceError::UnsupportedScheme(uri)) })
            }
        }
    }
}

impl std::fmt::Debug for CompositeResourceProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeResourceProvider")
            .field("providers", &self.providers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use synapse_core::external::{read_document, read_to_end};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_file_provider_streams_large_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("big.txt");
        let content = "x".repeat(CHUNK_SIZE * 2 + 10);
        std::fs::write(&file, &content).unwrap();
        let uri = format!("file://{}", file.display());

        let provider = FileResourceProvider::new();
        let mut stream = provider.read(&uri).await.unwrap();
        let mut chunks = 0;
        let mut total = 0;
        while let Some(chunk) = stream.next().await {
            total += chunk.unwrap().len();
            chunks += 1;
        }
        assert_eq!(total, content.len());
        assert!(chunks >= 3);
    }

    #[tokio::test]
    async fn test_file_provider_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let uri = format!("file://{}", dir.path().join("nope.json").display());
        let err = read_to_end(&FileResourceProvider::new(), &uri).await.unwrap_err();
        assert!(matches!(err, ExternalResourceError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_http_provider_reads_yaml_document() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/schemas/order.yaml"))
            .respond_with(ResponseTemplate::new(200).set_body_string("type: object\nrequired: [id]\n"))
            .mount(&server)
            .await;

        let provider = HttpResourceProvider::new(reqwest::Client::new());
        let doc = read_document(&provider, &format!("{}/schemas/order.yaml", server.uri()))
            .await
            .unwrap();
        assert_eq!(doc["required"][0], "id");

        let err = read_to_end(&provider, &format!("{}/missing", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, ExternalResourceError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_composite_routes_by_scheme() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.json");
        std::fs::write(&file, r#"{"ok": true}"#).unwrap();

        let provider = CompositeResourceProvider::with_defaults(reqwest::Client::new());
        assert!(provider.supports("https://example.com/a.json"));
        assert!(!provider.supports("ftp://example.com/a.json"));

        let doc = read_document(&provider, &format!("file://{}", file.display()))
            .await
            .unwrap();
        assert_eq!(doc["ok"], true);

        let err = provider.read("ftp://example.com/a.json").await.err().unwrap();
        assert!(matches!(err, ExternalResourceError::UnsupportedScheme(_)));
    }
}
