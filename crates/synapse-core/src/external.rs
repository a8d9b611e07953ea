//! External resource port.
//!
//! Schemas and API descriptions referenced by URI are fetched through an
//! `ExternalResourceProvider`. The infrastructure layer implements it for
//! `file://` and `http(s)://` locations.

use std::pin::Pin;

use futures_util::{Stream, StreamExt};

/// Errors raised while reading an external resource.
#[derive(Debug, thiserror::Error)]
pub enum ExternalResourceError {
    #[error("unsupported resource uri '{0}'")]
    UnsupportedScheme(String),

    #[error("resource '{uri}' not found")]
    NotFound { uri: String },

    #[error("failed to read resource '{uri}': {message}")]
    Read { uri: String, message: String },

    #[error("resource '{uri}' exceeds {limit} bytes")]
    TooLarge { uri: String, limit: usize },
}

/// Chunked body of an external resource.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, ExternalResourceError>> + Send + 'static>>;

/// Reads external resources by URI.
pub trait ExternalResourceProvider: Send + Sync {
    /// Whether this provider can read `uri`.
    fn supports(&self, uri: &str) -> bool;

    /// Open `uri` as a stream of byte chunks.
    fn read(
        &self,
        uri: &str,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<ByteStream, ExternalResourceError>> + Send + '_>>;
}

/// Upper bound on documents buffered by [`read_to_end`].
pub const MAX_DOCUMENT_BYTES: usize = 16 * 1024 * 1024;

/// Read a whole resource into memory.
pub async fn read_to_end(
    provider: &dyn ExternalResourceProvider,
    uri: &str,
) -> Result<Vec<u8>, ExternalResourceError> {
    if !provider.supports(uri) {
        return Err(ExternalResourceError::UnsupportedScheme(uri.to_string()));
    }
    let mut stream = provider.read(uri).await?;
    let mut buffer = Vec::new();
    while let Some(chunk) = stream.next().await {
        buffer.extend_from_slice(&chunk?);
        if buffer.len() > MAX_DOCUMENT_BYTES {
            return Err(ExternalResourceError::TooLarge {
                uri: uri.to_string(),
                limit: MAX_DOCUMENT_BYTES,
            });
        }
    }
    Ok(buffer)
}

/// Read a JSON or YAML document.
pub async fn read_document(
    provider: &dyn ExternalResourceProvider,
    uri: &str,
) -> Result<serde_json::Value, ExternalResourceError> {
    let bytes = read_to_end(provider, uri).await?;
    if let Ok(value) = serde_json::from_slice(&bytes) {
        return Ok(value);
    }
    serde_yaml_ng::from_slice(&bytes).map_err(|e| ExternalResourceError::Read {
        uri: uri.to_string(),
        message: format!("not a JSON or YAML document: {e}"),
    })
}
