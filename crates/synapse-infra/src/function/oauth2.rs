//! OAuth2 client-credentials token cache.
//!
//! Tokens are cached per `(client_id, authority)` and reused until shortly
//! before they expire. The manager is owned by the HTTP-family invokers and
//! injected into them, so two runners in one process never share tokens
//! unless they share the manager.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use synapse_core::runtime::FunctionError;

/// Tokens are refreshed this long before their advertised expiry.
const EXPIRY_SKEW_SECS: i64 = 30;

/// Lifetime assumed when the token endpoint omits `expires_in`.
const DEFAULT_LIFETIME_SECS: u64 = 300;

#[derive(Clone)]
struct CachedToken {
    access_token: SecretString,
    expires_at: DateTime<Utc>,
}

impl CachedToken {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now + chrono::Duration::seconds(EXPIRY_SKEW_SECS) < self.expires_at
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Client credentials for one token request.
pub struct ClientCredentials<'a> {
    pub authority: &'a str,
    pub client_id: &'a str,
    pub client_secret: &'a str,
    pub scopes: &'a [String],
}

/// Fetches and caches OAuth2 access tokens.
pub struct OAuth2TokenManager {
    http: reqwest::Client,
    tokens: DashMap<(String, String), CachedToken>,
}

impl OAuth2TokenManager {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            tokens: DashMap::new(),
        }
    }

    /// Number of cached tokens, fresh or not.
    pub fn cached(&self) -> usize {
        self.tokens.len()
    }

    /// Drop the cached token for a client, forcing the next call to fetch.
    pub fn invalidate(&self, client_id: &str, authority: &str) {
        self.tokens
            .remove(&(client_id.to_string(), authority.to_string()));
    }

    /// A valid access token for `credentials`, fetched if none is cached.
    ///
    /// `function` names the calling function in errors.
    pub async fn token(
        &self,
        function: &str,
        credentials: &ClientCredentials<'_>,
    ) -> Result<SecretString, FunctionError> {
        let key = (
            credentials.client_id.to_string(),
            credentials.authority.to_string(),
        );
        let now = Utc::now();
        if let Some(cached) = self.tokens.get(&key)
            && cached.is_fresh(now)
        {
            return Ok(cached.access_token.clone());
        }

        let fetched = self.fetch(function, credentials).await?;
        let token = fetched.access_token.clone();
        self.tokens.insert(key, fetched);
        Ok(token)
    }

    async fn fetch(
        &self,
        function: &str,
        credentials: &ClientCredentials<'_>,
    ) -> Result<CachedToken, FunctionError> {
        let auth_error = |message: String| FunctionError::Authentication {
            function: function.to_string(),
            message,
        };

        let mut form = vec![
            ("grant_type", "client_credentials".to_string()),
            ("client_id", credentials.client_id.to_string()),
            ("client_secret", credentials.client_secret.to_string()),
        ];
        if !credentials.scopes.is_empty() {
            form.push(("scope", credentials.scopes.join(" ")));
        }

        let response = self
            .http
            .post(credentials.authority)
            .form(&form)
            .send()
            .await
            .map_err(|e| auth_error(format!("token request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(auth_error(format!("token endpoint returned {status}")));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| auth_error(format!("invalid token response: {e}")))?;

        let lifetime = body.expires_in.unwrap_or(DEFAULT_LIFETIME_SECS);
        tracing::debug!(
            client_id = credentials.client_id,
            authority = credentials.authority,
            expires_in = lifetime,
            "fetched oauth2 token"
        );

        Ok(CachedToken {
            access_token: SecretString::from(body.access_token),
            expires_at: Utc::now() + chrono::Duration::seconds(lifetime as i64),
        })
    }
}

impl std::fmt::Debug for OAuth2TokenManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuth2TokenManager")
            .field("cached", &self.tokens.len())
            .finish()
    }
}

/// Header value for a cached token.
pub(crate) fn bearer(token: &SecretString) -> String {
    token.expose_secret().to_string()
}
