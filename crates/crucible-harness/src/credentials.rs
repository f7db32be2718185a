//! OAuth 2.0 client-credentials provider.
//!
//! Used in the identity variant: the engine only accepts bearer tokens
//! issued by Keycloak. Tokens are fetched on first use and cached until
//! shortly before they expire. Failed acquisitions are not retried.

use crate::client::ClientError;
use crate::descriptor::IDENTITY_REALM;
use crate::runtime::ServiceAddress;
use common::secret::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, trace, warn};

/// Default HTTP timeout of token requests.
pub const DEFAULT_TOKEN_TIMEOUT: Duration = Duration::from_secs(10);

/// A cached token is renewed this many seconds before it expires.
const EXPIRY_MARGIN_SECS: i64 = 30;

/// Client credentials and the token endpoint they are exchanged at.
#[derive(Clone)]
pub struct CredentialsConfig {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: SecretString,
    pub audience: String,
    pub http_timeout: Duration,
}

impl fmt::Debug for CredentialsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialsConfig")
            .field("token_url", &self.token_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("audience", &self.audience)
            .field("http_timeout", &self.http_timeout)
            .finish()
    }
}

impl CredentialsConfig {
    #[must_use]
    pub fn new(
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: SecretString,
        audience: impl Into<String>,
    ) -> Self {
        Self {
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret,
            audience: audience.into(),
            http_timeout: DEFAULT_TOKEN_TIMEOUT,
        }
    }

    /// Credentials exchanged at the token endpoint of a Keycloak instance.
    #[must_use]
    pub fn for_keycloak(
        keycloak: &ServiceAddress,
        client_id: impl Into<String>,
        client_secret: SecretString,
        audience: impl Into<String>,
    ) -> Self {
        Self::new(
            token_endpoint(keycloak),
            client_id,
            client_secret,
            audience,
        )
    }

    #[must_use]
    pub fn with_http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = timeout;
        self
    }
}

/// Token endpoint of the engine realm on `keycloak`.
pub fn token_endpoint(keycloak: &ServiceAddress) -> String {
    format!(
        "{}/auth/realms/{IDENTITY_REALM}/protocol/openid-connect/token",
        keycloak.http_url()
    )
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

impl fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenResponse")
            .field("access_token", &"[REDACTED]")
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

struct CachedToken {
    token: SecretString,
    /// Unix timestamp.
    expires_at: i64,
}

/// Bearer tokens for one client, cached until shortly before expiry.
pub struct CredentialsProvider {
    config: CredentialsConfig,
    http: reqwest::Client,
    cached: Mutex<Option<CachedToken>>,
}

impl fmt::Debug for CredentialsProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialsProvider")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CredentialsProvider {
    /// # Errors
    ///
    /// `ClientError::Configuration` if the HTTP client cannot be built.
    pub fn new(config: CredentialsConfig) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()
            .map_err(|e| ClientError::Configuration(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            config,
            http,
            cached: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &CredentialsConfig {
        &self.config
    }

    /// Current token, acquiring a new one if none is cached or it is about to expire.
    ///
    /// # Errors
    ///
    /// - `AuthenticationRejected` if the endpoint rejects the credentials (400, 401)
    /// - `Http` on transport failures and other statuses
    /// - `InvalidResponse` if the token response cannot be parsed
    pub async fn token(&self) -> Result<SecretString, ClientError> {
        let mut cached = self.cached.lock().await;
        let now = chrono::Utc::now().timestamp();

        if let Some(entry) = cached.as_ref() {
            if entry.expires_at - now > EXPIRY_MARGIN_SECS {
                return Ok(entry.token.clone());
            }
            trace!(
                target: "crucible.credentials",
                client_id = %self.config.client_id,
                "Cached token expiring"
            );
        }

        let (token, expires_at) = self.acquire_token().await?;
        *cached = Some(CachedToken {
            token: token.clone(),
            expires_at,
        });
        Ok(token)
    }

    #[instrument(skip_all, name = "crucible.credentials.acquire")]
    async fn acquire_token(&self) -> Result<(SecretString, i64), ClientError> {
        debug!(
            target: "crucible.credentials",
            client_id = %self.config.client_id,
            url = %self.config.token_url,
            "Requesting token"
        );

        let form_body = [
            ("grant_type", "client_credentials"),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.expose_secret()),
            ("audience", self.config.audience.as_str()),
        ];

        let response = self
            .http
            .post(&self.config.token_url)
            .form(&form_body)
            .send()
            .await
            .map_err(|e| {
                debug!(target: "crucible.credentials", error = %e, "HTTP request failed");
                ClientError::Http(e.to_string())
            })?;

        let status = response.status();

        if status.is_success() {
            let token_response: TokenResponse = response.json().await.map_err(|e| {
                warn!(target: "crucible.credentials", error = %e, "Failed to parse token response");
                ClientError::InvalidResponse(e.to_string())
            })?;

            #[allow(clippy::cast_possible_wrap)]
            let expires_at = chrono::Utc::now().timestamp() + token_response.expires_in as i64;

            info!(
                target: "crucible.credentials",
                client_id = %self.config.client_id,
                expires_in_secs = token_response.expires_in,
                "Token acquired"
            );
            Ok((SecretString::from(token_response.access_token), expires_at))
        } else if status.as_u16() == 401 || status.as_u16() == 400 {
            warn!(
                target: "crucible.credentials",
                client_id = %self.config.client_id,
                status = %status,
                "Client credentials rejected"
            );
            Err(ClientError::AuthenticationRejected(format!("Status {status}")))
        } else {
            warn!(
                target: "crucible.credentials",
                status = %status,
                "Unexpected response from token endpoint"
            );
            Err(ClientError::Http(format!("Unexpected status: {status}")))
        }
    }
}
