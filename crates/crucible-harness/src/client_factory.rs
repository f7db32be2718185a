//! Client factory.
//!
//! Builds [`EngineClient`]s bound to an engine address, an optional
//! isolation key (the default tenant) and, in the identity variant, a
//! credentials provider. All clients of one factory share its HTTP
//! connection pool.

use crate::client::{ClientError, EngineClient};
use crate::credentials::CredentialsProvider;
use crate::isolation::IsolationKey;
use crate::runtime::ServiceAddress;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Default request timeout of engine clients.
pub const DEFAULT_CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection timeout of engine clients.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ClientFactory {
    http: reqwest::Client,
}

impl ClientFactory {
    /// # Errors
    ///
    /// `ClientError::Configuration` if the HTTP client cannot be built.
    pub fn new(timeout: Duration) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| ClientError::Configuration(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self { http })
    }

    /// Client for the engine at `address`.
    ///
    /// The isolation key becomes the tenant of every deployment and process
    /// instance the client creates. No request is issued here.
    ///
    /// # Errors
    ///
    /// Reserved for client construction failures; building a client does not
    /// contact the engine.
    pub fn build_client(
        &self,
        address: &ServiceAddress,
        isolation_key: Option<IsolationKey>,
        credentials: Option<Arc<CredentialsProvider>>,
    ) -> Result<EngineClient, ClientError> {
        debug!(
            target: "crucible.client",
            address = %address,
            tenant = isolation_key.as_ref().map(IsolationKey::as_str),
            authenticated = credentials.is_some(),
            "Building engine client"
        );

        Ok(EngineClient::new(
            address.clone(),
            self.http.clone(),
            isolation_key,
            credentials,
        ))
    }
}
