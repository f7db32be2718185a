//! Spring actuator health client for the web apps, connectors and identity.

use crucible_harness::ServiceAddress;
use reqwest::Client;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

impl HealthResponse {
    pub fn is_up(&self) -> bool {
        self.status == "UP"
    }
}

pub struct ActuatorClient {
    base_url: String,
    http: Client,
}

impl ActuatorClient {
    pub fn new(address: &ServiceAddress) -> Self {
        Self {
            base_url: address.http_url(),
            http: Client::new(),
        }
    }

    /// `GET <path>` of the service's health endpoint, e.g. `/actuator/health`.
    pub async fn health(&self, path: &str) -> Result<HealthResponse, reqwest::Error> {
        self.http
            .get(format!("{}{path}", self.base_url))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
    }

    /// Status of an unauthenticated `GET <path>`.
    pub async fn status_of(&self, path: &str) -> Result<u16, reqwest::Error> {
        let response = self
            .http
            .get(format!("{}{path}", self.base_url))
            .send()
            .await?;
        Ok(response.status().as_u16())
    }
}
