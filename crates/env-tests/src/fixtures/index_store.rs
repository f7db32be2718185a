//! Index store client for checking exported engine records.

use crucible_harness::ServiceAddress;
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;

/// Index prefix of the engine's exporter.
pub const RECORD_INDEX_PREFIX: &str = "zeebe-record";

#[derive(Debug, Error)]
pub enum IndexStoreError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Request failed with status {status}: {body}")]
    RequestFailed { status: u16, body: String },
}

#[derive(Debug, Deserialize)]
pub struct ClusterHealth {
    pub cluster_name: String,
    pub status: String,
    pub number_of_nodes: u32,
}

impl ClusterHealth {
    /// Single-node clusters report yellow once replicas cannot be placed.
    pub fn is_usable(&self) -> bool {
        matches!(self.status.as_str(), "green" | "yellow")
    }
}

#[derive(Debug, Deserialize)]
struct CountResponse {
    count: u64,
}

/// Client for the index store of one environment.
pub struct IndexStoreClient {
    base_url: String,
    http: Client,
}

impl IndexStoreClient {
    pub fn new(address: &ServiceAddress) -> Self {
        Self {
            base_url: address.http_url(),
            http: Client::new(),
        }
    }

    pub async fn cluster_health(&self) -> Result<ClusterHealth, IndexStoreError> {
        let response = self
            .http
            .get(format!("{}/_cluster/health", self.base_url))
            .send()
            .await?;
        Self::json(response).await
    }

    /// Number of exported records of `value_type` (e.g. `process-instance`).
    ///
    /// A missing index counts as zero; the exporter creates it lazily.
    pub async fn record_count(&self, value_type: &str) -> Result<u64, IndexStoreError> {
        let response = self
            .http
            .get(format!(
                "{}/{RECORD_INDEX_PREFIX}_{value_type}*/_count",
                self.base_url
            ))
            .query(&[("ignore_unavailable", "true"), ("allow_no_indices", "true")])
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(0);
        }
        let count: CountResponse = Self::json(response).await?;
        Ok(count.count)
    }

    /// Exported records of `value_type` whose `value.tenantId` is `tenant`.
    pub async fn tenant_record_count(
        &self,
        value_type: &str,
        tenant: &str,
    ) -> Result<u64, IndexStoreError> {
        let query = serde_json::json!({
            "query": { "term": { "value.tenantId": tenant } }
        });
        let response = self
            .http
            .post(format!(
                "{}/{RECORD_INDEX_PREFIX}_{value_type}*/_count",
                self.base_url
            ))
            .query(&[("ignore_unavailable", "true"), ("allow_no_indices", "true")])
            .json(&query)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(0);
        }
        let count: CountResponse = Self::json(response).await?;
        Ok(count.count)
    }

    async fn json<T: for<'de> Deserialize<'de>>(
        response: reqwest::Response,
    ) -> Result<T, IndexStoreError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(IndexStoreError::RequestFailed {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json().await?)
    }
}
