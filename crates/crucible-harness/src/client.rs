//! Engine REST client.
//!
//! A thin client over the engine's `/v2` REST API. Each client is bound to
//! one engine address, an optional tenant (the test's isolation key) and
//! optional OAuth credentials. The tenant is attached to every deployment
//! and process instance the client creates.

use crate::credentials::CredentialsProvider;
use crate::isolation::IsolationKey;
use crate::runtime::ServiceAddress;
use common::secret::ExposeSecret;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// Errors of the engine client and the credentials provider.
#[derive(Debug, Error, Clone)]
pub enum ClientError {
    /// The request did not reach the server or the response was cut off.
    #[error("HTTP error: {0}")]
    Http(String),

    /// The server answered with a non-success status.
    #[error("Request failed with status {status}: {message}")]
    Status { status: u16, message: String },

    /// The response body does not match the expected shape.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// The token endpoint rejected the client credentials.
    #[error("Authentication rejected: {0}")]
    AuthenticationRejected(String),

    /// The client could not be built.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// Cluster topology reported by the engine gateway.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologyResponse {
    pub brokers: Vec<BrokerInfo>,
    pub cluster_size: u32,
    pub partitions_count: u32,
    pub replication_factor: u32,
    pub gateway_version: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerInfo {
    pub node_id: u32,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub partitions: Vec<PartitionInfo>,
    pub version: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionInfo {
    pub partition_id: u32,
    pub role: String,
    pub health: String,
}

/// Result of a resource deployment.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentResponse {
    pub deployment_key: i64,
    pub tenant_id: String,
    #[serde(default)]
    pub deployments: Vec<DeployedResource>,
}

impl DeploymentResponse {
    /// Process definitions contained in the deployment.
    pub fn process_definitions(&self) -> impl Iterator<Item = &ProcessDefinition> {
        self.deployments
            .iter()
            .filter_map(|d| d.process_definition.as_ref())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployedResource {
    #[serde(default)]
    pub process_definition: Option<ProcessDefinition>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessDefinition {
    pub process_definition_id: String,
    pub process_definition_version: i32,
    pub process_definition_key: i64,
    pub resource_name: String,
    pub tenant_id: String,
}

/// A created process instance.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessInstance {
    pub process_instance_key: i64,
    pub process_definition_key: i64,
    pub process_definition_id: String,
    pub process_definition_version: i32,
    pub tenant_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateInstanceRequest<'a> {
    process_definition_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    tenant_id: Option<&'a str>,
    variables: &'a serde_json::Value,
}

#[derive(Serialize)]
struct CompleteJobRequest<'a> {
    variables: &'a serde_json::Value,
}

/// Error body of the engine REST API (RFC 7807 problem detail).
#[derive(Deserialize)]
struct ProblemDetail {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    detail: Option<String>,
}

/// Client bound to one engine, one tenant and optional credentials.
#[derive(Clone)]
pub struct EngineClient {
    address: ServiceAddress,
    base_url: String,
    http: reqwest::Client,
    tenant: Option<IsolationKey>,
    credentials: Option<Arc<CredentialsProvider>>,
}

impl fmt::Debug for EngineClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineClient")
            .field("address", &self.address)
            .field("tenant", &self.tenant)
            .field("authenticated", &self.credentials.is_some())
            .finish_non_exhaustive()
    }
}

impl EngineClient {
    pub(crate) fn new(
        address: ServiceAddress,
        http: reqwest::Client,
        tenant: Option<IsolationKey>,
        credentials: Option<Arc<CredentialsProvider>>,
    ) -> Self {
        let base_url = address.http_url();
        Self {
            address,
            base_url,
            http,
            tenant,
            credentials,
        }
    }

    pub fn address(&self) -> &ServiceAddress {
        &self.address
    }

    /// Default tenant of every operation; the test's isolation key.
    pub fn isolation_key(&self) -> Option<&IsolationKey> {
        self.tenant.as_ref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.credentials.is_some()
    }

    fn tenant_id(&self) -> Option<&str> {
        self.tenant.as_ref().map(IsolationKey::as_str)
    }

    async fn authorize(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::RequestBuilder, ClientError> {
        match &self.credentials {
            Some(credentials) => {
                let token = credentials.token().await?;
                Ok(request.bearer_auth(token.expose_secret()))
            }
            None => Ok(request),
        }
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, ClientError> {
        let response = self
            .authorize(request)
            .await?
            .send()
            .await
            .map_err(|e| ClientError::Http(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let message = match response.json::<ProblemDetail>().await {
            Ok(problem) => problem
                .detail
                .or(problem.title)
                .unwrap_or_else(|| status.to_string()),
            Err(_) => status.to_string(),
        };

        warn!(
            target: "crucible.client",
            status = status.as_u16(),
            message = %message,
            "Engine request failed"
        );
        Err(ClientError::Status {
            status: status.as_u16(),
            message,
        })
    }

    async fn send_json<T: for<'de> Deserialize<'de>>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, ClientError> {
        self.send(request)
            .await?
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    /// Cluster topology of the engine.
    ///
    /// # Errors
    ///
    /// Transport, status or decoding failures.
    #[instrument(skip_all, name = "crucible.client.topology")]
    pub async fn topology(&self) -> Result<TopologyResponse, ClientError> {
        let url = format!("{}/v2/topology", self.base_url);
        self.send_json(self.http.get(&url)).await
    }

    /// Deploy one resource (BPMN, DMN or form) under the client's tenant.
    ///
    /// # Errors
    ///
    /// Transport, status or decoding failures.
    #[instrument(skip_all, name = "crucible.client.deploy_resource", fields(resource = %name))]
    pub async fn deploy_resource(
        &self,
        name: &str,
        content: Vec<u8>,
    ) -> Result<DeploymentResponse, ClientError> {
        let url = format!("{}/v2/deployments", self.base_url);

        let part = reqwest::multipart::Part::bytes(content)
            .file_name(name.to_string())
            .mime_str("application/octet-stream")
            .map_err(|e| ClientError::Configuration(e.to_string()))?;
        let mut form = reqwest::multipart::Form::new().part("resources", part);
        if let Some(tenant) = self.tenant_id() {
            form = form.text("tenantId", tenant.to_string());
        }

        let deployment: DeploymentResponse =
            self.send_json(self.http.post(&url).multipart(form)).await?;

        debug!(
            target: "crucible.client",
            deployment_key = deployment.deployment_key,
            tenant = %deployment.tenant_id,
            "Resource deployed"
        );
        Ok(deployment)
    }

    /// Create an instance of the latest version of `process_definition_id`.
    ///
    /// # Errors
    ///
    /// Transport, status or decoding failures.
    #[instrument(
        skip_all,
        name = "crucible.client.create_instance",
        fields(process = %process_definition_id)
    )]
    pub async fn create_instance(
        &self,
        process_definition_id: &str,
        variables: &serde_json::Value,
    ) -> Result<ProcessInstance, ClientError> {
        let url = format!("{}/v2/process-instances", self.base_url);
        let body = CreateInstanceRequest {
            process_definition_id,
            tenant_id: self.tenant_id(),
            variables,
        };

        self.send_json(self.http.post(&url).json(&body)).await
    }

    /// Complete an activated job.
    ///
    /// # Errors
    ///
    /// Transport or status failures.
    #[instrument(skip_all, name = "crucible.client.complete_job", fields(job = job_key))]
    pub async fn complete_job(
        &self,
        job_key: i64,
        variables: &serde_json::Value,
    ) -> Result<(), ClientError> {
        let url = format!("{}/v2/jobs/{job_key}/completion", self.base_url);
        self.send(self.http.post(&url).json(&CompleteJobRequest { variables }))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::isolation::derive_isolation_key;
    use wiremock::matchers::{body_json, body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer, tenant: Option<IsolationKey>) -> EngineClient {
        let address = server.address();
        EngineClient::new(
            ServiceAddress::new(address.ip().to_string(), address.port()),
            reqwest::Client::new(),
            tenant,
            None,
        )
    }

    #[tokio::test]
    async fn test_topology() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/topology"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "brokers": [{
                    "nodeId": 0,
                    "host": "zeebe",
                    "port": 26501,
                    "partitions": [{"partitionId": 1, "role": "leader", "health": "healthy"}],
                    "version": "8.6.0"
                }],
                "clusterSize": 1,
                "partitionsCount": 1,
                "replicationFactor": 1,
                "gatewayVersion": "8.6.0"
            })))
            .mount(&server)
            .await;

        let topology = client_for(&server, None).topology().await.unwrap();

        assert_eq!(topology.brokers.len(), 1);
        assert_eq!(topology.cluster_size, 1);
        assert_eq!(topology.gateway_version, "8.6.0");
    }

    #[tokio::test]
    async fn test_deploy_attaches_tenant() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/deployments"))
            .and(body_string_contains("name=\"tenantId\""))
            .and(body_string_contains("OrderTest_shouldShip"))
            .and(body_string_contains("filename=\"order.bpmn\""))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "deploymentKey": 2251799813685249i64,
                "tenantId": "OrderTest_shouldShip",
                "deployments": [{
                    "processDefinition": {
                        "processDefinitionId": "order",
                        "processDefinitionVersion": 1,
                        "processDefinitionKey": 2251799813685250i64,
                        "resourceName": "order.bpmn",
                        "tenantId": "OrderTest_shouldShip"
                    }
                }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(
            &server,
            Some(derive_isolation_key(Some("OrderTest"), Some("shouldShip"))),
        );
        let deployment = client
            .deploy_resource("order.bpmn", b"<definitions/>".to_vec())
            .await
            .unwrap();

        assert_eq!(deployment.tenant_id, "OrderTest_shouldShip");
        assert_eq!(
            deployment
                .process_definitions()
                .map(|p| p.process_definition_id.as_str())
                .collect::<Vec<_>>(),
            vec!["order"]
        );
    }

    #[tokio::test]
    async fn test_create_instance_without_tenant_omits_field() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/process-instances"))
            .and(body_json(serde_json::json!({
                "processDefinitionId": "order",
                "variables": {"amount": 10}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "processInstanceKey": 7,
                "processDefinitionKey": 3,
                "processDefinitionId": "order",
                "processDefinitionVersion": 1,
                "tenantId": "<default>"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let instance = client_for(&server, None)
            .create_instance("order", &serde_json::json!({"amount": 10}))
            .await
            .unwrap();

        assert_eq!(instance.process_instance_key, 7);
        assert_eq!(instance.tenant_id, "<default>");
    }

    #[tokio::test]
    async fn test_error_status_uses_problem_detail() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/jobs/42/completion"))
            .respond_with(ResponseTemplate::new(404).set_body_json(serde_json::json!({
                "type": "about:blank",
                "title": "NOT_FOUND",
                "status": 404,
                "detail": "Job with key 42 not found"
            })))
            .mount(&server)
            .await;

        let err = client_for(&server, None)
            .complete_job(42, &serde_json::json!({}))
            .await
            .unwrap_err();

        match err {
            ClientError::Status { status, message } => {
                assert_eq!(status, 404);
                assert_eq!(message, "Job with key 42 not found");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_debug_shows_tenant() {
        let client = EngineClient::new(
            ServiceAddress::new("127.0.0.1", 8080),
            reqwest::Client::new(),
            Some(derive_isolation_key(Some("Foo"), Some("bar"))),
            None,
        );

        let debug = format!("{client:?}");
        assert!(debug.contains("Foo_bar"));
        assert!(debug.contains("authenticated: false"));
    }
}
