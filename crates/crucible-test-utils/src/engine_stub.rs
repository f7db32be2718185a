//! In-process engine REST stub.
//!
//! Serves the part of the engine's `/v2` API the harness client uses and
//! remembers what it was asked to do, per tenant:
//!
//! | Route                             | Behavior                                  |
//! |-----------------------------------|-------------------------------------------|
//! | `GET /v2/topology`                | single broker, one healthy partition      |
//! | `POST /v2/deployments`            | multipart `resources` + `tenantId`        |
//! | `POST /v2/process-instances`      | instance of a definition of the tenant    |
//! | `POST /v2/jobs/:key/completion`   | records the job key, `204`                |

use axum::extract::{Multipart, Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Tenant of requests that name none.
pub const DEFAULT_TENANT: &str = "<default>";

/// Version the stub reports for its broker and gateway.
pub const STUB_ENGINE_VERSION: &str = "8.6.0-loopback";

/// One deployed resource as seen by the stub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedDeployment {
    pub tenant_id: String,
    pub resource_name: String,
    pub process_definition_id: Option<String>,
}

/// One created process instance as seen by the stub.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedInstance {
    pub tenant_id: String,
    pub process_definition_id: String,
    pub variables: Value,
}

#[derive(Debug, Default)]
struct StubState {
    next_key: i64,
    deployments: Vec<RecordedDeployment>,
    /// (tenant, process id) -> (definition key, version)
    definitions: HashMap<(String, String), (i64, i32)>,
    instances: Vec<RecordedInstance>,
    completed_jobs: Vec<i64>,
    bearer_tokens: Vec<String>,
}

impl StubState {
    fn next_key(&mut self) -> i64 {
        self.next_key += 1;
        2_251_799_813_685_248 + self.next_key
    }
}

/// Shared state of the engine stub.
#[derive(Debug, Default)]
pub struct EngineStub {
    state: Mutex<StubState>,
}

impl EngineStub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Router serving the stub's REST API.
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/v2/topology", get(topology))
            .route("/v2/deployments", post(deploy))
            .route("/v2/process-instances", post(create_instance))
            .route("/v2/jobs/:key/completion", post(complete_job))
            .with_state(Arc::clone(self))
    }

    pub fn deployments(&self) -> Vec<RecordedDeployment> {
        self.state.lock().unwrap().deployments.clone()
    }

    pub fn instances(&self) -> Vec<RecordedInstance> {
        self.state.lock().unwrap().instances.clone()
    }

    pub fn completed_jobs(&self) -> Vec<i64> {
        self.state.lock().unwrap().completed_jobs.clone()
    }

    /// Bearer tokens of every request that carried one.
    pub fn bearer_tokens(&self) -> Vec<String> {
        self.state.lock().unwrap().bearer_tokens.clone()
    }

    fn note_authorization(&self, headers: &HeaderMap) {
        let token = headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "));
        if let Some(token) = token {
            self.state
                .lock()
                .unwrap()
                .bearer_tokens
                .push(token.to_string());
        }
    }
}

fn problem(status: StatusCode, title: &str, detail: impl Into<String>) -> Response {
    (
        status,
        Json(json!({
            "type": "about:blank",
            "title": title,
            "status": status.as_u16(),
            "detail": detail.into(),
        })),
    )
        .into_response()
}

/// Id of the first process in a BPMN document.
fn process_id(resource: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(resource).ok()?;
    let start = text.find(":process ").or_else(|| text.find("<process "))?;
    let element = &text[start..];
    let id_start = element.find(" id=\"")? + 5;
    let id = &element[id_start..];
    let end = id.find('"')?;
    Some(id[..end].to_string())
}

async fn topology(State(stub): State<Arc<EngineStub>>, headers: HeaderMap) -> Json<Value> {
    stub.note_authorization(&headers);
    Json(json!({
        "brokers": [{
            "nodeId": 0,
            "host": "127.0.0.1",
            "port": 26501,
            "partitions": [{ "partitionId": 1, "role": "leader", "health": "healthy" }],
            "version": STUB_ENGINE_VERSION,
        }],
        "clusterSize": 1,
        "partitionsCount": 1,
        "replicationFactor": 1,
        "gatewayVersion": STUB_ENGINE_VERSION,
    }))
}

async fn deploy(
    State(stub): State<Arc<EngineStub>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Response {
    stub.note_authorization(&headers);

    let mut tenant = None;
    let mut resources = Vec::new();
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return problem(StatusCode::BAD_REQUEST, "INVALID_ARGUMENT", e.to_string()),
        };
        let name = field.name().unwrap_or_default().to_string();
        let file_name = field.file_name().unwrap_or("resource").to_string();
        let bytes = match field.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => return problem(StatusCode::BAD_REQUEST, "INVALID_ARGUMENT", e.to_string()),
        };

        match name.as_str() {
            "tenantId" => tenant = Some(String::from_utf8_lossy(&bytes).into_owned()),
            "resources" => resources.push((file_name, bytes)),
            _ => {}
        }
    }

    if resources.is_empty() {
        return problem(
            StatusCode::BAD_REQUEST,
            "INVALID_ARGUMENT",
            "Expected to deploy at least one resource, but none given",
        );
    }

    let tenant = tenant.unwrap_or_else(|| DEFAULT_TENANT.to_string());
    let mut state = stub.state.lock().unwrap();
    let deployment_key = state.next_key();
    let mut deployed = Vec::new();

    for (resource_name, bytes) in resources {
        let process_definition_id = process_id(&bytes);

        if let Some(id) = &process_definition_id {
            let version = state
                .definitions
                .get(&(tenant.clone(), id.clone()))
                .map_or(1, |(_, version)| version + 1);
            let key = state.next_key();
            state
                .definitions
                .insert((tenant.clone(), id.clone()), (key, version));

            deployed.push(json!({
                "processDefinition": {
                    "processDefinitionId": id,
                    "processDefinitionVersion": version,
                    "processDefinitionKey": key,
                    "resourceName": resource_name,
                    "tenantId": tenant,
                }
            }));
        }

        state.deployments.push(RecordedDeployment {
            tenant_id: tenant.clone(),
            resource_name,
            process_definition_id,
        });
    }

    Json(json!({
        "deploymentKey": deployment_key,
        "tenantId": tenant,
        "deployments": deployed,
    }))
    .into_response()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateInstanceBody {
    process_definition_id: String,
    #[serde(default)]
    tenant_id: Option<String>,
    #[serde(default)]
    variables: Value,
}

async fn create_instance(
    State(stub): State<Arc<EngineStub>>,
    headers: HeaderMap,
    Json(body): Json<CreateInstanceBody>,
) -> Response {
    stub.note_authorization(&headers);

    let tenant = body
        .tenant_id
        .unwrap_or_else(|| DEFAULT_TENANT.to_string());
    let mut state = stub.state.lock().unwrap();

    let Some((definition_key, version)) = state
        .definitions
        .get(&(tenant.clone(), body.process_definition_id.clone()))
        .copied()
    else {
        return problem(
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            format!(
                "Expected to find process definition with process ID '{}', but none found",
                body.process_definition_id
            ),
        );
    };

    let instance_key = state.next_key();
    state.instances.push(RecordedInstance {
        tenant_id: tenant.clone(),
        process_definition_id: body.process_definition_id.clone(),
        variables: body.variables,
    });

    Json(json!({
        "processInstanceKey": instance_key,
        "processDefinitionKey": definition_key,
        "processDefinitionId": body.process_definition_id,
        "processDefinitionVersion": version,
        "tenantId": tenant,
    }))
    .into_response()
}

async fn complete_job(
    State(stub): State<Arc<EngineStub>>,
    headers: HeaderMap,
    Path(key): Path<i64>,
) -> StatusCode {
    stub.note_authorization(&headers);
    stub.state.lock().unwrap().completed_jobs.push(key);
    StatusCode::NO_CONTENT
}
