//! In-process loopback runtime.
//!
//! [`LoopbackRuntime`] runs every role as a set of axum servers bound to
//! `127.0.0.1:0`, one per exposed port. The engine's REST port serves the
//! [`EngineStub`], Keycloak serves a token endpoint and every other port
//! answers any request with `200 OK`. Readiness probes go over real sockets.
//!
//! # Example
//!
//! ```rust,ignore
//! let runtime = Arc::new(LoopbackRuntime::new());
//! let environment = Environment::launch(topology, runtime.clone(), settings).await?;
//!
//! let engine = environment.address_of(Role::Engine).await?;
//! assert_eq!(runtime.engine().deployments().len(), 0);
//! ```

use crate::engine_stub::EngineStub;
use async_trait::async_trait;
use axum::routing::post;
use axum::{Json, Router};
use crucible_harness::descriptor::{
    ReadinessProbe, ServiceDescriptor, ENGINE_REST_PORT, IDENTITY_REALM,
};
use crucible_harness::role::Role;
use crucible_harness::runtime::{
    InstanceRef, NetworkHandle, RuntimeError, ServiceAddress, ServiceRuntime,
};
use serde_json::json;
use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Access token the Keycloak stub issues.
pub const LOOPBACK_ACCESS_TOKEN: &str = "loopback-access-token";

/// Token lifetime the Keycloak stub reports, in seconds.
const TOKEN_LIFETIME_SECS: u64 = 300;

/// Timeout of one readiness probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

struct LoopbackInstance {
    role: Role,
    ports: HashMap<u16, SocketAddr>,
    servers: Vec<JoinHandle<()>>,
}

impl Drop for LoopbackInstance {
    fn drop(&mut self) {
        for server in &self.servers {
            server.abort();
        }
    }
}

/// Runtime serving each role from local listeners.
pub struct LoopbackRuntime {
    engine: Arc<EngineStub>,
    instances: Mutex<HashMap<String, LoopbackInstance>>,
    networks: Mutex<BTreeSet<String>>,
    http: reqwest::Client,
}

impl Default for LoopbackRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackRuntime {
    #[must_use]
    pub fn new() -> Self {
        Self {
            engine: Arc::new(EngineStub::new()),
            instances: Mutex::new(HashMap::new()),
            networks: Mutex::new(BTreeSet::new()),
            http: reqwest::Client::builder()
                .timeout(PROBE_TIMEOUT)
                .build()
                .expect("probe client should build"),
        }
    }

    /// State of the engine stub shared by every engine instance.
    pub fn engine(&self) -> &Arc<EngineStub> {
        &self.engine
    }

    /// Roles with a live instance.
    pub fn running_roles(&self) -> Vec<Role> {
        let mut roles: Vec<Role> = self
            .instances
            .lock()
            .unwrap()
            .values()
            .map(|instance| instance.role)
            .collect();
        roles.sort();
        roles
    }

    /// Networks created and not removed.
    pub fn open_networks(&self) -> Vec<String> {
        self.networks.lock().unwrap().iter().cloned().collect()
    }

    fn router_for(&self, role: Role, port: u16) -> Router {
        match role {
            Role::Engine if port == ENGINE_REST_PORT => self.engine.router(),
            Role::Keycloak => keycloak_router(),
            _ => healthy_router(),
        }
    }

    fn bound_address(&self, instance: &InstanceRef, port: u16) -> Result<SocketAddr, RuntimeError> {
        let instances = self.instances.lock().unwrap();
        let live = instances
            .get(instance.id())
            .ok_or_else(|| RuntimeError::UnknownInstance(instance.id().to_string()))?;

        live.ports
            .get(&port)
            .copied()
            .ok_or_else(|| RuntimeError::PortNotExposed {
                instance: instance.id().to_string(),
                port,
            })
    }
}

fn healthy_router() -> Router {
    Router::new().fallback(|| async { "ok" })
}

fn keycloak_router() -> Router {
    let token_path = format!("/auth/realms/{IDENTITY_REALM}/protocol/openid-connect/token");
    Router::new()
        .route(
            &token_path,
            post(|| async {
                Json(json!({
                    "access_token": LOOPBACK_ACCESS_TOKEN,
                    "expires_in": TOKEN_LIFETIME_SECS,
                    "token_type": "Bearer",
                }))
            }),
        )
        .fallback(|| async { "ok" })
}

#[async_trait]
impl ServiceRuntime for LoopbackRuntime {
    async fn create_network(&self, name: &str) -> Result<NetworkHandle, RuntimeError> {
        self.networks.lock().unwrap().insert(name.to_string());
        Ok(NetworkHandle::new(format!("loopback-{name}"), name))
    }

    async fn remove_network(&self, network: &NetworkHandle) -> Result<(), RuntimeError> {
        self.networks.lock().unwrap().remove(network.name());
        Ok(())
    }

    async fn start(
        &self,
        descriptor: &ServiceDescriptor,
        _network: &NetworkHandle,
    ) -> Result<InstanceRef, RuntimeError> {
        let role = descriptor.role();
        let mut instance = LoopbackInstance {
            role,
            ports: HashMap::new(),
            servers: Vec::new(),
        };

        for port in descriptor.exposed_ports() {
            let listener = TcpListener::bind("127.0.0.1:0").await?;
            instance.ports.insert(*port, listener.local_addr()?);

            let router = self.router_for(role, *port);
            instance.servers.push(tokio::spawn(async move {
                if let Err(e) = axum::serve(listener, router).await {
                    eprintln!("Loopback server error: {}", e);
                }
            }));
        }

        let id = format!("{role}-{}", Uuid::new_v4().simple());
        self.instances.lock().unwrap().insert(id.clone(), instance);
        Ok(InstanceRef::new(id, role))
    }

    async fn stop(
        &self,
        instance: &InstanceRef,
        _grace: Option<Duration>,
    ) -> Result<(), RuntimeError> {
        // Dropping the instance aborts its servers.
        self.instances.lock().unwrap().remove(instance.id());
        Ok(())
    }

    async fn address(
        &self,
        instance: &InstanceRef,
        port: u16,
    ) -> Result<ServiceAddress, RuntimeError> {
        let bound = self.bound_address(instance, port)?;
        Ok(ServiceAddress::new(bound.ip().to_string(), bound.port()))
    }

    async fn is_ready(
        &self,
        instance: &InstanceRef,
        probe: &ReadinessProbe,
    ) -> Result<bool, RuntimeError> {
        let bound = self.bound_address(instance, probe.port())?;

        match probe {
            ReadinessProbe::Tcp { .. } => Ok(TcpStream::connect(bound).await.is_ok()),
            ReadinessProbe::Http { path, .. } => {
                let url = format!("http://{bound}{path}");
                match self.http.get(&url).send().await {
                    Ok(response) => Ok(response.status().is_success()),
                    Err(_) => Ok(false),
                }
            }
        }
    }
}
