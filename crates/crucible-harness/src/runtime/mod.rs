//! Service runtime capability.
//!
//! The orchestrator never talks to a container engine directly. Everything it
//! needs from one is expressed by [`ServiceRuntime`]: create and remove an
//! isolated network, start and stop one service instance, resolve the address
//! of an exposed port and answer readiness probes.
//!
//! # Implementations
//!
//! - [`DockerRuntime`] drives the Docker CLI (`docker network create`, `docker run`, ...)
//! - `crucible-test-utils` provides an in-process loopback runtime and a
//!   recording mock with scripted failures

pub mod docker;

pub use docker::DockerRuntime;

use crate::descriptor::{ReadinessProbe, ServiceDescriptor};
use crate::role::Role;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors reported by a service runtime.
#[derive(Debug, Error, Clone)]
pub enum RuntimeError {
    /// The runtime rejected a command (non-zero exit, API error).
    #[error("Runtime command failed: {0}")]
    CommandFailed(String),

    /// The instance does not expose the requested port.
    #[error("Port {port} is not exposed by {instance}")]
    PortNotExposed { instance: String, port: u16 },

    /// The runtime does not know the instance (already removed).
    #[error("Unknown instance: {0}")]
    UnknownInstance(String),

    /// The instance stopped on its own before becoming ready.
    #[error("Instance {0} exited")]
    InstanceExited(String),

    /// The instance did not report ready within its startup budget.
    #[error("Readiness not reached within {}s", timeout.as_secs())]
    ReadinessTimeout { timeout: Duration },

    /// A readiness probe could not be evaluated.
    #[error("Readiness probe failed: {0}")]
    Probe(String),

    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for RuntimeError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

/// Handle to an isolated network created by a runtime.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NetworkHandle {
    id: String,
    name: String,
}

impl NetworkHandle {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }

    /// Runtime identifier of the network.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Human-readable network name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Reference to one started service instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceRef {
    id: String,
    role: Role,
}

impl InstanceRef {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            role,
        }
    }

    /// Runtime identifier of the instance (e.g. container id).
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }
}

impl fmt::Display for InstanceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.role, self.id)
    }
}

/// Externally reachable `host:port` of an exposed port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceAddress {
    host: String,
    port: u16,
}

impl ServiceAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Base URL for plain HTTP access, without trailing slash.
    pub fn http_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

impl fmt::Display for ServiceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Capability to run service instances.
///
/// Implementations must tolerate concurrent calls for distinct instances:
/// the orchestrator starts all roles of a tier at the same time.
#[async_trait]
pub trait ServiceRuntime: Send + Sync {
    /// Create an isolated network named `name`.
    async fn create_network(&self, name: &str) -> Result<NetworkHandle, RuntimeError>;

    /// Remove a network created by [`ServiceRuntime::create_network`].
    async fn remove_network(&self, network: &NetworkHandle) -> Result<(), RuntimeError>;

    /// Start an instance for `descriptor`, attached to `network`.
    ///
    /// Returns as soon as the instance exists; readiness is polled separately.
    async fn start(
        &self,
        descriptor: &ServiceDescriptor,
        network: &NetworkHandle,
    ) -> Result<InstanceRef, RuntimeError>;

    /// Stop and remove an instance. `grace` requests a graceful shutdown with
    /// a bounded wait before the instance is killed; `None` stops immediately.
    async fn stop(&self, instance: &InstanceRef, grace: Option<Duration>)
        -> Result<(), RuntimeError>;

    /// Externally reachable address of an exposed `port`.
    async fn address(
        &self,
        instance: &InstanceRef,
        port: u16,
    ) -> Result<ServiceAddress, RuntimeError>;

    /// Evaluate `probe` once against the instance.
    async fn is_ready(
        &self,
        instance: &InstanceRef,
        probe: &ReadinessProbe,
    ) -> Result<bool, RuntimeError>;
}
