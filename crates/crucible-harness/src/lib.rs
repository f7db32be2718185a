//! Crucible Harness
//!
//! Ephemeral multi-service environments for integration tests of a workflow
//! engine and its companion services (index store, web apps, connector
//! runtime, identity stack).
//!
//! # Architecture
//!
//! ```text
//! TopologyBuilder ──> Topology (descriptors + start tiers)
//!                        │
//!                        v
//!                    Environment ──> ServiceRuntime (Docker, loopback, mock)
//!                        │
//!                    ScopeCache (one environment per scope key)
//!                        │
//!        EnvironmentExtension ──> inject() ──> ClientFactory ──> EngineClient
//!                                    ^
//!                        derive_isolation_key(class, method)
//! ```
//!
//! # Modules
//!
//! - [`topology`] - Variant selection and start order
//! - [`descriptor`] - Per-role service descriptors
//! - [`lifecycle`] - Environment start, stop and address lookup
//! - [`scope_cache`] - One environment per scope
//! - [`inject`] - Capability injection into test fixtures
//! - [`extension`] - Test-framework hook points
//! - [`runtime`] - Service runtime capability and the Docker runtime

pub mod client;
pub mod client_factory;
pub mod config;
pub mod credentials;
pub mod descriptor;
pub mod error;
pub mod extension;
pub mod inject;
pub mod isolation;
pub mod lifecycle;
pub mod readiness;
pub mod role;
pub mod runtime;
pub mod scope_cache;
pub mod topology;

pub use client::{ClientError, EngineClient};
pub use client_factory::ClientFactory;
pub use config::HarnessConfig;
pub use error::{HarnessError, Result};
pub use extension::{EnvironmentExtension, ScopeContext, TestContext};
pub use inject::{FieldRef, FieldScope, Slot, TestFixture};
pub use isolation::{derive_isolation_key, IsolationKey};
pub use lifecycle::{Environment, EnvironmentState, LifecycleSettings};
pub use role::Role;
pub use runtime::{ServiceAddress, ServiceRuntime};
pub use scope_cache::{ScopeCache, ScopeGranularity, ScopeKey};
pub use topology::{Topology, TopologyBuilder, VariantFlags};
