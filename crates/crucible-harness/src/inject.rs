//! Capability injection into test fixtures.
//!
//! A fixture lists its fields through [`TestFixture::declared_fields`]; each
//! field names a capability [`Slot`]. Injection walks the supertype chain
//! top-down and fills every slot whose scope matches:
//!
//! - `Slot::Environment` receives the scope's environment handle
//! - `Slot::EngineClient` receives a fresh client bound to the engine address,
//!   the test's isolation key and the optional credentials
//!
//! Static fields are left alone by per-test injection; they are filled once
//! per scope by [`inject_shared`].

use crate::client::EngineClient;
use crate::client_factory::ClientFactory;
use crate::credentials::CredentialsProvider;
use crate::error::HarnessError;
use crate::isolation::IsolationKey;
use crate::lifecycle::Environment;
use crate::role::Role;
use crate::runtime::ServiceAddress;
use std::sync::Arc;
use tracing::{debug, trace};

/// Whether a field belongs to one test or to the whole scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldScope {
    Instance,
    Static,
}

/// Known injectable capabilities.
#[derive(Debug)]
pub enum Slot<'a> {
    EngineClient(&'a mut Option<EngineClient>),
    Environment(&'a mut Option<Arc<Environment>>),
}

/// One declared field of a fixture.
#[derive(Debug)]
pub struct FieldRef<'a> {
    pub name: &'static str,
    pub scope: FieldScope,
    pub slot: Slot<'a>,
}

impl<'a> FieldRef<'a> {
    pub fn instance(name: &'static str, slot: Slot<'a>) -> Self {
        Self {
            name,
            scope: FieldScope::Instance,
            slot,
        }
    }

    pub fn shared(name: &'static str, slot: Slot<'a>) -> Self {
        Self {
            name,
            scope: FieldScope::Static,
            slot,
        }
    }
}

/// A test instance whose fields receive capabilities.
pub trait TestFixture: Send {
    /// Fields declared by this type itself, without inherited ones.
    fn declared_fields(&mut self) -> Vec<FieldRef<'_>>;

    /// The embedded supertype, if any.
    fn supertype(&mut self) -> Option<&mut dyn TestFixture> {
        None
    }
}

/// Credentials handed to injected engine clients.
#[derive(Clone)]
pub enum Credentials {
    /// No identity stack; clients talk plaintext without tokens.
    Anonymous,
    Provider(Arc<CredentialsProvider>),
    /// The identity stack is part of the environment but its credentials
    /// could not be set up. Only fails client fields.
    Unavailable(String),
}

/// Everything injection needs, resolved before the fixture is touched.
pub struct InjectionContext {
    environment: Arc<Environment>,
    engine_address: Result<ServiceAddress, String>,
    isolation_key: Option<IsolationKey>,
    credentials: Credentials,
    factory: ClientFactory,
}

impl InjectionContext {
    /// Resolve the engine address of `environment`.
    ///
    /// A missing engine only fails injection of client fields.
    pub async fn resolve(
        environment: Arc<Environment>,
        isolation_key: Option<IsolationKey>,
        credentials: Credentials,
        factory: ClientFactory,
    ) -> Self {
        let engine_address = environment
            .address_of(Role::Engine)
            .await
            .map_err(|e| e.to_string());

        Self {
            environment,
            engine_address,
            isolation_key,
            credentials,
            factory,
        }
    }

    pub fn isolation_key(&self) -> Option<&IsolationKey> {
        self.isolation_key.as_ref()
    }

    fn build_client(&self) -> Result<EngineClient, String> {
        let address = self.engine_address.as_ref().map_err(Clone::clone)?;
        let credentials = match &self.credentials {
            Credentials::Anonymous => None,
            Credentials::Provider(provider) => Some(Arc::clone(provider)),
            Credentials::Unavailable(cause) => return Err(cause.clone()),
        };
        self.factory
            .build_client(address, self.isolation_key.clone(), credentials)
            .map_err(|e| e.to_string())
    }
}

/// Fill every instance field of `fixture` and its supertypes.
///
/// Returns the number of fields assigned.
///
/// # Errors
///
/// `InjectionFailed` naming the first field that could not be filled.
pub fn inject(
    fixture: &mut dyn TestFixture,
    context: &InjectionContext,
) -> Result<usize, HarnessError> {
    let assigned = walk(fixture, context, FieldScope::Instance)?;
    debug!(
        target: "crucible.inject",
        assigned,
        tenant = context.isolation_key().map(IsolationKey::as_str),
        "Instance fields injected"
    );
    Ok(assigned)
}

/// Fill every static field of `fixture` and its supertypes.
///
/// # Errors
///
/// `InjectionFailed` naming the first field that could not be filled.
pub fn inject_shared(
    fixture: &mut dyn TestFixture,
    context: &InjectionContext,
) -> Result<usize, HarnessError> {
    let assigned = walk(fixture, context, FieldScope::Static)?;
    debug!(target: "crucible.inject", assigned, "Static fields injected");
    Ok(assigned)
}

fn walk(
    fixture: &mut dyn TestFixture,
    context: &InjectionContext,
    scope: FieldScope,
) -> Result<usize, HarnessError> {
    let mut assigned = 0;

    if let Some(parent) = fixture.supertype() {
        assigned += walk(parent, context, scope)?;
    }

    for field in fixture.declared_fields() {
        if field.scope != scope {
            trace!(target: "crucible.inject", field = field.name, "Skipping field of other scope");
            continue;
        }

        match field.slot {
            Slot::Environment(slot) => {
                *slot = Some(Arc::clone(&context.environment));
            }
            Slot::EngineClient(slot) => {
                let client = context
                    .build_client()
                    .map_err(|cause| HarnessError::InjectionFailed {
                        field: field.name.to_string(),
                        cause,
                    })?;
                *slot = Some(client);
            }
        }

        trace!(target: "crucible.inject", field = field.name, "Field injected");
        assigned += 1;
    }

    Ok(assigned)
}
