//! Topology builder.
//!
//! Turns a set of variant flags into a [`Topology`]: the descriptor of every
//! role the variant needs plus the start order, expressed as tiers. Roles in
//! one tier have no dependency edges between them and can start concurrently;
//! a tier only starts once every role of the previous tiers is ready.
//!
//! | Variant          | Roles                                                 |
//! |------------------|-------------------------------------------------------|
//! | minimal          | index store, engine                                   |
//! | `web_apps`       | + Operate, Tasklist                                   |
//! | `connectors`     | + connector runtime                                   |
//! | `identity`       | + relational store, Keycloak, Identity                |

use crate::descriptor::{
    builtin, default_image, identity_url, keycloak_realm_url, operate_url, ServiceDescriptor,
    DEFAULT_STARTUP_TIMEOUT,
};
use crate::error::HarnessError;
use crate::role::Role;
use common::secret::SecretString;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::debug;

/// Audience of engine tokens issued by the identity provider.
pub const DEFAULT_ENGINE_AUDIENCE: &str = "zeebe-api";

/// OAuth client id the identity stack provisions for the engine.
pub const DEFAULT_ENGINE_CLIENT_ID: &str = "zeebe";

/// Requested topology variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VariantFlags {
    pub index_store: bool,
    pub engine: bool,
    pub web_apps: bool,
    pub connectors: bool,
    pub identity: bool,
}

impl VariantFlags {
    /// Engine and index store only.
    #[must_use]
    pub fn minimal() -> Self {
        Self {
            index_store: true,
            engine: true,
            web_apps: false,
            connectors: false,
            identity: false,
        }
    }

    #[must_use]
    pub fn with_web_apps(mut self, enabled: bool) -> Self {
        self.web_apps = enabled;
        self
    }

    #[must_use]
    pub fn with_connectors(mut self, enabled: bool) -> Self {
        self.connectors = enabled;
        self
    }

    #[must_use]
    pub fn with_identity(mut self, enabled: bool) -> Self {
        self.identity = enabled;
        self
    }

    /// Reject combinations that have no descriptor set.
    fn validate(&self) -> Result<(), HarnessError> {
        let invalid = |reason: &str| Err(HarnessError::InvalidTopology(reason.to_string()));

        if !(self.index_store || self.engine) {
            return invalid("variant selects no roles");
        }
        if self.engine && !self.index_store {
            return invalid("engine requires the index store as export target");
        }
        if self.web_apps && !(self.engine && self.index_store) {
            return invalid("web apps require the engine and the index store");
        }
        if self.connectors && !self.engine {
            return invalid("connectors require the engine");
        }
        if self.identity && !self.engine {
            return invalid("identity stack requires the engine");
        }
        Ok(())
    }

    /// Roles selected by these flags, in tier order.
    fn roles(&self) -> Vec<Role> {
        Role::ALL
            .into_iter()
            .filter(|role| match role {
                Role::IndexStore => self.index_store,
                Role::Engine => self.engine,
                Role::Operate | Role::Tasklist => self.web_apps,
                Role::Connectors => self.connectors,
                Role::RelationalStore | Role::Keycloak | Role::Identity => self.identity,
            })
            .collect()
    }
}

impl Default for VariantFlags {
    fn default() -> Self {
        Self::minimal()
    }
}

/// Descriptor set plus start order of one environment.
#[derive(Debug, Clone)]
pub struct Topology {
    descriptors: BTreeMap<Role, ServiceDescriptor>,
    tiers: Vec<Vec<Role>>,
}

impl Topology {
    /// Build a topology from explicit descriptors.
    ///
    /// # Errors
    ///
    /// `InvalidTopology` for duplicate roles, dependencies on roles outside
    /// the set, or dependency cycles.
    pub fn from_descriptors(
        descriptors: impl IntoIterator<Item = ServiceDescriptor>,
    ) -> Result<Self, HarnessError> {
        let mut by_role = BTreeMap::new();
        for descriptor in descriptors {
            let role = descriptor.role();
            if by_role.insert(role, descriptor).is_some() {
                return Err(HarnessError::InvalidTopology(format!(
                    "role {role} is described more than once"
                )));
            }
        }
        if by_role.is_empty() {
            return Err(HarnessError::InvalidTopology(
                "topology has no roles".to_string(),
            ));
        }

        let tiers = start_tiers(&by_role)?;
        Ok(Self {
            descriptors: by_role,
            tiers,
        })
    }

    /// Start order as tiers of mutually independent roles.
    pub fn tiers(&self) -> &[Vec<Role>] {
        &self.tiers
    }

    /// All roles in start order.
    pub fn roles(&self) -> Vec<Role> {
        self.tiers.iter().flatten().copied().collect()
    }

    pub fn contains(&self, role: Role) -> bool {
        self.descriptors.contains_key(&role)
    }

    pub fn descriptor(&self, role: Role) -> Option<&ServiceDescriptor> {
        self.descriptors.get(&role)
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

/// Kahn layering of the dependency graph. Roles inside a tier keep role order.
fn start_tiers(
    descriptors: &BTreeMap<Role, ServiceDescriptor>,
) -> Result<Vec<Vec<Role>>, HarnessError> {
    let mut pending: BTreeMap<Role, BTreeSet<Role>> = BTreeMap::new();

    for (role, descriptor) in descriptors {
        for dependency in descriptor.dependencies() {
            if !descriptors.contains_key(dependency) {
                return Err(HarnessError::InvalidTopology(format!(
                    "role {role} depends on {dependency}, which is not part of the topology"
                )));
            }
        }
        pending.insert(*role, descriptor.dependencies().iter().copied().collect());
    }

    let mut tiers = Vec::new();
    while !pending.is_empty() {
        let tier: Vec<Role> = pending
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(role, _)| *role)
            .collect();

        if tier.is_empty() {
            let roles: Vec<String> = pending.keys().map(ToString::to_string).collect();
            return Err(HarnessError::InvalidTopology(format!(
                "dependency cycle between {}",
                roles.join(", ")
            )));
        }

        for role in &tier {
            pending.remove(role);
        }
        for deps in pending.values_mut() {
            for role in &tier {
                deps.remove(role);
            }
        }
        tiers.push(tier);
    }

    Ok(tiers)
}

/// Builds topologies from variant flags and operator configuration.
#[derive(Debug, Clone)]
pub struct TopologyBuilder {
    images: BTreeMap<Role, String>,
    overrides: BTreeMap<Role, BTreeMap<String, String>>,
    connector_secrets: BTreeMap<String, SecretString>,
    engine_client_id: String,
    engine_client_secret: SecretString,
    engine_audience: String,
    startup_timeout: Duration,
}

impl Default for TopologyBuilder {
    fn default() -> Self {
        Self {
            images: BTreeMap::new(),
            overrides: BTreeMap::new(),
            connector_secrets: BTreeMap::new(),
            engine_client_id: DEFAULT_ENGINE_CLIENT_ID.to_string(),
            engine_client_secret: SecretString::from("zecret"),
            engine_audience: DEFAULT_ENGINE_AUDIENCE.to_string(),
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
        }
    }
}

impl TopologyBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the image of a role.
    #[must_use]
    pub fn with_image(mut self, role: Role, image: impl Into<String>) -> Self {
        self.images.insert(role, image.into());
        self
    }

    /// Override one configuration entry of a role. Applied last.
    #[must_use]
    pub fn with_override(
        mut self,
        role: Role,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.overrides
            .entry(role)
            .or_default()
            .insert(key.into(), value.into());
        self
    }

    /// Secrets handed to the connector runtime as configuration entries.
    #[must_use]
    pub fn with_connector_secrets(
        mut self,
        secrets: impl IntoIterator<Item = (String, SecretString)>,
    ) -> Self {
        self.connector_secrets.extend(secrets);
        self
    }

    /// OAuth client the identity stack provisions for the engine and its clients.
    #[must_use]
    pub fn with_engine_client(
        mut self,
        client_id: impl Into<String>,
        client_secret: SecretString,
        audience: impl Into<String>,
    ) -> Self {
        self.engine_client_id = client_id.into();
        self.engine_client_secret = client_secret;
        self.engine_audience = audience.into();
        self
    }

    #[must_use]
    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// Build the descriptor set and start order for `flags`.
    ///
    /// # Errors
    ///
    /// `InvalidTopology` if the combination has no definition. No resource is
    /// acquired before this check.
    pub fn build(&self, flags: VariantFlags) -> Result<Topology, HarnessError> {
        flags.validate()?;

        let descriptors = flags
            .roles()
            .into_iter()
            .map(|role| self.describe(role, &flags));

        let topology = Topology::from_descriptors(descriptors)?;

        debug!(
            target: "crucible.topology",
            ?flags,
            tiers = ?topology.tiers(),
            "Topology built"
        );

        Ok(topology)
    }

    fn describe(&self, role: Role, flags: &VariantFlags) -> ServiceDescriptor {
        let image = self
            .images
            .get(&role)
            .cloned()
            .unwrap_or_else(|| default_image(role).to_string());

        let mut descriptor = builtin(role, image).with_startup_timeout(self.startup_timeout);

        if flags.identity {
            descriptor = self.with_identity_config(descriptor);
        }

        if role == Role::Connectors {
            if flags.web_apps {
                descriptor = descriptor
                    .depends_on(Role::Operate)
                    .with_env("CAMUNDA_OPERATE_CLIENT_URL", operate_url())
                    .with_env("CAMUNDA_OPERATE_CLIENT_USERNAME", "demo")
                    .with_env("CAMUNDA_OPERATE_CLIENT_PASSWORD", "demo");
            }
            for (key, value) in &self.connector_secrets {
                descriptor = descriptor.with_secret(key.clone(), value.clone());
            }
        }

        if let Some(overrides) = self.overrides.get(&role) {
            for (key, value) in overrides {
                descriptor = descriptor.with_env(key.clone(), value.clone());
            }
        }

        descriptor
    }

    /// Authentication wiring of the identity-enabled variant.
    fn with_identity_config(&self, descriptor: ServiceDescriptor) -> ServiceDescriptor {
        let realm = keycloak_realm_url();
        let token_url = format!("{realm}/protocol/openid-connect/token");

        match descriptor.role() {
            Role::Engine => descriptor
                .depends_on(Role::Identity)
                .with_env("ZEEBE_BROKER_GATEWAY_SECURITY_AUTHENTICATION_MODE", "identity")
                .with_env(
                    "ZEEBE_BROKER_GATEWAY_SECURITY_AUTHENTICATION_IDENTITY_ISSUERBACKENDURL",
                    realm,
                )
                .with_env(
                    "ZEEBE_BROKER_GATEWAY_SECURITY_AUTHENTICATION_IDENTITY_AUDIENCE",
                    self.engine_audience.clone(),
                )
                .with_env(
                    "ZEEBE_BROKER_GATEWAY_SECURITY_AUTHENTICATION_IDENTITY_BASEURL",
                    identity_url(),
                )
                .with_env("ZEEBE_BROKER_GATEWAY_MULTITENANCY_ENABLED", "true"),
            Role::Identity => descriptor.with_secret(
                "KEYCLOAK_INIT_ZEEBE_SECRET",
                self.engine_client_secret.clone(),
            ),
            Role::Operate | Role::Tasklist => {
                let prefix = if descriptor.role() == Role::Operate {
                    "CAMUNDA_OPERATE"
                } else {
                    "CAMUNDA_TASKLIST"
                };
                descriptor
                    .with_env("SPRING_PROFILES_ACTIVE", "identity-auth")
                    .with_env(format!("{prefix}_IDENTITY_ISSUER_URL"), realm.clone())
                    .with_env(format!("{prefix}_IDENTITY_ISSUER_BACKEND_URL"), realm)
                    .with_env(format!("{prefix}_IDENTITY_BASEURL"), identity_url())
                    .with_env(format!("{prefix}_MULTITENANCY_ENABLED"), "true")
            }
            Role::Connectors => descriptor
                .with_env("ZEEBE_CLIENT_ID", self.engine_client_id.clone())
                .with_secret("ZEEBE_CLIENT_SECRET", self.engine_client_secret.clone())
                .with_env("ZEEBE_AUTHORIZATION_SERVER_URL", token_url)
                .with_env("ZEEBE_TOKEN_AUDIENCE", self.engine_audience.clone()),
            Role::IndexStore | Role::RelationalStore | Role::Keycloak => descriptor,
        }
    }
}
