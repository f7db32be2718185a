//! Declarative service descriptors.
//!
//! A [`ServiceDescriptor`] says everything the runtime needs to start one
//! role: image, configuration, exposed ports, network aliases, how to probe
//! readiness and what the role depends on. [`builtin`] holds the descriptor
//! of every known role as it appears in the minimal variant; the topology
//! builder layers variant-specific configuration and operator overrides on top.

use crate::role::Role;
use common::secret::SecretString;
use std::collections::BTreeMap;
use std::time::Duration;

/// Default per-role startup budget.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(180);

/// Engine REST API port (primary port of the engine).
pub const ENGINE_REST_PORT: u16 = 8080;

/// Engine gRPC gateway port.
pub const ENGINE_GATEWAY_PORT: u16 = 26500;

/// Engine monitoring port (health and readiness endpoints).
pub const ENGINE_MONITORING_PORT: u16 = 9600;

/// Realm holding the engine's OAuth clients.
pub const IDENTITY_REALM: &str = "camunda-platform";

/// Credentials of the relational store. Only reachable inside the environment network.
const RELATIONAL_STORE_DATABASE: &str = "identity";

/// How the runtime decides that an instance accepts requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessProbe {
    /// The port accepts TCP connections.
    Tcp { port: u16 },
    /// `GET path` on the port answers with a success status.
    Http { port: u16, path: String },
}

impl ReadinessProbe {
    pub fn http(port: u16, path: impl Into<String>) -> Self {
        Self::Http {
            port,
            path: path.into(),
        }
    }

    /// Port the probe targets.
    pub fn port(&self) -> u16 {
        match self {
            Self::Tcp { port } | Self::Http { port, .. } => *port,
        }
    }
}

/// Declarative description of one service role.
#[derive(Debug, Clone)]
pub struct ServiceDescriptor {
    role: Role,
    image: String,
    env: BTreeMap<String, String>,
    secrets: BTreeMap<String, SecretString>,
    exposed_ports: Vec<u16>,
    primary_port: u16,
    network_aliases: Vec<String>,
    depends_on: Vec<Role>,
    readiness: ReadinessProbe,
    startup_timeout: Duration,
    forward_logs: bool,
}

impl ServiceDescriptor {
    /// Create a descriptor whose primary port is also its TCP readiness port.
    pub fn new(role: Role, image: impl Into<String>, primary_port: u16) -> Self {
        Self {
            role,
            image: image.into(),
            env: BTreeMap::new(),
            secrets: BTreeMap::new(),
            exposed_ports: vec![primary_port],
            primary_port,
            network_aliases: Vec::new(),
            depends_on: Vec::new(),
            readiness: ReadinessProbe::Tcp { port: primary_port },
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            forward_logs: false,
        }
    }

    #[must_use]
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    /// Set a configuration entry. The last write of a key wins, plain or secret.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        self.secrets.remove(&key);
        self.env.insert(key, value.into());
        self
    }

    /// Set a secret configuration entry. The last write of a key wins, plain or secret.
    #[must_use]
    pub fn with_secret(mut self, key: impl Into<String>, value: SecretString) -> Self {
        let key = key.into();
        self.env.remove(&key);
        self.secrets.insert(key, value);
        self
    }

    #[must_use]
    pub fn with_exposed_port(mut self, port: u16) -> Self {
        if !self.exposed_ports.contains(&port) {
            self.exposed_ports.push(port);
        }
        self
    }

    #[must_use]
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.network_aliases.push(alias.into());
        self
    }

    #[must_use]
    pub fn depends_on(mut self, role: Role) -> Self {
        if !self.depends_on.contains(&role) {
            self.depends_on.push(role);
        }
        self
    }

    /// Set the readiness probe; its port becomes exposed.
    #[must_use]
    pub fn with_readiness(mut self, probe: ReadinessProbe) -> Self {
        self = self.with_exposed_port(probe.port());
        self.readiness = probe;
        self
    }

    #[must_use]
    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_log_forwarding(mut self, forward: bool) -> Self {
        self.forward_logs = forward;
        self
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    /// Plain configuration entries.
    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// Secret configuration entries, redacted in `Debug` output.
    pub fn secrets(&self) -> &BTreeMap<String, SecretString> {
        &self.secrets
    }

    pub fn exposed_ports(&self) -> &[u16] {
        &self.exposed_ports
    }

    pub fn primary_port(&self) -> u16 {
        self.primary_port
    }

    pub fn network_aliases(&self) -> &[String] {
        &self.network_aliases
    }

    pub fn dependencies(&self) -> &[Role] {
        &self.depends_on
    }

    pub fn readiness(&self) -> &ReadinessProbe {
        &self.readiness
    }

    pub fn startup_timeout(&self) -> Duration {
        self.startup_timeout
    }

    pub fn forwards_logs(&self) -> bool {
        self.forward_logs
    }
}

/// Default image of a role.
pub fn default_image(role: Role) -> &'static str {
    match role {
        Role::IndexStore => "elasticsearch:8.13.0",
        Role::Engine => "camunda/zeebe:SNAPSHOT",
        Role::Operate => "camunda/operate:SNAPSHOT",
        Role::Tasklist => "camunda/tasklist:SNAPSHOT",
        Role::Connectors => "camunda/connectors-bundle:SNAPSHOT",
        Role::RelationalStore => "postgres:16-alpine",
        Role::Keycloak => "bitnami/keycloak:22.0.5",
        Role::Identity => "camunda/identity:SNAPSHOT",
    }
}

/// Network alias other roles use to reach `role`.
pub fn network_alias(role: Role) -> &'static str {
    match role {
        Role::IndexStore => "elasticsearch",
        Role::Engine => "zeebe",
        Role::Operate => "operate",
        Role::Tasklist => "tasklist",
        Role::Connectors => "connectors",
        Role::RelationalStore => "postgres",
        Role::Keycloak => "keycloak",
        Role::Identity => "identity",
    }
}

/// Built-in descriptor of `role` for the minimal configuration.
///
/// Dependency edges that only exist in some variants (web apps feeding the
/// connectors, the identity stack in front of the engine) are added by the
/// topology builder.
pub fn builtin(role: Role, image: impl Into<String>) -> ServiceDescriptor {
    let base = |port: u16| {
        ServiceDescriptor::new(role, image.into(), port).with_alias(network_alias(role))
    };

    match role {
        Role::IndexStore => base(9200)
            .with_env("xpack.security.enabled", "false")
            .with_env("discovery.type", "single-node")
            .with_env("ES_JAVA_OPTS", "-Xms512m -Xmx512m")
            .with_readiness(ReadinessProbe::http(9200, "/_cluster/health")),

        Role::Engine => base(ENGINE_REST_PORT)
            .with_exposed_port(ENGINE_GATEWAY_PORT)
            .with_readiness(ReadinessProbe::http(ENGINE_MONITORING_PORT, "/ready"))
            .with_env(
                "ZEEBE_BROKER_EXPORTERS_ELASTICSEARCH_CLASSNAME",
                "io.camunda.zeebe.exporter.ElasticsearchExporter",
            )
            .with_env(
                "ZEEBE_BROKER_EXPORTERS_ELASTICSEARCH_ARGS_URL",
                format!("http://{}:9200", network_alias(Role::IndexStore)),
            )
            .with_env("ZEEBE_BROKER_EXPORTERS_ELASTICSEARCH_ARGS_BULK_SIZE", "1"),

        Role::Operate => base(8080)
            .depends_on(Role::Engine)
            .depends_on(Role::IndexStore)
            .with_log_forwarding(true)
            .with_env("CAMUNDA_OPERATE_ZEEBE_GATEWAYADDRESS", engine_gateway())
            .with_env("CAMUNDA_OPERATE_ELASTICSEARCH_URL", index_store_url())
            .with_env("CAMUNDA_OPERATE_ZEEBEELASTICSEARCH_URL", index_store_url()),

        Role::Tasklist => base(8080)
            .depends_on(Role::Engine)
            .depends_on(Role::IndexStore)
            .with_log_forwarding(true)
            .with_env("CAMUNDA_TASKLIST_ZEEBE_GATEWAYADDRESS", engine_gateway())
            .with_env(
                "CAMUNDA_TASKLIST_ZEEBE_RESTADDRESS",
                format!("http://{}:{ENGINE_REST_PORT}", network_alias(Role::Engine)),
            )
            .with_env("CAMUNDA_TASKLIST_ELASTICSEARCH_URL", index_store_url())
            .with_env("CAMUNDA_TASKLIST_ZEEBEELASTICSEARCH_URL", index_store_url())
            .with_env("CAMUNDA_TASKLIST_CSRFPREVENTIONENABLED", "false"),

        Role::Connectors => base(8080)
            .depends_on(Role::Engine)
            .with_log_forwarding(true)
            .with_env("ZEEBE_CLIENT_BROKER_GATEWAY-ADDRESS", engine_gateway())
            .with_env("ZEEBE_CLIENT_SECURITY_PLAINTEXT", "true"),

        Role::RelationalStore => base(5432)
            .with_env("POSTGRES_DB", RELATIONAL_STORE_DATABASE)
            .with_env("POSTGRES_USER", RELATIONAL_STORE_DATABASE)
            .with_env("POSTGRES_PASSWORD", RELATIONAL_STORE_DATABASE),

        Role::Keycloak => base(8080)
            .depends_on(Role::RelationalStore)
            .with_readiness(ReadinessProbe::http(8080, "/auth/realms/master"))
            .with_env("KEYCLOAK_HTTP_RELATIVE_PATH", "/auth")
            .with_env("KEYCLOAK_DATABASE_HOST", network_alias(Role::RelationalStore))
            .with_env("KEYCLOAK_DATABASE_NAME", RELATIONAL_STORE_DATABASE)
            .with_env("KEYCLOAK_DATABASE_USER", RELATIONAL_STORE_DATABASE)
            .with_env("KEYCLOAK_DATABASE_PASSWORD", RELATIONAL_STORE_DATABASE)
            .with_env("KEYCLOAK_ADMIN_USER", "admin")
            .with_env("KEYCLOAK_ADMIN_PASSWORD", "admin"),

        Role::Identity => base(8084)
            .depends_on(Role::Keycloak)
            .depends_on(Role::RelationalStore)
            .with_log_forwarding(true)
            .with_env(
                "KEYCLOAK_URL",
                format!("http://{}:8080/auth", network_alias(Role::Keycloak)),
            )
            .with_env("IDENTITY_AUTH_PROVIDER_BACKEND_URL", keycloak_realm_url())
            .with_env("MULTITENANCY_ENABLED", "true")
            .with_env("RESOURCE_PERMISSIONS_ENABLED", "false")
            .with_env("IDENTITY_DATABASE_HOST", network_alias(Role::RelationalStore))
            .with_env("IDENTITY_DATABASE_PORT", "5432")
            .with_env("IDENTITY_DATABASE_NAME", RELATIONAL_STORE_DATABASE)
            .with_env("IDENTITY_DATABASE_USERNAME", RELATIONAL_STORE_DATABASE)
            .with_env("IDENTITY_DATABASE_PASSWORD", RELATIONAL_STORE_DATABASE),
    }
}

/// Engine gRPC gateway as seen from inside the network.
fn engine_gateway() -> String {
    format!("{}:{ENGINE_GATEWAY_PORT}", network_alias(Role::Engine))
}

/// Index store URL as seen from inside the network.
fn index_store_url() -> String {
    format!("http://{}:9200", network_alias(Role::IndexStore))
}

/// Keycloak realm URL as seen from inside the network.
pub(crate) fn keycloak_realm_url() -> String {
    format!(
        "http://{}:8080/auth/realms/{IDENTITY_REALM}",
        network_alias(Role::Keycloak)
    )
}

/// Identity base URL as seen from inside the network.
pub(crate) fn identity_url() -> String {
    format!("http://{}:8084", network_alias(Role::Identity))
}

/// Operate URL as seen from inside the network.
pub(crate) fn operate_url() -> String {
    format!("http://{}:8080", network_alias(Role::Operate))
}
