//! Harness configuration.
//!
//! Configuration is loaded from `CRUCIBLE_*` environment variables. Secrets
//! (client secret, connector secrets) are held as `SecretString` and
//! redacted in Debug output.

use crate::client_factory::DEFAULT_CLIENT_TIMEOUT;
use crate::descriptor::DEFAULT_STARTUP_TIMEOUT;
use crate::lifecycle::{LifecycleSettings, DEFAULT_ENGINE_SHUTDOWN_GRACE};
use crate::role::Role;
use crate::scope_cache::ScopeGranularity;
use crate::topology::{
    TopologyBuilder, VariantFlags, DEFAULT_ENGINE_AUDIENCE, DEFAULT_ENGINE_CLIENT_ID,
};
use common::config::parse_bool;
use common::secret::SecretString;
use std::collections::{BTreeMap, HashMap};
use std::env;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Default secret of the engine OAuth client.
pub const DEFAULT_CLIENT_SECRET: &str = "zecret";

const CONNECTOR_SECRET_PREFIX: &str = "CRUCIBLE_CONNECTOR_SECRET_";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: String, value: String },
}

/// Harness configuration.
#[derive(Clone)]
pub struct HarnessConfig {
    /// Lifetime across which one environment is shared (default: class).
    pub scope: ScopeGranularity,

    /// Variant toggles. Engine and index store are always enabled.
    pub flags: VariantFlags,

    /// Per-role image overrides (`CRUCIBLE_<ROLE>_IMAGE`).
    pub images: BTreeMap<Role, String>,

    /// Per-role configuration overrides (`CRUCIBLE_<ROLE>_ENV_<KEY>`).
    pub overrides: BTreeMap<Role, BTreeMap<String, String>>,

    /// Connector secrets (`CRUCIBLE_CONNECTOR_SECRET_<NAME>`).
    pub connector_secrets: BTreeMap<String, SecretString>,

    /// Graceful stop budget of the engine (default: 10s).
    pub engine_shutdown_grace: Duration,

    /// Per-role startup budget (default: 180s).
    pub startup_timeout: Duration,

    /// Start the roles of one tier concurrently (default: true).
    pub parallel_start: bool,

    /// OAuth client used in the identity variant.
    pub client_id: String,
    pub client_secret: SecretString,
    pub client_audience: String,

    /// Request timeout of engine clients (default: 10s).
    pub client_timeout: Duration,
}

impl fmt::Debug for HarnessConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HarnessConfig")
            .field("scope", &self.scope)
            .field("flags", &self.flags)
            .field("images", &self.images)
            .field("overrides", &self.overrides)
            .field(
                "connector_secrets",
                &self.connector_secrets.keys().collect::<Vec<_>>(),
            )
            .field("engine_shutdown_grace", &self.engine_shutdown_grace)
            .field("startup_timeout", &self.startup_timeout)
            .field("parallel_start", &self.parallel_start)
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("client_audience", &self.client_audience)
            .field("client_timeout", &self.client_timeout)
            .finish()
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            scope: ScopeGranularity::Class,
            flags: VariantFlags::minimal().with_web_apps(true),
            images: BTreeMap::new(),
            overrides: BTreeMap::new(),
            connector_secrets: BTreeMap::new(),
            engine_shutdown_grace: DEFAULT_ENGINE_SHUTDOWN_GRACE,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            parallel_start: true,
            client_id: DEFAULT_ENGINE_CLIENT_ID.to_string(),
            client_secret: SecretString::from(DEFAULT_CLIENT_SECRET),
            client_audience: DEFAULT_ENGINE_AUDIENCE.to_string(),
            client_timeout: DEFAULT_CLIENT_TIMEOUT,
        }
    }
}

impl HarnessConfig {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// `ConfigError::InvalidValue` for malformed booleans, durations or scopes.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    ///
    /// # Errors
    ///
    /// `ConfigError::InvalidValue` for malformed booleans, durations or scopes.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let scope = match vars.get("CRUCIBLE_SCOPE").map(|s| s.trim().to_ascii_lowercase()) {
            None => defaults.scope,
            Some(value) if value == "class" => ScopeGranularity::Class,
            Some(value) if value == "run" => ScopeGranularity::Run,
            Some(value) => return Err(invalid("CRUCIBLE_SCOPE", &value)),
        };

        let flags = VariantFlags::minimal()
            .with_web_apps(bool_var(vars, "CRUCIBLE_ENABLE_WEB_APPS", true)?)
            .with_connectors(bool_var(vars, "CRUCIBLE_ENABLE_CONNECTORS", false)?)
            .with_identity(bool_var(vars, "CRUCIBLE_ENABLE_IDENTITY", false)?);

        let mut images = BTreeMap::new();
        let mut overrides: BTreeMap<Role, BTreeMap<String, String>> = BTreeMap::new();
        for role in Role::ALL {
            let image_var = format!("CRUCIBLE_{}_IMAGE", role.env_prefix());
            if let Some(image) = vars.get(&image_var) {
                images.insert(role, image.clone());
            }

            let env_prefix = format!("CRUCIBLE_{}_ENV_", role.env_prefix());
            for (name, value) in vars {
                if let Some(key) = name.strip_prefix(&env_prefix).filter(|k| !k.is_empty()) {
                    overrides
                        .entry(role)
                        .or_default()
                        .insert(key.to_string(), value.clone());
                }
            }
        }

        let connector_secrets = vars
            .iter()
            .filter_map(|(name, value)| {
                name.strip_prefix(CONNECTOR_SECRET_PREFIX)
                    .filter(|k| !k.is_empty())
                    .map(|k| (k.to_string(), SecretString::from(value.clone())))
            })
            .collect();

        let engine_shutdown_grace = seconds_var(
            vars,
            "CRUCIBLE_ENGINE_SHUTDOWN_GRACE_SECONDS",
            defaults.engine_shutdown_grace,
        )?;
        let startup_timeout =
            seconds_var(vars, "CRUCIBLE_STARTUP_TIMEOUT_SECONDS", defaults.startup_timeout)?;
        let client_timeout =
            seconds_var(vars, "CRUCIBLE_CLIENT_TIMEOUT_SECONDS", defaults.client_timeout)?;
        let parallel_start = bool_var(vars, "CRUCIBLE_PARALLEL_START", defaults.parallel_start)?;

        let client_id = vars
            .get("CRUCIBLE_CLIENT_ID")
            .cloned()
            .unwrap_or(defaults.client_id);
        let client_secret = vars
            .get("CRUCIBLE_CLIENT_SECRET")
            .map(|s| SecretString::from(s.clone()))
            .unwrap_or(defaults.client_secret);
        let client_audience = vars
            .get("CRUCIBLE_CLIENT_AUDIENCE")
            .cloned()
            .unwrap_or(defaults.client_audience);

        Ok(Self {
            scope,
            flags,
            images,
            overrides,
            connector_secrets,
            engine_shutdown_grace,
            startup_timeout,
            parallel_start,
            client_id,
            client_secret,
            client_audience,
            client_timeout,
        })
    }

    /// Topology builder carrying images, overrides, secrets and the engine client.
    pub fn topology_builder(&self) -> TopologyBuilder {
        let mut builder = TopologyBuilder::new()
            .with_startup_timeout(self.startup_timeout)
            .with_connector_secrets(self.connector_secrets.clone())
            .with_engine_client(
                self.client_id.clone(),
                self.client_secret.clone(),
                self.client_audience.clone(),
            );

        for (role, image) in &self.images {
            builder = builder.with_image(*role, image.clone());
        }
        for (role, entries) in &self.overrides {
            for (key, value) in entries {
                builder = builder.with_override(*role, key.clone(), value.clone());
            }
        }
        builder
    }

    pub fn lifecycle_settings(&self) -> LifecycleSettings {
        LifecycleSettings {
            engine_shutdown_grace: self.engine_shutdown_grace,
            parallel_start: self.parallel_start,
        }
    }
}

fn invalid(name: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        name: name.to_string(),
        value: value.to_string(),
    }
}

fn bool_var(
    vars: &HashMap<String, String>,
    name: &str,
    default: bool,
) -> Result<bool, ConfigError> {
    match vars.get(name) {
        Some(value) => parse_bool(value).ok_or_else(|| invalid(name, value)),
        None => Ok(default),
    }
}

fn seconds_var(
    vars: &HashMap<String, String>,
    name: &str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match vars.get(name) {
        Some(value) => value
            .trim()
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| invalid(name, value)),
        None => Ok(default),
    }
}
