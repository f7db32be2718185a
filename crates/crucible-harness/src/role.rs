//! Service roles an environment can contain.

use std::fmt;

/// A named kind of service in a test environment.
///
/// The declaration order is the order roles take inside one start tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Role {
    /// Search/index store the engine exports records into.
    IndexStore,
    /// The workflow engine (broker + gateway).
    Engine,
    /// Primary web app, reads engine records from the index store.
    Operate,
    /// Secondary web app for user tasks.
    Tasklist,
    /// Connector runtime.
    Connectors,
    /// Relational store backing the identity provider.
    RelationalStore,
    /// OpenID Connect provider issuing client tokens.
    Keycloak,
    /// Identity service managing tenants and authorizations.
    Identity,
}

impl Role {
    /// Every role, in tier order.
    pub const ALL: [Role; 8] = [
        Role::IndexStore,
        Role::Engine,
        Role::Operate,
        Role::Tasklist,
        Role::Connectors,
        Role::RelationalStore,
        Role::Keycloak,
        Role::Identity,
    ];

    /// Stable lowercase name, also used as the default network alias.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::IndexStore => "index-store",
            Role::Engine => "engine",
            Role::Operate => "operate",
            Role::Tasklist => "tasklist",
            Role::Connectors => "connectors",
            Role::RelationalStore => "relational-store",
            Role::Keycloak => "keycloak",
            Role::Identity => "identity",
        }
    }

    /// Segment used in `CRUCIBLE_<ROLE>_*` configuration variables.
    #[must_use]
    pub fn env_prefix(&self) -> &'static str {
        match self {
            Role::IndexStore => "INDEX_STORE",
            Role::Engine => "ENGINE",
            Role::Operate => "OPERATE",
            Role::Tasklist => "TASKLIST",
            Role::Connectors => "CONNECTORS",
            Role::RelationalStore => "RELATIONAL_STORE",
            Role::Keycloak => "KEYCLOAK",
            Role::Identity => "IDENTITY",
        }
    }

    /// Whether this role is one of the web apps.
    #[must_use]
    pub fn is_web_app(&self) -> bool {
        matches!(self, Role::Operate | Role::Tasklist)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
