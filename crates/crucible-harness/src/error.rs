//! Error taxonomy of the environment orchestrator.

use crate::client::ClientError;
use crate::config::ConfigError;
use crate::lifecycle::EnvironmentState;
use crate::role::Role;
use crate::runtime::RuntimeError;
use thiserror::Error;

/// Errors surfaced by the orchestrator to test code.
///
/// Cloneable so a failed scope can hand the same error to every caller.
#[derive(Debug, Error, Clone)]
pub enum HarnessError {
    /// The requested variant combination has no descriptor set.
    /// Raised before any resource is acquired.
    #[error("Invalid topology: {0}")]
    InvalidTopology(String),

    /// A role did not become ready. Already started roles were rolled back.
    #[error("Role {role} failed to start: {cause}")]
    StartupFailed {
        role: Role,
        #[source]
        cause: RuntimeError,
    },

    /// Address requested outside the running state, or for a role the
    /// environment does not contain.
    #[error("Role {role} is not started")]
    RoleNotStarted { role: Role },

    /// A fixture field could not be populated. Fails only the affected test.
    #[error("Failed to inject field '{field}': {cause}")]
    InjectionFailed { field: String, cause: String },

    /// A lifecycle operation was called in the wrong state.
    #[error("Invalid environment state: expected {expected}, found {actual}")]
    InvalidState {
        expected: EnvironmentState,
        actual: EnvironmentState,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("Client error: {0}")]
    Client(#[from] ClientError),
}

/// Result type alias using `HarnessError`.
pub type Result<T> = std::result::Result<T, HarnessError>;
