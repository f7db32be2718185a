//! Logging configuration shared by Crucible crates.

use std::collections::HashMap;
use std::env;
use thiserror::Error;

/// Default filter directive when neither `RUST_LOG` nor `CRUCIBLE_LOG_LEVEL` is set.
pub const DEFAULT_LOG_FILTER: &str = "crucible_harness=info,crucible=info";

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// `EnvFilter` directive (e.g. `info`, `crucible=debug`).
    pub filter: String,
    /// Emit JSON-formatted log lines.
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_LOG_FILTER.to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LogConfigError {
    #[error("Invalid boolean for {name}: {value}")]
    InvalidBool { name: String, value: String },
}

impl LogConfig {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `LogConfigError::InvalidBool` if `CRUCIBLE_LOG_JSON` is not a boolean.
    pub fn from_env() -> Result<Self, LogConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    ///
    /// # Errors
    ///
    /// Returns `LogConfigError::InvalidBool` if `CRUCIBLE_LOG_JSON` is not a boolean.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, LogConfigError> {
        let filter = vars
            .get("CRUCIBLE_LOG_LEVEL")
            .cloned()
            .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());

        let json = match vars.get("CRUCIBLE_LOG_JSON") {
            Some(value) => parse_bool(value).ok_or_else(|| LogConfigError::InvalidBool {
                name: "CRUCIBLE_LOG_JSON".to_string(),
                value: value.clone(),
            })?,
            None => false,
        };

        Ok(Self { filter, json })
    }
}

/// Parse the boolean spellings accepted in `CRUCIBLE_*` variables.
#[must_use]
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
