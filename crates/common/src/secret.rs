//! Secret types for protecting sensitive values from accidental logging.
//!
//! Re-exports [`secrecy`] types. Crucible handles a few credentials while it
//! wires test environments together, and all of them travel as
//! [`SecretString`]:
//!
//! - OAuth client secrets used by the engine client in the identity variant
//! - access tokens fetched from the identity provider
//! - connector secrets handed to the connector runtime as environment entries
//!
//! `SecretString` implements `Debug` with redaction, so configuration structs
//! that derive `Debug` stay safe to print from test failures and `tracing`
//! events. The value is only reachable through an explicit `expose_secret()`.
//!
//! # Example
//!
//! ```rust
//! use common::secret::{ExposeSecret, SecretString};
//!
//! #[derive(Debug)]
//! struct ConnectorSecret {
//!     name: String,
//!     value: SecretString,
//! }
//!
//! let secret = ConnectorSecret {
//!     name: "SLACK_TOKEN".to_string(),
//!     value: SecretString::from("xoxb-123"),
//! };
//!
//! assert!(!format!("{secret:?}").contains("xoxb-123"));
//! assert_eq!(secret.value.expose_secret(), "xoxb-123");
//! ```

pub use secrecy::{ExposeSecret, SecretString};
