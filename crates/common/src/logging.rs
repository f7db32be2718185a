//! Tracing subscriber initialization.
//!
//! Test binaries call [`init_tracing`] from many tests; only the first call
//! installs the subscriber and later calls are no-ops.

use crate::config::LogConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over `config.filter`. Returns `true` if this
/// call installed the subscriber.
pub fn init_tracing(config: &LogConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);

    let installed = if config.json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_test_writer())
            .try_init()
            .is_ok()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_test_writer())
            .try_init()
            .is_ok()
    };

    if installed {
        tracing::debug!(
            target: "crucible.logging",
            filter = %config.filter,
            json = config.json,
            "Tracing initialized"
        );
    }

    installed
}

/// Install the subscriber from `CRUCIBLE_LOG_*` variables, falling back to defaults.
pub fn init_tracing_from_env() -> bool {
    let config = LogConfig::from_env().unwrap_or_default();
    init_tracing(&config)
}
