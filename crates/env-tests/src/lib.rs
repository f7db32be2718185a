//! Environment Integration Test Suite
//!
//! Runs the harness against a real Docker daemon: every suite provisions its
//! own environment through [`crucible_harness::EnvironmentExtension`] backed
//! by the Docker runtime and tears it down at the end.
//!
//! # Features
//!
//! - `smoke`: Minimal environment health (engine + index store)
//! - `flows`: Deploy, start and export flows
//! - `connectors`: Connector runtime variant
//! - `identity`: Identity-enabled variant with authenticated clients
//! - `all`: Enable all test categories
//!
//! # Prerequisites
//!
//! 1. Docker daemon reachable by the `docker` CLI
//! 2. Images pullable (or overridden via `CRUCIBLE_<ROLE>_IMAGE`)
//!
//! # Usage
//!
//! ```bash
//! # From repo root - runs 0 env-tests (no default features)
//! cargo test
//!
//! # Smoke tests only
//! cargo test -p env-tests --features smoke
//!
//! # Full suite
//! cargo test -p env-tests --features all
//! ```

pub mod eventual;
pub mod fixtures;
pub mod suite;
