//! # Crucible Test Utilities
//!
//! Service runtimes and fixtures for testing the harness without a
//! container engine.
//!
//! ## Modules
//!
//! - `recording_runtime` - Mock runtime that records every call and fails on script
//! - `loopback_runtime` - In-process runtime serving each role from a local listener
//! - `engine_stub` - Engine REST stub behind the loopback engine
//! - `fixtures` - BPMN resources and unique process ids
//!
//! ## Usage
//!
//! ```rust,ignore
//! use crucible_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_rollback() {
//!     let runtime = Arc::new(RecordingRuntime::builder().fail_start(Role::Operate).build());
//!     let topology = TopologyBuilder::new()
//!         .build(VariantFlags::minimal().with_web_apps(true))
//!         .unwrap();
//!
//!     let environment = Environment::new(topology, runtime.clone(), LifecycleSettings::default());
//!     assert!(environment.start().await.is_err());
//!     assert!(runtime.running_roles().is_empty());
//! }
//! ```

pub mod engine_stub;
pub mod fixtures;
pub mod loopback_runtime;
pub mod recording_runtime;

pub use engine_stub::*;
pub use fixtures::*;
pub use loopback_runtime::*;
pub use recording_runtime::*;
