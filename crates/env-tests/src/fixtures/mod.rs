//! Test fixtures for interacting with environment services.

pub mod actuator;
pub mod index_store;

pub use actuator::ActuatorClient;
pub use index_store::IndexStoreClient;
