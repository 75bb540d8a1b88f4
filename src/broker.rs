//! Broker-management core
//!
//! Everything with real state lives here: the subscription registry that
//! tracks one-time and recurring query entries, and the broker manager that
//! owns the endpoint, the open-topic set and the registry.

/// Broker error types
pub mod error;
/// Broker manager facade
pub mod manager;
/// Query-entry registry
pub mod registry;

// Re-export commonly used types for convenience
pub use error::BrokerError;
pub use manager::BrokerManager;
pub use registry::{QueryEntry, QueryId, SubscriptionRegistry};
