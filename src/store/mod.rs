//! Adapters from concrete backends to [`LeaseStore`](crate::interface::store::LeaseStore).

pub mod dynamo;
pub mod memory;

pub use dynamo::DynamoStore;
pub use memory::InMemoryStore;
