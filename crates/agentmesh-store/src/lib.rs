//! Durable message log for agentmesh.
//!
//! Every envelope an agent sees, inbound or outbound, is written here keyed
//! by its id. [`PersistenceLayer`] fronts a primary [`MessageStore`] with an
//! embedded fallback so that logging keeps working while the primary is
//! unreachable.

pub mod error;
pub mod layer;
pub mod memory;
pub mod sqlite;
pub mod store;

pub use error::StorageError;
pub use layer::{
    PersistenceLayer, StorageBackend, StorageHealth, StorageStats, StorageStatus, StoreReceipt,
};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use store::{MessageAnalytics, MessageStore};
