pub mod engine;
pub mod memory;
pub mod persistence;

pub use engine::DataStore;
pub use memory::MemoryDataStore;
pub use persistence::{DurabilityMode, PersistenceManager};
