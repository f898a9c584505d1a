pub mod memory_store;
pub mod sqlite_store;
pub mod transient;

pub use memory_store::InMemoryTaskStore;
pub use sqlite_store::{SqliteOptions, SqliteTaskStore};
pub use transient::TransientRetry;
