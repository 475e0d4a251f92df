//! # Task Record Storage
//!
//! Pluggable durable storage for research task records: atomic upsert,
//! lookup, cursor-paginated listing, archive-rename, and age-based
//! pruning of terminal records.
//!
//! ## Architecture
//!
//! - **`TaskStore` trait**: the storage seam the task manager depends on.
//! - **`TaskRecord`**: the serializable persistence model.
//! - **`state_machine`**: enforces that terminal statuses never revert.
//! - **`InMemoryTaskStore`** / **`SqliteTaskStore`**: the two backends.

pub mod error;
#[cfg(feature = "in-memory")]
pub mod in_memory;
pub mod prelude;
pub mod state_machine;
pub mod traits;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use error::TaskStoreError;
#[cfg(feature = "in-memory")]
pub use in_memory::{InMemoryTaskConfig, InMemoryTaskStore};
pub use state_machine::validate_transition;
pub use traits::{TaskListPage, TaskRecord, TaskStore};

#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteTaskConfig, SqliteTaskStore};

/// A default in-memory task store for development and testing.
#[cfg(feature = "in-memory")]
pub fn create_default_store() -> InMemoryTaskStore {
    InMemoryTaskStore::new()
}

#[cfg(feature = "in-memory")]
pub fn create_memory_store(config: InMemoryTaskConfig) -> InMemoryTaskStore {
    InMemoryTaskStore::with_config(config)
}
