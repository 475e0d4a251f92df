//! Convenient imports.
//!
//! ```rust,no_run
//! use rsrch_task_store::prelude::*;
//! ```

#[cfg(feature = "in-memory")]
pub use crate::in_memory::{InMemoryTaskConfig, InMemoryTaskStore};
#[cfg(feature = "sqlite")]
pub use crate::sqlite::{SqliteTaskConfig, SqliteTaskStore};

pub use crate::error::TaskStoreError;
pub use crate::state_machine::validate_transition;
pub use crate::traits::{TaskListPage, TaskRecord, TaskStore};
