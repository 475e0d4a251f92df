//! Task identity, lifecycle, cache adjudication, per-task output buffer,
//! subscriber registry and memory-pressure cleanup (spec.md component F).
//!
//! `TaskManager` owns everything that does not survive a process restart:
//! the in-memory record mirror, the job table, and the subscriber
//! registry. Durable state lives behind `rsrch_task_store::TaskStore`.

pub mod jobs;
pub mod manager;
pub mod memory;
pub mod recovery;
pub mod subscribers;

pub use manager::{
    CacheStatus, HealthStatus, PipelineRunner, TaskManager, TaskManagerConfig, TaskManagerStats,
};
pub use memory::{MemoryMonitor, PressureLevel};
pub use recovery::RecoveryReport;
