//! Core task store trait and the `TaskRecord` persistence model
//! (spec.md §3, §4.A).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rsrch_protocol::{AggregateStatus, Attestation, ClientAttribution, RequestParams, TaskId};
use serde::{Deserialize, Serialize};

use crate::error::TaskStoreError;

/// Persistence model for a task (spec.md §3 "Task Record").
///
/// Contains only serializable fields — job handles, subscriber channels,
/// and other runtime-only state live in `rsrch-task-manager`, never here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,

    pub status: AggregateStatus,
    /// 0-100, monotonically non-decreasing within a task (spec.md §3).
    pub percentage: u8,

    pub attestation: Attestation,

    /// Ordered, append-only output chunks (spec.md §3 invariant — in-place
    /// mutation only ever happens as oversize trimming, which preserves
    /// the suffix; see `rsrch-task-manager`).
    pub buffer: Vec<String>,

    pub params: RequestParams,
    pub attribution: Option<ClientAttribution>,

    pub soft_deleted: bool,
    pub version: u64,
}

impl TaskRecord {
    pub fn new(task_id: TaskId, params: RequestParams, attribution: Option<ClientAttribution>) -> Self {
        let now = Utc::now();
        Self {
            task_id,
            created_at: now,
            last_updated_at: now,
            status: AggregateStatus::Running,
            percentage: 0,
            attestation: Attestation::initial(),
            buffer: Vec::new(),
            params,
            attribution,
            soft_deleted: false,
            version: 0,
        }
    }

    /// Concatenation of the buffer in append order — the value the
    /// attestation's length/marker checks run against (spec.md §3).
    pub fn buffer_concat(&self) -> String {
        self.buffer.concat()
    }

    pub fn bump_version(&mut self) {
        self.version += 1;
        self.last_updated_at = Utc::now();
    }
}

/// A page of tasks returned by `list`.
#[derive(Debug, Clone)]
pub struct TaskListPage {
    pub tasks: Vec<TaskRecord>,
    pub next_cursor: Option<String>,
}

/// Durable key/value store for task records (spec.md §4.A).
///
/// Implementations must be `Send + Sync`. Every operation may fail with
/// `TaskStoreError::Unavailable`; callers (the task manager) fall back to
/// in-memory state on repeated failure rather than propagating the error
/// to the client (spec.md §4.A, §7).
#[async_trait]
pub trait TaskStore: Send + Sync {
    fn backend_name(&self) -> &'static str;

    /// Atomic per-record upsert — creates if absent, replaces if present.
    async fn upsert(&self, record: TaskRecord) -> Result<TaskRecord, TaskStoreError>;

    async fn get(&self, task_id: &str) -> Result<Option<TaskRecord>, TaskStoreError>;

    /// List tasks with cursor-based pagination, ordered by last-update time.
    async fn list(
        &self,
        cursor: Option<&str>,
        limit: Option<u32>,
    ) -> Result<TaskListPage, TaskStoreError>;

    /// Rename (archive) a record to `<id>-archived-<ISO8601>`, per spec.md
    /// §3/§4.F. After this call `get(id)` returns `None` and
    /// `get(archived_id)` returns the prior record unchanged.
    async fn rename(&self, task_id: &str, archived_id: &str) -> Result<(), TaskStoreError>;

    async fn delete(&self, task_id: &str) -> Result<bool, TaskStoreError>;

    async fn count_by_status(&self) -> Result<Vec<(AggregateStatus, usize)>, TaskStoreError>;

    /// Delete completed/failed records older than the given age. Returns
    /// the number of records purged (spec.md §4.A "age-based pruning").
    async fn purge_older_than(&self, max_age: chrono::Duration) -> Result<usize, TaskStoreError>;

    /// List tasks attributed to a given user id, paginated.
    async fn list_for_user(
        &self,
        user_id: &str,
        cursor: Option<&str>,
        limit: Option<u32>,
    ) -> Result<TaskListPage, TaskStoreError>;
}
