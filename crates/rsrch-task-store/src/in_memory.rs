//! In-memory task storage backend.
//!
//! Suitable for development, testing, and single-instance deployments.
//! Records live in a `HashMap` behind an `RwLock`; secondary indexes are
//! maintained incrementally on upsert/delete so listing by status or by
//! user never requires a full scan.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use rsrch_protocol::AggregateStatus;
use tokio::sync::RwLock;

use crate::error::TaskStoreError;
use crate::state_machine;
use crate::traits::{TaskListPage, TaskRecord, TaskStore};

/// Configuration for the in-memory task storage backend.
#[derive(Debug, Clone)]
pub struct InMemoryTaskConfig {
    /// Maximum number of records to hold (0 = unlimited).
    pub max_tasks: usize,
    pub default_page_size: u32,
}

impl Default for InMemoryTaskConfig {
    fn default() -> Self {
        Self {
            max_tasks: 10_000,
            default_page_size: 50,
        }
    }
}

#[derive(Default)]
struct Indexes {
    /// task ids ordered by (last_updated_at, task_id) for stable pagination.
    by_last_update: BTreeSet<(chrono::DateTime<Utc>, String)>,
    by_user: HashMap<String, Vec<String>>,
}

/// In-memory task store. Uses `Arc<RwLock<HashMap>>` for concurrent access,
/// matching the registry pattern used throughout this codebase.
#[derive(Clone)]
pub struct InMemoryTaskStore {
    tasks: Arc<RwLock<HashMap<String, TaskRecord>>>,
    indexes: Arc<RwLock<Indexes>>,
    config: InMemoryTaskConfig,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self {
            tasks: Arc::new(RwLock::new(HashMap::new())),
            indexes: Arc::new(RwLock::new(Indexes::default())),
            config: InMemoryTaskConfig::default(),
        }
    }

    pub fn with_config(config: InMemoryTaskConfig) -> Self {
        Self {
            tasks: Arc::new(RwLock::new(HashMap::new())),
            indexes: Arc::new(RwLock::new(Indexes::default())),
            config,
        }
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

fn remove_from_index(idx: &mut Indexes, record: &TaskRecord) {
    idx.by_last_update
        .remove(&(record.last_updated_at, record.task_id.to_string()));
    if let Some(user_id) = record.attribution.as_ref().and_then(|a| a.user_id.as_deref()) {
        if let Some(ids) = idx.by_user.get_mut(user_id) {
            ids.retain(|id| id != record.task_id.as_str());
        }
    }
}

fn insert_into_index(idx: &mut Indexes, record: &TaskRecord) {
    idx.by_last_update
        .insert((record.last_updated_at, record.task_id.to_string()));
    if let Some(user_id) = record.attribution.as_ref().and_then(|a| a.user_id.as_deref()) {
        idx.by_user
            .entry(user_id.to_string())
            .or_default()
            .push(record.task_id.to_string());
    }
}

fn paginate(
    ids_in_order: Vec<String>,
    tasks: &HashMap<String, TaskRecord>,
    cursor: Option<&str>,
    limit: usize,
) -> TaskListPage {
    let start = if let Some(cursor_id) = cursor {
        ids_in_order
            .iter()
            .position(|id| id == cursor_id)
            .map(|pos| pos + 1)
            .unwrap_or(0)
    } else {
        0
    };

    let page: Vec<TaskRecord> = ids_in_order
        .iter()
        .skip(start)
        .take(limit)
        .filter_map(|id| tasks.get(id).cloned())
        .collect();

    let next_cursor = if start + limit < ids_in_order.len() {
        page.last().map(|t| t.task_id.to_string())
    } else {
        None
    };

    TaskListPage {
        tasks: page,
        next_cursor,
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    fn backend_name(&self) -> &'static str {
        "in-memory"
    }

    async fn upsert(&self, mut record: TaskRecord) -> Result<TaskRecord, TaskStoreError> {
        let mut tasks = self.tasks.write().await;
        let mut idx = self.indexes.write().await;

        if !tasks.contains_key(record.task_id.as_str())
            && self.config.max_tasks > 0
            && tasks.len() >= self.config.max_tasks
        {
            return Err(TaskStoreError::MaxTasksReached(self.config.max_tasks));
        }

        if let Some(existing) = tasks.get(record.task_id.as_str()) {
            state_machine::validate_transition(existing.status, record.status)
                .or_else(|err| if existing.status == record.status { Ok(()) } else { Err(err) })?;
            remove_from_index(&mut idx, existing);
        }

        record.bump_version();
        tasks.insert(record.task_id.to_string(), record.clone());
        insert_into_index(&mut idx, &record);

        Ok(record)
    }

    async fn get(&self, task_id: &str) -> Result<Option<TaskRecord>, TaskStoreError> {
        let tasks = self.tasks.read().await;
        Ok(tasks.get(task_id).cloned())
    }

    async fn list(
        &self,
        cursor: Option<&str>,
        limit: Option<u32>,
    ) -> Result<TaskListPage, TaskStoreError> {
        let tasks = self.tasks.read().await;
        let idx = self.indexes.read().await;
        let limit = limit.unwrap_or(self.config.default_page_size) as usize;

        let ordered: Vec<String> = idx.by_last_update.iter().map(|(_, id)| id.clone()).collect();
        Ok(paginate(ordered, &tasks, cursor, limit))
    }

    async fn rename(&self, task_id: &str, archived_id: &str) -> Result<(), TaskStoreError> {
        let mut tasks = self.tasks.write().await;
        let mut idx = self.indexes.write().await;

        let mut record = tasks
            .remove(task_id)
            .ok_or_else(|| TaskStoreError::NotFound(task_id.to_string()))?;
        remove_from_index(&mut idx, &record);

        record.task_id = rsrch_protocol::TaskId::new(archived_id.to_string())
            .map_err(|e| TaskStoreError::Serialization(e.to_string()))?;
        insert_into_index(&mut idx, &record);
        tasks.insert(archived_id.to_string(), record);

        Ok(())
    }

    async fn delete(&self, task_id: &str) -> Result<bool, TaskStoreError> {
        let mut tasks = self.tasks.write().await;
        let mut idx = self.indexes.write().await;
        if let Some(record) = tasks.remove(task_id) {
            remove_from_index(&mut idx, &record);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn count_by_status(&self) -> Result<Vec<(AggregateStatus, usize)>, TaskStoreError> {
        let tasks = self.tasks.read().await;
        let mut counts: HashMap<AggregateStatus, usize> = HashMap::new();
        for record in tasks.values() {
            *counts.entry(record.status).or_insert(0) += 1;
        }
        Ok(counts.into_iter().collect())
    }

    async fn purge_older_than(&self, max_age: Duration) -> Result<usize, TaskStoreError> {
        let mut tasks = self.tasks.write().await;
        let mut idx = self.indexes.write().await;
        let cutoff = Utc::now() - max_age;

        let stale: Vec<String> = tasks
            .values()
            .filter(|t| t.status.is_terminal() && t.last_updated_at < cutoff)
            .map(|t| t.task_id.to_string())
            .collect();

        for id in &stale {
            if let Some(record) = tasks.remove(id) {
                remove_from_index(&mut idx, &record);
            }
        }

        Ok(stale.len())
    }

    async fn list_for_user(
        &self,
        user_id: &str,
        cursor: Option<&str>,
        limit: Option<u32>,
    ) -> Result<TaskListPage, TaskStoreError> {
        let tasks = self.tasks.read().await;
        let idx = self.indexes.read().await;
        let limit = limit.unwrap_or(self.config.default_page_size) as usize;

        let mut ids = idx.by_user.get(user_id).cloned().unwrap_or_default();
        ids.sort_by(|a, b| {
            let ta = tasks.get(a).map(|t| t.last_updated_at);
            let tb = tasks.get(b).map(|t| t.last_updated_at);
            ta.cmp(&tb).then_with(|| a.cmp(b))
        });

        Ok(paginate(ids, &tasks, cursor, limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsrch_protocol::{ClientAttribution, RequestParams, TaskId};

    fn make_record(id: &str, user_id: Option<&str>) -> TaskRecord {
        let attribution = user_id.map(|u| ClientAttribution {
            user_id: Some(u.to_string()),
            ..Default::default()
        });
        TaskRecord::new(TaskId::new(id.to_string()).unwrap(), RequestParams::default(), attribution)
    }

    #[tokio::test]
    async fn upsert_then_get_round_trips() {
        let store = InMemoryTaskStore::new();
        let record = make_record("task-1", None);
        store.upsert(record).await.unwrap();

        let fetched = store.get("task-1").await.unwrap();
        assert!(fetched.is_some());
        assert_eq!(fetched.unwrap().task_id.as_str(), "task-1");
    }

    #[tokio::test]
    async fn get_nonexistent_returns_none() {
        let store = InMemoryTaskStore::new();
        assert!(store.get("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn terminal_transition_is_rejected_on_upsert() {
        let store = InMemoryTaskStore::new();
        let mut record = make_record("task-done", None);
        record.status = AggregateStatus::Completed;
        store.upsert(record.clone()).await.unwrap();

        record.status = AggregateStatus::Running;
        let result = store.upsert(record).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn rename_moves_record_to_archived_id() {
        let store = InMemoryTaskStore::new();
        store.upsert(make_record("task-a", None)).await.unwrap();
        store.rename("task-a", "task-a-archived-2026").await.unwrap();

        assert!(store.get("task-a").await.unwrap().is_none());
        let archived = store.get("task-a-archived-2026").await.unwrap();
        assert!(archived.is_some());
    }

    #[tokio::test]
    async fn list_for_user_filters_and_paginates() {
        let store = InMemoryTaskStore::new();
        store.upsert(make_record("task-a", Some("alice"))).await.unwrap();
        store.upsert(make_record("task-b", Some("alice"))).await.unwrap();
        store.upsert(make_record("task-c", Some("bob"))).await.unwrap();

        let page = store.list_for_user("alice", None, None).await.unwrap();
        assert_eq!(page.tasks.len(), 2);

        let empty = store.list_for_user("carol", None, None).await.unwrap();
        assert_eq!(empty.tasks.len(), 0);
    }

    #[tokio::test]
    async fn purge_older_than_removes_only_terminal_and_stale() {
        let store = InMemoryTaskStore::new();
        let mut old_done = make_record("old-done", None);
        old_done.status = AggregateStatus::Completed;
        old_done.last_updated_at = Utc::now() - Duration::days(30);
        store.upsert(old_done).await.unwrap();

        store.upsert(make_record("fresh-running", None)).await.unwrap();

        let purged = store.purge_older_than(Duration::days(7)).await.unwrap();
        assert_eq!(purged, 1);
        assert!(store.get("old-done").await.unwrap().is_none());
        assert!(store.get("fresh-running").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn max_tasks_limit_is_enforced() {
        let store = InMemoryTaskStore::with_config(InMemoryTaskConfig {
            max_tasks: 1,
            default_page_size: 50,
        });
        store.upsert(make_record("task-1", None)).await.unwrap();
        let result = store.upsert(make_record("task-2", None)).await;
        assert!(matches!(result, Err(TaskStoreError::MaxTasksReached(1))));
    }
}
