//! Live job table: maps a task id to the background task actually running
//! its pipeline (spec.md §4.F "Job table") — at most one live job per id.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;

/// A running pipeline job. Abort-on-drop is deliberately not implemented —
/// the job outlives any one client connection (spec.md §4.G "the
/// background job continues").
pub struct JobHandle {
    handle: JoinHandle<()>,
}

impl JobHandle {
    pub fn new(handle: JoinHandle<()>) -> Self {
        Self { handle }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

#[derive(Default)]
pub struct JobTable {
    jobs: RwLock<HashMap<String, JobHandle>>,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn is_running(&self, task_id: &str) -> bool {
        self.jobs
            .read()
            .await
            .get(task_id)
            .map(|job| !job.is_finished())
            .unwrap_or(false)
    }

    /// Insert a job unless one is already present and still running —
    /// `startBackgroundTask` is idempotent on an already-present id
    /// (spec.md §4.F).
    pub async fn insert_if_absent(&self, task_id: &str, handle: JoinHandle<()>) -> bool {
        let mut guard = self.jobs.write().await;
        if let Some(existing) = guard.get(task_id) {
            if !existing.is_finished() {
                return false;
            }
        }
        guard.insert(task_id.to_string(), JobHandle::new(handle));
        true
    }

    pub async fn remove(&self, task_id: &str) {
        self.jobs.write().await.remove(task_id);
    }

    /// Drop job-table entries for jobs that have already finished — keeps
    /// the table from accumulating completed-task noise.
    pub async fn prune_finished(&self) {
        self.jobs.write().await.retain(|_, job| !job.is_finished());
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }
}

pub type SharedJobTable = Arc<JobTable>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_if_absent_rejects_duplicate_while_running() {
        let table = JobTable::new();
        let handle = tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        });
        assert!(table.insert_if_absent("task-1", handle).await);
        let handle2 = tokio::spawn(async {});
        assert!(!table.insert_if_absent("task-1", handle2).await);
    }

    #[tokio::test]
    async fn insert_if_absent_allows_replacing_a_finished_job() {
        let table = JobTable::new();
        let handle = tokio::spawn(async {});
        assert!(table.insert_if_absent("task-1", handle).await);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let handle2 = tokio::spawn(async {});
        assert!(table.insert_if_absent("task-1", handle2).await);
    }

    #[tokio::test]
    async fn prune_finished_removes_completed_jobs() {
        let table = JobTable::new();
        let handle = tokio::spawn(async {});
        table.insert_if_absent("task-1", handle).await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        table.prune_finished().await;
        assert_eq!(table.len().await, 0);
    }
}
