//! Per-task subscriber registry: a channel per live client, not a single
//! broadcast (mirrors the teacher's `ConnectionsMap` — per-session delivery,
//! no fan-out through one shared queue) (spec.md §4.F "Subscriber registry").

use std::collections::HashMap;
use std::sync::Arc;

use rsrch_protocol::EngineError;
use tokio::sync::{mpsc, RwLock};

use rsrch_pipeline::PipelineEvent;

const MAX_SUBSCRIBERS_PER_TASK: usize = 100;

type TaskSubscribers = Vec<mpsc::Sender<PipelineEvent>>;

#[derive(Default)]
pub struct SubscriberRegistry {
    by_task: RwLock<HashMap<String, TaskSubscribers>>,
    max_total: usize,
}

impl SubscriberRegistry {
    /// `max_total` is `2 * max_tasks` per spec.md §4.F.
    pub fn new(max_total: usize) -> Self {
        Self {
            by_task: RwLock::new(HashMap::new()),
            max_total,
        }
    }

    pub async fn total_count(&self) -> usize {
        self.by_task.read().await.values().map(Vec::len).sum()
    }

    pub async fn count_for(&self, task_id: &str) -> usize {
        self.by_task
            .read()
            .await
            .get(task_id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Register a new subscriber, enforcing the per-task and total caps.
    pub async fn register(
        &self,
        task_id: &str,
        buffer: usize,
    ) -> Result<(mpsc::Sender<PipelineEvent>, mpsc::Receiver<PipelineEvent>), EngineError> {
        let mut guard = self.by_task.write().await;
        let total: usize = guard.values().map(Vec::len).sum();
        if total >= self.max_total {
            return Err(EngineError::TooManyConnections(task_id.to_string()));
        }
        let entry = guard.entry(task_id.to_string()).or_default();
        if entry.len() >= MAX_SUBSCRIBERS_PER_TASK {
            return Err(EngineError::TooManyConnections(task_id.to_string()));
        }
        let (tx, rx) = mpsc::channel(buffer);
        entry.push(tx.clone());
        Ok((tx, rx))
    }

    /// Drop a subscriber's sender handle. Removing the task's entry once
    /// empty lets `count_for` reflect zero rather than an empty vec forever.
    pub async fn unregister(&self, task_id: &str, sender: &mpsc::Sender<PipelineEvent>) {
        let mut guard = self.by_task.write().await;
        if let Some(entry) = guard.get_mut(task_id) {
            entry.retain(|s| !s.same_channel(sender));
            if entry.is_empty() {
                guard.remove(task_id);
            }
        }
    }

    /// Fan a driver-emitted event out to every live subscriber of `task_id`.
    /// A subscriber whose channel is closed or full is dropped rather than
    /// blocking the driver — best-effort delivery per spec.md §4.G.
    pub async fn broadcast(&self, task_id: &str, event: &PipelineEvent) {
        let mut guard = self.by_task.write().await;
        if let Some(entry) = guard.get_mut(task_id) {
            entry.retain(|tx| tx.try_send(event.clone()).is_ok() || !tx.is_closed());
            if entry.is_empty() {
                guard.remove(task_id);
            }
        }
    }

    /// Drop orphaned entries whose sole senders have all closed (spec.md
    /// §4.F level-1 cleanup action).
    pub async fn drop_orphaned(&self) {
        let mut guard = self.by_task.write().await;
        guard.retain(|_, subs| {
            subs.retain(|tx| !tx.is_closed());
            !subs.is_empty()
        });
    }
}

pub type SharedSubscriberRegistry = Arc<SubscriberRegistry>;

#[cfg(test)]
mod tests {
    use super::*;
    use rsrch_protocol::TaskStep;

    #[tokio::test]
    async fn register_and_broadcast_delivers_to_all_subscribers() {
        let registry = SubscriberRegistry::new(100);
        let (_tx1, mut rx1) = registry.register("task-1", 8).await.unwrap();
        let (_tx2, mut rx2) = registry.register("task-1", 8).await.unwrap();

        registry
            .broadcast(
                "task-1",
                &PipelineEvent::StageStarted {
                    stage: TaskStep::ReportPlan,
                },
            )
            .await;

        assert!(rx1.recv().await.is_some());
        assert!(rx2.recv().await.is_some());
    }

    #[tokio::test]
    async fn per_task_cap_is_enforced() {
        let registry = SubscriberRegistry::new(1000);
        for _ in 0..MAX_SUBSCRIBERS_PER_TASK {
            registry.register("task-1", 1).await.unwrap();
        }
        assert!(registry.register("task-1", 1).await.is_err());
    }

    #[tokio::test]
    async fn total_cap_is_enforced_across_tasks() {
        let registry = SubscriberRegistry::new(2);
        registry.register("task-1", 1).await.unwrap();
        registry.register("task-2", 1).await.unwrap();
        assert!(registry.register("task-3", 1).await.is_err());
    }

    #[tokio::test]
    async fn unregister_removes_sender_and_empties_entry() {
        let registry = SubscriberRegistry::new(100);
        let (tx, _rx) = registry.register("task-1", 8).await.unwrap();
        assert_eq!(registry.count_for("task-1").await, 1);
        registry.unregister("task-1", &tx).await;
        assert_eq!(registry.count_for("task-1").await, 0);
    }
}
