//! `TaskManager`: identity/fingerprinting, cache adjudication, archival,
//! the job table, the subscriber registry and memory-pressure cleanup
//! (spec.md §4.F). The single conceptual lock the spec describes is, in
//! this implementation, the `records` map's `RwLock` — archival, delete
//! and the cleanup pass all take its write half for their whole critical
//! section so they stay atomic w.r.t. each other.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use rsrch_protocol::{
    AggregateStatus, ClientAttribution, EngineError, FinishReason, RequestParams, TaskId,
};
use rsrch_retry::{RetryAction, RetryPolicy};
use rsrch_task_store::{TaskRecord, TaskStore};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{info_span, warn, Instrument};

use crate::jobs::JobTable;
use crate::memory::{MemoryMonitor, PressureLevel};
use crate::recovery::{recover, RecoveryReport};
use crate::subscribers::SubscriberRegistry;
use rsrch_pipeline::PipelineEvent;

const OVERSIZE_BUFFER_ENTRIES: usize = 1000;
const OVERSIZE_KEEP_FRACTION: f64 = 0.80;
const AGE_EVICTION_DAYS: i64 = 7;
const AGE_EVICTION_FILL_RATIO: f64 = 0.80;
const LEVEL2_COMPLETED_MAX_AGE_HOURS: i64 = 2;
const LEVEL3_COMPLETED_MAX_AGE_DAYS: i64 = 1;
const LEVEL3_DELETE_FRACTION: f64 = 0.50;
const EVENT_CHANNEL_BUFFER: usize = 256;

/// The seam `TaskManager` drives the pipeline through — implemented for
/// `rsrch_pipeline::PipelineDriver` below, and fakeable in tests.
#[async_trait]
pub trait PipelineRunner: Send + Sync {
    async fn run(
        &self,
        task_id: &TaskId,
        query: &str,
        events: mpsc::Sender<PipelineEvent>,
    ) -> Result<String, EngineError>;
}

#[async_trait]
impl PipelineRunner for rsrch_pipeline::PipelineDriver {
    async fn run(
        &self,
        task_id: &TaskId,
        query: &str,
        events: mpsc::Sender<PipelineEvent>,
    ) -> Result<String, EngineError> {
        rsrch_pipeline::PipelineDriver::run(self, task_id, query, events).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Valid,
    Running,
    Invalid,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone)]
pub struct TaskManagerStats {
    pub counts_by_status: Vec<(AggregateStatus, usize)>,
    pub total_subscribers: usize,
    pub memory_used_bytes: u64,
    pub memory_budget_bytes: u64,
    pub health: HealthStatus,
}

#[derive(Debug, Clone)]
pub struct TaskManagerConfig {
    pub max_tasks: usize,
}

impl Default for TaskManagerConfig {
    fn default() -> Self {
        Self { max_tasks: 1000 }
    }
}

pub struct TaskManager {
    store: Arc<dyn TaskStore>,
    records: RwLock<HashMap<String, TaskRecord>>,
    jobs: JobTable,
    subscribers: SubscriberRegistry,
    memory: Mutex<MemoryMonitor>,
    retry: Mutex<RetryPolicy>,
    config: TaskManagerConfig,
}

impl TaskManager {
    pub fn new(store: Arc<dyn TaskStore>, config: TaskManagerConfig) -> Self {
        let max_subscribers_total = config.max_tasks * 2;
        Self {
            store,
            records: RwLock::new(HashMap::new()),
            jobs: JobTable::new(),
            subscribers: SubscriberRegistry::new(max_subscribers_total),
            memory: Mutex::new(MemoryMonitor::new()),
            retry: Mutex::new(RetryPolicy::new()),
            config,
        }
    }

    /// Load every record from the store into memory and classify recovery
    /// actions for anything left `running` from a prior process (spec.md
    /// §4.F startup path).
    pub async fn recover_on_startup(&self) -> Result<RecoveryReport, EngineError> {
        let mut all_records = Vec::new();
        let mut cursor = None;
        loop {
            let page = self.store.list(cursor.as_deref(), Some(200)).await?;
            let done = page.next_cursor.is_none();
            cursor = page.next_cursor;
            all_records.extend(page.tasks);
            if done {
                break;
            }
        }

        let (abandoned_ids, report) = recover(&all_records, Utc::now());

        let mut guard = self.records.write().await;
        for mut record in all_records {
            if abandoned_ids.contains(&record.task_id.as_str().to_string()) {
                record.status = AggregateStatus::Failed;
                record.attestation.step_status = rsrch_protocol::StepStatus::Failed;
                record.attestation.finish_reason = FinishReason::Error;
                record.bump_version();
                let _ = self.store.upsert(record.clone()).await;
            }
            guard.insert(record.task_id.as_str().to_string(), record);
        }

        if !report.is_clean() {
            warn!(message = %report.format_message(), "task manager recovery");
        }

        Ok(report)
    }

    pub fn fingerprint(&self, params: &RequestParams) -> TaskId {
        params.fingerprint()
    }

    #[cfg(test)]
    pub async fn jobs_len_for_test(&self) -> usize {
        self.jobs.len().await
    }

    pub async fn validate(&self, task_id: &str) -> CacheStatus {
        let guard = self.records.read().await;
        let Some(record) = guard.get(task_id) else {
            return CacheStatus::Unknown;
        };
        if record.attestation.is_valid_complete {
            CacheStatus::Valid
        } else if record.status == AggregateStatus::Running && self.jobs.is_running(task_id).await
        {
            CacheStatus::Running
        } else {
            CacheStatus::Invalid
        }
    }

    pub async fn get_record(&self, task_id: &str) -> Option<TaskRecord> {
        self.records.read().await.get(task_id).cloned()
    }

    /// Rename the record to its archived id in the store and drop every
    /// piece of in-memory state for `task_id` (spec.md §4.F "Archival").
    pub async fn archive(&self, task_id: &str) -> Result<(), EngineError> {
        let mut guard = self.records.write().await;
        if let Some(record) = guard.remove(task_id) {
            let archived_id = record.task_id.archived(Utc::now());
            self.store.rename(task_id, &archived_id).await?;
        }
        drop(guard);
        self.jobs.remove(task_id).await;
        self.subscribers.drop_orphaned().await;
        Ok(())
    }

    /// Idempotently start a background pipeline job for `task_id`. Fails
    /// fast with `MemoryPressure` at pressure level 3 (spec.md §4.F).
    pub async fn start_background_task(
        self: &Arc<Self>,
        task_id: TaskId,
        query: String,
        params: RequestParams,
        attribution: Option<ClientAttribution>,
        runner: Arc<dyn PipelineRunner>,
    ) -> Result<(), EngineError> {
        {
            let mut mem = self.memory.lock().await;
            if mem.sample() == PressureLevel::Critical {
                return Err(EngineError::MemoryPressure);
            }
        }

        let task_id_str = task_id.as_str().to_string();
        if self.jobs.is_running(&task_id_str).await {
            return Ok(());
        }

        {
            let mut guard = self.records.write().await;
            guard
                .entry(task_id_str.clone())
                .or_insert_with(|| TaskRecord::new(task_id.clone(), params, attribution));
        }
        if let Some(record) = self.records.read().await.get(&task_id_str).cloned() {
            self.persist(&record).await;
        }

        let manager = Arc::clone(self);
        let span = info_span!("task_job", task_id = %task_id_str);
        let handle = tokio::spawn(
            async move { manager.drive_job(task_id, query, runner).await }.instrument(span),
        );
        self.jobs.insert_if_absent(&task_id_str, handle).await;
        Ok(())
    }

    async fn drive_job(
        self: Arc<Self>,
        task_id: TaskId,
        query: String,
        runner: Arc<dyn PipelineRunner>,
    ) {
        let (tx, mut rx) = mpsc::channel(EVENT_CHANNEL_BUFFER);
        let task_id_str = task_id.as_str().to_string();

        let runner_task_id = task_id.clone();
        let run_handle =
            tokio::spawn(async move { runner.run(&runner_task_id, &query, tx).await });

        while let Some(event) = rx.recv().await {
            self.apply_event(&task_id_str, event).await;
        }

        let result = run_handle.await.unwrap_or_else(|join_err| {
            Err(EngineError::StageFailed {
                stage: "unknown".to_string(),
                reason: format!("pipeline task panicked: {join_err}"),
            })
        });

        self.finalize(&task_id_str, result).await;
        self.jobs.remove(&task_id_str).await;
    }

    async fn apply_event(&self, task_id: &str, event: PipelineEvent) {
        {
            let mut guard = self.records.write().await;
            if let Some(record) = guard.get_mut(task_id) {
                match &event {
                    PipelineEvent::StageStarted { stage } => {
                        record.attestation.step = *stage;
                        record.attestation.step_status = rsrch_protocol::StepStatus::Running;
                    }
                    PipelineEvent::Chunk { text, .. } => {
                        record.buffer.push(text.clone());
                        let concat = record.buffer_concat();
                        record.attestation.recompute_valid_complete(&concat);
                    }
                    PipelineEvent::StageEnded { stage, percentage } => {
                        record.attestation.step = *stage;
                        record.attestation.step_status = rsrch_protocol::StepStatus::Completed;
                        record.attestation.last_step_completed_at = Some(Utc::now());
                        record.percentage = *percentage;
                    }
                    PipelineEvent::Failed { .. } => {}
                }
                record.bump_version();
            }
        }
        if let Some(record) = self.records.read().await.get(task_id).cloned() {
            self.persist(&record).await;
        }
        self.subscribers.broadcast(task_id, &event).await;
    }

    async fn finalize(&self, task_id: &str, result: Result<String, EngineError>) {
        let mut guard = self.records.write().await;
        let Some(record) = guard.get_mut(task_id) else {
            return;
        };
        match result {
            Ok(_) => {
                record.status = AggregateStatus::Completed;
                record.attestation.step_status = rsrch_protocol::StepStatus::Completed;
                record.attestation.finish_reason = FinishReason::Stop;
                record.percentage = 100;
            }
            Err(e) => {
                record.status = AggregateStatus::Failed;
                record.attestation.step_status = rsrch_protocol::StepStatus::Failed;
                record.attestation.finish_reason = FinishReason::Error;
                warn!(task_id = %task_id, error = %e, "pipeline job finished with an error");
            }
        }
        let concat = record.buffer_concat();
        record.attestation.recompute_valid_complete(&concat);
        record.bump_version();
        let record_clone = record.clone();
        drop(guard);
        self.persist(&record_clone).await;
    }

    /// Register a new subscriber for `task_id`, replaying the buffered
    /// output so far before returning the live channel (spec.md §4.G
    /// "replay the current buffer, then ... subscribe for new chunks").
    pub async fn register_subscriber(
        &self,
        task_id: &str,
    ) -> Result<(Vec<String>, mpsc::Sender<PipelineEvent>, mpsc::Receiver<PipelineEvent>), EngineError>
    {
        let replay = self
            .records
            .read()
            .await
            .get(task_id)
            .map(|r| r.buffer.clone())
            .unwrap_or_default();
        let (tx, rx) = self.subscribers.register(task_id, EVENT_CHANNEL_BUFFER).await?;
        Ok((replay, tx, rx))
    }

    pub async fn unregister_subscriber(&self, task_id: &str, sender: &mpsc::Sender<PipelineEvent>) {
        self.subscribers.unregister(task_id, sender).await;
    }

    async fn persist(&self, record: &TaskRecord) {
        if let Err(e) = self.store.upsert(record.clone()).await {
            let task_id = record.task_id.as_str();
            let mut policy = self.retry.lock().await;
            match policy.decide(&e.to_string(), "task_store.upsert", Some(task_id)) {
                RetryAction::Retry { delay } => {
                    drop(policy);
                    tokio::time::sleep(delay).await;
                    if self.store.upsert(record.clone()).await.is_ok() {
                        self.retry
                            .lock()
                            .await
                            .record_success(Some(task_id), "task_store.upsert");
                    } else {
                        warn!(task_id, "task store unavailable after retry, continuing in-memory only");
                    }
                }
                _ => {
                    warn!(task_id, error = %e, "task store unavailable, continuing in-memory only");
                }
            }
        }
    }

    pub async fn stats(&self) -> TaskManagerStats {
        let guard = self.records.read().await;
        let mut counts: HashMap<AggregateStatus, usize> = HashMap::new();
        for record in guard.values() {
            *counts.entry(record.status).or_insert(0) += 1;
        }
        let total: usize = counts.values().sum();
        let failed = counts.get(&AggregateStatus::Failed).copied().unwrap_or(0);
        drop(guard);

        let (used, budget, level) = {
            let mut mem = self.memory.lock().await;
            let level = mem.sample();
            (mem.used_bytes(), mem.budget(), level)
        };
        let failure_rate = if total == 0 {
            0.0
        } else {
            failed as f64 / total as f64
        };
        let mut health = match level {
            PressureLevel::Normal | PressureLevel::Elevated => HealthStatus::Healthy,
            PressureLevel::High => HealthStatus::Warning,
            PressureLevel::Critical => HealthStatus::Critical,
        };
        if failure_rate > 0.10 && health == HealthStatus::Healthy {
            health = HealthStatus::Warning;
        }

        TaskManagerStats {
            counts_by_status: counts.into_iter().collect(),
            total_subscribers: self.subscribers.total_count().await,
            memory_used_bytes: used,
            memory_budget_bytes: budget,
            health,
        }
    }

    /// One cleanup tick: trims oversize buffers and drops orphaned
    /// subscribers at level ≥ 1, deletes aged completed tasks at level ≥ 2,
    /// and aggressively reclaims at level 3 (spec.md §4.F). Age eviction
    /// runs unconditionally once capacity pressure, not memory pressure,
    /// crosses its own threshold.
    pub async fn run_cleanup_pass(&self) {
        let level = self.memory.lock().await.sample();

        if level.as_u8() >= 1 {
            self.trim_oversize_buffers().await;
            self.subscribers.drop_orphaned().await;
        }
        if level.as_u8() >= 2 {
            self.delete_terminal_older_than(ChronoDuration::hours(LEVEL2_COMPLETED_MAX_AGE_HOURS), None)
                .await;
        }
        if level.as_u8() >= 3 {
            self.delete_terminal_older_than(
                ChronoDuration::days(LEVEL3_COMPLETED_MAX_AGE_DAYS),
                Some(LEVEL3_DELETE_FRACTION),
            )
            .await;
            warn!("memory pressure critical: hinting runtime to reclaim");
        }

        self.enforce_age_eviction().await;
    }

    async fn trim_oversize_buffers(&self) {
        let mut guard = self.records.write().await;
        for record in guard.values_mut() {
            if record.buffer.len() > OVERSIZE_BUFFER_ENTRIES {
                let keep_from =
                    record.buffer.len() - (record.buffer.len() as f64 * OVERSIZE_KEEP_FRACTION) as usize;
                record.buffer.drain(0..keep_from);
                record.bump_version();
            }
        }
    }

    async fn delete_terminal_older_than(
        &self,
        max_age: ChronoDuration,
        max_fraction: Option<f64>,
    ) {
        let now = Utc::now();
        let mut candidates: Vec<String> = {
            let guard = self.records.read().await;
            guard
                .values()
                .filter(|r| r.status.is_terminal() && now - r.last_updated_at > max_age)
                .map(|r| r.task_id.as_str().to_string())
                .collect()
        };
        candidates.sort();

        if let Some(fraction) = max_fraction {
            let limit = (candidates.len() as f64 * fraction).ceil() as usize;
            candidates.truncate(limit);
        }

        for task_id in candidates {
            self.delete_task(&task_id).await;
        }
    }

    async fn enforce_age_eviction(&self) {
        let now = Utc::now();
        let fill_threshold = (self.config.max_tasks as f64 * AGE_EVICTION_FILL_RATIO) as usize;
        let mut candidates: Vec<(chrono::DateTime<Utc>, String)> = {
            let guard = self.records.read().await;
            if guard.len() <= fill_threshold {
                return;
            }
            guard
                .values()
                .filter(|r| {
                    r.status == AggregateStatus::Completed
                        && now - r.last_updated_at > ChronoDuration::days(AGE_EVICTION_DAYS)
                })
                .map(|r| (r.last_updated_at, r.task_id.as_str().to_string()))
                .collect()
        };
        candidates.sort_by_key(|(ts, _)| *ts);
        for (_, task_id) in candidates {
            self.delete_task(&task_id).await;
        }
    }

    async fn delete_task(&self, task_id: &str) {
        self.records.write().await.remove(task_id);
        self.jobs.remove(task_id).await;
        let _ = self.store.delete(task_id).await;
    }
}
