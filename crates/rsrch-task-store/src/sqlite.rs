//! SQLite task storage backend.
//!
//! Persists task records across restarts. Structured sub-objects
//! (`attestation`, `buffer`, `params`, `attribution`) are stored as JSON
//! text columns — queries only ever need the top-level status/time/user
//! columns, so there is no need to normalize further.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rsrch_protocol::{AggregateStatus, Attestation, ClientAttribution, RequestParams, TaskId};
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, warn};

use crate::error::TaskStoreError;
use crate::state_machine;
use crate::traits::{TaskListPage, TaskRecord, TaskStore};

/// Configuration for SQLite task storage.
#[derive(Debug, Clone)]
pub struct SqliteTaskConfig {
    /// Database file path (use ":memory:" for an in-memory instance).
    pub database_path: PathBuf,
    pub max_connections: u32,
    /// Background purge interval in minutes.
    pub cleanup_interval_minutes: u32,
    /// Purge terminal records older than this many hours during cleanup.
    pub purge_after_hours: i64,
    pub max_tasks: usize,
    pub default_page_size: u32,
    pub create_database_if_missing: bool,
}

impl Default for SqliteTaskConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("rsrch_tasks.db"),
            max_connections: 10,
            cleanup_interval_minutes: 15,
            purge_after_hours: 24,
            max_tasks: 10_000,
            default_page_size: 50,
            create_database_if_missing: true,
        }
    }
}

/// SQLite-backed task storage implementation.
pub struct SqliteTaskStore {
    pool: SqlitePool,
    config: SqliteTaskConfig,
}

fn status_to_str(status: AggregateStatus) -> &'static str {
    match status {
        AggregateStatus::Running => "running",
        AggregateStatus::Paused => "paused",
        AggregateStatus::Completed => "completed",
        AggregateStatus::Failed => "failed",
    }
}

fn str_to_status(s: &str) -> Result<AggregateStatus, TaskStoreError> {
    match s {
        "running" => Ok(AggregateStatus::Running),
        "paused" => Ok(AggregateStatus::Paused),
        "completed" => Ok(AggregateStatus::Completed),
        "failed" => Ok(AggregateStatus::Failed),
        other => Err(TaskStoreError::Serialization(format!(
            "unknown aggregate status: {other}"
        ))),
    }
}

fn row_to_record(row: sqlx::sqlite::SqliteRow) -> Result<TaskRecord, TaskStoreError> {
    let status_str: String = row.get("status");
    let status = str_to_status(&status_str)?;

    let attestation_str: String = row.get("attestation");
    let attestation: Attestation = serde_json::from_str(&attestation_str)?;

    let buffer_str: String = row.get("buffer");
    let buffer: Vec<String> = serde_json::from_str(&buffer_str)?;

    let params_str: String = row.get("params");
    let params: RequestParams = serde_json::from_str(&params_str)?;

    let attribution: Option<ClientAttribution> =
        if let Some(attribution_str) = row.get::<Option<String>, _>("attribution") {
            Some(serde_json::from_str(&attribution_str)?)
        } else {
            None
        };

    let task_id: String = row.get("task_id");
    let created_at_str: String = row.get("created_at");
    let last_updated_at_str: String = row.get("last_updated_at");

    Ok(TaskRecord {
        task_id: TaskId::new(task_id).map_err(|e| TaskStoreError::Serialization(e.to_string()))?,
        created_at: DateTime::parse_from_rfc3339(&created_at_str)
            .map_err(|e| TaskStoreError::Serialization(e.to_string()))?
            .with_timezone(&Utc),
        last_updated_at: DateTime::parse_from_rfc3339(&last_updated_at_str)
            .map_err(|e| TaskStoreError::Serialization(e.to_string()))?
            .with_timezone(&Utc),
        status,
        percentage: row.get::<i64, _>("percentage") as u8,
        attestation,
        buffer,
        params,
        attribution,
        soft_deleted: row.get::<i64, _>("soft_deleted") != 0,
        version: row.get::<i64, _>("version") as u64,
    })
}

impl SqliteTaskStore {
    pub async fn new() -> Result<Self, TaskStoreError> {
        Self::with_config(SqliteTaskConfig::default()).await
    }

    pub async fn with_config(config: SqliteTaskConfig) -> Result<Self, TaskStoreError> {
        info!("initializing sqlite task store at {:?}", config.database_path);

        let db_path_str = config.database_path.to_string_lossy();
        let is_memory = db_path_str == ":memory:";

        if !is_memory {
            if let Some(parent) = config.database_path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| TaskStoreError::Unavailable(e.to_string()))?;
            }
        }

        let pool = if is_memory {
            let unique_name = uuid::Uuid::now_v7();
            let uri = format!("file:{unique_name}?mode=memory&cache=shared");
            SqlitePool::connect(&uri).await?
        } else {
            let connect_options = SqliteConnectOptions::new()
                .filename(&config.database_path)
                .create_if_missing(config.create_database_if_missing);
            SqlitePool::connect_with(connect_options).await?
        };

        let store = Self { pool, config };
        store.migrate().await?;
        store.start_cleanup_task();

        info!("sqlite task store ready");
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), TaskStoreError> {
        debug!("running task store migrations");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                task_id TEXT PRIMARY KEY,
                created_at TEXT NOT NULL,
                last_updated_at TEXT NOT NULL,
                status TEXT NOT NULL,
                percentage INTEGER NOT NULL DEFAULT 0,
                attestation TEXT NOT NULL,
                buffer TEXT NOT NULL,
                params TEXT NOT NULL,
                attribution TEXT,
                user_id TEXT,
                soft_deleted INTEGER NOT NULL DEFAULT 0,
                version INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_list ON tasks (last_updated_at, task_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks (status)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_tasks_user ON tasks (user_id, last_updated_at, task_id)",
        )
        .execute(&self.pool)
        .await?;

        debug!("task store migrations complete");
        Ok(())
    }

    fn start_cleanup_task(&self) {
        let pool = self.pool.clone();
        let interval_mins = self.config.cleanup_interval_minutes;
        let purge_after_hours = self.config.purge_after_hours;

        tokio::spawn(async move {
            let duration = std::time::Duration::from_secs(interval_mins as u64 * 60);
            loop {
                tokio::time::sleep(duration).await;
                if let Err(e) = run_cleanup(&pool, purge_after_hours).await {
                    warn!("task store background cleanup failed: {e}");
                }
            }
        });
    }
}

async fn run_cleanup(pool: &SqlitePool, purge_after_hours: i64) -> Result<(), TaskStoreError> {
    let cutoff = (Utc::now() - Duration::hours(purge_after_hours)).to_rfc3339();
    let deleted = sqlx::query(
        "DELETE FROM tasks WHERE status IN ('completed', 'failed') AND last_updated_at < ?",
    )
    .bind(cutoff)
    .execute(pool)
    .await?
    .rows_affected();

    if deleted > 0 {
        debug!("background cleanup purged {deleted} tasks");
    }
    Ok(())
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    async fn upsert(&self, mut record: TaskRecord) -> Result<TaskRecord, TaskStoreError> {
        let existing = self.get(record.task_id.as_str()).await?;

        if let Some(existing) = &existing {
            state_machine::validate_transition(existing.status, record.status).or_else(|err| {
                if existing.status == record.status {
                    Ok(())
                } else {
                    Err(err)
                }
            })?;
        } else if self.config.max_tasks > 0 {
            let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tasks")
                .fetch_one(&self.pool)
                .await?;
            if count as usize >= self.config.max_tasks {
                return Err(TaskStoreError::MaxTasksReached(self.config.max_tasks));
            }
        }

        record.bump_version();

        let status_str = status_to_str(record.status);
        let attestation_json = serde_json::to_string(&record.attestation)?;
        let buffer_json = serde_json::to_string(&record.buffer)?;
        let params_json = serde_json::to_string(&record.params)?;
        let attribution_json = record
            .attribution
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let user_id = record
            .attribution
            .as_ref()
            .and_then(|a| a.user_id.clone());

        sqlx::query(
            r#"
            INSERT INTO tasks (task_id, created_at, last_updated_at, status, percentage,
                                attestation, buffer, params, attribution, user_id,
                                soft_deleted, version)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(task_id) DO UPDATE SET
                last_updated_at = excluded.last_updated_at,
                status = excluded.status,
                percentage = excluded.percentage,
                attestation = excluded.attestation,
                buffer = excluded.buffer,
                params = excluded.params,
                attribution = excluded.attribution,
                user_id = excluded.user_id,
                soft_deleted = excluded.soft_deleted,
                version = excluded.version
            "#,
        )
        .bind(record.task_id.as_str())
        .bind(record.created_at.to_rfc3339())
        .bind(record.last_updated_at.to_rfc3339())
        .bind(status_str)
        .bind(record.percentage as i64)
        .bind(&attestation_json)
        .bind(&buffer_json)
        .bind(&params_json)
        .bind(&attribution_json)
        .bind(&user_id)
        .bind(record.soft_deleted as i64)
        .bind(record.version as i64)
        .execute(&self.pool)
        .await?;

        Ok(record)
    }

    async fn get(&self, task_id: &str) -> Result<Option<TaskRecord>, TaskStoreError> {
        let row = sqlx::query(
            r#"
            SELECT task_id, created_at, last_updated_at, status, percentage,
                   attestation, buffer, params, attribution, soft_deleted, version
            FROM tasks WHERE task_id = ?
            "#,
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_record).transpose()
    }

    async fn list(
        &self,
        cursor: Option<&str>,
        limit: Option<u32>,
    ) -> Result<TaskListPage, TaskStoreError> {
        let limit = limit.unwrap_or(self.config.default_page_size) as i64;

        let rows = if let Some(cursor_id) = cursor {
            let cursor_row = sqlx::query("SELECT last_updated_at FROM tasks WHERE task_id = ?")
                .bind(cursor_id)
                .fetch_optional(&self.pool)
                .await?;

            match cursor_row {
                Some(row) => {
                    let cursor_time: String = row.get("last_updated_at");
                    sqlx::query(
                        r#"
                        SELECT task_id, created_at, last_updated_at, status, percentage,
                               attestation, buffer, params, attribution, soft_deleted, version
                        FROM tasks
                        WHERE (last_updated_at, task_id) > (?, ?)
                        ORDER BY last_updated_at, task_id
                        LIMIT ?
                        "#,
                    )
                    .bind(cursor_time)
                    .bind(cursor_id)
                    .bind(limit + 1)
                    .fetch_all(&self.pool)
                    .await?
                }
                None => vec![],
            }
        } else {
            sqlx::query(
                r#"
                SELECT task_id, created_at, last_updated_at, status, percentage,
                       attestation, buffer, params, attribution, soft_deleted, version
                FROM tasks
                ORDER BY last_updated_at, task_id
                LIMIT ?
                "#,
            )
            .bind(limit + 1)
            .fetch_all(&self.pool)
            .await?
        };

        let mut tasks: Vec<TaskRecord> = rows
            .into_iter()
            .map(row_to_record)
            .collect::<Result<_, _>>()?;

        let next_cursor = if tasks.len() as i64 > limit {
            tasks.truncate(limit as usize);
            tasks.last().map(|t| t.task_id.to_string())
        } else {
            None
        };

        Ok(TaskListPage { tasks, next_cursor })
    }

    async fn rename(&self, task_id: &str, archived_id: &str) -> Result<(), TaskStoreError> {
        let rows_affected = sqlx::query("UPDATE tasks SET task_id = ? WHERE task_id = ?")
            .bind(archived_id)
            .bind(task_id)
            .execute(&self.pool)
            .await?
            .rows_affected();

        if rows_affected == 0 {
            return Err(TaskStoreError::NotFound(task_id.to_string()));
        }
        Ok(())
    }

    async fn delete(&self, task_id: &str) -> Result<bool, TaskStoreError> {
        let rows_affected = sqlx::query("DELETE FROM tasks WHERE task_id = ?")
            .bind(task_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(rows_affected > 0)
    }

    async fn count_by_status(&self) -> Result<Vec<(AggregateStatus, usize)>, TaskStoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) as n FROM tasks GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|row| {
                let status_str: String = row.get("status");
                let n: i64 = row.get("n");
                Ok((str_to_status(&status_str)?, n as usize))
            })
            .collect()
    }

    async fn purge_older_than(&self, max_age: Duration) -> Result<usize, TaskStoreError> {
        let cutoff = (Utc::now() - max_age).to_rfc3339();
        let deleted = sqlx::query(
            "DELETE FROM tasks WHERE status IN ('completed', 'failed') AND last_updated_at < ?",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(deleted as usize)
    }

    async fn list_for_user(
        &self,
        user_id: &str,
        cursor: Option<&str>,
        limit: Option<u32>,
    ) -> Result<TaskListPage, TaskStoreError> {
        let limit = limit.unwrap_or(self.config.default_page_size) as i64;

        let rows = if let Some(cursor_id) = cursor {
            let cursor_row = sqlx::query("SELECT last_updated_at FROM tasks WHERE task_id = ?")
                .bind(cursor_id)
                .fetch_optional(&self.pool)
                .await?;
            match cursor_row {
                Some(row) => {
                    let cursor_time: String = row.get("last_updated_at");
                    sqlx::query(
                        r#"
                        SELECT task_id, created_at, last_updated_at, status, percentage,
                               attestation, buffer, params, attribution, soft_deleted, version
                        FROM tasks
                        WHERE user_id = ? AND (last_updated_at, task_id) > (?, ?)
                        ORDER BY last_updated_at, task_id
                        LIMIT ?
                        "#,
                    )
                    .bind(user_id)
                    .bind(cursor_time)
                    .bind(cursor_id)
                    .bind(limit + 1)
                    .fetch_all(&self.pool)
                    .await?
                }
                None => vec![],
            }
        } else {
            sqlx::query(
                r#"
                SELECT task_id, created_at, last_updated_at, status, percentage,
                       attestation, buffer, params, attribution, soft_deleted, version
                FROM tasks
                WHERE user_id = ?
                ORDER BY last_updated_at, task_id
                LIMIT ?
                "#,
            )
            .bind(user_id)
            .bind(limit + 1)
            .fetch_all(&self.pool)
            .await?
        };

        let mut tasks: Vec<TaskRecord> = rows
            .into_iter()
            .map(row_to_record)
            .collect::<Result<_, _>>()?;

        let next_cursor = if tasks.len() as i64 > limit {
            tasks.truncate(limit as usize);
            tasks.last().map(|t| t.task_id.to_string())
        } else {
            None
        };

        Ok(TaskListPage { tasks, next_cursor })
    }
}
