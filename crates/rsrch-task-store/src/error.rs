//! Unified error type for task store operations (spec.md §4.A).

#[derive(Debug, thiserror::Error)]
pub enum TaskStoreError {
    #[error("task not found: {0}")]
    NotFound(String),

    #[error("task is in terminal state and cannot be reopened: {0}")]
    TerminalState(String),

    #[error("maximum tasks limit reached: {0}")]
    MaxTasksReached(usize),

    #[error("task store unavailable: {0}")]
    Unavailable(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for TaskStoreError {
    fn from(err: serde_json::Error) -> Self {
        TaskStoreError::Serialization(err.to_string())
    }
}

#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for TaskStoreError {
    fn from(err: sqlx::Error) -> Self {
        TaskStoreError::Unavailable(err.to_string())
    }
}

impl From<TaskStoreError> for rsrch_protocol::EngineError {
    fn from(err: TaskStoreError) -> Self {
        rsrch_protocol::EngineError::StoreUnavailable(err.to_string())
    }
}
