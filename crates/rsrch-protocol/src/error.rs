//! Top-level error kinds surfaced to the caller (spec.md §7).

use thiserror::Error;

/// Errors surfaced across the engine's component boundaries.
///
/// Mirrors the teacher's `TaskStorageError` idiom: one variant per failure
/// mode, each carrying just enough context to log and to pick an HTTP
/// status / user message from.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("authentication failed")]
    AuthFailed,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("memory pressure: request rejected before spawn")]
    MemoryPressure,

    #[error("too many connections for task {0}")]
    TooManyConnections(String),

    #[error("task store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("stage failed: {stage}: {reason}")]
    StageFailed { stage: String, reason: String },

    #[error("search exhausted for query {query}: {reason}")]
    SearchExhausted { query: String, reason: String },

    #[error("API credit exhausted: {0}")]
    ApiCreditExhausted(String),
}

impl EngineError {
    /// The HTTP status this error maps to when it can be known before a
    /// stream starts (spec.md §6's three non-streaming exit codes). Errors
    /// discovered mid-stream close the SSE body instead of changing status.
    pub fn status_code(&self) -> u16 {
        match self {
            EngineError::AuthFailed => 401,
            EngineError::BadRequest(_) => 500,
            EngineError::MemoryPressure => 503,
            EngineError::TooManyConnections(_) => 503,
            EngineError::StoreUnavailable(_) => 200, // degrades, does not fail the request
            EngineError::StageFailed { .. }
            | EngineError::SearchExhausted { .. }
            | EngineError::ApiCreditExhausted(_) => 200, // surfaces inside the stream, not the status line
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_spec_table() {
        assert_eq!(EngineError::AuthFailed.status_code(), 401);
        assert_eq!(EngineError::BadRequest("x".into()).status_code(), 500);
        assert_eq!(EngineError::MemoryPressure.status_code(), 503);
    }
}
