//! Shared domain types for the research task execution engine: progress
//! vocabulary, completion attestation, the semantic request parameter set
//! and its fingerprint, client attribution, top-level errors, and the
//! cross-cutting provider seams (auth, notifications).

mod attestation;
mod attribution;
mod error;
mod finish_reason;
mod params;
mod provider;
mod step;

pub use attestation::{Attestation, FINAL_REPORT_CLOSE, FINAL_REPORT_OPEN, MIN_COMPLETE_BYTES};
pub use attribution::ClientAttribution;
pub use error::EngineError;
pub use finish_reason::FinishReason;
pub use params::{
    IdentityScope, MAX_TASK_ID_BYTES, RequestParams, TaskId, TaskIdError, dedup_preserve_order,
    merge_comma_lists, parse_boolish,
};
pub use provider::{
    AuthOutcome, AuthVerifier, NoopAuthVerifier, NotificationMessage, NotificationSink,
    NullNotificationSink,
};
pub use step::{AggregateStatus, StepStatus, TaskStep};
