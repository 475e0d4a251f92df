//! Error classification and retry/backoff/notification policy (spec.md §4.H).

use std::collections::HashMap;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use rsrch_protocol::NotificationMessage;

const TRANSIENT_RETRY_CAP: u32 = 3;

static TRANSIENT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)connection|timeout|network|busy|locked|temporary|econnrefused|enotfound|econnreset").unwrap()
});
static STORE_SCHEMA_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)no such table").unwrap());
static MEMORY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)out of memory|heap|memory pressure|oom").unwrap());
static CREDIT_QUOTA_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)credit|balance|quota|billing|payment|insufficient|余额|欠费|配额|不足").unwrap()
});

/// How an error is categorized (spec.md §4.H).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    StoreSchema,
    MemoryPressure,
    TaskLevel,
    CreditQuota,
    Other,
}

/// What the caller should do about a classified error.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryAction {
    Retry { delay: Duration },
    FallBackToStoreless,
    TriggerPressureCleanupAndRetryOnce,
    RestartTask,
    NotifyAndFail { notification: NotificationMessage },
    Fail,
}

/// Classify an error message, given the operation it occurred in and
/// whether it's scoped to a known task. Checked in the order spec.md §4.H
/// lists them: transient, store-schema, memory, task-level, credit/quota,
/// other.
pub fn classify(message: &str, operation: &str, task_id: Option<&str>) -> ErrorClass {
    if TRANSIENT_RE.is_match(message) {
        return ErrorClass::Transient;
    }
    if STORE_SCHEMA_RE.is_match(message) {
        return ErrorClass::StoreSchema;
    }
    if MEMORY_RE.is_match(message) {
        return ErrorClass::MemoryPressure;
    }
    if task_id.is_some() && operation.to_lowercase().contains("task") {
        return ErrorClass::TaskLevel;
    }
    if CREDIT_QUOTA_RE.is_match(message) {
        return ErrorClass::CreditQuota;
    }
    ErrorClass::Other
}

/// Tracks per-`<task-id|global>-<operation>` retry counters, cleared on
/// success (spec.md §4.H).
#[derive(Default)]
pub struct RetryPolicy {
    counters: HashMap<String, u32>,
}

fn counter_key(task_id: Option<&str>, operation: &str) -> String {
    format!("{}-{operation}", task_id.unwrap_or("global"))
}

fn transient_backoff(attempt: u32) -> Duration {
    Duration::from_millis(500) * 2u32.pow(attempt.saturating_sub(1).min(10))
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&mut self, task_id: Option<&str>, operation: &str) {
        self.counters.remove(&counter_key(task_id, operation));
    }

    /// Decide what to do about an error, classifying it and consulting
    /// (and updating) this policy's retry counters.
    pub fn decide(
        &mut self,
        message: &str,
        operation: &str,
        task_id: Option<&str>,
    ) -> RetryAction {
        let class = classify(message, operation, task_id);
        let key = counter_key(task_id, operation);

        match class {
            ErrorClass::Transient => {
                let count = self.counters.entry(key).or_insert(0);
                *count += 1;
                if *count <= TRANSIENT_RETRY_CAP {
                    RetryAction::Retry {
                        delay: transient_backoff(*count),
                    }
                } else {
                    RetryAction::Fail
                }
            }
            ErrorClass::StoreSchema => RetryAction::FallBackToStoreless,
            ErrorClass::MemoryPressure => {
                let count = self.counters.entry(key).or_insert(0);
                *count += 1;
                if *count <= 1 {
                    RetryAction::TriggerPressureCleanupAndRetryOnce
                } else {
                    RetryAction::Fail
                }
            }
            ErrorClass::TaskLevel => RetryAction::RestartTask,
            ErrorClass::CreditQuota => RetryAction::NotifyAndFail {
                notification: NotificationMessage {
                    task_id: task_id.map(str::to_string),
                    subject: "Credit or quota exhausted".to_string(),
                    body: message.to_string(),
                },
            },
            ErrorClass::Other => RetryAction::Fail,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_retry_with_growing_backoff_up_to_the_cap() {
        let mut policy = RetryPolicy::new();
        for expected_attempt in 1..=TRANSIENT_RETRY_CAP {
            let action = policy.decide("connection timeout", "call-model", Some("task-1"));
            assert_eq!(
                action,
                RetryAction::Retry {
                    delay: transient_backoff(expected_attempt)
                }
            );
        }
        let action = policy.decide("connection timeout", "call-model", Some("task-1"));
        assert_eq!(action, RetryAction::Fail);
    }

    #[test]
    fn success_clears_the_retry_counter() {
        let mut policy = RetryPolicy::new();
        policy.decide("network busy", "call-model", Some("task-1"));
        policy.record_success(Some("task-1"), "call-model");
        let action = policy.decide("network busy", "call-model", Some("task-1"));
        assert_eq!(
            action,
            RetryAction::Retry {
                delay: transient_backoff(1)
            }
        );
    }

    #[test]
    fn store_schema_errors_fall_back_to_storeless() {
        let mut policy = RetryPolicy::new();
        let action = policy.decide("no such table: tasks", "store-get", None);
        assert_eq!(action, RetryAction::FallBackToStoreless);
    }

    #[test]
    fn memory_pressure_retries_exactly_once() {
        let mut policy = RetryPolicy::new();
        assert_eq!(
            policy.decide("out of memory", "buffer-append", Some("task-1")),
            RetryAction::TriggerPressureCleanupAndRetryOnce
        );
        assert_eq!(
            policy.decide("out of memory", "buffer-append", Some("task-1")),
            RetryAction::Fail
        );
    }

    #[test]
    fn task_scoped_operation_with_known_task_id_requests_restart() {
        let mut policy = RetryPolicy::new();
        let action = policy.decide("unexpected task failure", "task-execute", Some("task-1"));
        assert_eq!(action, RetryAction::RestartTask);
    }

    #[test]
    fn credit_exhaustion_is_non_retriable_and_notifies() {
        let mut policy = RetryPolicy::new();
        let action = policy.decide("insufficient balance", "call-model", Some("task-1"));
        match action {
            RetryAction::NotifyAndFail { notification } => {
                assert_eq!(notification.task_id.as_deref(), Some("task-1"));
            }
            other => panic!("expected NotifyAndFail, got {other:?}"),
        }
    }

    #[test]
    fn unrecognized_errors_are_not_retried() {
        let mut policy = RetryPolicy::new();
        let action = policy.decide("totally unexpected panic", "misc", None);
        assert_eq!(action, RetryAction::Fail);
    }
}
