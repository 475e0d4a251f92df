//! Startup recovery: every record still `running` in the store when the
//! process last exited has no live job to resume into — the pipeline
//! driver has no mid-stage checkpoint (spec.md §4.E runs stages linearly
//! with no persisted intermediate state), so the only sound recovery
//! action is to mark it failed and let the caller re-request if it still
//! wants the report.

use chrono::{DateTime, Utc};
use rsrch_protocol::AggregateStatus;
use rsrch_task_store::TaskRecord;

#[derive(Debug, Clone)]
pub enum RecoveryAction {
    /// Already terminal in the store; nothing to do.
    None,
    /// Was `running` with no live job — abandoned as failed.
    AbandonedAsFailed,
}

/// Classify a single record's recovery action (spec.md §4.F startup path,
/// grounded on the teacher pack's `determine_recovery_action` shape).
pub fn classify(record: &TaskRecord) -> RecoveryAction {
    if record.status.is_terminal() {
        RecoveryAction::None
    } else {
        RecoveryAction::AbandonedAsFailed
    }
}

#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    pub abandoned: Vec<String>,
    pub recovered_at: Option<DateTime<Utc>>,
}

impl RecoveryReport {
    pub fn is_clean(&self) -> bool {
        self.abandoned.is_empty()
    }

    pub fn format_message(&self) -> String {
        if self.is_clean() {
            return "Task manager restarted. No interrupted tasks found.".to_string();
        }
        format!(
            "Task manager restarted. {} interrupted task(s) marked failed: {}",
            self.abandoned.len(),
            self.abandoned.join(", ")
        )
    }
}

/// Run recovery classification over every record loaded from the store at
/// startup, returning the ids that need to transition to `Failed` plus a
/// human-readable summary.
pub fn recover(records: &[TaskRecord], now: DateTime<Utc>) -> (Vec<String>, RecoveryReport) {
    let mut abandoned = Vec::new();
    for record in records {
        if matches!(classify(record), RecoveryAction::AbandonedAsFailed) {
            abandoned.push(record.task_id.as_str().to_string());
        }
    }
    let report = RecoveryReport {
        abandoned: abandoned.clone(),
        recovered_at: Some(now),
    };
    (abandoned, report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsrch_protocol::{Attestation, RequestParams, TaskId};

    fn record_with_status(id: &str, status: AggregateStatus) -> TaskRecord {
        let mut record = TaskRecord::new(TaskId::new(id).unwrap(), RequestParams::default(), None);
        record.status = status;
        record.attestation = Attestation::initial();
        record
    }

    #[test]
    fn running_records_are_abandoned() {
        let record = record_with_status("task-1", AggregateStatus::Running);
        assert!(matches!(classify(&record), RecoveryAction::AbandonedAsFailed));
    }

    #[test]
    fn terminal_records_are_left_alone() {
        let record = record_with_status("task-1", AggregateStatus::Completed);
        assert!(matches!(classify(&record), RecoveryAction::None));
    }

    #[test]
    fn recover_collects_only_non_terminal_ids() {
        let records = vec![
            record_with_status("task-running", AggregateStatus::Running),
            record_with_status("task-done", AggregateStatus::Completed),
            record_with_status("task-paused", AggregateStatus::Paused),
        ];
        let (abandoned, report) = recover(&records, Utc::now());
        assert_eq!(abandoned, vec!["task-running", "task-paused"]);
        assert!(!report.is_clean());
        assert!(report.format_message().contains("2 interrupted"));
    }

    #[test]
    fn clean_report_message_when_nothing_to_recover() {
        let records = vec![record_with_status("task-done", AggregateStatus::Completed)];
        let (abandoned, report) = recover(&records, Utc::now());
        assert!(abandoned.is_empty());
        assert!(report.is_clean());
        assert_eq!(
            report.format_message(),
            "Task manager restarted. No interrupted tasks found."
        );
    }
}
