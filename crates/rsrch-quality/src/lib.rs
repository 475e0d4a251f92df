//! Strict per-stage output validation (spec.md §4.B).
//!
//! Three rules, applied in the same order for every stage: finish-reason
//! gate first (an `unknown` finish reason is never tolerated, independent
//! of length), then the stage's minimum length, then its structural check.
//! Length thresholds are never relaxed.

use rsrch_protocol::{FinishReason, TaskStep};
use serde_json::Value;

const PLAN_MIN_CHARS: usize = 50;
const FINAL_REPORT_MIN_CHARS: usize = 500;
const FINAL_REPORT_AGGREGATE_MIN_CHARS: usize = rsrch_protocol::MIN_COMPLETE_BYTES;

/// A stage output failed validation. `reason` doubles as the log line and
/// the user-facing explanation — the validator does not produce two
/// different strings for the same failure.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{reason}")]
pub struct ValidationFailure {
    pub reason: String,
}

impl ValidationFailure {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    /// User-facing message once all rotator retries are exhausted for this
    /// stage (spec.md §4.B — producing this message is the validator's job).
    pub fn terminal_message(&self) -> String {
        format!("Unable to produce a valid result: {}", self.reason)
    }
}

/// Validate a stage's raw model output.
///
/// `aggregate_len` is the length of the task's full concatenated buffer —
/// only consulted for `FinalReport`, where the aggregate-length rule is
/// distinct from the chunk's own minimum length.
pub fn validate(
    stage: TaskStep,
    content: &str,
    finish_reason: FinishReason,
    aggregate_len: usize,
) -> Result<(), ValidationFailure> {
    if finish_reason.is_hard_rejected() {
        return Err(ValidationFailure::new(format!(
            "generator finish reason {:?} is never tolerated",
            finish_reason
        )));
    }

    match stage {
        TaskStep::ReportPlan => validate_plan(content),
        TaskStep::SerpQuery => validate_serp_queries(content),
        TaskStep::FinalReport => validate_final_report(content, aggregate_len),
        TaskStep::Search | TaskStep::Initializing => Ok(()),
    }
}

fn validate_plan(content: &str) -> Result<(), ValidationFailure> {
    if content.len() < PLAN_MIN_CHARS {
        return Err(ValidationFailure::new(format!(
            "plan output is {} chars, below the {PLAN_MIN_CHARS}-char minimum",
            content.len()
        )));
    }
    Ok(())
}

fn validate_serp_queries(content: &str) -> Result<(), ValidationFailure> {
    let value: Value = serde_json::from_str(content.trim())
        .map_err(|e| ValidationFailure::new(format!("SERP queries are not valid JSON: {e}")))?;

    let items = value
        .as_array()
        .ok_or_else(|| ValidationFailure::new("SERP queries must be a JSON array"))?;

    if items.is_empty() {
        return Err(ValidationFailure::new("SERP queries array is empty"));
    }

    for (i, item) in items.iter().enumerate() {
        let query = item.get("query").and_then(Value::as_str);
        if query.map(str::trim).unwrap_or_default().is_empty() {
            return Err(ValidationFailure::new(format!(
                "SERP query item {i} is missing a non-empty \"query\" field"
            )));
        }
    }

    Ok(())
}

fn validate_final_report(content: &str, aggregate_len: usize) -> Result<(), ValidationFailure> {
    if content.len() < FINAL_REPORT_MIN_CHARS {
        return Err(ValidationFailure::new(format!(
            "final report chunk is {} chars, below the {FINAL_REPORT_MIN_CHARS}-char minimum",
            content.len()
        )));
    }

    if !content.contains(rsrch_protocol::FINAL_REPORT_OPEN)
        || !content.contains(rsrch_protocol::FINAL_REPORT_CLOSE)
    {
        return Err(ValidationFailure::new(
            "final report is missing the opening or closing sentinel marker",
        ));
    }

    if aggregate_len < FINAL_REPORT_AGGREGATE_MIN_CHARS {
        return Err(ValidationFailure::new(format!(
            "aggregate output is {aggregate_len} chars, below the {FINAL_REPORT_AGGREGATE_MIN_CHARS}-char minimum"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_finish_reason_is_always_rejected_even_with_good_content() {
        let long_content = "x".repeat(1000);
        let result = validate(TaskStep::ReportPlan, &long_content, FinishReason::Unknown, 0);
        assert!(result.is_err());
    }

    #[test]
    fn plan_below_minimum_length_is_rejected() {
        let result = validate(TaskStep::ReportPlan, "too short", FinishReason::Stop, 0);
        assert!(result.is_err());
    }

    #[test]
    fn plan_meeting_minimum_length_passes() {
        let content = "a".repeat(PLAN_MIN_CHARS);
        assert!(validate(TaskStep::ReportPlan, &content, FinishReason::Stop, 0).is_ok());
    }

    #[test]
    fn serp_queries_must_be_a_nonempty_array_of_query_objects() {
        assert!(validate(TaskStep::SerpQuery, "not json", FinishReason::Stop, 0).is_err());
        assert!(validate(TaskStep::SerpQuery, "[]", FinishReason::Stop, 0).is_err());
        assert!(validate(TaskStep::SerpQuery, r#"[{"query": ""}]"#, FinishReason::Stop, 0).is_err());
        assert!(
            validate(TaskStep::SerpQuery, r#"[{"query": "rust async"}]"#, FinishReason::Stop, 0)
                .is_ok()
        );
    }

    #[test]
    fn final_report_requires_markers_and_aggregate_length() {
        let chunk = format!(
            "{}{}{}",
            rsrch_protocol::FINAL_REPORT_OPEN,
            "x".repeat(600),
            rsrch_protocol::FINAL_REPORT_CLOSE
        );
        assert!(validate(TaskStep::FinalReport, &chunk, FinishReason::Stop, 500).is_err());
        assert!(validate(TaskStep::FinalReport, &chunk, FinishReason::Stop, 1200).is_ok());
    }

    #[test]
    fn final_report_missing_markers_is_rejected() {
        let chunk = "x".repeat(600);
        assert!(validate(TaskStep::FinalReport, &chunk, FinishReason::Stop, 1200).is_err());
    }

    #[test]
    fn length_threshold_never_relaxed_by_finish_reason_length() {
        let result = validate(TaskStep::ReportPlan, "short", FinishReason::Length, 0);
        assert!(result.is_err());
    }
}
