//! Completion attestation: the set of fields that together prove a task
//! genuinely finished (spec.md §3, §8).

use crate::finish_reason::FinishReason;
use crate::step::{StepStatus, TaskStep};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Sentinel markers the final-report stage must both emit for the buffer to
/// be considered a valid completed report (spec.md §3, §4.B).
pub const FINAL_REPORT_OPEN: &str = "<final-report>";
pub const FINAL_REPORT_CLOSE: &str = "</final-report>";

/// Minimum total buffer length (bytes) required for `is_valid_complete`.
pub const MIN_COMPLETE_BYTES: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attestation {
    pub step: TaskStep,
    pub step_status: StepStatus,
    pub finish_reason: FinishReason,
    pub is_valid_complete: bool,
    pub last_step_completed_at: Option<DateTime<Utc>>,
}

impl Attestation {
    pub fn initial() -> Self {
        Self {
            step: TaskStep::Initializing,
            step_status: StepStatus::Running,
            finish_reason: FinishReason::Unknown,
            is_valid_complete: false,
            last_step_completed_at: None,
        }
    }

    /// Recompute `is_valid_complete` from the five §3 conditions and the
    /// concatenated buffer content. Never set this flag any other way —
    /// spec.md §3 is explicit that it is true *only if* all five hold.
    pub fn recompute_valid_complete(&mut self, buffer_concat: &str) {
        self.is_valid_complete = self.step == TaskStep::FinalReport
            && self.step_status == StepStatus::Completed
            && self.finish_reason == FinishReason::Stop
            && buffer_concat.contains(FINAL_REPORT_OPEN)
            && buffer_concat.contains(FINAL_REPORT_CLOSE)
            && buffer_concat.len() >= MIN_COMPLETE_BYTES;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_buffer() -> String {
        let filler = "x".repeat(MIN_COMPLETE_BYTES);
        format!("{FINAL_REPORT_OPEN}{filler}{FINAL_REPORT_CLOSE}")
    }

    #[test]
    fn all_five_conditions_required() {
        let mut a = Attestation::initial();
        a.step = TaskStep::FinalReport;
        a.step_status = StepStatus::Completed;
        a.finish_reason = FinishReason::Stop;
        a.recompute_valid_complete(&valid_buffer());
        assert!(a.is_valid_complete);
    }

    #[test]
    fn wrong_finish_reason_fails_even_with_markers_and_length() {
        let mut a = Attestation::initial();
        a.step = TaskStep::FinalReport;
        a.step_status = StepStatus::Completed;
        a.finish_reason = FinishReason::Length;
        a.recompute_valid_complete(&valid_buffer());
        assert!(!a.is_valid_complete);
    }

    #[test]
    fn missing_sentinel_fails() {
        let mut a = Attestation::initial();
        a.step = TaskStep::FinalReport;
        a.step_status = StepStatus::Completed;
        a.finish_reason = FinishReason::Stop;
        a.recompute_valid_complete(&"x".repeat(MIN_COMPLETE_BYTES));
        assert!(!a.is_valid_complete);
    }

    #[test]
    fn too_short_fails_even_with_markers() {
        let mut a = Attestation::initial();
        a.step = TaskStep::FinalReport;
        a.step_status = StepStatus::Completed;
        a.finish_reason = FinishReason::Stop;
        a.recompute_valid_complete(&format!("{FINAL_REPORT_OPEN}{FINAL_REPORT_CLOSE}"));
        assert!(!a.is_valid_complete);
    }

    #[test]
    fn wrong_step_fails() {
        let mut a = Attestation::initial();
        a.step = TaskStep::Search;
        a.step_status = StepStatus::Completed;
        a.finish_reason = FinishReason::Stop;
        a.recompute_valid_complete(&valid_buffer());
        assert!(!a.is_valid_complete);
    }
}
