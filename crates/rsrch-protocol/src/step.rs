//! Task progress vocabulary: which stage a task is in and how that stage and
//! the task as a whole are doing.

use serde::{Deserialize, Serialize};

/// Which of the four pipeline stages (or the pre-stage placeholder) a task is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStep {
    Initializing,
    ReportPlan,
    SerpQuery,
    Search,
    FinalReport,
}

impl TaskStep {
    /// 1-based index used for the `stage_index / 4 * 100` progress formula.
    /// `Initializing` is stage 0 and contributes no progress on its own.
    pub fn index(self) -> u8 {
        match self {
            TaskStep::Initializing => 0,
            TaskStep::ReportPlan => 1,
            TaskStep::SerpQuery => 2,
            TaskStep::Search => 3,
            TaskStep::FinalReport => 4,
        }
    }
}

/// Status of the current step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Running,
    Completed,
    Failed,
}

/// Aggregate status of the task as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateStatus {
    Running,
    Paused,
    Completed,
    Failed,
}

impl AggregateStatus {
    /// Terminal statuses never transition back to a non-terminal one (spec.md §3).
    pub fn is_terminal(self) -> bool {
        matches!(self, AggregateStatus::Completed | AggregateStatus::Failed)
    }
}
