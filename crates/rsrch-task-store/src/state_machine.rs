//! Aggregate task status transition enforcement (spec.md §3: "a task in
//! terminal state never reverts to a non-terminal state").

use crate::error::TaskStoreError;
use rsrch_protocol::AggregateStatus;

/// Validate an aggregate status transition. `Completed`/`Failed` are
/// terminal — no further transition out of them is ever valid.
pub fn validate_transition(
    from: AggregateStatus,
    to: AggregateStatus,
) -> Result<(), TaskStoreError> {
    match from {
        AggregateStatus::Running => match to {
            AggregateStatus::Paused | AggregateStatus::Completed | AggregateStatus::Failed => {
                Ok(())
            }
            AggregateStatus::Running => Err(TaskStoreError::TerminalState(
                "no-op transition Running -> Running".to_string(),
            )),
        },
        AggregateStatus::Paused => match to {
            AggregateStatus::Running | AggregateStatus::Completed | AggregateStatus::Failed => {
                Ok(())
            }
            AggregateStatus::Paused => Err(TaskStoreError::TerminalState(
                "no-op transition Paused -> Paused".to_string(),
            )),
        },
        AggregateStatus::Completed | AggregateStatus::Failed => Err(
            TaskStoreError::TerminalState(format!("{from:?} is terminal, cannot move to {to:?}")),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_can_reach_any_outcome() {
        assert!(validate_transition(AggregateStatus::Running, AggregateStatus::Paused).is_ok());
        assert!(validate_transition(AggregateStatus::Running, AggregateStatus::Completed).is_ok());
        assert!(validate_transition(AggregateStatus::Running, AggregateStatus::Failed).is_ok());
    }

    #[test]
    fn terminal_states_reject_every_transition() {
        for terminal in [AggregateStatus::Completed, AggregateStatus::Failed] {
            for target in [
                AggregateStatus::Running,
                AggregateStatus::Paused,
                AggregateStatus::Completed,
                AggregateStatus::Failed,
            ] {
                assert!(
                    validate_transition(terminal, target).is_err(),
                    "expected {terminal:?} -> {target:?} to be rejected"
                );
            }
        }
    }
}
