//! Generator completion reason, as attested by the model/provider client.

use serde::{Deserialize, Serialize};

/// Why a model generation call stopped.
///
/// `Unknown` is the hard-failure default for anything the provider client
/// didn't map explicitly — the quality validator never tolerates it
/// (spec.md §4.B).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    Error,
    ContentFilter,
    Blocked,
    Unknown,
}

impl FinishReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
            FinishReason::Error => "error",
            FinishReason::ContentFilter => "content_filter",
            FinishReason::Blocked => "blocked",
            FinishReason::Unknown => "unknown",
        }
    }

    /// True for the reasons the quality validator rejects outright
    /// regardless of content (spec.md §4.B: "same" required finish reason
    /// row — neither `unknown` nor `error`/`blocked`/`content_filter`).
    pub fn is_hard_rejected(self) -> bool {
        matches!(
            self,
            FinishReason::Unknown
                | FinishReason::Error
                | FinishReason::Blocked
                | FinishReason::ContentFilter
        )
    }
}

impl From<&str> for FinishReason {
    fn from(raw: &str) -> Self {
        match raw {
            "stop" => FinishReason::Stop,
            "length" => FinishReason::Length,
            "error" => FinishReason::Error,
            "content_filter" => FinishReason::ContentFilter,
            "blocked" => FinishReason::Blocked,
            _ => FinishReason::Unknown,
        }
    }
}

impl From<String> for FinishReason {
    fn from(raw: String) -> Self {
        FinishReason::from(raw.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unrecognized_strings_never_panic_and_map_to_unknown() {
        assert_eq!(FinishReason::from("totally-made-up"), FinishReason::Unknown);
        assert_eq!(FinishReason::from(""), FinishReason::Unknown);
    }

    #[test]
    fn only_stop_and_length_pass_the_hard_reject_gate() {
        assert!(!FinishReason::Stop.is_hard_rejected());
        assert!(!FinishReason::Length.is_hard_rejected());
        assert!(FinishReason::Unknown.is_hard_rejected());
        assert!(FinishReason::Error.is_hard_rejected());
        assert!(FinishReason::Blocked.is_hard_rejected());
        assert!(FinishReason::ContentFilter.is_hard_rejected());
    }
}
