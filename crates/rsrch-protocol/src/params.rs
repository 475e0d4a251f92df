//! The semantic request parameter set and task identity (spec.md §3, §6, §9).

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Caller-supplied scope fields that participate in the fingerprint — two
/// requests for the same query text under different users/topics/modes are
/// different tasks even though the query itself matches (spec.md §3).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityScope {
    pub user_id: Option<String>,
    pub topic_id: Option<String>,
    pub mode: Option<String>,
    pub data_base_url: Option<String>,
}

/// The full semantic parameter set of a research request (spec.md §6).
///
/// `Serialize`/`Deserialize` so it round-trips through `TaskStore` as the
/// invocation parameters needed to re-launch a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestParams {
    pub query: String,
    pub language: String,
    pub max_result: u32,
    pub enable_citation_image: bool,
    pub enable_references: bool,
    pub search_provider: String,
    pub thinking_models: Vec<String>,
    pub task_models: Vec<String>,
    pub identity: IdentityScope,
}

impl Default for RequestParams {
    fn default() -> Self {
        Self {
            query: String::new(),
            language: "zh-CN".to_string(),
            max_result: 50,
            enable_citation_image: true,
            enable_references: true,
            search_provider: String::new(),
            thinking_models: Vec::new(),
            task_models: Vec::new(),
            identity: IdentityScope::default(),
        }
    }
}

/// Parse the boolean-ish query-param convention of spec.md §6: the string
/// `"false"` disables, any other value (including absence handled by the
/// caller) enables.
pub fn parse_boolish(raw: &str) -> bool {
    raw != "false"
}

/// Dedup a comma-separated list while preserving first-seen order
/// (spec.md §6: "dedup preserves order").
pub fn dedup_preserve_order(items: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for item in items {
        let trimmed = item.trim().to_string();
        if trimmed.is_empty() {
            continue;
        }
        if seen.insert(trimmed.clone()) {
            out.push(trimmed);
        }
    }
    out
}

/// Merge a comma-separated list from two sources, request first, then the
/// fallback, deduped with request priority (spec.md §4.E stage 3, §9).
pub fn merge_comma_lists(request: &str, fallback: &str) -> Vec<String> {
    let request_items = request.split(',').map(|s| s.to_string());
    let fallback_items = fallback.split(',').map(|s| s.to_string());
    dedup_preserve_order(request_items.chain(fallback_items))
}

impl RequestParams {
    /// Canonical form used both for fingerprinting and for stable
    /// serialization: query normalized to trimmed lowercase, scalars in a
    /// fixed field order, model lists joined by comma (spec.md §3, §9).
    pub fn canonical_form(&self) -> String {
        let mut parts = vec![
            self.query.trim().to_lowercase(),
            self.language.clone(),
            self.max_result.to_string(),
            self.enable_citation_image.to_string(),
            self.enable_references.to_string(),
            self.search_provider.clone(),
            self.thinking_models.join(","),
            self.task_models.join(","),
            self.identity.user_id.clone().unwrap_or_default(),
            self.identity.topic_id.clone().unwrap_or_default(),
            self.identity.mode.clone().unwrap_or_default(),
            self.identity.data_base_url.clone().unwrap_or_default(),
        ];
        parts.retain(|_| true); // fixed order is the point; nothing to sort
        parts.join("\u{1f}")
    }

    /// 128-bit-truncated SHA-256 of the canonical form, hex-encoded to 32
    /// characters (spec.md §3). Collisions are intentionally treated as
    /// identity — this is the caching mechanism, not a bug.
    pub fn fingerprint(&self) -> TaskId {
        let digest = Sha256::digest(self.canonical_form().as_bytes());
        let truncated = &digest[..16];
        let hex: String = truncated.iter().map(|b| format!("{b:02x}")).collect();
        TaskId(hex)
    }
}

/// A task identifier: either a caller-supplied correlation id or a computed
/// fingerprint. Both are represented the same way since identity, once
/// established, behaves identically from then on (spec.md §3).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(String);

/// Maximum task id length per spec.md §3's invariant.
pub const MAX_TASK_ID_BYTES: usize = 500;

#[derive(Debug, thiserror::Error)]
pub enum TaskIdError {
    #[error("task id must not be empty")]
    Empty,
    #[error("task id exceeds {MAX_TASK_ID_BYTES} bytes: got {0}")]
    TooLong(usize),
}

impl TaskId {
    /// Build an identity from an externally supplied correlation id,
    /// trimmed and validated, or fall back to the computed fingerprint if
    /// none was supplied (spec.md §3).
    pub fn from_caller_or_fingerprint(
        caller_supplied: Option<&str>,
        params: &RequestParams,
    ) -> Result<Self, TaskIdError> {
        match caller_supplied.map(str::trim).filter(|s| !s.is_empty()) {
            Some(trimmed) => Self::new(trimmed),
            None => Ok(params.fingerprint()),
        }
    }

    pub fn new(raw: impl Into<String>) -> Result<Self, TaskIdError> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(TaskIdError::Empty);
        }
        if raw.len() > MAX_TASK_ID_BYTES {
            return Err(TaskIdError::TooLong(raw.len()));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The archived form: `<id>-archived-<ISO8601>` (spec.md §3, §4.F).
    pub fn archived(&self, at: chrono::DateTime<chrono::Utc>) -> String {
        format!("{}-archived-{}", self.0, at.to_rfc3339())
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<TaskId> for String {
    fn from(id: TaskId) -> Self {
        id.0
    }
}
