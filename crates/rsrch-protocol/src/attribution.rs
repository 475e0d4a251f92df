//! Optional client-attribution metadata attached to a task record
//! (spec.md §3) — never participates in identity or fingerprinting.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientAttribution {
    pub source_env: Option<String>,
    pub user_id: Option<String>,
    pub user_name: Option<String>,
    pub user_agent: Option<String>,
    pub ip: Option<String>,
    pub locale: Option<String>,
    pub timezone: Option<String>,
    pub device_class: Option<String>,
    pub mode: Option<String>,
}
