//! External collaborator seams for stage execution (spec.md §6): a
//! streaming model client and a search client. Vendor SDKs sit behind
//! these traits — this crate only needs the event/result shape.

use async_trait::async_trait;
use futures::stream::BoxStream;
use rsrch_protocol::FinishReason;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("provider error: {0}")]
    Other(String),
}

/// One event from a streaming model call.
#[derive(Debug, Clone)]
pub enum ModelEvent {
    TextDelta(String),
    Reasoning(String),
    Source { url: String, title: Option<String> },
    Finish { finish_reason: FinishReason },
}

#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn stream(
        &self,
        model: &str,
        prompt: &str,
        system: &str,
    ) -> Result<BoxStream<'static, ModelEvent>, ProviderError>;
}

#[derive(Debug, Clone, Copy)]
pub struct SearchOptions {
    pub max_result: u32,
}

#[derive(Debug, Clone)]
pub struct SearchSource {
    pub url: String,
    pub title: Option<String>,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct SearchImage {
    pub url: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SearchResult {
    pub sources: Vec<SearchSource>,
    pub images: Vec<SearchImage>,
}

#[async_trait]
pub trait SearchClient: Send + Sync {
    async fn search(
        &self,
        query: &str,
        api_key: &str,
        options: SearchOptions,
    ) -> Result<SearchResult, ProviderError>;
}
