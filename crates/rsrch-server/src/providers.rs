//! Default `ModelClient`/`SearchClient` implementations wired into the
//! binary. `rsrch-pipeline` treats these as opaque driver dependencies
//! (vendor SDKs sit behind the trait) — this module is one concrete choice
//! an operator can swap for another `reqwest`-backed client or a vendor
//! SDK without touching the pipeline crate.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use reqwest::Client;
use rsrch_pipeline::{
    ModelClient, ModelEvent, ProviderError, SearchClient, SearchImage, SearchOptions,
    SearchResult, SearchSource,
};
use rsrch_protocol::FinishReason;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Streaming client for an OpenAI-compatible `/chat/completions` endpoint.
pub struct HttpModelClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl HttpModelClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent("rsrch-server/0.1")
            .build()
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
        })
    }
}

#[derive(Deserialize)]
struct ChatChunk {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    #[serde(default)]
    delta: ChatDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct ChatDelta {
    #[serde(default)]
    content: Option<String>,
}

fn map_finish_reason(raw: Option<&str>) -> FinishReason {
    match raw {
        Some("stop") => FinishReason::Stop,
        Some("length") => FinishReason::Length,
        Some("content_filter") => FinishReason::ContentFilter,
        Some(_) => FinishReason::Unknown,
        None => FinishReason::Stop,
    }
}

#[async_trait]
impl ModelClient for HttpModelClient {
    async fn stream(
        &self,
        model: &str,
        prompt: &str,
        system: &str,
    ) -> Result<BoxStream<'static, ModelEvent>, ProviderError> {
        let body = json!({
            "model": model,
            "stream": true,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": prompt },
            ],
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ProviderError::Other(format!(
                "model endpoint returned {}",
                response.status()
            )));
        }

        let (tx, rx) = mpsc::channel::<ModelEvent>(256);

        tokio::spawn(async move {
            let mut bytes_stream = response.bytes_stream();
            let mut buffer = String::new();

            while let Some(chunk) = bytes_stream.next().await {
                let Ok(bytes) = chunk else { break };
                buffer.push_str(&String::from_utf8_lossy(&bytes));

                while let Some(pos) = buffer.find("\n\n") {
                    let event_text = buffer[..pos].to_string();
                    buffer = buffer[pos + 2..].to_string();

                    for line in event_text.lines() {
                        let Some(data) = line.strip_prefix("data: ") else {
                            continue;
                        };
                        if data == "[DONE]" {
                            let _ = tx
                                .send(ModelEvent::Finish {
                                    finish_reason: FinishReason::Stop,
                                })
                                .await;
                            return;
                        }
                        let Ok(parsed) = serde_json::from_str::<ChatChunk>(data) else {
                            continue;
                        };
                        let Some(choice) = parsed.choices.into_iter().next() else {
                            continue;
                        };
                        if let Some(text) = choice.delta.content {
                            if !text.is_empty() && tx.send(ModelEvent::TextDelta(text)).await.is_err() {
                                return;
                            }
                        }
                        if let Some(reason) = choice.finish_reason {
                            let _ = tx
                                .send(ModelEvent::Finish {
                                    finish_reason: map_finish_reason(Some(&reason)),
                                })
                                .await;
                            return;
                        }
                    }
                }
            }
        });

        Ok(Box::pin(tokio_stream::wrappers::ReceiverStream::new(rx)))
    }
}

/// Search client for a generic Tavily-shaped `/search` endpoint:
/// `{query, api_key, max_results}` -> `{results: [{url, title, content}], images: [...]}`.
pub struct HttpSearchClient {
    client: Client,
    base_url: String,
}

impl HttpSearchClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent("rsrch-server/0.1")
            .build()
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }
}

#[derive(Deserialize)]
struct RawSearchResponse {
    #[serde(default)]
    results: Vec<RawResult>,
    #[serde(default)]
    images: Vec<RawImage>,
}

#[derive(Deserialize)]
struct RawResult {
    url: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    content: String,
}

#[derive(Deserialize)]
struct RawImage {
    url: String,
    #[serde(default)]
    description: Option<String>,
}

#[async_trait]
impl SearchClient for HttpSearchClient {
    async fn search(
        &self,
        query: &str,
        api_key: &str,
        options: SearchOptions,
    ) -> Result<SearchResult, ProviderError> {
        let body: Value = json!({
            "query": query,
            "api_key": api_key,
            "max_results": options.max_result,
        });

        let response = self
            .client
            .post(format!("{}/search", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ProviderError::Other(format!(
                "search endpoint returned {}",
                response.status()
            )));
        }

        let raw: RawSearchResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Other(e.to_string()))?;

        Ok(SearchResult {
            sources: raw
                .results
                .into_iter()
                .map(|r| SearchSource {
                    url: r.url,
                    title: r.title,
                    content: r.content,
                })
                .collect(),
            images: raw
                .images
                .into_iter()
                .map(|i| SearchImage {
                    url: i.url,
                    description: i.description,
                })
                .collect(),
        })
    }
}

/// A model client that never produces usable output — used when no real
/// model endpoint is configured, so the server still starts and every
/// pipeline run fails loudly at the first stage instead of hanging.
pub struct UnconfiguredModelClient;

#[async_trait]
impl ModelClient for UnconfiguredModelClient {
    async fn stream(
        &self,
        _model: &str,
        _prompt: &str,
        _system: &str,
    ) -> Result<BoxStream<'static, ModelEvent>, ProviderError> {
        Err(ProviderError::Other(
            "no model provider configured: pass --model-base-url and --model-api-key".to_string(),
        ))
    }
}

pub struct UnconfiguredSearchClient;

#[async_trait]
impl SearchClient for UnconfiguredSearchClient {
    async fn search(
        &self,
        _query: &str,
        _api_key: &str,
        _options: SearchOptions,
    ) -> Result<SearchResult, ProviderError> {
        Err(ProviderError::Other(
            "no search provider configured: pass --search-base-url".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_finish_reason_covers_known_and_unknown_values() {
        assert_eq!(map_finish_reason(Some("stop")), FinishReason::Stop);
        assert_eq!(map_finish_reason(Some("length")), FinishReason::Length);
        assert_eq!(map_finish_reason(Some("weird")), FinishReason::Unknown);
        assert_eq!(map_finish_reason(None), FinishReason::Stop);
    }

    #[tokio::test]
    async fn unconfigured_model_client_errors_immediately() {
        let client = UnconfiguredModelClient;
        let err = match client.stream("m", "p", "s").await {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        assert!(matches!(err, ProviderError::Other(_)));
    }

    #[tokio::test]
    async fn unconfigured_search_client_errors_immediately() {
        let client = UnconfiguredSearchClient;
        let err = client
            .search("q", "k", SearchOptions { max_result: 5 })
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Other(_)));
    }
}
