//! Four-stage research pipeline driver (spec.md component E): plan, SERP
//! query expansion, per-query search fan-out, final report. Stages are
//! wired around the `ModelClient`/`SearchClient` seams in [`provider`] and
//! emit [`events::PipelineEvent`]s to the task manager over an `mpsc`
//! channel.

pub mod dedup;
pub mod driver;
pub mod events;
pub mod provider;

pub use dedup::OrderedDedup;
pub use driver::{PipelineConfig, PipelineDriver};
pub use events::{progress_percentage, PipelineEvent};
pub use provider::{
    ModelClient, ModelEvent, ProviderError, SearchClient, SearchImage, SearchOptions,
    SearchResult, SearchSource,
};

#[cfg(test)]
mod driver_tests {
    use super::*;
    use async_trait::async_trait;
    use futures::stream::{self, BoxStream};
    use rsrch_protocol::{FinishReason, TaskId};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    struct FakeModelClient;

    #[async_trait]
    impl ModelClient for FakeModelClient {
        async fn stream(
            &self,
            _model: &str,
            prompt: &str,
            _system: &str,
        ) -> Result<BoxStream<'static, ModelEvent>, ProviderError> {
            let body = if prompt.contains("JSON") || prompt.contains("queries") {
                r#"[{"query": "rust async runtimes", "researchGoal": "compare schedulers"}]"#
                    .to_string()
            } else if prompt.contains("final report") || prompt.contains("Write the final report") {
                "x".repeat(600)
            } else {
                "x".repeat(60)
            };

            let events = vec![
                ModelEvent::TextDelta(body),
                ModelEvent::Finish {
                    finish_reason: FinishReason::Stop,
                },
            ];
            Ok(Box::pin(stream::iter(events)))
        }
    }

    struct FakeSearchClient;

    #[async_trait]
    impl SearchClient for FakeSearchClient {
        async fn search(
            &self,
            query: &str,
            _api_key: &str,
            _options: SearchOptions,
        ) -> Result<SearchResult, ProviderError> {
            Ok(SearchResult {
                sources: vec![SearchSource {
                    url: format!("https://example.com/{query}"),
                    title: Some(query.to_string()),
                    content: "relevant passage".to_string(),
                }],
                images: vec![],
            })
        }
    }

    fn test_config() -> PipelineConfig {
        PipelineConfig {
            thinking_models: vec!["thinking-a".to_string()],
            task_models: vec!["task-a".to_string()],
            search_api_keys: vec!["key-a".to_string()],
            max_result: 5,
            enable_citation_image: true,
            enable_references: true,
        }
    }

    #[tokio::test]
    async fn full_pipeline_runs_all_four_stages_and_produces_final_report() {
        let driver = PipelineDriver::new(
            Arc::new(FakeModelClient),
            Arc::new(FakeSearchClient),
            test_config(),
        );
        let (tx, mut rx) = mpsc::channel(256);
        let task_id = TaskId::new("task-pipeline-1").unwrap();

        let handle = tokio::spawn(async move { driver.run(&task_id, "rust async", tx).await });

        let mut stages_started = Vec::new();
        while let Some(event) = rx.recv().await {
            if let PipelineEvent::StageStarted { stage } = event {
                stages_started.push(stage);
            }
        }

        let result = handle.await.unwrap();
        assert!(result.is_ok());
        let buffer = result.unwrap();
        assert!(buffer.contains("<report-plan>"));
        assert!(buffer.contains("<final-report>"));
        assert!(buffer.contains("</final-report>"));
        assert_eq!(
            stages_started,
            vec![
                rsrch_protocol::TaskStep::ReportPlan,
                rsrch_protocol::TaskStep::SerpQuery,
                rsrch_protocol::TaskStep::Search,
                rsrch_protocol::TaskStep::FinalReport,
            ]
        );
    }

    struct AlwaysShortModelClient;

    #[async_trait]
    impl ModelClient for AlwaysShortModelClient {
        async fn stream(
            &self,
            _model: &str,
            _prompt: &str,
            _system: &str,
        ) -> Result<BoxStream<'static, ModelEvent>, ProviderError> {
            let events = vec![
                ModelEvent::TextDelta("too short".to_string()),
                ModelEvent::Finish {
                    finish_reason: FinishReason::Stop,
                },
            ];
            Ok(Box::pin(stream::iter(events)))
        }
    }

    #[tokio::test]
    async fn plan_stage_fails_after_rotation_is_exhausted_on_persistently_invalid_output() {
        let driver = PipelineDriver::new(
            Arc::new(AlwaysShortModelClient),
            Arc::new(FakeSearchClient),
            test_config(),
        );
        let (tx, mut rx) = mpsc::channel(256);
        let task_id = TaskId::new("task-pipeline-2").unwrap();

        let handle = tokio::spawn(async move { driver.run(&task_id, "rust async", tx).await });

        let mut saw_failed = false;
        while let Some(event) = rx.recv().await {
            if matches!(event, PipelineEvent::Failed { .. }) {
                saw_failed = true;
            }
        }

        let result = handle.await.unwrap();
        assert!(result.is_err());
        assert!(saw_failed);
    }
}
