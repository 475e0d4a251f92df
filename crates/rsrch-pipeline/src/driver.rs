//! Four-stage research pipeline: plan, SERP query expansion, per-query
//! search fan-out, final report (spec.md §4.E). Each stage follows the
//! same shape: setup, rotation-wrapped model call, validator, emit events.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use rsrch_protocol::{EngineError, FinishReason, RequestParams, TaskId, TaskStep};
use rsrch_rotator::ModelRotator;
use serde::Deserialize;
use tokio::sync::mpsc::Sender;
use tracing::info_span;
use tracing::Instrument;

use crate::dedup::OrderedDedup;
use crate::events::{progress_percentage, PipelineEvent};
use crate::provider::{ModelClient, ModelEvent, SearchClient, SearchOptions};

const REPORT_PLAN_OPEN: &str = "<report-plan>";
const REPORT_PLAN_CLOSE: &str = "</report-plan>";
const SEARCH_TASK_OPEN: &str = "<search-task>";
const SEARCH_TASK_CLOSE: &str = "</search-task>";

const DEFAULT_ROTATION_ROUNDS: u32 = 3;
const DEFAULT_ROTATION_ATTEMPTS: u32 = 3;
const DEFAULT_ROTATION_BASE_DELAY: Duration = Duration::from_secs(1);
const SEARCH_KEY_ROTATION_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub thinking_models: Vec<String>,
    pub task_models: Vec<String>,
    pub search_api_keys: Vec<String>,
    pub max_result: u32,
    pub enable_citation_image: bool,
    pub enable_references: bool,
}

impl PipelineConfig {
    pub fn from_params(params: &RequestParams, search_api_keys: Vec<String>) -> Self {
        Self {
            thinking_models: params.thinking_models.clone(),
            task_models: params.task_models.clone(),
            search_api_keys,
            max_result: params.max_result,
            enable_citation_image: params.enable_citation_image,
            enable_references: params.enable_references,
        }
    }
}

#[derive(Deserialize)]
struct SerpQueryItem {
    query: String,
    #[serde(rename = "researchGoal", default)]
    research_goal: Option<String>,
}

pub struct PipelineDriver {
    model_client: Arc<dyn ModelClient>,
    search_client: Arc<dyn SearchClient>,
    config: PipelineConfig,
}

/// Outcome of one rotation-wrapped model call attempt.
struct ModelCallOutcome {
    content: String,
    finish_reason: FinishReason,
}

impl PipelineDriver {
    pub fn new(
        model_client: Arc<dyn ModelClient>,
        search_client: Arc<dyn SearchClient>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            model_client,
            search_client,
            config,
        }
    }

    /// Run all four stages for `task_id`, emitting `PipelineEvent`s on
    /// `events`. Returns the fully concatenated output buffer on success.
    pub async fn run(
        &self,
        task_id: &TaskId,
        query: &str,
        events: Sender<PipelineEvent>,
    ) -> Result<String, EngineError> {
        let span = info_span!("pipeline_run", task_id = %task_id);
        self.run_inner(task_id, query, events).instrument(span).await
    }

    async fn run_inner(
        &self,
        task_id: &TaskId,
        query: &str,
        events: Sender<PipelineEvent>,
    ) -> Result<String, EngineError> {
        let mut total = String::new();

        let plan = self.run_plan(query, &events, &mut total).await?;
        let serp_items = self.run_serp_queries(&plan, &events, &mut total).await?;
        let learnings = self
            .run_search_fanout(&serp_items, &events, &mut total)
            .await?;
        self.run_final_report(&plan, &learnings, &events, &mut total)
            .await?;

        Ok(total)
    }

    async fn emit(&self, events: &Sender<PipelineEvent>, event: PipelineEvent) {
        let _ = events.send(event).await;
    }

    async fn emit_chunk(
        &self,
        events: &Sender<PipelineEvent>,
        stage: TaskStep,
        text: &str,
        total: &mut String,
    ) {
        total.push_str(text);
        self.emit(
            events,
            PipelineEvent::Chunk {
                stage,
                text: text.to_string(),
            },
        )
        .await;
    }

    /// Drive one rotation-wrapped streaming model call to completion,
    /// validating every attempt and retrying until the rotator is
    /// exhausted. Returns the raw concatenated content and finish reason
    /// of the attempt that passed validation.
    async fn rotation_wrapped_call(
        &self,
        stage: TaskStep,
        models: &[String],
        prompt_for_attempt: impl Fn(u32) -> String,
        system: &str,
    ) -> Result<ModelCallOutcome, EngineError> {
        let mut rotator = ModelRotator::new(
            models.to_vec(),
            DEFAULT_ROTATION_ROUNDS,
            DEFAULT_ROTATION_ATTEMPTS,
            DEFAULT_ROTATION_BASE_DELAY,
        );

        let mut last_reason = String::from("model rotation exhausted with no attempts made");

        while let Some(attempt) = rotator.next_attempt() {
            tokio::time::sleep(attempt.delay).await;

            let prompt = prompt_for_attempt(attempt.attempt);
            let call_result = self
                .model_client
                .stream(&attempt.model, &prompt, system)
                .await;

            let mut stream = match call_result {
                Ok(stream) => stream,
                Err(e) => {
                    last_reason = e.to_string();
                    rotator.record_failure(&attempt);
                    continue;
                }
            };

            let mut content = String::new();
            let mut finish_reason = FinishReason::Unknown;
            while let Some(event) = stream.next().await {
                match event {
                    ModelEvent::TextDelta(delta) => content.push_str(&delta),
                    ModelEvent::Reasoning(_) | ModelEvent::Source { .. } => {}
                    ModelEvent::Finish {
                        finish_reason: reason,
                    } => finish_reason = reason,
                }
            }

            match rsrch_quality::validate(stage, &content, finish_reason, content.len()) {
                Ok(()) => {
                    rotator.record_success(&attempt);
                    return Ok(ModelCallOutcome {
                        content,
                        finish_reason,
                    });
                }
                Err(failure) => {
                    last_reason = failure.reason;
                    rotator.record_failure(&attempt);
                }
            }
        }

        Err(EngineError::StageFailed {
            stage: format!("{stage:?}"),
            reason: last_reason,
        })
    }

    async fn run_plan(
        &self,
        query: &str,
        events: &Sender<PipelineEvent>,
        total: &mut String,
    ) -> Result<String, EngineError> {
        self.emit(events, PipelineEvent::StageStarted { stage: TaskStep::ReportPlan })
            .await;
        self.emit_chunk(events, TaskStep::ReportPlan, REPORT_PLAN_OPEN, total)
            .await;

        let system = "Produce a concise research plan.";
        let result = self
            .rotation_wrapped_call(
                TaskStep::ReportPlan,
                &self.config.thinking_models,
                |_attempt| format!("Research query: {query}\nProduce a research plan."),
                system,
            )
            .await;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                self.emit(
                    events,
                    PipelineEvent::Failed {
                        stage: TaskStep::ReportPlan,
                        reason: e.to_string(),
                    },
                )
                .await;
                return Err(e);
            }
        };

        self.emit_chunk(events, TaskStep::ReportPlan, &outcome.content, total)
            .await;
        self.emit_chunk(events, TaskStep::ReportPlan, REPORT_PLAN_CLOSE, total)
            .await;
        self.emit(
            events,
            PipelineEvent::StageEnded {
                stage: TaskStep::ReportPlan,
                percentage: progress_percentage(TaskStep::ReportPlan, true),
            },
        )
        .await;

        Ok(outcome.content)
    }

    async fn run_serp_queries(
        &self,
        plan: &str,
        events: &Sender<PipelineEvent>,
        total: &mut String,
    ) -> Result<Vec<SerpQueryItem>, EngineError> {
        self.emit(events, PipelineEvent::StageStarted { stage: TaskStep::SerpQuery })
            .await;

        let system = "Emit strict JSON only: an array of {\"query\": ..., \"researchGoal\": ...} objects.";
        let result = self
            .rotation_wrapped_call(
                TaskStep::SerpQuery,
                &self.config.thinking_models,
                |attempt| {
                    if attempt == 1 {
                        format!("Plan:\n{plan}\nList search queries as strict JSON.")
                    } else {
                        format!(
                            "Plan:\n{plan}\nList search queries as strict, complete JSON. \
                             Do not truncate. Do not include any prose outside the JSON array."
                        )
                    }
                },
                system,
            )
            .await;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                self.emit(
                    events,
                    PipelineEvent::Failed {
                        stage: TaskStep::SerpQuery,
                        reason: e.to_string(),
                    },
                )
                .await;
                return Err(e);
            }
        };

        let items: Vec<SerpQueryItem> = match rsrch_json_extract::extract(&outcome.content) {
            rsrch_json_extract::ExtractOutcome::Ok { data, .. } => {
                serde_json::from_value(data).map_err(|e| EngineError::StageFailed {
                    stage: "SerpQuery".to_string(),
                    reason: format!("SERP queries did not match the expected shape: {e}"),
                })?
            }
            rsrch_json_extract::ExtractOutcome::Err { .. } => {
                let reason = "could not recover a JSON array from the SERP query output".to_string();
                self.emit(
                    events,
                    PipelineEvent::Failed {
                        stage: TaskStep::SerpQuery,
                        reason: reason.clone(),
                    },
                )
                .await;
                return Err(EngineError::StageFailed {
                    stage: "SerpQuery".to_string(),
                    reason,
                });
            }
        };

        self.emit_chunk(events, TaskStep::SerpQuery, &outcome.content, total)
            .await;
        self.emit(
            events,
            PipelineEvent::StageEnded {
                stage: TaskStep::SerpQuery,
                percentage: progress_percentage(TaskStep::SerpQuery, true),
            },
        )
        .await;

        Ok(items)
    }

    async fn run_search_fanout(
        &self,
        items: &[SerpQueryItem],
        events: &Sender<PipelineEvent>,
        total: &mut String,
    ) -> Result<String, EngineError> {
        self.emit(events, PipelineEvent::StageStarted { stage: TaskStep::Search })
            .await;

        let mut sources = OrderedDedup::new();
        let mut images = OrderedDedup::new();
        let mut learnings = String::new();

        for item in items {
            self.emit_chunk(events, TaskStep::Search, SEARCH_TASK_OPEN, total)
                .await;

            let search_result = self.search_with_key_rotation(&item.query).await;
            let search_result = match search_result {
                Ok(result) => result,
                Err(e) => {
                    self.emit(
                        events,
                        PipelineEvent::Failed {
                            stage: TaskStep::Search,
                            reason: e.to_string(),
                        },
                    )
                    .await;
                    return Err(e);
                }
            };

            for source in &search_result.sources {
                sources.insert(&source.url, source.clone());
            }
            for image in &search_result.images {
                images.insert(&image.url, image.clone());
            }

            let corpus: String = search_result
                .sources
                .iter()
                .map(|s| format!("- {}\n{}\n", s.url, s.content))
                .collect();

            let summary_result = self
                .rotation_wrapped_call(
                    TaskStep::Search,
                    &self.config.task_models,
                    |_attempt| {
                        format!(
                            "Research goal: {}\nQuery: {}\nSources:\n{corpus}\nSummarize into a learning artifact.",
                            item.research_goal.as_deref().unwrap_or(""),
                            item.query,
                        )
                    },
                    "Summarize sources into a concise, well-cited learning artifact.",
                )
                .await;

            let summary = match summary_result {
                Ok(outcome) => outcome.content,
                Err(e) => {
                    self.emit(
                        events,
                        PipelineEvent::Failed {
                            stage: TaskStep::Search,
                            reason: e.to_string(),
                        },
                    )
                    .await;
                    return Err(e);
                }
            };

            learnings.push_str(&summary);
            learnings.push('\n');

            self.emit_chunk(events, TaskStep::Search, &summary, total)
                .await;
            self.emit_chunk(events, TaskStep::Search, SEARCH_TASK_CLOSE, total)
                .await;
        }

        self.emit(
            events,
            PipelineEvent::StageEnded {
                stage: TaskStep::Search,
                percentage: progress_percentage(TaskStep::Search, true),
            },
        )
        .await;

        Ok(render_sources_and_images(&learnings, sources.into_items(), images.into_items()))
    }

    /// Rotate across `config.search_api_keys` on transport failure, up to
    /// `SEARCH_KEY_ROTATION_ATTEMPTS` tries (spec.md §4.E stage 3).
    async fn search_with_key_rotation(
        &self,
        query: &str,
    ) -> Result<crate::provider::SearchResult, EngineError> {
        if self.config.search_api_keys.is_empty() {
            return Err(EngineError::SearchExhausted {
                query: query.to_string(),
                reason: "no search API keys configured".to_string(),
            });
        }

        let mut rotator = ModelRotator::new(
            self.config.search_api_keys.clone(),
            1,
            SEARCH_KEY_ROTATION_ATTEMPTS,
            DEFAULT_ROTATION_BASE_DELAY,
        );

        let mut last_reason = String::from("search key rotation exhausted with no attempts made");

        while let Some(attempt) = rotator.next_attempt() {
            tokio::time::sleep(attempt.delay).await;

            match self
                .search_client
                .search(
                    query,
                    &attempt.model,
                    SearchOptions {
                        max_result: self.config.max_result,
                    },
                )
                .await
            {
                Ok(result) => {
                    rotator.record_success(&attempt);
                    return Ok(result);
                }
                Err(e) => {
                    last_reason = e.to_string();
                    rotator.record_failure(&attempt);
                }
            }
        }

        Err(EngineError::SearchExhausted {
            query: query.to_string(),
            reason: last_reason,
        })
    }

    async fn run_final_report(
        &self,
        plan: &str,
        learnings: &str,
        events: &Sender<PipelineEvent>,
        total: &mut String,
    ) -> Result<(), EngineError> {
        self.emit(events, PipelineEvent::StageStarted { stage: TaskStep::FinalReport })
            .await;

        let system = "Write the final research report.";
        let prefix_len = total.len() + rsrch_protocol::FINAL_REPORT_OPEN.len();

        let result = self
            .rotation_wrapped_call_with_aggregate(
                TaskStep::FinalReport,
                &self.config.thinking_models,
                |_attempt| format!("Plan:\n{plan}\nLearnings:\n{learnings}\nWrite the final report."),
                system,
                prefix_len,
            )
            .await;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                self.emit(
                    events,
                    PipelineEvent::Failed {
                        stage: TaskStep::FinalReport,
                        reason: e.to_string(),
                    },
                )
                .await;
                return Err(e);
            }
        };

        self.emit_chunk(events, TaskStep::FinalReport, rsrch_protocol::FINAL_REPORT_OPEN, total)
            .await;
        self.emit_chunk(events, TaskStep::FinalReport, &outcome.content, total)
            .await;

        if self.config.enable_references && !outcome.content.contains("](") {
            let references = format!("\n\n## References\n{learnings}");
            self.emit_chunk(events, TaskStep::FinalReport, &references, total)
                .await;
        }

        self.emit_chunk(events, TaskStep::FinalReport, rsrch_protocol::FINAL_REPORT_CLOSE, total)
            .await;

        self.emit(
            events,
            PipelineEvent::StageEnded {
                stage: TaskStep::FinalReport,
                percentage: progress_percentage(TaskStep::FinalReport, true),
            },
        )
        .await;

        Ok(())
    }

    /// Same as `rotation_wrapped_call`, but passes `prefix_len + content.len()`
    /// to the validator as the aggregate length — only `FinalReport` needs
    /// the distinction between chunk length and aggregate buffer length.
    async fn rotation_wrapped_call_with_aggregate(
        &self,
        stage: TaskStep,
        models: &[String],
        prompt_for_attempt: impl Fn(u32) -> String,
        system: &str,
        prefix_len: usize,
    ) -> Result<ModelCallOutcome, EngineError> {
        let mut rotator = ModelRotator::new(
            models.to_vec(),
            DEFAULT_ROTATION_ROUNDS,
            DEFAULT_ROTATION_ATTEMPTS,
            DEFAULT_ROTATION_BASE_DELAY,
        );

        let mut last_reason = String::from("model rotation exhausted with no attempts made");

        while let Some(attempt) = rotator.next_attempt() {
            tokio::time::sleep(attempt.delay).await;

            let prompt = prompt_for_attempt(attempt.attempt);
            let stream = match self.model_client.stream(&attempt.model, &prompt, system).await {
                Ok(stream) => stream,
                Err(e) => {
                    last_reason = e.to_string();
                    rotator.record_failure(&attempt);
                    continue;
                }
            };

            let mut content = String::new();
            let mut finish_reason = FinishReason::Unknown;
            let mut stream = stream;
            while let Some(event) = stream.next().await {
                match event {
                    ModelEvent::TextDelta(delta) => content.push_str(&delta),
                    ModelEvent::Reasoning(_) | ModelEvent::Source { .. } => {}
                    ModelEvent::Finish {
                        finish_reason: reason,
                    } => finish_reason = reason,
                }
            }

            let aggregate_len = prefix_len
                + content.len()
                + rsrch_protocol::FINAL_REPORT_CLOSE.len();

            match rsrch_quality::validate(stage, &content, finish_reason, aggregate_len) {
                Ok(()) => {
                    rotator.record_success(&attempt);
                    return Ok(ModelCallOutcome {
                        content,
                        finish_reason,
                    });
                }
                Err(failure) => {
                    last_reason = failure.reason;
                    rotator.record_failure(&attempt);
                }
            }
        }

        Err(EngineError::StageFailed {
            stage: format!("{stage:?}"),
            reason: last_reason,
        })
    }
}

fn render_sources_and_images(
    learnings: &str,
    sources: Vec<crate::provider::SearchSource>,
    images: Vec<crate::provider::SearchImage>,
) -> String {
    let mut out = learnings.to_string();

    if !sources.is_empty() {
        out.push_str("\n\n## Sources\n");
        for (i, source) in sources.iter().enumerate() {
            out.push_str(&format!(
                "{}. [{}]({})\n",
                i + 1,
                source.title.as_deref().unwrap_or(&source.url),
                source.url
            ));
        }
    }

    if !images.is_empty() {
        out.push_str("\n\n## Images\n");
        for image in &images {
            out.push_str(&format!(
                "![{}]({})\n",
                image.description.as_deref().unwrap_or(""),
                image.url
            ));
        }
    }

    out
}
