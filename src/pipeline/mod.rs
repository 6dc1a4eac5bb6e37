pub mod executor;
pub mod extract;
pub mod quality;
pub mod reconcile;
pub mod stages;

use crate::catalog::{CatalogClient, CatalogError};
use crate::config::{ReconcileConfig, ScoringConfig};
use crate::models::{AnalysisResult, AttributeDefinition, StageKind, StageReport, Subject};
use chrono::Utc;
use executor::StageExecutor;
use extract::{Extracted, extract};
use serde_json::json;
use std::{sync::Arc, time::Instant};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Result of one inference stage after extraction. A degraded stage carries
/// its fallback fields and never aborts the run.
#[derive(Debug, Clone)]
pub struct StageRun {
    pub stage: StageKind,
    pub extracted: Extracted,
    pub degraded: bool,
}

#[derive(Clone)]
pub struct Pipeline {
    executor: StageExecutor,
    catalog: Arc<dyn CatalogClient>,
    scoring: ScoringConfig,
    reconcile: ReconcileConfig,
}

impl Pipeline {
    pub fn new(
        executor: StageExecutor,
        catalog: Arc<dyn CatalogClient>,
        scoring: ScoringConfig,
        reconcile: ReconcileConfig,
    ) -> Self {
        Self {
            executor,
            catalog,
            scoring,
            reconcile,
        }
    }

    /// A category with no definitions is as unusable as an unknown one.
    pub async fn load_catalog(&self, category_id: &str) -> Result<Vec<AttributeDefinition>, PipelineError> {
        if category_id.trim().is_empty() {
            return Err(PipelineError::invalid_input("load_catalog", "category id is empty"));
        }
        match self.catalog.lookup(category_id).await {
            Ok(defs) if defs.is_empty() => Err(PipelineError::not_found(
                "load_catalog",
                format!("category `{category_id}` has no attribute definitions"),
            )),
            Ok(defs) => Ok(defs),
            Err(err @ CatalogError::NotFound(_)) => {
                Err(PipelineError::not_found("load_catalog", err.to_string()))
            }
            Err(err) => Err(PipelineError::internal("load_catalog", err.to_string())),
        }
    }

    pub async fn run_stage_one(&self, subject: &Subject, reports: &mut Vec<StageReport>) -> StageRun {
        let request = stages::extract_request(subject);
        self.capture_stage(&request, reports, || {
            Extracted::fallback(stages::stage_one_fallback(subject))
        })
        .await
    }

    pub async fn run_stage_two(
        &self,
        subject: &Subject,
        stage1: &StageRun,
        catalog: &[AttributeDefinition],
        reports: &mut Vec<StageReport>,
    ) -> StageRun {
        let request = stages::align_request(subject, &stage1.extracted, catalog);
        self.capture_stage(&request, reports, || Extracted::fallback(Default::default()))
            .await
    }

    /// Reconciles both stages, picks the generated text and scores the card.
    pub fn assemble(
        &self,
        task_id: Uuid,
        subject: &Subject,
        stage1: &StageRun,
        stage2: &StageRun,
        catalog: &[AttributeDefinition],
        stages: Vec<StageReport>,
    ) -> AnalysisResult {
        let attributes = reconcile::reconcile(
            &stage1.extracted.fields,
            &stage2.extracted.fields,
            catalog,
            &self.reconcile,
        );
        let title = stages::pick_title(
            &stage2.extracted,
            &stage1.extracted,
            subject,
            self.scoring.max_title_len,
        );
        let description = stages::pick_description(&stage2.extracted, &stage1.extracted, subject);
        let quality = quality::score(
            &attributes,
            catalog.len(),
            title.chars().count(),
            description.chars().count(),
            &self.scoring,
        );
        info!(
            target = "cardforge.pipeline",
            task_id = %task_id,
            attributes = attributes.len(),
            fill_rate = quality.fill_rate,
            score = quality.overall_score,
            acceptable = quality.acceptable,
            "analysis_assembled"
        );

        let degraded_stages = [stage1, stage2]
            .iter()
            .filter(|run| run.degraded)
            .map(|run| run.stage)
            .collect();

        AnalysisResult {
            task_id,
            subject_id: subject.id.clone(),
            title,
            description,
            attributes,
            quality,
            stage1_parsed: stage1.extracted.parsed,
            stage2_parsed: stage2.extracted.parsed,
            degraded_stages,
            stages,
            generated_at: Utc::now(),
        }
    }

    async fn capture_stage<F>(
        &self,
        request: &crate::llm::InferenceRequest,
        reports: &mut Vec<StageReport>,
        fallback: F,
    ) -> StageRun
    where
        F: FnOnce() -> Extracted,
    {
        let stage = request.stage;
        let started = Instant::now();
        let result = self.executor.run_stage(request).await;
        let elapsed_ms = started.elapsed().as_millis();

        let (run, output) = match result {
            Ok(out) => {
                let extracted = extract(&out.payload);
                if let Some(raw) = extracted.raw_text() {
                    debug!(
                        target = "cardforge.pipeline",
                        stage = stage.as_str(),
                        raw_chars = raw.chars().count(),
                        "stage_output_kept_as_raw_text"
                    );
                }
                crate::metrics::stage_elapsed(stage.as_str(), elapsed_ms, out.attempts);
                let output = json!({
                    "outcome": "ok",
                    "attempts": out.attempts,
                    "payload": out.payload.kind(),
                    "parsed": extracted.parsed,
                });
                (
                    StageRun {
                        stage,
                        extracted,
                        degraded: false,
                    },
                    output,
                )
            }
            Err(failure) => {
                warn!(
                    target = "cardforge.pipeline",
                    stage = stage.as_str(),
                    error = %failure,
                    "stage_degraded"
                );
                crate::metrics::stage_elapsed(stage.as_str(), elapsed_ms, failure.attempts);
                let output = json!({
                    "outcome": "degraded",
                    "attempts": failure.attempts,
                    "terminal": failure.class == executor::FailureClass::Terminal,
                    "error": failure.message,
                });
                (
                    StageRun {
                        stage,
                        extracted: fallback(),
                        degraded: true,
                    },
                    output,
                )
            }
        };
        reports.push(StageReport::new(stage.as_str(), elapsed_ms, output));
        run
    }
}

#[derive(Debug, Error)]
#[error("stage `{stage}` failed: {message}")]
pub struct PipelineError {
    stage: &'static str,
    message: String,
    kind: PipelineErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineErrorKind {
    InvalidInput,
    NotFound,
    Internal,
}

impl PipelineError {
    pub fn invalid_input(stage: &'static str, message: impl Into<String>) -> Self {
        Self::with_kind(stage, message, PipelineErrorKind::InvalidInput)
    }

    pub fn not_found(stage: &'static str, message: impl Into<String>) -> Self {
        Self::with_kind(stage, message, PipelineErrorKind::NotFound)
    }

    pub fn internal(stage: &'static str, message: impl Into<String>) -> Self {
        Self::with_kind(stage, message, PipelineErrorKind::Internal)
    }

    fn with_kind(stage: &'static str, message: impl Into<String>, kind: PipelineErrorKind) -> Self {
        Self {
            stage,
            message: message.into(),
            kind,
        }
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn kind(&self) -> PipelineErrorKind {
        self.kind
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmError;
    use crate::models::{AttributeValue, StageKind};
    use crate::pipeline::executor::RetryPolicy;
    use crate::testing::{RecordingSleeper, ScriptedInference, StaticCatalog, sample_subject, watch_catalog};
    use serde_json::json;
    use std::time::Duration;

    fn pipeline(inference: ScriptedInference, catalog: StaticCatalog) -> Pipeline {
        let executor = StageExecutor::new(
            Arc::new(inference),
            Arc::new(RecordingSleeper::default()),
            RetryPolicy {
                max_attempts: 3,
                backoff_base: Duration::from_millis(1),
            },
        );
        Pipeline::new(
            executor,
            Arc::new(catalog),
            ScoringConfig::default(),
            ReconcileConfig::default(),
        )
    }

    #[tokio::test]
    async fn missing_and_empty_categories_are_not_found() {
        let pipeline = pipeline(
            ScriptedInference::new(vec![]),
            StaticCatalog::new().with("empty", vec![]),
        );
        let err = pipeline.load_catalog("unknown").await.expect_err("unknown");
        assert_eq!(err.kind(), PipelineErrorKind::NotFound);
        let err = pipeline.load_catalog("empty").await.expect_err("empty");
        assert_eq!(err.kind(), PipelineErrorKind::NotFound);
        let err = pipeline.load_catalog(" ").await.expect_err("blank");
        assert_eq!(err.kind(), PipelineErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn both_stages_feed_the_analysis() {
        let pipeline = pipeline(
            ScriptedInference::new(vec![
                Ok(json!("```json\n{\"бренд\": \"Casio\"}\n```")),
                Ok(json!([{"type": "message", "content": "{\"title\": \"Часы Casio\", \"attributes\": [{\"id\": 85, \"value\": \"Casio\"}, {\"name\": \"Диаметр корпуса, мм\", \"value\": \"38 мм\"}]}"}])),
            ]),
            StaticCatalog::new().with("watches", watch_catalog()),
        );
        let subject = sample_subject("sku-1");
        let catalog = pipeline.load_catalog(&subject.category_id).await.expect("catalog");
        let mut reports = Vec::new();
        let stage1 = pipeline.run_stage_one(&subject, &mut reports).await;
        let stage2 = pipeline.run_stage_two(&subject, &stage1, &catalog, &mut reports).await;
        let result = pipeline.assemble(Uuid::nil(), &subject, &stage1, &stage2, &catalog, reports);

        assert!(result.stage1_parsed && result.stage2_parsed);
        assert!(result.degraded_stages.is_empty());
        assert_eq!(result.title, "Часы Casio");
        assert_eq!(result.stages.len(), 2);
        assert_eq!(result.stages[0].name, "extract_attributes");
        let diameter = result.attributes.iter().find(|a| a.id == 4501).expect("diameter");
        assert_eq!(diameter.value, AttributeValue::Number(38.0));
        assert_eq!(result.quality.fill_rate, 25);
    }

    #[tokio::test]
    async fn failed_stages_degrade_to_fallbacks() {
        let pipeline = pipeline(
            ScriptedInference::new(vec![
                Err(LlmError::Http("HTTP 400: invalid_parameter model".into())),
                Err(LlmError::Http("HTTP 400: invalid_parameter model".into())),
            ]),
            StaticCatalog::new().with("watches", watch_catalog()),
        );
        let subject = sample_subject("sku-2");
        let catalog = pipeline.load_catalog("watches").await.expect("catalog");
        let mut reports = Vec::new();
        let stage1 = pipeline.run_stage_one(&subject, &mut reports).await;
        assert!(stage1.degraded);
        assert_eq!(stage1.extracted.fields["name"], json!(subject.name));
        let stage2 = pipeline.run_stage_two(&subject, &stage1, &catalog, &mut reports).await;
        let result = pipeline.assemble(Uuid::nil(), &subject, &stage1, &stage2, &catalog, reports);

        assert_eq!(
            result.degraded_stages,
            vec![StageKind::ExtractAttributes, StageKind::AlignCatalog]
        );
        assert_eq!(result.title, subject.name);
        assert_eq!(result.stages[1].output["outcome"], json!("degraded"));
        assert_eq!(result.stages[1].output["terminal"], json!(true));
        assert!(!result.quality.acceptable);
    }
}
