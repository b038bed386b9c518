//! The self-improvement loop: evaluate, analyze, generate, experiment,
//! and optionally promote.
//!
//! Nothing here is persisted. The version under test is an argument and the
//! promoted candidate is a return value; the caller decides what becomes the
//! active version.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, Instrument};

use crate::analyzer::{FailureAnalyzer, FailureReport};
use crate::budget::RequestBudget;
use crate::capability::{GenerationProvider, TemplateRenderer};
use crate::changelog::render_promotion_summary;
use crate::config::LoopConfig;
use crate::domain::{ConfigError, Dataset, EvaluationResult, PromptVersion, Result};
use crate::experiment::{CandidateFailure, ExperimentOutcome, ExperimentRunner};
use crate::generator::{Candidate, CandidateBatch, CandidateGenerator};
use crate::guardrails::{check_absolute, select_promotion, GuardrailConfig, GuardrailViolation};
use crate::metrics::METRICS;
use crate::pipeline::EvaluationPipeline;

/// Result of a standalone evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub result: EvaluationResult,
    /// Present when guardrails were supplied: the single-result checks
    /// (absolute score, critical cases, format) that failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guardrail_violations: Option<Vec<GuardrailViolation>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelfImprovementReport {
    pub baseline: EvaluationResult,
    pub failure_report: FailureReport,
    pub candidates: CandidateBatch,
    pub experiments: Vec<ExperimentOutcome>,
    pub failed_candidates: Vec<CandidateFailure>,
    /// Set only under `auto_promote`, when a candidate passed every guardrail.
    pub promoted: Option<Candidate>,
    pub promoted_version: Option<PromptVersion>,
    pub auto_promoted: bool,
    /// Markdown changelog entry for `promoted`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub promotion_summary: Option<String>,
}

impl SelfImprovementReport {
    pub fn candidates_generated(&self) -> usize {
        self.candidates.candidates.len()
    }
}

#[derive(Clone)]
pub struct SelfImprovementLoop {
    pipeline: EvaluationPipeline,
    analyzer: FailureAnalyzer,
    generator: CandidateGenerator,
    guardrails: GuardrailConfig,
}

impl SelfImprovementLoop {
    /// Every component shares one request budget of
    /// `concurrency.request_budget` slots.
    pub fn new(
        provider: Arc<dyn GenerationProvider>,
        config: &LoopConfig,
    ) -> std::result::Result<Self, ConfigError> {
        let budget = RequestBudget::new(config.concurrency.request_budget);
        let pipeline = EvaluationPipeline::new(provider.clone(), config, budget.clone())?;
        let analyzer = FailureAnalyzer::new(
            config.analyzer.clone(),
            Arc::new(config.scoring.clone()),
        );
        let generator = CandidateGenerator::new(
            provider,
            config.generator.clone(),
            config.retry.clone(),
            budget,
        );
        Ok(Self {
            pipeline,
            analyzer,
            generator,
            guardrails: config.guardrails,
        })
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn TemplateRenderer>) -> Self {
        self.pipeline = self.pipeline.with_renderer(renderer);
        self
    }

    pub fn guardrails(&self) -> &GuardrailConfig {
        &self.guardrails
    }

    /// Score `version` on `dataset`, checking `guardrails` when given.
    pub async fn evaluate(
        &self,
        version: &PromptVersion,
        dataset: &Dataset,
        guardrails: Option<&GuardrailConfig>,
    ) -> Result<EvaluationReport> {
        let result = self.pipeline.evaluate(version, dataset).await?;
        let guardrail_violations = guardrails.map(|g| check_absolute(&result, g));
        METRICS.flush();
        Ok(EvaluationReport {
            result,
            guardrail_violations,
        })
    }

    /// One iteration of the loop, starting from `version`.
    ///
    /// At most `min(max_candidates, max_candidates_per_iteration)` candidates
    /// are generated. Under `auto_promote` at most one is promoted.
    pub async fn run(
        &self,
        version: &PromptVersion,
        dataset: &Dataset,
        auto_promote: bool,
        max_candidates: usize,
    ) -> Result<SelfImprovementReport> {
        let span = tracing::info_span!(
            "promptvc.self_improvement",
            version_id = %version.version_id,
            dataset_id = %dataset.dataset_id
        );
        async move {
            let baseline = self.pipeline.evaluate(version, dataset).await?;
            let failure_report = self.analyzer.analyze(&baseline, dataset);
            info!(
                failures = failure_report.total_failures,
                clusters = failure_report.clusters.len(),
                "baseline analyzed"
            );

            let max = max_candidates.min(self.guardrails.max_candidates_per_iteration());
            let candidates = self.generator.generate(version, &failure_report, max).await;

            let runner = ExperimentRunner::new(self.pipeline.clone(), self.guardrails);
            let experiment = runner
                .run(version, &candidates.candidates, dataset, Some(baseline))
                .await?;
            let mut experiments = experiment.outcomes;

            let mut promoted = None;
            let mut promoted_version = None;
            let mut promotion_summary = None;
            if auto_promote {
                if let Some(w) = select_promotion(&mut experiments) {
                    let outcome = &experiments[w];
                    promotion_summary =
                        Some(render_promotion_summary(version, &experiment.baseline, outcome));
                    promoted = Some(outcome.candidate.clone());
                    promoted_version = Some(outcome.candidate_version.clone());
                }
            }

            METRICS.flush();
            Ok(SelfImprovementReport {
                baseline: experiment.baseline,
                failure_report,
                candidates,
                experiments,
                failed_candidates: experiment.failed_candidates,
                auto_promoted: promoted.is_some(),
                promoted,
                promoted_version,
                promotion_summary,
            })
        }
        .instrument(span)
        .await
    }
}
