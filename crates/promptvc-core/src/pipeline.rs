//! Evaluation pipeline: run one prompt version over a dataset.
//!
//! Every case is rendered up front, so a template that cannot render aborts
//! the evaluation before any provider call is made. Cases then run
//! concurrently, bounded by `max_concurrency` per evaluation and by the shared
//! [`RequestBudget`] across evaluations. Provider and judge failures become
//! case errors; only a dataset with no scorable case fails the call.

use std::sync::Arc;
use std::time::Instant;

use tracing::Instrument;
use uuid::Uuid;

use crate::budget::RequestBudget;
use crate::capability::{
    BraceTemplateRenderer, GenerationProvider, GenerationRequest, ModelParams, TemplateRenderer,
    Usage,
};
use crate::config::LoopConfig;
use crate::domain::{
    Case, CaseError, CaseResult, ConfigError, Dataset, Dimension, EvaluationResult, LoopError,
    PromptVersion, Result, ScoreMethod,
};
use crate::judge::{JudgeAdapter, JudgeRequest};
use crate::metrics::METRICS;
use crate::obs::{self, EvaluationSpan};
use crate::retry::{call_with_retry, case_error_kind, RetryPolicy};
use crate::scoring::ScoringConfig;
use crate::validators::ValidatorSet;

#[derive(Clone)]
pub struct EvaluationPipeline {
    provider: Arc<dyn GenerationProvider>,
    renderer: Arc<dyn TemplateRenderer>,
    judge: JudgeAdapter,
    scoring: Arc<ScoringConfig>,
    generation: ModelParams,
    retry: RetryPolicy,
    budget: RequestBudget,
    max_concurrency: usize,
}

impl EvaluationPipeline {
    /// Build a pipeline that draws every provider call from `budget`.
    pub fn new(
        provider: Arc<dyn GenerationProvider>,
        config: &LoopConfig,
        budget: RequestBudget,
    ) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        let judge = JudgeAdapter::new(
            provider.clone(),
            config.judge.clone(),
            config.retry.clone(),
            budget.clone(),
        );
        Ok(Self {
            provider,
            renderer: Arc::new(BraceTemplateRenderer),
            judge,
            scoring: Arc::new(config.scoring.clone()),
            generation: config.generation.clone(),
            retry: config.retry.clone(),
            budget,
            max_concurrency: config.concurrency.max_concurrency,
        })
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn TemplateRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn scoring(&self) -> &ScoringConfig {
        &self.scoring
    }

    pub fn budget(&self) -> &RequestBudget {
        &self.budget
    }

    /// Evaluate `version` on every case of `dataset`.
    pub async fn evaluate(
        &self,
        version: &PromptVersion,
        dataset: &Dataset,
    ) -> Result<EvaluationResult> {
        let validators = Arc::new(ValidatorSet::new(&version.validator_specs())?);

        let prompts = dataset
            .cases
            .iter()
            .enumerate()
            .map(|(case_index, case)| {
                self.renderer
                    .render(&version.template, &case.input)
                    .map_err(|source| LoopError::Render { case_index, source })
            })
            .collect::<Result<Vec<String>>>()?;

        let digest = dataset.digest()?;
        let evaluation_id = Uuid::new_v4();
        let span = EvaluationSpan::new(&evaluation_id.to_string(), &dataset.dataset_id);

        async move {
            obs::emit_evaluation_started(&version.version_id, &dataset.dataset_id, dataset.len());
            let started = Instant::now();

            let sem = Arc::new(tokio::sync::Semaphore::new(self.max_concurrency.max(1)));
            let mut tasks = Vec::with_capacity(prompts.len());
            for (case_index, (case, prompt)) in
                dataset.cases.iter().cloned().zip(prompts).enumerate()
            {
                let pipeline = self.clone();
                let validators = Arc::clone(&validators);
                let sem = Arc::clone(&sem);
                let task = tokio::spawn(
                    async move {
                        let _permit = sem.acquire_owned().await.ok();
                        pipeline
                            .evaluate_case(case_index, case, prompt, &validators)
                            .await
                    }
                    .in_current_span(),
                );
                tasks.push(task);
            }

            let mut case_results = Vec::with_capacity(tasks.len());
            for task in tasks {
                case_results.push(task.await.map_err(|e| LoopError::Join(e.to_string()))?);
            }

            let mut result = EvaluationResult::from_case_results(
                &version.version_id,
                &dataset.dataset_id,
                digest,
                case_results,
            )?;
            result.evaluation_id = evaluation_id;

            obs::emit_evaluation_finished(
                &result.version_id,
                result.aggregate_score,
                result.passed_cases,
                result.failed_cases,
                result.error_cases,
                started.elapsed().as_millis() as u64,
            );
            Ok(result)
        }
        .instrument(span.span())
        .await
    }

    async fn evaluate_case(
        &self,
        case_index: usize,
        case: Case,
        prompt: String,
        validators: &ValidatorSet,
    ) -> CaseResult {
        let critical = case.is_critical();
        let request = GenerationRequest {
            system: None,
            prompt,
            params: self.generation.clone(),
        };
        let attempted = call_with_retry(&self.retry, &self.budget, || {
            self.provider.generate(request.clone())
        })
        .await;

        let generation = match attempted.result {
            Ok(g) => g,
            Err(failure) => {
                let error = CaseError {
                    kind: case_error_kind(&failure),
                    message: failure.to_string(),
                    attempts: attempted.attempts,
                    dimension: None,
                };
                return errored(case_index, critical, None, error, Usage::default());
            }
        };

        let output = generation.text;
        let mut usage = generation.usage;
        let mut scores = Vec::with_capacity(self.scoring.dimensions.len());
        let mut missing = Vec::new();

        for dimension in &self.scoring.dimensions {
            if *dimension == Dimension::FormatAdherence {
                if let Some(vs) = validators.score(&output) {
                    let details = vs.failure_details();
                    scores.push(self.scoring.score(
                        dimension.clone(),
                        vs.score,
                        ScoreMethod::Validators,
                        None,
                        details,
                    ));
                    continue;
                }
                if !self.scoring.judge_format_without_validators {
                    missing.push(dimension.clone());
                    continue;
                }
            }

            let request = JudgeRequest::for_case(dimension.clone(), output.clone(), &case);
            match self.judge.judge(&request).await {
                Ok(judgment) => {
                    usage += judgment.usage;
                    let verdict = judgment.verdict;
                    let rationale = Some(verdict.explanation).filter(|e| !e.is_empty());
                    scores.push(self.scoring.score(
                        dimension.clone(),
                        verdict.score,
                        ScoreMethod::Judge,
                        rationale,
                        verdict.weaknesses,
                    ));
                }
                Err(error) => return errored(case_index, critical, Some(output), error, usage),
            }
        }

        METRICS.inc_cases_evaluated();
        self.scoring
            .finalize_case(case_index, critical, output, scores, missing, usage)
    }
}

fn errored(
    case_index: usize,
    critical: bool,
    output: Option<String>,
    error: CaseError,
    usage: Usage,
) -> CaseResult {
    METRICS.inc_case_errors();
    obs::emit_case_error(case_index, error.kind, error.attempts, &error.message);
    CaseResult::errored(case_index, critical, output, error, usage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{Generation, ProviderFailure, RenderError};
    use crate::domain::CaseErrorKind;
    use crate::fakes::{classify, verdict, CallKind, ScriptedProvider};
    use crate::validators::ValidatorSpec;
    use serde_json::json;

    fn config() -> LoopConfig {
        let mut cfg = LoopConfig::default();
        cfg.retry.backoff_base_ms = 1;
        cfg.retry.backoff_max_ms = 1;
        cfg
    }

    fn pipeline(provider: Arc<ScriptedProvider>, cfg: &LoopConfig) -> EvaluationPipeline {
        EvaluationPipeline::new(provider, cfg, RequestBudget::new(8)).unwrap()
    }

    fn dataset(n: usize) -> Dataset {
        Dataset::new(
            "ds",
            (0..n)
                .map(|i| Case::new([("q", format!("question {i}"))]))
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_render_error_aborts_before_any_call() {
        let provider = Arc::new(ScriptedProvider::always(verdict(1.0)));
        let p = pipeline(provider.clone(), &config());
        let mut ds = dataset(2);
        ds.cases[1].input.clear();

        let err = p
            .evaluate(&PromptVersion::new("v1", "Answer {q}"), &ds)
            .await
            .unwrap_err();
        match err {
            LoopError::Render { case_index, source } => {
                assert_eq!(case_index, 1);
                assert_eq!(source, RenderError::MissingVariable("q".into()));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn test_results_are_ordered_by_case_index() {
        let provider = Arc::new(
            ScriptedProvider::new(|req| match classify(req) {
                CallKind::Judge(_) => Ok(Generation::text(verdict(0.9))),
                _ => Ok(Generation::text(req.prompt.clone())),
            })
            .with_delay(std::time::Duration::from_millis(2)),
        );
        let result = pipeline(provider, &config())
            .evaluate(&PromptVersion::new("v1", "Answer {q}"), &dataset(12))
            .await
            .unwrap();

        let idx: Vec<usize> = result.case_results.iter().map(|c| c.case_index).collect();
        assert_eq!(idx, (0..12).collect::<Vec<_>>());
        assert_eq!(
            result.case_results[5].output.as_deref(),
            Some("Answer question 5")
        );
        assert_eq!(result.passed_cases, 12);
    }

    #[tokio::test]
    async fn test_format_scored_by_validators_without_judge() {
        let provider = Arc::new(ScriptedProvider::new(|req| match classify(req) {
            CallKind::Judge(Dimension::FormatAdherence) => {
                Err(ProviderFailure::Rejected("format must not be judged".into()))
            }
            CallKind::Judge(_) => Ok(Generation::text(verdict(1.0))),
            _ => Ok(Generation::text(r#"{"answer": "x"}"#)),
        }));
        let version = PromptVersion::new("v1", "Answer {q}").with_validator(
            ValidatorSpec::JsonSchema {
                schema: json!({"type": "object", "required": ["answer"]}),
            },
        )
        .unwrap();

        let result = pipeline(provider, &config())
            .evaluate(&version, &dataset(2))
            .await
            .unwrap();
        let score = result.case_results[0]
            .score_for(&Dimension::FormatAdherence)
            .unwrap();
        assert_eq!(score.method, ScoreMethod::Validators);
        assert_eq!(score.score, 1.0);
        assert_eq!(result.error_cases, 0);
    }

    #[tokio::test]
    async fn test_rejected_generation_is_case_error() {
        let provider = Arc::new(ScriptedProvider::new(|req| match classify(req) {
            CallKind::Output if req.prompt.ends_with("question 0") => {
                Err(ProviderFailure::Rejected("policy".into()))
            }
            CallKind::Judge(_) => Ok(Generation::text(verdict(1.0))),
            _ => Ok(Generation::text("fine")),
        }));
        let result = pipeline(provider, &config())
            .evaluate(&PromptVersion::new("v1", "Answer {q}"), &dataset(3))
            .await
            .unwrap();

        assert_eq!(result.error_cases, 1);
        let err = result.case_results[0].error.as_ref().unwrap();
        assert_eq!(err.kind, CaseErrorKind::ProviderRejected);
        assert_eq!(err.attempts, 1);
        assert_eq!(result.passed_cases + result.failed_cases, 2);
        assert_eq!(result.aggregate_score, 1.0);
    }

    #[tokio::test]
    async fn test_unscored_format_is_flagged_not_zeroed() {
        let mut cfg = config();
        cfg.scoring.judge_format_without_validators = false;
        let provider = Arc::new(ScriptedProvider::new(|req| match classify(req) {
            CallKind::Judge(_) => Ok(Generation::text(verdict(0.8))),
            _ => Ok(Generation::text("out")),
        }));

        let result = pipeline(provider, &cfg)
            .evaluate(&PromptVersion::new("v1", "Answer {q}"), &dataset(1))
            .await
            .unwrap();
        assert!(result
            .missing_dimensions
            .contains(&Dimension::FormatAdherence));
        assert!(!result
            .dimension_means
            .contains_key(&Dimension::FormatAdherence));
        assert!((result.aggregate_score - 0.8).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_empty_dataset_is_evaluation_error() {
        let provider = Arc::new(ScriptedProvider::always("x"));
        let err = pipeline(provider, &config())
            .evaluate(&PromptVersion::new("v1", "Answer {q}"), &dataset(0))
            .await
            .unwrap_err();
        assert!(matches!(err, LoopError::Evaluation { error_cases: 0, .. }));
    }
}
