//! Experiment runner: score a baseline and its candidates on one dataset and
//! attach a guardrail verdict to each candidate.
//!
//! The baseline is evaluated at most once per run, concurrently with the
//! candidates, and every evaluation draws from the same request budget. A
//! candidate whose evaluation fails is reported, not fatal; a baseline that
//! cannot be scored fails the run.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::{Dataset, EvaluationResult, LoopError, PromptVersion, Result};
use crate::generator::Candidate;
use crate::guardrails::{
    evaluate_guardrails, ComparativeMetrics, Decision, GuardrailConfig, GuardrailViolation,
};
use crate::obs;
use crate::pipeline::EvaluationPipeline;

/// One candidate measured against the baseline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentOutcome {
    pub experiment_id: Uuid,
    pub candidate: Candidate,
    pub candidate_version: PromptVersion,
    /// Always on the same dataset id as `candidate_result`.
    pub baseline_result: EvaluationResult,
    pub candidate_result: EvaluationResult,
    pub metrics: ComparativeMetrics,
    pub decision: Decision,
    /// Failed guardrail checks, plus `Superseded` when another candidate won.
    pub reasons: Vec<GuardrailViolation>,
    pub critical_pass_rate: Option<f64>,
    pub format_pass_rate: Option<f64>,
}

/// A candidate that produced no scorable result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateFailure {
    pub candidate_index: usize,
    pub candidate_id: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentReport {
    pub baseline: EvaluationResult,
    /// True when a supplied baseline result was used instead of re-evaluating.
    pub baseline_reused: bool,
    /// In candidate order.
    pub outcomes: Vec<ExperimentOutcome>,
    pub failed_candidates: Vec<CandidateFailure>,
}

impl ExperimentReport {
    pub fn qualifying(&self) -> impl Iterator<Item = &ExperimentOutcome> {
        self.outcomes
            .iter()
            .filter(|o| o.decision == Decision::Promote)
    }
}

#[derive(Clone)]
pub struct ExperimentRunner {
    pipeline: EvaluationPipeline,
    guardrails: GuardrailConfig,
}

impl ExperimentRunner {
    pub fn new(pipeline: EvaluationPipeline, guardrails: GuardrailConfig) -> Self {
        Self {
            pipeline,
            guardrails,
        }
    }

    /// Whether `cached` can stand in for evaluating `baseline` on `dataset`.
    ///
    /// A cached result for a different dataset id is a caller error. One for
    /// the same id but different content is stale and gets re-evaluated.
    fn reusable(
        cached: Option<EvaluationResult>,
        baseline: &PromptVersion,
        dataset: &Dataset,
        digest: &str,
    ) -> Result<Option<EvaluationResult>> {
        let Some(cached) = cached else {
            return Ok(None);
        };
        if cached.dataset_id != dataset.dataset_id {
            return Err(LoopError::DatasetMismatch {
                baseline: cached.dataset_id,
                candidate: dataset.dataset_id.clone(),
            });
        }
        if cached.version_id != baseline.version_id {
            warn!(
                cached = %cached.version_id,
                baseline = %baseline.version_id,
                "cached baseline is for another version, re-evaluating"
            );
            return Ok(None);
        }
        if cached.dataset_digest != digest {
            warn!(
                dataset_id = %dataset.dataset_id,
                "dataset content changed since the cached baseline, re-evaluating"
            );
            return Ok(None);
        }
        Ok(Some(cached))
    }

    /// Evaluate `candidates` against `baseline` on `dataset`.
    pub async fn run(
        &self,
        baseline: &PromptVersion,
        candidates: &[Candidate],
        dataset: &Dataset,
        cached_baseline: Option<EvaluationResult>,
    ) -> Result<ExperimentReport> {
        let digest = dataset.digest()?;
        let cached = Self::reusable(cached_baseline, baseline, dataset, &digest)?;
        let baseline_reused = cached.is_some();

        let versions: Vec<PromptVersion> =
            candidates.iter().map(|c| c.into_version(baseline)).collect();

        let baseline_eval = async {
            match cached {
                Some(result) => {
                    debug!(version_id = %baseline.version_id, "reusing cached baseline");
                    Ok(result)
                }
                None => self.pipeline.evaluate(baseline, dataset).await,
            }
        };
        let candidate_evals = join_all(
            versions
                .iter()
                .map(|version| self.pipeline.evaluate(version, dataset)),
        );
        let (baseline_result, candidate_results) = tokio::join!(baseline_eval, candidate_evals);
        let baseline_result = baseline_result?;

        let mut outcomes = Vec::new();
        let mut failed_candidates = Vec::new();
        for ((candidate, version), result) in candidates.iter().zip(versions).zip(candidate_results)
        {
            let judged = result.and_then(|candidate_result| {
                self.judge_candidate(&baseline_result, candidate.clone(), version, candidate_result)
            });
            match judged {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    warn!(candidate_id = %candidate.candidate_id, error = %e, "candidate evaluation failed");
                    failed_candidates.push(CandidateFailure {
                        candidate_index: candidate.index,
                        candidate_id: candidate.candidate_id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        Ok(ExperimentReport {
            baseline: baseline_result,
            baseline_reused,
            outcomes,
            failed_candidates,
        })
    }

    fn judge_candidate(
        &self,
        baseline: &EvaluationResult,
        candidate: Candidate,
        candidate_version: PromptVersion,
        candidate_result: EvaluationResult,
    ) -> Result<ExperimentOutcome> {
        if baseline.dataset_id != candidate_result.dataset_id {
            return Err(LoopError::DatasetMismatch {
                baseline: baseline.dataset_id.clone(),
                candidate: candidate_result.dataset_id,
            });
        }
        let verdict = evaluate_guardrails(baseline, &candidate_result, &self.guardrails);
        obs::emit_guardrail_evaluated(
            &candidate.candidate_id,
            verdict.metrics.overall_delta,
            verdict.promotes(),
            verdict.violations.len(),
        );
        Ok(ExperimentOutcome {
            experiment_id: Uuid::new_v4(),
            candidate,
            candidate_version,
            baseline_result: baseline.clone(),
            candidate_result,
            metrics: verdict.metrics,
            decision: verdict.decision,
            reasons: verdict.violations,
            critical_pass_rate: verdict.critical_pass_rate,
            format_pass_rate: verdict.format_pass_rate,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use super::*;
    use crate::budget::RequestBudget;
    use crate::capability::Generation;
    use crate::config::LoopConfig;
    use crate::domain::Case;
    use crate::fakes::{classify, verdict, CallKind, ScriptedProvider};
    use crate::guardrails::{select_promotion, GuardrailCheck};

    /// Outputs echo the rendered prompt; the judge scores by which template
    /// produced it.
    fn provider() -> Arc<ScriptedProvider> {
        Arc::new(ScriptedProvider::new(|req| match classify(req) {
            CallKind::Judge(_) => {
                let score = if req.prompt.contains("Carefully answer") {
                    0.95
                } else if req.prompt.contains("Briefly answer") {
                    0.9
                } else if req.prompt.contains("Loosely answer") {
                    0.4
                } else {
                    0.7
                };
                Ok(Generation::text(verdict(score)))
            }
            _ => Ok(Generation::text(req.prompt.clone())),
        }))
    }

    fn runner(provider: Arc<ScriptedProvider>) -> ExperimentRunner {
        let cfg = LoopConfig::default();
        let pipeline = EvaluationPipeline::new(provider, &cfg, RequestBudget::new(4)).unwrap();
        ExperimentRunner::new(pipeline, cfg.guardrails)
    }

    fn candidate(index: usize, template: &str) -> Candidate {
        Candidate {
            candidate_id: format!("cand{index}"),
            index,
            template: template.into(),
            rationale: String::new(),
            expected_improvements: BTreeMap::new(),
            source_report_id: None,
            exploratory: false,
        }
    }

    fn dataset() -> Dataset {
        Dataset::new(
            "ds",
            (0..3)
                .map(|i| Case::new([("q", format!("q{i}"))]))
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_outcomes_carry_guardrail_decisions() {
        let baseline = PromptVersion::new("v1", "Answer {q}");
        let candidates = vec![
            candidate(0, "Briefly answer {q}"),
            candidate(1, "Loosely answer {q}"),
            candidate(2, "Carefully answer {q}"),
        ];
        let mut report = runner(provider())
            .run(&baseline, &candidates, &dataset(), None)
            .await
            .unwrap();

        assert!(!report.baseline_reused);
        assert_eq!(report.outcomes.len(), 3);
        for outcome in &report.outcomes {
            assert_eq!(outcome.baseline_result, report.baseline);
            assert_eq!(outcome.baseline_result.dataset_id, outcome.candidate_result.dataset_id);
        }
        assert_eq!(report.outcomes[1].decision, Decision::Reject);
        assert_eq!(report.qualifying().count(), 2);
        assert_eq!(
            report.outcomes[0].candidate_version.parent_version_id.as_deref(),
            Some("v1")
        );

        let winner = select_promotion(&mut report.outcomes).unwrap();
        assert_eq!(report.outcomes[winner].candidate.index, 2);
        let superseded = &report.outcomes[0];
        assert_eq!(superseded.decision, Decision::Reject);
        assert_eq!(superseded.reasons[0].check, GuardrailCheck::Superseded);
        assert!(superseded.reasons[0]
            .reason
            .starts_with("superseded by better candidate cand2"));
    }

    #[tokio::test]
    async fn test_cached_baseline_is_reused() {
        let provider = provider();
        let r = runner(provider.clone());
        let baseline = PromptVersion::new("v1", "Answer {q}");
        let ds = dataset();

        let first = r.run(&baseline, &[], &ds, None).await.unwrap();
        let calls = provider.call_count();
        let second = r
            .run(&baseline, &[], &ds, Some(first.baseline.clone()))
            .await
            .unwrap();

        assert!(second.baseline_reused);
        assert_eq!(second.baseline.evaluation_id, first.baseline.evaluation_id);
        assert_eq!(provider.call_count(), calls);
    }

    #[tokio::test]
    async fn test_stale_cached_baseline_is_re_evaluated() {
        let r = runner(provider());
        let baseline = PromptVersion::new("v1", "Answer {q}");
        let first = r.run(&baseline, &[], &dataset(), None).await.unwrap();

        let mut changed = dataset();
        changed.cases.push(Case::new([("q", "q3")]));
        let second = r
            .run(&baseline, &[], &changed, Some(first.baseline))
            .await
            .unwrap();
        assert!(!second.baseline_reused);
        assert_eq!(second.baseline.total_cases(), 4);
    }

    #[tokio::test]
    async fn test_cached_baseline_for_other_dataset_is_rejected() {
        let r = runner(provider());
        let baseline = PromptVersion::new("v1", "Answer {q}");
        let first = r.run(&baseline, &[], &dataset(), None).await.unwrap();

        let other = Dataset::new("other", dataset().cases);
        let err = r
            .run(&baseline, &[], &other, Some(first.baseline))
            .await
            .unwrap_err();
        assert!(matches!(err, LoopError::DatasetMismatch { .. }));
    }

    #[tokio::test]
    async fn test_outcome_across_datasets_is_rejected() {
        let provider = provider();
        let r = runner(provider.clone());
        let cfg = LoopConfig::default();
        let pipeline = EvaluationPipeline::new(provider, &cfg, RequestBudget::new(4)).unwrap();
        let baseline = PromptVersion::new("v1", "Answer {q}");
        let cand = candidate(0, "Carefully answer {q}");
        let version = cand.into_version(&baseline);

        let base_result = pipeline.evaluate(&baseline, &dataset()).await.unwrap();
        let other = Dataset::new("other", dataset().cases);
        let cand_result = pipeline.evaluate(&version, &other).await.unwrap();

        let err = r
            .judge_candidate(&base_result, cand, version, cand_result)
            .unwrap_err();
        assert!(matches!(
            err,
            LoopError::DatasetMismatch { ref baseline, ref candidate }
                if baseline == "ds" && candidate == "other"
        ));
    }

    #[tokio::test]
    async fn test_unrenderable_candidate_is_reported_not_fatal() {
        let baseline = PromptVersion::new("v1", "Answer {q}");
        let candidates = vec![candidate(0, "Answer {q} using {missing}")];
        let report = runner(provider())
            .run(&baseline, &candidates, &dataset(), None)
            .await
            .unwrap();
        assert!(report.outcomes.is_empty());
        assert_eq!(report.failed_candidates.len(), 1);
        assert!(report.failed_candidates[0].error.contains("missing"));
    }
}
