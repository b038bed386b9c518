//! Structured lifecycle events for the self-improvement loop.
//!
//! Every event carries an `event` field so log pipelines can filter on it.
//! Version identifiers appear in these events but never in judge prompts.

use tracing::{debug, info, warn};

use crate::domain::{CaseErrorKind, Dimension};

/// Span scoping one evaluation run.
///
/// Async code attaches it with `tracing::Instrument`; sync code can hold
/// [`EvaluationSpan::enter`] for the duration of the work.
#[derive(Debug, Clone)]
pub struct EvaluationSpan {
    span: tracing::Span,
}

impl EvaluationSpan {
    pub fn new(evaluation_id: &str, dataset_id: &str) -> Self {
        Self {
            span: tracing::info_span!(
                "promptvc.evaluation",
                evaluation_id = %evaluation_id,
                dataset_id = %dataset_id
            ),
        }
    }

    pub fn span(&self) -> tracing::Span {
        self.span.clone()
    }

    pub fn enter(&self) -> tracing::span::Entered<'_> {
        self.span.enter()
    }
}

pub fn emit_evaluation_started(version_id: &str, dataset_id: &str, cases: usize) {
    info!(
        event = "evaluation.started",
        version_id = %version_id,
        dataset_id = %dataset_id,
        cases = cases,
    );
}

pub fn emit_evaluation_finished(
    version_id: &str,
    aggregate_score: f64,
    passed: usize,
    failed: usize,
    errors: usize,
    duration_ms: u64,
) {
    info!(
        event = "evaluation.finished",
        version_id = %version_id,
        aggregate_score = aggregate_score,
        passed = passed,
        failed = failed,
        errors = errors,
        duration_ms = duration_ms,
    );
}

/// A case could not be scored (warning level).
pub fn emit_case_error(case_index: usize, kind: CaseErrorKind, attempts: u32, message: &str) {
    warn!(
        event = "case.error",
        case_index = case_index,
        kind = %kind,
        attempts = attempts,
        error = %message,
    );
}

pub fn emit_judge_parse_retry(dimension: &Dimension, reason: &str) {
    info!(event = "judge.parse_retry", dimension = %dimension, reason = %reason);
}

pub fn emit_candidates_generated(requested: usize, accepted: usize, shortfall: usize) {
    info!(
        event = "candidates.generated",
        requested = requested,
        accepted = accepted,
        shortfall = shortfall,
    );
}

pub fn emit_guardrail_evaluated(
    candidate_id: &str,
    overall_delta: f64,
    promote: bool,
    violations: usize,
) {
    info!(
        event = "guardrail.evaluated",
        candidate_id = %candidate_id,
        overall_delta = overall_delta,
        promote = promote,
        violations = violations,
    );
}

pub fn emit_promotion_selected(candidate_id: &str, overall_delta: f64, aggregate_score: f64) {
    info!(
        event = "promotion.selected",
        candidate_id = %candidate_id,
        overall_delta = overall_delta,
        aggregate_score = aggregate_score,
    );
}

pub fn emit_route_assigned(version: &str, is_canary: bool, position: f64) {
    debug!(
        event = "route.assigned",
        version = %version,
        is_canary = is_canary,
        position = position,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evaluation_span_enter() {
        let span = EvaluationSpan::new("eval-1", "smoke");
        let _guard = span.enter();
        emit_evaluation_started("v1", "smoke", 3);
    }
}
