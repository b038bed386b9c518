//! Promotion guardrails.
//!
//! [`evaluate_guardrails`] is a pure function of a baseline result, a
//! candidate result and a [`GuardrailConfig`]. It reports every failing check,
//! in a fixed order, rather than stopping at the first.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::{ConfigError, Dimension, EvaluationResult};
use crate::experiment::ExperimentOutcome;
use crate::metrics::METRICS;
use crate::obs;
use crate::scoring::SCORE_EPSILON;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Raw guardrail thresholds, as written in config files.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardrailThresholds {
    /// Minimum overall delta (candidate − baseline aggregate).
    pub min_improvement_threshold: f64,
    /// Minimum candidate aggregate score.
    pub min_absolute_score: f64,
    /// Largest drop allowed on any single dimension mean.
    pub regression_threshold: f64,
    /// Minimum share of critical cases that must pass.
    pub critical_case_pass_rate: f64,
    /// Minimum share of cases whose format_adherence score passes.
    pub format_pass_rate: f64,
    pub max_candidates_per_iteration: usize,
}

impl Default for GuardrailThresholds {
    fn default() -> Self {
        Self {
            min_improvement_threshold: 0.05,
            min_absolute_score: 0.7,
            regression_threshold: 0.02,
            critical_case_pass_rate: 0.95,
            format_pass_rate: 0.98,
            max_candidates_per_iteration: 5,
        }
    }
}

/// Validated guardrail thresholds. Cannot be built, or deserialized, with
/// out-of-range values.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "GuardrailThresholds", into = "GuardrailThresholds")]
pub struct GuardrailConfig {
    thresholds: GuardrailThresholds,
}

impl GuardrailConfig {
    pub fn new(thresholds: GuardrailThresholds) -> Result<Self, ConfigError> {
        let unit = [
            ("min_improvement_threshold", thresholds.min_improvement_threshold),
            ("min_absolute_score", thresholds.min_absolute_score),
            ("regression_threshold", thresholds.regression_threshold),
            ("critical_case_pass_rate", thresholds.critical_case_pass_rate),
            ("format_pass_rate", thresholds.format_pass_rate),
        ];
        for (name, value) in unit {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::OutOfUnitRange {
                    field: format!("guardrails.{name}"),
                    value,
                });
            }
        }
        if thresholds.max_candidates_per_iteration == 0 {
            return Err(ConfigError::ZeroCount {
                field: "guardrails.max_candidates_per_iteration".into(),
            });
        }
        Ok(Self { thresholds })
    }

    /// 0.05 / 0.7 / 0.02 / 0.95 / 0.98 / 5.
    pub fn recommended() -> Self {
        Self {
            thresholds: GuardrailThresholds::default(),
        }
    }

    pub fn thresholds(&self) -> &GuardrailThresholds {
        &self.thresholds
    }

    pub fn min_improvement_threshold(&self) -> f64 {
        self.thresholds.min_improvement_threshold
    }

    pub fn min_absolute_score(&self) -> f64 {
        self.thresholds.min_absolute_score
    }

    pub fn regression_threshold(&self) -> f64 {
        self.thresholds.regression_threshold
    }

    pub fn critical_case_pass_rate(&self) -> f64 {
        self.thresholds.critical_case_pass_rate
    }

    pub fn format_pass_rate(&self) -> f64 {
        self.thresholds.format_pass_rate
    }

    pub fn max_candidates_per_iteration(&self) -> usize {
        self.thresholds.max_candidates_per_iteration
    }
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self::recommended()
    }
}

impl TryFrom<GuardrailThresholds> for GuardrailConfig {
    type Error = ConfigError;

    fn try_from(thresholds: GuardrailThresholds) -> Result<Self, Self::Error> {
        Self::new(thresholds)
    }
}

impl From<GuardrailConfig> for GuardrailThresholds {
    fn from(config: GuardrailConfig) -> Self {
        config.thresholds
    }
}

// ---------------------------------------------------------------------------
// Comparative metrics
// ---------------------------------------------------------------------------

/// Baseline-versus-candidate deltas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparativeMetrics {
    /// Candidate mean minus baseline mean, for dimensions both scored.
    pub dimension_deltas: BTreeMap<Dimension, f64>,
    /// Candidate aggregate minus baseline aggregate.
    pub overall_delta: f64,
    /// Dimensions whose delta is below `-regression_threshold`, most important first.
    pub regressions: Vec<Dimension>,
    /// Dimensions scored on only one side; never counted as deltas.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unmatched_dimensions: Vec<Dimension>,
}

pub fn compare(
    baseline: &EvaluationResult,
    candidate: &EvaluationResult,
    regression_threshold: f64,
) -> ComparativeMetrics {
    let mut dimension_deltas = BTreeMap::new();
    let mut unmatched_dimensions = Vec::new();
    for (dim, base_mean) in &baseline.dimension_means {
        match candidate.dimension_means.get(dim) {
            Some(cand_mean) => {
                dimension_deltas.insert(dim.clone(), cand_mean - base_mean);
            }
            None => unmatched_dimensions.push(dim.clone()),
        }
    }
    unmatched_dimensions.extend(
        candidate
            .dimension_means
            .keys()
            .filter(|d| !baseline.dimension_means.contains_key(*d))
            .cloned(),
    );

    let mut regressions: Vec<Dimension> = dimension_deltas
        .iter()
        .filter(|(_, delta)| **delta < -regression_threshold - SCORE_EPSILON)
        .map(|(d, _)| d.clone())
        .collect();
    regressions.sort_by(|a, b| a.rank_cmp(b));
    unmatched_dimensions.sort_by(|a, b| a.rank_cmp(b));

    ComparativeMetrics {
        dimension_deltas,
        overall_delta: candidate.aggregate_score - baseline.aggregate_score,
        regressions,
        unmatched_dimensions,
    }
}

// ---------------------------------------------------------------------------
// Verdict
// ---------------------------------------------------------------------------

/// Which guardrail a violation refers to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum GuardrailCheck {
    MinImprovement,
    MinAbsoluteScore,
    Regression { dimension: Dimension },
    /// Scored on the baseline, absent from the candidate.
    UnscoredDimension { dimension: Dimension },
    CriticalCasePassRate,
    FormatPassRate,
    /// Qualified, but another candidate was promoted instead.
    Superseded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardrailViolation {
    pub check: GuardrailCheck,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Promote,
    Reject,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardrailVerdict {
    pub decision: Decision,
    /// Every failed check, in evaluation order. Empty iff `Promote`.
    pub violations: Vec<GuardrailViolation>,
    pub metrics: ComparativeMetrics,
    pub critical_pass_rate: Option<f64>,
    pub format_pass_rate: Option<f64>,
}

impl GuardrailVerdict {
    pub fn promotes(&self) -> bool {
        self.decision == Decision::Promote
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

fn absolute_score_violation(
    result: &EvaluationResult,
    config: &GuardrailConfig,
) -> Option<GuardrailViolation> {
    (result.aggregate_score + SCORE_EPSILON < config.min_absolute_score()).then(|| {
        GuardrailViolation {
            check: GuardrailCheck::MinAbsoluteScore,
            reason: format!(
                "aggregate score below minimum: {:.4} < {:.4}",
                result.aggregate_score,
                config.min_absolute_score()
            ),
        }
    })
}

/// Vacuously satisfied when the dataset has no critical cases.
fn critical_violation(
    rate: Option<f64>,
    config: &GuardrailConfig,
) -> Option<GuardrailViolation> {
    let rate = rate?;
    (rate + SCORE_EPSILON < config.critical_case_pass_rate()).then(|| GuardrailViolation {
        check: GuardrailCheck::CriticalCasePassRate,
        reason: format!(
            "critical case pass rate below threshold: {:.4} < {:.4}",
            rate,
            config.critical_case_pass_rate()
        ),
    })
}

/// Skipped when format_adherence was never scored.
fn format_violation(rate: Option<f64>, config: &GuardrailConfig) -> Option<GuardrailViolation> {
    let rate = rate?;
    format_rate_violation(rate, config)
}

fn format_rate_violation(rate: f64, config: &GuardrailConfig) -> Option<GuardrailViolation> {
    (rate + SCORE_EPSILON < config.format_pass_rate()).then(|| GuardrailViolation {
        check: GuardrailCheck::FormatPassRate,
        reason: format!(
            "format_adherence pass rate below threshold: {:.4} < {:.4}",
            rate,
            config.format_pass_rate()
        ),
    })
}

/// Decide whether `candidate` may replace `baseline`.
///
/// Checks, in order: minimum improvement, minimum absolute score, per-dimension
/// regressions, dimensions the candidate left unscored, critical-case pass
/// rate, format pass rate. A candidate that drops a dimension the baseline
/// scored never promotes.
pub fn evaluate_guardrails(
    baseline: &EvaluationResult,
    candidate: &EvaluationResult,
    config: &GuardrailConfig,
) -> GuardrailVerdict {
    let metrics = compare(baseline, candidate, config.regression_threshold());
    let critical_pass_rate = candidate.critical_pass_rate();
    let format_pass_rate = candidate.dimension_pass_rate(&Dimension::FormatAdherence);
    let mut violations = Vec::new();

    if metrics.overall_delta + SCORE_EPSILON < config.min_improvement_threshold() {
        violations.push(GuardrailViolation {
            check: GuardrailCheck::MinImprovement,
            reason: format!(
                "improvement below threshold: overall delta {:+.4} < {:.4}",
                metrics.overall_delta,
                config.min_improvement_threshold()
            ),
        });
    }
    violations.extend(absolute_score_violation(candidate, config));
    for dim in &metrics.regressions {
        let delta = metrics.dimension_deltas.get(dim).copied().unwrap_or_default();
        violations.push(GuardrailViolation {
            check: GuardrailCheck::Regression {
                dimension: dim.clone(),
            },
            reason: format!(
                "regression in {dim}: delta {:+.4} exceeds allowed -{:.4}",
                delta,
                config.regression_threshold()
            ),
        });
    }
    for dim in metrics
        .unmatched_dimensions
        .iter()
        .filter(|d| baseline.dimension_means.contains_key(*d))
    {
        violations.push(GuardrailViolation {
            check: GuardrailCheck::UnscoredDimension {
                dimension: dim.clone(),
            },
            reason: format!("{dim} scored on baseline but not on candidate"),
        });
    }
    violations.extend(critical_violation(critical_pass_rate, config));
    let baseline_format_rate = baseline.dimension_pass_rate(&Dimension::FormatAdherence);
    match (format_pass_rate, baseline_format_rate) {
        (Some(rate), _) => violations.extend(format_rate_violation(rate, config)),
        (None, Some(_)) => violations.push(GuardrailViolation {
            check: GuardrailCheck::FormatPassRate,
            reason: "format_adherence pass rate unavailable on candidate".into(),
        }),
        (None, None) => {}
    }

    let decision = if violations.is_empty() {
        Decision::Promote
    } else {
        Decision::Reject
    };
    GuardrailVerdict {
        decision,
        violations,
        metrics,
        critical_pass_rate,
        format_pass_rate,
    }
}

/// Checks that apply to a single result with no baseline: absolute score,
/// critical-case pass rate, format pass rate.
pub fn check_absolute(
    result: &EvaluationResult,
    config: &GuardrailConfig,
) -> Vec<GuardrailViolation> {
    absolute_score_violation(result, config)
        .into_iter()
        .chain(critical_violation(result.critical_pass_rate(), config))
        .chain(format_violation(
            result.dimension_pass_rate(&Dimension::FormatAdherence),
            config,
        ))
        .collect()
}

/// Pick the single candidate to promote: highest overall delta, then highest
/// aggregate, then lowest candidate index. Every other qualifying outcome is
/// rejected as superseded. Returns the position of the winner in `outcomes`.
pub fn select_promotion(outcomes: &mut [ExperimentOutcome]) -> Option<usize> {
    let mut winner: Option<usize> = None;
    for (pos, outcome) in outcomes.iter().enumerate() {
        if outcome.decision != Decision::Promote {
            continue;
        }
        let better = match winner {
            None => true,
            Some(w) => {
                let best = &outcomes[w];
                outcome
                    .metrics
                    .overall_delta
                    .total_cmp(&best.metrics.overall_delta)
                    .then_with(|| {
                        outcome
                            .candidate_result
                            .aggregate_score
                            .total_cmp(&best.candidate_result.aggregate_score)
                    })
                    .then_with(|| best.candidate.index.cmp(&outcome.candidate.index))
                    .is_gt()
            }
        };
        if better {
            winner = Some(pos);
        }
    }

    let w = winner?;
    let (winner_id, winner_delta) = (
        outcomes[w].candidate.candidate_id.clone(),
        outcomes[w].metrics.overall_delta,
    );
    for (pos, outcome) in outcomes.iter_mut().enumerate() {
        if pos != w && outcome.decision == Decision::Promote {
            outcome.decision = Decision::Reject;
            outcome.reasons.push(GuardrailViolation {
                check: GuardrailCheck::Superseded,
                reason: format!(
                    "superseded by better candidate {winner_id} (overall delta {winner_delta:+.4})"
                ),
            });
        }
    }

    METRICS.inc_promotions();
    obs::emit_promotion_selected(
        &winner_id,
        winner_delta,
        outcomes[w].candidate_result.aggregate_score,
    );
    Some(w)
}
