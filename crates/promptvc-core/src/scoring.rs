//! Per-dimension thresholds and weights, and how case scores combine.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::capability::Usage;
use crate::domain::{CaseResult, ConfigError, Dimension, DimensionScore, ScoreMethod};

/// Tolerance for threshold comparisons on judge-reported floats.
pub const SCORE_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    /// Dimensions scored for every case.
    pub dimensions: Vec<Dimension>,
    pub default_pass_threshold: f64,
    /// Per-dimension overrides of `default_pass_threshold`.
    pub pass_thresholds: BTreeMap<Dimension, f64>,
    pub weights: BTreeMap<Dimension, f64>,
    /// Weight for dimensions absent from `weights`.
    pub default_weight: f64,
    /// Ask the judge for `format_adherence` when a version has no
    /// validators. When off, the dimension is left unscored and flagged.
    pub judge_format_without_validators: bool,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            dimensions: vec![
                Dimension::Correctness,
                Dimension::FormatAdherence,
                Dimension::Safety,
                Dimension::Consistency,
                Dimension::Verbosity,
            ],
            default_pass_threshold: 0.7,
            pass_thresholds: BTreeMap::new(),
            weights: BTreeMap::from([
                (Dimension::Correctness, 0.4),
                (Dimension::FormatAdherence, 0.2),
                (Dimension::Safety, 0.2),
                (Dimension::Consistency, 0.1),
                (Dimension::Verbosity, 0.1),
            ]),
            default_weight: 0.1,
            judge_format_without_validators: true,
        }
    }
}

fn unit_range(field: String, value: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfUnitRange { field, value })
    }
}

fn positive(field: String, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::NotPositive { field, value })
    }
}

impl ScoringConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dimensions.is_empty() {
            return Err(ConfigError::NoDimensions);
        }
        unit_range(
            "scoring.default_pass_threshold".into(),
            self.default_pass_threshold,
        )?;
        for (dim, t) in &self.pass_thresholds {
            unit_range(format!("scoring.pass_thresholds.{dim}"), *t)?;
        }
        for (dim, w) in &self.weights {
            positive(format!("scoring.weights.{dim}"), *w)?;
        }
        positive("scoring.default_weight".into(), self.default_weight)
    }

    pub fn threshold_for(&self, dimension: &Dimension) -> f64 {
        self.pass_thresholds
            .get(dimension)
            .copied()
            .unwrap_or(self.default_pass_threshold)
    }

    pub fn weight_for(&self, dimension: &Dimension) -> f64 {
        self.weights
            .get(dimension)
            .copied()
            .unwrap_or(self.default_weight)
    }

    /// Build a score, clamped to `[0, 1]`, with its pass flag set.
    pub fn score(
        &self,
        dimension: Dimension,
        score: f64,
        method: ScoreMethod,
        rationale: Option<String>,
        details: Vec<String>,
    ) -> DimensionScore {
        let score = if score.is_nan() { 0.0 } else { score.clamp(0.0, 1.0) };
        let passed = score + SCORE_EPSILON >= self.threshold_for(&dimension);
        DimensionScore {
            dimension,
            score,
            passed,
            method,
            rationale,
            details,
        }
    }

    /// Weighted mean of exactly the scores present.
    pub fn weighted_mean(&self, scores: &[DimensionScore]) -> Option<f64> {
        let (sum, total) = scores.iter().fold((0.0, 0.0), |(sum, total), s| {
            let w = self.weight_for(&s.dimension);
            (sum + w * s.score, total + w)
        });
        (total > 0.0).then(|| sum / total)
    }

    /// Every scored dimension passes and, for critical cases, correctness was
    /// scored and passes.
    pub fn case_passed(&self, scores: &[DimensionScore], critical: bool) -> bool {
        if scores.is_empty() || !scores.iter().all(|s| s.passed) {
            return false;
        }
        !critical
            || scores
                .iter()
                .any(|s| s.dimension == Dimension::Correctness && s.passed)
    }

    /// Assemble a scored (non-error) case result.
    pub fn finalize_case(
        &self,
        case_index: usize,
        critical: bool,
        output: String,
        scores: Vec<DimensionScore>,
        missing_dimensions: Vec<Dimension>,
        usage: Usage,
    ) -> CaseResult {
        let weighted_score = self.weighted_mean(&scores);
        let passed = self.case_passed(&scores, critical);
        CaseResult {
            case_index,
            critical,
            output: Some(output),
            scores,
            missing_dimensions,
            weighted_score,
            passed,
            error: None,
            usage,
        }
    }
}
