//! Scores and evaluation results.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::capability::Usage;
use crate::domain::error::{LoopError, Result};

/// A scoring dimension. Serializes as its snake_case name; unknown names
/// become [`Dimension::Custom`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Dimension {
    Correctness,
    FormatAdherence,
    Verbosity,
    Safety,
    Consistency,
    Custom(String),
}

impl Dimension {
    pub const BUILTIN: [Dimension; 5] = [
        Dimension::Correctness,
        Dimension::FormatAdherence,
        Dimension::Safety,
        Dimension::Consistency,
        Dimension::Verbosity,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            Dimension::Correctness => "correctness",
            Dimension::FormatAdherence => "format_adherence",
            Dimension::Verbosity => "verbosity",
            Dimension::Safety => "safety",
            Dimension::Consistency => "consistency",
            Dimension::Custom(name) => name,
        }
    }

    /// Analysis priority, lower is more important.
    /// correctness > format_adherence > safety > consistency > verbosity > custom.
    pub fn priority(&self) -> u8 {
        match self {
            Dimension::Correctness => 0,
            Dimension::FormatAdherence => 1,
            Dimension::Safety => 2,
            Dimension::Consistency => 3,
            Dimension::Verbosity => 4,
            Dimension::Custom(_) => 5,
        }
    }

    /// Total order used wherever dimensions must be ranked: priority, then name.
    pub fn rank_cmp(&self, other: &Dimension) -> std::cmp::Ordering {
        self.priority()
            .cmp(&other.priority())
            .then_with(|| self.as_str().cmp(other.as_str()))
    }
}

impl From<String> for Dimension {
    fn from(s: String) -> Self {
        match s.as_str() {
            "correctness" => Dimension::Correctness,
            "format_adherence" => Dimension::FormatAdherence,
            "verbosity" => Dimension::Verbosity,
            "safety" => Dimension::Safety,
            "consistency" => Dimension::Consistency,
            _ => Dimension::Custom(s),
        }
    }
}

impl From<&str> for Dimension {
    fn from(s: &str) -> Self {
        Dimension::from(s.to_string())
    }
}

impl From<Dimension> for String {
    fn from(d: Dimension) -> Self {
        d.as_str().to_string()
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a dimension score was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreMethod {
    Validators,
    Judge,
}

/// Score for one dimension of one case output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionScore {
    pub dimension: Dimension,
    /// In `[0, 1]`.
    pub score: f64,
    /// Whether `score` meets the pass threshold configured for `dimension`.
    pub passed: bool,
    pub method: ScoreMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    /// Validator details or judge weaknesses backing the score.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<String>,
}

/// Why a case could not be scored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseErrorKind {
    /// Transient provider failure that exhausted its retries.
    Provider,
    /// Non-retriable provider rejection.
    ProviderRejected,
    /// Every attempt timed out.
    Timeout,
    /// Judge verdict unparseable after the strict re-prompt.
    JudgeParse,
}

impl fmt::Display for CaseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CaseErrorKind::Provider => "provider",
            CaseErrorKind::ProviderRejected => "provider_rejected",
            CaseErrorKind::Timeout => "timeout",
            CaseErrorKind::JudgeParse => "judge_parse",
        };
        f.write_str(s)
    }
}

/// Error indicator recorded on a case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseError {
    pub kind: CaseErrorKind,
    pub message: String,
    pub attempts: u32,
    /// Dimension being judged when the failure happened, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimension: Option<Dimension>,
}

/// Result of evaluating one case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseResult {
    pub case_index: usize,
    pub critical: bool,
    /// Raw model output; `None` when generation itself failed.
    pub output: Option<String>,
    pub scores: Vec<DimensionScore>,
    /// Configured dimensions that were not scored for this case.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_dimensions: Vec<Dimension>,
    /// Weighted mean over `scores`; `None` for error cases.
    pub weighted_score: Option<f64>,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CaseError>,
    #[serde(default)]
    pub usage: Usage,
}

impl CaseResult {
    pub fn errored(
        case_index: usize,
        critical: bool,
        output: Option<String>,
        error: CaseError,
        usage: Usage,
    ) -> Self {
        Self {
            case_index,
            critical,
            output,
            scores: Vec::new(),
            missing_dimensions: Vec::new(),
            weighted_score: None,
            passed: false,
            error: Some(error),
            usage,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn score_for(&self, dimension: &Dimension) -> Option<&DimensionScore> {
        self.scores.iter().find(|s| &s.dimension == dimension)
    }

    /// Lowest-scoring dimension, ties broken by dimension priority.
    pub fn lowest_score(&self) -> Option<&DimensionScore> {
        self.scores.iter().min_by(|a, b| {
            a.score
                .total_cmp(&b.score)
                .then_with(|| a.dimension.rank_cmp(&b.dimension))
        })
    }
}

/// Immutable result of evaluating one prompt version on one dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub evaluation_id: Uuid,
    pub version_id: String,
    pub dataset_id: String,
    pub dataset_digest: String,
    /// Ordered by `case_index`.
    pub case_results: Vec<CaseResult>,
    pub aggregate_score: f64,
    /// Mean score per dimension over non-error cases that scored it.
    pub dimension_means: BTreeMap<Dimension, f64>,
    pub passed_cases: usize,
    pub failed_cases: usize,
    pub error_cases: usize,
    /// Dimensions missing from at least one non-error case.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub missing_dimensions: BTreeSet<Dimension>,
    pub created_at: DateTime<Utc>,
}

impl EvaluationResult {
    /// Assemble a result from finished case results.
    ///
    /// Error cases are excluded from the aggregate and from both the
    /// passed and failed counts. Fails when no case is scorable.
    pub fn from_case_results(
        version_id: impl Into<String>,
        dataset_id: impl Into<String>,
        dataset_digest: impl Into<String>,
        mut case_results: Vec<CaseResult>,
    ) -> Result<Self> {
        let version_id = version_id.into();
        let dataset_id = dataset_id.into();
        case_results.sort_by_key(|c| c.case_index);

        let error_cases = case_results.iter().filter(|c| c.is_error()).count();
        let weighted: Vec<f64> = case_results
            .iter()
            .filter(|c| !c.is_error())
            .filter_map(|c| c.weighted_score)
            .collect();

        if weighted.is_empty() {
            return Err(LoopError::Evaluation {
                version_id,
                dataset_id,
                error_cases,
            });
        }
        let aggregate_score = weighted.iter().sum::<f64>() / weighted.len() as f64;

        let mut sums: BTreeMap<Dimension, (f64, usize)> = BTreeMap::new();
        let mut missing_dimensions = BTreeSet::new();
        let mut passed_cases = 0;
        let mut failed_cases = 0;
        for case in case_results.iter().filter(|c| !c.is_error()) {
            if case.passed {
                passed_cases += 1;
            } else {
                failed_cases += 1;
            }
            for s in &case.scores {
                let entry = sums.entry(s.dimension.clone()).or_insert((0.0, 0));
                entry.0 += s.score;
                entry.1 += 1;
            }
            missing_dimensions.extend(case.missing_dimensions.iter().cloned());
        }
        let dimension_means = sums
            .into_iter()
            .map(|(d, (sum, n))| (d, sum / n as f64))
            .collect();

        Ok(Self {
            evaluation_id: Uuid::new_v4(),
            version_id,
            dataset_id,
            dataset_digest: dataset_digest.into(),
            case_results,
            aggregate_score,
            dimension_means,
            passed_cases,
            failed_cases,
            error_cases,
            missing_dimensions,
            created_at: Utc::now(),
        })
    }

    pub fn total_cases(&self) -> usize {
        self.case_results.len()
    }

    pub fn scored_cases(&self) -> usize {
        self.passed_cases + self.failed_cases
    }

    /// Passed over scored (non-error) cases.
    pub fn pass_rate(&self) -> f64 {
        match self.scored_cases() {
            0 => 0.0,
            n => self.passed_cases as f64 / n as f64,
        }
    }

    /// Passed critical cases over all critical cases, errored ones included.
    /// `None` when the dataset has no critical cases.
    pub fn critical_pass_rate(&self) -> Option<f64> {
        let critical: Vec<&CaseResult> =
            self.case_results.iter().filter(|c| c.critical).collect();
        if critical.is_empty() {
            return None;
        }
        let passed = critical.iter().filter(|c| c.passed).count();
        Some(passed as f64 / critical.len() as f64)
    }

    /// Share of cases scoring `dimension` whose score passed.
    /// `None` when no case scored it.
    pub fn dimension_pass_rate(&self, dimension: &Dimension) -> Option<f64> {
        let scored: Vec<&DimensionScore> = self
            .case_results
            .iter()
            .filter_map(|c| c.score_for(dimension))
            .collect();
        if scored.is_empty() {
            return None;
        }
        let passed = scored.iter().filter(|s| s.passed).count();
        Some(passed as f64 / scored.len() as f64)
    }

    pub fn errors(&self) -> impl Iterator<Item = &CaseResult> {
        self.case_results.iter().filter(|c| c.is_error())
    }

    pub fn failures(&self) -> impl Iterator<Item = &CaseResult> {
        self.case_results
            .iter()
            .filter(|c| !c.is_error() && !c.passed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn score(dimension: Dimension, score: f64, passed: bool) -> DimensionScore {
        DimensionScore {
            dimension,
            score,
            passed,
            method: ScoreMethod::Judge,
            rationale: None,
            details: Vec::new(),
        }
    }

    fn case(index: usize, weighted: f64, passed: bool) -> CaseResult {
        CaseResult {
            case_index: index,
            critical: false,
            output: Some("out".into()),
            scores: vec![score(Dimension::Correctness, weighted, passed)],
            missing_dimensions: Vec::new(),
            weighted_score: Some(weighted),
            passed,
            error: None,
            usage: Usage::default(),
        }
    }

    fn provider_error() -> CaseError {
        CaseError {
            kind: CaseErrorKind::Provider,
            message: "503".into(),
            attempts: 3,
            dimension: None,
        }
    }

    #[test]
    fn test_dimension_serde_names() {
        let json = serde_json::to_string(&Dimension::FormatAdherence).unwrap();
        assert_eq!(json, r#""format_adherence""#);
        let d: Dimension = serde_json::from_str(r#""tone""#).unwrap();
        assert_eq!(d, Dimension::Custom("tone".into()));
    }

    #[test]
    fn test_priority_order() {
        let mut dims = vec![
            Dimension::Verbosity,
            Dimension::Custom("tone".into()),
            Dimension::Safety,
            Dimension::Correctness,
            Dimension::Consistency,
            Dimension::FormatAdherence,
        ];
        dims.sort_by(|a, b| a.rank_cmp(b));
        let names: Vec<&str> = dims.iter().map(|d| d.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "correctness",
                "format_adherence",
                "safety",
                "consistency",
                "verbosity",
                "tone"
            ]
        );
    }

    #[test]
    fn test_from_case_results_excludes_errors_from_counts() {
        let results = vec![
            case(2, 0.5, false),
            CaseResult::errored(1, false, None, provider_error(), Usage::default()),
            case(0, 0.9, true),
        ];
        let r = EvaluationResult::from_case_results("v1", "d", "abc", results).unwrap();

        let order: Vec<usize> = r.case_results.iter().map(|c| c.case_index).collect();
        assert_eq!(order, vec![0, 1, 2]);
        assert_eq!(r.passed_cases, 1);
        assert_eq!(r.failed_cases, 1);
        assert_eq!(r.error_cases, 1);
        assert_eq!(r.scored_cases(), 2);
        assert!((r.aggregate_score - 0.7).abs() < 1e-9);
        assert!((r.dimension_means[&Dimension::Correctness] - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_all_errors_is_evaluation_error() {
        let results = vec![CaseResult::errored(
            0,
            false,
            None,
            provider_error(),
            Usage::default(),
        )];
        let err = EvaluationResult::from_case_results("v1", "d", "abc", results).unwrap_err();
        assert!(matches!(err, LoopError::Evaluation { error_cases: 1, .. }));
    }

    #[test]
    fn test_critical_pass_rate_counts_errored_critical_cases() {
        let mut ok = case(0, 0.9, true);
        ok.critical = true;
        let failed =
            CaseResult::errored(1, true, None, provider_error(), Usage::default());
        let r =
            EvaluationResult::from_case_results("v1", "d", "abc", vec![ok, failed]).unwrap();
        assert_eq!(r.critical_pass_rate(), Some(0.5));
    }

    #[test]
    fn test_critical_pass_rate_none_without_critical_cases() {
        let r = EvaluationResult::from_case_results("v1", "d", "abc", vec![case(0, 1.0, true)])
            .unwrap();
        assert_eq!(r.critical_pass_rate(), None);
        assert_eq!(r.dimension_pass_rate(&Dimension::FormatAdherence), None);
    }

    #[test]
    fn test_lowest_score_breaks_ties_by_priority() {
        let mut c = case(0, 0.4, false);
        c.scores = vec![
            score(Dimension::Verbosity, 0.4, false),
            score(Dimension::Correctness, 0.4, false),
        ];
        assert_eq!(c.lowest_score().unwrap().dimension, Dimension::Correctness);
    }
}
