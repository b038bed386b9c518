//! Failure analysis: turn an evaluation result into clustered, actionable
//! failure signal for the candidate generator.
//!
//! Each failed case joins the cluster of its lowest-scoring dimension. Ties
//! go to the dimension furthest below its pass threshold, then to the more
//! important dimension (see [`Dimension::priority`]), then by name.
//! Clusters are ordered by size, then mean shortfall, then the same
//! dimension order.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{
    CaseResult, ConfigError, Dataset, Dimension, DimensionScore, EvaluationResult,
};
use crate::scoring::ScoringConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// Representative cases kept per cluster.
    pub max_examples_per_cluster: usize,
    /// A case is severe when its lowest score is below this.
    pub severe_below: f64,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            max_examples_per_cluster: 5,
            severe_below: 0.3,
        }
    }
}

impl AnalyzerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_examples_per_cluster == 0 {
            return Err(ConfigError::ZeroCount {
                field: "analyzer.max_examples_per_cluster".into(),
            });
        }
        if !(0.0..=1.0).contains(&self.severe_below) {
            return Err(ConfigError::OutOfUnitRange {
                field: "analyzer.severe_below".into(),
                value: self.severe_below,
            });
        }
        Ok(())
    }
}

/// Failed cases sharing the same weakest dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureCluster {
    pub dimension: Dimension,
    pub count: usize,
    pub severe_count: usize,
    pub moderate_count: usize,
    pub critical_count: usize,
    pub mean_score: f64,
    /// Mean distance below the dimension's pass threshold.
    pub mean_shortfall: f64,
    /// Capped; critical cases first, then lowest score on `dimension`.
    pub examples: Vec<CaseResult>,
    /// Advisory summary for humans and the generator meta-prompt.
    pub description: String,
    pub suggested_fix: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReport {
    pub report_id: Uuid,
    pub evaluation_id: Uuid,
    pub version_id: String,
    pub dataset_id: String,
    pub total_failures: usize,
    /// Error cases are reported but never clustered.
    pub error_cases: usize,
    pub clusters: Vec<FailureCluster>,
    pub recommendations: Vec<String>,
}

impl FailureReport {
    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }
}

pub fn suggested_fix(dimension: &Dimension) -> String {
    match dimension {
        Dimension::Correctness => {
            "Clarify the instructions or add few-shot examples covering the failing inputs".into()
        }
        Dimension::FormatAdherence => {
            "Add explicit format instructions with an example of the required structure".into()
        }
        Dimension::Verbosity => {
            "Add explicit length constraints or an example of the expected length".into()
        }
        Dimension::Safety => {
            "Spell out content to avoid and how to decline unsafe requests".into()
        }
        Dimension::Consistency => {
            "Remove ambiguous instructions so similar inputs are treated alike".into()
        }
        Dimension::Custom(name) => format!("Add instructions addressing the `{name}` criterion"),
    }
}

/// Most frequent string, ties to the lexicographically smallest.
fn most_common<'a>(items: impl Iterator<Item = &'a str>) -> Option<(&'a str, usize)> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for item in items {
        *counts.entry(item).or_default() += 1;
    }
    counts
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(a.0)))
}

#[derive(Debug, Clone)]
pub struct FailureAnalyzer {
    config: AnalyzerConfig,
    scoring: Arc<ScoringConfig>,
}

impl FailureAnalyzer {
    pub fn new(config: AnalyzerConfig, scoring: Arc<ScoringConfig>) -> Self {
        Self { config, scoring }
    }

    fn shortfall(&self, score: &DimensionScore) -> f64 {
        (self.scoring.threshold_for(&score.dimension) - score.score).max(0.0)
    }

    fn primary<'a>(&self, case: &'a CaseResult) -> Option<&'a DimensionScore> {
        case.scores.iter().min_by(|a, b| {
            a.score
                .total_cmp(&b.score)
                .then_with(|| self.shortfall(b).total_cmp(&self.shortfall(a)))
                .then_with(|| a.dimension.rank_cmp(&b.dimension))
        })
    }

    pub fn analyze(&self, result: &EvaluationResult, dataset: &Dataset) -> FailureReport {
        let failures: Vec<&CaseResult> = result.failures().collect();

        let mut groups: BTreeMap<Dimension, Vec<(&CaseResult, &DimensionScore)>> = BTreeMap::new();
        for case in &failures {
            if let Some(primary) = self.primary(case) {
                groups
                    .entry(primary.dimension.clone())
                    .or_default()
                    .push((*case, primary));
            }
        }

        let mut clusters: Vec<FailureCluster> = groups
            .into_iter()
            .map(|(dimension, members)| self.cluster(dimension, members, dataset))
            .collect();
        clusters.sort_by(|a, b| {
            b.count
                .cmp(&a.count)
                .then_with(|| b.mean_shortfall.total_cmp(&a.mean_shortfall))
                .then_with(|| a.dimension.rank_cmp(&b.dimension))
        });

        let mut recommendations: Vec<String> =
            clusters.iter().map(|c| c.suggested_fix.clone()).collect();
        let severe: usize = clusters.iter().map(|c| c.severe_count).sum();
        if severe > 0 {
            recommendations.insert(0, format!("Address the {severe} severe failure(s) first"));
        }

        FailureReport {
            report_id: Uuid::new_v4(),
            evaluation_id: result.evaluation_id,
            version_id: result.version_id.clone(),
            dataset_id: result.dataset_id.clone(),
            total_failures: failures.len(),
            error_cases: result.error_cases,
            clusters,
            recommendations,
        }
    }

    fn cluster(
        &self,
        dimension: Dimension,
        mut members: Vec<(&CaseResult, &DimensionScore)>,
        dataset: &Dataset,
    ) -> FailureCluster {
        let count = members.len();
        let n = count as f64;
        let mean_score = members.iter().map(|(_, s)| s.score).sum::<f64>() / n;
        let mean_shortfall = members.iter().map(|(_, s)| self.shortfall(s)).sum::<f64>() / n;
        let severe_count = members
            .iter()
            .filter(|(_, s)| s.score < self.config.severe_below)
            .count();
        let critical_count = members.iter().filter(|(c, _)| c.critical).count();

        let mut description = format!(
            "{count} failing case(s) scored lowest on {dimension} \
             (mean {mean_score:.2}, {mean_shortfall:.2} below threshold on average)"
        );
        if critical_count > 0 {
            description.push_str(&format!("; {critical_count} critical"));
        }
        if let Some((issue, k)) =
            most_common(members.iter().flat_map(|(_, s)| s.details.iter().map(String::as_str)))
        {
            if k >= 2 || count == 1 {
                description.push_str(&format!("; most common issue: \"{issue}\" ({k} case(s))"));
            }
        }
        let rubrics = members.iter().filter_map(|(c, _)| {
            dataset
                .cases
                .get(c.case_index)
                .and_then(|case| case.rubric.as_deref())
        });
        if let Some((rubric, k)) = most_common(rubrics) {
            if k >= 2 {
                description.push_str(&format!("; shared rubric: \"{rubric}\""));
            }
        }

        members.sort_by(|(a, sa), (b, sb)| {
            b.critical
                .cmp(&a.critical)
                .then_with(|| sa.score.total_cmp(&sb.score))
                .then_with(|| a.case_index.cmp(&b.case_index))
        });
        let examples = members
            .iter()
            .take(self.config.max_examples_per_cluster)
            .map(|(c, _)| (*c).clone())
            .collect();

        FailureCluster {
            suggested_fix: suggested_fix(&dimension),
            dimension,
            count,
            severe_count,
            moderate_count: count - severe_count,
            critical_count,
            mean_score,
            mean_shortfall,
            examples,
            description,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::Usage;
    use crate::domain::{Case, ScoreMethod};

    fn analyzer(max_examples: usize) -> FailureAnalyzer {
        FailureAnalyzer::new(
            AnalyzerConfig {
                max_examples_per_cluster: max_examples,
                ..AnalyzerConfig::default()
            },
            Arc::new(ScoringConfig::default()),
        )
    }

    fn case(index: usize, critical: bool, scores: &[(Dimension, f64, &[&str])]) -> CaseResult {
        let cfg = ScoringConfig::default();
        let scores: Vec<DimensionScore> = scores
            .iter()
            .map(|(d, s, details)| {
                cfg.score(
                    d.clone(),
                    *s,
                    ScoreMethod::Judge,
                    None,
                    details.iter().map(|x| x.to_string()).collect(),
                )
            })
            .collect();
        cfg.finalize_case(index, critical, "out".into(), scores, Vec::new(), Usage::default())
    }

    fn dataset(n: usize) -> Dataset {
        Dataset::new("ds", (0..n).map(|_| Case::default()).collect())
    }

    #[test]
    fn test_no_failures_is_empty_report() {
        let result = EvaluationResult::from_case_results(
            "v1",
            "ds",
            "d",
            vec![case(0, false, &[(Dimension::Correctness, 0.9, &[])])],
        )
        .unwrap();
        let report = analyzer(5).analyze(&result, &dataset(1));
        assert!(report.is_empty());
        assert_eq!(report.total_failures, 0);
        assert!(report.recommendations.is_empty());
    }

    #[test]
    fn test_clusters_by_lowest_dimension_and_orders_by_size() {
        let cases = vec![
            case(0, false, &[(Dimension::Correctness, 0.9, &[]), (Dimension::FormatAdherence, 0.2, &["missing `summary`"])]),
            case(1, false, &[(Dimension::Correctness, 0.5, &[]), (Dimension::FormatAdherence, 0.9, &[])]),
            case(2, false, &[(Dimension::Correctness, 0.9, &[]), (Dimension::FormatAdherence, 0.5, &["missing `summary`"])]),
            case(3, false, &[(Dimension::Correctness, 1.0, &[]), (Dimension::FormatAdherence, 1.0, &[])]),
        ];
        let result = EvaluationResult::from_case_results("v1", "ds", "d", cases).unwrap();
        let report = analyzer(5).analyze(&result, &dataset(4));

        assert_eq!(report.total_failures, 3);
        assert_eq!(report.clusters.len(), 2);
        let format = &report.clusters[0];
        assert_eq!(format.dimension, Dimension::FormatAdherence);
        assert_eq!(format.count, 2);
        assert_eq!(format.severe_count, 1);
        assert_eq!(format.moderate_count, 1);
        assert!(format.description.contains("most common issue: \"missing `summary`\" (2 case(s))"));
        assert_eq!(report.clusters[1].dimension, Dimension::Correctness);
        assert_eq!(report.recommendations[0], "Address the 1 severe failure(s) first");
    }

    #[test]
    fn test_tie_on_score_goes_to_larger_shortfall() {
        let mut scoring = ScoringConfig::default();
        scoring.pass_thresholds.insert(Dimension::Verbosity, 0.9);
        let analyzer = FailureAnalyzer::new(AnalyzerConfig::default(), Arc::new(scoring.clone()));

        let scores = vec![
            scoring.score(Dimension::Correctness, 0.5, ScoreMethod::Judge, None, Vec::new()),
            scoring.score(Dimension::Verbosity, 0.5, ScoreMethod::Judge, None, Vec::new()),
        ];
        let c = scoring.finalize_case(0, false, "o".into(), scores, Vec::new(), Usage::default());
        assert_eq!(analyzer.primary(&c).unwrap().dimension, Dimension::Verbosity);
    }

    #[test]
    fn test_tie_on_score_and_shortfall_goes_to_priority() {
        let c = case(
            0,
            false,
            &[(Dimension::Verbosity, 0.4, &[]), (Dimension::Safety, 0.4, &[])],
        );
        assert_eq!(analyzer(5).primary(&c).unwrap().dimension, Dimension::Safety);
    }

    #[test]
    fn test_examples_capped_critical_first_then_lowest() {
        let cases: Vec<CaseResult> = (0..8)
            .map(|i| {
                let score = 0.1 + i as f64 * 0.05;
                case(i, i == 6, &[(Dimension::Correctness, score, &[])])
            })
            .collect();
        let result = EvaluationResult::from_case_results("v1", "ds", "d", cases).unwrap();
        let report = analyzer(3).analyze(&result, &dataset(8));

        let idx: Vec<usize> = report.clusters[0]
            .examples
            .iter()
            .map(|c| c.case_index)
            .collect();
        assert_eq!(idx, vec![6, 0, 1]);
        assert_eq!(report.clusters[0].count, 8);
        assert!(report.clusters[0].description.contains("1 critical"));
    }

    #[test]
    fn test_shared_rubric_in_description() {
        let cases = vec![
            case(0, false, &[(Dimension::Correctness, 0.3, &[])]),
            case(1, false, &[(Dimension::Correctness, 0.4, &[])]),
        ];
        let result = EvaluationResult::from_case_results("v1", "ds", "d", cases).unwrap();
        let ds = Dataset::new(
            "ds",
            vec![
                Case::default().with_rubric("cite the policy section"),
                Case::default().with_rubric("cite the policy section"),
            ],
        );
        let report = analyzer(5).analyze(&result, &ds);
        assert!(report.clusters[0]
            .description
            .ends_with("shared rubric: \"cite the policy section\""));
    }
}
