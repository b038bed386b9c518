//! Candidate generation: ask the model for revised templates that address a
//! failure report.
//!
//! Every proposal is screened before it becomes a [`Candidate`]: empty and
//! duplicate templates (against the baseline and each other, after trimming)
//! and templates that drop a variable the baseline uses are rejected and
//! counted in the batch shortfall.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::analyzer::FailureReport;
use crate::budget::RequestBudget;
use crate::capability::{extract_variables, GenerationProvider, GenerationRequest, ModelParams};
use crate::domain::digest::{digest_bytes, short};
use crate::domain::{ConfigError, Dimension, PromptVersion};
use crate::metrics::METRICS;
use crate::obs;
use crate::retry::{call_with_retry, RetryPolicy};
use crate::validators::extract_json;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    pub params: ModelParams,
    /// With an empty failure report, ask for exploratory variants instead of
    /// reporting nothing to improve.
    pub explore_when_clean: bool,
    /// Failing examples shown per cluster in the meta-prompt.
    pub max_examples_in_prompt: usize,
    /// Example outputs are cut to this many characters.
    pub max_output_chars: usize,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            params: ModelParams {
                temperature: 0.7,
                max_tokens: 4000,
                ..ModelParams::default()
            },
            explore_when_clean: true,
            max_examples_in_prompt: 3,
            max_output_chars: 500,
        }
    }
}

impl GeneratorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_output_chars == 0 {
            return Err(ConfigError::ZeroCount {
                field: "generator.max_output_chars".into(),
            });
        }
        Ok(())
    }
}

/// A proposed replacement for the baseline template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    /// Short content digest of `template`.
    pub candidate_id: String,
    /// Position in the batch that produced it.
    pub index: usize,
    pub template: String,
    pub rationale: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub expected_improvements: BTreeMap<Dimension, f64>,
    /// The failure report it answers; `None` for exploratory variants.
    pub source_report_id: Option<Uuid>,
    pub exploratory: bool,
}

impl Candidate {
    /// The next version in `parent`'s lineage. Output schema and validators
    /// carry over unchanged.
    pub fn into_version(&self, parent: &PromptVersion) -> PromptVersion {
        PromptVersion {
            version_id: format!("{}+{}", parent.version_id, self.candidate_id),
            template: self.template.clone(),
            output_schema: parent.output_schema.clone(),
            validators: parent.validators.clone(),
            parent_version_id: Some(parent.version_id.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedCandidate {
    pub template: String,
    pub reason: String,
}

/// Outcome of one generation round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateBatch {
    pub requested: usize,
    pub candidates: Vec<Candidate>,
    pub rejected: Vec<RejectedCandidate>,
    /// `requested - candidates.len()`.
    pub shortfall: usize,
    /// The report was empty and exploration is off; no call was made.
    pub nothing_to_improve: bool,
    pub exploratory: bool,
    /// Provider or parse failure that left the batch short.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl CandidateBatch {
    fn empty(requested: usize) -> Self {
        Self {
            requested,
            candidates: Vec::new(),
            rejected: Vec::new(),
            shortfall: requested,
            nothing_to_improve: false,
            exploratory: false,
            failure: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawCandidate {
    template: String,
    #[serde(default)]
    rationale: String,
    #[serde(default)]
    expected_improvements: BTreeMap<Dimension, f64>,
}

/// Candidate entries from a generator reply: `{"candidates": [...]}` or a
/// bare array.
pub fn parse_candidates(text: &str) -> Result<Vec<Value>, String> {
    match extract_json(text) {
        Some(Value::Object(mut map)) => match map.remove("candidates") {
            Some(Value::Array(items)) => Ok(items),
            _ => Err("reply has no `candidates` array".into()),
        },
        Some(Value::Array(items)) => Ok(items),
        Some(_) => Err("reply is not a JSON object or array".into()),
        None => Err("no JSON in generator reply".into()),
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}…", &text[..cut]),
        None => text.to_string(),
    }
}

const SYSTEM_PROMPT: &str = "You are an expert prompt engineer. You revise prompt templates so \
    that they fix measured failures without changing the structure of the output they ask for.\n\n\
    Respond with valid JSON only. Do not include any text before or after the JSON.";

#[derive(Clone)]
pub struct CandidateGenerator {
    provider: Arc<dyn GenerationProvider>,
    config: GeneratorConfig,
    retry: RetryPolicy,
    budget: RequestBudget,
}

impl CandidateGenerator {
    pub fn new(
        provider: Arc<dyn GenerationProvider>,
        config: GeneratorConfig,
        retry: RetryPolicy,
        budget: RequestBudget,
    ) -> Self {
        Self {
            provider,
            config,
            retry,
            budget,
        }
    }

    pub fn build_request(
        &self,
        baseline: &PromptVersion,
        report: &FailureReport,
        max_candidates: usize,
    ) -> GenerationRequest {
        let mut lines = vec![
            "Current prompt template:".to_string(),
            format!("```\n{}\n```", baseline.template),
        ];

        let variables = baseline.variables();
        if !variables.is_empty() {
            let list: Vec<String> = variables.iter().map(|v| format!("{{{v}}}")).collect();
            lines.push(format!(
                "Template variables that every revision must keep: {}",
                list.join(", ")
            ));
        }
        lines.push(String::new());

        if report.is_empty() {
            lines.push(
                "The current template has no recorded failures on its evaluation dataset."
                    .to_string(),
            );
            lines.push(format!(
                "Your task: propose up to {max_candidates} alternative templates that make the \
                 instructions clearer and more robust while keeping the same output structure."
            ));
        } else {
            lines.push(format!(
                "Failure analysis: {} failing case(s), grouped by weakest dimension.",
                report.total_failures
            ));
            for (i, cluster) in report.clusters.iter().enumerate() {
                lines.push(format!("{}. {}: {}", i + 1, cluster.dimension, cluster.description));
                lines.push(format!("   Suggested fix: {}", cluster.suggested_fix));
                for example in cluster.examples.iter().take(self.config.max_examples_in_prompt) {
                    let output = example.output.as_deref().unwrap_or_default();
                    lines.push(format!(
                        "   - Output: {}",
                        truncate(output, self.config.max_output_chars)
                    ));
                    if let Some(score) = example.score_for(&cluster.dimension) {
                        let mut issues = score.details.clone();
                        issues.extend(score.rationale.clone());
                        if !issues.is_empty() {
                            lines.push(format!("     Issues: {}", issues.join("; ")));
                        }
                    }
                }
            }
            lines.push(String::new());
            lines.push(format!(
                "Your task: propose up to {max_candidates} revised templates that fix these \
                 failures while preserving the output structure the current template asks for."
            ));
        }

        lines.push(String::new());
        lines.push(
            r#"Respond with JSON only: {"candidates": [{"template": "...", "rationale": "...", "expected_improvements": {"<dimension>": <0.0-1.0>}}]}"#
                .to_string(),
        );
        lines.push(
            "Every template must differ from the current one and from each other, and must keep \
             every template variable."
                .to_string(),
        );

        GenerationRequest {
            system: Some(SYSTEM_PROMPT.to_string()),
            prompt: lines.join("\n"),
            params: self.config.params.clone(),
        }
    }

    /// Propose up to `max_candidates` revisions of `baseline` for `report`.
    pub async fn generate(
        &self,
        baseline: &PromptVersion,
        report: &FailureReport,
        max_candidates: usize,
    ) -> CandidateBatch {
        let mut batch = CandidateBatch::empty(max_candidates);
        if max_candidates == 0 {
            return batch;
        }
        if report.is_empty() && !self.config.explore_when_clean {
            batch.nothing_to_improve = true;
            return batch;
        }
        batch.exploratory = report.is_empty();

        let request = self.build_request(baseline, report, max_candidates);
        let attempted = call_with_retry(&self.retry, &self.budget, || {
            self.provider.generate(request.clone())
        })
        .await;

        let items = match attempted.result {
            Ok(generation) => parse_candidates(&generation.text),
            Err(failure) => Err(failure.to_string()),
        };
        match items {
            Ok(items) => {
                let source = (!batch.exploratory).then_some(report.report_id);
                self.screen(baseline, items, source, &mut batch);
            }
            Err(reason) => batch.failure = Some(reason),
        }

        batch.shortfall = max_candidates - batch.candidates.len();
        METRICS.add_candidates_generated(batch.candidates.len() as u64);
        obs::emit_candidates_generated(max_candidates, batch.candidates.len(), batch.shortfall);
        batch
    }

    fn screen(
        &self,
        baseline: &PromptVersion,
        items: Vec<Value>,
        source_report_id: Option<Uuid>,
        batch: &mut CandidateBatch,
    ) {
        let required = baseline.variables();
        let mut seen: BTreeSet<String> = BTreeSet::new();
        seen.insert(baseline.template.trim().to_string());

        for item in items {
            if batch.candidates.len() == batch.requested {
                break;
            }
            let raw: RawCandidate = match serde_json::from_value(item.clone()) {
                Ok(raw) => raw,
                Err(e) => {
                    batch.rejected.push(RejectedCandidate {
                        template: item.to_string(),
                        reason: format!("malformed candidate entry: {e}"),
                    });
                    continue;
                }
            };

            let trimmed = raw.template.trim();
            let reason = if trimmed.is_empty() {
                Some("empty template".to_string())
            } else if trimmed == baseline.template.trim() {
                Some("identical to the baseline template".to_string())
            } else if seen.contains(trimmed) {
                Some("duplicate of another candidate".to_string())
            } else {
                let present = extract_variables(trimmed);
                let dropped: Vec<&str> = required
                    .iter()
                    .filter(|v| !present.contains(*v))
                    .map(String::as_str)
                    .collect();
                (!dropped.is_empty())
                    .then(|| format!("drops template variable(s): {}", dropped.join(", ")))
            };
            if let Some(reason) = reason {
                batch.rejected.push(RejectedCandidate {
                    template: raw.template,
                    reason,
                });
                continue;
            }

            seen.insert(trimmed.to_string());
            let template = trimmed.to_string();
            batch.candidates.push(Candidate {
                candidate_id: short(&digest_bytes(template.as_bytes())).to_string(),
                index: batch.candidates.len(),
                template,
                rationale: raw.rationale,
                expected_improvements: raw.expected_improvements,
                source_report_id,
                exploratory: batch.exploratory,
            });
        }
    }
}
