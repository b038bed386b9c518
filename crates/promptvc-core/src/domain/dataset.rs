use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::digest::compute_digest;
use crate::domain::error::Result;

/// Case metadata. `critical` is the only key promptvc interprets; everything
/// else is carried through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CaseMetadata {
    #[serde(default)]
    pub critical: bool,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One evaluation case.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Case {
    /// Template variables, keyed by placeholder name.
    #[serde(default)]
    pub input: BTreeMap<String, Value>,

    #[serde(
        default,
        alias = "expected_output",
        skip_serializing_if = "Option::is_none"
    )]
    pub expected: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rubric: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Map<String, Value>>,

    #[serde(default)]
    pub metadata: CaseMetadata,
}

impl Case {
    pub fn new<I, K, V>(input: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        Self {
            input: input
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            ..Self::default()
        }
    }

    pub fn with_expected(mut self, expected: impl Into<Value>) -> Self {
        self.expected = Some(expected.into());
        self
    }

    pub fn with_rubric(mut self, rubric: impl Into<String>) -> Self {
        self.rubric = Some(rubric.into());
        self
    }

    pub fn with_context(mut self, context: Map<String, Value>) -> Self {
        self.context = Some(context);
        self
    }

    pub fn critical(mut self) -> Self {
        self.metadata.critical = true;
        self
    }

    pub fn is_critical(&self) -> bool {
        self.metadata.critical
    }
}

/// An identified, ordered collection of cases.
///
/// A dataset is treated as immutable once it has been evaluated: cached
/// baselines are keyed by `dataset_id` and checked against [`Dataset::digest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub dataset_id: String,
    pub cases: Vec<Case>,
}

impl Dataset {
    pub fn new(dataset_id: impl Into<String>, cases: Vec<Case>) -> Self {
        Self {
            dataset_id: dataset_id.into(),
            cases,
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }

    /// Critical cases with their positions in the dataset.
    pub fn critical_cases(&self) -> impl Iterator<Item = (usize, &Case)> {
        self.cases.iter().enumerate().filter(|(_, c)| c.is_critical())
    }

    /// Content digest over the canonical JSON of the whole dataset.
    pub fn digest(&self) -> Result<String> {
        compute_digest(&serde_json::to_value(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_json_str_keeps_extra_metadata() {
        let ds = Dataset::from_json_str(
            r#"{
                "dataset_id": "support-v1",
                "cases": [
                    {"input": {"q": "refund?"}, "expected_output": "yes",
                     "metadata": {"critical": true, "owner": "billing"}},
                    {"input": {"q": "hours?"}, "rubric": "mentions 9-5"}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(ds.len(), 2);
        assert_eq!(ds.cases[0].expected, Some(json!("yes")));
        assert!(ds.cases[0].is_critical());
        assert_eq!(ds.cases[0].metadata.extra["owner"], json!("billing"));
        assert!(!ds.cases[1].is_critical());
        assert_eq!(ds.cases[1].rubric.as_deref(), Some("mentions 9-5"));
    }

    #[test]
    fn test_critical_cases_reports_positions() {
        let ds = Dataset::new(
            "d",
            vec![
                Case::new([("x", "a")]),
                Case::new([("x", "b")]).critical(),
                Case::new([("x", "c")]).critical(),
            ],
        );
        let idx: Vec<usize> = ds.critical_cases().map(|(i, _)| i).collect();
        assert_eq!(idx, vec![1, 2]);
    }

    #[test]
    fn test_digest_changes_when_a_case_changes() {
        let a = Dataset::new("d", vec![Case::new([("x", "a")])]);
        let mut b = a.clone();
        assert_eq!(a.digest().unwrap(), b.digest().unwrap());

        b.cases[0].input.insert("x".into(), json!("changed"));
        assert_ne!(a.digest().unwrap(), b.digest().unwrap());
    }
}
