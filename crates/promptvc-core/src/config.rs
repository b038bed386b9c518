//! Loop configuration, loaded from TOML.
//!
//! ```toml
//! [scoring]
//! default_pass_threshold = 0.7
//! [scoring.weights]
//! correctness = 0.5
//!
//! [guardrails]
//! min_improvement_threshold = 0.05
//!
//! [concurrency]
//! max_concurrency = 8
//! request_budget = 16
//! ```
//!
//! Every section is optional and falls back to its `Default`.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::analyzer::AnalyzerConfig;
use crate::capability::ModelParams;
use crate::domain::{ConfigError, Result};
use crate::generator::GeneratorConfig;
use crate::guardrails::GuardrailConfig;
use crate::judge::JudgeConfig;
use crate::retry::RetryPolicy;
use crate::scoring::ScoringConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    /// Cases evaluated at once within one evaluation.
    pub max_concurrency: usize,
    /// Provider calls in flight across every concurrent evaluation.
    pub request_budget: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            request_budget: 16,
        }
    }
}

impl ConcurrencyConfig {
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.max_concurrency == 0 {
            return Err(ConfigError::ZeroCount {
                field: "concurrency.max_concurrency".into(),
            });
        }
        if self.request_budget == 0 {
            return Err(ConfigError::ZeroCount {
                field: "concurrency.request_budget".into(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    pub scoring: ScoringConfig,
    pub guardrails: GuardrailConfig,
    pub concurrency: ConcurrencyConfig,
    pub retry: RetryPolicy,
    pub judge: JudgeConfig,
    /// Parameters for generating the outputs under evaluation.
    pub generation: ModelParams,
    pub generator: GeneratorConfig,
    pub analyzer: AnalyzerConfig,
}

impl LoopConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(s: &str) -> std::result::Result<Self, ConfigError> {
        let cfg: LoopConfig = toml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(Self::from_toml_str(&raw)?)
    }

    pub fn to_toml_string(&self) -> std::result::Result<String, ConfigError> {
        toml::to_string(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Guardrails validate themselves on construction; everything else is
    /// checked here.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        self.scoring.validate()?;
        self.concurrency.validate()?;
        self.retry.validate()?;
        self.judge.validate()?;
        self.generator.validate()?;
        self.analyzer.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Dimension;

    #[test]
    fn test_empty_document_is_all_defaults() {
        let cfg = LoopConfig::from_toml_str("").unwrap();
        assert_eq!(cfg, LoopConfig::default());
        assert_eq!(cfg.guardrails, GuardrailConfig::recommended());
        assert_eq!(cfg.judge.temperature(), 0.0);
    }

    #[test]
    fn test_partial_sections_merge_with_defaults() {
        let cfg = LoopConfig::from_toml_str(
            r#"
            [scoring.weights]
            correctness = 0.6
            safety = 0.4

            [concurrency]
            max_concurrency = 2

            [retry]
            max_retries = 5
            "#,
        )
        .unwrap();
        assert_eq!(cfg.scoring.weight_for(&Dimension::Correctness), 0.6);
        assert_eq!(cfg.scoring.weight_for(&Dimension::Verbosity), 0.1);
        assert_eq!(cfg.concurrency.max_concurrency, 2);
        assert_eq!(cfg.concurrency.request_budget, 16);
        assert_eq!(cfg.retry.max_retries, 5);
        assert_eq!(cfg.retry.backoff_base_ms, 500);
    }

    #[test]
    fn test_invalid_guardrails_fail_to_parse() {
        let err = LoopConfig::from_toml_str(
            r#"
            [guardrails]
            min_absolute_score = 1.4
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(msg) if msg.contains("min_absolute_score")));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let err = LoopConfig::from_toml_str("[concurrency]\nmax_concurrency = 0").unwrap_err();
        assert_eq!(
            err,
            ConfigError::ZeroCount {
                field: "concurrency.max_concurrency".into()
            }
        );
    }

    #[test]
    fn test_defaults_survive_toml_serialization() {
        let text = LoopConfig::default().to_toml_string().unwrap();
        assert_eq!(
            LoopConfig::from_toml_str(&text).unwrap(),
            LoopConfig::default()
        );
    }
}
