//! promptvc core library
//!
//! Measured self-improvement for versioned prompt templates: evaluate a
//! version on a dataset, cluster its failures, generate candidate templates,
//! compare them to the baseline behind promotion guardrails, and route live
//! traffic between versions with a consistent hash.

pub mod analyzer;
pub mod budget;
pub mod capability;
pub mod changelog;
pub mod config;
pub mod domain;
pub mod experiment;
pub mod fakes;
pub mod generator;
pub mod guardrails;
pub mod improvement;
pub mod judge;
pub mod metrics;
pub mod obs;
pub mod pipeline;
pub mod retry;
pub mod router;
pub mod scoring;
pub mod telemetry;
pub mod validators;

pub use analyzer::{FailureAnalyzer, FailureCluster, FailureReport};
pub use budget::RequestBudget;
pub use capability::{
    BraceTemplateRenderer, Generation, GenerationProvider, GenerationRequest, ModelParams,
    ProviderFailure, RenderError, TemplateRenderer, Usage,
};
pub use config::{ConcurrencyConfig, LoopConfig};
pub use domain::{
    Case, CaseError, CaseErrorKind, CaseResult, ConfigError, Dataset, Dimension, DimensionScore,
    EvaluationResult, LoopError, PromptVersion, Result, ScoreMethod,
};
pub use experiment::{ExperimentOutcome, ExperimentReport, ExperimentRunner};
pub use generator::{Candidate, CandidateBatch, CandidateGenerator};
pub use guardrails::{
    evaluate_guardrails, Decision, GuardrailCheck, GuardrailConfig, GuardrailThresholds,
    GuardrailVerdict, GuardrailViolation,
};
pub use improvement::{EvaluationReport, SelfImprovementLoop, SelfImprovementReport};
pub use judge::{JudgeAdapter, JudgeConfig, JudgeRequest};
pub use pipeline::EvaluationPipeline;
pub use router::{route, RouterError, RoutingAssignment, RoutingConfig, VersionWeight};
pub use scoring::ScoringConfig;
pub use telemetry::init_tracing;
pub use validators::{ValidatorSet, ValidatorSpec};

/// promptvc version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
