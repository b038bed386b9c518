//! Domain types: datasets, prompt versions, scores, evaluation results, errors.

pub mod dataset;
pub mod digest;
pub mod error;
pub mod score;
pub mod version;

pub use dataset::{Case, CaseMetadata, Dataset};
pub use error::{ConfigError, LoopError, Result};
pub use score::{
    CaseError, CaseErrorKind, CaseResult, Dimension, DimensionScore, EvaluationResult,
    ScoreMethod,
};
pub use version::PromptVersion;
