//! Domain-level error taxonomy for promptvc.
//!
//! Only dataset-level and configuration-level problems surface as errors.
//! Per-case provider and judge failures are recorded as data on the case
//! (see [`crate::domain::score::CaseError`]) so an evaluation always completes.

use crate::capability::RenderError;

/// Invalid configuration. Raised when a config value is built or loaded,
/// never in the middle of an evaluation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("{field} must be within [0, 1], got {value}")]
    OutOfUnitRange { field: String, value: f64 },

    #[error("{field} must be greater than zero, got {value}")]
    NotPositive { field: String, value: f64 },

    #[error("{field} must be at least 1")]
    ZeroCount { field: String },

    #[error("scoring must evaluate at least one dimension")]
    NoDimensions,

    #[error("{field}: {reason}")]
    Invalid { field: String, reason: String },

    #[error("invalid validator: {0}")]
    InvalidValidator(String),

    #[error("failed to parse config: {0}")]
    Parse(String),
}

/// promptvc domain errors.
#[derive(Debug, thiserror::Error)]
pub enum LoopError {
    #[error("render failed for case {case_index}: {source}")]
    Render {
        case_index: usize,
        #[source]
        source: RenderError,
    },

    #[error(
        "evaluation of {version_id} on dataset {dataset_id} produced no scorable cases \
         ({error_cases} case error(s))"
    )]
    Evaluation {
        version_id: String,
        dataset_id: String,
        error_cases: usize,
    },

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("dataset mismatch: baseline scored on {baseline}, candidate on {candidate}")]
    DatasetMismatch { baseline: String, candidate: String },

    #[error("case task failed: {0}")]
    Join(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for promptvc domain operations.
pub type Result<T> = std::result::Result<T, LoopError>;
