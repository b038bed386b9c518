//! Loading loop configuration from disk.

use std::io::Write;

use promptvc_core::{ConfigError, Dimension, LoopConfig, LoopError};

#[test]
fn load_reads_and_validates_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[scoring]
dimensions = ["correctness", "format_adherence", "tone"]

[scoring.weights]
tone = 0.3

[guardrails]
min_improvement_threshold = 0.1
max_candidates_per_iteration = 3

[judge]
model = "judge-large"
"#
    )
    .unwrap();

    let cfg = LoopConfig::load(file.path()).unwrap();
    assert_eq!(cfg.scoring.dimensions[2], Dimension::Custom("tone".into()));
    assert_eq!(cfg.scoring.weight_for(&Dimension::Custom("tone".into())), 0.3);
    assert_eq!(cfg.guardrails.min_improvement_threshold(), 0.1);
    assert_eq!(cfg.guardrails.max_candidates_per_iteration(), 3);
    assert_eq!(cfg.judge.params().model, "judge-large");
    assert_eq!(cfg.judge.params().temperature, 0.0);
}

#[test]
fn load_rejects_out_of_range_threshold() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[scoring]\ndefault_pass_threshold = 1.5").unwrap();

    let err = LoopConfig::load(file.path()).unwrap_err();
    assert!(matches!(
        err,
        LoopError::Config(ConfigError::OutOfUnitRange { ref field, .. })
            if field == "scoring.default_pass_threshold"
    ));
}

#[test]
fn missing_file_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = LoopConfig::load(dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, LoopError::Io(_)));
}
