//! promptvc - offline tooling for the prompt self-improvement loop
//!
//! ## Commands
//!
//! - `route`: resolve an identifier to a version under a traffic split
//! - `guardrails`: decide whether a scored candidate may replace a baseline
//! - `analyze`: cluster the failures of a stored evaluation result
//! - `validate`: run a version's validators against an output
//! - `config`: check or print loop configuration

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::{debug, info};

use promptvc_core::analyzer::FailureAnalyzer;
use promptvc_core::changelog::render_template_diff;
use promptvc_core::{
    evaluate_guardrails, route, Dataset, EvaluationResult, GuardrailVerdict, LoopConfig,
    PromptVersion, RoutingAssignment, RoutingConfig, ValidatorSet, VersionWeight,
};

#[derive(Parser)]
#[command(name = "promptvc")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Measured self-improvement for versioned prompt templates", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Loop configuration file (TOML)
    #[arg(long, global = true, env = "PROMPTVC_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Format {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve an identifier to a version under a traffic split
    Route {
        /// Stable identifier, e.g. a user or session id
        identifier: String,

        /// Stable version as NAME=WEIGHT (repeatable)
        #[arg(long = "stable", value_name = "NAME=WEIGHT")]
        stable: Vec<String>,

        /// Canary version as NAME=WEIGHT (repeatable)
        #[arg(long = "canary", value_name = "NAME=WEIGHT")]
        canary: Vec<String>,

        /// Experiment id attached to the assignment
        #[arg(long)]
        experiment: Option<String>,

        #[arg(long, value_enum, default_value = "text")]
        format: Format,
    },

    /// Compare two evaluation results (JSON) under the configured guardrails
    Guardrails {
        /// Baseline EvaluationResult JSON file
        #[arg(long)]
        baseline: PathBuf,

        /// Candidate EvaluationResult JSON file
        #[arg(long)]
        candidate: PathBuf,

        /// Exit non-zero when the candidate is rejected
        #[arg(long)]
        fail_on_reject: bool,

        #[arg(long, value_enum, default_value = "text")]
        format: Format,
    },

    /// Cluster the failures of an evaluation result
    Analyze {
        /// EvaluationResult JSON file
        #[arg(long)]
        result: PathBuf,

        /// Dataset JSON file the result was scored on
        #[arg(long)]
        dataset: PathBuf,

        #[arg(long, value_enum, default_value = "text")]
        format: Format,
    },

    /// Run a prompt version's validators against an output file
    Validate {
        /// PromptVersion JSON file
        #[arg(long)]
        version: PathBuf,

        /// File holding the model output to check
        #[arg(long)]
        output: PathBuf,

        #[arg(long, value_enum, default_value = "text")]
        format: Format,
    },

    /// Show the line diff between two prompt version templates
    Diff {
        /// Old PromptVersion JSON file
        a: PathBuf,
        /// New PromptVersion JSON file
        b: PathBuf,
    },

    /// Inspect loop configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Validate the configuration and print the effective settings
    Check,
    /// Print the default configuration
    Defaults,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    promptvc_core::init_tracing(cli.json, promptvc_core::telemetry::default_level(cli.verbose));

    match cli.command {
        Commands::Route {
            identifier,
            stable,
            canary,
            experiment,
            format,
        } => cmd_route(&identifier, &stable, &canary, experiment, format),
        Commands::Guardrails {
            baseline,
            candidate,
            fail_on_reject,
            format,
        } => {
            let config = load_config(cli.config.as_deref())?;
            cmd_guardrails(&config, &baseline, &candidate, fail_on_reject, format)
        }
        Commands::Analyze {
            result,
            dataset,
            format,
        } => {
            let config = load_config(cli.config.as_deref())?;
            cmd_analyze(&config, &result, &dataset, format)
        }
        Commands::Validate {
            version,
            output,
            format,
        } => cmd_validate(&version, &output, format),
        Commands::Diff { a, b } => cmd_diff(&a, &b),
        Commands::Config { action } => match action {
            ConfigAction::Check => cmd_config_check(cli.config.as_deref()),
            ConfigAction::Defaults => {
                print!("{}", LoopConfig::default().to_toml_string()?);
                Ok(())
            }
        },
    }
}

fn load_config(path: Option<&Path>) -> Result<LoopConfig> {
    match path {
        Some(path) => {
            debug!(path = %path.display(), "loading config");
            LoopConfig::load(path).with_context(|| format!("Failed to load config {:?}", path))
        }
        None => Ok(LoopConfig::default()),
    }
}

fn read_json_file<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read JSON file: {:?}", path))?;
    serde_json::from_str(&content).with_context(|| format!("Invalid JSON in {:?}", path))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Parse `NAME=WEIGHT`.
fn parse_weight(raw: &str) -> Result<(String, u32)> {
    let Some((name, weight)) = raw.split_once('=') else {
        bail!("expected NAME=WEIGHT, got {raw:?}");
    };
    let name = name.trim();
    if name.is_empty() {
        bail!("empty version name in {raw:?}");
    }
    let weight = weight
        .trim()
        .parse::<u32>()
        .with_context(|| format!("invalid weight in {raw:?}"))?;
    Ok((name.to_string(), weight))
}

fn build_routing_config(
    stable: &[String],
    canary: &[String],
    experiment: Option<String>,
) -> Result<RoutingConfig> {
    let mut versions = Vec::with_capacity(stable.len() + canary.len());
    for raw in stable {
        let (name, weight) = parse_weight(raw)?;
        versions.push(VersionWeight::stable(name, weight));
    }
    for raw in canary {
        let (name, weight) = parse_weight(raw)?;
        versions.push(VersionWeight::canary(name, weight));
    }
    let config = RoutingConfig {
        versions,
        experiment_id: experiment,
    };
    config.validate()?;
    Ok(config)
}

fn resolve_route(
    identifier: &str,
    stable: &[String],
    canary: &[String],
    experiment: Option<String>,
) -> Result<RoutingAssignment> {
    let config = build_routing_config(stable, canary, experiment)?;
    Ok(route(identifier, &config)?)
}

fn cmd_route(
    identifier: &str,
    stable: &[String],
    canary: &[String],
    experiment: Option<String>,
    format: Format,
) -> Result<()> {
    let assignment = resolve_route(identifier, stable, canary, experiment)?;
    match format {
        Format::Json => print_json(&assignment),
        Format::Text => {
            let tag = if assignment.is_canary { " (canary)" } else { "" };
            println!("{} -> {}{}", assignment.identifier, assignment.version, tag);
            println!("position: {:.6}", assignment.position);
            Ok(())
        }
    }
}

fn guardrail_verdict(
    config: &LoopConfig,
    baseline: &Path,
    candidate: &Path,
) -> Result<GuardrailVerdict> {
    let baseline: EvaluationResult = read_json_file(baseline)?;
    let candidate: EvaluationResult = read_json_file(candidate)?;
    if baseline.dataset_id != candidate.dataset_id {
        bail!(
            "results are on different datasets: {} vs {}",
            baseline.dataset_id,
            candidate.dataset_id
        );
    }
    Ok(evaluate_guardrails(&baseline, &candidate, &config.guardrails))
}

fn cmd_guardrails(
    config: &LoopConfig,
    baseline: &Path,
    candidate: &Path,
    fail_on_reject: bool,
    format: Format,
) -> Result<()> {
    let verdict = guardrail_verdict(config, baseline, candidate)?;
    match format {
        Format::Json => print_json(&verdict)?,
        Format::Text => {
            let decision = if verdict.promotes() { "PROMOTE" } else { "REJECT" };
            println!("decision: {decision}");
            println!("overall delta: {:+.4}", verdict.metrics.overall_delta);
            for (dim, delta) in &verdict.metrics.dimension_deltas {
                println!("  {dim}: {delta:+.4}");
            }
            for v in &verdict.violations {
                println!("  - {}", v.reason);
            }
        }
    }
    info!(promote = verdict.promotes(), violations = verdict.violations.len(), "guardrails evaluated");
    if fail_on_reject && !verdict.promotes() {
        bail!("candidate rejected by {} guardrail(s)", verdict.violations.len());
    }
    Ok(())
}

fn cmd_analyze(config: &LoopConfig, result: &Path, dataset: &Path, format: Format) -> Result<()> {
    let result: EvaluationResult = read_json_file(result)?;
    let raw = std::fs::read_to_string(dataset)
        .with_context(|| format!("Failed to read dataset: {:?}", dataset))?;
    let dataset = Dataset::from_json_str(&raw).context("Invalid dataset")?;

    let analyzer = FailureAnalyzer::new(
        config.analyzer.clone(),
        std::sync::Arc::new(config.scoring.clone()),
    );
    let report = analyzer.analyze(&result, &dataset);
    match format {
        Format::Json => print_json(&report),
        Format::Text => {
            println!(
                "{} failure(s), {} error case(s)",
                report.total_failures, report.error_cases
            );
            for cluster in &report.clusters {
                println!("\n[{}] {}", cluster.dimension, cluster.description);
                println!("  fix: {}", cluster.suggested_fix);
            }
            Ok(())
        }
    }
}

fn cmd_validate(version: &Path, output: &Path, format: Format) -> Result<()> {
    let version: PromptVersion = read_json_file(version)?;
    let output = std::fs::read_to_string(output)
        .with_context(|| format!("Failed to read output: {:?}", output))?;
    let set = ValidatorSet::new(&version.validator_specs())?;
    let Some(score) = set.score(&output) else {
        println!("version {} has no validators", version.version_id);
        return Ok(());
    };
    match format {
        Format::Json => print_json(&score),
        Format::Text => {
            println!("format_adherence: {:.4}", score.score);
            for outcome in &score.outcomes {
                let mark = if outcome.passed { "ok" } else { "FAIL" };
                println!("  [{mark}] {}", outcome.validator);
                for detail in &outcome.details {
                    println!("      {detail}");
                }
            }
            Ok(())
        }
    }
}

fn cmd_diff(a: &Path, b: &Path) -> Result<()> {
    let old: PromptVersion = read_json_file(a)?;
    let new: PromptVersion = read_json_file(b)?;
    println!("--- {}\n+++ {}", old.version_id, new.version_id);
    print!("{}", render_template_diff(&old.template, &new.template));
    Ok(())
}

fn cmd_config_check(path: Option<&Path>) -> Result<()> {
    let config = load_config(path)?;
    print!("{}", config.to_toml_string()?);
    info!("configuration valid");
    Ok(())
}
