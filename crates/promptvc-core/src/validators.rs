//! Deterministic output validators.
//!
//! A [`ValidatorSet`] scores `format_adherence` without any model call: the
//! score is the fraction of validators the output satisfies.

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::ConfigError;

/// Declarative validator, as stored alongside a prompt version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ValidatorSpec {
    /// JSON output conforming to a schema. Supported keywords: `type`,
    /// `properties`, `required`, `enum`, `minLength`, `maxLength`, `minimum`,
    /// `maximum`, `items`, `minItems`, `maxItems`.
    JsonSchema { schema: Value },

    /// Output must match `pattern` somewhere.
    Regex {
        pattern: String,
        #[serde(default)]
        case_insensitive: bool,
    },

    /// Plain-text constraints.
    Constraint {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min_length: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_length: Option<usize>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        must_contain: Vec<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        must_not_contain: Vec<String>,
    },
}

impl ValidatorSpec {
    pub fn kind(&self) -> &'static str {
        match self {
            ValidatorSpec::JsonSchema { .. } => "json_schema",
            ValidatorSpec::Regex { .. } => "regex",
            ValidatorSpec::Constraint { .. } => "constraint",
        }
    }

    /// Reject a spec that could never be compiled into a validator.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.compile().map(|_| ())
    }

    fn compile(&self) -> Result<Compiled, ConfigError> {
        let compiled = match self {
            ValidatorSpec::JsonSchema { schema } => {
                if !schema.is_object() {
                    return Err(ConfigError::InvalidValidator(
                        "json_schema: schema must be an object".into(),
                    ));
                }
                Compiled::Schema(schema.clone())
            }
            ValidatorSpec::Regex {
                pattern,
                case_insensitive,
            } => {
                let regex = RegexBuilder::new(pattern)
                    .case_insensitive(*case_insensitive)
                    .build()
                    .map_err(|e| ConfigError::InvalidValidator(format!("regex: {e}")))?;
                Compiled::Pattern {
                    source: pattern.clone(),
                    regex,
                }
            }
            ValidatorSpec::Constraint {
                min_length,
                max_length,
                must_contain,
                must_not_contain,
            } => {
                if let (Some(min), Some(max)) = (min_length, max_length) {
                    if min > max {
                        return Err(ConfigError::InvalidValidator(format!(
                            "constraint: min_length {min} exceeds max_length {max}"
                        )));
                    }
                }
                Compiled::Constraint {
                    min_length: *min_length,
                    max_length: *max_length,
                    must_contain: must_contain.clone(),
                    must_not_contain: must_not_contain.clone(),
                }
            }
        };
        Ok(compiled)
    }
}

/// Outcome of one validator against one output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub validator: String,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<String>,
}

/// Aggregate of every validator in a set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatorScore {
    pub score: f64,
    pub outcomes: Vec<ValidationOutcome>,
}

impl ValidatorScore {
    /// Details of every failed validator, in validator order.
    pub fn failure_details(&self) -> Vec<String> {
        self.outcomes
            .iter()
            .filter(|o| !o.passed)
            .flat_map(|o| o.details.iter().cloned())
            .collect()
    }
}

#[derive(Debug, Clone)]
enum Compiled {
    Schema(Value),
    Pattern { source: String, regex: Regex },
    Constraint {
        min_length: Option<usize>,
        max_length: Option<usize>,
        must_contain: Vec<String>,
        must_not_contain: Vec<String>,
    },
}

/// Compiled validators for one prompt version.
#[derive(Debug, Clone, Default)]
pub struct ValidatorSet {
    validators: Vec<Compiled>,
}

impl ValidatorSet {
    /// Compile `specs`. Invalid regexes and non-object schemas are config errors.
    pub fn new(specs: &[ValidatorSpec]) -> Result<Self, ConfigError> {
        let validators = specs
            .iter()
            .map(ValidatorSpec::compile)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { validators })
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn run(&self, output: &str) -> Vec<ValidationOutcome> {
        self.validators.iter().map(|v| v.check(output)).collect()
    }

    /// Fraction of validators passed, or `None` for an empty set.
    pub fn score(&self, output: &str) -> Option<ValidatorScore> {
        if self.is_empty() {
            return None;
        }
        let outcomes = self.run(output);
        let passed = outcomes.iter().filter(|o| o.passed).count();
        Some(ValidatorScore {
            score: passed as f64 / outcomes.len() as f64,
            outcomes,
        })
    }
}

impl Compiled {
    fn check(&self, output: &str) -> ValidationOutcome {
        match self {
            Compiled::Schema(schema) => {
                let details = match extract_json(output) {
                    Some(value) => {
                        let mut errors = Vec::new();
                        check_schema(schema, &value, "$", &mut errors);
                        errors
                    }
                    None => vec!["output is not valid JSON".to_string()],
                };
                outcome("json_schema", details)
            }
            Compiled::Pattern { source, regex } => {
                let details = if regex.is_match(output) {
                    Vec::new()
                } else {
                    vec![format!("output does not match pattern `{source}`")]
                };
                outcome("regex", details)
            }
            Compiled::Constraint {
                min_length,
                max_length,
                must_contain,
                must_not_contain,
            } => {
                let mut details = Vec::new();
                let len = output.chars().count();
                if let Some(min) = min_length {
                    if len < *min {
                        details.push(format!("output length {len} is below minimum {min}"));
                    }
                }
                if let Some(max) = max_length {
                    if len > *max {
                        details.push(format!("output length {len} exceeds maximum {max}"));
                    }
                }
                for needle in must_contain {
                    if !output.contains(needle.as_str()) {
                        details.push(format!("output is missing required text `{needle}`"));
                    }
                }
                for needle in must_not_contain {
                    if output.contains(needle.as_str()) {
                        details.push(format!("output contains forbidden text `{needle}`"));
                    }
                }
                outcome("constraint", details)
            }
        }
    }
}

fn outcome(validator: &str, details: Vec<String>) -> ValidationOutcome {
    ValidationOutcome {
        validator: validator.to_string(),
        passed: details.is_empty(),
        details,
    }
}

/// Pull a JSON value out of model output: the whole text, then the first
/// fenced code block, then the outermost `{...}` or `[...]` span.
pub fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(v) = serde_json::from_str(trimmed) {
        return Some(v);
    }
    if let Some(block) = fenced_block(trimmed) {
        if let Ok(v) = serde_json::from_str(block.trim()) {
            return Some(v);
        }
    }
    for (open, close) in [('{', '}'), ('[', ']')] {
        if let (Some(start), Some(end)) = (trimmed.find(open), trimmed.rfind(close)) {
            if start < end {
                if let Ok(v) = serde_json::from_str(&trimmed[start..=end]) {
                    return Some(v);
                }
            }
        }
    }
    None
}

/// Body of the first ``` fenced block, without its language tag.
fn fenced_block(text: &str) -> Option<&str> {
    let start = text.find("```")? + 3;
    let rest = &text[start..];
    let body_start = rest.find('\n').map(|i| i + 1).unwrap_or(0);
    let body = &rest[body_start..];
    let end = body.find("```")?;
    Some(&body[..end])
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "number" => value.is_number(),
        "integer" => match value {
            Value::Number(n) => {
                n.is_i64() || n.is_u64() || n.as_f64().is_some_and(|f| f.fract() == 0.0)
            }
            _ => false,
        },
        other => type_name(value) == other,
    }
}

fn check_schema(schema: &Value, value: &Value, path: &str, errors: &mut Vec<String>) {
    let Some(schema) = schema.as_object() else {
        return;
    };

    if let Some(expected) = schema.get("type") {
        let allowed: Vec<&str> = match expected {
            Value::String(s) => vec![s.as_str()],
            Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
            _ => Vec::new(),
        };
        if !allowed.is_empty() && !allowed.iter().any(|t| type_matches(t, value)) {
            errors.push(format!(
                "{path}: expected {}, got {}",
                allowed.join(" or "),
                type_name(value)
            ));
            return;
        }
    }

    if let Some(Value::Array(options)) = schema.get("enum") {
        if !options.contains(value) {
            errors.push(format!("{path}: value {value} is not one of the allowed values"));
        }
    }

    match value {
        Value::String(s) => {
            let len = s.chars().count() as u64;
            if let Some(min) = schema.get("minLength").and_then(Value::as_u64) {
                if len < min {
                    errors.push(format!("{path}: string shorter than {min}"));
                }
            }
            if let Some(max) = schema.get("maxLength").and_then(Value::as_u64) {
                if len > max {
                    errors.push(format!("{path}: string longer than {max}"));
                }
            }
        }
        Value::Number(n) => {
            let x = n.as_f64().unwrap_or(0.0);
            if let Some(min) = schema.get("minimum").and_then(Value::as_f64) {
                if x < min {
                    errors.push(format!("{path}: {x} is below minimum {min}"));
                }
            }
            if let Some(max) = schema.get("maximum").and_then(Value::as_f64) {
                if x > max {
                    errors.push(format!("{path}: {x} is above maximum {max}"));
                }
            }
        }
        Value::Object(map) => {
            if let Some(Value::Array(required)) = schema.get("required") {
                for key in required.iter().filter_map(Value::as_str) {
                    if !map.contains_key(key) {
                        errors.push(format!("{path}: missing required property `{key}`"));
                    }
                }
            }
            if let Some(Value::Object(props)) = schema.get("properties") {
                for (key, sub) in props {
                    if let Some(child) = map.get(key) {
                        check_schema(sub, child, &format!("{path}.{key}"), errors);
                    }
                }
            }
        }
        Value::Array(items) => {
            let len = items.len() as u64;
            if let Some(min) = schema.get("minItems").and_then(Value::as_u64) {
                if len < min {
                    errors.push(format!("{path}: fewer than {min} items"));
                }
            }
            if let Some(max) = schema.get("maxItems").and_then(Value::as_u64) {
                if len > max {
                    errors.push(format!("{path}: more than {max} items"));
                }
            }
            if let Some(item_schema) = schema.get("items") {
                for (i, item) in items.iter().enumerate() {
                    check_schema(item_schema, item, &format!("{path}[{i}]"), errors);
                }
            }
        }
        Value::Null | Value::Bool(_) => {}
    }
}
