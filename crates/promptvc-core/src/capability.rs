//! Capability boundary: template rendering and text generation.
//!
//! promptvc never talks to a model provider directly. Callers supply a
//! [`GenerationProvider`] and, optionally, a [`TemplateRenderer`].

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RenderError {
    #[error("missing required variable `{0}`")]
    MissingVariable(String),

    #[error("unterminated placeholder starting at byte {0}")]
    Unterminated(usize),

    #[error("{0}")]
    Rejected(String),
}

/// Turns a template plus case variables into a prompt.
pub trait TemplateRenderer: Send + Sync {
    fn render(
        &self,
        template: &str,
        variables: &BTreeMap<String, Value>,
    ) -> Result<String, RenderError>;
}

enum Segment<'a> {
    Text(&'a str),
    Placeholder(&'a str),
}

/// Split a template into literal text and `{name}` placeholders.
/// `{{` and `}}` are literal braces.
fn segments(template: &str) -> Result<Vec<Segment<'_>>, RenderError> {
    let bytes = template.as_bytes();
    let mut out = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'{' if bytes.get(i + 1) == Some(&b'{') => {
                out.push(Segment::Text(&template[start..=i]));
                i += 2;
                start = i;
            }
            b'}' if bytes.get(i + 1) == Some(&b'}') => {
                out.push(Segment::Text(&template[start..=i]));
                i += 2;
                start = i;
            }
            b'{' => {
                let close = template[i + 1..]
                    .find('}')
                    .ok_or(RenderError::Unterminated(i))?;
                out.push(Segment::Text(&template[start..i]));
                out.push(Segment::Placeholder(template[i + 1..i + 1 + close].trim()));
                i = i + 2 + close;
                start = i;
            }
            _ => i += 1,
        }
    }
    out.push(Segment::Text(&template[start..]));
    Ok(out)
}

/// Placeholder names used by `template`. Malformed templates yield the
/// names found before the malformed span.
pub fn extract_variables(template: &str) -> BTreeSet<String> {
    let mut rest = template;
    loop {
        match segments(rest) {
            Ok(segs) => {
                return segs
                    .into_iter()
                    .filter_map(|s| match s {
                        Segment::Placeholder(name) => Some(name.to_string()),
                        Segment::Text(_) => None,
                    })
                    .collect();
            }
            Err(RenderError::Unterminated(at)) => rest = &rest[..at],
            Err(_) => return BTreeSet::new(),
        }
    }
}

/// Renders `{name}` placeholders. String values are inserted verbatim,
/// anything else as compact JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct BraceTemplateRenderer;

impl TemplateRenderer for BraceTemplateRenderer {
    fn render(
        &self,
        template: &str,
        variables: &BTreeMap<String, Value>,
    ) -> Result<String, RenderError> {
        let mut out = String::with_capacity(template.len());
        for seg in segments(template)? {
            match seg {
                Segment::Text(t) => out.push_str(t),
                Segment::Placeholder(name) => match variables.get(name) {
                    Some(Value::String(s)) => out.push_str(s),
                    Some(other) => out.push_str(&other.to_string()),
                    None => return Err(RenderError::MissingVariable(name.to_string())),
                },
            }
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Generation
// ---------------------------------------------------------------------------

/// Model parameters forwarded to the provider untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelParams {
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            model: "gpt-4-turbo-preview".to_string(),
            temperature: 0.7,
            max_tokens: 2000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub prompt: String,
    pub params: ModelParams,
}

/// Token accounting reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl Usage {
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

impl std::ops::AddAssign for Usage {
    fn add_assign(&mut self, rhs: Self) {
        self.prompt_tokens += rhs.prompt_tokens;
        self.completion_tokens += rhs.completion_tokens;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Generation {
    pub text: String,
    #[serde(default)]
    pub usage: Usage,
}

impl Generation {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            usage: Usage::default(),
        }
    }
}

/// Provider-side failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderFailure {
    /// Rate limit, overload, network hiccup. Retried.
    #[error("transient provider error: {0}")]
    Transient(String),

    /// The call did not finish within the configured timeout. Retried.
    #[error("provider call timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    /// Content policy, invalid request. Never retried.
    #[error("provider rejected request: {0}")]
    Rejected(String),
}

impl ProviderFailure {
    pub fn is_retriable(&self) -> bool {
        !matches!(self, ProviderFailure::Rejected(_))
    }
}

/// Text generation capability (LLM provider client).
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    async fn generate(&self, request: GenerationRequest) -> Result<Generation, ProviderFailure>;
}
