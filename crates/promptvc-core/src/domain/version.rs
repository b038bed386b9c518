use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::capability::extract_variables;
use crate::domain::ConfigError;
use crate::validators::{ValidatorSet, ValidatorSpec};

/// A prompt template at one point in its history. Storage is the caller's
/// concern; promptvc only reads these.
///
/// Validators are checked when attached and when deserialized, so a bad regex
/// or schema surfaces as a [`ConfigError`] before any evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "UncheckedPromptVersion")]
pub struct PromptVersion {
    pub version_id: String,
    pub template: String,
    /// JSON schema the output must satisfy. Scored as a `json_schema` validator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validators: Vec<ValidatorSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_version_id: Option<String>,
}

impl PromptVersion {
    pub fn new(version_id: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            version_id: version_id.into(),
            template: template.into(),
            output_schema: None,
            validators: Vec::new(),
            parent_version_id: None,
        }
    }

    pub fn with_output_schema(mut self, schema: Value) -> Result<Self, ConfigError> {
        ValidatorSpec::JsonSchema {
            schema: schema.clone(),
        }
        .validate()?;
        self.output_schema = Some(schema);
        Ok(self)
    }

    pub fn with_validator(mut self, validator: ValidatorSpec) -> Result<Self, ConfigError> {
        validator.validate()?;
        self.validators.push(validator);
        Ok(self)
    }

    /// Compile every validator once; fails on the first unusable spec.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ValidatorSet::new(&self.validator_specs()).map(|_| ())
    }

    /// Output schema (if any) followed by the explicit validators.
    pub fn validator_specs(&self) -> Vec<ValidatorSpec> {
        self.output_schema
            .iter()
            .map(|schema| ValidatorSpec::JsonSchema {
                schema: schema.clone(),
            })
            .chain(self.validators.iter().cloned())
            .collect()
    }

    pub fn variables(&self) -> BTreeSet<String> {
        extract_variables(&self.template)
    }
}

#[derive(Deserialize)]
struct UncheckedPromptVersion {
    version_id: String,
    template: String,
    #[serde(default)]
    output_schema: Option<Value>,
    #[serde(default)]
    validators: Vec<ValidatorSpec>,
    #[serde(default)]
    parent_version_id: Option<String>,
}

impl TryFrom<UncheckedPromptVersion> for PromptVersion {
    type Error = ConfigError;

    fn try_from(raw: UncheckedPromptVersion) -> Result<Self, Self::Error> {
        let version = PromptVersion {
            version_id: raw.version_id,
            template: raw.template,
            output_schema: raw.output_schema,
            validators: raw.validators,
            parent_version_id: raw.parent_version_id,
        };
        version.validate()?;
        Ok(version)
    }
}
