//! Declarative description of a task executor's contract.
//!
//! An [`AgentConfig`] names the context keys a step needs and the keys it
//! promises to produce. The executor checks both sides against the live
//! context, so a step never starts without its inputs and never reports
//! success without its outputs.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::context::OmaContext;
use crate::error::OmaError;

static AGENT_ID_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z][a-z0-9_]*$").expect("invalid agent id regex"));

/// JSON shape expected for a context key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
    Any,
}

impl ValueKind {
    /// Read the kind from the leading word of a description such as
    /// `"string - manuscript file ID"`. Unknown words mean [`ValueKind::Any`].
    pub fn from_description(description: &str) -> Self {
        let head = description
            .split(['-', ' ', ':'])
            .find(|part| !part.is_empty())
            .unwrap_or_default()
            .to_ascii_lowercase();
        match head.as_str() {
            "string" | "str" => ValueKind::String,
            "number" | "float" => ValueKind::Number,
            "integer" | "int" => ValueKind::Integer,
            "boolean" | "bool" => ValueKind::Boolean,
            "object" | "dict" | "map" => ValueKind::Object,
            "array" | "list" => ValueKind::Array,
            _ => ValueKind::Any,
        }
    }

    pub fn matches(&self, value: &Value) -> bool {
        match self {
            ValueKind::String => value.is_string(),
            ValueKind::Number => value.is_number(),
            ValueKind::Integer => value.is_i64() || value.is_u64(),
            ValueKind::Boolean => value.is_boolean(),
            ValueKind::Object => value.is_object(),
            ValueKind::Array => value.is_array(),
            ValueKind::Any => true,
        }
    }

    pub fn of(value: &Value) -> Self {
        match value {
            Value::String(_) => ValueKind::String,
            Value::Number(n) if n.is_i64() || n.is_u64() => ValueKind::Integer,
            Value::Number(_) => ValueKind::Number,
            Value::Bool(_) => ValueKind::Boolean,
            Value::Object(_) => ValueKind::Object,
            Value::Array(_) => ValueKind::Array,
            Value::Null => ValueKind::Any,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ValueKind::String => "string",
            ValueKind::Number => "number",
            ValueKind::Integer => "integer",
            ValueKind::Boolean => "boolean",
            ValueKind::Object => "object",
            ValueKind::Array => "array",
            ValueKind::Any => "any",
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One declared context key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextField {
    pub kind: ValueKind,
    pub description: String,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

fn default_required() -> bool {
    true
}

impl ContextField {
    pub fn required(description: impl Into<String>) -> Self {
        let description = description.into();
        Self {
            kind: ValueKind::from_description(&description),
            description,
            required: true,
            default: None,
        }
    }

    pub fn optional(description: impl Into<String>, default: Option<Value>) -> Self {
        Self {
            required: false,
            default,
            ..Self::required(description)
        }
    }
}

/// Null and blank strings count as absent, the same as a missing key.
fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

/// Immutable metadata for one task executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub agent_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Seconds before a backend run is abandoned.
    pub timeout: u64,
    /// Retries an external orchestrator may attempt; never used internally.
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub input: BTreeMap<String, ContextField>,
    #[serde(default)]
    pub output: BTreeMap<String, ContextField>,
    #[serde(default)]
    pub estimated_tools_cnt: u32,
    /// Seconds.
    #[serde(default)]
    pub estimated_total_time: u64,
}

impl AgentConfig {
    pub fn new(agent_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            name: name.into(),
            description: String::new(),
            timeout: 300,
            retry_count: 0,
            input: BTreeMap::new(),
            output: BTreeMap::new(),
            estimated_tools_cnt: 0,
            estimated_total_time: 0,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_timeout_secs(mut self, timeout: u64) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_input(mut self, key: impl Into<String>, description: impl Into<String>) -> Self {
        self.input
            .insert(key.into(), ContextField::required(description));
        self
    }

    pub fn with_optional_input(
        mut self,
        key: impl Into<String>,
        description: impl Into<String>,
        default: Option<Value>,
    ) -> Self {
        self.input
            .insert(key.into(), ContextField::optional(description, default));
        self
    }

    pub fn with_output(mut self, key: impl Into<String>, description: impl Into<String>) -> Self {
        self.output
            .insert(key.into(), ContextField::required(description));
        self
    }

    pub fn with_estimates(mut self, tools: u32, total_time_secs: u64) -> Self {
        self.estimated_tools_cnt = tools;
        self.estimated_total_time = total_time_secs;
        self
    }

    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn required_inputs(&self) -> impl Iterator<Item = &str> {
        self.input
            .iter()
            .filter(|(_, field)| field.required)
            .map(|(key, _)| key.as_str())
    }

    pub fn output_keys(&self) -> impl Iterator<Item = &str> {
        self.output.keys().map(String::as_str)
    }

    pub fn validate(&self) -> Result<(), OmaError> {
        if !AGENT_ID_PATTERN.is_match(&self.agent_id) {
            return Err(OmaError::InvalidConfiguration(format!(
                "agent_id `{}` must start with a letter and contain only lowercase letters, digits and underscores",
                self.agent_id
            )));
        }
        if self.timeout == 0 {
            return Err(OmaError::InvalidConfiguration(format!(
                "agent `{}` must declare a timeout greater than zero",
                self.agent_id
            )));
        }
        if let Some(key) = self
            .input
            .keys()
            .chain(self.output.keys())
            .find(|key| key.trim().is_empty())
        {
            return Err(OmaError::InvalidConfiguration(format!(
                "agent `{}` declares an empty context key `{key}`",
                self.agent_id
            )));
        }
        Ok(())
    }

    /// Collect declared inputs from the context, applying defaults for optional keys.
    pub fn resolve_inputs(&self, context: &OmaContext) -> Result<StepInputs, OmaError> {
        let mut values = BTreeMap::new();
        for (key, field) in &self.input {
            let value = context.get_value(key).filter(|value| !is_blank(value));
            let value = match (value, field.required) {
                (Some(value), _) => value,
                (None, true) => {
                    return Err(OmaError::MissingInput {
                        key: key.clone(),
                        agent_id: self.agent_id.clone(),
                    });
                }
                (None, false) => match &field.default {
                    Some(default) => default.clone(),
                    None => continue,
                },
            };
            if !field.kind.matches(&value) {
                return Err(OmaError::InvalidInput {
                    key: key.clone(),
                    agent_id: self.agent_id.clone(),
                    expected: field.kind.to_string(),
                    found: ValueKind::of(&value).to_string(),
                });
            }
            values.insert(key.clone(), value);
        }
        Ok(StepInputs { values })
    }

    /// Check that every declared output is present with the declared shape.
    pub fn collect_outputs(&self, context: &OmaContext) -> Result<Map<String, Value>, OmaError> {
        let mut outputs = Map::new();
        for (key, field) in &self.output {
            let value = context
                .get_value(key)
                .filter(|value| !is_blank(value))
                .ok_or_else(|| OmaError::MissingOutput {
                    key: key.clone(),
                    agent_id: self.agent_id.clone(),
                })?;
            if !field.kind.matches(&value) {
                return Err(OmaError::backend(format!(
                    "output `{key}` of agent `{}` must be {}, found {}",
                    self.agent_id,
                    field.kind,
                    ValueKind::of(&value)
                )));
            }
            outputs.insert(key.clone(), value);
        }
        Ok(outputs)
    }
}

/// Inputs resolved for one run of a step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepInputs {
    values: BTreeMap<String, Value>,
}

impl StepInputs {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    pub fn str_or<'a>(&'a self, key: &str, fallback: &'a str) -> &'a str {
        self.get_str(key).unwrap_or(fallback)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl FromIterator<(String, Value)> for StepInputs {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}
