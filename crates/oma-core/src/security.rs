//! Model provider credentials. OMA only reads them from the environment
//! variable named by `llm.api_key_env`.

use std::env;
use std::fmt;

use crate::error::OmaError;

const MASK: &str = "[REDACTED]";

/// An API key that stays out of `Debug` output and error text.
#[derive(Clone)]
pub struct SecretValue {
    value: String,
    source: Option<String>,
}

impl SecretValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            source: None,
        }
    }

    pub fn expose(&self) -> &str {
        &self.value
    }

    /// Environment variable the key was read from.
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    /// Mask every occurrence of the key in `text`.
    pub fn scrub(&self, text: &str) -> String {
        if self.value.is_empty() {
            return text.to_string();
        }
        text.replace(&self.value, MASK)
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(var) => write!(f, "SecretValue({var}: ***)"),
            None => f.write_str("SecretValue(***)"),
        }
    }
}

/// Read the provider key from `var`. Surrounding whitespace is trimmed and
/// a blank value counts as unset.
pub fn require_env(var: &str) -> Result<SecretValue, OmaError> {
    let raw = env::var(var).unwrap_or_default();
    let value = raw.trim();
    if value.is_empty() {
        return Err(OmaError::MissingSecret(var.to_string()));
    }
    Ok(SecretValue {
        value: value.to_string(),
        source: Some(var.to_string()),
    })
}
