//! The single return contract of a task executor.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ErrorKind, OmaError};

/// Serialized as `{"status": "success" | "error", "result": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "result", rename_all = "lowercase")]
pub enum ResultEnvelope {
    Success(SuccessResult),
    Error(ErrorResult),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuccessResult {
    pub raw_output: String,
    pub agent_id: String,
    /// Declared output keys copied from the context.
    #[serde(flatten)]
    pub outputs: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResult {
    pub error: String,
    pub agent_id: String,
    pub kind: ErrorKind,
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl ResultEnvelope {
    pub fn success(
        agent_id: impl Into<String>,
        raw_output: impl Into<String>,
        outputs: Map<String, Value>,
    ) -> Self {
        ResultEnvelope::Success(SuccessResult {
            raw_output: raw_output.into(),
            agent_id: agent_id.into(),
            outputs,
        })
    }

    pub fn from_error(agent_id: impl Into<String>, error: &OmaError) -> Self {
        ResultEnvelope::Error(ErrorResult {
            error: error.to_string(),
            agent_id: agent_id.into(),
            kind: error.kind(),
            retryable: error.is_retryable(),
            key: error.context_key().map(str::to_string),
        })
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ResultEnvelope::Success(_))
    }

    pub fn status(&self) -> &'static str {
        match self {
            ResultEnvelope::Success(_) => "success",
            ResultEnvelope::Error(_) => "error",
        }
    }

    pub fn agent_id(&self) -> &str {
        match self {
            ResultEnvelope::Success(result) => &result.agent_id,
            ResultEnvelope::Error(result) => &result.agent_id,
        }
    }

    pub fn error(&self) -> Option<&ErrorResult> {
        match self {
            ResultEnvelope::Error(result) => Some(result),
            ResultEnvelope::Success(_) => None,
        }
    }

    pub fn output(&self, key: &str) -> Option<&Value> {
        match self {
            ResultEnvelope::Success(result) => result.outputs.get(key),
            ResultEnvelope::Error(_) => None,
        }
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|err| {
            serde_json::json!({
                "status": "error",
                "result": { "error": format!("envelope serialization failed: {err}") }
            })
        })
    }
}

/// Lifecycle of one executor. A terminal state may start over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorState {
    Created,
    Running,
    Succeeded,
    Failed,
}

impl ExecutorState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutorState::Succeeded | ExecutorState::Failed)
    }

    pub fn can_transition_to(&self, next: ExecutorState) -> bool {
        match (self, next) {
            (ExecutorState::Created, ExecutorState::Running) => true,
            (ExecutorState::Running, ExecutorState::Succeeded | ExecutorState::Failed) => true,
            (state, ExecutorState::Running) => state.is_terminal(),
            _ => false,
        }
    }

    pub(crate) fn to_u8(self) -> u8 {
        match self {
            ExecutorState::Created => 0,
            ExecutorState::Running => 1,
            ExecutorState::Succeeded => 2,
            ExecutorState::Failed => 3,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => ExecutorState::Running,
            2 => ExecutorState::Succeeded,
            3 => ExecutorState::Failed,
            _ => ExecutorState::Created,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn success_envelope_shape() {
        let mut outputs = Map::new();
        outputs.insert("structured_content_overview_id".into(), json!("SCO-1"));
        let envelope = ResultEnvelope::success("pdf_parser", "done", outputs);

        assert_eq!(
            envelope.to_json(),
            json!({
                "status": "success",
                "result": {
                    "raw_output": "done",
                    "agent_id": "pdf_parser",
                    "structured_content_overview_id": "SCO-1"
                }
            })
        );
    }

    #[test]
    fn error_envelope_names_key() {
        let err = OmaError::MissingInput {
            key: "structured_content_overview_id".into(),
            agent_id: "comparative_analysis".into(),
        };
        let envelope = ResultEnvelope::from_error("comparative_analysis", &err);
        let value = envelope.to_json();

        assert_eq!(value["status"], json!("error"));
        assert_eq!(value["result"]["kind"], json!("missing_input"));
        assert_eq!(value["result"]["key"], json!("structured_content_overview_id"));
        assert_eq!(value["result"]["retryable"], json!(false));
        assert!(
            value["result"]["error"]
                .as_str()
                .unwrap()
                .contains("structured_content_overview_id")
        );

        let back: ResultEnvelope = serde_json::from_value(value).unwrap();
        assert_eq!(back, envelope);
    }

    #[test]
    fn state_transitions() {
        use ExecutorState::*;
        assert!(Created.can_transition_to(Running));
        assert!(Running.can_transition_to(Failed));
        assert!(Succeeded.can_transition_to(Running));
        assert!(!Running.can_transition_to(Running));
        assert!(!Created.can_transition_to(Succeeded));
        for state in [Created, Running, Succeeded, Failed] {
            assert_eq!(ExecutorState::from_u8(state.to_u8()), state);
        }
    }
}
