//! Chat-completion abstraction used by the crew and graph backends.
//!
//! Message shapes follow the OpenAI function-calling wire format, which is
//! what OpenRouter accepts.

mod openrouter;
mod scripted;

pub use openrouter::OpenRouterProvider;
pub use scripted::{RecordedRequest, ScriptedProvider};

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::OmaError;
use crate::tools::ToolSpec;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Assistant turn as returned by the model, tool calls included.
    pub fn assistant(response: &ChatResponse) -> Self {
        Self {
            role: Role::Assistant,
            content: response.content.clone(),
            tool_calls: (!response.tool_calls.is_empty()).then(|| response.tool_calls.clone()),
            tool_call_id: None,
            name: None,
        }
    }

    pub fn tool_result(call: &ToolCall, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(call.id.clone()),
            name: Some(call.function.name.clone()),
        }
    }

    pub fn text(&self) -> Option<&str> {
        self.content.as_deref()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default = "function_type")]
    pub call_type: String,
    pub function: FunctionCall,
}

fn function_type() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded arguments; may be empty for no-argument functions.
    #[serde(default)]
    pub arguments: String,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: &Value) -> Self {
        Self {
            id: id.into(),
            call_type: function_type(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.to_string(),
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.function.name
    }

    /// Decode the arguments; an empty string means no arguments.
    pub fn parsed_arguments(&self) -> Result<Value, String> {
        let raw = self.function.arguments.trim();
        if raw.is_empty() {
            return Ok(Value::Object(Map::new()));
        }
        serde_json::from_str(raw).map_err(|err| format!("arguments are not valid JSON: {err}"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionDefinition,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl From<&ToolSpec> for ToolDefinition {
    fn from(spec: &ToolSpec) -> Self {
        Self {
            tool_type: function_type(),
            function: FunctionDefinition {
                name: spec.name.clone(),
                description: spec.description.clone(),
                parameters: spec.input_schema.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatResponse {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: Option<String>,
}

impl ChatResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            tool_calls: Vec::new(),
            finish_reason: Some("stop".into()),
        }
    }

    pub fn tool_calls(calls: Vec<ToolCall>) -> Self {
        Self {
            content: None,
            tool_calls: calls,
            finish_reason: Some("tool_calls".into()),
        }
    }

    pub fn tool_call(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self::tool_calls(vec![ToolCall::new(id, name, &arguments)])
    }

    pub fn wants_tools(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// A model bound to one id and temperature.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn model_id(&self) -> &str;

    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<ChatResponse, OmaError>;
}

/// Factory for [`LanguageModel`] handles.
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;

    fn language_model(
        &self,
        model: &str,
        temperature: f32,
    ) -> Result<Arc<dyn LanguageModel>, OmaError>;
}

pub fn validate_model_params(model: &str, temperature: f32) -> Result<(), OmaError> {
    if model.trim().is_empty() {
        return Err(OmaError::InvalidConfiguration(
            "model id must not be empty".into(),
        ));
    }
    if !(0.0..=1.0).contains(&temperature) {
        return Err(OmaError::InvalidConfiguration(format!(
            "temperature {temperature} is outside [0, 1]"
        )));
    }
    Ok(())
}

/// `openrouter/openai/gpt-4o-mini` → `openai/gpt-4o-mini`.
pub fn strip_router_prefix(model: &str) -> &str {
    model.strip_prefix("openrouter/").unwrap_or(model)
}

/// Last path segment of a model id: `anthropic/claude-sonnet-4` → `claude-sonnet-4`.
pub fn bare_model_id(model: &str) -> &str {
    model.rsplit('/').next().unwrap_or(model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn model_params_are_checked() {
        assert!(validate_model_params("openai/gpt-4o-mini", 0.0).is_ok());
        assert!(validate_model_params("openai/gpt-4o-mini", 1.0).is_ok());
        assert!(validate_model_params("openai/gpt-4o-mini", 1.5).is_err());
        assert!(validate_model_params("openai/gpt-4o-mini", -0.1).is_err());
        assert!(validate_model_params("  ", 0.2).is_err());
    }

    #[test]
    fn model_ids_are_normalised() {
        assert_eq!(
            strip_router_prefix("openrouter/openai/gpt-4o-mini"),
            "openai/gpt-4o-mini"
        );
        assert_eq!(strip_router_prefix("openai/gpt-4o"), "openai/gpt-4o");
        assert_eq!(bare_model_id("anthropic/claude-sonnet-4"), "claude-sonnet-4");
        assert_eq!(bare_model_id("sonnet"), "sonnet");
    }

    #[test]
    fn empty_arguments_decode_to_object() {
        let call = ToolCall {
            id: "c1".into(),
            call_type: "function".into(),
            function: FunctionCall {
                name: "get_pdf_pages".into(),
                arguments: String::new(),
            },
        };
        assert_eq!(call.parsed_arguments().unwrap(), json!({}));
    }

    #[test]
    fn tool_result_message_wire_shape() {
        let call = ToolCall::new("call_1", "get_article", &json!({"doi": "10.1/x"}));
        let message = ChatMessage::tool_result(&call, "article text");
        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({
                "role": "tool",
                "content": "article text",
                "tool_call_id": "call_1",
                "name": "get_article"
            })
        );
    }
}
