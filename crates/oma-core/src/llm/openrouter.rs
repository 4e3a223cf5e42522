//! OpenRouter (OpenAI-compatible) chat completions.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
    ChatMessage, ChatResponse, LanguageModel, LlmProvider, ToolCall, ToolDefinition,
    strip_router_prefix, validate_model_params,
};
use crate::error::OmaError;
use crate::security::SecretValue;

pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

pub struct OpenRouterProvider {
    client: Client,
    api_key: SecretValue,
    base_url: String,
}

impl OpenRouterProvider {
    pub fn new(api_key: SecretValue) -> Result<Self, OmaError> {
        Self::with_base_url(api_key, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(api_key: SecretValue, base_url: impl Into<String>) -> Result<Self, OmaError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| OmaError::backend(format!("failed to build HTTP client: {err}")))?;
        Ok(Self {
            client,
            api_key,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

impl LlmProvider for OpenRouterProvider {
    fn name(&self) -> &str {
        "openrouter"
    }

    fn language_model(
        &self,
        model: &str,
        temperature: f32,
    ) -> Result<Arc<dyn LanguageModel>, OmaError> {
        validate_model_params(model, temperature)?;
        Ok(Arc::new(OpenRouterModel {
            client: self.client.clone(),
            api_key: self.api_key.clone(),
            endpoint: format!("{}/chat/completions", self.base_url),
            model: strip_router_prefix(model).to_string(),
            temperature,
        }))
    }
}

struct OpenRouterModel {
    client: Client,
    api_key: SecretValue,
    endpoint: String,
    model: String,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "no_tools")]
    tools: &'a [ToolDefinition],
    temperature: f32,
}

fn no_tools(tools: &&[ToolDefinition]) -> bool {
    tools.is_empty()
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCall>>,
}

#[async_trait]
impl LanguageModel for OpenRouterModel {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<ChatResponse, OmaError> {
        let request = CompletionRequest {
            model: &self.model,
            messages,
            tools,
            temperature: self.temperature,
        };
        debug!(model = %self.model, messages = messages.len(), tools = tools.len(), "sending chat completion");

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(self.api_key.expose())
            .json(&request)
            .send()
            .await
            .map_err(|err| OmaError::backend(format!("chat completion request failed: {err}")))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            let excerpt: String = self.api_key.scrub(&body).chars().take(500).collect();
            return Err(OmaError::backend(format!(
                "chat completion returned HTTP {status}: {excerpt}"
            )));
        }

        let parsed: CompletionResponse = serde_json::from_str(&body).map_err(|err| {
            OmaError::backend(format!("chat completion response is not valid JSON: {err}"))
        })?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| OmaError::backend("chat completion returned no choices"))?;

        Ok(ChatResponse {
            content: choice.message.content,
            tool_calls: choice.message.tool_calls.unwrap_or_default(),
            finish_reason: choice.finish_reason,
        })
    }
}
