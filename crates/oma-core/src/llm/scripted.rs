//! Deterministic replay provider.
//!
//! Hands out pre-recorded responses in order, whatever model is asked for,
//! and records every request it saw.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{
    ChatMessage, ChatResponse, LanguageModel, LlmProvider, ToolDefinition, validate_model_params,
};
use crate::error::OmaError;

/// One request as seen by a scripted model.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub tool_names: Vec<String>,
}

#[derive(Default)]
struct Script {
    responses: VecDeque<ChatResponse>,
    requests: Vec<RecordedRequest>,
}

#[derive(Clone, Default)]
pub struct ScriptedProvider {
    script: Arc<Mutex<Script>>,
    delay: Option<Duration>,
}

impl ScriptedProvider {
    pub fn new<I>(responses: I) -> Self
    where
        I: IntoIterator<Item = ChatResponse>,
    {
        Self {
            script: Arc::new(Mutex::new(Script {
                responses: responses.into_iter().collect(),
                requests: Vec::new(),
            })),
            delay: None,
        }
    }

    /// Wait this long before answering each request.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub async fn push(&self, response: ChatResponse) {
        self.script.lock().await.responses.push_back(response);
    }

    pub async fn requests(&self) -> Vec<RecordedRequest> {
        self.script.lock().await.requests.clone()
    }

    pub async fn remaining(&self) -> usize {
        self.script.lock().await.responses.len()
    }
}

impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn language_model(
        &self,
        model: &str,
        temperature: f32,
    ) -> Result<Arc<dyn LanguageModel>, OmaError> {
        validate_model_params(model, temperature)?;
        Ok(Arc::new(ScriptedModel {
            model: model.to_string(),
            script: Arc::clone(&self.script),
            delay: self.delay,
        }))
    }
}

struct ScriptedModel {
    model: String,
    script: Arc<Mutex<Script>>,
    delay: Option<Duration>,
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<ChatResponse, OmaError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let mut script = self.script.lock().await;
        script.requests.push(RecordedRequest {
            model: self.model.clone(),
            messages: messages.to_vec(),
            tool_names: tools.iter().map(|tool| tool.function.name.clone()).collect(),
        });
        script
            .responses
            .pop_front()
            .ok_or_else(|| OmaError::backend("scripted model has no responses left"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replays_in_order_then_fails() {
        let provider = ScriptedProvider::new([ChatResponse::text("one"), ChatResponse::text("two")]);
        let model = provider.language_model("any/model", 0.0).unwrap();

        let first = model.chat(&[ChatMessage::user("a")], &[]).await.unwrap();
        let second = model.chat(&[ChatMessage::user("b")], &[]).await.unwrap();
        assert_eq!(first.content.as_deref(), Some("one"));
        assert_eq!(second.content.as_deref(), Some("two"));
        assert!(model.chat(&[], &[]).await.is_err());

        let requests = provider.requests().await;
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[1].messages[0].text(), Some("b"));
    }
}
