use std::sync::Arc;

use super::{ToolAdapter, call_for_model};
use crate::context::OmaContext;
use crate::error::OmaError;
use crate::llm::{
    ChatMessage, ChatResponse, LanguageModel, LlmProvider, ToolCall, ToolDefinition,
};
use crate::tools::{RemoteTool, ToolRegistry, resolve_all};

/// Function-calling tool for a reactive agent.
#[derive(Clone)]
pub struct GraphTool {
    definition: ToolDefinition,
    remote: Arc<dyn RemoteTool>,
}

impl GraphTool {
    pub fn name(&self) -> &str {
        &self.definition.function.name
    }

    pub fn definition(&self) -> &ToolDefinition {
        &self.definition
    }

    /// Execute one model-issued call and wrap the outcome as a tool message.
    pub async fn invoke(&self, call: &ToolCall, context: &OmaContext) -> ChatMessage {
        let content = match call.parsed_arguments() {
            Ok(arguments) => call_for_model(self.remote.as_ref(), arguments, context).await,
            Err(reason) => format!("Error: {reason}"),
        };
        ChatMessage::tool_result(call, content)
    }
}

impl std::fmt::Debug for GraphTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("GraphTool").field(&self.name()).finish()
    }
}

#[derive(Clone)]
pub struct GraphLlm {
    model: Arc<dyn LanguageModel>,
}

impl GraphLlm {
    pub fn model_id(&self) -> &str {
        self.model.model_id()
    }

    pub async fn invoke(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<ChatResponse, OmaError> {
        self.model.chat(messages, tools).await
    }
}

pub struct GraphToolAdapter {
    registry: Arc<dyn ToolRegistry>,
    provider: Arc<dyn LlmProvider>,
}

impl GraphToolAdapter {
    pub fn new(registry: Arc<dyn ToolRegistry>, provider: Arc<dyn LlmProvider>) -> Self {
        Self { registry, provider }
    }
}

impl ToolAdapter for GraphToolAdapter {
    type Tool = GraphTool;
    type Llm = GraphLlm;

    fn get_tools(&self, names: &[String]) -> Result<Vec<GraphTool>, OmaError> {
        Ok(resolve_all(self.registry.as_ref(), names)?
            .into_iter()
            .map(|remote| GraphTool {
                definition: ToolDefinition::from(remote.spec()),
                remote,
            })
            .collect())
    }

    fn create_llm(&self, model: &str, temperature: f32) -> Result<GraphLlm, OmaError> {
        Ok(GraphLlm {
            model: self.provider.language_model(model, temperature)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{Role, ScriptedProvider};
    use crate::tools::{FnTool, InMemoryToolRegistry, ToolSpec};
    use serde_json::json;

    fn adapter() -> GraphToolAdapter {
        let registry = InMemoryToolRegistry::new().with_tool(Arc::new(FnTool::new(
            ToolSpec::new("search_articles", "Search"),
            |args, _| {
                if args["query"].is_null() {
                    Err(OmaError::backend("query is required"))
                } else {
                    Ok("3 articles".into())
                }
            },
        )));
        GraphToolAdapter::new(Arc::new(registry), Arc::new(ScriptedProvider::default()))
    }

    #[tokio::test]
    async fn invoke_wraps_result_as_tool_message() {
        let tool = adapter().get_tools(&["search_articles".into()]).unwrap().remove(0);
        assert_eq!(tool.definition().function.name, "search_articles");

        let call = ToolCall::new("call_7", "search_articles", &json!({"query": "rust"}));
        let message = tool.invoke(&call, &OmaContext::new()).await;
        assert_eq!(message.role, Role::Tool);
        assert_eq!(message.tool_call_id.as_deref(), Some("call_7"));
        assert_eq!(message.text(), Some("3 articles"));
    }

    #[tokio::test]
    async fn tool_errors_become_messages() {
        let tool = adapter().get_tools(&["search_articles".into()]).unwrap().remove(0);
        let call = ToolCall::new("call_8", "search_articles", &json!({}));
        let message = tool.invoke(&call, &OmaContext::new()).await;
        assert!(message.text().unwrap().starts_with("Error:"));
    }
}
