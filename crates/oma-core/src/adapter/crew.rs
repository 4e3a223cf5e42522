use std::sync::Arc;

use serde_json::Value;

use super::{ToolAdapter, call_for_model};
use crate::context::OmaContext;
use crate::error::OmaError;
use crate::llm::{ChatMessage, ChatResponse, LanguageModel, LlmProvider, ToolDefinition};
use crate::tools::{RemoteTool, ToolRegistry, resolve_all};

/// Tool handle in the shape a declarative crew agent consumes.
#[derive(Clone)]
pub struct CrewTool {
    pub name: String,
    pub description: String,
    pub args_schema: Value,
    remote: Arc<dyn RemoteTool>,
}

impl CrewTool {
    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition::from(self.remote.spec())
    }

    pub async fn run(&self, arguments: Value, context: &OmaContext) -> String {
        call_for_model(self.remote.as_ref(), arguments, context).await
    }
}

impl std::fmt::Debug for CrewTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrewTool").field("name", &self.name).finish()
    }
}

#[derive(Clone)]
pub struct CrewLlm {
    model: Arc<dyn LanguageModel>,
}

impl CrewLlm {
    pub fn model_id(&self) -> &str {
        self.model.model_id()
    }

    pub async fn call(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<ChatResponse, OmaError> {
        self.model.chat(messages, tools).await
    }
}

pub struct CrewToolAdapter {
    registry: Arc<dyn ToolRegistry>,
    provider: Arc<dyn LlmProvider>,
}

impl CrewToolAdapter {
    pub fn new(registry: Arc<dyn ToolRegistry>, provider: Arc<dyn LlmProvider>) -> Self {
        Self { registry, provider }
    }
}

impl ToolAdapter for CrewToolAdapter {
    type Tool = CrewTool;
    type Llm = CrewLlm;

    fn get_tools(&self, names: &[String]) -> Result<Vec<CrewTool>, OmaError> {
        Ok(resolve_all(self.registry.as_ref(), names)?
            .into_iter()
            .map(|remote| {
                let spec = remote.spec();
                CrewTool {
                    name: spec.name.clone(),
                    description: spec.description.clone(),
                    args_schema: spec.input_schema.clone(),
                    remote: Arc::clone(&remote),
                }
            })
            .collect())
    }

    fn create_llm(&self, model: &str, temperature: f32) -> Result<CrewLlm, OmaError> {
        Ok(CrewLlm {
            model: self.provider.language_model(model, temperature)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedProvider;
    use crate::tools::{FnTool, InMemoryToolRegistry, ToolSpec};
    use serde_json::json;

    fn adapter() -> CrewToolAdapter {
        let registry = InMemoryToolRegistry::new().with_tool(Arc::new(FnTool::new(
            ToolSpec::new("get_pdf_pages", "Read pages").with_schema(json!({
                "type": "object",
                "properties": { "file_id": { "type": "string" } }
            })),
            |args, _| Ok(format!("pages of {}", args["file_id"])),
        )));
        CrewToolAdapter::new(Arc::new(registry), Arc::new(ScriptedProvider::default()))
    }

    #[tokio::test]
    async fn resolved_tool_carries_schema_and_runs() {
        let tools = adapter().get_tools(&["get_pdf_pages".into()]).unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].args_schema["properties"]["file_id"]["type"], json!("string"));

        let out = tools[0].run(json!({"file_id": "F1"}), &OmaContext::new()).await;
        assert_eq!(out, "pages of \"F1\"");
    }

    #[test]
    fn unknown_tool_fails_whole_request() {
        let err = adapter()
            .get_tools(&["get_pdf_pages".into(), "nonexistent_tool".into()])
            .unwrap_err();
        assert!(err.to_string().contains("nonexistent_tool"));
    }

    #[test]
    fn llm_temperature_is_bounded() {
        assert!(adapter().create_llm("openai/gpt-4o-mini", 0.7).is_ok());
        assert!(adapter().create_llm("openai/gpt-4o-mini", 1.2).is_err());
    }
}
