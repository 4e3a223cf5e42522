use std::sync::Arc;

use super::ToolAdapter;
use crate::error::OmaError;
use crate::llm::{bare_model_id, validate_model_params};
use crate::tools::{ToolRegistry, resolve_all};

pub const DEFAULT_SERVER_NAME: &str = "oma";

/// Allow-list entry for a coding agent, e.g. `mcp__oma__get_pdf_pages`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodingAgentTool {
    pub qualified_name: String,
    pub tool_name: String,
    pub description: String,
}

/// Model id as the coding-agent CLI expects it, without provider prefixes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodingAgentModel {
    pub id: String,
}

pub struct CodingAgentToolAdapter {
    registry: Arc<dyn ToolRegistry>,
    server_name: String,
}

impl CodingAgentToolAdapter {
    pub fn new(registry: Arc<dyn ToolRegistry>, server_name: impl Into<String>) -> Self {
        Self {
            registry,
            server_name: server_name.into(),
        }
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Prefix shared by every tool this adapter hands out.
    pub fn namespace_prefix(&self) -> String {
        namespace_prefix(&self.server_name)
    }

    pub fn qualify(&self, tool_name: &str) -> String {
        format!("{}{tool_name}", self.namespace_prefix())
    }
}

pub fn namespace_prefix(server_name: &str) -> String {
    format!("mcp__{server_name}__")
}

impl ToolAdapter for CodingAgentToolAdapter {
    type Tool = CodingAgentTool;
    type Llm = CodingAgentModel;

    fn get_tools(&self, names: &[String]) -> Result<Vec<CodingAgentTool>, OmaError> {
        Ok(resolve_all(self.registry.as_ref(), names)?
            .into_iter()
            .map(|remote| CodingAgentTool {
                qualified_name: self.qualify(remote.name()),
                tool_name: remote.name().to_string(),
                description: remote.spec().description.clone(),
            })
            .collect())
    }

    fn create_llm(&self, model: &str, temperature: f32) -> Result<CodingAgentModel, OmaError> {
        validate_model_params(model, temperature)?;
        Ok(CodingAgentModel {
            id: bare_model_id(model).to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{FnTool, InMemoryToolRegistry, ToolSpec};

    fn adapter() -> CodingAgentToolAdapter {
        let registry = InMemoryToolRegistry::new()
            .with_tool(Arc::new(FnTool::new(ToolSpec::new("get_article", "Fetch"), |_, _| {
                Ok(String::new())
            })));
        CodingAgentToolAdapter::new(Arc::new(registry), DEFAULT_SERVER_NAME)
    }

    #[test]
    fn tools_are_namespaced() {
        let tools = adapter().get_tools(&["get_article".into()]).unwrap();
        assert_eq!(tools[0].qualified_name, "mcp__oma__get_article");
        assert_eq!(tools[0].tool_name, "get_article");
    }

    #[test]
    fn model_loses_provider_prefix() {
        let model = adapter()
            .create_llm("openrouter/anthropic/claude-sonnet-4", 0.0)
            .unwrap();
        assert_eq!(model.id, "claude-sonnet-4");
        assert!(adapter().create_llm("", 0.0).is_err());
    }
}
