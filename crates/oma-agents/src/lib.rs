//! Sample document-analysis agents and the glue that binds them to a backend.
//!
//! `pdf_parser` turns an uploaded file into a structured content overview;
//! `comparative_analysis` reads that overview and compares the paper with
//! related literature. Chained, they form the reference pipeline.

pub mod comparative_analysis;
pub mod pdf_parser;

use std::sync::Arc;

use oma_core::adapter::{CodingAgentToolAdapter, CrewToolAdapter, GraphToolAdapter};
use oma_core::llm::LlmProvider;
use oma_core::runner::{CodingAgentClient, CodingAgentRunner, CrewRunner, GraphRunner};
use oma_core::tools::ToolRegistry;
use oma_core::{
    AgentConfig, AgentDefinition, BackendKind, OmaContext, OmaError, StepExecutor, StepInputs,
    TaskExecutor, WorkflowSpec,
};
use serde_json::Value;
use tracing::debug;

pub use comparative_analysis::ComparativeAnalysis;
pub use pdf_parser::PdfParser;

pub const DEFAULT_MODEL: &str = "openrouter/openai/gpt-4o-mini";
pub const DEFAULT_TEMPERATURE: f32 = 0.1;

/// Every shipped agent, in pipeline order.
pub fn catalog() -> Vec<Arc<dyn AgentDefinition>> {
    vec![Arc::new(PdfParser), Arc::new(ComparativeAnalysis)]
}

pub fn find(agent_id: &str) -> Option<Arc<dyn AgentDefinition>> {
    catalog()
        .into_iter()
        .find(|agent| agent.config().agent_id == agent_id)
}

/// Shared dependencies for building executors on any backend.
#[derive(Clone)]
pub struct Backends {
    pub registry: Arc<dyn ToolRegistry>,
    pub provider: Option<Arc<dyn LlmProvider>>,
    pub coding_client: Option<Arc<dyn CodingAgentClient>>,
    pub server_name: String,
    pub allow_web_search: bool,
    /// Replaces the default of every agent's optional `model` input.
    pub default_model: Option<String>,
}

impl Backends {
    pub fn new(registry: Arc<dyn ToolRegistry>) -> Self {
        Self {
            registry,
            provider: None,
            coding_client: None,
            server_name: oma_core::adapter::DEFAULT_SERVER_NAME.to_string(),
            allow_web_search: false,
            default_model: None,
        }
    }

    /// Model provider for the crew and graph backends.
    pub fn with_provider(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_coding_client(
        mut self,
        client: Arc<dyn CodingAgentClient>,
        server_name: impl Into<String>,
    ) -> Self {
        self.coding_client = Some(client);
        self.server_name = server_name.into();
        self
    }

    pub fn with_web_search(mut self, allow: bool) -> Self {
        self.allow_web_search = allow;
        self
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }

    /// Bind `definition` to `context` on the requested backend.
    pub fn executor(
        &self,
        kind: BackendKind,
        definition: Arc<dyn AgentDefinition>,
        context: OmaContext,
    ) -> Result<Box<dyn TaskExecutor>, OmaError> {
        debug!(agent_id = %definition.config().agent_id, backend = %kind, "building executor");
        let definition = self.apply_default_model(definition);
        let executor: Box<dyn TaskExecutor> = match kind {
            BackendKind::Crew => {
                let adapter = CrewToolAdapter::new(Arc::clone(&self.registry), self.provider(kind)?);
                Box::new(StepExecutor::new(definition, context, CrewRunner::new(adapter)))
            }
            BackendKind::Graph => {
                let adapter = GraphToolAdapter::new(Arc::clone(&self.registry), self.provider(kind)?);
                Box::new(StepExecutor::new(definition, context, GraphRunner::new(adapter)))
            }
            BackendKind::CodingAgent => {
                let client = self.coding_client.clone().ok_or_else(|| {
                    OmaError::InvalidConfiguration(
                        "coding_agent backend requires a coding agent client".into(),
                    )
                })?;
                let adapter = CodingAgentToolAdapter::new(
                    Arc::clone(&self.registry),
                    self.server_name.clone(),
                );
                let runner =
                    CodingAgentRunner::new(adapter, client).allow_web_search(self.allow_web_search);
                Box::new(StepExecutor::new(definition, context, runner))
            }
        };
        Ok(executor)
    }

    fn apply_default_model(
        &self,
        definition: Arc<dyn AgentDefinition>,
    ) -> Arc<dyn AgentDefinition> {
        let Some(model) = &self.default_model else {
            return definition;
        };
        let mut config = definition.config().clone();
        match config.input.get_mut("model") {
            Some(field) if !field.required => {
                field.default = Some(Value::String(model.clone()));
            }
            _ => return definition,
        }
        Arc::new(ModelDefault {
            inner: definition,
            config,
        })
    }

    fn provider(&self, kind: BackendKind) -> Result<Arc<dyn LlmProvider>, OmaError> {
        self.provider.clone().ok_or_else(|| {
            OmaError::InvalidConfiguration(format!("{kind} backend requires a model provider"))
        })
    }
}

/// An agent whose `model` input falls back to a configured model id.
struct ModelDefault {
    inner: Arc<dyn AgentDefinition>,
    config: AgentConfig,
}

impl AgentDefinition for ModelDefault {
    fn config(&self) -> &AgentConfig {
        &self.config
    }

    fn workflow(&self, inputs: &StepInputs) -> Result<WorkflowSpec, OmaError> {
        self.inner.workflow(inputs)
    }
}
