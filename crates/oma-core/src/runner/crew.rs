use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, instrument};

use super::{BackendKind, BackendRunner};
use crate::adapter::{CrewLlm, CrewTool, CrewToolAdapter, ToolAdapter, unlisted_tool_reply};
use crate::context::OmaContext;
use crate::error::OmaError;
use crate::llm::{ChatMessage, ToolDefinition};
use crate::workflow::{AgentSpec, TaskSpec, WorkflowSpec};

/// One task bound to the agent that performs it and the tools it may use.
pub struct CrewStep {
    pub task: TaskSpec,
    pub agent: AgentSpec,
    pub tools: Vec<CrewTool>,
}

/// Sequential crew ready to kick off.
pub struct Crew {
    pub name: String,
    pub llm: CrewLlm,
    pub steps: Vec<CrewStep>,
}

pub struct CrewRunner {
    adapter: CrewToolAdapter,
}

impl CrewRunner {
    pub fn new(adapter: CrewToolAdapter) -> Self {
        Self { adapter }
    }
}

#[async_trait]
impl BackendRunner for CrewRunner {
    type Runnable = Crew;

    fn kind(&self) -> BackendKind {
        BackendKind::Crew
    }

    fn assemble(&self, workflow: &WorkflowSpec) -> Result<Crew, OmaError> {
        workflow.validate()?;
        let resolved: HashMap<String, CrewTool> = self
            .adapter
            .get_tools(&workflow.tool_names())?
            .into_iter()
            .map(|tool| (tool.name.clone(), tool))
            .collect();
        let llm = self
            .adapter
            .create_llm(&workflow.model, workflow.temperature)?;

        let mut steps = Vec::with_capacity(workflow.tasks.len());
        for task in &workflow.tasks {
            let agent = workflow.agent_for(task).cloned().ok_or_else(|| {
                OmaError::InvalidConfiguration(format!("unknown agent `{}`", task.agent))
            })?;
            let tools = workflow
                .tools_for_task(task)
                .iter()
                .filter_map(|name| resolved.get(name).cloned())
                .collect();
            steps.push(CrewStep {
                task: task.clone(),
                agent,
                tools,
            });
        }

        Ok(Crew {
            name: workflow.name.clone(),
            llm,
            steps,
        })
    }

    #[instrument(name = "runner.crew", skip_all, fields(crew = %crew.name, run_id = %context.run_id()))]
    async fn run(
        &self,
        crew: Crew,
        context: &OmaContext,
        _timeout: Duration,
    ) -> Result<String, OmaError> {
        let mut outputs: Vec<String> = Vec::with_capacity(crew.steps.len());
        for (idx, step) in crew.steps.iter().enumerate() {
            info!(task = idx + 1, agent = %step.agent.role, "crew task started");
            let output = run_step(&crew.llm, step, &outputs, context).await?;
            outputs.push(output);
        }
        outputs
            .pop()
            .ok_or_else(|| OmaError::backend(format!("crew `{}` has no tasks", crew.name)))
    }
}

/// Agent loop for one task, bounded by the agent's `max_iter`.
async fn run_step(
    llm: &CrewLlm,
    step: &CrewStep,
    prior_outputs: &[String],
    context: &OmaContext,
) -> Result<String, OmaError> {
    let definitions: Vec<ToolDefinition> = step.tools.iter().map(CrewTool::definition).collect();
    let mut messages = vec![
        ChatMessage::system(step.agent.system_prompt()),
        ChatMessage::user(step.task.prompt(prior_outputs)),
    ];

    for iteration in 1..=step.agent.max_iter {
        let response = llm.call(&messages, &definitions).await?;
        if !response.wants_tools() {
            return Ok(response.content.unwrap_or_default());
        }

        messages.push(ChatMessage::assistant(&response));
        for call in &response.tool_calls {
            debug!(iteration, tool = call.name(), "crew agent tool call");
            let reply = match step.tools.iter().find(|tool| tool.name == call.name()) {
                Some(tool) => match call.parsed_arguments() {
                    Ok(arguments) => tool.run(arguments, context).await,
                    Err(reason) => format!("Error: {reason}"),
                },
                None => unlisted_tool_reply(call.name()),
            };
            messages.push(ChatMessage::tool_result(call, reply));
        }
    }

    Err(OmaError::backend(format!(
        "agent `{}` stopped after {} iterations without a final answer",
        step.agent.role, step.agent.max_iter
    )))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::llm::{ChatResponse, Role, ScriptedProvider};
    use crate::tools::{FnTool, InMemoryToolRegistry, ToolSpec};
    use serde_json::json;

    fn registry() -> (InMemoryToolRegistry, Arc<FnTool>) {
        let secret = Arc::new(FnTool::new(ToolSpec::new("delete_everything", ""), |_, _| {
            Ok("deleted".into())
        }));
        let registry = InMemoryToolRegistry::new()
            .with_tool(Arc::new(FnTool::new(
                ToolSpec::new("get_pdf_pages", "Read pages"),
                |_, _| Ok("page 1: intro".into()),
            )))
            .with_tool(secret.clone());
        (registry, secret)
    }

    fn workflow() -> WorkflowSpec {
        WorkflowSpec::new("parse", "openai/gpt-4o-mini")
            .agent(AgentSpec::new("reader", "Read", "Reader").with_max_iter(3))
            .task(TaskSpec::new("reader", "Read pages", "Notes").with_tools(["get_pdf_pages"]))
            .task(TaskSpec::new("reader", "Summarise", "Summary"))
    }

    #[tokio::test]
    async fn tasks_run_in_order_with_prior_outputs() {
        let (registry, secret) = registry();
        let provider = ScriptedProvider::new([
            ChatResponse::tool_call("c1", "get_pdf_pages", json!({})),
            ChatResponse::tool_call("c2", "delete_everything", json!({})),
            ChatResponse::text("notes"),
            ChatResponse::text("summary"),
        ]);
        let runner = CrewRunner::new(CrewToolAdapter::new(
            Arc::new(registry),
            Arc::new(provider.clone()),
        ));

        let crew = runner.assemble(&workflow()).unwrap();
        let output = runner
            .run(crew, &OmaContext::new(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(output, "summary");
        assert_eq!(secret.calls(), 0);

        let requests = provider.requests().await;
        let unlisted = requests[2]
            .messages
            .iter()
            .rev()
            .find(|message| message.role == Role::Tool)
            .unwrap();
        assert!(unlisted.text().unwrap().contains("not available"));
        assert!(requests[3].messages[1].text().unwrap().contains("[1] notes"));
        assert!(requests[3].tool_names.is_empty());
    }

    #[tokio::test]
    async fn agent_loop_is_bounded() {
        let (registry, _) = registry();
        let provider = ScriptedProvider::new(
            (0..5).map(|i| ChatResponse::tool_call(format!("c{i}"), "get_pdf_pages", json!({}))),
        );
        let runner = CrewRunner::new(CrewToolAdapter::new(Arc::new(registry), Arc::new(provider)));
        let crew = runner.assemble(&workflow()).unwrap();
        let err = runner
            .run(crew, &OmaContext::new(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("3 iterations"));
    }

    #[test]
    fn assemble_rejects_unknown_tools() {
        let (registry, _) = registry();
        let runner = CrewRunner::new(CrewToolAdapter::new(
            Arc::new(registry),
            Arc::new(ScriptedProvider::default()),
        ));
        let workflow = workflow().task(
            TaskSpec::new("reader", "Break", "Nothing").with_tools(["nonexistent_tool"]),
        );
        let err = runner.assemble(&workflow).err().unwrap();
        assert!(matches!(err, OmaError::ToolResolution { ref names } if names == &["nonexistent_tool"]));
    }
}
