//! Reactive single-agent backend on top of `graph_flow`.
//!
//! The agent is a two-node graph: `agent` asks the model for the next move,
//! `tools` executes the calls it requested and hands control back. The loop
//! ends when the model answers without tool calls or the step bound is hit.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use graph_flow::{
    Context, ExecutionStatus, FlowRunner, GraphBuilder, InMemorySessionStorage, NextAction,
    Session, SessionStorage, Task, TaskResult,
};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::{BackendKind, BackendRunner};
use crate::adapter::{GraphLlm, GraphTool, GraphToolAdapter, ToolAdapter, unlisted_tool_reply};
use crate::context::OmaContext;
use crate::error::OmaError;
use crate::llm::{ChatMessage, ChatResponse, ToolCall, ToolDefinition};
use crate::workflow::WorkflowSpec;

const MESSAGES_KEY: &str = "react.messages";
const STEPS_KEY: &str = "react.steps";
const OUTPUT_KEY: &str = "react.output";
const ERROR_KEY: &str = "react.error";

/// Reactive agent ready to run.
pub struct ReactAgent {
    pub name: String,
    pub llm: GraphLlm,
    pub tools: Vec<GraphTool>,
    pub system_prompt: String,
    pub instruction: String,
    pub max_steps: usize,
}

pub struct GraphRunner {
    adapter: GraphToolAdapter,
}

impl GraphRunner {
    pub fn new(adapter: GraphToolAdapter) -> Self {
        Self { adapter }
    }
}

#[async_trait]
impl BackendRunner for GraphRunner {
    type Runnable = ReactAgent;

    fn kind(&self) -> BackendKind {
        BackendKind::Graph
    }

    fn assemble(&self, workflow: &WorkflowSpec) -> Result<ReactAgent, OmaError> {
        workflow.validate()?;
        let tools = self.adapter.get_tools(&workflow.tool_names())?;
        let llm = self
            .adapter
            .create_llm(&workflow.model, workflow.temperature)?;

        let system_prompt = workflow
            .agents
            .iter()
            .map(|agent| agent.system_prompt())
            .collect::<Vec<_>>()
            .join("\n\n");
        let instruction = workflow
            .tasks
            .iter()
            .enumerate()
            .map(|(idx, task)| format!("Step {}: {}", idx + 1, task.prompt(&[])))
            .collect::<Vec<_>>()
            .join("\n\n");

        Ok(ReactAgent {
            name: workflow.name.clone(),
            llm,
            tools,
            system_prompt,
            instruction,
            max_steps: workflow.max_steps,
        })
    }

    #[instrument(name = "runner.graph", skip_all, fields(agent = %agent.name, run_id = %context.run_id()))]
    async fn run(
        &self,
        agent: ReactAgent,
        context: &OmaContext,
        _timeout: Duration,
    ) -> Result<String, OmaError> {
        let definitions: Vec<ToolDefinition> =
            agent.tools.iter().map(|tool| tool.definition().clone()).collect();
        let model_task = Arc::new(AgentTask {
            llm: agent.llm,
            definitions,
            max_steps: agent.max_steps,
        });
        let tools_task = Arc::new(ToolsTask {
            tools: agent
                .tools
                .into_iter()
                .map(|tool| (tool.name().to_string(), tool))
                .collect(),
            context: context.clone(),
        });

        let graph = Arc::new(
            GraphBuilder::new(&agent.name)
                .add_task(model_task.clone())
                .add_task(tools_task.clone())
                .add_edge(model_task.id(), tools_task.id())
                .add_edge(tools_task.id(), model_task.id())
                .set_start_task(model_task.id())
                .build(),
        );

        let storage = Arc::new(InMemorySessionStorage::new());
        let flow = FlowRunner::new(graph, storage.clone());
        let session_id = format!("{}-{}", context.run_id(), Uuid::new_v4());
        let session = Session::new_from_task(session_id.clone(), model_task.id());
        let seed = vec![
            ChatMessage::system(agent.system_prompt),
            ChatMessage::user(agent.instruction),
        ];
        session.context.set(MESSAGES_KEY, seed).await;
        session.context.set(STEPS_KEY, 0_usize).await;

        storage
            .save(session)
            .await
            .map_err(|err| OmaError::backend(format!("failed to persist agent session: {err}")))?;

        loop {
            let result = flow
                .run(&session_id)
                .await
                .map_err(|err| OmaError::backend(format!("agent graph failed: {err}")))?;
            match result.status {
                ExecutionStatus::Completed => break,
                ExecutionStatus::WaitingForInput => continue,
                ExecutionStatus::Error(message) => return Err(OmaError::backend(message)),
            }
        }

        let session = storage
            .get(&session_id)
            .await
            .map_err(|err| OmaError::backend(format!("failed to reload agent session: {err}")))?
            .ok_or_else(|| OmaError::backend("agent session missing after execution"))?;

        if let Some(error) = session.context.get::<String>(ERROR_KEY).await {
            return Err(OmaError::backend(error));
        }
        let steps: usize = session.context.get(STEPS_KEY).await.unwrap_or_default();
        info!(steps, "reactive agent finished");
        Ok(session
            .context
            .get::<String>(OUTPUT_KEY)
            .await
            .unwrap_or_default())
    }
}

struct AgentTask {
    llm: GraphLlm,
    definitions: Vec<ToolDefinition>,
    max_steps: usize,
}

#[async_trait]
impl Task for AgentTask {
    fn id(&self) -> &str {
        "agent"
    }

    async fn run(&self, context: Context) -> graph_flow::Result<TaskResult> {
        let steps: usize = context.get(STEPS_KEY).await.unwrap_or_default();
        if steps >= self.max_steps {
            warn!(max_steps = self.max_steps, "reactive agent hit its step limit");
            context
                .set(
                    ERROR_KEY,
                    format!("agent stopped after {} steps without a final answer", self.max_steps),
                )
                .await;
            return Ok(TaskResult::new(None, NextAction::End));
        }

        let mut messages: Vec<ChatMessage> = context.get(MESSAGES_KEY).await.unwrap_or_default();
        let response: ChatResponse = match self.llm.invoke(&messages, &self.definitions).await {
            Ok(response) => response,
            Err(err) => {
                context.set(ERROR_KEY, err.to_string()).await;
                return Ok(TaskResult::new(None, NextAction::End));
            }
        };
        context.set(STEPS_KEY, steps + 1).await;

        messages.push(ChatMessage::assistant(&response));
        context.set(MESSAGES_KEY, &messages).await;

        if response.wants_tools() {
            debug!(step = steps + 1, calls = response.tool_calls.len(), "agent requested tools");
            Ok(TaskResult::new(None, NextAction::ContinueAndExecute))
        } else {
            let output = response.content.unwrap_or_default();
            context.set(OUTPUT_KEY, &output).await;
            Ok(TaskResult::new(Some(output), NextAction::End))
        }
    }
}

struct ToolsTask {
    tools: HashMap<String, GraphTool>,
    context: OmaContext,
}

#[async_trait]
impl Task for ToolsTask {
    fn id(&self) -> &str {
        "tools"
    }

    async fn run(&self, context: Context) -> graph_flow::Result<TaskResult> {
        let mut messages: Vec<ChatMessage> = context.get(MESSAGES_KEY).await.unwrap_or_default();
        let calls: Vec<ToolCall> = messages
            .last()
            .and_then(|message| message.tool_calls.clone())
            .unwrap_or_default();

        for call in &calls {
            let reply = match self.tools.get(call.name()) {
                Some(tool) => tool.invoke(call, &self.context).await,
                None => ChatMessage::tool_result(call, unlisted_tool_reply(call.name())),
            };
            messages.push(reply);
        }
        context.set(MESSAGES_KEY, &messages).await;

        Ok(TaskResult::new(None, NextAction::ContinueAndExecute))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{Role, ScriptedProvider};
    use crate::tools::{FnTool, InMemoryToolRegistry, ToolSpec};
    use crate::workflow::{AgentSpec, TaskSpec};
    use serde_json::json;

    fn runner(provider: &ScriptedProvider) -> GraphRunner {
        let registry = InMemoryToolRegistry::new()
            .with_tool(Arc::new(FnTool::new(
                ToolSpec::new("create_content_overview", "Create overview"),
                |_, ctx| {
                    ctx.set_shared_data("structured_content_overview_id", "SCO-42");
                    Ok("created SCO-42".into())
                },
            )))
            .with_tool(Arc::new(FnTool::new(ToolSpec::new("hidden", ""), |_, _| {
                Ok("should not run".into())
            })));
        GraphRunner::new(GraphToolAdapter::new(
            Arc::new(registry),
            Arc::new(provider.clone()),
        ))
    }

    fn workflow(max_steps: usize) -> WorkflowSpec {
        WorkflowSpec::new("parse", "openai/gpt-4o-mini")
            .with_max_steps(max_steps)
            .agent(
                AgentSpec::new("parser", "Parse", "Parser")
                    .with_tools(["create_content_overview"]),
            )
            .task(TaskSpec::new("parser", "Build the overview", "Overview id"))
    }

    #[tokio::test]
    async fn agent_alternates_with_tools_until_answer() {
        let provider = ScriptedProvider::new([
            ChatResponse::tool_call("c1", "create_content_overview", json!({})),
            ChatResponse::tool_call("c2", "hidden", json!({})),
            ChatResponse::text("overview SCO-42 ready"),
        ]);
        let runner = runner(&provider);
        let ctx = OmaContext::new();

        let agent = runner.assemble(&workflow(10)).unwrap();
        let output = runner.run(agent, &ctx, Duration::from_secs(5)).await.unwrap();

        assert_eq!(output, "overview SCO-42 ready");
        assert_eq!(
            ctx.get_shared_data::<String>("structured_content_overview_id").as_deref(),
            Some("SCO-42")
        );
        let requests = provider.requests().await;
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[0].tool_names, vec!["create_content_overview"]);
        let last_tool = requests[2]
            .messages
            .iter()
            .rev()
            .find(|message| message.role == Role::Tool)
            .unwrap();
        assert!(last_tool.text().unwrap().contains("not available"));
    }

    #[tokio::test]
    async fn step_bound_stops_the_loop() {
        let provider = ScriptedProvider::new(
            (0..10).map(|i| ChatResponse::tool_call(format!("c{i}"), "create_content_overview", json!({}))),
        );
        let runner = runner(&provider);
        let agent = runner.assemble(&workflow(2)).unwrap();
        let err = runner
            .run(agent, &OmaContext::new(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("2 steps"));
        assert_eq!(provider.remaining().await, 8);
    }
}
