//! Coding-agent backend: the whole workflow becomes one prompt handed to an
//! external agent process, together with an allow-list of namespaced tools.

use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::time;
use tracing::{debug, info, instrument, warn};

use super::{BackendKind, BackendRunner};
use crate::adapter::{CodingAgentModel, CodingAgentTool, CodingAgentToolAdapter, ToolAdapter};
use crate::context::OmaContext;
use crate::error::OmaError;
use crate::workflow::WorkflowSpec;

const WEB_TOOLS: [&str; 2] = ["WebSearch", "WebFetch"];
const RUN_ID_ENV: &str = "OMA_RUN_ID";

static CONTEXT_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)```json\s*(\{.*?\})\s*```").expect("invalid context block regex")
});

/// Everything an external coding agent needs for one run.
#[derive(Debug, Clone)]
pub struct CodingAgentRequest {
    pub prompt: String,
    pub model: String,
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
    pub timeout: Duration,
    pub run_id: String,
}

#[async_trait]
pub trait CodingAgentClient: Send + Sync {
    fn name(&self) -> &str;

    /// Run the agent to completion and return its final text.
    ///
    /// Implementations enforce `request.timeout` themselves and must not leave
    /// the agent running once it elapses.
    async fn execute(
        &self,
        request: CodingAgentRequest,
        context: &OmaContext,
    ) -> Result<String, OmaError>;
}

/// Assembled coding-agent run.
#[derive(Debug, Clone)]
pub struct CodingAgentRun {
    pub prompt: String,
    pub model: CodingAgentModel,
    pub tools: Vec<CodingAgentTool>,
}

pub struct CodingAgentRunner {
    adapter: CodingAgentToolAdapter,
    client: Arc<dyn CodingAgentClient>,
    allow_web_search: bool,
}

impl CodingAgentRunner {
    pub fn new(adapter: CodingAgentToolAdapter, client: Arc<dyn CodingAgentClient>) -> Self {
        Self {
            adapter,
            client,
            allow_web_search: false,
        }
    }

    pub fn allow_web_search(mut self, allow: bool) -> Self {
        self.allow_web_search = allow;
        self
    }
}

#[async_trait]
impl BackendRunner for CodingAgentRunner {
    type Runnable = CodingAgentRun;

    fn kind(&self) -> BackendKind {
        BackendKind::CodingAgent
    }

    fn assemble(&self, workflow: &WorkflowSpec) -> Result<CodingAgentRun, OmaError> {
        workflow.validate()?;
        let tools = self.adapter.get_tools(&workflow.tool_names())?;
        let prefix = self.adapter.namespace_prefix();
        if let Some(stray) = tools
            .iter()
            .find(|tool| !tool.qualified_name.starts_with(&prefix))
        {
            return Err(OmaError::InvalidConfiguration(format!(
                "tool `{}` is outside the `{prefix}` namespace",
                stray.qualified_name
            )));
        }
        let model = self
            .adapter
            .create_llm(&workflow.model, workflow.temperature)?;

        let mut prompt = workflow.render_prompt();
        prompt.push_str(
            "\n\nUse only the tools you have been given. When you are done, end your answer \
             with a ```json block of the form {\"context_updates\": {...}} holding any ids \
             you created.",
        );

        Ok(CodingAgentRun {
            prompt,
            model,
            tools,
        })
    }

    #[instrument(name = "runner.coding_agent", skip_all, fields(client = self.client.name(), run_id = %context.run_id()))]
    async fn run(
        &self,
        run: CodingAgentRun,
        context: &OmaContext,
        timeout: Duration,
    ) -> Result<String, OmaError> {
        let disallowed_tools = if self.allow_web_search {
            Vec::new()
        } else {
            WEB_TOOLS.iter().map(|tool| tool.to_string()).collect()
        };
        let request = CodingAgentRequest {
            prompt: run.prompt,
            model: run.model.id,
            allowed_tools: run.tools.into_iter().map(|tool| tool.qualified_name).collect(),
            disallowed_tools,
            timeout,
            run_id: context.run_id().to_string(),
        };

        let output = self.client.execute(request, context).await?;
        if let Some(updates) = extract_context_updates(&output) {
            debug!(keys = updates.len(), "applying context updates from agent output");
            for (key, value) in updates {
                context.set_shared_data(key, value);
            }
        }
        Ok(output)
    }
}

/// Last fenced JSON block carrying a `context_updates` object.
pub fn extract_context_updates(output: &str) -> Option<Map<String, Value>> {
    CONTEXT_BLOCK
        .captures_iter(output)
        .filter_map(|caps| serde_json::from_str::<Value>(&caps[1]).ok())
        .filter_map(|value| match value.get("context_updates") {
            Some(Value::Object(map)) => Some(map.clone()),
            _ => None,
        })
        .last()
}

/// Settings for the `claude` command-line agent.
#[derive(Debug, Clone)]
pub struct ClaudeCliConfig {
    pub cli_path: String,
    /// Tool server the agent should connect to; `None` relies on the CLI's own config.
    pub mcp_endpoint: Option<String>,
    pub server_name: String,
}

impl Default for ClaudeCliConfig {
    fn default() -> Self {
        Self {
            cli_path: std::env::var("CLAUDE_CLI_PATH").unwrap_or_else(|_| "claude".to_string()),
            mcp_endpoint: None,
            server_name: crate::adapter::DEFAULT_SERVER_NAME.to_string(),
        }
    }
}

/// Runs the agent as a subprocess, prompt on stdin, JSON result on stdout.
pub struct ClaudeCliClient {
    config: ClaudeCliConfig,
}

#[derive(Debug, Deserialize)]
struct CliResult {
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    is_error: bool,
}

impl ClaudeCliClient {
    pub fn new(config: ClaudeCliConfig) -> Self {
        Self { config }
    }

    fn build_args(&self, request: &CodingAgentRequest) -> Vec<String> {
        let mut args = vec![
            "--print".to_string(),
            "--output-format".to_string(),
            "json".to_string(),
            "--model".to_string(),
            request.model.clone(),
        ];
        if let Some(endpoint) = &self.config.mcp_endpoint {
            let mut servers = Map::new();
            servers.insert(
                self.config.server_name.clone(),
                json!({ "type": "http", "url": endpoint }),
            );
            let mcp_config = json!({ "mcpServers": servers });
            args.push("--mcp-config".to_string());
            args.push(mcp_config.to_string());
        }
        if !request.allowed_tools.is_empty() {
            args.push("--allowedTools".to_string());
            args.push(request.allowed_tools.join(","));
        }
        if !request.disallowed_tools.is_empty() {
            args.push("--disallowedTools".to_string());
            args.push(request.disallowed_tools.join(","));
        }
        args
    }
}

#[async_trait]
impl CodingAgentClient for ClaudeCliClient {
    fn name(&self) -> &str {
        "claude_cli"
    }

    async fn execute(
        &self,
        request: CodingAgentRequest,
        _context: &OmaContext,
    ) -> Result<String, OmaError> {
        let args = self.build_args(&request);
        debug!(cli = %self.config.cli_path, args = ?args, "prepared coding agent invocation");

        let mut cmd = Command::new(&self.config.cli_path);
        cmd.args(&args)
            .env(RUN_ID_ENV, &request.run_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let start = Instant::now();
        let mut child = cmd.spawn().map_err(|err| {
            OmaError::backend(format!("failed to spawn `{}`: {err}", self.config.cli_path))
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            let prompt = request.prompt.clone();
            tokio::spawn(async move {
                if let Err(err) = stdin.write_all(prompt.as_bytes()).await {
                    warn!(error = %err, "failed to write prompt to coding agent");
                }
            });
        }
        let stdout_task = tokio::spawn(read_pipe(child.stdout.take()));
        let stderr_task = tokio::spawn(read_pipe(child.stderr.take()));

        let status = match time::timeout(request.timeout, child.wait()).await {
            Ok(outcome) => outcome
                .map_err(|err| OmaError::backend(format!("failed to wait for coding agent: {err}")))?,
            Err(_elapsed) => {
                warn!(timeout_s = request.timeout.as_secs(), "coding agent timed out; terminating");
                if let Err(err) = child.kill().await {
                    warn!(error = %err, "failed to kill coding agent after timeout");
                }
                return Err(OmaError::BackendTimeout {
                    backend: BackendKind::CodingAgent,
                    timeout: request.timeout,
                });
            }
        };

        let stdout = join_pipe(stdout_task).await?;
        let stderr = join_pipe(stderr_task).await?;
        info!(
            exit_code = status.code(),
            duration_ms = start.elapsed().as_millis() as u64,
            "coding agent finished"
        );

        if !status.success() {
            return Err(OmaError::backend(format!(
                "coding agent exited with {:?}: {}",
                status.code(),
                tail(&stderr, 500).trim()
            )));
        }

        match serde_json::from_str::<CliResult>(stdout.trim()) {
            Ok(parsed) if parsed.is_error => Err(OmaError::backend(
                parsed.result.unwrap_or_else(|| "coding agent reported an error".into()),
            )),
            Ok(parsed) => Ok(parsed.result.unwrap_or_default()),
            Err(_) => Ok(stdout),
        }
    }
}

fn tail(text: &str, max_chars: usize) -> &str {
    let start = text
        .char_indices()
        .rev()
        .nth(max_chars.saturating_sub(1))
        .map(|(idx, _)| idx)
        .unwrap_or(0);
    &text[start..]
}

async fn read_pipe<R>(pipe: Option<R>) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut buffer = Vec::new();
    if let Some(mut reader) = pipe {
        reader.read_to_end(&mut buffer).await?;
    }
    Ok(buffer)
}

async fn join_pipe(
    task: tokio::task::JoinHandle<std::io::Result<Vec<u8>>>,
) -> Result<String, OmaError> {
    let bytes = task
        .await
        .map_err(|err| OmaError::backend(format!("output collection task failed: {err}")))?
        .map_err(|err| OmaError::backend(format!("failed to read coding agent output: {err}")))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}
