use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, Parser, Subcommand};
use oma_agents::{Backends, catalog, find};
use oma_core::adapter::namespace_prefix;
use oma_core::llm::{LlmProvider, OpenRouterProvider};
use oma_core::metrics::init_metrics_from_env;
use oma_core::runner::ClaudeCliClient;
use oma_core::tools::{McpToolRegistry, ToolRegistry};
use oma_core::{
    AgentDefinition, BackendKind, ConfigLoader, OmaContext, Pipeline, RetryPolicy, Settings,
    TaskExecutor, TelemetryOptions, init_telemetry,
};
use serde::Serialize;
use serde_json::Value;
use tokio::runtime::Runtime;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "oma", version, about = "Run OMA document-analysis agents")]
struct Cli {
    /// Path to the TOML configuration (falls back to `OMA_CONFIG`, then `oma.toml`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the configuration of every shipped agent.
    Agents,
    /// List the tools offered by the configured tool server.
    Tools(ToolsArgs),
    /// Run a single agent step.
    Run(RunArgs),
    /// Run several agents in order over one shared context.
    Pipeline(PipelineArgs),
}

#[derive(Args, Debug)]
struct ToolsArgs {
    /// Show names as a coding agent sees them (`mcp__<server>__<tool>`).
    #[arg(long)]
    qualified: bool,

    /// Include descriptions and input schemas.
    #[arg(long)]
    detail: bool,
}

#[derive(Args, Debug, Clone)]
struct StepArgs {
    /// Backend to run on; overrides the configured one.
    #[arg(long)]
    backend: Option<BackendKind>,

    /// Context seed as `key=value` (string) or `key:=json`.
    #[arg(long = "input", value_name = "KEY=VALUE")]
    inputs: Vec<String>,

    /// Run identifier; a random one is generated when omitted.
    #[arg(long)]
    run_id: Option<String>,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Agent id, e.g. `pdf_parser`.
    #[arg(long)]
    agent: String,

    #[command(flatten)]
    step: StepArgs,
}

#[derive(Args, Debug)]
struct PipelineArgs {
    /// Comma-separated agent ids; defaults to the whole catalog.
    #[arg(long, value_delimiter = ',')]
    agents: Vec<String>,

    #[command(flatten)]
    step: StepArgs,

    /// Retry retryable failures up to each agent's retry count.
    #[arg(long)]
    retries: bool,

    /// Cap on retries per step.
    #[arg(long, requires = "retries")]
    max_retries: Option<u32>,
}

#[derive(Serialize)]
struct ToolRow {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    input_schema: Option<Value>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = ConfigLoader::load(cli.config.clone())?;

    init_telemetry(TelemetryOptions {
        env_filter: std::env::var("RUST_LOG")
            .ok()
            .or_else(|| Some(settings.logging.level.clone())),
        ..TelemetryOptions::default()
    })?;
    init_metrics_from_env("oma-cli");

    let rt = Runtime::new()?;
    rt.block_on(async move {
        match cli.command {
            Command::Agents => agents_command()?,
            Command::Tools(args) => tools_command(&settings, args).await?,
            Command::Run(args) => run_command(&settings, args).await?,
            Command::Pipeline(args) => pipeline_command(&settings, args).await?,
        }
        Ok::<(), anyhow::Error>(())
    })?;

    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn agents_command() -> Result<()> {
    let configs: Vec<_> = catalog()
        .iter()
        .map(|agent| agent.config().clone())
        .collect();
    print_json(&configs)
}

async fn connect_tools(settings: &Settings) -> Result<Arc<McpToolRegistry>> {
    let registry = McpToolRegistry::connect(&settings.tools.endpoint, &settings.tools.server_name)
        .await
        .with_context(|| format!("failed to reach tool server at {}", settings.tools.endpoint))?;
    Ok(Arc::new(registry))
}

async fn tools_command(settings: &Settings, args: ToolsArgs) -> Result<()> {
    let registry = connect_tools(settings).await?;
    let prefix = namespace_prefix(registry.server_name());

    let rows: Vec<ToolRow> = registry
        .specs()
        .into_iter()
        .map(|spec| ToolRow {
            name: if args.qualified {
                format!("{prefix}{}", spec.name)
            } else {
                spec.name
            },
            description: args.detail.then_some(spec.description),
            input_schema: args.detail.then_some(spec.input_schema),
        })
        .collect();

    if args.detail {
        print_json(&rows)
    } else {
        for row in rows {
            println!("{}", row.name);
        }
        Ok(())
    }
}

fn parse_input(raw: &str) -> Result<(String, Value)> {
    if let Some((key, json)) = raw.split_once(":=") {
        let value = serde_json::from_str(json)
            .with_context(|| format!("input `{key}` is not valid JSON"))?;
        return Ok((key.trim().to_string(), value));
    }
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("input `{raw}` must look like key=value"))?;
    Ok((key.trim().to_string(), Value::String(value.to_string())))
}

fn seed_context(step: &StepArgs) -> Result<OmaContext> {
    let run_id = step
        .run_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let context = OmaContext::with_run_id(run_id);
    for raw in &step.inputs {
        let (key, value) = parse_input(raw)?;
        if key.is_empty() {
            bail!("input `{raw}` has an empty key");
        }
        context.set_shared_data(key, value);
    }
    Ok(context)
}

fn model_provider(settings: &Settings) -> Result<Arc<dyn LlmProvider>> {
    if settings.llm.provider != "openrouter" {
        bail!("unsupported llm.provider `{}`", settings.llm.provider);
    }
    let api_key = settings.llm_api_key()?;
    let provider = match &settings.llm.base_url {
        Some(base_url) => OpenRouterProvider::with_base_url(api_key, base_url)?,
        None => OpenRouterProvider::new(api_key)?,
    };
    Ok(Arc::new(provider))
}

async fn backends_for(settings: &Settings, kind: BackendKind) -> Result<Backends> {
    let registry = connect_tools(settings).await?;
    let backends = Backends::new(registry)
        .with_web_search(settings.coding_agent.allow_web_search)
        .with_default_model(settings.llm.default_model.clone());
    Ok(match kind {
        BackendKind::CodingAgent => backends.with_coding_client(
            Arc::new(ClaudeCliClient::new(settings.claude_cli_config())),
            settings.tools.server_name.clone(),
        ),
        BackendKind::Crew | BackendKind::Graph => {
            backends.with_provider(model_provider(settings)?)
        }
    })
}

fn backend_kind(settings: &Settings, step: &StepArgs) -> Result<BackendKind> {
    match step.backend {
        Some(kind) => Ok(kind),
        None => Ok(settings.backend_kind()?),
    }
}

async fn run_command(settings: &Settings, args: RunArgs) -> Result<()> {
    let agent = find(&args.agent).ok_or_else(|| anyhow!("unknown agent `{}`", args.agent))?;
    let kind = backend_kind(settings, &args.step)?;
    let context = seed_context(&args.step)?;
    info!(agent_id = %args.agent, backend = %kind, run_id = %context.run_id(), "running step");

    let backends = backends_for(settings, kind).await?;
    let executor = backends.executor(kind, agent, context)?;
    let envelope = executor.execute().await;
    print_json(&envelope)?;

    if !envelope.is_success() {
        std::process::exit(1);
    }
    Ok(())
}

fn select_agents(ids: &[String]) -> Result<Vec<Arc<dyn AgentDefinition>>> {
    if ids.is_empty() {
        return Ok(catalog());
    }
    ids.iter()
        .map(|id| find(id.trim()).ok_or_else(|| anyhow!("unknown agent `{id}`")))
        .collect()
}

async fn pipeline_command(settings: &Settings, args: PipelineArgs) -> Result<()> {
    let agents = select_agents(&args.agents)?;
    let kind = backend_kind(settings, &args.step)?;
    let context = seed_context(&args.step)?;
    info!(
        steps = agents.len(),
        backend = %kind,
        run_id = %context.run_id(),
        "running pipeline"
    );

    let backends = backends_for(settings, kind).await?;
    let mut pipeline = Pipeline::new(context.clone())
        .with_backend(kind)
        .with_run_log(settings.logging.run_log);
    for agent in agents {
        pipeline.push_step(backends.executor(kind, agent, context.clone())?);
    }
    if let Err(err) = pipeline.validate_wiring() {
        warn!(error = %err, "pipeline wiring is incomplete");
    }
    if args.retries {
        pipeline = pipeline.with_retry(RetryPolicy {
            max_retries: args.max_retries,
            ..RetryPolicy::default()
        });
    }

    let report = pipeline.run().await;
    print_json(&report)?;
    if !report.completed {
        std::process::exit(1);
    }
    Ok(())
}
