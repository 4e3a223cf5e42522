use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use oma_core::adapter::CrewToolAdapter;
use oma_core::llm::{ChatResponse, ScriptedProvider};
use oma_core::runner::CrewRunner;
use oma_core::tools::{FnTool, InMemoryToolRegistry, ToolSpec};
use oma_core::{
    AgentConfig, AgentDefinition, AgentSpec, BackendKind, BackendRunner, ErrorKind,
    ExecutorState, OmaContext, OmaError, Pipeline, RetryPolicy, StepExecutor, StepInputs,
    TaskExecutor, TaskSpec, WorkflowSpec,
};
use serde_json::json;

/// Agent with a single task using `tools`.
struct Step {
    config: AgentConfig,
    tools: Vec<&'static str>,
}

impl AgentDefinition for Step {
    fn config(&self) -> &AgentConfig {
        &self.config
    }

    fn workflow(&self, inputs: &StepInputs) -> Result<WorkflowSpec, OmaError> {
        let source = inputs
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join(", ");
        Ok(WorkflowSpec::new(&self.config.agent_id, inputs.str_or("model", "openai/gpt-4o-mini"))
            .agent(AgentSpec::new("worker", "Do the work", "Diligent"))
            .task(
                TaskSpec::new("worker", format!("Work on {source}"), "Done")
                    .with_tools(self.tools.iter().copied()),
            ))
    }
}

fn parser_step() -> Arc<dyn AgentDefinition> {
    Arc::new(Step {
        config: AgentConfig::new("pdf_parser", "PDF parser")
            .with_timeout_secs(30)
            .with_retry_count(3)
            .with_input("file_id", "string")
            .with_optional_input("model", "string", Some(json!("openai/gpt-4o-mini")))
            .with_output("structured_content_overview_id", "string"),
        tools: vec!["create_content_overview"],
    })
}

fn analysis_step() -> Arc<dyn AgentDefinition> {
    Arc::new(Step {
        config: AgentConfig::new("comparative_analysis", "Comparative analysis")
            .with_timeout_secs(30)
            .with_input("structured_content_overview_id", "string")
            .with_output("comparative_analysis_id", "string"),
        tools: vec!["create_analysis_overview"],
    })
}

fn registry() -> InMemoryToolRegistry {
    InMemoryToolRegistry::new()
        .with_tool(Arc::new(FnTool::new(
            ToolSpec::new("create_content_overview", "Create an overview"),
            |_, context| {
                context.set_shared_data("structured_content_overview_id", "SCO-1");
                Ok("SCO-1".into())
            },
        )))
        .with_tool(Arc::new(FnTool::new(
            ToolSpec::new("create_analysis_overview", "Create an analysis"),
            |_, context| {
                context.set_shared_data("comparative_analysis_id", "CA-1");
                Ok("CA-1".into())
            },
        )))
}

fn crew_runner(provider: &ScriptedProvider) -> CrewRunner {
    CrewRunner::new(CrewToolAdapter::new(
        Arc::new(registry()),
        Arc::new(provider.clone()),
    ))
}

#[tokio::test]
async fn two_steps_chain_through_the_shared_context() {
    let context = OmaContext::with_run_id("run-chain");
    context.set_shared_data("file_id", "F1");
    let provider = ScriptedProvider::new([
        ChatResponse::tool_call("c1", "create_content_overview", json!({})),
        ChatResponse::text("overview ready"),
        ChatResponse::tool_call("c2", "create_analysis_overview", json!({})),
        ChatResponse::text("analysis ready"),
    ]);

    let pipeline = Pipeline::new(context.clone())
        .with_step(Box::new(StepExecutor::new(
            parser_step(),
            context.clone(),
            crew_runner(&provider),
        )))
        .with_step(Box::new(StepExecutor::new(
            analysis_step(),
            context.clone(),
            crew_runner(&provider),
        )));
    pipeline.validate_wiring().expect("wiring");

    let report = pipeline.run().await;
    assert!(report.completed);
    assert_eq!(report.run_id, "run-chain");
    assert_eq!(report.steps.len(), 2);
    assert_eq!(
        report.last_envelope().and_then(|envelope| envelope.output("comparative_analysis_id")),
        Some(&json!("CA-1"))
    );

    let requests = provider.requests().await;
    assert_eq!(requests[0].model, "openai/gpt-4o-mini");
    let first_prompt = requests[0].messages[1].text().unwrap_or_default().to_string();
    assert!(first_prompt.contains("file_id=\"F1\""), "{first_prompt}");
}

#[tokio::test]
async fn empty_context_fails_before_any_model_call() {
    let context = OmaContext::new();
    let provider = ScriptedProvider::new([ChatResponse::text("never used")]);
    let pipeline = Pipeline::new(context.clone()).with_step(Box::new(StepExecutor::new(
        analysis_step(),
        context.clone(),
        crew_runner(&provider),
    )));

    assert!(pipeline.validate_wiring().is_err());
    let report = pipeline.run().await;
    assert!(!report.completed);
    let error = report.steps[0].envelope.error().expect("error envelope");
    assert_eq!(error.kind, ErrorKind::MissingInput);
    assert_eq!(error.key.as_deref(), Some("structured_content_overview_id"));
    assert_eq!(provider.remaining().await, 1);
}

#[tokio::test]
async fn unknown_tool_stops_the_pipeline() {
    let context = OmaContext::new();
    context.set_shared_data("file_id", "F1");
    let provider = ScriptedProvider::default();
    let broken: Arc<dyn AgentDefinition> = Arc::new(Step {
        config: AgentConfig::new("pdf_parser", "PDF parser")
            .with_input("file_id", "string")
            .with_output("structured_content_overview_id", "string"),
        tools: vec!["create_content_overview", "nonexistent_tool"],
    });

    let pipeline = Pipeline::new(context.clone())
        .with_step(Box::new(StepExecutor::new(
            broken,
            context.clone(),
            crew_runner(&provider),
        )))
        .with_step(Box::new(StepExecutor::new(
            analysis_step(),
            context.clone(),
            crew_runner(&provider),
        )));

    let report = pipeline.run().await;
    assert!(!report.completed);
    assert_eq!(report.steps.len(), 1);
    let error = report.failed_step().and_then(|step| step.envelope.error()).unwrap();
    assert_eq!(error.kind, ErrorKind::ToolResolution);
    assert!(error.error.contains("nonexistent_tool"));
    assert!(provider.requests().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn slow_model_times_out_and_leaves_outputs_untouched() {
    let context = OmaContext::new();
    context.set_shared_data("file_id", "F1");
    let provider = ScriptedProvider::new([ChatResponse::text("too late")])
        .with_delay(Duration::from_secs(120));
    let definition: Arc<dyn AgentDefinition> = Arc::new(Step {
        config: AgentConfig::new("pdf_parser", "PDF parser")
            .with_timeout_secs(5)
            .with_input("file_id", "string")
            .with_output("structured_content_overview_id", "string"),
        tools: vec![],
    });
    let executor = StepExecutor::new(definition, context.clone(), crew_runner(&provider));

    let envelope = executor.execute().await;
    let error = envelope.error().expect("timeout envelope");
    assert_eq!(error.kind, ErrorKind::BackendTimeout);
    assert!(error.retryable);
    assert!(!context.contains("structured_content_overview_id"));
}

#[tokio::test]
async fn executor_can_run_again_after_finishing() {
    let context = OmaContext::new();
    context.set_shared_data("file_id", "F1");
    let provider = ScriptedProvider::new([
        ChatResponse::tool_call("c1", "create_content_overview", json!({})),
        ChatResponse::text("first"),
        ChatResponse::tool_call("c2", "create_content_overview", json!({})),
        ChatResponse::text("second"),
    ]);
    let executor = StepExecutor::new(parser_step(), context, crew_runner(&provider));

    assert!(executor.execute().await.is_success());
    assert_eq!(executor.state(), ExecutorState::Succeeded);
    let second = executor.execute().await;
    assert!(second.is_success());
    match second {
        oma_core::ResultEnvelope::Success(result) => assert_eq!(result.raw_output, "second"),
        other => panic!("unexpected envelope {other:?}"),
    }
}

/// Fails with a retryable error until `failures` runs have happened.
struct Flaky {
    failures: usize,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl BackendRunner for Flaky {
    type Runnable = ();

    fn kind(&self) -> BackendKind {
        BackendKind::Crew
    }

    fn assemble(&self, _workflow: &WorkflowSpec) -> Result<(), OmaError> {
        Ok(())
    }

    async fn run(&self, _: (), context: &OmaContext, _: Duration) -> Result<String, OmaError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(OmaError::backend("upstream hiccup"));
        }
        context.set_shared_data("structured_content_overview_id", "SCO-9");
        Ok("recovered".into())
    }
}

#[tokio::test(start_paused = true)]
async fn retryable_failures_are_retried_with_backoff() {
    let context = OmaContext::new();
    context.set_shared_data("file_id", "F1");
    let calls = Arc::new(AtomicUsize::new(0));
    let runner = Flaky {
        failures: 2,
        calls: calls.clone(),
    };
    let pipeline = Pipeline::new(context.clone())
        .with_step(Box::new(StepExecutor::new(parser_step(), context, runner)))
        .with_retry(RetryPolicy::default());

    let report = pipeline.run().await;
    assert!(report.completed);
    assert_eq!(report.steps[0].attempts, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn retry_cap_limits_attempts() {
    let context = OmaContext::new();
    context.set_shared_data("file_id", "F1");
    let calls = Arc::new(AtomicUsize::new(0));
    let runner = Flaky {
        failures: 10,
        calls: calls.clone(),
    };
    let pipeline = Pipeline::new(context.clone())
        .with_step(Box::new(StepExecutor::new(parser_step(), context, runner)))
        .with_retry(RetryPolicy {
            max_retries: Some(1),
            ..RetryPolicy::default()
        });

    let report = pipeline.run().await;
    assert!(!report.completed);
    assert_eq!(report.steps[0].attempts, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}
