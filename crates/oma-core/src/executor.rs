//! Task executors: one pipeline step bound to a context and a backend.
//!
//! A step is described by an [`AgentDefinition`] (what it needs, what it
//! produces, which workflow it runs) and executed by a [`StepExecutor`] on
//! whichever [`BackendRunner`] the driver picked. The executor never branches
//! on the backend; the runner's associated `Runnable` type keeps each backend
//! self-contained.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tracing::{error, info, instrument, warn};

use crate::agent_config::{AgentConfig, StepInputs};
use crate::context::OmaContext;
use crate::envelope::{ExecutorState, ResultEnvelope};
use crate::error::{ErrorKind, OmaError};
use crate::events::{EventCollector, StepOutcome};
use crate::metrics::record_step_metrics;
use crate::runner::BackendRunner;
use crate::workflow::WorkflowSpec;

/// Static description of an agent step.
pub trait AgentDefinition: Send + Sync {
    fn config(&self) -> &AgentConfig;

    /// Workflow for one run, built from already-validated inputs.
    fn workflow(&self, inputs: &StepInputs) -> Result<WorkflowSpec, OmaError>;
}

/// One executable pipeline step.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    fn agent_config(&self) -> &AgentConfig;

    fn context(&self) -> &OmaContext;

    fn state(&self) -> ExecutorState;

    /// Run the step. Never panics and never returns anything but an envelope.
    async fn execute(&self) -> ResultEnvelope;
}

pub struct StepExecutor<R: BackendRunner> {
    definition: Arc<dyn AgentDefinition>,
    runner: R,
    context: OmaContext,
    state: AtomicU8,
    events: Option<EventCollector>,
}

impl<R: BackendRunner> StepExecutor<R> {
    pub fn new(definition: Arc<dyn AgentDefinition>, context: OmaContext, runner: R) -> Self {
        Self {
            definition,
            runner,
            context,
            state: AtomicU8::new(ExecutorState::Created.to_u8()),
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventCollector) -> Self {
        self.events = Some(events);
        self
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Move to `Running` unless another call already holds the executor.
    fn try_start(&self) -> Option<RunningGuard<'_>> {
        let mut current = self.state.load(Ordering::SeqCst);
        loop {
            let state = ExecutorState::from_u8(current);
            if !state.can_transition_to(ExecutorState::Running) {
                return None;
            }
            match self.state.compare_exchange(
                current,
                ExecutorState::Running.to_u8(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    return Some(RunningGuard {
                        state: &self.state,
                        finished: false,
                    });
                }
                Err(actual) => current = actual,
            }
        }
    }

    async fn run_step(&self) -> Result<(String, Map<String, Value>), OmaError> {
        let config = self.definition.config();
        let inputs = config.resolve_inputs(&self.context)?;
        let workflow = self.definition.workflow(&inputs)?;

        let snapshot = self.context.snapshot_keys(config.output_keys());
        let outcome = self.run_backend(config, &workflow).await;
        if outcome.is_err() {
            self.context.restore(snapshot);
        }
        outcome
    }

    async fn run_backend(
        &self,
        config: &AgentConfig,
        workflow: &WorkflowSpec,
    ) -> Result<(String, Map<String, Value>), OmaError> {
        let runnable = self.runner.assemble(workflow)?;
        let timeout = config.timeout_duration();

        let raw_output = tokio::time::timeout(
            timeout,
            self.runner.run(runnable, &self.context, timeout),
        )
        .await
        .map_err(|_| OmaError::BackendTimeout {
            backend: self.runner.kind(),
            timeout,
        })??;

        let outputs = config.collect_outputs(&self.context)?;
        Ok((raw_output, outputs))
    }
}

/// Leaves the executor `Failed` if a run is dropped before it finishes.
struct RunningGuard<'a> {
    state: &'a AtomicU8,
    finished: bool,
}

impl RunningGuard<'_> {
    fn finish(mut self, state: ExecutorState) {
        self.state.store(state.to_u8(), Ordering::SeqCst);
        self.finished = true;
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.state
                .store(ExecutorState::Failed.to_u8(), Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl<R: BackendRunner> TaskExecutor for StepExecutor<R> {
    fn agent_config(&self) -> &AgentConfig {
        self.definition.config()
    }

    fn context(&self) -> &OmaContext {
        &self.context
    }

    fn state(&self) -> ExecutorState {
        ExecutorState::from_u8(self.state.load(Ordering::SeqCst))
    }

    #[instrument(
        name = "executor.execute",
        skip(self),
        fields(
            agent_id = %self.definition.config().agent_id,
            run_id = %self.context.run_id(),
            backend = %self.runner.kind()
        )
    )]
    async fn execute(&self) -> ResultEnvelope {
        let agent_id = self.definition.config().agent_id.clone();
        let backend = self.runner.kind();

        let Some(guard) = self.try_start() else {
            warn!("executor is already running");
            return ResultEnvelope::from_error(&agent_id, &OmaError::AlreadyRunning(agent_id.clone()));
        };

        if let Some(events) = &self.events {
            events.emit_start(self.context.run_id(), &agent_id, backend);
        }
        let started = Instant::now();
        let outcome = self.run_step().await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let (envelope, status, event_outcome) = match outcome {
            Ok((raw_output, outputs)) => {
                guard.finish(ExecutorState::Succeeded);
                info!(duration_ms, outputs = outputs.len(), "step succeeded");
                if let Some(events) = &self.events {
                    events.emit_message(
                        self.context.run_id(),
                        &agent_id,
                        raw_output.clone(),
                        json!({ "outputs": outputs }),
                    );
                }
                (
                    ResultEnvelope::success(&agent_id, raw_output, outputs),
                    "success",
                    StepOutcome::Success,
                )
            }
            Err(err) => {
                guard.finish(ExecutorState::Failed);
                let kind = err.kind();
                error!(duration_ms, kind = kind.as_str(), error = %err, "step failed");
                let event_outcome = if kind == ErrorKind::BackendTimeout {
                    StepOutcome::Timeout
                } else {
                    StepOutcome::Failure {
                        reason: err.to_string(),
                        retryable: err.is_retryable(),
                    }
                };
                (
                    ResultEnvelope::from_error(&agent_id, &err),
                    kind.as_str(),
                    event_outcome,
                )
            }
        };

        record_step_metrics(&agent_id, backend.as_str(), status, duration_ms);
        if let Some(events) = &self.events {
            events.emit_finish(
                self.context.run_id(),
                &agent_id,
                backend,
                event_outcome,
                duration_ms,
            );
        }
        envelope
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::*;
    use crate::events::{Event, drain_events};
    use crate::runner::BackendKind;
    use crate::workflow::{AgentSpec, TaskSpec};

    struct Echo {
        config: AgentConfig,
    }

    impl AgentDefinition for Echo {
        fn config(&self) -> &AgentConfig {
            &self.config
        }

        fn workflow(&self, inputs: &StepInputs) -> Result<WorkflowSpec, OmaError> {
            Ok(WorkflowSpec::new("echo", inputs.str_or("model", "test/model"))
                .agent(AgentSpec::new("echo", "Echo", "Echo"))
                .task(TaskSpec::new("echo", "Echo the input", "Echo")))
        }
    }

    fn echo_definition() -> Arc<dyn AgentDefinition> {
        Arc::new(Echo {
            config: AgentConfig::new("echo", "Echo")
                .with_timeout_secs(5)
                .with_input("file_id", "string - file")
                .with_output("echo_id", "string - echoed id"),
        })
    }

    /// Writes `echo_id` (or a partial key) and returns after an optional delay.
    struct FakeRunner {
        calls: AtomicUsize,
        delay: Duration,
        write_output: bool,
        stray_key: Option<&'static str>,
    }

    impl FakeRunner {
        fn new(write_output: bool) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
                write_output,
                stray_key: None,
            }
        }
    }

    #[async_trait]
    impl BackendRunner for FakeRunner {
        type Runnable = ();

        fn kind(&self) -> BackendKind {
            BackendKind::Graph
        }

        fn assemble(&self, _workflow: &WorkflowSpec) -> Result<(), OmaError> {
            Ok(())
        }

        async fn run(
            &self,
            _runnable: (),
            context: &OmaContext,
            _timeout: Duration,
        ) -> Result<String, OmaError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let file_id: String = context.get_shared_data("file_id").unwrap_or_default();
            if self.write_output {
                context.set_shared_data("echo_id", format!("E-{file_id}"));
            }
            if let Some(key) = self.stray_key {
                context.set_shared_data(key, "partial");
            }
            tokio::time::sleep(self.delay).await;
            Ok(format!("echoed {file_id}"))
        }
    }

    fn seeded_context() -> OmaContext {
        let ctx = OmaContext::new();
        ctx.set_shared_data("file_id", "F1");
        ctx
    }

    #[tokio::test]
    async fn success_copies_outputs_into_envelope() {
        let (events, mut receiver) = EventCollector::new();
        let executor =
            StepExecutor::new(echo_definition(), seeded_context(), FakeRunner::new(true))
                .with_events(events);

        let envelope = executor.execute().await;
        assert!(envelope.is_success());
        assert_eq!(envelope.output("echo_id"), Some(&json!("E-F1")));
        assert_eq!(executor.state(), ExecutorState::Succeeded);

        let events = drain_events(&mut receiver);
        assert!(matches!(events.first(), Some(Event::Start { .. })));
        assert!(matches!(
            events.last(),
            Some(Event::Finish { outcome: StepOutcome::Success, .. })
        ));
    }

    #[tokio::test]
    async fn missing_input_skips_the_runner() {
        let executor =
            StepExecutor::new(echo_definition(), OmaContext::new(), FakeRunner::new(true));
        let envelope = executor.execute().await;
        let error = envelope.error().expect("error envelope");
        assert_eq!(error.kind, ErrorKind::MissingInput);
        assert_eq!(error.key.as_deref(), Some("file_id"));
        assert_eq!(executor.runner().calls.load(Ordering::SeqCst), 0);
        assert_eq!(executor.state(), ExecutorState::Failed);
    }

    #[tokio::test]
    async fn missing_output_is_an_error() {
        let executor =
            StepExecutor::new(echo_definition(), seeded_context(), FakeRunner::new(false));
        let envelope = executor.execute().await;
        let error = envelope.error().expect("error envelope");
        assert_eq!(error.kind, ErrorKind::MissingOutput);
        assert!(error.retryable);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_restores_declared_outputs() {
        let ctx = seeded_context();
        ctx.set_shared_data("echo_id", "previous");
        let mut runner = FakeRunner::new(true);
        runner.delay = Duration::from_secs(60);
        let executor = StepExecutor::new(echo_definition(), ctx.clone(), runner);

        let envelope = executor.execute().await;
        assert_eq!(envelope.error().unwrap().kind, ErrorKind::BackendTimeout);
        assert_eq!(ctx.get_value("echo_id"), Some(json!("previous")));
    }

    #[tokio::test]
    async fn failed_step_drops_undeclared_keys_it_wrote() {
        let ctx = seeded_context();
        ctx.set_shared_data("notes", "from an earlier step");
        let mut runner = FakeRunner::new(false);
        runner.stray_key = Some("draft_overview_id");
        let executor = StepExecutor::new(echo_definition(), ctx.clone(), runner);

        let envelope = executor.execute().await;
        assert_eq!(envelope.error().unwrap().kind, ErrorKind::MissingOutput);
        assert!(!ctx.contains("draft_overview_id"));
        assert_eq!(ctx.keys(), vec!["file_id", "notes"]);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_execute_is_rejected() {
        let mut runner = FakeRunner::new(true);
        runner.delay = Duration::from_secs(1);
        let executor = StepExecutor::new(echo_definition(), seeded_context(), runner);

        let (first, second) = tokio::join!(executor.execute(), executor.execute());
        let errors: Vec<_> = [&first, &second]
            .iter()
            .filter_map(|envelope| envelope.error())
            .map(|error| error.kind)
            .collect();
        assert_eq!(errors, vec![ErrorKind::AlreadyRunning]);
        assert!(first.is_success() || second.is_success());
    }

    #[tokio::test]
    async fn rerun_after_terminal_state_is_allowed() {
        let executor =
            StepExecutor::new(echo_definition(), seeded_context(), FakeRunner::new(true));
        assert!(executor.execute().await.is_success());
        assert!(executor.execute().await.is_success());
        assert_eq!(executor.runner().calls.load(Ordering::SeqCst), 2);
    }
}
