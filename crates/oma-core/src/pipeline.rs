//! Sequential driver for a chain of task executors sharing one context.

use std::collections::BTreeSet;
use std::time::Instant;

use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::agent_config::AgentConfig;
use crate::context::OmaContext;
use crate::envelope::ResultEnvelope;
use crate::error::OmaError;
use crate::executor::TaskExecutor;
use crate::logging::{RunLogInput, log_run_completion};
use crate::runner::BackendKind;

/// Retry settings for retryable step failures.
///
/// The number of attempts comes from each step's `retry_count`, optionally
/// capped by `max_retries`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: Option<u32>,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: None,
            initial_backoff_ms: 1000,
            max_backoff_ms: 30000,
        }
    }
}

impl RetryPolicy {
    fn retries_for(&self, config: &AgentConfig) -> u32 {
        match self.max_retries {
            Some(cap) => config.retry_count.min(cap),
            None => config.retry_count,
        }
    }

    /// Doubles `current_ms`, capped at `max_backoff_ms`.
    fn next_backoff(&self, current_ms: u64) -> u64 {
        current_ms.saturating_mul(2).min(self.max_backoff_ms)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub agent_id: String,
    pub attempts: u32,
    pub duration_ms: u64,
    pub envelope: ResultEnvelope,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub run_id: String,
    pub steps: Vec<StepReport>,
    pub completed: bool,
    pub duration_ms: u64,
}

impl PipelineReport {
    /// Envelope of the last step that ran.
    pub fn last_envelope(&self) -> Option<&ResultEnvelope> {
        self.steps.last().map(|step| &step.envelope)
    }

    pub fn failed_step(&self) -> Option<&StepReport> {
        self.steps.iter().find(|step| !step.envelope.is_success())
    }
}

/// Check that every required input is available before its step runs:
/// present in `initial_keys` or produced by an earlier step.
pub fn validate_wiring<'a, I, S>(configs: I, initial_keys: &[S]) -> Result<(), OmaError>
where
    I: IntoIterator<Item = &'a AgentConfig>,
    S: AsRef<str>,
{
    let mut available: BTreeSet<String> = initial_keys
        .iter()
        .map(|key| key.as_ref().to_string())
        .collect();
    for config in configs {
        if let Some(missing) = config.required_inputs().find(|key| !available.contains(*key)) {
            return Err(OmaError::MissingInput {
                key: missing.to_string(),
                agent_id: config.agent_id.clone(),
            });
        }
        available.extend(config.output_keys().map(str::to_string));
    }
    Ok(())
}

pub struct Pipeline {
    context: OmaContext,
    steps: Vec<Box<dyn TaskExecutor>>,
    retry: Option<RetryPolicy>,
    run_log: bool,
    backend: Option<BackendKind>,
}

impl Pipeline {
    pub fn new(context: OmaContext) -> Self {
        Self {
            context,
            steps: Vec::new(),
            retry: None,
            run_log: false,
            backend: None,
        }
    }

    pub fn context(&self) -> &OmaContext {
        &self.context
    }

    /// Steps should have been built over this pipeline's context.
    pub fn with_step(mut self, step: Box<dyn TaskExecutor>) -> Self {
        self.push_step(step);
        self
    }

    pub fn push_step(&mut self, step: Box<dyn TaskExecutor>) {
        if step.context().run_id() != self.context.run_id() {
            warn!(
                agent_id = %step.agent_config().agent_id,
                "step was built over a different run context"
            );
        }
        self.steps.push(step);
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_run_log(mut self, enabled: bool) -> Self {
        self.run_log = enabled;
        self
    }

    /// Backend the steps run on, recorded in the run log.
    pub fn with_backend(mut self, kind: BackendKind) -> Self {
        self.backend = Some(kind);
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Static check of the step chain against the current context keys.
    pub fn validate_wiring(&self) -> Result<(), OmaError> {
        validate_wiring(
            self.steps.iter().map(|step| step.agent_config()),
            &self.context.keys(),
        )
    }

    /// Run every step in order, stopping at the first error envelope.
    #[instrument(name = "pipeline.run", skip(self), fields(run_id = %self.context.run_id(), steps = self.steps.len()))]
    pub async fn run(&self) -> PipelineReport {
        let started = Instant::now();
        let mut reports = Vec::with_capacity(self.steps.len());
        let mut completed = true;

        for step in &self.steps {
            let report = self.run_with_retry(step.as_ref()).await;
            let succeeded = report.envelope.is_success();
            reports.push(report);
            if !succeeded {
                completed = false;
                break;
            }
        }

        let report = PipelineReport {
            run_id: self.context.run_id().to_string(),
            steps: reports,
            completed,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            completed = report.completed,
            steps_run = report.steps.len(),
            duration_ms = report.duration_ms,
            "pipeline finished"
        );

        if self.run_log {
            if let Err(err) = log_run_completion(self.run_log_input(&report)) {
                warn!(error = %err, "failed to write run log");
            }
        }
        report
    }

    async fn run_with_retry(&self, step: &dyn TaskExecutor) -> StepReport {
        let config = step.agent_config();
        let policy = self.retry.as_ref();
        let retries = policy.map(|policy| policy.retries_for(config)).unwrap_or(0);
        let mut backoff_ms = policy
            .map(|policy| policy.initial_backoff_ms)
            .unwrap_or_default();
        let started = Instant::now();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let envelope = step.execute().await;
            let retryable = envelope.error().map(|error| error.retryable).unwrap_or(false);

            if retryable && attempt <= retries {
                warn!(
                    agent_id = %config.agent_id,
                    attempt,
                    backoff_ms,
                    "step failed, retrying"
                );
                tokio::time::sleep(std::time::Duration::from_millis(backoff_ms)).await;
                backoff_ms = policy
                    .map(|policy| policy.next_backoff(backoff_ms))
                    .unwrap_or_default();
                continue;
            }

            return StepReport {
                agent_id: config.agent_id.clone(),
                attempts: attempt,
                duration_ms: started.elapsed().as_millis() as u64,
                envelope,
            };
        }
    }

    fn run_log_input(&self, report: &PipelineReport) -> RunLogInput {
        let summary = match report.last_envelope() {
            Some(ResultEnvelope::Success(result)) => result.raw_output.clone(),
            _ => String::new(),
        };
        RunLogInput {
            run_id: report.run_id.clone(),
            agents: report.steps.iter().map(|step| step.agent_id.clone()).collect(),
            backend: self.backend.map(|kind| kind.as_str().to_string()),
            completed: report.completed,
            summary,
            error: report
                .failed_step()
                .and_then(|step| step.envelope.error())
                .map(|error| error.error.clone()),
            context_keys: self.context.keys(),
            duration_ms: report.duration_ms,
        }
    }
}
