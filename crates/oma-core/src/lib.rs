//! OMA core: run document-analysis agent steps over interchangeable
//! orchestration backends.
//!
//! Steps share one [`OmaContext`] per run. Each step validates its declared
//! inputs, hands a backend-neutral [`WorkflowSpec`] to a [`BackendRunner`]
//! (crew, graph or coding agent) and reports a [`ResultEnvelope`].

pub mod adapter;
pub mod config;
pub mod llm;
pub mod logging;
pub mod metrics;
pub mod runner;
pub mod telemetry;
pub mod tools;

mod agent_config;
mod context;
mod envelope;
mod error;
mod events;
mod executor;
mod pipeline;
mod security;
mod workflow;

pub use agent_config::{AgentConfig, ContextField, StepInputs, ValueKind};
pub use config::{ConfigLoader, Settings};
pub use context::{ContextStore, KeySnapshot, OmaContext};
pub use envelope::{ErrorResult, ExecutorState, ResultEnvelope, SuccessResult};
pub use error::{ErrorKind, OmaError};
pub use events::{Event, EventCollector, EventId, StepOutcome, drain_events};
pub use executor::{AgentDefinition, StepExecutor, TaskExecutor};
pub use pipeline::{Pipeline, PipelineReport, RetryPolicy, StepReport, validate_wiring};
pub use runner::{BackendKind, BackendRunner};
pub use security::{SecretValue, require_env};
pub use telemetry::{TelemetryOptions, init_telemetry};
pub use workflow::{AgentSpec, DEFAULT_MAX_ITER, DEFAULT_MAX_STEPS, TaskSpec, WorkflowSpec};
