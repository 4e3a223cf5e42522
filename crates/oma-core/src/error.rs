use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::runner::BackendKind;

/// Core error type for OMA agents.
#[derive(Debug, Error)]
pub enum OmaError {
    #[error("missing required context key `{key}` for agent `{agent_id}`")]
    MissingInput { key: String, agent_id: String },
    #[error("context key `{key}` for agent `{agent_id}` must be {expected}, found {found}")]
    InvalidInput {
        key: String,
        agent_id: String,
        expected: String,
        found: String,
    },
    #[error("unknown tool(s) requested: {}", names.join(", "))]
    ToolResolution { names: Vec<String> },
    #[error("{backend} backend timed out after {}s", timeout.as_secs_f64())]
    BackendTimeout {
        backend: BackendKind,
        timeout: Duration,
    },
    #[error("backend execution failed: {0}")]
    BackendExecution(String),
    #[error("agent `{agent_id}` did not produce declared output `{key}`")]
    MissingOutput { key: String, agent_id: String },
    #[error("executor for agent `{0}` is already running")]
    AlreadyRunning(String),
    #[error("configuration error: {0}")]
    InvalidConfiguration(String),
    #[error("model provider API key is missing: set `{0}` or point llm.api_key_env at another variable")]
    MissingSecret(String),
    #[error("I/O error while reading {path}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OmaError {
    pub fn config_io(path: PathBuf, source: std::io::Error) -> Self {
        Self::ConfigIo { path, source }
    }

    pub fn backend(reason: impl Into<String>) -> Self {
        Self::BackendExecution(reason.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            OmaError::MissingInput { .. } => ErrorKind::MissingInput,
            OmaError::InvalidInput { .. } => ErrorKind::InvalidInput,
            OmaError::ToolResolution { .. } => ErrorKind::ToolResolution,
            OmaError::BackendTimeout { .. } => ErrorKind::BackendTimeout,
            OmaError::BackendExecution(_) | OmaError::Other(_) => ErrorKind::BackendExecution,
            OmaError::MissingOutput { .. } => ErrorKind::MissingOutput,
            OmaError::AlreadyRunning(_) => ErrorKind::AlreadyRunning,
            OmaError::InvalidConfiguration(_)
            | OmaError::MissingSecret(_)
            | OmaError::ConfigIo { .. } => ErrorKind::Configuration,
        }
    }

    /// Whether an external orchestrator may reasonably try the step again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::BackendTimeout | ErrorKind::BackendExecution | ErrorKind::MissingOutput
        )
    }

    /// The context key this error is about, if any.
    pub fn context_key(&self) -> Option<&str> {
        match self {
            OmaError::MissingInput { key, .. }
            | OmaError::InvalidInput { key, .. }
            | OmaError::MissingOutput { key, .. } => Some(key),
            _ => None,
        }
    }
}

/// Serializable tag for [`OmaError`] carried inside error envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    MissingInput,
    InvalidInput,
    ToolResolution,
    BackendTimeout,
    BackendExecution,
    MissingOutput,
    AlreadyRunning,
    Configuration,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::MissingInput => "missing_input",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::ToolResolution => "tool_resolution",
            ErrorKind::BackendTimeout => "backend_timeout",
            ErrorKind::BackendExecution => "backend_execution",
            ErrorKind::MissingOutput => "missing_output",
            ErrorKind::AlreadyRunning => "already_running",
            ErrorKind::Configuration => "configuration",
        }
    }
}
