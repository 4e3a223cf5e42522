//! Backend runners: turn a [`WorkflowSpec`] into something runnable on one
//! orchestration backend, then run it against a context.

mod coding;
mod crew;
mod graph;

pub use coding::{
    ClaudeCliClient, ClaudeCliConfig, CodingAgentClient, CodingAgentRequest, CodingAgentRun,
    CodingAgentRunner,
};
pub use crew::{Crew, CrewRunner};
pub use graph::{GraphRunner, ReactAgent};

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::context::OmaContext;
use crate::error::OmaError;
use crate::workflow::WorkflowSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Declarative multi-agent crew; tasks run in order.
    Crew,
    /// Single reactive tool-using agent driven by a task graph.
    Graph,
    /// External coding-agent process with namespaced tools.
    CodingAgent,
}

impl BackendKind {
    pub const ALL: [BackendKind; 3] = [BackendKind::Crew, BackendKind::Graph, BackendKind::CodingAgent];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Crew => "crew",
            BackendKind::Graph => "graph",
            BackendKind::CodingAgent => "coding_agent",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = OmaError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "crew" | "crewai" => Ok(BackendKind::Crew),
            "graph" | "langgraph" | "react" => Ok(BackendKind::Graph),
            "coding_agent" | "claude_code" | "cli" | "sdk" => Ok(BackendKind::CodingAgent),
            other => Err(OmaError::InvalidConfiguration(format!(
                "unknown backend `{other}` (expected crew, graph or coding_agent)"
            ))),
        }
    }
}

/// One agent-orchestration backend.
///
/// `assemble` resolves tools and models up front so that tool-name errors
/// surface before any model or tool is called.
#[async_trait]
pub trait BackendRunner: Send + Sync {
    type Runnable: Send;

    fn kind(&self) -> BackendKind;

    fn assemble(&self, workflow: &WorkflowSpec) -> Result<Self::Runnable, OmaError>;

    async fn run(
        &self,
        runnable: Self::Runnable,
        context: &OmaContext,
        timeout: Duration,
    ) -> Result<String, OmaError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_kind_parses_aliases() {
        assert_eq!("crew".parse::<BackendKind>().unwrap(), BackendKind::Crew);
        assert_eq!("LangGraph".parse::<BackendKind>().unwrap(), BackendKind::Graph);
        assert_eq!(
            "claude-code".parse::<BackendKind>().unwrap(),
            BackendKind::CodingAgent
        );
        assert!("pigeon".parse::<BackendKind>().is_err());
    }

    #[test]
    fn backend_kind_display_round_trips() {
        for kind in BackendKind::ALL {
            assert_eq!(kind.to_string().parse::<BackendKind>().unwrap(), kind);
        }
        assert_eq!(
            serde_json::to_value(BackendKind::CodingAgent).unwrap(),
            serde_json::json!("coding_agent")
        );
    }
}
