//! Tool adapters: one capability interface, one variant per backend family.
//!
//! An adapter turns tool names into backend-native tool handles and a model
//! id into a backend-native model handle. It never contacts the remote tool
//! server while doing so.

mod coding;
mod crew;
mod graph;

pub use coding::{
    CodingAgentModel, CodingAgentTool, CodingAgentToolAdapter, DEFAULT_SERVER_NAME, namespace_prefix,
};
pub use crew::{CrewLlm, CrewTool, CrewToolAdapter};
pub use graph::{GraphLlm, GraphTool, GraphToolAdapter};

use serde_json::Value;
use tracing::warn;

use crate::context::OmaContext;
use crate::error::OmaError;
use crate::tools::RemoteTool;

pub trait ToolAdapter: Send + Sync {
    type Tool: Send + Sync;
    type Llm: Send + Sync;

    /// Resolve every name, in first-seen order, or fail naming all unknown ones.
    fn get_tools(&self, names: &[String]) -> Result<Vec<Self::Tool>, OmaError>;

    fn create_llm(&self, model: &str, temperature: f32) -> Result<Self::Llm, OmaError>;
}

/// Call a tool and render the outcome as text for the model.
///
/// Tool failures are reported to the model rather than aborting the run.
pub(crate) async fn call_for_model(
    tool: &dyn RemoteTool,
    arguments: Value,
    context: &OmaContext,
) -> String {
    match tool.call(arguments, context).await {
        Ok(text) => text,
        Err(err) => {
            warn!(tool = tool.name(), error = %err, "tool call failed");
            format!("Error: {err}")
        }
    }
}

/// Reply given to the model when it asks for a tool outside its whitelist.
pub(crate) fn unlisted_tool_reply(name: &str) -> String {
    format!("Error: tool `{name}` is not available to this agent")
}
