//! Remote tool surface shared by every backend.
//!
//! Adapters resolve tool names against a [`ToolRegistry`]; resolution only
//! looks names up, the remote side is contacted when a backend actually calls
//! a tool.

mod mcp;

pub use mcp::McpToolRegistry;

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::context::OmaContext;
use crate::error::OmaError;

/// Name, description and JSON schema of a remote tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_object_schema", rename = "inputSchema")]
    pub input_schema: Value,
}

fn empty_object_schema() -> Value {
    json!({ "type": "object", "properties": {} })
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: empty_object_schema(),
        }
    }

    pub fn with_schema(mut self, input_schema: Value) -> Self {
        self.input_schema = input_schema;
        self
    }
}

/// A callable remote capability.
///
/// `context` is the run's shared context; tools may write into it.
#[async_trait]
pub trait RemoteTool: Send + Sync {
    fn spec(&self) -> &ToolSpec;

    fn name(&self) -> &str {
        &self.spec().name
    }

    async fn call(&self, arguments: Value, context: &OmaContext) -> Result<String, OmaError>;
}

/// Lookup of remote tools by name.
pub trait ToolRegistry: Send + Sync {
    fn resolve(&self, name: &str) -> Option<Arc<dyn RemoteTool>>;

    /// Specs of every known tool, sorted by name.
    fn specs(&self) -> Vec<ToolSpec>;
}

/// Drop repeated names, keeping first-seen order.
pub fn dedup_names<I, S>(names: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    names
        .into_iter()
        .filter_map(|name| {
            let name = name.as_ref();
            seen.insert(name.to_string()).then(|| name.to_string())
        })
        .collect()
}

/// Resolve every name or none of them.
pub fn resolve_all<S: AsRef<str>>(
    registry: &dyn ToolRegistry,
    names: &[S],
) -> Result<Vec<Arc<dyn RemoteTool>>, OmaError> {
    let mut resolved = Vec::new();
    let mut unknown = Vec::new();
    for name in dedup_names(names) {
        match registry.resolve(&name) {
            Some(tool) => resolved.push(tool),
            None => unknown.push(name),
        }
    }
    if unknown.is_empty() {
        Ok(resolved)
    } else {
        Err(OmaError::ToolResolution { names: unknown })
    }
}

type ToolFn = dyn Fn(Value, &OmaContext) -> Result<String, OmaError> + Send + Sync;

/// Tool backed by a local closure. Counts its invocations.
pub struct FnTool {
    spec: ToolSpec,
    handler: Box<ToolFn>,
    calls: AtomicUsize,
}

impl FnTool {
    pub fn new<F>(spec: ToolSpec, handler: F) -> Self
    where
        F: Fn(Value, &OmaContext) -> Result<String, OmaError> + Send + Sync + 'static,
    {
        Self {
            spec,
            handler: Box::new(handler),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteTool for FnTool {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    async fn call(&self, arguments: Value, context: &OmaContext) -> Result<String, OmaError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.handler)(arguments, context)
    }
}

/// Registry held entirely in memory.
#[derive(Default, Clone)]
pub struct InMemoryToolRegistry {
    tools: Arc<DashMap<String, Arc<dyn RemoteTool>>>,
}

impl InMemoryToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, tool: Arc<dyn RemoteTool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn with_tool(self, tool: Arc<dyn RemoteTool>) -> Self {
        self.register(tool);
        self
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl ToolRegistry for InMemoryToolRegistry {
    fn resolve(&self, name: &str) -> Option<Arc<dyn RemoteTool>> {
        self.tools.get(name).map(|entry| Arc::clone(entry.value()))
    }

    fn specs(&self) -> Vec<ToolSpec> {
        let sorted: BTreeMap<String, ToolSpec> = self
            .tools
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().spec().clone()))
            .collect();
        sorted.into_values().collect()
    }
}
