//! HTTP JSON-RPC 2.0 client for a remote MCP tool server.
//!
//! Speaks the streamable HTTP transport: the session id handed out on
//! `initialize` is echoed on every later message, and replies may arrive
//! either as plain JSON or as a `text/event-stream`.

use std::sync::{Arc, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use super::{RemoteTool, ToolRegistry, ToolSpec};
use crate::context::OmaContext;
use crate::error::OmaError;

const MCP_PROTOCOL_VERSION: &str = "2024-11-05";
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const SESSION_HEADER: &str = "mcp-session-id";
const ACCEPTED_TYPES: &str = "application/json, text/event-stream";
const EVENT_STREAM: &str = "text/event-stream";

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct ListToolsResult {
    #[serde(default)]
    tools: Vec<ToolSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CallToolResult {
    #[serde(default)]
    content: Vec<ContentItem>,
    #[serde(default)]
    is_error: bool,
    #[serde(default)]
    structured_content: Option<StructuredContent>,
}

#[derive(Debug, Deserialize)]
struct ContentItem {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StructuredContent {
    #[serde(default)]
    context_updates: Map<String, Value>,
}

impl CallToolResult {
    fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|item| item.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Pick the reply to request `id` out of a server-sent event stream.
///
/// Events without a matching id (progress notifications, server requests)
/// are skipped; multi-line `data:` fields are joined with newlines.
fn response_from_event_stream(stream: &str, id: u64) -> Option<JsonRpcResponse> {
    let stream = stream.replace("\r\n", "\n");
    stream
        .split("\n\n")
        .filter_map(|event| {
            let data: Vec<&str> = event
                .lines()
                .filter_map(|line| line.strip_prefix("data:"))
                .map(|data| data.strip_prefix(' ').unwrap_or(data))
                .collect();
            if data.is_empty() {
                return None;
            }
            serde_json::from_str::<JsonRpcResponse>(&data.join("\n")).ok()
        })
        .filter(|message| message.id.as_ref().and_then(Value::as_u64) == Some(id))
        .last()
}

struct McpClient {
    endpoint: String,
    http: reqwest::Client,
    request_id: AtomicU64,
    session_id: RwLock<Option<String>>,
}

impl McpClient {
    fn session_id(&self) -> Option<String> {
        self.session_id.read().ok().and_then(|session| session.clone())
    }

    fn remember_session(&self, headers: &HeaderMap) {
        let Some(value) = headers.get(SESSION_HEADER).and_then(|value| value.to_str().ok()) else {
            return;
        };
        if let Ok(mut session) = self.session_id.write() {
            if session.as_deref() != Some(value) {
                debug!(session_id = value, "tool server assigned a session");
                *session = Some(value.to_string());
            }
        }
    }

    fn post<T: Serialize>(&self, body: &T) -> reqwest::RequestBuilder {
        let request = self
            .http
            .post(&self.endpoint)
            .header(ACCEPT, ACCEPTED_TYPES)
            .json(body);
        match self.session_id() {
            Some(session) => request.header(SESSION_HEADER, session),
            None => request,
        }
    }

    async fn send_jsonrpc(&self, method: &str, params: Option<Value>) -> Result<Value, OmaError> {
        let id = self.request_id.fetch_add(1, Ordering::SeqCst);
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id,
            method,
            params,
        };

        let response = self
            .post(&request)
            .send()
            .await
            .map_err(|err| OmaError::backend(format!("{method} request failed: {err}")))?;
        self.remember_session(response.headers());

        let status = response.status();
        if !status.is_success() {
            return Err(OmaError::backend(format!("{method} returned HTTP {status}")));
        }

        let streamed = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.starts_with(EVENT_STREAM))
            .unwrap_or(false);
        let text = response
            .text()
            .await
            .map_err(|err| OmaError::backend(format!("{method} response could not be read: {err}")))?;

        let body = if streamed {
            response_from_event_stream(&text, id).ok_or_else(|| {
                OmaError::backend(format!("{method} event stream ended without a reply"))
            })?
        } else {
            serde_json::from_str::<JsonRpcResponse>(&text)
                .map_err(|err| OmaError::backend(format!("{method} returned invalid JSON: {err}")))?
        };

        if let Some(error) = body.error {
            return Err(OmaError::backend(format!(
                "{method} failed with JSON-RPC error {}: {}",
                error.code, error.message
            )));
        }

        body.result
            .ok_or_else(|| OmaError::backend(format!("{method} returned no result")))
    }

    async fn notify(&self, method: &str) {
        let body = json!({ "jsonrpc": "2.0", "method": method });
        if let Err(err) = self.post(&body).send().await {
            debug!(method, error = %err, "notification not delivered");
        }
    }
}

struct McpTool {
    spec: ToolSpec,
    client: Arc<McpClient>,
}

#[async_trait]
impl RemoteTool for McpTool {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    async fn call(&self, arguments: Value, context: &OmaContext) -> Result<String, OmaError> {
        let params = json!({
            "name": self.spec.name,
            "arguments": arguments,
            "_meta": { "run_id": context.run_id() },
        });
        let raw = self.client.send_jsonrpc("tools/call", Some(params)).await?;
        let result: CallToolResult = serde_json::from_value(raw).map_err(|err| {
            OmaError::backend(format!("tool `{}` returned a malformed result: {err}", self.spec.name))
        })?;

        if result.is_error {
            return Err(OmaError::backend(format!(
                "tool `{}` failed: {}",
                self.spec.name,
                result.text()
            )));
        }

        if let Some(structured) = &result.structured_content {
            for (key, value) in &structured.context_updates {
                context.set_shared_data(key.clone(), value);
            }
        }

        Ok(result.text())
    }
}

/// Tool registry backed by one MCP server.
///
/// The tool list is fetched on [`connect`](Self::connect) and cached, so
/// name resolution never touches the network.
pub struct McpToolRegistry {
    server_name: String,
    client: Arc<McpClient>,
    tools: DashMap<String, Arc<McpTool>>,
}

impl McpToolRegistry {
    pub async fn connect(
        endpoint: impl Into<String>,
        server_name: impl Into<String>,
    ) -> Result<Self, OmaError> {
        let http = reqwest::Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()
            .map_err(|err| OmaError::backend(format!("failed to build HTTP client: {err}")))?;
        let registry = Self {
            server_name: server_name.into(),
            client: Arc::new(McpClient {
                endpoint: endpoint.into().trim_end_matches('/').to_string(),
                http,
                request_id: AtomicU64::new(1),
                session_id: RwLock::new(None),
            }),
            tools: DashMap::new(),
        };

        let params = json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": { "name": "oma", "version": env!("CARGO_PKG_VERSION") },
        });
        registry
            .client
            .send_jsonrpc("initialize", Some(params))
            .await?;
        registry.client.notify("notifications/initialized").await;

        registry.refresh().await?;
        info!(
            server = %registry.server_name,
            endpoint = %registry.client.endpoint,
            tools = registry.tools.len(),
            "connected to tool server"
        );
        Ok(registry)
    }

    /// Re-read the server's tool list.
    pub async fn refresh(&self) -> Result<usize, OmaError> {
        let raw = self.client.send_jsonrpc("tools/list", None).await?;
        let listed: ListToolsResult = serde_json::from_value(raw)
            .map_err(|err| OmaError::backend(format!("tools/list returned a malformed result: {err}")))?;

        self.tools.clear();
        for spec in listed.tools {
            if spec.name.is_empty() {
                warn!(server = %self.server_name, "skipping tool without a name");
                continue;
            }
            let tool = Arc::new(McpTool {
                spec,
                client: Arc::clone(&self.client),
            });
            self.tools.insert(tool.spec.name.clone(), tool);
        }
        Ok(self.tools.len())
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn endpoint(&self) -> &str {
        &self.client.endpoint
    }

    /// Session assigned by the server on `initialize`, if it uses one.
    pub fn session_id(&self) -> Option<String> {
        self.client.session_id()
    }
}

impl ToolRegistry for McpToolRegistry {
    fn resolve(&self, name: &str) -> Option<Arc<dyn RemoteTool>> {
        self.tools
            .get(name)
            .map(|entry| Arc::clone(entry.value()) as Arc<dyn RemoteTool>)
    }

    fn specs(&self) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self
            .tools
            .iter()
            .map(|entry| entry.value().spec.clone())
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_result_joins_text_and_reads_updates() {
        let raw = json!({
            "content": [
                { "type": "text", "text": "overview created" },
                { "type": "image", "data": "..." },
                { "type": "text", "text": "id=SCO-1" }
            ],
            "structuredContent": {
                "context_updates": { "structured_content_overview_id": "SCO-1" }
            }
        });
        let result: CallToolResult = serde_json::from_value(raw).unwrap();
        assert!(!result.is_error);
        assert_eq!(result.text(), "overview created\nid=SCO-1");
        let updates = result.structured_content.unwrap().context_updates;
        assert_eq!(updates["structured_content_overview_id"], json!("SCO-1"));
    }

    #[test]
    fn event_stream_reply_is_matched_by_id() {
        let stream = concat!(
            "event: message\r\n",
            "data: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\",\"params\":{\"progress\":1}}\r\n",
            "\r\n",
            "event: message\n",
            "data: {\"jsonrpc\":\"2.0\",\"id\":7,\n",
            "data: \"result\":{\"tools\":[]}}\n",
            "\n"
        );
        let reply = response_from_event_stream(stream, 7).expect("reply");
        assert_eq!(reply.result, Some(json!({ "tools": [] })));
        assert!(response_from_event_stream(stream, 8).is_none());
    }

    #[test]
    fn tool_list_defaults_missing_schema() {
        let raw = json!({ "tools": [{ "name": "get_pdf_pages" }] });
        let listed: ListToolsResult = serde_json::from_value(raw).unwrap();
        assert_eq!(listed.tools[0].name, "get_pdf_pages");
        assert_eq!(listed.tools[0].input_schema["type"], json!("object"));
    }
}
