//! Tool calls, prompt resolution and resource reads against a connected
//! server, normalized into one content envelope.

use super::error::InvocationError;
use super::protocol::parse_response_value;
use super::registry::{Connection, ConnectionRegistry};
use rust_mcp_schema::schema_utils::RequestFromClient;
use rust_mcp_schema::{CallToolRequestParams, GetPromptRequestParams, ReadResourceRequestParams};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default, alias = "args")]
    pub arguments: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentItem {
    Text {
        text: String,
    },
    Image {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        #[serde(default, rename = "mimeType", skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
    },
    Resource {
        uri: String,
        #[serde(default, rename = "mimeType", skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
    },
}

impl ContentItem {
    pub fn text(text: impl Into<String>) -> Self {
        ContentItem::Text { text: text.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    pub content: Vec<ContentItem>,
    #[serde(default)]
    pub is_error: bool,
}

impl ToolResult {
    /// Error-flagged result carrying a single text item.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: vec![ContentItem::text(message)],
            is_error: true,
        }
    }

    /// Concatenated text of every text item.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|item| match item {
                ContentItem::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Reads connection handles from the registry; never mutates it.
#[derive(Clone)]
pub struct ToolInvoker {
    registry: Arc<ConnectionRegistry>,
}

impl ToolInvoker {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    async fn connection(&self, server_id: &str) -> Result<Arc<Connection>, InvocationError> {
        self.registry
            .get(server_id)
            .await
            .ok_or_else(|| InvocationError::NotConnected {
                server_id: server_id.to_string(),
            })
    }

    pub async fn call_tool(
        &self,
        server_id: &str,
        call: &ToolCall,
    ) -> Result<ToolResult, InvocationError> {
        let connection = self.connection(server_id).await?;
        debug!(server_id = %server_id, tool = %call.name, "Calling MCP tool");

        let mut params = CallToolRequestParams::new(&call.name);
        if !call.arguments.is_empty() {
            params = params.with_arguments(call.arguments.clone());
        }
        let value = request_value(&connection, RequestFromClient::CallToolRequest(params))
            .await
            .map_err(|message| InvocationError::Tool {
                server_id: server_id.to_string(),
                tool: call.name.clone(),
                message,
            })?;

        let result = ToolResult {
            content: normalize_items(value.get("content")),
            is_error: truthy(value.get("isError")),
        };
        debug!(server_id = %server_id, tool = %call.name, is_error = result.is_error, "MCP tool finished");
        Ok(result)
    }

    /// Every argument is sent as a string; prompt arguments are strings on
    /// the wire.
    pub async fn get_prompt(
        &self,
        server_id: &str,
        name: &str,
        arguments: &Map<String, Value>,
    ) -> Result<ToolResult, InvocationError> {
        let connection = self.connection(server_id).await?;
        debug!(server_id = %server_id, prompt = %name, "Resolving MCP prompt");

        let arguments: HashMap<String, String> = arguments
            .iter()
            .map(|(key, value)| (key.clone(), stringify_value(value)))
            .collect();
        let params = GetPromptRequestParams {
            name: name.to_string(),
            arguments: (!arguments.is_empty()).then_some(arguments),
            meta: None,
        };
        let value = request_value(&connection, RequestFromClient::GetPromptRequest(params))
            .await
            .map_err(|message| InvocationError::Prompt {
                server_id: server_id.to_string(),
                prompt: name.to_string(),
                message,
            })?;

        let content = value
            .get("messages")
            .and_then(Value::as_array)
            .map(|messages| {
                messages
                    .iter()
                    .map(|message| {
                        ContentItem::text(stringify_value(
                            message.get("content").unwrap_or(&Value::Null),
                        ))
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(ToolResult {
            content,
            is_error: false,
        })
    }

    pub async fn read_resource(
        &self,
        server_id: &str,
        uri: &str,
    ) -> Result<ToolResult, InvocationError> {
        let connection = self.connection(server_id).await?;
        debug!(server_id = %server_id, uri = %uri, "Reading MCP resource");

        let params = ReadResourceRequestParams {
            meta: None,
            uri: uri.to_string(),
        };
        let value = request_value(&connection, RequestFromClient::ReadResourceRequest(params))
            .await
            .map_err(|message| InvocationError::Resource {
                server_id: server_id.to_string(),
                uri: uri.to_string(),
                message,
            })?;

        Ok(ToolResult {
            content: normalize_items(value.get("contents")),
            is_error: false,
        })
    }
}

async fn request_value(connection: &Connection, request: RequestFromClient) -> Result<Value, String> {
    let response = connection.transport.send_request(request).await?;
    parse_response_value(response)
}

/// Strings pass through; anything else becomes its JSON text.
fn stringify_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn normalize_items(items: Option<&Value>) -> Vec<ContentItem> {
    items
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .map(|item| ContentItem::text(stringify_value(item)))
                .collect()
        })
        .unwrap_or_default()
}

fn truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(flag)) => *flag,
        Some(Value::Number(number)) => number.as_f64().is_some_and(|n| n != 0.0 && !n.is_nan()),
        Some(Value::String(text)) => !text.is_empty(),
        Some(Value::Array(_)) | Some(Value::Object(_)) => true,
    }
}
