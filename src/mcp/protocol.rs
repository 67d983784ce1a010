//! Initialize handshake and response decoding shared by every transport.

use super::transport::McpTransport;
use rust_mcp_schema::schema_utils::{NotificationFromClient, RequestFromClient, ServerMessage};
use rust_mcp_schema::{
    ClientCapabilities, Implementation, InitializeRequestParams, InitializeResult, RpcError,
    LATEST_PROTOCOL_VERSION,
};
use serde::Serialize;
use serde_json::Value;

/// What a server reported about itself during initialize.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
    pub protocol_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    pub capabilities: Value,
}

impl ServerInfo {
    fn from_initialize(result: InitializeResult) -> Self {
        Self {
            name: result.server_info.name,
            version: result.server_info.version,
            protocol_version: result.protocol_version,
            instructions: result.instructions,
            capabilities: serde_json::to_value(&result.capabilities).unwrap_or(Value::Null),
        }
    }
}

pub(crate) fn client_details() -> InitializeRequestParams {
    InitializeRequestParams {
        capabilities: ClientCapabilities::default(),
        client_info: Implementation {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            title: Some("MCP Relay".to_string()),
            description: Some("Relays LLM tool calls to MCP servers".to_string()),
            icons: Vec::new(),
            website_url: None,
        },
        meta: None,
        protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
    }
}

/// Runs initialize followed by the initialized notification.
pub async fn initialize(transport: &dyn McpTransport) -> Result<ServerInfo, String> {
    let response = transport
        .send_request(RequestFromClient::InitializeRequest(client_details()))
        .await?;
    let result = parse_initialize_result(response)?;
    transport.set_protocol_version(&result.protocol_version);
    transport
        .send_notification(NotificationFromClient::InitializedNotification(None))
        .await?;
    Ok(ServerInfo::from_initialize(result))
}

pub(crate) fn parse_initialize_result(message: ServerMessage) -> Result<InitializeResult, String> {
    let result: InitializeResult = parse_response(message)?;
    if result.protocol_version.trim().is_empty() {
        return Err("Unexpected initialize response.".to_string());
    }
    Ok(result)
}

pub(crate) fn parse_response<T: serde::de::DeserializeOwned>(
    message: ServerMessage,
) -> Result<T, String> {
    let value = parse_response_value(message)?;
    serde_json::from_value::<T>(value).map_err(|err| err.to_string())
}

pub(crate) fn parse_response_value(message: ServerMessage) -> Result<Value, String> {
    match message {
        ServerMessage::Response(response) => {
            serde_json::to_value(&response.result).map_err(|err| err.to_string())
        }
        ServerMessage::Error(error) => Err(format_rpc_error(&error.error)),
        other => Err(format_unexpected_server_message(&other)),
    }
}

pub(crate) fn format_unexpected_server_message(message: &ServerMessage) -> String {
    format!("Unexpected MCP server message: {message:?}")
}

pub(crate) fn format_rpc_error(error: &RpcError) -> String {
    let mut output = format!("MCP error {}: {}", error.code, error.message);
    if let Some(data) = &error.data {
        let details = data
            .get("details")
            .and_then(|value| value.as_str())
            .map(|value| value.to_string())
            .or_else(|| data.as_str().map(|value| value.to_string()))
            .or_else(|| serde_json::to_string_pretty(data).ok());

        if let Some(details) = details {
            if !details.is_empty() {
                output.push('\n');
                output.push_str(&details);
            }
        }
    }
    output
}
