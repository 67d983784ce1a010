//! Shared MCP transport abstractions.
//!
//! Implementations normalize protocol differences across stdio, the legacy
//! event-stream transport and streamable HTTP so the negotiator, registry and
//! invoker can treat every live connection the same way.

use super::descriptor::TransportKind;
use async_trait::async_trait;
use rust_mcp_schema::schema_utils::{
    ClientMessage, FromMessage, MessageFromClient, NotificationFromClient, RequestFromClient,
    ServerJsonrpcRequest, ServerMessage,
};
use rust_mcp_schema::RequestId;
use serde_json::Value;
use std::time::Duration;

pub mod event_stream;
pub mod stdio;
pub mod streamable_http;

/// JSON-RPC code used by servers to indicate unsupported methods.
pub const MCP_METHOD_NOT_FOUND: i64 = -32601;

pub const MCP_JSON_CONTENT_TYPE: &str = "application/json";
pub const MCP_JSON_AND_SSE_ACCEPT: &str = "application/json, text/event-stream";
pub const MCP_PROTOCOL_VERSION_HEADER: &str = "MCP-Protocol-Version";
pub const MCP_SESSION_ID_HEADER: &str = "mcp-session-id";

const MCP_HTTP_POOL_IDLE_TIMEOUT_SECONDS: u64 = 90;
const MCP_HTTP_POOL_MAX_IDLE_PER_HOST: usize = 8;

/// Time limits applied by every transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportTimeouts {
    pub connect: Duration,
    pub request: Duration,
}

impl Default for TransportTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            request: Duration::from_secs(60),
        }
    }
}

#[async_trait]
/// A live, established channel to one MCP server.
///
/// Methods take `&self` so one connection can serve concurrent invocations;
/// implementations keep their own interior locking.
pub trait McpTransport: Send + Sync {
    fn kind(&self) -> TransportKind;

    async fn send_request(&self, request: RequestFromClient) -> Result<ServerMessage, String>;

    async fn send_notification(&self, notification: NotificationFromClient) -> Result<(), String>;

    /// Releases the underlying channel. Calling it twice is harmless.
    async fn close(&self) -> Result<(), String>;

    /// Records the protocol version agreed during initialize.
    fn set_protocol_version(&self, _protocol_version: &str) {}
}

/// Normalized outcome for metadata list calls across transports.
#[derive(Debug)]
pub enum ListFetch<T> {
    Ok(T),
    MethodNotFound,
    Err(String),
}

/// Converts a transport response into a list-fetch status while preserving
/// "method not found" as a soft capability signal.
pub fn list_fetch_from_response<T>(
    response: Result<ServerMessage, String>,
    parse: impl FnOnce(ServerMessage) -> Result<T, String>,
) -> ListFetch<T> {
    match response {
        Ok(message) if is_method_not_found(&message) => ListFetch::MethodNotFound,
        Ok(message) => match parse(message) {
            Ok(list) => ListFetch::Ok(list),
            Err(err) => ListFetch::Err(err),
        },
        Err(err) => ListFetch::Err(err),
    }
}

/// Returns true when a server reports the JSON-RPC method-not-found code.
pub fn is_method_not_found(message: &ServerMessage) -> bool {
    matches!(
        message,
        ServerMessage::Error(error) if error.error.code == MCP_METHOD_NOT_FOUND
    )
}

pub(crate) fn request_message(
    request: RequestFromClient,
    request_id: RequestId,
) -> Result<ClientMessage, String> {
    ClientMessage::from_message(
        MessageFromClient::RequestFromClient(request),
        Some(request_id),
    )
    .map_err(|err| err.to_string())
}

pub(crate) fn notification_message(
    notification: NotificationFromClient,
) -> Result<ClientMessage, String> {
    ClientMessage::from_message(
        MessageFromClient::NotificationFromClient(notification),
        None,
    )
    .map_err(|err| err.to_string())
}

/// Reply for a request the server sent to us. Only `ping` is supported; the
/// relay does not offer sampling, roots or elicitation.
pub(crate) fn reply_to_server_request(request: &ServerJsonrpcRequest) -> Value {
    let id = serde_json::to_value(request.request_id()).unwrap_or(Value::Null);
    if request.method() == "ping" {
        serde_json::json!({"jsonrpc": "2.0", "id": id, "result": {}})
    } else {
        serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {
                "code": MCP_METHOD_NOT_FOUND,
                "message": format!("Method not supported by client: {}", request.method()),
            }
        })
    }
}

/// Builds the shared HTTP client for network transports. No total request
/// timeout is set here because event streams stay open indefinitely; callers
/// apply `TransportTimeouts::request` per request.
pub(crate) fn build_mcp_http_client(timeouts: TransportTimeouts) -> Result<reqwest::Client, String> {
    reqwest::Client::builder()
        .connect_timeout(timeouts.connect)
        .pool_idle_timeout(Duration::from_secs(MCP_HTTP_POOL_IDLE_TIMEOUT_SECONDS))
        .pool_max_idle_per_host(MCP_HTTP_POOL_MAX_IDLE_PER_HOST)
        .build()
        .map_err(|err| format!("Failed to build HTTP client: {err}"))
}

pub(crate) fn apply_custom_headers(
    mut request: reqwest::RequestBuilder,
    headers: &std::collections::HashMap<String, String>,
) -> reqwest::RequestBuilder {
    for (name, value) in headers {
        request = request.header(name.as_str(), value.as_str());
    }
    request
}

/// Splits a byte stream into trimmed, non-empty SSE lines across chunk
/// boundaries.
#[derive(Default)]
pub struct SseLineBuffer {
    buffer: Vec<u8>,
}

impl SseLineBuffer {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        self.drain_lines(false)
    }

    pub fn finish(&mut self) -> Vec<String> {
        self.drain_lines(true)
    }

    fn drain_lines(&mut self, flush: bool) -> Vec<String> {
        let mut lines = Vec::new();
        let mut search_index = 0;

        while let Some(relative_pos) = memchr::memchr(b'\n', &self.buffer[search_index..]) {
            let newline_index = search_index + relative_pos;
            if let Ok(text) = std::str::from_utf8(&self.buffer[search_index..newline_index]) {
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    lines.push(trimmed.to_string());
                }
            }
            search_index = newline_index + 1;
        }

        if flush {
            if let Ok(text) = std::str::from_utf8(&self.buffer[search_index..]) {
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    lines.push(trimmed.to_string());
                }
            }
            self.buffer.clear();
        } else if search_index > 0 {
            self.buffer.drain(..search_index);
        }

        lines
    }
}

pub fn is_event_stream_content_type(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .map(str::trim)
        .is_some_and(|value| value.eq_ignore_ascii_case("text/event-stream"))
}

pub fn sse_data_payload(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim)
}

pub fn sse_event_name(line: &str) -> Option<&str> {
    line.strip_prefix("event:").map(str::trim)
}
