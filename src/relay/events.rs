//! Client-facing stream events and their wire framing.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamErrorCode {
    NoApiKey,
    NoPrompt,
    Unauthorized,
    RateLimit,
    UpstreamError,
    InternalError,
}

impl StreamErrorCode {
    /// Maps an upstream HTTP status onto the code reported to the client.
    /// A missing status is an internal failure.
    pub fn from_status(status: Option<u16>) -> Self {
        match status {
            Some(401) | Some(403) => StreamErrorCode::Unauthorized,
            Some(429) => StreamErrorCode::RateLimit,
            Some(status) if status >= 500 => StreamErrorCode::UpstreamError,
            _ => StreamErrorCode::InternalError,
        }
    }
}

/// A tool call announced to the client. `id` keys the out-of-band result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Text {
        delta: String,
    },
    FunctionCalls {
        calls: Vec<FunctionCall>,
    },
    McpInfo {
        #[serde(rename = "enabledServers")]
        enabled_servers: Vec<String>,
    },
    Error {
        code: StreamErrorCode,
        message: String,
    },
    Done,
}

impl StreamEvent {
    pub fn error(code: StreamErrorCode, message: impl Into<String>) -> Self {
        StreamEvent::Error {
            code,
            message: message.into(),
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, StreamEvent::Done)
    }
}

/// Frames one event as `data: <json>` followed by a blank line.
pub fn encode_event(event: &StreamEvent) -> String {
    let json = serde_json::to_string(event).unwrap_or_else(|_| {
        r#"{"type":"error","code":"INTERNAL_ERROR","message":"Failed to encode event"}"#
            .to_string()
    });
    format!("data: {json}\n\n")
}
