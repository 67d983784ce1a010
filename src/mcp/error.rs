//! Error taxonomy for connection setup and invocation.
//!
//! Transports report plain `String` errors; these types wrap them at the
//! component boundaries so callers can classify failures.

use super::descriptor::TransportKind;
use thiserror::Error;

/// JSON-RPC code servers use when the session closed under the request.
pub const MCP_CONNECTION_CLOSED: i64 = -32000;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("Invalid endpoint descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("Failed to start process `{command}`: {message}")]
    Spawn { command: String, message: String },

    #[error("{kind} transport failed: {message}")]
    Handshake { kind: TransportKind, message: String },

    #[error("Streamable HTTP failed ({primary}); eventstream fallback failed: {fallback}")]
    FallbackFailed { primary: String, fallback: String },
}

/// Every capability listing was rejected.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct CatalogUnavailable(pub String);

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RefreshError {
    #[error("Server `{server_id}` is not connected.")]
    NotConnected { server_id: String },

    #[error("Capability refresh for `{server_id}` failed: {source}")]
    Unavailable {
        server_id: String,
        #[source]
        source: CatalogUnavailable,
    },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InvocationError {
    #[error("Server `{server_id}` is not connected.")]
    NotConnected { server_id: String },

    #[error("Tool call `{tool}` on `{server_id}` failed: {message}")]
    Tool {
        server_id: String,
        tool: String,
        message: String,
    },

    #[error("Prompt `{prompt}` on `{server_id}` failed: {message}")]
    Prompt {
        server_id: String,
        prompt: String,
        message: String,
    },

    #[error("Reading resource `{uri}` on `{server_id}` failed: {message}")]
    Resource {
        server_id: String,
        uri: String,
        message: String,
    },
}

/// Human-facing classification of a failed connect, probe or catalog step.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectFailure {
    #[error("The connection closed immediately. Check that the server is running correctly.")]
    ConnectionClosed,

    #[error("{hint}")]
    Unauthorized { hint: String },

    #[error("{0}")]
    Other(String),
}

impl ConnectFailure {
    /// Derives a failure class from raw error text, with transport-specific
    /// remediation for authentication failures.
    pub fn classify(kind: TransportKind, raw: &str) -> Self {
        if raw.contains(&MCP_CONNECTION_CLOSED.to_string())
            || raw.to_ascii_lowercase().contains("connection closed")
        {
            return ConnectFailure::ConnectionClosed;
        }

        if let Some(status) = auth_status(raw) {
            let hint = match kind {
                TransportKind::EventStream => format!(
                    "Event-stream authentication failed ({status}). The eventstream transport \
                     cannot send headers; embed the credential in the URL or use the http \
                     transport."
                ),
                TransportKind::Http => format!(
                    "HTTP authentication failed ({status}). Check that the headers carry valid \
                     credentials."
                ),
                TransportKind::Process => {
                    format!("Authentication failed ({status}). Check the server configuration.")
                }
            };
            return ConnectFailure::Unauthorized { hint };
        }

        let trimmed = raw.trim();
        if trimmed.is_empty() {
            ConnectFailure::Other("An unknown error occurred while connecting.".to_string())
        } else {
            ConnectFailure::Other(trimmed.to_string())
        }
    }
}

/// 401 or 403 appearing as a standalone number, not inside a port or id.
fn auth_status(raw: &str) -> Option<&'static str> {
    raw.split(|c: char| !c.is_ascii_alphanumeric())
        .find_map(|token| match token {
            "401" => Some("401"),
            "403" => Some("403"),
            _ => None,
        })
}
