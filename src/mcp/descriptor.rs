//! Endpoint descriptors: declarative configuration for one tool provider.
//!
//! A descriptor is immutable once a connection has been derived from it; the
//! configuration collaborator replaces it wholesale on re-save.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointDescriptor {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(flatten)]
    pub transport: TransportConfig,
    /// Whether startup should connect this endpoint.
    #[serde(default = "default_enabled", alias = "isActive")]
    pub enabled: bool,
}

/// One variant per transport kind, each carrying only the fields it uses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum TransportConfig {
    #[serde(alias = "stdio")]
    Process {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    #[serde(alias = "sse")]
    EventStream {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
    Http {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Process,
    EventStream,
    Http,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TransportKind::Process => "process",
            TransportKind::EventStream => "eventstream",
            TransportKind::Http => "http",
        };
        f.write_str(label)
    }
}

fn default_enabled() -> bool {
    true
}

impl EndpointDescriptor {
    pub fn process(id: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self::with_transport(
            id,
            TransportConfig::Process {
                command: command.into(),
                args,
                env: HashMap::new(),
            },
        )
    }

    pub fn event_stream(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self::with_transport(
            id,
            TransportConfig::EventStream {
                url: url.into(),
                headers: HashMap::new(),
            },
        )
    }

    pub fn http(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self::with_transport(
            id,
            TransportConfig::Http {
                url: url.into(),
                headers: HashMap::new(),
            },
        )
    }

    fn with_transport(id: impl Into<String>, transport: TransportConfig) -> Self {
        Self {
            id: id.into(),
            name: None,
            description: None,
            transport,
            enabled: true,
        }
    }

    pub fn kind(&self) -> TransportKind {
        match self.transport {
            TransportConfig::Process { .. } => TransportKind::Process,
            TransportConfig::EventStream { .. } => TransportKind::EventStream,
            TransportConfig::Http { .. } => TransportKind::Http,
        }
    }

    /// Name for log lines and messages; falls back to the id.
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or(&self.id)
    }

    /// Header overrides, if the transport kind has any.
    pub fn headers(&self) -> Option<&HashMap<String, String>> {
        match &self.transport {
            TransportConfig::Process { .. } => None,
            TransportConfig::EventStream { headers, .. } | TransportConfig::Http { headers, .. } => {
                Some(headers)
            }
        }
    }

    pub fn has_headers(&self) -> bool {
        self.headers().is_some_and(|headers| !headers.is_empty())
    }

    /// Checks the fields every transport needs before anything is spawned or dialed.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("Endpoint id must not be empty.".to_string());
        }
        match &self.transport {
            TransportConfig::Process { command, .. } => {
                if command.trim().is_empty() {
                    return Err("A command is required for the process transport.".to_string());
                }
            }
            TransportConfig::EventStream { url, .. } | TransportConfig::Http { url, .. } => {
                let parsed = reqwest::Url::parse(url)
                    .map_err(|err| format!("Invalid {} URL `{url}`: {err}", self.kind()))?;
                if !matches!(parsed.scheme(), "http" | "https") {
                    return Err(format!(
                        "Unsupported URL scheme `{}` for the {} transport.",
                        parsed.scheme(),
                        self.kind()
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_process_descriptor_with_stdio_alias() {
        let descriptor: EndpointDescriptor = serde_json::from_value(serde_json::json!({
            "id": "t1",
            "transport": "stdio",
            "command": "echo-tool",
            "args": ["--quiet"],
            "isActive": false
        }))
        .expect("descriptor should parse");

        assert_eq!(descriptor.kind(), TransportKind::Process);
        assert!(!descriptor.enabled);
        match descriptor.transport {
            TransportConfig::Process { command, args, env } => {
                assert_eq!(command, "echo-tool");
                assert_eq!(args, vec!["--quiet".to_string()]);
                assert!(env.is_empty());
            }
            other => panic!("expected process transport, got {other:?}"),
        }
    }

    #[test]
    fn parses_network_descriptors_from_toml() {
        let raw = r#"
            id = "remote"
            transport = "http"
            url = "https://mcp.example.com/mcp"

            [headers]
            Authorization = "Bearer abc"
        "#;
        let descriptor: EndpointDescriptor = toml::from_str(raw).expect("toml should parse");
        assert_eq!(descriptor.kind(), TransportKind::Http);
        assert!(descriptor.enabled);
        assert!(descriptor.has_headers());

        let sse: EndpointDescriptor = serde_json::from_value(serde_json::json!({
            "id": "events",
            "transport": "sse",
            "url": "https://mcp.example.com/sse"
        }))
        .expect("descriptor should parse");
        assert_eq!(sse.kind(), TransportKind::EventStream);
        assert!(!sse.has_headers());
    }

    #[test]
    fn serializes_transport_tag_in_canonical_form() {
        let descriptor = EndpointDescriptor::event_stream("events", "https://example.com/sse");
        let value = serde_json::to_value(&descriptor).expect("serialize");
        assert_eq!(value["transport"], "eventstream");
        assert_eq!(value["url"], "https://example.com/sse");
    }

    #[test]
    fn validate_rejects_missing_fields() {
        assert!(EndpointDescriptor::process("t1", " ", Vec::new())
            .validate()
            .is_err());
        assert!(EndpointDescriptor::http("t2", "not a url").validate().is_err());
        assert!(EndpointDescriptor::http("t3", "ftp://example.com")
            .validate()
            .is_err());
        assert!(EndpointDescriptor::process("", "echo-tool", Vec::new())
            .validate()
            .is_err());
        assert!(EndpointDescriptor::http("ok", "http://127.0.0.1:9000/mcp")
            .validate()
            .is_ok());
    }

    #[test]
    fn display_name_falls_back_to_id() {
        let mut descriptor = EndpointDescriptor::process("t1", "echo-tool", Vec::new());
        assert_eq!(descriptor.display_name(), "t1");
        descriptor.name = Some("Echo".to_string());
        assert_eq!(descriptor.display_name(), "Echo");
    }
}
