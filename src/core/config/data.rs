use crate::mcp::transport::TransportTimeouts;
use crate::mcp::EndpointDescriptor;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_BIND: &str = "127.0.0.1:3917";

pub const ENV_API_KEY: &str = "LLM_API_KEY";
pub const ENV_MODEL: &str = "LLM_MODEL";
pub const ENV_BASE_URL: &str = "LLM_BASE_URL";

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct TimeoutConfig {
    pub connect_secs: u64,
    pub request_secs: u64,
    /// How long an out-of-band result lookup waits for a dispatched call.
    pub tool_result_wait_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: 10,
            request_secs: 60,
            tool_result_wait_secs: 120,
        }
    }
}

impl TimeoutConfig {
    pub fn transport(&self) -> TransportTimeouts {
        TransportTimeouts {
            connect: Duration::from_secs(self.connect_secs.max(1)),
            request: Duration::from_secs(self.request_secs.max(1)),
        }
    }

    pub fn tool_result_wait(&self) -> Duration {
        Duration::from_secs(self.tool_result_wait_secs)
    }
}

/// Contents of `config.toml`. Every field is optional.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
pub struct Config {
    pub model: Option<String>,
    pub base_url: Option<String>,
    /// Address the HTTP control surface listens on
    pub bind: Option<String>,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Endpoints connected at startup
    #[serde(default)]
    pub endpoints: Vec<EndpointDescriptor>,
}

/// File values merged with the environment.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
    pub bind: String,
    pub timeouts: TimeoutConfig,
    pub endpoints: Vec<EndpointDescriptor>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

impl Config {
    /// Environment wins over the file for model and base URL. The API key
    /// is only read from the environment.
    pub fn resolve(self, env: impl Fn(&str) -> Option<String>) -> ResolvedConfig {
        ResolvedConfig {
            api_key: non_empty(env(ENV_API_KEY)),
            model: non_empty(env(ENV_MODEL))
                .or_else(|| non_empty(self.model))
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            base_url: non_empty(env(ENV_BASE_URL))
                .or_else(|| non_empty(self.base_url))
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            bind: non_empty(self.bind).unwrap_or_else(|| DEFAULT_BIND.to_string()),
            timeouts: self.timeouts,
            endpoints: self.endpoints,
        }
    }

    pub fn resolve_from_env(self) -> ResolvedConfig {
        self.resolve(|name| std::env::var(name).ok())
    }
}

pub fn path_display<P: AsRef<Path>>(path: P) -> String {
    let path = path.as_ref();

    #[cfg(unix)]
    {
        if let Some(home) = std::env::var_os("HOME") {
            let home_path = PathBuf::from(home);
            if let Ok(relative) = path.strip_prefix(&home_path) {
                return format!("~/{}", relative.display());
            }
        }
    }

    path.display().to_string()
}
