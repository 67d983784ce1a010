//! Tracing setup for the binary.

use tracing_subscriber::EnvFilter;

pub const DEFAULT_FILTER: &str = "mcp_relay=info";

/// Installs the global subscriber. Logs go to stderr; stdout carries event
/// output for `chat` and `inspect`.
pub fn init() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Shows at most the first four characters of a secret.
pub fn redact_secret(secret: &str) -> String {
    let visible: String = secret.chars().take(4).collect();
    if secret.chars().count() <= 4 {
        "****".to_string()
    } else {
        format!("{visible}****")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_all_but_prefix() {
        assert_eq!(redact_secret("sk-abcdef123456"), "sk-a****");
        assert_eq!(redact_secret("abc"), "****");
        assert_eq!(redact_secret(""), "****");
    }
}
