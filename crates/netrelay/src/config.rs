//! Configuration types and loading logic.

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use netrelay::CaptureConfig;
use netrelay_tracing::TracingConfig;
use serde::Deserialize;

/// Top-level proxy configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub collector: CollectorConfig,
    #[serde(default)]
    pub tracing: TracingConfig,
}

/// Server listen configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Largest inbound request body accepted for forwarding.
    #[serde(default = "default_max_request_bytes")]
    pub max_request_bytes: usize,

    /// Whether calls are captured when the proxy starts. Toggle at runtime
    /// with `PUT /api/capture`.
    #[serde(default = "default_true")]
    pub capture_enabled: bool,
}

/// Where forwarded requests go.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_upstream_url")]
    pub url: String,

    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

/// Debugging-tool endpoint that receives relay events.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CollectorConfig {
    /// When unset, events are only logged.
    #[serde(default)]
    pub url: Option<String>,
}

fn default_listen_address() -> String {
    "0.0.0.0:3090".to_string()
}

fn default_max_request_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_true() -> bool {
    true
}

fn default_upstream_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_timeout() -> u64 {
    300
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            max_request_bytes: default_max_request_bytes(),
            capture_enabled: true,
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: default_upstream_url(),
            timeout_secs: default_timeout(),
        }
    }
}

impl RelayConfig {
    /// Load configuration from a TOML file and environment variables.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables (NETRELAY_ prefix, __ for nesting)
    /// 2. TOML config file (optional)
    /// 3. Defaults
    pub fn load(config_path: &str) -> anyhow::Result<Self> {
        Self::from_figment(
            Figment::new()
                .merge(Toml::file(config_path))
                .merge(Env::prefixed("NETRELAY_").split("__")),
        )
    }

    pub fn from_figment(figment: Figment) -> anyhow::Result<Self> {
        Ok(figment.extract()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netrelay::AbsentBodyPolicy;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = RelayConfig::from_figment(Figment::from(Toml::string(""))).unwrap();
        assert_eq!(config.server.listen_address, "0.0.0.0:3090");
        assert!(config.server.capture_enabled);
        assert_eq!(config.upstream.url, "http://localhost:8080");
        assert_eq!(config.capture.max_body_bytes, 1024 * 1024);
        assert_eq!(config.capture.absent_body, AbsentBodyPolicy::Empty);
        assert!(config.collector.url.is_none());
        assert!(config.tracing.otlp_endpoint.is_none());
    }

    #[test]
    fn test_toml_sections_override_defaults() {
        let toml = r#"
            [upstream]
            url = "http://api.internal:9000"
            timeout_secs = 5

            [capture]
            max_body_bytes = 64
            capture_request_body = false
            absent_body = "failure"

            [collector]
            url = "http://localhost:8089/events"

            [tracing]
            log_level = "netrelay=debug"
        "#;
        let config = RelayConfig::from_figment(Figment::from(Toml::string(toml))).unwrap();
        assert_eq!(config.upstream.url, "http://api.internal:9000");
        assert_eq!(config.upstream.timeout_secs, 5);
        assert_eq!(config.capture.max_body_bytes, 64);
        assert!(!config.capture.capture_request_body);
        assert!(config.capture.capture_response_body);
        assert_eq!(config.capture.absent_body, AbsentBodyPolicy::Failure);
        assert_eq!(config.collector.url.as_deref(), Some("http://localhost:8089/events"));
        assert_eq!(config.tracing.log_level, "netrelay=debug");
    }
}
