use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level proxy configuration.
///
/// Built once before the proxy starts and never mutated afterwards; the server
/// keeps it behind an `Arc`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ProxyConfig {
    #[serde(default = "default_host")]
    pub host: String,
    /// Plain HTTP listener port, `0` picks an ephemeral port.
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub tls: TlsListenerConfig,
    #[serde(default = "default_true")]
    pub inject_marker_header: bool,
    #[serde(default)]
    pub store_request_body: bool,
    #[serde(default)]
    pub store_response_body: bool,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_origin_timeout")]
    pub origin_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct TlsListenerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub port: u16,
    /// Names the generated listener certificate is valid for
    #[serde(default = "default_tls_hosts")]
    pub hosts: Vec<String>,
}

/// Body capture policy handed to the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectorConfig {
    pub store_request_body: bool,
    pub store_response_body: bool,
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_true() -> bool {
    true
}

fn default_tls_hosts() -> Vec<String> {
    vec!["localhost".to_string(), "127.0.0.1".to_string()]
}

fn default_connect_timeout() -> u64 {
    10_000
}

fn default_origin_timeout() -> u64 {
    30_000
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: 0,
            tls: TlsListenerConfig::default(),
            inject_marker_header: true,
            store_request_body: false,
            store_response_body: false,
            connect_timeout_ms: default_connect_timeout(),
            origin_timeout_ms: default_origin_timeout(),
        }
    }
}

impl Default for TlsListenerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 0,
            hosts: default_tls_hosts(),
        }
    }
}

impl ProxyConfig {
    pub fn collector(&self) -> CollectorConfig {
        CollectorConfig {
            store_request_body: self.store_request_body,
            store_response_body: self.store_response_body,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn origin_timeout(&self) -> Duration {
        Duration::from_millis(self.origin_timeout_ms)
    }
}
