use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Startup error: {0}")]
    Startup(#[from] StartupError),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("Correlation error: {0}")]
    Correlation(#[from] CorrelationError),

    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Parse error: {0}")]
    Parse(String),
}

/// Failures that keep the proxy from coming up.
#[derive(Error, Debug)]
pub enum StartupError {
    #[error("Proxy server already running")]
    AlreadyRunning,

    #[error("Failed to bind listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to read bound address: {0}")]
    LocalAddr(io::Error),

    #[error("Failed to prepare TLS listener: {0}")]
    Tls(#[from] TlsError),

    #[error("Failed to prepare origin client: {0}")]
    OriginClient(String),
}

/// Failures on either leg of a forwarded exchange or while opening a tunnel.
///
/// These never escape the engine; they become a degraded captured event.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Timed out connecting to {0}")]
    ConnectTimeout(String),

    #[error("TLS handshake with origin failed: {0}")]
    Tls(io::Error),

    #[error("Invalid origin server name: {0}")]
    InvalidServerName(String),

    #[error("Target has no authority: {0}")]
    MissingAuthority(String),

    #[error("Timed out waiting for origin response")]
    OriginTimeout,

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),
}

/// Failures while assembling a captured event; the exchange still completes.
#[derive(Error, Debug)]
pub enum CorrelationError {
    #[error("Malformed target: {0}")]
    MalformedTarget(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("Proxy server not running")]
    NotRunning,

    #[error("TLS listener is disabled")]
    TlsDisabled,

    #[error("No proxy bound to the current task")]
    NoAmbientProxy,
}

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("Failed to generate certificate: {0}")]
    CertGeneration(String),

    #[error("Invalid certificate: {0}")]
    InvalidCert(String),

    #[error("Failed to build TLS config: {0}")]
    Config(#[from] rustls::Error),
}

impl StartupError {
    pub(crate) fn bind(addr: impl Into<String>, source: io::Error) -> Self {
        StartupError::Bind {
            addr: addr.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
