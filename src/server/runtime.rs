//! Query surface handed out while the proxy runs.

use crate::capture::{EventStore, EventsCaptured};
use crate::error::{ConfigError, ProxyError, StateError};
use arc_swap::ArcSwapOption;
use serde::Serialize;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

/// Ports bound by a running proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuntimeInfo {
    pub host: String,
    pub http_port: u16,
    pub tls_port: Option<u16>,
}

/// Where a client should send its traffic to go through the proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyAddress {
    pub scheme: &'static str,
    pub host: String,
    pub port: u16,
}

impl ProxyAddress {
    fn new(scheme: &'static str, bound_host: &str, port: u16) -> Self {
        Self {
            scheme,
            host: client_host(bound_host),
            port,
        }
    }

    pub fn url(&self) -> String {
        match self.host.parse::<IpAddr>() {
            Ok(IpAddr::V6(_)) => format!("{}://[{}]:{}", self.scheme, self.host, self.port),
            _ => format!("{}://{}:{}", self.scheme, self.host, self.port),
        }
    }

    /// Socket address when the host is an IP literal.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.host
            .parse::<IpAddr>()
            .ok()
            .map(|ip| SocketAddr::new(ip, self.port))
    }
}

impl fmt::Display for ProxyAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url())
    }
}

/// Clients cannot connect to an unspecified address, use loopback instead.
fn client_host(bound_host: &str) -> String {
    match bound_host.parse::<IpAddr>() {
        Ok(ip) if ip.is_unspecified() => Ipv4Addr::LOCALHOST.to_string(),
        _ => bound_host.to_string(),
    }
}

#[derive(Debug)]
pub(crate) struct RuntimeState {
    pub(crate) info: RuntimeInfo,
    pub(crate) certificate_pem: Option<String>,
}

/// State shared by a server and every context it hands out.
#[derive(Debug, Default)]
pub(crate) struct Shared {
    pub(crate) store: EventStore,
    pub(crate) runtime: ArcSwapOption<RuntimeState>,
}

/// Handle to a proxy server. Cheap to clone.
///
/// Every query fails with [`StateError::NotRunning`] while the server is
/// stopped, including after `stop()` on a server this context came from.
#[derive(Debug, Clone)]
pub struct ProxyContext {
    shared: Arc<Shared>,
}

impl ProxyContext {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    fn running(&self) -> Result<Arc<RuntimeState>, StateError> {
        self.shared.runtime.load_full().ok_or(StateError::NotRunning)
    }

    pub fn is_running(&self) -> bool {
        self.shared.runtime.load().is_some()
    }

    pub fn runtime_info(&self) -> Result<RuntimeInfo, StateError> {
        Ok(self.running()?.info.clone())
    }

    pub fn events_captured(&self) -> Result<EventsCaptured, StateError> {
        self.running()?;
        Ok(self.shared.store.snapshot())
    }

    /// Clear the capture log. Only call this when no exchange is in flight.
    pub fn reset_captured_events(&self) -> Result<(), StateError> {
        self.running()?;
        self.shared.store.reset();
        Ok(())
    }

    pub fn http_proxy(&self) -> Result<ProxyAddress, StateError> {
        let runtime = self.running()?;
        Ok(ProxyAddress::new(
            "http",
            &runtime.info.host,
            runtime.info.http_port,
        ))
    }

    pub fn tls_proxy(&self) -> Result<ProxyAddress, StateError> {
        let runtime = self.running()?;
        let port = runtime.info.tls_port.ok_or(StateError::TlsDisabled)?;
        Ok(ProxyAddress::new("https", &runtime.info.host, port))
    }

    /// A `reqwest` proxy routing every scheme through the plain HTTP listener.
    pub fn reqwest_proxy(&self) -> crate::Result<reqwest::Proxy> {
        let address = self.http_proxy()?;
        reqwest::Proxy::all(address.url()).map_err(|e| {
            ProxyError::Config(ConfigError::Validation(format!(
                "invalid proxy url {address}: {e}"
            )))
        })
    }

    /// PEM of the TLS listener certificate, for clients that must trust it.
    pub fn tls_certificate_pem(&self) -> Result<String, StateError> {
        self.running()?
            .certificate_pem
            .clone()
            .ok_or(StateError::TlsDisabled)
    }
}
