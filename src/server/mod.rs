//! Proxy server lifecycle: listeners, accept loops and shutdown.

pub mod ambient;
pub mod runtime;

pub use runtime::{ProxyAddress, ProxyContext, RuntimeInfo};

use crate::config::{loader, ProxyConfig};
use crate::error::{Result, StartupError};
use crate::proxy::ProxyFacade;
use crate::transport::{OriginConnector, TlsIdentity};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use runtime::{RuntimeState, Shared};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

/// How long open connections get to finish in-flight exchanges on stop.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Back-off after a failed `accept`, e.g. when out of file descriptors.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(50);

struct Running {
    shutdown_tx: broadcast::Sender<()>,
    accept_loops: Vec<JoinHandle<()>>,
}

/// A capture proxy that can be started and stopped repeatedly.
///
/// The capture log outlives restarts; use
/// [`ProxyContext::reset_captured_events`] to clear it.
pub struct ProxyServer {
    config: Arc<ProxyConfig>,
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

impl ProxyServer {
    pub fn new(config: ProxyConfig) -> Result<Self> {
        loader::validate(&config)?;

        Ok(Self {
            config: Arc::new(config),
            shared: Arc::new(Shared::default()),
            running: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Context bound to this server. It answers queries only while the
    /// server is running.
    pub fn context(&self) -> ProxyContext {
        ProxyContext::new(self.shared.clone())
    }

    /// Bind the listeners and start accepting connections.
    pub async fn start(&self) -> Result<ProxyContext> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(StartupError::AlreadyRunning.into());
        }

        tracing::debug!("Starting capture proxy");

        let connector = OriginConnector::new(self.config.connect_timeout())
            .map_err(|e| StartupError::OriginClient(e.to_string()))?;

        let http_listener = bind(&self.config.host, self.config.port).await?;
        let http_port = local_port(&http_listener)?;

        let tls = if self.config.tls.enabled {
            let identity =
                TlsIdentity::self_signed(&self.config.tls.hosts).map_err(StartupError::Tls)?;
            let listener = bind(&self.config.host, self.config.tls.port).await?;
            let port = local_port(&listener)?;
            Some((listener, port, identity))
        } else {
            None
        };

        let (shutdown_tx, _) = broadcast::channel(1);
        let facade = Arc::new(ProxyFacade::new(
            &self.config,
            connector,
            self.shared.store.clone(),
            shutdown_tx.clone(),
        ));

        let mut accept_loops = vec![tokio::spawn(accept_loop(
            http_listener,
            None,
            facade.clone(),
            shutdown_tx.subscribe(),
        ))];

        let (tls_port, certificate_pem) = match tls {
            Some((listener, port, identity)) => {
                let acceptor = TlsAcceptor::from(identity.server_config());
                accept_loops.push(tokio::spawn(accept_loop(
                    listener,
                    Some(acceptor),
                    facade,
                    shutdown_tx.subscribe(),
                )));
                (Some(port), Some(identity.certificate_pem().to_string()))
            }
            None => (None, None),
        };

        let info = runtime::RuntimeInfo {
            host: self.config.host.clone(),
            http_port,
            tls_port,
        };
        tracing::info!(
            host = %info.host,
            http_port = info.http_port,
            tls_port = ?info.tls_port,
            "Capture proxy started"
        );

        self.shared.runtime.store(Some(Arc::new(RuntimeState {
            info,
            certificate_pem,
        })));
        *running = Some(Running {
            shutdown_tx,
            accept_loops,
        });

        Ok(self.context())
    }

    /// Stop accepting connections and close open ones. Stopping a stopped
    /// server does nothing.
    pub async fn stop(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        let Some(state) = running.take() else {
            tracing::debug!("Capture proxy not running, no need to stop");
            return Ok(());
        };

        self.shared.runtime.store(None);
        let _ = state.shutdown_tx.send(());

        for handle in state.accept_loops {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Accept loop ended abnormally");
            }
        }

        tracing::info!(
            events = self.shared.store.len(),
            "Capture proxy stopped"
        );
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }
}

async fn bind(host: &str, port: u16) -> std::result::Result<TcpListener, StartupError> {
    let addr = match host.parse::<std::net::IpAddr>() {
        Ok(ip) => SocketAddr::new(ip, port).to_string(),
        Err(_) => format!("{host}:{port}"),
    };
    TcpListener::bind(&addr)
        .await
        .map_err(|e| StartupError::bind(addr, e))
}

fn local_port(listener: &TcpListener) -> std::result::Result<u16, StartupError> {
    listener
        .local_addr()
        .map(|addr| addr.port())
        .map_err(StartupError::LocalAddr)
}

async fn accept_loop(
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    facade: Arc<ProxyFacade>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let scheme = if tls.is_some() { "https" } else { "http" };

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::debug!(scheme, "Listener closed");
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!(scheme, error = %e, "Failed to accept connection");
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                        continue;
                    }
                };
                tracing::trace!(scheme, peer = %peer, "Accepted connection");

                let facade = facade.clone();
                let shutdown = shutdown.resubscribe();
                match tls.clone() {
                    Some(acceptor) => {
                        tokio::spawn(async move {
                            match acceptor.accept(stream).await {
                                Ok(stream) => {
                                    serve_connection(stream, peer, facade, shutdown).await
                                }
                                Err(e) => {
                                    tracing::debug!(
                                        peer = %peer,
                                        error = %e,
                                        "TLS handshake failed"
                                    );
                                }
                            }
                        });
                    }
                    None => {
                        tokio::spawn(serve_connection(stream, peer, facade, shutdown));
                    }
                }
            }
        }
    }
}

async fn serve_connection<I>(
    io: I,
    peer: SocketAddr,
    facade: Arc<ProxyFacade>,
    mut shutdown: broadcast::Receiver<()>,
) where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |request| {
        let facade = facade.clone();
        async move { facade.handle(request).await }
    });

    let builder = auto::Builder::new(TokioExecutor::new());
    let connection = builder.serve_connection_with_upgrades(TokioIo::new(io), service);
    tokio::pin!(connection);

    tokio::select! {
        result = connection.as_mut() => {
            if let Err(e) = result {
                tracing::debug!(peer = %peer, error = %e, "Connection closed with error");
            }
        }
        _ = shutdown.recv() => {
            connection.as_mut().graceful_shutdown();
            if tokio::time::timeout(SHUTDOWN_GRACE, connection.as_mut()).await.is_err() {
                tracing::debug!(peer = %peer, "Dropping connection after shutdown grace period");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ProxyError, StateError};

    fn config() -> ProxyConfig {
        ProxyConfig::default()
    }

    #[tokio::test]
    async fn test_start_binds_ephemeral_ports() {
        let server = ProxyServer::new(config()).expect("server");
        let context = server.start().await.expect("start");

        let info = context.runtime_info().expect("running");
        assert_ne!(info.http_port, 0);
        assert!(info.tls_port.is_some_and(|port| port != 0));
        assert_ne!(Some(info.http_port), info.tls_port);

        server.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let server = ProxyServer::new(config()).expect("server");
        server.start().await.expect("start");

        let second = server.start().await;
        assert!(matches!(
            second,
            Err(ProxyError::Startup(StartupError::AlreadyRunning))
        ));

        server.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_clears_runtime() {
        let server = ProxyServer::new(config()).expect("server");
        let context = server.start().await.expect("start");
        assert!(server.is_running().await);

        server.stop().await.expect("stop");
        server.stop().await.expect("second stop");

        assert!(!server.is_running().await);
        assert_eq!(context.runtime_info(), Err(StateError::NotRunning));
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let server = ProxyServer::new(config()).expect("server");
        server.start().await.expect("start");
        server.stop().await.expect("stop");

        let context = server.start().await.expect("restart");
        assert!(context.is_running());
        server.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn test_tls_disabled_binds_one_listener() {
        let mut config = config();
        config.tls.enabled = false;
        let server = ProxyServer::new(config).expect("server");
        let context = server.start().await.expect("start");

        assert_eq!(context.runtime_info().expect("running").tls_port, None);
        assert_eq!(context.tls_proxy(), Err(StateError::TlsDisabled));

        server.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn test_port_in_use_fails_startup() {
        let occupied = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = occupied.local_addr().expect("addr").port();

        let mut config = config();
        config.port = port;
        let server = ProxyServer::new(config).expect("server");

        let result = server.start().await;
        assert!(matches!(
            result,
            Err(ProxyError::Startup(StartupError::Bind { .. }))
        ));
        assert!(!server.is_running().await);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = config();
        config.host = String::new();

        assert!(matches!(
            ProxyServer::new(config),
            Err(ProxyError::Config(_))
        ));
    }
}
