//! Origin-facing HTTP client.
//!
//! Plain origins get HTTP/1.1. TLS origins get HTTP/2 when they pick `h2`
//! during ALPN, HTTP/1.1 otherwise. Every forwarded exchange opens its own
//! connection. Pooling would let two
//! exchanges share one origin connection, and the captured log must reflect
//! each exchange independently.

use super::tls::origin_client_config;
use crate::error::{RelayError, TlsError};
use crate::proxy::ProxyBody;
use http::uri::Scheme;
use http::{Request, Response, Uri, Version};
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::pki_types::ServerName;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

const HTTP_PORT: u16 = 80;
const HTTPS_PORT: u16 = 443;
const H2_ALPN: &[u8] = b"h2";

#[derive(Clone)]
pub struct OriginConnector {
    tls: TlsConnector,
    connect_timeout: Duration,
}

impl OriginConnector {
    pub fn new(connect_timeout: Duration) -> Result<Self, TlsError> {
        Ok(Self {
            tls: TlsConnector::from(origin_client_config()?),
            connect_timeout,
        })
    }

    /// Send `request` to the origin named by `target` and return its response
    /// head. The body streams from the origin as the caller polls it.
    pub async fn send(
        &self,
        target: &Uri,
        mut request: Request<ProxyBody>,
    ) -> Result<Response<Incoming>, RelayError> {
        let authority = target
            .authority()
            .ok_or_else(|| RelayError::MissingAuthority(target.to_string()))?;
        let https = target.scheme() == Some(&Scheme::HTTPS);
        let host = strip_brackets(authority.host());
        let port = authority
            .port_u16()
            .unwrap_or(if https { HTTPS_PORT } else { HTTP_PORT });

        let stream = connect_tcp(host, port, self.connect_timeout).await?;

        if https {
            let server_name = ServerName::try_from(host.to_string())
                .map_err(|e| RelayError::InvalidServerName(format!("{host}: {e}")))?;
            let stream = self
                .tls
                .connect(server_name, stream)
                .await
                .map_err(RelayError::Tls)?;

            if stream.get_ref().1.alpn_protocol() == Some(H2_ALPN) {
                // HTTP/2 carries scheme and authority as pseudo-headers.
                *request.uri_mut() = target.clone();
                *request.version_mut() = Version::HTTP_2;
                exchange_h2(stream, request).await
            } else {
                exchange(stream, request).await
            }
        } else {
            exchange(stream, request).await
        }
    }
}

async fn exchange<S>(
    stream: S,
    request: Request<ProxyBody>,
) -> Result<Response<Incoming>, RelayError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, connection) =
        hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::debug!(error = %e, "Origin connection closed with error");
        }
    });

    Ok(sender.send_request(request).await?)
}

async fn exchange_h2<S>(
    stream: S,
    request: Request<ProxyBody>,
) -> Result<Response<Incoming>, RelayError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, connection) =
        hyper::client::conn::http2::handshake(TokioExecutor::new(), TokioIo::new(stream))
            .await?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::debug!(error = %e, "Origin h2 connection closed with error");
        }
    });

    Ok(sender.send_request(request).await?)
}

/// Open a TCP connection, giving up after `timeout`.
pub(crate) async fn connect_tcp(
    host: &str,
    port: u16,
    timeout: Duration,
) -> Result<TcpStream, RelayError> {
    let host = strip_brackets(host);
    let addr = format!("{host}:{port}");

    match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => {
            if let Err(e) = stream.set_nodelay(true) {
                tracing::trace!(addr = %addr, error = %e, "Could not set TCP_NODELAY");
            }
            Ok(stream)
        }
        Ok(Err(source)) => Err(RelayError::Connect { addr, source }),
        Err(_) => Err(RelayError::ConnectTimeout(addr)),
    }
}

fn strip_brackets(host: &str) -> &str {
    host.trim_start_matches('[').trim_end_matches(']')
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_strip_brackets() {
        assert_eq!(strip_brackets("[::1]"), "::1");
        assert_eq!(strip_brackets("origin.test"), "origin.test");
    }

    #[tokio::test]
    async fn test_connect_tcp_reaches_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();

        let stream = connect_tcp("127.0.0.1", port, Duration::from_secs(5)).await;
        assert!(stream.is_ok());
    }

    #[tokio::test]
    async fn test_connect_tcp_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);

        let result = connect_tcp("127.0.0.1", port, Duration::from_secs(5)).await;
        assert!(matches!(result, Err(RelayError::Connect { .. })));
    }

    /// TLS origin that only speaks HTTP/2 and echoes the negotiated version.
    async fn spawn_h2_origin() -> u16 {
        use crate::transport::TlsIdentity;
        use http_body_util::Full;
        use hyper::service::service_fn;
        use tokio_rustls::TlsAcceptor;

        let identity = TlsIdentity::self_signed(&["localhost".to_string()]).expect("identity");
        let acceptor = TlsAcceptor::from(identity.server_config());
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    let Ok(stream) = acceptor.accept(stream).await else {
                        return;
                    };
                    let service = service_fn(|request: Request<Incoming>| async move {
                        let body = format!("{:?} {}", request.version(), request.uri());
                        Ok::<_, std::convert::Infallible>(Response::new(Full::new(
                            bytes::Bytes::from(body),
                        )))
                    });
                    let _ = hyper::server::conn::http2::Builder::new(TokioExecutor::new())
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        port
    }

    #[tokio::test]
    async fn test_tls_origin_negotiates_h2() {
        use http_body_util::BodyExt;

        let port = spawn_h2_origin().await;
        let connector = OriginConnector::new(Duration::from_secs(5)).expect("connector");
        let target: Uri = format!("https://localhost:{port}/h2?x=1").parse().expect("uri");
        let request = Request::get("/h2?x=1")
            .header("host", format!("localhost:{port}"))
            .body(crate::proxy::empty())
            .expect("request");

        let response = connector.send(&target, request).await.expect("response");
        assert_eq!(response.version(), Version::HTTP_2);

        let body = response.into_body().collect().await.expect("body").to_bytes();
        assert_eq!(
            String::from_utf8_lossy(&body),
            format!("HTTP/2.0 https://localhost:{port}/h2?x=1")
        );
    }

    #[tokio::test]
    async fn test_send_requires_authority() {
        let connector = OriginConnector::new(Duration::from_secs(1)).expect("connector");
        let request = Request::get("/relative")
            .body(crate::proxy::empty())
            .expect("request");

        let result = connector.send(&"/relative".parse().expect("uri"), request).await;
        assert!(matches!(result, Err(RelayError::MissingAuthority(_))));
    }
}
