#![allow(dead_code)]

use bytes::Bytes;
use capture_proxy::transport::TlsIdentity;
use capture_proxy::{EventsCaptured, ProxyConfig, ProxyContext, ProxyServer};
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

pub const ORIGIN_BODY: &str = "response body";

pub fn test_config() -> ProxyConfig {
    ProxyConfig {
        connect_timeout_ms: 2_000,
        origin_timeout_ms: 5_000,
        ..ProxyConfig::default()
    }
}

pub fn capture_bodies(mut config: ProxyConfig) -> ProxyConfig {
    config.store_request_body = true;
    config.store_response_body = true;
    config
}

pub async fn start_proxy(config: ProxyConfig) -> (ProxyServer, ProxyContext) {
    let server = ProxyServer::new(config).expect("valid config");
    let context = server.start().await.expect("proxy starts");
    (server, context)
}

pub fn client(context: &ProxyContext) -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .proxy(context.reqwest_proxy().expect("proxy running"))
        .danger_accept_invalid_certs(true)
        .timeout(Duration::from_secs(10))
        .build()
        .expect("client")
}

/// Poll until at least `count` events were registered.
pub async fn wait_for_events(context: &ProxyContext, count: usize) -> EventsCaptured {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let captured = context.events_captured().expect("proxy running");
        if captured.len() >= count {
            return captured;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("expected {count} events, got {}", captured.summary());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Origin routes:
/// - `GET /path` answers `200` with [`ORIGIN_BODY`] as text/plain
/// - `POST /path` echoes the request body
/// - `/slow` answers after two seconds
/// - anything else is `404`
async fn origin_route(
    request: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let path = request.uri().path().to_string();
    let method = request.method().clone();

    let response = match (method.as_str(), path.as_str()) {
        ("GET", "/path") => Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/plain")
            .body(Full::new(Bytes::from_static(ORIGIN_BODY.as_bytes()))),
        ("POST", "/path") => {
            let body = request
                .into_body()
                .collect()
                .await
                .map(|collected| collected.to_bytes())
                .unwrap_or_default();
            Response::builder()
                .status(StatusCode::OK)
                .header("content-type", "text/plain")
                .body(Full::new(body))
        }
        (_, "/slow") => {
            tokio::time::sleep(Duration::from_secs(2)).await;
            Response::builder()
                .status(StatusCode::OK)
                .body(Full::new(Bytes::from_static(b"late")))
        }
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::new())),
    };

    Ok(response.expect("valid response"))
}

async fn serve_origin<I>(io: I)
where
    I: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let _ = auto::Builder::new(TokioExecutor::new())
        .serve_connection(TokioIo::new(io), service_fn(origin_route))
        .await;
}

/// Plain HTTP origin on an ephemeral port.
pub async fn spawn_origin() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind origin");
    let addr = listener.local_addr().expect("origin addr");

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(serve_origin(stream));
        }
    });

    addr
}

/// HTTPS origin with a self-signed certificate.
pub async fn spawn_tls_origin() -> SocketAddr {
    let identity = TlsIdentity::self_signed(&["localhost".to_string(), "127.0.0.1".to_string()])
        .expect("origin identity");
    let acceptor = TlsAcceptor::from(identity.server_config());
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind origin");
    let addr = listener.local_addr().expect("origin addr");

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                if let Ok(stream) = acceptor.accept(stream).await {
                    serve_origin(stream).await;
                }
            });
        }
    });

    addr
}

/// TCP server that writes back whatever it reads.
pub async fn spawn_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind echo");
    let addr = listener.local_addr().expect("echo addr");

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });

    addr
}

/// Send a CONNECT for `target` straight to the HTTP listener and read the
/// response head.
pub async fn open_tunnel(context: &ProxyContext, target: &str) -> (TcpStream, String) {
    let proxy = context.http_proxy().expect("running");
    let mut stream = TcpStream::connect((proxy.host.as_str(), proxy.port))
        .await
        .expect("connect proxy");
    stream
        .write_all(format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n").as_bytes())
        .await
        .expect("write connect");
    let head = read_head(&mut stream).await;
    (stream, head)
}

/// A port nothing listens on.
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    listener.local_addr().expect("addr").port()
}

/// Read a response head from a raw stream, up to and including the blank line.
pub async fn read_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).await.expect("read head");
        if n == 0 {
            break;
        }
        head.push(byte[0]);
    }
    String::from_utf8_lossy(&head).into_owned()
}
