//! The proxy engine.
//!
//! [`ProxyFacade`] is what the listeners drive: it classifies each exchange,
//! hands it to the [`TunnelRouter`] or the [`ForwardEngine`], stamps the
//! marker header and attaches the exchange's [`ExchangeContext`] to whatever
//! completes the client-facing leg.

pub mod exchange;
pub mod forward;
pub mod tunnel;

pub use exchange::{Completion, CompletionBody, ExchangeContext, ExchangeKind};
pub use forward::ForwardEngine;
pub use tunnel::{PendingTunnel, TunnelRouter};

use crate::capture::EventStore;
use crate::config::{CollectorConfig, ProxyConfig};
use crate::transport::OriginConnector;
use bytes::Bytes;
use http::header::HeaderName;
use http::{HeaderValue, Request, Response, StatusCode};
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Incoming;
use std::convert::Infallible;
use tokio::sync::broadcast;

/// Header added to every client-facing response when marker injection is on.
pub const MARKER_HEADER: &str = "capture-proxy-visited";
const MARKER_VALUE: &str = "true";

pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

pub fn full(chunk: impl Into<Bytes>) -> ProxyBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

pub(crate) fn status_response(status: StatusCode) -> Response<ProxyBody> {
    let mut response = Response::new(empty());
    *response.status_mut() = status;
    response
}

/// Outcome of the tunnel or forward stage.
pub enum Relay {
    /// A response that is complete once its body has been delivered.
    Response(Response<ProxyBody>),
    /// `200` for a CONNECT whose byte copying starts after the upgrade.
    Tunnel(Response<ProxyBody>, PendingTunnel),
}

pub struct ProxyFacade {
    collector: CollectorConfig,
    inject_marker: bool,
    store: EventStore,
    forward: ForwardEngine,
    tunnels: TunnelRouter,
}

impl ProxyFacade {
    pub fn new(
        config: &ProxyConfig,
        connector: OriginConnector,
        store: EventStore,
        shutdown: broadcast::Sender<()>,
    ) -> Self {
        Self {
            collector: config.collector(),
            inject_marker: config.inject_marker_header,
            store,
            forward: ForwardEngine::new(connector, config.origin_timeout()),
            tunnels: TunnelRouter::new(config.connect_timeout(), shutdown),
        }
    }

    /// Serve one exchange. Never fails: relay problems become error statuses
    /// and the exchange is still correlated.
    pub async fn handle(
        &self,
        request: Request<Incoming>,
    ) -> Result<Response<ProxyBody>, Infallible> {
        let mut exchange = ExchangeContext::begin(&request, self.collector, self.store.clone());

        tracing::debug!(
            exchange_id = %exchange.id(),
            kind = ?exchange.kind(),
            method = %request.method(),
            uri = %request.uri(),
            "Routing exchange"
        );

        let relay = match exchange.kind() {
            ExchangeKind::Tunnel => self.tunnels.route(request, &exchange).await,
            ExchangeKind::Forward => self.forward.relay(request, &mut exchange).await,
        };

        Ok(self.finish(relay, exchange))
    }

    fn finish(&self, relay: Relay, mut exchange: ExchangeContext) -> Response<ProxyBody> {
        let (mut response, tunnel) = match relay {
            Relay::Response(response) => (response, None),
            Relay::Tunnel(response, tunnel) => (response, Some(tunnel)),
        };

        if self.inject_marker {
            response.headers_mut().insert(
                HeaderName::from_static(MARKER_HEADER),
                HeaderValue::from_static(MARKER_VALUE),
            );
        }
        exchange.record_client_response(response.status(), response.headers());

        match tunnel {
            Some(tunnel) => {
                tunnel.spawn(exchange);
                response
            }
            None => response.map(|body| CompletionBody::new(body, exchange).boxed()),
        }
    }
}
