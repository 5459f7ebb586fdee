//! Relay of non-tunnel exchanges to their origin.

use super::exchange::{resolve_target, ExchangeContext};
use super::{status_response, ProxyBody, Relay};
use crate::capture::{HeaderSet, TapBody};
use crate::error::RelayError;
use crate::transport::OriginConnector;
use http::header::{HeaderName, CONNECTION, HOST, TE, TRAILER, TRANSFER_ENCODING, UPGRADE};
use http::{HeaderMap, HeaderValue, Request, Response, StatusCode, Uri, Version};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use std::time::Duration;

/// Headers that describe one connection and are never relayed.
const HOP_BY_HOP: [&str; 4] = [
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
];

pub struct ForwardEngine {
    connector: OriginConnector,
    origin_timeout: Duration,
}

impl ForwardEngine {
    pub fn new(connector: OriginConnector, origin_timeout: Duration) -> Self {
        Self {
            connector,
            origin_timeout,
        }
    }

    /// Relay `request` to its origin and return the response for the client.
    ///
    /// The origin's status and headers are stashed in `exchange` before the
    /// response leaves this function. Relay failures produce an error status
    /// response instead of an error value.
    pub async fn relay(
        &self,
        request: Request<Incoming>,
        exchange: &mut ExchangeContext,
    ) -> Relay {
        let headers = HeaderSet::from_header_map(request.headers());
        let target = match resolve_target(request.method(), request.uri(), &headers) {
            Ok(target) => target,
            Err(e) => {
                tracing::debug!(
                    exchange_id = %exchange.id(),
                    error = %e,
                    "Rejecting request without target"
                );
                return Relay::Response(status_response(StatusCode::BAD_REQUEST));
            }
        };

        let outbound = match self.outbound_request(request, &target, exchange) {
            Ok(outbound) => outbound,
            Err(e) => {
                tracing::debug!(
                    exchange_id = %exchange.id(),
                    error = %e,
                    "Could not build origin request"
                );
                return Relay::Response(status_response(StatusCode::BAD_REQUEST));
            }
        };

        tracing::debug!(
            exchange_id = %exchange.id(),
            method = %outbound.method(),
            target = %target,
            "Forwarding request to origin"
        );

        let sent = tokio::time::timeout(
            self.origin_timeout,
            self.connector.send(&target, outbound),
        )
        .await
        .unwrap_or(Err(RelayError::OriginTimeout));

        match sent {
            Ok(response) => {
                exchange.stash_origin_response(response.status(), response.headers());
                Relay::Response(self.client_response(response, exchange))
            }
            Err(e) => {
                let status = match e {
                    RelayError::OriginTimeout | RelayError::ConnectTimeout(_) => {
                        StatusCode::GATEWAY_TIMEOUT
                    }
                    _ => StatusCode::BAD_GATEWAY,
                };
                tracing::warn!(
                    exchange_id = %exchange.id(),
                    target = %target,
                    error = %e,
                    status = status.as_u16(),
                    "Relay to origin failed"
                );
                Relay::Response(status_response(status))
            }
        }
    }

    fn outbound_request(
        &self,
        request: Request<Incoming>,
        target: &Uri,
        exchange: &ExchangeContext,
    ) -> Result<Request<ProxyBody>, http::Error> {
        let (mut parts, body) = request.into_parts();

        strip_hop_by_hop(&mut parts.headers);
        if !parts.headers.contains_key(HOST) {
            if let Some(authority) = target.authority() {
                parts
                    .headers
                    .insert(HOST, HeaderValue::from_str(authority.as_str())?);
            }
        }

        let path = target
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        parts.uri = path.parse()?;
        parts.version = Version::HTTP_11;

        let body = match exchange.request_tap() {
            Some(tap) => TapBody::new(body, tap).boxed(),
            None => body.boxed(),
        };

        Ok(Request::from_parts(parts, body))
    }

    fn client_response(
        &self,
        response: Response<Incoming>,
        exchange: &ExchangeContext,
    ) -> Response<ProxyBody> {
        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        parts.version = Version::default();

        let body = match exchange.response_tap() {
            Some(tap) => TapBody::new(body, tap).boxed(),
            None => body.boxed(),
        };

        Response::from_parts(parts, body)
    }
}

/// Remove connection-scoped headers, including any listed in `Connection`.
pub(crate) fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }

    for name in [CONNECTION, TE, TRAILER, TRANSFER_ENCODING, UPGRADE] {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}
