//! CONNECT handling: raw byte tunnels that are never inspected.

use super::exchange::{Completion, ExchangeContext};
use super::{status_response, Relay};
use crate::transport::connect_tcp;
use http::uri::Authority;
use http::{Request, StatusCode};
use hyper::body::Incoming;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::broadcast;

const DEFAULT_TUNNEL_PORT: u16 = 443;

pub struct TunnelRouter {
    connect_timeout: Duration,
    shutdown: broadcast::Sender<()>,
}

/// Tunnel whose upstream side is connected and whose client side is waiting
/// for the `200` response to be sent.
pub struct PendingTunnel {
    authority: Authority,
    upgrade: OnUpgrade,
    upstream: TcpStream,
    shutdown: broadcast::Receiver<()>,
}

impl TunnelRouter {
    /// Open tunnels are closed when `shutdown` fires.
    pub fn new(connect_timeout: Duration, shutdown: broadcast::Sender<()>) -> Self {
        Self {
            connect_timeout,
            shutdown,
        }
    }

    /// Connect to the CONNECT authority. Success answers `200` and hands back
    /// a [`PendingTunnel`]; failure answers with an error status.
    pub async fn route(
        &self,
        mut request: Request<Incoming>,
        exchange: &ExchangeContext,
    ) -> Relay {
        tracing::trace!(
            exchange_id = %exchange.id(),
            "Traffic inside CONNECT tunnels is relayed but not captured"
        );

        let Some(authority) = request.uri().authority().cloned() else {
            tracing::debug!(
                exchange_id = %exchange.id(),
                uri = %request.uri(),
                "CONNECT without authority"
            );
            return Relay::Response(status_response(StatusCode::BAD_REQUEST));
        };

        let port = authority.port_u16().unwrap_or(DEFAULT_TUNNEL_PORT);
        let upstream = match connect_tcp(authority.host(), port, self.connect_timeout).await {
            Ok(upstream) => upstream,
            Err(e) => {
                tracing::warn!(
                    exchange_id = %exchange.id(),
                    authority = %authority,
                    error = %e,
                    "Could not open tunnel"
                );
                return Relay::Response(status_response(StatusCode::BAD_GATEWAY));
            }
        };

        tracing::debug!(
            exchange_id = %exchange.id(),
            authority = %authority,
            "Tunnel established"
        );

        let upgrade = hyper::upgrade::on(&mut request);
        Relay::Tunnel(
            status_response(StatusCode::OK),
            PendingTunnel {
                authority,
                upgrade,
                upstream,
                shutdown: self.shutdown.subscribe(),
            },
        )
    }
}

impl PendingTunnel {
    /// Copy bytes both ways once the client connection is upgraded. The
    /// exchange completes when the tunnel closes.
    pub fn spawn(self, mut exchange: ExchangeContext) {
        tokio::spawn(async move {
            let PendingTunnel {
                authority,
                upgrade,
                mut upstream,
                mut shutdown,
            } = self;

            let completion = match upgrade.await {
                Ok(upgraded) => {
                    let mut client = TokioIo::new(upgraded);
                    let copied = tokio::select! {
                        copied = tokio::io::copy_bidirectional(&mut client, &mut upstream) => {
                            copied
                        }
                        _ = shutdown.recv() => Err(std::io::Error::new(
                            std::io::ErrorKind::Interrupted,
                            "proxy shutting down",
                        )),
                    };
                    match copied {
                        Ok((from_client, from_upstream)) => {
                            tracing::debug!(
                                exchange_id = %exchange.id(),
                                authority = %authority,
                                from_client,
                                from_upstream,
                                "Tunnel closed"
                            );
                            Completion::Delivered
                        }
                        Err(e) => {
                            tracing::debug!(
                                exchange_id = %exchange.id(),
                                authority = %authority,
                                error = %e,
                                "Tunnel closed with error"
                            );
                            Completion::Failed(e.to_string())
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        exchange_id = %exchange.id(),
                        authority = %authority,
                        error = %e,
                        "Client connection upgrade failed"
                    );
                    Completion::Failed(e.to_string())
                }
            };

            exchange.complete(completion);
        });
    }
}
