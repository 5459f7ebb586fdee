//! Per-exchange state and event correlation.
//!
//! An [`ExchangeContext`] is created when a request arrives and travels with
//! that exchange only: through the forwarding or tunnelling stage, then into the
//! client-facing [`CompletionBody`] or the tunnel task. Whichever of those owns
//! it last reports the client-facing completion, which assembles the
//! [`ProxyEvent`] and hands it to the [`EventStore`].
//!
//! Completion happens exactly once. Every path that ends an exchange (body
//! finished, body error, client gone, service future dropped) funnels into
//! [`ExchangeContext::complete`], and dropping an uncompleted context completes
//! it as abandoned.

use super::ProxyBody;
use crate::capture::{
    CapturedRequest, CapturedResponse, ContentTap, EventStore, HeaderSet, ProxyEvent,
};
use crate::config::CollectorConfig;
use crate::error::CorrelationError;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::header::HOST;
use http::{HeaderMap, Method, Request, StatusCode, Uri};
use hyper::body::{Body, Frame, SizeHint};
use std::fmt;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use uuid::Uuid;

/// How an exchange is relayed, decided once from the request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// CONNECT: raw byte tunnel, never inspected.
    Tunnel,
    /// Everything else: relayed to the origin with optional body taps.
    Forward,
}

impl ExchangeKind {
    pub fn classify(method: &Method) -> Self {
        if method == Method::CONNECT {
            ExchangeKind::Tunnel
        } else {
            ExchangeKind::Forward
        }
    }
}

/// How the client-facing leg ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// Response fully handed to the client, or tunnel closed after use.
    Delivered,
    /// Client-facing leg failed midway.
    Failed(String),
    /// Exchange dropped before its response was delivered.
    Abandoned,
}

impl fmt::Display for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Completion::Delivered => f.write_str("delivered"),
            Completion::Failed(reason) => write!(f, "failed: {reason}"),
            Completion::Abandoned => f.write_str("abandoned"),
        }
    }
}

#[derive(Debug, Clone)]
struct ResponseHead {
    status: StatusCode,
    headers: HeaderSet,
}

impl ResponseHead {
    fn new(status: StatusCode, headers: &HeaderMap) -> Self {
        Self {
            status,
            headers: HeaderSet::from_header_map(headers),
        }
    }
}

/// Typed state owned by a single exchange.
pub struct ExchangeContext {
    id: Uuid,
    kind: ExchangeKind,
    started_at: DateTime<Utc>,
    method: Method,
    uri: Uri,
    request_headers: HeaderSet,
    request_tap: Option<ContentTap>,
    response_tap: Option<ContentTap>,
    origin_response: Option<ResponseHead>,
    client_response: Option<ResponseHead>,
    store: EventStore,
    completed: bool,
}

impl ExchangeContext {
    /// Start tracking an exchange. Taps are only created for forwarded
    /// exchanges whose body capture is switched on.
    pub fn begin<B>(
        request: &Request<B>,
        collector: CollectorConfig,
        store: EventStore,
    ) -> Self {
        let kind = ExchangeKind::classify(request.method());
        let forward = kind == ExchangeKind::Forward;

        Self {
            id: Uuid::new_v4(),
            kind,
            started_at: Utc::now(),
            method: request.method().clone(),
            uri: request.uri().clone(),
            request_headers: HeaderSet::from_header_map(request.headers()),
            request_tap: (forward && collector.store_request_body).then(ContentTap::new),
            response_tap: (forward && collector.store_response_body).then(ContentTap::new),
            origin_response: None,
            client_response: None,
            store,
            completed: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> ExchangeKind {
        self.kind
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn request_tap(&self) -> Option<ContentTap> {
        self.request_tap.clone()
    }

    pub fn response_tap(&self) -> Option<ContentTap> {
        self.response_tap.clone()
    }

    /// Keep the origin's status and headers until the client-facing leg completes.
    pub fn stash_origin_response(&mut self, status: StatusCode, headers: &HeaderMap) {
        self.origin_response = Some(ResponseHead::new(status, headers));
    }

    pub fn has_origin_response(&self) -> bool {
        self.origin_response.is_some()
    }

    /// Remember what the client is about to receive, used when no origin
    /// response was ever stashed.
    pub fn record_client_response(&mut self, status: StatusCode, headers: &HeaderMap) {
        self.client_response = Some(ResponseHead::new(status, headers));
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Client-facing completion. Registers the event on the first call and
    /// releases the exchange state; later calls do nothing.
    pub fn complete(&mut self, completion: Completion) {
        if self.completed {
            return;
        }
        self.completed = true;

        tracing::debug!(
            exchange_id = %self.id,
            method = %self.method,
            uri = %self.uri,
            completion = %completion,
            "Exchange completed"
        );

        match self.assemble() {
            Ok(event) => self.store.register(event),
            Err(e) => tracing::warn!(
                exchange_id = %self.id,
                error = %e,
                "Could not store proxy event in collector"
            ),
        }

        self.release();
    }

    fn assemble(&self) -> Result<ProxyEvent, CorrelationError> {
        let target = resolve_target(&self.method, &self.uri, &self.request_headers)?;

        let request = CapturedRequest {
            timestamp: self.started_at,
            target,
            method: self.method.clone(),
            headers: self.request_headers.clone(),
            body: self.request_tap.as_ref().map(ContentTap::snapshot),
        };

        let head = self
            .origin_response
            .as_ref()
            .or(self.client_response.as_ref());
        let (status, headers) = match head {
            Some(head) => (head.status, head.headers.clone()),
            None => (StatusCode::BAD_GATEWAY, HeaderSet::new()),
        };

        let response = CapturedResponse {
            timestamp: Utc::now(),
            status,
            headers,
            body: self.response_tap.as_ref().map(ContentTap::snapshot),
        };

        Ok(ProxyEvent::new(request, response))
    }

    fn release(&mut self) {
        self.request_tap = None;
        self.response_tap = None;
        self.origin_response = None;
        self.client_response = None;
    }
}

impl Drop for ExchangeContext {
    fn drop(&mut self) {
        self.complete(Completion::Abandoned);
    }
}

impl fmt::Debug for ExchangeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExchangeContext")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("method", &self.method)
            .field("uri", &self.uri)
            .field("completed", &self.completed)
            .finish()
    }
}

/// Absolute target of an exchange.
///
/// Absolute-form URIs are used as received and CONNECT keeps its authority.
/// Origin-form requests are resolved against the `Host` header.
pub(crate) fn resolve_target(
    method: &Method,
    uri: &Uri,
    headers: &HeaderSet,
) -> Result<Uri, CorrelationError> {
    if method == Method::CONNECT {
        return match uri.authority() {
            Some(_) => Ok(uri.clone()),
            None => Err(CorrelationError::MalformedTarget(format!(
                "CONNECT target without authority: {uri}"
            ))),
        };
    }

    if uri.scheme().is_some() && uri.authority().is_some() {
        return Ok(uri.clone());
    }

    let host = headers
        .first(HOST.as_str())
        .filter(|host| !host.trim().is_empty())
        .ok_or_else(|| {
            CorrelationError::MalformedTarget(format!("no authority or Host header for {uri}"))
        })?;

    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");

    Uri::builder()
        .scheme("http")
        .authority(host.trim())
        .path_and_query(path)
        .build()
        .map_err(|e| CorrelationError::MalformedTarget(e.to_string()))
}

/// Client-facing response body that reports the exchange's completion.
pub struct CompletionBody {
    inner: ProxyBody,
    exchange: Option<ExchangeContext>,
}

impl CompletionBody {
    pub fn new(inner: ProxyBody, exchange: ExchangeContext) -> Self {
        Self {
            inner,
            exchange: Some(exchange),
        }
    }

    fn finish(&mut self, completion: Completion) {
        if let Some(mut exchange) = self.exchange.take() {
            exchange.complete(completion);
        }
    }
}

impl Body for CompletionBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let frame = ready!(Pin::new(&mut this.inner).poll_frame(cx));

        match &frame {
            None => this.finish(Completion::Delivered),
            Some(Err(e)) => this.finish(Completion::Failed(e.to_string())),
            Some(Ok(_)) if this.inner.is_end_stream() => this.finish(Completion::Delivered),
            Some(Ok(_)) => {}
        }

        Poll::Ready(frame)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for CompletionBody {
    fn drop(&mut self) {
        // The server drops a body it has fully written without polling it again.
        let completion = if self.inner.is_end_stream() {
            Completion::Delivered
        } else {
            Completion::Abandoned
        };
        self.finish(completion);
    }
}
