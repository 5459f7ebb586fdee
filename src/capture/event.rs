//! Captured request/response pairs.

use super::headers::HeaderSet;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::{Method, StatusCode, Uri};
use std::fmt;

/// The client-to-proxy side of an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedRequest {
    pub timestamp: DateTime<Utc>,
    pub target: Uri,
    pub method: Method,
    pub headers: HeaderSet,
    /// Present only when request capture was on and the exchange was forwarded.
    pub body: Option<Bytes>,
}

/// The origin's response as seen by the proxy, or the proxy's own response when
/// no origin response exists (tunnels, relay failures).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedResponse {
    pub timestamp: DateTime<Utc>,
    pub status: StatusCode,
    pub headers: HeaderSet,
    pub body: Option<Bytes>,
}

/// One completed exchange. Never mutated once registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEvent {
    request: CapturedRequest,
    response: CapturedResponse,
}

impl ProxyEvent {
    pub fn new(request: CapturedRequest, response: CapturedResponse) -> Self {
        Self { request, response }
    }

    pub fn request(&self) -> &CapturedRequest {
        &self.request
    }

    pub fn response(&self) -> &CapturedResponse {
        &self.response
    }

    pub fn method(&self) -> &Method {
        &self.request.method
    }

    pub fn status(&self) -> StatusCode {
        self.response.status
    }

    pub fn is_tunnel(&self) -> bool {
        self.request.method == Method::CONNECT
    }

    /// Request body as UTF-8 text, if it was captured and decodes cleanly.
    pub fn request_text(&self) -> Option<&str> {
        self.request
            .body
            .as_deref()
            .and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn response_text(&self) -> Option<&str> {
        self.response
            .body
            .as_deref()
            .and_then(|b| std::str::from_utf8(b).ok())
    }
}

impl fmt::Display for ProxyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}, {}",
            self.request.method,
            self.request.target,
            self.response.status.as_u16()
        )
    }
}
