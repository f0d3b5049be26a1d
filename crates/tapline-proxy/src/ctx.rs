//! Per-request context handed to every filter.

use std::fmt;
use std::sync::Arc;

use http::{Extensions, HeaderMap, Method, Request, Response, StatusCode, Uri, Version};
use tokio_util::sync::CancellationToken;

use crate::origin::RoundTripper;

/// Snapshot of the request currently travelling through the proxy.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    /// Request method.
    pub method: Method,
    /// Request target (absolute once the proxy has rewritten it).
    pub uri: Uri,
    /// HTTP version spoken by the client.
    pub version: Version,
    /// Request headers as seen by the filters.
    pub headers: HeaderMap,
}

impl RequestInfo {
    /// Captures the head of `req`.
    pub fn of<B>(req: &Request<B>) -> Self {
        Self {
            method: req.method().clone(),
            uri: req.uri().clone(),
            version: req.version(),
            headers: req.headers().clone(),
        }
    }
}

/// Snapshot of the last response seen by the filter chain.
#[derive(Debug, Clone)]
pub struct ResponseInfo {
    /// Response status.
    pub status: StatusCode,
    /// Response headers.
    pub headers: HeaderMap,
}

impl ResponseInfo {
    /// Captures the head of `resp`.
    pub fn of<B>(resp: &Response<B>) -> Self {
        Self {
            status: resp.status(),
            headers: resp.headers().clone(),
        }
    }
}

/// Context of one proxied request.
///
/// A fresh context is created for every inbound request, including each
/// request read from an intercepted tunnel, and dropped once the response has
/// been written.
pub struct ProxyCtx {
    session: u64,
    /// Request being processed.
    pub req: Option<RequestInfo>,
    /// Last response seen by the filter chain.
    pub resp: Option<ResponseInfo>,
    /// Transport error raised while talking to the origin, if any.
    pub error: Option<String>,
    /// Per-request replacement for the shared origin client.
    pub round_tripper: Option<Arc<dyn RoundTripper>>,
    /// Free-form state filters can share between the request and response phase.
    pub extensions: Extensions,
    cancel: CancellationToken,
}

impl fmt::Debug for ProxyCtx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyCtx")
            .field("session", &self.session)
            .field("req", &self.req)
            .field("resp", &self.resp)
            .field("error", &self.error)
            .field("round_tripper", &self.round_tripper.is_some())
            .finish()
    }
}

impl ProxyCtx {
    /// Creates a context for `session` with its own cancellation token.
    pub fn new(session: u64) -> Self {
        Self::with_cancel(session, CancellationToken::new())
    }

    /// Creates a context bound to the cancellation token of its connection.
    pub fn with_cancel(session: u64, cancel: CancellationToken) -> Self {
        Self {
            session,
            req: None,
            resp: None,
            error: None,
            round_tripper: None,
            extensions: Extensions::new(),
            cancel,
        }
    }

    /// Session identifier, unique for the process lifetime.
    pub fn session(&self) -> u64 {
        self.session
    }

    /// Token cancelled when the inbound connection goes away.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Returns true once the inbound connection has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Host the current request is addressed to, without port.
    pub fn host(&self) -> Option<&str> {
        self.req.as_ref().and_then(|r| r.uri.host())
    }
}
