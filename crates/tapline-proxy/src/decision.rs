//! Interception decisions for CONNECT requests.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_TYPE, PROXY_AUTHENTICATE};
use http::{HeaderMap, Request, Response, StatusCode};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::body::{self, Body};
use crate::certs::TlsConfigFn;
use crate::ctx::ProxyCtx;

/// What to do with a CONNECT tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectAction {
    /// Dial the origin and relay raw bytes.
    Accept,
    /// Refuse the tunnel.
    Reject,
    /// Terminate TLS at the proxy and filter each request.
    Mitm,
    /// Filter cleartext HTTP carried inside the tunnel.
    PlainMitm,
    /// Hand the client connection to a [`ConnectHijacker`].
    Hijack,
    /// Answer with a `407` challenge, then optionally hand off.
    ProxyAuthHijack,
}

/// Client connection handed to a hijacker.
pub trait ClientIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ClientIo for T {}

/// Takes over a client connection after a CONNECT.
#[async_trait]
pub trait ConnectHijacker: Send + Sync {
    /// Owns `client` from here on; dropping it closes the connection.
    async fn hijack(&self, req: Request<()>, client: Box<dyn ClientIo>, ctx: &mut ProxyCtx);
}

/// A response written verbatim when a tunnel is refused.
#[derive(Debug, Clone)]
pub struct CannedResponse {
    /// Status code.
    pub status: StatusCode,
    /// Headers (framing headers are set when written).
    pub headers: HeaderMap,
    /// Body.
    pub body: Bytes,
}

impl CannedResponse {
    /// Creates a response with an empty body.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// Creates a `text/plain` response.
    pub fn text(status: StatusCode, text: impl Into<String>) -> Self {
        let mut resp = Self::new(status);
        resp.headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        resp.body = Bytes::from(text.into());
        resp
    }

    /// Converts into a message ready to be written.
    pub fn to_response(&self) -> Response<Body> {
        let mut resp = Response::new(body::full(self.body.clone()));
        *resp.status_mut() = self.status;
        *resp.headers_mut() = self.headers.clone();
        resp
    }
}

/// Outcome of the CONNECT filters for one tunnel.
#[derive(Clone)]
pub struct ConnectDecision {
    /// Action taken.
    pub action: ConnectAction,
    /// Server TLS configuration for [`ConnectAction::Mitm`]. `None` uses the
    /// proxy's own CA.
    pub tls_config: Option<TlsConfigFn>,
    /// Response written on [`ConnectAction::Reject`].
    pub reject_response: Option<CannedResponse>,
    /// Hand-off target for the hijack actions.
    pub hijacker: Option<Arc<dyn ConnectHijacker>>,
    /// Realm advertised by [`ConnectAction::ProxyAuthHijack`].
    pub realm: Option<String>,
}

impl fmt::Debug for ConnectDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectDecision")
            .field("action", &self.action)
            .field("tls_config", &self.tls_config.is_some())
            .field("reject_response", &self.reject_response)
            .field("hijacker", &self.hijacker.is_some())
            .field("realm", &self.realm)
            .finish()
    }
}

impl ConnectDecision {
    fn of(action: ConnectAction) -> Self {
        Self {
            action,
            tls_config: None,
            reject_response: None,
            hijacker: None,
            realm: None,
        }
    }

    /// Plain tunnel to the origin.
    pub fn accept() -> Self {
        Self::of(ConnectAction::Accept)
    }

    /// Refuse; the connection is closed without a response unless one is
    /// attached with [`ConnectDecision::with_response`].
    pub fn reject() -> Self {
        Self::of(ConnectAction::Reject)
    }

    /// Intercept TLS using the proxy's CA.
    pub fn mitm() -> Self {
        Self::of(ConnectAction::Mitm)
    }

    /// Intercept cleartext HTTP inside the tunnel.
    pub fn plain_mitm() -> Self {
        Self::of(ConnectAction::PlainMitm)
    }

    /// Hand the raw client connection to `hijacker`.
    pub fn hijack(hijacker: Arc<dyn ConnectHijacker>) -> Self {
        let mut decision = Self::of(ConnectAction::Hijack);
        decision.hijacker = Some(hijacker);
        decision
    }

    /// Challenge for proxy credentials in `realm`.
    pub fn auth_challenge(realm: impl Into<String>) -> Self {
        let mut decision = Self::of(ConnectAction::ProxyAuthHijack);
        decision.realm = Some(realm.into());
        decision
    }

    /// Overrides the TLS configuration used for interception.
    pub fn with_tls_config(mut self, config: TlsConfigFn) -> Self {
        self.tls_config = Some(config);
        self
    }

    /// Attaches the response written when rejecting.
    pub fn with_response(mut self, resp: CannedResponse) -> Self {
        self.reject_response = Some(resp);
        self
    }

    /// Attaches a hijacker (used after an auth challenge).
    pub fn with_hijacker(mut self, hijacker: Arc<dyn ConnectHijacker>) -> Self {
        self.hijacker = Some(hijacker);
        self
    }

    /// Returns true for the actions that read requests out of the tunnel.
    pub fn intercepts(&self) -> bool {
        matches!(self.action, ConnectAction::Mitm | ConnectAction::PlainMitm)
    }
}

/// Builds the `407` sent for [`ConnectAction::ProxyAuthHijack`].
pub fn auth_challenge_response(realm: &str) -> CannedResponse {
    let mut resp = CannedResponse::new(StatusCode::PROXY_AUTHENTICATION_REQUIRED);
    let value = format!("Basic realm=\"{}\"", realm.replace('"', ""));
    if let Ok(value) = HeaderValue::from_str(&value) {
        resp.headers.insert(PROXY_AUTHENTICATE, value);
    }
    resp
}
