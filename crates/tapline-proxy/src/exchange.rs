//! Request/response exchanges on a client connection.
//!
//! The same loop serves the plain proxy port and the inside of intercepted
//! tunnels. Requests are handled strictly one after the other: the next head
//! is not read before the current response has been written out.

use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_TYPE, EXPECT};
use http::{HeaderMap, Method, Request, Response, StatusCode, Uri, Version};
use hyper::upgrade::OnUpgrade;
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, warn, Instrument};

use crate::body::{self, Body};
use crate::ctx::{ProxyCtx, RequestInfo};
use crate::error::{ProxyError, Result};
use crate::filters::{run_request_filters, run_response_filters};
use crate::headers::{
    connection_has_token, is_websocket_upgrade, remove_proxy_headers, strip_response_hop_headers,
};
use crate::http1::{
    check_declared_body, expects_continue, has_body, prepare_response, read_inbound,
    read_request_body, write_response, write_response_head, Framing, Inbound, Persistence,
    CONTINUE_RESPONSE,
};
use crate::origin::{round_trip_or_cancel, RoundTripper};
use crate::proxy::Proxy;

/// Body of the answer to requests that are not addressed to a proxy.
pub const NON_PROXY_MESSAGE: &str =
    "This is a proxy server. Does not respond to non-proxy requests.";

/// Origin a tunnel was opened for; relative request targets resolve against it.
#[derive(Debug, Clone)]
pub(crate) struct Target {
    scheme: &'static str,
    authority: String,
}

impl Target {
    pub(crate) fn https(authority: impl Into<String>) -> Self {
        Self {
            scheme: "https",
            authority: authority.into(),
        }
    }

    pub(crate) fn http(authority: impl Into<String>) -> Self {
        Self {
            scheme: "http",
            authority: authority.into(),
        }
    }

    fn absolute(&self, uri: &Uri) -> Result<Uri> {
        let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
        let uri = Uri::builder()
            .scheme(self.scheme)
            .authority(self.authority.as_str())
            .path_and_query(path)
            .build()?;
        Ok(uri)
    }
}

/// What the connection does after one exchange.
pub(crate) enum Next {
    Continue,
    Close,
    Upgrade(OnUpgrade),
}

/// Why a request loop stopped.
pub(crate) enum LoopEnd {
    /// Client closed, an error aborted the loop, or the proxy is shutting down.
    Closed,
    /// An HTTP/2 client preface was consumed.
    H2Preface,
    /// A WebSocket handshake completed; the connection now carries raw bytes.
    Upgrade(OnUpgrade),
    /// A CONNECT request head; its body (if any) has not been read.
    Connect(Request<()>),
}

/// Settings of one request loop.
pub(crate) struct Exchange<'a> {
    proxy: &'a Proxy,
    target: Option<&'a Target>,
    transport: &'a dyn RoundTripper,
}

impl<'a> Exchange<'a> {
    /// Requests read from the proxy port itself.
    pub(crate) fn plain(proxy: &'a Proxy, transport: &'a dyn RoundTripper) -> Self {
        Self {
            proxy,
            target: None,
            transport,
        }
    }

    /// Requests read from inside a tunnel to `target`.
    pub(crate) fn tunnel(
        proxy: &'a Proxy,
        target: &'a Target,
        transport: &'a dyn RoundTripper,
    ) -> Self {
        Self {
            proxy,
            target: Some(target),
            transport,
        }
    }

    fn persistence(&self, version: Version, headers: &HeaderMap) -> Persistence {
        if version == Version::HTTP_10 {
            Persistence::Http10
        } else if self.target.is_some() || connection_has_token(headers, "close") {
            Persistence::Close
        } else {
            Persistence::KeepAlive
        }
    }

    fn next(&self, persistence: Persistence, framing: Framing) -> Next {
        match (framing, persistence) {
            (Framing::UntilClose, _) => Next::Close,
            (_, Persistence::KeepAlive) => Next::Continue,
            // Tunnels advertise close but keep reading until the client leaves.
            _ if self.target.is_some() => Next::Continue,
            _ => Next::Close,
        }
    }

    /// Serves requests from `stream` until something ends the loop.
    pub(crate) async fn serve_requests<T>(
        &self,
        stream: &mut T,
        conn: &CancellationToken,
    ) -> LoopEnd
    where
        T: AsyncBufRead + AsyncWrite + Unpin + Send,
    {
        let max_head = self.proxy.config().max_head_bytes;
        loop {
            let inbound = tokio::select! {
                res = read_inbound(stream, max_head) => res,
                _ = conn.cancelled() => return LoopEnd::Closed,
            };
            let head = match inbound {
                Ok(Inbound::Request(head)) if head.method() == Method::CONNECT => {
                    return LoopEnd::Connect(head);
                }
                Ok(Inbound::Request(head)) => head,
                Ok(Inbound::H2Preface) => return LoopEnd::H2Preface,
                Ok(Inbound::Eof) => return LoopEnd::Closed,
                Err(e) => {
                    if !e.is_eof() {
                        debug!("Cannot read request: {}", e);
                    }
                    return LoopEnd::Closed;
                }
            };

            let mut ctx = self.proxy.new_ctx(conn.child_token());
            let span = debug_span!("request", session = ctx.session());
            match self.serve(stream, head, &mut ctx).instrument(span).await {
                Ok(Next::Continue) => {}
                Ok(Next::Close) => return LoopEnd::Closed,
                Ok(Next::Upgrade(on_upgrade)) => return LoopEnd::Upgrade(on_upgrade),
                Err(e) => {
                    if !e.is_eof() {
                        debug!(session = ctx.session(), "Exchange aborted: {}", e);
                    }
                    return LoopEnd::Closed;
                }
            }
        }
    }

    /// Runs one request through the filters and the origin, then writes the response.
    pub(crate) async fn serve<T>(
        &self,
        stream: &mut T,
        head: Request<()>,
        ctx: &mut ProxyCtx,
    ) -> Result<Next>
    where
        T: AsyncBufRead + AsyncWrite + Unpin + Send,
    {
        let config = self.proxy.config();
        let title_case = config.preserve_header_case;

        let body = match self.read_body(stream, &head).await {
            Ok(body) => body,
            Err(ProxyError::BodyTooLarge { len, max }) => {
                debug!("Refusing request body of {} bytes (limit {})", len, max);
                let persistence = match self.persistence(head.version(), head.headers()) {
                    Persistence::Http10 => Persistence::Http10,
                    _ => Persistence::Close,
                };
                let resp = text_response(
                    StatusCode::PAYLOAD_TOO_LARGE,
                    format!("request body exceeds {} bytes", max),
                );
                write_response(stream, resp, head.method(), persistence, title_case).await?;
                return Ok(Next::Close);
            }
            Err(e) => return Err(e),
        };
        let (mut parts, ()) = head.into_parts();
        // Already answered here; the origin gets the complete body.
        parts.headers.remove(EXPECT);
        let method = parts.method.clone();
        let persistence = self.persistence(parts.version, &parts.headers);

        if parts.uri.authority().is_none() {
            match self.target {
                Some(target) => parts.uri = target.absolute(&parts.uri)?,
                None => {
                    debug!("Non-proxy request for {}", parts.uri);
                    let resp = text_response(StatusCode::INTERNAL_SERVER_ERROR, NON_PROXY_MESSAGE);
                    let framing =
                        write_response(stream, resp, &method, persistence, title_case).await?;
                    return Ok(self.next(persistence, framing));
                }
            }
        }

        let mut req = Request::from_parts(parts, body::full(body));
        remove_proxy_headers(req.headers_mut(), config.keep_accept_encoding);
        ctx.req = Some(RequestInfo::of(&req));
        debug!("{} {}", req.method(), req.uri());

        let (req, canned) = run_request_filters(&self.proxy.req_filters, req, ctx).await;
        let resp = match canned {
            Some(resp) => resp,
            None => {
                let round_tripper = ctx.round_tripper.clone();
                let res = match &round_tripper {
                    Some(rt) => round_trip_or_cancel(rt.as_ref(), req, ctx, stream).await,
                    None => round_trip_or_cancel(self.transport, req, ctx, stream).await,
                };
                match res {
                    Ok(mut resp) => {
                        if !config.keep_destination_headers {
                            strip_response_hop_headers(&mut resp);
                        }
                        resp
                    }
                    Err(ProxyError::Cancelled) => return Err(ProxyError::Cancelled),
                    Err(e) => {
                        warn!("Origin request failed: {}", e);
                        ctx.error = Some(e.to_string());
                        let resp = text_response(StatusCode::BAD_GATEWAY, e.to_string());
                        let persistence = match persistence {
                            Persistence::Http10 => Persistence::Http10,
                            _ => Persistence::Close,
                        };
                        write_response(stream, resp, &method, persistence, title_case).await?;
                        return Ok(Next::Close);
                    }
                }
            }
        };

        let mut resp = run_response_filters(&self.proxy.resp_filters, resp, ctx).await;
        debug!("{} response", resp.status());

        if is_websocket_upgrade(&resp) {
            let on_upgrade = hyper::upgrade::on(&mut resp);
            prepare_response(&mut resp, &method, persistence);
            write_response_head(stream, &resp, title_case).await?;
            return Ok(Next::Upgrade(on_upgrade));
        }

        let framing = write_response(stream, resp, &method, persistence, title_case).await?;
        Ok(self.next(persistence, framing))
    }

    /// Reads the request body, sending `100 Continue` first when the client waits for it.
    ///
    /// A declared length above the limit fails before the interim response,
    /// so the client never starts an upload that would be refused.
    async fn read_body<T>(&self, stream: &mut T, head: &Request<()>) -> Result<Bytes>
    where
        T: AsyncBufRead + AsyncWrite + Unpin + Send,
    {
        let max_body = self.proxy.config().max_body_bytes;
        let headers = head.headers();
        if head.version() == Version::HTTP_11 && expects_continue(headers) && has_body(headers) {
            check_declared_body(headers, max_body)?;
            stream.write_all(CONTINUE_RESPONSE).await?;
            stream.flush().await?;
        }
        read_request_body(stream, headers, max_body).await
    }
}

/// Builds a `text/plain` response.
pub fn text_response(status: StatusCode, text: impl Into<String>) -> Response<Body> {
    let mut resp = Response::new(body::full(text.into()));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp
}
