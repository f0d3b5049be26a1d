//! CONNECT handling.
//!
//! The flow is:
//!
//! 1. Client sends: `CONNECT api.example.com:443 HTTP/1.1`
//! 2. The CONNECT filters pick a [`ConnectDecision`], once per tunnel
//! 3. Accept: dial, answer `200 Connection established`, relay raw bytes
//! 4. Intercept: answer `200 OK`, then read requests out of the tunnel
//! 5. Reject or hand off: no origin is ever dialed
//!
//! Failures before a success line reaches the client go through the
//! [`ConnectErrorHandler`]; afterwards they are only logged.

use std::sync::Arc;

use async_trait::async_trait;
use http::header::{HeaderValue, CONTENT_LENGTH, HOST};
use http::{Request, Response};
use tokio::io::{AsyncWrite, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument, Span};

use crate::body;
use crate::certs::strip_port;
use crate::ctx::{ProxyCtx, RequestInfo};
use crate::decision::{auth_challenge_response, ConnectAction, ConnectDecision};
use crate::error::{ProxyError, Result};
use crate::filters::resolve_connect;
use crate::http1::{encode_response_head, write_canned_response};
use crate::mitm;
use crate::origin::dial_tcp;
use crate::proxy::Proxy;
use crate::relay::{flush_leftover, relay_streams, relay_tcp, ClientStream};

/// Written before relaying an accepted tunnel.
pub const TUNNEL_ESTABLISHED: &[u8] = b"HTTP/1.0 200 Connection established\r\n\r\n";

/// Written before reading requests out of an intercepted tunnel.
pub const INTERCEPT_ESTABLISHED: &[u8] = b"HTTP/1.0 200 OK\r\n\r\n";

/// Port assumed when a CONNECT target has none.
pub const DEFAULT_CONNECT_PORT: u16 = 443;

const DEFAULT_REALM: &str = "tapline";

/// Emits the client-visible error when a tunnel cannot be established.
#[async_trait]
pub trait ConnectErrorHandler: Send + Sync {
    /// Writes whatever the client should see. The connection is closed afterwards.
    async fn handle_error(
        &self,
        client: &mut (dyn AsyncWrite + Unpin + Send),
        ctx: &ProxyCtx,
        err: &ProxyError,
    );
}

/// Default error handler: a bare `502` carrying the error text.
#[derive(Debug, Default, Clone, Copy)]
pub struct BadGatewayHandler;

#[async_trait]
impl ConnectErrorHandler for BadGatewayHandler {
    async fn handle_error(
        &self,
        client: &mut (dyn AsyncWrite + Unpin + Send),
        ctx: &ProxyCtx,
        err: &ProxyError,
    ) {
        let mut out = b"HTTP/1.1 502 Bad Gateway\r\n\r\n".to_vec();
        out.extend_from_slice(err.to_string().as_bytes());
        if let Err(e) = client.write_all(&out).await {
            debug!(session = ctx.session(), "Cannot write error response: {}", e);
            return;
        }
        let _ = client.flush().await;
    }
}

/// Extracts the `host:port` a CONNECT asks for.
pub fn connect_target<B>(req: &Request<B>) -> Result<String> {
    let authority = match req.uri().authority() {
        Some(authority) => authority.as_str().to_string(),
        None => req
            .headers()
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_string())
            .ok_or_else(|| ProxyError::InvalidConnect("missing target authority".into()))?,
    };
    if authority.is_empty() {
        return Err(ProxyError::InvalidConnect("empty target authority".into()));
    }
    Ok(with_default_port(&authority, DEFAULT_CONNECT_PORT))
}

/// Appends `:port` to `host` unless it already names one.
pub fn with_default_port(host: &str, port: u16) -> String {
    let has_port = if host.starts_with('[') {
        !host.ends_with(']')
    } else {
        strip_port(host).len() != host.len()
    };
    if has_port {
        host.to_string()
    } else {
        format!("{}:{}", host, port)
    }
}

/// Serves a CONNECT request read off `client`.
///
/// Returns once the tunnel has been handed to its own task, refused, or
/// taken over by a hijacker.
pub(crate) async fn handle_connect<S: ClientStream>(
    proxy: Arc<Proxy>,
    req: Request<()>,
    mut client: BufReader<S>,
    conn: CancellationToken,
) {
    let mut ctx = proxy.new_ctx(conn.clone());
    ctx.req = Some(RequestInfo::of(&req));

    let target = match connect_target(&req) {
        Ok(target) => target,
        Err(e) => {
            warn!(session = ctx.session(), "{}", e);
            proxy.report_error(&mut client, &ctx, &e).await;
            return;
        }
    };

    let span = info_span!("connect", session = ctx.session(), target = %target);
    async move {
        let (decision, host) = resolve_connect(&proxy.connect_filters, &target, &mut ctx).await;
        let host = with_default_port(&host, DEFAULT_CONNECT_PORT);
        if host != target {
            debug!("CONNECT target rewritten to {}", host);
        }

        match decision.action {
            ConnectAction::Accept => {
                info!("Tunneling to {}", host);
                tunnel(&proxy, client, host, &ctx).await;
            }
            ConnectAction::Reject => {
                info!("Rejecting CONNECT to {}", host);
                reject(&proxy, client, &decision, &ctx).await;
            }
            ConnectAction::Mitm => {
                info!("Intercepting TLS for {}", host);
                if let Err(e) = write_established(&mut client, INTERCEPT_ESTABLISHED).await {
                    debug!("Cannot confirm tunnel: {}", e);
                    return;
                }
                let tls_config = decision
                    .tls_config
                    .unwrap_or_else(|| proxy.tls_config.clone());
                tokio::spawn(
                    mitm::intercept_tls(proxy, client, host, tls_config, ctx)
                        .instrument(Span::current()),
                );
            }
            ConnectAction::PlainMitm => {
                info!("Intercepting cleartext HTTP for {}", host);
                if let Err(e) = write_established(&mut client, INTERCEPT_ESTABLISHED).await {
                    debug!("Cannot confirm tunnel: {}", e);
                    return;
                }
                tokio::spawn(
                    mitm::intercept_plain(proxy, client, host, conn).instrument(Span::current()),
                );
            }
            ConnectAction::Hijack => match decision.hijacker {
                Some(hijacker) => {
                    debug!("Handing CONNECT to {} over to hijacker", host);
                    hijacker.hijack(req, Box::new(client), &mut ctx).await;
                }
                None => warn!("Hijack decision without a hijacker, closing"),
            },
            ConnectAction::ProxyAuthHijack => {
                let realm = decision.realm.as_deref().unwrap_or(DEFAULT_REALM);
                let challenge = auth_challenge_response(realm).to_response();
                let title_case = proxy.config().preserve_header_case;
                match decision.hijacker {
                    Some(hijacker) => {
                        let (mut parts, _) = challenge.into_parts();
                        parts.headers.insert(CONTENT_LENGTH, HeaderValue::from(0));
                        let head =
                            encode_response_head(&Response::from_parts(parts, ()), title_case);
                        if let Err(e) = write_established(&mut client, &head).await {
                            debug!("Cannot write proxy auth challenge: {}", e);
                            return;
                        }
                        hijacker.hijack(req, Box::new(client), &mut ctx).await;
                    }
                    None => {
                        if let Err(e) = write_canned_response(&mut client, challenge, title_case).await {
                            debug!("Cannot write proxy auth challenge: {}", e);
                        }
                        let _ = client.shutdown().await;
                    }
                }
            }
        }
    }
    .instrument(span)
    .await
}

async fn write_established<W>(client: &mut W, line: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    client.write_all(line).await?;
    client.flush().await
}

async fn tunnel<S: ClientStream>(
    proxy: &Proxy,
    mut client: BufReader<S>,
    host: String,
    ctx: &ProxyCtx,
) {
    let mut origin = match dial_tcp(&host, proxy.config().connect_timeout).await {
        Ok(origin) => origin,
        Err(e) => {
            warn!("Cannot dial {}: {}", host, e);
            proxy.report_error(&mut client, ctx, &e).await;
            return;
        }
    };

    if let Err(e) = write_established(&mut client, TUNNEL_ESTABLISHED).await {
        debug!("Cannot confirm tunnel: {}", e);
        return;
    }
    if let Err(e) = flush_leftover(client.buffer(), &mut origin).await {
        debug!("Cannot forward early client bytes to {}: {}", host, e);
        return;
    }

    let client = client.into_inner();
    tokio::spawn(
        async move {
            let stats = match client.into_tcp() {
                Ok(tcp) => relay_tcp(tcp, origin).await,
                Err(stream) => relay_streams(stream, origin).await,
            };
            debug!(
                "Tunnel to {} closed ({} bytes sent, {} bytes received)",
                host, stats.sent, stats.received
            );
        }
        .instrument(Span::current()),
    );
}

async fn reject<S: ClientStream>(
    proxy: &Proxy,
    mut client: BufReader<S>,
    decision: &ConnectDecision,
    ctx: &ProxyCtx,
) {
    let title_case = proxy.config().preserve_header_case;
    let resp = match (&decision.reject_response, &ctx.resp) {
        (Some(canned), _) => Some(canned.to_response()),
        (None, Some(info)) => {
            let mut resp = Response::new(body::empty());
            *resp.status_mut() = info.status;
            *resp.headers_mut() = info.headers.clone();
            Some(resp)
        }
        (None, None) => None,
    };

    if let Some(resp) = resp {
        if let Err(e) = write_canned_response(&mut client, resp, title_case).await {
            debug!("Cannot write rejection: {}", e);
        }
    }
    let _ = client.shutdown().await;
}
