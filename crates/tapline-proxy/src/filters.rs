//! Filter contracts and the chains that drive them.
//!
//! Request filters may replace the request or short-circuit with a canned
//! response. Response filters fold over the response. CONNECT filters pick
//! the interception decision of a tunnel; the first one that answers wins.

use std::sync::Arc;

use async_trait::async_trait;
use http::{Request, Response};
use tracing::trace;

use crate::body::Body;
use crate::ctx::{ProxyCtx, RequestInfo, ResponseInfo};
use crate::decision::ConnectDecision;

/// Inspects or rewrites requests before they reach the origin.
#[async_trait]
pub trait ReqFilter: Send + Sync {
    /// Returns the (possibly rewritten) request and, to skip the origin, a response.
    async fn handle_request(
        &self,
        req: Request<Body>,
        ctx: &mut ProxyCtx,
    ) -> (Request<Body>, Option<Response<Body>>);
}

/// Inspects or rewrites responses before they reach the client.
#[async_trait]
pub trait RespFilter: Send + Sync {
    /// Returns the response to pass on.
    async fn handle_response(&self, resp: Response<Body>, ctx: &mut ProxyCtx) -> Response<Body>;
}

/// Chooses how a CONNECT tunnel is handled.
#[async_trait]
pub trait ConnectFilter: Send + Sync {
    /// Returns a decision, or `None` to defer, plus the host to use.
    async fn handle_connect(&self, host: &str, ctx: &mut ProxyCtx)
        -> (Option<ConnectDecision>, String);
}

#[async_trait]
impl<F> ReqFilter for F
where
    F: Fn(Request<Body>, &mut ProxyCtx) -> (Request<Body>, Option<Response<Body>>) + Send + Sync,
{
    async fn handle_request(
        &self,
        req: Request<Body>,
        ctx: &mut ProxyCtx,
    ) -> (Request<Body>, Option<Response<Body>>) {
        self(req, ctx)
    }
}

#[async_trait]
impl<F> RespFilter for F
where
    F: Fn(Response<Body>, &mut ProxyCtx) -> Response<Body> + Send + Sync,
{
    async fn handle_response(&self, resp: Response<Body>, ctx: &mut ProxyCtx) -> Response<Body> {
        self(resp, ctx)
    }
}

#[async_trait]
impl<F> ConnectFilter for F
where
    F: Fn(&str, &mut ProxyCtx) -> (Option<ConnectDecision>, String) + Send + Sync,
{
    async fn handle_connect(
        &self,
        host: &str,
        ctx: &mut ProxyCtx,
    ) -> (Option<ConnectDecision>, String) {
        self(host, ctx)
    }
}

/// Runs `filters` in order. Stops at the first canned response.
pub async fn run_request_filters(
    filters: &[Arc<dyn ReqFilter>],
    mut req: Request<Body>,
    ctx: &mut ProxyCtx,
) -> (Request<Body>, Option<Response<Body>>) {
    for filter in filters {
        ctx.req = Some(RequestInfo::of(&req));
        let (next, resp) = filter.handle_request(req, ctx).await;
        req = next;
        if let Some(resp) = resp {
            trace!(session = ctx.session(), "Request answered by filter");
            ctx.req = Some(RequestInfo::of(&req));
            return (req, Some(resp));
        }
    }
    ctx.req = Some(RequestInfo::of(&req));
    (req, None)
}

/// Folds `resp` through `filters` in order.
pub async fn run_response_filters(
    filters: &[Arc<dyn RespFilter>],
    mut resp: Response<Body>,
    ctx: &mut ProxyCtx,
) -> Response<Body> {
    for filter in filters {
        ctx.resp = Some(ResponseInfo::of(&resp));
        resp = filter.handle_response(resp, ctx).await;
    }
    ctx.resp = Some(ResponseInfo::of(&resp));
    resp
}

/// Resolves the decision for a CONNECT to `host`.
///
/// The first filter returning a decision wins, together with the host it
/// returned. Without one the tunnel is accepted for the original host.
pub async fn resolve_connect(
    filters: &[Arc<dyn ConnectFilter>],
    host: &str,
    ctx: &mut ProxyCtx,
) -> (ConnectDecision, String) {
    for filter in filters {
        let (decision, resolved) = filter.handle_connect(host, ctx).await;
        if let Some(decision) = decision {
            return (decision, resolved);
        }
    }
    (ConnectDecision::accept(), host.to_string())
}
