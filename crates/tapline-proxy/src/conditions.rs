//! Ready-made conditions and decision filters.
//!
//! ```ignore
//! proxy.on_request(when(dst_host_is(["example.com"]), block_filter));
//! proxy.on_connect(connect_when(Regex::new(r"^.*:443$")?, ConnectDecision::mitm()));
//! ```

use async_trait::async_trait;
use http::header::{CONTENT_TYPE, HOST};
use http::{Request, Response, StatusCode};
use regex::Regex;

use crate::body::Body;
use crate::certs::strip_port;
use crate::ctx::ProxyCtx;
use crate::decision::ConnectDecision;
use crate::filters::{ConnectFilter, ReqFilter, RespFilter};

/// Predicate over requests.
pub trait ReqCondition: Send + Sync {
    /// Returns true if `req` matches.
    fn matches_request(&self, req: &Request<Body>, ctx: &ProxyCtx) -> bool;
}

/// Predicate over responses.
pub trait RespCondition: Send + Sync {
    /// Returns true if `resp` matches.
    fn matches_response(&self, resp: &Response<Body>, ctx: &ProxyCtx) -> bool;
}

impl<F> ReqCondition for F
where
    F: Fn(&Request<Body>, &ProxyCtx) -> bool + Send + Sync,
{
    fn matches_request(&self, req: &Request<Body>, ctx: &ProxyCtx) -> bool {
        self(req, ctx)
    }
}

/// `host:port` (or bare host) a request is addressed to.
fn request_authority(req: &Request<Body>) -> Option<&str> {
    req.uri()
        .authority()
        .map(|a| a.as_str())
        .or_else(|| req.headers().get(HOST).and_then(|v| v.to_str().ok()))
}

/// Host and path of a request, without scheme or query.
fn host_and_path(req: &Request<Body>) -> String {
    format!(
        "{}{}",
        request_authority(req).unwrap_or(""),
        req.uri().path()
    )
}

/// Matches requests to one of the given hosts (port ignored, case-insensitive).
#[derive(Debug, Clone)]
pub struct DstHostIs(Vec<String>);

/// See [`DstHostIs`].
pub fn dst_host_is<I, S>(hosts: I) -> DstHostIs
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    DstHostIs(hosts.into_iter().map(|h| h.into().to_ascii_lowercase()).collect())
}

impl DstHostIs {
    fn matches_host(&self, host: Option<&str>) -> bool {
        host.map(strip_port)
            .map(|h| self.0.iter().any(|c| c.eq_ignore_ascii_case(h)))
            .unwrap_or(false)
    }
}

impl ReqCondition for DstHostIs {
    fn matches_request(&self, req: &Request<Body>, _ctx: &ProxyCtx) -> bool {
        self.matches_host(request_authority(req))
    }
}

impl RespCondition for DstHostIs {
    fn matches_response(&self, _resp: &Response<Body>, ctx: &ProxyCtx) -> bool {
        self.matches_host(ctx.host())
    }
}

/// Matches requests whose `host[:port]` matches a regex.
#[derive(Debug, Clone)]
pub struct DstHostMatches(Regex);

/// See [`DstHostMatches`].
pub fn dst_host_matches(re: Regex) -> DstHostMatches {
    DstHostMatches(re)
}

impl ReqCondition for DstHostMatches {
    fn matches_request(&self, req: &Request<Body>, _ctx: &ProxyCtx) -> bool {
        request_authority(req)
            .map(|h| self.0.is_match(h))
            .unwrap_or(false)
    }
}

impl RespCondition for DstHostMatches {
    fn matches_response(&self, _resp: &Response<Body>, ctx: &ProxyCtx) -> bool {
        ctx.req
            .as_ref()
            .and_then(|r| r.uri.authority())
            .map(|a| self.0.is_match(a.as_str()))
            .unwrap_or(false)
    }
}

/// Matches requests whose URL starts with a prefix.
///
/// The prefix is compared against the full URL and against `host/path`, so
/// both `https://example.com/api` and `example.com/api` work.
#[derive(Debug, Clone)]
pub struct UrlHasPrefix(String);

/// See [`UrlHasPrefix`].
pub fn url_has_prefix(prefix: impl Into<String>) -> UrlHasPrefix {
    UrlHasPrefix(prefix.into())
}

impl ReqCondition for UrlHasPrefix {
    fn matches_request(&self, req: &Request<Body>, _ctx: &ProxyCtx) -> bool {
        req.uri().to_string().starts_with(&self.0) || host_and_path(req).starts_with(&self.0)
    }
}

/// Matches requests whose `host/path` matches a regex.
#[derive(Debug, Clone)]
pub struct UrlMatches(Regex);

/// See [`UrlMatches`].
pub fn url_matches(re: Regex) -> UrlMatches {
    UrlMatches(re)
}

impl ReqCondition for UrlMatches {
    fn matches_request(&self, req: &Request<Body>, _ctx: &ProxyCtx) -> bool {
        self.0.is_match(req.uri().path()) || self.0.is_match(&host_and_path(req))
    }
}

/// Matches responses with one of the given status codes.
#[derive(Debug, Clone)]
pub struct StatusCodeIs(Vec<StatusCode>);

/// See [`StatusCodeIs`].
pub fn status_code_is(codes: impl IntoIterator<Item = StatusCode>) -> StatusCodeIs {
    StatusCodeIs(codes.into_iter().collect())
}

impl RespCondition for StatusCodeIs {
    fn matches_response(&self, resp: &Response<Body>, _ctx: &ProxyCtx) -> bool {
        self.0.contains(&resp.status())
    }
}

/// Matches responses whose media type (parameters ignored) is one of the given.
#[derive(Debug, Clone)]
pub struct ContentTypeIs(Vec<String>);

/// See [`ContentTypeIs`].
pub fn content_type_is<I, S>(types: I) -> ContentTypeIs
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    ContentTypeIs(types.into_iter().map(Into::into).collect())
}

impl RespCondition for ContentTypeIs {
    fn matches_response(&self, resp: &Response<Body>, _ctx: &ProxyCtx) -> bool {
        let Some(value) = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
        else {
            return false;
        };
        let media = value.split(';').next().unwrap_or("").trim();
        self.0.iter().any(|t| t.eq_ignore_ascii_case(media))
    }
}

/// Applies `filter` only when `condition` holds.
pub struct When<C, F> {
    condition: C,
    filter: F,
}

/// See [`When`].
pub fn when<C, F>(condition: C, filter: F) -> When<C, F> {
    When { condition, filter }
}

#[async_trait]
impl<C, F> ReqFilter for When<C, F>
where
    C: ReqCondition,
    F: ReqFilter,
{
    async fn handle_request(
        &self,
        req: Request<Body>,
        ctx: &mut ProxyCtx,
    ) -> (Request<Body>, Option<Response<Body>>) {
        if self.condition.matches_request(&req, ctx) {
            self.filter.handle_request(req, ctx).await
        } else {
            (req, None)
        }
    }
}

#[async_trait]
impl<C, F> RespFilter for When<C, F>
where
    C: RespCondition,
    F: RespFilter,
{
    async fn handle_response(&self, resp: Response<Body>, ctx: &mut ProxyCtx) -> Response<Body> {
        if self.condition.matches_response(&resp, ctx) {
            self.filter.handle_response(resp, ctx).await
        } else {
            resp
        }
    }
}

/// Returns `decision` for CONNECT targets matching a regex, defers otherwise.
#[derive(Debug, Clone)]
pub struct ConnectWhen {
    host: Regex,
    decision: ConnectDecision,
}

/// See [`ConnectWhen`]. The regex sees `host:port` as sent by the client.
pub fn connect_when(host: Regex, decision: ConnectDecision) -> ConnectWhen {
    ConnectWhen { host, decision }
}

#[async_trait]
impl ConnectFilter for ConnectWhen {
    async fn handle_connect(
        &self,
        host: &str,
        _ctx: &mut ProxyCtx,
    ) -> (Option<ConnectDecision>, String) {
        if self.host.is_match(host) {
            (Some(self.decision.clone()), host.to_string())
        } else {
            (None, host.to_string())
        }
    }
}

/// Returns the same decision for every CONNECT.
#[derive(Debug, Clone)]
pub struct AlwaysDecide(ConnectDecision);

#[async_trait]
impl ConnectFilter for AlwaysDecide {
    async fn handle_connect(
        &self,
        host: &str,
        _ctx: &mut ProxyCtx,
    ) -> (Option<ConnectDecision>, String) {
        (Some(self.0.clone()), host.to_string())
    }
}

/// Applies `decision` to every tunnel.
pub fn always(decision: ConnectDecision) -> AlwaysDecide {
    AlwaysDecide(decision)
}

/// Intercepts every tunnel with TLS.
pub fn always_mitm() -> AlwaysDecide {
    always(ConnectDecision::mitm())
}

/// Intercepts every tunnel as cleartext HTTP.
pub fn always_plain_mitm() -> AlwaysDecide {
    always(ConnectDecision::plain_mitm())
}

/// Rejects every tunnel.
pub fn always_reject() -> AlwaysDecide {
    always(ConnectDecision::reject())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body;
    use crate::ctx::RequestInfo;
    use crate::decision::ConnectAction;
    use crate::filters::{run_request_filters, run_response_filters};
    use http::HeaderValue;
    use std::sync::Arc;

    type ReqOut = (Request<Body>, Option<Response<Body>>);

    fn get(uri: &str) -> Request<Body> {
        Request::get(uri).body(body::empty()).unwrap()
    }

    #[test]
    fn host_conditions() {
        let ctx = ProxyCtx::new(1);
        let cond = dst_host_is(["Example.com"]);
        assert!(cond.matches_request(&get("https://example.com:443/x"), &ctx));
        assert!(!cond.matches_request(&get("https://other.com/x"), &ctx));

        let relative = Request::get("/x")
            .header("host", "example.com:8080")
            .body(body::empty())
            .unwrap();
        assert!(cond.matches_request(&relative, &ctx));

        let re = dst_host_matches(Regex::new(r"\.example\.com:443$").unwrap());
        assert!(re.matches_request(&get("https://api.example.com:443/"), &ctx));
        assert!(!re.matches_request(&get("https://api.example.com/"), &ctx));
    }

    #[test]
    fn url_conditions() {
        let ctx = ProxyCtx::new(1);
        let req = get("https://example.com/api/v1/items?x=1");

        assert!(url_has_prefix("https://example.com/api").matches_request(&req, &ctx));
        assert!(url_has_prefix("example.com/api").matches_request(&req, &ctx));
        assert!(!url_has_prefix("example.com/web").matches_request(&req, &ctx));

        assert!(url_matches(Regex::new(r"^/api/v\d+/").unwrap()).matches_request(&req, &ctx));
        assert!(url_matches(Regex::new(r"^example\.com/api").unwrap()).matches_request(&req, &ctx));
    }

    #[test]
    fn response_conditions() {
        let mut ctx = ProxyCtx::new(1);
        ctx.req = Some(RequestInfo::of(&get("https://example.com/")));
        let resp = Response::builder()
            .status(404)
            .header("content-type", "Text/HTML; charset=utf-8")
            .body(body::empty())
            .unwrap();

        assert!(status_code_is([StatusCode::NOT_FOUND]).matches_response(&resp, &ctx));
        assert!(!status_code_is([StatusCode::OK]).matches_response(&resp, &ctx));
        assert!(content_type_is(["text/html"]).matches_response(&resp, &ctx));
        assert!(!content_type_is(["application/json"]).matches_response(&resp, &ctx));
        assert!(dst_host_is(["example.com"]).matches_response(&resp, &ctx));
    }

    #[tokio::test]
    async fn when_gates_request_filter() {
        let tag = |mut req: Request<Body>, _ctx: &mut ProxyCtx| -> ReqOut {
            req.headers_mut().insert("x-seen", HeaderValue::from_static("1"));
            (req, None)
        };
        let filters: Vec<Arc<dyn ReqFilter>> =
            vec![Arc::new(when(dst_host_is(["a.test"]), tag))];
        let mut ctx = ProxyCtx::new(1);

        let (req, _) = run_request_filters(&filters, get("http://a.test/"), &mut ctx).await;
        assert!(req.headers().contains_key("x-seen"));

        let (req, _) = run_request_filters(&filters, get("http://b.test/"), &mut ctx).await;
        assert!(!req.headers().contains_key("x-seen"));
    }

    #[tokio::test]
    async fn when_gates_response_filter() {
        let tag = |mut resp: Response<Body>, _ctx: &mut ProxyCtx| -> Response<Body> {
            resp.headers_mut().insert("x-seen", HeaderValue::from_static("1"));
            resp
        };
        let filters: Vec<Arc<dyn RespFilter>> =
            vec![Arc::new(when(status_code_is([StatusCode::OK]), tag))];
        let mut ctx = ProxyCtx::new(1);

        let resp = run_response_filters(&filters, Response::new(body::empty()), &mut ctx).await;
        assert!(resp.headers().contains_key("x-seen"));
    }

    #[tokio::test]
    async fn connect_when_matches_host() {
        let filter = connect_when(Regex::new(r"^secure\.").unwrap(), ConnectDecision::mitm());
        let mut ctx = ProxyCtx::new(1);

        let (decision, _) = filter.handle_connect("secure.test:443", &mut ctx).await;
        assert_eq!(decision.unwrap().action, ConnectAction::Mitm);
        let (decision, host) = filter.handle_connect("other.test:443", &mut ctx).await;
        assert!(decision.is_none());
        assert_eq!(host, "other.test:443");
    }

    #[tokio::test]
    async fn always_filters() {
        let mut ctx = ProxyCtx::new(1);
        let (d, _) = always_reject().handle_connect("x:443", &mut ctx).await;
        assert_eq!(d.unwrap().action, ConnectAction::Reject);
        let (d, _) = always_plain_mitm().handle_connect("x:80", &mut ctx).await;
        assert_eq!(d.unwrap().action, ConnectAction::PlainMitm);
        let (d, _) = always_mitm().handle_connect("x:443", &mut ctx).await;
        assert_eq!(d.unwrap().action, ConnectAction::Mitm);
    }
}
