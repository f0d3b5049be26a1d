//! Header hygiene shared by the tunnel loop and the plain HTTP path.

use http::header::{
    HeaderMap, HeaderName, ACCEPT_ENCODING, CONNECTION, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION,
    TE, TRAILER, TRANSFER_ENCODING, UPGRADE,
};
use http::{Response, StatusCode};

const PROXY_CONNECTION: &str = "proxy-connection";
const KEEP_ALIVE: &str = "keep-alive";

/// Returns true if `headers` ask for a WebSocket upgrade.
pub fn is_websocket_request(headers: &HeaderMap) -> bool {
    connection_has_token(headers, "upgrade")
        && headers
            .get(UPGRADE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().eq_ignore_ascii_case("websocket"))
            .unwrap_or(false)
}

/// Returns true if `resp` completes a WebSocket handshake.
pub fn is_websocket_upgrade<B>(resp: &Response<B>) -> bool {
    resp.status() == StatusCode::SWITCHING_PROTOCOLS && is_websocket_request(resp.headers())
}

/// Returns true if a `Connection` header of `headers` lists `token`.
pub fn connection_has_token(headers: &HeaderMap, token: &str) -> bool {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

/// Removes headers that only concern the client-to-proxy hop.
///
/// WebSocket handshakes keep `Connection` and `Upgrade` so the origin sees
/// the upgrade request.
pub fn remove_proxy_headers(headers: &mut HeaderMap, keep_accept_encoding: bool) {
    if !keep_accept_encoding {
        headers.remove(ACCEPT_ENCODING);
    }
    headers.remove(PROXY_CONNECTION);
    headers.remove(PROXY_AUTHENTICATE);
    headers.remove(PROXY_AUTHORIZATION);

    if is_websocket_request(headers) {
        return;
    }
    remove_hop_by_hop(headers);
    headers.remove(UPGRADE);
}

/// Drops hop-by-hop headers an origin sent back.
///
/// `Upgrade` and `Connection` survive on 101 responses.
pub fn strip_response_hop_headers<B>(resp: &mut Response<B>) {
    if resp.status() == StatusCode::SWITCHING_PROTOCOLS {
        return;
    }
    let headers = resp.headers_mut();
    headers.remove(PROXY_CONNECTION);
    headers.remove(PROXY_AUTHENTICATE);
    remove_hop_by_hop(headers);
    headers.remove(UPGRADE);
}

fn remove_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|t| HeaderName::from_bytes(t.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    headers.remove(CONNECTION);
    headers.remove(KEEP_ALIVE);
    headers.remove(TE);
    headers.remove(TRAILER);
    headers.remove(TRANSFER_ENCODING);
}

/// Canonical Title-Case form of a header name (`content-type` -> `Content-Type`).
pub fn title_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for c in name.chars() {
        if upper {
            out.extend(c.to_uppercase());
        } else {
            out.push(c);
        }
        upper = c == '-';
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.append(
                HeaderName::from_bytes(k.as_bytes()).unwrap(),
                HeaderValue::from_str(v).unwrap(),
            );
        }
        map
    }

    #[test]
    fn detects_websocket_request() {
        let map = headers(&[("connection", "keep-alive, Upgrade"), ("upgrade", "WebSocket")]);
        assert!(is_websocket_request(&map));

        let map = headers(&[("upgrade", "websocket")]);
        assert!(!is_websocket_request(&map));
    }

    #[test]
    fn websocket_upgrade_requires_101() {
        let resp = Response::builder()
            .status(200)
            .header("connection", "upgrade")
            .header("upgrade", "websocket")
            .body(())
            .unwrap();
        assert!(!is_websocket_upgrade(&resp));

        let resp = Response::builder()
            .status(101)
            .header("connection", "upgrade")
            .header("upgrade", "websocket")
            .body(())
            .unwrap();
        assert!(is_websocket_upgrade(&resp));
    }

    #[test]
    fn strips_proxy_headers() {
        let mut map = headers(&[
            ("proxy-connection", "keep-alive"),
            ("proxy-authorization", "Basic Zm9vOmJhcg=="),
            ("connection", "close, x-hop"),
            ("x-hop", "1"),
            ("accept-encoding", "gzip"),
            ("x-keep", "1"),
        ]);
        remove_proxy_headers(&mut map, false);

        assert!(map.get("proxy-connection").is_none());
        assert!(map.get("proxy-authorization").is_none());
        assert!(map.get("connection").is_none());
        assert!(map.get("x-hop").is_none());
        assert!(map.get("accept-encoding").is_none());
        assert_eq!(map["x-keep"], "1");
    }

    #[test]
    fn keeps_accept_encoding_when_asked() {
        let mut map = headers(&[("accept-encoding", "gzip")]);
        remove_proxy_headers(&mut map, true);
        assert_eq!(map["accept-encoding"], "gzip");
    }

    #[test]
    fn websocket_request_keeps_upgrade_headers() {
        let mut map = headers(&[("connection", "Upgrade"), ("upgrade", "websocket")]);
        remove_proxy_headers(&mut map, false);
        assert!(map.get("connection").is_some());
        assert!(map.get("upgrade").is_some());
    }

    #[test]
    fn response_hop_headers_removed_except_on_101() {
        let mut resp = Response::builder()
            .status(200)
            .header("connection", "keep-alive")
            .header("keep-alive", "timeout=5")
            .header("content-type", "text/plain")
            .body(())
            .unwrap();
        strip_response_hop_headers(&mut resp);
        assert!(resp.headers().get("keep-alive").is_none());
        assert!(resp.headers().get("content-type").is_some());

        let mut resp = Response::builder()
            .status(101)
            .header("connection", "upgrade")
            .header("upgrade", "websocket")
            .body(())
            .unwrap();
        strip_response_hop_headers(&mut resp);
        assert!(resp.headers().get("upgrade").is_some());
    }

    #[test]
    fn title_cases_names() {
        assert_eq!(title_case("content-type"), "Content-Type");
        assert_eq!(title_case("x-request-id"), "X-Request-Id");
        assert_eq!(title_case("host"), "Host");
    }
}
