//! Tapline Proxy - a TLS-intercepting forward proxy relay engine.
//!
//! The proxy accepts HTTP/1.x clients. Absolute-URI requests are forwarded to
//! their origin; `CONNECT` requests are resolved by the connect filter chain
//! into one of several tunnel actions.
//!
//! ## Tunnel actions
//!
//! - **Accept**: dial the target and shuttle bytes both ways
//! - **Reject**: answer with a canned response and close
//! - **Mitm**: terminate the client's TLS with a leaf signed by the local
//!   root authority and serve the requests it carries
//! - **PlainMitm**: read cleartext HTTP from the tunnel
//! - **Hijack**: hand the raw connection to user code
//! - **ProxyAuthHijack**: send a `407` challenge, then hijack
//!
//! ## Architecture
//!
//! ```text
//! Client → accept loop → request loop ─┬─ absolute URI → filters → origin
//!                                      │
//!                                      └─ CONNECT → connect filters
//!                                                   │
//!                    ┌──────────┬──────────┬────────┴──┬──────────┐
//!                    ▼          ▼          ▼           ▼          ▼
//!                 Accept     Reject      Mitm      PlainMitm    Hijack
//!                 (bytes)               (TLS →
//!                                   request loop,
//!                                   h2, websocket)
//! ```

mod ca;
mod certs;
mod config;
mod connect;
mod ctx;
mod decision;
mod error;
mod exchange;
mod filters;
mod http_proxy;
mod mitm;
mod origin;
mod proxy;
mod relay;
mod websocket;

pub mod body;
pub mod conditions;
pub mod h2;
pub mod headers;
pub mod http1;

#[cfg(test)]
mod test_support;

pub use ca::{CaManager, CertificateAuthority};
pub use certs::{
    strip_port, tls_config_from_ca, CertStorage, MemoryCertStorage, TlsConfigFn, ALPN_H1,
    ALPN_H2_AND_H1,
};
pub use config::{InterceptMode, ProxySettings};
pub use connect::{
    connect_target, with_default_port, BadGatewayHandler, ConnectErrorHandler,
    DEFAULT_CONNECT_PORT, INTERCEPT_ESTABLISHED, TUNNEL_ESTABLISHED,
};
pub use ctx::{ProxyCtx, RequestInfo, ResponseInfo};
pub use decision::{
    auth_challenge_response, CannedResponse, ClientIo, ConnectAction, ConnectDecision,
    ConnectHijacker,
};
pub use error::{CaManagerError, FrameError, ProxyError, Result};
pub use exchange::{text_response, NON_PROXY_MESSAGE};
pub use filters::{ConnectFilter, ReqFilter, RespFilter};
pub use origin::{
    dial_tcp, dial_tls, DedicatedOrigin, OriginClient, OriginTls, RoundTripper,
    DEFAULT_CONNECT_TIMEOUT,
};
pub use proxy::{Proxy, ProxyConfig, ProxyHandle, ProxyServer};
pub use relay::{relay_streams, relay_tcp, ClientStream, RelayStats};
pub use websocket::relay_websocket;

/// Default proxy port.
pub const DEFAULT_PROXY_PORT: u16 = 8080;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_port_is_correct() {
        assert_eq!(DEFAULT_PROXY_PORT, 8080);
    }
}
