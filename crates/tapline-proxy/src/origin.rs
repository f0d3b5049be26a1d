//! Origin side of the proxy: TLS settings, the shared pooled client and
//! the single-connection transport used by plain interception.

use std::fmt;
use std::future::Future;
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use http::header::{HeaderValue, HOST};
use http::{Request, Response, Uri};
use hyper::client::conn::http1::SendRequest;
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace};

use crate::body::{self, Body};
use crate::certs::strip_port;
use crate::ctx::ProxyCtx;
use crate::error::{ProxyError, Result};

/// Default timeout for dialing an origin.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Sends one request to an origin and returns its response.
///
/// The shared [`OriginClient`] implements this; filters can install a
/// different one for a single request through [`ProxyCtx::round_tripper`].
#[async_trait]
pub trait RoundTripper: Send + Sync {
    /// Performs the exchange. `req` carries an absolute URI.
    async fn round_trip(&self, req: Request<Body>, ctx: &ProxyCtx) -> Result<Response<Body>>;
}

/// Trust settings for TLS connections to origins.
#[derive(Clone)]
pub struct OriginTls {
    roots: Arc<RootCertStore>,
    skip_verify: bool,
    provider: Arc<CryptoProvider>,
}

impl fmt::Debug for OriginTls {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OriginTls")
            .field("roots", &self.roots.len())
            .field("skip_verify", &self.skip_verify)
            .finish()
    }
}

impl Default for OriginTls {
    fn default() -> Self {
        Self::new()
    }
}

impl OriginTls {
    /// Trusts the bundled webpki roots.
    pub fn new() -> Self {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        Self {
            roots: Arc::new(roots),
            skip_verify: false,
            provider: Arc::new(rustls::crypto::aws_lc_rs::default_provider()),
        }
    }

    /// Adds a trust anchor.
    pub fn add_root(&mut self, cert: CertificateDer<'static>) -> Result<()> {
        Arc::make_mut(&mut self.roots).add(cert)?;
        Ok(())
    }

    /// Adds every certificate of a PEM file as a trust anchor.
    pub fn add_roots_from_pem(&mut self, path: impl AsRef<Path>) -> Result<usize> {
        let pem = std::fs::read(path.as_ref())?;
        let certs = rustls_pemfile::certs(&mut pem.as_slice())
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let count = certs.len();
        for cert in certs {
            self.add_root(cert)?;
        }
        debug!(
            "Loaded {} extra origin roots from {}",
            count,
            path.as_ref().display()
        );
        Ok(count)
    }

    /// Disables origin certificate verification.
    pub fn skip_verify(mut self, skip: bool) -> Self {
        self.skip_verify = skip;
        self
    }

    /// Returns true if origin certificates are not verified.
    pub fn verification_skipped(&self) -> bool {
        self.skip_verify
    }

    /// Builds a client configuration advertising `alpn`.
    pub fn client_config(&self, alpn: &[&[u8]]) -> Result<Arc<ClientConfig>> {
        let mut config = ClientConfig::builder_with_provider(self.provider.clone())
            .with_safe_default_protocol_versions()?
            .with_root_certificates(self.roots.clone())
            .with_no_client_auth();
        if self.skip_verify {
            config
                .dangerous()
                .set_certificate_verifier(Arc::new(NoVerifier(self.provider.clone())));
        }
        config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
        Ok(Arc::new(config))
    }
}

/// Accepts any origin certificate.
#[derive(Debug)]
struct NoVerifier(Arc<CryptoProvider>);

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Dials `host:port` over TCP within `timeout`.
pub async fn dial_tcp(addr: &str, timeout: Duration) -> Result<TcpStream> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| ProxyError::UpstreamConnect {
            addr: addr.to_string(),
            message: "connect timed out".to_string(),
        })?
        .map_err(|e| ProxyError::UpstreamConnect {
            addr: addr.to_string(),
            message: e.to_string(),
        })?;
    stream.set_nodelay(true)?;
    trace!("Connected to origin {}", addr);
    Ok(stream)
}

/// Dials `addr` and completes a client TLS handshake for its host.
pub async fn dial_tls(
    addr: &str,
    config: Arc<ClientConfig>,
    timeout: Duration,
) -> Result<TlsStream<TcpStream>> {
    let tcp = dial_tcp(addr, timeout).await?;
    let host = strip_port(addr).to_string();
    let server_name = ServerName::try_from(host)
        .map_err(|e| ProxyError::Tls(format!("invalid server name '{}': {}", addr, e)))?;
    let tls = TlsConnector::from(config)
        .connect(server_name, tcp)
        .await
        .map_err(|e| ProxyError::Tls(format!("handshake with {} failed: {}", addr, e)))?;
    Ok(tls)
}

/// Plain or TLS connection to an origin.
pub enum MaybeTls {
    /// Cleartext TCP.
    Plain(TcpStream),
    /// TLS over TCP.
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for MaybeTls {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTls::Plain(s) => Pin::new(s).poll_read(cx, buf),
            MaybeTls::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTls {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            MaybeTls::Plain(s) => Pin::new(s).poll_write(cx, buf),
            MaybeTls::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTls::Plain(s) => Pin::new(s).poll_flush(cx),
            MaybeTls::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTls::Plain(s) => Pin::new(s).poll_shutdown(cx),
            MaybeTls::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Connection handed to the pooled client.
pub struct OriginStream {
    inner: TokioIo<MaybeTls>,
}

impl hyper::rt::Read for OriginStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: hyper::rt::ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl hyper::rt::Write for OriginStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl Connection for OriginStream {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

/// Connector for the pooled client: TCP for `http`, TCP + TLS for `https`.
#[derive(Clone)]
pub struct OriginConnector {
    tls: TlsConnector,
    connect_timeout: Duration,
}

impl OriginConnector {
    /// Creates a connector using `config` for `https` origins.
    pub fn new(config: Arc<ClientConfig>, connect_timeout: Duration) -> Self {
        Self {
            tls: TlsConnector::from(config),
            connect_timeout,
        }
    }

    async fn connect(self, uri: Uri) -> Result<OriginStream> {
        let https = uri.scheme_str() == Some("https");
        let host = uri
            .host()
            .ok_or_else(|| ProxyError::Http(format!("origin URI without host: {}", uri)))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let port = uri.port_u16().unwrap_or(if https { 443 } else { 80 });
        let addr = if host.contains(':') {
            format!("[{}]:{}", host, port)
        } else {
            format!("{}:{}", host, port)
        };

        let tcp = dial_tcp(&addr, self.connect_timeout).await?;
        let stream = if https {
            let server_name = ServerName::try_from(host.to_string())
                .map_err(|e| ProxyError::Tls(format!("invalid server name '{}': {}", host, e)))?;
            let tls = self
                .tls
                .connect(server_name, tcp)
                .await
                .map_err(|e| ProxyError::Tls(format!("handshake with {} failed: {}", addr, e)))?;
            MaybeTls::Tls(Box::new(tls))
        } else {
            MaybeTls::Plain(tcp)
        };

        Ok(OriginStream {
            inner: TokioIo::new(stream),
        })
    }
}

impl tower_service::Service<Uri> for OriginConnector {
    type Response = OriginStream;
    type Error = ProxyError;
    type Future = Pin<Box<dyn Future<Output = Result<OriginStream>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        Box::pin(self.clone().connect(uri))
    }
}

/// Connection-pooling origin client shared by every tunnel.
#[derive(Clone)]
pub struct OriginClient {
    client: Client<OriginConnector, Body>,
}

impl fmt::Debug for OriginClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OriginClient").finish_non_exhaustive()
    }
}

impl OriginClient {
    /// Builds the client. `title_case_headers` writes header names toward
    /// origins in Title-Case.
    pub fn new(tls: &OriginTls, title_case_headers: bool, connect_timeout: Duration) -> Result<Self> {
        let connector = OriginConnector::new(tls.client_config(&[b"http/1.1"])?, connect_timeout);
        let client = Client::builder(TokioExecutor::new())
            .pool_timer(TokioTimer::new())
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .http1_title_case_headers(title_case_headers)
            .build(connector);
        Ok(Self { client })
    }
}

#[async_trait]
impl RoundTripper for OriginClient {
    async fn round_trip(&self, req: Request<Body>, ctx: &ProxyCtx) -> Result<Response<Body>> {
        trace!(session = ctx.session(), "{} {}", req.method(), req.uri());
        let resp = self.client.request(req).await?;
        Ok(resp.map(body::incoming))
    }
}

/// One origin connection, dialed on first use and reused afterwards.
///
/// Serves the plain interception loop, where every request of a tunnel goes
/// to the same `host:port`. A connection the origin closed is redialed.
pub struct DedicatedOrigin {
    addr: String,
    title_case_headers: bool,
    connect_timeout: Duration,
    sender: tokio::sync::Mutex<Option<SendRequest<Body>>>,
}

impl fmt::Debug for DedicatedOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DedicatedOrigin")
            .field("addr", &self.addr)
            .finish_non_exhaustive()
    }
}

impl DedicatedOrigin {
    /// Creates a transport for `addr` (`host:port`). Nothing is dialed yet.
    pub fn new(addr: impl Into<String>, title_case_headers: bool, connect_timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            title_case_headers,
            connect_timeout,
            sender: tokio::sync::Mutex::new(None),
        }
    }

    /// Origin address.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn dial(&self) -> Result<SendRequest<Body>> {
        let tcp = dial_tcp(&self.addr, self.connect_timeout).await?;
        let (sender, conn) = hyper::client::conn::http1::Builder::new()
            .title_case_headers(self.title_case_headers)
            .handshake(TokioIo::new(tcp))
            .await?;
        let addr = self.addr.clone();
        tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                debug!("Origin connection to {} ended: {}", addr, e);
            }
        });
        Ok(sender)
    }
}

#[async_trait]
impl RoundTripper for DedicatedOrigin {
    async fn round_trip(&self, mut req: Request<Body>, ctx: &ProxyCtx) -> Result<Response<Body>> {
        let mut slot = self.sender.lock().await;
        let mut sender = match slot.take() {
            Some(sender) if !sender.is_closed() => sender,
            _ => {
                debug!(session = ctx.session(), "Dialing origin {}", self.addr);
                self.dial().await?
            }
        };

        if !req.headers().contains_key(HOST) {
            if let Some(authority) = req.uri().authority() {
                let value = HeaderValue::from_str(authority.as_str())
                    .map_err(|e| ProxyError::Http(e.to_string()))?;
                req.headers_mut().insert(HOST, value);
            }
        }
        let origin_form: Uri = req
            .uri()
            .path_and_query()
            .map(|p| p.as_str())
            .unwrap_or("/")
            .parse()
            .map_err(|e: http::uri::InvalidUri| ProxyError::Http(e.to_string()))?;
        *req.uri_mut() = origin_form;

        sender.ready().await?;
        let resp = sender.send_request(req).await?;
        *slot = Some(sender);
        Ok(resp.map(body::incoming))
    }
}

/// Runs `rt` for `req`, giving up when the client goes away.
///
/// While the origin call is in flight, `client` is polled for EOF. A closed
/// client cancels the context's token and yields [`ProxyError::Cancelled`].
/// Bytes the client sends early stay buffered in `client`.
pub async fn round_trip_or_cancel<R>(
    rt: &dyn RoundTripper,
    req: Request<Body>,
    ctx: &ProxyCtx,
    client: &mut R,
) -> Result<Response<Body>>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    let token = ctx.cancel_token().clone();
    let call = rt.round_trip(req, ctx);
    tokio::pin!(call);

    let mut watching = true;
    loop {
        tokio::select! {
            res = &mut call => return res,
            _ = token.cancelled() => return Err(ProxyError::Cancelled),
            closed = client_closed(client), if watching => {
                if closed {
                    token.cancel();
                    return Err(ProxyError::Cancelled);
                }
                watching = false;
            }
        }
    }
}

async fn client_closed<R>(client: &mut R) -> bool
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    match client.fill_buf().await {
        Ok(buf) => buf.is_empty(),
        Err(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{spawn_origin, OriginReply};
    use http_body_util::BodyExt;
    use tokio::io::{AsyncWriteExt, BufReader};

    #[tokio::test]
    async fn pooled_client_reaches_plain_origin() {
        let origin = spawn_origin(OriginReply::text("pooled")).await;
        let client = OriginClient::new(&OriginTls::new(), false, DEFAULT_CONNECT_TIMEOUT).unwrap();
        let ctx = ProxyCtx::new(1);

        for _ in 0..2 {
            let req = Request::get(format!("http://{}/a", origin))
                .body(body::empty())
                .unwrap();
            let resp = client.round_trip(req, &ctx).await.unwrap();
            assert_eq!(resp.status(), 200);
            let bytes = resp.into_body().collect().await.unwrap().to_bytes();
            assert_eq!(&bytes[..], b"pooled");
        }
    }

    #[tokio::test]
    async fn dedicated_origin_reuses_connection() {
        let origin = spawn_origin(OriginReply::text("dedicated")).await;
        let transport = DedicatedOrigin::new(origin.to_string(), false, DEFAULT_CONNECT_TIMEOUT);
        let ctx = ProxyCtx::new(2);

        for path in ["/one", "/two"] {
            let req = Request::get(format!("http://{}{}", origin, path))
                .body(body::empty())
                .unwrap();
            let resp = transport.round_trip(req, &ctx).await.unwrap();
            let bytes = resp.into_body().collect().await.unwrap().to_bytes();
            assert_eq!(&bytes[..], b"dedicated");
        }
        assert_eq!(origin.connections(), 1);
    }

    #[tokio::test]
    async fn unreachable_origin_is_upstream_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = dial_tcp(&addr.to_string(), DEFAULT_CONNECT_TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::UpstreamConnect { .. }));
    }

    struct Stalled;

    #[async_trait]
    impl RoundTripper for Stalled {
        async fn round_trip(&self, _req: Request<Body>, _ctx: &ProxyCtx) -> Result<Response<Body>> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn client_close_cancels_round_trip() {
        let (client, mut peer) = tokio::io::duplex(64);
        let mut client = BufReader::new(client);
        let ctx = ProxyCtx::new(3);
        peer.shutdown().await.unwrap();
        drop(peer);

        let req = Request::get("http://example.com/").body(body::empty()).unwrap();
        let err = round_trip_or_cancel(&Stalled, req, &ctx, &mut client)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Cancelled));
        assert!(ctx.is_cancelled());
    }

    #[test]
    fn skip_verify_is_recorded() {
        let tls = OriginTls::new().skip_verify(true);
        assert!(tls.verification_skipped());
        let config = tls.client_config(&[b"h2"]).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"h2".to_vec()]);
    }
}
