//! Proxy instance and server.
//!
//! [`Proxy`] holds everything shared by all connections: filter registries,
//! the pooled origin client, certificate storage and the global toggles.
//! [`ProxyServer`] binds a listener and runs one task per connection.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWrite;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, info, warn, Instrument};

use crate::ca::{CaManager, CertificateAuthority};
use crate::certs::{
    tls_config_from_ca, CertStorage, MemoryCertStorage, TlsConfigFn, ALPN_H1, ALPN_H2_AND_H1,
};
use crate::connect::{BadGatewayHandler, ConnectErrorHandler};
use crate::ctx::ProxyCtx;
use crate::error::{ProxyError, Result};
use crate::filters::{ConnectFilter, ReqFilter, RespFilter};
use crate::h2::DEFAULT_MAX_FRAME_SIZE;
use crate::http1::{DEFAULT_MAX_BODY_BYTES, DEFAULT_MAX_HEAD_BYTES};
use crate::http_proxy;
use crate::origin::{OriginClient, OriginTls, RoundTripper, DEFAULT_CONNECT_TIMEOUT};
use crate::relay::ClientStream;
use crate::DEFAULT_PROXY_PORT;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Proxy server configuration.
#[derive(Clone)]
pub struct ProxyConfig {
    /// Address to bind the proxy to.
    pub addr: SocketAddr,
    /// The CA manager for certificate generation.
    pub ca_manager: CaManager,
    /// Relay HTTP/2 inside intercepted TLS tunnels.
    pub allow_http2: bool,
    /// Pass the origin's hop-by-hop response headers through.
    pub keep_destination_headers: bool,
    /// Write header names in Title-Case toward clients and origins.
    pub preserve_header_case: bool,
    /// Forward the client's `Accept-Encoding`.
    pub keep_accept_encoding: bool,
    /// Trust settings for origin TLS.
    pub origin_tls: OriginTls,
    /// Timeout for dialing origins.
    pub connect_timeout: Duration,
    /// Largest request head accepted from clients.
    pub max_head_bytes: usize,
    /// Largest request body buffered before it is forwarded.
    pub max_body_bytes: usize,
    /// Operator cap on relayed HTTP/2 frame payloads.
    ///
    /// Defaults to the protocol maximum; lower values refuse frames the
    /// peers may legitimately have negotiated.
    pub max_frame_size: usize,
}

impl std::fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("addr", &self.addr)
            .field("ca_manager", &self.ca_manager)
            .field("allow_http2", &self.allow_http2)
            .field("keep_destination_headers", &self.keep_destination_headers)
            .field("preserve_header_case", &self.preserve_header_case)
            .field("keep_accept_encoding", &self.keep_accept_encoding)
            .field("origin_tls", &self.origin_tls)
            .field("connect_timeout", &self.connect_timeout)
            .field("max_head_bytes", &self.max_head_bytes)
            .field("max_body_bytes", &self.max_body_bytes)
            .field("max_frame_size", &self.max_frame_size)
            .finish()
    }
}

impl ProxyConfig {
    /// Creates a configuration keeping the CA in the default data directory.
    pub fn new() -> Result<Self> {
        let ca_manager = CaManager::with_default_dir().map_err(ProxyError::Ca)?;
        Ok(Self::with_ca(ca_manager))
    }

    /// Creates a configuration keeping the CA where `ca_manager` says.
    pub fn with_ca(ca_manager: CaManager) -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PROXY_PORT)),
            ca_manager,
            allow_http2: false,
            keep_destination_headers: false,
            preserve_header_case: false,
            keep_accept_encoding: false,
            origin_tls: OriginTls::new(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_head_bytes: DEFAULT_MAX_HEAD_BYTES,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Sets the listen address.
    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    /// Sets the port (uses 127.0.0.1 as host).
    pub fn with_port(mut self, port: u16) -> Self {
        self.addr = SocketAddr::from(([127, 0, 0, 1], port));
        self
    }

    /// Sets the CA manager.
    pub fn with_ca_manager(mut self, ca_manager: CaManager) -> Self {
        self.ca_manager = ca_manager;
        self
    }

    /// Enables HTTP/2 relaying in intercepted tunnels.
    pub fn with_http2(mut self, allow: bool) -> Self {
        self.allow_http2 = allow;
        self
    }

    /// Keeps the origin's hop-by-hop response headers.
    pub fn with_destination_headers(mut self, keep: bool) -> Self {
        self.keep_destination_headers = keep;
        self
    }

    /// Writes header names in Title-Case.
    pub fn with_header_case(mut self, preserve: bool) -> Self {
        self.preserve_header_case = preserve;
        self
    }

    /// Forwards `Accept-Encoding` to origins.
    pub fn with_accept_encoding(mut self, keep: bool) -> Self {
        self.keep_accept_encoding = keep;
        self
    }

    /// Sets the origin TLS trust settings.
    pub fn with_origin_tls(mut self, origin_tls: OriginTls) -> Self {
        self.origin_tls = origin_tls;
        self
    }

    /// Sets the origin dial timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the largest request body the proxy buffers.
    pub fn with_max_body(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes;
        self
    }
}

/// State shared by every connection of a proxy.
pub struct Proxy {
    config: ProxyConfig,
    authority: Arc<CertificateAuthority>,
    cert_storage: Arc<dyn CertStorage>,
    pub(crate) tls_config: TlsConfigFn,
    pub(crate) origin: Arc<dyn RoundTripper>,
    pub(crate) req_filters: Vec<Arc<dyn ReqFilter>>,
    pub(crate) resp_filters: Vec<Arc<dyn RespFilter>>,
    pub(crate) connect_filters: Vec<Arc<dyn ConnectFilter>>,
    error_handler: Arc<dyn ConnectErrorHandler>,
    sessions: AtomicU64,
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("config", &self.config)
            .field("req_filters", &self.req_filters.len())
            .field("resp_filters", &self.resp_filters.len())
            .field("connect_filters", &self.connect_filters.len())
            .field("sessions", &self.sessions.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Proxy {
    /// Loads (or creates) the root CA and builds the shared origin client.
    pub fn new(config: ProxyConfig) -> Result<Self> {
        let authority = Arc::new(config.ca_manager.ensure_ca()?);
        let cert_storage: Arc<dyn CertStorage> = Arc::new(MemoryCertStorage::new());
        let tls_config = default_tls_config(&config, &authority, &cert_storage);
        let origin = Arc::new(OriginClient::new(
            &config.origin_tls,
            config.preserve_header_case,
            config.connect_timeout,
        )?);

        Ok(Self {
            config,
            authority,
            cert_storage,
            tls_config,
            origin,
            req_filters: Vec::new(),
            resp_filters: Vec::new(),
            connect_filters: Vec::new(),
            error_handler: Arc::new(BadGatewayHandler),
            sessions: AtomicU64::new(0),
        })
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Returns the root authority signing intercepted hosts.
    pub fn authority(&self) -> &Arc<CertificateAuthority> {
        &self.authority
    }

    /// Returns the certificate storage.
    pub fn cert_storage(&self) -> &Arc<dyn CertStorage> {
        &self.cert_storage
    }

    /// Returns the TLS configuration used when a decision brings none.
    pub fn default_tls_config(&self) -> TlsConfigFn {
        self.tls_config.clone()
    }

    /// Appends a request filter.
    pub fn add_request_filter(&mut self, filter: impl ReqFilter + 'static) {
        self.req_filters.push(Arc::new(filter));
    }

    /// Appends a response filter.
    pub fn add_response_filter(&mut self, filter: impl RespFilter + 'static) {
        self.resp_filters.push(Arc::new(filter));
    }

    /// Appends a CONNECT filter.
    pub fn add_connect_filter(&mut self, filter: impl ConnectFilter + 'static) {
        self.connect_filters.push(Arc::new(filter));
    }

    /// Replaces the handler reporting tunnel failures to clients.
    pub fn set_error_handler(&mut self, handler: impl ConnectErrorHandler + 'static) {
        self.error_handler = Arc::new(handler);
    }

    /// Replaces the certificate storage and the default TLS configuration built on it.
    pub fn set_cert_storage(&mut self, storage: Arc<dyn CertStorage>) {
        self.tls_config = default_tls_config(&self.config, &self.authority, &storage);
        self.cert_storage = storage;
    }

    /// Replaces the shared origin transport.
    pub fn set_round_tripper(&mut self, round_tripper: Arc<dyn RoundTripper>) {
        self.origin = round_tripper;
    }

    /// Returns the next session identifier.
    pub fn next_session(&self) -> u64 {
        self.sessions.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn new_ctx(&self, cancel: CancellationToken) -> ProxyCtx {
        ProxyCtx::with_cancel(self.next_session(), cancel)
    }

    pub(crate) async fn report_error<W>(&self, client: &mut W, ctx: &ProxyCtx, err: &ProxyError)
    where
        W: AsyncWrite + Unpin + Send,
    {
        self.error_handler.handle_error(client, ctx, err).await;
    }

    /// Serves one inbound proxy connection until it closes or `cancel` fires.
    pub async fn serve_connection<S: ClientStream>(
        self: Arc<Self>,
        stream: S,
        cancel: CancellationToken,
    ) {
        http_proxy::serve(self, stream, cancel).await;
    }
}

fn default_tls_config(
    config: &ProxyConfig,
    authority: &Arc<CertificateAuthority>,
    storage: &Arc<dyn CertStorage>,
) -> TlsConfigFn {
    let alpn = if config.allow_http2 {
        ALPN_H2_AND_H1
    } else {
        ALPN_H1
    };
    tls_config_from_ca(authority.clone(), storage.clone(), alpn)
}

/// The proxy server.
#[derive(Debug)]
pub struct ProxyServer {
    proxy: Proxy,
}

impl ProxyServer {
    /// Creates a new proxy server, generating the root CA if needed.
    pub fn new(config: ProxyConfig) -> Result<Self> {
        Ok(Self {
            proxy: Proxy::new(config)?,
        })
    }

    /// Adds a request filter.
    pub fn on_request(mut self, filter: impl ReqFilter + 'static) -> Self {
        self.proxy.add_request_filter(filter);
        self
    }

    /// Adds a response filter.
    pub fn on_response(mut self, filter: impl RespFilter + 'static) -> Self {
        self.proxy.add_response_filter(filter);
        self
    }

    /// Adds a CONNECT filter.
    pub fn on_connect(mut self, filter: impl ConnectFilter + 'static) -> Self {
        self.proxy.add_connect_filter(filter);
        self
    }

    /// Sets the handler reporting tunnel failures.
    pub fn on_connect_error(mut self, handler: impl ConnectErrorHandler + 'static) -> Self {
        self.proxy.set_error_handler(handler);
        self
    }

    /// Uses `storage` for issued leaf certificates.
    pub fn with_cert_storage(mut self, storage: Arc<dyn CertStorage>) -> Self {
        self.proxy.set_cert_storage(storage);
        self
    }

    /// Sends origin requests through `round_tripper` instead of the pooled client.
    pub fn with_round_tripper(mut self, round_tripper: Arc<dyn RoundTripper>) -> Self {
        self.proxy.set_round_tripper(round_tripper);
        self
    }

    /// Returns the shared proxy state.
    pub fn proxy(&self) -> &Proxy {
        &self.proxy
    }

    /// Returns the configured listen address.
    pub fn addr(&self) -> SocketAddr {
        self.proxy.config.addr
    }

    /// Returns the CA certificate path.
    pub fn ca_cert_path(&self) -> PathBuf {
        self.proxy.config.ca_manager.cert_path()
    }

    /// Returns the CA certificate as PEM, for installing into trust stores.
    pub fn ca_cert_pem(&self) -> Result<String> {
        Ok(self.proxy.config.ca_manager.read_cert_pem()?)
    }

    /// Runs the proxy server until the listener fails.
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(self.addr()).await?;
        info!("Starting proxy on {}", listener.local_addr()?);
        info!("CA certificate: {:?}", self.ca_cert_path());
        accept_loop(Arc::new(self.proxy), listener, CancellationToken::new()).await;
        Ok(())
    }

    /// Binds the listener and serves in the background.
    pub async fn start(self) -> Result<ProxyHandle> {
        let listener = TcpListener::bind(self.addr()).await?;
        let addr = listener.local_addr()?;
        info!("Starting proxy on {}", addr);
        info!("CA certificate: {:?}", self.ca_cert_path());

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(accept_loop(
            Arc::new(self.proxy),
            listener,
            shutdown.clone(),
        ));

        Ok(ProxyHandle {
            shutdown,
            addr,
            handle,
        })
    }
}

async fn accept_loop(proxy: Arc<Proxy>, listener: TcpListener, shutdown: CancellationToken) {
    loop {
        let (stream, peer) = tokio::select! {
            res = listener.accept() => match res {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            },
            _ = shutdown.cancelled() => {
                info!("Proxy shutdown signal received");
                return;
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!("Cannot set TCP_NODELAY for {}: {}", peer, e);
        }
        let proxy = proxy.clone();
        let conn = shutdown.child_token();
        tokio::spawn(
            proxy
                .serve_connection(stream, conn)
                .instrument(debug_span!("conn", %peer)),
        );
    }
}

/// Handle for controlling a running proxy server.
pub struct ProxyHandle {
    shutdown: CancellationToken,
    addr: SocketAddr,
    handle: tokio::task::JoinHandle<()>,
}

impl ProxyHandle {
    /// Returns the address the proxy is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signals the proxy to shut down. Open connections are cancelled too.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Waits for the proxy to finish.
    pub async fn wait(self) {
        let _ = self.handle.await;
    }

    /// Shuts down the proxy and waits for it to finish.
    pub async fn stop(self) {
        self.shutdown();
        self.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> ProxyConfig {
        ProxyConfig::with_ca(CaManager::new(dir.path().join("ca"))).with_port(0)
    }

    #[test]
    fn proxy_config_with_port() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir).with_port(8888);
        assert_eq!(config.addr.port(), 8888);
    }

    #[test]
    fn proxy_config_with_addr() {
        let dir = TempDir::new().unwrap();
        let addr = SocketAddr::from(([0, 0, 0, 0], 9999));
        let config = test_config(&dir).with_addr(addr);
        assert_eq!(config.addr, addr);
    }

    #[test]
    fn proxy_config_toggles() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir)
            .with_http2(true)
            .with_destination_headers(true)
            .with_header_case(true)
            .with_accept_encoding(true);
        assert!(config.allow_http2);
        assert!(config.keep_destination_headers);
        assert!(config.preserve_header_case);
        assert!(config.keep_accept_encoding);
    }

    #[test]
    fn proxy_config_limits() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        assert_eq!(config.max_body_bytes, DEFAULT_MAX_BODY_BYTES);
        assert_eq!(config.max_frame_size, (1 << 24) - 1);

        let config = config.with_max_body(1024);
        assert_eq!(config.max_body_bytes, 1024);
    }

    #[test]
    fn proxy_server_new() {
        let dir = TempDir::new().unwrap();
        let server = ProxyServer::new(test_config(&dir));
        assert!(server.is_ok());
    }

    #[test]
    fn proxy_server_ca_paths() {
        let dir = TempDir::new().unwrap();
        let server = ProxyServer::new(test_config(&dir)).unwrap();

        let cert_path = server.ca_cert_path();
        assert!(cert_path.to_string_lossy().contains("tapline-ca.crt"));

        let pem = server.ca_cert_pem().unwrap();
        assert!(pem.contains("BEGIN CERTIFICATE"));
    }

    #[test]
    fn sessions_increase() {
        let dir = TempDir::new().unwrap();
        let server = ProxyServer::new(test_config(&dir)).unwrap();
        let first = server.proxy().next_session();
        let second = server.proxy().next_session();
        assert!(second > first);
    }

    #[test]
    fn replacing_storage_rebuilds_tls_config() {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(MemoryCertStorage::new());
        let server = ProxyServer::new(test_config(&dir))
            .unwrap()
            .with_cert_storage(storage.clone());

        let ctx = ProxyCtx::new(1);
        (server.proxy().default_tls_config())("example.com:443", &ctx).unwrap();
        assert_eq!(storage.len(), 1);
    }

    #[tokio::test]
    async fn proxy_handle_shutdown() {
        let dir = TempDir::new().unwrap();
        let server = ProxyServer::new(test_config(&dir)).unwrap();

        let handle = server.start().await.unwrap();
        assert_ne!(handle.addr().port(), 0);

        // Give it a moment to start
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Stop it
        handle.stop().await;
    }
}
