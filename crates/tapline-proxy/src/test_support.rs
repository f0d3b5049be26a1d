//! Loopback origins, a throwaway CA and raw HTTP/1 readers for tests.

use std::convert::Infallible;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body_util::StreamBody;
use hyper::body::{Frame, Incoming};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use tempfile::TempDir;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

use crate::ca::{CaManager, CertificateAuthority};
use crate::proxy::ProxyConfig;

/// What a test origin answers to every request.
#[derive(Debug, Clone)]
pub struct OriginReply {
    pub status: StatusCode,
    pub body: Bytes,
}

impl OriginReply {
    pub fn text(body: &str) -> Self {
        Self {
            status: StatusCode::OK,
            body: Bytes::copy_from_slice(body.as_bytes()),
        }
    }

    pub fn status(status: StatusCode) -> Self {
        Self {
            status,
            body: Bytes::new(),
        }
    }
}

/// A running loopback origin.
pub struct TestOrigin {
    addr: SocketAddr,
    connections: Arc<AtomicUsize>,
    requests: Arc<AtomicUsize>,
}

impl TestOrigin {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

impl fmt::Display for TestOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.addr)
    }
}

type ReplyBody = StreamBody<futures::stream::Iter<std::vec::IntoIter<Result<Frame<Bytes>, Infallible>>>>;

/// Answers with `reply`, echoing what it received in `x-*` headers.
///
/// The body is streamed, so the origin never sends `Content-Length`.
fn answer(reply: &OriginReply, req: &Request<Incoming>) -> Response<ReplyBody> {
    let names: Vec<&str> = req.headers().keys().map(|k| k.as_str()).collect();
    let frames = if reply.body.is_empty() {
        Vec::new()
    } else {
        vec![Ok(Frame::data(reply.body.clone()))]
    };
    Response::builder()
        .status(reply.status)
        .header("x-method", req.method().as_str())
        .header(
            "x-path",
            req.uri().path_and_query().map(|p| p.as_str()).unwrap_or("/"),
        )
        .header("x-request-headers", names.join(","))
        .header(
            "x-content-length",
            req.headers()
                .get(http::header::CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("none"),
        )
        .header("connection", "keep-alive")
        .body(StreamBody::new(futures::stream::iter(frames)))
        .unwrap()
}

/// Spawns a cleartext HTTP/1.1 origin on 127.0.0.1.
pub async fn spawn_origin(reply: OriginReply) -> TestOrigin {
    spawn(reply, None).await
}

/// Spawns an HTTPS origin on 127.0.0.1 whose certificate `authority` signed.
pub async fn spawn_tls_origin(reply: OriginReply, authority: &CertificateAuthority) -> TestOrigin {
    spawn(reply, Some(tls_acceptor(authority, b"http/1.1"))).await
}

/// Spawns an HTTP/2-only HTTPS origin on 127.0.0.1.
pub async fn spawn_h2_tls_origin(
    reply: OriginReply,
    authority: &CertificateAuthority,
) -> TestOrigin {
    spawn(reply, Some(tls_acceptor(authority, b"h2"))).await
}

/// Spawns a raw origin that answers one WebSocket handshake with `101` and
/// then echoes four bytes. Speaks TLS when `authority` is given.
pub async fn spawn_upgrade_origin(authority: Option<&CertificateAuthority>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let acceptor = authority.map(|a| tls_acceptor(a, b"http/1.1"));
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        match acceptor {
            Some(acceptor) => upgrade_echo(acceptor.accept(stream).await.unwrap()).await,
            None => upgrade_echo(stream).await,
        }
    });
    addr
}

async fn upgrade_echo<S: AsyncRead + AsyncWrite + Unpin>(stream: S) {
    let mut stream = BufReader::new(stream);
    let mut head = Vec::new();
    while !head.ends_with(b"\r\n\r\n") {
        let mut byte = [0u8; 1];
        stream.read_exact(&mut byte).await.unwrap();
        head.push(byte[0]);
    }
    stream
        .write_all(b"HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n")
        .await
        .unwrap();
    stream.flush().await.unwrap();
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await.unwrap();
    stream.write_all(&buf).await.unwrap();
    stream.flush().await.unwrap();
}

fn tls_acceptor(authority: &CertificateAuthority, alpn: &[u8]) -> TlsAcceptor {
    let leaf = authority.sign_leaf("127.0.0.1").unwrap();
    let mut config = ServerConfig::builder_with_provider(authority.provider())
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(FixedCert(leaf)));
    config.alpn_protocols = vec![alpn.to_vec()];
    TlsAcceptor::from(Arc::new(config))
}

async fn spawn(reply: OriginReply, tls: Option<TlsAcceptor>) -> TestOrigin {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));
    let requests = Arc::new(AtomicUsize::new(0));

    let counted = (connections.clone(), requests.clone());
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            counted.0.fetch_add(1, Ordering::SeqCst);
            let reply = reply.clone();
            let requests = counted.1.clone();
            let tls = tls.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    requests.fetch_add(1, Ordering::SeqCst);
                    let resp = answer(&reply, &req);
                    async move { Ok::<_, Infallible>(resp) }
                });
                match tls {
                    Some(acceptor) => {
                        let Ok(stream) = acceptor.accept(stream).await else {
                            return;
                        };
                        let h2 = stream.get_ref().1.alpn_protocol() == Some(b"h2".as_slice());
                        let io = TokioIo::new(stream);
                        if h2 {
                            let _ = hyper::server::conn::http2::Builder::new(TokioExecutor::new())
                                .serve_connection(io, service)
                                .await;
                        } else {
                            let _ = hyper::server::conn::http1::Builder::new()
                                .serve_connection(io, service)
                                .await;
                        }
                    }
                    None => {
                        let _ = hyper::server::conn::http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .await;
                    }
                }
            });
        }
    });

    TestOrigin {
        addr,
        connections,
        requests,
    }
}

#[derive(Debug)]
struct FixedCert(Arc<CertifiedKey>);

impl ResolvesServerCert for FixedCert {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.0.clone())
    }
}

/// A fresh CA in a temporary directory.
pub fn test_ca() -> (TempDir, CaManager, Arc<CertificateAuthority>) {
    let dir = TempDir::new().unwrap();
    let manager = CaManager::new(dir.path().join("ca"));
    let authority = Arc::new(manager.ensure_ca().unwrap());
    (dir, manager, authority)
}

/// Proxy configuration on an ephemeral port whose origin client trusts `authority`.
pub fn test_config(manager: &CaManager, authority: &CertificateAuthority) -> ProxyConfig {
    let mut config = ProxyConfig::with_ca(manager.clone()).with_port(0);
    config.origin_tls.add_root(authority.cert_der().clone()).unwrap();
    config
}

/// Status line and headers of a response read off the wire.
#[derive(Debug)]
pub struct Head {
    pub status: u16,
    pub headers: Vec<(String, String)>,
}

impl Head {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

pub async fn read_head<R: AsyncBufRead + Unpin>(reader: &mut R) -> Head {
    let mut line = String::new();
    reader.read_line(&mut line).await.unwrap();
    let status = line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(|| panic!("bad status line: {:?}", line));

    let mut headers = Vec::new();
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        let (name, value) = line.split_once(':').unwrap();
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }
    Head { status, headers }
}

/// Reads a chunked body up to and including its terminating chunk.
pub async fn read_chunked<R: AsyncBufRead + Unpin>(reader: &mut R) -> Vec<u8> {
    let mut body = Vec::new();
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        let size = usize::from_str_radix(line.trim(), 16).unwrap();
        if size == 0 {
            let mut crlf = String::new();
            reader.read_line(&mut crlf).await.unwrap();
            return body;
        }
        let mut chunk = vec![0u8; size + 2];
        reader.read_exact(&mut chunk).await.unwrap();
        body.extend_from_slice(&chunk[..size]);
    }
}
