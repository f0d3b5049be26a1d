//! HTTP/1.x wire helpers.
//!
//! Parses request heads read off client connections (plain or decrypted),
//! decodes request bodies, and writes responses with the framing the proxy
//! controls itself: the origin's `Content-Length` is never trusted once the
//! filters have run, so bodies are re-framed as chunked.

use std::io;

use bytes::{Bytes, BytesMut};
use http::header::{
    HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, EXPECT, TRANSFER_ENCODING,
};
use http::{HeaderMap, Method, Request, Response, StatusCode, Uri, Version};
use http_body_util::BodyExt;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::body::Body;
use crate::error::{ProxyError, Result};
use crate::headers::{is_websocket_upgrade, title_case};

/// Full HTTP/2 client connection preface.
pub const H2_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Request line of the preface, as an HTTP/1 parser sees it.
const PREFACE_REQUEST_LINE: &[u8] = b"PRI * HTTP/2.0\r\n";

/// Preface bytes left after the pseudo-request head.
const PREFACE_REMAINDER: &[u8] = b"SM\r\n\r\n";

/// Default ceiling for a request head.
pub const DEFAULT_MAX_HEAD_BYTES: usize = 64 * 1024;

/// Default ceiling for a buffered request body.
pub const DEFAULT_MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Interim response sent to clients that asked for `Expect: 100-continue`.
pub const CONTINUE_RESPONSE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

const MAX_HEADERS: usize = 128;
const MAX_CHUNK_LINE: usize = 4096;

/// What the next bytes on a client connection turned out to be.
#[derive(Debug)]
pub enum Inbound {
    /// The peer closed the connection before sending anything.
    Eof,
    /// An HTTP/2 client preface; the whole preface has been consumed.
    H2Preface,
    /// An HTTP/1.x request head. The body is still on the wire.
    Request(Request<()>),
}

/// Reads one request head from `reader`.
pub async fn read_inbound<R>(reader: &mut R, max_head: usize) -> Result<Inbound>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    let mut head = Vec::with_capacity(512);
    loop {
        let start = head.len();
        let budget = (max_head + 1).saturating_sub(start) as u64;
        let n = (&mut *reader)
            .take(budget)
            .read_until(b'\n', &mut head)
            .await?;

        if n == 0 {
            if head.is_empty() {
                return Ok(Inbound::Eof);
            }
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }
        if !head.ends_with(b"\n") {
            if head.len() > max_head {
                return Err(ProxyError::MalformedRequest("request head too large".into()));
            }
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }

        let line = &head[start..];
        let blank = line == b"\r\n" || line == b"\n";
        if blank && start == 0 {
            // Stray CRLF between requests.
            head.clear();
            continue;
        }
        if blank {
            break;
        }
    }

    if head.starts_with(PREFACE_REQUEST_LINE) {
        let mut rest = [0u8; 6];
        reader.read_exact(&mut rest).await?;
        if rest != PREFACE_REMAINDER {
            return Err(ProxyError::MalformedRequest(
                "invalid HTTP/2 client preface".into(),
            ));
        }
        return Ok(Inbound::H2Preface);
    }

    parse_request_head(&head).map(Inbound::Request)
}

/// Parses a complete request head (request line, headers, blank line).
pub fn parse_request_head(buf: &[u8]) -> Result<Request<()>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut headers);
    match parsed.parse(buf) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(ProxyError::MalformedRequest("incomplete request head".into()));
        }
        Err(e) => return Err(ProxyError::MalformedRequest(e.to_string())),
    }

    let method = parsed
        .method
        .ok_or_else(|| ProxyError::MalformedRequest("missing method".into()))?;
    let method = Method::from_bytes(method.as_bytes())
        .map_err(|e| ProxyError::MalformedRequest(e.to_string()))?;
    let target = parsed
        .path
        .ok_or_else(|| ProxyError::MalformedRequest("missing request target".into()))?;
    let uri: Uri = target
        .parse()
        .map_err(|e: http::uri::InvalidUri| ProxyError::MalformedRequest(e.to_string()))?;
    let version = match parsed.version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    };

    let mut req = Request::builder()
        .method(method)
        .uri(uri)
        .version(version)
        .body(())?;

    for header in parsed.headers.iter() {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|e| ProxyError::MalformedRequest(e.to_string()))?;
        let value = HeaderValue::from_bytes(header.value)
            .map_err(|e| ProxyError::MalformedRequest(e.to_string()))?;
        req.headers_mut().append(name, value);
    }

    Ok(req)
}

/// Returns true if the message body uses chunked transfer coding.
pub fn is_chunked(headers: &HeaderMap) -> bool {
    headers
        .get_all(TRANSFER_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case("chunked"))
}

/// Parses `Content-Length`, if present.
pub fn content_length(headers: &HeaderMap) -> Result<Option<u64>> {
    match headers.get(CONTENT_LENGTH) {
        None => Ok(None),
        Some(v) => v
            .to_str()
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Some)
            .ok_or_else(|| ProxyError::MalformedRequest("invalid content-length".into())),
    }
}

/// Reads the body belonging to a request head.
///
/// Requests without `Content-Length` or chunked coding have no body. Bodies
/// above `max_body` fail with [`ProxyError::BodyTooLarge`]; a declared length
/// is checked before anything is buffered.
pub async fn read_request_body<R>(
    reader: &mut R,
    headers: &HeaderMap,
    max_body: usize,
) -> Result<Bytes>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    if is_chunked(headers) {
        return read_chunked(reader, max_body).await;
    }
    match content_length(headers)? {
        None | Some(0) => Ok(Bytes::new()),
        Some(len) => {
            check_body_len(len, max_body)?;
            let len = usize::try_from(len)
                .map_err(|_| ProxyError::MalformedRequest("content-length overflow".into()))?;
            let mut buf = vec![0u8; len];
            reader.read_exact(&mut buf).await?;
            Ok(Bytes::from(buf))
        }
    }
}

/// Fails when a declared `Content-Length` is above `max_body`.
///
/// Chunked requests pass; their size is only known while reading.
pub fn check_declared_body(headers: &HeaderMap, max_body: usize) -> Result<()> {
    if is_chunked(headers) {
        return Ok(());
    }
    match content_length(headers)? {
        Some(len) => check_body_len(len, max_body),
        None => Ok(()),
    }
}

fn check_body_len(len: u64, max_body: usize) -> Result<()> {
    if len > max_body as u64 {
        return Err(ProxyError::BodyTooLarge { len, max: max_body });
    }
    Ok(())
}

/// Whether the client waits for `100 Continue` before sending its body.
pub fn expects_continue(headers: &HeaderMap) -> bool {
    headers
        .get(EXPECT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("100-continue"))
}

/// Whether the head announces a body at all.
pub fn has_body(headers: &HeaderMap) -> bool {
    is_chunked(headers) || matches!(content_length(headers), Ok(Some(len)) if len > 0)
}

async fn read_chunked<R>(reader: &mut R, max_body: usize) -> Result<Bytes>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    let mut body = BytesMut::new();
    let mut line = Vec::with_capacity(32);
    loop {
        line.clear();
        read_line(reader, &mut line).await?;
        let text = std::str::from_utf8(&line)
            .map_err(|_| ProxyError::MalformedRequest("invalid chunk size".into()))?;
        let size = text.split(';').next().unwrap_or("").trim();
        let size = u64::from_str_radix(size, 16)
            .map_err(|_| ProxyError::MalformedRequest("invalid chunk size".into()))?;

        if size == 0 {
            // Trailers are read and dropped.
            loop {
                line.clear();
                read_line(reader, &mut line).await?;
                if is_blank(&line) {
                    return Ok(body.freeze());
                }
            }
        }

        let total = (body.len() as u64).saturating_add(size);
        check_body_len(total, max_body)?;

        let start = body.len();
        body.resize(start + size as usize, 0);
        reader.read_exact(&mut body[start..]).await?;

        line.clear();
        read_line(reader, &mut line).await?;
        if !is_blank(&line) {
            return Err(ProxyError::MalformedRequest("missing chunk terminator".into()));
        }
    }
}

async fn read_line<R>(reader: &mut R, line: &mut Vec<u8>) -> Result<()>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    let n = (&mut *reader)
        .take(MAX_CHUNK_LINE as u64)
        .read_until(b'\n', line)
        .await?;
    if n == 0 {
        return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
    }
    if !line.ends_with(b"\n") {
        return Err(ProxyError::MalformedRequest("chunk line too long".into()));
    }
    Ok(())
}

fn is_blank(line: &[u8]) -> bool {
    line == b"\r\n" || line == b"\n"
}

/// How a response body is delimited on the client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// No body at all (HEAD, 1xx, 204, 304).
    Empty,
    /// `Transfer-Encoding: chunked`.
    Chunked,
    /// Raw bytes delimited by closing the connection (HTTP/1.0 clients).
    UntilClose,
}

/// What happens to the client connection after the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Persistence {
    /// Advertise `Connection: close`.
    Close,
    /// Leave the connection open for the next request.
    KeepAlive,
    /// HTTP/1.0 client: no chunked coding, body ends at close.
    Http10,
}

/// Returns true if a response to `method` with `status` must not carry a body.
pub fn body_forbidden(status: StatusCode, method: &Method) -> bool {
    method == Method::HEAD
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
}

/// Rewrites the framing headers of `resp` and returns the framing to use.
///
/// `Content-Length` is always dropped. Body-less responses carry no length
/// header at all; everything else is chunked. WebSocket handshakes keep the
/// origin's `Connection` header.
pub fn prepare_response<B>(
    resp: &mut Response<B>,
    method: &Method,
    persistence: Persistence,
) -> Framing {
    let websocket = is_websocket_upgrade(resp);
    let status = resp.status();
    let headers = resp.headers_mut();

    headers.remove(CONTENT_LENGTH);
    let framing = if body_forbidden(status, method) {
        headers.remove(TRANSFER_ENCODING);
        Framing::Empty
    } else if persistence == Persistence::Http10 {
        headers.remove(TRANSFER_ENCODING);
        Framing::UntilClose
    } else {
        headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        Framing::Chunked
    };

    if !websocket && persistence != Persistence::KeepAlive {
        headers.insert(CONNECTION, HeaderValue::from_static("close"));
    }

    framing
}

/// Serialises the status line and headers of `resp`.
pub fn encode_response_head<B>(resp: &Response<B>, title_case_names: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    let status = resp.status();

    out.extend_from_slice(b"HTTP/1.1 ");
    out.extend_from_slice(status.as_str().as_bytes());
    out.push(b' ');
    match resp.extensions().get::<hyper::ext::ReasonPhrase>() {
        Some(reason) => out.extend_from_slice(reason.as_bytes()),
        None => out.extend_from_slice(status.canonical_reason().unwrap_or("").as_bytes()),
    }
    out.extend_from_slice(b"\r\n");

    for (name, value) in resp.headers() {
        if title_case_names {
            out.extend_from_slice(title_case(name.as_str()).as_bytes());
        } else {
            out.extend_from_slice(name.as_str().as_bytes());
        }
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out
}

/// Writes the head of `resp` (already prepared by [`prepare_response`]).
pub async fn write_response_head<W, B>(
    w: &mut W,
    resp: &Response<B>,
    title_case_names: bool,
) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    w.write_all(&encode_response_head(resp, title_case_names))
        .await?;
    w.flush().await?;
    Ok(())
}

/// Streams `body` to `w` using `framing`. Returns the number of payload bytes.
pub async fn write_body<W>(w: &mut W, mut body: Body, framing: Framing) -> Result<u64>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    if framing == Framing::Empty {
        return Ok(0);
    }

    let mut written = 0u64;
    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|e| ProxyError::Http(format!("body error: {}", e)))?;
        let Ok(data) = frame.into_data() else {
            continue;
        };
        if data.is_empty() {
            continue;
        }
        if framing == Framing::Chunked {
            w.write_all(format!("{:x}\r\n", data.len()).as_bytes())
                .await?;
            w.write_all(&data).await?;
            w.write_all(b"\r\n").await?;
        } else {
            w.write_all(&data).await?;
        }
        w.flush().await?;
        written += data.len() as u64;
    }

    if framing == Framing::Chunked {
        w.write_all(b"0\r\n\r\n").await?;
    }
    w.flush().await?;
    Ok(written)
}

/// Prepares, then writes a full response.
pub async fn write_response<W>(
    w: &mut W,
    mut resp: Response<Body>,
    method: &Method,
    persistence: Persistence,
    title_case_names: bool,
) -> Result<Framing>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let framing = prepare_response(&mut resp, method, persistence);
    write_response_head(w, &resp, title_case_names).await?;
    write_body(w, resp.into_body(), framing).await?;
    Ok(framing)
}

/// Writes a canned response with an exact `Content-Length`, then `Connection: close`.
///
/// Used where the connection ends right after, such as rejected CONNECTs.
pub async fn write_canned_response<W>(
    w: &mut W,
    resp: Response<Body>,
    title_case_names: bool,
) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let (mut parts, body) = resp.into_parts();
    let bytes = body
        .collect()
        .await
        .map_err(|e| ProxyError::Http(format!("body error: {}", e)))?
        .to_bytes();

    parts.headers.remove(TRANSFER_ENCODING);
    parts.headers.insert(CONTENT_LENGTH, HeaderValue::from(bytes.len()));
    parts
        .headers
        .insert(CONNECTION, HeaderValue::from_static("close"));

    let head = Response::from_parts(parts, ());
    w.write_all(&encode_response_head(&head, title_case_names))
        .await?;
    w.write_all(&bytes).await?;
    w.flush().await?;
    Ok(())
}
