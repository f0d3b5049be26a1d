//! Error types for the proxy.

use std::io;

use thiserror::Error;

/// Proxy error type.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// CA certificate error.
    #[error("CA error: {0}")]
    Ca(#[from] CaManagerError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// TLS error.
    #[error("TLS error: {0}")]
    Tls(String),

    /// HTTP error (building or converting messages).
    #[error("HTTP error: {0}")]
    Http(String),

    /// Error reported by hyper while talking to an origin.
    #[error("origin error: {0}")]
    Hyper(#[from] hyper::Error),

    /// Malformed CONNECT request.
    #[error("Invalid CONNECT request: {0}")]
    InvalidConnect(String),

    /// Malformed HTTP/1 request read from a client.
    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    /// Request body larger than the configured ceiling.
    #[error("request body of {len} bytes exceeds limit of {max}")]
    BodyTooLarge {
        /// Declared (or so far received) body length.
        len: u64,
        /// Configured ceiling.
        max: usize,
    },

    /// HTTP/2 framing error.
    #[error("HTTP/2 frame error: {0}")]
    Frame(#[from] FrameError),

    /// Failed to connect to an origin server.
    #[error("Failed to connect to upstream '{addr}': {message}")]
    UpstreamConnect {
        /// The address we tried to connect to.
        addr: String,
        /// Error message.
        message: String,
    },

    /// The client went away while a request was in flight.
    #[error("request cancelled")]
    Cancelled,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Proxy server error.
    #[error("Proxy error: {0}")]
    Proxy(String),
}

impl ProxyError {
    /// Returns true when the error only signals that a peer closed its side.
    ///
    /// Loops treat these as normal termination.
    pub fn is_eof(&self) -> bool {
        match self {
            ProxyError::Io(e) => is_closed_kind(e.kind()),
            ProxyError::Frame(FrameError::Io(e)) => is_closed_kind(e.kind()),
            ProxyError::Cancelled => true,
            _ => false,
        }
    }
}

fn is_closed_kind(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
    )
}

impl From<rustls::Error> for ProxyError {
    fn from(err: rustls::Error) -> Self {
        ProxyError::Tls(err.to_string())
    }
}

impl From<http::Error> for ProxyError {
    fn from(err: http::Error) -> Self {
        ProxyError::Http(err.to_string())
    }
}

impl From<hyper_util::client::legacy::Error> for ProxyError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        ProxyError::Http(err.to_string())
    }
}

/// CA manager error type.
#[derive(Debug, Error)]
pub enum CaManagerError {
    /// Failed to generate CA certificate.
    #[error("Failed to generate CA: {0}")]
    Generation(String),

    /// Failed to read CA certificate.
    #[error("Failed to read CA: {0}")]
    Read(#[from] std::io::Error),

    /// Failed to parse CA certificate.
    #[error("Failed to parse CA: {0}")]
    Parse(String),

    /// Failed to write CA certificate.
    #[error("Failed to write CA: {0}")]
    Write(String),
}

/// HTTP/2 frame codec error type.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Frame type outside the set the relay forwards.
    #[error("unsupported frame type 0x{0:02x}")]
    UnsupportedKind(u8),

    /// Declared payload length exceeds the configured ceiling.
    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge {
        /// Declared payload length.
        len: usize,
        /// Configured ceiling.
        max: usize,
    },

    /// Payload does not match the layout required by its frame type.
    #[error("invalid {kind} payload: {reason}")]
    InvalidPayload {
        /// Frame type name.
        kind: &'static str,
        /// What was wrong.
        reason: &'static str,
    },

    /// Transport error underneath the codec.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
