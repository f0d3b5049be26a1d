//! Body type shared by filters, the origin client and the response writer.

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;

/// Boxed error carried by message bodies.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Message body used throughout the proxy.
pub type Body = BoxBody<Bytes, BoxError>;

/// Creates an empty body.
pub fn empty() -> Body {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

/// Creates a body holding `bytes`.
pub fn full(bytes: impl Into<Bytes>) -> Body {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed()
}

/// Wraps a body received from hyper.
pub fn incoming(body: Incoming) -> Body {
    body.map_err(|e| Box::new(e) as BoxError).boxed()
}
