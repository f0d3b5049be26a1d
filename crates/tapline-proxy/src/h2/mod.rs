//! HTTP/2 pass-through for intercepted tunnels.
//!
//! Frames are decoded only far enough to re-frame them on the other
//! connection. Header blocks are forwarded as opaque bytes so both peers keep
//! a single, consistent HPACK state.

mod frame;
mod relay;

pub use frame::{flags, Frame, FrameCodec, FrameKind, DEFAULT_MAX_FRAME_SIZE, FRAME_HEADER_LEN};
pub use relay::{relay_frames, relay_h2, ALPN_H2};
