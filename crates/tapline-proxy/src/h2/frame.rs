//! HTTP/2 frame codec.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::FrameError;

/// Length of the fixed frame header.
pub const FRAME_HEADER_LEN: usize = 9;

/// Largest payload length the 24-bit length field can express.
///
/// Peers may raise `SETTINGS_MAX_FRAME_SIZE` up to this value, and the relay
/// never sees their SETTINGS exchange as a party, so this is also the default
/// cap.
pub const DEFAULT_MAX_FRAME_SIZE: usize = (1 << 24) - 1;

const STREAM_ID_MASK: u32 = 0x7fff_ffff;

/// Frame flag bits.
pub mod flags {
    /// DATA / HEADERS: last frame of the stream.
    pub const END_STREAM: u8 = 0x1;
    /// SETTINGS / PING: acknowledgement.
    pub const ACK: u8 = 0x1;
    /// HEADERS / PUSH_PROMISE / CONTINUATION: header block complete.
    pub const END_HEADERS: u8 = 0x4;
    /// DATA / HEADERS / PUSH_PROMISE: payload is padded.
    pub const PADDED: u8 = 0x8;
    /// HEADERS: priority fields present.
    pub const PRIORITY: u8 = 0x20;
}

/// Frame types the relay forwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Data,
    Headers,
    Priority,
    RstStream,
    Settings,
    PushPromise,
    Ping,
    GoAway,
    WindowUpdate,
    Continuation,
}

impl FrameKind {
    /// Wire identifier.
    pub fn as_u8(self) -> u8 {
        match self {
            FrameKind::Data => 0x0,
            FrameKind::Headers => 0x1,
            FrameKind::Priority => 0x2,
            FrameKind::RstStream => 0x3,
            FrameKind::Settings => 0x4,
            FrameKind::PushPromise => 0x5,
            FrameKind::Ping => 0x6,
            FrameKind::GoAway => 0x7,
            FrameKind::WindowUpdate => 0x8,
            FrameKind::Continuation => 0x9,
        }
    }

    /// Name used in error messages.
    pub fn name(self) -> &'static str {
        match self {
            FrameKind::Data => "DATA",
            FrameKind::Headers => "HEADERS",
            FrameKind::Priority => "PRIORITY",
            FrameKind::RstStream => "RST_STREAM",
            FrameKind::Settings => "SETTINGS",
            FrameKind::PushPromise => "PUSH_PROMISE",
            FrameKind::Ping => "PING",
            FrameKind::GoAway => "GOAWAY",
            FrameKind::WindowUpdate => "WINDOW_UPDATE",
            FrameKind::Continuation => "CONTINUATION",
        }
    }

    fn on_connection(self) -> bool {
        matches!(self, FrameKind::Settings | FrameKind::Ping | FrameKind::GoAway)
    }
}

impl TryFrom<u8> for FrameKind {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, FrameError> {
        Ok(match value {
            0x0 => FrameKind::Data,
            0x1 => FrameKind::Headers,
            0x2 => FrameKind::Priority,
            0x3 => FrameKind::RstStream,
            0x4 => FrameKind::Settings,
            0x5 => FrameKind::PushPromise,
            0x6 => FrameKind::Ping,
            0x7 => FrameKind::GoAway,
            0x8 => FrameKind::WindowUpdate,
            0x9 => FrameKind::Continuation,
            other => return Err(FrameError::UnsupportedKind(other)),
        })
    }
}

/// One HTTP/2 frame. The payload is kept as received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub flags: u8,
    pub stream_id: u32,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(kind: FrameKind, flags: u8, stream_id: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            flags,
            stream_id: stream_id & STREAM_ID_MASK,
            payload: payload.into(),
        }
    }

    /// Returns true for a DATA frame carrying END_STREAM.
    pub fn is_data_end(&self) -> bool {
        self.kind == FrameKind::Data && self.flags & flags::END_STREAM != 0
    }

    fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    fn invalid(&self, reason: &'static str) -> FrameError {
        FrameError::InvalidPayload {
            kind: self.kind.name(),
            reason,
        }
    }

    /// Checks the layout rules of the frame type.
    pub fn validate(&self) -> Result<(), FrameError> {
        let len = self.payload.len();

        if self.kind.on_connection() && self.stream_id != 0 {
            return Err(self.invalid("must be sent on stream 0"));
        }
        if !self.kind.on_connection() && self.kind != FrameKind::WindowUpdate && self.stream_id == 0
        {
            return Err(self.invalid("must not be sent on stream 0"));
        }

        match self.kind {
            FrameKind::Settings => {
                if self.has_flag(flags::ACK) && len != 0 {
                    return Err(self.invalid("acknowledgement with payload"));
                }
                if len % 6 != 0 {
                    return Err(self.invalid("length is not a multiple of 6"));
                }
            }
            FrameKind::Ping if len != 8 => return Err(self.invalid("length must be 8")),
            FrameKind::WindowUpdate | FrameKind::RstStream if len != 4 => {
                return Err(self.invalid("length must be 4"));
            }
            FrameKind::Priority if len != 5 => return Err(self.invalid("length must be 5")),
            FrameKind::GoAway if len < 8 => return Err(self.invalid("shorter than 8 bytes")),
            FrameKind::Data | FrameKind::Headers | FrameKind::PushPromise => {
                let mut min = 0;
                if self.has_flag(flags::PADDED) {
                    let pad = *self.payload.first().ok_or_else(|| self.invalid("missing pad length"))?;
                    min += 1 + pad as usize;
                }
                if self.kind == FrameKind::Headers && self.has_flag(flags::PRIORITY) {
                    min += 5;
                }
                if self.kind == FrameKind::PushPromise {
                    min += 4;
                }
                if len < min {
                    return Err(self.invalid("padding exceeds payload"));
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Length-delimited HTTP/2 frame codec.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl FrameCodec {
    /// Creates a codec refusing payloads above `max_frame_size`.
    ///
    /// Values above the protocol maximum are clamped to it.
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            max_frame_size: max_frame_size.min(DEFAULT_MAX_FRAME_SIZE),
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if src.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let len = (src[0] as usize) << 16 | (src[1] as usize) << 8 | src[2] as usize;
        if len > self.max_frame_size {
            return Err(FrameError::FrameTooLarge {
                len,
                max: self.max_frame_size,
            });
        }
        let kind = FrameKind::try_from(src[3])?;

        if src.len() < FRAME_HEADER_LEN + len {
            src.reserve(FRAME_HEADER_LEN + len - src.len());
            return Ok(None);
        }

        let flags = src[4];
        let stream_id = u32::from_be_bytes([src[5], src[6], src[7], src[8]]) & STREAM_ID_MASK;
        src.advance(FRAME_HEADER_LEN);
        let payload = src.split_to(len).freeze();

        let frame = Frame {
            kind,
            flags,
            stream_id,
            payload,
        };
        frame.validate()?;
        Ok(Some(frame))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        let len = frame.payload.len();
        if len > self.max_frame_size {
            return Err(FrameError::FrameTooLarge {
                len,
                max: self.max_frame_size,
            });
        }

        dst.reserve(FRAME_HEADER_LEN + len);
        dst.put_uint(len as u64, 3);
        dst.put_u8(frame.kind.as_u8());
        dst.put_u8(frame.flags);
        dst.put_u32(frame.stream_id & STREAM_ID_MASK);
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(frame: Frame) -> BytesMut {
        let mut buf = BytesMut::new();
        FrameCodec::default().encode(frame, &mut buf).unwrap();
        buf
    }

    #[test]
    fn encodes_header_layout() {
        let buf = encode(Frame::new(FrameKind::Data, flags::END_STREAM, 3, &b"hi"[..]));
        assert_eq!(&buf[..], &[0, 0, 2, 0x0, 0x1, 0, 0, 0, 3, b'h', b'i']);
    }

    #[test]
    fn waits_for_complete_frame() {
        let full = encode(Frame::new(FrameKind::Ping, 0, 0, vec![1u8; 8]));
        let mut codec = FrameCodec::default();

        let mut partial = BytesMut::from(&full[..12]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&full[12..]);
        let frame = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(frame.kind, FrameKind::Ping);
        assert_eq!(frame.payload.len(), 8);
        assert!(partial.is_empty());
    }

    #[test]
    fn header_block_is_opaque() {
        let block = vec![0x82, 0x86, 0x84, 0x41, 0x8a];
        let mut buf = encode(Frame::new(
            FrameKind::Headers,
            flags::END_HEADERS,
            1,
            block.clone(),
        ));
        let frame = FrameCodec::default().decode(&mut buf).unwrap().unwrap();
        assert_eq!(&frame.payload[..], &block[..]);
    }

    #[test]
    fn rejects_unknown_kind() {
        let mut buf = BytesMut::from(&[0u8, 0, 0, 0x0a, 0, 0, 0, 0, 0][..]);
        let err = FrameCodec::default().decode(&mut buf).unwrap_err();
        assert!(matches!(err, FrameError::UnsupportedKind(0x0a)));
    }

    #[test]
    fn rejects_oversized_frame() {
        let mut buf = BytesMut::from(&[0x01u8, 0, 0, 0x0, 0, 0, 0, 0, 1][..]);
        let err = FrameCodec::new(1024).decode(&mut buf).unwrap_err();
        assert!(matches!(err, FrameError::FrameTooLarge { len: 65536, max: 1024 }));
    }

    #[test]
    fn default_codec_accepts_frames_above_initial_setting() {
        let mut buf = encode(Frame::new(FrameKind::Data, 0, 1, vec![7u8; 20_000]));
        let frame = FrameCodec::default().decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.payload.len(), 20_000);

        let codec = FrameCodec::new(usize::MAX);
        assert_eq!(codec.max_frame_size, DEFAULT_MAX_FRAME_SIZE);
    }

    #[test]
    fn validates_layouts() {
        assert!(Frame::new(FrameKind::Settings, 0, 0, vec![0u8; 7]).validate().is_err());
        assert!(Frame::new(FrameKind::Settings, flags::ACK, 0, vec![0u8; 6]).validate().is_err());
        assert!(Frame::new(FrameKind::Settings, flags::ACK, 0, Bytes::new()).validate().is_ok());
        assert!(Frame::new(FrameKind::Ping, 0, 1, vec![0u8; 8]).validate().is_err());
        assert!(Frame::new(FrameKind::WindowUpdate, 0, 0, vec![0u8; 4]).validate().is_ok());
        assert!(Frame::new(FrameKind::Data, 0, 0, Bytes::new()).validate().is_err());
        assert!(Frame::new(FrameKind::Data, flags::PADDED, 1, vec![5u8, 1, 2]).validate().is_err());
        assert!(Frame::new(FrameKind::GoAway, 0, 0, vec![0u8; 8]).validate().is_ok());
    }

    #[test]
    fn data_end_detection() {
        assert!(Frame::new(FrameKind::Data, flags::END_STREAM, 1, Bytes::new()).is_data_end());
        assert!(!Frame::new(FrameKind::Headers, flags::END_STREAM, 1, Bytes::new()).is_data_end());
    }
}
