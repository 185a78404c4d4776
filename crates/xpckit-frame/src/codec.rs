use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{FrameError, Result};
use crate::kind::{is_known, MESSAGE};

/// Frame header: magic (2) + length (4) + kind (2) + port (8) = 16 bytes.
pub const HEADER_SIZE: usize = 16;

/// Magic bytes: "XP" (0x58 0x50).
pub const MAGIC: [u8; 2] = [0x58, 0x50];

/// Default maximum payload size: 16 MiB.
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Reply port value meaning "no reply expected".
pub const NO_REPLY_PORT: u64 = 0;

/// A framed unit on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame kind (see [`crate::kind`]).
    pub kind: u16,
    /// Reply port; [`NO_REPLY_PORT`] for oneway messages.
    pub port: u64,
    /// Encoded object payload.
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame.
    pub fn new(kind: u16, port: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            port,
            payload: payload.into(),
        }
    }

    /// Whether this is a message that expects a reply.
    pub fn wants_reply(&self) -> bool {
        self.kind == MESSAGE && self.port != NO_REPLY_PORT
    }

    /// The total wire size of this frame (header + payload).
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

/// Encode a frame into the wire format.
///
/// ```text
/// ┌────────────┬──────────┬──────────┬──────────┬──────────────┐
/// │ Magic (2B) │ Length   │ Kind     │ Port     │ Payload      │
/// │ "XP"       │ (4B LE)  │ (2B LE)  │ (8B LE)  │ (Length B)   │
/// └────────────┴──────────┴──────────┴──────────┴──────────────┘
/// ```
pub fn encode_frame(frame: &Frame, max_payload: usize, dst: &mut BytesMut) -> Result<()> {
    let limit = max_payload.min(u32::MAX as usize);
    if frame.payload.len() > limit {
        return Err(FrameError::PayloadTooLarge {
            size: frame.payload.len(),
            max: limit,
        });
    }
    dst.reserve(frame.wire_size());
    dst.put_slice(&MAGIC);
    dst.put_u32_le(frame.payload.len() as u32);
    dst.put_u16_le(frame.kind);
    dst.put_u64_le(frame.port);
    dst.put_slice(&frame.payload);
    Ok(())
}

/// Decode a frame from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// On success, consumes the frame bytes from the buffer.
pub fn decode_frame(src: &mut BytesMut, max_payload: usize) -> Result<Option<Frame>> {
    if src.len() < HEADER_SIZE {
        return Ok(None);
    }

    if src[0..2] != MAGIC {
        return Err(FrameError::InvalidMagic);
    }

    let mut header = &src[2..HEADER_SIZE];
    let payload_len = header.get_u32_le() as usize;
    let kind = header.get_u16_le();
    let port = header.get_u64_le();

    if !is_known(kind) {
        return Err(FrameError::UnknownKind(kind));
    }
    if payload_len > max_payload {
        return Err(FrameError::PayloadTooLarge {
            size: payload_len,
            max: max_payload,
        });
    }

    let total = HEADER_SIZE + payload_len;
    if src.len() < total {
        src.reserve(total - src.len());
        return Ok(None);
    }

    src.advance(HEADER_SIZE);
    let payload = src.split_to(payload_len).freeze();

    Ok(Some(Frame {
        kind,
        port,
        payload,
    }))
}

/// Configuration for the frame codec.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum payload size in bytes. Default: 16 MiB.
    pub max_payload_size: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
        }
    }
}

/// `tokio_util` codec over [`Frame`]s.
#[derive(Debug, Clone, Default)]
pub struct XpcCodec {
    config: FrameConfig,
}

impl XpcCodec {
    /// Codec with explicit configuration.
    pub fn with_config(config: FrameConfig) -> Self {
        Self { config }
    }

    /// Update maximum payload size for subsequent frames.
    pub fn set_max_payload_size(&mut self, max_payload_size: usize) {
        self.config.max_payload_size = max_payload_size;
    }

    /// Current codec configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

impl Decoder for XpcCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        decode_frame(src, self.config.max_payload_size)
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None if buf.is_empty() => Ok(None),
            None => Err(FrameError::ConnectionClosed),
        }
    }
}

impl Encoder<Frame> for XpcCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        encode_frame(&frame, self.config.max_payload_size, dst)
    }
}
