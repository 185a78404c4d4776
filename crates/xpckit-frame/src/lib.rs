//! Length-prefixed message framing with reply ports.
//!
//! Every frame is prefixed with a 16-byte header:
//! - a 2-byte magic number ("XP") for stream synchronization
//! - a 4-byte little-endian payload length
//! - a 2-byte little-endian frame kind (CONTROL, MESSAGE, REPLY)
//! - an 8-byte little-endian reply port
//!
//! A MESSAGE frame with a non-zero port expects exactly one REPLY frame
//! carrying the same port. Port zero marks a oneway message.

pub mod codec;
pub mod error;
pub mod kind;

pub use codec::{
    decode_frame, encode_frame, Frame, FrameConfig, XpcCodec, DEFAULT_MAX_PAYLOAD, HEADER_SIZE,
    NO_REPLY_PORT,
};
pub use error::{FrameError, Result};
pub use kind::{kind_name, CONTROL, MESSAGE, REPLY};
