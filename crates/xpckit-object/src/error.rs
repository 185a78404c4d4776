use std::fmt::Display;
use std::path::PathBuf;

/// Errors converting between typed values and the native object tree.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BridgeError {
    /// The value has no native representation.
    #[error("encoding unsupported: {0}")]
    EncodingUnsupported(String),

    /// The object's shape doesn't match the requested type.
    #[error("decoding mismatch: expected {expected}, found {actual}")]
    DecodingMismatch { expected: String, actual: String },

    /// Any other failure raised by a `Serialize`/`Deserialize` impl.
    #[error("{0}")]
    Custom(String),
}

impl serde::ser::Error for BridgeError {
    fn custom<T: Display>(msg: T) -> Self {
        BridgeError::Custom(msg.to_string())
    }
}

impl serde::de::Error for BridgeError {
    fn custom<T: Display>(msg: T) -> Self {
        BridgeError::Custom(msg.to_string())
    }

    fn invalid_type(unexp: serde::de::Unexpected<'_>, exp: &dyn serde::de::Expected) -> Self {
        BridgeError::DecodingMismatch {
            expected: exp.to_string(),
            actual: unexp.to_string(),
        }
    }

    fn invalid_value(unexp: serde::de::Unexpected<'_>, exp: &dyn serde::de::Expected) -> Self {
        BridgeError::DecodingMismatch {
            expected: exp.to_string(),
            actual: unexp.to_string(),
        }
    }

    fn missing_field(field: &'static str) -> Self {
        BridgeError::DecodingMismatch {
            expected: format!("field `{field}`"),
            actual: "no such key".to_string(),
        }
    }
}

/// Errors in the binary wire form of an object tree.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// The buffer ended before the value did.
    #[error("truncated object: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    /// A value tag this decoder does not know.
    #[error("unknown object tag 0x{0:02x}")]
    UnknownTag(u8),

    /// Nesting deeper than the decoder allows.
    #[error("object nesting exceeds {0} levels")]
    DepthExceeded(usize),

    /// A string or dictionary key is not valid UTF-8.
    #[error("invalid utf-8 in string value")]
    InvalidUtf8,

    /// Bytes left over after the root value.
    #[error("{0} trailing bytes after object")]
    TrailingBytes(usize),

    /// A length or count does not fit the wire format.
    #[error("object too large for wire form ({0} entries)")]
    TooLarge(usize),

    /// A shared-memory surface could not be sent or received.
    #[error("surface error: {0}")]
    Surface(#[from] SurfaceError),
}

/// Errors creating, mapping or transferring shared-memory surfaces.
#[derive(Debug, thiserror::Error)]
pub enum SurfaceError {
    /// Surfaces must have a non-zero length.
    #[error("invalid surface length {0}")]
    InvalidLength(usize),

    /// Access outside the mapped region.
    #[error("access at {offset}+{len} outside surface of {size} bytes")]
    OutOfBounds {
        offset: usize,
        len: usize,
        size: usize,
    },

    /// The surface already moved to another process.
    #[error("surface {0} was already transferred")]
    AlreadyTransferred(PathBuf),

    /// A received surface path failed validation.
    #[error("refusing surface {path}: {reason}")]
    Untrusted { path: PathBuf, reason: String },

    /// A surface was decoded outside the native object bridge.
    #[error("shared memory surfaces can only be decoded from a native object")]
    NotNative,

    /// Creating or mapping the backing file failed.
    #[error("surface I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}
