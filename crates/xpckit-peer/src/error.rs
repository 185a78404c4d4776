use std::time::Duration;

use xpckit_object::{BridgeError, SurfaceError, WireError};

use crate::domain::DomainError;

/// Errors surfaced by connections, listeners and handlers.
#[derive(Debug, thiserror::Error)]
pub enum XpcError {
    /// A value has no native representation. Raised before anything is sent.
    #[error("encoding unsupported: {0}")]
    EncodingUnsupported(String),

    /// An object did not have the shape the receiving type expects.
    #[error("decoding mismatch: expected {expected}, found {actual}")]
    DecodingMismatch { expected: String, actual: String },

    /// Any other failure raised inside a `Serialize`/`Deserialize` impl.
    #[error("bridge error: {0}")]
    Bridge(String),

    /// The code signing requirement text failed to parse.
    #[error("invalid code signing requirement '{requirement}': {reason}")]
    InvalidCodeSignatureRequirement { requirement: String, reason: String },

    /// The remote side refused us, or failed our requirement.
    #[error("peer forbidden: {0}")]
    PeerForbidden(String),

    /// The connection was canceled or the peer went away.
    #[error("connection invalid: {0}")]
    ConnectionInvalid(String),

    /// No handler is registered for the inbound message name.
    #[error("no handler registered for message '{0}'")]
    DispatchMissingHandler(String),

    /// A structured error from a registered domain.
    #[error(transparent)]
    Domain(DomainError),

    /// An error with nothing but a description.
    #[error("{description}")]
    Unknown { description: String },

    /// The connection has not been activated yet.
    #[error("connection is not activated")]
    NotActivated,

    /// No reply arrived in time.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] xpckit_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] xpckit_frame::FrameError),

    /// The binary object form was malformed or could not be produced.
    #[error("wire error: {0}")]
    Wire(WireError),

    /// Handshake failed.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),
}

impl XpcError {
    /// Opaque error carrying only `description`.
    pub fn unknown(description: impl Into<String>) -> Self {
        XpcError::Unknown {
            description: description.into(),
        }
    }

    /// Whether this error ends the connection it came from.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            XpcError::ConnectionInvalid(_) | XpcError::PeerForbidden(_)
        )
    }
}

impl From<BridgeError> for XpcError {
    fn from(err: BridgeError) -> Self {
        match err {
            BridgeError::EncodingUnsupported(what) => XpcError::EncodingUnsupported(what),
            BridgeError::DecodingMismatch { expected, actual } => {
                XpcError::DecodingMismatch { expected, actual }
            }
            BridgeError::Custom(message) => XpcError::Bridge(message),
        }
    }
}

impl From<WireError> for XpcError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::Surface(err @ SurfaceError::AlreadyTransferred(_)) => {
                XpcError::EncodingUnsupported(err.to_string())
            }
            other => XpcError::Wire(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, XpcError>;
