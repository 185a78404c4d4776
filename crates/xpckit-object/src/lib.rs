//! Native object tree for xpckit and the bridge to typed values.
//!
//! [`XpcObject`] is the transport's tagged value model: scalars, byte buffers,
//! dates, arrays, dictionaries, and two capability kinds ([`Endpoint`] and
//! [`SharedMemory`]). The [`to_object`] / [`from_object`] pair converts any
//! serde type to and from that tree, and [`wire`] gives the tree a binary
//! form for the stream transport.
//!
//! Handlers that don't want typed conversion work on [`Dictionary`] directly
//! with get/set-by-key accessors; both paths address the same tree.

pub mod date;
pub mod de;
pub mod dictionary;
pub mod endpoint;
pub mod error;
pub mod object;
pub mod ser;
pub mod surface;
pub mod wire;

pub use date::Date;
pub use de::{from_object, ObjectDeserializer};
pub use dictionary::Dictionary;
pub use endpoint::Endpoint;
pub use error::{BridgeError, SurfaceError, WireError};
pub use object::XpcObject;
pub use ser::{to_object, ObjectSerializer};
pub use surface::{SharedMemory, TransferClaims, SURFACE_KEY};

/// Newtype-struct names that mark capability and date values for the bridge.
///
/// Values serialized under these names are rebuilt as native kinds rather
/// than ordinary data.
pub(crate) mod token {
    pub const ENDPOINT: &str = "$xpckit::private::Endpoint";
    pub const SURFACE: &str = "$xpckit::private::SharedMemory";
    pub const DATE: &str = "$xpckit::private::Date";
}
