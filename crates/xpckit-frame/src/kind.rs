//! Frame kinds.

/// Connection management (handshake and verdict).
pub const CONTROL: u16 = 0;

/// Application message; carries a reply port when two-way.
pub const MESSAGE: u16 = 1;

/// Reply to a two-way message, addressed by its reply port.
pub const REPLY: u16 = 2;

/// Returns a human-readable name for a frame kind.
pub fn kind_name(kind: u16) -> &'static str {
    match kind {
        CONTROL => "CONTROL",
        MESSAGE => "MESSAGE",
        REPLY => "REPLY",
        _ => "UNKNOWN",
    }
}

pub(crate) fn is_known(kind: u16) -> bool {
    kind <= REPLY
}
