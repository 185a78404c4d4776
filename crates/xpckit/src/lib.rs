//! Typed request/response messaging between processes.
//!
//! xpckit lets two processes exchange serde types and structured errors over
//! a capability-passing transport. Connections are made by service name, by
//! accepting peers on a listener, or through an endpoint found inside
//! another message. Shared memory surfaces travel as mappings, and both
//! sides can require a code identity of the other before trusting it.
//!
//! # Crate Structure
//!
//! - [`transport`] — service namespace, Unix socket transport, peer credentials
//! - [`frame`] — length-prefixed frames with reply ports
//! - [`object`] — native object tree, wire form and serde bridge
//! - [`peer`] — connections, listeners, dispatch and error domains (behind `peer`)
//! - [`demo`] — the demo service run by `xpckit serve` (behind `demo`)

/// Re-export transport types.
pub mod transport {
    pub use xpckit_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use xpckit_frame::*;
}

/// Re-export object types.
pub mod object {
    pub use xpckit_object::*;
}

/// Re-export peer types (requires `peer` feature).
#[cfg(feature = "peer")]
pub mod peer {
    pub use xpckit_peer::*;
}

#[cfg(feature = "demo")]
pub mod demo;
