//! Native stream transport for xpckit.
//!
//! This is the lowest layer. It provides:
//! - a service namespace that maps service names to Unix domain socket paths
//! - async bind/accept/connect over those sockets
//! - kernel-sourced peer credentials and code identity
//!
//! Everything else builds on the [`UnixDomainSocket`] and
//! [`tokio::net::UnixStream`] values handed out here.

pub mod credentials;
pub mod error;
pub mod namespace;
pub mod uds;

pub use credentials::{CodeIdentity, PeerCredentials};
pub use error::{Result, TransportError};
pub use namespace::{ServiceNamespace, MAX_SERVICE_NAME_LEN};
pub use uds::UnixDomainSocket;
