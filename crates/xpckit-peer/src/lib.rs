//! Typed connections and listeners over the xpckit transport.
//!
//! This is the layer applications use. Connect by service name or endpoint,
//! accept peers with a [`Listener`], register handlers by message name, and
//! exchange serde types and structured errors in both directions.
//!
//! ```ignore
//! let listener = Listener::new(
//!     ListenerKind::NamedService { name: "com.example.echo".into(), privileged: false },
//!     None,
//! )?;
//! listener.handle("capitalize", |text: String| async move { Ok(text.to_uppercase()) });
//! listener.activate()?;
//!
//! let conn = Connection::to_service("com.example.echo", false, None)?;
//! conn.activate()?;
//! let upper: String = conn.send_message("capitalize", "hello").await?;
//! ```

pub mod connection;
pub mod domain;
pub mod error;
pub mod handler;
pub mod handshake;
pub mod listener;
pub mod protocol;
pub mod requirement;

pub use connection::{Connection, ConnectionKind, ConnectionState, ErrorHandler};
pub use domain::{
    is_registered, register_domain, registered_domains, DomainError, ErrorDomain, BUILTIN_DOMAIN,
};
pub use error::{Result, XpcError};
pub use handler::{Handler, HandlerFuture, HandlerTable};
pub use handshake::{HandshakeConfig, HandshakeRequest, HandshakeResponse, Verdict};
pub use listener::{Listener, ListenerKind};
pub use requirement::CodeRequirement;

pub use xpckit_object::{Date, Dictionary, Endpoint, SharedMemory, XpcObject, SURFACE_KEY};
pub use xpckit_transport::{CodeIdentity, PeerCredentials, ServiceNamespace};
