use std::fmt;
use std::path::{Path, PathBuf};

use serde::de::{self, Deserializer, Visitor};
use serde::ser::Error as _;
use serde::{Deserialize, Serialize, Serializer};

use crate::token;

/// Transferable capability to open a connection to an anonymous listener.
///
/// Any process holding an endpoint can connect to the listener that made
/// it, without going through whoever handed the endpoint over. In the
/// object tree it is its own kind and never aliases an ordinary string.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    socket_path: PathBuf,
}

impl Endpoint {
    /// Endpoint for the listener bound at `socket_path`.
    ///
    /// Listeners create these; applications normally receive them inside
    /// message payloads.
    pub fn from_socket_path(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    /// Socket path of the originating listener.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Endpoint({})", self.socket_path.display())
    }
}

impl Serialize for Endpoint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let path = self
            .socket_path
            .to_str()
            .ok_or_else(|| S::Error::custom("endpoint path is not valid UTF-8"))?;
        serializer.serialize_newtype_struct(token::ENDPOINT, path)
    }
}

impl<'de> Deserialize<'de> for Endpoint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_newtype_struct(token::ENDPOINT, EndpointVisitor)
    }
}

struct EndpointVisitor;

impl<'de> Visitor<'de> for EndpointVisitor {
    type Value = Endpoint;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an endpoint")
    }

    fn visit_newtype_struct<D: Deserializer<'de>>(self, d: D) -> Result<Endpoint, D::Error> {
        String::deserialize(d).map(Endpoint::from_socket_path)
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Endpoint, E> {
        Ok(Endpoint::from_socket_path(v))
    }
}
