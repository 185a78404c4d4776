//! Process-wide error domain registry.
//!
//! A structured error type crosses the process boundary as its domain
//! identifier, a numeric code, a description and its encoded fields. The
//! receiving process rebuilds the original type only if that domain was
//! registered there; otherwise the caller sees [`XpcError::Unknown`] with
//! the description alone.
//!
//! The registry lives for the whole process. Registering the same domain
//! again replaces its decoder and leaves already-decoded errors untouched.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, LazyLock, PoisonError, RwLock};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;
use xpckit_object::{from_object, to_object, BridgeError, XpcObject};

use crate::error::XpcError;

/// Domain identifier reserved for xpckit's own error taxonomy.
pub const BUILTIN_DOMAIN: &str = "xpckit";

/// A structured error type that can be sent across the connection.
///
/// ```ignore
/// #[derive(Debug, thiserror::Error, Serialize, Deserialize)]
/// #[error("quota exceeded: {used}/{limit}")]
/// struct QuotaExceeded { used: u64, limit: u64 }
///
/// impl ErrorDomain for QuotaExceeded {
///     const DOMAIN: &'static str = "com.example.quota";
/// }
///
/// register_domain::<QuotaExceeded>();
/// ```
pub trait ErrorDomain:
    std::error::Error + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Stable identifier shared by both processes.
    const DOMAIN: &'static str;

    /// Numeric code within the domain.
    fn code(&self) -> i64 {
        0
    }
}

type Decoder = fn(XpcObject) -> Result<Arc<dyn Any + Send + Sync>, BridgeError>;

static REGISTRY: LazyLock<RwLock<HashMap<String, Decoder>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

fn decode_as<E: ErrorDomain>(fields: XpcObject) -> Result<Arc<dyn Any + Send + Sync>, BridgeError> {
    let value: E = from_object(fields)?;
    Ok(Arc::new(value))
}

/// Register `E` so errors of its domain are rebuilt as `E` on receipt.
pub fn register_domain<E: ErrorDomain>() {
    let previous = REGISTRY
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(E::DOMAIN.to_string(), decode_as::<E>);
    debug!(
        domain = E::DOMAIN,
        replaced = previous.is_some(),
        "registered error domain"
    );
}

/// Whether `domain` has a registered decoder in this process.
pub fn is_registered(domain: &str) -> bool {
    REGISTRY
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .contains_key(domain)
}

/// All registered domain identifiers, sorted.
pub fn registered_domains() -> Vec<String> {
    let mut domains: Vec<String> = REGISTRY
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .keys()
        .cloned()
        .collect();
    domains.sort();
    domains
}

fn lookup(domain: &str) -> Option<Decoder> {
    REGISTRY
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(domain)
        .copied()
}

/// An error from an application-defined domain.
///
/// Built locally with [`XpcError::domain`], or rebuilt from a reply through
/// the registry. [`DomainError::downcast_ref`] recovers the typed value.
#[derive(Clone)]
pub struct DomainError {
    domain: String,
    code: i64,
    description: String,
    fields: XpcObject,
    value: Option<Arc<dyn Any + Send + Sync>>,
}

impl DomainError {
    /// Wrap a typed domain error, encoding its fields for sending.
    pub fn new<E: ErrorDomain>(err: E) -> Result<Self, BridgeError> {
        let fields = to_object(&err)?;
        Ok(Self {
            domain: E::DOMAIN.to_string(),
            code: err.code(),
            description: err.to_string(),
            fields,
            value: Some(Arc::new(err)),
        })
    }

    /// Identifier of the domain this error belongs to.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn code(&self) -> i64 {
        self.code
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// The encoded field set.
    pub fn fields(&self) -> &XpcObject {
        &self.fields
    }

    /// The typed error, if it is an `E`.
    pub fn downcast_ref<E: ErrorDomain>(&self) -> Option<&E> {
        if self.domain != E::DOMAIN {
            return None;
        }
        self.value.as_deref()?.downcast_ref::<E>()
    }
}

impl fmt::Debug for DomainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DomainError")
            .field("domain", &self.domain)
            .field("code", &self.code)
            .field("description", &self.description)
            .field("fields", &self.fields)
            .finish()
    }
}

impl fmt::Display for DomainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description)
    }
}

impl std::error::Error for DomainError {}

impl XpcError {
    /// Wrap a domain error for returning from a handler.
    ///
    /// If the value cannot be encoded, the encode failure is returned instead.
    pub fn domain<E: ErrorDomain>(err: E) -> Self {
        match DomainError::new(err) {
            Ok(domain) => XpcError::Domain(domain),
            Err(err) => err.into(),
        }
    }

    /// The typed domain error carried by this error, if it is an `E`.
    pub fn downcast_ref<E: ErrorDomain>(&self) -> Option<&E> {
        match self {
            XpcError::Domain(domain) => domain.downcast_ref::<E>(),
            _ => None,
        }
    }
}

/// Rebuild an error reply from a non-builtin domain.
///
/// Unregistered domains and fields that fail to decode both degrade to
/// [`XpcError::Unknown`].
pub(crate) fn decode_domain_error(
    domain: String,
    code: i64,
    description: String,
    fields: XpcObject,
) -> XpcError {
    let Some(decoder) = lookup(&domain) else {
        debug!(%domain, "error domain not registered; reporting opaque error");
        return XpcError::unknown(description);
    };
    match decoder(fields.clone()) {
        Ok(value) => XpcError::Domain(DomainError {
            domain,
            code,
            description,
            fields,
            value: Some(value),
        }),
        Err(err) => {
            debug!(%domain, error = %err, "error fields did not decode; reporting opaque error");
            XpcError::unknown(description)
        }
    }
}
