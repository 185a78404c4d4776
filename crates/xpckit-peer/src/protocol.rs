//! Message and reply envelopes.
//!
//! A message is `{name, payload}`. A reply is either `{value}` or
//! `{error: {domain, code, description, fields}}`; an opaque error carries
//! only `description`.

use std::time::Duration;

use xpckit_object::{Dictionary, XpcObject};

use crate::domain::{self, BUILTIN_DOMAIN};
use crate::error::XpcError;

pub const KEY_NAME: &str = "name";
pub const KEY_PAYLOAD: &str = "payload";
pub const KEY_VALUE: &str = "value";
pub const KEY_ERROR: &str = "error";
pub const KEY_DOMAIN: &str = "domain";
pub const KEY_CODE: &str = "code";
pub const KEY_DESCRIPTION: &str = "description";
pub const KEY_FIELDS: &str = "fields";

/// Built-in error codes under [`BUILTIN_DOMAIN`].
pub mod code {
    pub const ENCODING_UNSUPPORTED: i64 = 1;
    pub const DECODING_MISMATCH: i64 = 2;
    pub const BRIDGE: i64 = 3;
    pub const INVALID_REQUIREMENT: i64 = 4;
    pub const PEER_FORBIDDEN: i64 = 5;
    pub const CONNECTION_INVALID: i64 = 6;
    pub const MISSING_HANDLER: i64 = 7;
    pub const NOT_ACTIVATED: i64 = 8;
    pub const TIMEOUT: i64 = 9;
    pub const TRANSPORT: i64 = 10;
    pub const FRAME: i64 = 11;
    pub const WIRE: i64 = 12;
    pub const HANDSHAKE: i64 = 13;
}

pub(crate) fn message(name: &str, payload: XpcObject) -> XpcObject {
    let mut dict = Dictionary::new();
    dict.set_string(KEY_NAME, name);
    dict.insert(KEY_PAYLOAD, payload);
    XpcObject::Dictionary(dict)
}

pub(crate) fn parse_message(object: XpcObject) -> Result<(String, XpcObject), XpcError> {
    let mut dict = object.into_dictionary().ok_or_else(|| malformed("message"))?;
    let name = match dict.remove(KEY_NAME) {
        Some(XpcObject::String(name)) => name,
        _ => return Err(malformed("message name")),
    };
    let payload = dict.remove(KEY_PAYLOAD).unwrap_or_default();
    Ok((name, payload))
}

pub(crate) fn value_reply(value: XpcObject) -> XpcObject {
    let mut dict = Dictionary::new();
    dict.insert(KEY_VALUE, value);
    XpcObject::Dictionary(dict)
}

/// Encode a handler failure for the caller.
///
/// Domain errors keep their fields only when their domain is registered in
/// this process; anything else outside the built-in taxonomy goes opaque.
pub(crate) fn error_reply(err: &XpcError) -> XpcObject {
    let mut body = Dictionary::new();
    match err {
        XpcError::Domain(domain) if domain::is_registered(domain.domain()) => {
            body.set_string(KEY_DOMAIN, domain.domain());
            body.set_int64(KEY_CODE, domain.code());
            body.set_string(KEY_DESCRIPTION, domain.description());
            body.insert(KEY_FIELDS, domain.fields().clone());
        }
        XpcError::Domain(domain) => body.set_string(KEY_DESCRIPTION, domain.description()),
        XpcError::Unknown { description } => body.set_string(KEY_DESCRIPTION, description.as_str()),
        builtin => {
            body.set_string(KEY_DOMAIN, BUILTIN_DOMAIN);
            body.set_int64(KEY_CODE, builtin_code(builtin));
            body.set_string(KEY_DESCRIPTION, builtin.to_string());
            body.insert(KEY_FIELDS, builtin_fields(builtin));
        }
    }
    let mut dict = Dictionary::new();
    dict.insert(KEY_ERROR, body);
    XpcObject::Dictionary(dict)
}

/// Turn a reply envelope back into the handler's value or error.
pub(crate) fn parse_reply(object: XpcObject) -> Result<XpcObject, XpcError> {
    let mut dict = object.into_dictionary().ok_or_else(|| malformed("reply"))?;
    if let Some(value) = dict.remove(KEY_VALUE) {
        return Ok(value);
    }
    let mut body = match dict.remove(KEY_ERROR) {
        Some(XpcObject::Dictionary(body)) => body,
        _ => return Err(malformed("reply")),
    };
    let description = match body.remove(KEY_DESCRIPTION) {
        Some(XpcObject::String(description)) => description,
        _ => String::new(),
    };
    let (Some(domain), Some(code)) = (
        body.get_string(KEY_DOMAIN).map(str::to_string),
        body.get_int64(KEY_CODE),
    ) else {
        return Err(XpcError::unknown(description));
    };
    let fields = body.remove(KEY_FIELDS).unwrap_or_default();
    if domain == BUILTIN_DOMAIN {
        Err(builtin_error(code, description, fields))
    } else {
        Err(domain::decode_domain_error(domain, code, description, fields))
    }
}

fn malformed(what: &str) -> XpcError {
    XpcError::DecodingMismatch {
        expected: format!("{what} envelope"),
        actual: "malformed object".to_string(),
    }
}

fn builtin_code(err: &XpcError) -> i64 {
    match err {
        XpcError::EncodingUnsupported(_) => code::ENCODING_UNSUPPORTED,
        XpcError::DecodingMismatch { .. } => code::DECODING_MISMATCH,
        XpcError::Bridge(_) => code::BRIDGE,
        XpcError::InvalidCodeSignatureRequirement { .. } => code::INVALID_REQUIREMENT,
        XpcError::PeerForbidden(_) => code::PEER_FORBIDDEN,
        XpcError::ConnectionInvalid(_) => code::CONNECTION_INVALID,
        XpcError::DispatchMissingHandler(_) => code::MISSING_HANDLER,
        XpcError::NotActivated => code::NOT_ACTIVATED,
        XpcError::Timeout(_) => code::TIMEOUT,
        XpcError::Transport(_) => code::TRANSPORT,
        XpcError::Frame(_) => code::FRAME,
        XpcError::Wire(_) => code::WIRE,
        XpcError::HandshakeFailed(_) => code::HANDSHAKE,
        XpcError::Domain(_) | XpcError::Unknown { .. } => 0,
    }
}

fn builtin_fields(err: &XpcError) -> Dictionary {
    let mut fields = Dictionary::new();
    match err {
        XpcError::EncodingUnsupported(message)
        | XpcError::Bridge(message)
        | XpcError::PeerForbidden(message)
        | XpcError::ConnectionInvalid(message)
        | XpcError::HandshakeFailed(message) => fields.set_string("message", message.as_str()),
        XpcError::DecodingMismatch { expected, actual } => {
            fields.set_string("expected", expected.as_str());
            fields.set_string("actual", actual.as_str());
        }
        XpcError::InvalidCodeSignatureRequirement {
            requirement,
            reason,
        } => {
            fields.set_string("requirement", requirement.as_str());
            fields.set_string("reason", reason.as_str());
        }
        XpcError::DispatchMissingHandler(name) => fields.set_string("name", name.as_str()),
        XpcError::Timeout(after) => {
            fields.set_uint64("millis", u64::try_from(after.as_millis()).unwrap_or(u64::MAX))
        }
        _ => {}
    }
    fields
}

fn builtin_error(code: i64, description: String, fields: XpcObject) -> XpcError {
    let fields = fields.into_dictionary().unwrap_or_default();
    let text = |key: &str| fields.get_string(key).map(str::to_string);
    let message = || text("message").unwrap_or_else(|| description.clone());
    match code {
        code::ENCODING_UNSUPPORTED => XpcError::EncodingUnsupported(message()),
        code::DECODING_MISMATCH => match (text("expected"), text("actual")) {
            (Some(expected), Some(actual)) => XpcError::DecodingMismatch { expected, actual },
            _ => XpcError::unknown(description),
        },
        code::BRIDGE => XpcError::Bridge(message()),
        code::INVALID_REQUIREMENT => match (text("requirement"), text("reason")) {
            (Some(requirement), Some(reason)) => XpcError::InvalidCodeSignatureRequirement {
                requirement,
                reason,
            },
            _ => XpcError::unknown(description),
        },
        code::PEER_FORBIDDEN => XpcError::PeerForbidden(message()),
        code::CONNECTION_INVALID => XpcError::ConnectionInvalid(message()),
        code::MISSING_HANDLER => match text("name") {
            Some(name) => XpcError::DispatchMissingHandler(name),
            None => XpcError::unknown(description),
        },
        code::NOT_ACTIVATED => XpcError::NotActivated,
        code::TIMEOUT => match fields.get_uint64("millis") {
            Some(millis) => XpcError::Timeout(Duration::from_millis(millis)),
            None => XpcError::unknown(description),
        },
        code::HANDSHAKE => XpcError::HandshakeFailed(message()),
        // Transport, frame and wire failures belong to the remote process.
        _ => XpcError::unknown(description),
    }
}
