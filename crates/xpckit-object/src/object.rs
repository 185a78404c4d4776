use std::fmt;

use bytes::Bytes;
use serde::de::{MapAccess, SeqAccess, Unexpected, Visitor};
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::date::Date;
use crate::dictionary::Dictionary;
use crate::endpoint::Endpoint;
use crate::surface::{take_in_flight, SharedMemory};

/// A value in the native object tree.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum XpcObject {
    #[default]
    Null,
    Bool(bool),
    Int64(i64),
    UInt64(u64),
    Double(f64),
    String(String),
    Data(Bytes),
    Date(Date),
    Array(Vec<XpcObject>),
    Dictionary(Dictionary),
    Endpoint(Endpoint),
    SharedMemory(SharedMemory),
}

impl XpcObject {
    /// Short name of this object's kind, used in diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            XpcObject::Null => "null",
            XpcObject::Bool(_) => "bool",
            XpcObject::Int64(_) => "int64",
            XpcObject::UInt64(_) => "uint64",
            XpcObject::Double(_) => "double",
            XpcObject::String(_) => "string",
            XpcObject::Data(_) => "data",
            XpcObject::Date(_) => "date",
            XpcObject::Array(_) => "array",
            XpcObject::Dictionary(_) => "dictionary",
            XpcObject::Endpoint(_) => "endpoint",
            XpcObject::SharedMemory(_) => "shared memory surface",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, XpcObject::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            XpcObject::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            XpcObject::Int64(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            XpcObject::UInt64(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            XpcObject::Double(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            XpcObject::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_data(&self) -> Option<&Bytes> {
        match self {
            XpcObject::Data(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[XpcObject]> {
        match self {
            XpcObject::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_dictionary(&self) -> Option<&Dictionary> {
        match self {
            XpcObject::Dictionary(dict) => Some(dict),
            _ => None,
        }
    }

    pub fn as_dictionary_mut(&mut self) -> Option<&mut Dictionary> {
        match self {
            XpcObject::Dictionary(dict) => Some(dict),
            _ => None,
        }
    }

    /// Take the dictionary out of this object, if it is one.
    pub fn into_dictionary(self) -> Option<Dictionary> {
        match self {
            XpcObject::Dictionary(dict) => Some(dict),
            _ => None,
        }
    }

    pub fn as_endpoint(&self) -> Option<&Endpoint> {
        match self {
            XpcObject::Endpoint(endpoint) => Some(endpoint),
            _ => None,
        }
    }

    pub fn as_shared_memory(&self) -> Option<&SharedMemory> {
        match self {
            XpcObject::SharedMemory(surface) => Some(surface),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<Date> {
        match self {
            XpcObject::Date(date) => Some(*date),
            _ => None,
        }
    }

    pub(crate) fn unexpected(&self) -> Unexpected<'_> {
        match self {
            XpcObject::Null => Unexpected::Unit,
            XpcObject::Bool(b) => Unexpected::Bool(*b),
            XpcObject::Int64(n) => Unexpected::Signed(*n),
            XpcObject::UInt64(n) => Unexpected::Unsigned(*n),
            XpcObject::Double(n) => Unexpected::Float(*n),
            XpcObject::String(s) => Unexpected::Str(s),
            XpcObject::Data(b) => Unexpected::Bytes(b),
            XpcObject::Array(_) => Unexpected::Seq,
            XpcObject::Dictionary(_) => Unexpected::Map,
            other => Unexpected::Other(other.type_name()),
        }
    }
}

macro_rules! impl_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for XpcObject {
                fn from(value: $ty) -> Self {
                    XpcObject::$variant(value.into())
                }
            }
        )*
    };
}

impl_from! {
    bool => Bool,
    i32 => Int64,
    i64 => Int64,
    u32 => UInt64,
    u64 => UInt64,
    f64 => Double,
    String => String,
    &str => String,
    Bytes => Data,
    Vec<u8> => Data,
    Date => Date,
    Vec<XpcObject> => Array,
    Dictionary => Dictionary,
    Endpoint => Endpoint,
    SharedMemory => SharedMemory,
}

impl<T: Into<XpcObject>> From<Option<T>> for XpcObject {
    fn from(value: Option<T>) -> Self {
        value.map_or(XpcObject::Null, Into::into)
    }
}

impl Serialize for XpcObject {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            XpcObject::Null => serializer.serialize_unit(),
            XpcObject::Bool(b) => serializer.serialize_bool(*b),
            XpcObject::Int64(n) => serializer.serialize_i64(*n),
            XpcObject::UInt64(n) => serializer.serialize_u64(*n),
            XpcObject::Double(n) => serializer.serialize_f64(*n),
            XpcObject::String(s) => serializer.serialize_str(s),
            XpcObject::Data(b) => serializer.serialize_bytes(b),
            XpcObject::Date(date) => date.serialize(serializer),
            XpcObject::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            XpcObject::Dictionary(dict) => {
                let mut map = serializer.serialize_map(Some(dict.len()))?;
                for (key, value) in dict.iter() {
                    map.serialize_entry(key, value)?;
                }
                map.end()
            }
            XpcObject::Endpoint(endpoint) => endpoint.serialize(serializer),
            XpcObject::SharedMemory(surface) => surface.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for XpcObject {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(ObjectVisitor)
    }
}

struct ObjectVisitor;

impl<'de> Visitor<'de> for ObjectVisitor {
    type Value = XpcObject;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("any native object value")
    }

    fn visit_bool<E>(self, v: bool) -> Result<XpcObject, E> {
        Ok(XpcObject::Bool(v))
    }

    fn visit_i64<E>(self, v: i64) -> Result<XpcObject, E> {
        Ok(XpcObject::Int64(v))
    }

    fn visit_u64<E>(self, v: u64) -> Result<XpcObject, E> {
        Ok(XpcObject::UInt64(v))
    }

    fn visit_f64<E>(self, v: f64) -> Result<XpcObject, E> {
        Ok(XpcObject::Double(v))
    }

    fn visit_str<E>(self, v: &str) -> Result<XpcObject, E> {
        Ok(XpcObject::String(v.to_string()))
    }

    fn visit_string<E>(self, v: String) -> Result<XpcObject, E> {
        Ok(XpcObject::String(v))
    }

    fn visit_bytes<E>(self, v: &[u8]) -> Result<XpcObject, E> {
        Ok(XpcObject::Data(Bytes::copy_from_slice(v)))
    }

    fn visit_byte_buf<E>(self, v: Vec<u8>) -> Result<XpcObject, E> {
        Ok(XpcObject::Data(Bytes::from(v)))
    }

    fn visit_none<E>(self) -> Result<XpcObject, E> {
        Ok(XpcObject::Null)
    }

    fn visit_unit<E>(self) -> Result<XpcObject, E> {
        Ok(XpcObject::Null)
    }

    fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> Result<XpcObject, D::Error> {
        deserializer.deserialize_any(self)
    }

    // Only the object bridge yields newtypes from `deserialize_any`: a
    // parked surface, an endpoint path, or date nanoseconds.
    fn visit_newtype_struct<D: Deserializer<'de>>(self, d: D) -> Result<XpcObject, D::Error> {
        let inner = XpcObject::deserialize(d)?;
        if let Some(surface) = take_in_flight() {
            return Ok(XpcObject::SharedMemory(surface));
        }
        Ok(match inner {
            XpcObject::String(path) => XpcObject::Endpoint(Endpoint::from_socket_path(path)),
            XpcObject::Int64(nanos) => XpcObject::Date(Date::from_unix_nanos(nanos)),
            other => other,
        })
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<XpcObject, A::Error> {
        let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0).min(4096));
        while let Some(item) = seq.next_element()? {
            items.push(item);
        }
        Ok(XpcObject::Array(items))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<XpcObject, A::Error> {
        let mut dict = Dictionary::new();
        while let Some((key, value)) = map.next_entry::<String, XpcObject>()? {
            dict.insert(key, value);
        }
        Ok(XpcObject::Dictionary(dict))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_values_map_onto_native_kinds() {
        let obj: XpcObject =
            serde_json::from_str(r#"{"text":"hi","n":-3,"u":7,"f":1.5,"list":[true,null]}"#)
                .unwrap();
        let dict = obj.as_dictionary().unwrap();
        assert_eq!(dict.get_string("text"), Some("hi"));
        assert_eq!(dict.get_int64("n"), Some(-3));
        assert_eq!(dict.get_uint64("u"), Some(7));
        assert_eq!(dict.get_double("f"), Some(1.5));
        assert_eq!(
            dict.get("list").and_then(XpcObject::as_array).map(<[_]>::len),
            Some(2)
        );
    }

    #[test]
    fn native_objects_print_as_json() {
        let mut dict = Dictionary::new();
        dict.set_string("name", "caps");
        dict.insert("blob", XpcObject::from(vec![1u8, 2]));
        let json = serde_json::to_value(XpcObject::Dictionary(dict)).unwrap();
        assert_eq!(json["name"], "caps");
        assert_eq!(json["blob"], serde_json::json!([1, 2]));
    }

    #[test]
    fn option_converts_to_null() {
        assert!(XpcObject::from(Option::<i64>::None).is_null());
        assert_eq!(XpcObject::from(Some(3i64)), XpcObject::Int64(3));
    }
}
