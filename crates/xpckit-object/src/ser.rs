//! Typed value → native object conversion.

use bytes::Bytes;
use serde::ser::{self, Impossible, Serialize};

use crate::date::Date;
use crate::dictionary::Dictionary;
use crate::endpoint::Endpoint;
use crate::error::BridgeError;
use crate::object::XpcObject;
use crate::surface::take_in_flight;
use crate::token;

type Result<T> = std::result::Result<T, BridgeError>;

/// Encode a typed value into a native object.
///
/// Structs become dictionaries keyed by field name, sequences become
/// arrays, and [`Endpoint`], [`crate::SharedMemory`] and [`Date`] fields
/// keep their native kinds.
pub fn to_object<T: ?Sized + Serialize>(value: &T) -> Result<XpcObject> {
    value.serialize(ObjectSerializer)
}

/// Serializer producing [`XpcObject`] trees.
#[derive(Debug, Clone, Copy, Default)]
pub struct ObjectSerializer;

fn unsupported(what: impl Into<String>) -> BridgeError {
    BridgeError::EncodingUnsupported(what.into())
}

impl ser::Serializer for ObjectSerializer {
    type Ok = XpcObject;
    type Error = BridgeError;

    type SerializeSeq = SerializeArray;
    type SerializeTuple = SerializeArray;
    type SerializeTupleStruct = SerializeArray;
    type SerializeTupleVariant = SerializeTupleVariant;
    type SerializeMap = SerializeDictionary;
    type SerializeStruct = SerializeDictionary;
    type SerializeStructVariant = SerializeStructVariant;

    fn serialize_bool(self, v: bool) -> Result<XpcObject> {
        Ok(XpcObject::Bool(v))
    }

    fn serialize_i8(self, v: i8) -> Result<XpcObject> {
        Ok(XpcObject::Int64(v.into()))
    }

    fn serialize_i16(self, v: i16) -> Result<XpcObject> {
        Ok(XpcObject::Int64(v.into()))
    }

    fn serialize_i32(self, v: i32) -> Result<XpcObject> {
        Ok(XpcObject::Int64(v.into()))
    }

    fn serialize_i64(self, v: i64) -> Result<XpcObject> {
        Ok(XpcObject::Int64(v))
    }

    fn serialize_i128(self, _v: i128) -> Result<XpcObject> {
        Err(unsupported("128-bit integers"))
    }

    fn serialize_u8(self, v: u8) -> Result<XpcObject> {
        Ok(XpcObject::UInt64(v.into()))
    }

    fn serialize_u16(self, v: u16) -> Result<XpcObject> {
        Ok(XpcObject::UInt64(v.into()))
    }

    fn serialize_u32(self, v: u32) -> Result<XpcObject> {
        Ok(XpcObject::UInt64(v.into()))
    }

    fn serialize_u64(self, v: u64) -> Result<XpcObject> {
        Ok(XpcObject::UInt64(v))
    }

    fn serialize_u128(self, _v: u128) -> Result<XpcObject> {
        Err(unsupported("128-bit integers"))
    }

    fn serialize_f32(self, v: f32) -> Result<XpcObject> {
        Ok(XpcObject::Double(v.into()))
    }

    fn serialize_f64(self, v: f64) -> Result<XpcObject> {
        Ok(XpcObject::Double(v))
    }

    fn serialize_char(self, v: char) -> Result<XpcObject> {
        Ok(XpcObject::String(v.to_string()))
    }

    fn serialize_str(self, v: &str) -> Result<XpcObject> {
        Ok(XpcObject::String(v.to_string()))
    }

    fn serialize_bytes(self, v: &[u8]) -> Result<XpcObject> {
        Ok(XpcObject::Data(Bytes::copy_from_slice(v)))
    }

    fn serialize_none(self) -> Result<XpcObject> {
        Ok(XpcObject::Null)
    }

    fn serialize_some<T: ?Sized + Serialize>(self, value: &T) -> Result<XpcObject> {
        value.serialize(self)
    }

    fn serialize_unit(self) -> Result<XpcObject> {
        Ok(XpcObject::Null)
    }

    fn serialize_unit_struct(self, _name: &'static str) -> Result<XpcObject> {
        Ok(XpcObject::Null)
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
    ) -> Result<XpcObject> {
        Ok(XpcObject::String(variant.to_string()))
    }

    fn serialize_newtype_struct<T: ?Sized + Serialize>(
        self,
        name: &'static str,
        value: &T,
    ) -> Result<XpcObject> {
        match name {
            token::ENDPOINT => match value.serialize(self)? {
                XpcObject::String(path) => Ok(XpcObject::Endpoint(Endpoint::from_socket_path(path))),
                other => Err(unsupported(format!("endpoint from {}", other.type_name()))),
            },
            token::SURFACE => take_in_flight()
                .map(XpcObject::SharedMemory)
                .ok_or_else(|| unsupported("shared memory surface outside its owning handle")),
            token::DATE => match value.serialize(self)? {
                XpcObject::Int64(nanos) => Ok(XpcObject::Date(Date::from_unix_nanos(nanos))),
                other => Err(unsupported(format!("date from {}", other.type_name()))),
            },
            _ => value.serialize(self),
        }
    }

    fn serialize_newtype_variant<T: ?Sized + Serialize>(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
        value: &T,
    ) -> Result<XpcObject> {
        let mut dict = Dictionary::new();
        dict.insert(variant, to_object(value)?);
        Ok(XpcObject::Dictionary(dict))
    }

    fn serialize_seq(self, len: Option<usize>) -> Result<SerializeArray> {
        Ok(SerializeArray {
            items: Vec::with_capacity(len.unwrap_or(0)),
        })
    }

    fn serialize_tuple(self, len: usize) -> Result<SerializeArray> {
        self.serialize_seq(Some(len))
    }

    fn serialize_tuple_struct(self, _name: &'static str, len: usize) -> Result<SerializeArray> {
        self.serialize_seq(Some(len))
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
        len: usize,
    ) -> Result<SerializeTupleVariant> {
        Ok(SerializeTupleVariant {
            variant,
            items: Vec::with_capacity(len),
        })
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<SerializeDictionary> {
        Ok(SerializeDictionary {
            dict: Dictionary::new(),
            next_key: None,
        })
    }

    fn serialize_struct(self, _name: &'static str, len: usize) -> Result<SerializeDictionary> {
        self.serialize_map(Some(len))
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
        _len: usize,
    ) -> Result<SerializeStructVariant> {
        Ok(SerializeStructVariant {
            variant,
            dict: Dictionary::new(),
        })
    }
}

pub struct SerializeArray {
    items: Vec<XpcObject>,
}

impl ser::SerializeSeq for SerializeArray {
    type Ok = XpcObject;
    type Error = BridgeError;

    fn serialize_element<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<()> {
        self.items.push(to_object(value)?);
        Ok(())
    }

    fn end(self) -> Result<XpcObject> {
        Ok(XpcObject::Array(self.items))
    }
}

impl ser::SerializeTuple for SerializeArray {
    type Ok = XpcObject;
    type Error = BridgeError;

    fn serialize_element<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<()> {
        ser::SerializeSeq::serialize_element(self, value)
    }

    fn end(self) -> Result<XpcObject> {
        ser::SerializeSeq::end(self)
    }
}

impl ser::SerializeTupleStruct for SerializeArray {
    type Ok = XpcObject;
    type Error = BridgeError;

    fn serialize_field<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<()> {
        ser::SerializeSeq::serialize_element(self, value)
    }

    fn end(self) -> Result<XpcObject> {
        ser::SerializeSeq::end(self)
    }
}

pub struct SerializeTupleVariant {
    variant: &'static str,
    items: Vec<XpcObject>,
}

impl ser::SerializeTupleVariant for SerializeTupleVariant {
    type Ok = XpcObject;
    type Error = BridgeError;

    fn serialize_field<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<()> {
        self.items.push(to_object(value)?);
        Ok(())
    }

    fn end(self) -> Result<XpcObject> {
        let mut dict = Dictionary::new();
        dict.insert(self.variant, XpcObject::Array(self.items));
        Ok(XpcObject::Dictionary(dict))
    }
}

pub struct SerializeDictionary {
    dict: Dictionary,
    next_key: Option<String>,
}

impl ser::SerializeMap for SerializeDictionary {
    type Ok = XpcObject;
    type Error = BridgeError;

    fn serialize_key<T: ?Sized + Serialize>(&mut self, key: &T) -> Result<()> {
        self.next_key = Some(key.serialize(KeySerializer)?);
        Ok(())
    }

    fn serialize_value<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<()> {
        let key = self
            .next_key
            .take()
            .ok_or_else(|| BridgeError::Custom("map value without a key".to_string()))?;
        self.dict.insert(key, to_object(value)?);
        Ok(())
    }

    fn end(self) -> Result<XpcObject> {
        Ok(XpcObject::Dictionary(self.dict))
    }
}

impl ser::SerializeStruct for SerializeDictionary {
    type Ok = XpcObject;
    type Error = BridgeError;

    fn serialize_field<T: ?Sized + Serialize>(&mut self, key: &'static str, value: &T) -> Result<()> {
        self.dict.insert(key, to_object(value)?);
        Ok(())
    }

    fn end(self) -> Result<XpcObject> {
        Ok(XpcObject::Dictionary(self.dict))
    }
}

pub struct SerializeStructVariant {
    variant: &'static str,
    dict: Dictionary,
}

impl ser::SerializeStructVariant for SerializeStructVariant {
    type Ok = XpcObject;
    type Error = BridgeError;

    fn serialize_field<T: ?Sized + Serialize>(&mut self, key: &'static str, value: &T) -> Result<()> {
        self.dict.insert(key, to_object(value)?);
        Ok(())
    }

    fn end(self) -> Result<XpcObject> {
        let mut outer = Dictionary::new();
        outer.insert(self.variant, XpcObject::Dictionary(self.dict));
        Ok(XpcObject::Dictionary(outer))
    }
}

/// Dictionary keys must be strings (or chars, or unit variants).
struct KeySerializer;

fn non_string_key() -> BridgeError {
    unsupported("dictionary keys must be strings")
}

impl ser::Serializer for KeySerializer {
    type Ok = String;
    type Error = BridgeError;

    type SerializeSeq = Impossible<String, BridgeError>;
    type SerializeTuple = Impossible<String, BridgeError>;
    type SerializeTupleStruct = Impossible<String, BridgeError>;
    type SerializeTupleVariant = Impossible<String, BridgeError>;
    type SerializeMap = Impossible<String, BridgeError>;
    type SerializeStruct = Impossible<String, BridgeError>;
    type SerializeStructVariant = Impossible<String, BridgeError>;

    fn serialize_str(self, v: &str) -> Result<String> {
        Ok(v.to_string())
    }

    fn serialize_char(self, v: char) -> Result<String> {
        Ok(v.to_string())
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
    ) -> Result<String> {
        Ok(variant.to_string())
    }

    fn serialize_newtype_struct<T: ?Sized + Serialize>(
        self,
        _name: &'static str,
        value: &T,
    ) -> Result<String> {
        value.serialize(self)
    }

    fn serialize_bool(self, _v: bool) -> Result<String> {
        Err(non_string_key())
    }

    fn serialize_i8(self, _v: i8) -> Result<String> {
        Err(non_string_key())
    }

    fn serialize_i16(self, _v: i16) -> Result<String> {
        Err(non_string_key())
    }

    fn serialize_i32(self, _v: i32) -> Result<String> {
        Err(non_string_key())
    }

    fn serialize_i64(self, _v: i64) -> Result<String> {
        Err(non_string_key())
    }

    fn serialize_u8(self, _v: u8) -> Result<String> {
        Err(non_string_key())
    }

    fn serialize_u16(self, _v: u16) -> Result<String> {
        Err(non_string_key())
    }

    fn serialize_u32(self, _v: u32) -> Result<String> {
        Err(non_string_key())
    }

    fn serialize_u64(self, _v: u64) -> Result<String> {
        Err(non_string_key())
    }

    fn serialize_f32(self, _v: f32) -> Result<String> {
        Err(non_string_key())
    }

    fn serialize_f64(self, _v: f64) -> Result<String> {
        Err(non_string_key())
    }

    fn serialize_bytes(self, _v: &[u8]) -> Result<String> {
        Err(non_string_key())
    }

    fn serialize_none(self) -> Result<String> {
        Err(non_string_key())
    }

    fn serialize_some<T: ?Sized + Serialize>(self, _value: &T) -> Result<String> {
        Err(non_string_key())
    }

    fn serialize_unit(self) -> Result<String> {
        Err(non_string_key())
    }

    fn serialize_unit_struct(self, _name: &'static str) -> Result<String> {
        Err(non_string_key())
    }

    fn serialize_newtype_variant<T: ?Sized + Serialize>(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _value: &T,
    ) -> Result<String> {
        Err(non_string_key())
    }

    fn serialize_seq(self, _len: Option<usize>) -> Result<Self::SerializeSeq> {
        Err(non_string_key())
    }

    fn serialize_tuple(self, _len: usize) -> Result<Self::SerializeTuple> {
        Err(non_string_key())
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleStruct> {
        Err(non_string_key())
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleVariant> {
        Err(non_string_key())
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<Self::SerializeMap> {
        Err(non_string_key())
    }

    fn serialize_struct(self, _name: &'static str, _len: usize) -> Result<Self::SerializeStruct> {
        Err(non_string_key())
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStructVariant> {
        Err(non_string_key())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashMap};

    use serde::Serialize;

    use super::*;

    #[derive(Serialize)]
    struct Request {
        text: String,
        repeat: u8,
        offset: i32,
        ratio: f32,
        tag: Option<String>,
        payload: Bytes,
    }

    #[derive(Serialize)]
    enum Shape {
        Empty,
        Circle(f64),
        Rect { w: u32, h: u32 },
        Pair(i8, i8),
    }

    #[test]
    fn structs_become_dictionaries_keyed_by_field() {
        let obj = to_object(&Request {
            text: "hello".into(),
            repeat: 3,
            offset: -2,
            ratio: 0.5,
            tag: None,
            payload: Bytes::from_static(b"\x00\x01"),
        })
        .unwrap();

        let dict = obj.as_dictionary().unwrap();
        assert_eq!(dict.get_string("text"), Some("hello"));
        assert_eq!(dict.get_uint64("repeat"), Some(3));
        assert_eq!(dict.get_int64("offset"), Some(-2));
        assert_eq!(dict.get_double("ratio"), Some(0.5));
        assert!(dict.get("tag").unwrap().is_null());
        assert_eq!(dict.get_data("payload").unwrap().as_ref(), b"\x00\x01");
    }

    #[test]
    fn enum_variants_use_externally_tagged_dictionaries() {
        assert_eq!(to_object(&Shape::Empty).unwrap(), XpcObject::from("Empty"));

        let circle = to_object(&Shape::Circle(2.0)).unwrap();
        assert_eq!(
            circle.as_dictionary().unwrap().get_double("Circle"),
            Some(2.0)
        );

        let rect = to_object(&Shape::Rect { w: 4, h: 5 }).unwrap();
        let inner = rect.as_dictionary().unwrap().get_dictionary("Rect").unwrap();
        assert_eq!(inner.get_uint64("h"), Some(5));

        let pair = to_object(&Shape::Pair(1, -1)).unwrap();
        assert_eq!(
            pair.as_dictionary().unwrap().get_array("Pair"),
            Some(&[XpcObject::Int64(1), XpcObject::Int64(-1)][..])
        );
    }

    #[test]
    fn string_keyed_maps_encode_and_others_are_unsupported() {
        let mut ok = BTreeMap::new();
        ok.insert("a".to_string(), 1u32);
        assert!(to_object(&ok).is_ok());

        let mut bad = HashMap::new();
        bad.insert(1u32, "x");
        assert!(matches!(
            to_object(&bad),
            Err(BridgeError::EncodingUnsupported(_))
        ));
    }

    #[test]
    fn wide_integers_are_unsupported() {
        assert!(matches!(
            to_object(&1u128),
            Err(BridgeError::EncodingUnsupported(_))
        ));
    }

    #[test]
    fn capability_fields_keep_native_kinds() {
        #[derive(Serialize)]
        struct Handoff {
            endpoint: Endpoint,
            when: Date,
        }

        let obj = to_object(&Handoff {
            endpoint: Endpoint::from_socket_path("/tmp/ns/anonymous/1-1.sock"),
            when: Date::from_unix_nanos(42),
        })
        .unwrap();
        let dict = obj.as_dictionary().unwrap();
        assert_eq!(
            dict.get_endpoint("endpoint").unwrap().socket_path(),
            std::path::Path::new("/tmp/ns/anonymous/1-1.sock")
        );
        assert_eq!(dict.get_date("when"), Some(Date::from_unix_nanos(42)));
    }
}
