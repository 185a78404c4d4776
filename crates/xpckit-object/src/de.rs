//! Native object → typed value conversion.

use std::collections::btree_map;

use serde::de::{
    self, DeserializeOwned, DeserializeSeed, EnumAccess, IntoDeserializer, MapAccess, SeqAccess,
    Unexpected, VariantAccess, Visitor,
};
use serde::{forward_to_deserialize_any, Deserializer};

use crate::error::BridgeError;
use crate::object::XpcObject;
use crate::surface::{park_in_flight, take_in_flight};
use crate::token;

type Result<T> = std::result::Result<T, BridgeError>;

/// Decode a native object into a typed value.
///
/// Missing keys and kind mismatches surface as
/// [`BridgeError::DecodingMismatch`].
pub fn from_object<T: DeserializeOwned>(object: XpcObject) -> Result<T> {
    T::deserialize(ObjectDeserializer::new(object))
}

/// Deserializer reading from an owned [`XpcObject`] tree.
#[derive(Debug)]
pub struct ObjectDeserializer {
    object: XpcObject,
}

impl ObjectDeserializer {
    pub fn new(object: XpcObject) -> Self {
        Self { object }
    }
}

fn mismatch(expected: &str, object: &XpcObject) -> BridgeError {
    BridgeError::DecodingMismatch {
        expected: expected.to_string(),
        actual: object.type_name().to_string(),
    }
}

impl<'de> Deserializer<'de> for ObjectDeserializer {
    type Error = BridgeError;

    fn deserialize_any<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        match self.object {
            XpcObject::Null => visitor.visit_unit(),
            XpcObject::Bool(b) => visitor.visit_bool(b),
            XpcObject::Int64(n) => visitor.visit_i64(n),
            XpcObject::UInt64(n) => visitor.visit_u64(n),
            XpcObject::Double(n) => visitor.visit_f64(n),
            XpcObject::String(s) => visitor.visit_string(s),
            XpcObject::Data(bytes) => visitor.visit_byte_buf(bytes.to_vec()),
            XpcObject::Array(items) => visit_array(items, visitor),
            XpcObject::Dictionary(dict) => visitor.visit_map(DictionaryAccess {
                entries: dict.into_iter(),
                value: None,
            }),
            XpcObject::Date(date) => {
                visitor.visit_newtype_struct(ObjectDeserializer::new(date.unix_nanos().into()))
            }
            XpcObject::Endpoint(endpoint) => visitor.visit_newtype_struct(ObjectDeserializer::new(
                path_object(endpoint.socket_path()),
            )),
            XpcObject::SharedMemory(surface) => {
                let path = path_object(surface.backing_path());
                park_in_flight(surface);
                let result = visitor.visit_newtype_struct(ObjectDeserializer::new(path));
                take_in_flight();
                result
            }
        }
    }

    fn deserialize_option<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        match self.object {
            XpcObject::Null => visitor.visit_none(),
            _ => visitor.visit_some(self),
        }
    }

    fn deserialize_unit<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        match self.object {
            XpcObject::Null => visitor.visit_unit(),
            other => Err(mismatch("null", &other)),
        }
    }

    fn deserialize_unit_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value> {
        self.deserialize_unit(visitor)
    }

    fn deserialize_newtype_struct<V: Visitor<'de>>(
        self,
        name: &'static str,
        visitor: V,
    ) -> Result<V::Value> {
        match (name, self.object) {
            (token::ENDPOINT, XpcObject::Endpoint(endpoint)) => visitor.visit_newtype_struct(
                ObjectDeserializer::new(path_object(endpoint.socket_path())),
            ),
            (token::ENDPOINT, other) => Err(mismatch("endpoint", &other)),
            (token::SURFACE, XpcObject::SharedMemory(surface)) => {
                let path = path_object(surface.backing_path());
                park_in_flight(surface);
                let result = visitor.visit_newtype_struct(ObjectDeserializer::new(path));
                take_in_flight();
                result
            }
            (token::SURFACE, other) => Err(mismatch("shared memory surface", &other)),
            (token::DATE, XpcObject::Date(date)) => {
                visitor.visit_newtype_struct(ObjectDeserializer::new(date.unix_nanos().into()))
            }
            (token::DATE, other) => Err(mismatch("date", &other)),
            (_, object) => visitor.visit_newtype_struct(ObjectDeserializer::new(object)),
        }
    }

    fn deserialize_seq<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        match self.object {
            XpcObject::Data(bytes) => {
                let mut seq = de::value::SeqDeserializer::<_, BridgeError>::new(bytes.into_iter());
                let value = visitor.visit_seq(&mut seq)?;
                seq.end()?;
                Ok(value)
            }
            other => ObjectDeserializer::new(other).deserialize_any(visitor),
        }
    }

    fn deserialize_enum<V: Visitor<'de>>(
        self,
        _name: &'static str,
        _variants: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value> {
        match self.object {
            XpcObject::String(variant) => visitor.visit_enum(VariantDeserializer {
                variant,
                value: None,
            }),
            XpcObject::Dictionary(dict) if dict.len() == 1 => {
                let mut entries = dict.into_iter();
                match entries.next() {
                    Some((variant, value)) => visitor.visit_enum(VariantDeserializer {
                        variant,
                        value: Some(value),
                    }),
                    None => Err(BridgeError::Custom("empty enum dictionary".to_string())),
                }
            }
            other => Err(mismatch(
                "a variant name or a single-entry dictionary",
                &other,
            )),
        }
    }

    fn deserialize_ignored_any<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        visitor.visit_unit()
    }

    forward_to_deserialize_any! {
        bool i8 i16 i32 i64 i128 u8 u16 u32 u64 u128 f32 f64 char str string
        bytes byte_buf tuple tuple_struct map struct identifier
    }
}

fn path_object(path: &std::path::Path) -> XpcObject {
    XpcObject::String(path.to_string_lossy().into_owned())
}

fn visit_array<'de, V: Visitor<'de>>(items: Vec<XpcObject>, visitor: V) -> Result<V::Value> {
    let total = items.len();
    let mut access = ArrayAccess {
        items: items.into_iter(),
    };
    let value = visitor.visit_seq(&mut access)?;
    let left = access.items.len();
    if left == 0 {
        Ok(value)
    } else {
        Err(de::Error::invalid_length(
            total,
            &format!("{} elements", total - left).as_str(),
        ))
    }
}

struct ArrayAccess {
    items: std::vec::IntoIter<XpcObject>,
}

impl<'de> SeqAccess<'de> for ArrayAccess {
    type Error = BridgeError;

    fn next_element_seed<T: DeserializeSeed<'de>>(&mut self, seed: T) -> Result<Option<T::Value>> {
        self.items
            .next()
            .map(|item| seed.deserialize(ObjectDeserializer::new(item)))
            .transpose()
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.items.len())
    }
}

struct DictionaryAccess {
    entries: btree_map::IntoIter<String, XpcObject>,
    value: Option<XpcObject>,
}

impl<'de> MapAccess<'de> for DictionaryAccess {
    type Error = BridgeError;

    fn next_key_seed<K: DeserializeSeed<'de>>(&mut self, seed: K) -> Result<Option<K::Value>> {
        match self.entries.next() {
            Some((key, value)) => {
                self.value = Some(value);
                let key: de::value::StringDeserializer<BridgeError> = key.into_deserializer();
                seed.deserialize(key).map(Some)
            }
            None => Ok(None),
        }
    }

    fn next_value_seed<V: DeserializeSeed<'de>>(&mut self, seed: V) -> Result<V::Value> {
        match self.value.take() {
            Some(value) => seed.deserialize(ObjectDeserializer::new(value)),
            None => Err(BridgeError::Custom("dictionary value requested before key".to_string())),
        }
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.entries.len())
    }
}

struct VariantDeserializer {
    variant: String,
    value: Option<XpcObject>,
}

impl<'de> EnumAccess<'de> for VariantDeserializer {
    type Error = BridgeError;
    type Variant = VariantValue;

    fn variant_seed<V: DeserializeSeed<'de>>(self, seed: V) -> Result<(V::Value, VariantValue)> {
        let name: de::value::StringDeserializer<BridgeError> = self.variant.into_deserializer();
        let variant = seed.deserialize(name)?;
        Ok((variant, VariantValue { value: self.value }))
    }
}

struct VariantValue {
    value: Option<XpcObject>,
}

impl<'de> VariantAccess<'de> for VariantValue {
    type Error = BridgeError;

    fn unit_variant(self) -> Result<()> {
        match self.value {
            None | Some(XpcObject::Null) => Ok(()),
            Some(other) => Err(mismatch("unit variant", &other)),
        }
    }

    fn newtype_variant_seed<T: DeserializeSeed<'de>>(self, seed: T) -> Result<T::Value> {
        match self.value {
            Some(value) => seed.deserialize(ObjectDeserializer::new(value)),
            None => Err(de::Error::invalid_type(
                Unexpected::UnitVariant,
                &"newtype variant",
            )),
        }
    }

    fn tuple_variant<V: Visitor<'de>>(self, _len: usize, visitor: V) -> Result<V::Value> {
        match self.value {
            Some(XpcObject::Array(items)) => visit_array(items, visitor),
            Some(other) => Err(mismatch("tuple variant", &other)),
            None => Err(de::Error::invalid_type(
                Unexpected::UnitVariant,
                &"tuple variant",
            )),
        }
    }

    fn struct_variant<V: Visitor<'de>>(
        self,
        _fields: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value> {
        match self.value {
            Some(XpcObject::Dictionary(dict)) => visitor.visit_map(DictionaryAccess {
                entries: dict.into_iter(),
                value: None,
            }),
            Some(other) => Err(mismatch("struct variant", &other)),
            None => Err(de::Error::invalid_type(
                Unexpected::UnitVariant,
                &"struct variant",
            )),
        }
    }
}
