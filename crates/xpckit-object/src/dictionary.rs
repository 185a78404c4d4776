use std::collections::btree_map::{self, BTreeMap};

use bytes::Bytes;

use crate::date::Date;
use crate::endpoint::Endpoint;
use crate::object::XpcObject;
use crate::surface::SharedMemory;

/// String-keyed mapping in the native object tree.
///
/// The typed getters mirror the transport's get-by-key accessors: they
/// return `None` both when the key is absent and when it holds another kind.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Dictionary {
    entries: BTreeMap<String, XpcObject>,
}

impl Dictionary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&XpcObject> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut XpcObject> {
        self.entries.get_mut(key)
    }

    /// Insert a value, returning the one it replaced.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<XpcObject>) -> Option<XpcObject> {
        self.entries.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<XpcObject> {
        self.entries.remove(key)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, XpcObject> {
        self.entries.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(XpcObject::as_bool)
    }

    pub fn set_bool(&mut self, key: impl Into<String>, value: bool) {
        self.insert(key, value);
    }

    pub fn get_int64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(XpcObject::as_i64)
    }

    pub fn set_int64(&mut self, key: impl Into<String>, value: i64) {
        self.insert(key, value);
    }

    pub fn get_uint64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(XpcObject::as_u64)
    }

    pub fn set_uint64(&mut self, key: impl Into<String>, value: u64) {
        self.insert(key, value);
    }

    pub fn get_double(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(XpcObject::as_f64)
    }

    pub fn set_double(&mut self, key: impl Into<String>, value: f64) {
        self.insert(key, value);
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(XpcObject::as_str)
    }

    pub fn set_string(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.insert(key, XpcObject::String(value.into()));
    }

    pub fn get_data(&self, key: &str) -> Option<&Bytes> {
        self.get(key).and_then(XpcObject::as_data)
    }

    pub fn set_data(&mut self, key: impl Into<String>, value: impl Into<Bytes>) {
        self.insert(key, XpcObject::Data(value.into()));
    }

    pub fn get_date(&self, key: &str) -> Option<Date> {
        self.get(key).and_then(XpcObject::as_date)
    }

    pub fn set_date(&mut self, key: impl Into<String>, value: Date) {
        self.insert(key, value);
    }

    pub fn get_array(&self, key: &str) -> Option<&[XpcObject]> {
        self.get(key).and_then(XpcObject::as_array)
    }

    pub fn get_dictionary(&self, key: &str) -> Option<&Dictionary> {
        self.get(key).and_then(XpcObject::as_dictionary)
    }

    pub fn get_endpoint(&self, key: &str) -> Option<&Endpoint> {
        self.get(key).and_then(XpcObject::as_endpoint)
    }

    pub fn set_endpoint(&mut self, key: impl Into<String>, value: Endpoint) {
        self.insert(key, value);
    }

    pub fn get_shared_memory(&self, key: &str) -> Option<&SharedMemory> {
        self.get(key).and_then(XpcObject::as_shared_memory)
    }

    pub fn set_shared_memory(&mut self, key: impl Into<String>, value: SharedMemory) {
        self.insert(key, value);
    }
}

impl FromIterator<(String, XpcObject)> for Dictionary {
    fn from_iter<I: IntoIterator<Item = (String, XpcObject)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for Dictionary {
    type Item = (String, XpcObject);
    type IntoIter = btree_map::IntoIter<String, XpcObject>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<'a> IntoIterator for &'a Dictionary {
    type Item = (&'a String, &'a XpcObject);
    type IntoIter = btree_map::Iter<'a, String, XpcObject>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}
