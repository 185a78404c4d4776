//! Binary form of an object tree, carried in frame payloads.
//!
//! Every value starts with a one-byte tag. Integers are little-endian,
//! strings and data carry a `u32` length prefix, arrays and dictionaries a
//! `u32` entry count. Capabilities travel as the path that lets the peer
//! reach them:
//!
//! ```text
//! 0x00 null          0x06 data     u32 len, bytes
//! 0x01 bool    u8    0x07 date     i64 ns since epoch
//! 0x02 int64   i64   0x08 array    u32 count, values
//! 0x03 uint64  u64   0x09 dict     u32 count, (string key, value)*
//! 0x04 double  f64   0x0a endpoint string socket path
//! 0x05 string  u32 len, utf-8      0x0b surface  string path, u64 len
//! ```
//!
//! Encoding a [`SharedMemory`] claims it for transfer; decoding one maps it.
//! [`encode_claimed`] returns the claims so a sender can undo them when the
//! bytes never leave the process.

use bytes::{BufMut, Bytes, BytesMut};

use crate::date::Date;
use crate::dictionary::Dictionary;
use crate::endpoint::Endpoint;
use crate::error::WireError;
use crate::object::XpcObject;
use crate::surface::{SharedMemory, TransferClaims};

/// Deepest nesting accepted by [`decode`].
pub const MAX_DEPTH: usize = 64;

const TAG_NULL: u8 = 0x00;
const TAG_BOOL: u8 = 0x01;
const TAG_INT64: u8 = 0x02;
const TAG_UINT64: u8 = 0x03;
const TAG_DOUBLE: u8 = 0x04;
const TAG_STRING: u8 = 0x05;
const TAG_DATA: u8 = 0x06;
const TAG_DATE: u8 = 0x07;
const TAG_ARRAY: u8 = 0x08;
const TAG_DICTIONARY: u8 = 0x09;
const TAG_ENDPOINT: u8 = 0x0a;
const TAG_SURFACE: u8 = 0x0b;

/// Encode an object tree, committing any surface transfer immediately.
pub fn encode(object: &XpcObject) -> Result<Bytes, WireError> {
    let (bytes, claims) = encode_claimed(object)?;
    claims.commit();
    Ok(bytes)
}

/// Encode an object tree, returning the surfaces it claimed.
///
/// A failed encode gives back every surface it had claimed so far.
pub fn encode_claimed(object: &XpcObject) -> Result<(Bytes, TransferClaims), WireError> {
    let mut buf = BytesMut::new();
    let mut claims = TransferClaims::default();
    encode_into(object, &mut buf, &mut claims)?;
    Ok((buf.freeze(), claims))
}

fn encode_into(
    object: &XpcObject,
    buf: &mut BytesMut,
    claims: &mut TransferClaims,
) -> Result<(), WireError> {
    match object {
        XpcObject::Null => buf.put_u8(TAG_NULL),
        XpcObject::Bool(b) => {
            buf.put_u8(TAG_BOOL);
            buf.put_u8(u8::from(*b));
        }
        XpcObject::Int64(n) => {
            buf.put_u8(TAG_INT64);
            buf.put_i64_le(*n);
        }
        XpcObject::UInt64(n) => {
            buf.put_u8(TAG_UINT64);
            buf.put_u64_le(*n);
        }
        XpcObject::Double(n) => {
            buf.put_u8(TAG_DOUBLE);
            buf.put_f64_le(*n);
        }
        XpcObject::String(s) => {
            buf.put_u8(TAG_STRING);
            put_str(s, buf)?;
        }
        XpcObject::Data(bytes) => {
            buf.put_u8(TAG_DATA);
            put_len(bytes.len(), buf)?;
            buf.put_slice(bytes);
        }
        XpcObject::Date(date) => {
            buf.put_u8(TAG_DATE);
            buf.put_i64_le(date.unix_nanos());
        }
        XpcObject::Array(items) => {
            buf.put_u8(TAG_ARRAY);
            put_len(items.len(), buf)?;
            for item in items {
                encode_into(item, buf, claims)?;
            }
        }
        XpcObject::Dictionary(dict) => {
            buf.put_u8(TAG_DICTIONARY);
            put_len(dict.len(), buf)?;
            for (key, value) in dict {
                put_str(key, buf)?;
                encode_into(value, buf, claims)?;
            }
        }
        XpcObject::Endpoint(endpoint) => {
            buf.put_u8(TAG_ENDPOINT);
            put_str(&endpoint.socket_path().to_string_lossy(), buf)?;
        }
        XpcObject::SharedMemory(surface) => {
            let (path, len) = surface.take_for_transfer()?;
            claims.push(surface.clone());
            buf.put_u8(TAG_SURFACE);
            put_str(&path.to_string_lossy(), buf)?;
            buf.put_u64_le(len as u64);
        }
    }
    Ok(())
}

/// Decode a complete object tree; trailing bytes are an error.
pub fn decode(bytes: &[u8]) -> Result<XpcObject, WireError> {
    let mut reader = Reader { bytes, pos: 0 };
    let object = reader.value(0)?;
    let trailing = reader.remaining();
    if trailing != 0 {
        return Err(WireError::TrailingBytes(trailing));
    }
    Ok(object)
}

fn put_len(len: usize, buf: &mut BytesMut) -> Result<(), WireError> {
    let len = u32::try_from(len).map_err(|_| WireError::TooLarge(len))?;
    buf.put_u32_le(len);
    Ok(())
}

fn put_str(s: &str, buf: &mut BytesMut) -> Result<(), WireError> {
    put_len(s.len(), buf)?;
    buf.put_slice(s.as_bytes());
    Ok(())
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.remaining() < n {
            return Err(WireError::Truncated {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.array::<1>()?[0])
    }

    fn u32(&mut self) -> Result<usize, WireError> {
        Ok(u32::from_le_bytes(self.array()?) as usize)
    }

    fn u64(&mut self) -> Result<u64, WireError> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    fn i64(&mut self) -> Result<i64, WireError> {
        Ok(i64::from_le_bytes(self.array()?))
    }

    // Each entry needs at least one byte, so a count larger than what is
    // left cannot be honest.
    fn count(&mut self) -> Result<usize, WireError> {
        let count = self.u32()?;
        if count > self.remaining() {
            return Err(WireError::Truncated {
                needed: count,
                remaining: self.remaining(),
            });
        }
        Ok(count)
    }

    fn string(&mut self) -> Result<String, WireError> {
        let len = self.u32()?;
        let raw = self.take(len)?;
        std::str::from_utf8(raw)
            .map(str::to_string)
            .map_err(|_| WireError::InvalidUtf8)
    }

    fn value(&mut self, depth: usize) -> Result<XpcObject, WireError> {
        if depth >= MAX_DEPTH {
            return Err(WireError::DepthExceeded(MAX_DEPTH));
        }
        let object = match self.u8()? {
            TAG_NULL => XpcObject::Null,
            TAG_BOOL => XpcObject::Bool(self.u8()? != 0),
            TAG_INT64 => XpcObject::Int64(self.i64()?),
            TAG_UINT64 => XpcObject::UInt64(self.u64()?),
            TAG_DOUBLE => XpcObject::Double(f64::from_bits(self.u64()?)),
            TAG_STRING => XpcObject::String(self.string()?),
            TAG_DATA => {
                let len = self.u32()?;
                XpcObject::Data(Bytes::copy_from_slice(self.take(len)?))
            }
            TAG_DATE => XpcObject::Date(Date::from_unix_nanos(self.i64()?)),
            TAG_ARRAY => {
                let count = self.count()?;
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(self.value(depth + 1)?);
                }
                XpcObject::Array(items)
            }
            TAG_DICTIONARY => {
                let count = self.count()?;
                let mut dict = Dictionary::new();
                for _ in 0..count {
                    let key = self.string()?;
                    let value = self.value(depth + 1)?;
                    dict.insert(key, value);
                }
                XpcObject::Dictionary(dict)
            }
            TAG_ENDPOINT => XpcObject::Endpoint(Endpoint::from_socket_path(self.string()?)),
            TAG_SURFACE => {
                let path = self.string()?;
                let len = self.u64()?;
                let len = usize::try_from(len).map_err(|_| WireError::TooLarge(usize::MAX))?;
                XpcObject::SharedMemory(SharedMemory::receive(path.as_ref(), len)?)
            }
            tag => return Err(WireError::UnknownTag(tag)),
        };
        Ok(object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SurfaceError;

    fn sample() -> XpcObject {
        let mut inner = Dictionary::new();
        inner.set_double("ratio", -0.75);
        inner.set_date("at", Date::from_unix_nanos(1_234));
        inner.set_endpoint("ep", Endpoint::from_socket_path("/tmp/ns/anonymous/9-1.sock"));

        let mut root = Dictionary::new();
        root.set_string("name", "héllo");
        root.set_int64("neg", i64::MIN);
        root.set_uint64("big", u64::MAX);
        root.set_data("blob", vec![0u8, 255, 7]);
        root.insert(
            "list",
            vec![XpcObject::Null, XpcObject::Bool(true), XpcObject::Dictionary(inner)],
        );
        XpcObject::Dictionary(root)
    }

    #[test]
    fn tree_survives_encoding() {
        let object = sample();
        let bytes = encode(&object).unwrap();
        assert_eq!(decode(&bytes).unwrap(), object);
    }

    #[test]
    fn truncation_is_reported_at_every_cut() {
        let bytes = encode(&sample()).unwrap();
        for cut in 0..bytes.len() {
            assert!(decode(&bytes[..cut]).is_err(), "cut at {cut} decoded");
        }
    }

    #[test]
    fn trailing_bytes_and_unknown_tags_are_rejected() {
        let mut bytes = encode(&XpcObject::Null).unwrap().to_vec();
        bytes.push(0);
        assert!(matches!(decode(&bytes), Err(WireError::TrailingBytes(1))));
        assert!(matches!(decode(&[0x7f]), Err(WireError::UnknownTag(0x7f))));
    }

    #[test]
    fn hostile_counts_and_depth_are_bounded() {
        let huge = [TAG_ARRAY, 0xff, 0xff, 0xff, 0xff];
        assert!(matches!(decode(&huge), Err(WireError::Truncated { .. })));

        let mut nested = vec![TAG_ARRAY, 1, 0, 0, 0].repeat(MAX_DEPTH + 1);
        nested.push(TAG_NULL);
        assert!(matches!(decode(&nested), Err(WireError::DepthExceeded(_))));
    }

    #[test]
    fn invalid_utf8_strings_are_rejected() {
        let bytes = [TAG_STRING, 2, 0, 0, 0, 0xc3, 0x28];
        assert!(matches!(decode(&bytes), Err(WireError::InvalidUtf8)));
    }

    #[test]
    fn surfaces_are_claimed_on_encode_and_mapped_on_decode() {
        let dir = std::env::temp_dir().join(format!(
            "xpckit-wire-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("time should be after epoch")
                .as_nanos()
        ));
        let surface = SharedMemory::create_in(&dir, 128).unwrap();
        surface.fill(0x5a);
        let object = XpcObject::SharedMemory(surface.clone());

        let bytes = encode(&object).unwrap();
        assert!(matches!(
            encode(&object),
            Err(WireError::Surface(SurfaceError::AlreadyTransferred(_)))
        ));

        let received = decode(&bytes).unwrap();
        let received = received.as_shared_memory().unwrap();
        assert!(received.same_memory(&surface));
        assert_eq!(received.len(), 128);
        assert_eq!(received.to_vec()[127], 0x5a);
        assert!(!surface.backing_path().exists());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn failed_encode_releases_surfaces_it_claimed() {
        let dir = std::env::temp_dir().join(format!(
            "xpckit-wire-fail-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("time should be after epoch")
                .as_nanos()
        ));
        let first = SharedMemory::create_in(&dir, 16).unwrap();
        let spent = SharedMemory::create_in(&dir, 16).unwrap();
        spent.take_for_transfer().unwrap();

        let object = XpcObject::Array(vec![
            XpcObject::SharedMemory(first.clone()),
            XpcObject::SharedMemory(spent),
        ]);
        assert!(matches!(
            encode_claimed(&object),
            Err(WireError::Surface(SurfaceError::AlreadyTransferred(_)))
        ));

        drop(object);
        let (_, claims) = encode_claimed(&XpcObject::SharedMemory(first.clone())).unwrap();
        assert_eq!(claims.len(), 1);
        let path = first.backing_path().to_path_buf();
        drop(claims);
        drop(first);
        assert!(!path.exists());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
