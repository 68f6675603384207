//! Call metadata: an ordered multi-map of byte-string keys and values.
//!
//! On the wire each entry is `(u32 key_len, key, u32 value_len, value)`,
//! repeated until the end of the frame payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::Error;

/// A single metadata entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: Bytes,
    pub value: Bytes,
}

impl Entry {
    pub fn new(key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Self {
        Self {
            key: Bytes::copy_from_slice(key.as_ref()),
            value: Bytes::copy_from_slice(value.as_ref()),
        }
    }
}

/// Ordered multi-map of metadata entries. Duplicate keys are kept in
/// insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: Vec<Entry>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry, keeping any earlier entries with the same key.
    pub fn insert(&mut self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) {
        self.entries.push(Entry::new(key, value));
    }

    /// First value stored under `key`.
    pub fn get(&self, key: impl AsRef<[u8]>) -> Option<&[u8]> {
        let key = key.as_ref();
        self.entries
            .iter()
            .find(|e| e.key == key)
            .map(|e| e.value.as_ref())
    }

    /// All values stored under `key`, in insertion order.
    pub fn get_all<'a>(&'a self, key: &'a [u8]) -> impl Iterator<Item = &'a [u8]> + 'a {
        self.entries
            .iter()
            .filter(move |e| e.key == key)
            .map(|e| e.value.as_ref())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of bytes `encode` will write.
    pub fn encoded_len(&self) -> usize {
        self.entries
            .iter()
            .map(|e| 8 + e.key.len() + e.value.len())
            .sum()
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_len());
        for e in &self.entries {
            buf.put_u32(e.key.len() as u32);
            buf.put_slice(&e.key);
            buf.put_u32(e.value.len() as u32);
            buf.put_slice(&e.value);
        }
    }

    /// Decode entries until `buf` is exhausted.
    pub fn decode(mut buf: Bytes) -> Result<Self, Error> {
        let mut entries = Vec::new();
        while buf.has_remaining() {
            let key = take_field(&mut buf)?;
            let value = take_field(&mut buf)?;
            entries.push(Entry { key, value });
        }
        Ok(Self { entries })
    }
}

fn take_field(buf: &mut Bytes) -> Result<Bytes, Error> {
    if buf.remaining() < 4 {
        return Err(Error::Malformed("truncated metadata length".into()));
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(Error::Malformed("metadata field overruns frame".into()));
    }
    Ok(buf.split_to(len))
}

impl<K: AsRef<[u8]>, V: AsRef<[u8]>> FromIterator<(K, V)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut md = Metadata::new();
        for (k, v) in iter {
            md.insert(k, v);
        }
        md
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multi_map_keeps_order() {
        let mut md = Metadata::new();
        md.insert(":method", "POST");
        md.insert("x-tag", "a");
        md.insert("x-tag", "b");

        assert_eq!(md.len(), 3);
        assert_eq!(md.get(":method"), Some(&b"POST"[..]));
        assert_eq!(md.get("x-tag"), Some(&b"a"[..]));
        let all: Vec<_> = md.get_all(b"x-tag").collect();
        assert_eq!(all, vec![&b"a"[..], &b"b"[..]]);
        assert!(md.get("missing").is_none());
    }

    #[test]
    fn wire_round_trip() {
        let md: Metadata = [(":path", "/svc/Method"), ("te", "trailers"), ("bin", "")]
            .into_iter()
            .collect();
        let mut buf = BytesMut::new();
        md.encode(&mut buf);
        assert_eq!(buf.len(), md.encoded_len());
        let decoded = Metadata::decode(buf.freeze()).unwrap();
        assert_eq!(decoded, md);
    }

    #[test]
    fn truncated_field_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(10);
        buf.put_slice(b"short");
        assert!(matches!(
            Metadata::decode(buf.freeze()),
            Err(Error::Malformed(_))
        ));
    }

    #[test]
    fn missing_value_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(3);
        buf.put_slice(b"key");
        assert!(Metadata::decode(buf.freeze()).is_err());
    }
}
