//! Core types for the NVM tier
//!
//! Entries are stored as one contiguous byte string:
//!
//! ```text
//! varint32 ikey_len | user_key | fixed64 tag | varint32 value_len | value
//! ```
//!
//! where `tag = (sequence << 8) | value_type`. The outer engine owns the
//! real internal-key format; this is the minimal codec the comparator and
//! table lookups need.

/// Sequence number for ordering
pub type SequenceNumber = u64;

/// Largest sequence number that still fits in a tag
pub const MAX_SEQUENCE_NUMBER: SequenceNumber = (1 << 56) - 1;

/// Size of the packed (sequence, type) tag
pub const TAG_SIZE: usize = 8;

/// Kind of write an entry records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ValueType {
    /// Tombstone
    Deletion = 0,
    /// Regular value
    Value = 1,
}

impl ValueType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(ValueType::Deletion),
            1 => Some(ValueType::Value),
            _ => None,
        }
    }
}

/// Pack a sequence number and value type into a tag
#[inline]
pub fn pack_tag(sequence: SequenceNumber, value_type: ValueType) -> u64 {
    debug_assert!(sequence <= MAX_SEQUENCE_NUMBER);
    (sequence << 8) | value_type as u64
}

/// Append `value` as a varint32
pub fn put_varint32(dst: &mut Vec<u8>, mut value: u32) {
    while value >= 0x80 {
        dst.push((value as u8) | 0x80);
        value >>= 7;
    }
    dst.push(value as u8);
}

/// Decode a varint32, returning the value and the remaining bytes
pub fn get_varint32(src: &[u8]) -> Option<(u32, &[u8])> {
    let mut result = 0u32;
    for (i, &byte) in src.iter().enumerate().take(5) {
        result |= ((byte & 0x7f) as u32) << (7 * i);
        if byte & 0x80 == 0 {
            return Some((result, &src[i + 1..]));
        }
    }
    None
}

/// Split a length-prefixed slice off the front of `src`
pub fn get_length_prefixed(src: &[u8]) -> Option<(&[u8], &[u8])> {
    let (len, rest) = get_varint32(src)?;
    let len = len as usize;
    if rest.len() < len {
        return None;
    }
    Some(rest.split_at(len))
}

/// Encode one entry in the node format
pub fn encode_entry(
    sequence: SequenceNumber,
    value_type: ValueType,
    user_key: &[u8],
    value: &[u8],
) -> Vec<u8> {
    let ikey_len = user_key.len() + TAG_SIZE;
    let mut buf = Vec::with_capacity(ikey_len + value.len() + 10);
    put_varint32(&mut buf, ikey_len as u32);
    buf.extend_from_slice(user_key);
    buf.extend_from_slice(&pack_tag(sequence, value_type).to_le_bytes());
    put_varint32(&mut buf, value.len() as u32);
    buf.extend_from_slice(value);
    buf
}

/// Internal key decoded into its parts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedInternalKey<'a> {
    pub user_key: &'a [u8],
    pub sequence: SequenceNumber,
    pub value_type: ValueType,
}

/// Parse `user_key | tag`
pub fn parse_internal_key(ikey: &[u8]) -> Option<ParsedInternalKey<'_>> {
    if ikey.len() < TAG_SIZE {
        return None;
    }
    let (user_key, tag) = ikey.split_at(ikey.len() - TAG_SIZE);
    let tag = u64::from_le_bytes(tag.try_into().ok()?);
    Some(ParsedInternalKey {
        user_key,
        sequence: tag >> 8,
        value_type: ValueType::from_u8((tag & 0xff) as u8)?,
    })
}

/// Borrowed view of an encoded entry
#[derive(Debug, Clone, Copy)]
pub struct EntryRef<'a> {
    pub internal_key: &'a [u8],
    pub value: &'a [u8],
}

impl<'a> EntryRef<'a> {
    /// Decode an entry; `None` when the bytes are malformed
    pub fn decode(entry: &'a [u8]) -> Option<Self> {
        let (internal_key, rest) = get_length_prefixed(entry)?;
        if internal_key.len() < TAG_SIZE {
            return None;
        }
        let value = match get_length_prefixed(rest) {
            Some((value, _)) => value,
            None => &[],
        };
        Some(Self { internal_key, value })
    }

    pub fn parsed(&self) -> Option<ParsedInternalKey<'a>> {
        parse_internal_key(self.internal_key)
    }

    pub fn user_key(&self) -> &'a [u8] {
        &self.internal_key[..self.internal_key.len() - TAG_SIZE]
    }
}

/// Key used to probe tables: `varint32 ikey_len | user_key | tag`.
///
/// The tag carries the reader's snapshot so a seek lands on the newest
/// version visible at that sequence number.
#[derive(Debug, Clone)]
pub struct LookupKey {
    data: Vec<u8>,
    key_start: usize,
}

impl LookupKey {
    pub fn new(user_key: &[u8], sequence: SequenceNumber) -> Self {
        let ikey_len = user_key.len() + TAG_SIZE;
        let mut data = Vec::with_capacity(ikey_len + 5);
        put_varint32(&mut data, ikey_len as u32);
        let key_start = data.len();
        data.extend_from_slice(user_key);
        data.extend_from_slice(&pack_tag(sequence, ValueType::Value).to_le_bytes());
        Self { data, key_start }
    }

    /// Length-prefixed form compared against stored entries
    pub fn memtable_key(&self) -> &[u8] {
        &self.data
    }

    pub fn internal_key(&self) -> &[u8] {
        &self.data[self.key_start..]
    }

    pub fn user_key(&self) -> &[u8] {
        &self.data[self.key_start..self.data.len() - TAG_SIZE]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_boundaries() {
        for value in [0u32, 127, 128, 16_383, 16_384, u32::MAX] {
            let mut buf = Vec::new();
            put_varint32(&mut buf, value);
            let (decoded, rest) = get_varint32(&buf).unwrap();
            assert_eq!(decoded, value);
            assert!(rest.is_empty());
        }
        assert!(get_varint32(&[0x80, 0x80]).is_none());
    }

    #[test]
    fn test_entry_layout() {
        let entry = encode_entry(42, ValueType::Value, b"user", b"payload");
        let view = EntryRef::decode(&entry).unwrap();
        assert_eq!(view.user_key(), b"user");
        assert_eq!(view.value, b"payload");

        let parsed = view.parsed().unwrap();
        assert_eq!(parsed.sequence, 42);
        assert_eq!(parsed.value_type, ValueType::Value);
    }

    #[test]
    fn test_lookup_key_decodes_as_entry() {
        let lookup = LookupKey::new(b"abc", 7);
        let view = EntryRef::decode(lookup.memtable_key()).unwrap();
        assert_eq!(view.user_key(), b"abc");
        assert!(view.value.is_empty());
        assert_eq!(lookup.user_key(), b"abc");
        assert_eq!(parse_internal_key(lookup.internal_key()).unwrap().sequence, 7);
    }
}
