//! TLV codec for overlay metadata
//!
//! Overlay entries are self-describing envelopes:
//!
//! ```text
//! key_len(1) || key(<128) || value_len(1) || value(<256)
//! ```
//!
//! Keys and values are tagged unions. The only key variant today addresses a
//! log position (`tag 0 || index u32 BE`); the only value variant is a reply
//! link (`tag 0 || feed_key(32) || index u32 BE`). Unknown tags decode into
//! `Unknown` variants rather than failing, so forward-incompatible entries
//! are carried through and filtered at the timeline layer instead of
//! breaking decoding.
//!
//! Message keys encode their index big-endian so that byte-lexicographic
//! order coincides with numeric order; overlay range requests and watches
//! depend on this.

use granary_model::{FeedKey, FEED_KEY_SIZE};
use thiserror::Error;

/// Key tag for message-position keys.
pub const KEY_TAG_MESSAGE: u8 = 0;
/// Encoded size of a message key: tag + u32 index.
pub const MESSAGE_KEY_SIZE: usize = 5;

/// Value tag for reply links.
pub const VALUE_TAG_REPLY: u8 = 0;
/// Encoded size of a reply value: tag + feed key + u32 index.
pub const REPLY_VALUE_SIZE: usize = 1 + FEED_KEY_SIZE + 4;

/// Largest encodable key (the envelope's length byte keeps the top bit free).
pub const MAX_KEY_SIZE: usize = 127;
/// Largest encodable value.
pub const MAX_VALUE_SIZE: usize = 255;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MetaError {
    /// Key or value exceeds the envelope's length bounds. An encoding-side
    /// programmer error.
    #[error("Meta {kind} too large: {size} bytes (max {max})")]
    InvalidSize { kind: &'static str, size: usize, max: usize },

    /// Truncated buffer, or trailing bytes after the declared value.
    /// Always recoverable: callers filter malformed entries.
    #[error("Malformed meta entry")]
    Malformed,
}

/// Typed overlay key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MetaKey {
    /// Addresses the message at `index` in the feed's log.
    Message { index: u32 },
    /// Any other byte pattern (forward compatibility).
    Unknown(Vec<u8>),
}

impl MetaKey {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            MetaKey::Message { index } => {
                let mut key = Vec::with_capacity(MESSAGE_KEY_SIZE);
                key.push(KEY_TAG_MESSAGE);
                key.extend_from_slice(&index.to_be_bytes());
                key
            }
            MetaKey::Unknown(bytes) => bytes.clone(),
        }
    }

    pub fn decode(bytes: &[u8]) -> Self {
        if bytes.len() == MESSAGE_KEY_SIZE && bytes[0] == KEY_TAG_MESSAGE {
            let mut index = [0u8; 4];
            index.copy_from_slice(&bytes[1..]);
            MetaKey::Message { index: u32::from_be_bytes(index) }
        } else {
            MetaKey::Unknown(bytes.to_vec())
        }
    }

    /// The message index, if this is a message key.
    pub fn message_index(&self) -> Option<u32> {
        match self {
            MetaKey::Message { index } => Some(*index),
            MetaKey::Unknown(_) => None,
        }
    }
}

/// Typed overlay value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MetaValue {
    /// A reply link: the message at `index` in `feed_key`'s log replies to
    /// the message this entry is keyed on.
    Reply { feed_key: FeedKey, index: u32 },
    /// Any other byte pattern.
    Unknown(Vec<u8>),
}

impl MetaValue {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            MetaValue::Reply { feed_key, index } => {
                let mut value = Vec::with_capacity(REPLY_VALUE_SIZE);
                value.push(VALUE_TAG_REPLY);
                value.extend_from_slice(feed_key.as_bytes());
                value.extend_from_slice(&index.to_be_bytes());
                value
            }
            MetaValue::Unknown(bytes) => bytes.clone(),
        }
    }

    pub fn decode(bytes: &[u8]) -> Self {
        if bytes.len() == REPLY_VALUE_SIZE && bytes[0] == VALUE_TAG_REPLY {
            let feed_key = match FeedKey::try_from(&bytes[1..1 + FEED_KEY_SIZE]) {
                Ok(key) => key,
                Err(_) => return MetaValue::Unknown(bytes.to_vec()),
            };
            let mut index = [0u8; 4];
            index.copy_from_slice(&bytes[1 + FEED_KEY_SIZE..]);
            MetaValue::Reply { feed_key, index: u32::from_be_bytes(index) }
        } else {
            MetaValue::Unknown(bytes.to_vec())
        }
    }
}

/// One decoded overlay entry: a key and an optional value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetaEntry {
    pub key: MetaKey,
    pub value: Option<MetaValue>,
}

impl MetaEntry {
    pub fn new(key: MetaKey, value: Option<MetaValue>) -> Self {
        Self { key, value }
    }

    /// Encode into the envelope wire form.
    pub fn encode(&self) -> Result<Vec<u8>, MetaError> {
        let key = self.key.encode();
        let value = self.value.as_ref().map(|v| v.encode()).unwrap_or_default();

        if key.len() > MAX_KEY_SIZE {
            return Err(MetaError::InvalidSize { kind: "key", size: key.len(), max: MAX_KEY_SIZE });
        }
        if value.len() > MAX_VALUE_SIZE {
            return Err(MetaError::InvalidSize {
                kind: "value",
                size: value.len(),
                max: MAX_VALUE_SIZE,
            });
        }

        let mut entry = Vec::with_capacity(2 + key.len() + value.len());
        entry.push(key.len() as u8);
        entry.extend_from_slice(&key);
        entry.push(value.len() as u8);
        entry.extend_from_slice(&value);
        Ok(entry)
    }

    /// Decode an envelope. Exact-length: truncated buffers and trailing
    /// bytes are [`MetaError::Malformed`]; unknown key/value tags are not
    /// errors.
    pub fn decode(raw: &[u8]) -> Result<Self, MetaError> {
        let mut rest = raw;

        let (&key_len, tail) = rest.split_first().ok_or(MetaError::Malformed)?;
        rest = tail;
        if rest.len() < key_len as usize {
            return Err(MetaError::Malformed);
        }
        let (key, tail) = rest.split_at(key_len as usize);
        rest = tail;

        let (&value_len, tail) = rest.split_first().ok_or(MetaError::Malformed)?;
        rest = tail;
        if rest.len() != value_len as usize {
            return Err(MetaError::Malformed);
        }
        let value = rest;

        Ok(Self {
            key: MetaKey::decode(key),
            value: if value.is_empty() { None } else { Some(MetaValue::decode(value)) },
        })
    }
}

/// Inclusive lower bound (as envelope bytes) for overlay range operations
/// over message indices starting at `index`.
pub fn message_range_start(index: u32) -> Vec<u8> {
    // Key-only envelopes (empty value) sort before any entry carrying the
    // same key with a non-empty value, so they work as range bounds.
    bound(index)
}

/// Exclusive upper bound for overlay range operations. `None` means
/// unbounded.
pub fn message_range_end(index: Option<u32>) -> Option<Vec<u8>> {
    index.map(bound)
}

fn bound(index: u32) -> Vec<u8> {
    let mut raw = Vec::with_capacity(2 + MESSAGE_KEY_SIZE);
    raw.push(MESSAGE_KEY_SIZE as u8);
    raw.push(KEY_TAG_MESSAGE);
    raw.extend_from_slice(&index.to_be_bytes());
    raw.push(0);
    raw
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(index: u32) -> MetaValue {
        MetaValue::Reply { feed_key: FeedKey([3u8; 32]), index }
    }

    #[test]
    fn test_round_trip_with_value() {
        let entry = MetaEntry::new(MetaKey::Message { index: 42 }, Some(reply(7)));
        let raw = entry.encode().unwrap();
        assert_eq!(raw.len(), 2 + MESSAGE_KEY_SIZE + REPLY_VALUE_SIZE);
        assert_eq!(MetaEntry::decode(&raw).unwrap(), entry);
    }

    #[test]
    fn test_round_trip_without_value() {
        let entry = MetaEntry::new(MetaKey::Message { index: 0 }, None);
        let raw = entry.encode().unwrap();
        assert_eq!(raw.len(), 2 + MESSAGE_KEY_SIZE);
        assert_eq!(MetaEntry::decode(&raw).unwrap(), entry);
    }

    #[test]
    fn test_round_trip_unknown() {
        let entry = MetaEntry::new(
            MetaKey::Unknown(b"legacy-key".to_vec()),
            Some(MetaValue::Unknown(vec![0xde, 0xad])),
        );
        let raw = entry.encode().unwrap();
        assert_eq!(MetaEntry::decode(&raw).unwrap(), entry);
    }

    #[test]
    fn test_oversized_key_rejected() {
        let entry = MetaEntry::new(MetaKey::Unknown(vec![0u8; 128]), None);
        assert!(matches!(entry.encode(), Err(MetaError::InvalidSize { kind: "key", .. })));
    }

    #[test]
    fn test_oversized_value_rejected() {
        let entry = MetaEntry::new(
            MetaKey::Message { index: 1 },
            Some(MetaValue::Unknown(vec![0u8; 256])),
        );
        assert!(matches!(entry.encode(), Err(MetaError::InvalidSize { kind: "value", .. })));
    }

    #[test]
    fn test_decode_rejects_truncation() {
        let raw = MetaEntry::new(MetaKey::Message { index: 9 }, Some(reply(1)))
            .encode()
            .unwrap();
        for cut in 0..raw.len() {
            assert_eq!(MetaEntry::decode(&raw[..cut]), Err(MetaError::Malformed), "cut={}", cut);
        }
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let mut raw = MetaEntry::new(MetaKey::Message { index: 9 }, None).encode().unwrap();
        raw.push(0);
        assert_eq!(MetaEntry::decode(&raw), Err(MetaError::Malformed));
    }

    #[test]
    fn test_decode_empty_buffer() {
        assert_eq!(MetaEntry::decode(&[]), Err(MetaError::Malformed));
    }

    #[test]
    fn test_unknown_tag_decodes() {
        // tag 1 with the right length is not a message key
        let raw = [5u8, 1, 0, 0, 0, 7, 0];
        let entry = MetaEntry::decode(&raw).unwrap();
        assert_eq!(entry.key, MetaKey::Unknown(vec![1, 0, 0, 0, 7]));
        assert_eq!(entry.value, None);
    }

    #[test]
    fn test_message_key_byte_order_matches_numeric_order() {
        let pairs = [(0u32, 1u32), (1, 2), (255, 256), (65_535, 65_536), (7, 1_000_000)];
        for (i1, i2) in pairs {
            let k1 = MetaKey::Message { index: i1 }.encode();
            let k2 = MetaKey::Message { index: i2 }.encode();
            assert!(k1 < k2, "key({}) should sort before key({})", i1, i2);
            assert!(message_range_start(i1) < message_range_start(i2));
        }
    }

    #[test]
    fn test_range_bounds_bracket_entries() {
        let entry = MetaEntry::new(MetaKey::Message { index: 5 }, Some(reply(0)))
            .encode()
            .unwrap();
        assert!(message_range_start(5) <= entry);
        assert!(entry < message_range_end(Some(6)).unwrap());
    }
}
