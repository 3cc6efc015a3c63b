//! Decoding of broker-transmitted messages
//!
//! A message reaches the caller only when the CRC32 (IEEE) of its payload
//! matches the transmitted checksum. Mismatches are dropped and only counted.

use bytes::{Buf, Bytes};
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

use crate::protocol::{TopicName, TransferredMessage};

/// Flag bit marking a payload that starts with a property block
pub const FLAG_HAS_PROPERTIES: i32 = 0x01;

/// Property carrying the message type used by topic filters
pub const MSG_TYPE_PROPERTY: &str = "$msgType$";

/// A decoded message handed to the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: TopicName,
    pub id: i64,
    pub flag: i32,
    pub checksum: i32,
    /// Only populated when the properties flag is set
    pub properties: HashMap<String, String>,
    pub data: Bytes,
}

impl Message {
    pub fn has_properties(&self) -> bool {
        self.flag & FLAG_HAS_PROPERTIES != 0
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}

/// Result of decoding one fetch response
#[derive(Debug, Default, Clone)]
pub struct DecodedBatch {
    pub messages: Vec<Message>,
    /// Data bytes of the retained messages
    pub bytes: u64,
    pub checksum_mismatches: u64,
    pub malformed: u64,
    pub filtered_out: u64,
}

/// Compute the checksum the broker is expected to send for `payload`
pub fn checksum(payload: &[u8]) -> i32 {
    crc32fast::hash(payload) as i32
}

/// Boolean filter predicate: with no filter set every message passes,
/// otherwise its `$msgType$` property must be one of the filter keys
pub fn matches_filter(
    properties: &HashMap<String, String>,
    filters: Option<&BTreeSet<String>>,
) -> bool {
    match filters {
        None => true,
        Some(filters) if filters.is_empty() => true,
        Some(filters) => properties
            .get(MSG_TYPE_PROPERTY)
            .is_some_and(|msg_type| filters.contains(msg_type)),
    }
}

/// Parse a `k=v,k2=v2` property block; items without '=' are skipped
pub fn parse_properties(block: &str) -> HashMap<String, String> {
    block
        .split(',')
        .filter_map(|item| item.split_once('='))
        .filter(|(key, _)| !key.is_empty())
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

/// Decode every transmitted message of `topic`
pub fn decode_messages(
    topic: &str,
    transferred: Vec<TransferredMessage>,
    filters: Option<&BTreeSet<String>>,
) -> DecodedBatch {
    let mut batch = DecodedBatch {
        messages: Vec::with_capacity(transferred.len()),
        ..Default::default()
    };

    for msg in transferred {
        if checksum(&msg.payload) != msg.checksum {
            debug!(
                topic = %topic,
                message_id = msg.message_id,
                "Dropping message with checksum mismatch"
            );
            batch.checksum_mismatches += 1;
            continue;
        }

        let mut payload = msg.payload;
        let mut properties = HashMap::new();
        if msg.flag & FLAG_HAS_PROPERTIES != 0 {
            if payload.len() < 4 {
                batch.malformed += 1;
                continue;
            }
            let attr_len = payload.get_u32() as usize;
            if attr_len > payload.len() {
                batch.malformed += 1;
                continue;
            }
            let attributes = payload.split_to(attr_len);
            properties = parse_properties(&String::from_utf8_lossy(&attributes));
        }
        if !matches_filter(&properties, filters) {
            batch.filtered_out += 1;
            continue;
        }

        batch.bytes += payload.len() as u64;
        batch.messages.push(Message {
            topic: topic.to_string(),
            id: msg.message_id,
            flag: msg.flag,
            checksum: msg.checksum,
            properties,
            data: payload,
        });
    }

    batch
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};

    fn transferred(id: i64, flag: i32, payload: Bytes) -> TransferredMessage {
        TransferredMessage {
            message_id: id,
            flag,
            checksum: checksum(&payload),
            payload,
        }
    }

    fn with_properties(props: &str, data: &[u8]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u32(props.len() as u32);
        buf.put_slice(props.as_bytes());
        buf.put_slice(data);
        buf.freeze()
    }

    #[test]
    fn test_valid_checksum_is_retained() {
        let batch = decode_messages(
            "orders",
            vec![transferred(1, 0, Bytes::from_static(b"hello"))],
            None,
        );
        assert_eq!(batch.messages.len(), 1);
        assert_eq!(batch.bytes, 5);
        assert_eq!(batch.messages[0].data, Bytes::from_static(b"hello"));
        assert!(batch.messages[0].properties.is_empty());
    }

    #[test]
    fn test_bit_flip_is_dropped() {
        let good = transferred(1, 0, Bytes::from_static(b"payload-1"));
        let mut flipped = transferred(2, 0, Bytes::from_static(b"payload-2"));
        let mut corrupted = flipped.payload.to_vec();
        corrupted[0] ^= 0x01;
        flipped.payload = Bytes::from(corrupted);

        let batch = decode_messages("orders", vec![good, flipped], None);
        assert_eq!(batch.messages.len(), 1);
        assert_eq!(batch.messages[0].id, 1);
        assert_eq!(batch.bytes, 9);
        assert_eq!(batch.checksum_mismatches, 1);
    }

    #[test]
    fn test_properties_decode() {
        let payload = with_properties("$msgType$=pay,region=eu", b"body");
        let batch = decode_messages(
            "orders",
            vec![transferred(7, FLAG_HAS_PROPERTIES, payload)],
            None,
        );
        let msg = &batch.messages[0];
        assert!(msg.has_properties());
        assert_eq!(msg.property("$msgType$"), Some("pay"));
        assert_eq!(msg.property("region"), Some("eu"));
        assert_eq!(msg.data, Bytes::from_static(b"body"));
        assert_eq!(batch.bytes, 4);
    }

    #[test]
    fn test_truncated_property_block() {
        let mut buf = BytesMut::new();
        buf.put_u32(64);
        buf.put_slice(b"short");
        let batch = decode_messages(
            "orders",
            vec![
                transferred(1, FLAG_HAS_PROPERTIES, buf.freeze()),
                transferred(2, FLAG_HAS_PROPERTIES, Bytes::from_static(b"ab")),
            ],
            None,
        );
        assert!(batch.messages.is_empty());
        assert_eq!(batch.malformed, 2);
        assert_eq!(batch.bytes, 0);
    }

    #[test]
    fn test_filter_predicate() {
        let filters: BTreeSet<String> = ["pay".to_string()].into_iter().collect();
        let batch = decode_messages(
            "orders",
            vec![
                transferred(1, FLAG_HAS_PROPERTIES, with_properties("$msgType$=pay", b"a")),
                transferred(2, FLAG_HAS_PROPERTIES, with_properties("$msgType$=ship", b"b")),
                transferred(3, 0, Bytes::from_static(b"c")),
            ],
            Some(&filters),
        );
        assert_eq!(batch.messages.len(), 1);
        assert_eq!(batch.messages[0].id, 1);
        assert_eq!(batch.filtered_out, 2);
        assert_eq!(batch.bytes, 1);
    }

    #[test]
    fn test_parse_properties_skips_garbage() {
        let props = parse_properties("a=1,,novalue,=x,b=2=3");
        assert_eq!(props.len(), 2);
        assert_eq!(props["a"], "1");
        assert_eq!(props["b"], "2=3");
    }
}
