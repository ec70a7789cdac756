//! Binary record codec for tuples.
//!
//! Every record is self describing, all integers are big endian:
//!
//! ```text
//! +-------------+--------------+---------------+----------------+-----------------+
//! | key_len:u16 | bbox_len:u32 | value_len:u32 | version_ts:u64 | received_ts:u64 |
//! +-------------+--------------+---------------+----------------+-----------------+
//! | key         | bbox         | value         |
//! +-------------+--------------+---------------+
//! ```
//!
//! A tombstone stores [`DELETED_MARKER`] verbatim in both the bbox and the
//! value field.

use std::io::{self, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::entity::{Hyperrectangle, Tuple};
use crate::error::Result;
use crate::Error;

/// Sentinel written into the bbox and value fields of a tombstone.
pub const DELETED_MARKER: &[u8] = b"DEL";

/// Size of the fixed record header.
pub const RECORD_HEADER_SIZE: usize = 2 + 4 + 4 + 8 + 8;

/// How a decoded record is recognized as a tombstone.
///
/// `BothFields` is what the decoder uses. `ValueOnly` looks at the value
/// alone and therefore mistakes data whose value equals the sentinel for a
/// deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TombstoneRule {
    BothFields,
    ValueOnly,
}

impl TombstoneRule {
    pub fn matches(&self, bbox: &[u8], value: &[u8]) -> bool {
        match self {
            TombstoneRule::BothFields => bbox == DELETED_MARKER && value == DELETED_MARKER,
            TombstoneRule::ValueOnly => value == DELETED_MARKER,
        }
    }
}

/// Number of bytes `encode_tuple` writes for this tuple.
pub fn encoded_len(tuple: &Tuple) -> usize {
    let (bbox_len, value_len) = if tuple.is_tombstone() {
        (DELETED_MARKER.len(), DELETED_MARKER.len())
    } else {
        (tuple.bounding_box().encoded_len(), tuple.value().len())
    };
    RECORD_HEADER_SIZE + tuple.key().len() + bbox_len + value_len
}

pub fn encode_tuple<W: Write>(writer: &mut W, tuple: &Tuple) -> Result<()> {
    let key = tuple.key().as_bytes();
    if key.len() > u16::MAX as usize {
        return Err(Error::InvalidData(format!(
            "Key of {} bytes exceeds the maximum key length",
            key.len()
        )));
    }

    let bbox = if tuple.is_tombstone() {
        DELETED_MARKER.to_vec()
    } else {
        tuple.bounding_box().to_bytes()
    };
    let value = if tuple.is_tombstone() {
        DELETED_MARKER
    } else {
        tuple.value()
    };

    if value.len() > u32::MAX as usize || bbox.len() > u32::MAX as usize {
        return Err(Error::InvalidData(format!(
            "Tuple {} is too large to encode",
            tuple.key()
        )));
    }

    let mut write_record = || -> io::Result<()> {
        writer.write_u16::<BigEndian>(key.len() as u16)?;
        writer.write_u32::<BigEndian>(bbox.len() as u32)?;
        writer.write_u32::<BigEndian>(value.len() as u32)?;
        writer.write_u64::<BigEndian>(tuple.version_timestamp())?;
        writer.write_u64::<BigEndian>(tuple.received_timestamp())?;
        writer.write_all(key)?;
        writer.write_all(&bbox)?;
        writer.write_all(value)
    };
    write_record().map_err(|e| Error::Encode("tuple", e))
}

/// Reads the next record. Returns `None` on a clean end of stream, a
/// truncated record is an error.
pub fn decode_tuple<R: Read>(reader: &mut R) -> Result<Option<Tuple>> {
    let key_len = match reader.read_u16::<BigEndian>() {
        Ok(len) => len as usize,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(Error::Decode("key length", e)),
    };

    let bbox_len = reader
        .read_u32::<BigEndian>()
        .map_err(|e| Error::Decode("bbox length", e))? as usize;
    let value_len = reader
        .read_u32::<BigEndian>()
        .map_err(|e| Error::Decode("value length", e))? as usize;
    let version_timestamp = reader
        .read_u64::<BigEndian>()
        .map_err(|e| Error::Decode("version timestamp", e))?;
    let received_timestamp = reader
        .read_u64::<BigEndian>()
        .map_err(|e| Error::Decode("received timestamp", e))?;

    let key = read_field(reader, key_len, "key")?;
    let bbox = read_field(reader, bbox_len, "bounding box")?;
    let value = read_field(reader, value_len, "value")?;

    let key = String::from_utf8(key)
        .map_err(|_| Error::InvalidData("Tuple key is not valid UTF-8".to_string()))?;

    if TombstoneRule::BothFields.matches(&bbox, &value) {
        return Ok(Some(Tuple::tombstone_received_at(
            key,
            version_timestamp,
            received_timestamp,
        )));
    }

    Ok(Some(Tuple::with_received_timestamp(
        key,
        Hyperrectangle::from_bytes(&bbox)?,
        value,
        version_timestamp,
        received_timestamp,
    )))
}

/// Reads only the key of the record at the current position.
pub fn decode_key<R: Read>(reader: &mut R) -> Result<String> {
    let mut header = [0u8; RECORD_HEADER_SIZE];
    reader
        .read_exact(&mut header)
        .map_err(|e| Error::Decode("tuple header", e))?;
    let key_len = u16::from_be_bytes([header[0], header[1]]) as usize;

    let key = read_field(reader, key_len, "key")?;
    String::from_utf8(key)
        .map_err(|_| Error::InvalidData("Tuple key is not valid UTF-8".to_string()))
}

fn read_field<R: Read>(reader: &mut R, len: usize, field: &'static str) -> Result<Vec<u8>> {
    let mut buffer = vec![0u8; len];
    reader
        .read_exact(&mut buffer)
        .map_err(|e| Error::Decode(field, e))?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Cursor;

    fn encode(tuple: &Tuple) -> Vec<u8> {
        let mut buffer = Vec::new();
        encode_tuple(&mut buffer, tuple).unwrap();
        buffer
    }

    #[test]
    fn test_record_layout() {
        let bbox = Hyperrectangle::new(vec![1.0, 2.0]).unwrap();
        let tuple = Tuple::with_received_timestamp("ab", bbox, b"xyz".to_vec(), 7, 9);
        let bytes = encode(&tuple);

        assert_eq!(bytes.len(), encoded_len(&tuple));
        assert_eq!(&bytes[0..2], &[0, 2]);
        assert_eq!(&bytes[2..6], &[0, 0, 0, 16]);
        assert_eq!(&bytes[6..10], &[0, 0, 0, 3]);
        assert_eq!(&bytes[10..18], &7u64.to_be_bytes());
        assert_eq!(&bytes[18..26], &9u64.to_be_bytes());
        assert_eq!(&bytes[26..28], b"ab");
        assert_eq!(&bytes[28..36], &1.0f64.to_be_bytes());
        assert_eq!(&bytes[44..], b"xyz");
    }

    #[test]
    fn test_tombstone_layout() {
        let tombstone = Tuple::tombstone_received_at("k1", 200, 201);
        let bytes = encode(&tombstone);

        assert_eq!(&bytes[2..6], &[0, 0, 0, 3]);
        assert_eq!(&bytes[6..10], &[0, 0, 0, 3]);
        assert_eq!(&bytes[bytes.len() - 6..], b"DELDEL");

        let decoded = decode_tuple(&mut Cursor::new(bytes)).unwrap().unwrap();
        assert_eq!(decoded, tombstone);
        assert!(decoded.is_tombstone());
    }

    #[test]
    fn test_clean_end_and_truncation() {
        let tuple = Tuple::new("key", Hyperrectangle::FULL_SPACE, b"value".to_vec(), 1);
        let bytes = encode(&tuple);

        let mut cursor = Cursor::new(bytes.clone());
        assert!(decode_tuple(&mut cursor).unwrap().is_some());
        assert!(decode_tuple(&mut cursor).unwrap().is_none());

        let truncated = &bytes[..bytes.len() - 1];
        assert!(decode_tuple(&mut Cursor::new(truncated)).is_err());
    }

    #[test]
    fn test_decode_key() {
        let tuple = Tuple::new("some-key", Hyperrectangle::FULL_SPACE, b"v".to_vec(), 1);
        let bytes = encode(&tuple);
        assert_eq!(decode_key(&mut Cursor::new(bytes)).unwrap(), "some-key");
    }

    #[test]
    fn test_single_sentinel_field_is_data() {
        // Value equals the sentinel, bbox does not
        let tuple = Tuple::new("k", Hyperrectangle::FULL_SPACE, DELETED_MARKER.to_vec(), 1);
        let decoded = decode_tuple(&mut Cursor::new(encode(&tuple)))
            .unwrap()
            .unwrap();

        assert!(!decoded.is_tombstone());
        assert_eq!(decoded.value(), DELETED_MARKER);
        assert!(TombstoneRule::ValueOnly.matches(&[], decoded.value()));
    }

    fn arb_bbox() -> impl Strategy<Value = Hyperrectangle> {
        prop::collection::vec((-1000.0f64..1000.0, 0.0f64..100.0), 0..4).prop_map(|dims| {
            let bounds = dims
                .into_iter()
                .flat_map(|(low, extent)| [low, low + extent])
                .collect();
            Hyperrectangle::new(bounds).unwrap()
        })
    }

    proptest! {
        #[test]
        fn tuple_roundtrip(
            key in "[a-z0-9]{1,32}",
            bbox in arb_bbox(),
            value in prop::collection::vec(any::<u8>(), 0..256),
            version in any::<u64>(),
            received in any::<u64>(),
        ) {
            let tuple = Tuple::with_received_timestamp(key, bbox, value, version, received);
            let decoded = decode_tuple(&mut Cursor::new(encode(&tuple))).unwrap().unwrap();
            prop_assert_eq!(decoded, tuple);
        }

        #[test]
        fn both_fields_rule_never_hides_data(
            bbox in arb_bbox(),
            use_marker in any::<bool>(),
            value in prop::collection::vec(any::<u8>(), 0..8),
        ) {
            let value = if use_marker { DELETED_MARKER.to_vec() } else { value };
            let encoded_bbox = bbox.to_bytes();

            // Data bboxes are a multiple of 8 bytes long, the sentinel is not
            prop_assert!(!TombstoneRule::BothFields.matches(&encoded_bbox, &value));
            prop_assert_eq!(
                TombstoneRule::ValueOnly.matches(&encoded_bbox, &value),
                value == DELETED_MARKER
            );
        }
    }
}
