//! Checksummed bincode framing for small metadata documents.
//!
//! ```text
//! +------------------+-----------------+--------------+
//! | payload_len: u32 | bincode payload | crc64: u64   |
//! +------------------+-----------------+--------------+
//! ```

use std::io::{Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::{Error, Hasher};

/// Serialize a value into a writer, followed by its checksum
pub fn serialize_into<T: Serialize, W: Write>(writer: &mut W, value: &T) -> Result<()> {
    let payload = bincode::serialize(value)?;

    let mut hasher = Hasher::new();
    hasher.write(&payload);

    writer
        .write_u32::<BigEndian>(payload.len() as u32)
        .map_err(|e| Error::Encode("payload length", e))?;
    writer
        .write_all(&payload)
        .map_err(|e| Error::Encode("payload", e))?;
    writer
        .write_u64::<BigEndian>(hasher.checksum())
        .map_err(|e| Error::Encode("checksum", e))?;
    Ok(())
}

/// Deserialize a value from a reader, verifying its checksum first
pub fn deserialize_from<T: for<'a> Deserialize<'a>, R: Read>(reader: &mut R) -> Result<T> {
    let len = reader
        .read_u32::<BigEndian>()
        .map_err(|e| Error::Decode("payload length", e))? as usize;

    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .map_err(|e| Error::Decode("payload", e))?;

    let expected = reader
        .read_u64::<BigEndian>()
        .map_err(|e| Error::Decode("checksum", e))?;

    let mut hasher = Hasher::new();
    hasher.write(&payload);
    let actual = hasher.checksum();
    if actual != expected {
        return Err(Error::ChecksumMismatch { expected, actual });
    }

    Ok(bincode::deserialize(&payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct TestStruct {
        id: u32,
        name: String,
        active: bool,
    }

    #[test]
    fn test_serialize_deserialize() {
        let original = TestStruct {
            id: 42,
            name: "roads".to_string(),
            active: true,
        };

        let mut buffer = Vec::new();
        serialize_into(&mut buffer, &original).unwrap();

        let decoded: TestStruct = deserialize_from(&mut Cursor::new(buffer)).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_corruption_detected() {
        let original = TestStruct {
            id: 7,
            name: "forests".to_string(),
            active: false,
        };

        let mut buffer = Vec::new();
        serialize_into(&mut buffer, &original).unwrap();
        buffer[6] ^= 0xff;

        let result: Result<TestStruct> = deserialize_from(&mut Cursor::new(buffer));
        assert!(matches!(result, Err(Error::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_truncated_input() {
        let mut buffer = Vec::new();
        serialize_into(&mut buffer, &1u64).unwrap();
        buffer.truncate(buffer.len() - 3);

        let result: Result<u64> = deserialize_from(&mut Cursor::new(buffer));
        assert!(matches!(result, Err(Error::Decode("checksum", _))));
    }
}
