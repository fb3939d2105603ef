//! WAL batch framing

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::{KairoError, Result, Timestamp};

/// One logged sample. Values travel as f64 in the log and are narrowed back
/// on replay, which is exact for the f32 inputs the pipeline carries.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FloatValue {
    /// Timestamp in unix seconds
    pub unix: Timestamp,
    /// Sample value
    pub value: f64,
}

impl FloatValue {
    /// Create a new float value
    pub fn new(unix: Timestamp, value: f64) -> Self {
        Self { unix, value }
    }
}

/// One appended batch: samples grouped by composite series key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    /// Samples per series key
    pub values: HashMap<String, Vec<FloatValue>>,
}

impl WalEntry {
    /// Create an entry from a grouped batch
    pub fn new(values: HashMap<String, Vec<FloatValue>>) -> Self {
        Self { values }
    }

    /// Serialize the entry with length prefix and CRC checksum
    ///
    /// Format:
    /// - 4 bytes: entry length (excluding this field)
    /// - N bytes: bincode body
    /// - 4 bytes: CRC32 of the body
    pub fn serialize_with_checksum(&self) -> Result<Bytes> {
        let body = bincode::serialize(&self.values)
            .map_err(|e| KairoError::InvalidFormat(e.to_string()))?;

        let mut buf = BytesMut::with_capacity(body.len() + 8);
        buf.put_u32_le((body.len() + 4) as u32);
        buf.put_slice(&body);
        buf.put_u32_le(crc32fast::hash(&body));

        Ok(buf.freeze())
    }

    /// Deserialize one entry from the front of `data`, validating its
    /// checksum. Returns the entry and the bytes consumed, or `None` when
    /// `data` holds only the torn tail of an interrupted append.
    pub fn deserialize_with_checksum(data: &[u8]) -> Result<Option<(Self, usize)>> {
        if data.len() < 4 {
            return Ok(None);
        }

        let mut cursor = std::io::Cursor::new(data);
        let len = cursor.get_u32_le() as usize;
        if len < 4 {
            return Err(KairoError::InvalidFormat("entry length underflow".into()));
        }
        if data.len() < 4 + len {
            return Ok(None);
        }

        let body = &data[4..len];
        let expected = (&data[len..4 + len]).get_u32_le();
        let actual = crc32fast::hash(body);
        if expected != actual {
            return Err(KairoError::ChecksumMismatch { expected, actual });
        }

        let values = bincode::deserialize(body)
            .map_err(|e| KairoError::InvalidFormat(e.to_string()))?;

        Ok(Some((Self { values }, 4 + len)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry() -> WalEntry {
        let mut values = HashMap::new();
        values.insert(
            "ks|ts".to_string(),
            vec![FloatValue::new(1000, 23.5), FloatValue::new(1001, -1.0)],
        );
        WalEntry::new(values)
    }

    #[test]
    fn test_entry_roundtrip() {
        let entry = sample_entry();
        let data = entry.serialize_with_checksum().unwrap();

        let (decoded, read) = WalEntry::deserialize_with_checksum(&data)
            .unwrap()
            .unwrap();
        assert_eq!(read, data.len());
        assert_eq!(decoded.values, entry.values);
    }

    #[test]
    fn test_checksum_validation() {
        let mut data = sample_entry().serialize_with_checksum().unwrap().to_vec();
        data[6] ^= 0xFF;

        assert!(matches!(
            WalEntry::deserialize_with_checksum(&data),
            Err(KairoError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_torn_tail_is_not_an_error() {
        let data = sample_entry().serialize_with_checksum().unwrap();

        assert!(WalEntry::deserialize_with_checksum(&data[..2])
            .unwrap()
            .is_none());
        assert!(WalEntry::deserialize_with_checksum(&data[..data.len() - 1])
            .unwrap()
            .is_none());
    }
}
