use std::cmp::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

use super::Hyperrectangle;

/// A versioned record. Tombstones carry only a key and a version and mark
/// the key as deleted as of that version.
#[derive(Debug, Clone, PartialEq)]
pub struct Tuple {
    key: String,
    bounding_box: Hyperrectangle,
    value: Vec<u8>,
    version_timestamp: u64,
    received_timestamp: u64,
    tombstone: bool,
}

impl Tuple {
    pub fn new(
        key: impl Into<String>,
        bounding_box: Hyperrectangle,
        value: Vec<u8>,
        version_timestamp: u64,
    ) -> Self {
        Self::with_received_timestamp(key, bounding_box, value, version_timestamp, now_micros())
    }

    pub fn with_received_timestamp(
        key: impl Into<String>,
        bounding_box: Hyperrectangle,
        value: Vec<u8>,
        version_timestamp: u64,
        received_timestamp: u64,
    ) -> Self {
        Self {
            key: key.into(),
            bounding_box,
            value,
            version_timestamp,
            received_timestamp,
            tombstone: false,
        }
    }

    pub fn tombstone(key: impl Into<String>, version_timestamp: u64) -> Self {
        Self::tombstone_received_at(key, version_timestamp, now_micros())
    }

    pub fn tombstone_received_at(
        key: impl Into<String>,
        version_timestamp: u64,
        received_timestamp: u64,
    ) -> Self {
        Self {
            key: key.into(),
            bounding_box: Hyperrectangle::FULL_SPACE,
            value: Vec::new(),
            version_timestamp,
            received_timestamp,
            tombstone: true,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn bounding_box(&self) -> &Hyperrectangle {
        &self.bounding_box
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn version_timestamp(&self) -> u64 {
        self.version_timestamp
    }

    pub fn received_timestamp(&self) -> u64 {
        self.received_timestamp
    }

    pub fn is_tombstone(&self) -> bool {
        self.tombstone
    }

    /// Payload size used for run size accounting.
    pub fn size(&self) -> usize {
        self.value.len() + self.bounding_box.encoded_len()
    }
}

impl Eq for Tuple {}

impl PartialOrd for Tuple {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Key ascending, then newest version first.
impl Ord for Tuple {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key
            .cmp(&other.key)
            .then_with(|| other.version_timestamp.cmp(&self.version_timestamp))
    }
}

/// Microseconds since the unix epoch.
pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or_default()
}
