//! Spatial secondary index of a sorted run.
//!
//! The index maps the bounding box of every tuple to the tuple's position in
//! the run's key index. It is built once when a run is written and queried
//! many times afterwards. Region queries are exact: tree pruning may be
//! conservative, but only entries whose box intersects the query box are
//! returned.

pub mod rtree;

use std::io::{Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::entity::Hyperrectangle;
use crate::error::Result;
use crate::Error;

/// Magic bytes at the start of every spatial index file.
pub const SPATIAL_INDEX_MAGIC: &[u8] = b"boxdb-rtree";

/// A bounding box together with the key index position of its tuple.
#[derive(Debug, Clone, PartialEq)]
pub struct SpatialIndexEntry {
    bounding_box: Hyperrectangle,
    value: u32,
}

impl SpatialIndexEntry {
    pub fn new(bounding_box: Hyperrectangle, value: u32) -> Self {
        Self {
            bounding_box,
            value,
        }
    }

    pub fn bounding_box(&self) -> &Hyperrectangle {
        &self.bounding_box
    }

    pub fn value(&self) -> u32 {
        self.value
    }

    /// `[bbox_len:i32][bbox][value:i32]`
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        let bbox = self.bounding_box.to_bytes();
        writer
            .write_i32::<BigEndian>(bbox.len() as i32)
            .and_then(|_| writer.write_all(&bbox))
            .and_then(|_| writer.write_u32::<BigEndian>(self.value))
            .map_err(|e| Error::Encode("spatial index entry", e))
    }

    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let bbox_len = reader
            .read_i32::<BigEndian>()
            .map_err(|e| Error::Decode("spatial entry bbox length", e))?;
        if bbox_len < 0 {
            return Err(Error::IndexCorruption(format!(
                "Negative bounding box length {}",
                bbox_len
            )));
        }

        let mut bbox = vec![0u8; bbox_len as usize];
        reader
            .read_exact(&mut bbox)
            .map_err(|e| Error::Decode("spatial entry bbox", e))?;
        let value = reader
            .read_u32::<BigEndian>()
            .map_err(|e| Error::Decode("spatial entry value", e))?;

        Ok(Self::new(Hyperrectangle::from_bytes(&bbox)?, value))
    }
}

/// Builds a spatial index in memory and persists it.
pub trait SpatialIndexBuilder {
    /// Inserts all entries of a materialized list.
    fn bulk_insert(&mut self, entries: Vec<SpatialIndexEntry>) -> Result<()>;

    fn insert(&mut self, entry: SpatialIndexEntry) -> Result<()>;

    /// Entries whose box intersects `region`, empty for an empty tree.
    fn get_entries_for_region(&self, region: &Hyperrectangle) -> Vec<SpatialIndexEntry>;

    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()>;
}

/// Read access to a persisted spatial index.
pub trait SpatialIndexReader: Send + Sync {
    /// Entries whose box intersects `region`, empty for an empty tree.
    fn get_entries_for_region(&self, region: &Hyperrectangle) -> Result<Vec<SpatialIndexEntry>>;

    fn max_node_size(&self) -> usize;
}
