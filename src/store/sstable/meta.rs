//! Per-run metadata, computed once while the run is written.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::encoding::bincode;
use crate::entity::{Hyperrectangle, Tuple};
use crate::error::Result;
use crate::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub tuples: u64,
    pub oldest_version_timestamp: u64,
    pub newest_version_timestamp: u64,
    pub newest_received_timestamp: u64,
    pub dimensions: u32,
    /// Covering box of all tuples, flat `[low, high, ...]` bounds
    pub bounding_box: Vec<f64>,
}

impl Default for RunMetadata {
    fn default() -> Self {
        Self {
            tuples: 0,
            oldest_version_timestamp: u64::MAX,
            newest_version_timestamp: 0,
            newest_received_timestamp: 0,
            dimensions: 0,
            bounding_box: Vec::new(),
        }
    }
}

impl RunMetadata {
    pub fn bounding_box(&self) -> Result<Hyperrectangle> {
        Hyperrectangle::new(self.bounding_box.clone())
    }

    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        bincode::serialize_into(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }

    /// Reads the metadata of a run. A missing file is an error: a run
    /// without metadata was never completed.
    pub fn read_from_file(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                Error::InvalidState(format!("Missing run metadata {}", path.display()))
            }
            _ => Error::IoError(e),
        })?;
        bincode::deserialize_from(&mut BufReader::new(file))
    }
}

/// Accumulates metadata tuple by tuple.
#[derive(Debug, Default)]
pub struct MetadataBuilder {
    metadata: RunMetadata,
    covering: Hyperrectangle,
}

impl MetadataBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_tuple(&mut self, tuple: &Tuple) -> Result<()> {
        let meta = &mut self.metadata;
        meta.tuples += 1;
        let version = tuple.version_timestamp();
        meta.oldest_version_timestamp = meta.oldest_version_timestamp.min(version);
        meta.newest_version_timestamp = meta.newest_version_timestamp.max(version);
        meta.newest_received_timestamp = meta
            .newest_received_timestamp
            .max(tuple.received_timestamp());

        if !tuple.bounding_box().is_full_space() {
            self.covering = Hyperrectangle::covering_box([&self.covering, tuple.bounding_box()])?;
        }
        Ok(())
    }

    pub fn build(mut self) -> RunMetadata {
        self.metadata.dimensions = self.covering.dimension() as u32;
        self.metadata.bounding_box = self.covering.bounds().to_vec();
        self.metadata
    }
}
