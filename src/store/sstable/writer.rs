use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use byteorder::{BigEndian, WriteBytesExt};

use super::{KeyFilter, MetadataBuilder, RunFiles, DATA_MAGIC, KEY_INDEX_MAGIC};
use crate::encoding::{encode_tuple, encoded_len};
use crate::entity::Tuple;
use crate::error::Result;
use crate::spatial::rtree::RTreeBuilder;
use crate::spatial::{SpatialIndexBuilder, SpatialIndexEntry};
use crate::Error;

/// Writes a new sorted run. Tuples must be added in run order: key
/// ascending, newer versions of a key first.
///
/// Files of a writer that is dropped before [`SSTableWriter::finish`]
/// succeeded are removed again.
pub struct SSTableWriter {
    files: RunFiles,
    data: BufWriter<File>,
    index: BufWriter<File>,
    written_bytes: u64,
    tuples: u32,
    last: Option<(String, u64)>,
    metadata: MetadataBuilder,
    bloom: KeyFilter,
    spatial_entries: Vec<SpatialIndexEntry>,
    node_size: i32,
    finished: bool,
}

fn create_new(path: &Path) -> Result<BufWriter<File>> {
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::AlreadyExists => {
                Error::InvalidOperation(format!("Run file {} already exists", path.display()))
            }
            _ => Error::IoError(e),
        })?;
    Ok(BufWriter::new(file))
}

impl SSTableWriter {
    /// Creates the data and key index files. Existing files are never
    /// overwritten.
    pub fn create(
        files: RunFiles,
        expected_tuples: usize,
        node_size: i32,
        bloom_false_positive_rate: f64,
    ) -> Result<Self> {
        if files.any_exists() {
            return Err(Error::InvalidOperation(format!(
                "Run {} of table {} already exists",
                files.generation(),
                files.table()
            )));
        }

        // Validate before touching the file system
        RTreeBuilder::new(node_size)?;
        let bloom = KeyFilter::new(expected_tuples, bloom_false_positive_rate)?;

        let data = create_new(&files.data())?;
        let index = match create_new(&files.key_index()) {
            Ok(index) => index,
            Err(e) => {
                let _ = std::fs::remove_file(files.data());
                return Err(e);
            }
        };

        let mut writer = Self {
            files,
            data,
            index,
            written_bytes: 0,
            tuples: 0,
            last: None,
            metadata: MetadataBuilder::new(),
            bloom,
            spatial_entries: Vec::with_capacity(expected_tuples),
            node_size,
            finished: false,
        };

        writer
            .data
            .write_all(DATA_MAGIC)
            .and_then(|_| writer.index.write_all(KEY_INDEX_MAGIC))
            .map_err(|e| Error::Encode("run header", e))?;
        writer.written_bytes = DATA_MAGIC.len() as u64;

        Ok(writer)
    }

    pub fn files(&self) -> &RunFiles {
        &self.files
    }

    /// Bytes written to the data file so far.
    pub fn written_bytes(&self) -> u64 {
        self.written_bytes
    }

    pub fn tuple_count(&self) -> u32 {
        self.tuples
    }

    pub fn add_tuple(&mut self, tuple: &Tuple) -> Result<()> {
        if let Some((key, version)) = &self.last {
            let in_order = match key.as_str().cmp(tuple.key()) {
                std::cmp::Ordering::Less => true,
                std::cmp::Ordering::Equal => *version >= tuple.version_timestamp(),
                std::cmp::Ordering::Greater => false,
            };
            if !in_order {
                return Err(Error::InvalidOperation(format!(
                    "Tuple {} (version {}) added out of order after {} (version {})",
                    tuple.key(),
                    tuple.version_timestamp(),
                    key,
                    version
                )));
            }
        }

        let offset = u32::try_from(self.written_bytes).map_err(|_| {
            Error::InvalidOperation("Data file exceeds the addressable size".to_string())
        })?;

        self.index
            .write_u32::<BigEndian>(offset)
            .map_err(|e| Error::Encode("key index entry", e))?;
        encode_tuple(&mut self.data, tuple)?;
        self.written_bytes += encoded_len(tuple) as u64;

        self.metadata.add_tuple(tuple)?;
        self.bloom.insert(tuple.key());
        self.spatial_entries
            .push(SpatialIndexEntry::new(tuple.bounding_box().clone(), self.tuples));

        self.tuples += 1;
        self.last = Some((tuple.key().to_string(), tuple.version_timestamp()));
        Ok(())
    }

    /// Flushes the data and writes the spatial index, bloom filter and
    /// metadata. The run is complete once this returns.
    pub fn finish(mut self) -> Result<RunFiles> {
        self.data.flush()?;
        self.data.get_ref().sync_all()?;
        self.index.flush()?;
        self.index.get_ref().sync_all()?;

        let mut tree = RTreeBuilder::new(self.node_size)?;
        tree.bulk_insert(std::mem::take(&mut self.spatial_entries))?;
        let mut spatial = create_new(&self.files.spatial_index())?;
        tree.write_to(&mut spatial)?;
        spatial.flush()?;

        self.bloom.write_to_file(&self.files.bloom())?;

        let metadata = std::mem::take(&mut self.metadata).build();
        metadata.write_to_file(&self.files.meta())?;

        self.finished = true;
        tracing::debug!(
            table = %self.files.table(),
            generation = self.files.generation(),
            tuples = self.tuples,
            bytes = self.written_bytes,
            "Wrote sorted run"
        );
        Ok(self.files.clone())
    }
}

impl Drop for SSTableWriter {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(e) = self.files.delete() {
            tracing::warn!(
                table = %self.files.table(),
                generation = self.files.generation(),
                error = %e,
                "Failed to remove files of unfinished run"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Hyperrectangle, TableName};
    use crate::store::sstable::RunMetadata;
    use crate::tmpfs::TempDir;

    fn files(dir: &TempDir, generation: u64) -> RunFiles {
        RunFiles::new(dir.path(), TableName::new("test", "writer").unwrap(), generation)
    }

    fn tuple(key: &str, version: u64) -> Tuple {
        Tuple::with_received_timestamp(
            key,
            Hyperrectangle::new(vec![1.0, 2.0, 1.0, 2.0]).unwrap(),
            b"value".to_vec(),
            version,
            version,
        )
    }

    #[test]
    fn test_writes_all_files() {
        let dir = TempDir::new().unwrap();
        let mut writer = SSTableWriter::create(files(&dir, 1), 3, 4, 0.01).unwrap();
        writer.add_tuple(&tuple("a", 1)).unwrap();
        writer.add_tuple(&tuple("b", 5)).unwrap();
        writer.add_tuple(&tuple("b", 3)).unwrap();
        assert_eq!(writer.tuple_count(), 3);

        let expected_bytes = DATA_MAGIC.len() as u64 + 3 * encoded_len(&tuple("a", 1)) as u64;
        assert_eq!(writer.written_bytes(), expected_bytes);

        let files = writer.finish().unwrap();
        for path in files.all() {
            assert!(path.exists(), "{} missing", path.display());
        }
        assert_eq!(
            std::fs::metadata(files.data()).unwrap().len(),
            expected_bytes
        );

        let meta = RunMetadata::read_from_file(&files.meta()).unwrap();
        assert_eq!(meta.tuples, 3);
        assert_eq!(meta.newest_version_timestamp, 5);
    }

    #[test]
    fn test_refuses_to_overwrite() {
        let dir = TempDir::new().unwrap();
        let writer = SSTableWriter::create(files(&dir, 1), 1, 4, 0.01).unwrap();
        writer.finish().unwrap();

        assert!(matches!(
            SSTableWriter::create(files(&dir, 1), 1, 4, 0.01),
            Err(Error::InvalidOperation(_))
        ));
        // The existing run is untouched
        assert!(files(&dir, 1).meta().exists());
    }

    #[test]
    fn test_out_of_order_tuple() {
        let dir = TempDir::new().unwrap();
        let mut writer = SSTableWriter::create(files(&dir, 1), 2, 4, 0.01).unwrap();
        writer.add_tuple(&tuple("b", 1)).unwrap();
        assert!(writer.add_tuple(&tuple("a", 1)).is_err());

        writer.add_tuple(&tuple("c", 1)).unwrap();
        assert!(writer.add_tuple(&tuple("c", 2)).is_err());
    }

    #[test]
    fn test_unfinished_run_is_removed() {
        let dir = TempDir::new().unwrap();
        {
            let mut writer = SSTableWriter::create(files(&dir, 2), 1, 4, 0.01).unwrap();
            writer.add_tuple(&tuple("a", 1)).unwrap();
            assert!(files(&dir, 2).data().exists());
        }
        assert!(!files(&dir, 2).any_exists());
    }

    #[test]
    fn test_invalid_node_size() {
        let dir = TempDir::new().unwrap();
        assert!(SSTableWriter::create(files(&dir, 1), 1, 0, 0.01).is_err());
        assert!(!files(&dir, 1).any_exists());
    }
}
