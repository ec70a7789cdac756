//! An opened, immutable sorted run.
//!
//! Runs are shared between readers and the compactor. Readers acquire a run
//! before touching it and release it afterwards. A run replaced by a merge
//! is marked for deletion and its files are removed once the last reader
//! released it.

use std::fs::{self, File};
use std::io::{BufReader, Seek, SeekFrom};
use std::sync::Mutex;
use std::time::SystemTime;

use super::index::check_magic;
use super::{DataReader, KeyFilter, KeyIndexReader, RunFiles, RunMetadata, DATA_MAGIC};
use crate::config::{SpatialIndexReadMode, StorageConfig};
use crate::encoding::decode_tuple;
use crate::entity::{Hyperrectangle, TableName, Tuple};
use crate::error::Result;
use crate::spatial::rtree::{RTreeFileReader, RTreeMemoryReader};
use crate::spatial::SpatialIndexReader;
use crate::store::predicate::{OverlapsBoundingBoxPredicate, PredicateFilterIterator};
use crate::Error;

#[derive(Debug, Default)]
struct Lifecycle {
    usage: usize,
    delete_pending: bool,
    deleted: bool,
}

pub struct SortedRun {
    files: RunFiles,
    metadata: RunMetadata,
    index: KeyIndexReader,
    spatial: Box<dyn SpatialIndexReader>,
    bloom: Option<KeyFilter>,
    size: u64,
    last_modified: SystemTime,
    lifecycle: Mutex<Lifecycle>,
}

impl std::fmt::Debug for SortedRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SortedRun")
            .field("table", self.files.table())
            .field("generation", &self.files.generation())
            .field("tuples", &self.metadata.tuples)
            .field("size", &self.size)
            .finish()
    }
}

impl SortedRun {
    /// Opens a complete run. Fails if the metadata is missing, a missing
    /// bloom filter only disables key filtering.
    pub fn open(files: RunFiles, config: &StorageConfig) -> Result<Self> {
        let metadata = RunMetadata::read_from_file(&files.meta())?;

        let data = DataReader::open(&files.data())?;
        let index = KeyIndexReader::open(&files.key_index(), data, config.key_cache_size)?;
        if index.len() as u64 != metadata.tuples {
            return Err(Error::IndexCorruption(format!(
                "Key index of run {} holds {} entries, metadata {}",
                files.generation(),
                index.len(),
                metadata.tuples
            )));
        }

        let spatial: Box<dyn SpatialIndexReader> = match config.spatial_index_read_mode {
            SpatialIndexReadMode::Memory => {
                Box::new(RTreeMemoryReader::open(&files.spatial_index())?)
            }
            SpatialIndexReadMode::OnDemand => {
                Box::new(RTreeFileReader::open(&files.spatial_index())?)
            }
        };

        let bloom = KeyFilter::read_from_file(&files.bloom())?;
        if bloom.is_none() {
            tracing::warn!(
                table = %files.table(),
                generation = files.generation(),
                "Bloom filter missing, key lookups read the index"
            );
        }

        let mut size = 0;
        for path in files.all() {
            if let Ok(meta) = fs::metadata(&path) {
                size += meta.len();
            }
        }
        let last_modified = fs::metadata(files.data())?.modified()?;

        Ok(Self {
            files,
            metadata,
            index,
            spatial,
            bloom,
            size,
            last_modified,
            lifecycle: Mutex::new(Lifecycle::default()),
        })
    }

    pub fn files(&self) -> &RunFiles {
        &self.files
    }

    pub fn table(&self) -> &TableName {
        self.files.table()
    }

    pub fn generation(&self) -> u64 {
        self.files.generation()
    }

    pub fn metadata(&self) -> &RunMetadata {
        &self.metadata
    }

    pub fn tuple_count(&self) -> u64 {
        self.metadata.tuples
    }

    /// Combined size of all run files in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Modification time of the data file.
    pub fn last_modified(&self) -> SystemTime {
        self.last_modified
    }

    pub fn newest_version_timestamp(&self) -> u64 {
        self.metadata.newest_version_timestamp
    }

    pub fn oldest_version_timestamp(&self) -> u64 {
        self.metadata.oldest_version_timestamp
    }

    pub fn key_cache_stats(&self) -> (usize, usize) {
        self.index.cache_stats()
    }

    fn lifecycle(&self) -> std::sync::MutexGuard<'_, Lifecycle> {
        // The lifecycle holds plain counters, a poisoned lock leaves them usable
        self.lifecycle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers a reader. Returns false once the run is marked for deletion.
    pub fn acquire(&self) -> bool {
        let mut lifecycle = self.lifecycle();
        if lifecycle.delete_pending || lifecycle.deleted {
            return false;
        }
        lifecycle.usage += 1;
        true
    }

    /// Unregisters a reader. The last release of a run marked for deletion
    /// removes its files.
    pub fn release(&self) {
        let delete = {
            let mut lifecycle = self.lifecycle();
            if lifecycle.usage == 0 {
                tracing::warn!(
                    table = %self.table(),
                    generation = self.generation(),
                    "Release of a run that is not acquired"
                );
                return;
            }
            lifecycle.usage -= 1;
            Self::take_deletion(&mut lifecycle)
        };

        if delete {
            self.delete_files();
        }
    }

    /// Marks the run for deletion. New acquisitions fail from now on.
    pub fn delete_on_release(&self) {
        let delete = {
            let mut lifecycle = self.lifecycle();
            lifecycle.delete_pending = true;
            Self::take_deletion(&mut lifecycle)
        };

        if delete {
            self.delete_files();
        }
    }

    fn take_deletion(lifecycle: &mut Lifecycle) -> bool {
        if lifecycle.usage == 0 && lifecycle.delete_pending && !lifecycle.deleted {
            lifecycle.deleted = true;
            return true;
        }
        false
    }

    pub fn usage(&self) -> usize {
        self.lifecycle().usage
    }

    pub fn is_deleted(&self) -> bool {
        self.lifecycle().deleted
    }

    fn delete_files(&self) {
        match self.files.delete() {
            Ok(()) => tracing::info!(
                table = %self.table(),
                generation = self.generation(),
                "Deleted sorted run"
            ),
            Err(e) => tracing::warn!(
                table = %self.table(),
                generation = self.generation(),
                error = %e,
                "Failed to delete sorted run"
            ),
        }
    }

    fn might_contain(&self, key: &str) -> bool {
        self.bloom.as_ref().map_or(true, |b| b.might_contain(key))
    }

    /// Newest version of `key` stored in this run, tombstones included.
    pub fn get(&self, key: &str) -> Result<Option<Tuple>> {
        if !self.might_contain(key) {
            return Ok(None);
        }

        let range = self.index.positions_of(key)?;
        if range.is_empty() {
            return Ok(None);
        }
        self.index.tuple_at(range.start).map(Some)
    }

    /// All versions of `key` stored in this run, newest first.
    pub fn get_all_versions(&self, key: &str) -> Result<Vec<Tuple>> {
        if !self.might_contain(key) {
            return Ok(Vec::new());
        }

        self.index
            .positions_of(key)?
            .map(|entry| self.index.tuple_at(entry))
            .collect()
    }

    /// Tuple at key index position `entry`.
    pub fn tuple_at(&self, entry: u32) -> Result<Tuple> {
        self.index.tuple_at(entry)
    }

    /// Streams all tuples in run order through a separate file handle.
    pub fn iter(&self) -> Result<RunIterator> {
        let mut reader = BufReader::new(File::open(self.files.data())?);
        check_magic(&mut reader, DATA_MAGIC, "data file")?;
        Ok(RunIterator {
            reader,
            remaining: self.metadata.tuples,
        })
    }

    /// Tuples whose bounding box intersects `region`, in data file order.
    /// Tombstones have no extent and are not returned.
    pub fn get_all_tuples_in_bbox(&self, region: &Hyperrectangle) -> Result<RegionIterator> {
        let mut offsets = self
            .spatial
            .get_entries_for_region(region)?
            .iter()
            .map(|entry| self.index.offset(entry.value()))
            .collect::<Result<Vec<_>>>()?;
        offsets.sort_unstable();
        offsets.dedup();

        let candidates = CandidateIterator {
            reader: BufReader::new(File::open(self.files.data())?),
            offsets: offsets.into_iter(),
        };
        Ok(PredicateFilterIterator::new(
            candidates,
            OverlapsBoundingBoxPredicate(region.clone()),
        ))
    }
}

/// Sequential scan of a run.
pub struct RunIterator {
    reader: BufReader<File>,
    remaining: u64,
}

impl Iterator for RunIterator {
    type Item = Result<Tuple>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }

        match decode_tuple(&mut self.reader) {
            Ok(Some(tuple)) => {
                self.remaining -= 1;
                Some(Ok(tuple))
            }
            Ok(None) => {
                let remaining = std::mem::take(&mut self.remaining);
                Some(Err(Error::IndexCorruption(format!(
                    "Data file ended with {} tuples missing",
                    remaining
                ))))
            }
            Err(e) => {
                self.remaining = 0;
                Some(Err(e))
            }
        }
    }
}

/// Tuples of a run found through its spatial index. The index works on
/// covering boxes, so every candidate is checked against the query region
/// again after decoding.
pub type RegionIterator = PredicateFilterIterator<CandidateIterator, OverlapsBoundingBoxPredicate>;

/// Decodes the tuples at the offsets the spatial index returned.
pub struct CandidateIterator {
    reader: BufReader<File>,
    offsets: std::vec::IntoIter<u32>,
}

impl CandidateIterator {
    fn read_at(&mut self, offset: u32) -> Result<Tuple> {
        self.reader.seek(SeekFrom::Start(offset as u64))?;
        decode_tuple(&mut self.reader)?
            .ok_or_else(|| Error::IndexCorruption(format!("No tuple at offset {}", offset)))
    }
}

impl Iterator for CandidateIterator {
    type Item = Result<Tuple>;

    fn next(&mut self) -> Option<Self::Item> {
        let offset = self.offsets.next()?;
        match self.read_at(offset) {
            Ok(tuple) => Some(Ok(tuple)),
            Err(e) => {
                self.offsets = Vec::new().into_iter();
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::store::sstable::SSTableWriter;
    use crate::tmpfs::TempDir;

    pub(crate) fn write_run(
        dir: &std::path::Path,
        table: &TableName,
        generation: u64,
        tuples: &[Tuple],
    ) -> RunFiles {
        let mut sorted = tuples.to_vec();
        sorted.sort();

        let files = RunFiles::new(dir, table.clone(), generation);
        let mut writer = SSTableWriter::create(files, sorted.len(), 4, 0.01).unwrap();
        for tuple in &sorted {
            writer.add_tuple(tuple).unwrap();
        }
        writer.finish().unwrap()
    }

    fn table() -> TableName {
        TableName::new("test", "run").unwrap()
    }

    fn point(key: &str, x: f64, y: f64, version: u64) -> Tuple {
        Tuple::with_received_timestamp(
            key,
            Hyperrectangle::new(vec![x, x + 1.0, y, y + 1.0]).unwrap(),
            format!("{}@{}", key, version).into_bytes(),
            version,
            version,
        )
    }

    fn open(dir: &TempDir, tuples: &[Tuple], mode: SpatialIndexReadMode) -> SortedRun {
        let files = write_run(dir.path(), &table(), 1, tuples);
        let config = StorageConfig::new(dir.path()).spatial_index_read_mode(mode);
        SortedRun::open(files, &config).unwrap()
    }

    #[test]
    fn test_point_reads() {
        let dir = TempDir::new().unwrap();
        let tuples = vec![
            point("a", 0.0, 0.0, 1),
            point("b", 1.0, 1.0, 10),
            point("b", 1.0, 1.0, 20),
            Tuple::tombstone_received_at("c", 5, 5),
        ];
        let run = open(&dir, &tuples, SpatialIndexReadMode::Memory);

        assert_eq!(run.tuple_count(), 4);
        assert_eq!(run.newest_version_timestamp(), 20);
        assert_eq!(run.oldest_version_timestamp(), 1);
        assert!(run.size() > 0);

        assert_eq!(run.get("b").unwrap().unwrap().version_timestamp(), 20);
        let versions: Vec<_> = run
            .get_all_versions("b")
            .unwrap()
            .iter()
            .map(Tuple::version_timestamp)
            .collect();
        assert_eq!(versions, vec![20, 10]);

        assert!(run.get("c").unwrap().unwrap().is_tombstone());
        assert!(run.get("zz").unwrap().is_none());
        assert_eq!(run.tuple_at(0).unwrap().key(), "a");
    }

    #[test]
    fn test_iter_in_run_order() {
        let dir = TempDir::new().unwrap();
        let tuples = vec![
            point("c", 0.0, 0.0, 1),
            point("a", 0.0, 0.0, 1),
            point("b", 0.0, 0.0, 2),
            point("b", 0.0, 0.0, 3),
        ];
        let run = open(&dir, &tuples, SpatialIndexReadMode::Memory);

        let scanned: Vec<_> = run
            .iter()
            .unwrap()
            .map(|t| t.map(|t| (t.key().to_string(), t.version_timestamp())))
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(
            scanned,
            vec![
                ("a".to_string(), 1),
                ("b".to_string(), 3),
                ("b".to_string(), 2),
                ("c".to_string(), 1)
            ]
        );

        // Two iterators do not share a file position
        let mut first = run.iter().unwrap();
        let mut second = run.iter().unwrap();
        assert_eq!(first.next().unwrap().unwrap().key(), "a");
        assert_eq!(first.next().unwrap().unwrap().key(), "b");
        assert_eq!(second.next().unwrap().unwrap().key(), "a");
    }

    #[test]
    fn test_region_query_both_read_modes() {
        let tuples: Vec<_> = (0..50)
            .map(|i| point(&format!("k{:02}", i), i as f64, i as f64, 1))
            .chain(std::iter::once(Tuple::tombstone_received_at("k99", 2, 2)))
            .collect();

        for mode in [SpatialIndexReadMode::Memory, SpatialIndexReadMode::OnDemand] {
            let sub = TempDir::new().unwrap();
            let run = open(&sub, &tuples, mode);
            let region = Hyperrectangle::new(vec![10.5, 12.5, 10.5, 12.5]).unwrap();

            let keys: Vec<_> = run
                .get_all_tuples_in_bbox(&region)
                .unwrap()
                .map(|t| t.unwrap().key().to_string())
                .collect();
            assert_eq!(keys, vec!["k10", "k11", "k12"]);
        }
    }

    #[test]
    fn test_delete_on_release() {
        let dir = TempDir::new().unwrap();
        let run = open(&dir, &[point("a", 0.0, 0.0, 1)], SpatialIndexReadMode::Memory);

        assert!(run.acquire());
        assert!(run.acquire());
        run.delete_on_release();
        assert!(!run.acquire());
        assert!(run.files().meta().exists());

        run.release();
        assert!(run.files().meta().exists());
        run.release();
        assert!(run.is_deleted());
        assert!(!run.files().any_exists());

        // Unbalanced release is ignored
        run.release();
        assert_eq!(run.usage(), 0);
    }

    #[test]
    fn test_delete_unused_run_immediately() {
        let dir = TempDir::new().unwrap();
        let run = open(&dir, &[point("a", 0.0, 0.0, 1)], SpatialIndexReadMode::Memory);
        run.delete_on_release();
        assert!(run.is_deleted());
        assert!(!run.files().any_exists());
    }

    #[test]
    fn test_missing_files() {
        let dir = TempDir::new().unwrap();
        let files = write_run(dir.path(), &table(), 1, &[point("a", 0.0, 0.0, 1)]);
        let config = StorageConfig::new(dir.path());

        fs::remove_file(files.bloom()).unwrap();
        let run = SortedRun::open(files.clone(), &config).unwrap();
        assert!(run.get("a").unwrap().is_some());

        fs::remove_file(files.meta()).unwrap();
        assert!(SortedRun::open(files, &config).is_err());
    }

    #[test]
    fn test_concurrent_readers() {
        let dir = TempDir::new().unwrap();
        let tuples: Vec<_> = (0..200)
            .map(|i| point(&format!("key{:03}", i), 0.0, 0.0, i))
            .collect();
        let run = std::sync::Arc::new(open(&dir, &tuples, SpatialIndexReadMode::Memory));

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let run = run.clone();
                std::thread::spawn(move || {
                    assert!(run.acquire());
                    for i in (t..200).step_by(4) {
                        let key = format!("key{:03}", i);
                        assert_eq!(run.get(&key).unwrap().unwrap().key(), key);
                    }
                    assert_eq!(run.iter().unwrap().count(), 200);
                    run.release();
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(run.usage(), 0);
    }
}
