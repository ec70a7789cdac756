//! Sorted runs on disk.
//!
//! A run is written once and never modified. It consists of five files in
//! the table directory, all sharing the prefix `sstable_<table>_<generation>`:
//!
//! ```text
//! .sst   data file       magic + tuples sorted by key, newest version first
//! .idx   key index       magic + one u32 data file offset per tuple
//! .sidx  spatial index   R-tree mapping bounding boxes to key index entries
//! .blm   bloom filter    over all keys of the run
//! .meta  metadata        tuple count, timestamps and covering box
//! ```
//!
//! The metadata file is written last. A run without it is incomplete and is
//! removed on recovery.

pub mod bloom;
pub mod index;
pub mod meta;
pub mod run;
pub mod writer;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub use bloom::KeyFilter;
pub use index::{DataReader, KeyIndexReader};
pub use meta::{MetadataBuilder, RunMetadata};
pub use run::{CandidateIterator, RegionIterator, RunIterator, SortedRun};
pub use writer::SSTableWriter;

use crate::entity::TableName;
use crate::error::Result;

pub const DATA_MAGIC: &[u8] = b"boxdb-sst";
pub const KEY_INDEX_MAGIC: &[u8] = b"boxdb-idx";

const FILE_PREFIX: &str = "sstable_";

pub const DATA_SUFFIX: &str = "sst";
pub const KEY_INDEX_SUFFIX: &str = "idx";
pub const SPATIAL_INDEX_SUFFIX: &str = "sidx";
pub const BLOOM_SUFFIX: &str = "blm";
pub const META_SUFFIX: &str = "meta";

/// Locates the files of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunFiles {
    dir: PathBuf,
    table: TableName,
    generation: u64,
}

impl RunFiles {
    pub fn new(dir: impl Into<PathBuf>, table: TableName, generation: u64) -> Self {
        Self {
            dir: dir.into(),
            table,
            generation,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn table(&self) -> &TableName {
        &self.table
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn path(&self, suffix: &str) -> PathBuf {
        self.dir.join(format!(
            "{}{}_{}.{}",
            FILE_PREFIX,
            self.table.fullname(),
            self.generation,
            suffix
        ))
    }

    pub fn data(&self) -> PathBuf {
        self.path(DATA_SUFFIX)
    }

    pub fn key_index(&self) -> PathBuf {
        self.path(KEY_INDEX_SUFFIX)
    }

    pub fn spatial_index(&self) -> PathBuf {
        self.path(SPATIAL_INDEX_SUFFIX)
    }

    pub fn bloom(&self) -> PathBuf {
        self.path(BLOOM_SUFFIX)
    }

    pub fn meta(&self) -> PathBuf {
        self.path(META_SUFFIX)
    }

    pub fn all(&self) -> [PathBuf; 5] {
        [
            self.data(),
            self.key_index(),
            self.spatial_index(),
            self.bloom(),
            self.meta(),
        ]
    }

    pub fn any_exists(&self) -> bool {
        self.all().iter().any(|p| p.exists())
    }

    /// Removes every file of the run. Missing files are ignored.
    pub fn delete(&self) -> Result<()> {
        for path in self.all() {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

/// Extracts the generation from a run file name of `table`, e.g.
/// `sstable_group_points_12.meta` gives `(12, "meta")`.
pub fn parse_file_name<'a>(table: &TableName, name: &'a str) -> Option<(u64, &'a str)> {
    let prefix = format!("{}{}_", FILE_PREFIX, table.fullname());
    let rest = name.strip_prefix(prefix.as_str())?;
    let (generation, suffix) = rest.split_once('.')?;
    Some((generation.parse().ok()?, suffix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    fn table() -> TableName {
        TableName::new("group", "points").unwrap()
    }

    #[test]
    fn test_file_names() {
        let files = RunFiles::new("/data/group_points", table(), 7);
        assert_eq!(
            files.data(),
            PathBuf::from("/data/group_points/sstable_group_points_7.sst")
        );
        assert_eq!(
            files.meta(),
            PathBuf::from("/data/group_points/sstable_group_points_7.meta")
        );
        assert_eq!(files.all().len(), 5);
    }

    #[test]
    fn test_parse_file_name() {
        let table = table();
        assert_eq!(
            parse_file_name(&table, "sstable_group_points_12.meta"),
            Some((12, "meta"))
        );
        assert_eq!(
            parse_file_name(&table, "sstable_group_points_3.sidx"),
            Some((3, "sidx"))
        );
        assert_eq!(parse_file_name(&table, "sstable_group_other_3.sst"), None);
        assert_eq!(parse_file_name(&table, "sstable_group_points_x.sst"), None);
        assert_eq!(parse_file_name(&table, "LOCK"), None);

        let region = TableName::new("group", "points").unwrap().with_region(4);
        assert_eq!(
            parse_file_name(&region, "sstable_group_points_4_9.idx"),
            Some((9, "idx"))
        );
    }

    #[test]
    fn test_delete_ignores_missing_files() {
        let dir = TempDir::new().unwrap();
        let files = RunFiles::new(dir.path(), table(), 1);
        assert!(!files.any_exists());

        fs::write(files.data(), b"x").unwrap();
        fs::write(files.meta(), b"x").unwrap();
        assert!(files.any_exists());

        files.delete().unwrap();
        assert!(!files.any_exists());
        files.delete().unwrap();
    }
}
