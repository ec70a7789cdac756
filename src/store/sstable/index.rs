//! Random access into a run through its key index.
//!
//! The key index holds one big-endian `u32` data file offset per tuple, in
//! data file order. Since the data file is sorted by key, a binary search
//! over the index finds any key in `O(log n)` probes. Probed keys are kept in
//! a small cache as the upper levels of the search hit the same entries over
//! and over.

use std::cmp::Ordering;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use byteorder::{BigEndian, ByteOrder};

use super::{DATA_MAGIC, KEY_INDEX_MAGIC};
use crate::cache::Cache;
use crate::encoding::{decode_key, decode_tuple};
use crate::entity::Tuple;
use crate::error::Result;
use crate::Error;

/// Checks the magic bytes at the start of a run file.
pub(crate) fn check_magic<R: Read>(reader: &mut R, magic: &[u8], what: &'static str) -> Result<()> {
    let mut header = vec![0u8; magic.len()];
    reader
        .read_exact(&mut header)
        .map_err(|e| Error::Decode(what, e))?;
    if header != magic {
        return Err(Error::InvalidHeader(what));
    }
    Ok(())
}

/// Point reads on a data file.
#[derive(Debug)]
pub struct DataReader {
    path: PathBuf,
    size: u64,
    file: Mutex<BufReader<File>>,
}

impl DataReader {
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = BufReader::new(File::open(path)?);
        check_magic(&mut file, DATA_MAGIC, "data file")?;
        let size = file.get_ref().metadata()?.len();

        Ok(Self {
            path: path.to_path_buf(),
            size,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    fn with_reader<T>(
        &self,
        offset: u32,
        f: impl FnOnce(&mut BufReader<File>) -> Result<T>,
    ) -> Result<T> {
        if (offset as usize) < DATA_MAGIC.len() || offset as u64 >= self.size {
            return Err(Error::IndexCorruption(format!(
                "Offset {} outside of {}",
                offset,
                self.path.display()
            )));
        }

        let mut file = self
            .file
            .lock()
            .map_err(|_| Error::InvalidState("Data reader lock poisoned".to_string()))?;
        file.seek(SeekFrom::Start(offset as u64))?;
        f(&mut file)
    }

    pub fn read_tuple_at(&self, offset: u32) -> Result<Tuple> {
        self.with_reader(offset, |reader| {
            decode_tuple(reader)?.ok_or_else(|| {
                Error::IndexCorruption(format!("No tuple at offset {}", offset))
            })
        })
    }

    pub fn read_key_at(&self, offset: u32) -> Result<String> {
        self.with_reader(offset, |reader| decode_key(reader))
    }
}

/// Position of a key relative to the keys of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Probe {
    Found(usize),
    BelowRange,
    AboveRange,
    Missing,
}

#[derive(Debug)]
pub struct KeyIndexReader {
    offsets: Vec<u32>,
    data: DataReader,
    key_cache: Option<Mutex<Cache<u32, String>>>,
}

impl KeyIndexReader {
    /// Loads the key index of `data`. Every offset must point into the data
    /// file.
    pub fn open(path: &Path, data: DataReader, key_cache_size: usize) -> Result<Self> {
        let mut bytes = Vec::new();
        BufReader::new(File::open(path)?).read_to_end(&mut bytes)?;
        check_magic(&mut bytes.as_slice(), KEY_INDEX_MAGIC, "key index")?;

        let body = &bytes[KEY_INDEX_MAGIC.len()..];
        if body.len() % 4 != 0 {
            return Err(Error::IndexCorruption(format!(
                "Key index {} has a trailing partial entry",
                path.display()
            )));
        }

        let offsets: Vec<u32> = body.chunks_exact(4).map(BigEndian::read_u32).collect();
        if let Some(bad) = offsets
            .iter()
            .find(|o| (**o as usize) < DATA_MAGIC.len() || **o as u64 >= data.size())
        {
            return Err(Error::IndexCorruption(format!(
                "Key index {} points to offset {} outside of the data file",
                path.display(),
                bad
            )));
        }

        let key_cache = (key_cache_size > 0).then(|| Mutex::new(Cache::new(key_cache_size)));

        Ok(Self {
            offsets,
            data,
            key_cache,
        })
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn data(&self) -> &DataReader {
        &self.data
    }

    /// Data file offset of index entry `entry`.
    pub fn offset(&self, entry: u32) -> Result<u32> {
        self.offsets.get(entry as usize).copied().ok_or_else(|| {
            Error::IndexCorruption(format!(
                "Entry {} beyond key index of {} entries",
                entry,
                self.offsets.len()
            ))
        })
    }

    pub fn tuple_at(&self, entry: u32) -> Result<Tuple> {
        self.data.read_tuple_at(self.offset(entry)?)
    }

    pub fn key_at(&self, entry: u32) -> Result<String> {
        if let Some(cache) = &self.key_cache {
            let mut cache = cache
                .lock()
                .map_err(|_| Error::InvalidState("Key cache lock poisoned".to_string()))?;
            if let Some(key) = cache.get(&entry) {
                return Ok(key);
            }
            let key = self.data.read_key_at(self.offset(entry)?)?;
            cache.insert(entry, key.clone());
            return Ok(key);
        }

        self.data.read_key_at(self.offset(entry)?)
    }

    /// (hits, misses) of the key cache.
    pub fn cache_stats(&self) -> (usize, usize) {
        self.key_cache
            .as_ref()
            .and_then(|c| c.lock().ok().map(|c| c.stats()))
            .unwrap_or_default()
    }

    fn compare_at(&self, key: &str, entry: usize) -> Result<Ordering> {
        Ok(key.cmp(self.key_at(entry as u32)?.as_str()))
    }

    fn probe(&self, key: &str) -> Result<Probe> {
        let Some(last) = self.offsets.len().checked_sub(1) else {
            return Ok(Probe::Missing);
        };

        match self.compare_at(key, 0)? {
            Ordering::Less => return Ok(Probe::BelowRange),
            Ordering::Equal => return Ok(Probe::Found(0)),
            Ordering::Greater => {}
        }
        match self.compare_at(key, last)? {
            Ordering::Greater => return Ok(Probe::AboveRange),
            Ordering::Equal => return Ok(Probe::Found(last)),
            Ordering::Less => {}
        }

        // key(low) < key < key(high)
        let (mut low, mut high) = (0, last);
        while high - low > 1 {
            let mid = low + (high - low) / 2;
            match self.compare_at(key, mid)? {
                Ordering::Equal => return Ok(Probe::Found(mid)),
                Ordering::Less => high = mid,
                Ordering::Greater => low = mid,
            }
        }

        Ok(Probe::Missing)
    }

    /// Index entry of some version of `key`.
    pub fn position_of(&self, key: &str) -> Result<Option<u32>> {
        Ok(match self.probe(key)? {
            Probe::Found(entry) => Some(entry as u32),
            Probe::BelowRange | Probe::AboveRange | Probe::Missing => None,
        })
    }

    /// Index entries of all versions of `key`. Versions are stored next to
    /// each other, newest first.
    pub fn positions_of(&self, key: &str) -> Result<std::ops::Range<u32>> {
        let Some(found) = self.position_of(key)? else {
            return Ok(0..0);
        };

        let mut first = found;
        while first > 0 && self.key_at(first - 1)? == key {
            first -= 1;
        }

        let mut end = found + 1;
        while (end as usize) < self.offsets.len() && self.key_at(end)? == key {
            end += 1;
        }

        Ok(first..end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TupleStoreConfig;
    use crate::entity::{Hyperrectangle, TableName};
    use crate::store::sstable::{RunFiles, SSTableWriter};
    use crate::tmpfs::TempDir;

    fn write_run(dir: &TempDir, tuples: &[Tuple]) -> RunFiles {
        let files = RunFiles::new(dir.path(), TableName::new("test", "index").unwrap(), 1);
        let mut writer = SSTableWriter::create(
            files.clone(),
            tuples.len(),
            TupleStoreConfig::default().spatial_index_node_size,
            0.01,
        )
        .unwrap();
        for tuple in tuples {
            writer.add_tuple(tuple).unwrap();
        }
        writer.finish().unwrap()
    }

    fn open_index(files: &RunFiles, cache: usize) -> KeyIndexReader {
        let data = DataReader::open(&files.data()).unwrap();
        KeyIndexReader::open(&files.key_index(), data, cache).unwrap()
    }

    fn tuple(key: &str, version: u64) -> Tuple {
        Tuple::with_received_timestamp(
            key,
            Hyperrectangle::new(vec![0.0, 1.0]).unwrap(),
            key.as_bytes().to_vec(),
            version,
            version,
        )
    }

    #[test]
    fn test_search_positions() {
        let dir = TempDir::new().unwrap();
        let tuples: Vec<_> = ["b", "d", "f", "h"].iter().map(|k| tuple(k, 1)).collect();
        let files = write_run(&dir, &tuples);
        let index = open_index(&files, 10);

        assert_eq!(index.len(), 4);
        assert_eq!(index.probe("a").unwrap(), Probe::BelowRange);
        assert_eq!(index.probe("b").unwrap(), Probe::Found(0));
        assert_eq!(index.probe("c").unwrap(), Probe::Missing);
        assert_eq!(index.probe("f").unwrap(), Probe::Found(2));
        assert_eq!(index.probe("h").unwrap(), Probe::Found(3));
        assert_eq!(index.probe("z").unwrap(), Probe::AboveRange);

        assert_eq!(index.tuple_at(1).unwrap(), tuples[1]);
        assert!(index.tuple_at(4).is_err());
        assert!(format!("{:?}", index).contains("capacity: 10"));
    }

    #[test]
    fn test_randomized_lookup() {
        let dir = TempDir::new().unwrap();

        let mut state = 0x5eed_u64;
        let mut keys: Vec<String> = (0..1500)
            .map(|_| {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                format!("key{:020}", state >> 11)
            })
            .collect();
        keys.sort();
        keys.dedup();

        // Every other key is stored, the rest must be reported missing
        let stored: Vec<_> = keys.iter().step_by(2).map(|k| tuple(k, 1)).collect();
        let files = write_run(&dir, &stored);
        let index = open_index(&files, 100);

        for (i, key) in keys.iter().enumerate() {
            let position = index.position_of(key).unwrap();
            if i % 2 == 0 {
                let entry = position.expect("stored key not found");
                assert_eq!(index.tuple_at(entry).unwrap().key(), key);
                assert_eq!(entry as usize, i / 2);
            } else {
                assert_eq!(position, None);
            }
        }

        let (hits, _) = index.cache_stats();
        assert!(hits > 0);
    }

    #[test]
    fn test_versions_are_adjacent() {
        let dir = TempDir::new().unwrap();
        let tuples = vec![
            tuple("a", 1),
            tuple("k", 30),
            tuple("k", 20),
            tuple("k", 10),
            tuple("z", 1),
        ];
        let files = write_run(&dir, &tuples);

        for cache in [0, 10] {
            let index = open_index(&files, cache);
            assert_eq!(index.positions_of("k").unwrap(), 1..4);
            assert_eq!(index.positions_of("a").unwrap(), 0..1);
            assert_eq!(index.positions_of("z").unwrap(), 4..5);
            assert!(index.positions_of("m").unwrap().is_empty());
        }
    }

    #[test]
    fn test_empty_index() {
        let dir = TempDir::new().unwrap();
        let files = write_run(&dir, &[]);
        let index = open_index(&files, 10);
        assert!(index.is_empty());
        assert_eq!(index.position_of("a").unwrap(), None);
    }

    #[test]
    fn test_corrupted_index() {
        let dir = TempDir::new().unwrap();
        let files = write_run(&dir, &[tuple("a", 1), tuple("b", 1)]);

        let mut bytes = std::fs::read(files.key_index()).unwrap();
        bytes.push(0);
        std::fs::write(files.key_index(), &bytes).unwrap();
        let data = DataReader::open(&files.data()).unwrap();
        assert!(matches!(
            KeyIndexReader::open(&files.key_index(), data, 0),
            Err(Error::IndexCorruption(_))
        ));

        bytes.pop();
        let last = bytes.len() - 4;
        bytes[last..].copy_from_slice(&u32::MAX.to_be_bytes());
        std::fs::write(files.key_index(), &bytes).unwrap();
        let data = DataReader::open(&files.data()).unwrap();
        assert!(matches!(
            KeyIndexReader::open(&files.key_index(), data, 0),
            Err(Error::IndexCorruption(_))
        ));
    }

    #[test]
    fn test_bad_magic() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.sst");
        std::fs::write(&path, b"not a data file").unwrap();
        assert!(matches!(
            DataReader::open(&path),
            Err(Error::InvalidHeader(_))
        ));
    }
}
