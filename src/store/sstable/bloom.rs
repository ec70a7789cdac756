use std::fs;
use std::io;
use std::path::Path;

use bloomfilter::Bloom;

use crate::error::Result;
use crate::Error;

/// Bloom filter over the keys of one run.
pub struct KeyFilter {
    bloom: Bloom<str>,
}

impl std::fmt::Debug for KeyFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyFilter")
            .field("bytes", &self.bloom.as_slice().len())
            .finish()
    }
}

impl KeyFilter {
    pub fn new(expected_keys: usize, false_positive_rate: f64) -> Result<Self> {
        let bloom = Bloom::new_for_fp_rate(expected_keys.max(1), false_positive_rate)
            .map_err(|e| Error::InvalidConfiguration(format!("Bloom filter: {}", e)))?;
        Ok(Self { bloom })
    }

    pub fn insert(&mut self, key: &str) {
        self.bloom.set(key);
    }

    /// False means the key is certainly absent.
    pub fn might_contain(&self, key: &str) -> bool {
        self.bloom.check(key)
    }

    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        fs::write(path, self.bloom.as_slice())?;
        Ok(())
    }

    /// Loads a filter, `None` if the file does not exist.
    pub fn read_from_file(path: &Path) -> Result<Option<Self>> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let bloom = Bloom::from_slice(&bytes).map_err(|e| {
            Error::InvalidData(format!("Bloom filter {}: {}", path.display(), e))
        })?;
        Ok(Some(Self { bloom }))
    }
}
