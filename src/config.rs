use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for one storage location
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Directory holding one sub directory per table
    pub dir: PathBuf,

    /// Maximum size of a sorted run written by a merge (default: 256MB)
    pub max_run_size: u64,

    /// Cached key index probes per run, 0 disables the cache (default: 1000)
    pub key_cache_size: usize,

    /// Target false positive rate of the per-run bloom filter (default: 0.01)
    pub bloom_false_positive_rate: f64,

    /// How spatial indexes are read when a run is opened (default: Memory)
    pub spatial_index_read_mode: SpatialIndexReadMode,

    /// How often to log storage metrics (default: 60s)
    pub metrics_interval: Duration,

    /// Compaction configuration
    pub compaction: CompactionConfig,
}

/// Whether a run keeps its decoded R-tree in memory or re-reads it per query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpatialIndexReadMode {
    Memory,
    OnDemand,
}

#[derive(Debug, Clone)]
pub struct CompactionConfig {
    /// Delay between two compaction cycles (default: 30s)
    pub interval: Duration,

    /// Runs below this size are candidates for a minor merge (default: 32MB)
    pub small_run_threshold: u64,

    /// Minimum number of small runs before a minor merge starts (default: 2)
    pub min_runs_per_minor: usize,

    /// Maximum number of runs merged by one minor merge (default: 10)
    pub max_runs_per_minor: usize,

    /// A run above this size may trigger a major merge (default: 128MB)
    pub major_size_threshold: u64,

    /// How long a big run must stay untouched before a major merge (default: 1h)
    pub major_staleness: Duration,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            small_run_threshold: 32 * 1024 * 1024, // 32MB
            min_runs_per_minor: 2,
            max_runs_per_minor: 10,
            major_size_threshold: 128 * 1024 * 1024, // 128MB
            major_staleness: Duration::from_secs(60 * 60),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./boxdb"),
            max_run_size: 256 * 1024 * 1024, // 256MB
            key_cache_size: 1000,
            bloom_false_positive_rate: 0.01,
            spatial_index_read_mode: SpatialIndexReadMode::Memory,
            metrics_interval: Duration::from_secs(60),
            compaction: CompactionConfig::default(),
        }
    }
}

impl StorageConfig {
    /// Create a new config with the given directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Set maximum run size
    pub fn max_run_size(mut self, size: u64) -> Self {
        self.max_run_size = size;
        self
    }

    /// Set key cache size
    pub fn key_cache_size(mut self, size: usize) -> Self {
        self.key_cache_size = size;
        self
    }

    /// Set the bloom filter false positive rate
    pub fn bloom_false_positive_rate(mut self, rate: f64) -> Self {
        self.bloom_false_positive_rate = rate;
        self
    }

    /// Set the spatial index read mode
    pub fn spatial_index_read_mode(mut self, mode: SpatialIndexReadMode) -> Self {
        self.spatial_index_read_mode = mode;
        self
    }

    /// Set metrics logging interval
    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = interval;
        self
    }

    /// Configure compaction settings
    pub fn compaction(mut self, config: CompactionConfig) -> Self {
        self.compaction = config;
        self
    }
}

impl CompactionConfig {
    /// Set delay between compaction cycles
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the size below which runs take part in minor merges
    pub fn small_run_threshold(mut self, size: u64) -> Self {
        self.small_run_threshold = size;
        self
    }

    /// Set minimum and maximum number of runs of a minor merge
    pub fn runs_per_minor(mut self, min: usize, max: usize) -> Self {
        self.min_runs_per_minor = min;
        self.max_runs_per_minor = max;
        self
    }

    /// Set the run size that makes a major merge possible
    pub fn major_size_threshold(mut self, size: u64) -> Self {
        self.major_size_threshold = size;
        self
    }

    /// Set how long a big run has to be untouched before a major merge
    pub fn major_staleness(mut self, staleness: Duration) -> Self {
        self.major_staleness = staleness;
        self
    }
}

/// Per table settings, resolved into concrete strategies when the table is
/// created. Stored in the table directory so a reopened table keeps them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TupleStoreConfig {
    /// Keep more than the newest version of a key
    pub allow_duplicates: bool,

    /// Versions older than this are hidden, only with duplicates allowed
    pub ttl: Option<Duration>,

    /// Maximum versions kept per key, only with duplicates allowed
    pub versions: usize,

    /// Maximum entries per R-tree node
    pub spatial_index_node_size: i32,
}

impl Default for TupleStoreConfig {
    fn default() -> Self {
        Self {
            allow_duplicates: false,
            ttl: None,
            versions: 1,
            spatial_index_node_size: crate::spatial::rtree::DEFAULT_NODE_SIZE,
        }
    }
}

impl TupleStoreConfig {
    /// Keep up to `versions` versions per key, optionally limited by a TTL
    pub fn with_duplicates(mut self, versions: usize, ttl: Option<Duration>) -> Self {
        self.allow_duplicates = true;
        self.versions = versions;
        self.ttl = ttl;
        self
    }

    /// Set the R-tree node size
    pub fn spatial_index_node_size(mut self, size: i32) -> Self {
        self.spatial_index_node_size = size;
        self
    }
}
