//! Spatial storage core built from immutable sorted runs.
//!
//! Tuples carry a key, an n-dimensional bounding box, a value and a version
//! timestamp. Each table keeps its tuples in sorted runs that hold a key
//! index, an R-tree and a bloom filter. Reads go through pull based
//! operator pipelines (scans, filters, spatial joins), and a background
//! compaction merges runs and drops deleted keys.

pub mod cache;
pub mod config;
pub mod encoding;
pub mod entity;
pub mod error;
pub mod flock;
pub mod hasher;
pub mod scheduler;
pub mod spatial;
pub mod store;

#[cfg(test)]
pub mod tmpfs;

pub use config::{CompactionConfig, SpatialIndexReadMode, StorageConfig, TupleStoreConfig};
pub use entity::{Hyperrectangle, MultiTuple, TableName, Tuple};
pub use error::{Error, Result};
pub use hasher::Hasher;
pub use store::compaction::{CompactionService, CompactionTask};
pub use store::metrics::MetricsTask;
pub use store::query::{OperatorSpec, QueryProcessor};
pub use store::{Storage, TupleStore};
