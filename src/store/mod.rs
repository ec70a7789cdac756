//! The storage core: sorted runs on disk, the table registry on top of
//! them, the query pipeline reading them and the compaction merging them.

pub mod compaction;
pub mod metrics;
pub mod predicate;
pub mod query;
pub mod registry;
pub mod resolver;
pub mod sstable;

pub use registry::{AcquiredRuns, Storage, TupleStore};
pub use resolver::{DoNothingResolver, DuplicateResolver, NewestTupleResolver, TtlVersionResolver};
