//! Background compaction of sorted runs.
//!
//! ```text
//!   Idle --> Selecting --> Merging --> Swapping --> Idle
//!              |                          |
//!              +-- no task ---------------+-- read only: discard new runs
//! ```
//!
//! The strategy selects the runs of a table, the compactor merges them into
//! new runs, the service swaps the new runs in and marks the old ones for
//! deletion. Old runs disappear once their last reader releases them.

pub mod compactor;
pub mod iterator;
pub mod service;
pub mod strategy;
pub mod task;

pub use compactor::{merge_runs, MergeOutcome};
pub use iterator::KeyGroupIterator;
pub use service::{CompactionService, CompactionStats, RegionSplitChecker};
pub use strategy::{MergeStrategy, MergeTask, MergeTaskType, SimpleMergeStrategy};
pub use task::CompactionTask;
