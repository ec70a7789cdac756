//! Selection of the runs merged by one compaction cycle.
//!
//! Two kinds of merges exist:
//!
//! - **Minor**: a few small runs are merged into one. Tombstones are kept,
//!   since older versions of their keys may live in runs outside the merge.
//! - **Major**: all runs of a table are merged. Nothing older than the
//!   merged runs exists, so tombstones are dropped.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use itertools::Itertools;

use crate::config::CompactionConfig;
use crate::store::sstable::SortedRun;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeTaskType {
    None,
    Minor,
    Major,
}

/// Runs chosen for one merge.
#[derive(Debug, Clone)]
pub struct MergeTask {
    pub task_type: MergeTaskType,
    pub runs: Vec<Arc<SortedRun>>,
}

impl MergeTask {
    pub fn none() -> Self {
        Self {
            task_type: MergeTaskType::None,
            runs: Vec::new(),
        }
    }

    pub fn minor(runs: Vec<Arc<SortedRun>>) -> Self {
        Self {
            task_type: MergeTaskType::Minor,
            runs,
        }
    }

    pub fn major(runs: Vec<Arc<SortedRun>>) -> Self {
        Self {
            task_type: MergeTaskType::Major,
            runs,
        }
    }

    pub fn is_major(&self) -> bool {
        self.task_type == MergeTaskType::Major
    }
}

pub trait MergeStrategy: Send + Sync + std::fmt::Debug {
    /// Picks the runs to merge next out of the runs of one table.
    fn merge_task(&self, runs: &[Arc<SortedRun>]) -> MergeTask;

    /// Pause between two compaction cycles.
    fn compactor_delay(&self) -> Duration;
}

/// Size based strategy.
///
/// 1. A run bigger than `major_size_threshold` whose data file was not
///    modified within `major_staleness` merges all runs (major).
/// 2. At least `min_runs_per_minor` runs below `small_run_threshold` merge
///    the smallest of them, at most `max_runs_per_minor` (minor).
#[derive(Debug, Clone)]
pub struct SimpleMergeStrategy {
    config: CompactionConfig,
}

impl SimpleMergeStrategy {
    pub fn new(config: CompactionConfig) -> Self {
        Self { config }
    }

    pub(crate) fn merge_task_at(&self, runs: &[Arc<SortedRun>], now: SystemTime) -> MergeTask {
        if runs.len() < 2 {
            return MergeTask::none();
        }

        let stale = |run: &Arc<SortedRun>| {
            now.duration_since(run.last_modified())
                .map(|age| age >= self.config.major_staleness)
                .unwrap_or(false)
        };
        if runs
            .iter()
            .any(|run| run.size() > self.config.major_size_threshold && stale(run))
        {
            return MergeTask::major(runs.to_vec());
        }

        let small = runs
            .iter()
            .filter(|run| run.size() < self.config.small_run_threshold)
            .sorted_by_key(|run| run.size())
            .cloned()
            .collect_vec();
        if small.len() < self.config.min_runs_per_minor.max(2) {
            return MergeTask::none();
        }

        let max_runs = self.config.max_runs_per_minor.max(2);
        MergeTask::minor(small.into_iter().take(max_runs).collect())
    }
}

impl MergeStrategy for SimpleMergeStrategy {
    fn merge_task(&self, runs: &[Arc<SortedRun>]) -> MergeTask {
        self.merge_task_at(runs, SystemTime::now())
    }

    fn compactor_delay(&self) -> Duration {
        self.config.interval
    }
}
