use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use itertools::Itertools;

use super::compactor::merge_runs;
use super::strategy::{MergeStrategy, MergeTask, MergeTaskType, SimpleMergeStrategy};
use crate::entity::TableName;
use crate::error::{Error, Result};
use crate::store::registry::{Storage, TupleStore};

/// Asked after a major merge of a distributed table whether the table has
/// grown enough to be split. Splitting itself happens elsewhere.
pub trait RegionSplitChecker: Send + Sync {
    fn is_split_needed(&self, table: &TableName, size: u64) -> bool;
}

/// Counters of the compaction service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionStats {
    pub last_read_tuples: u64,
    pub last_written_tuples: u64,
    pub total_merges: u64,
}

/// Compacts the tables of one storage location.
///
/// A cycle visits every table: ask the strategy for a task, merge, swap the
/// new runs in. Cycles are serialized, two merges never run at the same
/// time within one storage location.
pub struct CompactionService {
    storage: Arc<Storage>,
    strategy: Box<dyn MergeStrategy>,
    split_checker: Option<Arc<dyn RegionSplitChecker>>,
    running: Mutex<()>,
    last_read: AtomicU64,
    last_written: AtomicU64,
    total_merges: AtomicU64,
}

impl std::fmt::Debug for CompactionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompactionService")
            .field("strategy", &self.strategy)
            .field("stats", &self.stats())
            .finish()
    }
}

impl CompactionService {
    /// Service with a [`SimpleMergeStrategy`] built from the storage config.
    pub fn new(storage: Arc<Storage>) -> Self {
        let strategy = SimpleMergeStrategy::new(storage.config().compaction.clone());
        Self::with_strategy(storage, Box::new(strategy))
    }

    pub fn with_strategy(storage: Arc<Storage>, strategy: Box<dyn MergeStrategy>) -> Self {
        Self {
            storage,
            strategy,
            split_checker: None,
            running: Mutex::new(()),
            last_read: AtomicU64::new(0),
            last_written: AtomicU64::new(0),
            total_merges: AtomicU64::new(0),
        }
    }

    pub fn split_checker(mut self, checker: Arc<dyn RegionSplitChecker>) -> Self {
        self.split_checker = Some(checker);
        self
    }

    pub fn strategy(&self) -> &dyn MergeStrategy {
        self.strategy.as_ref()
    }

    pub fn stats(&self) -> CompactionStats {
        CompactionStats {
            last_read_tuples: self.last_read.load(Ordering::Relaxed),
            last_written_tuples: self.last_written.load(Ordering::Relaxed),
            total_merges: self.total_merges.load(Ordering::Relaxed),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// One compaction cycle over all tables, followed by the removal of
    /// tables scheduled for deletion. A failing table does not stop the
    /// cycle.
    pub fn execute(&self) -> Result<()> {
        let _running = self.lock();

        for table in self.storage.tables() {
            if let Err(e) = self.compact_table(&table, false) {
                tracing::error!(table = %table.name(), error = %e, "Compaction failed");
            }
        }

        let deleted = self.storage.process_scheduled_deletions();
        tracing::debug!(deleted_tables = deleted, "Compaction cycle done");
        Ok(())
    }

    /// Merges all runs of a table into as few runs as possible and drops
    /// its tombstones.
    pub fn force_major_compact(&self, name: &TableName) -> Result<()> {
        let _running = self.lock();
        let table = self.storage.get_table(name)?;
        tracing::info!(table = %name, "Forcing major compaction");
        self.compact_table(&table, true)
    }

    fn compact_table(&self, table: &Arc<TupleStore>, force_major: bool) -> Result<()> {
        if table.is_read_only() {
            tracing::debug!(table = %table.name(), "Table is read only, not compacting");
            return Ok(());
        }

        let runs = table.acquire_runs()?;
        let task = if force_major {
            MergeTask::major(runs.to_vec())
        } else {
            self.strategy.merge_task(&runs)
        };
        if task.task_type == MergeTaskType::None || task.runs.is_empty() {
            return Ok(());
        }

        let major = task.is_major();
        tracing::info!(
            table = %table.name(),
            runs = %task.runs.iter().map(|run| run.generation()).join(","),
            "Merging (major: {})",
            major
        );

        let outcome = merge_runs(table, &task.runs, major)?;
        let (read, written) = (outcome.read, outcome.written);
        self.last_read.store(read, Ordering::Relaxed);
        self.last_written.store(written, Ordering::Relaxed);
        self.total_merges.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            table = %table.name(),
            new_runs = outcome.runs.len(),
            "Compaction done. Read {} tuples, wrote {} tuples",
            read,
            written
        );

        match table.replace_runs(&task.runs, outcome.runs.clone()) {
            Ok(()) => {}
            Err(Error::ReadOnly(_)) => {
                tracing::warn!(
                    table = %table.name(),
                    "Table became read only during compaction, discarding merged runs"
                );
                outcome.discard();
                return Ok(());
            }
            Err(e) => {
                outcome.discard();
                return Err(e);
            }
        }
        for run in &task.runs {
            run.delete_on_release();
        }
        // Old runs are removed once this and every other reader let go
        drop(runs);

        if major && table.name().is_distributed() {
            self.check_split(table);
        }
        Ok(())
    }

    fn check_split(&self, table: &TupleStore) {
        let Some(checker) = &self.split_checker else {
            return;
        };
        let size = table.size();
        let split_needed = checker.is_split_needed(table.name(), size);
        tracing::info!(table = %table.name(), size, split_needed, "Checked region size");
    }
}
