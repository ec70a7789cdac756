use std::sync::Arc;

use super::iterator::{KeyGroupIterator, TupleIterator};
use crate::encoding::encoded_len;
use crate::error::Result;
use crate::store::registry::TupleStore;
use crate::store::sstable::{RunFiles, SSTableWriter, SortedRun};

/// Result of one merge: the new runs, not installed yet.
#[derive(Debug)]
pub struct MergeOutcome {
    pub runs: Vec<Arc<SortedRun>>,
    pub read: u64,
    pub written: u64,
}

impl MergeOutcome {
    /// Removes the files of runs that never made it into the run list.
    pub fn discard(self) {
        for run in self.runs {
            run.delete_on_release();
        }
    }
}

/// Merges `runs` of `table` into new runs of at most
/// `StorageConfig::max_run_size` bytes each.
///
/// Every key group is passed through the table's duplicate resolver. A
/// major merge also drops tombstones. On failure no file written by the
/// merge is left behind.
pub fn merge_runs(
    table: &TupleStore,
    runs: &[Arc<SortedRun>],
    major: bool,
) -> Result<MergeOutcome> {
    let mut merge = Merge {
        table,
        expected_tuples: runs.iter().map(|r| r.tuple_count() as usize).sum(),
        writer: None,
        finished: Vec::new(),
        read: 0,
        written: 0,
    };

    if let Err(e) = merge.run(runs, major) {
        merge.abort();
        return Err(e);
    }

    let Merge {
        finished,
        read,
        written,
        ..
    } = merge;

    let mut opened = Vec::with_capacity(finished.len());
    for files in &finished {
        match table.open_run(files.clone()) {
            Ok(run) => opened.push(Arc::new(run)),
            Err(e) => {
                for files in &finished {
                    let _ = files.delete();
                }
                return Err(e);
            }
        }
    }

    Ok(MergeOutcome {
        runs: opened,
        read,
        written,
    })
}

struct Merge<'a> {
    table: &'a TupleStore,
    expected_tuples: usize,
    writer: Option<SSTableWriter>,
    finished: Vec<RunFiles>,
    read: u64,
    written: u64,
}

impl Merge<'_> {
    fn run(&mut self, runs: &[Arc<SortedRun>], major: bool) -> Result<()> {
        let iterators = runs
            .iter()
            .map(|run| run.iter().map(|i| Box::new(i) as TupleIterator))
            .collect::<Result<Vec<_>>>()?;

        for group in KeyGroupIterator::new(iterators)? {
            let mut group = group?;
            self.read += group.len() as u64;

            self.table.resolver().resolve(&mut group);
            if major {
                group.retain(|t| !t.is_tombstone());
            }
            if group.is_empty() {
                continue;
            }
            group.sort();

            // A key group is never split between two runs
            let group_bytes: u64 = group.iter().map(|t| encoded_len(t) as u64).sum();
            let max_run_size = self.table.storage_config().max_run_size;
            if let Some(writer) = &self.writer {
                if writer.tuple_count() > 0 && writer.written_bytes() + group_bytes > max_run_size {
                    self.finish_writer()?;
                }
            }

            let writer = match self.writer.take() {
                Some(writer) => writer,
                None => SSTableWriter::create(
                    self.table.next_run_files(),
                    self.expected_tuples.max(1),
                    self.table.config().spatial_index_node_size,
                    self.table.storage_config().bloom_false_positive_rate,
                )?,
            };
            let writer = self.writer.insert(writer);
            for tuple in &group {
                writer.add_tuple(tuple)?;
            }
            self.written += group.len() as u64;
        }

        self.finish_writer()
    }

    fn finish_writer(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.take() {
            self.finished.push(writer.finish()?);
        }
        Ok(())
    }

    fn abort(&mut self) {
        // Dropping an unfinished writer removes its files
        self.writer = None;
        for files in self.finished.drain(..) {
            if let Err(e) = files.delete() {
                tracing::warn!(
                    table = %files.table(),
                    generation = files.generation(),
                    error = %e,
                    "Failed to remove output of a failed merge"
                );
            }
        }
    }
}
