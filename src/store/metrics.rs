use std::sync::Arc;
use std::time::Duration;

use crate::entity::TableName;
use crate::error::Result;
use crate::scheduler::{BackgroundTask, Context};
use crate::store::compaction::CompactionService;
use crate::store::registry::Storage;

/// Point in time figures of one table.
#[derive(Debug, Clone, PartialEq)]
pub struct TableMetrics {
    pub table: TableName,
    pub runs: usize,
    pub size: u64,
    pub tuples: u64,
    pub read_only: bool,
    /// Key index cache hits and misses summed over all runs
    pub key_cache: (usize, usize),
}

pub fn collect_metrics(storage: &Storage) -> Vec<TableMetrics> {
    storage
        .tables()
        .iter()
        .map(|table| {
            let runs = table.runs();
            let key_cache = runs
                .iter()
                .map(|run| run.key_cache_stats())
                .fold((0, 0), |acc, (hits, misses)| (acc.0 + hits, acc.1 + misses));
            TableMetrics {
                table: table.name().clone(),
                runs: runs.len(),
                size: runs.iter().map(|r| r.size()).sum(),
                tuples: runs.iter().map(|r| r.tuple_count()).sum(),
                read_only: table.is_read_only(),
                key_cache,
            }
        })
        .collect()
}

pub struct MetricsTask {
    storage: Arc<Storage>,
    compaction: Option<Arc<CompactionService>>,
}

impl MetricsTask {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            compaction: None,
        }
    }

    pub fn with_compaction(mut self, service: Arc<CompactionService>) -> Self {
        self.compaction = Some(service);
        self
    }
}

#[async_trait::async_trait]
impl BackgroundTask for MetricsTask {
    fn name(&self) -> &'static str {
        "metrics"
    }

    fn interval(&self) -> Duration {
        self.storage.config().metrics_interval
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        for metrics in collect_metrics(&self.storage) {
            tracing::info!(
                table = %metrics.table,
                runs = metrics.runs,
                size = metrics.size,
                tuples = metrics.tuples,
                read_only = metrics.read_only,
                key_cache_hits = metrics.key_cache.0,
                key_cache_misses = metrics.key_cache.1,
                "Table metrics"
            );
        }

        if let Some(service) = &self.compaction {
            let stats = service.stats();
            tracing::info!(
                last_read_tuples = stats.last_read_tuples,
                last_written_tuples = stats.last_written_tuples,
                total_merges = stats.total_merges,
                pending_deletions = self.storage.pending_deletions(),
                "Compaction metrics"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{StorageConfig, TupleStoreConfig};
    use crate::entity::{Hyperrectangle, Tuple};
    use crate::tmpfs::TempDir;

    #[test]
    fn test_collect_metrics() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::open(StorageConfig::new(dir.path())).unwrap();
        let empty = storage
            .create_table(TableName::new("m", "empty").unwrap(), TupleStoreConfig::default())
            .unwrap();
        let full = storage
            .create_table(TableName::new("m", "full").unwrap(), TupleStoreConfig::default())
            .unwrap();
        for key in ["a", "b"] {
            let bbox = Hyperrectangle::new(vec![0.0, 1.0]).unwrap();
            full.flush_run(vec![Tuple::new(key, bbox, vec![1, 2, 3], 1)]).unwrap();
        }
        full.set_read_only(true);

        let metrics = collect_metrics(&storage);
        assert_eq!(metrics.len(), 2);

        assert_eq!(&metrics[0].table, empty.name());
        assert_eq!((metrics[0].runs, metrics[0].size, metrics[0].tuples), (0, 0, 0));

        assert_eq!(&metrics[1].table, full.name());
        assert_eq!(metrics[1].runs, 2);
        assert_eq!(metrics[1].tuples, 2);
        assert_eq!(metrics[1].size, full.size());
        assert!(metrics[1].read_only);
    }

    #[tokio::test]
    async fn test_metrics_task() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(Storage::open(StorageConfig::new(dir.path()))?);
        let service = Arc::new(CompactionService::new(storage.clone()));
        let task = MetricsTask::new(storage.clone()).with_compaction(service);
        assert_eq!(task.interval(), storage.config().metrics_interval);

        let (_tx, rx) = tokio::sync::broadcast::channel(1);
        task.execute(Context {
            task_name: "metrics",
            run_id: 1,
            shutdown: rx,
        })
        .await
    }
}
