use std::sync::Arc;
use std::time::Duration;

use super::service::CompactionService;
use crate::error::Result;
use crate::scheduler::{BackgroundTask, Context};

pub struct CompactionTask {
    service: Arc<CompactionService>,
}

impl CompactionTask {
    pub fn new(service: Arc<CompactionService>) -> Self {
        Self { service }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for CompactionTask {
    fn name(&self) -> &'static str {
        "compaction"
    }

    fn interval(&self) -> Duration {
        self.service.strategy().compactor_delay()
    }

    async fn execute(&self, ctx: Context) -> Result<()> {
        tracing::debug!(task = ctx.task_name, run = ctx.run_id, "Starting compaction cycle");

        // Merging is blocking file I/O
        let service = self.service.clone();
        tokio::task::spawn_blocking(move || service.execute())
            .await
            .map_err(|e| crate::Error::InvalidState(format!("Compaction task panicked: {}", e)))?
    }
}
