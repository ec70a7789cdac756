//! Periodic background work: compaction cycles and metrics logging.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::Result;

/// Context provided to background tasks during execution
#[derive(Debug)]
pub struct Context {
    pub task_name: &'static str,
    pub run_id: u64,
    pub shutdown: broadcast::Receiver<()>,
}

/// Trait for background tasks that run periodically
#[async_trait::async_trait]
pub trait BackgroundTask: Send + Sync {
    /// Task name for logging
    fn name(&self) -> &'static str;

    /// Pause before the next run, asked again after every run
    fn interval(&self) -> Duration;

    /// Execute the task
    async fn execute(&self, ctx: Context) -> Result<()>;
}

/// Scheduler manages background tasks with graceful shutdown
pub struct Scheduler {
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            tasks: Mutex::new(Vec::new()),
            shutdown_tx,
        }
    }

    /// Register a periodic background task
    pub fn register<T: BackgroundTask + 'static>(&self, task: Arc<T>) -> &Self {
        let handle = self.spawn_task_loop(task);
        self.handles().push(handle);
        self
    }

    /// Spawn one-off task
    pub fn spawn<F>(&self, f: F)
    where
        F: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        tokio::spawn(async move {
            if let Err(e) = f.await {
                tracing::error!(error = %e, "One-off task failed");
            }
        });
    }

    fn handles(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn spawn_task_loop<T: BackgroundTask + 'static>(&self, task: Arc<T>) -> JoinHandle<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut run_id = 0u64;

        tokio::spawn(async move {
            loop {
                run_id += 1;
                let ctx = Context {
                    task_name: task.name(),
                    run_id,
                    shutdown: shutdown_rx.resubscribe(),
                };

                tokio::select! {
                    result = task.execute(ctx) => {
                        if let Err(e) = result {
                            tracing::error!(
                                task = task.name(),
                                error = %e,
                                "Task execution failed"
                            );
                        }
                    }

                    _ = shutdown_rx.recv() => break,
                }

                let delay = task.interval();
                tracing::debug!(task = task.name(), run_id, ?delay, "Task run finished");

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown_rx.recv() => break,
                }
            }
            tracing::info!(task = task.name(), "Task shutting down");
        })
    }

    /// Graceful shutdown - wait for all tasks
    pub async fn shutdown(self) -> Result<()> {
        // Signal all tasks to stop
        self.shutdown_tx.send(()).ok();

        // Wait for all tasks to complete
        let handles: Vec<_> = self.handles().drain(..).collect();
        for task in handles {
            task.await
                .map_err(|e| crate::Error::InvalidState(format!("Task join error: {}", e)))?;
        }

        Ok(())
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TestTask {
        name: &'static str,
        interval: Duration,
        counter: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl BackgroundTask for TestTask {
        fn name(&self) -> &'static str {
            self.name
        }

        fn interval(&self) -> Duration {
            self.interval
        }

        async fn execute(&self, _ctx: Context) -> Result<()> {
            self.counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_scheduler_basic() -> Result<()> {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let task = Arc::new(TestTask {
            name: "test-task",
            interval: Duration::from_millis(10),
            counter: counter.clone(),
        });

        scheduler.register(task);

        // Let it run for a bit
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Should have executed multiple times
        assert!(counter.load(Ordering::SeqCst) > 0);

        scheduler.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_scheduler_graceful_shutdown() -> Result<()> {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let task = Arc::new(TestTask {
            name: "test-task",
            interval: Duration::from_millis(10),
            counter: counter.clone(),
        });

        scheduler.register(task);

        // Let it run briefly
        tokio::time::sleep(Duration::from_millis(25)).await;

        let count_before_shutdown = counter.load(Ordering::SeqCst);

        // Shutdown should be fast
        let start = std::time::Instant::now();
        scheduler.shutdown().await?;
        let shutdown_time = start.elapsed();

        // Should shutdown quickly
        assert!(shutdown_time < Duration::from_millis(100));

        // Give a moment to ensure no more tasks run
        tokio::time::sleep(Duration::from_millis(25)).await;
        let count_after_shutdown = counter.load(Ordering::SeqCst);

        // Should not have increased after shutdown
        assert_eq!(count_before_shutdown, count_after_shutdown);

        Ok(())
    }

    struct FailingTask {
        runs: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl BackgroundTask for FailingTask {
        fn name(&self) -> &'static str {
            "failing-task"
        }

        // Slows down after every run
        fn interval(&self) -> Duration {
            Duration::from_millis(5 * self.runs.load(Ordering::SeqCst) as u64)
        }

        async fn execute(&self, _ctx: Context) -> Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Err(crate::Error::InvalidState("always fails".to_string()))
        }
    }

    #[tokio::test]
    async fn test_failing_task_keeps_running() -> Result<()> {
        let scheduler = Scheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));
        scheduler.register(Arc::new(FailingTask { runs: runs.clone() }));

        tokio::time::sleep(Duration::from_millis(100)).await;
        scheduler.shutdown().await?;

        // 5 + 10 + 15 + 20 + 25 ms of pauses fit into 100ms, 30 more do not
        let count = runs.load(Ordering::SeqCst);
        assert!(count >= 2, "ran {} times", count);
        assert!(count <= 7, "ran {} times", count);
        Ok(())
    }
}
