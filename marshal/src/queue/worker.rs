//! Queue worker: claims tasks and drives the extractor with retry semantics.
//!
//! The extractor must be idempotent: after a stale-claim recovery the same
//! task runs again on another worker, so completing twice must be safe.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::EngineError;
use crate::settings::QueueSettings;

use super::{ExtractionQueue, ExtractionTask};

/// The side effect a task exists for. Returning `Ok` means the effect has
/// durably committed.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, task: &ExtractionTask) -> Result<(), EngineError>;
}

pub struct QueueWorker {
    queue: Arc<ExtractionQueue>,
    extractor: Arc<dyn Extractor>,
    worker_id: String,
    settings: QueueSettings,
}

impl QueueWorker {
    pub fn new(
        queue: Arc<ExtractionQueue>,
        extractor: Arc<dyn Extractor>,
        settings: QueueSettings,
    ) -> Self {
        Self {
            queue,
            extractor,
            worker_id: format!("worker-{}", &uuid::Uuid::new_v4().to_string()[..8]),
            settings,
        }
    }

    /// Startup recovery: stale claims from a crashed predecessor go back to
    /// pending. Returns the recovered count.
    pub async fn recover(&self) -> u64 {
        match self
            .queue
            .recover_stale_tasks(self.settings.stale_threshold_minutes)
            .await
        {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, "stale-task recovery failed");
                0
            }
        }
    }

    /// Claims and processes one task. `Ok(None)` when the queue is empty.
    pub async fn run_once(&self) -> Result<Option<bool>, EngineError> {
        let task = match self
            .queue
            .dequeue(&self.worker_id, self.settings.max_attempts)
            .await
        {
            Ok(Some(task)) => task,
            Ok(None) => return Ok(None),
            Err(e) => return Err(EngineError::History(e.to_string())),
        };

        match self.extractor.extract(&task).await {
            Ok(()) => {
                self.queue
                    .mark_completed(&task.task_id)
                    .await
                    .map_err(|e| EngineError::History(e.to_string()))?;
                Ok(Some(true))
            }
            Err(e) => {
                warn!(task = %task.task_id, error = %e, "extraction failed");
                self.queue
                    .mark_failed(&task.task_id, &e.to_string(), self.settings.max_attempts)
                    .await
                    .map_err(|e| EngineError::History(e.to_string()))?;
                Ok(Some(false))
            }
        }
    }

    /// Long-running loop: recover once, then drain continuously, idling when
    /// the queue is empty.
    pub fn spawn(self: Arc<Self>, idle_sleep: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let recovered = self.recover().await;
            info!(worker = %self.worker_id, recovered, "queue worker started");
            loop {
                match self.run_once().await {
                    Ok(Some(_)) => {}
                    Ok(None) => tokio::time::sleep(idle_sleep).await,
                    Err(e) => {
                        warn!(worker = %self.worker_id, error = %e, "worker pass failed");
                        tokio::time::sleep(idle_sleep).await;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyExtractor {
        failures_left: AtomicU32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Extractor for FlakyExtractor {
        async fn extract(&self, _task: &ExtractionTask) -> Result<(), EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                Err(EngineError::LlmFailure("transient".into()))
            } else {
                Ok(())
            }
        }
    }

    fn settings() -> QueueSettings {
        QueueSettings {
            stale_threshold_minutes: 0,
            max_attempts: 3,
        }
    }

    fn task() -> ExtractionTask {
        ExtractionTask::new("doc:w", "content", "c1", None, None, vec![])
    }

    #[tokio::test]
    async fn success_removes_the_task() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(ExtractionQueue::new(dir.path()).unwrap());
        queue.enqueue(task()).await.unwrap();

        let extractor = Arc::new(FlakyExtractor {
            failures_left: AtomicU32::new(0),
            calls: AtomicU32::new(0),
        });
        let worker = QueueWorker::new(Arc::clone(&queue), extractor, settings());

        assert_eq!(worker.run_once().await.unwrap(), Some(true));
        assert_eq!(worker.run_once().await.unwrap(), None);
        assert_eq!(queue.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn transient_failure_retries_then_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(ExtractionQueue::new(dir.path()).unwrap());
        queue.enqueue(task()).await.unwrap();

        let extractor = Arc::new(FlakyExtractor {
            failures_left: AtomicU32::new(1),
            calls: AtomicU32::new(0),
        });
        let shared: Arc<dyn Extractor> = Arc::clone(&extractor) as Arc<dyn Extractor>;
        let worker = QueueWorker::new(Arc::clone(&queue), shared, settings());

        assert_eq!(worker.run_once().await.unwrap(), Some(false));
        assert_eq!(worker.run_once().await.unwrap(), Some(true));
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 2);
        assert_eq!(queue.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn permanent_failure_lands_terminal_after_max_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(ExtractionQueue::new(dir.path()).unwrap());
        queue.enqueue(task()).await.unwrap();

        let extractor = Arc::new(FlakyExtractor {
            failures_left: AtomicU32::new(1000),
            calls: AtomicU32::new(0),
        });
        let worker = QueueWorker::new(Arc::clone(&queue), extractor, settings());

        for _ in 0..3 {
            assert_eq!(worker.run_once().await.unwrap(), Some(false));
        }
        assert_eq!(worker.run_once().await.unwrap(), None, "terminal failure is not claimable");
        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.failed, 1);
    }
}
