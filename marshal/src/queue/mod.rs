//! Persistent queue for deferred LLM post-processing tasks.
//!
//! SQLite-backed FIFO with WAL journaling: tasks survive crashes, claims are
//! atomic (`BEGIN IMMEDIATE` select + update in one transaction), attempts are
//! bounded, and stale claims are recovered at startup. A task leaves the table
//! only through [`ExtractionQueue::mark_completed`].

mod worker;

pub use worker::{Extractor, QueueWorker};

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("storage: {0}")]
    Storage(String),
    #[error("serialization: {0}")]
    Serialization(String),
}

impl From<rusqlite::Error> for QueueError {
    fn from(e: rusqlite::Error) -> Self {
        QueueError::Storage(e.to_string())
    }
}

/// Task lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "in_progress" => TaskStatus::InProgress,
            "completed" => TaskStatus::Completed,
            "failed" => TaskStatus::Failed,
            _ => TaskStatus::Pending,
        }
    }
}

/// One deferred extraction task.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExtractionTask {
    pub task_id: String,
    pub source_urn: String,
    pub content: String,
    pub client_id: String,
    pub project_id: Option<String>,
    pub kind: Option<String>,
    pub chunk_ids: Vec<String>,
    pub created_at: String,
    pub status: TaskStatus,
    pub attempts: u32,
    pub last_attempt_at: Option<String>,
    pub worker_id: Option<String>,
    pub error: Option<String>,
}

impl ExtractionTask {
    pub fn new(
        source_urn: impl Into<String>,
        content: impl Into<String>,
        client_id: impl Into<String>,
        project_id: Option<String>,
        kind: Option<String>,
        chunk_ids: Vec<String>,
    ) -> Self {
        Self {
            task_id: uuid::Uuid::new_v4().to_string(),
            source_urn: source_urn.into(),
            content: content.into(),
            client_id: client_id.into(),
            project_id,
            kind,
            chunk_ids,
            created_at: Utc::now().to_rfc3339(),
            status: TaskStatus::Pending,
            attempts: 0,
            last_attempt_at: None,
            worker_id: None,
            error: None,
        }
    }
}

/// Counts by status for monitoring.
#[derive(Clone, Debug, Default, Serialize)]
pub struct QueueStats {
    pub total: u64,
    pub pending: u64,
    pub in_progress: u64,
    pub failed: u64,
}

/// SQLite-backed persistent queue. One row per task, keyed by `task_id`.
pub struct ExtractionQueue {
    db_path: PathBuf,
}

impl ExtractionQueue {
    /// Opens (or creates) the queue database under `queue_dir` and applies the
    /// WAL pragmas and schema.
    pub fn new(queue_dir: impl AsRef<Path>) -> Result<Self, QueueError> {
        std::fs::create_dir_all(queue_dir.as_ref())
            .map_err(|e| QueueError::Storage(e.to_string()))?;
        let db_path = queue_dir.as_ref().join("extraction_queue.db");
        let conn = Self::open(&db_path)?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                task_id TEXT PRIMARY KEY,
                source_urn TEXT NOT NULL,
                content TEXT NOT NULL,
                client_id TEXT NOT NULL,
                project_id TEXT,
                kind TEXT,
                chunk_ids TEXT NOT NULL,
                created_at TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                attempts INTEGER NOT NULL DEFAULT 0,
                last_attempt_at TEXT,
                worker_id TEXT,
                error TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_status_attempts_created
                ON tasks(status, attempts, created_at);
            CREATE INDEX IF NOT EXISTS idx_last_attempt
                ON tasks(last_attempt_at) WHERE status = 'in_progress';
            "#,
        )?;
        info!(path = %db_path.display(), "extraction queue initialized");
        Ok(Self { db_path })
    }

    fn open(path: &Path) -> Result<Connection, QueueError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "busy_timeout", 30_000)?;
        Ok(conn)
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, QueueError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, QueueError> + Send + 'static,
    {
        let path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = Self::open(&path)?;
            f(&mut conn)
        })
        .await
        .map_err(|e| QueueError::Storage(e.to_string()))?
    }

    /// Inserts a task with `status=pending, attempts=0`.
    pub async fn enqueue(&self, task: ExtractionTask) -> Result<(), QueueError> {
        self.with_conn(move |conn| {
            let chunk_ids = serde_json::to_string(&task.chunk_ids)
                .map_err(|e| QueueError::Serialization(e.to_string()))?;
            conn.execute(
                r#"
                INSERT INTO tasks (
                    task_id, source_urn, content, client_id, project_id, kind,
                    chunk_ids, created_at, status, attempts
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'pending', 0)
                "#,
                params![
                    task.task_id,
                    task.source_urn,
                    task.content,
                    task.client_id,
                    task.project_id,
                    task.kind,
                    chunk_ids,
                    task.created_at,
                ],
            )?;
            let size: u64 =
                conn.query_row("SELECT COUNT(*) FROM tasks", [], |row| row.get(0))?;
            info!(task = %task.task_id, queue_size = size, "enqueued extraction task");
            Ok(())
        })
        .await
    }

    /// Claims the oldest pending task: a single write-locked transaction that
    /// selects and flips it to `in_progress` with `attempts += 1`. Returns
    /// `None` when nothing is claimable. Concurrent workers never receive the
    /// same row.
    pub async fn dequeue(
        &self,
        worker_id: &str,
        max_attempts: u32,
    ) -> Result<Option<ExtractionTask>, QueueError> {
        let worker_id = worker_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

            let row = tx
                .query_row(
                    r#"
                    SELECT task_id, source_urn, content, client_id, project_id, kind,
                           chunk_ids, created_at, attempts
                    FROM tasks
                    WHERE status = 'pending' AND attempts < ?1
                    ORDER BY created_at ASC
                    LIMIT 1
                    "#,
                    params![max_attempts],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, Option<String>>(4)?,
                            row.get::<_, Option<String>>(5)?,
                            row.get::<_, String>(6)?,
                            row.get::<_, String>(7)?,
                            row.get::<_, u32>(8)?,
                        ))
                    },
                )
                .optional()?;

            let Some((task_id, source_urn, content, client_id, project_id, kind, chunk_ids, created_at, attempts)) = row
            else {
                return Ok(None);
            };

            let attempts = attempts + 1;
            let now = Utc::now().to_rfc3339();
            tx.execute(
                r#"
                UPDATE tasks
                SET status = 'in_progress', attempts = ?1, last_attempt_at = ?2, worker_id = ?3
                WHERE task_id = ?4
                "#,
                params![attempts, now, worker_id, task_id],
            )?;
            tx.commit()?;

            let chunk_ids: Vec<String> = serde_json::from_str(&chunk_ids)
                .map_err(|e| QueueError::Serialization(e.to_string()))?;
            info!(task = %task_id, attempt = attempts, max = max_attempts, "claimed extraction task");
            Ok(Some(ExtractionTask {
                task_id,
                source_urn,
                content,
                client_id,
                project_id,
                kind,
                chunk_ids,
                created_at,
                status: TaskStatus::InProgress,
                attempts,
                last_attempt_at: Some(now),
                worker_id: Some(worker_id),
                error: None,
            }))
        })
        .await
    }

    /// Returns the next pending task without claiming it.
    pub async fn peek(&self) -> Result<Option<ExtractionTask>, QueueError> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT task_id, source_urn, content, client_id, project_id, kind, chunk_ids,
                            created_at, status, attempts, last_attempt_at, worker_id, error
                     FROM tasks WHERE status = 'pending' ORDER BY created_at ASC LIMIT 1",
                    [],
                    row_to_task,
                )
                .optional()?;
            Ok(row)
        })
        .await
    }

    /// Removes the task: the external side effect has durably committed.
    pub async fn mark_completed(&self, task_id: &str) -> Result<bool, QueueError> {
        let task_id = task_id.to_string();
        self.with_conn(move |conn| {
            let removed = conn.execute("DELETE FROM tasks WHERE task_id = ?1", params![task_id])?;
            if removed > 0 {
                info!(task = %task_id, "extraction task completed");
            }
            Ok(removed > 0)
        })
        .await
    }

    /// On failure: terminal `failed` after `max_attempts`, else back to
    /// `pending` for an immediate retry.
    pub async fn mark_failed(
        &self,
        task_id: &str,
        task_error: &str,
        max_attempts: u32,
    ) -> Result<bool, QueueError> {
        let task_id = task_id.to_string();
        let task_error = task_error.to_string();
        self.with_conn(move |conn| {
            let attempts: Option<u32> = conn
                .query_row(
                    "SELECT attempts FROM tasks WHERE task_id = ?1",
                    params![task_id],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(attempts) = attempts else {
                return Ok(false);
            };

            if attempts >= max_attempts {
                conn.execute(
                    "UPDATE tasks SET status = 'failed', error = ?1 WHERE task_id = ?2",
                    params![task_error, task_id],
                )?;
                error!(task = %task_id, attempts, error = %task_error, "extraction task failed terminally");
            } else {
                conn.execute(
                    "UPDATE tasks SET status = 'pending', worker_id = NULL, error = ?1 WHERE task_id = ?2",
                    params![task_error, task_id],
                )?;
                warn!(task = %task_id, attempts, max_attempts, error = %task_error, "extraction task failed, retrying");
            }
            Ok(true)
        })
        .await
    }

    /// Crash recovery at startup: resets `in_progress` rows whose last attempt
    /// is older than the threshold (or missing) back to `pending`. Returns the
    /// number of recovered tasks.
    pub async fn recover_stale_tasks(&self, threshold_minutes: i64) -> Result<u64, QueueError> {
        self.with_conn(move |conn| {
            let threshold: DateTime<Utc> = Utc::now() - ChronoDuration::minutes(threshold_minutes);
            let threshold = threshold.to_rfc3339();
            let recovered = conn.execute(
                r#"
                UPDATE tasks
                SET status = 'pending', worker_id = NULL
                WHERE status = 'in_progress'
                  AND (last_attempt_at IS NULL OR last_attempt_at < ?1)
                "#,
                params![threshold],
            )? as u64;
            if recovered > 0 {
                warn!(recovered, "recovered stale in_progress tasks to pending");
            }
            Ok(recovered)
        })
        .await
    }

    /// Total row count.
    pub async fn size(&self) -> Result<u64, QueueError> {
        self.with_conn(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM tasks", [], |row| row.get(0))?)
        })
        .await
    }

    /// Group counts by status.
    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
            })?;
            let mut stats = QueueStats::default();
            for row in rows {
                let (status, count) = row?;
                stats.total += count;
                match TaskStatus::from_str(&status) {
                    TaskStatus::Pending => stats.pending = count,
                    TaskStatus::InProgress => stats.in_progress = count,
                    TaskStatus::Failed => stats.failed = count,
                    TaskStatus::Completed => {}
                }
            }
            Ok(stats)
        })
        .await
    }
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExtractionTask> {
    let chunk_ids: String = row.get(6)?;
    let status: String = row.get(8)?;
    Ok(ExtractionTask {
        task_id: row.get(0)?,
        source_urn: row.get(1)?,
        content: row.get(2)?,
        client_id: row.get(3)?,
        project_id: row.get(4)?,
        kind: row.get(5)?,
        chunk_ids: serde_json::from_str(&chunk_ids).unwrap_or_default(),
        created_at: row.get(7)?,
        status: TaskStatus::from_str(&status),
        attempts: row.get(9)?,
        last_attempt_at: row.get(10)?,
        worker_id: row.get(11)?,
        error: row.get(12)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(urn: &str) -> ExtractionTask {
        ExtractionTask::new(urn, "content", "client-1", None, Some("entity".into()), vec![])
    }

    #[tokio::test]
    async fn enqueue_dequeue_complete_removes_task() {
        let dir = tempfile::tempdir().unwrap();
        let queue = ExtractionQueue::new(dir.path()).unwrap();
        let t = task("doc:1");
        let id = t.task_id.clone();
        queue.enqueue(t).await.unwrap();

        let claimed = queue.dequeue("w1", 3).await.unwrap().unwrap();
        assert_eq!(claimed.task_id, id);
        assert_eq!(claimed.status, TaskStatus::InProgress);
        assert_eq!(claimed.attempts, 1);
        assert_eq!(claimed.worker_id.as_deref(), Some("w1"));

        assert!(queue.mark_completed(&id).await.unwrap());
        assert_eq!(queue.size().await.unwrap(), 0);
        assert!(queue.dequeue("w1", 3).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dequeue_is_fifo_by_created_at() {
        let dir = tempfile::tempdir().unwrap();
        let queue = ExtractionQueue::new(dir.path()).unwrap();
        let mut first = task("doc:first");
        first.created_at = "2026-01-01T00:00:00Z".into();
        let mut second = task("doc:second");
        second.created_at = "2026-01-02T00:00:00Z".into();
        queue.enqueue(second).await.unwrap();
        queue.enqueue(first).await.unwrap();

        let claimed = queue.dequeue("w1", 3).await.unwrap().unwrap();
        assert_eq!(claimed.source_urn, "doc:first");
    }

    #[tokio::test]
    async fn crash_recovery_returns_same_payload_with_incremented_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let queue = ExtractionQueue::new(dir.path()).unwrap();
        let t = task("doc:crash");
        let id = t.task_id.clone();
        queue.enqueue(t).await.unwrap();

        let first = queue.dequeue("w1", 3).await.unwrap().unwrap();
        assert_eq!(first.attempts, 1);
        // Simulated crash: the worker never completes. Threshold 0 makes the
        // claim immediately stale.
        let recovered = queue.recover_stale_tasks(0).await.unwrap();
        assert_eq!(recovered, 1);

        let second = queue.dequeue("w2", 3).await.unwrap().unwrap();
        assert_eq!(second.task_id, id);
        assert_eq!(second.content, "content");
        assert_eq!(second.attempts, 2);
        assert_eq!(second.worker_id.as_deref(), Some("w2"));
    }

    #[tokio::test]
    async fn recovery_respects_fresh_claims() {
        let dir = tempfile::tempdir().unwrap();
        let queue = ExtractionQueue::new(dir.path()).unwrap();
        queue.enqueue(task("doc:fresh")).await.unwrap();
        queue.dequeue("w1", 3).await.unwrap().unwrap();

        let recovered = queue.recover_stale_tasks(30).await.unwrap();
        assert_eq!(recovered, 0, "claim from seconds ago is not stale");
    }

    #[tokio::test]
    async fn mark_failed_retries_until_max_attempts_then_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let queue = ExtractionQueue::new(dir.path()).unwrap();
        let t = task("doc:flaky");
        let id = t.task_id.clone();
        queue.enqueue(t).await.unwrap();

        for attempt in 1..=3u32 {
            let claimed = queue.dequeue("w1", 3).await.unwrap().unwrap();
            assert_eq!(claimed.attempts, attempt);
            queue.mark_failed(&id, "boom", 3).await.unwrap();
        }

        // attempts == max_attempts: terminal, retained for audit.
        assert!(queue.dequeue("w1", 3).await.unwrap().is_none());
        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.total, 1);
    }

    #[tokio::test]
    async fn concurrent_workers_never_share_a_claim() {
        let dir = tempfile::tempdir().unwrap();
        let queue = std::sync::Arc::new(ExtractionQueue::new(dir.path()).unwrap());
        for i in 0..20 {
            queue.enqueue(task(&format!("doc:{i}"))).await.unwrap();
        }

        let mut handles = Vec::new();
        for w in 0..4 {
            let q = std::sync::Arc::clone(&queue);
            handles.push(tokio::spawn(async move {
                let mut claimed = Vec::new();
                while let Some(t) = q.dequeue(&format!("w{w}"), 3).await.unwrap() {
                    claimed.push(t.task_id);
                }
                claimed
            }));
        }
        let mut all = Vec::new();
        for h in handles {
            all.extend(h.await.unwrap());
        }
        let unique: std::collections::HashSet<_> = all.iter().collect();
        assert_eq!(all.len(), 20);
        assert_eq!(unique.len(), 20, "each task claimed exactly once");
    }

    #[tokio::test]
    async fn stats_and_peek() {
        let dir = tempfile::tempdir().unwrap();
        let queue = ExtractionQueue::new(dir.path()).unwrap();
        queue.enqueue(task("doc:a")).await.unwrap();
        queue.enqueue(task("doc:b")).await.unwrap();
        queue.dequeue("w1", 3).await.unwrap();

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.in_progress, 1);

        let peeked = queue.peek().await.unwrap().unwrap();
        assert_eq!(peeked.status, TaskStatus::Pending);
        // Peek does not claim.
        assert_eq!(queue.stats().await.unwrap().pending, 1);
    }
}
