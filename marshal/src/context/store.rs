//! Chat history store: messages and summary blocks keyed by (task_id, sequence).
//!
//! The store is a trait so the backing database is swappable; the shipped
//! implementation is SQLite with a unique `(task_id, sequence)` index.
//! Sequence allocation happens inside a write transaction, so two writers can
//! never persist the same sequence for one task.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, TransactionBehavior};

use crate::error::EngineError;

/// One persisted chat message.
#[derive(Clone, Debug)]
pub struct StoredMessage {
    pub role: String,
    pub content: String,
    pub timestamp: String,
    pub sequence: i64,
    pub metadata: HashMap<String, String>,
}

/// One compressed block of older history.
#[derive(Clone, Debug)]
pub struct SummaryBlock {
    pub sequence_start: i64,
    pub sequence_end: i64,
    pub summary: String,
    pub key_decisions: Vec<String>,
    pub topics: Vec<String>,
    pub is_checkpoint: bool,
    pub checkpoint_reason: Option<String>,
    pub message_count: i64,
    pub created_at: String,
}

#[async_trait]
pub trait ChatHistoryStore: Send + Sync {
    /// Appends a message, allocating the next sequence atomically. Returns the
    /// allocated sequence.
    async fn append_message(
        &self,
        task_id: &str,
        role: &str,
        content: &str,
        metadata: HashMap<String, String>,
    ) -> Result<i64, EngineError>;

    /// Last `limit` messages, sorted by sequence ascending.
    async fn recent_messages(
        &self,
        task_id: &str,
        limit: u32,
    ) -> Result<Vec<StoredMessage>, EngineError>;

    /// Messages with `after < sequence < before`, ascending.
    async fn messages_between(
        &self,
        task_id: &str,
        after: i64,
        before: i64,
    ) -> Result<Vec<StoredMessage>, EngineError>;

    async fn count_messages(&self, task_id: &str) -> Result<i64, EngineError>;

    /// Last `limit` summary blocks, sorted by sequence_end ascending.
    async fn summaries(&self, task_id: &str, limit: u32)
        -> Result<Vec<SummaryBlock>, EngineError>;

    /// Highest summarized sequence, 0 when nothing is summarized yet.
    async fn last_summarized_sequence(&self, task_id: &str) -> Result<i64, EngineError>;

    async fn save_summary(&self, task_id: &str, block: SummaryBlock) -> Result<(), EngineError>;
}

/// SQLite-backed chat history. Tables `chat_messages` and `chat_summaries`.
pub struct SqliteChatHistory {
    db_path: std::path::PathBuf,
}

impl SqliteChatHistory {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let db_path = path.as_ref().to_path_buf();
        let conn = Self::open(&db_path)?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS chat_messages (
                task_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}'
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_task_seq
                ON chat_messages(task_id, sequence);
            CREATE TABLE IF NOT EXISTS chat_summaries (
                task_id TEXT NOT NULL,
                sequence_start INTEGER NOT NULL,
                sequence_end INTEGER NOT NULL,
                summary TEXT NOT NULL,
                key_decisions TEXT NOT NULL DEFAULT '[]',
                topics TEXT NOT NULL DEFAULT '[]',
                is_checkpoint INTEGER NOT NULL DEFAULT 0,
                checkpoint_reason TEXT,
                message_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_summaries_task_end
                ON chat_summaries(task_id, sequence_end);
            "#,
        )
        .map_err(|e| EngineError::History(e.to_string()))?;
        Ok(Self { db_path })
    }

    fn open(path: &Path) -> Result<Connection, EngineError> {
        let conn = Connection::open(path).map_err(|e| EngineError::History(e.to_string()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| EngineError::History(e.to_string()))?;
        conn.pragma_update(None, "busy_timeout", 30_000)
            .map_err(|e| EngineError::History(e.to_string()))?;
        Ok(conn)
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, EngineError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, EngineError> + Send + 'static,
    {
        let path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = Self::open(&path)?;
            f(&mut conn)
        })
        .await
        .map_err(|e| EngineError::History(e.to_string()))?
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
    let metadata: String = row.get(4)?;
    Ok(StoredMessage {
        role: row.get(0)?,
        content: row.get(1)?,
        timestamp: row.get(2)?,
        sequence: row.get(3)?,
        metadata: serde_json::from_str(&metadata).unwrap_or_default(),
    })
}

#[async_trait]
impl ChatHistoryStore for SqliteChatHistory {
    async fn append_message(
        &self,
        task_id: &str,
        role: &str,
        content: &str,
        metadata: HashMap<String, String>,
    ) -> Result<i64, EngineError> {
        let task_id = task_id.to_string();
        let role = role.to_string();
        let content = content.to_string();
        self.with_conn(move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|e| EngineError::History(e.to_string()))?;
            let next: i64 = tx
                .query_row(
                    "SELECT COALESCE(MAX(sequence), 0) + 1 FROM chat_messages WHERE task_id = ?1",
                    params![task_id],
                    |row| row.get(0),
                )
                .map_err(|e| EngineError::History(e.to_string()))?;
            tx.execute(
                "INSERT INTO chat_messages (task_id, role, content, timestamp, sequence, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    task_id,
                    role,
                    content,
                    Utc::now().to_rfc3339(),
                    next,
                    serde_json::to_string(&metadata)
                        .map_err(|e| EngineError::History(e.to_string()))?,
                ],
            )
            .map_err(|e| EngineError::History(e.to_string()))?;
            tx.commit().map_err(|e| EngineError::History(e.to_string()))?;
            Ok(next)
        })
        .await
    }

    async fn recent_messages(
        &self,
        task_id: &str,
        limit: u32,
    ) -> Result<Vec<StoredMessage>, EngineError> {
        let task_id = task_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT role, content, timestamp, sequence, metadata FROM chat_messages
                     WHERE task_id = ?1 ORDER BY sequence DESC LIMIT ?2",
                )
                .map_err(|e| EngineError::History(e.to_string()))?;
            let mut rows: Vec<StoredMessage> = stmt
                .query_map(params![task_id, limit], row_to_message)
                .map_err(|e| EngineError::History(e.to_string()))?
                .collect::<Result<_, _>>()
                .map_err(|e| EngineError::History(e.to_string()))?;
            rows.reverse();
            Ok(rows)
        })
        .await
    }

    async fn messages_between(
        &self,
        task_id: &str,
        after: i64,
        before: i64,
    ) -> Result<Vec<StoredMessage>, EngineError> {
        let task_id = task_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT role, content, timestamp, sequence, metadata FROM chat_messages
                     WHERE task_id = ?1 AND sequence > ?2 AND sequence < ?3
                     ORDER BY sequence ASC",
                )
                .map_err(|e| EngineError::History(e.to_string()))?;
            let rows = stmt
                .query_map(params![task_id, after, before], row_to_message)
                .map_err(|e| EngineError::History(e.to_string()))?
                .collect::<Result<_, _>>()
                .map_err(|e| EngineError::History(e.to_string()))?;
            Ok(rows)
        })
        .await
    }

    async fn count_messages(&self, task_id: &str) -> Result<i64, EngineError> {
        let task_id = task_id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM chat_messages WHERE task_id = ?1",
                params![task_id],
                |row| row.get(0),
            )
            .map_err(|e| EngineError::History(e.to_string()))
        })
        .await
    }

    async fn summaries(
        &self,
        task_id: &str,
        limit: u32,
    ) -> Result<Vec<SummaryBlock>, EngineError> {
        let task_id = task_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT sequence_start, sequence_end, summary, key_decisions, topics,
                            is_checkpoint, checkpoint_reason, message_count, created_at
                     FROM chat_summaries WHERE task_id = ?1
                     ORDER BY sequence_end DESC LIMIT ?2",
                )
                .map_err(|e| EngineError::History(e.to_string()))?;
            let mut rows: Vec<SummaryBlock> = stmt
                .query_map(params![task_id, limit], |row| {
                    let key_decisions: String = row.get(3)?;
                    let topics: String = row.get(4)?;
                    Ok(SummaryBlock {
                        sequence_start: row.get(0)?,
                        sequence_end: row.get(1)?,
                        summary: row.get(2)?,
                        key_decisions: serde_json::from_str(&key_decisions).unwrap_or_default(),
                        topics: serde_json::from_str(&topics).unwrap_or_default(),
                        is_checkpoint: row.get::<_, i64>(5)? != 0,
                        checkpoint_reason: row.get(6)?,
                        message_count: row.get(7)?,
                        created_at: row.get(8)?,
                    })
                })
                .map_err(|e| EngineError::History(e.to_string()))?
                .collect::<Result<_, _>>()
                .map_err(|e| EngineError::History(e.to_string()))?;
            rows.reverse();
            Ok(rows)
        })
        .await
    }

    async fn last_summarized_sequence(&self, task_id: &str) -> Result<i64, EngineError> {
        let task_id = task_id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT COALESCE(MAX(sequence_end), 0) FROM chat_summaries WHERE task_id = ?1",
                params![task_id],
                |row| row.get(0),
            )
            .map_err(|e| EngineError::History(e.to_string()))
        })
        .await
    }

    async fn save_summary(&self, task_id: &str, block: SummaryBlock) -> Result<(), EngineError> {
        let task_id = task_id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO chat_summaries (task_id, sequence_start, sequence_end, summary,
                     key_decisions, topics, is_checkpoint, checkpoint_reason, message_count, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    task_id,
                    block.sequence_start,
                    block.sequence_end,
                    block.summary,
                    serde_json::to_string(&block.key_decisions)
                        .map_err(|e| EngineError::History(e.to_string()))?,
                    serde_json::to_string(&block.topics)
                        .map_err(|e| EngineError::History(e.to_string()))?,
                    block.is_checkpoint as i64,
                    block.checkpoint_reason,
                    block.message_count,
                    block.created_at,
                ],
            )
            .map_err(|e| EngineError::History(e.to_string()))?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn append_allocates_monotonic_sequences() {
        let file = NamedTempFile::new().unwrap();
        let store = SqliteChatHistory::new(file.path()).unwrap();
        let s1 = store
            .append_message("t1", "USER", "hello", HashMap::new())
            .await
            .unwrap();
        let s2 = store
            .append_message("t1", "ASSISTANT", "hi", HashMap::new())
            .await
            .unwrap();
        assert_eq!((s1, s2), (1, 2));

        let msgs = store.recent_messages("t1", 10).await.unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].sequence, 1);
        assert_eq!(msgs[1].content, "hi");
    }

    #[tokio::test]
    async fn concurrent_appends_never_collide() {
        let file = NamedTempFile::new().unwrap();
        let store = std::sync::Arc::new(SqliteChatHistory::new(file.path()).unwrap());
        let mut handles = Vec::new();
        for i in 0..10 {
            let s = std::sync::Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                s.append_message("t1", "USER", &format!("m{i}"), HashMap::new())
                    .await
                    .unwrap()
            }));
        }
        let mut seqs = Vec::new();
        for h in handles {
            seqs.push(h.await.unwrap());
        }
        seqs.sort_unstable();
        assert_eq!(seqs, (1..=10).collect::<Vec<i64>>());
    }

    #[tokio::test]
    async fn sequences_are_per_task() {
        let file = NamedTempFile::new().unwrap();
        let store = SqliteChatHistory::new(file.path()).unwrap();
        assert_eq!(
            store
                .append_message("a", "USER", "x", HashMap::new())
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            store
                .append_message("b", "USER", "y", HashMap::new())
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn summary_round_trip() {
        let file = NamedTempFile::new().unwrap();
        let store = SqliteChatHistory::new(file.path()).unwrap();
        store
            .save_summary(
                "t1",
                SummaryBlock {
                    sequence_start: 1,
                    sequence_end: 20,
                    summary: "talked about onboarding".into(),
                    key_decisions: vec!["use tenant t-42".into()],
                    topics: vec!["onboarding".into()],
                    is_checkpoint: true,
                    checkpoint_reason: Some("topic change".into()),
                    message_count: 20,
                    created_at: Utc::now().to_rfc3339(),
                },
            )
            .await
            .unwrap();

        let blocks = store.summaries("t1", 15).await.unwrap();
        assert_eq!(blocks.len(), 1);
        assert!(blocks[0].is_checkpoint);
        assert_eq!(blocks[0].key_decisions, vec!["use tenant t-42"]);
        assert_eq!(store.last_summarized_sequence("t1").await.unwrap(), 20);
        assert_eq!(store.last_summarized_sequence("t2").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn messages_between_is_exclusive() {
        let file = NamedTempFile::new().unwrap();
        let store = SqliteChatHistory::new(file.path()).unwrap();
        for i in 0..5 {
            store
                .append_message("t1", "USER", &format!("m{i}"), HashMap::new())
                .await
                .unwrap();
        }
        let between = store.messages_between("t1", 1, 4).await.unwrap();
        let seqs: Vec<i64> = between.iter().map(|m| m.sequence).collect();
        assert_eq!(seqs, vec![2, 3]);
    }
}
