//! Durable pause/resume for human-in-the-loop gates.
//!
//! When a run needs user input (commit/push approval, an `ask_user` question)
//! it suspends: the full run state is serialized under its `thread_id` and the
//! interrupt payload is surfaced. A later `resume(thread_id, value)`, possibly
//! in a different process, reconstructs the state and re-enters the run.

use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("storage: {0}")]
    Storage(String),
    #[error("serialization: {0}")]
    Serialization(String),
    #[error("no checkpoint for thread {0}")]
    NotFound(String),
}

/// Why the run paused. One unified shape for both approval and ask_user gates.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InterruptPayload {
    /// `"approval"` or `"ask_user"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// What would happen next, e.g. `"commit"`, `"push"`, `"question"`.
    pub action: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changed_files: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub question: Option<String>,
}

impl InterruptPayload {
    pub fn ask_user(question: impl Into<String>) -> Self {
        let question = question.into();
        Self {
            kind: "ask_user".into(),
            action: "question".into(),
            description: question.clone(),
            branch: None,
            changed_files: vec![],
            question: Some(question),
        }
    }

    pub fn approval(
        action: impl Into<String>,
        description: impl Into<String>,
        branch: Option<String>,
        changed_files: Vec<String>,
    ) -> Self {
        Self {
            kind: "approval".into(),
            action: action.into(),
            description: description.into(),
            branch,
            changed_files,
            question: None,
        }
    }
}

/// What the user answered. Approval gates read `approved`/`reason`; ask_user
/// gates read `value` as the answer text.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResumeValue {
    pub approved: bool,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub value: Option<Value>,
}

/// One persisted pause: the interrupt plus the opaque run state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Checkpoint {
    pub thread_id: String,
    /// Which handler resumes this: `"chat"` or `"coding"`.
    pub run_kind: String,
    pub interrupt: InterruptPayload,
    pub state: Value,
    pub created_at: String,
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn put(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;
    async fn get(&self, thread_id: &str) -> Result<Option<Checkpoint>, CheckpointError>;
    /// Removes the checkpoint once the run resumed (idempotent).
    async fn delete(&self, thread_id: &str) -> Result<(), CheckpointError>;
}

/// SQLite-backed checkpoint store. Persistent across process restarts.
pub struct SqliteCheckpointStore {
    db_path: std::path::PathBuf,
}

impl SqliteCheckpointStore {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| CheckpointError::Storage(e.to_string()))?;
            }
        }
        let db_path = path.as_ref().to_path_buf();
        let conn =
            Connection::open(&db_path).map_err(|e| CheckpointError::Storage(e.to_string()))?;
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS run_checkpoints (
                thread_id TEXT PRIMARY KEY,
                run_kind TEXT NOT NULL,
                interrupt TEXT NOT NULL,
                state TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
            [],
        )
        .map_err(|e| CheckpointError::Storage(e.to_string()))?;
        Ok(Self { db_path })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, CheckpointError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, CheckpointError> + Send + 'static,
    {
        let path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn =
                Connection::open(&path).map_err(|e| CheckpointError::Storage(e.to_string()))?;
            f(&conn)
        })
        .await
        .map_err(|e| CheckpointError::Storage(e.to_string()))?
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn put(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let thread_id = checkpoint.thread_id.clone();
        let run_kind = checkpoint.run_kind.clone();
        let interrupt = serde_json::to_string(&checkpoint.interrupt)
            .map_err(|e| CheckpointError::Serialization(e.to_string()))?;
        let state = serde_json::to_string(&checkpoint.state)
            .map_err(|e| CheckpointError::Serialization(e.to_string()))?;
        let created_at = checkpoint.created_at.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO run_checkpoints
                 (thread_id, run_kind, interrupt, state, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![thread_id, run_kind, interrupt, state, created_at],
            )
            .map_err(|e| CheckpointError::Storage(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn get(&self, thread_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        let thread_id = thread_id.to_string();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT thread_id, run_kind, interrupt, state, created_at
                     FROM run_checkpoints WHERE thread_id = ?1",
                    params![thread_id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, String>(4)?,
                        ))
                    },
                )
                .optional()
                .map_err(|e| CheckpointError::Storage(e.to_string()))?;
            let Some((thread_id, run_kind, interrupt, state, created_at)) = row else {
                return Ok(None);
            };
            Ok(Some(Checkpoint {
                thread_id,
                run_kind,
                interrupt: serde_json::from_str(&interrupt)
                    .map_err(|e| CheckpointError::Serialization(e.to_string()))?,
                state: serde_json::from_str(&state)
                    .map_err(|e| CheckpointError::Serialization(e.to_string()))?,
                created_at,
            }))
        })
        .await
    }

    async fn delete(&self, thread_id: &str) -> Result<(), CheckpointError> {
        let thread_id = thread_id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM run_checkpoints WHERE thread_id = ?1",
                params![thread_id],
            )
            .map_err(|e| CheckpointError::Storage(e.to_string()))?;
            Ok(())
        })
        .await
    }
}

/// Builds a checkpoint with the current timestamp.
pub fn checkpoint_now(
    thread_id: impl Into<String>,
    run_kind: impl Into<String>,
    interrupt: InterruptPayload,
    state: Value,
) -> Checkpoint {
    Checkpoint {
        thread_id: thread_id.into(),
        run_kind: run_kind.into(),
        interrupt,
        state,
        created_at: Utc::now().to_rfc3339(),
    }
}
