//! Outbound push client for the external coordinator.
//!
//! The coordinator hosts the durable task store and the user-facing surfaces;
//! the engine pushes progress and terminal status to it and uses its internal
//! API for task bookkeeping tools. Every push is best-effort: a coordinator
//! outage must never abort an orchestration.

use std::time::Duration;

use serde_json::{json, Value};
use tracing::warn;

use crate::error::EngineError;

#[derive(Clone)]
pub struct CoordinatorClient {
    base_url: String,
    client: reqwest::Client,
}

impl CoordinatorClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(15))
                .build()
                .unwrap_or_default(),
        }
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value, EngineError> {
        let resp = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::CoordinatorPush(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(EngineError::CoordinatorPush(format!(
                "{} -> {}",
                path,
                resp.status()
            )));
        }
        Ok(resp.json().await.unwrap_or(Value::Null))
    }

    /// Fire-and-forget wrapper: failures are logged, not propagated.
    async fn push(&self, path: &str, body: Value) {
        if let Err(e) = self.post(path, body).await {
            warn!(path, error = %e, "coordinator push failed");
        }
    }

    // ── Progress & status pushes ────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub async fn report_progress(
        &self,
        task_id: &str,
        client_id: &str,
        node: &str,
        message: &str,
        percent: Option<u8>,
        goal_index: Option<u32>,
        total_goals: Option<u32>,
        step_index: Option<u32>,
        total_steps: Option<u32>,
    ) {
        self.push(
            "/internal/orchestrator-progress",
            json!({
                "taskId": task_id,
                "clientId": client_id,
                "node": node,
                "message": message,
                "percent": percent,
                "goalIndex": goal_index,
                "totalGoals": total_goals,
                "stepIndex": step_index,
                "totalSteps": total_steps,
            }),
        )
        .await;
    }

    /// Terminal status push: `done`, `error`, or `interrupted`.
    #[allow(clippy::too_many_arguments)]
    pub async fn report_status(
        &self,
        task_id: &str,
        thread_id: &str,
        status: &str,
        summary: Option<&str>,
        error: Option<&str>,
        interrupt_action: Option<&str>,
        interrupt_description: Option<&str>,
        branch: Option<&str>,
        artifacts: &[Value],
    ) {
        self.push(
            "/internal/orchestrator-status",
            json!({
                "taskId": task_id,
                "threadId": thread_id,
                "status": status,
                "summary": summary,
                "error": error,
                "interruptAction": interrupt_action,
                "interruptDescription": interrupt_description,
                "branch": branch,
                "artifacts": artifacts,
            }),
        )
        .await;
    }

    /// Transcript correction progress for a meeting.
    pub async fn report_correction_progress(
        &self,
        meeting_id: &str,
        client_id: &str,
        percent: u8,
        chunks_done: u32,
        total_chunks: u32,
        message: Option<&str>,
        tokens_generated: u64,
    ) {
        self.push(
            "/internal/correction-progress",
            json!({
                "meetingId": meeting_id,
                "clientId": client_id,
                "percent": percent,
                "chunksDone": chunks_done,
                "totalChunks": total_chunks,
                "message": message,
                "tokensGenerated": tokens_generated,
            }),
        )
        .await;
    }

    /// Foreground chat started: background inference should yield the GPU.
    pub async fn register_foreground_start(&self) {
        self.push("/internal/foreground-start", json!({})).await;
    }

    pub async fn register_foreground_end(&self) {
        self.push("/internal/foreground-end", json!({})).await;
    }

    // ── Task bookkeeping used by tools ──────────────────────────────────

    pub async fn create_background_task(
        &self,
        title: &str,
        description: &str,
        client_id: &str,
        project_id: Option<&str>,
        priority: &str,
    ) -> Result<String, EngineError> {
        let value = self
            .post(
                "/internal/tasks",
                json!({
                    "title": title,
                    "description": description,
                    "clientId": client_id,
                    "projectId": project_id,
                    "priority": priority,
                }),
            )
            .await?;
        Ok(value["id"].as_str().unwrap_or("created").to_string())
    }

    pub async fn search_tasks(
        &self,
        query: &str,
        state: Option<&str>,
        max_results: u32,
    ) -> Result<String, EngineError> {
        let value = self
            .post(
                "/internal/tasks/search",
                json!({"query": query, "state": state, "maxResults": max_results}),
            )
            .await?;
        Ok(value.to_string())
    }

    pub async fn respond_to_user_task(
        &self,
        task_id: &str,
        response: &str,
    ) -> Result<String, EngineError> {
        self.post(
            &format!("/internal/user-tasks/{task_id}/respond"),
            json!({"response": response}),
        )
        .await?;
        Ok(format!("User task {task_id} responded"))
    }

    /// Snapshot of clients and their projects for scope resolution.
    pub async fn get_clients_projects(&self) -> Result<Vec<Value>, EngineError> {
        let value = self.post("/internal/clients-projects", json!({})).await?;
        Ok(value
            .as_array()
            .cloned()
            .or_else(|| value["clients"].as_array().cloned())
            .unwrap_or_default())
    }

    /// Short summary of pending user tasks for the system prompt.
    pub async fn get_pending_user_tasks(&self, limit: u32) -> Result<Value, EngineError> {
        self.post("/internal/user-tasks/pending", json!({"limit": limit}))
            .await
    }
}
