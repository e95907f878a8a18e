//! Tool execution: dispatch by name, per-tool timeout, result clamping.
//!
//! Tool failures never abort the agentic loop: timeouts, bad arguments, and
//! unknown names all come back as string results so the model can decide what
//! to do next. The only non-string outcome is `ask_user`, which is a control
//! signal, not an execution.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::warn;

use crate::coordinator::CoordinatorClient;
use crate::error::EngineError;
use crate::memory::MemoryAgent;

/// Result of executing one tool call.
#[derive(Debug)]
pub enum ToolOutcome {
    /// Normal result text (already clamped).
    Output(String),
    /// Control signal: pause the run and surface a question to the user.
    AskUser { question: String },
}

/// Dispatches a coding-agent job. The real implementation acquires a pool slot
/// and launches a cluster job; tests plug in a stub.
#[async_trait]
pub trait CodingDispatcher: Send + Sync {
    async fn dispatch(
        &self,
        task_description: &str,
        client_id: &str,
        project_id: &str,
    ) -> Result<String, EngineError>;
}

/// A dispatcher for deployments without a cluster; always declines.
pub struct NoCodingDispatcher;

#[async_trait]
impl CodingDispatcher for NoCodingDispatcher {
    async fn dispatch(&self, _: &str, _: &str, _: &str) -> Result<String, EngineError> {
        Err(EngineError::JobApi("coding agents are not configured".into()))
    }
}

pub struct ToolExecutor {
    memory: Arc<Mutex<MemoryAgent>>,
    coordinator: CoordinatorClient,
    dispatcher: Arc<dyn CodingDispatcher>,
    timeout: Duration,
    max_result_chars: usize,
}

impl ToolExecutor {
    pub fn new(
        memory: Arc<Mutex<MemoryAgent>>,
        coordinator: CoordinatorClient,
        dispatcher: Arc<dyn CodingDispatcher>,
        timeout_s: u64,
        max_result_chars: usize,
    ) -> Self {
        Self {
            memory,
            coordinator,
            dispatcher,
            timeout: Duration::from_secs(timeout_s),
            max_result_chars,
        }
    }

    /// Executes one tool call under the per-tool timeout.
    pub async fn execute(
        &self,
        name: &str,
        args: &Value,
        client_id: &str,
        project_id: Option<&str>,
    ) -> ToolOutcome {
        if name == "ask_user" {
            let question = args["question"].as_str().unwrap_or("").to_string();
            return ToolOutcome::AskUser { question };
        }

        let result = tokio::time::timeout(
            self.timeout,
            self.execute_inner(name, args, client_id, project_id),
        )
        .await;

        let text = match result {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => {
                warn!(tool = name, error = %e, "tool failed");
                format!("Tool error: {e}")
            }
            Err(_) => {
                warn!(tool = name, timeout_s = self.timeout.as_secs(), "tool timed out");
                format!(
                    "Error: tool '{}' timed out after {}s.",
                    name,
                    self.timeout.as_secs()
                )
            }
        };
        ToolOutcome::Output(clamp_result(&text, self.max_result_chars))
    }

    async fn execute_inner(
        &self,
        name: &str,
        args: &Value,
        client_id: &str,
        project_id: Option<&str>,
    ) -> Result<String, EngineError> {
        let str_arg = |key: &str| -> String { args[key].as_str().unwrap_or("").to_string() };

        match name {
            "kb_search" | "memory_recall" => {
                let query = str_arg("query");
                if query.is_empty() {
                    return Ok("Error: 'query' is required.".into());
                }
                let results = {
                    let mut memory = self.memory.lock().await;
                    memory.search(&query, "all").await
                };
                if results.is_empty() {
                    return Ok(format!("No results for: {query}"));
                }
                let rendered: Vec<String> = results
                    .iter()
                    .take(5)
                    .map(|r| {
                        r["content"]
                            .as_str()
                            .unwrap_or(&r.to_string())
                            .chars()
                            .take(500)
                            .collect()
                    })
                    .collect();
                Ok(rendered.join("\n\n---\n\n"))
            }

            "memory_store" => {
                let subject = str_arg("subject");
                let content = str_arg("content");
                if subject.is_empty() || content.is_empty() {
                    return Ok("Error: 'subject' and 'content' are required.".into());
                }
                let category = args["category"].as_str().unwrap_or("fact").to_string();
                let mut memory = self.memory.lock().await;
                Ok(memory.store(&subject, &content, &category, None).await)
            }

            "list_affairs" => {
                let memory = self.memory.lock().await;
                Ok(memory.render_affairs())
            }

            "create_background_task" => {
                let title = str_arg("title");
                let description = str_arg("description");
                let target_client = args["client_id"].as_str().unwrap_or(client_id);
                let target_project = args["project_id"].as_str().or(project_id);
                let priority = args["priority"].as_str().unwrap_or("medium");
                let id = self
                    .coordinator
                    .create_background_task(&title, &description, target_client, target_project, priority)
                    .await?;
                Ok(format!("Background task created: {id}"))
            }

            "dispatch_coding_agent" => {
                let description = str_arg("task_description");
                let target_client = args["client_id"].as_str().unwrap_or(client_id);
                let target_project = args["project_id"]
                    .as_str()
                    .or(project_id)
                    .unwrap_or_default();
                let result = self
                    .dispatcher
                    .dispatch(&description, target_client, target_project)
                    .await?;
                Ok(format!("Coding agent dispatched: {result}"))
            }

            "search_tasks" => {
                let query = str_arg("query");
                let state = args["state"].as_str();
                let max = args["max_results"].as_u64().unwrap_or(5) as u32;
                self.coordinator.search_tasks(&query, state, max).await
            }

            "respond_to_user_task" => {
                let task_id = str_arg("task_id");
                let response = str_arg("response");
                self.coordinator
                    .respond_to_user_task(&task_id, &response)
                    .await
            }

            "switch_context" => {
                // Resolved by the chat loop against its runtime snapshot.
                Ok("switch_context is only available in foreground chat.".into())
            }

            other => Ok(format!(
                "Unknown tool: {other}. Use one of the offered tools."
            )),
        }
    }
}

/// Clamps a tool result to `max` characters, preserving head and tail around a
/// truncation marker. A string of exactly `max` characters is unchanged.
pub fn clamp_result(s: &str, max: usize) -> String {
    const MARKER: &str = "\n…TRUNCATED…\n";
    let chars: Vec<char> = s.chars().collect();
    if chars.len() <= max {
        return s.to_string();
    }
    let head_len = max / 2;
    let tail_len = max - head_len;
    let head: String = chars[..head_len].iter().collect();
    let tail: String = chars[chars.len() - tail_len..].iter().collect();
    format!("{head}{MARKER}{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_at_boundary_is_identity() {
        let s = "x".repeat(100);
        assert_eq!(clamp_result(&s, 100), s);
    }

    #[test]
    fn clamp_over_boundary_keeps_head_and_tail() {
        let s = format!("HEAD{}TAIL", "x".repeat(200));
        let clamped = clamp_result(&s, 100);
        assert!(clamped.contains("…TRUNCATED…"));
        assert!(clamped.starts_with("HEAD"));
        assert!(clamped.ends_with("TAIL"));
        // head + tail budget is exactly `max` characters.
        let body: String = clamped.replace("\n…TRUNCATED…\n", "");
        assert_eq!(body.chars().count(), 100);
    }

    #[test]
    fn clamp_handles_multibyte_text() {
        let s = "příliš žluťoučký kůň".repeat(20);
        let clamped = clamp_result(&s, 50);
        assert!(clamped.contains("…TRUNCATED…"));
    }
}
