//! The foreground chat loop.
//!
//! One handler instance serves the process; each request runs as a spawned
//! task writing [`ChatEvent`]s into a bounded channel (the SSE layer drains
//! it). The loop alternates LLM turns and tool executions until the model
//! produces a textual answer, the iteration budget runs out, the user cancels,
//! or an `ask_user` call pauses the run into a durable checkpoint.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use stream_event::{ChatEvent, ScopeChange};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::approval::{checkpoint_now, CheckpointStore, InterruptPayload, ResumeValue};
use crate::context::ChatContextAssembler;
use crate::coordinator::CoordinatorClient;
use crate::error::EngineError;
use crate::llm::{CallOptions, LlmClient, LlmPriority, ModelTier};
use crate::memory::MemoryAgent;
use crate::message::ChatMessage;
use crate::settings::EngineSettings;
use crate::tools::{self, extract_tool_calls, ToolExecutor, ToolOutcome};

use super::describe::describe_tool_call;
use super::runtime::{RuntimeContext, RuntimeContextCache};

/// One incoming chat message.
///
/// `session_id` may be omitted; the HTTP surface assigns a fresh one before
/// the handler runs, so the handler itself always sees a non-empty id.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ChatRequest {
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub active_client_id: Option<String>,
    #[serde(default)]
    pub active_project_id: Option<String>,
    pub message: String,
    #[serde(default)]
    pub message_sequence: i64,
    #[serde(default)]
    pub context_task_id: Option<String>,
}

/// Serializable loop state; checkpointed whole on an ask_user pause.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatLoopState {
    pub session_id: String,
    pub client_id: Option<String>,
    pub project_id: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub iteration: u32,
    pub used_tools: Vec<String>,
    pub tool_summaries: Vec<String>,
    /// The ask_user tool call awaiting its answer.
    pub pending_tool_call_id: Option<String>,
}

enum LoopOutcome {
    /// Terminal event already emitted.
    Finished,
    /// Checkpointed; terminal event already emitted.
    Paused,
}

pub struct ChatHandler {
    llm: Arc<dyn LlmClient>,
    assembler: Arc<ChatContextAssembler>,
    executor: Arc<ToolExecutor>,
    memory: Arc<Mutex<MemoryAgent>>,
    coordinator: CoordinatorClient,
    checkpoints: Arc<dyn CheckpointStore>,
    runtime_cache: Arc<RuntimeContextCache>,
    settings: Arc<EngineSettings>,
}

impl ChatHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        llm: Arc<dyn LlmClient>,
        assembler: Arc<ChatContextAssembler>,
        executor: Arc<ToolExecutor>,
        memory: Arc<Mutex<MemoryAgent>>,
        coordinator: CoordinatorClient,
        checkpoints: Arc<dyn CheckpointStore>,
        runtime_cache: Arc<RuntimeContextCache>,
        settings: Arc<EngineSettings>,
    ) -> Self {
        Self {
            llm,
            assembler,
            executor,
            memory,
            coordinator,
            checkpoints,
            runtime_cache,
            settings,
        }
    }

    /// Starts processing a chat message; events arrive on the returned channel.
    /// Cancelling the token between iterations stops the run with a partial
    /// save.
    pub fn handle(
        self: &Arc<Self>,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<ChatEvent> {
        let (tx, rx) = mpsc::channel(64);
        let handler = Arc::clone(self);
        tokio::spawn(async move {
            handler.run(request, tx, cancel).await;
        });
        rx
    }

    /// Resumes a paused run with the user's answer.
    pub async fn resume(
        self: &Arc<Self>,
        thread_id: &str,
        value: ResumeValue,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<ChatEvent>, EngineError> {
        let checkpoint = self
            .checkpoints
            .get(thread_id)
            .await
            .map_err(|e| EngineError::Checkpoint(e.to_string()))?
            .ok_or_else(|| EngineError::Checkpoint(format!("no checkpoint for {thread_id}")))?;
        if checkpoint.run_kind != "chat" {
            return Err(EngineError::Checkpoint(format!(
                "thread {thread_id} is a {} run",
                checkpoint.run_kind
            )));
        }
        let mut state: ChatLoopState = serde_json::from_value(checkpoint.state)?;
        self.checkpoints
            .delete(thread_id)
            .await
            .map_err(|e| EngineError::Checkpoint(e.to_string()))?;

        // The user's answer becomes the pending tool call's result.
        let answer = value
            .value
            .as_ref()
            .and_then(Value::as_str)
            .map(str::to_string)
            .or(value.reason.clone())
            .unwrap_or_else(|| if value.approved { "yes" } else { "no" }.to_string());
        if let Some(call_id) = state.pending_tool_call_id.take() {
            state
                .messages
                .push(ChatMessage::tool_result(call_id, answer));
        } else {
            state.messages.push(ChatMessage::user(answer));
        }

        let (tx, rx) = mpsc::channel(64);
        let handler = Arc::clone(self);
        tokio::spawn(async move {
            handler.run_resumed(state, tx, cancel).await;
        });
        Ok(rx)
    }

    async fn run(
        self: Arc<Self>,
        request: ChatRequest,
        tx: mpsc::Sender<ChatEvent>,
        cancel: CancellationToken,
    ) {
        self.coordinator.register_foreground_start().await;

        let runtime = self.runtime_cache.load().await;
        let mut state = self.build_initial_state(&request, &runtime).await;

        let result = self.agentic_loop(&mut state, &runtime, &tx, &cancel).await;
        self.finish(state, result, &tx).await;
        self.coordinator.register_foreground_end().await;
    }

    async fn run_resumed(
        self: Arc<Self>,
        mut state: ChatLoopState,
        tx: mpsc::Sender<ChatEvent>,
        cancel: CancellationToken,
    ) {
        self.coordinator.register_foreground_start().await;
        let runtime = self.runtime_cache.load().await;
        let result = self.agentic_loop(&mut state, &runtime, &tx, &cancel).await;
        self.finish(state, result, &tx).await;
        self.coordinator.register_foreground_end().await;
    }

    async fn finish(
        &self,
        state: ChatLoopState,
        result: Result<LoopOutcome, EngineError>,
        tx: &mpsc::Sender<ChatEvent>,
    ) {
        let Err(e) = result else {
            return;
        };
        warn!(session = %state.session_id, error = %e, "chat handler error");
        if !state.tool_summaries.is_empty() {
            let partial = format!(
                "I ran {} operations but hit an error:\n{}\n\nError: {e}",
                state.tool_summaries.len(),
                state
                    .tool_summaries
                    .iter()
                    .map(|s| format!("- {s}"))
                    .collect::<Vec<_>>()
                    .join("\n"),
            );
            let metadata = [
                ("interrupted".to_string(), "true".to_string()),
                ("error".to_string(), e.to_string()),
            ]
            .into_iter()
            .collect();
            if let Err(save_err) = self
                .assembler
                .store()
                .append_message(&state.session_id, "ASSISTANT", &partial, metadata)
                .await
            {
                warn!(error = %save_err, "failed to save partial response");
            }
        }
        let _ = tx
            .send(ChatEvent::Error {
                content: e.to_string(),
                metadata: Some(json!({"error": e.to_string()})),
            })
            .await;
    }

    async fn build_initial_state(
        &self,
        request: &ChatRequest,
        runtime: &RuntimeContext,
    ) -> ChatLoopState {
        let memory_context = {
            let mut memory = self.memory.lock().await;
            memory.load_session().await;
            memory.compose_context(2000)
        };

        let mut messages = vec![ChatMessage::system(build_system_prompt(
            request.active_client_id.as_deref(),
            request.active_project_id.as_deref(),
            runtime,
        ))];
        messages.extend(
            self.assembler
                .assemble_context(
                    &request.session_id,
                    (!memory_context.is_empty()).then_some(memory_context.as_str()),
                )
                .await,
        );
        if let Some(task_id) = &request.context_task_id {
            messages.push(ChatMessage::system(format!(
                "[Task context {task_id}] The user is answering this task's question \
                 in the next message. After processing the answer, call respond_to_user_task."
            )));
        }
        messages.push(ChatMessage::user(request.message.clone()));

        ChatLoopState {
            session_id: request.session_id.clone(),
            client_id: request.active_client_id.clone(),
            project_id: request.active_project_id.clone(),
            messages,
            iteration: 0,
            used_tools: vec![],
            tool_summaries: vec![],
            pending_tool_call_id: None,
        }
    }

    async fn agentic_loop(
        &self,
        state: &mut ChatLoopState,
        runtime: &RuntimeContext,
        tx: &mpsc::Sender<ChatEvent>,
        cancel: &CancellationToken,
    ) -> Result<LoopOutcome, EngineError> {
        let max_iterations = self.settings.max_iterations_chat;
        let chat_tools = tools::chat_toolset()
            .map_err(|e| EngineError::LlmFailure(format!("tool specs: {e}")))?;
        let tools_wire = tools::to_wire(&chat_tools);
        let tools_chars = tools_wire.to_string().len();

        let mut last_signature: Option<String> = None;
        let mut consecutive_same = 0u32;

        while state.iteration < max_iterations {
            if cancel.is_cancelled() {
                return self.handle_interrupted(state, tx).await;
            }
            state.iteration += 1;
            info!(
                session = %state.session_id,
                iteration = state.iteration,
                max_iterations,
                "chat iteration"
            );

            // Rough budget: 1 token ≈ 4 chars, plus the response reserve.
            let message_chars: usize = state.messages.iter().map(ChatMessage::approx_chars).sum();
            let estimated_tokens = (message_chars / 4 + tools_chars / 4 + 4096) as u32;
            let tier = ModelTier::select_local(estimated_tokens);

            let opts = CallOptions::new(tier, LlmPriority::Critical).with_tools(tools_wire.clone());
            let response = self.llm.chat(&state.messages, &opts).await?;
            let extracted = extract_tool_calls(&response);

            if extracted.tool_calls.is_empty() {
                let final_text = extracted
                    .remaining_text
                    .unwrap_or_else(|| response.content.clone());
                info!(
                    session = %state.session_id,
                    iterations = state.iteration,
                    chars = final_text.len(),
                    "final answer"
                );
                self.emit_answer(state, &final_text, tx, json!({}), None).await?;
                return Ok(LoopOutcome::Finished);
            }

            // Loop detection on the canonical call-list signature.
            let signature = extracted
                .tool_calls
                .iter()
                .map(|c| c.signature())
                .collect::<Vec<_>>()
                .join("|");
            if last_signature.as_deref() == Some(signature.as_str()) {
                consecutive_same += 1;
            } else {
                consecutive_same = 1;
                last_signature = Some(signature);
            }
            if consecutive_same >= 2 {
                warn!(session = %state.session_id, "tool loop detected, forcing answer");
                state.messages.push(ChatMessage::system(
                    "STOP — you are repeating the same tool call with the same arguments. \
                     Answer the user with what you know. Do not call any more tools.",
                ));
                let opts = CallOptions::new(tier, LlmPriority::Critical);
                let break_response = self.llm.chat(&state.messages, &opts).await?;
                let final_text = if break_response.content.is_empty() {
                    "I don't have enough information to answer.".to_string()
                } else {
                    break_response.content
                };
                self.emit_answer(
                    state,
                    &final_text,
                    tx,
                    json!({"loop_break": true}),
                    Some(("loop_break", "true")),
                )
                .await?;
                return Ok(LoopOutcome::Finished);
            }

            // Echo the assistant turn (with its tool calls) back to the model.
            let raw_calls: Vec<Value> = extracted
                .tool_calls
                .iter()
                .map(|c| {
                    json!({
                        "id": c.id,
                        "type": "function",
                        "function": {"name": c.name, "arguments": c.arguments},
                    })
                })
                .collect();
            state.messages.push(ChatMessage::assistant_with_tool_calls(
                extracted.remaining_text.clone(),
                Value::Array(raw_calls),
            ));

            for call in &extracted.tool_calls {
                let _ = tx
                    .send(ChatEvent::thinking(describe_tool_call(
                        &call.name,
                        &call.arguments,
                    )))
                    .await;
                let _ = tx
                    .send(ChatEvent::ToolCall {
                        content: call.name.clone(),
                        metadata: json!({"tool": call.name, "args": call.arguments}),
                    })
                    .await;

                let result_text = if call.name == "switch_context" {
                    self.handle_switch_context(state, runtime, &call.arguments, tx)
                        .await
                } else {
                    let outcome = self
                        .executor
                        .execute(
                            &call.name,
                            &call.arguments,
                            state.client_id.as_deref().unwrap_or(""),
                            state.project_id.as_deref(),
                        )
                        .await;
                    match outcome {
                        ToolOutcome::Output(text) => {
                            self.detect_scope_change(state, runtime, &call.arguments, tx)
                                .await;
                            text
                        }
                        ToolOutcome::AskUser { question } => {
                            return self
                                .pause_for_question(state, &call.id, question, tx)
                                .await;
                        }
                    }
                };

                state.used_tools.push(call.name.clone());
                state.tool_summaries.push(format!(
                    "{}: {}",
                    call.name,
                    result_text.chars().take(100).collect::<String>()
                ));

                let _ = tx
                    .send(ChatEvent::ToolResult {
                        content: result_text.chars().take(500).collect(),
                        metadata: json!({"tool": call.name}),
                    })
                    .await;
                state
                    .messages
                    .push(ChatMessage::tool_result(call.id.clone(), result_text));
            }
        }

        // Budget exhausted: one more call with tools disabled.
        warn!(session = %state.session_id, max_iterations, "max iterations reached");
        state.messages.push(ChatMessage::system(
            "You have reached the operation limit. Answer the user with what you know. \
             Do not call any tools.",
        ));
        let opts = CallOptions::new(ModelTier::LocalStandard, LlmPriority::Critical);
        let final_response = self.llm.chat(&state.messages, &opts).await?;
        let final_text = if final_response.content.is_empty() {
            "I ran out of operations before finishing. Here is what I have so far.".to_string()
        } else {
            final_response.content
        };
        self.emit_answer(
            state,
            &final_text,
            tx,
            json!({"max_iterations": true}),
            Some(("max_iterations", "true")),
        )
        .await?;
        Ok(LoopOutcome::Finished)
    }

    /// Streams the answer in fixed-size chunks, persists it with an atomically
    /// allocated sequence, triggers compression, and emits `done`.
    async fn emit_answer(
        &self,
        state: &ChatLoopState,
        final_text: &str,
        tx: &mpsc::Sender<ChatEvent>,
        mut done_metadata: Value,
        extra_metadata: Option<(&str, &str)>,
    ) -> Result<(), EngineError> {
        let chunk_chars = self.settings.stream_chunk_chars.max(1);
        let chars: Vec<char> = final_text.chars().collect();
        for chunk in chars.chunks(chunk_chars) {
            let _ = tx
                .send(ChatEvent::token(chunk.iter().collect::<String>()))
                .await;
            tokio::time::sleep(Duration::from_millis(30)).await;
        }

        let mut metadata: std::collections::HashMap<String, String> = Default::default();
        if !state.used_tools.is_empty() {
            metadata.insert("used_tools".into(), state.used_tools.join(","));
        }
        if let Some((k, v)) = extra_metadata {
            metadata.insert(k.into(), v.into());
        }
        self.assembler
            .store()
            .append_message(&state.session_id, "ASSISTANT", final_text, metadata)
            .await?;

        self.assembler.maybe_compress(&state.session_id).await;
        {
            let mut memory = self.memory.lock().await;
            memory.flush_session().await;
        }

        if let Some(obj) = done_metadata.as_object_mut() {
            obj.insert("iterations".into(), json!(state.iteration));
            obj.insert("used_tools".into(), json!(state.used_tools));
        }
        let _ = tx.send(ChatEvent::done(done_metadata)).await;
        Ok(())
    }

    async fn handle_interrupted(
        &self,
        state: &mut ChatLoopState,
        tx: &mpsc::Sender<ChatEvent>,
    ) -> Result<LoopOutcome, EngineError> {
        info!(
            session = %state.session_id,
            iterations = state.iteration,
            "chat stopped by user"
        );
        if !state.tool_summaries.is_empty() {
            let partial = format!(
                "[Interrupted after {} operations]\n{}",
                state.tool_summaries.len(),
                state
                    .tool_summaries
                    .iter()
                    .map(|s| format!("- {s}"))
                    .collect::<Vec<_>>()
                    .join("\n"),
            );
            let metadata = [("interrupted".to_string(), "true".to_string())]
                .into_iter()
                .collect();
            self.assembler
                .store()
                .append_message(&state.session_id, "ASSISTANT", &partial, metadata)
                .await?;
        }
        let _ = tx
            .send(ChatEvent::done(json!({"interrupted": true})))
            .await;
        Ok(LoopOutcome::Finished)
    }

    async fn pause_for_question(
        &self,
        state: &mut ChatLoopState,
        call_id: &str,
        question: String,
        tx: &mpsc::Sender<ChatEvent>,
    ) -> Result<LoopOutcome, EngineError> {
        state.pending_tool_call_id = Some(call_id.to_string());
        let interrupt = InterruptPayload::ask_user(question.clone());
        let checkpoint = checkpoint_now(
            state.session_id.clone(),
            "chat",
            interrupt.clone(),
            serde_json::to_value(&*state)?,
        );
        self.checkpoints
            .put(&checkpoint)
            .await
            .map_err(|e| EngineError::Checkpoint(e.to_string()))?;
        info!(session = %state.session_id, "chat paused for user question");
        let _ = tx
            .send(ChatEvent::done(json!({
                "paused": true,
                "thread_id": state.session_id,
                "interrupt": interrupt,
            })))
            .await;
        Ok(LoopOutcome::Paused)
    }

    async fn handle_switch_context(
        &self,
        state: &mut ChatLoopState,
        runtime: &RuntimeContext,
        args: &Value,
        tx: &mpsc::Sender<ChatEvent>,
    ) -> String {
        let client_query = args["client"].as_str().unwrap_or("");
        let Some(client) = runtime.resolve_client(client_query) else {
            return format!(
                "Client '{client_query}' not found. Available clients: {}",
                runtime.available_client_names()
            );
        };
        let client_id = client["id"].as_str().unwrap_or("").to_string();
        let client_name = client["name"].as_str().unwrap_or("").to_string();

        let mut message = format!("Switched to {client_name}");
        let mut project_id = String::new();
        let mut project_name = String::new();
        if let Some(project_query) = args["project"].as_str().filter(|p| !p.is_empty()) {
            match runtime.resolve_project(client, project_query) {
                Some(project) => {
                    project_id = project["id"].as_str().unwrap_or("").to_string();
                    project_name = project["name"].as_str().unwrap_or("").to_string();
                    message = format!("Switched to {client_name} / {project_name}");
                }
                None => {
                    let available: Vec<&str> = client["projects"]
                        .as_array()
                        .into_iter()
                        .flatten()
                        .filter_map(|p| p["name"].as_str())
                        .collect();
                    message = format!(
                        "Switched to {client_name}, but project '{project_query}' was not found. \
                         Available projects: {}",
                        available.join(", ")
                    );
                }
            }
        }

        state.client_id = Some(client_id.clone());
        state.project_id = (!project_id.is_empty()).then(|| project_id.clone());
        let _ = tx
            .send(ChatEvent::ScopeChange {
                metadata: ScopeChange {
                    client_id: client_id.clone(),
                    client_name,
                    project_id,
                    project_name,
                    projects: runtime.client_projects(&client_id),
                },
            })
            .await;
        message
    }

    /// A tool invoked with a different client/project than the current scope
    /// moves the conversation there.
    async fn detect_scope_change(
        &self,
        state: &mut ChatLoopState,
        runtime: &RuntimeContext,
        args: &Value,
        tx: &mpsc::Sender<ChatEvent>,
    ) {
        let tool_client = args["client_id"].as_str().filter(|s| !s.is_empty());
        let tool_project = args["project_id"].as_str().filter(|s| !s.is_empty());

        let (new_client, new_project) = match (tool_client, tool_project) {
            (Some(c), p) if Some(c.to_string()) != state.client_id => {
                (c.to_string(), p.map(str::to_string))
            }
            (_, Some(p)) if Some(p.to_string()) != state.project_id => (
                state.client_id.clone().unwrap_or_default(),
                Some(p.to_string()),
            ),
            _ => return,
        };
        if new_client.is_empty() {
            return;
        }

        state.client_id = Some(new_client.clone());
        state.project_id = new_project.clone();
        let project_id = new_project.unwrap_or_default();
        let _ = tx
            .send(ChatEvent::ScopeChange {
                metadata: ScopeChange {
                    client_name: runtime.client_name(&new_client).unwrap_or_default(),
                    project_name: runtime
                        .project_name(&new_client, &project_id)
                        .unwrap_or_default(),
                    projects: runtime.client_projects(&new_client),
                    client_id: new_client,
                    project_id,
                },
            })
            .await;
    }
}

fn build_system_prompt(
    client_id: Option<&str>,
    project_id: Option<&str>,
    runtime: &RuntimeContext,
) -> String {
    let mut prompt = String::from(
        "You are an operations assistant with access to the client knowledge base, \
         durable memory, and task tooling.\n\
         Rules:\n\
         - Use tools to look up facts instead of guessing.\n\
         - For work that takes longer than a chat turn, create a background task.\n\
         - For repository changes, dispatch a coding agent.\n\
         - Answer in the user's language.\n",
    );
    if let Some(client) = client_id {
        let name = runtime.client_name(client).unwrap_or_else(|| client.to_string());
        prompt.push_str(&format!("\nActive client: {name}"));
        if let Some(project) = project_id {
            let pname = runtime
                .project_name(client, project)
                .unwrap_or_else(|| project.to_string());
            prompt.push_str(&format!(" / {pname}"));
        }
        prompt.push('\n');
    }
    let known = runtime.available_client_names();
    if !known.is_empty() {
        prompt.push_str(&format!("Known clients: {known}\n"));
    }
    if let Some(count) = runtime.pending_user_tasks["count"].as_u64().filter(|c| *c > 0) {
        prompt.push_str(&format!("Pending user tasks: {count}\n"));
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::SqliteCheckpointStore;
    use crate::context::{ChatHistoryStore, SqliteChatHistory};
    use crate::llm::MockLlm;
    use crate::memory::{global_lqm, KbClient};
    use crate::settings::{
        EngineSettings, EscalationSettings, MemorySettings, PoolSettings, QueueSettings,
    };
    use crate::tools::NoCodingDispatcher;

    fn test_settings() -> Arc<EngineSettings> {
        Arc::new(EngineSettings {
            router_url: "http://router.invalid:1".into(),
            knowledgebase_url: "http://kb.invalid:1".into(),
            coordinator_url: "http://coordinator.invalid:1".into(),
            max_iterations_chat: 5,
            max_iterations_background: 5,
            compress_threshold: 20,
            stream_chunk_chars: 40,
            heartbeat_dead_seconds: 300,
            max_tool_result_chars: 8000,
            tool_execution_timeout_s: 5,
            max_concurrent_local_llm: 2,
            max_concurrent_cloud_llm: 2,
            history_db_path: String::new(),
            checkpoint_db_path: String::new(),
            queue_db_dir: String::new(),
            workspace_root: "/tmp".into(),
            k8s_api_url: "http://k8s.invalid:1".into(),
            k8s_namespace: "agents".into(),
            job_ttl_seconds: 600,
            pool: PoolSettings {
                max_concurrent_aider: 1,
                max_concurrent_openhands: 1,
                max_concurrent_claude: 1,
                max_concurrent_junie: 1,
                pool_wait_timeout_s: 1,
                stuck_job_timeout_multiplier: 1.5,
                agent_timeout_aider_s: 60,
                agent_timeout_openhands_s: 60,
                agent_timeout_claude_s: 60,
                agent_timeout_junie_s: 60,
            },
            memory: MemorySettings {
                lqm_max_warm_entries: 64,
                lqm_warm_ttl_seconds: 3600,
                lqm_write_buffer_max: 64,
                context_switch_confidence_threshold: 0.7,
                use_procedural_memory: true,
            },
            queue: QueueSettings {
                stale_threshold_minutes: 30,
                max_attempts: 3,
            },
            escalation: EscalationSettings {
                max_escalation_retries: 3,
                min_answer_chars: 10,
                tool_parse_failure_ratio: 0.5,
            },
        })
    }

    struct Fixture {
        handler: Arc<ChatHandler>,
        store: Arc<dyn ChatHistoryStore>,
        checkpoints: Arc<SqliteCheckpointStore>,
        _tmp: tempfile::TempDir,
    }

    fn fixture(llm: MockLlm) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let settings = test_settings();
        let llm: Arc<dyn LlmClient> = Arc::new(llm);
        let store: Arc<dyn ChatHistoryStore> =
            Arc::new(SqliteChatHistory::new(tmp.path().join("history.db")).unwrap());
        let assembler = Arc::new(ChatContextAssembler::new(
            Arc::clone(&store),
            Arc::clone(&llm),
            settings.compress_threshold,
        ));
        let coordinator = CoordinatorClient::new(settings.coordinator_url.as_str());
        let memory = Arc::new(Mutex::new(MemoryAgent::new(
            "test-client",
            None,
            global_lqm(&settings.memory),
            KbClient::new(settings.knowledgebase_url.as_str()),
            Arc::clone(&llm),
            &settings.memory,
        )));
        let executor = Arc::new(ToolExecutor::new(
            Arc::clone(&memory),
            coordinator.clone(),
            Arc::new(NoCodingDispatcher),
            settings.tool_execution_timeout_s,
            settings.max_tool_result_chars,
        ));
        let checkpoints =
            Arc::new(SqliteCheckpointStore::new(tmp.path().join("checkpoints.db")).unwrap());
        let runtime_cache = Arc::new(RuntimeContextCache::new(coordinator.clone()));
        let handler = Arc::new(ChatHandler::new(
            llm,
            assembler,
            executor,
            memory,
            coordinator,
            checkpoints.clone(),
            runtime_cache,
            settings,
        ));
        Fixture {
            handler,
            store,
            checkpoints,
            _tmp: tmp,
        }
    }

    fn request(session: &str, message: &str) -> ChatRequest {
        ChatRequest {
            session_id: session.into(),
            active_client_id: Some("c1".into()),
            active_project_id: None,
            message: message.into(),
            message_sequence: 0,
            context_task_id: None,
        }
    }

    #[test]
    fn request_without_session_id_parses_to_empty() {
        let parsed: ChatRequest =
            serde_json::from_str(r#"{"message": "hello"}"#).unwrap();
        assert!(parsed.session_id.is_empty());
        assert_eq!(parsed.message, "hello");
    }

    async fn drain(mut rx: mpsc::Receiver<ChatEvent>) -> Vec<ChatEvent> {
        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            events.push(ev);
        }
        events
    }

    fn tokens_joined(events: &[ChatEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                ChatEvent::Token { content } => Some(content.as_str()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn plain_answer_streams_tokens_and_persists_once() {
        let fx = fixture(MockLlm::with_replies(vec![MockLlm::text(
            "The knowledge base holds 42 documents for this client.",
        )]));
        let rx = fx
            .handler
            .handle(request("s-plain", "how many documents?"), CancellationToken::new());
        let events = drain(rx).await;

        assert_eq!(
            tokens_joined(&events),
            "The knowledge base holds 42 documents for this client."
        );
        assert!(matches!(events.last(), Some(ChatEvent::Done { .. })));

        let persisted = fx.store.recent_messages("s-plain", 10).await.unwrap();
        assert_eq!(persisted.len(), 1, "exactly one assistant message per turn");
        assert_eq!(persisted[0].role, "ASSISTANT");
    }

    #[tokio::test]
    async fn tool_loop_detection_forces_tool_free_answer() {
        let repeated = || MockLlm::tool_call("kb_search", json!({"query": "X"}));
        let llm = MockLlm::with_replies(vec![
            repeated(),
            repeated(),
            MockLlm::text("Based on the search, here is what I found about X."),
        ]);
        let fx = fixture(llm);
        let rx = fx
            .handler
            .handle(request("s-loop", "search for X"), CancellationToken::new());
        let events = drain(rx).await;

        let done_meta = match events.last() {
            Some(ChatEvent::Done { metadata }) => metadata.clone(),
            other => panic!("expected done, got {other:?}"),
        };
        assert_eq!(done_meta["loop_break"], true);
        assert!(tokens_joined(&events).contains("what I found"));
    }

    #[tokio::test]
    async fn ask_user_pauses_and_resume_completes() {
        let llm = MockLlm::with_replies(vec![
            MockLlm::tool_call("ask_user", json!({"question": "Which environment?"})),
            MockLlm::text("Deploying to staging as you asked."),
        ]);
        let fx = fixture(llm);
        let rx = fx
            .handler
            .handle(request("s-pause", "deploy the app"), CancellationToken::new());
        let events = drain(rx).await;

        let done_meta = match events.last() {
            Some(ChatEvent::Done { metadata }) => metadata.clone(),
            other => panic!("expected done, got {other:?}"),
        };
        assert_eq!(done_meta["paused"], true);
        assert_eq!(done_meta["interrupt"]["question"], "Which environment?");

        let checkpoint = fx.checkpoints.get("s-pause").await.unwrap().unwrap();
        assert_eq!(checkpoint.run_kind, "chat");

        let rx = fx
            .handler
            .resume(
                "s-pause",
                ResumeValue {
                    approved: true,
                    reason: None,
                    value: Some(json!("staging")),
                },
                CancellationToken::new(),
            )
            .await
            .unwrap();
        let events = drain(rx).await;
        assert!(tokens_joined(&events).contains("staging"));
        assert!(
            fx.checkpoints.get("s-pause").await.unwrap().is_none(),
            "checkpoint consumed on resume"
        );
    }

    #[tokio::test]
    async fn max_iterations_forces_final_answer_without_tools() {
        // Five iterations of distinct tool calls, then the forced answer.
        let calls: Vec<_> = (0..5)
            .map(|i| MockLlm::tool_call("kb_search", json!({"query": format!("q{i}")})))
            .collect();
        let mut replies = calls;
        replies.push(MockLlm::text("Here is a summary of everything I found."));
        let fx = fixture(MockLlm::with_replies(replies));
        let rx = fx
            .handler
            .handle(request("s-max", "research everything"), CancellationToken::new());
        let events = drain(rx).await;

        let done_meta = match events.last() {
            Some(ChatEvent::Done { metadata }) => metadata.clone(),
            other => panic!("expected done, got {other:?}"),
        };
        assert_eq!(done_meta["max_iterations"], true);
        assert_eq!(done_meta["iterations"], 5);
    }

    #[tokio::test]
    async fn cancelled_run_saves_partial_and_reports_interrupted() {
        let llm = MockLlm::with_replies(vec![
            MockLlm::tool_call("list_affairs", json!({})),
            // Never reached: cancellation fires before iteration 2.
            MockLlm::text("unused"),
        ]);
        let fx = fixture(llm);
        let cancel = CancellationToken::new();

        // Cancel immediately: the loop checks the token at each iteration top,
        // so iteration 1 runs and iteration 2 observes the cancellation.
        let rx = fx
            .handler
            .handle(request("s-cancel", "do things"), cancel.clone());
        cancel.cancel();
        let events = drain(rx).await;

        let done_meta = match events.last() {
            Some(ChatEvent::Done { metadata }) => metadata.clone(),
            other => panic!("expected done, got {other:?}"),
        };
        assert_eq!(done_meta["interrupted"], true);
    }

    #[tokio::test]
    async fn llm_failure_after_tool_output_saves_partial_and_errors() {
        let llm = MockLlm::with_replies(vec![MockLlm::tool_call("list_affairs", json!({}))]);
        // Second LLM call has no scripted reply: the loop errors.
        let fx = fixture(llm);
        let rx = fx
            .handler
            .handle(request("s-err", "hello"), CancellationToken::new());
        let events = drain(rx).await;

        assert!(matches!(events.last(), Some(ChatEvent::Error { .. })));
        let persisted = fx.store.recent_messages("s-err", 10).await.unwrap();
        assert_eq!(persisted.len(), 1);
        assert!(persisted[0].content.contains("operations but hit an error"));
        assert_eq!(persisted[0].metadata.get("interrupted").unwrap(), "true");
    }
}
