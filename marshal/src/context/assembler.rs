//! Context assembly and compression.
//!
//! Builds the LLM-ready context block for a session from summary blocks plus
//! recent messages under a token budget, and triggers fire-and-forget
//! compression once enough unsummarized history accumulates before the recent
//! window.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::llm::{CallOptions, LlmClient, LlmPriority, ModelTier};
use crate::message::ChatMessage;
use crate::tools::lenient_json;

use super::store::{ChatHistoryStore, SummaryBlock};
use super::count_tokens;

/// Context window bookkeeping: total minus reserves is what summaries and
/// recent messages may spend.
const TOTAL_BUDGET_TOKENS: usize = 32_000;
const SYSTEM_RESERVE_TOKENS: usize = 4_000;
const RESPONSE_RESERVE_TOKENS: usize = 4_000;

const RECENT_MESSAGE_COUNT: u32 = 20;
const MAX_SUMMARY_BLOCKS: u32 = 15;
/// Share of the remaining budget summaries may take before recent messages.
const SUMMARY_BUDGET_SHARE: f64 = 0.6;

const COMPRESS_MAX_RETRIES: u32 = 2;

/// Messages that are themselves failures are excluded from context.
pub fn is_error_message(content: &str) -> bool {
    let lower = content.trim().to_lowercase();
    (lower.starts_with('{') && lower.contains("\"error\""))
        || lower.starts_with("error:")
        || lower.contains("llm_call_failed")
}

pub struct ChatContextAssembler {
    store: Arc<dyn ChatHistoryStore>,
    llm: Arc<dyn LlmClient>,
    compress_threshold: usize,
}

impl ChatContextAssembler {
    pub fn new(
        store: Arc<dyn ChatHistoryStore>,
        llm: Arc<dyn LlmClient>,
        compress_threshold: usize,
    ) -> Self {
        Self {
            store,
            llm,
            compress_threshold,
        }
    }

    pub fn store(&self) -> &Arc<dyn ChatHistoryStore> {
        &self.store
    }

    /// Builds the context system message for a session.
    ///
    /// Budget = total − reserves − injected memory context. Summaries fill up
    /// to 60% of that (admitted newest-first, emitted chronologically), recent
    /// messages take the rest the same way. Budget 0 yields no context.
    pub async fn assemble_context(
        &self,
        task_id: &str,
        memory_context: Option<&str>,
    ) -> Vec<ChatMessage> {
        self.assemble_with_budget(
            task_id,
            memory_context,
            TOTAL_BUDGET_TOKENS - SYSTEM_RESERVE_TOKENS - RESPONSE_RESERVE_TOKENS,
        )
        .await
    }

    pub async fn assemble_with_budget(
        &self,
        task_id: &str,
        memory_context: Option<&str>,
        budget_tokens: usize,
    ) -> Vec<ChatMessage> {
        let budget = budget_tokens
            .saturating_sub(memory_context.map(count_tokens).unwrap_or(0));
        if budget == 0 {
            return memory_block(memory_context);
        }

        let summaries = self
            .store
            .summaries(task_id, MAX_SUMMARY_BLOCKS)
            .await
            .unwrap_or_default();
        let recent = self
            .store
            .recent_messages(task_id, RECENT_MESSAGE_COUNT)
            .await
            .unwrap_or_default();
        if summaries.is_empty() && recent.is_empty() {
            return memory_block(memory_context);
        }

        // Summaries: admit newest-first within their share, emit oldest-first.
        let summary_budget = (budget as f64 * SUMMARY_BUDGET_SHARE) as usize;
        let mut used = 0usize;
        let mut summary_lines: Vec<String> = Vec::new();
        for block in summaries.iter().rev() {
            let prefix = if block.is_checkpoint { "[CHECKPOINT] " } else { "" };
            let line = format!(
                "{}Messages {}-{}: {}",
                prefix, block.sequence_start, block.sequence_end, block.summary
            );
            let cost = count_tokens(&line);
            if used + cost > summary_budget {
                debug!(task_id, used, "summary budget reached");
                break;
            }
            used += cost;
            summary_lines.push(line);
        }
        summary_lines.reverse();

        // Recent messages: same admission strategy over what is left.
        let mut recent_lines: Vec<String> = Vec::new();
        for msg in recent.iter().rev() {
            if is_error_message(&msg.content) {
                continue;
            }
            let line = format!("{}: {}", msg.role, msg.content);
            let cost = count_tokens(&line);
            if used + cost > budget {
                debug!(task_id, used, "recent-message budget reached");
                break;
            }
            used += cost;
            recent_lines.push(line);
        }
        recent_lines.reverse();

        if summary_lines.is_empty() && recent_lines.is_empty() {
            return memory_block(memory_context);
        }

        let mut sections: Vec<String> = Vec::new();
        if let Some(ctx) = memory_context.filter(|c| !c.is_empty()) {
            sections.push(ctx.to_string());
        }
        if !summary_lines.is_empty() {
            sections.push(format!(
                "## Conversation history (compressed)\n{}",
                summary_lines.join("\n")
            ));
        }
        if !recent_lines.is_empty() {
            sections.push(format!("## Recent messages\n{}", recent_lines.join("\n\n")));
        }

        info!(
            task_id,
            recent = recent_lines.len(),
            summaries = summary_lines.len(),
            tokens = used,
            "context assembled"
        );

        vec![ChatMessage::system(format!(
            "Conversation context (from previous messages in this task):\n\n{}",
            sections.join("\n\n")
        ))]
    }

    /// Checks whether compression is due and launches it in the background.
    pub async fn maybe_compress(self: &Arc<Self>, task_id: &str) {
        let total = self.store.count_messages(task_id).await.unwrap_or(0);
        if total <= RECENT_MESSAGE_COUNT as i64 {
            return;
        }

        let last_summarized = self
            .store
            .last_summarized_sequence(task_id)
            .await
            .unwrap_or(0);
        let recent = self
            .store
            .recent_messages(task_id, RECENT_MESSAGE_COUNT)
            .await
            .unwrap_or_default();
        let Some(recent_start) = recent.first().map(|m| m.sequence) else {
            return;
        };

        let unsummarized = self
            .store
            .messages_between(task_id, last_summarized, recent_start)
            .await
            .map(|m| m.len())
            .unwrap_or(0);

        if unsummarized < self.compress_threshold {
            debug!(task_id, unsummarized, threshold = self.compress_threshold, "compression not due");
            return;
        }

        info!(task_id, unsummarized, "compression triggered");
        let assembler = Arc::clone(self);
        let task_id = task_id.to_string();
        tokio::spawn(async move {
            assembler
                .compress_block(&task_id, last_summarized, recent_start)
                .await;
        });
    }

    /// Summarizes messages in `(after, before)` into one summary block, with
    /// bounded retries on LLM or parse failure. Terminal failure is logged.
    async fn compress_block(&self, task_id: &str, after: i64, before: i64) {
        let messages = match self.store.messages_between(task_id, after, before).await {
            Ok(m) if !m.is_empty() => m,
            Ok(_) => return,
            Err(e) => {
                warn!(task_id, error = %e, "compression load failed");
                return;
            }
        };

        let formatted: Vec<String> = messages
            .iter()
            .map(|m| {
                format!(
                    "[{}]: {}",
                    m.role,
                    m.content.chars().take(500).collect::<String>()
                )
            })
            .collect();
        let conversation = formatted.join("\n");

        let llm_messages = [
            ChatMessage::system(
                "You are a conversation analyst. Summarize the conversation block.\n\
                 Rules:\n\
                 - Summary: 2-3 sentences on the main topic and outcome (max 500 chars)\n\
                 - Key decisions: important decisions made\n\
                 - Topics: short labels\n\
                 - If the direction changed fundamentally, set is_checkpoint=true with a reason\n\n\
                 Respond with JSON:\n\
                 {\"summary\": \"...\", \"key_decisions\": [], \"topics\": [], \
                 \"is_checkpoint\": false, \"checkpoint_reason\": null}",
            ),
            ChatMessage::user(format!("Summarize this conversation block:\n{conversation}")),
        ];

        for attempt in 1..=COMPRESS_MAX_RETRIES {
            let response = match self
                .llm
                .chat(
                    &llm_messages,
                    &CallOptions::new(ModelTier::LocalFast, LlmPriority::Normal),
                )
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    warn!(task_id, attempt, error = %e, "compression LLM call failed");
                    continue;
                }
            };

            let Some(parsed) = lenient_json(&response.content) else {
                warn!(task_id, attempt, "compression output unparsable");
                continue;
            };

            let first = messages[0].sequence;
            let last = messages[messages.len() - 1].sequence;
            let block = SummaryBlock {
                sequence_start: first,
                sequence_end: last,
                summary: parsed["summary"]
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| response.content.chars().take(500).collect()),
                key_decisions: string_vec(&parsed["key_decisions"]),
                topics: string_vec(&parsed["topics"]),
                is_checkpoint: parsed["is_checkpoint"].as_bool().unwrap_or(false),
                checkpoint_reason: parsed["checkpoint_reason"]
                    .as_str()
                    .map(str::to_string),
                message_count: messages.len() as i64,
                created_at: Utc::now().to_rfc3339(),
            };

            match self.store.save_summary(task_id, block).await {
                Ok(()) => {
                    info!(task_id, range = format!("{first}-{last}"), count = messages.len(), "compression done");
                    return;
                }
                Err(e) => warn!(task_id, attempt, error = %e, "summary save failed"),
            }
        }
        warn!(task_id, "compression abandoned after retries");
    }
}

fn string_vec(value: &Value) -> Vec<String> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn memory_block(memory_context: Option<&str>) -> Vec<ChatMessage> {
    match memory_context.filter(|c| !c.is_empty()) {
        Some(ctx) => vec![ChatMessage::system(ctx.to_string())],
        None => vec![],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SqliteChatHistory;
    use crate::llm::MockLlm;
    use std::collections::HashMap;
    use tempfile::NamedTempFile;

    fn assembler_with(
        store: Arc<dyn ChatHistoryStore>,
        llm: MockLlm,
    ) -> Arc<ChatContextAssembler> {
        Arc::new(ChatContextAssembler::new(store, Arc::new(llm), 20))
    }

    async fn seed_messages(store: &Arc<dyn ChatHistoryStore>, task: &str, n: usize) {
        for i in 0..n {
            let role = if i % 2 == 0 { "USER" } else { "ASSISTANT" };
            store
                .append_message(task, role, &format!("message number {i}"), HashMap::new())
                .await
                .unwrap();
        }
    }

    #[test]
    fn error_message_detection() {
        assert!(is_error_message("error: something broke"));
        assert!(is_error_message("{\"error\": \"boom\"}"));
        assert!(is_error_message("prefix llm_call_failed suffix"));
        assert!(!is_error_message("The error rate went down"));
    }

    #[tokio::test]
    async fn zero_budget_returns_empty_context() {
        let file = NamedTempFile::new().unwrap();
        let store: Arc<dyn ChatHistoryStore> =
            Arc::new(SqliteChatHistory::new(file.path()).unwrap());
        seed_messages(&store, "t1", 5).await;
        let assembler = assembler_with(Arc::clone(&store), MockLlm::default());

        let messages = assembler.assemble_with_budget("t1", None, 0).await;
        assert!(messages.is_empty());
    }

    #[tokio::test]
    async fn assembled_context_contains_recent_and_filters_errors() {
        let file = NamedTempFile::new().unwrap();
        let store: Arc<dyn ChatHistoryStore> =
            Arc::new(SqliteChatHistory::new(file.path()).unwrap());
        seed_messages(&store, "t1", 4).await;
        store
            .append_message("t1", "ASSISTANT", "error: llm_call_failed", HashMap::new())
            .await
            .unwrap();
        let assembler = assembler_with(Arc::clone(&store), MockLlm::default());

        let messages = assembler.assemble_context("t1", None).await;
        assert_eq!(messages.len(), 1);
        let content = messages[0].content_str();
        assert!(content.contains("message number 3"));
        assert!(!content.contains("llm_call_failed"));
    }

    #[tokio::test]
    async fn memory_context_is_prepended_and_budgeted() {
        let file = NamedTempFile::new().unwrap();
        let store: Arc<dyn ChatHistoryStore> =
            Arc::new(SqliteChatHistory::new(file.path()).unwrap());
        seed_messages(&store, "t1", 2).await;
        let assembler = assembler_with(Arc::clone(&store), MockLlm::default());

        let messages = assembler
            .assemble_context("t1", Some("## Current affair: Onboarding"))
            .await;
        assert!(messages[0].content_str().contains("Current affair"));
        assert!(messages[0].content_str().contains("message number 1"));
    }

    #[tokio::test]
    async fn compression_writes_summary_block() {
        let file = NamedTempFile::new().unwrap();
        let store: Arc<dyn ChatHistoryStore> =
            Arc::new(SqliteChatHistory::new(file.path()).unwrap());
        // 45 messages: 25 unsummarized before the 20-message recent window.
        seed_messages(&store, "t1", 45).await;
        let llm = MockLlm::with_replies(vec![MockLlm::text(
            r#"{"summary": "early discussion", "key_decisions": ["decided X"], "topics": ["intro"], "is_checkpoint": false, "checkpoint_reason": null}"#,
        )]);
        let assembler = assembler_with(Arc::clone(&store), llm);

        assembler.maybe_compress("t1").await;
        // The compression task is fire-and-forget; give it a moment.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        let blocks = store.summaries("t1", 15).await.unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].summary, "early discussion");
        assert_eq!(blocks[0].sequence_start, 1);
        assert_eq!(blocks[0].sequence_end, 25);
        assert_eq!(blocks[0].message_count, 25);
    }

    #[tokio::test]
    async fn compression_not_due_below_threshold() {
        let file = NamedTempFile::new().unwrap();
        let store: Arc<dyn ChatHistoryStore> =
            Arc::new(SqliteChatHistory::new(file.path()).unwrap());
        seed_messages(&store, "t1", 25).await;
        let assembler = assembler_with(Arc::clone(&store), MockLlm::default());

        assembler.maybe_compress("t1").await;
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(store.summaries("t1", 15).await.unwrap().is_empty());
    }
}
