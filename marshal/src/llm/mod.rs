//! LLM client abstraction for the agentic loops.
//!
//! The chat and background handlers depend on a callable that takes messages
//! plus tool schemas and returns assistant text and optional tool calls; this
//! module defines the trait, the model tier table, and a mock implementation
//! for tests. The real client ([`OllamaChat`]) talks to the inference router.

mod escalation;
mod mock;
mod ollama;
mod reserve;

pub use escalation::{needs_escalation, EscalationTracker};
pub use mock::MockLlm;
pub use ollama::OllamaChat;
pub use reserve::RouterSession;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::EngineError;
use crate::message::ChatMessage;

/// Routing priority for one LLM call, carried as the `X-Ollama-Priority` header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LlmPriority {
    /// User-facing: foreground chat, orchestrator. Value `0`.
    Critical,
    /// Background inference. Value `1`.
    Normal,
}

impl LlmPriority {
    pub fn header_value(&self) -> &'static str {
        match self {
            LlmPriority::Critical => "0",
            LlmPriority::Normal => "1",
        }
    }
}

/// Model tiers, local first, cloud gated by project rules.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ModelTier {
    LocalFast,
    LocalStandard,
    LocalLarge,
    CloudReasoning,
    CloudCoding,
    CloudLargeContext,
}

/// Static per-tier configuration.
#[derive(Clone, Debug)]
pub struct TierConfig {
    pub model: &'static str,
    pub context_window: u32,
    pub cloud: bool,
}

impl ModelTier {
    pub fn config(&self) -> TierConfig {
        match self {
            ModelTier::LocalFast => TierConfig {
                model: "qwen2.5:7b",
                context_window: 32_768,
                cloud: false,
            },
            ModelTier::LocalStandard => TierConfig {
                model: "qwen2.5:14b",
                context_window: 32_768,
                cloud: false,
            },
            ModelTier::LocalLarge => TierConfig {
                model: "qwen3-coder-tool:30b",
                context_window: 32_768,
                cloud: false,
            },
            ModelTier::CloudReasoning => TierConfig {
                model: "claude-sonnet",
                context_window: 200_000,
                cloud: true,
            },
            ModelTier::CloudCoding => TierConfig {
                model: "gpt-5",
                context_window: 200_000,
                cloud: true,
            },
            ModelTier::CloudLargeContext => TierConfig {
                model: "gemini-pro",
                context_window: 1_000_000,
                cloud: true,
            },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelTier::LocalFast => "local_fast",
            ModelTier::LocalStandard => "local_standard",
            ModelTier::LocalLarge => "local_large",
            ModelTier::CloudReasoning => "cloud_reasoning",
            ModelTier::CloudCoding => "cloud_coding",
            ModelTier::CloudLargeContext => "cloud_large_context",
        }
    }

    /// Smallest local tier whose context window fits the estimate.
    pub fn select_local(estimated_tokens: u32) -> Self {
        if estimated_tokens > 20_000 {
            ModelTier::LocalLarge
        } else if estimated_tokens > 8_000 {
            ModelTier::LocalStandard
        } else {
            ModelTier::LocalFast
        }
    }
}

/// One tool call requested by the model.
#[derive(Clone, Debug)]
pub struct LlmToolCall {
    pub id: String,
    pub name: String,
    /// Raw JSON arguments; validated by the executor, not here.
    pub arguments: Value,
}

impl LlmToolCall {
    /// Canonical signature used by loop detection: name plus sorted-key args.
    pub fn signature(&self) -> String {
        // serde_json::Value objects serialize with sorted keys only when the
        // map preserves order; normalize through a BTreeMap.
        fn canonical(v: &Value) -> Value {
            match v {
                Value::Object(map) => {
                    let sorted: std::collections::BTreeMap<String, Value> = map
                        .iter()
                        .map(|(k, val)| (k.clone(), canonical(val)))
                        .collect();
                    serde_json::to_value(sorted).unwrap_or(Value::Null)
                }
                Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
                other => other.clone(),
            }
        }
        format!("{}:{}", self.name, canonical(&self.arguments))
    }
}

/// Token usage for one call (prompt + completion).
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct LlmUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Response from one LLM turn.
pub struct LlmResponse {
    pub content: String,
    /// Tool calls from this turn; empty means the content is the final answer.
    pub tool_calls: Vec<LlmToolCall>,
    pub usage: Option<LlmUsage>,
}

/// Options for one call.
#[derive(Clone, Debug)]
pub struct CallOptions {
    pub tier: ModelTier,
    /// Tool schemas in the wire format (`[{"type":"function","function":{…}}]`).
    pub tools: Option<Value>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub priority: LlmPriority,
}

impl CallOptions {
    pub fn new(tier: ModelTier, priority: LlmPriority) -> Self {
        Self {
            tier,
            tools: None,
            max_tokens: 4096,
            temperature: 0.1,
            priority,
        }
    }

    pub fn with_tools(mut self, tools: Value) -> Self {
        self.tools = Some(tools);
        self
    }

    /// Strips tools so the model must produce a textual answer.
    pub fn without_tools(mut self) -> Self {
        self.tools = None;
        self
    }
}

/// One chunk of streamed answer text.
#[derive(Clone, Debug)]
pub struct MessageChunk {
    pub content: String,
}

/// LLM client: given messages (and optional tool schemas), returns assistant
/// content and any tool calls.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Single completion turn.
    async fn chat(
        &self,
        messages: &[ChatMessage],
        opts: &CallOptions,
    ) -> Result<LlmResponse, EngineError>;

    /// Streaming variant: send answer chunks through `chunk_tx` as they arrive
    /// and return the complete response at the end. Default implementation
    /// calls [`chat`](Self::chat) and emits the full content as one chunk.
    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        opts: &CallOptions,
        chunk_tx: Option<mpsc::Sender<MessageChunk>>,
    ) -> Result<LlmResponse, EngineError> {
        let response = self.chat(messages, opts).await?;
        if let Some(tx) = chunk_tx {
            if !response.content.is_empty() {
                let _ = tx
                    .send(MessageChunk {
                        content: response.content.clone(),
                    })
                    .await;
            }
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_selection_by_token_estimate() {
        assert_eq!(ModelTier::select_local(1_000), ModelTier::LocalFast);
        assert_eq!(ModelTier::select_local(10_000), ModelTier::LocalStandard);
        assert_eq!(ModelTier::select_local(30_000), ModelTier::LocalLarge);
    }

    #[test]
    fn signature_is_stable_under_key_order() {
        let a = LlmToolCall {
            id: "1".into(),
            name: "kb_search".into(),
            arguments: serde_json::json!({"b": 2, "a": 1}),
        };
        let b = LlmToolCall {
            id: "2".into(),
            name: "kb_search".into(),
            arguments: serde_json::json!({"a": 1, "b": 2}),
        };
        assert_eq!(a.signature(), b.signature());
    }

    #[tokio::test]
    async fn default_chat_stream_sends_single_chunk() {
        let llm = MockLlm::with_replies(vec![LlmResponse {
            content: "hello".into(),
            tool_calls: vec![],
            usage: None,
        }]);
        let (tx, mut rx) = mpsc::channel(2);
        let opts = CallOptions::new(ModelTier::LocalFast, LlmPriority::Critical);
        let resp = llm.chat_stream(&[], &opts, Some(tx)).await.unwrap();
        assert_eq!(resp.content, "hello");
        assert_eq!(rx.recv().await.unwrap().content, "hello");
    }
}
