//! Scripted LLM client for tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::EngineError;
use crate::message::ChatMessage;

use super::{CallOptions, LlmClient, LlmResponse, LlmToolCall};

/// Returns scripted responses in order. Records every request's messages and
/// whether tools were offered, for assertions.
#[derive(Default)]
pub struct MockLlm {
    replies: Mutex<VecDeque<LlmResponse>>,
    pub calls: Mutex<Vec<RecordedCall>>,
}

#[derive(Clone, Debug)]
pub struct RecordedCall {
    pub message_count: usize,
    pub tools_offered: bool,
    pub last_message: String,
}

impl MockLlm {
    pub fn with_replies(replies: Vec<LlmResponse>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Convenience: a reply that is plain text.
    pub fn text(content: impl Into<String>) -> LlmResponse {
        LlmResponse {
            content: content.into(),
            tool_calls: vec![],
            usage: None,
        }
    }

    /// Convenience: a reply that is a single tool call.
    pub fn tool_call(name: &str, arguments: serde_json::Value) -> LlmResponse {
        LlmResponse {
            content: String::new(),
            tool_calls: vec![LlmToolCall {
                id: format!("call_{name}"),
                name: name.to_string(),
                arguments,
            }],
            usage: None,
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl LlmClient for MockLlm {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        opts: &CallOptions,
    ) -> Result<LlmResponse, EngineError> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(RecordedCall {
                message_count: messages.len(),
                tools_offered: opts.tools.is_some(),
                last_message: messages
                    .last()
                    .map(|m| m.content_str().to_string())
                    .unwrap_or_default(),
            });
        self.replies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .ok_or_else(|| EngineError::LlmFailure("mock replies exhausted".into()))
    }
}
