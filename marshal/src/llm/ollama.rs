//! Router-backed LLM client speaking the Ollama chat API.
//!
//! Every call goes through the inference router so priority headers take
//! effect. Streaming reads newline-delimited JSON with a per-token heartbeat
//! timeout instead of a hard wall-clock deadline: generation may legitimately
//! take minutes, but silence for `heartbeat_dead_seconds` means the stream is
//! dead.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::message::ChatMessage;

use super::{CallOptions, LlmClient, LlmResponse, LlmToolCall, LlmUsage, MessageChunk};

pub struct OllamaChat {
    base_url: String,
    client: reqwest::Client,
    heartbeat_dead: Duration,
    local_permits: Arc<Semaphore>,
    cloud_permits: Arc<Semaphore>,
}

impl OllamaChat {
    pub fn new(
        base_url: impl Into<String>,
        heartbeat_dead_seconds: u64,
        max_local: usize,
        max_cloud: usize,
    ) -> Self {
        let base_url: String = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            heartbeat_dead: Duration::from_secs(heartbeat_dead_seconds),
            local_permits: Arc::new(Semaphore::new(max_local.max(1))),
            cloud_permits: Arc::new(Semaphore::new(max_cloud.max(1))),
        }
    }

    fn permits_for(&self, opts: &CallOptions) -> Arc<Semaphore> {
        if opts.tier.config().cloud {
            Arc::clone(&self.cloud_permits)
        } else {
            Arc::clone(&self.local_permits)
        }
    }

    fn request_body(&self, messages: &[ChatMessage], opts: &CallOptions, stream: bool) -> Value {
        let mut body = json!({
            "model": opts.tier.config().model,
            "messages": messages,
            "stream": stream,
            "options": {
                "num_predict": opts.max_tokens,
                "temperature": opts.temperature,
            },
        });
        if let Some(tools) = &opts.tools {
            body["tools"] = tools.clone();
        }
        body
    }

    fn parse_tool_calls(message: &Value) -> Vec<LlmToolCall> {
        let mut out = Vec::new();
        for tc in message["tool_calls"].as_array().into_iter().flatten() {
            let Some(name) = tc["function"]["name"].as_str() else {
                continue;
            };
            let arguments = match &tc["function"]["arguments"] {
                Value::String(s) => serde_json::from_str(s).unwrap_or(Value::Null),
                other => other.clone(),
            };
            out.push(LlmToolCall {
                id: tc["id"]
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("call_{}", &uuid::Uuid::new_v4().to_string()[..8])),
                name: name.to_string(),
                arguments,
            });
        }
        out
    }

    fn parse_usage(value: &Value) -> Option<LlmUsage> {
        let prompt = value["prompt_eval_count"].as_u64()? as u32;
        let completion = value["eval_count"].as_u64().unwrap_or(0) as u32;
        Some(LlmUsage {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: prompt + completion,
        })
    }
}

#[async_trait]
impl LlmClient for OllamaChat {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        opts: &CallOptions,
    ) -> Result<LlmResponse, EngineError> {
        let permits = self.permits_for(opts);
        let _permit = permits
            .acquire()
            .await
            .map_err(|e| EngineError::LlmFailure(e.to_string()))?;

        let body = self.request_body(messages, opts, false);
        debug!(model = opts.tier.config().model, priority = opts.priority.header_value(), "llm call");

        let resp = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .header("X-Ollama-Priority", opts.priority.header_value())
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::LlmFailure(e.to_string()))?;

        let status = resp.status();
        let value: Value = resp
            .json()
            .await
            .map_err(|e| EngineError::LlmFailure(e.to_string()))?;
        if !status.is_success() {
            return Err(EngineError::LlmFailure(format!(
                "status {}: {}",
                status,
                value.to_string().chars().take(300).collect::<String>()
            )));
        }
        if let Some(err) = value.get("error").and_then(Value::as_str) {
            return Err(EngineError::LlmFailure(err.to_string()));
        }

        let message = &value["message"];
        Ok(LlmResponse {
            content: message["content"].as_str().unwrap_or("").to_string(),
            tool_calls: Self::parse_tool_calls(message),
            usage: Self::parse_usage(&value),
        })
    }

    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        opts: &CallOptions,
        chunk_tx: Option<mpsc::Sender<MessageChunk>>,
    ) -> Result<LlmResponse, EngineError> {
        let permits = self.permits_for(opts);
        let _permit = permits
            .acquire()
            .await
            .map_err(|e| EngineError::LlmFailure(e.to_string()))?;

        let body = self.request_body(messages, opts, true);
        let resp = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .header("X-Ollama-Priority", opts.priority.header_value())
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::LlmFailure(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(EngineError::LlmFailure(format!(
                "status {}: {}",
                status,
                text.chars().take(300).collect::<String>()
            )));
        }

        let mut upstream = resp.bytes_stream();
        let mut buf: Vec<u8> = Vec::new();
        let mut content = String::new();
        let mut tool_calls: Vec<LlmToolCall> = Vec::new();
        let mut usage = None;

        loop {
            let chunk = tokio::time::timeout(self.heartbeat_dead, upstream.next())
                .await
                .map_err(|_| EngineError::HeartbeatTimeout(self.heartbeat_dead.as_secs()))?;

            let Some(chunk) = chunk else {
                break;
            };
            let bytes = chunk.map_err(|e| EngineError::LlmFailure(e.to_string()))?;
            buf.extend_from_slice(&bytes);

            while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = buf.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line);
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let value: Value = match serde_json::from_str(line) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "unparsable stream line");
                        continue;
                    }
                };
                if let Some(err) = value.get("error").and_then(Value::as_str) {
                    return Err(EngineError::LlmFailure(err.to_string()));
                }
                let piece = value["message"]["content"].as_str().unwrap_or("");
                if !piece.is_empty() {
                    content.push_str(piece);
                    if let Some(tx) = &chunk_tx {
                        let _ = tx
                            .send(MessageChunk {
                                content: piece.to_string(),
                            })
                            .await;
                    }
                }
                tool_calls.extend(Self::parse_tool_calls(&value["message"]));
                if value["done"].as_bool().unwrap_or(false) {
                    usage = Self::parse_usage(&value);
                }
            }
        }

        Ok(LlmResponse {
            content,
            tool_calls,
            usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmPriority, ModelTier};

    #[test]
    fn request_body_includes_tools_and_priority_model() {
        let client = OllamaChat::new("http://router:11430/", 300, 2, 4);
        let opts = CallOptions::new(ModelTier::LocalStandard, LlmPriority::Critical)
            .with_tools(json!([{"type": "function", "function": {"name": "kb_search"}}]));
        let body = client.request_body(&[ChatMessage::user("hi")], &opts, false);
        assert_eq!(body["model"], "qwen2.5:14b");
        assert_eq!(body["stream"], false);
        assert_eq!(body["tools"][0]["function"]["name"], "kb_search");
        assert_eq!(body["options"]["num_predict"], 4096);
    }

    #[test]
    fn tool_call_parsing_handles_object_and_string_arguments() {
        let message = json!({
            "tool_calls": [
                {"function": {"name": "kb_search", "arguments": {"query": "x"}}},
                {"function": {"name": "store", "arguments": "{\"subject\":\"s\"}"}},
                {"function": {"no_name": true}},
            ]
        });
        let calls = OllamaChat::parse_tool_calls(&message);
        assert_eq!(calls.len(), 2, "entry without function.name is dropped");
        assert_eq!(calls[0].name, "kb_search");
        assert_eq!(calls[0].arguments["query"], "x");
        assert_eq!(calls[1].arguments["subject"], "s");
    }

    #[test]
    fn usage_parsed_from_eval_counts() {
        let usage = OllamaChat::parse_usage(&json!({
            "prompt_eval_count": 100,
            "eval_count": 20,
        }))
        .unwrap();
        assert_eq!(usage.total_tokens, 120);
    }
}
