//! Tracked in-flight requests and their lifecycle states.

use std::sync::Mutex;
use std::time::Instant;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::priority::Priority;

/// Lifecycle of a routed request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestState {
    Queued,
    LoadingModel,
    RunningGpu,
    RunningCpu,
    Preempted,
    Completed,
    Failed,
}

impl RequestState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestState::Queued => "queued",
            RequestState::LoadingModel => "loading_model",
            RequestState::RunningGpu => "running_gpu",
            RequestState::RunningCpu => "running_cpu",
            RequestState::Preempted => "preempted",
            RequestState::Completed => "completed",
            RequestState::Failed => "failed",
        }
    }
}

/// One request being routed. The cancellation token is the preemption signal:
/// the streaming proxy checks it between upstream lines.
pub struct TrackedRequest {
    pub request_id: String,
    pub model: String,
    pub priority: Priority,
    pub api_path: String,
    pub body: Value,
    pub created_at: Instant,
    state: Mutex<RequestState>,
    pub cancel: CancellationToken,
}

impl TrackedRequest {
    pub fn new(model: impl Into<String>, priority: Priority, api_path: impl Into<String>, body: Value) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string()[..8].to_string(),
            model: model.into(),
            priority,
            api_path: api_path.into(),
            body,
            created_at: Instant::now(),
            state: Mutex::new(RequestState::Queued),
            cancel: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> RequestState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_state(&self, next: RequestState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = next;
    }

    /// Marks the request preempted and triggers its cancellation token.
    pub fn preempt(&self) {
        self.set_state(RequestState::Preempted);
        self.cancel.cancel();
    }

    /// Whether the body asks for a streamed response. Ollama defaults
    /// `stream=true` for generate/chat.
    pub fn is_streaming(&self) -> bool {
        self.body
            .get("stream")
            .and_then(Value::as_bool)
            .unwrap_or(true)
    }

    pub fn age_seconds(&self) -> u64 {
        self.created_at.elapsed().as_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_request_is_queued_with_short_id() {
        let req = TrackedRequest::new(
            "qwen2.5:7b",
            Priority::Normal,
            "/api/generate",
            serde_json::json!({"model": "qwen2.5:7b"}),
        );
        assert_eq!(req.state(), RequestState::Queued);
        assert_eq!(req.request_id.len(), 8);
        assert!(!req.cancel.is_cancelled());
    }

    #[test]
    fn preempt_sets_state_and_cancels() {
        let req = TrackedRequest::new(
            "qwen2.5:7b",
            Priority::Normal,
            "/api/generate",
            serde_json::json!({}),
        );
        req.preempt();
        assert_eq!(req.state(), RequestState::Preempted);
        assert!(req.cancel.is_cancelled());
    }

    #[test]
    fn stream_flag_defaults_true() {
        let streaming = TrackedRequest::new("m", Priority::Normal, "/api/chat", serde_json::json!({}));
        assert!(streaming.is_streaming());
        let plain = TrackedRequest::new(
            "m",
            Priority::Normal,
            "/api/chat",
            serde_json::json!({"stream": false}),
        );
        assert!(!plain.is_streaming());
    }
}
