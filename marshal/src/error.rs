//! Engine-wide error type.

use thiserror::Error;

/// Errors surfaced by the orchestration engine.
///
/// Control-flow signals (ask_user, approval) are **not** errors; they live in
/// [`crate::tools::ToolOutcome`] and [`crate::approval`] respectively.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("llm call failed: {0}")]
    LlmFailure(String),

    #[error("no token for {0} seconds")]
    HeartbeatTimeout(u64),

    #[error("tool '{tool}' timed out after {seconds}s")]
    ToolTimeout { tool: String, seconds: u64 },

    #[error("tool '{tool}' arguments invalid: {message}")]
    ToolBadArgs { tool: String, message: String },

    #[error("context overflow: {0}")]
    ContextOverflow(String),

    #[error("knowledge base unavailable: {0}")]
    KbUnavailable(String),

    #[error("coordinator push failed: {0}")]
    CoordinatorPush(String),

    #[error("history store: {0}")]
    History(String),

    #[error("checkpoint: {0}")]
    Checkpoint(String),

    #[error("job api: {0}")]
    JobApi(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: each variant's Display contains the distinguishing keyword.
    #[test]
    fn error_display_keywords() {
        assert!(EngineError::LlmFailure("x".into()).to_string().contains("llm"));
        assert!(EngineError::HeartbeatTimeout(300).to_string().contains("300"));
        let e = EngineError::ToolTimeout {
            tool: "kb_search".into(),
            seconds: 30,
        };
        assert!(e.to_string().contains("kb_search"));
        assert!(EngineError::KbUnavailable("down".into())
            .to_string()
            .contains("knowledge base"));
    }
}
