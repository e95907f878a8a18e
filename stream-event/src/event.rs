//! Wire-level chat event types (type + payload).
//!
//! Free-form metadata uses `serde_json::Value`; the engine builds those objects
//! where the data lives (tool loop, scope resolution, done bookkeeping).

use serde::Serialize;
use serde_json::Value;

/// Scope change payload: the conversation moved to a different client/project.
///
/// `projects` is the JSON array of the new client's projects so a UI can offer
/// a picker without another round trip.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeChange {
    pub client_id: String,
    pub client_name: String,
    pub project_id: String,
    pub project_name: String,
    pub projects: Value,
}

/// One chat stream event (type + payload). Envelope (session_id, event_id) is
/// applied separately.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    /// Human-readable phrase describing the tool the assistant is about to run.
    Thinking { content: String },
    /// A tool call is being executed. `content` is the tool name.
    ToolCall { content: String, metadata: Value },
    /// Result preview of a finished tool call.
    ToolResult { content: String, metadata: Value },
    /// One chunk of the final answer text.
    Token { content: String },
    /// The conversation scope changed to a different client/project.
    ScopeChange { metadata: ScopeChange },
    /// Terminal success event; metadata carries iterations, used tools, flags.
    Done { metadata: Value },
    /// Terminal failure event.
    Error {
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        metadata: Option<Value>,
    },
}

impl ChatEvent {
    /// Serializes this event to a JSON object (type + payload only; no envelope).
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    pub fn token(content: impl Into<String>) -> Self {
        ChatEvent::Token {
            content: content.into(),
        }
    }

    pub fn thinking(content: impl Into<String>) -> Self {
        ChatEvent::Thinking {
            content: content.into(),
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        ChatEvent::Error {
            content: content.into(),
            metadata: None,
        }
    }

    pub fn done(metadata: Value) -> Self {
        ChatEvent::Done { metadata }
    }

    /// True for `done` and `error`; the stream ends after one of these.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChatEvent::Done { .. } | ChatEvent::Error { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_snake_case_type_tag() {
        let ev = ChatEvent::thinking("Searching the KB");
        let v = ev.to_value().unwrap();
        assert_eq!(v["type"], "thinking");
        assert_eq!(v["content"], "Searching the KB");

        let ev = ChatEvent::ToolCall {
            content: "kb_search".into(),
            metadata: serde_json::json!({"tool": "kb_search", "args": {"query": "x"}}),
        };
        let v = ev.to_value().unwrap();
        assert_eq!(v["type"], "tool_call");
        assert_eq!(v["metadata"]["args"]["query"], "x");
    }

    #[test]
    fn scope_change_uses_camel_case_keys() {
        let ev = ChatEvent::ScopeChange {
            metadata: ScopeChange {
                client_id: "c1".into(),
                client_name: "Acme".into(),
                project_id: "p1".into(),
                project_name: "Site".into(),
                projects: serde_json::json!([]),
            },
        };
        let v = ev.to_value().unwrap();
        assert_eq!(v["type"], "scope_change");
        assert_eq!(v["metadata"]["clientId"], "c1");
        assert_eq!(v["metadata"]["projectName"], "Site");
    }

    #[test]
    fn terminal_detection() {
        assert!(ChatEvent::done(serde_json::json!({})).is_terminal());
        assert!(ChatEvent::error("boom").is_terminal());
        assert!(!ChatEvent::token("hi").is_terminal());
    }

    #[test]
    fn error_without_metadata_omits_field() {
        let v = ChatEvent::error("x").to_value().unwrap();
        assert!(v.get("metadata").is_none());
    }
}
