//! Tool-call extraction from LLM responses, including local-model fallbacks.
//!
//! Some local models emit `{"tool_calls":[…]}` as message content instead of
//! native tool calls, occasionally wrapped in a markdown fence. Extraction
//! tries, in order: native calls, pure-JSON content, fenced JSON block, then
//! plain text.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::llm::{LlmResponse, LlmToolCall};

static FENCED_TOOL_CALLS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)```(?:json)?\s*(\{.*?\x22tool_calls\x22.*?\})\s*```")
        .expect("fenced tool_calls regex")
});

static FENCED_JSON: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```(?:json)?\s*\n?(.*?)\n?\s*```").expect("fenced json regex"));

/// Extracted calls plus whatever assistant text remains.
pub struct ExtractedCalls {
    pub tool_calls: Vec<LlmToolCall>,
    pub remaining_text: Option<String>,
}

/// Pulls tool calls out of one LLM response.
pub fn extract_tool_calls(response: &LlmResponse) -> ExtractedCalls {
    if !response.tool_calls.is_empty() {
        return ExtractedCalls {
            tool_calls: response.tool_calls.clone(),
            remaining_text: non_empty(&response.content),
        };
    }

    let content = response.content.trim();
    if content.is_empty() {
        return ExtractedCalls {
            tool_calls: vec![],
            remaining_text: None,
        };
    }

    // Pure JSON object with a tool_calls key.
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(content) {
        if let Some(raw) = map.get("tool_calls") {
            let calls = validate_raw_calls(raw);
            if !calls.is_empty() {
                return ExtractedCalls {
                    tool_calls: calls,
                    remaining_text: None,
                };
            }
        }
    }

    // JSON inside a markdown fence, with surrounding prose kept.
    if let Some(caps) = FENCED_TOOL_CALLS.captures(content) {
        if let (Some(whole), Some(json_part)) = (caps.get(0), caps.get(1)) {
            if let Ok(parsed) = serde_json::from_str::<Value>(json_part.as_str()) {
                let calls = validate_raw_calls(&parsed["tool_calls"]);
                if !calls.is_empty() {
                    let remaining = format!(
                        "{}{}",
                        &content[..whole.start()],
                        &content[whole.end()..]
                    );
                    return ExtractedCalls {
                        tool_calls: calls,
                        remaining_text: non_empty(remaining.trim()),
                    };
                }
            }
        }
    }

    ExtractedCalls {
        tool_calls: vec![],
        remaining_text: Some(content.to_string()),
    }
}

/// Validates a raw `tool_calls` value: it must be an array; each entry must
/// carry `function.name`; arguments decode from object or JSON string.
/// Malformed entries are dropped.
fn validate_raw_calls(raw: &Value) -> Vec<LlmToolCall> {
    let Some(items) = raw.as_array() else {
        return vec![];
    };
    let mut out = Vec::new();
    for item in items {
        let Some(name) = item["function"]["name"].as_str() else {
            continue;
        };
        let arguments = match &item["function"]["arguments"] {
            Value::String(s) => serde_json::from_str(s).unwrap_or(Value::Object(Default::default())),
            Value::Null => Value::Object(Default::default()),
            other => other.clone(),
        };
        out.push(LlmToolCall {
            id: item["id"]
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| format!("call_{}", &uuid::Uuid::new_v4().to_string()[..8])),
            name: name.to_string(),
            arguments,
        });
    }
    out
}

fn non_empty(s: &str) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Parses LLM JSON output leniently: direct parse, then fenced block, then the
/// outermost brace span. `None` when nothing decodes.
pub fn lenient_json(content: &str) -> Option<Value> {
    let content = content.trim();
    if let Ok(v) = serde_json::from_str(content) {
        return Some(v);
    }
    if let Some(caps) = FENCED_JSON.captures(content) {
        if let Some(inner) = caps.get(1) {
            if let Ok(v) = serde_json::from_str(inner.as_str()) {
                return Some(v);
            }
        }
    }
    let start = content.find('{')?;
    let end = content.rfind('}')?;
    if end > start {
        serde_json::from_str(&content[start..=end]).ok()
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(content: &str) -> LlmResponse {
        LlmResponse {
            content: content.into(),
            tool_calls: vec![],
            usage: None,
        }
    }

    #[test]
    fn native_calls_win() {
        let resp = LlmResponse {
            content: "thinking aloud".into(),
            tool_calls: vec![LlmToolCall {
                id: "1".into(),
                name: "kb_search".into(),
                arguments: serde_json::json!({"query": "x"}),
            }],
            usage: None,
        };
        let extracted = extract_tool_calls(&resp);
        assert_eq!(extracted.tool_calls.len(), 1);
        assert_eq!(extracted.remaining_text.as_deref(), Some("thinking aloud"));
    }

    #[test]
    fn json_in_content_fallback() {
        let resp = response(
            r#"{"tool_calls": [{"function": {"name": "kb_search", "arguments": {"query": "BMS"}}}]}"#,
        );
        let extracted = extract_tool_calls(&resp);
        assert_eq!(extracted.tool_calls.len(), 1);
        assert_eq!(extracted.tool_calls[0].name, "kb_search");
        assert_eq!(extracted.tool_calls[0].arguments["query"], "BMS");
        assert!(extracted.remaining_text.is_none());
    }

    #[test]
    fn fenced_json_keeps_surrounding_prose() {
        let resp = response(
            "Let me look that up.\n```json\n{\"tool_calls\": [{\"function\": {\"name\": \"kb_search\", \"arguments\": {\"query\": \"x\"}}}]}\n```",
        );
        let extracted = extract_tool_calls(&resp);
        assert_eq!(extracted.tool_calls.len(), 1);
        assert_eq!(extracted.remaining_text.as_deref(), Some("Let me look that up."));
    }

    #[test]
    fn malformed_entries_are_dropped() {
        let resp = response(
            r#"{"tool_calls": [{"function": {"name": "ok"}}, {"function": {}}, "nonsense"]}"#,
        );
        let extracted = extract_tool_calls(&resp);
        assert_eq!(extracted.tool_calls.len(), 1);
        assert_eq!(extracted.tool_calls[0].name, "ok");
    }

    #[test]
    fn tool_calls_must_be_a_list() {
        let resp = response(r#"{"tool_calls": {"function": {"name": "ok"}}}"#);
        let extracted = extract_tool_calls(&resp);
        assert!(extracted.tool_calls.is_empty());
        assert!(extracted.remaining_text.is_some(), "treated as plain text");
    }

    #[test]
    fn plain_text_passes_through() {
        let extracted = extract_tool_calls(&response("The answer is 42."));
        assert!(extracted.tool_calls.is_empty());
        assert_eq!(extracted.remaining_text.as_deref(), Some("The answer is 42."));
    }

    #[test]
    fn lenient_json_variants() {
        assert!(lenient_json(r#"{"a": 1}"#).is_some());
        assert!(lenient_json("```json\n{\"a\": 1}\n```").is_some());
        assert_eq!(
            lenient_json("prefix {\"a\": 1} suffix").unwrap()["a"],
            1
        );
        assert!(lenient_json("no json here").is_none());
    }
}
