//! Human-readable phrases shown as `thinking` events before tool calls.

use serde_json::Value;

pub fn describe_tool_call(name: &str, args: &Value) -> String {
    let arg = |key: &str| args[key].as_str().unwrap_or("");
    match name {
        "kb_search" => format!("Searching the knowledge base: {}", arg("query")),
        "memory_store" => format!("Remembering: {}", arg("subject")),
        "memory_recall" => format!("Recalling: {}", arg("query")),
        "list_affairs" => "Checking current topics".to_string(),
        "create_background_task" => format!("Creating a task: {}", arg("title")),
        "dispatch_coding_agent" => "Dispatching a coding agent".to_string(),
        "search_tasks" => format!("Searching tasks: {}", arg("query")),
        "respond_to_user_task" => format!("Answering task: {}", arg("task_id")),
        "switch_context" => {
            format!("Switching to: {} {}", arg("client"), arg("project"))
                .trim_end()
                .to_string()
        }
        "ask_user" => "I need to ask you something".to_string(),
        other => format!("Working on: {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn known_tools_get_specific_phrases() {
        assert_eq!(
            describe_tool_call("kb_search", &json!({"query": "BMS"})),
            "Searching the knowledge base: BMS"
        );
        assert_eq!(
            describe_tool_call("switch_context", &json!({"client": "Acme"})),
            "Switching to: Acme"
        );
    }

    #[test]
    fn unknown_tool_gets_generic_phrase() {
        assert_eq!(describe_tool_call("mystery", &json!({})), "Working on: mystery");
    }
}
