//! YAML-backed tool specs: one file per tool under `marshal/tools/*.yaml`,
//! embedded at compile time and parsed when building a toolset. Add a new line
//! to `TOOL_YAML_FILES` when adding a tool YAML.

use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;

/// Builds a static list of embedded YAML file contents; paths relative to this
/// source file (marshal/src/tools/).
macro_rules! embed_tool_yaml {
    ($($path:literal),+ $(,)?) => {
        &[ $( include_str!($path) ),+ ]
    };
}

const TOOL_YAML_FILES: &[&str] = embed_tool_yaml!(
    "../../tools/kb_search.yaml",
    "../../tools/memory_store.yaml",
    "../../tools/memory_recall.yaml",
    "../../tools/list_affairs.yaml",
    "../../tools/switch_context.yaml",
    "../../tools/create_background_task.yaml",
    "../../tools/dispatch_coding_agent.yaml",
    "../../tools/search_tasks.yaml",
    "../../tools/respond_to_user_task.yaml",
    "../../tools/ask_user.yaml",
);

/// Tools only meaningful with a human present.
const FOREGROUND_ONLY: &[&str] = &["ask_user", "switch_context"];

#[derive(Debug, Error)]
pub enum ToolSpecError {
    #[error("failed to parse tool YAML #{index}: {message}")]
    Parse { index: usize, message: String },
}

/// One tool definition: name, description, JSON-schema parameters.
#[derive(Clone, Debug, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    #[serde(default = "empty_object")]
    pub parameters: Value,
}

fn empty_object() -> Value {
    json!({"type": "object", "properties": {}})
}

impl ToolSpec {
    /// Wire format for the chat API tools array.
    pub fn to_wire(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters,
            }
        })
    }
}

/// Loads every embedded tool spec.
pub fn load_tool_specs() -> Result<Vec<ToolSpec>, ToolSpecError> {
    TOOL_YAML_FILES
        .iter()
        .enumerate()
        .map(|(index, yaml)| {
            serde_yaml::from_str(yaml).map_err(|e| ToolSpecError::Parse {
                index,
                message: e.to_string(),
            })
        })
        .collect()
}

/// The full chat toolset (foreground: includes ask_user and switch_context).
pub fn chat_toolset() -> Result<Vec<ToolSpec>, ToolSpecError> {
    load_tool_specs()
}

/// The background toolset: everything except foreground-only tools. Background
/// work cannot block on a human.
pub fn background_toolset() -> Result<Vec<ToolSpec>, ToolSpecError> {
    Ok(load_tool_specs()?
        .into_iter()
        .filter(|spec| !FOREGROUND_ONLY.contains(&spec.name.as_str()))
        .collect())
}

/// Wire-format array for a toolset.
pub fn to_wire(specs: &[ToolSpec]) -> Value {
    Value::Array(specs.iter().map(ToolSpec::to_wire).collect())
}

/// Rough token cost of offering these schemas, for context budgeting.
pub fn approx_chars(specs: &[ToolSpec]) -> usize {
    to_wire(specs).to_string().len()
}
