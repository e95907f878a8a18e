//! Orchestration envelopes: requests, project rules, and coding-task state.

mod dispatcher;
mod driver;
mod state;

pub use dispatcher::PooledCodingDispatcher;
pub use driver::{CodingOutcome, CodingRunner};
pub use state::{CodingRunState, Evaluation, Goal, Step, StepResult, StepType};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Guardrails a project imposes on automated work.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct ProjectRules {
    pub auto_use_anthropic: bool,
    pub auto_use_openai: bool,
    pub auto_use_gemini: bool,
    /// File globs the agent must not touch.
    pub forbidden_files: Vec<String>,
    pub max_changed_files: Option<u32>,
    pub require_approval_for_commit: bool,
    pub require_approval_for_push: bool,
    /// e.g. `"jervis/{task_id}"`.
    pub branch_template: Option<String>,
    /// e.g. `"[jervis]"`.
    pub commit_prefix: Option<String>,
}

impl ProjectRules {
    pub fn cloud_allowed(&self) -> bool {
        self.auto_use_anthropic || self.auto_use_openai || self.auto_use_gemini
    }

    /// Whether a path matches any forbidden glob. Globs support a trailing or
    /// leading `*`; anything else is an exact match.
    pub fn is_forbidden(&self, path: &str) -> bool {
        self.forbidden_files.iter().any(|glob| {
            if let Some(prefix) = glob.strip_suffix('*') {
                path.starts_with(prefix)
            } else if let Some(suffix) = glob.strip_prefix('*') {
                path.ends_with(suffix)
            } else {
                path == glob
            }
        })
    }
}

/// A background orchestration request.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct OrchestrateRequest {
    pub task_id: String,
    pub client_id: String,
    #[serde(default)]
    pub project_id: Option<String>,
    pub query: String,
    #[serde(default)]
    pub rules: ProjectRules,
    #[serde(default)]
    pub environment: Option<Value>,
    #[serde(default)]
    pub chat_history: Option<Value>,
}

/// A coding-task envelope handed to the job dispatcher.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CodingTask {
    pub id: String,
    pub client_id: String,
    #[serde(default)]
    pub project_id: Option<String>,
    pub workspace_path: String,
    pub query: String,
    /// Preferred agent type: aider, openhands, claude, junie.
    #[serde(default)]
    pub agent_preference: Option<String>,
    #[serde(default)]
    pub rules: ProjectRules,
    #[serde(default)]
    pub environment: Option<Value>,
}
