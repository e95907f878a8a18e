//! Workspace preparation for coding-agent jobs.
//!
//! Before a job launches, the engine writes the `.jervis/` control files into
//! the workspace: instructions, the task envelope, optional KB context and
//! environment, plus agent-specific config (MCP config for the claude family,
//! a read-only conventions entry for aider). After the job completes, the
//! structured outcome is read back from `.jervis/result.json`.

use std::path::Path;

use serde_json::{json, Value};
use tracing::info;

use crate::error::EngineError;
use crate::orchestrate::CodingTask;

use super::AgentKind;

/// Optional extra content for workspace preparation.
#[derive(Debug, Default)]
pub struct WorkspaceFiles {
    pub kb_context: Option<String>,
    pub environment: Option<Value>,
}

/// Writes the `.jervis/` control files and agent-specific config.
pub fn prepare_workspace(
    task: &CodingTask,
    kind: AgentKind,
    instructions: &str,
    extra: &WorkspaceFiles,
) -> Result<(), EngineError> {
    let workspace = Path::new(&task.workspace_path);
    let jervis = workspace.join(".jervis");
    std::fs::create_dir_all(&jervis)?;

    std::fs::write(jervis.join("instructions.md"), instructions)?;
    std::fs::write(
        jervis.join("task.json"),
        serde_json::to_string_pretty(&json!({
            "id": task.id,
            "clientId": task.client_id,
            "projectId": task.project_id,
            "query": task.query,
            "agentType": kind.as_str(),
        }))?,
    )?;

    if let Some(kb_context) = &extra.kb_context {
        std::fs::write(jervis.join("kb-context.md"), kb_context)?;
    }
    if let Some(environment) = &extra.environment {
        std::fs::write(
            jervis.join("environment.json"),
            serde_json::to_string_pretty(environment)?,
        )?;
    }

    match kind {
        AgentKind::Claude => setup_claude_workspace(workspace)?,
        AgentKind::Aider => setup_aider_workspace(workspace, extra.kb_context.is_some())?,
        AgentKind::Openhands | AgentKind::Junie => {}
    }

    info!(workspace = %workspace.display(), agent = kind.as_str(), "workspace prepared");
    Ok(())
}

/// MCP config plus a pointer file so the agent finds its instructions.
fn setup_claude_workspace(workspace: &Path) -> Result<(), EngineError> {
    std::fs::write(
        workspace.join(".mcp.json"),
        serde_json::to_string_pretty(&json!({
            "mcpServers": {
                "jervis-kb": {
                    "command": "jervis-kb-mcp",
                    "args": ["--workspace", "."],
                }
            }
        }))?,
    )?;
    std::fs::write(
        workspace.join("AGENT_NOTES.md"),
        "Read `.jervis/instructions.md` for your task.\n\
         Write your outcome to `.jervis/result.json` when done.\n",
    )?;
    Ok(())
}

/// Aider reads its conventions from a config file; the KB context is attached
/// read-only when present.
fn setup_aider_workspace(workspace: &Path, has_kb_context: bool) -> Result<(), EngineError> {
    let mut config = String::from("yes-always: true\nauto-commits: false\n");
    if has_kb_context {
        config.push_str("read: [.jervis/kb-context.md]\n");
    }
    std::fs::write(workspace.join(".aider.conf.yml"), config)?;
    Ok(())
}

/// Reads the structured outcome written by the agent. A missing or unparsable
/// file yields a fallback failure record rather than an error, so the caller
/// can still report what the job did.
pub fn read_job_result(workspace_path: &str) -> Result<Value, EngineError> {
    let path = Path::new(workspace_path).join(".jervis").join("result.json");
    match std::fs::read_to_string(&path) {
        Ok(content) => Ok(serde_json::from_str(&content).unwrap_or_else(|_| {
            json!({
                "success": false,
                "summary": "result.json is not valid JSON",
            })
        })),
        Err(_) => Ok(json!({
            "success": false,
            "summary": format!("no result.json in {workspace_path}"),
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrate::ProjectRules;

    fn task(workspace: &Path) -> CodingTask {
        CodingTask {
            id: "t1".into(),
            client_id: "c1".into(),
            project_id: Some("p1".into()),
            workspace_path: workspace.to_string_lossy().into_owned(),
            query: "add a health endpoint".into(),
            agent_preference: None,
            rules: ProjectRules::default(),
            environment: None,
        }
    }

    #[test]
    fn prepare_writes_control_files() {
        let dir = tempfile::tempdir().unwrap();
        let extra = WorkspaceFiles {
            kb_context: Some("## KB context".into()),
            environment: Some(json!({"JAVA_HOME": "/opt/java"})),
        };
        prepare_workspace(&task(dir.path()), AgentKind::Claude, "Do the thing", &extra).unwrap();

        let jervis = dir.path().join(".jervis");
        assert_eq!(
            std::fs::read_to_string(jervis.join("instructions.md")).unwrap(),
            "Do the thing"
        );
        let task_json: Value =
            serde_json::from_str(&std::fs::read_to_string(jervis.join("task.json")).unwrap())
                .unwrap();
        assert_eq!(task_json["agentType"], "claude");
        assert!(jervis.join("kb-context.md").exists());
        assert!(jervis.join("environment.json").exists());
        assert!(dir.path().join(".mcp.json").exists());
        assert!(dir.path().join("AGENT_NOTES.md").exists());
    }

    #[test]
    fn aider_config_references_kb_context() {
        let dir = tempfile::tempdir().unwrap();
        let extra = WorkspaceFiles {
            kb_context: Some("ctx".into()),
            environment: None,
        };
        prepare_workspace(&task(dir.path()), AgentKind::Aider, "Fix it", &extra).unwrap();
        let config = std::fs::read_to_string(dir.path().join(".aider.conf.yml")).unwrap();
        assert!(config.contains("read: [.jervis/kb-context.md]"));
    }

    #[test]
    fn missing_result_yields_failure_record() {
        let dir = tempfile::tempdir().unwrap();
        let result = read_job_result(dir.path().to_str().unwrap()).unwrap();
        assert_eq!(result["success"], false);
    }
}
