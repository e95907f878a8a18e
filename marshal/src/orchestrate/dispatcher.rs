//! Pooled coding-agent dispatch: acquire a slot, prepare the workspace, run
//! the cluster job, release the slot.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::EngineError;
use crate::jobs::{
    build_job_manifest, prepare_workspace, run_job_to_completion, AgentKind, JobApi,
    WorkspaceFiles,
};
use crate::pool::{AgentPool, TaskPriority};
use crate::settings::EngineSettings;
use crate::tools::CodingDispatcher;

use super::{CodingTask, ProjectRules};

pub struct PooledCodingDispatcher {
    pool: Arc<AgentPool>,
    api: Arc<dyn JobApi>,
    settings: Arc<EngineSettings>,
}

impl PooledCodingDispatcher {
    pub fn new(pool: Arc<AgentPool>, api: Arc<dyn JobApi>, settings: Arc<EngineSettings>) -> Self {
        Self {
            pool,
            api,
            settings,
        }
    }

    /// Runs one coding task end to end and returns the structured result read
    /// from the workspace (`success`, `summary`, optional `changed_files`,
    /// `branch`).
    pub async fn run_task(
        &self,
        task: &CodingTask,
        priority: TaskPriority,
    ) -> Result<serde_json::Value, EngineError> {
        let kind = task
            .agent_preference
            .as_deref()
            .and_then(AgentKind::parse)
            .unwrap_or(AgentKind::Claude);
        let agent_type = kind.as_str();
        let timeout_s = self.settings.agent_timeout_s(agent_type);

        self.pool
            .acquire(agent_type, priority, None)
            .await
            .map_err(|e| EngineError::JobApi(e.to_string()))?;

        let job_name = format!(
            "agent-{}-{}",
            agent_type,
            &uuid::Uuid::new_v4().to_string()[..8]
        );
        let result = self
            .run_acquired(task, kind, &job_name, timeout_s)
            .await;

        if let Some(released_type) = self.pool.mark_completed(
            &job_name,
            if result.is_ok() { "succeeded" } else { "failed" },
        ) {
            self.pool.release(&released_type);
        }
        // A None here means the stuck-job watchdog already reaped the job and
        // released its slot.
        result
    }

    async fn run_acquired(
        &self,
        task: &CodingTask,
        kind: AgentKind,
        job_name: &str,
        timeout_s: u64,
    ) -> Result<serde_json::Value, EngineError> {
        self.pool
            .mark_started(job_name, kind.as_str(), &task.id, &task.id, timeout_s);

        let instructions = build_instructions(task);
        prepare_workspace(
            task,
            kind,
            &instructions,
            &WorkspaceFiles {
                kb_context: None,
                environment: task.environment.clone(),
            },
        )?;

        let allow_git =
            !task.rules.require_approval_for_commit && !task.rules.require_approval_for_push;
        let manifest = build_job_manifest(
            job_name,
            kind,
            &task.id,
            &task.workspace_path,
            timeout_s,
            self.settings.job_ttl_seconds,
            allow_git,
            None,
        );

        let result = run_job_to_completion(
            self.api.as_ref(),
            &self.settings.k8s_namespace,
            job_name,
            &manifest,
            &task.workspace_path,
            Duration::from_secs(timeout_s),
            Duration::from_secs(5),
        )
        .await?;

        let success = result["success"].as_bool().unwrap_or(false);
        if success {
            info!(job = job_name, "coding agent finished");
            Ok(result)
        } else {
            let summary = result["summary"].as_str().unwrap_or("(no summary)").to_string();
            warn!(job = job_name, summary = %summary, "coding agent reported failure");
            Err(EngineError::JobApi(summary))
        }
    }
}

fn build_instructions(task: &CodingTask) -> String {
    let mut text = format!("# Task\n\n{}\n", task.query);
    let rules = &task.rules;
    let mut constraints: Vec<String> = Vec::new();
    if let Some(max) = rules.max_changed_files {
        constraints.push(format!("Change at most {max} files."));
    }
    if !rules.forbidden_files.is_empty() {
        constraints.push(format!(
            "Never touch: {}.",
            rules.forbidden_files.join(", ")
        ));
    }
    if let Some(prefix) = &rules.commit_prefix {
        constraints.push(format!("Prefix commit messages with \"{prefix}\"."));
    }
    if let Some(template) = &rules.branch_template {
        constraints.push(format!("Work on a branch named after \"{template}\"."));
    }
    if !constraints.is_empty() {
        text.push_str("\n## Constraints\n");
        for c in &constraints {
            text.push_str(&format!("- {c}\n"));
        }
    }
    text.push_str("\nWrite your outcome to `.jervis/result.json`.\n");
    text
}

#[async_trait]
impl CodingDispatcher for PooledCodingDispatcher {
    async fn dispatch(
        &self,
        task_description: &str,
        client_id: &str,
        project_id: &str,
    ) -> Result<String, EngineError> {
        let task_id = uuid::Uuid::new_v4().to_string();
        let task = CodingTask {
            id: task_id.clone(),
            client_id: client_id.to_string(),
            project_id: Some(project_id.to_string()),
            workspace_path: format!("{}/{}", self.settings.workspace_root, task_id),
            query: task_description.to_string(),
            agent_preference: None,
            rules: ProjectRules::default(),
            environment: None,
        };
        std::fs::create_dir_all(&task.workspace_path)?;
        let result = self.run_task(&task, TaskPriority::Background).await?;
        Ok(result["summary"].as_str().unwrap_or("done").to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{InMemoryJobApi, JobPhase};
    use serde_json::json;

    fn settings(workspace_root: &str) -> Arc<EngineSettings> {
        use crate::settings::{EscalationSettings, MemorySettings, PoolSettings, QueueSettings};
        Arc::new(EngineSettings {
            router_url: "http://router.invalid:1".into(),
            knowledgebase_url: "http://kb.invalid:1".into(),
            coordinator_url: "http://coordinator.invalid:1".into(),
            max_iterations_chat: 5,
            max_iterations_background: 5,
            compress_threshold: 20,
            stream_chunk_chars: 40,
            heartbeat_dead_seconds: 300,
            max_tool_result_chars: 8000,
            tool_execution_timeout_s: 5,
            max_concurrent_local_llm: 2,
            max_concurrent_cloud_llm: 2,
            history_db_path: String::new(),
            checkpoint_db_path: String::new(),
            queue_db_dir: String::new(),
            workspace_root: workspace_root.to_string(),
            k8s_api_url: "http://k8s.invalid:1".into(),
            k8s_namespace: "agents".into(),
            job_ttl_seconds: 600,
            pool: PoolSettings {
                max_concurrent_aider: 2,
                max_concurrent_openhands: 1,
                max_concurrent_claude: 2,
                max_concurrent_junie: 1,
                pool_wait_timeout_s: 5,
                stuck_job_timeout_multiplier: 1.5,
                agent_timeout_aider_s: 5,
                agent_timeout_openhands_s: 5,
                agent_timeout_claude_s: 5,
                agent_timeout_junie_s: 5,
            },
            memory: MemorySettings {
                lqm_max_warm_entries: 64,
                lqm_warm_ttl_seconds: 3600,
                lqm_write_buffer_max: 64,
                context_switch_confidence_threshold: 0.7,
                use_procedural_memory: true,
            },
            queue: QueueSettings {
                stale_threshold_minutes: 30,
                max_attempts: 3,
            },
            escalation: EscalationSettings {
                max_escalation_retries: 3,
                min_answer_chars: 40,
                tool_parse_failure_ratio: 0.5,
            },
        })
    }

    #[tokio::test]
    async fn run_task_prepares_workspace_and_reads_result() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path().to_str().unwrap());
        let pool = Arc::new(AgentPool::new(&settings.pool));

        let workspace = dir.path().join("t-run");
        std::fs::create_dir_all(workspace.join(".jervis")).unwrap();
        std::fs::write(
            workspace.join(".jervis/result.json"),
            r#"{"success": true, "summary": "endpoint added"}"#,
        )
        .unwrap();

        let api = Arc::new(InMemoryJobApi::with_phases(vec![JobPhase::Succeeded]));
        let dispatcher = PooledCodingDispatcher::new(pool.clone(), api.clone(), settings);

        let task = CodingTask {
            id: "t-run".into(),
            client_id: "c1".into(),
            project_id: None,
            workspace_path: workspace.to_string_lossy().into_owned(),
            query: "add endpoint".into(),
            agent_preference: Some("claude".into()),
            rules: ProjectRules {
                max_changed_files: Some(3),
                ..Default::default()
            },
            environment: Some(json!({"RUST_LOG": "info"})),
        };

        let result = dispatcher
            .run_task(&task, TaskPriority::Foreground)
            .await
            .unwrap();
        assert_eq!(result["summary"], "endpoint added");
        assert_eq!(pool.active_count("claude"), 0, "slot released");

        let instructions =
            std::fs::read_to_string(workspace.join(".jervis/instructions.md")).unwrap();
        assert!(instructions.contains("Change at most 3 files."));
        let manifest = &api.created.lock().unwrap()[0];
        assert_eq!(manifest["spec"]["activeDeadlineSeconds"], 5);
    }

    #[tokio::test]
    async fn failed_job_releases_slot() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path().to_str().unwrap());
        let pool = Arc::new(AgentPool::new(&settings.pool));
        let api = Arc::new(InMemoryJobApi::with_phases(vec![JobPhase::Failed]));
        let dispatcher = PooledCodingDispatcher::new(pool.clone(), api, settings);

        let workspace = dir.path().join("t-fail");
        std::fs::create_dir_all(&workspace).unwrap();
        let task = CodingTask {
            id: "t-fail".into(),
            client_id: "c1".into(),
            project_id: None,
            workspace_path: workspace.to_string_lossy().into_owned(),
            query: "break things".into(),
            agent_preference: Some("claude".into()),
            rules: ProjectRules::default(),
            environment: None,
        };

        assert!(dispatcher
            .run_task(&task, TaskPriority::Background)
            .await
            .is_err());
        assert_eq!(pool.active_count("claude"), 0);
    }
}
