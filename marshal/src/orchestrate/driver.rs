//! Coding-run driver: runs a task through the dispatcher, evaluates the
//! outcome against the project rules, and gates commit/push behind a durable
//! approval checkpoint.
//!
//! A paused run survives process restarts: `resume(thread_id, value)` loads
//! the checkpoint, applies the decision, and pushes exactly one terminal
//! status. Rejection skips the git operations and reports with the branch
//! unset.

use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};

use crate::approval::{checkpoint_now, CheckpointStore, InterruptPayload, ResumeValue};
use crate::coordinator::CoordinatorClient;
use crate::error::EngineError;
use crate::pool::TaskPriority;

use super::{CodingRunState, CodingTask, Evaluation, PooledCodingDispatcher};

/// Outcome of starting a coding run.
pub enum CodingOutcome {
    Done(Box<CodingRunState>),
    /// Waiting for approval; resume with the thread id.
    Paused { thread_id: String },
}

pub struct CodingRunner {
    dispatcher: Arc<PooledCodingDispatcher>,
    checkpoints: Arc<dyn CheckpointStore>,
    coordinator: CoordinatorClient,
}

impl CodingRunner {
    pub fn new(
        dispatcher: Arc<PooledCodingDispatcher>,
        checkpoints: Arc<dyn CheckpointStore>,
        coordinator: CoordinatorClient,
    ) -> Self {
        Self {
            dispatcher,
            checkpoints,
            coordinator,
        }
    }

    pub async fn run(
        &self,
        task: CodingTask,
        thread_id: &str,
        priority: TaskPriority,
    ) -> Result<CodingOutcome, EngineError> {
        let mut state = CodingRunState::new(task.clone());
        state.branch = Some(branch_name(&task));

        let result = match self.dispatcher.run_task(&task, priority).await {
            Ok(result) => result,
            Err(e) => {
                state.error = Some(e.to_string());
                self.report_terminal(&state, thread_id, "error").await;
                return Ok(CodingOutcome::Done(Box::new(state)));
            }
        };

        state.final_result = result["summary"].as_str().map(str::to_string);
        let changed_files: Vec<String> = result["changed_files"]
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect();
        state.artifacts = changed_files.iter().map(|f| Value::String(f.clone())).collect();

        let evaluation = Evaluation::from_changed_files(&changed_files, &state.rules);
        let acceptable = evaluation.acceptable();
        state.evaluation = Some(evaluation);
        if !acceptable {
            warn!(task = %task.id, "evaluation rejected the change set");
            state.error = Some("evaluation failed".into());
            state.branch = None;
            self.report_terminal(&state, thread_id, "error").await;
            return Ok(CodingOutcome::Done(Box::new(state)));
        }

        if state.rules.require_approval_for_commit || state.rules.require_approval_for_push {
            let action = if state.rules.require_approval_for_commit {
                "commit"
            } else {
                "push"
            };
            let interrupt = InterruptPayload::approval(
                action,
                format!(
                    "{} {} changed file(s) on {}",
                    action,
                    changed_files.len(),
                    state.branch.as_deref().unwrap_or("?"),
                ),
                state.branch.clone(),
                changed_files,
            );
            self.checkpoints
                .put(&checkpoint_now(
                    thread_id,
                    "coding",
                    interrupt.clone(),
                    serde_json::to_value(&state)?,
                ))
                .await
                .map_err(|e| EngineError::Checkpoint(e.to_string()))?;

            self.coordinator
                .report_status(
                    &state.task.id,
                    thread_id,
                    "interrupted",
                    state.final_result.as_deref(),
                    None,
                    Some(&interrupt.action),
                    Some(&interrupt.description),
                    state.branch.as_deref(),
                    &state.artifacts,
                )
                .await;
            info!(task = %task.id, thread_id, "coding run paused for approval");
            return Ok(CodingOutcome::Paused {
                thread_id: thread_id.to_string(),
            });
        }

        self.report_terminal(&state, thread_id, "done").await;
        Ok(CodingOutcome::Done(Box::new(state)))
    }

    /// Applies the approval decision to a paused run. Works across process
    /// restarts: everything needed lives in the checkpoint.
    pub async fn resume(
        &self,
        thread_id: &str,
        value: ResumeValue,
    ) -> Result<CodingRunState, EngineError> {
        let checkpoint = self
            .checkpoints
            .get(thread_id)
            .await
            .map_err(|e| EngineError::Checkpoint(e.to_string()))?
            .ok_or_else(|| EngineError::Checkpoint(format!("no checkpoint for {thread_id}")))?;
        if checkpoint.run_kind != "coding" {
            return Err(EngineError::Checkpoint(format!(
                "thread {thread_id} is a {} run",
                checkpoint.run_kind
            )));
        }
        let mut state: CodingRunState = serde_json::from_value(checkpoint.state)?;
        self.checkpoints
            .delete(thread_id)
            .await
            .map_err(|e| EngineError::Checkpoint(e.to_string()))?;

        if value.approved {
            info!(thread_id, action = %checkpoint.interrupt.action, "approval granted");
        } else {
            info!(thread_id, reason = ?value.reason, "approval rejected, skipping git operations");
            state.branch = None;
            let note = format!(
                "Changes left uncommitted ({}).",
                value.reason.as_deref().unwrap_or("rejected by user")
            );
            state.final_result = Some(match state.final_result.take() {
                Some(summary) => format!("{summary}\n\n{note}"),
                None => note,
            });
        }

        self.report_terminal(&state, thread_id, "done").await;
        Ok(state)
    }

    async fn report_terminal(&self, state: &CodingRunState, thread_id: &str, status: &str) {
        self.coordinator
            .report_status(
                &state.task.id,
                thread_id,
                status,
                state.final_result.as_deref(),
                state.error.as_deref(),
                None,
                None,
                state.branch.as_deref(),
                &state.artifacts,
            )
            .await;
    }
}

/// Branch from the rules template (`{task_id}` substituted) or a default.
fn branch_name(task: &CodingTask) -> String {
    match &task.rules.branch_template {
        Some(template) => template.replace("{task_id}", &task.id),
        None => format!("agent/{}", task.id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::SqliteCheckpointStore;
    use crate::jobs::{InMemoryJobApi, JobPhase};
    use crate::orchestrate::ProjectRules;
    use crate::pool::AgentPool;
    use crate::settings::EngineSettings;

    fn test_settings() -> Arc<EngineSettings> {
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
            workspace_root: "/tmp".to_string(),
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

    fn runner(
        dir: &std::path::Path,
        phases: Vec<JobPhase>,
    ) -> (CodingRunner, Arc<SqliteCheckpointStore>) {
        let settings = test_settings();
        let pool = Arc::new(AgentPool::new(&settings.pool));
        let api = Arc::new(InMemoryJobApi::with_phases(phases));
        let dispatcher = Arc::new(PooledCodingDispatcher::new(pool, api, settings));
        let checkpoints = Arc::new(SqliteCheckpointStore::new(dir.join("cp.db")).unwrap());
        let coordinator = CoordinatorClient::new("http://coordinator.invalid:1");
        (
            CodingRunner::new(dispatcher, checkpoints.clone(), coordinator),
            checkpoints,
        )
    }

    fn task(workspace: &std::path::Path, rules: ProjectRules) -> CodingTask {
        CodingTask {
            id: "ct-1".into(),
            client_id: "c1".into(),
            project_id: None,
            workspace_path: workspace.to_string_lossy().into_owned(),
            query: "implement the endpoint".into(),
            agent_preference: Some("claude".into()),
            rules,
            environment: None,
        }
    }

    fn write_result(workspace: &std::path::Path, content: &str) {
        std::fs::create_dir_all(workspace.join(".jervis")).unwrap();
        std::fs::write(workspace.join(".jervis/result.json"), content).unwrap();
    }

    #[tokio::test]
    async fn approval_gate_pauses_then_resume_approved_keeps_branch() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path().join("ws");
        write_result(
            &workspace,
            r#"{"success": true, "summary": "endpoint added", "changed_files": ["src/api.rs"]}"#,
        );
        let (runner, checkpoints) = runner(dir.path(), vec![JobPhase::Succeeded]);

        let rules = ProjectRules {
            require_approval_for_commit: true,
            branch_template: Some("feature/{task_id}".into()),
            ..Default::default()
        };
        let outcome = runner
            .run(task(&workspace, rules), "thread-ct1", TaskPriority::Foreground)
            .await
            .unwrap();
        assert!(matches!(outcome, CodingOutcome::Paused { .. }));

        // "Restart": a fresh runner over the same checkpoint DB resumes.
        let (runner2, _) = runner_from(checkpoints);
        let state = runner2
            .resume(
                "thread-ct1",
                ResumeValue {
                    approved: true,
                    reason: None,
                    value: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(state.branch.as_deref(), Some("feature/ct-1"));
        assert_eq!(state.final_result.as_deref(), Some("endpoint added"));
    }

    fn runner_from(
        checkpoints: Arc<SqliteCheckpointStore>,
    ) -> (CodingRunner, Arc<SqliteCheckpointStore>) {
        let settings = test_settings();
        let pool = Arc::new(AgentPool::new(&settings.pool));
        let api = Arc::new(InMemoryJobApi::with_phases(vec![JobPhase::Succeeded]));
        let dispatcher = Arc::new(PooledCodingDispatcher::new(pool, api, settings));
        let coordinator = CoordinatorClient::new("http://coordinator.invalid:1");
        (
            CodingRunner::new(dispatcher, checkpoints.clone(), coordinator),
            checkpoints,
        )
    }

    #[tokio::test]
    async fn rejection_unsets_branch_and_notes_skip() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path().join("ws");
        write_result(
            &workspace,
            r#"{"success": true, "summary": "patched", "changed_files": ["src/a.rs"]}"#,
        );
        let (runner, _) = runner(dir.path(), vec![JobPhase::Succeeded]);
        let rules = ProjectRules {
            require_approval_for_push: true,
            ..Default::default()
        };
        let outcome = runner
            .run(task(&workspace, rules), "thread-rej", TaskPriority::Background)
            .await
            .unwrap();
        assert!(matches!(outcome, CodingOutcome::Paused { .. }));

        let state = runner
            .resume(
                "thread-rej",
                ResumeValue {
                    approved: false,
                    reason: Some("wrong approach".into()),
                    value: None,
                },
            )
            .await
            .unwrap();
        assert!(state.branch.is_none());
        assert!(state
            .final_result
            .unwrap()
            .contains("Changes left uncommitted (wrong approach)"));
    }

    #[tokio::test]
    async fn forbidden_file_blocks_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path().join("ws");
        write_result(
            &workspace,
            r#"{"success": true, "summary": "oops", "changed_files": ["secrets/key"]}"#,
        );
        let (runner, checkpoints) = runner(dir.path(), vec![JobPhase::Succeeded]);
        let rules = ProjectRules {
            forbidden_files: vec!["secrets/*".into()],
            require_approval_for_commit: true,
            ..Default::default()
        };
        let outcome = runner
            .run(task(&workspace, rules), "thread-forbidden", TaskPriority::Background)
            .await
            .unwrap();
        let CodingOutcome::Done(state) = outcome else {
            panic!("blocked run must not pause for approval");
        };
        assert!(state.branch.is_none());
        assert_eq!(state.error.as_deref(), Some("evaluation failed"));
        assert!(checkpoints.get("thread-forbidden").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn no_approval_rules_complete_directly() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path().join("ws");
        write_result(&workspace, r#"{"success": true, "summary": "done"}"#);
        let (runner, _) = runner(dir.path(), vec![JobPhase::Succeeded]);
        let outcome = runner
            .run(
                task(&workspace, ProjectRules::default()),
                "thread-direct",
                TaskPriority::Background,
            )
            .await
            .unwrap();
        let CodingOutcome::Done(state) = outcome else {
            panic!("expected done");
        };
        assert_eq!(state.branch.as_deref(), Some("agent/ct-1"));
        assert!(state.error.is_none());
    }
}
