//! Kubernetes Job dispatch for coding agents.
//!
//! The engine builds a Job manifest (one container, agent-specific image, PVC
//! workspace mount, `backoffLimit: 0`, deadline from the agent timeout), polls
//! its status, and reads the structured outcome from
//! `<workspace>/.jervis/result.json` on success. The cluster API sits behind
//! [`JobApi`] so tests can run against an in-memory fake.

mod workspace;

pub use workspace::{prepare_workspace, read_job_result, WorkspaceFiles};

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::error::EngineError;

/// Supported coding-agent families.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AgentKind {
    Aider,
    Openhands,
    Claude,
    Junie,
}

impl AgentKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "aider" => Some(AgentKind::Aider),
            "openhands" => Some(AgentKind::Openhands),
            "claude" => Some(AgentKind::Claude),
            "junie" => Some(AgentKind::Junie),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Aider => "aider",
            AgentKind::Openhands => "openhands",
            AgentKind::Claude => "claude",
            AgentKind::Junie => "junie",
        }
    }

    pub fn image(&self) -> &'static str {
        match self {
            AgentKind::Aider => "registry.local/agents/aider-runner:latest",
            AgentKind::Openhands => "registry.local/agents/openhands-runner:latest",
            AgentKind::Claude => "registry.local/agents/claude-runner:latest",
            AgentKind::Junie => "registry.local/agents/junie-runner:latest",
        }
    }
}

/// Coarse job phase derived from the Job status counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
}

#[async_trait]
pub trait JobApi: Send + Sync {
    async fn create_job(&self, namespace: &str, manifest: &Value) -> Result<(), EngineError>;
    async fn job_phase(&self, namespace: &str, job_name: &str) -> Result<JobPhase, EngineError>;
    async fn delete_job(&self, namespace: &str, job_name: &str) -> Result<(), EngineError>;
}

/// Builds the Job manifest for one coding-agent run.
#[allow(clippy::too_many_arguments)]
pub fn build_job_manifest(
    job_name: &str,
    kind: AgentKind,
    task_id: &str,
    workspace_path: &str,
    timeout_seconds: u64,
    ttl_seconds: u64,
    allow_git: bool,
    signing_key_secret: Option<&str>,
) -> Value {
    let mut env = vec![
        json!({"name": "JERVIS_TASK_ID", "value": task_id}),
        json!({"name": "JERVIS_WORKSPACE", "value": workspace_path}),
        json!({"name": "JERVIS_ALLOW_GIT", "value": if allow_git { "1" } else { "0" }}),
    ];
    if let Some(secret) = signing_key_secret {
        env.push(json!({
            "name": "GIT_SIGNING_KEY",
            "valueFrom": {"secretKeyRef": {"name": secret, "key": "key"}}
        }));
    }

    json!({
        "apiVersion": "batch/v1",
        "kind": "Job",
        "metadata": {
            "name": job_name,
            "labels": {
                "app": "coding-agent",
                "agent-type": kind.as_str(),
                "task-id": task_id,
            },
        },
        "spec": {
            "backoffLimit": 0,
            "activeDeadlineSeconds": timeout_seconds,
            "ttlSecondsAfterFinished": ttl_seconds,
            "template": {
                "metadata": {"labels": {"app": "coding-agent", "agent-type": kind.as_str()}},
                "spec": {
                    "restartPolicy": "Never",
                    "containers": [{
                        "name": kind.as_str(),
                        "image": kind.image(),
                        "env": env,
                        "workingDir": workspace_path,
                        "resources": {
                            "requests": {"cpu": "500m", "memory": "1Gi"},
                            "limits": {"cpu": "2", "memory": "4Gi"},
                        },
                        "volumeMounts": [{
                            "name": "workspaces",
                            "mountPath": "/workspaces",
                        }],
                    }],
                    "volumes": [{
                        "name": "workspaces",
                        "persistentVolumeClaim": {"claimName": "agent-workspaces"},
                    }],
                },
            },
        },
    })
}

/// Cluster-backed implementation over the Kubernetes REST API.
pub struct HttpJobApi {
    base_url: String,
    client: reqwest::Client,
}

impl HttpJobApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl JobApi for HttpJobApi {
    async fn create_job(&self, namespace: &str, manifest: &Value) -> Result<(), EngineError> {
        let resp = self
            .client
            .post(format!(
                "{}/apis/batch/v1/namespaces/{namespace}/jobs",
                self.base_url
            ))
            .json(manifest)
            .send()
            .await
            .map_err(|e| EngineError::JobApi(e.to_string()))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(EngineError::JobApi(format!(
                "create job {status}: {}",
                body.chars().take(300).collect::<String>()
            )));
        }
        Ok(())
    }

    async fn job_phase(&self, namespace: &str, job_name: &str) -> Result<JobPhase, EngineError> {
        let resp = self
            .client
            .get(format!(
                "{}/apis/batch/v1/namespaces/{namespace}/jobs/{job_name}",
                self.base_url
            ))
            .send()
            .await
            .map_err(|e| EngineError::JobApi(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(EngineError::JobApi(format!(
                "job status {}",
                resp.status()
            )));
        }
        let value: Value = resp
            .json()
            .await
            .map_err(|e| EngineError::JobApi(e.to_string()))?;
        Ok(phase_from_status(&value["status"]))
    }

    async fn delete_job(&self, namespace: &str, job_name: &str) -> Result<(), EngineError> {
        self.client
            .delete(format!(
                "{}/apis/batch/v1/namespaces/{namespace}/jobs/{job_name}",
                self.base_url
            ))
            .send()
            .await
            .map_err(|e| EngineError::JobApi(e.to_string()))?;
        Ok(())
    }
}

fn phase_from_status(status: &Value) -> JobPhase {
    if status["succeeded"].as_u64().unwrap_or(0) > 0 {
        JobPhase::Succeeded
    } else if status["failed"].as_u64().unwrap_or(0) > 0 {
        JobPhase::Failed
    } else if status["active"].as_u64().unwrap_or(0) > 0 {
        JobPhase::Running
    } else {
        JobPhase::Pending
    }
}

/// In-memory fake for tests: records manifests, serves a scripted phase
/// sequence.
pub struct InMemoryJobApi {
    pub created: std::sync::Mutex<Vec<Value>>,
    phases: std::sync::Mutex<std::collections::VecDeque<JobPhase>>,
}

impl InMemoryJobApi {
    pub fn with_phases(phases: Vec<JobPhase>) -> Self {
        Self {
            created: std::sync::Mutex::new(Vec::new()),
            phases: std::sync::Mutex::new(phases.into()),
        }
    }
}

#[async_trait]
impl JobApi for InMemoryJobApi {
    async fn create_job(&self, _namespace: &str, manifest: &Value) -> Result<(), EngineError> {
        self.created
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(manifest.clone());
        Ok(())
    }

    async fn job_phase(&self, _namespace: &str, _job_name: &str) -> Result<JobPhase, EngineError> {
        let mut phases = self.phases.lock().unwrap_or_else(|e| e.into_inner());
        Ok(if phases.len() > 1 {
            phases.pop_front().unwrap_or(JobPhase::Failed)
        } else {
            phases.front().copied().unwrap_or(JobPhase::Failed)
        })
    }

    async fn delete_job(&self, _namespace: &str, _job_name: &str) -> Result<(), EngineError> {
        Ok(())
    }
}

/// Runs a job to completion: create, poll every few seconds until the deadline,
/// then read `.jervis/result.json` on success.
pub async fn run_job_to_completion(
    api: &dyn JobApi,
    namespace: &str,
    job_name: &str,
    manifest: &Value,
    workspace_path: &str,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<Value, EngineError> {
    api.create_job(namespace, manifest).await?;
    info!(job = job_name, namespace, "job created");

    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if tokio::time::Instant::now() >= deadline {
            warn!(job = job_name, "job deadline reached, deleting");
            let _ = api.delete_job(namespace, job_name).await;
            return Err(EngineError::JobApi(format!(
                "job {job_name} exceeded {}s deadline",
                timeout.as_secs()
            )));
        }
        match api.job_phase(namespace, job_name).await {
            Ok(JobPhase::Succeeded) => {
                info!(job = job_name, "job succeeded");
                return read_job_result(workspace_path);
            }
            Ok(JobPhase::Failed) => {
                return Err(EngineError::JobApi(format!("job {job_name} failed")));
            }
            Ok(JobPhase::Running | JobPhase::Pending) => {}
            Err(e) => warn!(job = job_name, error = %e, "status poll failed"),
        }
        tokio::time::sleep(poll_interval).await;
    }
}
