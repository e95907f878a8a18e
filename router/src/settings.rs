//! Router configuration via environment variables.

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("parse GPU_BACKENDS: {0}")]
    GpuBackends(#[from] serde_json::Error),
    #[error("GPU_BACKENDS must list at least one backend")]
    NoBackends,
}

/// Parsed GPU backend definition from the `GPU_BACKENDS` JSON list.
#[derive(Debug, Clone, Deserialize)]
pub struct GpuBackendConfig {
    pub url: String,
    pub vram_gb: f64,
    pub name: String,
}

/// All router knobs, read once at startup.
#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub router_host: String,
    pub router_port: u16,

    /// JSON list: `[{"url":"http://127.0.0.1:11434","vram_gb":24,"name":"p40"}]`.
    pub gpu_backends: Vec<GpuBackendConfig>,
    pub cpu_backend_url: String,

    pub orchestrator_model: String,

    pub orchestrator_reservation_timeout_s: u64,
    pub orchestrator_idle_timeout_s: u64,
    pub model_load_timeout_s: u64,
    pub background_load_delay_s: u64,
    pub proxy_connect_timeout_s: f64,

    /// Must match the Ollama server's OLLAMA_KEEP_ALIVE.
    pub default_keep_alive: String,

    pub preempt_embeddings: bool,
    pub preempt_grace_s: f64,
}

impl RouterSettings {
    /// Reads settings from the environment (after `config::load_and_apply`).
    pub fn from_env() -> Result<Self, SettingsError> {
        let raw = env_config::env_string(
            "GPU_BACKENDS",
            r#"[{"url":"http://127.0.0.1:11434","vram_gb":24,"name":"gpu0"}]"#,
        );
        let mut gpu_backends: Vec<GpuBackendConfig> = serde_json::from_str(&raw)?;
        if gpu_backends.is_empty() {
            return Err(SettingsError::NoBackends);
        }
        for b in &mut gpu_backends {
            while b.url.ends_with('/') {
                b.url.pop();
            }
        }

        Ok(Self {
            router_host: env_config::env_string("ROUTER_HOST", "0.0.0.0"),
            router_port: env_config::env_u64("ROUTER_PORT", 11430) as u16,
            gpu_backends,
            cpu_backend_url: env_config::env_string("CPU_BACKEND_URL", "http://127.0.0.1:11435")
                .trim_end_matches('/')
                .to_string(),
            orchestrator_model: env_config::env_string("ORCHESTRATOR_MODEL", "qwen3-coder-tool:30b"),
            orchestrator_reservation_timeout_s: env_config::env_u64(
                "ORCHESTRATOR_RESERVATION_TIMEOUT_S",
                1800,
            ),
            orchestrator_idle_timeout_s: env_config::env_u64("ORCHESTRATOR_IDLE_TIMEOUT_S", 300),
            model_load_timeout_s: env_config::env_u64("MODEL_LOAD_TIMEOUT_S", 120),
            background_load_delay_s: env_config::env_u64("BACKGROUND_LOAD_DELAY_S", 5),
            proxy_connect_timeout_s: env_config::env_f64("PROXY_CONNECT_TIMEOUT_S", 10.0),
            default_keep_alive: env_config::env_string("DEFAULT_KEEP_ALIVE", "10m"),
            preempt_embeddings: env_config::env_bool("PREEMPT_EMBEDDINGS", false),
            preempt_grace_s: env_config::env_f64("PREEMPT_GRACE_S", 2.0),
        })
    }
}
