//! Engine configuration via environment variables (after `config::load_and_apply`).

/// Per-agent-type pool limits and timeouts.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_concurrent_aider: usize,
    pub max_concurrent_openhands: usize,
    pub max_concurrent_claude: usize,
    pub max_concurrent_junie: usize,
    pub pool_wait_timeout_s: u64,
    pub stuck_job_timeout_multiplier: f64,
    pub agent_timeout_aider_s: u64,
    pub agent_timeout_openhands_s: u64,
    pub agent_timeout_claude_s: u64,
    pub agent_timeout_junie_s: u64,
}

/// Memory subsystem knobs.
#[derive(Debug, Clone)]
pub struct MemorySettings {
    pub lqm_max_warm_entries: usize,
    pub lqm_warm_ttl_seconds: u64,
    pub lqm_write_buffer_max: usize,
    pub context_switch_confidence_threshold: f64,
    /// When false, `procedure`-category knowledge is kept session-local and
    /// never written through to the KB.
    pub use_procedural_memory: bool,
}

/// Extraction queue knobs.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub stale_threshold_minutes: i64,
    pub max_attempts: u32,
}

/// Background escalation quality signals (kept configurable; the exact
/// heuristics vary by deployment).
#[derive(Debug, Clone)]
pub struct EscalationSettings {
    pub max_escalation_retries: u32,
    pub min_answer_chars: usize,
    pub tool_parse_failure_ratio: f64,
}

/// All engine knobs, read once at startup.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub router_url: String,
    pub knowledgebase_url: String,
    pub coordinator_url: String,

    pub max_iterations_chat: u32,
    pub max_iterations_background: u32,
    pub compress_threshold: usize,
    pub stream_chunk_chars: usize,
    pub heartbeat_dead_seconds: u64,
    pub max_tool_result_chars: usize,
    pub tool_execution_timeout_s: u64,

    pub max_concurrent_local_llm: usize,
    pub max_concurrent_cloud_llm: usize,

    pub history_db_path: String,
    pub checkpoint_db_path: String,
    pub queue_db_dir: String,
    pub workspace_root: String,

    pub k8s_api_url: String,
    pub k8s_namespace: String,
    pub job_ttl_seconds: u64,

    pub pool: PoolSettings,
    pub memory: MemorySettings,
    pub queue: QueueSettings,
    pub escalation: EscalationSettings,
}

impl EngineSettings {
    pub fn from_env() -> Self {
        Self {
            router_url: env_config::env_string("ROUTER_URL", "http://127.0.0.1:11430")
                .trim_end_matches('/')
                .to_string(),
            knowledgebase_url: env_config::env_string(
                "KNOWLEDGEBASE_URL",
                "http://127.0.0.1:8081",
            )
            .trim_end_matches('/')
            .to_string(),
            coordinator_url: env_config::env_string("COORDINATOR_URL", "http://127.0.0.1:8080")
                .trim_end_matches('/')
                .to_string(),

            max_iterations_chat: env_config::env_u64("MAX_ITERATIONS_CHAT", 15) as u32,
            max_iterations_background: env_config::env_u64("MAX_ITERATIONS_BACKGROUND", 15) as u32,
            compress_threshold: env_config::env_u64("COMPRESS_THRESHOLD", 20) as usize,
            stream_chunk_chars: env_config::env_u64("STREAM_CHUNK_CHARS", 40) as usize,
            heartbeat_dead_seconds: env_config::env_u64("HEARTBEAT_DEAD_SECONDS", 300),
            max_tool_result_chars: env_config::env_u64("MAX_TOOL_RESULT_CHARS", 8000) as usize,
            tool_execution_timeout_s: env_config::env_u64("TOOL_EXECUTION_TIMEOUT_S", 60),

            max_concurrent_local_llm: env_config::env_u64("MAX_CONCURRENT_LOCAL_LLM", 2) as usize,
            max_concurrent_cloud_llm: env_config::env_u64("MAX_CONCURRENT_CLOUD_LLM", 4) as usize,

            history_db_path: env_config::env_string("HISTORY_DB_PATH", "data/chat_history.db"),
            checkpoint_db_path: env_config::env_string(
                "CHECKPOINT_DB_PATH",
                "data/checkpoints.db",
            ),
            queue_db_dir: env_config::env_string("QUEUE_DB_DIR", "data/queue"),
            workspace_root: env_config::env_string("WORKSPACE_ROOT", "/workspaces"),

            k8s_api_url: env_config::env_string("K8S_API_URL", "http://127.0.0.1:8001"),
            k8s_namespace: env_config::env_string("K8S_NAMESPACE", "agents"),
            job_ttl_seconds: env_config::env_u64("JOB_TTL_SECONDS", 600),

            pool: PoolSettings {
                max_concurrent_aider: env_config::env_u64("MAX_CONCURRENT_AIDER", 2) as usize,
                max_concurrent_openhands: env_config::env_u64("MAX_CONCURRENT_OPENHANDS", 1)
                    as usize,
                max_concurrent_claude: env_config::env_u64("MAX_CONCURRENT_CLAUDE", 2) as usize,
                max_concurrent_junie: env_config::env_u64("MAX_CONCURRENT_JUNIE", 1) as usize,
                pool_wait_timeout_s: env_config::env_u64("POOL_WAIT_TIMEOUT", 600),
                stuck_job_timeout_multiplier: env_config::env_f64(
                    "STUCK_JOB_TIMEOUT_MULTIPLIER",
                    1.5,
                ),
                agent_timeout_aider_s: env_config::env_u64("AGENT_TIMEOUT_AIDER", 1800),
                agent_timeout_openhands_s: env_config::env_u64("AGENT_TIMEOUT_OPENHANDS", 2700),
                agent_timeout_claude_s: env_config::env_u64("AGENT_TIMEOUT_CLAUDE", 1800),
                agent_timeout_junie_s: env_config::env_u64("AGENT_TIMEOUT_JUNIE", 1800),
            },
            memory: MemorySettings {
                lqm_max_warm_entries: env_config::env_u64("LQM_MAX_WARM_ENTRIES", 64) as usize,
                lqm_warm_ttl_seconds: env_config::env_u64("LQM_WARM_TTL_SECONDS", 3600),
                lqm_write_buffer_max: env_config::env_u64("LQM_WRITE_BUFFER_MAX", 256) as usize,
                context_switch_confidence_threshold: env_config::env_f64(
                    "CONTEXT_SWITCH_CONFIDENCE_THRESHOLD",
                    0.7,
                ),
                use_procedural_memory: env_config::env_bool("USE_PROCEDURAL_MEMORY", true),
            },
            queue: QueueSettings {
                stale_threshold_minutes: env_config::env_u64("STALE_THRESHOLD_MINUTES", 30) as i64,
                max_attempts: env_config::env_u64("MAX_ATTEMPTS", 3) as u32,
            },
            escalation: EscalationSettings {
                max_escalation_retries: env_config::env_u64("MAX_ESCALATION_RETRIES", 3) as u32,
                min_answer_chars: env_config::env_u64("ESCALATION_MIN_ANSWER_CHARS", 40) as usize,
                tool_parse_failure_ratio: env_config::env_f64(
                    "ESCALATION_TOOL_PARSE_FAILURE_RATIO",
                    0.5,
                ),
            },
        }
    }

    pub fn agent_timeout_s(&self, agent_type: &str) -> u64 {
        match agent_type {
            "aider" => self.pool.agent_timeout_aider_s,
            "openhands" => self.pool.agent_timeout_openhands_s,
            "claude" => self.pool.agent_timeout_claude_s,
            "junie" => self.pool.agent_timeout_junie_s,
            _ => 1800,
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_env()
    }
}
