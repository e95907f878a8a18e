//! # marshal
//!
//! Orchestration core for an agent platform: priority-aware LLM access, a
//! two-tier memory substrate, a crash-safe extraction queue, agentic chat and
//! background loops, and a pooled dispatcher for external coding-agent jobs.
//!
//! ## Main modules
//!
//! - [`llm`]: [`LlmClient`] trait, [`OllamaChat`] (router-backed, priority
//!   headers, heartbeat timeout), model tiers and cloud escalation.
//! - [`queue`]: persistent extraction queue on SQLite WAL with atomic claims,
//!   bounded attempts, stale-claim recovery.
//! - [`memory`]: Local Quick Memory (affair hot map, search cache, write
//!   buffer) plus the per-orchestration [`MemoryAgent`] facade and KB client.
//! - [`context`]: chat history store and the token-budgeted context assembler
//!   with fire-and-forget compression.
//! - [`tools`]: YAML-embedded tool specs, the dispatching executor with
//!   timeouts and result clamping, tool-call extraction fallbacks.
//! - [`chat`]: the foreground streaming chat loop (events, loop detection,
//!   interruption, partial-save recovery).
//! - [`background`]: the non-streaming background loop with tier escalation.
//! - [`pool`]: per-agent-type concurrency limiter with priority waiters.
//! - [`jobs`]: Kubernetes Job manifests, workspace preparation, run driver.
//! - [`approval`]: durable pause/resume checkpoints for human-in-the-loop.
//! - [`correction`]: chunked transcript-correction scheduling with progress.
//! - [`coordinator`]: outbound progress/status pushes.
//! - [`orchestrate`]: request envelopes, project rules, coding-task state.

pub mod approval;
pub mod background;
pub mod chat;
pub mod context;
pub mod coordinator;
pub mod correction;
pub mod error;
pub mod jobs;
pub mod llm;
pub mod memory;
pub mod message;
pub mod orchestrate;
pub mod pool;
pub mod queue;
pub mod settings;
pub mod tools;

pub use error::EngineError;
pub use llm::{LlmClient, LlmResponse, LlmUsage, MockLlm, ModelTier, OllamaChat};
pub use memory::{LocalQuickMemory, MemoryAgent};
pub use message::{ChatMessage, Role};
pub use pool::{AgentPool, PoolError, TaskPriority};
pub use queue::{ExtractionQueue, ExtractionTask, TaskStatus};
pub use settings::EngineSettings;
