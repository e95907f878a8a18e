//! # router
//!
//! Priority-aware inference router fronting a pool of GPU Ollama backends and a
//! CPU fallback. Exposes the Ollama-compatible API (generate, chat, embeddings,
//! show, pull, tags, ps, delete) plus `/router/*` management endpoints.
//!
//! Routing rules, in order:
//! 1. A healthy GPU that already holds the model wins (unless reserved by
//!    another session and the request is not critical).
//! 2. Critical requests may preempt background streams and force a model load.
//! 3. Background requests go to CPU while an orchestrator reservation is held.
//! 4. Otherwise background work uses free VRAM, an idle GPU after unloading, or
//!    the CPU backend.
//!
//! Preemption closes the victim's stream with a single terminal
//! `{"error":"preempted"}` ndjson line; the replacement waits a short grace
//! period before claiming the GPU.

pub mod app;
pub mod backend;
pub mod core;
pub mod metrics;
pub mod models;
pub mod priority;
pub mod proxy;
pub mod request;
pub mod settings;

pub use app::{router_app, AppState};
pub use backend::{BackendPool, GpuBackend};
pub use core::{AnnounceOutcome, ReleaseOutcome, Router};
pub use models::{estimate_vram, is_embedding_model, ModelSet, EMBEDDING_PATHS};
pub use priority::Priority;
pub use request::{RequestState, TrackedRequest};
pub use settings::{GpuBackendConfig, RouterSettings};
