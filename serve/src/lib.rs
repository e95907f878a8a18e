//! Orchestration HTTP surface (axum): `/chat` SSE, `/orchestrate/stream`,
//! `/approve/{thread_id}`, `/status/{thread_id}`.

mod app;

pub use app::{build_engine, router, AppState};
