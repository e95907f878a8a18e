//! Request priority. Lower number = higher priority; only two effective levels.

use crate::models::default_priority_for_model;

/// Priority of one routed request.
///
/// `Critical` is user-facing traffic (chat, orchestrator foreground) and must
/// not wait behind background work. `Normal` is background inference that may
/// be preempted or routed to CPU.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Critical = 0,
    Normal = 1,
}

impl Priority {
    /// Parses the `X-Ollama-Priority` header value (`"0"` or `"1"`).
    pub fn from_header(value: &str) -> Option<Self> {
        match value.trim() {
            "0" => Some(Priority::Critical),
            "1" => Some(Priority::Normal),
            _ => None,
        }
    }

    /// Resolves the effective priority: explicit header wins, else the
    /// per-model default table, else `Normal`.
    pub fn resolve(model: &str, header: Option<&str>) -> Self {
        if let Some(p) = header.and_then(Priority::from_header) {
            return p;
        }
        default_priority_for_model(model)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::Normal => "normal",
        }
    }
}
