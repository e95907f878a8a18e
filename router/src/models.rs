//! Model sets, VRAM estimates, embedding model classification, priorities.

use std::collections::HashMap;

use once_cell::sync::Lazy;

use crate::priority::Priority;

/// A named group of models loaded together with a shared keep_alive.
#[derive(Debug, Clone)]
pub struct ModelSet {
    pub name: &'static str,
    pub models: &'static [&'static str],
    pub keep_alive: &'static str,
}

/// Model sets known to the router. `background` is what the watchdog reloads
/// after an orchestrator reservation ends.
pub static MODEL_SETS: &[ModelSet] = &[
    ModelSet {
        name: "orchestrator",
        models: &["qwen3-coder-tool:30b"],
        keep_alive: "30m",
    },
    ModelSet {
        name: "background",
        models: &["qwen2.5:7b", "qwen2.5:14b", "qwen3-embedding:8b"],
        keep_alive: "10m",
    },
    ModelSet {
        name: "vlm",
        models: &["qwen3-vl:latest"],
        keep_alive: "5m",
    },
];

pub fn model_set(name: &str) -> Option<&'static ModelSet> {
    MODEL_SETS.iter().find(|s| s.name == name)
}

/// Approximate VRAM sizes (GiB) for known models. Unknown models get 8 GiB.
static MODEL_VRAM_ESTIMATES: Lazy<HashMap<&'static str, f64>> = Lazy::new(|| {
    HashMap::from([
        ("qwen3-coder-tool:30b", 25.0),
        ("qwen2.5:7b", 5.0),
        ("qwen2.5:14b", 10.0),
        ("qwen3-embedding:8b", 5.0),
        ("qwen3-vl:latest", 12.0),
    ])
});

pub fn estimate_vram(model: &str) -> f64 {
    MODEL_VRAM_ESTIMATES.get(model).copied().unwrap_or(8.0)
}

/// Embedding-family models: loaded/unloaded through the embeddings endpoint
/// and, by default, never preempted (short single-shot requests).
pub fn is_embedding_model(model: &str) -> bool {
    model.contains("embed")
}

/// API paths served without streaming.
pub const EMBEDDING_PATHS: &[&str] = &["/api/embeddings", "/api/embed"];

pub fn is_embedding_path(path: &str) -> bool {
    EMBEDDING_PATHS.contains(&path)
}

/// Model names larger than this marker force exclusive residency: loading one
/// first unloads everything else on the backend.
pub const LARGE_MODEL_MARKER: &str = ":30b";

/// Default priority per model. Critical arrives via header, not model name.
pub fn default_priority_for_model(_model: &str) -> Priority {
    Priority::Normal
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_models_have_estimates_unknown_default() {
        assert_eq!(estimate_vram("qwen2.5:7b"), 5.0);
        assert_eq!(estimate_vram("some-new-model"), 8.0);
    }

    #[test]
    fn embedding_classification() {
        assert!(is_embedding_model("qwen3-embedding:8b"));
        assert!(!is_embedding_model("qwen2.5:7b"));
        assert!(is_embedding_path("/api/embed"));
        assert!(!is_embedding_path("/api/generate"));
    }

    #[test]
    fn background_set_exists() {
        let set = model_set("background").unwrap();
        assert!(set.models.contains(&"qwen2.5:7b"));
    }
}
