//! GPU backend pool: per-backend state tracking, model load/unload.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::json;
use tracing::{error, info, warn};

use crate::models::{estimate_vram, is_embedding_model, model_set, LARGE_MODEL_MARKER};
use crate::priority::Priority;
use crate::request::TrackedRequest;
use crate::settings::{GpuBackendConfig, RouterSettings};

/// State of a single GPU Ollama backend.
///
/// Mutable pieces sit behind short-lived locks; nothing here is held across an
/// await. `active_requests` is the preemption registry: entries are inserted
/// when a request is sent to this backend and removed when its proxy finishes.
pub struct GpuBackend {
    pub name: String,
    pub url: String,
    pub vram_gb: f64,
    loaded_models: Mutex<HashMap<String, f64>>,
    pub active_requests: DashMap<String, Arc<TrackedRequest>>,
    reservation: Mutex<Option<(String, Instant)>>,
    healthy: AtomicBool,
    last_activity: Mutex<Instant>,
}

impl GpuBackend {
    pub fn new(cfg: &GpuBackendConfig) -> Self {
        Self {
            name: cfg.name.clone(),
            url: cfg.url.clone(),
            vram_gb: cfg.vram_gb,
            loaded_models: Mutex::new(HashMap::new()),
            active_requests: DashMap::new(),
            reservation: Mutex::new(None),
            healthy: AtomicBool::new(true),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    pub fn used_vram_gb(&self) -> f64 {
        self.loaded_models
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .sum()
    }

    pub fn free_vram_gb(&self) -> f64 {
        self.vram_gb - self.used_vram_gb()
    }

    pub fn has_model(&self, model: &str) -> bool {
        self.loaded_models
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(model)
    }

    pub fn loaded_model_names(&self) -> Vec<String> {
        self.loaded_models
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    pub fn record_loaded(&self, model: &str, vram_gb: f64) {
        self.loaded_models
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(model.to_string(), vram_gb);
    }

    pub fn record_unloaded(&self, model: &str) {
        self.loaded_models
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(model);
    }

    pub fn replace_loaded(&self, models: HashMap<String, f64>) {
        *self.loaded_models.lock().unwrap_or_else(|e| e.into_inner()) = models;
    }

    pub fn active_request_count(&self) -> usize {
        self.active_requests.len()
    }

    pub fn has_active_background(&self) -> bool {
        self.active_requests
            .iter()
            .any(|r| r.priority >= Priority::Normal)
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Relaxed);
    }

    pub fn reserved_by(&self) -> Option<String> {
        self.reservation
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|(s, _)| s.clone())
    }

    pub fn reserve(&self, session_id: &str) {
        *self.reservation.lock().unwrap_or_else(|e| e.into_inner()) =
            Some((session_id.to_string(), Instant::now()));
    }

    pub fn clear_reservation(&self) {
        *self.reservation.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    pub fn touch(&self) {
        *self.last_activity.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }
}

/// Manages the pool of GPU backends.
pub struct BackendPool {
    pub backends: Vec<Arc<GpuBackend>>,
    model_load_timeout: Duration,
    default_keep_alive: String,
    orchestrator_model: String,
}

impl BackendPool {
    pub fn new(settings: &RouterSettings) -> Self {
        Self {
            backends: settings
                .gpu_backends
                .iter()
                .map(|cfg| Arc::new(GpuBackend::new(cfg)))
                .collect(),
            model_load_timeout: Duration::from_secs(settings.model_load_timeout_s),
            default_keep_alive: settings.default_keep_alive.clone(),
            orchestrator_model: settings.orchestrator_model.clone(),
        }
    }

    pub fn healthy_backends(&self) -> Vec<Arc<GpuBackend>> {
        self.backends
            .iter()
            .filter(|b| b.is_healthy())
            .cloned()
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<Arc<GpuBackend>> {
        self.backends.iter().find(|b| b.name == name).cloned()
    }

    /// A healthy GPU that already has this model resident.
    pub fn find_with_model(&self, model: &str) -> Option<Arc<GpuBackend>> {
        self.healthy_backends()
            .into_iter()
            .find(|b| b.has_model(model))
    }

    /// A healthy GPU with enough free VRAM for the model, preferring the one
    /// with the most headroom.
    pub fn find_with_free_vram(&self, model: &str) -> Option<Arc<GpuBackend>> {
        let needed = estimate_vram(model);
        self.healthy_backends()
            .into_iter()
            .filter(|b| b.free_vram_gb() >= needed)
            .max_by(|a, b| {
                a.free_vram_gb()
                    .partial_cmp(&b.free_vram_gb())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
    }

    /// A healthy GPU with no reservation, preferring the least busy.
    pub fn find_unreserved(&self) -> Option<Arc<GpuBackend>> {
        self.healthy_backends()
            .into_iter()
            .filter(|b| b.reserved_by().is_none())
            .min_by_key(|b| b.active_request_count())
    }

    pub fn find_least_busy(&self) -> Option<Arc<GpuBackend>> {
        self.healthy_backends()
            .into_iter()
            .min_by_key(|b| b.active_request_count())
    }

    /// Best GPU to reserve for the orchestrator:
    /// already-has-model > unreserved > least-busy.
    pub fn find_for_reservation(&self) -> Option<Arc<GpuBackend>> {
        self.find_with_model(&self.orchestrator_model)
            .or_else(|| self.find_unreserved())
            .or_else(|| self.find_least_busy())
    }

    /// Queries `/api/ps` on each backend to reconstruct loaded-model state.
    pub async fn sync_state(&self, client: &reqwest::Client) {
        for backend in &self.backends {
            match client
                .get(format!("{}/api/ps", backend.url))
                .timeout(Duration::from_secs(10))
                .send()
                .await
                .and_then(reqwest::Response::error_for_status)
            {
                Ok(resp) => {
                    let data: serde_json::Value = match resp.json().await {
                        Ok(v) => v,
                        Err(e) => {
                            warn!(gpu = %backend.name, error = %e, "ps body parse failed");
                            continue;
                        }
                    };
                    let mut loaded = HashMap::new();
                    for m in data["models"].as_array().into_iter().flatten() {
                        let name = m["name"].as_str().unwrap_or("").to_string();
                        if name.is_empty() {
                            continue;
                        }
                        let mut vram =
                            m["size_vram"].as_f64().unwrap_or(0.0) / (1024f64 * 1024.0 * 1024.0);
                        if vram < 0.1 {
                            vram = estimate_vram(&name);
                        }
                        loaded.insert(name, vram);
                    }
                    backend.replace_loaded(loaded);
                    backend.set_healthy(true);
                    info!(
                        gpu = %backend.name,
                        loaded = ?backend.loaded_model_names(),
                        used_gb = backend.used_vram_gb(),
                        capacity_gb = backend.vram_gb,
                        "backend synced"
                    );
                }
                Err(e) => {
                    backend.set_healthy(false);
                    warn!(gpu = %backend.name, error = %e, "backend sync failed");
                }
            }
        }
    }

    /// Loads a model into VRAM via an empty-prompt generate (or empty-input
    /// embeddings) call with the configured keep_alive.
    ///
    /// Ollama spills layers to host memory when a model exceeds free VRAM, so
    /// an oversized load degrades quality of service rather than failing.
    pub async fn load_model(
        &self,
        backend: &GpuBackend,
        model: &str,
        client: &reqwest::Client,
        keep_alive: Option<&str>,
    ) -> bool {
        // A large model gets the whole card: unload everything else first.
        if model.contains(LARGE_MODEL_MARKER) && !backend.loaded_model_names().is_empty() {
            warn!(gpu = %backend.name, model, "large model load: unloading others first");
            self.unload_all(backend, client, &HashSet::new()).await;
        }

        let keep_alive = keep_alive.unwrap_or(&self.default_keep_alive);
        let (endpoint, payload) = load_payload(model, keep_alive);

        info!(gpu = %backend.name, model, keep_alive, "loading model");
        match client
            .post(format!("{}{}", backend.url, endpoint))
            .json(&payload)
            .timeout(self.model_load_timeout)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
        {
            Ok(_) => {
                backend.record_loaded(model, estimate_vram(model));
                backend.touch();
                info!(
                    gpu = %backend.name,
                    model,
                    used_gb = backend.used_vram_gb(),
                    "model loaded"
                );
                true
            }
            Err(e) => {
                error!(gpu = %backend.name, model, error = %e, "model load failed");
                false
            }
        }
    }

    /// Unloads a model via keep_alive=0 on the matching endpoint.
    pub async fn unload_model(
        &self,
        backend: &GpuBackend,
        model: &str,
        client: &reqwest::Client,
    ) -> bool {
        let (endpoint, payload) = load_payload(model, "0");
        info!(gpu = %backend.name, model, "unloading model");
        match client
            .post(format!("{}{}", backend.url, endpoint))
            .json(&payload)
            .timeout(Duration::from_secs(120))
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
        {
            Ok(_) => {
                backend.record_unloaded(model);
                true
            }
            Err(e) => {
                warn!(gpu = %backend.name, model, error = %e, "unload failed, assuming gone");
                backend.record_unloaded(model);
                false
            }
        }
    }

    /// Unloads all models from a backend, optionally keeping some. Waits up to
    /// 60 s for the backend's active requests to drain; warns and proceeds if
    /// they do not.
    pub async fn unload_all(
        &self,
        backend: &GpuBackend,
        client: &reqwest::Client,
        except_models: &HashSet<String>,
    ) {
        let to_unload: Vec<String> = backend
            .loaded_model_names()
            .into_iter()
            .filter(|m| !except_models.contains(m))
            .collect();
        if to_unload.is_empty() {
            return;
        }

        let wait_start = Instant::now();
        while backend.active_request_count() > 0 && wait_start.elapsed() < Duration::from_secs(60) {
            info!(
                gpu = %backend.name,
                active = backend.active_request_count(),
                "waiting for active requests before unload"
            );
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
        if backend.active_request_count() > 0 {
            warn!(
                gpu = %backend.name,
                active = backend.active_request_count(),
                "still busy after 60s wait, unloading anyway"
            );
        }

        for model in to_unload {
            self.unload_model(backend, &model, client).await;
        }
    }

    /// Loads an entire named model set onto a backend.
    pub async fn load_model_set(
        &self,
        backend: &GpuBackend,
        set_name: &str,
        client: &reqwest::Client,
    ) -> bool {
        let Some(set) = model_set(set_name) else {
            error!(set = set_name, "unknown model set");
            return false;
        };
        let mut success = true;
        for model in set.models {
            if !backend.has_model(model) {
                success &= self
                    .load_model(backend, model, client, Some(set.keep_alive))
                    .await;
            }
        }
        success
    }

    /// HEAD-checks all backends; a recovered backend triggers a state re-sync.
    pub async fn check_health(&self, client: &reqwest::Client) {
        let mut recovered = false;
        for backend in &self.backends {
            let was_healthy = backend.is_healthy();
            let ok = client
                .head(format!("{}/", backend.url))
                .timeout(Duration::from_secs(5))
                .send()
                .await
                .map(|r| r.status().is_success())
                .unwrap_or(false);
            backend.set_healthy(ok);
            if ok && !was_healthy {
                info!(gpu = %backend.name, "backend recovered");
                recovered = true;
            } else if !ok && was_healthy {
                warn!(gpu = %backend.name, "backend is unhealthy");
            }
        }
        if recovered {
            self.sync_state(client).await;
        }
    }
}

/// Endpoint + payload for loading or unloading a model. Embedding models must
/// use the embeddings endpoint with `input`; generation models use generate
/// with `prompt`. Mixing them produces a 400 from upstream.
fn load_payload(model: &str, keep_alive: &str) -> (&'static str, serde_json::Value) {
    if is_embedding_model(model) {
        (
            "/api/embeddings",
            json!({"model": model, "keep_alive": keep_alive, "input": ""}),
        )
    } else {
        (
            "/api/generate",
            json!({"model": model, "keep_alive": keep_alive, "prompt": "", "stream": false}),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::priority::Priority;
    use crate::request::TrackedRequest;

    fn pool_with(names: &[&str]) -> BackendPool {
        let settings = RouterSettings {
            router_host: "127.0.0.1".into(),
            router_port: 0,
            gpu_backends: names
                .iter()
                .map(|n| GpuBackendConfig {
                    url: format!("http://{n}.invalid:11434"),
                    vram_gb: 24.0,
                    name: n.to_string(),
                })
                .collect(),
            cpu_backend_url: "http://cpu.invalid:11435".into(),
            orchestrator_model: "qwen3-coder-tool:30b".into(),
            orchestrator_reservation_timeout_s: 1800,
            orchestrator_idle_timeout_s: 300,
            model_load_timeout_s: 120,
            background_load_delay_s: 5,
            proxy_connect_timeout_s: 10.0,
            default_keep_alive: "10m".into(),
            preempt_embeddings: false,
            preempt_grace_s: 2.0,
        };
        BackendPool::new(&settings)
    }

    #[test]
    fn vram_accounting() {
        let pool = pool_with(&["g1"]);
        let b = &pool.backends[0];
        b.record_loaded("qwen2.5:7b", 5.0);
        b.record_loaded("qwen2.5:14b", 10.0);
        assert_eq!(b.used_vram_gb(), 15.0);
        assert_eq!(b.free_vram_gb(), 9.0);
        b.record_unloaded("qwen2.5:14b");
        assert_eq!(b.used_vram_gb(), 5.0);
    }

    #[test]
    fn find_with_model_skips_unhealthy() {
        let pool = pool_with(&["g1", "g2"]);
        pool.backends[0].record_loaded("qwen2.5:7b", 5.0);
        pool.backends[0].set_healthy(false);
        assert!(pool.find_with_model("qwen2.5:7b").is_none());
        pool.backends[0].set_healthy(true);
        assert_eq!(pool.find_with_model("qwen2.5:7b").unwrap().name, "g1");
    }

    #[test]
    fn find_for_reservation_prefers_model_then_unreserved() {
        let pool = pool_with(&["g1", "g2"]);
        pool.backends[1].record_loaded("qwen3-coder-tool:30b", 25.0);
        assert_eq!(pool.find_for_reservation().unwrap().name, "g2");

        pool.backends[1].record_unloaded("qwen3-coder-tool:30b");
        pool.backends[0].reserve("session-a");
        assert_eq!(pool.find_for_reservation().unwrap().name, "g2");
    }

    #[test]
    fn find_with_free_vram_prefers_most_headroom() {
        let pool = pool_with(&["g1", "g2"]);
        pool.backends[0].record_loaded("qwen2.5:14b", 10.0);
        let chosen = pool.find_with_free_vram("qwen2.5:7b").unwrap();
        assert_eq!(chosen.name, "g2");
    }

    #[test]
    fn active_background_detection() {
        let pool = pool_with(&["g1"]);
        let b = &pool.backends[0];
        assert!(!b.has_active_background());
        let req = Arc::new(TrackedRequest::new(
            "qwen2.5:7b",
            Priority::Normal,
            "/api/generate",
            serde_json::json!({}),
        ));
        b.active_requests.insert(req.request_id.clone(), req);
        assert!(b.has_active_background());
    }

    #[test]
    fn load_payload_selects_endpoint_by_family() {
        let (ep, body) = load_payload("qwen3-embedding:8b", "10m");
        assert_eq!(ep, "/api/embeddings");
        assert_eq!(body["input"], "");
        let (ep, body) = load_payload("qwen2.5:7b", "0");
        assert_eq!(ep, "/api/generate");
        assert_eq!(body["prompt"], "");
        assert_eq!(body["keep_alive"], "0");
    }
}
