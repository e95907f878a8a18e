//! Router core: multi-GPU routing logic, preemption, announce/release, watchdog.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::StatusCode;
use axum::response::Response;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::backend::{BackendPool, GpuBackend};
use crate::metrics;
use crate::models::is_embedding_path;
use crate::priority::Priority;
use crate::proxy::{
    json_error, proxy_non_streaming, proxy_streaming, ActiveRequestGuard,
};
use crate::request::{RequestState, TrackedRequest};
use crate::settings::RouterSettings;

/// Orchestrator reservation state, guarded by one mutex so concurrent
/// announce/release/watchdog cannot interleave model loads.
#[derive(Default)]
struct ReservationState {
    session: Option<String>,
    gpu: Option<String>,
    reserved_at: Option<Instant>,
    last_critical_activity: Option<Instant>,
}

/// Announce outcome returned to the orchestrator.
#[derive(Debug, Clone, Serialize)]
pub struct AnnounceOutcome {
    pub status: String,
    pub model_loaded: bool,
    pub gpu_available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu_name: Option<String>,
}

/// Release outcome returned to the orchestrator.
#[derive(Debug, Clone, Serialize)]
pub struct ReleaseOutcome {
    pub status: String,
    pub background_loading: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnnounceRequest {
    pub session_id: String,
    pub model: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseRequest {
    pub session_id: String,
}

pub struct Router {
    pub pool: Arc<BackendPool>,
    pub settings: RouterSettings,
    cpu_url: String,
    cpu_healthy: AtomicBool,
    reservation: Mutex<ReservationState>,
    bg_load_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    watchdog_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    /// Short-timeout client for management calls (load/unload/health).
    mgmt: reqwest::Client,
    /// No-read-timeout client for proxied generation traffic.
    proxy: reqwest::Client,
}

impl Router {
    pub fn new(settings: RouterSettings) -> Self {
        let mgmt = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs_f64(settings.proxy_connect_timeout_s))
            .build()
            .unwrap_or_default();
        // Generation can take minutes between tokens: connect timeout only.
        let proxy = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs_f64(settings.proxy_connect_timeout_s))
            .build()
            .unwrap_or_default();
        Self {
            pool: Arc::new(BackendPool::new(&settings)),
            cpu_url: settings.cpu_backend_url.clone(),
            settings,
            cpu_healthy: AtomicBool::new(true),
            reservation: Mutex::new(ReservationState::default()),
            bg_load_task: std::sync::Mutex::new(None),
            watchdog_task: std::sync::Mutex::new(None),
            mgmt,
            proxy,
        }
    }

    /// Initial state sync plus the reservation watchdog.
    pub async fn startup(self: &Arc<Self>) {
        self.pool.sync_state(&self.mgmt).await;
        self.check_cpu_health().await;
        let router = Arc::clone(self);
        let handle = tokio::spawn(async move { router.reservation_watchdog().await });
        *self
            .watchdog_task
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(handle);
        info!(
            gpus = self.pool.backends.len(),
            "router started"
        );
    }

    pub fn shutdown(&self) {
        if let Some(h) = self
            .watchdog_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            h.abort();
        }
        if let Some(h) = self
            .bg_load_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            h.abort();
        }
    }

    pub fn mgmt_client(&self) -> &reqwest::Client {
        &self.mgmt
    }

    pub fn cpu_url(&self) -> &str {
        &self.cpu_url
    }

    pub fn cpu_is_healthy(&self) -> bool {
        self.cpu_healthy.load(Ordering::Relaxed)
    }

    pub async fn is_reserved(&self) -> bool {
        self.reservation.lock().await.session.is_some()
    }

    // ── Main routing entry point ────────────────────────────────────────

    /// Routes one Ollama API request to the best backend.
    pub async fn route_request(
        self: &Arc<Self>,
        api_path: &str,
        body: serde_json::Value,
        priority_header: Option<&str>,
    ) -> Response {
        let model = body
            .get("model")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();
        let priority = Priority::resolve(&model, priority_header);
        let request = Arc::new(TrackedRequest::new(&model, priority, api_path, body));

        tracing::debug!(
            request = %request.request_id,
            model,
            priority = priority.as_str(),
            api_path,
            "routing request"
        );
        self.do_route(request).await
    }

    async fn do_route(self: &Arc<Self>, request: Arc<TrackedRequest>) -> Response {
        let model = request.model.clone();
        let priority = request.priority;

        // 1. A GPU that already has this model resident.
        if let Some(gpu) = self.pool.find_with_model(&model) {
            if priority == Priority::Critical || gpu.reserved_by().is_none() {
                if priority == Priority::Critical {
                    self.touch_critical().await;
                }
                return self.send_to_gpu(gpu, request).await;
            }
        }

        // 2. Critical: claim a GPU, preempting and loading as needed.
        if priority == Priority::Critical {
            let Some(gpu) = self.pool.find_for_reservation() else {
                warn!(request = %request.request_id, "no healthy GPU for critical request, using CPU");
                return self.send_to_cpu(request).await;
            };
            if gpu.has_active_background() {
                self.preempt_background(&gpu).await;
            }
            if !gpu.has_model(&model) {
                request.set_state(RequestState::LoadingModel);
                let mut keep = HashSet::new();
                keep.insert(model.clone());
                self.pool.unload_all(&gpu, &self.mgmt, &keep).await;
                metrics::MODEL_SWAPS_TOTAL.inc();
                if !self.pool.load_model(&gpu, &model, &self.mgmt, None).await {
                    error!(gpu = %gpu.name, model, "load failed for critical request, using CPU");
                    return self.send_to_cpu(request).await;
                }
            }
            self.touch_critical().await;
            return self.send_to_gpu(gpu, request).await;
        }

        // 3. Reservation active: background never contends with critical.
        if self.is_reserved().await {
            return self.send_to_cpu(request).await;
        }

        // 4. Free VRAM somewhere.
        if let Some(gpu) = self.pool.find_with_free_vram(&model) {
            if self.pool.load_model(&gpu, &model, &self.mgmt, None).await {
                return self.send_to_gpu(gpu, request).await;
            }
        }

        // 5. An idle GPU can be repurposed; otherwise CPU.
        if let Some(gpu) = self.pool.find_least_busy() {
            if gpu.active_request_count() == 0 {
                self.pool.unload_all(&gpu, &self.mgmt, &HashSet::new()).await;
                metrics::MODEL_SWAPS_TOTAL.inc();
                if self.pool.load_model(&gpu, &model, &self.mgmt, None).await {
                    return self.send_to_gpu(gpu, request).await;
                }
            }
        }
        self.send_to_cpu(request).await
    }

    // ── Send to backend ─────────────────────────────────────────────────

    async fn send_to_gpu(&self, gpu: Arc<GpuBackend>, request: Arc<TrackedRequest>) -> Response {
        request.set_state(RequestState::RunningGpu);
        let guard = ActiveRequestGuard::register(Arc::clone(&gpu), &request);
        metrics::set_gpu_active(&gpu.name, gpu.active_request_count());
        metrics::inc_routed(
            &format!("gpu:{}", gpu.name),
            &request.model,
            request.priority.as_str(),
        );
        info!(
            gpu = %gpu.name,
            request = %request.request_id,
            model = %request.model,
            priority = request.priority.as_str(),
            "routing to GPU"
        );

        if is_embedding_path(&request.api_path) || !request.is_streaming() {
            proxy_non_streaming(&self.proxy, &gpu.url, &request, Some(guard)).await
        } else {
            proxy_streaming(self.proxy.clone(), gpu.url.clone(), request, Some(guard)).await
        }
    }

    async fn send_to_cpu(&self, request: Arc<TrackedRequest>) -> Response {
        request.set_state(RequestState::RunningCpu);

        if !self.cpu_is_healthy() {
            return json_error(
                StatusCode::SERVICE_UNAVAILABLE,
                "no_backend_available",
                "Both GPU and CPU backends are unavailable",
            );
        }

        metrics::inc_cpu_fallback(&request.model);
        metrics::inc_routed("cpu", &request.model, request.priority.as_str());
        info!(
            request = %request.request_id,
            model = %request.model,
            priority = request.priority.as_str(),
            "routing to CPU"
        );

        if is_embedding_path(&request.api_path) || !request.is_streaming() {
            proxy_non_streaming(&self.proxy, &self.cpu_url, &request, None).await
        } else {
            proxy_streaming(self.proxy.clone(), self.cpu_url.clone(), request, None).await
        }
    }

    // ── Preemption ──────────────────────────────────────────────────────

    /// Preempts all background requests running on a GPU backend, then waits
    /// the grace period so the victim streams can close.
    pub async fn preempt_background(&self, gpu: &GpuBackend) {
        let mut preempted = Vec::new();
        for entry in gpu.active_requests.iter() {
            let req = entry.value();
            if req.priority >= Priority::Normal {
                // Embedding requests are short single-shots; leave them alone
                // unless configured otherwise.
                if crate::models::is_embedding_model(&req.model)
                    && !self.settings.preempt_embeddings
                {
                    continue;
                }
                req.preempt();
                preempted.push(req.request_id.clone());
            }
        }
        if !preempted.is_empty() {
            info!(
                gpu = %gpu.name,
                count = preempted.len(),
                ids = ?preempted,
                "preempted background requests"
            );
            tokio::time::sleep(Duration::from_secs_f64(self.settings.preempt_grace_s)).await;
        }
    }

    // ── Orchestrator announce/release ───────────────────────────────────

    /// Reserves a GPU for orchestrator/critical work and ensures the model is
    /// resident.
    pub async fn announce(self: &Arc<Self>, req: AnnounceRequest) -> AnnounceOutcome {
        let mut res = self.reservation.lock().await;

        let Some(gpu) = self.pool.find_for_reservation() else {
            return AnnounceOutcome {
                status: "degraded".into(),
                model_loaded: false,
                gpu_available: false,
                gpu_name: None,
            };
        };

        if let Some(h) = self
            .bg_load_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            h.abort();
        }

        res.session = Some(req.session_id.clone());
        res.gpu = Some(gpu.name.clone());
        res.reserved_at = Some(Instant::now());
        res.last_critical_activity = Some(Instant::now());
        gpu.reserve(&req.session_id);
        metrics::set_reserved(true);

        info!(gpu = %gpu.name, session = %req.session_id, model = %req.model, "GPU reserved");

        if gpu.has_active_background() {
            self.preempt_background(&gpu).await;
        }

        let mut model_loaded = gpu.has_model(&req.model);
        if !model_loaded {
            let mut keep = HashSet::new();
            keep.insert(req.model.clone());
            self.pool.unload_all(&gpu, &self.mgmt, &keep).await;
            metrics::MODEL_SWAPS_TOTAL.inc();
            model_loaded = self
                .pool
                .load_model(
                    &gpu,
                    &req.model,
                    &self.mgmt,
                    Some(&self.settings.default_keep_alive),
                )
                .await;
        }

        AnnounceOutcome {
            status: if model_loaded { "ready" } else { "error" }.into(),
            model_loaded,
            gpu_available: true,
            gpu_name: Some(gpu.name.clone()),
        }
    }

    /// Releases the reservation. Only the owning session releases; a mismatch
    /// is logged and accepted as a no-op. Schedules the delayed background-set
    /// load on the freed GPU.
    pub async fn release(self: &Arc<Self>, req: ReleaseRequest) -> ReleaseOutcome {
        let mut res = self.reservation.lock().await;
        if res.session.as_deref() != Some(req.session_id.as_str()) {
            warn!(
                session = %req.session_id,
                current = ?res.session,
                "release for a session that does not hold the reservation"
            );
            return ReleaseOutcome {
                status: "released".into(),
                background_loading: false,
            };
        }

        let gpu_name = res.gpu.clone();
        Self::clear_reservation_locked(&self.pool, &mut res);

        let mut bg_loading = false;
        if let Some(name) = gpu_name {
            if let Some(gpu) = self.pool.get(&name) {
                self.schedule_background_load(gpu);
                bg_loading = true;
            }
        }

        info!(session = %req.session_id, "GPU reservation released");
        ReleaseOutcome {
            status: "released".into(),
            background_loading: bg_loading,
        }
    }

    fn clear_reservation_locked(pool: &BackendPool, res: &mut ReservationState) {
        if let Some(name) = &res.gpu {
            if let Some(gpu) = pool.get(name) {
                gpu.clear_reservation();
            }
        }
        res.session = None;
        res.gpu = None;
        res.reserved_at = None;
        res.last_critical_activity = None;
        metrics::set_reserved(false);
    }

    fn schedule_background_load(self: &Arc<Self>, gpu: Arc<GpuBackend>) {
        let router = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(router.settings.background_load_delay_s)).await;
            // A reservation taken during the delay wins.
            if router.is_reserved().await {
                return;
            }
            info!(gpu = %gpu.name, "loading background model set");
            router
                .pool
                .unload_all(&gpu, &router.mgmt, &HashSet::new())
                .await;
            if !router
                .pool
                .load_model_set(&gpu, "background", &router.mgmt)
                .await
            {
                error!(gpu = %gpu.name, "background model set load failed");
            }
        });
        *self
            .bg_load_task
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    async fn touch_critical(&self) {
        let mut res = self.reservation.lock().await;
        if res.session.is_some() {
            res.last_critical_activity = Some(Instant::now());
        }
    }

    // ── Reservation watchdog ────────────────────────────────────────────

    /// Auto-releases reservations past the absolute or idle timeout, every 30 s.
    async fn reservation_watchdog(self: Arc<Self>) {
        let absolute = Duration::from_secs(self.settings.orchestrator_reservation_timeout_s);
        let idle = Duration::from_secs(self.settings.orchestrator_idle_timeout_s);
        loop {
            tokio::time::sleep(Duration::from_secs(30)).await;
            self.pool.check_health(&self.mgmt).await;
            self.check_cpu_health().await;

            let mut res = self.reservation.lock().await;
            let Some(session) = res.session.clone() else {
                continue;
            };

            if res.reserved_at.map(|t| t.elapsed() > absolute).unwrap_or(false) {
                warn!(session = %session, timeout_s = absolute.as_secs(), "reservation exceeded absolute timeout, auto-releasing");
                Self::clear_reservation_locked(&self.pool, &mut res);
                continue;
            }

            if res
                .last_critical_activity
                .map(|t| t.elapsed() > idle)
                .unwrap_or(false)
            {
                warn!(session = %session, idle_s = idle.as_secs(), "reservation idle, auto-releasing");
                let gpu_name = res.gpu.clone();
                Self::clear_reservation_locked(&self.pool, &mut res);
                drop(res);
                if let Some(gpu) = gpu_name.and_then(|n| self.pool.get(&n)) {
                    self.schedule_background_load(gpu);
                }
            }
        }
    }

    async fn check_cpu_health(&self) {
        let ok = self
            .mgmt
            .head(format!("{}/", self.cpu_url))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false);
        let was = self.cpu_healthy.swap(ok, Ordering::Relaxed);
        if ok && !was {
            info!("CPU backend recovered");
        } else if !ok && was {
            warn!("CPU backend is unhealthy");
        }
    }

    // ── Introspection ───────────────────────────────────────────────────

    pub async fn health_snapshot(&self) -> serde_json::Value {
        let gpus: Vec<serde_json::Value> = self
            .pool
            .backends
            .iter()
            .map(|b| {
                json!({
                    "name": b.name,
                    "healthy": b.is_healthy(),
                    "loaded_models": b.loaded_model_names(),
                    "active_requests": b.active_request_count(),
                })
            })
            .collect();
        let healthy_gpus = self.pool.healthy_backends().len();
        let status = if healthy_gpus == self.pool.backends.len() && self.cpu_is_healthy() {
            "healthy"
        } else if healthy_gpus > 0 || self.cpu_is_healthy() {
            "degraded"
        } else {
            "unhealthy"
        };
        json!({
            "status": status,
            "gpu_backends": gpus,
            "cpu_backend": {"url": self.cpu_url, "healthy": self.cpu_is_healthy()},
            "orchestrator_reserved": self.is_reserved().await,
        })
    }

    pub async fn status_snapshot(&self) -> serde_json::Value {
        let res = self.reservation.lock().await;
        let gpus: Vec<serde_json::Value> = self
            .pool
            .backends
            .iter()
            .map(|b| {
                metrics::set_gpu_state(&b.name, b.loaded_model_names().len(), b.used_vram_gb());
                let active: Vec<serde_json::Value> = b
                    .active_requests
                    .iter()
                    .map(|r| {
                        json!({
                            "request_id": r.request_id,
                            "model": r.model,
                            "priority": r.priority.as_str(),
                            "state": r.state().as_str(),
                            "age_seconds": r.age_seconds(),
                        })
                    })
                    .collect();
                json!({
                    "name": b.name,
                    "url": b.url,
                    "healthy": b.is_healthy(),
                    "vram_gb": b.vram_gb,
                    "used_vram_gb": b.used_vram_gb(),
                    "loaded_models": b.loaded_model_names(),
                    "reserved_by": b.reserved_by(),
                    "active_requests": active,
                })
            })
            .collect();
        json!({
            "gpu_backends": gpus,
            "cpu_backend": {"url": self.cpu_url, "healthy": self.cpu_is_healthy()},
            "orchestrator": {
                "reserved": res.session.is_some(),
                "session": res.session,
                "gpu": res.gpu,
                "reserved_for_seconds": res.reserved_at.map(|t| t.elapsed().as_secs()),
                "idle_seconds": res.last_critical_activity.map(|t| t.elapsed().as_secs()),
            },
        })
    }
}
