//! Prometheus metrics for the router: routing counters, GPU state gauges.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_gauge_vec,
    register_histogram_vec, Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramVec,
    TextEncoder,
};

pub static REQUESTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "router_requests_total",
        "Total requests routed",
        &["target", "model", "priority"]
    )
    .expect("register router_requests_total")
});

pub static REQUESTS_PREEMPTED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "router_preempted_total",
        "Requests preempted by higher priority",
        &["model"]
    )
    .expect("register router_preempted_total")
});

pub static REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "router_request_duration_seconds",
        "Request duration",
        &["target", "model"],
        vec![0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0]
    )
    .expect("register router_request_duration_seconds")
});

pub static GPU_LOADED_MODELS: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "router_gpu_loaded_models",
        "Number of models loaded in GPU VRAM",
        &["gpu"]
    )
    .expect("register router_gpu_loaded_models")
});

pub static GPU_VRAM_USED: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "router_gpu_vram_used_gb",
        "GPU VRAM used (GiB)",
        &["gpu"]
    )
    .expect("register router_gpu_vram_used_gb")
});

pub static GPU_ACTIVE_REQUESTS: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "router_gpu_active_requests",
        "Active requests on GPU",
        &["gpu"]
    )
    .expect("register router_gpu_active_requests")
});

pub static ORCHESTRATOR_RESERVED: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "router_orchestrator_reserved",
        "1 if the orchestrator holds a GPU reservation"
    )
    .expect("register router_orchestrator_reserved")
});

pub static MODEL_SWAPS_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!("router_model_swaps_total", "Total GPU model swaps")
        .expect("register router_model_swaps_total")
});

pub static CPU_FALLBACK_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "router_cpu_fallback_total",
        "Requests that fell back to CPU",
        &["model"]
    )
    .expect("register router_cpu_fallback_total")
});

pub fn inc_routed(target: &str, model: &str, priority: &str) {
    REQUESTS_TOTAL
        .with_label_values(&[target, model, priority])
        .inc();
}

pub fn inc_preempted(model: &str) {
    REQUESTS_PREEMPTED.with_label_values(&[model]).inc();
}

pub fn inc_cpu_fallback(model: &str) {
    CPU_FALLBACK_TOTAL.with_label_values(&[model]).inc();
}

pub fn set_gpu_active(gpu: &str, count: usize) {
    GPU_ACTIVE_REQUESTS
        .with_label_values(&[gpu])
        .set(count as f64);
}

pub fn set_gpu_state(gpu: &str, loaded: usize, vram_used_gb: f64) {
    GPU_LOADED_MODELS.with_label_values(&[gpu]).set(loaded as f64);
    GPU_VRAM_USED.with_label_values(&[gpu]).set(vram_used_gb);
}

pub fn set_reserved(reserved: bool) {
    ORCHESTRATOR_RESERVED.set(if reserved { 1.0 } else { 0.0 });
}

/// Renders all registered metrics in Prometheus text exposition format.
pub fn render() -> String {
    let metric_families = prometheus::gather();
    let mut out = Vec::new();
    let encoder = TextEncoder::new();
    if encoder.encode(&metric_families, &mut out).is_err() {
        return String::new();
    }
    String::from_utf8(out).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_render_in_text_format() {
        inc_routed("gpu:g1", "qwen2.5:7b", "normal");
        inc_preempted("qwen2.5:7b");
        set_reserved(true);
        let text = render();
        assert!(text.contains("router_requests_total"));
        assert!(text.contains("router_preempted_total"));
        assert!(text.contains("router_orchestrator_reserved"));
    }
}
