//! Axum app: Ollama-compatible surface plus `/router/*` management endpoints.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, head, post};
use axum::Router as AxumRouter;
use serde_json::{json, Value};
use tracing::warn;

use crate::core::{AnnounceRequest, ReleaseRequest, Router};
use crate::metrics;
use crate::proxy::{json_error, proxy_passthrough_get, proxy_passthrough_head};

#[derive(Clone)]
pub struct AppState {
    pub router: Arc<Router>,
}

/// Builds the full HTTP surface.
pub fn router_app(state: AppState) -> AxumRouter {
    AxumRouter::new()
        .route("/api/generate", post(api_passthrough))
        .route("/api/chat", post(api_passthrough))
        .route("/api/embeddings", post(api_passthrough))
        .route("/api/embed", post(api_passthrough))
        .route("/api/show", post(api_show))
        .route("/api/pull", post(api_pull))
        .route("/api/tags", get(api_tags))
        .route("/api/ps", get(api_ps))
        .route("/api/delete", delete(api_delete))
        .route("/", head(root_head).get(root_get))
        .route("/router/health", get(router_health))
        .route("/router/status", get(router_status))
        .route("/router/metrics", get(router_metrics))
        .route("/router/announce", post(router_announce))
        .route("/router/release", post(router_release))
        .with_state(state)
}

fn priority_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-ollama-priority")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

async fn api_passthrough(
    State(state): State<AppState>,
    headers: HeaderMap,
    uri: axum::http::Uri,
    Json(body): Json<Value>,
) -> Response {
    let priority = priority_header(&headers);
    state
        .router
        .route_request(uri.path(), body, priority.as_deref())
        .await
}

/// First successful backend answer wins; tried across healthy GPUs then CPU.
async fn first_success_post(state: &AppState, path: &str, body: &Value) -> Response {
    let client = state.router.mgmt_client();
    let mut urls: Vec<String> = state
        .router
        .pool
        .healthy_backends()
        .iter()
        .map(|b| b.url.clone())
        .collect();
    urls.push(state.router.cpu_url().to_string());

    for url in urls {
        match client
            .post(format!("{url}{path}"))
            .json(body)
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => {
                let status = resp.status();
                let bytes = resp.bytes().await.unwrap_or_default();
                return Response::builder()
                    .status(StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::OK))
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(bytes))
                    .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
            }
            Ok(resp) => {
                warn!(url, status = %resp.status(), path, "backend rejected request");
            }
            Err(e) => {
                warn!(url, error = %e, path, "backend unreachable");
            }
        }
    }
    json_error(
        StatusCode::SERVICE_UNAVAILABLE,
        "no_backend_available",
        "no backend could serve the request",
    )
}

async fn api_show(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    first_success_post(&state, "/api/show", &body).await
}

async fn api_pull(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    first_success_post(&state, "/api/pull", &body).await
}

/// Union of models across all backends, deduplicated by name.
async fn api_tags(State(state): State<AppState>) -> Response {
    let client = state.router.mgmt_client();
    let mut seen = std::collections::HashSet::new();
    let mut models: Vec<Value> = Vec::new();

    let mut urls: Vec<String> = state
        .router
        .pool
        .healthy_backends()
        .iter()
        .map(|b| b.url.clone())
        .collect();
    urls.push(state.router.cpu_url().to_string());

    for url in urls {
        let Ok(resp) = client.get(format!("{url}/api/tags")).send().await else {
            continue;
        };
        let Ok(data) = resp.json::<Value>().await else {
            continue;
        };
        for m in data["models"].as_array().into_iter().flatten() {
            let name = m["name"].as_str().unwrap_or("").to_string();
            if !name.is_empty() && seen.insert(name) {
                models.push(m.clone());
            }
        }
    }
    Json(json!({"models": models})).into_response()
}

/// Running models across all backends; each entry tagged with its backend.
async fn api_ps(State(state): State<AppState>) -> Response {
    let client = state.router.mgmt_client();
    let mut models: Vec<Value> = Vec::new();

    for backend in state.router.pool.healthy_backends() {
        let Ok(resp) = client.get(format!("{}/api/ps", backend.url)).send().await else {
            continue;
        };
        let Ok(data) = resp.json::<Value>().await else {
            continue;
        };
        for m in data["models"].as_array().into_iter().flatten() {
            let mut entry = m.clone();
            if let Some(obj) = entry.as_object_mut() {
                obj.insert("backend".into(), Value::String(backend.name.clone()));
            }
            models.push(entry);
        }
    }
    Json(json!({"models": models})).into_response()
}

/// Delete fans out to every backend; success if any backend accepted.
async fn api_delete(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    let client = state.router.mgmt_client();
    let mut any_ok = false;
    let mut urls: Vec<String> = state
        .router
        .pool
        .healthy_backends()
        .iter()
        .map(|b| b.url.clone())
        .collect();
    urls.push(state.router.cpu_url().to_string());

    for url in urls {
        if let Ok(resp) = client
            .delete(format!("{url}/api/delete"))
            .json(&body)
            .send()
            .await
        {
            any_ok |= resp.status().is_success();
        }
    }
    if any_ok {
        StatusCode::OK.into_response()
    } else {
        json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "no_backend_available",
            "delete failed on all backends",
        )
    }
}

async fn root_head(State(state): State<AppState>) -> Response {
    let target = state
        .router
        .pool
        .healthy_backends()
        .first()
        .map(|b| b.url.clone())
        .unwrap_or_else(|| state.router.cpu_url().to_string());
    proxy_passthrough_head(state.router.mgmt_client(), &target).await
}

async fn root_get(State(state): State<AppState>) -> Response {
    let target = state
        .router
        .pool
        .healthy_backends()
        .first()
        .map(|b| b.url.clone())
        .unwrap_or_else(|| state.router.cpu_url().to_string());
    proxy_passthrough_get(state.router.mgmt_client(), &target, "/").await
}

async fn router_health(State(state): State<AppState>) -> Response {
    Json(state.router.health_snapshot().await).into_response()
}

async fn router_status(State(state): State<AppState>) -> Response {
    Json(state.router.status_snapshot().await).into_response()
}

async fn router_metrics() -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain; version=0.0.4")
        .body(Body::from(metrics::render()))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

async fn router_announce(
    State(state): State<AppState>,
    Json(req): Json<AnnounceRequest>,
) -> Response {
    Json(state.router.announce(req).await).into_response()
}

async fn router_release(
    State(state): State<AppState>,
    Json(req): Json<ReleaseRequest>,
) -> Response {
    Json(state.router.release(req).await).into_response()
}
