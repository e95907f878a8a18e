//! HTTP proxy layer: streaming (ndjson) and non-streaming forwarding to backends.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, info};

use crate::backend::GpuBackend;
use crate::metrics;
use crate::request::{RequestState, TrackedRequest};

/// Removes the request from its backend's active set when the proxy finishes,
/// whichever way it finishes, and records the request duration.
pub struct ActiveRequestGuard {
    backend: Arc<GpuBackend>,
    request: Arc<TrackedRequest>,
}

impl ActiveRequestGuard {
    pub fn register(backend: Arc<GpuBackend>, request: &Arc<TrackedRequest>) -> Self {
        backend
            .active_requests
            .insert(request.request_id.clone(), Arc::clone(request));
        backend.touch();
        Self {
            backend,
            request: Arc::clone(request),
        }
    }
}

impl Drop for ActiveRequestGuard {
    fn drop(&mut self) {
        self.backend.active_requests.remove(&self.request.request_id);
        metrics::set_gpu_active(&self.backend.name, self.backend.active_request_count());
        metrics::REQUEST_DURATION
            .with_label_values(&[&format!("gpu:{}", self.backend.name), &self.request.model])
            .observe(self.request.created_at.elapsed().as_secs_f64());
    }
}

fn ndjson_response(rx: mpsc::Receiver<Result<Vec<u8>, std::io::Error>>) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Proxies a streaming request as newline-delimited JSON.
///
/// The pump task forwards upstream lines one by one, checking the request's
/// cancellation token between lines. On preemption it emits a single terminal
/// `{"error":"preempted"}` line and closes. Upstream HTTP errors become one
/// error line with the status code; the HTTP status to the caller stays 200
/// once streaming has begun.
pub async fn proxy_streaming(
    client: reqwest::Client,
    target_url: String,
    request: Arc<TrackedRequest>,
    guard: Option<ActiveRequestGuard>,
) -> Response {
    let (tx, rx) = mpsc::channel::<Result<Vec<u8>, std::io::Error>>(32);

    tokio::spawn(async move {
        let _guard = guard;
        let outcome = pump_stream(&client, &target_url, &request, &tx).await;
        request.set_state(match outcome {
            Ok(()) if request.cancel.is_cancelled() => RequestState::Preempted,
            Ok(()) => RequestState::Completed,
            Err(()) => RequestState::Failed,
        });
    });

    ndjson_response(rx)
}

async fn pump_stream(
    client: &reqwest::Client,
    target_url: &str,
    request: &TrackedRequest,
    tx: &mpsc::Sender<Result<Vec<u8>, std::io::Error>>,
) -> Result<(), ()> {
    let resp = match client
        .post(format!("{}{}", target_url, request.api_path))
        .json(&request.body)
        .send()
        .await
    {
        Ok(r) => r,
        Err(e) => {
            error!(request = %request.request_id, error = %e, "upstream connect failed");
            let line = error_line(&json!({
                "error": "backend_unavailable",
                "message": e.to_string(),
            }));
            let _ = tx.send(Ok(line)).await;
            return Err(());
        }
    };

    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        error!(request = %request.request_id, status = %status, "upstream error");
        let line = error_line(&json!({
            "error": "upstream_error",
            "status_code": status.as_u16(),
            "message": body.chars().take(500).collect::<String>(),
        }));
        let _ = tx.send(Ok(line)).await;
        return Err(());
    }

    let mut upstream = resp.bytes_stream();
    let mut buf: Vec<u8> = Vec::new();

    loop {
        tokio::select! {
            _ = request.cancel.cancelled() => {
                info!(request = %request.request_id, model = %request.model, "request preempted");
                metrics::inc_preempted(&request.model);
                let line = error_line(&json!({
                    "error": "preempted",
                    "message": "Request preempted by higher priority",
                }));
                let _ = tx.send(Ok(line)).await;
                return Ok(());
            }
            chunk = upstream.next() => {
                match chunk {
                    Some(Ok(bytes)) => {
                        buf.extend_from_slice(&bytes);
                        while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                            let mut line: Vec<u8> = buf.drain(..=pos).collect();
                            // Keep exactly one trailing newline per ndjson line.
                            while line.last() == Some(&b'\n') || line.last() == Some(&b'\r') {
                                line.pop();
                            }
                            if line.is_empty() {
                                continue;
                            }
                            if request.cancel.is_cancelled() {
                                info!(request = %request.request_id, "request preempted mid-line");
                                metrics::inc_preempted(&request.model);
                                let term = error_line(&json!({
                                    "error": "preempted",
                                    "message": "Request preempted by higher priority",
                                }));
                                let _ = tx.send(Ok(term)).await;
                                return Ok(());
                            }
                            line.push(b'\n');
                            if tx.send(Ok(line)).await.is_err() {
                                // Caller went away; nothing left to stream.
                                return Ok(());
                            }
                        }
                    }
                    Some(Err(e)) => {
                        if request.cancel.is_cancelled() {
                            let term = error_line(&json!({"error": "preempted"}));
                            let _ = tx.send(Ok(term)).await;
                            return Ok(());
                        }
                        error!(request = %request.request_id, error = %e, "upstream stream error");
                        let term = error_line(&json!({
                            "error": "upstream_error",
                            "message": e.to_string(),
                        }));
                        let _ = tx.send(Ok(term)).await;
                        return Err(());
                    }
                    None => {
                        if !buf.is_empty() {
                            buf.push(b'\n');
                            let _ = tx.send(Ok(std::mem::take(&mut buf))).await;
                        }
                        return Ok(());
                    }
                }
            }
        }
    }
}

fn error_line(value: &serde_json::Value) -> Vec<u8> {
    let mut line = value.to_string().into_bytes();
    line.push(b'\n');
    line
}

/// Proxies a non-streaming request (embeddings, show, …) transparently,
/// mirroring the backend's status code and content type.
pub async fn proxy_non_streaming(
    client: &reqwest::Client,
    target_url: &str,
    request: &TrackedRequest,
    _guard: Option<ActiveRequestGuard>,
) -> Response {
    match client
        .post(format!("{}{}", target_url, request.api_path))
        .json(&request.body)
        .send()
        .await
    {
        Ok(resp) => {
            let status = resp.status();
            let content_type = resp
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("application/json")
                .to_string();
            let body = resp.bytes().await.unwrap_or_default();
            request.set_state(if status.is_success() {
                RequestState::Completed
            } else {
                RequestState::Failed
            });
            Response::builder()
                .status(StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY))
                .header(header::CONTENT_TYPE, content_type)
                .body(Body::from(body))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        Err(e) => {
            error!(target = target_url, error = %e, "connection failed");
            request.set_state(RequestState::Failed);
            json_error(
                StatusCode::SERVICE_UNAVAILABLE,
                "backend_unavailable",
                &e.to_string(),
            )
        }
    }
}

/// Proxies a GET transparently (tags, version).
pub async fn proxy_passthrough_get(client: &reqwest::Client, target_url: &str, path: &str) -> Response {
    match client
        .get(format!("{}{}", target_url, path))
        .timeout(Duration::from_secs(10))
        .send()
        .await
    {
        Ok(resp) => {
            let status = resp.status();
            let body = resp.bytes().await.unwrap_or_default();
            Response::builder()
                .status(StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        Err(e) => json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "backend_unavailable",
            &e.to_string(),
        ),
    }
}

/// Proxies a HEAD transparently (liveness).
pub async fn proxy_passthrough_head(client: &reqwest::Client, target_url: &str) -> Response {
    let status = client
        .head(format!("{}/", target_url))
        .timeout(Duration::from_secs(5))
        .send()
        .await
        .map(|r| r.status().as_u16())
        .unwrap_or(503);
    StatusCode::from_u16(status)
        .unwrap_or(StatusCode::SERVICE_UNAVAILABLE)
        .into_response()
}

/// JSON error body with the given status, e.g. `503 {"error": "no_backend_available"}`.
pub fn json_error(status: StatusCode, error: &str, message: &str) -> Response {
    let body = json!({"error": error, "message": message}).to_string();
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_line_is_terminated() {
        let line = error_line(&json!({"error": "preempted"}));
        assert!(line.ends_with(b"\n"));
        let parsed: serde_json::Value =
            serde_json::from_slice(&line[..line.len() - 1]).unwrap();
        assert_eq!(parsed["error"], "preempted");
    }

    #[test]
    fn json_error_shape() {
        let resp = json_error(StatusCode::SERVICE_UNAVAILABLE, "no_backend_available", "all down");
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
