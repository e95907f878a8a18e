//! Orchestrator GPU reservation client (announce/release against the router).

use std::time::Duration;

use serde_json::json;
use tracing::{info, warn};

/// Announces and releases a session-scoped GPU reservation. Release is
/// best-effort and idempotent on the router side.
pub struct RouterSession {
    base_url: String,
    client: reqwest::Client,
    pub session_id: String,
}

impl RouterSession {
    pub fn new(base_url: impl Into<String>, session_id: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(180))
                .build()
                .unwrap_or_default(),
            session_id: session_id.into(),
        }
    }

    /// Reserves a GPU and asks for the model to be resident. Returns whether
    /// the model ended up loaded; a router outage degrades to `false`.
    pub async fn announce(&self, model: &str) -> bool {
        match self
            .client
            .post(format!("{}/router/announce", self.base_url))
            .json(&json!({"session_id": self.session_id, "model": model}))
            .send()
            .await
        {
            Ok(resp) => {
                let value: serde_json::Value = resp.json().await.unwrap_or_default();
                let loaded = value["model_loaded"].as_bool().unwrap_or(false);
                info!(session = %self.session_id, model, loaded, "GPU announced");
                loaded
            }
            Err(e) => {
                warn!(session = %self.session_id, error = %e, "announce failed");
                false
            }
        }
    }

    /// Releases the reservation; failures are logged, never propagated.
    pub async fn release(&self) {
        if let Err(e) = self
            .client
            .post(format!("{}/router/release", self.base_url))
            .json(&json!({"session_id": self.session_id}))
            .send()
            .await
        {
            warn!(session = %self.session_id, error = %e, "release failed");
        } else {
            info!(session = %self.session_id, "GPU released");
        }
    }
}
