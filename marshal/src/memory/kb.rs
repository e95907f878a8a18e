//! Knowledge-base HTTP client.
//!
//! All reads carry `X-Ollama-Priority: 1` so KB-side embedding work never
//! contends with foreground inference. Writes pick their endpoint by priority:
//! CRITICAL goes to `/ingest-immediate`, falling back to `/ingest` when the
//! immediate endpoint is not deployed (404).

use std::time::Duration;

use serde_json::{json, Value};
use tracing::debug;

use crate::error::EngineError;

use super::{Affair, AffairStatus, PendingWrite, WritePriority};

pub struct KbClient {
    base_url: String,
    client: reqwest::Client,
}

impl KbClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
        }
    }

    /// Semantic retrieval. Returns raw chunk objects.
    pub async fn retrieve(
        &self,
        query: &str,
        client_id: &str,
        kinds: Option<&[&str]>,
        max_results: u32,
    ) -> Result<Vec<Value>, EngineError> {
        let mut body = json!({
            "query": query,
            "clientId": client_id,
            "maxResults": max_results,
        });
        if let Some(kinds) = kinds {
            body["kinds"] = json!(kinds);
        }
        let resp = self
            .client
            .post(format!("{}/api/v1/retrieve", self.base_url))
            .header("X-Ollama-Priority", "1")
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::KbUnavailable(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(EngineError::KbUnavailable(format!(
                "retrieve status {}",
                resp.status()
            )));
        }
        let value: Value = resp
            .json()
            .await
            .map_err(|e| EngineError::KbUnavailable(e.to_string()))?;
        Ok(value["chunks"].as_array().cloned().unwrap_or_default())
    }

    /// Writes one buffered entry through to the KB. Critical writes try the
    /// immediate-ingest endpoint first.
    pub async fn ingest(&self, write: &PendingWrite, client_id: &str) -> Result<(), EngineError> {
        let body = json!({
            "sourceUrn": write.source_urn,
            "clientId": write.metadata.get("client_id").map(String::as_str).unwrap_or(client_id),
            "content": write.content,
            "kind": write.kind,
            "metadata": write.metadata,
        });

        let endpoint = if write.priority == WritePriority::Critical {
            format!("{}/api/v1/ingest-immediate", self.base_url)
        } else {
            format!("{}/api/v1/ingest", self.base_url)
        };

        let resp = self
            .client
            .post(&endpoint)
            .header("X-Ollama-Priority", write.priority.header_value())
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::KbUnavailable(e.to_string()))?;

        let resp = if resp.status().as_u16() == 404 && write.priority == WritePriority::Critical {
            debug!(urn = %write.source_urn, "immediate ingest not deployed, falling back");
            self.client
                .post(format!("{}/api/v1/ingest", self.base_url))
                .header("X-Ollama-Priority", "1")
                .json(&body)
                .send()
                .await
                .map_err(|e| EngineError::KbUnavailable(e.to_string()))?
        } else {
            resp
        };

        match resp.status().as_u16() {
            200 | 201 | 202 => Ok(()),
            status => {
                let text = resp.text().await.unwrap_or_default();
                Err(EngineError::KbUnavailable(format!(
                    "ingest status {status}: {}",
                    text.chars().take(200).collect::<String>()
                )))
            }
        }
    }

    /// Cold-start affair load: the dedicated endpoint when deployed, else a
    /// semantic search restricted to `kind=affair`.
    pub async fn load_affairs(
        &self,
        client_id: &str,
        project_id: Option<&str>,
    ) -> Result<Vec<Affair>, EngineError> {
        match self.load_affairs_via_endpoint(client_id, project_id).await {
            Ok(Some(affairs)) => return Ok(affairs),
            Ok(None) => {}
            Err(e) => debug!(error = %e, "dedicated affairs endpoint unavailable"),
        }
        self.load_affairs_via_search(client_id).await
    }

    async fn load_affairs_via_endpoint(
        &self,
        client_id: &str,
        project_id: Option<&str>,
    ) -> Result<Option<Vec<Affair>>, EngineError> {
        let mut req = self
            .client
            .get(format!("{}/api/v1/affairs", self.base_url))
            .query(&[("client_id", client_id), ("status", "ACTIVE,PARKED")]);
        if let Some(pid) = project_id {
            req = req.query(&[("project_id", pid)]);
        }
        let resp = req
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| EngineError::KbUnavailable(e.to_string()))?;
        if resp.status().as_u16() == 404 {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Ok(None);
        }
        let value: Value = resp
            .json()
            .await
            .map_err(|e| EngineError::KbUnavailable(e.to_string()))?;
        let affairs = value["affairs"]
            .as_array()
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter_map(|a| serde_json::from_value(a).ok())
            .collect();
        Ok(Some(affairs))
    }

    async fn load_affairs_via_search(&self, client_id: &str) -> Result<Vec<Affair>, EngineError> {
        let chunks = self
            .retrieve("active parked affairs", client_id, Some(&["affair"]), 20)
            .await?;
        let mut seen = std::collections::HashSet::new();
        let mut affairs = Vec::new();
        for chunk in chunks {
            if let Some(affair) = chunk_to_affair(&chunk, client_id) {
                if seen.insert(affair.id.clone()) {
                    affairs.push(affair);
                }
            }
        }
        Ok(affairs)
    }

    /// Loads a single affair by its source URN.
    pub async fn load_affair(
        &self,
        affair_id: &str,
        client_id: &str,
    ) -> Result<Option<Affair>, EngineError> {
        let chunks = self
            .retrieve(&format!("affair:{affair_id}"), client_id, Some(&["affair"]), 1)
            .await?;
        Ok(chunks.first().and_then(|c| chunk_to_affair(c, client_id)))
    }
}

/// Converts a KB chunk back into an affair; malformed chunks are skipped.
fn chunk_to_affair(chunk: &Value, client_id: &str) -> Option<Affair> {
    let metadata = chunk.get("metadata")?.as_object()?;
    let get = |key: &str| metadata.get(key).and_then(Value::as_str).unwrap_or("");

    let status = match get("status").to_lowercase().as_str() {
        "active" => AffairStatus::Active,
        "resolved" => AffairStatus::Resolved,
        _ => AffairStatus::Parked,
    };
    let topics: Vec<String> = get("topics")
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect();

    let affair_id = metadata
        .get("affair_id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    Some(Affair {
        id: affair_id,
        title: if get("title").is_empty() {
            "Unknown".to_string()
        } else {
            get("title").to_string()
        },
        summary: chunk["content"]
            .as_str()
            .unwrap_or("")
            .chars()
            .take(1000)
            .collect(),
        status,
        topics,
        key_facts: Default::default(),
        pending_actions: vec![],
        messages: vec![],
        client_id: client_id.to_string(),
        project_id: metadata
            .get("project_id")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string),
        created_at: get("created_at").to_string(),
        updated_at: get("updated_at").to_string(),
    })
}
