//! Affair lifecycle: create, park, resume, resolve.
//!
//! Parking summarizes via LLM and queues a CRITICAL KB write; summarization
//! failure is non-blocking (the affair parks without an updated summary).
//! Durability is reached by the next successful flush.

use std::collections::HashMap;

use chrono::Utc;
use serde_json::Value;
use tracing::{info, warn};

use crate::llm::{CallOptions, LlmClient, LlmPriority, ModelTier};
use crate::message::ChatMessage;
use crate::tools::lenient_json;

use super::{
    Affair, AffairMessage, AffairStatus, KbClient, LocalQuickMemory, PendingWrite, WritePriority,
};

/// Creates a new ACTIVE affair and stores it in LQM.
pub fn create_affair(
    client_id: &str,
    project_id: Option<&str>,
    title: &str,
    initial_context: &str,
    lqm: &LocalQuickMemory,
) -> Affair {
    let now = Utc::now().to_rfc3339();
    let affair = Affair {
        id: uuid::Uuid::new_v4().to_string(),
        title: title.to_string(),
        summary: String::new(),
        status: AffairStatus::Active,
        topics: vec![],
        key_facts: HashMap::new(),
        pending_actions: vec![],
        messages: vec![AffairMessage {
            role: "user".into(),
            content: initial_context.chars().take(2000).collect(),
            timestamp: now.clone(),
        }],
        client_id: client_id.to_string(),
        project_id: project_id.map(str::to_string),
        created_at: now.clone(),
        updated_at: now,
    };
    lqm.store_affair(affair.clone());
    info!(title = %affair.title, id = %affair.id, "created affair");
    affair
}

/// Parks the affair: LLM summary, status update in LQM, CRITICAL write queued.
/// When this returns, the summary update has at least been enqueued.
pub async fn park_affair(affair: &mut Affair, llm: &dyn LlmClient, lqm: &LocalQuickMemory) {
    match summarize_for_parking(affair, llm).await {
        Ok(summary) => apply_summary(affair, &summary),
        Err(e) => warn!(error = %e, "affair summarization failed, parking without update"),
    }

    affair.status = AffairStatus::Parked;
    affair.touch();
    lqm.store_affair(affair.clone());
    lqm.buffer_write(affair_write(affair, WritePriority::Critical));
    info!(title = %affair.title, id = %affair.id, "parked affair");
}

/// Resumes a parked affair: LQM fast path, KB cold path. Returns the affair
/// re-activated, or `None` when it cannot be found.
pub async fn resume_affair(
    affair_id: &str,
    client_id: &str,
    lqm: &LocalQuickMemory,
    kb: &KbClient,
) -> Option<Affair> {
    if let Some(mut affair) = lqm.get_affair(client_id, affair_id) {
        affair.status = AffairStatus::Active;
        affair.touch();
        lqm.store_affair(affair.clone());
        info!(title = %affair.title, "resumed affair from LQM");
        return Some(affair);
    }

    match kb.load_affair(affair_id, client_id).await {
        Ok(Some(mut affair)) => {
            affair.status = AffairStatus::Active;
            affair.touch();
            lqm.store_affair(affair.clone());
            info!(title = %affair.title, "resumed affair from KB");
            Some(affair)
        }
        Ok(None) => {
            warn!(affair_id, "affair not found");
            None
        }
        Err(e) => {
            warn!(affair_id, error = %e, "failed to load affair from KB");
            None
        }
    }
}

/// Marks the affair RESOLVED and queues a HIGH-priority KB write.
pub fn resolve_affair(affair_id: &str, client_id: &str, lqm: &LocalQuickMemory) -> bool {
    let Some(mut affair) = lqm.get_affair(client_id, affair_id) else {
        warn!(affair_id, "cannot resolve, affair not found");
        return false;
    };
    affair.status = AffairStatus::Resolved;
    affair.touch();
    lqm.store_affair(affair.clone());
    lqm.buffer_write(affair_write(&affair, WritePriority::High));
    info!(title = %affair.title, id = %affair.id, "resolved affair");
    true
}

/// Builds the KB write for an affair document.
pub fn affair_write(affair: &Affair, priority: WritePriority) -> PendingWrite {
    PendingWrite {
        source_urn: format!("affair:{}", affair.id),
        content: affair.to_kb_document(),
        kind: "affair".into(),
        metadata: HashMap::from([
            ("affair_id".into(), affair.id.clone()),
            ("title".into(), affair.title.clone()),
            ("status".into(), affair.status.as_str().to_string()),
            ("topics".into(), affair.topics.join(",")),
            ("client_id".into(), affair.client_id.clone()),
            (
                "project_id".into(),
                affair.project_id.clone().unwrap_or_default(),
            ),
            ("created_at".into(), affair.created_at.clone()),
            ("updated_at".into(), affair.updated_at.clone()),
        ]),
        priority,
        created_at: affair.updated_at.clone(),
    }
}

async fn summarize_for_parking(
    affair: &Affair,
    llm: &dyn LlmClient,
) -> Result<Value, crate::error::EngineError> {
    let messages_text: Vec<String> = affair
        .messages
        .iter()
        .rev()
        .take(10)
        .rev()
        .map(|m| {
            format!(
                "[{}]: {}",
                m.role,
                m.content.chars().take(500).collect::<String>()
            )
        })
        .collect();

    let prompt = format!(
        "Summarize this affair so it can be resumed later.\n\n\
         AFFAIR: {}\n\
         KNOWN FACTS: {}\n\
         RECENT MESSAGES:\n{}\n\n\
         Respond with JSON only:\n\
         {{\n\
           \"summary\": \"2-3 sentences on the current state\",\n\
           \"key_facts\": {{\"key\": \"value\"}},\n\
           \"pending_actions\": [\"action 1\"],\n\
           \"topics\": [\"topic1\"]\n\
         }}",
        affair.title,
        serde_json::to_string(&affair.key_facts).unwrap_or_else(|_| "{}".into()),
        messages_text.join("\n"),
    );

    let response = llm
        .chat(
            &[
                ChatMessage::system(
                    "You are a summarization assistant. Respond with valid JSON only.",
                ),
                ChatMessage::user(prompt),
            ],
            &CallOptions::new(ModelTier::LocalFast, LlmPriority::Normal),
        )
        .await?;

    Ok(lenient_json(&response.content).unwrap_or_else(|| {
        serde_json::json!({
            "summary": response.content.chars().take(500).collect::<String>()
        })
    }))
}

fn apply_summary(affair: &mut Affair, summary: &Value) {
    if let Some(s) = summary["summary"].as_str() {
        affair.summary = s.to_string();
    }
    if let Some(facts) = summary["key_facts"].as_object() {
        for (k, v) in facts {
            if let Some(v) = v.as_str() {
                affair.key_facts.insert(k.clone(), v.to_string());
            }
        }
    }
    if let Some(actions) = summary["pending_actions"].as_array() {
        affair.pending_actions = actions
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect();
    }
    if let Some(topics) = summary["topics"].as_array() {
        for t in topics.iter().filter_map(Value::as_str) {
            if !affair.topics.iter().any(|existing| existing == t) {
                affair.topics.push(t.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlm;
    use crate::settings::MemorySettings;

    fn lqm() -> LocalQuickMemory {
        LocalQuickMemory::new(&MemorySettings {
            lqm_max_warm_entries: 16,
            lqm_warm_ttl_seconds: 3600,
            lqm_write_buffer_max: 32,
            context_switch_confidence_threshold: 0.7,
            use_procedural_memory: true,
        })
    }

    #[tokio::test]
    async fn park_queues_critical_write_and_updates_summary() {
        let lqm = lqm();
        let mut affair = create_affair("c1", None, "Onboarding", "initial context", &lqm);
        let llm = MockLlm::with_replies(vec![MockLlm::text(
            r#"{"summary": "Tenant set up", "key_facts": {"tenant": "t-42"}, "pending_actions": ["verify DNS"], "topics": ["infra"]}"#,
        )]);

        park_affair(&mut affair, &llm, &lqm).await;

        assert_eq!(affair.status, AffairStatus::Parked);
        assert_eq!(affair.summary, "Tenant set up");
        assert_eq!(affair.key_facts.get("tenant").unwrap(), "t-42");
        assert_eq!(affair.pending_actions, vec!["verify DNS"]);

        let writes = lqm.pending_writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].priority, WritePriority::Critical);
        assert_eq!(writes[0].source_urn, format!("affair:{}", affair.id));
    }

    #[tokio::test]
    async fn park_survives_llm_failure() {
        let lqm = lqm();
        let mut affair = create_affair("c1", None, "Onboarding", "ctx", &lqm);
        let llm = MockLlm::with_replies(vec![]); // exhausted -> error

        park_affair(&mut affair, &llm, &lqm).await;
        assert_eq!(affair.status, AffairStatus::Parked);
        assert_eq!(lqm.pending_writes().len(), 1, "write still enqueued");
    }

    #[tokio::test]
    async fn park_then_resume_round_trips_key_facts() {
        let lqm = lqm();
        let kb = KbClient::new("http://kb.invalid:1");
        let mut affair = create_affair("c1", None, "Onboarding", "ctx", &lqm);
        affair.key_facts.insert("tenant".into(), "t-42".into());
        let llm = MockLlm::with_replies(vec![MockLlm::text("{}")]);
        park_affair(&mut affair, &llm, &lqm).await;

        let resumed = resume_affair(&affair.id, "c1", &lqm, &kb).await.unwrap();
        assert_eq!(resumed.status, AffairStatus::Active);
        assert_eq!(resumed.key_facts.get("tenant").unwrap(), "t-42");
    }

    #[test]
    fn resolve_queues_high_priority_write() {
        let lqm = lqm();
        let affair = create_affair("c1", None, "Done topic", "ctx", &lqm);
        assert!(resolve_affair(&affair.id, "c1", &lqm));
        let writes = lqm.pending_writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].priority, WritePriority::High);
        assert!(!resolve_affair("missing", "c1", &lqm));
    }
}
