//! Memory Agent: per-orchestration facade over LQM and the knowledge base.
//!
//! One instance per orchestration run; the LQM underneath is process-global.
//! A KB outage never aborts the run: writes stay buffered, searches degrade to
//! LQM-only.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::llm::LlmClient;

use super::{
    compose_affair_context, create_affair, detect_context_switch, park_affair, resume_affair,
    AffairStatus, ContextSwitchDecision, ContextSwitchResult, KbClient, LocalQuickMemory,
    PendingWrite, SessionContext, WritePriority,
};

/// How a flush pass went. `attempted` counts every buffered write that got a
/// POST; failures stay buffered for the next flush.
#[derive(Clone, Debug, Default)]
pub struct FlushReport {
    pub attempted: usize,
    pub synced: usize,
    pub failed: usize,
}

pub struct MemoryAgent {
    pub client_id: String,
    pub project_id: Option<String>,
    lqm: &'static LocalQuickMemory,
    kb: KbClient,
    llm: Arc<dyn LlmClient>,
    pub session: SessionContext,
    confidence_threshold: f64,
    use_procedural_memory: bool,
}

impl MemoryAgent {
    pub fn new(
        client_id: impl Into<String>,
        project_id: Option<String>,
        lqm: &'static LocalQuickMemory,
        kb: KbClient,
        llm: Arc<dyn LlmClient>,
        settings: &crate::settings::MemorySettings,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            project_id,
            lqm,
            kb,
            llm,
            session: SessionContext::default(),
            confidence_threshold: settings.context_switch_confidence_threshold,
            use_procedural_memory: settings.use_procedural_memory,
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Loads the session context: LQM hot path, KB cold path.
    pub async fn load_session(&mut self) -> &SessionContext {
        let active = self.lqm.get_active_affair(&self.client_id);
        let parked = self.lqm.get_parked_affairs(&self.client_id);

        if active.is_some() || !parked.is_empty() {
            info!(
                client = %self.client_id,
                active = active.as_ref().map(|a| a.title.as_str()).unwrap_or("none"),
                parked = parked.len(),
                "session loaded from LQM"
            );
            self.session.active_affair = active;
            self.session.parked_affairs = parked;
            return &self.session;
        }

        match self
            .kb
            .load_affairs(&self.client_id, self.project_id.as_deref())
            .await
        {
            Ok(affairs) => {
                let count = affairs.len();
                for affair in affairs {
                    self.lqm.store_affair(affair.clone());
                    match affair.status {
                        AffairStatus::Active => self.session.active_affair = Some(affair),
                        AffairStatus::Parked => self.session.parked_affairs.push(affair),
                        AffairStatus::Resolved => {}
                    }
                }
                if count > 0 {
                    info!(client = %self.client_id, count, "session loaded from KB");
                }
            }
            Err(e) => warn!(client = %self.client_id, error = %e, "KB affair load failed"),
        }
        &self.session
    }

    /// Classifies the user message for a topic change.
    pub async fn detect_context_switch(&self, user_message: &str) -> ContextSwitchResult {
        detect_context_switch(
            user_message,
            &self.session,
            self.llm.as_ref(),
            self.confidence_threshold,
        )
        .await
    }

    /// Executes a context switch: parks the current affair, activates the
    /// target. Returns a brief status message.
    pub async fn switch_context(&mut self, result: &ContextSwitchResult) -> String {
        let mut status_parts: Vec<String> = Vec::new();

        if let Some(mut active) = self.session.active_affair.take() {
            park_affair(&mut active, self.llm.as_ref(), self.lqm).await;
            status_parts.push(format!("Parked: {}", active.title));
            self.session.parked_affairs.push(active);
        }

        match &result.decision {
            ContextSwitchDecision::Switch { target_affair_id } => {
                match resume_affair(target_affair_id, &self.client_id, self.lqm, &self.kb).await {
                    Some(affair) => {
                        self.session
                            .parked_affairs
                            .retain(|a| a.id != affair.id);
                        status_parts.push(format!("Resumed: {}", affair.title));
                        self.session.active_affair = Some(affair);
                    }
                    None => {
                        status_parts.push(format!("Target affair not found: {target_affair_id}"))
                    }
                }
            }
            ContextSwitchDecision::NewAffair { title } => {
                let affair = create_affair(
                    &self.client_id,
                    self.project_id.as_deref(),
                    title,
                    &result.reasoning,
                    self.lqm,
                );
                status_parts.push(format!("Created: {}", affair.title));
                self.session.active_affair = Some(affair);
            }
            ContextSwitchDecision::Stay => {}
        }

        self.session.last_context_switch_at = Some(Utc::now().to_rfc3339());
        status_parts.join("; ")
    }

    // ── Search & store ──────────────────────────────────────────────────

    /// Merged search: write-buffer hits first, then cached results, then KB.
    /// `scope`: `current` (buffer only), `kb_only`, or `all`.
    pub async fn search(&mut self, query: &str, scope: &str) -> Vec<Value> {
        let mut results: Vec<Value> = Vec::new();

        if matches!(scope, "current" | "all") {
            for hit in self.lqm.search_write_buffer(query).into_iter().take(3) {
                results.push(json!({
                    "content": hit.content,
                    "sourceUrn": hit.source_urn,
                    "pending": true,
                }));
            }
        }

        if matches!(scope, "kb_only" | "all") {
            if let Some(cached) = self.lqm.get_cached_search(query) {
                results.extend(cached);
                return results;
            }
            match self.kb.retrieve(query, &self.client_id, None, 5).await {
                Ok(chunks) => {
                    self.lqm.cache_search(query, chunks.clone());
                    results.extend(chunks);
                }
                Err(e) => warn!(query, error = %e, "KB search failed, degrading to local"),
            }
        }
        results
    }

    /// Stores a fact: active affair key_facts updated in LQM, a PendingWrite
    /// buffered, related search cache invalidated.
    pub async fn store(
        &mut self,
        subject: &str,
        content: &str,
        category: &str,
        priority: Option<WritePriority>,
    ) -> String {
        if let Some(affair) = &mut self.session.active_affair {
            affair
                .key_facts
                .insert(subject.to_string(), content.chars().take(500).collect());
            affair.touch();
            self.lqm.store_affair(affair.clone());
        }

        if category == "procedure" && !self.use_procedural_memory {
            return format!("Noted for this session only: '{subject}' (procedural memory is off)");
        }

        let kind = match category {
            "decision" | "preference" => "user_knowledge_preference",
            "order" | "deadline" => "user_knowledge_general",
            "contact" => "user_knowledge_personal",
            "procedure" => "user_knowledge_domain",
            _ => "user_knowledge_fact",
        };

        let subject_key: String = subject.chars().take(50).collect();
        self.lqm.buffer_write(PendingWrite {
            source_urn: format!("memory:{}:{}", self.client_id, subject_key),
            content: format!("# {subject}\n\n{content}"),
            kind: kind.into(),
            metadata: HashMap::from([
                ("category".into(), category.to_string()),
                ("subject".into(), subject.to_string()),
                ("client_id".into(), self.client_id.clone()),
                (
                    "project_id".into(),
                    self.project_id.clone().unwrap_or_default(),
                ),
            ]),
            priority: priority.unwrap_or(WritePriority::Normal),
            created_at: Utc::now().to_rfc3339(),
        });

        self.lqm.invalidate_search(subject);
        format!("Stored: '{subject}' ({category})")
    }

    /// Ad-hoc lookup without switching the active context: parked affairs
    /// first, then KB.
    pub async fn handle_ad_hoc(&mut self, query: &str) -> String {
        let needle = query.to_lowercase();
        let mut hits: Vec<String> = Vec::new();
        for affair in &self.session.parked_affairs {
            if affair.searchable_text().to_lowercase().contains(&needle) {
                let facts: Vec<String> = affair
                    .key_facts
                    .iter()
                    .map(|(k, v)| format!("{k}: {v}"))
                    .collect();
                hits.push(format!(
                    "[Affair: {}]\n{}\nFacts: {}",
                    affair.title,
                    affair.summary,
                    facts.join(", ")
                ));
            }
        }
        if !hits.is_empty() {
            hits.truncate(3);
            return hits.join("\n\n---\n\n");
        }

        let kb_hits = self.search(query, "kb_only").await;
        if kb_hits.is_empty() {
            return format!("Nothing found for: {query}");
        }
        kb_hits
            .iter()
            .take(3)
            .map(|r| {
                r["content"]
                    .as_str()
                    .unwrap_or("")
                    .chars()
                    .take(500)
                    .collect::<String>()
            })
            .collect::<Vec<_>>()
            .join("\n\n---\n\n")
    }

    /// Affairs overview for the `list_affairs` tool.
    pub fn render_affairs(&self) -> String {
        let mut out = String::new();
        match &self.session.active_affair {
            Some(a) => out.push_str(&format!("Active: {} — {}\n", a.title, a.summary)),
            None => out.push_str("Active: (none)\n"),
        }
        if self.session.parked_affairs.is_empty() {
            out.push_str("Parked: (none)");
        } else {
            out.push_str("Parked:\n");
            for a in &self.session.parked_affairs {
                out.push_str(&format!("- [{}] {} — {}\n", a.id, a.title, a.summary));
            }
        }
        out
    }

    /// LLM-prompt-ready context block, token-budgeted.
    pub fn compose_context(&self, max_tokens: usize) -> String {
        compose_affair_context(&self.session, max_tokens)
    }

    // ── Flush ───────────────────────────────────────────────────────────

    /// End of orchestration: refresh the active affair in LQM and drain the
    /// write buffer to the KB. Failures stay buffered (at-least-once).
    pub async fn flush_session(&mut self) -> FlushReport {
        if let Some(affair) = &mut self.session.active_affair {
            affair.touch();
            self.lqm.store_affair(affair.clone());
        }

        let mut report = FlushReport::default();
        for write in self.lqm.pending_writes() {
            report.attempted += 1;
            match self.kb.ingest(&write, &self.client_id).await {
                Ok(()) => {
                    self.lqm.remove_synced(&write.key());
                    report.synced += 1;
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(urn = %write.source_urn, error = %e, "KB write failed, keeping buffered");
                }
            }
        }

        let stats = self.lqm.stats();
        info!(
            attempted = report.attempted,
            synced = report.synced,
            failed = report.failed,
            buffered = stats.buffer_writes,
            affairs = stats.affairs_count,
            "memory session flushed"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlm;
    use crate::settings::MemorySettings;
    use once_cell::sync::Lazy;

    fn mem_settings() -> MemorySettings {
        MemorySettings {
            lqm_max_warm_entries: 64,
            lqm_warm_ttl_seconds: 3600,
            lqm_write_buffer_max: 64,
            context_switch_confidence_threshold: 0.7,
            use_procedural_memory: true,
        }
    }

    static TEST_LQM: Lazy<LocalQuickMemory> = Lazy::new(|| LocalQuickMemory::new(&mem_settings()));

    fn agent(client: &str) -> MemoryAgent {
        MemoryAgent::new(
            client,
            None,
            &TEST_LQM,
            KbClient::new("http://kb.invalid:1"),
            Arc::new(MockLlm::with_replies(vec![MockLlm::text("{}")])),
            &mem_settings(),
        )
    }

    #[tokio::test]
    async fn procedural_memory_off_keeps_entry_session_local() {
        let mut agent = agent("proc-client");
        let mut settings = mem_settings();
        settings.use_procedural_memory = false;
        let mut agent_no_proc = MemoryAgent::new(
            "proc-client-off",
            None,
            &TEST_LQM,
            KbClient::new("http://kb.invalid:1"),
            Arc::new(MockLlm::default()),
            &settings,
        );

        let on = agent.store("deploy steps", "run the pipeline", "procedure", None).await;
        assert!(on.starts_with("Stored:"));

        let off = agent_no_proc
            .store("deploy steps", "run the pipeline", "procedure", None)
            .await;
        assert!(off.contains("session only"));
        assert!(
            !TEST_LQM
                .pending_writes()
                .iter()
                .any(|w| w.source_urn.contains("proc-client-off")),
            "no write buffered when procedural memory is off"
        );
    }

    #[tokio::test]
    async fn read_your_writes_through_the_buffer() {
        let mut agent = agent("ryw-client");
        agent
            .store("BMS", "Brokerage Management System", "fact", None)
            .await;

        let results = agent.search("BMS", "all").await;
        assert!(
            results.iter().any(|r| r["content"]
                .as_str()
                .unwrap_or("")
                .contains("Brokerage Management System")),
            "buffered write is visible before KB flush"
        );
    }

    #[tokio::test]
    async fn store_updates_active_affair_facts() {
        let mut agent = agent("facts-client");
        agent.session.active_affair = Some(create_affair(
            "facts-client",
            None,
            "Topic",
            "ctx",
            &TEST_LQM,
        ));
        agent.store("deadline", "Friday", "deadline", None).await;
        let affair = agent.session.active_affair.as_ref().unwrap();
        assert_eq!(affair.key_facts.get("deadline").unwrap(), "Friday");
    }

    #[tokio::test]
    async fn flush_keeps_failed_writes_buffered() {
        let mut agent = agent("flush-client");
        agent.store("k", "v", "fact", None).await;
        // kb.invalid is unreachable: everything fails and stays buffered.
        let report = agent.flush_session().await;
        assert!(report.attempted >= 1);
        assert_eq!(report.synced, 0);
        assert!(TEST_LQM
            .pending_writes()
            .iter()
            .any(|w| w.source_urn.contains("flush-client")));
    }

    #[tokio::test]
    async fn switch_context_parks_current_and_creates_new() {
        let mut agent = agent("switch-client");
        agent.session.active_affair = Some(create_affair(
            "switch-client",
            None,
            "Old topic",
            "ctx",
            &TEST_LQM,
        ));
        let result = ContextSwitchResult {
            decision: ContextSwitchDecision::NewAffair {
                title: "New topic".into(),
            },
            confidence: 0.9,
            reasoning: "user changed subject".into(),
        };
        let status = agent.switch_context(&result).await;
        assert!(status.contains("Parked: Old topic"));
        assert!(status.contains("Created: New topic"));
        assert_eq!(
            agent.session.active_affair.as_ref().unwrap().title,
            "New topic"
        );
        assert!(agent
            .session
            .parked_affairs
            .iter()
            .any(|a| a.title == "Old topic"));
    }

    #[tokio::test]
    async fn ad_hoc_hits_parked_affairs_first() {
        let mut agent = agent("adhoc-client");
        let mut parked = create_affair("adhoc-client", None, "Billing", "ctx", &TEST_LQM);
        parked.status = AffairStatus::Parked;
        parked.summary = "Invoice pending".into();
        agent.session.parked_affairs.push(parked);

        let answer = agent.handle_ad_hoc("billing").await;
        assert!(answer.contains("Invoice pending"));
    }
}
