//! Two-tier memory substrate: Local Quick Memory plus the Memory Agent facade.
//!
//! [`LocalQuickMemory`] is the process-global hot side (affair map, search
//! cache, write buffer); durability lives in the external knowledge base,
//! reached through [`KbClient`] with at-least-once write-through.

mod affairs;
mod agent;
mod composer;
mod context_switch;
mod kb;
mod lqm;

pub use affairs::{create_affair, park_affair, resolve_affair, resume_affair};
pub use agent::MemoryAgent;
pub use composer::compose_affair_context;
pub use context_switch::{detect_context_switch, ContextSwitchDecision, ContextSwitchResult};
pub use kb::KbClient;
pub use lqm::{global_lqm, LocalQuickMemory, LqmStats};

use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Affair lifecycle states. Per client at most one affair is `Active`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AffairStatus {
    Active,
    Parked,
    Resolved,
}

impl AffairStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AffairStatus::Active => "active",
            AffairStatus::Parked => "parked",
            AffairStatus::Resolved => "resolved",
        }
    }
}

/// One message retained inside an affair's bounded recent history.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AffairMessage {
    pub role: String,
    pub content: String,
    pub timestamp: String,
}

/// A thematic container grouping contextually-related information under a
/// single topic for one client.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Affair {
    pub id: String,
    pub title: String,
    pub summary: String,
    pub status: AffairStatus,
    pub topics: Vec<String>,
    #[serde(default)]
    pub key_facts: HashMap<String, String>,
    #[serde(default)]
    pub pending_actions: Vec<String>,
    #[serde(default)]
    pub messages: Vec<AffairMessage>,
    pub client_id: String,
    pub project_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Affair {
    /// Renders the affair as one KB document for write-through.
    pub fn to_kb_document(&self) -> String {
        let mut doc = format!("# {}\n\n{}\n", self.title, self.summary);
        if !self.key_facts.is_empty() {
            doc.push_str("\n## Key facts\n");
            let mut facts: Vec<_> = self.key_facts.iter().collect();
            facts.sort_by(|a, b| a.0.cmp(b.0));
            for (k, v) in facts {
                doc.push_str(&format!("- {k}: {v}\n"));
            }
        }
        if !self.pending_actions.is_empty() {
            doc.push_str("\n## Pending actions\n");
            for action in &self.pending_actions {
                doc.push_str(&format!("- {action}\n"));
            }
        }
        doc
    }

    /// Text searched by ad-hoc queries over parked affairs.
    pub fn searchable_text(&self) -> String {
        let facts: Vec<&str> = self.key_facts.values().map(String::as_str).collect();
        format!("{} {} {}", self.title, self.summary, facts.join(" "))
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now().to_rfc3339();
    }
}

/// Write-through priority. Critical entries survive buffer eviction until
/// flushed and go through the immediate-ingest endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WritePriority {
    Critical,
    High,
    Normal,
}

impl WritePriority {
    pub fn header_value(&self) -> &'static str {
        match self {
            WritePriority::Critical => "1",
            WritePriority::High | WritePriority::Normal => "2",
        }
    }
}

/// A buffered KB write, searchable until flushed so read-your-writes holds.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PendingWrite {
    pub source_urn: String,
    pub content: String,
    pub kind: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub priority: WritePriority,
    pub created_at: String,
}

impl PendingWrite {
    /// Identity for sync bookkeeping: a source may be rewritten, so the
    /// timestamp disambiguates.
    pub fn key(&self) -> (String, String) {
        (self.source_urn.clone(), self.created_at.clone())
    }
}

/// Per-orchestration session view, rebuilt at start from LQM or the KB.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SessionContext {
    pub active_affair: Option<Affair>,
    #[serde(default)]
    pub parked_affairs: Vec<Affair>,
    #[serde(default)]
    pub user_preferences: HashMap<String, String>,
    pub last_context_switch_at: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn affair() -> Affair {
        Affair {
            id: "a1".into(),
            title: "Broker onboarding".into(),
            summary: "Setting up the BMS tenant".into(),
            status: AffairStatus::Active,
            topics: vec!["bms".into()],
            key_facts: HashMap::from([("system".into(), "BMS".into())]),
            pending_actions: vec!["confirm tenant id".into()],
            messages: vec![],
            client_id: "c1".into(),
            project_id: None,
            created_at: "2026-01-01T00:00:00Z".into(),
            updated_at: "2026-01-01T00:00:00Z".into(),
        }
    }

    #[test]
    fn kb_document_includes_facts_and_actions() {
        let doc = affair().to_kb_document();
        assert!(doc.contains("# Broker onboarding"));
        assert!(doc.contains("- system: BMS"));
        assert!(doc.contains("- confirm tenant id"));
    }

    #[test]
    fn searchable_text_covers_title_summary_facts() {
        let text = affair().searchable_text();
        assert!(text.contains("Broker onboarding"));
        assert!(text.contains("BMS"));
    }

    #[test]
    fn write_priority_orders_critical_first() {
        assert!(WritePriority::Critical < WritePriority::Normal);
        assert_eq!(WritePriority::Critical.header_value(), "1");
    }
}
