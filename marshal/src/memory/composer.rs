//! Affair-aware context composition for LLM prompts.

use crate::context::count_tokens;

use super::SessionContext;

/// Produces a prompt-ready text block for the active affair (title, summary,
/// key facts, pending actions) plus a brief list of parked affairs, within the
/// token budget. Budget 0 yields an empty string.
pub fn compose_affair_context(session: &SessionContext, max_tokens: usize) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut used = 0usize;

    let mut push_within_budget = |text: String, used: &mut usize| -> bool {
        let cost = count_tokens(&text);
        if *used + cost > max_tokens {
            return false;
        }
        *used += cost;
        parts.push(text);
        true
    };

    if let Some(affair) = &session.active_affair {
        let mut block = format!("## Current affair: {}\n", affair.title);
        if !affair.summary.is_empty() {
            block.push_str(&format!("{}\n", affair.summary));
        }
        if !affair.key_facts.is_empty() {
            block.push_str("Key facts:\n");
            let mut facts: Vec<_> = affair.key_facts.iter().collect();
            facts.sort_by(|a, b| a.0.cmp(b.0));
            for (k, v) in facts {
                block.push_str(&format!("- {k}: {v}\n"));
            }
        }
        if !affair.pending_actions.is_empty() {
            block.push_str("Pending actions:\n");
            for action in &affair.pending_actions {
                block.push_str(&format!("- {action}\n"));
            }
        }
        push_within_budget(block, &mut used);
    }

    if !session.parked_affairs.is_empty() {
        let mut block = String::from("## Parked affairs\n");
        for affair in &session.parked_affairs {
            let summary: String = affair.summary.chars().take(120).collect();
            block.push_str(&format!("- {} — {}\n", affair.title, summary));
        }
        push_within_budget(block, &mut used);
    }

    parts.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{Affair, AffairStatus};
    use std::collections::HashMap;

    fn session() -> SessionContext {
        let active = Affair {
            id: "a1".into(),
            title: "Onboarding".into(),
            summary: "Tenant setup in progress".into(),
            status: AffairStatus::Active,
            topics: vec![],
            key_facts: HashMap::from([("tenant".into(), "t-42".into())]),
            pending_actions: vec!["verify DNS".into()],
            messages: vec![],
            client_id: "c1".into(),
            project_id: None,
            created_at: String::new(),
            updated_at: String::new(),
        };
        let parked = Affair {
            id: "a2".into(),
            title: "Billing question".into(),
            summary: "Waiting on invoice".into(),
            status: AffairStatus::Parked,
            topics: vec![],
            key_facts: HashMap::new(),
            pending_actions: vec![],
            messages: vec![],
            client_id: "c1".into(),
            project_id: None,
            created_at: String::new(),
            updated_at: String::new(),
        };
        SessionContext {
            active_affair: Some(active),
            parked_affairs: vec![parked],
            user_preferences: HashMap::new(),
            last_context_switch_at: None,
        }
    }

    #[test]
    fn composes_active_and_parked_blocks() {
        let text = compose_affair_context(&session(), 8000);
        assert!(text.contains("## Current affair: Onboarding"));
        assert!(text.contains("- tenant: t-42"));
        assert!(text.contains("- verify DNS"));
        assert!(text.contains("Billing question"));
    }

    #[test]
    fn zero_budget_yields_empty() {
        assert!(compose_affair_context(&session(), 0).is_empty());
    }

    #[test]
    fn tight_budget_admits_active_block_only() {
        let active_only = compose_affair_context(&session(), 40);
        assert!(active_only.contains("Onboarding") || active_only.is_empty());
        assert!(!active_only.contains("Billing question"));
    }
}
