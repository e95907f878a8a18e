//! LLM-based topic change detection for incoming user messages.

use tracing::warn;

use crate::llm::{CallOptions, LlmClient, LlmPriority, ModelTier};
use crate::message::ChatMessage;
use crate::tools::lenient_json;

use super::SessionContext;

/// What the classifier decided about the new message.
#[derive(Clone, Debug, PartialEq)]
pub enum ContextSwitchDecision {
    /// The message continues the active affair.
    Stay,
    /// The message belongs to a parked affair.
    Switch { target_affair_id: String },
    /// The message opens a new topic.
    NewAffair { title: String },
}

#[derive(Clone, Debug)]
pub struct ContextSwitchResult {
    pub decision: ContextSwitchDecision,
    pub confidence: f64,
    pub reasoning: String,
}

/// Classifies the user message against the active and parked affairs.
/// Decisions below the confidence threshold degrade to `Stay`.
pub async fn detect_context_switch(
    user_message: &str,
    session: &SessionContext,
    llm: &dyn LlmClient,
    confidence_threshold: f64,
) -> ContextSwitchResult {
    // Nothing to switch between.
    if session.active_affair.is_none() && session.parked_affairs.is_empty() {
        return ContextSwitchResult {
            decision: ContextSwitchDecision::NewAffair {
                title: derive_title(user_message),
            },
            confidence: 1.0,
            reasoning: "no existing affairs".into(),
        };
    }

    let active = session
        .active_affair
        .as_ref()
        .map(|a| format!("{} — {}", a.title, a.summary))
        .unwrap_or_else(|| "(none)".into());
    let parked: Vec<String> = session
        .parked_affairs
        .iter()
        .map(|a| format!("- id={} title={} summary={}", a.id, a.title, a.summary))
        .collect();

    let prompt = format!(
        "Classify whether the user's message continues the current topic, \
         resumes a parked one, or opens a new one.\n\n\
         CURRENT TOPIC: {active}\n\
         PARKED TOPICS:\n{}\n\
         USER MESSAGE: {user_message}\n\n\
         Respond with JSON only:\n\
         {{\"decision\": \"stay\" | \"switch\" | \"new\", \"target_affair_id\": \"...\", \
         \"new_title\": \"...\", \"confidence\": 0.0, \"reasoning\": \"...\"}}",
        if parked.is_empty() {
            "(none)".to_string()
        } else {
            parked.join("\n")
        },
    );

    let response = match llm
        .chat(
            &[
                ChatMessage::system("You are a topic classifier. Respond with valid JSON only."),
                ChatMessage::user(prompt),
            ],
            &CallOptions::new(ModelTier::LocalFast, LlmPriority::Critical),
        )
        .await
    {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "context switch classification failed, staying");
            return stay("classifier unavailable");
        }
    };

    let Some(parsed) = lenient_json(&response.content) else {
        return stay("unparsable classifier output");
    };
    let confidence = parsed["confidence"].as_f64().unwrap_or(0.0);
    let reasoning = parsed["reasoning"].as_str().unwrap_or("").to_string();

    if confidence < confidence_threshold {
        return ContextSwitchResult {
            decision: ContextSwitchDecision::Stay,
            confidence,
            reasoning,
        };
    }

    let decision = match parsed["decision"].as_str().unwrap_or("stay") {
        "switch" => match parsed["target_affair_id"].as_str() {
            Some(id) if session.parked_affairs.iter().any(|a| a.id == id) => {
                ContextSwitchDecision::Switch {
                    target_affair_id: id.to_string(),
                }
            }
            _ => ContextSwitchDecision::Stay,
        },
        "new" => ContextSwitchDecision::NewAffair {
            title: parsed["new_title"]
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| derive_title(user_message)),
        },
        _ => ContextSwitchDecision::Stay,
    };

    ContextSwitchResult {
        decision,
        confidence,
        reasoning,
    }
}

fn stay(reasoning: &str) -> ContextSwitchResult {
    ContextSwitchResult {
        decision: ContextSwitchDecision::Stay,
        confidence: 0.0,
        reasoning: reasoning.into(),
    }
}

fn derive_title(message: &str) -> String {
    let title: String = message.chars().take(60).collect();
    if title.is_empty() {
        "New topic".into()
    } else {
        title
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlm;
    use crate::memory::{Affair, AffairStatus};

    fn session_with_parked() -> SessionContext {
        SessionContext {
            active_affair: Some(affair("a1", "Current", AffairStatus::Active)),
            parked_affairs: vec![affair("a2", "Parked topic", AffairStatus::Parked)],
            ..Default::default()
        }
    }

    fn affair(id: &str, title: &str, status: AffairStatus) -> Affair {
        Affair {
            id: id.into(),
            title: title.into(),
            summary: String::new(),
            status,
            topics: vec![],
            key_facts: Default::default(),
            pending_actions: vec![],
            messages: vec![],
            client_id: "c1".into(),
            project_id: None,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    #[tokio::test]
    async fn empty_session_creates_new_affair_without_llm() {
        let llm = MockLlm::with_replies(vec![]);
        let result =
            detect_context_switch("Tell me about BMS", &SessionContext::default(), &llm, 0.7).await;
        assert!(matches!(
            result.decision,
            ContextSwitchDecision::NewAffair { .. }
        ));
        assert_eq!(llm.call_count(), 0);
    }

    #[tokio::test]
    async fn switch_to_known_parked_affair() {
        let llm = MockLlm::with_replies(vec![MockLlm::text(
            r#"{"decision": "switch", "target_affair_id": "a2", "confidence": 0.9, "reasoning": "matches parked"}"#,
        )]);
        let result = detect_context_switch("about that parked thing", &session_with_parked(), &llm, 0.7).await;
        assert_eq!(
            result.decision,
            ContextSwitchDecision::Switch {
                target_affair_id: "a2".into()
            }
        );
    }

    #[tokio::test]
    async fn low_confidence_degrades_to_stay() {
        let llm = MockLlm::with_replies(vec![MockLlm::text(
            r#"{"decision": "new", "new_title": "X", "confidence": 0.4, "reasoning": "unsure"}"#,
        )]);
        let result =
            detect_context_switch("hmm", &session_with_parked(), &llm, 0.7).await;
        assert_eq!(result.decision, ContextSwitchDecision::Stay);
    }

    #[tokio::test]
    async fn unknown_target_id_stays() {
        let llm = MockLlm::with_replies(vec![MockLlm::text(
            r#"{"decision": "switch", "target_affair_id": "ghost", "confidence": 0.95, "reasoning": ""}"#,
        )]);
        let result = detect_context_switch("x", &session_with_parked(), &llm, 0.7).await;
        assert_eq!(result.decision, ContextSwitchDecision::Stay);
    }

    #[tokio::test]
    async fn llm_failure_stays() {
        let llm = MockLlm::with_replies(vec![]);
        let result = detect_context_switch("x", &session_with_parked(), &llm, 0.7).await;
        assert_eq!(result.decision, ContextSwitchDecision::Stay);
    }
}
