//! Tier escalation for the background handler.
//!
//! The ladder climbs the local tiers first; cloud tiers are only reachable
//! when the project rules allow a cloud provider.

use tracing::info;

use crate::orchestrate::ProjectRules;
use crate::settings::EscalationSettings;

use super::ModelTier;

/// Tracks the current tier and the escalation history for one background run.
pub struct EscalationTracker {
    ladder: Vec<ModelTier>,
    index: usize,
    escalations: u32,
    max_retries: u32,
}

impl EscalationTracker {
    pub fn new(start: ModelTier, rules: &ProjectRules, max_retries: u32) -> Self {
        let mut ladder = vec![
            ModelTier::LocalFast,
            ModelTier::LocalStandard,
            ModelTier::LocalLarge,
        ];
        if let Some(cloud) = cloud_tier_for(rules) {
            ladder.push(cloud);
        }
        let index = ladder.iter().position(|t| *t == start).unwrap_or(0);
        Self {
            ladder,
            index,
            escalations: 0,
            max_retries,
        }
    }

    pub fn current(&self) -> ModelTier {
        self.ladder[self.index]
    }

    /// Moves one rung up. Returns false when the ladder or the retry budget is
    /// exhausted.
    pub fn escalate(&mut self) -> bool {
        if self.escalations >= self.max_retries || self.index + 1 >= self.ladder.len() {
            return false;
        }
        self.index += 1;
        self.escalations += 1;
        info!(tier = self.current().as_str(), "escalating model tier");
        true
    }

    /// `tier1 -> tier2 -> …` for logs and result metadata.
    pub fn history(&self) -> String {
        self.ladder[..=self.index]
            .iter()
            .map(|t| t.as_str())
            .collect::<Vec<_>>()
            .join(" -> ")
    }
}

/// Picks the cloud tier the rules allow, preferring reasoning > coding > large
/// context. `None` keeps the run local.
fn cloud_tier_for(rules: &ProjectRules) -> Option<ModelTier> {
    if rules.auto_use_anthropic {
        Some(ModelTier::CloudReasoning)
    } else if rules.auto_use_openai {
        Some(ModelTier::CloudCoding)
    } else if rules.auto_use_gemini {
        Some(ModelTier::CloudLargeContext)
    } else {
        None
    }
}

/// Quality signal: does this final answer look like the model gave up?
pub fn needs_escalation(
    answer: &str,
    tool_parse_failures: u32,
    total_tool_calls: u32,
    iterations_exhausted: bool,
    settings: &EscalationSettings,
) -> bool {
    if answer.trim().is_empty() {
        return true;
    }
    if answer.trim().len() < settings.min_answer_chars {
        return true;
    }
    if total_tool_calls > 0 {
        let ratio = tool_parse_failures as f64 / total_tool_calls as f64;
        if ratio > settings.tool_parse_failure_ratio {
            return true;
        }
    }
    iterations_exhausted
}
