//! Coding-run execution record: goals, steps, results, evaluation.
//!
//! The state is a flat record; affairs are referenced by id and resolved
//! through LQM, never embedded.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{CodingTask, ProjectRules};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Respond,
    Code,
    Tracker,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Goal {
    pub description: String,
    #[serde(default)]
    pub steps: Vec<Step>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Step {
    pub step_type: StepType,
    pub instructions: String,
    #[serde(default)]
    pub files: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepResult {
    pub step_index: usize,
    pub success: bool,
    pub summary: String,
    #[serde(default)]
    pub agent_type: Option<String>,
}

/// Outcome of evaluating the run against the project rules.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Evaluation {
    #[serde(default)]
    pub failed_checks: Vec<String>,
    #[serde(default)]
    pub blocked_checks: Vec<String>,
}

impl Evaluation {
    /// Acceptable iff nothing failed and nothing was blocked.
    pub fn acceptable(&self) -> bool {
        self.failed_checks.is_empty() && self.blocked_checks.is_empty()
    }

    /// Checks changed files against the rules: forbidden globs and the
    /// changed-file cap.
    pub fn from_changed_files(changed: &[String], rules: &ProjectRules) -> Self {
        let mut eval = Evaluation::default();
        for path in changed {
            if rules.is_forbidden(path) {
                eval.blocked_checks
                    .push(format!("forbidden file touched: {path}"));
            }
        }
        if let Some(max) = rules.max_changed_files {
            if changed.len() as u32 > max {
                eval.failed_checks
                    .push(format!("{} files changed, limit is {max}", changed.len()));
            }
        }
        eval
    }
}

/// Flat state record for one coding run. Serialized whole into checkpoints.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CodingRunState {
    pub task: CodingTask,
    pub rules: ProjectRules,
    #[serde(default)]
    pub goals: Vec<Goal>,
    #[serde(default)]
    pub current_goal_index: usize,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub current_step_index: usize,
    #[serde(default)]
    pub step_results: Vec<StepResult>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub final_result: Option<String>,
    #[serde(default)]
    pub artifacts: Vec<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub evaluation: Option<Evaluation>,
    #[serde(default)]
    pub environment: Option<Value>,
}

impl CodingRunState {
    pub fn new(task: CodingTask) -> Self {
        let rules = task.rules.clone();
        Self {
            task,
            rules,
            goals: vec![],
            current_goal_index: 0,
            steps: vec![],
            current_step_index: 0,
            step_results: vec![],
            branch: None,
            final_result: None,
            artifacts: vec![],
            error: None,
            evaluation: None,
            environment: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evaluation_acceptance() {
        assert!(Evaluation::default().acceptable());
        let failed = Evaluation {
            failed_checks: vec!["too many files".into()],
            blocked_checks: vec![],
        };
        assert!(!failed.acceptable());
    }

    #[test]
    fn evaluation_from_changed_files() {
        let rules = ProjectRules {
            forbidden_files: vec!["secrets/*".into()],
            max_changed_files: Some(2),
            ..Default::default()
        };
        let eval = Evaluation::from_changed_files(
            &[
                "src/a.rs".into(),
                "secrets/key".into(),
                "src/b.rs".into(),
            ],
            &rules,
        );
        assert_eq!(eval.blocked_checks.len(), 1);
        assert_eq!(eval.failed_checks.len(), 1);
        assert!(!eval.acceptable());
    }

    #[test]
    fn state_round_trips_through_json() {
        let task = CodingTask {
            id: "t1".into(),
            client_id: "c1".into(),
            project_id: None,
            workspace_path: "/ws/t1".into(),
            query: "fix the bug".into(),
            agent_preference: Some("claude".into()),
            rules: ProjectRules::default(),
            environment: None,
        };
        let mut state = CodingRunState::new(task);
        state.branch = Some("feature/t1".into());
        state.step_results.push(StepResult {
            step_index: 0,
            success: true,
            summary: "patched".into(),
            agent_type: Some("claude".into()),
        });

        let json = serde_json::to_value(&state).unwrap();
        let back: CodingRunState = serde_json::from_value(json).unwrap();
        assert_eq!(back.branch.as_deref(), Some("feature/t1"));
        assert_eq!(back.step_results.len(), 1);
    }
}
