//! Transcript correction scheduling.
//!
//! A correction run fixes a Whisper transcript chunk by chunk at background
//! priority, pushing progress after every chunk so the coordinator can render
//! a live percentage. A failed chunk keeps its original text; a partially
//! corrected transcript beats an aborted run.

use std::sync::Arc;

use serde::Deserialize;
use tracing::{info, warn};

use crate::coordinator::CoordinatorClient;
use crate::error::EngineError;
use crate::llm::{CallOptions, LlmClient, LlmPriority, ModelTier};
use crate::message::ChatMessage;

/// One correction request: the transcript pre-split into chunks.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CorrectionRun {
    pub meeting_id: String,
    pub client_id: String,
    pub chunks: Vec<String>,
    /// Domain vocabulary hints (client names, product terms) for the prompt.
    #[serde(default)]
    pub vocabulary: Vec<String>,
}

/// Result of one run.
#[derive(Clone, Debug)]
pub struct CorrectionResult {
    pub corrected: String,
    pub chunks_done: u32,
    pub chunks_failed: u32,
    pub tokens_generated: u64,
}

pub struct CorrectionScheduler {
    llm: Arc<dyn LlmClient>,
    coordinator: CoordinatorClient,
}

impl CorrectionScheduler {
    pub fn new(llm: Arc<dyn LlmClient>, coordinator: CoordinatorClient) -> Self {
        Self { llm, coordinator }
    }

    pub async fn run(&self, run: CorrectionRun) -> Result<CorrectionResult, EngineError> {
        let total = run.chunks.len() as u32;
        if total == 0 {
            return Ok(CorrectionResult {
                corrected: String::new(),
                chunks_done: 0,
                chunks_failed: 0,
                tokens_generated: 0,
            });
        }
        info!(meeting = %run.meeting_id, chunks = total, "correction run started");

        let system = build_correction_prompt(&run.vocabulary);
        let mut corrected_chunks: Vec<String> = Vec::with_capacity(run.chunks.len());
        let mut chunks_failed = 0u32;
        let mut tokens_generated = 0u64;

        for (index, chunk) in run.chunks.iter().enumerate() {
            let messages = [
                ChatMessage::system(system.clone()),
                ChatMessage::user(chunk.clone()),
            ];
            // Background priority: corrections never contend with foreground
            // chat on the GPU.
            let opts = CallOptions::new(ModelTier::LocalStandard, LlmPriority::Normal);
            match self.llm.chat(&messages, &opts).await {
                Ok(response) if !response.content.trim().is_empty() => {
                    tokens_generated += response
                        .usage
                        .as_ref()
                        .map(|u| u.completion_tokens as u64)
                        .unwrap_or(0);
                    corrected_chunks.push(response.content);
                }
                Ok(_) => {
                    chunks_failed += 1;
                    corrected_chunks.push(chunk.clone());
                }
                Err(e) => {
                    warn!(meeting = %run.meeting_id, chunk = index, error = %e, "chunk correction failed, keeping original");
                    chunks_failed += 1;
                    corrected_chunks.push(chunk.clone());
                }
            }

            let done = (index + 1) as u32;
            let percent = (done * 100 / total) as u8;
            self.coordinator
                .report_correction_progress(
                    &run.meeting_id,
                    &run.client_id,
                    percent,
                    done,
                    total,
                    Some(&format!("chunk {done}/{total}")),
                    tokens_generated,
                )
                .await;
        }

        info!(
            meeting = %run.meeting_id,
            done = total,
            failed = chunks_failed,
            tokens_generated,
            "correction run finished"
        );
        Ok(CorrectionResult {
            corrected: corrected_chunks.join("\n"),
            chunks_done: total,
            chunks_failed,
            tokens_generated,
        })
    }
}

fn build_correction_prompt(vocabulary: &[String]) -> String {
    let mut prompt = String::from(
        "You correct speech-to-text transcripts. Fix misheard words, casing, \
         and punctuation. Keep the speaker's wording and language; never \
         summarize or omit content. Reply with the corrected text only.",
    );
    if !vocabulary.is_empty() {
        prompt.push_str(&format!(
            "\nDomain terms that often get misheard: {}.",
            vocabulary.join(", ")
        ));
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlm;

    fn scheduler(llm: MockLlm) -> CorrectionScheduler {
        CorrectionScheduler::new(
            Arc::new(llm),
            CoordinatorClient::new("http://coordinator.invalid:1"),
        )
    }

    fn run(chunks: &[&str]) -> CorrectionRun {
        CorrectionRun {
            meeting_id: "m1".into(),
            client_id: "c1".into(),
            chunks: chunks.iter().map(|c| c.to_string()).collect(),
            vocabulary: vec!["BMS".into()],
        }
    }

    #[tokio::test]
    async fn corrects_all_chunks_in_order() {
        let llm = MockLlm::with_replies(vec![
            MockLlm::text("First chunk, corrected."),
            MockLlm::text("Second chunk, corrected."),
        ]);
        let result = scheduler(llm).run(run(&["furst chunk", "secnd chunk"])).await.unwrap();
        assert_eq!(
            result.corrected,
            "First chunk, corrected.\nSecond chunk, corrected."
        );
        assert_eq!(result.chunks_done, 2);
        assert_eq!(result.chunks_failed, 0);
    }

    #[tokio::test]
    async fn failed_chunk_keeps_original_text() {
        // One reply only: the second chunk's call errors.
        let llm = MockLlm::with_replies(vec![MockLlm::text("Corrected one.")]);
        let result = scheduler(llm)
            .run(run(&["chunk one", "chunk two stays"]))
            .await
            .unwrap();
        assert_eq!(result.corrected, "Corrected one.\nchunk two stays");
        assert_eq!(result.chunks_failed, 1);
    }

    #[tokio::test]
    async fn empty_run_is_a_noop() {
        let result = scheduler(MockLlm::default()).run(run(&[])).await.unwrap();
        assert!(result.corrected.is_empty());
        assert_eq!(result.chunks_done, 0);
    }

    #[test]
    fn prompt_includes_vocabulary() {
        let prompt = build_correction_prompt(&["BMS".into(), "Jira".into()]);
        assert!(prompt.contains("BMS, Jira"));
    }
}
