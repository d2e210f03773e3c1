//! Quorum-validated mail classification.
//!
//! Wraps a single-shot LLM classifier in the ensemble voter: the
//! contradiction check runs first (a subject the user has corrected both
//! ways is never auto-classified), then n parallel inferences are reduced to
//! an `ACTION | FYI | UNCERTAIN` verdict.

use std::sync::Arc;

use anyhow::Result;
use tracing::debug;

use borealis_ensemble::{ContradictionChecker, EnsembleVoter, Verdict};
use borealis_llm::{ChatBackend, Turn};

const CLASSIFY_SYSTEM_PROMPT: &str = "\
You are a mail triage classifier. Classify the mail as exactly one word:
ACTION — the user must do something (reply, pay, submit, attend, fix).
FYI — informational only (newsletters, receipts, notifications).
Answer with ACTION or FYI and nothing else.";

pub struct MailTriage {
    backend: Arc<dyn ChatBackend>,
    model: String,
    voter: EnsembleVoter,
    contradiction: ContradictionChecker,
}

impl MailTriage {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        model: impl Into<String>,
        voter: EnsembleVoter,
        contradiction: ContradictionChecker,
    ) -> Self {
        Self { backend, model: model.into(), voter, contradiction }
    }

    /// Classify one mail. Historic contradictions short-circuit to the
    /// fallback category with no votes cast.
    pub async fn classify(&self, subject: &str, sender: &str, content: &str) -> Verdict {
        if let Some(warning) = self.contradiction.check(subject) {
            debug!(subject, %warning, "contradiction short-circuit");
            return Verdict {
                category: self.voter.config().logic.fallback_category.clone(),
                confidence: 0.0,
                votes: Vec::new(),
            };
        }

        self.voter
            .vote_classify(subject, || self.single_inference(subject, sender, content))
            .await
    }

    async fn single_inference(&self, subject: &str, sender: &str, content: &str) -> Result<String> {
        let mail_text = format!(
            "Subject: {subject}\nFrom: {sender}\n\n{}",
            crate::prompt::clip(content, 1500),
        );
        let turns = [
            Turn::System(CLASSIFY_SYSTEM_PROMPT.to_string()),
            Turn::User(mail_text),
        ];
        let outcome = self
            .backend
            .chat(&self.model, &turns, None, 8)
            .await
            .map_err(|err| anyhow::anyhow!("classification inference failed: {err}"))?;

        let upper = outcome.text.to_uppercase();
        if upper.contains("ACTION") {
            Ok("ACTION".to_string())
        } else if upper.contains("FYI") {
            Ok("FYI".to_string())
        } else {
            // Invalid labels are counted as failures by the voter.
            Ok(outcome.text.trim().to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use borealis_ensemble::VoterConfig;
    use borealis_llm::{ChatOutcome, LlmError};
    use std::fs;

    struct FixedBackend {
        reply: String,
    }

    #[async_trait]
    impl ChatBackend for FixedBackend {
        async fn chat(
            &self,
            _model: &str,
            _turns: &[Turn],
            _tools: Option<&serde_json::Value>,
            _max_tokens: u32,
        ) -> std::result::Result<ChatOutcome, LlmError> {
            Ok(ChatOutcome::reply(self.reply.clone()))
        }
    }

    fn triage(dir: &tempfile::TempDir, reply: &str) -> MailTriage {
        MailTriage::new(
            Arc::new(FixedBackend { reply: reply.to_string() }),
            "test-model",
            EnsembleVoter::new(VoterConfig::default(), dir.path().join("audit.log")),
            ContradictionChecker::new(dir.path().join("corrections.jsonl"), "enabled"),
        )
    }

    #[tokio::test]
    async fn unanimous_action_classification() {
        let dir = tempfile::tempdir().unwrap();
        let verdict = triage(&dir, "ACTION").classify("Re: seminar", "prof@uni.edu", "please reply").await;
        assert_eq!(verdict.category, "ACTION");
        assert_eq!(verdict.confidence, 1.0);
        assert_eq!(verdict.votes.len(), 5);
    }

    #[tokio::test]
    async fn chatty_but_valid_replies_still_parse() {
        let dir = tempfile::tempdir().unwrap();
        let verdict = triage(&dir, "I think this is FYI.").classify("Newsletter", "", "weekly news").await;
        assert_eq!(verdict.category, "FYI");
    }

    #[tokio::test]
    async fn garbage_replies_fall_to_uncertain() {
        let dir = tempfile::tempdir().unwrap();
        let verdict = triage(&dir, "maybe?").classify("???", "", "").await;
        assert_eq!(verdict.category, "UNCERTAIN");
        assert!(verdict.votes.is_empty());
    }

    #[tokio::test]
    async fn contradicted_subjects_skip_voting() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("corrections.jsonl"),
            concat!(
                "{\"subject\":\"Re: seminar\",\"corrected_label\":\"ACTION\"}\n",
                "{\"subject\":\"Re: seminar\",\"corrected_label\":\"FYI\"}\n",
            ),
        )
        .unwrap();
        let verdict = triage(&dir, "ACTION").classify("Re: seminar", "", "body").await;
        assert_eq!(verdict.category, "UNCERTAIN");
        assert!(verdict.votes.is_empty());
    }
}
