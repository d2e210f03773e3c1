//! Ensemble voting for mail classification, plus the SSH connection budget
//! shared by the HPC tools.
//!
//! The voter turns a probabilistic single-shot classifier into a
//! quorum-validated decision: n parallel inferences, only valid labels count,
//! and anything below quorum or the confidence threshold falls back to
//! `UNCERTAIN`. Every invocation appends one JSON-line audit record.

pub mod budget;
pub mod contradiction;

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Local;
use futures::future::join_all;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

pub use budget::SshBudget;
pub use contradiction::ContradictionChecker;

/// The two-label classification space. Extending this enum means re-stating
/// the quorum rule, so it is deliberately closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Label {
    Action,
    Fyi,
}

impl Label {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "ACTION" => Some(Label::Action),
            "FYI" => Some(Label::Fyi),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Label::Action => "ACTION",
            Label::Fyi => "FYI",
        }
    }
}

/// Outcome of one ensemble vote.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    /// "ACTION", "FYI", or the fallback category ("UNCERTAIN").
    pub category: String,
    pub confidence: f32,
    /// Successful votes, in completion order.
    pub votes: Vec<String>,
}

// ── Configuration (YAML) ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct VoterConfig {
    pub voting: VotingSection,
    pub ssh: SshSection,
    pub logic: LogicSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VotingSection {
    pub n_inferences: usize,
    pub temperature: f32,
    pub min_quorum: usize,
    pub confidence_threshold: f32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SshSection {
    pub timeout_seconds: u64,
    pub jitter_range_seconds: i64,
    pub max_daily_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogicSection {
    pub contradiction_detection: String,
    pub fallback_category: String,
}

impl VoterConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path.as_ref())
            .with_context(|| format!("reading voter config {}", path.as_ref().display()))?;
        let config: VoterConfig = serde_yaml::from_str(&raw)?;
        info!(
            n = config.voting.n_inferences,
            quorum = config.voting.min_quorum,
            "voter config loaded"
        );
        Ok(config)
    }
}

impl Default for VoterConfig {
    fn default() -> Self {
        Self {
            voting: VotingSection {
                n_inferences: 5,
                temperature: 0.2,
                min_quorum: 3,
                confidence_threshold: 0.7,
            },
            ssh: SshSection {
                timeout_seconds: 30,
                jitter_range_seconds: 300,
                max_daily_connections: 24,
            },
            logic: LogicSection {
                contradiction_detection: "enabled".to_string(),
                fallback_category: "UNCERTAIN".to_string(),
            },
        }
    }
}

// ── Voter ────────────────────────────────────────────────────────────────────

pub struct EnsembleVoter {
    config: VoterConfig,
    audit_log: PathBuf,
}

impl EnsembleVoter {
    pub fn new(config: VoterConfig, audit_log: impl Into<PathBuf>) -> Self {
        Self { config, audit_log: audit_log.into() }
    }

    pub fn config(&self) -> &VoterConfig {
        &self.config
    }

    /// Run `n_inferences` classifications in parallel and reduce them to a
    /// quorum-validated verdict. `classify` must be side-effect free; each
    /// invocation is independent.
    pub async fn vote_classify<F, Fut>(&self, subject: &str, classify: F) -> Verdict
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<String>> + Send,
    {
        let tasks: Vec<_> = (0..self.config.voting.n_inferences).map(|_| classify()).collect();
        let raw_results = join_all(tasks).await;

        let mut votes: Vec<String> = Vec::new();
        let mut failures: Vec<String> = Vec::new();
        for result in raw_results {
            match result {
                Ok(raw) => match Label::parse(&raw) {
                    Some(label) => votes.push(label.as_str().to_string()),
                    None => failures.push(format!("invalid label: {raw}")),
                },
                Err(err) => failures.push(err.to_string()),
            }
        }

        self.audit("ENSEMBLE_VOTE", subject, &votes, &failures);

        if votes.len() < self.config.voting.min_quorum {
            warn!(
                subject,
                successful = votes.len(),
                quorum = self.config.voting.min_quorum,
                "quorum not met"
            );
            return Verdict {
                category: self.config.logic.fallback_category.clone(),
                confidence: 0.0,
                votes,
            };
        }

        // Insertion-ordered counting: on an exact tie the label that was
        // seen first among the votes wins.
        let mut counts: Vec<(&str, usize)> = Vec::new();
        for vote in &votes {
            match counts.iter_mut().find(|(label, _)| *label == vote.as_str()) {
                Some((_, count)) => *count += 1,
                None => counts.push((vote.as_str(), 1)),
            }
        }
        let mut majority = "";
        let mut majority_count = 0usize;
        for &(label, count) in &counts {
            if count > majority_count {
                majority = label;
                majority_count = count;
            }
        }
        let confidence = majority_count as f32 / votes.len() as f32;

        if confidence < self.config.voting.confidence_threshold {
            warn!(subject, confidence, "low ensemble confidence");
            return Verdict {
                category: self.config.logic.fallback_category.clone(),
                confidence,
                votes,
            };
        }

        info!(subject, majority, confidence, "ensemble vote settled");
        Verdict { category: majority.to_string(), confidence, votes }
    }

    fn audit(&self, event_type: &str, subject: &str, votes: &[String], failures: &[String]) {
        let record = json!({
            "timestamp": Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            "event_type": event_type,
            "details": {
                "subject": subject,
                "total_inferences": self.config.voting.n_inferences,
                "successful": votes.len(),
                "votes": votes,
                "failures": failures,
            },
        });
        if let Some(parent) = self.audit_log.parent() {
            let _ = fs::create_dir_all(parent);
        }
        let appended = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.audit_log)
            .and_then(|mut file| writeln!(file, "{record}"));
        if let Err(err) = appended {
            warn!(%err, "failed to append ensemble audit record");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn voter(dir: &tempfile::TempDir) -> EnsembleVoter {
        EnsembleVoter::new(VoterConfig::default(), dir.path().join("audit.log"))
    }

    #[tokio::test]
    async fn unanimous_votes_give_full_confidence() {
        let dir = tempfile::tempdir().unwrap();
        let verdict = voter(&dir)
            .vote_classify("Re: seminar", || async { Ok("ACTION".to_string()) })
            .await;
        assert_eq!(verdict.category, "ACTION");
        assert_eq!(verdict.confidence, 1.0);
        assert_eq!(verdict.votes.len(), 5);
    }

    #[tokio::test]
    async fn split_vote_below_threshold_is_uncertain() {
        // 3 ACTION / 2 FYI with threshold 0.7 → 0.6 confidence → UNCERTAIN.
        let dir = tempfile::tempdir().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let verdict = voter(&dir)
            .vote_classify("Deal inside", || {
                let counter = counter.clone();
                async move {
                    let i = counter.fetch_add(1, Ordering::SeqCst);
                    Ok(if i == 1 || i == 2 { "FYI" } else { "ACTION" }.to_string())
                }
            })
            .await;
        assert_eq!(verdict.category, "UNCERTAIN");
        assert!((verdict.confidence - 0.6).abs() < 1e-6);
        assert_eq!(verdict.votes.len(), 5);
    }

    #[tokio::test]
    async fn exact_tie_resolves_to_first_seen_label() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = VoterConfig::default();
        config.voting.n_inferences = 4;
        config.voting.min_quorum = 2;
        config.voting.confidence_threshold = 0.5;
        let voter = EnsembleVoter::new(config, dir.path().join("audit.log"));

        let counter = Arc::new(AtomicUsize::new(0));
        let verdict = voter
            .vote_classify("tied", || {
                let counter = counter.clone();
                async move {
                    let i = counter.fetch_add(1, Ordering::SeqCst);
                    Ok(if i % 2 == 0 { "FYI" } else { "ACTION" }.to_string())
                }
            })
            .await;
        // 2-2 split at the 0.5 threshold: the label seen first (FYI) wins.
        assert_eq!(verdict.category, "FYI");
        assert!((verdict.confidence - 0.5).abs() < 1e-6);
        assert_eq!(verdict.votes.len(), 4);
    }

    #[tokio::test]
    async fn too_few_successes_fail_quorum() {
        let dir = tempfile::tempdir().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let verdict = voter(&dir)
            .vote_classify("???", || {
                let counter = counter.clone();
                async move {
                    let i = counter.fetch_add(1, Ordering::SeqCst);
                    if i < 3 {
                        anyhow::bail!("inference failed")
                    }
                    Ok("FYI".to_string())
                }
            })
            .await;
        assert_eq!(verdict.category, "UNCERTAIN");
        assert_eq!(verdict.confidence, 0.0);
        assert_eq!(verdict.votes.len(), 2);
    }

    #[tokio::test]
    async fn invalid_labels_count_as_failures() {
        let dir = tempfile::tempdir().unwrap();
        let verdict = voter(&dir)
            .vote_classify("garbled", || async { Ok("MAYBE".to_string()) })
            .await;
        assert_eq!(verdict.category, "UNCERTAIN");
        assert!(verdict.votes.is_empty());
    }

    #[tokio::test]
    async fn audit_log_gets_one_line_per_invocation() {
        let dir = tempfile::tempdir().unwrap();
        let voter = voter(&dir);
        voter.vote_classify("a", || async { Ok("FYI".to_string()) }).await;
        voter.vote_classify("b", || async { Ok("FYI".to_string()) }).await;

        let raw = std::fs::read_to_string(dir.path().join("audit.log")).unwrap();
        assert_eq!(raw.lines().count(), 2);
        let first: serde_json::Value = serde_json::from_str(raw.lines().next().unwrap()).unwrap();
        assert_eq!(first["details"]["subject"], "a");
        assert_eq!(first["details"]["successful"], 5);
    }

    #[test]
    fn config_parses_from_yaml() {
        let yaml = "
voting:
  n_inferences: 7
  temperature: 0.1
  min_quorum: 4
  confidence_threshold: 0.8
ssh:
  timeout_seconds: 20
  jitter_range_seconds: 120
  max_daily_connections: 12
logic:
  contradiction_detection: enabled
  fallback_category: UNCERTAIN
";
        let config: VoterConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.voting.n_inferences, 7);
        assert_eq!(config.ssh.max_daily_connections, 12);
        assert_eq!(config.logic.fallback_category, "UNCERTAIN");
    }
}
