//! Correction feedback loop.
//!
//! Detects when the user is correcting the assistant, stores the correction
//! with a best-effort embedding, and formats past mistakes as a caution block
//! for the system prompt.

use std::sync::{Arc, LazyLock};

use anyhow::Result;
use chrono::Utc;
use regex::Regex;
use rusqlite::params;
use tracing::{debug, info};

use crate::embedder::Embedder;
use crate::store::MemoryStore;

/// Stored feedback text is truncated to this many characters per side.
const MAX_FEEDBACK_LENGTH: usize = 200;
/// At most this many items are injected into the prompt.
const MAX_PROMPT_FEEDBACK: usize = 3;
/// Per-item character budget in the caution block.
const MAX_PROMPT_ITEM_LENGTH: usize = 60;

/// Korean + English correction markers.
static CORRECTION_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"틀렸어",
        r"틀렸는데",
        r"틀린 거",
        r"잘못됐어",
        r"잘못된 거",
        r"그게 아니라",
        r"그거 아니야",
        r"아니야[,.]?\s",
        r"아닌데",
        r"아니거든",
        r"그건 아니고",
        r"사실은",
        r"실제로는",
        r"정확히는",
        r"정정할게",
        r"고쳐줘",
        r"수정해",
        r"다시 해",
        r"다시 말해",
        r"제대로",
        r"(?i)that'?s wrong",
        r"(?i)that'?s not right",
        r"(?i)that'?s incorrect",
        r"(?i)you'?re wrong",
        r"(?i)not correct",
        r"(?i)actually[,.]?\s",
        r"(?i)no[,.]?\s+it'?s",
        r"(?i)correction:",
        r"(?i)wrong[.!]",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("correction pattern must compile"))
    .collect()
});

#[derive(Debug, Clone)]
pub struct FeedbackRow {
    pub id: i64,
    pub timestamp: String,
    pub original_action: String,
    pub correction: String,
    pub category: Option<String>,
    pub session_id: Option<String>,
    pub score: f32,
}

pub struct FeedbackManager {
    store: Arc<MemoryStore>,
}

impl FeedbackManager {
    /// Wrap the shared store and run the idempotent schema migration for the
    /// columns this manager needs.
    pub fn new(store: Arc<MemoryStore>) -> Result<Self> {
        let manager = Self { store };
        manager.migrate_schema()?;
        Ok(manager)
    }

    fn migrate_schema(&self) -> Result<()> {
        let conn = self.store.lock_conn();
        let mut existing: Vec<String> = Vec::new();
        {
            let mut stmt = conn.prepare("PRAGMA table_info(feedback)")?;
            let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
            for name in names {
                existing.push(name?);
            }
        }
        for (column, column_type) in [
            ("embedding", "BLOB"),
            ("session_id", "TEXT"),
            ("category", "TEXT"),
        ] {
            if !existing.iter().any(|c| c == column) {
                conn.execute(&format!("ALTER TABLE feedback ADD COLUMN {column} {column_type}"), [])?;
                info!(column, "feedback table column added");
            }
        }
        Ok(())
    }

    // ── Detection ────────────────────────────────────────────────────────────

    /// Stateless check whether a message looks like a correction.
    pub fn detect_correction(message: &str) -> bool {
        if message.chars().count() < 2 {
            return false;
        }
        CORRECTION_PATTERNS.iter().any(|p| p.is_match(message))
    }

    // ── Storage ──────────────────────────────────────────────────────────────

    pub async fn save_correction(
        &self,
        session_id: &str,
        original_response: &str,
        user_correction: &str,
        category: Option<&str>,
    ) -> Result<i64> {
        let original: String = original_response.chars().take(MAX_FEEDBACK_LENGTH).collect();
        let correction: String = user_correction.chars().take(MAX_FEEDBACK_LENGTH).collect();

        let blob = self
            .store
            .embedder()
            .embed(&correction)
            .await
            .map(|v| Embedder::to_bytes(&v));

        let conn = self.store.lock_conn();
        conn.execute(
            "INSERT INTO feedback
             (timestamp, original_action, correction, applied, embedding, session_id, category)
             VALUES (?1, ?2, ?3, 0, ?4, ?5, ?6)",
            params![Utc::now().to_rfc3339(), original, correction, blob, session_id, category],
        )?;
        let id = conn.last_insert_rowid();
        info!(id, ?category, "correction saved");
        Ok(id)
    }

    // ── Retrieval ────────────────────────────────────────────────────────────

    /// Feedback most relevant to `query` — semantic when possible, most
    /// recent otherwise.
    pub async fn get_relevant_feedback(&self, query: &str, top_k: usize) -> Result<Vec<FeedbackRow>> {
        if let Some(query_vec) = self.store.embedder().embed(query).await {
            return self.semantic_feedback_search(&query_vec, top_k);
        }
        debug!("feedback retrieval falling back to most recent");
        self.get_recent_feedback(top_k)
    }

    fn semantic_feedback_search(&self, query_vec: &[f32], top_k: usize) -> Result<Vec<FeedbackRow>> {
        let conn = self.store.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, original_action, correction, category, session_id, embedding
             FROM feedback WHERE embedding IS NOT NULL",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                FeedbackRow {
                    id: row.get(0)?,
                    timestamp: row.get(1)?,
                    original_action: row.get(2)?,
                    correction: row.get(3)?,
                    category: row.get(4)?,
                    session_id: row.get(5)?,
                    score: 0.0,
                },
                row.get::<_, Vec<u8>>(6)?,
            ))
        })?;

        let mut candidates: Vec<FeedbackRow> = Vec::new();
        for row in rows {
            let (mut fb, blob) = row?;
            fb.score = Embedder::cosine(query_vec, &Embedder::from_bytes(&blob));
            candidates.push(fb);
        }
        candidates.sort_by(|a, b| b.score.total_cmp(&a.score).then(b.id.cmp(&a.id)));
        candidates.truncate(top_k);
        Ok(candidates)
    }

    pub fn get_recent_feedback(&self, limit: usize) -> Result<Vec<FeedbackRow>> {
        let conn = self.store.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, original_action, correction, category, session_id
             FROM feedback ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok(FeedbackRow {
                    id: row.get(0)?,
                    timestamp: row.get(1)?,
                    original_action: row.get(2)?,
                    correction: row.get(3)?,
                    category: row.get(4)?,
                    session_id: row.get(5)?,
                    score: 0.0,
                })
            })?
            .collect::<std::result::Result<_, _>>()?;
        Ok(rows)
    }

    pub fn correction_count(&self, category: Option<&str>) -> Result<i64> {
        let conn = self.store.lock_conn();
        let count = match category {
            Some(cat) => conn.query_row(
                "SELECT COUNT(*) FROM feedback WHERE category = ?1",
                params![cat],
                |row| row.get(0),
            )?,
            None => conn.query_row("SELECT COUNT(*) FROM feedback", [], |row| row.get(0))?,
        };
        Ok(count)
    }

    // ── Formatting ───────────────────────────────────────────────────────────

    /// Caution block for prompt injection; empty string when no feedback.
    pub fn format_as_caution(feedbacks: &[FeedbackRow]) -> String {
        if feedbacks.is_empty() {
            return String::new();
        }
        let items: Vec<String> = feedbacks
            .iter()
            .take(MAX_PROMPT_FEEDBACK)
            .map(|fb| {
                format!(
                    "- 잘못: {} → 교정: {}",
                    clip(&fb.original_action, MAX_PROMPT_ITEM_LENGTH),
                    clip(&fb.correction, MAX_PROMPT_ITEM_LENGTH),
                )
            })
            .collect();
        format!("[주의: 과거 실수 기록]\n{}", items.join("\n"))
    }
}

fn clip(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let clipped: String = text.chars().take(max_chars).collect();
    format!("{clipped}...")
}
