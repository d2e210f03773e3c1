//! SQLite-backed memory: conversations, knowledge, feedback.
//!
//! One writer connection shared behind a mutex; the lock is never held
//! across an await point (embedding happens before the lock is taken).
//! Persistence is best-effort from the router's point of view — embedding
//! failures degrade to keyword search, they never block an insert.

use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{Connection, params};
use tracing::{info, warn};

use crate::embedder::Embedder;
use crate::feedback::FeedbackRow;

/// Stored knowledge content is capped for embedding efficiency.
pub const MAX_KNOWLEDGE_CONTENT: usize = 2000;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS conversations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    session_id TEXT NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    embedding BLOB
);
CREATE INDEX IF NOT EXISTS idx_conversations_session ON conversations(session_id);

CREATE TABLE IF NOT EXISTS knowledge (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    category TEXT NOT NULL,
    title TEXT NOT NULL,
    content TEXT NOT NULL,
    embedding BLOB,
    source TEXT NOT NULL DEFAULT 'manual',
    tags TEXT NOT NULL DEFAULT '[]'
);
CREATE INDEX IF NOT EXISTS idx_knowledge_source ON knowledge(source);

CREATE TABLE IF NOT EXISTS feedback (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    original_action TEXT NOT NULL,
    correction TEXT NOT NULL,
    applied INTEGER NOT NULL DEFAULT 0
);
";

#[derive(Debug, Clone)]
pub struct ConversationTurn {
    pub id: i64,
    pub timestamp: String,
    pub session_id: String,
    pub role: String,
    pub content: String,
}

/// Which table a search hit came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchSource {
    Conversation,
    Knowledge,
}

impl SearchSource {
    pub fn label(self) -> &'static str {
        match self {
            SearchSource::Conversation => "conversation",
            SearchSource::Knowledge => "knowledge",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub source: SearchSource,
    pub id: i64,
    /// Knowledge hits carry their title; conversation hits do not.
    pub title: Option<String>,
    pub content: String,
    pub category: Option<String>,
    pub score: f32,
}

pub struct MemoryStore {
    conn: Mutex<Connection>,
    embedder: Embedder,
}

impl MemoryStore {
    pub fn open(path: impl AsRef<Path>, embedder: Embedder) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("opening memory db at {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn), embedder })
    }

    /// In-memory database for tests.
    pub fn open_in_memory(embedder: Embedder) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn), embedder })
    }

    pub fn embedder(&self) -> &Embedder {
        &self.embedder
    }

    pub(crate) fn lock_conn(&self) -> MutexGuard<'_, Connection> {
        // Poisoning only happens if a holder panicked; the connection itself
        // is still usable.
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ── Conversations ────────────────────────────────────────────────────────

    /// Save a conversation turn and return the row id. Embedding is
    /// best-effort and never fails the insert.
    pub async fn save_conversation(&self, session_id: &str, role: &str, content: &str) -> Result<i64> {
        let blob = self
            .embedder
            .embed(content)
            .await
            .map(|v| Embedder::to_bytes(&v));

        let conn = self.lock_conn();
        conn.execute(
            "INSERT INTO conversations (timestamp, session_id, role, content, embedding)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![Utc::now().to_rfc3339(), session_id, role, content, blob],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Most recent turns for a session, returned oldest-first.
    pub fn get_recent(&self, session_id: &str, limit: usize) -> Result<Vec<ConversationTurn>> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, session_id, role, content
             FROM conversations WHERE session_id = ?1
             ORDER BY id DESC LIMIT ?2",
        )?;
        let mut rows: Vec<ConversationTurn> = stmt
            .query_map(params![session_id, limit as i64], |row| {
                Ok(ConversationTurn {
                    id: row.get(0)?,
                    timestamp: row.get(1)?,
                    session_id: row.get(2)?,
                    role: row.get(3)?,
                    content: row.get(4)?,
                })
            })?
            .collect::<std::result::Result<_, _>>()?;
        rows.reverse();
        Ok(rows)
    }

    // ── Knowledge ────────────────────────────────────────────────────────────

    pub async fn save_knowledge(
        &self,
        category: &str,
        title: &str,
        content: &str,
        source: &str,
        tags: &[String],
    ) -> Result<i64> {
        let content: String = content.chars().take(MAX_KNOWLEDGE_CONTENT).collect();
        let blob = self
            .embedder
            .embed(&content)
            .await
            .map(|v| Embedder::to_bytes(&v));
        let tags_json = serde_json::to_string(tags)?;

        let conn = self.lock_conn();
        conn.execute(
            "INSERT INTO knowledge (timestamp, category, title, content, embedding, source, tags)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![Utc::now().to_rfc3339(), category, title, content, blob, source, tags_json],
        )?;
        Ok(conn.last_insert_rowid())
    }

    // ── Search ───────────────────────────────────────────────────────────────

    /// Search conversations + knowledge. Semantic when a query embedding is
    /// obtainable, keyword `LIKE` fallback otherwise.
    pub async fn search_memory(&self, query: &str, top_k: usize) -> Result<Vec<SearchHit>> {
        match self.embedder.embed(query).await {
            Some(query_vec) => self.semantic_search(&query_vec, top_k),
            None => self.keyword_search(query, top_k),
        }
    }

    /// Formatted context string for system-prompt injection; empty when
    /// nothing was found.
    pub async fn get_relevant_context(&self, query: &str, top_k: usize) -> String {
        let hits = match self.search_memory(query, top_k).await {
            Ok(hits) => hits,
            Err(err) => {
                warn!(%err, "memory search failed");
                return String::new();
            }
        };
        hits.iter()
            .map(|hit| {
                let content: String = hit.content.chars().take(300).collect();
                format!("[{}] {}", hit.source.label(), content)
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    fn semantic_search(&self, query_vec: &[f32], top_k: usize) -> Result<Vec<SearchHit>> {
        let conn = self.lock_conn();
        let mut candidates: Vec<SearchHit> = Vec::new();

        let mut stmt = conn.prepare(
            "SELECT id, content, embedding FROM conversations WHERE embedding IS NOT NULL",
        )?;
        let conv_rows = stmt.query_map([], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, Vec<u8>>(2)?))
        })?;
        for row in conv_rows {
            let (id, content, blob) = row?;
            let score = Embedder::cosine(query_vec, &Embedder::from_bytes(&blob));
            candidates.push(SearchHit {
                source: SearchSource::Conversation,
                id,
                title: None,
                content,
                category: None,
                score,
            });
        }

        let mut stmt = conn.prepare(
            "SELECT id, title, content, category, embedding FROM knowledge WHERE embedding IS NOT NULL",
        )?;
        let know_rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Vec<u8>>(4)?,
            ))
        })?;
        for row in know_rows {
            let (id, title, content, category, blob) = row?;
            let score = Embedder::cosine(query_vec, &Embedder::from_bytes(&blob));
            candidates.push(SearchHit {
                source: SearchSource::Knowledge,
                id,
                content: format!("{title}: {content}"),
                title: Some(title),
                category: Some(category),
                score,
            });
        }

        // More recent rows win ties.
        candidates.sort_by(|a, b| b.score.total_cmp(&a.score).then(b.id.cmp(&a.id)));
        candidates.truncate(top_k);
        Ok(candidates)
    }

    fn keyword_search(&self, query: &str, top_k: usize) -> Result<Vec<SearchHit>> {
        let pattern = format!("%{query}%");
        let conn = self.lock_conn();
        let mut results: Vec<SearchHit> = Vec::new();

        let mut stmt = conn.prepare(
            "SELECT id, content FROM conversations WHERE content LIKE ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let conv_rows = stmt.query_map(params![pattern, top_k as i64], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;
        for row in conv_rows {
            let (id, content) = row?;
            results.push(SearchHit {
                source: SearchSource::Conversation,
                id,
                title: None,
                content,
                category: None,
                score: 0.0,
            });
        }

        let remaining = top_k.saturating_sub(results.len());
        if remaining > 0 {
            let mut stmt = conn.prepare(
                "SELECT id, title, content, category FROM knowledge
                 WHERE content LIKE ?1 OR title LIKE ?1 ORDER BY id DESC LIMIT ?2",
            )?;
            let know_rows = stmt.query_map(params![pattern, remaining as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?;
            for row in know_rows {
                let (id, title, content, category) = row?;
                results.push(SearchHit {
                    source: SearchSource::Knowledge,
                    id,
                    content: format!("{title}: {content}"),
                    title: Some(title),
                    category: Some(category),
                    score: 0.0,
                });
            }
        }

        Ok(results)
    }

    // ── Feedback (plain rows; the correction loop lives in feedback.rs) ──────

    pub fn save_feedback(&self, original_action: &str, correction: &str) -> Result<i64> {
        let conn = self.lock_conn();
        conn.execute(
            "INSERT INTO feedback (timestamp, original_action, correction, applied)
             VALUES (?1, ?2, ?3, 0)",
            params![Utc::now().to_rfc3339(), original_action, correction],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_pending_feedback(&self, limit: usize) -> Result<Vec<FeedbackRow>> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, original_action, correction
             FROM feedback WHERE applied = 0 ORDER BY id ASC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok(FeedbackRow {
                    id: row.get(0)?,
                    timestamp: row.get(1)?,
                    original_action: row.get(2)?,
                    correction: row.get(3)?,
                    category: None,
                    session_id: None,
                    score: 0.0,
                })
            })?
            .collect::<std::result::Result<_, _>>()?;
        Ok(rows)
    }

    // ── One-shot legacy migration ────────────────────────────────────────────

    /// Import a JSON-lines corrections log into the feedback table with
    /// `applied=1`. Malformed lines are skipped with a warning. Re-running on
    /// a partially-migrated database duplicates rows — the caller guards this.
    pub fn migrate_corrections(&self, jsonl_path: impl AsRef<Path>) -> Result<usize> {
        let path = jsonl_path.as_ref();
        if !path.exists() {
            info!(path = %path.display(), "no corrections log found; nothing to migrate");
            return Ok(0);
        }
        let raw = fs::read_to_string(path)?;

        let conn = self.lock_conn();
        let mut count = 0usize;
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let entry: serde_json::Value = match serde_json::from_str(line) {
                Ok(value) => value,
                Err(err) => {
                    warn!(%err, "skipping malformed corrections line");
                    continue;
                }
            };
            let original = format!(
                "[{}] {} → {}",
                entry.get("hash").and_then(|v| v.as_str()).unwrap_or(""),
                entry.get("subject").and_then(|v| v.as_str()).unwrap_or(""),
                entry.get("original_label").and_then(|v| v.as_str()).unwrap_or(""),
            );
            let correction = entry
                .get("corrected_label")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            let ts = entry
                .get("timestamp")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| Utc::now().to_rfc3339());
            conn.execute(
                "INSERT INTO feedback (timestamp, original_action, correction, applied)
                 VALUES (?1, ?2, ?3, 1)",
                params![ts, original, correction],
            )?;
            count += 1;
        }
        info!(count, path = %path.display(), "corrections migrated");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn store() -> MemoryStore {
        MemoryStore::open_in_memory(Embedder::unavailable()).unwrap()
    }

    #[tokio::test]
    async fn conversation_roundtrip_is_ordered_oldest_first() {
        let store = store();
        store.save_conversation("u1", "user", "first").await.unwrap();
        store.save_conversation("u1", "assistant", "second").await.unwrap();
        store.save_conversation("u2", "user", "other session").await.unwrap();

        let recent = store.get_recent("u1", 10).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].content, "first");
        assert_eq!(recent[1].role, "assistant");
    }

    #[tokio::test]
    async fn keyword_fallback_finds_both_tables() {
        let store = store();
        store.save_conversation("u1", "user", "talking about MoS2 band gaps").await.unwrap();
        store
            .save_knowledge("research", "valley", "MoS2 valley polarization", "obsidian", &[])
            .await
            .unwrap();

        let hits = store.search_memory("MoS2", 5).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().any(|h| h.source == SearchSource::Conversation));
        assert!(hits.iter().any(|h| h.source == SearchSource::Knowledge));
        assert!(hits.iter().all(|h| h.score == 0.0));
    }

    #[tokio::test]
    async fn knowledge_hit_content_is_title_prefixed() {
        let store = store();
        store
            .save_knowledge("research", "valley", "polarization notes", "obsidian", &[])
            .await
            .unwrap();
        let hits = store.search_memory("polarization", 3).await.unwrap();
        assert_eq!(hits[0].content, "valley: polarization notes");
    }

    #[tokio::test]
    async fn relevant_context_formats_source_labels() {
        let store = store();
        store.save_conversation("u1", "user", "MoS2 monolayer question").await.unwrap();
        let context = store.get_relevant_context("MoS2", 3).await;
        assert!(context.starts_with("[conversation] "));
    }

    #[tokio::test]
    async fn relevant_context_is_empty_without_hits() {
        let store = store();
        assert_eq!(store.get_relevant_context("nothing here", 3).await, "");
    }

    #[tokio::test]
    async fn knowledge_content_is_capped() {
        let store = store();
        let long = "x".repeat(5000);
        store.save_knowledge("reference", "big", &long, "manual", &[]).await.unwrap();
        let hits = store.search_memory("xxx", 1).await.unwrap();
        assert!(hits[0].content.len() <= MAX_KNOWLEDGE_CONTENT + "big: ".len());
    }

    #[test]
    fn pending_feedback_is_ascending_and_unapplied_only() {
        let store = store();
        store.save_feedback("a", "fix a").unwrap();
        store.save_feedback("b", "fix b").unwrap();
        let pending = store.get_pending_feedback(10).unwrap();
        assert_eq!(pending.len(), 2);
        assert!(pending[0].id < pending[1].id);
    }

    #[test]
    fn migration_skips_malformed_lines() {
        let store = store();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "{}",
            r#"{"hash":"h1","subject":"Re: seminar","original_label":"FYI","corrected_label":"ACTION","timestamp":"2025-01-01T00:00:00"}"#
        )
        .unwrap();
        writeln!(file, "not json at all").unwrap();
        writeln!(
            file,
            "{}",
            r#"{"hash":"h2","subject":"Deal","original_label":"ACTION","corrected_label":"FYI"}"#
        )
        .unwrap();

        let count = store.migrate_corrections(file.path()).unwrap();
        assert_eq!(count, 2);
        // Migrated rows are applied=1, so nothing shows as pending.
        assert!(store.get_pending_feedback(10).unwrap().is_empty());
    }

    #[test]
    fn migration_of_missing_file_is_zero() {
        let store = store();
        assert_eq!(store.migrate_corrections("/nonexistent/corrections.jsonl").unwrap(), 0);
    }
}
