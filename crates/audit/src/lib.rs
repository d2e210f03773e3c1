//! Append-only audit trail for agent actions.
//!
//! Every tool invocation and approval decision becomes one immutable row.
//! Corrections are new rows referencing older thoughts — nothing is ever
//! edited in place.

use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{Connection, params};
use serde::Serialize;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS traces (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT,
    thought TEXT,
    tool TEXT,
    args TEXT,
    result TEXT,
    approval_level TEXT,
    approved_by TEXT,
    session_id TEXT
);
";

#[derive(Debug, Clone, Serialize)]
pub struct TraceRow {
    pub id: i64,
    pub timestamp: String,
    pub thought: String,
    pub tool: String,
    /// JSON text of the tool arguments.
    pub args: String,
    pub result: String,
    pub approval_level: String,
    pub approved_by: String,
    pub session_id: String,
}

pub struct TraceLogger {
    conn: Mutex<Connection>,
}

impl TraceLogger {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("opening trace db at {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Insert one trace record with a fresh UTC timestamp.
    pub fn log(
        &self,
        thought: &str,
        tool: &str,
        args: &serde_json::Value,
        result: &str,
        approval_level: &str,
        approved_by: &str,
        session_id: &str,
    ) -> Result<i64> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO traces
             (timestamp, thought, tool, args, result, approval_level, approved_by, session_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                Utc::now().to_rfc3339(),
                thought,
                tool,
                args.to_string(),
                result,
                approval_level,
                approved_by,
                session_id,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn by_session(&self, session_id: &str, limit: usize) -> Result<Vec<TraceRow>> {
        self.query(
            "SELECT * FROM traces WHERE session_id = ?1 ORDER BY id DESC LIMIT ?2",
            params![session_id, limit as i64],
        )
    }

    pub fn by_tool(&self, tool: &str, limit: usize) -> Result<Vec<TraceRow>> {
        self.query(
            "SELECT * FROM traces WHERE tool = ?1 ORDER BY id DESC LIMIT ?2",
            params![tool, limit as i64],
        )
    }

    /// Rows between two ISO-8601 bounds, inclusive, oldest first.
    pub fn by_date_range(&self, start: &str, end: &str) -> Result<Vec<TraceRow>> {
        self.query(
            "SELECT * FROM traces WHERE timestamp BETWEEN ?1 AND ?2 ORDER BY id ASC",
            params![start, end],
        )
    }

    pub fn recent(&self, limit: usize) -> Result<Vec<TraceRow>> {
        self.query(
            "SELECT * FROM traces ORDER BY id DESC LIMIT ?1",
            params![limit as i64],
        )
    }

    /// Full export as a JSON array, optionally scoped to one session.
    pub fn export_json(&self, session_id: Option<&str>) -> Result<String> {
        let rows = match session_id {
            Some(session) => self.query(
                "SELECT * FROM traces WHERE session_id = ?1 ORDER BY id ASC",
                params![session],
            )?,
            None => self.query("SELECT * FROM traces ORDER BY id ASC", params![])?,
        };
        Ok(serde_json::to_string_pretty(&rows)?)
    }

    fn query(&self, sql: &str, args: impl rusqlite::Params) -> Result<Vec<TraceRow>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(args, |row| {
                Ok(TraceRow {
                    id: row.get("id")?,
                    timestamp: row.get("timestamp")?,
                    thought: row.get("thought")?,
                    tool: row.get("tool")?,
                    args: row.get("args")?,
                    result: row.get("result")?,
                    approval_level: row.get("approval_level")?,
                    approved_by: row.get("approved_by")?,
                    session_id: row.get("session_id")?,
                })
            })?
            .collect::<std::result::Result<_, _>>()?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn logger_with_rows() -> TraceLogger {
        let logger = TraceLogger::open_in_memory().unwrap();
        logger
            .log("search papers", "search_arxiv", &json!({"query": "MoS2"}), "{\"count\":3}", "AUTO", "", "u1")
            .unwrap();
        logger
            .log("download", "download_paper_pdf", &json!({"pdf_url": "u"}), "denied", "CONFIRM", "user", "u1")
            .unwrap();
        logger
            .log("other session", "search_arxiv", &json!({}), "{}", "AUTO", "", "u2")
            .unwrap();
        logger
    }

    #[test]
    fn by_session_is_descending() {
        let logger = logger_with_rows();
        let rows = logger.by_session("u1", 10).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].id > rows[1].id);
        assert_eq!(rows[0].tool, "download_paper_pdf");
    }

    #[test]
    fn by_tool_filters() {
        let logger = logger_with_rows();
        let rows = logger.by_tool("search_arxiv", 10).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.tool == "search_arxiv"));
    }

    #[test]
    fn date_range_is_ascending_and_inclusive() {
        let logger = logger_with_rows();
        let rows = logger.by_date_range("2000-01-01T00:00:00Z", "2100-01-01T00:00:00Z").unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.windows(2).all(|w| w[0].id < w[1].id));
    }

    #[test]
    fn args_are_stored_as_json_text() {
        let logger = logger_with_rows();
        let rows = logger.by_tool("download_paper_pdf", 1).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&rows[0].args).unwrap();
        assert_eq!(parsed["pdf_url"], "u");
    }

    #[test]
    fn export_is_a_json_array() {
        let logger = logger_with_rows();
        let all: serde_json::Value = serde_json::from_str(&logger.export_json(None).unwrap()).unwrap();
        assert_eq!(all.as_array().unwrap().len(), 3);
        let scoped: serde_json::Value =
            serde_json::from_str(&logger.export_json(Some("u2")).unwrap()).unwrap();
        assert_eq!(scoped.as_array().unwrap().len(), 1);
    }

    #[test]
    fn recent_returns_newest_first() {
        let logger = logger_with_rows();
        let rows = logger.recent(2).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].session_id, "u2");
    }
}
