//! Read-only indexer for an Obsidian-style markdown vault.
//!
//! Scans `*.md` notes, parses frontmatter/wikilinks/tags with a minimal
//! in-house parser, strips markdown for cleaner embedding content, and
//! indexes notes into the knowledge table. A JSON index file keyed by
//! absolute note path makes re-indexing incremental.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::embedder::Embedder;
use crate::store::{MAX_KNOWLEDGE_CONTENT, MemoryStore};

/// Directories never scanned.
const SKIP_DIRS: &[&str] = &[".obsidian", ".trash", "99_System", "node_modules", ".git"];

/// Notes below this size are stubs and skipped.
const MIN_FILE_SIZE: u64 = 1024;

/// Folder-prefix → category rules, checked in order.
const FOLDER_CATEGORY_MAP: &[(&str, &str)] = &[
    ("30_Resources/Foundations/Physics", "research"),
    ("30_Resources/Foundations", "research"),
    ("30_Resources", "reference"),
    ("20_Areas", "reference"),
    ("10_Projects", "research"),
    ("40_Archives", "reference"),
    ("Borealis/Papers", "research"),
    ("Borealis/Research", "research"),
];

static WIKILINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[\[([^\]|]+?)(?:\|([^\]]+))?\]\]").unwrap());
static INLINE_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)(?:^|\s)#([a-zA-Z가-힣][\w가-힣/\-]*)").unwrap());
static HEADING: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^#+\s+").unwrap());
static EMPHASIS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\*{1,3}([^*]+)\*{1,3}").unwrap());
static IMAGE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"!\[[^\]]*\]\([^)]+\)").unwrap());
static MD_LINK: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[([^\]]+)\]\([^)]+\)").unwrap());
static HTML_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").unwrap());
static BLANK_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{3,}").unwrap());

#[derive(Debug, Clone)]
pub struct NoteInfo {
    pub path: PathBuf,
    pub title: String,
    pub modified_time: f64,
    pub size: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedNote {
    pub title: String,
    pub frontmatter: HashMap<String, FrontmatterValue>,
    pub content: String,
    pub links: Vec<String>,
    pub tags: Vec<String>,
    pub path: PathBuf,
}

/// Values the minimal frontmatter parser produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrontmatterValue {
    Scalar(String),
    List(Vec<String>),
}

impl FrontmatterValue {
    pub fn as_scalar(&self) -> Option<&str> {
        match self {
            FrontmatterValue::Scalar(s) => Some(s),
            FrontmatterValue::List(_) => None,
        }
    }

    pub fn as_list(&self) -> Vec<String> {
        match self {
            FrontmatterValue::Scalar(s) => vec![s.clone()],
            FrontmatterValue::List(items) => items.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexStats {
    pub total: usize,
    pub new: usize,
    pub updated: usize,
    pub skipped: usize,
    pub errors: usize,
}

#[derive(Debug, Clone)]
pub struct VaultHit {
    pub id: i64,
    pub title: String,
    pub content: String,
    pub category: String,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
    indexed_time: f64,
    title: String,
    knowledge_id: i64,
}

pub struct VaultIndexer {
    store: Arc<MemoryStore>,
    vault_path: PathBuf,
    vault_name: String,
    index_path: PathBuf,
}

impl VaultIndexer {
    pub fn new(
        store: Arc<MemoryStore>,
        vault_path: impl Into<PathBuf>,
        vault_name: impl Into<String>,
        index_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            vault_path: vault_path.into(),
            vault_name: vault_name.into(),
            index_path: index_path.into(),
        }
    }

    // ── Scanning ─────────────────────────────────────────────────────────────

    /// All indexable notes in the vault, or empty when the vault is missing.
    pub fn scan_vault(&self) -> Vec<NoteInfo> {
        let vault_dir = self.vault_path.join(&self.vault_name);
        if !vault_dir.exists() {
            warn!(vault = %vault_dir.display(), "vault not found");
            return Vec::new();
        }

        let mut results = Vec::new();
        for entry in WalkDir::new(&vault_dir)
            .into_iter()
            .filter_entry(|e| {
                !e.file_name()
                    .to_str()
                    .is_some_and(|name| SKIP_DIRS.contains(&name))
            })
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            let Ok(meta) = entry.metadata() else { continue };
            if meta.len() < MIN_FILE_SIZE {
                continue;
            }
            let modified_time = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0);
            results.push(NoteInfo {
                path: path.to_path_buf(),
                title: path.file_stem().and_then(|s| s.to_str()).unwrap_or("").to_string(),
                modified_time,
                size: meta.len(),
            });
        }

        info!(vault = %self.vault_name, notes = results.len(), "vault scanned");
        results
    }

    // ── Parsing ──────────────────────────────────────────────────────────────

    pub fn parse_note(&self, path: &Path) -> ParsedNote {
        let title = path.file_stem().and_then(|s| s.to_str()).unwrap_or("").to_string();
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(path = %path.display(), %err, "failed to read note");
                return ParsedNote { title, path: path.to_path_buf(), ..Default::default() };
            }
        };

        let (frontmatter, body) = split_frontmatter(&raw);

        let links: Vec<String> = WIKILINK
            .captures_iter(body)
            .map(|caps| caps[1].to_string())
            .collect();

        let mut tags: Vec<String> = INLINE_TAG
            .captures_iter(body)
            .map(|caps| caps[1].to_string())
            .collect();
        if let Some(fm_tags) = frontmatter.get("tags") {
            tags.extend(fm_tags.as_list());
        }
        tags.sort();
        tags.dedup();

        let clean: String = strip_markdown(body).chars().take(MAX_KNOWLEDGE_CONTENT).collect();

        ParsedNote {
            title,
            frontmatter,
            content: clean,
            links,
            tags,
            path: path.to_path_buf(),
        }
    }

    // ── Category inference ───────────────────────────────────────────────────

    pub fn infer_category(path: &Path, frontmatter: &HashMap<String, FrontmatterValue>) -> String {
        if let Some(category) = frontmatter.get("category").and_then(|v| v.as_scalar()) {
            if !category.is_empty() {
                return category.to_string();
            }
        }
        let path_str = path.to_string_lossy();
        for (prefix, category) in FOLDER_CATEGORY_MAP {
            if path_str.contains(prefix) {
                return (*category).to_string();
            }
        }
        "reference".to_string()
    }

    // ── Indexing ─────────────────────────────────────────────────────────────

    /// Index all notes. `force` ignores the incremental index; `progress` (if
    /// given) is called roughly every ten notes with `(current, total)`.
    pub async fn index_vault(
        &self,
        force: bool,
        progress: Option<&(dyn Fn(usize, usize) + Send + Sync)>,
    ) -> IndexStats {
        let notes = self.scan_vault();
        let mut index = if force { HashMap::new() } else { self.load_index() };

        let mut stats = IndexStats { total: notes.len(), ..Default::default() };

        for (i, note) in notes.iter().enumerate() {
            if let Some(callback) = progress {
                if i % 10 == 0 || i + 1 == notes.len() {
                    callback(i + 1, notes.len());
                }
            }

            let key = note.path.to_string_lossy().to_string();
            let previously_indexed = index.contains_key(&key);
            if !force {
                if let Some(entry) = index.get(&key) {
                    if note.modified_time <= entry.indexed_time {
                        stats.skipped += 1;
                        continue;
                    }
                }
            }

            let parsed = self.parse_note(&note.path);
            if parsed.content.is_empty() {
                stats.skipped += 1;
                continue;
            }

            let category = Self::infer_category(&parsed.path, &parsed.frontmatter);
            match self
                .store
                .save_knowledge(&category, &parsed.title, &parsed.content, "obsidian", &parsed.tags)
                .await
            {
                Ok(knowledge_id) => {
                    if previously_indexed {
                        stats.updated += 1;
                    } else {
                        stats.new += 1;
                    }
                    index.insert(
                        key,
                        IndexEntry {
                            indexed_time: unix_now(),
                            title: parsed.title,
                            knowledge_id,
                        },
                    );
                }
                Err(err) => {
                    warn!(title = %parsed.title, %err, "failed to index note");
                    stats.errors += 1;
                }
            }
        }

        self.save_index(&index);
        info!(
            total = stats.total,
            new = stats.new,
            updated = stats.updated,
            skipped = stats.skipped,
            errors = stats.errors,
            "vault indexing complete"
        );
        stats
    }

    // ── Search ───────────────────────────────────────────────────────────────

    /// Search only vault-indexed knowledge (`source='obsidian'`).
    pub async fn search_vault_knowledge(&self, query: &str, top_k: usize) -> Result<Vec<VaultHit>> {
        match self.store.embedder().embed(query).await {
            Some(query_vec) => self.semantic_vault_search(&query_vec, top_k),
            None => self.keyword_vault_search(query, top_k),
        }
    }

    fn semantic_vault_search(&self, query_vec: &[f32], top_k: usize) -> Result<Vec<VaultHit>> {
        let conn = self.store.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT id, title, content, category, embedding FROM knowledge
             WHERE source = 'obsidian' AND embedding IS NOT NULL",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                VaultHit {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    content: row.get(2)?,
                    category: row.get(3)?,
                    score: 0.0,
                },
                row.get::<_, Vec<u8>>(4)?,
            ))
        })?;

        let mut candidates: Vec<VaultHit> = Vec::new();
        for row in rows {
            let (mut hit, blob) = row?;
            hit.score = Embedder::cosine(query_vec, &Embedder::from_bytes(&blob));
            candidates.push(hit);
        }
        candidates.sort_by(|a, b| b.score.total_cmp(&a.score).then(b.id.cmp(&a.id)));
        candidates.truncate(top_k);
        Ok(candidates)
    }

    fn keyword_vault_search(&self, query: &str, top_k: usize) -> Result<Vec<VaultHit>> {
        let pattern = format!("%{query}%");
        let conn = self.store.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT id, title, content, category FROM knowledge
             WHERE source = 'obsidian' AND (content LIKE ?1 OR title LIKE ?1)
             ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(rusqlite::params![pattern, top_k as i64], |row| {
                Ok(VaultHit {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    content: row.get(2)?,
                    category: row.get(3)?,
                    score: 0.0,
                })
            })?
            .collect::<std::result::Result<_, _>>()?;
        Ok(rows)
    }

    // ── Index file ───────────────────────────────────────────────────────────

    fn load_index(&self) -> HashMap<String, IndexEntry> {
        let Ok(raw) = fs::read_to_string(&self.index_path) else {
            return HashMap::new();
        };
        match serde_json::from_str(&raw) {
            Ok(index) => index,
            Err(err) => {
                warn!(%err, "failed to load vault index");
                HashMap::new()
            }
        }
    }

    fn save_index(&self, index: &HashMap<String, IndexEntry>) {
        if let Some(parent) = self.index_path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        match serde_json::to_string_pretty(index) {
            Ok(rendered) => {
                if let Err(err) = fs::write(&self.index_path, rendered) {
                    warn!(%err, "failed to save vault index");
                }
            }
            Err(err) => warn!(%err, "failed to serialise vault index"),
        }
    }

    /// `(indexed note count, last index time as unix secs)` from the index file.
    pub fn index_stats(&self) -> (usize, Option<f64>) {
        let index = self.load_index();
        let last = index
            .values()
            .map(|e| e.indexed_time)
            .fold(None, |acc: Option<f64>, t| Some(acc.map_or(t, |a| a.max(t))));
        (index.len(), last)
    }
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

// ── Frontmatter ──────────────────────────────────────────────────────────────

/// Split a leading `---\n...\n---\n` block off the note. Returns the parsed
/// frontmatter and the remaining body.
fn split_frontmatter(raw: &str) -> (HashMap<String, FrontmatterValue>, &str) {
    let Some(rest) = raw.strip_prefix("---") else {
        return (HashMap::new(), raw);
    };
    let Some(end) = rest.find("\n---") else {
        return (HashMap::new(), raw);
    };
    let yaml = &rest[..end];
    let mut body = &rest[end + 4..];
    if let Some(stripped) = body.strip_prefix('\n') {
        body = stripped;
    }
    (parse_yaml_simple(yaml), body)
}

/// Minimal YAML subset: `key: value`, quoted strings, inline `[a, b]` lists,
/// and multi-line `- item` sequences. Comments and unknown shapes are ignored.
fn parse_yaml_simple(yaml: &str) -> HashMap<String, FrontmatterValue> {
    let mut result: HashMap<String, FrontmatterValue> = HashMap::new();
    let mut current_key: Option<String> = None;

    for line in yaml.lines() {
        let stripped = line.trim();
        if stripped.is_empty() || stripped.starts_with('#') {
            continue;
        }

        // List item under the current key
        if let Some(item) = stripped.strip_prefix("- ") {
            if let Some(key) = &current_key {
                let item = unquote(item.trim()).to_string();
                match result.get_mut(key) {
                    Some(FrontmatterValue::List(items)) => items.push(item),
                    _ => {
                        result.insert(key.clone(), FrontmatterValue::List(vec![item]));
                    }
                }
            }
            continue;
        }

        let Some((key, value)) = stripped.split_once(':') else {
            continue;
        };
        let key = key.trim().to_string();
        let value = value.trim();
        current_key = Some(key.clone());

        if let Some(inner) = value.strip_prefix('[').and_then(|v| v.strip_suffix(']')) {
            let items = inner
                .split(',')
                .map(|item| unquote(item.trim()).to_string())
                .filter(|item| !item.is_empty())
                .collect();
            result.insert(key, FrontmatterValue::List(items));
        } else {
            result.insert(key, FrontmatterValue::Scalar(unquote(value).to_string()));
        }
    }

    result
}

fn unquote(value: &str) -> &str {
    value
        .trim()
        .trim_matches('"')
        .trim_matches('\'')
}

// ── Markdown stripping ───────────────────────────────────────────────────────

/// Remove markdown formatting for cleaner embedding content.
fn strip_markdown(text: &str) -> String {
    let text = HEADING.replace_all(text, "");
    let text = EMPHASIS.replace_all(&text, "$1");
    let text = WIKILINK.replace_all(&text, |caps: &regex::Captures<'_>| {
        caps.get(2).or_else(|| caps.get(1)).map(|m| m.as_str().to_string()).unwrap_or_default()
    });
    let text = IMAGE.replace_all(&text, "");
    let text = MD_LINK.replace_all(&text, "$1");
    let text = HTML_TAG.replace_all(&text, "");
    let text = BLANK_RUN.replace_all(&text, "\n\n");
    text.trim().to_string()
}
