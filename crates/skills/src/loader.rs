//! Skill manifest parsing.
//!
//! Frontmatter is parsed with a minimal in-house YAML subset (scalars,
//! quoted strings, inline lists). Missing triggers and required tools are
//! synthesised from the description so sparse manifests still match.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use tracing::warn;
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkillSource {
    Internal,
    External,
}

#[derive(Debug, Clone)]
pub struct Skill {
    pub name: String,
    pub description: String,
    pub version: String,
    pub category: String,
    pub triggers: Vec<String>,
    pub tool_chain: Vec<String>,
    pub tools_required: Vec<String>,
    pub requires_tool: bool,
    pub strict_mode: bool,
    pub source: SkillSource,
    /// Prompt text injected into the system prompt when the skill matches.
    pub prompt: String,
}

static TRIGGER_KO: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Use when\s*사용자가\s*(.+?)\s*관련 질문을 할 때").unwrap());
static TRIGGER_EN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)Use when\s*(?:the\s+)?users?\s*asks?\s*(?:about|for|regarding)\s*(.+?)(?:\.|$)").unwrap()
});
static TRIGGER_EG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\((?:e\.g\.,?|예:)\s*([^)]+)\)").unwrap());
static CONTENT_WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z0-9_+\-\.#가-힣]{2,}").unwrap());
static TOOLS_KO: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"필요 도구:\s*([^.\n]+)").unwrap());
static TOOLS_EN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)Required tools:\s*([^.\n]+)").unwrap());

const TRIGGER_STOPWORDS: &[&str] = &[
    "use", "when", "user", "users", "asks", "ask", "about", "for", "related", "question",
    "questions", "the", "and", "or", "사용자가", "관련", "질문", "할", "때", "도구", "필요",
];

/// Load every `*.md` skill in a directory (README.md excluded).
pub fn load_internal_skills(skills_dir: &str) -> Vec<Skill> {
    let dir = Path::new(skills_dir);
    if !dir.exists() {
        return Vec::new();
    }

    let mut paths: Vec<PathBuf> = match fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.extension().and_then(|e| e.to_str()) == Some("md")
                    && p.file_name().and_then(|n| n.to_str()) != Some("README.md")
            })
            .collect(),
        Err(_) => return Vec::new(),
    };
    paths.sort();

    paths
        .into_iter()
        .filter_map(|path| match fs::read_to_string(&path) {
            Ok(content) => parse_skill(&path, &content, SkillSource::Internal),
            Err(err) => {
                warn!(path = %path.display(), %err, "failed to read skill");
                None
            }
        })
        .collect()
}

/// Load every `SKILL.md` under the given search roots. `~` expands to $HOME.
/// Duplicated paths (e.g. a root listed twice) load once.
pub fn load_external_skills(search_paths: &[String]) -> Vec<Skill> {
    let mut loaded = Vec::new();
    let mut seen: Vec<PathBuf> = Vec::new();

    for raw in search_paths {
        let base = expand_home(raw);
        if !base.exists() {
            continue;
        }

        let mut candidates: Vec<PathBuf> = Vec::new();
        if base.join("SKILL.md").exists() {
            candidates.push(base.join("SKILL.md"));
        } else {
            for entry in WalkDir::new(&base).into_iter().filter_map(|e| e.ok()) {
                if entry.file_type().is_file() && entry.file_name() == "SKILL.md" {
                    candidates.push(entry.path().to_path_buf());
                }
            }
        }

        for path in candidates {
            let canonical = path.canonicalize().unwrap_or_else(|_| path.clone());
            if seen.contains(&canonical) {
                continue;
            }
            seen.push(canonical);
            match fs::read_to_string(&path) {
                Ok(content) => {
                    if let Some(skill) = parse_skill(&path, &content, SkillSource::External) {
                        loaded.push(skill);
                    }
                }
                Err(err) => warn!(path = %path.display(), %err, "failed to read external skill"),
            }
        }
    }

    loaded
}

fn expand_home(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return Path::new(&home).join(rest);
        }
    }
    PathBuf::from(raw)
}

/// Parse one manifest. Manifests without any frontmatter are skipped with a
/// warning rather than failing the scan.
fn parse_skill(path: &Path, content: &str, source: SkillSource) -> Option<Skill> {
    let (header, body) = parse_frontmatter(content);
    if header.is_empty() {
        warn!(path = %path.display(), "skill has no frontmatter; skipping");
        return None;
    }

    let fallback_name = match source {
        // External skills default to their directory name.
        SkillSource::External => path
            .parent()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .unwrap_or("")
            .to_string(),
        SkillSource::Internal => path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("")
            .to_string(),
    };
    let name = header
        .get("name")
        .map(|v| v.join(""))
        .filter(|v| !v.is_empty())
        .unwrap_or(fallback_name);
    let description = header.get("description").map(|v| v.join("")).unwrap_or_default();

    let mut triggers = header.get("triggers").cloned().unwrap_or_default();
    if triggers.is_empty() {
        triggers = extract_trigger_keywords(&description);
    }

    let mut tools_required = header.get("tools_required").cloned().unwrap_or_default();
    if tools_required.is_empty() {
        tools_required = extract_tools_from_description(&description);
    }

    let tool_chain = header
        .get("tool_chain")
        .map(|values| {
            if values.len() == 1 {
                split_items(&values[0])
            } else {
                values.clone()
            }
        })
        .unwrap_or_default();

    let mut requires_tool = header
        .get("requires_tool")
        .map(|v| as_bool(&v.join("")))
        .unwrap_or(false);
    let strict_mode = header
        .get("strict_mode")
        .map(|v| as_bool(&v.join("")))
        .unwrap_or(requires_tool);

    if requires_tool && tool_chain.is_empty() && tools_required.is_empty() {
        warn!(skill = %name, "requires_tool without any tools; clearing the flag");
        requires_tool = false;
    }

    Some(Skill {
        name,
        description,
        version: header.get("version").map(|v| v.join("")).unwrap_or_default(),
        category: header.get("category").map(|v| v.join("")).unwrap_or_default(),
        triggers,
        tool_chain,
        tools_required,
        requires_tool,
        strict_mode,
        source,
        prompt: extract_prompt_sections(body),
    })
}

// ── Frontmatter ──────────────────────────────────────────────────────────────

/// Returns (header, body). Every header value is a list; scalars are
/// single-element lists.
fn parse_frontmatter(content: &str) -> (HashMap<String, Vec<String>>, &str) {
    let Some(rest) = content.strip_prefix("---") else {
        return (HashMap::new(), content);
    };
    let Some(end) = rest.find("\n---") else {
        return (HashMap::new(), content);
    };
    let yaml = &rest[..end];
    let body = rest[end + 4..].trim_start_matches('\n');

    let mut header: HashMap<String, Vec<String>> = HashMap::new();
    let mut current_key: Option<String> = None;
    for line in yaml.lines() {
        let stripped = line.trim();
        if stripped.is_empty() || stripped.starts_with('#') {
            continue;
        }
        if let Some(item) = stripped.strip_prefix("- ") {
            if let Some(key) = &current_key {
                header.entry(key.clone()).or_default().push(unquote(item).to_string());
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
            let items: Vec<String> = inner
                .split(',')
                .map(|item| unquote(item.trim()).to_string())
                .filter(|item| !item.is_empty())
                .collect();
            header.insert(key, items);
        } else if !value.is_empty() {
            header.insert(key, vec![unquote(value).to_string()]);
        } else {
            header.insert(key, Vec::new());
        }
    }

    (header, body)
}

fn unquote(value: &str) -> &str {
    value.trim().trim_matches('"').trim_matches('\'')
}

fn as_bool(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "true" | "1" | "yes" | "y" | "on")
}

// ── Synthesis from the description ───────────────────────────────────────────

/// Triggers from the description: "Use when ..." phrasing first, then an
/// "(e.g., ...)" parenthetical, then a stopword-filtered bag of words.
pub fn extract_trigger_keywords(description: &str) -> Vec<String> {
    if description.is_empty() {
        return Vec::new();
    }

    for pattern in [&*TRIGGER_KO, &*TRIGGER_EN] {
        if let Some(caps) = pattern.captures(description) {
            return split_items(&caps[1]);
        }
    }
    if let Some(caps) = TRIGGER_EG.captures(description) {
        return split_items(&caps[1]);
    }

    let mut seen: Vec<String> = Vec::new();
    let mut out: Vec<String> = Vec::new();
    for word in CONTENT_WORD.find_iter(description) {
        let token = word.as_str().trim();
        let key = token.to_lowercase();
        if token.is_empty() || TRIGGER_STOPWORDS.contains(&key.as_str()) || seen.contains(&key) {
            continue;
        }
        seen.push(key);
        out.push(token.to_string());
        if out.len() == 10 {
            break;
        }
    }
    out
}

/// Required tools from a "필요 도구: ..." / "Required tools: ..." line.
pub fn extract_tools_from_description(description: &str) -> Vec<String> {
    for pattern in [&*TOOLS_KO, &*TOOLS_EN] {
        if let Some(caps) = pattern.captures(description) {
            return split_items(&caps[1]);
        }
    }
    Vec::new()
}

/// Split comma-ish separated text ("a, b 및 c / d and e") into clean items.
fn split_items(text: &str) -> Vec<String> {
    let normalized = text.replace('및', ",").replace(" and ", ",").replace('/', ",");
    let mut out: Vec<String> = Vec::new();
    let mut seen: Vec<String> = Vec::new();
    for part in normalized.split(',') {
        let cleaned = part.trim_matches(|c: char| c.is_whitespace() || ".:;\"'".contains(c));
        if cleaned.is_empty() {
            continue;
        }
        let key = cleaned.to_lowercase();
        if seen.contains(&key) {
            continue;
        }
        seen.push(key);
        out.push(cleaned.to_string());
    }
    out
}

// ── Prompt extraction ────────────────────────────────────────────────────────

/// Concatenate the `## Prompt` and `## Few-shot Examples` sections
/// (case-insensitive); `Validation` and `Changelog` stay out of the token
/// budget. A body without any of those sections is injected whole.
fn extract_prompt_sections(body: &str) -> String {
    let include = ["prompt", "few-shot examples"];

    let mut sections: Vec<String> = Vec::new();
    let mut current_name: Option<String> = None;
    let mut current_lines: Vec<&str> = Vec::new();

    let mut flush = |name: &Option<String>, lines: &[&str], sections: &mut Vec<String>| {
        if let Some(name) = name {
            if include.contains(&name.to_lowercase().as_str()) {
                sections.push(lines.join("\n"));
            }
        }
    };

    for line in body.lines() {
        if let Some(header) = line.strip_prefix("## ") {
            flush(&current_name, &current_lines, &mut sections);
            current_name = Some(header.trim().to_string());
            current_lines = vec![line];
        } else {
            current_lines.push(line);
        }
    }
    flush(&current_name, &current_lines, &mut sections);

    if sections.is_empty() {
        body.trim().to_string()
    } else {
        sections.join("\n\n").trim().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn triggers_from_korean_use_when_phrase() {
        let triggers =
            extract_trigger_keywords("Use when 사용자가 논문, arxiv 관련 질문을 할 때 사용.");
        assert_eq!(triggers, vec!["논문", "arxiv"]);
    }

    #[test]
    fn triggers_from_english_use_when_phrase() {
        let triggers = extract_trigger_keywords("Use when user asks about hpc jobs, vasp.");
        assert_eq!(triggers, vec!["hpc jobs", "vasp"]);
    }

    #[test]
    fn triggers_from_example_parenthetical() {
        let triggers = extract_trigger_keywords("Handles mail triage (e.g., digest, urgent mail).");
        assert_eq!(triggers, vec!["digest", "urgent mail"]);
    }

    #[test]
    fn triggers_fall_back_to_content_words() {
        let triggers = extract_trigger_keywords("Calendar briefing and schedule summary");
        assert!(triggers.contains(&"Calendar".to_string()));
        assert!(triggers.contains(&"schedule".to_string()));
        assert!(!triggers.iter().any(|t| t.eq_ignore_ascii_case("and")));
    }

    #[test]
    fn tools_extracted_from_description_line() {
        let tools = extract_tools_from_description("메일 정리 스킬. 필요 도구: fetch_mail_digest, propose_mail_actions.");
        assert_eq!(tools, vec!["fetch_mail_digest", "propose_mail_actions"]);
        let tools = extract_tools_from_description("Required tools: search_arxiv and download_paper_pdf");
        assert_eq!(tools, vec!["search_arxiv", "download_paper_pdf"]);
    }

    #[test]
    fn requires_tool_without_tools_is_cleared() {
        let manifest = "---\nname: broken\ndescription: something\nrequires_tool: true\n---\nbody";
        let skill = parse_skill(Path::new("broken.md"), manifest, SkillSource::Internal).unwrap();
        assert!(!skill.requires_tool);
    }

    #[test]
    fn body_without_known_sections_is_used_whole() {
        assert_eq!(extract_prompt_sections("just instructions"), "just instructions");
    }

    #[test]
    fn frontmatterless_file_is_skipped() {
        assert!(parse_skill(Path::new("x.md"), "no frontmatter here", SkillSource::Internal).is_none());
    }

    #[test]
    fn tool_chain_string_is_split() {
        let manifest = "---\nname: chain\ndescription: d\ntool_chain: search_arxiv, download_paper_pdf\nrequires_tool: true\n---\nbody";
        let skill = parse_skill(Path::new("chain.md"), manifest, SkillSource::Internal).unwrap();
        assert_eq!(skill.tool_chain, vec!["search_arxiv", "download_paper_pdf"]);
        assert!(skill.requires_tool);
        assert!(skill.strict_mode);
    }
}
