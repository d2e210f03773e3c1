//! Access to the user-owned master prompt file.
//!
//! The file is plain markdown with `## SECTION_NAME` headers (00_PERSONA,
//! 00_CORE, 99_SYSTEM, 99_CURRENT_CONTEXT, ...). Sections are injected into
//! the system prompt and updated by the fact extractor. Read-modify-write is
//! serialised within this process; cross-process coordination is out of scope.

use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::Result;
use tracing::debug;

pub struct MasterPrompt {
    path: PathBuf,
    write_guard: Mutex<()>,
}

impl MasterPrompt {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), write_guard: Mutex::new(()) }
    }

    /// Whole file, or empty string when it does not exist.
    pub fn read_all(&self) -> String {
        fs::read_to_string(&self.path).unwrap_or_default()
    }

    /// A single `## name` section including its header line, or `None` when
    /// the file or section is missing. `name` matches as a prefix, so
    /// `00_PERSONA` finds `## 00_PERSONA — persona` too.
    pub fn read_section(&self, name: &str) -> Option<String> {
        let content = self.read_all();
        if content.is_empty() {
            return None;
        }

        let mut lines = content.lines();
        let mut section: Vec<&str> = Vec::new();
        let mut in_section = false;
        for line in lines.by_ref() {
            if let Some(header) = line.strip_prefix("## ") {
                if in_section {
                    break;
                }
                if header.trim_start().starts_with(name) {
                    in_section = true;
                    section.push(line);
                }
            } else if in_section {
                section.push(line);
            }
        }

        if section.is_empty() {
            None
        } else {
            Some(section.join("\n").trim_end().to_string())
        }
    }

    /// Replace the body under `## name`, creating the section at the end of
    /// the file when absent. The header line itself is preserved.
    pub fn write_section(&self, name: &str, body: &str) -> Result<()> {
        let _guard = self.write_guard.lock().unwrap_or_else(|p| p.into_inner());

        let content = self.read_all();
        let mut out: Vec<String> = Vec::new();
        let mut replaced = false;
        let mut skipping = false;

        for line in content.lines() {
            if let Some(header) = line.strip_prefix("## ") {
                if skipping {
                    skipping = false;
                }
                if !replaced && header.trim_start().starts_with(name) {
                    out.push(line.to_string());
                    out.push(body.trim_end().to_string());
                    replaced = true;
                    skipping = true;
                    continue;
                }
            }
            if !skipping {
                out.push(line.to_string());
            }
        }

        if !replaced {
            if !out.is_empty() && !out.last().is_some_and(|l| l.is_empty()) {
                out.push(String::new());
            }
            out.push(format!("## {name}"));
            out.push(body.trim_end().to_string());
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, out.join("\n") + "\n")?;
        debug!(section = name, "master prompt section updated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> (tempfile::TempDir, MasterPrompt) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master_prompt.md");
        fs::write(
            &path,
            "# Master\n\n## 00_PERSONA\n반말 전용.\n\n## 99_CURRENT_CONTEXT\n- [2025-01-01] old fact\n",
        )
        .unwrap();
        (dir, MasterPrompt::new(path))
    }

    #[test]
    fn read_section_includes_header_and_body() {
        let (_dir, mp) = sample();
        let section = mp.read_section("00_PERSONA").unwrap();
        assert!(section.starts_with("## 00_PERSONA"));
        assert!(section.contains("반말 전용."));
        assert!(!section.contains("old fact"));
    }

    #[test]
    fn read_missing_section_is_none() {
        let (_dir, mp) = sample();
        assert!(mp.read_section("42_NOPE").is_none());
        assert!(MasterPrompt::new("/nonexistent/mp.md").read_section("00_PERSONA").is_none());
    }

    #[test]
    fn write_section_replaces_body_in_place() {
        let (_dir, mp) = sample();
        mp.write_section("99_CURRENT_CONTEXT", "- [2025-02-02] new fact").unwrap();

        let section = mp.read_section("99_CURRENT_CONTEXT").unwrap();
        assert!(section.contains("new fact"));
        assert!(!section.contains("old fact"));
        // Untouched sections survive.
        assert!(mp.read_section("00_PERSONA").is_some());
    }

    #[test]
    fn write_section_appends_when_missing() {
        let (_dir, mp) = sample();
        mp.write_section("02_RESEARCH", "- band gap measured").unwrap();
        let section = mp.read_section("02_RESEARCH").unwrap();
        assert!(section.contains("band gap measured"));
    }
}
