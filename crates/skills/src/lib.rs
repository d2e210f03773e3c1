//! Markdown skill manifests.
//!
//! A skill is a markdown file with YAML frontmatter that injects
//! task-specific instructions (and optionally a mandatory tool chain) into
//! the system prompt when one of its triggers matches the user message.
//! The registry is an immutable snapshot — `refresh()` builds a new table
//! and swaps it in atomically, so readers never need a lock discipline.

pub mod loader;

use std::sync::{Arc, RwLock};

use tracing::info;

pub use loader::{Skill, SkillSource};

pub struct SkillRegistry {
    skills_dir: String,
    external_paths: Vec<String>,
    table: RwLock<Arc<Vec<Skill>>>,
}

impl SkillRegistry {
    /// Build the registry and run the initial scan.
    pub fn new(skills_dir: impl Into<String>, external_paths: Vec<String>) -> Self {
        let registry = Self {
            skills_dir: skills_dir.into(),
            external_paths,
            table: RwLock::new(Arc::new(Vec::new())),
        };
        registry.refresh();
        registry
    }

    /// Re-scan skill files and atomically swap in the new table. Idempotent;
    /// safe to call from the hot-reload watcher.
    pub fn refresh(&self) {
        let mut skills = loader::load_internal_skills(&self.skills_dir);
        let external = loader::load_external_skills(&self.external_paths);
        let external_count = external.len();
        skills.extend(external);

        if skills.is_empty() {
            info!("skills registry: no skills found");
        } else {
            info!(
                total = skills.len(),
                external = external_count,
                "skills registry refreshed"
            );
        }

        let snapshot = Arc::new(skills);
        let mut table = self.table.write().unwrap_or_else(|p| p.into_inner());
        *table = snapshot;
    }

    fn snapshot(&self) -> Arc<Vec<Skill>> {
        self.table.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Every skill whose any trigger appears (case-insensitively) in the
    /// message.
    pub fn match_skills(&self, message: &str) -> Vec<Skill> {
        if message.is_empty() {
            return Vec::new();
        }
        let msg_lower = message.to_lowercase();
        self.snapshot()
            .iter()
            .filter(|skill| {
                skill
                    .triggers
                    .iter()
                    .any(|trigger| msg_lower.contains(&trigger.to_lowercase()))
            })
            .cloned()
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<Skill> {
        self.snapshot().iter().find(|s| s.name == name).cloned()
    }

    pub fn list_all(&self) -> Arc<Vec<Skill>> {
        self.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const PAPER_SKILL: &str = r#"---
name: paper-search
description: Use when user asks about papers, arxiv, research articles.
version: 1.0
category: research
tool_chain: [search_arxiv, download_paper_pdf]
requires_tool: true
strict_mode: true
---

## Prompt
논문 검색 결과는 제목 그대로 전달해.

## Few-shot Examples
User: "MoS2 논문 찾아줘" -> search_arxiv

## Validation
Must call search_arxiv first.

## Changelog
- 1.0 initial
"#;

    fn registry_with_skill() -> (tempfile::TempDir, SkillRegistry) {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("paper-search.md"), PAPER_SKILL).unwrap();
        fs::write(dir.path().join("README.md"), "# not a skill").unwrap();
        let registry = SkillRegistry::new(dir.path().to_string_lossy(), vec![]);
        (dir, registry)
    }

    #[test]
    fn readme_is_not_a_skill() {
        let (_dir, registry) = registry_with_skill();
        assert_eq!(registry.list_all().len(), 1);
    }

    #[test]
    fn matching_is_case_insensitive_substring() {
        let (_dir, registry) = registry_with_skill();
        let matched = registry.match_skills("최신 ArXiv 논문 보여줘");
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].name, "paper-search");
        assert!(registry.match_skills("오늘 날씨 어때").is_empty());
        assert!(registry.match_skills("").is_empty());
    }

    #[test]
    fn prompt_excludes_validation_and_changelog() {
        let (_dir, registry) = registry_with_skill();
        let skill = registry.get("paper-search").unwrap();
        assert!(skill.prompt.contains("논문 검색 결과는"));
        assert!(skill.prompt.contains("Few-shot Examples"));
        assert!(!skill.prompt.contains("Must call search_arxiv first"));
        assert!(!skill.prompt.contains("initial"));
    }

    #[test]
    fn refresh_picks_up_new_files() {
        let (dir, registry) = registry_with_skill();
        let second = PAPER_SKILL.replace("paper-search", "paper-two").replace("arxiv", "scholar");
        fs::write(dir.path().join("paper-two.md"), second).unwrap();

        registry.refresh();
        assert_eq!(registry.list_all().len(), 2);
        assert!(registry.get("paper-two").is_some());
    }

    #[test]
    fn external_skill_dirs_are_scanned_for_skill_md() {
        let dir = tempfile::tempdir().unwrap();
        let ext = dir.path().join("my-skill");
        fs::create_dir_all(&ext).unwrap();
        fs::write(ext.join("SKILL.md"), PAPER_SKILL).unwrap();

        let registry =
            SkillRegistry::new("/nonexistent/skills", vec![dir.path().to_string_lossy().into()]);
        let all = registry.list_all();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].source, SkillSource::External);
    }
}
