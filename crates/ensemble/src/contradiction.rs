//! Contradiction detection against the corrections log.
//!
//! If the user has historically corrected the *exact same* subject to two
//! different labels, no amount of voting settles it — the voter
//! short-circuits to the fallback category instead.

use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;

use tracing::warn;

pub struct ContradictionChecker {
    corrections_path: PathBuf,
    enabled: bool,
}

impl ContradictionChecker {
    pub fn new(corrections_path: impl Into<PathBuf>, mode: &str) -> Self {
        Self {
            corrections_path: corrections_path.into(),
            enabled: mode != "disabled",
        }
    }

    /// Returns a warning message when `subject` has conflicting historic
    /// labels, `None` otherwise.
    pub fn check(&self, subject: &str) -> Option<String> {
        if !self.enabled {
            return None;
        }
        let raw = fs::read_to_string(&self.corrections_path).ok()?;

        let labels: HashSet<String> = raw
            .lines()
            .filter_map(|line| serde_json::from_str::<serde_json::Value>(line.trim()).ok())
            .filter(|entry| entry.get("subject").and_then(|v| v.as_str()) == Some(subject))
            .filter_map(|entry| {
                entry
                    .get("corrected_label")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
            })
            .collect();

        if labels.len() > 1 {
            warn!(subject, ?labels, "contradiction detected in corrections log");
            let mut sorted: Vec<&str> = labels.iter().map(String::as_str).collect();
            sorted.sort();
            return Some(format!(
                "CONTRADICTION: Subject has conflicting labels: {}",
                sorted.join(", ")
            ));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_with(lines: &[&str]) -> (tempfile::TempDir, ContradictionChecker) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corrections.jsonl");
        fs::write(&path, lines.join("\n")).unwrap();
        let checker = ContradictionChecker::new(path, "enabled");
        (dir, checker)
    }

    #[test]
    fn conflicting_labels_trigger_a_warning() {
        let (_dir, checker) = log_with(&[
            r#"{"subject":"Re: seminar","corrected_label":"ACTION"}"#,
            r#"{"subject":"Re: seminar","corrected_label":"FYI"}"#,
        ]);
        let warning = checker.check("Re: seminar").unwrap();
        assert!(warning.starts_with("CONTRADICTION:"));
    }

    #[test]
    fn consistent_labels_pass() {
        let (_dir, checker) = log_with(&[
            r#"{"subject":"Re: seminar","corrected_label":"ACTION"}"#,
            r#"{"subject":"Re: seminar","corrected_label":"ACTION"}"#,
        ]);
        assert!(checker.check("Re: seminar").is_none());
    }

    #[test]
    fn subject_match_is_exact() {
        let (_dir, checker) = log_with(&[
            r#"{"subject":"Re: seminar","corrected_label":"ACTION"}"#,
            r#"{"subject":"Re: seminar (updated)","corrected_label":"FYI"}"#,
        ]);
        assert!(checker.check("Re: seminar").is_none());
    }

    #[test]
    fn disabled_mode_and_missing_file_are_silent() {
        let (_dir, checker) = log_with(&[
            r#"{"subject":"s","corrected_label":"ACTION"}"#,
            r#"{"subject":"s","corrected_label":"FYI"}"#,
        ]);
        let disabled = ContradictionChecker::new("/nonexistent/corrections.jsonl", "enabled");
        assert!(disabled.check("s").is_none());
        let off = ContradictionChecker::new("/nonexistent", "disabled");
        assert!(off.check("s").is_none());
        // enabled checker still works
        assert!(checker.check("s").is_some());
    }
}
