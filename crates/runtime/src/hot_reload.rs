//! Polling hot-reload watcher.
//!
//! Watches runtime files (skill manifests, the master prompt) and source
//! files by mtime. Runtime changes fire the reload callback (idempotent);
//! source changes are logged, or re-exec the process when auto-restart is
//! enabled. A plain mtime poll keeps the core free of OS-specific watchers.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{info, warn};
use walkdir::WalkDir;

/// Extensions that can be refreshed in-process.
const RUNTIME_EXTENSIONS: &[&str] = &["md", "json", "yaml", "yml"];
/// Extensions that require a restart to take effect.
const CODE_EXTENSIONS: &[&str] = &["rs"];

type ReloadCallback = Box<dyn Fn() + Send + Sync>;

pub struct HotReloader {
    watch_root: PathBuf,
    on_runtime_reload: Option<ReloadCallback>,
    auto_restart_on_code_change: bool,
    check_interval: Duration,
    mtimes: HashMap<PathBuf, SystemTime>,
}

impl HotReloader {
    pub fn new(
        watch_root: impl Into<PathBuf>,
        on_runtime_reload: Option<ReloadCallback>,
        auto_restart_on_code_change: bool,
        check_interval_secs: u64,
    ) -> Self {
        let mut reloader = Self {
            watch_root: watch_root.into(),
            on_runtime_reload,
            auto_restart_on_code_change,
            check_interval: Duration::from_secs(check_interval_secs.max(1)),
            mtimes: HashMap::new(),
        };
        reloader.refresh_snapshot();
        reloader
    }

    fn watched_files(&self) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = Vec::new();

        let skills_dir = self.watch_root.join("skills");
        if skills_dir.exists() {
            for entry in WalkDir::new(&skills_dir).into_iter().filter_map(|e| e.ok()) {
                if entry.file_type().is_file()
                    && entry.path().extension().and_then(|e| e.to_str()) == Some("md")
                {
                    files.push(entry.path().to_path_buf());
                }
            }
        }

        let master_prompt = self.watch_root.join("data").join("master_prompt.md");
        if master_prompt.exists() {
            files.push(master_prompt);
        }

        // Source files (restart path). target/ and hidden dirs are skipped.
        for entry in WalkDir::new(&self.watch_root)
            .into_iter()
            .filter_entry(|e| {
                if e.depth() == 0 {
                    return true;
                }
                let name = e.file_name().to_string_lossy();
                name != "target" && !(name.starts_with('.') && e.file_type().is_dir())
            })
            .filter_map(|e| e.ok())
        {
            if entry.file_type().is_file()
                && entry
                    .path()
                    .extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|ext| CODE_EXTENSIONS.contains(&ext))
            {
                files.push(entry.path().to_path_buf());
            }
        }

        files
    }

    /// Capture the latest mtimes for all watched files.
    pub fn refresh_snapshot(&mut self) {
        let mut snapshot = HashMap::new();
        for path in self.watched_files() {
            if let Ok(meta) = path.metadata() {
                if let Ok(mtime) = meta.modified() {
                    snapshot.insert(path, mtime);
                }
            }
        }
        self.mtimes = snapshot;
    }

    fn detect_changed(&mut self) -> Vec<PathBuf> {
        let mut changed = Vec::new();
        let mut current = HashMap::new();
        for path in self.watched_files() {
            let Ok(meta) = path.metadata() else { continue };
            let Ok(mtime) = meta.modified() else { continue };
            match self.mtimes.get(&path) {
                Some(prev) if mtime <= *prev => {}
                _ => changed.push(path.clone()),
            }
            current.insert(path, mtime);
        }
        self.mtimes = current;
        changed
    }

    /// One poll cycle: detect changes, refresh runtime state, and handle
    /// source changes per policy. Returns the changed paths (for logging and
    /// tests).
    pub fn check_and_apply(&mut self) -> Vec<PathBuf> {
        let changed = self.detect_changed();
        if changed.is_empty() {
            return changed;
        }

        let runtime_changed: Vec<&PathBuf> = changed
            .iter()
            .filter(|p| has_extension(p, RUNTIME_EXTENSIONS))
            .collect();
        let code_changed: Vec<&PathBuf> = changed
            .iter()
            .filter(|p| has_extension(p, CODE_EXTENSIONS))
            .collect();

        if !runtime_changed.is_empty() {
            if let Some(callback) = &self.on_runtime_reload {
                callback();
            }
            info!(files = runtime_changed.len(), "runtime hot-reload applied");
        }

        if !code_changed.is_empty() {
            info!(files = code_changed.len(), "source changes detected");
            if self.auto_restart_on_code_change {
                warn!("auto-restarting to apply source changes");
                restart_process();
            } else {
                warn!("source changed but auto-restart is disabled; restart manually to apply");
            }
        }

        changed
    }

    /// Background loop; polls until the process exits.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.check_and_apply();
        }
    }
}

fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| extensions.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

#[cfg(unix)]
fn restart_process() {
    use std::os::unix::process::CommandExt;
    let args: Vec<String> = std::env::args().skip(1).collect();
    let Ok(exe) = std::env::current_exe() else {
        warn!("cannot determine current executable; skipping restart");
        return;
    };
    let err = std::process::Command::new(exe).args(args).exec();
    warn!(%err, "exec failed; continuing without restart");
}

#[cfg(not(unix))]
fn restart_process() {
    warn!("auto-restart is only supported on unix; ignoring");
}
