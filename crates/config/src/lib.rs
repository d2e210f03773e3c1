use std::env;
use std::fs;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub name: String,
    pub owner_name: String,
    pub data_dir: String,
    pub master_prompt_path: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "Borealis".to_string(),
            owner_name: String::new(),
            data_dir: "data".to_string(),
            master_prompt_path: "data/master_prompt.md".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// "local" (OpenAI-compatible, free) or "anthropic" (paid, opt-in).
    pub backend: String,
    pub base_url: String,
    /// Small model for plain conversation turns.
    pub model_fast: String,
    /// Tool-capable model for turns that carry a toolset.
    pub model_full: String,
    pub anthropic_model: String,
    /// Paid API calls are refused unless this is set (or the
    /// `BOREALIS_ALLOW_PAID_API` env var is "true").
    pub allow_paid_api: bool,
    pub max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            backend: "local".to_string(),
            base_url: "http://localhost:11434/v1".to_string(),
            model_fast: "llama3.1:8b".to_string(),
            model_full: "llama70b-lite".to_string(),
            anthropic_model: "claude-sonnet-4-5".to_string(),
            allow_paid_api: false,
            max_tokens: 4096,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub db_path: String,
    pub trace_db_path: String,
    pub embed_url: String,
    pub embed_model: String,
    pub embed_timeout_secs: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            db_path: "data/borealis_memory.db".to_string(),
            trace_db_path: "data/trace.db".to_string(),
            embed_url: "http://localhost:11434/api/embeddings".to_string(),
            embed_model: "nomic-embed-text".to_string(),
            embed_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Root directory holding one subdirectory per vault.
    pub path: String,
    pub vault_name: String,
    pub index_path: String,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            vault_name: "My Second Brain".to_string(),
            index_path: "data/vault_index.json".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SkillsConfig {
    pub dir: String,
    /// Colon-separated extra roots come from `BOREALIS_EXTERNAL_SKILLS`;
    /// these are always appended.
    pub external_paths: Vec<String>,
}

impl Default for SkillsConfig {
    fn default() -> Self {
        Self {
            dir: "skills".to_string(),
            external_paths: vec![
                "~/.openclaw/skills".to_string(),
                "~/.claude/skills".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PapersConfig {
    /// Base URL of the external paper-analysis bridge; empty disables
    /// the analyze tool.
    pub analyzer_bridge_url: String,
    pub download_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MailConfig {
    /// Base URL of the external mail bridge; empty disables mail tools.
    pub bridge_url: String,
    pub urgent_poll_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CalendarConfig {
    /// Base URL of the external calendar bridge; empty disables calendar tools.
    pub bridge_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HpcConfig {
    pub host: String,
    /// "pbs" or "slurm".
    pub scheduler: String,
    pub username: String,
    pub remote_path: String,
    pub ssh_timeout_secs: u64,
}

impl Default for HpcConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            scheduler: "pbs".to_string(),
            username: String::new(),
            remote_path: String::new(),
            ssh_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnsembleConfig {
    pub config_path: String,
    pub audit_log_path: String,
    pub corrections_log_path: String,
    pub ssh_counter_path: String,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            config_path: "config/voter.yaml".to_string(),
            audit_log_path: "data/ensemble_audit.log".to_string(),
            corrections_log_path: "data/feedback/corrections.jsonl".to_string(),
            ssh_counter_path: "data/ssh_counter.json".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReloadConfig {
    pub enabled: bool,
    pub auto_restart_on_code_change: bool,
    pub check_interval_secs: u64,
}

impl Default for ReloadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_restart_on_code_change: false,
            check_interval_secs: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TelegramConfig {
    /// Chat that receives background alerts (urgent mail, timeouts).
    /// 0 disables pushes.
    pub owner_chat_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub agent: AgentConfig,
    pub llm: LlmConfig,
    pub memory: MemoryConfig,
    pub vault: VaultConfig,
    pub skills: SkillsConfig,
    pub papers: PapersConfig,
    pub mail: MailConfig,
    pub calendar: CalendarConfig,
    pub hpc: HpcConfig,
    pub ensemble: EnsembleConfig,
    pub reload: ReloadConfig,
    pub telegram: TelegramConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(backend) = env::var("BOREALIS_LLM_BACKEND") {
            if !backend.is_empty() {
                self.llm.backend = backend;
            }
        }
        if let Ok(value) = env::var("BOREALIS_ALLOW_PAID_API") {
            self.llm.allow_paid_api = value.eq_ignore_ascii_case("true");
        }
        if let Ok(url) = env::var("OLLAMA_BASE_URL") {
            if !url.is_empty() {
                self.llm.base_url = format!("{}/v1", url.trim_end_matches('/'));
            }
        }
        if let Ok(path) = env::var("BOREALIS_VAULT_PATH") {
            if !path.is_empty() {
                self.vault.path = path;
            }
        }
        if let Ok(paths) = env::var("BOREALIS_EXTERNAL_SKILLS") {
            // Env paths are searched before the built-in defaults.
            let mut merged: Vec<String> = paths
                .split(':')
                .filter(|p| !p.trim().is_empty())
                .map(str::to_string)
                .collect();
            merged.extend(self.skills.external_paths.drain(..));
            self.skills.external_paths = merged;
        }
        if let Ok(value) = env::var("BOREALIS_AUTO_RESTART_ON_CODE_CHANGE") {
            self.reload.auto_restart_on_code_change = value.eq_ignore_ascii_case("true");
        }
    }

    /// The model the router should use for a turn, given whether any tools
    /// were selected. Anthropic uses a single model either way.
    pub fn active_model(&self, has_tools: bool) -> &str {
        if self.llm.backend.eq_ignore_ascii_case("anthropic") {
            &self.llm.anthropic_model
        } else if has_tools {
            &self.llm.model_full
        } else {
            &self.llm.model_fast
        }
    }

    pub fn paid_backend_selected(&self) -> bool {
        self.llm.backend.eq_ignore_ascii_case("anthropic")
    }
}
