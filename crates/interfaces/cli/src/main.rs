//! Borealis entry point: wiring, logging, and the CLI surface.

use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use borealis_audit::TraceLogger;
use borealis_config::AppConfig;
use borealis_ensemble::{ContradictionChecker, EnsembleVoter, SshBudget, VoterConfig};
use borealis_exec::ApprovalGate;
use borealis_llm::{AnthropicClient, ChatBackend, LocalClient};
use borealis_memory::{
    Embedder, FactExtractor, FeedbackManager, MasterPrompt, MemoryStore, VaultIndexer,
};
use borealis_runtime::{HotReloader, MailTriage, Router, pollers};
use borealis_skills::SkillRegistry;
use borealis_telegram::{Bot, TelegramClient, start_bot};
use borealis_tools::{MailBridge, ToolRegistry, build_registry};

#[derive(Parser)]
#[command(name = "borealis", about = "Personal research assistant agent")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "config/borealis.toml")]
    config: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the Telegram bot with background loops (default).
    Run,
    /// Route a single message and print the reply.
    Route {
        message: String,
        #[arg(long, default_value = "cli")]
        session: String,
    },
    /// Index the note vault into the knowledge table.
    IndexVault {
        #[arg(long)]
        force: bool,
    },
    /// One-shot import of the legacy corrections log into the feedback table.
    MigrateCorrections {
        /// Path to the JSON-lines log; defaults to the configured location.
        path: Option<String>,
    },
    /// Export the action trace as JSON.
    TraceExport {
        #[arg(long)]
        session: Option<String>,
    },
}

struct App {
    config: AppConfig,
    store: Arc<MemoryStore>,
    vault: Arc<VaultIndexer>,
    feedback: Arc<FeedbackManager>,
    skills: Arc<SkillRegistry>,
    tools: Arc<ToolRegistry>,
    gate: Arc<ApprovalGate>,
    trace: Arc<TraceLogger>,
    router: Arc<Router>,
    mail: MailBridge,
    triage: Arc<MailTriage>,
}

async fn build_app(config: AppConfig) -> Result<App> {
    let embedder = Embedder::probe(
        config.memory.embed_url.clone(),
        config.memory.embed_model.clone(),
        config.memory.embed_timeout_secs,
    )
    .await;

    let store = Arc::new(MemoryStore::open(&config.memory.db_path, embedder)?);
    let master_prompt = Arc::new(MasterPrompt::new(config.agent.master_prompt_path.clone()));
    let vault = Arc::new(VaultIndexer::new(
        store.clone(),
        config.vault.path.clone(),
        config.vault.vault_name.clone(),
        config.vault.index_path.clone(),
    ));
    let facts = Arc::new(FactExtractor::new(store.clone(), master_prompt.clone()));
    let feedback = Arc::new(FeedbackManager::new(store.clone())?);
    let skills = Arc::new(SkillRegistry::new(
        config.skills.dir.as_str(),
        config.skills.external_paths.clone(),
    ));

    let voter_config = VoterConfig::load_from(&config.ensemble.config_path).unwrap_or_else(|err| {
        warn!(%err, "voter config missing; using defaults");
        VoterConfig::default()
    });
    let ssh_budget = Arc::new(SshBudget::new(
        config.ensemble.ssh_counter_path.clone(),
        voter_config.ssh.max_daily_connections,
        voter_config.ssh.jitter_range_seconds,
    ));
    let tools = Arc::new(build_registry(&config, ssh_budget));
    let gate = Arc::new(ApprovalGate::new());
    let trace = Arc::new(TraceLogger::open(&config.memory.trace_db_path)?);

    let backend: Arc<dyn ChatBackend> = if config.paid_backend_selected() {
        match AnthropicClient::from_env() {
            Some(client) => Arc::new(client),
            None => {
                warn!("ANTHROPIC_API_KEY not set; falling back to the local backend");
                Arc::new(LocalClient::new(config.llm.base_url.clone()))
            }
        }
    } else {
        Arc::new(LocalClient::new(config.llm.base_url.clone()))
    };

    let triage = Arc::new(MailTriage::new(
        backend.clone(),
        config.llm.model_fast.clone(),
        EnsembleVoter::new(voter_config.clone(), config.ensemble.audit_log_path.clone()),
        ContradictionChecker::new(
            config.ensemble.corrections_log_path.clone(),
            &voter_config.logic.contradiction_detection,
        ),
    ));

    let router = Arc::new(Router::new(
        config.clone(),
        backend,
        store.clone(),
        master_prompt,
        vault.clone(),
        facts,
        feedback.clone(),
        skills.clone(),
        tools.clone(),
        gate.clone(),
        trace.clone(),
    ));

    let mail = MailBridge::new(&config.mail.bridge_url);

    Ok(App {
        config,
        store,
        vault,
        feedback,
        skills,
        tools,
        gate,
        trace,
        router,
        mail,
        triage,
    })
}

async fn run_bot(app: App) -> Result<()> {
    let client = TelegramClient::from_env()?;
    let bot = Arc::new(Bot::new(
        client,
        app.config.clone(),
        app.router.clone(),
        app.gate.clone(),
        app.tools.clone(),
        app.skills.clone(),
        app.trace.clone(),
        app.feedback.clone(),
        app.store.clone(),
        app.vault.clone(),
        app.mail.clone(),
        app.triage.clone(),
    ));

    if app.config.reload.enabled {
        let skills = app.skills.clone();
        let reloader = HotReloader::new(
            std::env::current_dir()?,
            Some(Box::new(move || skills.refresh())),
            app.config.reload.auto_restart_on_code_change,
            app.config.reload.check_interval_secs,
        );
        tokio::spawn(reloader.run());
        info!("hot-reload watcher started");
    }

    let owner_chat = app.config.telegram.owner_chat_id;
    if owner_chat != 0 {
        pollers::spawn_urgent_mail_poller(
            app.mail.clone(),
            bot.clone(),
            owner_chat,
            app.config.mail.urgent_poll_secs.max(60),
        );
    }

    start_bot(bot).await
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.telemetry.log_level.clone())),
        )
        .init();

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            let app = build_app(config).await?;
            run_bot(app).await
        }
        Command::Route { message, session } => {
            let app = build_app(config).await?;
            let outcome = app.router.route(&message, &[], &session, None, None).await;
            println!("{}", outcome.response);
            if !outcome.tools_used.is_empty() {
                println!("(tools: {})", outcome.tools_used.join(", "));
            }
            Ok(())
        }
        Command::IndexVault { force } => {
            let app = build_app(config).await?;
            let progress = |current: usize, total: usize| {
                println!("indexing {current}/{total}");
            };
            let stats = app.vault.index_vault(force, Some(&progress)).await;
            println!(
                "total {} / new {} / updated {} / skipped {} / errors {}",
                stats.total, stats.new, stats.updated, stats.skipped, stats.errors,
            );
            Ok(())
        }
        Command::MigrateCorrections { path } => {
            let app = build_app(config).await?;
            let path = path.unwrap_or_else(|| app.config.ensemble.corrections_log_path.clone());
            // Re-running on a partially migrated database duplicates rows.
            let count = app.store.migrate_corrections(&path)?;
            println!("migrated {count} corrections from {path}");
            Ok(())
        }
        Command::TraceExport { session } => {
            let app = build_app(config).await?;
            println!("{}", app.trace.export_json(session.as_deref())?);
            Ok(())
        }
    }
}
