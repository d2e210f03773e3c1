//! Built-in tool adapters. Each module wraps one external collaborator
//! (paper search APIs, calendar bridge, mail bridge, HPC cluster, the
//! research-advisor report) behind the [`Tool`] trait.

pub mod advisor;
pub mod calendar;
pub mod hpc;
pub mod mail;
pub mod papers;

use std::sync::Arc;

use borealis_config::AppConfig;
use borealis_ensemble::SshBudget;

use crate::ToolRegistry;

/// Assemble the full registry from the configuration. Tools whose
/// collaborator is unconfigured still register — they return error payloads
/// when called, which the LLM can observe.
pub fn build_registry(config: &AppConfig, ssh_budget: Arc<SshBudget>) -> ToolRegistry {
    let mut registry = ToolRegistry::default();

    registry.register(Box::new(papers::SearchArxivTool::new()));
    registry.register(Box::new(papers::SearchSemanticScholarTool::new()));
    registry.register(Box::new(papers::DownloadPaperPdfTool::new()));
    registry.register(Box::new(papers::AnalyzePaperTool::new(&config.papers.analyzer_bridge_url)));

    registry.register(Box::new(calendar::CalendarBriefingTool::new(&config.calendar.bridge_url)));
    registry.register(Box::new(calendar::AddCalendarEventTool::new(&config.calendar.bridge_url)));

    let mail_bridge = mail::MailBridge::new(&config.mail.bridge_url);
    registry.register(Box::new(mail::AnalyzeEmailsTool::new(mail_bridge.clone())));
    registry.register(Box::new(mail::FetchMailDigestTool::new(mail_bridge.clone())));
    registry.register(Box::new(mail::FetchUrgentMailsTool::new(mail_bridge.clone())));
    registry.register(Box::new(mail::FetchPromoDealsTool::new(mail_bridge.clone())));
    registry.register(Box::new(mail::ProposeMailActionsTool::new(mail_bridge.clone())));
    registry.register(Box::new(mail::ExecuteMailActionsTool::new(mail_bridge.clone())));
    registry.register(Box::new(mail::SendEmailReplyTool::new(mail_bridge)));

    let runner = Arc::new(hpc::HpcRunner::new(config.hpc.clone(), ssh_budget));
    registry.register(Box::new(hpc::CheckHpcConnectionTool::new(runner.clone())));
    registry.register(Box::new(hpc::MonitorHpcJobTool::new(runner.clone())));
    registry.register(Box::new(hpc::SubmitHpcJobTool::new(runner)));

    registry.register(Box::new(advisor::AdvisorHandleTool::new(
        &config.agent.master_prompt_path,
    )));

    registry
}
