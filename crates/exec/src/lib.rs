//! Risk-gated tool execution.
//!
//! Every tool carries a fixed risk tier. AUTO runs immediately; CONFIRM and
//! CRITICAL park the execution on a one-shot approval handle and wait for the
//! user's inline-keyboard decision (or a timeout, which denies). Many
//! approvals may be in flight at once; each is an independent suspension.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::{info, warn};
use uuid::Uuid;

// ── Risk classification ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskLevel {
    /// Safe — execute immediately.
    Auto,
    /// Needs user approval, 5 minute timeout.
    Confirm,
    /// Needs explicit approval, 30 minute timeout.
    Critical,
}

impl RiskLevel {
    /// The static risk table. New tools must be classified here explicitly
    /// before use; anything unknown defaults to CONFIRM.
    pub fn for_tool(tool_name: &str) -> Self {
        match tool_name {
            "search_arxiv"
            | "search_semantic_scholar"
            | "get_calendar_briefing"
            | "fetch_mail_digest"
            | "fetch_urgent_mails"
            | "fetch_promo_deals"
            | "check_hpc_connection"
            | "advisor_handle" => RiskLevel::Auto,
            "download_paper_pdf"
            | "analyze_paper"
            | "analyze_emails"
            | "monitor_hpc_job"
            | "propose_mail_actions"
            | "add_calendar_event" => RiskLevel::Confirm,
            "execute_mail_actions" | "submit_hpc_job" | "send_email_reply" => RiskLevel::Critical,
            _ => RiskLevel::Confirm,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RiskLevel::Auto => "AUTO",
            RiskLevel::Confirm => "CONFIRM",
            RiskLevel::Critical => "CRITICAL",
        }
    }
}

// ── Transport seam ───────────────────────────────────────────────────────────

/// The out-of-band channel approvals travel over. Implemented by the
/// Telegram interface; tests provide stubs.
#[async_trait]
pub trait ApprovalTransport: Send + Sync {
    /// Send an approval request with two inline buttons whose callback
    /// payloads are `approve_data` / `deny_data`.
    async fn request_approval(
        &self,
        chat_id: i64,
        text: &str,
        approve_data: &str,
        deny_data: &str,
    ) -> Result<()>;

    /// Send a plain notification (used for timeout notices).
    async fn notify(&self, chat_id: i64, text: &str) -> Result<()>;
}

// ── Outcomes ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalOutcome {
    Approved,
    Denied,
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct GateResult {
    pub approved: bool,
    /// Tool result string; `None` when execution never happened.
    pub result: Option<String>,
    pub level: RiskLevel,
    pub outcome: ApprovalOutcome,
}

// ── Gate ─────────────────────────────────────────────────────────────────────

pub struct ApprovalGate {
    pending: Mutex<HashMap<String, oneshot::Sender<bool>>>,
    confirm_timeout: Duration,
    critical_timeout: Duration,
}

impl Default for ApprovalGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ApprovalGate {
    pub fn new() -> Self {
        Self::with_timeouts(Duration::from_secs(300), Duration::from_secs(1800))
    }

    /// Timeout override for tests.
    pub fn with_timeouts(confirm: Duration, critical: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            confirm_timeout: confirm,
            critical_timeout: critical,
        }
    }

    fn timeout_for(&self, level: RiskLevel) -> Duration {
        match level {
            RiskLevel::Confirm => self.confirm_timeout,
            RiskLevel::Critical => self.critical_timeout,
            RiskLevel::Auto => Duration::ZERO,
        }
    }

    /// Run `exec` after obtaining the appropriate level of approval.
    ///
    /// AUTO executes without touching the transport. CONFIRM/CRITICAL without
    /// a transport are denied outright. A deny or timeout never calls `exec`.
    pub async fn execute_with_approval<F, Fut>(
        &self,
        tool_name: &str,
        tool_args: &serde_json::Value,
        exec: F,
        transport: Option<&dyn ApprovalTransport>,
        chat_id: Option<i64>,
    ) -> GateResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = String>,
    {
        let level = RiskLevel::for_tool(tool_name);

        if level == RiskLevel::Auto {
            let result = exec().await;
            return GateResult {
                approved: true,
                result: Some(result),
                level,
                outcome: ApprovalOutcome::Approved,
            };
        }

        let (Some(transport), Some(chat_id)) = (transport, chat_id) else {
            warn!(tool = tool_name, "approval required but no transport configured; denying");
            return GateResult {
                approved: false,
                result: None,
                level,
                outcome: ApprovalOutcome::Denied,
            };
        };

        match self
            .request_approval(transport, chat_id, tool_name, tool_args, level)
            .await
        {
            ApprovalOutcome::Approved => {
                let result = exec().await;
                GateResult {
                    approved: true,
                    result: Some(result),
                    level,
                    outcome: ApprovalOutcome::Approved,
                }
            }
            outcome => GateResult { approved: false, result: None, level, outcome },
        }
    }

    async fn request_approval(
        &self,
        transport: &dyn ApprovalTransport,
        chat_id: i64,
        tool_name: &str,
        tool_args: &serde_json::Value,
        level: RiskLevel,
    ) -> ApprovalOutcome {
        let callback_id = Uuid::new_v4().simple().to_string()[..12].to_string();
        let timeout = self.timeout_for(level);
        let minutes = timeout.as_secs() / 60;

        let text = match level {
            RiskLevel::Critical => format!(
                "[CRITICAL] Tool: {tool_name}\nArgs: {}\n\nThis action is classified as CRITICAL.\nPlease confirm within {minutes} minutes.",
                format_args_preview(tool_args),
            ),
            _ => format!(
                "[CONFIRM] Tool: {tool_name}\nArgs: {}\n\nApprove execution? (timeout: {minutes} min)",
                format_args_preview(tool_args),
            ),
        };

        let (tx, rx) = oneshot::channel::<bool>();
        self.lock_pending().insert(callback_id.clone(), tx);

        let sent = transport
            .request_approval(
                chat_id,
                &text,
                &format!("approve:{callback_id}"),
                &format!("deny:{callback_id}"),
            )
            .await;
        if let Err(err) = sent {
            warn!(tool = tool_name, %err, "failed to send approval request; denying");
            self.lock_pending().remove(&callback_id);
            return ApprovalOutcome::Denied;
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(true)) => {
                info!(tool = tool_name, "approval granted");
                ApprovalOutcome::Approved
            }
            Ok(Ok(false)) => {
                info!(tool = tool_name, "approval denied");
                ApprovalOutcome::Denied
            }
            // Sender dropped without resolving; treat as a deny.
            Ok(Err(_)) => ApprovalOutcome::Denied,
            Err(_) => {
                self.lock_pending().remove(&callback_id);
                let _ = transport
                    .notify(
                        chat_id,
                        &format!("Approval request for '{tool_name}' timed out. Action denied."),
                    )
                    .await;
                ApprovalOutcome::TimedOut
            }
        }
    }

    /// Resolve an `approve:<id>` / `deny:<id>` callback. Unknown or
    /// already-resolved ids answer "expired".
    pub fn handle_callback(&self, data: &str) -> &'static str {
        let Some((action, callback_id)) = data.split_once(':') else {
            return "This request has expired.";
        };
        let Some(tx) = self.lock_pending().remove(callback_id) else {
            return "This request has expired.";
        };
        let approve = action == "approve";
        if tx.send(approve).is_err() {
            return "This request has expired.";
        }
        if approve { "Approved" } else { "Denied" }
    }

    /// Number of approvals currently in flight.
    pub fn pending_count(&self) -> usize {
        self.lock_pending().len()
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<bool>>> {
        self.pending.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Pretty-print tool args for the approval message, truncated to 200 chars.
fn format_args_preview(args: &serde_json::Value) -> String {
    let text = match args.as_object() {
        Some(map) => map
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(", "),
        None => args.to_string(),
    };
    if text.chars().count() > 200 {
        let clipped: String = text.chars().take(200).collect();
        format!("{clipped}...")
    } else {
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::sync::Mutex as AsyncMutex;

    /// Records requests; optionally auto-answers via the gate.
    struct StubTransport {
        sent: AsyncMutex<Vec<String>>,
        callbacks: AsyncMutex<Vec<(String, String)>>,
    }

    impl StubTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: AsyncMutex::new(Vec::new()),
                callbacks: AsyncMutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ApprovalTransport for StubTransport {
        async fn request_approval(
            &self,
            _chat_id: i64,
            text: &str,
            approve_data: &str,
            deny_data: &str,
        ) -> Result<()> {
            self.sent.lock().await.push(text.to_string());
            self.callbacks
                .lock()
                .await
                .push((approve_data.to_string(), deny_data.to_string()));
            Ok(())
        }

        async fn notify(&self, _chat_id: i64, text: &str) -> Result<()> {
            self.sent.lock().await.push(text.to_string());
            Ok(())
        }
    }

    #[test]
    fn risk_table_is_stable() {
        assert_eq!(RiskLevel::for_tool("search_arxiv"), RiskLevel::Auto);
        assert_eq!(RiskLevel::for_tool("advisor_handle"), RiskLevel::Auto);
        assert_eq!(RiskLevel::for_tool("download_paper_pdf"), RiskLevel::Confirm);
        assert_eq!(RiskLevel::for_tool("monitor_hpc_job"), RiskLevel::Confirm);
        assert_eq!(RiskLevel::for_tool("submit_hpc_job"), RiskLevel::Critical);
        assert_eq!(RiskLevel::for_tool("send_email_reply"), RiskLevel::Critical);
        assert_eq!(RiskLevel::for_tool("never_heard_of_it"), RiskLevel::Confirm);
    }

    #[tokio::test]
    async fn auto_tools_never_touch_the_transport() {
        let gate = ApprovalGate::new();
        let transport = StubTransport::new();
        let result = gate
            .execute_with_approval(
                "search_arxiv",
                &json!({"query": "MoS2"}),
                || async { "ok".to_string() },
                Some(transport.as_ref()),
                Some(1),
            )
            .await;
        assert!(result.approved);
        assert_eq!(result.result.as_deref(), Some("ok"));
        assert_eq!(result.level, RiskLevel::Auto);
        assert!(transport.sent.lock().await.is_empty());
    }

    #[tokio::test]
    async fn gated_tool_without_transport_is_denied() {
        let gate = ApprovalGate::new();
        let result = gate
            .execute_with_approval(
                "download_paper_pdf",
                &json!({}),
                || async { unreachable!("must not execute") },
                None,
                None,
            )
            .await;
        assert!(!result.approved);
        assert!(result.result.is_none());
        assert_eq!(result.outcome, ApprovalOutcome::Denied);
    }

    #[tokio::test]
    async fn approve_callback_lets_execution_through() {
        let gate = Arc::new(ApprovalGate::new());
        let transport = StubTransport::new();

        let gate_clone = gate.clone();
        let transport_clone = transport.clone();
        let answerer = tokio::spawn(async move {
            // Wait for the request to land, then press "Yes".
            loop {
                if let Some((approve, _)) = transport_clone.callbacks.lock().await.first().cloned() {
                    return gate_clone.handle_callback(&approve);
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });

        let result = gate
            .execute_with_approval(
                "download_paper_pdf",
                &json!({"pdf_url": "u", "save_path": "p"}),
                || async { "downloaded".to_string() },
                Some(transport.as_ref()),
                Some(7),
            )
            .await;

        assert_eq!(answerer.await.unwrap(), "Approved");
        assert!(result.approved);
        assert_eq!(result.result.as_deref(), Some("downloaded"));
        assert_eq!(gate.pending_count(), 0);

        let sent = transport.sent.lock().await;
        assert!(sent[0].starts_with("[CONFIRM] Tool: download_paper_pdf"));
    }

    #[tokio::test]
    async fn deny_callback_blocks_execution() {
        let gate = Arc::new(ApprovalGate::new());
        let transport = StubTransport::new();

        let gate_clone = gate.clone();
        let transport_clone = transport.clone();
        tokio::spawn(async move {
            loop {
                if let Some((_, deny)) = transport_clone.callbacks.lock().await.first().cloned() {
                    gate_clone.handle_callback(&deny);
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });

        let result = gate
            .execute_with_approval(
                "execute_mail_actions",
                &json!({"action_ids": []}),
                || async { unreachable!("denied tools must not run") },
                Some(transport.as_ref()),
                Some(7),
            )
            .await;

        assert!(!result.approved);
        assert_eq!(result.outcome, ApprovalOutcome::Denied);
        assert_eq!(result.level, RiskLevel::Critical);
        let sent = transport.sent.lock().await;
        assert!(sent[0].starts_with("[CRITICAL] Tool: execute_mail_actions"));
    }

    #[tokio::test]
    async fn timeout_denies_and_notifies() {
        let gate = ApprovalGate::with_timeouts(Duration::from_millis(20), Duration::from_millis(20));
        let transport = StubTransport::new();

        let result = gate
            .execute_with_approval(
                "analyze_emails",
                &json!({}),
                || async { unreachable!("timed-out tools must not run") },
                Some(transport.as_ref()),
                Some(7),
            )
            .await;

        assert!(!result.approved);
        assert_eq!(result.outcome, ApprovalOutcome::TimedOut);
        assert_eq!(gate.pending_count(), 0);
        let sent = transport.sent.lock().await;
        assert!(sent.last().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn unknown_and_double_callbacks_expire() {
        let gate = ApprovalGate::new();
        assert_eq!(gate.handle_callback("approve:nope"), "This request has expired.");
        assert_eq!(gate.handle_callback("garbage"), "This request has expired.");
    }
}
