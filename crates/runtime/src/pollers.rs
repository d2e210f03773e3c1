//! Background pollers.
//!
//! Long-lived loops that watch external services and push alerts to the
//! owner chat. Each loop sleeps on a jittered interval, catches and logs
//! every error, and only observes shutdown at its sleep boundary.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use borealis_exec::ApprovalTransport;
use borealis_tools::MailBridge;

/// Spawn the urgent-mail poller. Notifies `chat_id` whenever the bridge
/// reports urgent items; throttled by `interval_secs` plus bounded jitter so
/// the external service never sees a fixed cadence.
pub fn spawn_urgent_mail_poller(
    bridge: MailBridge,
    transport: Arc<dyn ApprovalTransport>,
    chat_id: i64,
    interval_secs: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if !bridge.is_configured() {
            info!("mail bridge not configured; urgent poller not started");
            return;
        }
        info!(interval_secs, "urgent-mail poller started");
        loop {
            tokio::time::sleep(jittered(interval_secs)).await;
            match bridge.get("/urgent").await {
                Ok(body) => {
                    if let Some(alert) = format_urgent_alert(&body) {
                        if let Err(err) = transport.notify(chat_id, &alert).await {
                            warn!(%err, "failed to push urgent-mail alert");
                        }
                    }
                }
                Err(err) => {
                    warn!(%err, "urgent-mail poll failed");
                }
            }
        }
    })
}

fn jittered(interval_secs: u64) -> Duration {
    // Up to 10% extra, so concurrent deployments don't align their polls.
    let jitter = rand::rng().random_range(0..=interval_secs / 10 + 1);
    Duration::from_secs(interval_secs + jitter)
}

/// Build the alert text for a non-empty urgent payload; `None` when there is
/// nothing to report or the payload is unparseable.
fn format_urgent_alert(body: &str) -> Option<String> {
    let parsed: serde_json::Value = serde_json::from_str(body).ok()?;
    let items = parsed
        .get("mails")
        .or_else(|| parsed.get("items"))
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_else(|| parsed.as_array().cloned().unwrap_or_default());
    if items.is_empty() {
        debug!("no urgent mail");
        return None;
    }

    let mut lines = vec![format!("[긴급 메일 {}건]", items.len())];
    for item in items.iter().take(5) {
        let subject = item.get("subject").and_then(|v| v.as_str()).unwrap_or("(no subject)");
        let sender = item.get("sender").and_then(|v| v.as_str()).unwrap_or("");
        if sender.is_empty() {
            lines.push(format!("- {subject}"));
        } else {
            lines.push(format!("- {subject} ({sender})"));
        }
    }
    Some(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_payloads_produce_no_alert() {
        assert!(format_urgent_alert("{\"mails\": []}").is_none());
        assert!(format_urgent_alert("[]").is_none());
        assert!(format_urgent_alert("not json").is_none());
    }

    #[test]
    fn urgent_items_are_summarised() {
        let body = r#"{"mails": [
            {"subject": "서버 다운", "sender": "ops@lab.edu"},
            {"subject": "Deadline today"}
        ]}"#;
        let alert = format_urgent_alert(body).unwrap();
        assert!(alert.starts_with("[긴급 메일 2건]"));
        assert!(alert.contains("- 서버 다운 (ops@lab.edu)"));
        assert!(alert.contains("- Deadline today"));
    }

    #[test]
    fn bare_array_payloads_are_accepted() {
        let alert = format_urgent_alert(r#"[{"subject": "only one"}]"#).unwrap();
        assert!(alert.contains("1건"));
    }
}
