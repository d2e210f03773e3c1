//! Telegram front-end: long-polling update loop, the command surface, and
//! the inline-keyboard approval flow.
//!
//! Messages are handled in spawned tasks so a turn parked on an approval
//! never blocks the update loop — the loop keeps polling and delivers the
//! `approve:<id>` / `deny:<id>` callbacks that resolve it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use borealis_audit::TraceLogger;
use borealis_config::AppConfig;
use borealis_exec::{ApprovalGate, ApprovalTransport};
use borealis_llm::Turn;
use borealis_memory::{FeedbackManager, MemoryStore, VaultIndexer};
use borealis_runtime::{MailTriage, Router};
use borealis_skills::SkillRegistry;
use borealis_tools::{MailBridge, ToolRegistry};

/// Telegram truncates messages near 4096 chars; stay under it.
const MAX_MESSAGE_CHARS: usize = 3500;
/// Per-chat transport-side history window (messages, not turns).
const HISTORY_WINDOW: usize = 8;

const HELP_TEXT: &str = "\
/help — 명령어 목록
/status — 백엔드/모델/도구 상태
/mail — 받은 메일 분석
/search <질문> — 기억 검색
/schedule — 일정 브리핑
/hpc [status|jobs] — 클러스터 상태/잡
/trace — 최근 도구 실행 기록
/tools — 사용 가능한 도구
/skills — 로드된 스킬
/wrong — 마지막 답변을 잘못됐다고 표시
/feedback — 최근 교정 목록
/index — 노트 재색인
/vault search <질문> — 노트 검색
/mail_digest /mail_accounts /mail_urgent /mail_promo
/mail_actions [대상] — 메일 정리 제안
/reload — 스킬/프롬프트 리로드

다른 메시지는 그대로 대화로 처리돼.";

// ── HTTP client ──────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct TelegramClient {
    client: Client,
    base_url: String,
}

impl TelegramClient {
    pub fn from_env() -> Result<Self> {
        let token = std::env::var("TELEGRAM_BOT_TOKEN")
            .map_err(|_| anyhow::anyhow!("TELEGRAM_BOT_TOKEN is not set"))?;
        if token.trim().is_empty() {
            bail!("TELEGRAM_BOT_TOKEN is empty");
        }
        Ok(Self {
            client: Client::new(),
            base_url: format!("https://api.telegram.org/bot{token}"),
        })
    }

    async fn fetch_updates(&self, offset: i64) -> Result<Vec<TelegramUpdate>> {
        let response = self
            .client
            .get(format!("{}/getUpdates", self.base_url))
            .query(&[("timeout", "25"), ("offset", &offset.to_string())])
            .send()
            .await?
            .error_for_status()?;

        let payload: TelegramResponse<Vec<TelegramUpdate>> = response.json().await?;
        if !payload.ok {
            bail!(payload.description.unwrap_or_else(|| "telegram getUpdates failed".to_string()));
        }
        Ok(payload.result.unwrap_or_default())
    }

    /// Send a message, attempting markdown first and falling back to plain
    /// text when the transport rejects the formatting.
    async fn send_message(&self, chat_id: i64, text: &str) -> Result<()> {
        let markdown = self
            .send_raw(chat_id, text, Some("Markdown"), None)
            .await;
        if markdown.is_ok() {
            return Ok(());
        }
        self.send_raw(chat_id, text, None, None).await
    }

    async fn send_with_buttons(
        &self,
        chat_id: i64,
        text: &str,
        buttons: &[(&str, &str)],
    ) -> Result<()> {
        let keyboard = serde_json::json!({
            "inline_keyboard": [buttons
                .iter()
                .map(|(label, data)| serde_json::json!({"text": label, "callback_data": data}))
                .collect::<Vec<_>>()],
        });
        self.send_raw(chat_id, text, None, Some(keyboard)).await
    }

    async fn send_raw(
        &self,
        chat_id: i64,
        text: &str,
        parse_mode: Option<&str>,
        reply_markup: Option<serde_json::Value>,
    ) -> Result<()> {
        let mut body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
            "disable_web_page_preview": true,
        });
        if let Some(mode) = parse_mode {
            body["parse_mode"] = serde_json::json!(mode);
        }
        if let Some(markup) = reply_markup {
            body["reply_markup"] = markup;
        }

        let response = self
            .client
            .post(format!("{}/sendMessage", self.base_url))
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        let payload: TelegramResponse<serde_json::Value> = response.json().await?;
        if !payload.ok {
            bail!(payload.description.unwrap_or_else(|| "telegram sendMessage failed".to_string()));
        }
        Ok(())
    }

    async fn answer_callback(&self, callback_id: &str, text: &str) -> Result<()> {
        let body = serde_json::json!({"callback_query_id": callback_id, "text": text});
        self.client
            .post(format!("{}/answerCallbackQuery", self.base_url))
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn edit_message_text(&self, chat_id: i64, message_id: i64, text: &str) -> Result<()> {
        let body = serde_json::json!({
            "chat_id": chat_id,
            "message_id": message_id,
            "text": text,
        });
        self.client
            .post(format!("{}/editMessageText", self.base_url))
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

// ── Bot ──────────────────────────────────────────────────────────────────────

pub struct Bot {
    client: TelegramClient,
    config: AppConfig,
    router: Arc<Router>,
    gate: Arc<ApprovalGate>,
    tools: Arc<ToolRegistry>,
    skills: Arc<SkillRegistry>,
    trace: Arc<TraceLogger>,
    feedback: Arc<FeedbackManager>,
    store: Arc<MemoryStore>,
    vault: Arc<VaultIndexer>,
    mail: MailBridge,
    triage: Arc<MailTriage>,
    history_by_chat: Mutex<HashMap<i64, Vec<Turn>>>,
    last_reply_by_chat: Mutex<HashMap<i64, String>>,
}

impl Bot {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: TelegramClient,
        config: AppConfig,
        router: Arc<Router>,
        gate: Arc<ApprovalGate>,
        tools: Arc<ToolRegistry>,
        skills: Arc<SkillRegistry>,
        trace: Arc<TraceLogger>,
        feedback: Arc<FeedbackManager>,
        store: Arc<MemoryStore>,
        vault: Arc<VaultIndexer>,
        mail: MailBridge,
        triage: Arc<MailTriage>,
    ) -> Self {
        Self {
            client,
            config,
            router,
            gate,
            tools,
            skills,
            trace,
            feedback,
            store,
            vault,
            mail,
            triage,
            history_by_chat: Mutex::new(HashMap::new()),
            last_reply_by_chat: Mutex::new(HashMap::new()),
        }
    }

    async fn handle_message(self: Arc<Self>, chat_id: i64, text: String) {
        let text = normalize_command(&text);
        let response = if text.starts_with('/') {
            self.handle_command(chat_id, &text).await
        } else {
            self.handle_chat(chat_id, &text).await
        };

        let response = match response {
            Ok(response) if response.trim().is_empty() => "(no response)".to_string(),
            Ok(response) => response,
            Err(err) => {
                error!(chat_id, %err, "handler error");
                format!("error: {err}")
            }
        };

        for chunk in chunk_message(&response, MAX_MESSAGE_CHARS) {
            if let Err(err) = self.client.send_message(chat_id, &chunk).await {
                error!(chat_id, %err, "sendMessage failed");
            }
        }
    }

    async fn handle_chat(&self, chat_id: i64, text: &str) -> Result<String> {
        let session_id = session_for(chat_id);
        let history = self
            .history_by_chat
            .lock()
            .await
            .get(&chat_id)
            .cloned()
            .unwrap_or_default();

        let outcome = self
            .router
            .route(text, &history, &session_id, Some(self), Some(chat_id))
            .await;

        {
            let mut histories = self.history_by_chat.lock().await;
            let entry = histories.entry(chat_id).or_default();
            entry.push(Turn::User(text.to_string()));
            entry.push(Turn::Assistant(outcome.response.clone()));
            let overflow = entry.len().saturating_sub(HISTORY_WINDOW);
            if overflow > 0 {
                entry.drain(..overflow);
            }
        }
        self.last_reply_by_chat
            .lock()
            .await
            .insert(chat_id, outcome.response.clone());

        if outcome.tools_used.is_empty() {
            Ok(outcome.response)
        } else {
            Ok(format!("{}\n\n(도구: {})", outcome.response, outcome.tools_used.join(", ")))
        }
    }

    async fn handle_command(&self, chat_id: i64, line: &str) -> Result<String> {
        let (command, rest) = match line.split_once(char::is_whitespace) {
            Some((cmd, rest)) => (cmd, rest.trim()),
            None => (line, ""),
        };

        match command {
            "/start" | "/help" => Ok(HELP_TEXT.to_string()),
            "/status" => Ok(self.status_text()),
            "/mail" => self.classify_inbox().await,
            "/search" => {
                if rest.is_empty() {
                    return Ok("사용법: /search <질문>".to_string());
                }
                let context = self.store.get_relevant_context(rest, 5).await;
                Ok(if context.is_empty() { "관련 기억이 없어.".to_string() } else { context })
            }
            "/schedule" => Ok(self.tools.execute("get_calendar_briefing", &serde_json::json!({})).await),
            "/hpc" => {
                let args = match rest.split_whitespace().next() {
                    Some("jobs") => serde_json::json!({}),
                    Some(job_id) if job_id != "status" => serde_json::json!({"job_id": job_id}),
                    _ => {
                        return Ok(self
                            .tools
                            .execute("check_hpc_connection", &serde_json::json!({}))
                            .await);
                    }
                };
                Ok(self.tools.execute("monitor_hpc_job", &args).await)
            }
            "/trace" => {
                let rows = self.trace.recent(10)?;
                if rows.is_empty() {
                    return Ok("기록이 없어.".to_string());
                }
                Ok(rows
                    .iter()
                    .map(|r| format!("[{}] {} ({}) → {}", r.timestamp, r.tool, r.approval_level, clip(&r.result, 80)))
                    .collect::<Vec<_>>()
                    .join("\n"))
            }
            "/tools" => {
                let defs = self.tools.list_defs();
                Ok(defs
                    .iter()
                    .map(|d| format!("- {}: {}", d.name, d.description))
                    .collect::<Vec<_>>()
                    .join("\n"))
            }
            "/skills" => {
                let skills = self.skills.list_all();
                if skills.is_empty() {
                    return Ok("로드된 스킬이 없어.".to_string());
                }
                Ok(skills
                    .iter()
                    .map(|s| format!("- {} (triggers: {})", s.name, s.triggers.join(", ")))
                    .collect::<Vec<_>>()
                    .join("\n"))
            }
            "/wrong" => {
                let last = self.last_reply_by_chat.lock().await.get(&chat_id).cloned();
                match last {
                    Some(last) if !last.is_empty() => {
                        self.feedback
                            .save_correction(
                                &session_for(chat_id),
                                &last,
                                "(/wrong) 마지막 답변이 잘못됨",
                                None,
                            )
                            .await?;
                        Ok("기록했어. 다음엔 안 틀릴게.".to_string())
                    }
                    _ => Ok("잘못됐다고 표시할 답변이 없어.".to_string()),
                }
            }
            "/feedback" => {
                let rows = self.feedback.get_recent_feedback(5)?;
                if rows.is_empty() {
                    return Ok("교정 기록이 없어.".to_string());
                }
                Ok(rows
                    .iter()
                    .map(|r| format!("- 잘못: {} → 교정: {}", clip(&r.original_action, 60), clip(&r.correction, 60)))
                    .collect::<Vec<_>>()
                    .join("\n"))
            }
            "/index" => {
                let stats = self.vault.index_vault(false, None).await;
                Ok(format!(
                    "색인 완료: 전체 {} / 신규 {} / 갱신 {} / 생략 {} / 오류 {}",
                    stats.total, stats.new, stats.updated, stats.skipped, stats.errors,
                ))
            }
            "/vault" => {
                let query = rest.strip_prefix("search").map(str::trim).unwrap_or(rest);
                if query.is_empty() {
                    return Ok("사용법: /vault search <질문>".to_string());
                }
                let hits = self.vault.search_vault_knowledge(query, 3).await?;
                if hits.is_empty() {
                    return Ok("관련 노트가 없어.".to_string());
                }
                Ok(hits
                    .iter()
                    .map(|h| format!("- {}: {}", h.title, clip(&h.content, 200)))
                    .collect::<Vec<_>>()
                    .join("\n"))
            }
            "/mail_digest" => self.mail.get("/digest").await,
            "/mail_accounts" => self.mail.get("/accounts").await,
            "/mail_urgent" => self.mail.get("/urgent").await,
            "/mail_promo" => self.mail.get("/promo").await,
            "/mail_actions" => {
                self.mail
                    .post("/actions/propose", &serde_json::json!({"target": rest}))
                    .await
            }
            "/reload" => {
                self.skills.refresh();
                Ok("스킬/프롬프트 리로드 완료.".to_string())
            }
            _ => Ok("unknown command. use /help".to_string()),
        }
    }

    /// Fetch the inbox digest from the bridge and run each mail through the
    /// quorum classifier.
    async fn classify_inbox(&self) -> Result<String> {
        let digest = self.mail.get("/digest").await?;
        let parsed: serde_json::Value = serde_json::from_str(&digest)
            .map_err(|err| anyhow::anyhow!("mail digest is not JSON: {err}"))?;
        let items = parsed
            .get("mails")
            .or_else(|| parsed.get("items"))
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_else(|| parsed.as_array().cloned().unwrap_or_default());
        if items.is_empty() {
            return Ok("분석할 메일이 없어.".to_string());
        }

        let mut lines = vec![format!("메일 {}건 분류:", items.len())];
        for item in items.iter().take(5) {
            let subject = item.get("subject").and_then(|v| v.as_str()).unwrap_or("(no subject)");
            let sender = item.get("sender").and_then(|v| v.as_str()).unwrap_or("");
            let content = item.get("content").and_then(|v| v.as_str()).unwrap_or("");
            let verdict = self.triage.classify(subject, sender, content).await;
            lines.push(format!(
                "[{}] {} (확신도 {:.2})",
                verdict.category, subject, verdict.confidence,
            ));
        }
        if items.len() > 5 {
            lines.push(format!("... 외 {}건", items.len() - 5));
        }
        Ok(lines.join("\n"))
    }

    fn status_text(&self) -> String {
        [
            format!("backend: {}", self.config.llm.backend),
            format!("model (chat): {}", self.config.llm.model_fast),
            format!("model (tools): {}", self.config.llm.model_full),
            format!("embedder: {}", if self.store.embedder().is_available() { "available" } else { "absent (keyword fallback)" }),
            format!("tools: {}", self.tools.list_defs().len()),
            format!("skills: {}", self.skills.list_all().len()),
            format!("pending approvals: {}", self.gate.pending_count()),
        ]
        .join("\n")
    }

    async fn handle_callback(&self, callback: TelegramCallbackQuery) {
        let data = callback.data.unwrap_or_default();
        let reply = self.gate.handle_callback(&data);
        if let Err(err) = self.client.answer_callback(&callback.id, reply).await {
            warn!(%err, "answerCallbackQuery failed");
        }
        // Stamp the decision onto the approval message.
        if reply != "This request has expired." {
            if let Some(message) = callback.message {
                let stamped = format!("{}\n\n-- {} --", message.text.unwrap_or_default(), reply);
                if let Err(err) = self
                    .client
                    .edit_message_text(message.chat.id, message.message_id, &stamped)
                    .await
                {
                    warn!(%err, "editMessageText failed");
                }
            }
        }
    }
}

#[async_trait]
impl ApprovalTransport for Bot {
    async fn request_approval(
        &self,
        chat_id: i64,
        text: &str,
        approve_data: &str,
        deny_data: &str,
    ) -> Result<()> {
        self.client
            .send_with_buttons(chat_id, text, &[("Yes", approve_data), ("No", deny_data)])
            .await
    }

    async fn notify(&self, chat_id: i64, text: &str) -> Result<()> {
        self.client.send_message(chat_id, text).await
    }
}

// ── Update loop ──────────────────────────────────────────────────────────────

pub async fn start_bot(bot: Arc<Bot>) -> Result<()> {
    let mut offset: i64 = 0;
    info!("telegram bot listening for updates");

    loop {
        let updates = match bot.client.fetch_updates(offset).await {
            Ok(updates) => updates,
            Err(err) => {
                let err_str = err.to_string();
                if err_str.contains("409") {
                    // Another instance is polling — back off and let it win.
                    warn!("409 Conflict: another bot instance is running; waiting 15s");
                    tokio::time::sleep(Duration::from_secs(15)).await;
                } else {
                    warn!(%err, "getUpdates failed; retrying in 5s");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
                continue;
            }
        };

        for update in updates {
            offset = update.update_id + 1;

            if let Some(callback) = update.callback_query {
                bot.handle_callback(callback).await;
                continue;
            }

            let Some(message) = update.message else { continue };
            let Some(text) = message.text else { continue };
            let chat_id = message.chat.id;

            // Spawned so an approval wait never blocks the update loop.
            tokio::spawn(bot.clone().handle_message(chat_id, text.trim().to_string()));
        }

        tokio::time::sleep(Duration::from_millis(300)).await;
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn session_for(chat_id: i64) -> String {
    format!("tg-{chat_id}")
}

/// Strip the `@botname` suffix Telegram appends to commands in groups.
fn normalize_command(text: &str) -> String {
    let trimmed = text.trim();
    if !trimmed.starts_with('/') {
        return trimmed.to_string();
    }

    let mut parts = trimmed.splitn(2, char::is_whitespace);
    let command = parts.next().unwrap_or_default();
    let rest = parts.next().unwrap_or("").trim();

    let command = command.split_once('@').map(|(base, _)| base).unwrap_or(command);

    if rest.is_empty() {
        command.to_string()
    } else {
        format!("{command} {rest}")
    }
}

fn clip(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let clipped: String = text.chars().take(max_chars).collect();
    format!("{clipped}...")
}

fn chunk_message(text: &str, max_chars: usize) -> Vec<String> {
    if text.chars().count() <= max_chars {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for line in text.lines() {
        let line_len = line.chars().count() + 1;
        if current_len > 0 && current_len + line_len > max_chars {
            chunks.push(current.trim_end().to_string());
            current.clear();
            current_len = 0;
        }
        current.push_str(line);
        current.push('\n');
        current_len += line_len;
    }

    if !current.trim().is_empty() {
        chunks.push(current.trim_end().to_string());
    }
    if chunks.is_empty() {
        chunks.push(text.to_string());
    }
    chunks
}

// ── Wire types ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct TelegramResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelegramUpdate {
    update_id: i64,
    message: Option<TelegramMessage>,
    callback_query: Option<TelegramCallbackQuery>,
}

#[derive(Debug, Deserialize)]
struct TelegramMessage {
    message_id: i64,
    chat: TelegramChat,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelegramChat {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct TelegramCallbackQuery {
    id: String,
    data: Option<String>,
    message: Option<TelegramMessage>,
}
