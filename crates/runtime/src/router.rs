//! The ReAct router.
//!
//! One `route` call per user turn: match skills, bound the toolset, preflight
//! zero-argument chain tools, assemble the layered prompt, then drive the LLM
//! through tool-call / tool-result rounds under the approval gate. Every tool
//! invocation is traced; conversation, corrections, and facts are persisted
//! after the model call so embedding work never serialises with model loading.
//! No error escapes this boundary — failures become short diagnostic replies.

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info, warn};

use borealis_audit::TraceLogger;
use borealis_config::AppConfig;
use borealis_exec::{ApprovalGate, ApprovalOutcome, ApprovalTransport, RiskLevel};
use borealis_llm::{ChatBackend, LlmError, Turn};
use borealis_memory::{FactExtractor, FeedbackManager, MasterPrompt, MemoryStore, VaultIndexer};
use borealis_skills::{Skill, SkillRegistry};
use borealis_tools::{ToolDef, ToolRegistry, defs_to_openai_tools, looks_like_tool_error};

use crate::prompt::{PromptInputs, build_system_prompt, clip};

pub const MAX_ITERATIONS: usize = 10;

const RECENT_TURNS_IN_PROMPT: usize = 5;
const VAULT_HITS_IN_PROMPT: usize = 2;
const FEEDBACK_IN_PROMPT: usize = 3;

const PAID_OPTIN_REFUSAL: &str = "This request requires a paid API (Anthropic). \
    Set BOREALIS_ALLOW_PAID_API=true to enable, or use the default local backend.";
const NO_SKILL_TOOLS_REFUSAL: &str = "이 요청은 도구 실행이 필수인데, 사용 가능한 스킬 도구를 찾지 못했어. \
    스킬 설정(tool_chain/tools_required)을 확인해줘.";
const TOOL_REQUIRED_REFUSAL: &str = "이 요청은 도구 실행 결과가 있어야 답변할 수 있어. \
    현재 도구 호출이 없었거나 모두 실패해서 추정 답변은 제공하지 않을게.";
const MAX_ITERATIONS_FALLBACK: &str = "I was unable to complete the request within the allowed steps.";

/// Keyword map for smart tool selection. Only tools whose keywords match the
/// user message are sent to the LLM, which keeps simple turns cheap. Tuned by
/// hand against real traffic; adjust per tool, not wholesale.
const TOOL_KEYWORDS: &[(&str, &[&str])] = &[
    ("search_arxiv", &["arxiv", "paper", "논문", "검색", "연구", "search"]),
    ("search_semantic_scholar", &["paper", "논문", "semantic", "scholar", "검색"]),
    ("download_paper_pdf", &["download", "pdf", "다운로드", "다운", "받아"]),
    ("analyze_paper", &["analyze", "분석", "paper", "논문"]),
    ("get_calendar_briefing", &["calendar", "schedule", "일정", "캘린더", "스케줄"]),
    ("add_calendar_event", &["calendar", "event", "일정 추가", "약속 추가", "일정 등록"]),
    ("analyze_emails", &["email", "mail", "이메일", "메일"]),
    ("fetch_mail_digest", &["메일", "이메일", "요약", "digest", "inbox"]),
    ("fetch_urgent_mails", &["긴급", "urgent", "메일", "이메일"]),
    ("fetch_promo_deals", &["딜", "프로모션", "할인", "coupon", "deal"]),
    ("propose_mail_actions", &["메일 정리", "정리", "archive", "라벨", "actions"]),
    ("execute_mail_actions", &["정리 실행", "archive", "라벨 적용", "mark read"]),
    ("monitor_hpc_job", &["hpc", "job", "vasp", "계산", "클러스터", "잡"]),
    ("check_hpc_connection", &["hpc", "connection", "ssh", "서버"]),
    ("submit_hpc_job", &["제출", "submit", "qsub", "sbatch"]),
    ("send_email_reply", &["답장", "reply"]),
    ("advisor_handle", &["박사", "연구 진행", "advisor"]),
];

#[derive(Debug, Clone)]
pub struct RouterOutcome {
    pub response: String,
    pub tools_used: Vec<String>,
}

/// Tool policy derived from the matched skills.
#[derive(Debug, Clone, Default)]
pub struct Enforcement {
    pub requires_tool: bool,
    pub strict_mode: bool,
    pub allowed_tools: Vec<String>,
    pub chain_tools: Vec<String>,
    /// Chain tools with no required parameters, runnable before the LLM turn.
    pub preflight_tools: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct PreflightResult {
    pub name: String,
    pub content: String,
    pub ok: bool,
}

pub struct Router {
    config: AppConfig,
    backend: Arc<dyn ChatBackend>,
    store: Arc<MemoryStore>,
    master_prompt: Arc<MasterPrompt>,
    vault: Arc<VaultIndexer>,
    facts: Arc<FactExtractor>,
    feedback: Arc<FeedbackManager>,
    skills: Arc<SkillRegistry>,
    tools: Arc<ToolRegistry>,
    gate: Arc<ApprovalGate>,
    trace: Arc<TraceLogger>,
    max_iterations: usize,
}

impl Router {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: AppConfig,
        backend: Arc<dyn ChatBackend>,
        store: Arc<MemoryStore>,
        master_prompt: Arc<MasterPrompt>,
        vault: Arc<VaultIndexer>,
        facts: Arc<FactExtractor>,
        feedback: Arc<FeedbackManager>,
        skills: Arc<SkillRegistry>,
        tools: Arc<ToolRegistry>,
        gate: Arc<ApprovalGate>,
        trace: Arc<TraceLogger>,
    ) -> Self {
        Self {
            config,
            backend,
            store,
            master_prompt,
            vault,
            facts,
            feedback,
            skills,
            tools,
            gate,
            trace,
            max_iterations: MAX_ITERATIONS,
        }
    }

    pub fn gate(&self) -> &Arc<ApprovalGate> {
        &self.gate
    }

    pub fn skills(&self) -> &Arc<SkillRegistry> {
        &self.skills
    }

    // ── Main routing ─────────────────────────────────────────────────────────

    /// Route one user turn through the ReAct loop and persist its outcome.
    pub async fn route(
        &self,
        message: &str,
        history: &[Turn],
        session_id: &str,
        transport: Option<&dyn ApprovalTransport>,
        chat_id: Option<i64>,
    ) -> RouterOutcome {
        let outcome = if self.config.paid_backend_selected() && !self.config.llm.allow_paid_api {
            RouterOutcome {
                response: PAID_OPTIN_REFUSAL.to_string(),
                tools_used: Vec::new(),
            }
        } else {
            self.run_react_loop(message, history, session_id, transport, chat_id)
                .await
        };

        self.persist_turn(message, history, session_id, &outcome).await;
        outcome
    }

    async fn run_react_loop(
        &self,
        message: &str,
        history: &[Turn],
        session_id: &str,
        transport: Option<&dyn ApprovalTransport>,
        chat_id: Option<i64>,
    ) -> RouterOutcome {
        let mut tools_used: Vec<String> = Vec::new();
        let mut successful_tools: Vec<String> = Vec::new();

        let matched_skills = self.skills.match_skills(message);
        let all_defs = self.tools.list_defs();
        let enforcement = resolve_enforcement(&matched_skills, &all_defs);

        let relevant_tools: Vec<ToolDef> =
            if enforcement.requires_tool && !enforcement.allowed_tools.is_empty() {
                enforcement
                    .allowed_tools
                    .iter()
                    .filter_map(|name| all_defs.iter().find(|d| &d.name == name).cloned())
                    .collect()
            } else {
                select_relevant_tools(message, &all_defs)
            };

        if enforcement.requires_tool && relevant_tools.is_empty() {
            return RouterOutcome {
                response: NO_SKILL_TOOLS_REFUSAL.to_string(),
                tools_used,
            };
        }

        // Preflight: run the zero-argument chain tools before the model turn.
        let preflight_results = self
            .execute_preflight(&enforcement.preflight_tools, session_id)
            .await;
        for item in &preflight_results {
            tools_used.push(item.name.clone());
            if item.ok {
                successful_tools.push(item.name.clone());
            }
        }

        let system_prompt = self
            .assemble_system_prompt(message, session_id, &matched_skills, &relevant_tools, &enforcement, &preflight_results)
            .await;

        let mut transcript: Vec<Turn> = vec![Turn::System(system_prompt)];
        transcript.extend_from_slice(history);
        transcript.push(Turn::User(message.to_string()));

        let has_tools = !relevant_tools.is_empty();
        let tools_json = has_tools.then(|| defs_to_openai_tools(&relevant_tools));
        let model = self.config.active_model(has_tools).to_string();
        info!(%model, tools = relevant_tools.len(), "routing turn");

        let mut last_text = String::new();
        for iteration in 0..self.max_iterations {
            debug!(iteration, transcript_len = transcript.len(), "react iteration");

            let outcome = match self
                .backend
                .chat(&model, &transcript, tools_json.as_ref(), self.config.llm.max_tokens)
                .await
            {
                Ok(outcome) => outcome,
                Err(err) => {
                    return RouterOutcome {
                        response: diagnostic_for(&err),
                        tools_used,
                    };
                }
            };

            if outcome.requests.is_empty() {
                // Final answer.
                if enforcement.requires_tool && successful_tools.is_empty() {
                    return RouterOutcome {
                        response: TOOL_REQUIRED_REFUSAL.to_string(),
                        tools_used,
                    };
                }
                return RouterOutcome { response: outcome.text, tools_used };
            }

            info!(count = outcome.requests.len(), "LLM requested tool calls");
            last_text = outcome.text.clone();
            let thought = outcome.text.clone();
            transcript.push(Turn::ToolRequest(outcome.requests.clone()));

            for call in &outcome.requests {
                let name = call.name.clone();
                let args = if call.args.is_object() {
                    call.args.clone()
                } else {
                    json!({})
                };
                tools_used.push(name.clone());

                let gate_result = self
                    .gate
                    .execute_with_approval(
                        &name,
                        &args,
                        || async { self.tools.execute(&name, &args).await },
                        transport,
                        chat_id,
                    )
                    .await;

                let result_text = match (&gate_result.outcome, &gate_result.result) {
                    (ApprovalOutcome::Approved, Some(result)) => result.clone(),
                    (ApprovalOutcome::TimedOut, _) => {
                        format!("Approval for tool '{name}' timed out; action denied.")
                    }
                    _ => format!("Tool '{name}' was denied by the user; not executed."),
                };

                if gate_result.approved && !looks_like_tool_error(&result_text) {
                    successful_tools.push(name.clone());
                }

                let approved_by = match (gate_result.outcome, gate_result.level) {
                    (ApprovalOutcome::Approved, RiskLevel::Auto) => "auto",
                    (ApprovalOutcome::Approved, _) => "user",
                    (ApprovalOutcome::Denied, _) => "denied",
                    (ApprovalOutcome::TimedOut, _) => "timeout",
                };
                if let Err(err) = self.trace.log(
                    &thought,
                    &name,
                    &args,
                    &result_text,
                    gate_result.level.as_str(),
                    approved_by,
                    session_id,
                ) {
                    warn!(%err, tool = %name, "failed to write trace row");
                }

                transcript.push(Turn::ToolObservation {
                    call_id: call.call_id.clone(),
                    payload: result_text,
                });
            }
        }

        warn!(max = self.max_iterations, "react loop exhausted");
        let response = if last_text.is_empty() {
            MAX_ITERATIONS_FALLBACK.to_string()
        } else {
            last_text
        };
        RouterOutcome { response, tools_used }
    }

    // ── Preflight ────────────────────────────────────────────────────────────

    async fn execute_preflight(&self, tool_names: &[String], session_id: &str) -> Vec<PreflightResult> {
        let mut results = Vec::new();
        for name in tool_names {
            let args = json!({});
            let content = self.tools.execute(name, &args).await;
            let ok = !looks_like_tool_error(&content);
            if let Err(err) = self.trace.log(
                "preflight",
                name,
                &args,
                &content,
                RiskLevel::Auto.as_str(),
                "preflight",
                session_id,
            ) {
                warn!(%err, tool = %name, "failed to trace preflight execution");
            }
            results.push(PreflightResult { name: name.clone(), content, ok });
        }
        results
    }

    // ── Prompt assembly ──────────────────────────────────────────────────────

    async fn assemble_system_prompt(
        &self,
        message: &str,
        session_id: &str,
        matched_skills: &[Skill],
        relevant_tools: &[ToolDef],
        enforcement: &Enforcement,
        preflight_results: &[PreflightResult],
    ) -> String {
        // Every retrieval layer is best-effort — a failed read degrades to an
        // absent block, never to a failed turn.
        let recent_turns = self
            .store
            .get_recent(session_id, RECENT_TURNS_IN_PROMPT)
            .unwrap_or_else(|err| {
                warn!(%err, "failed to read recent conversation");
                Vec::new()
            });

        let vault_hits = match self.vault.search_vault_knowledge(message, VAULT_HITS_IN_PROMPT).await {
            Ok(hits) => hits,
            Err(err) => {
                debug!(%err, "vault knowledge injection skipped");
                Vec::new()
            }
        };

        let caution = match self.feedback.get_relevant_feedback(message, FEEDBACK_IN_PROMPT).await {
            Ok(rows) => FeedbackManager::format_as_caution(&rows),
            Err(err) => {
                debug!(%err, "feedback injection skipped");
                String::new()
            }
        };

        build_system_prompt(&PromptInputs {
            master_prompt: &self.master_prompt,
            matched_skills,
            has_tools: !relevant_tools.is_empty(),
            recent_turns: &recent_turns,
            vault_hits: &vault_hits,
            caution: &caution,
            enforcement,
            preflight_results,
        })
    }

    // ── Post-turn persistence ────────────────────────────────────────────────

    /// Strict order: correction detection, then conversation rows (user
    /// first), then fact extraction. All best-effort.
    async fn persist_turn(
        &self,
        message: &str,
        history: &[Turn],
        session_id: &str,
        outcome: &RouterOutcome,
    ) {
        if session_id.is_empty() {
            return;
        }

        if FeedbackManager::detect_correction(message) {
            let prev_response = history
                .iter()
                .rev()
                .find_map(|turn| match turn {
                    Turn::Assistant(text) if !text.is_empty() => Some(text.clone()),
                    _ => None,
                })
                .unwrap_or_default();
            match self.feedback.save_correction(session_id, &prev_response, message, None).await {
                Ok(_) => info!(session_id, "correction detected and saved"),
                Err(err) => debug!(%err, "correction save failed"),
            }
        }

        if let Err(err) = self.store.save_conversation(session_id, "user", message).await {
            warn!(%err, "failed to save user message to memory");
        }
        if !outcome.response.is_empty() {
            if let Err(err) = self
                .store
                .save_conversation(session_id, "assistant", &outcome.response)
                .await
            {
                warn!(%err, "failed to save assistant response to memory");
            }
        }

        if FactExtractor::should_extract(message) {
            let facts = FactExtractor::extract_facts(message);
            if !facts.is_empty() {
                let saved = self.facts.save_and_update(&facts).await;
                info!(saved, session_id, "facts extracted");
            }
        }
    }
}

// ── Policy helpers (pure) ────────────────────────────────────────────────────

/// Build the enforcement policy from matched skills. Only skills with
/// `requires_tool` contribute; tool order is first-seen across the chain.
pub fn resolve_enforcement(matched_skills: &[Skill], known_tools: &[ToolDef]) -> Enforcement {
    let mut enforcement = Enforcement::default();

    for skill in matched_skills {
        if !skill.requires_tool {
            continue;
        }
        enforcement.requires_tool = true;
        enforcement.strict_mode = enforcement.strict_mode || skill.strict_mode;

        let ordered = if skill.tool_chain.is_empty() {
            &skill.tools_required
        } else {
            &skill.tool_chain
        };
        for name in ordered {
            if !enforcement.allowed_tools.contains(name) {
                enforcement.allowed_tools.push(name.clone());
            }
            if !enforcement.chain_tools.contains(name) {
                enforcement.chain_tools.push(name.clone());
            }
            let Some(def) = known_tools.iter().find(|d| &d.name == name) else {
                continue;
            };
            if def.required_params().is_empty() && !enforcement.preflight_tools.contains(name) {
                enforcement.preflight_tools.push(name.clone());
            }
        }
    }

    enforcement
}

/// Keyword-filter the full toolset down to what the message plausibly needs.
pub fn select_relevant_tools(message: &str, all_defs: &[ToolDef]) -> Vec<ToolDef> {
    let msg_lower = message.to_lowercase();
    let relevant: Vec<ToolDef> = all_defs
        .iter()
        .filter(|def| {
            TOOL_KEYWORDS
                .iter()
                .find(|(name, _)| *name == def.name)
                .is_some_and(|(_, keywords)| keywords.iter().any(|kw| msg_lower.contains(kw)))
        })
        .cloned()
        .collect();

    if relevant.is_empty() {
        debug!("no tools selected — pure conversation mode");
    } else {
        info!(
            selected = relevant.len(),
            total = all_defs.len(),
            "tools selected for message"
        );
    }
    relevant
}

fn diagnostic_for(err: &LlmError) -> String {
    match err {
        LlmError::Auth => "Authentication error: please check the API configuration.".to_string(),
        LlmError::Api { status, body } => format!("API error ({status}): {}", clip(body, 200)),
        LlmError::Transport(detail) => format!("LLM backend unreachable: {detail}"),
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use borealis_llm::{ChatOutcome, ToolInvocation};
    use borealis_memory::Embedder;
    use borealis_tools::Tool;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Mutex as AsyncMutex;

    // ── Stub LLM backend ────────────────────────────────────────────────────

    struct ScriptedBackend {
        outcomes: Mutex<VecDeque<ChatOutcome>>,
        seen_prompts: Mutex<Vec<String>>,
    }

    impl ScriptedBackend {
        fn new(outcomes: Vec<ChatOutcome>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into()),
                seen_prompts: Mutex::new(Vec::new()),
            })
        }

        fn system_prompts(&self) -> Vec<String> {
            self.seen_prompts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChatBackend for ScriptedBackend {
        async fn chat(
            &self,
            _model: &str,
            turns: &[Turn],
            _tools: Option<&serde_json::Value>,
            _max_tokens: u32,
        ) -> std::result::Result<ChatOutcome, LlmError> {
            if let Some(Turn::System(system)) = turns.first() {
                self.seen_prompts.lock().unwrap().push(system.clone());
            }
            Ok(self
                .outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| ChatOutcome::reply("(scripted backend exhausted)")))
        }
    }

    fn tool_call(name: &str, args: serde_json::Value) -> ChatOutcome {
        ChatOutcome {
            text: String::new(),
            requests: vec![ToolInvocation {
                call_id: "call_1".to_string(),
                name: name.to_string(),
                args,
            }],
            finish_reason: "tool_calls".to_string(),
        }
    }

    // ── Stub tools ──────────────────────────────────────────────────────────

    struct StubSearchTool;

    #[async_trait]
    impl Tool for StubSearchTool {
        fn def(&self) -> ToolDef {
            ToolDef {
                name: "search_arxiv".to_string(),
                description: "stub arxiv search".to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {"query": {"type": "string"}},
                    "required": ["query"]
                }),
            }
        }
        async fn run(&self, _args: &serde_json::Value) -> Result<String> {
            Ok(json!({"papers": [], "count": 3}).to_string())
        }
    }

    struct StubDownloadTool {
        executed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Tool for StubDownloadTool {
        fn def(&self) -> ToolDef {
            ToolDef {
                name: "download_paper_pdf".to_string(),
                description: "stub pdf download".to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "pdf_url": {"type": "string"},
                        "save_path": {"type": "string"}
                    },
                    "required": ["pdf_url", "save_path"]
                }),
            }
        }
        async fn run(&self, _args: &serde_json::Value) -> Result<String> {
            self.executed.store(true, Ordering::SeqCst);
            Ok(json!({"success": true}).to_string())
        }
    }

    // ── Stub approval transport that presses "No" ───────────────────────────

    struct DenyingTransport {
        callbacks: AsyncMutex<Vec<String>>,
    }

    #[async_trait]
    impl ApprovalTransport for DenyingTransport {
        async fn request_approval(
            &self,
            _chat_id: i64,
            _text: &str,
            _approve_data: &str,
            deny_data: &str,
        ) -> Result<()> {
            self.callbacks.lock().await.push(deny_data.to_string());
            Ok(())
        }
        async fn notify(&self, _chat_id: i64, _text: &str) -> Result<()> {
            Ok(())
        }
    }

    // ── Harness ─────────────────────────────────────────────────────────────

    struct Harness {
        router: Router,
        backend: Arc<ScriptedBackend>,
        store: Arc<MemoryStore>,
        trace: Arc<TraceLogger>,
        feedback: Arc<FeedbackManager>,
        _dir: tempfile::TempDir,
    }

    fn harness(outcomes: Vec<ChatOutcome>, extra_tools: Vec<Box<dyn Tool>>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::default();

        let store = Arc::new(MemoryStore::open_in_memory(Embedder::unavailable()).unwrap());
        let master_prompt = Arc::new(MasterPrompt::new(dir.path().join("master_prompt.md")));
        let vault = Arc::new(VaultIndexer::new(
            store.clone(),
            dir.path(),
            "My Second Brain",
            dir.path().join("vault_index.json"),
        ));
        let facts = Arc::new(FactExtractor::new(store.clone(), master_prompt.clone()));
        let feedback = Arc::new(FeedbackManager::new(store.clone()).unwrap());
        let skills = Arc::new(SkillRegistry::new(
            dir.path().join("skills").to_string_lossy(),
            vec![],
        ));

        let mut registry = ToolRegistry::default();
        registry.register(Box::new(StubSearchTool));
        for tool in extra_tools {
            registry.register(tool);
        }

        let backend = ScriptedBackend::new(outcomes);
        let trace = Arc::new(TraceLogger::open_in_memory().unwrap());
        let router = Router::new(
            config,
            backend.clone(),
            store.clone(),
            master_prompt,
            vault,
            facts,
            feedback.clone(),
            skills,
            Arc::new(registry),
            Arc::new(ApprovalGate::new()),
            trace.clone(),
        );

        Harness { router, backend, store, trace, feedback, _dir: dir }
    }

    // ── S1: pure chat, no tools ─────────────────────────────────────────────

    #[tokio::test]
    async fn pure_chat_uses_no_tools_and_persists_both_turns() {
        let h = harness(vec![ChatOutcome::reply("응 잘 지내")], vec![]);
        let outcome = h.router.route("안녕? 잘 지내?", &[], "u1", None, None).await;

        assert_eq!(outcome.response, "응 잘 지내");
        assert!(outcome.tools_used.is_empty());

        let turns = h.store.get_recent("u1", 10).unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].role, "user");
        assert_eq!(turns[1].role, "assistant");

        assert!(h.trace.recent(10).unwrap().is_empty());
    }

    // ── S2: tool turn with an AUTO tool ─────────────────────────────────────

    #[tokio::test]
    async fn arxiv_turn_executes_tool_and_traces_it() {
        let h = harness(
            vec![
                tool_call("search_arxiv", json!({"query": "MoS2"})),
                ChatOutcome::reply("MoS2 논문 3편 찾았어"),
            ],
            vec![],
        );
        let outcome = h.router.route("MoS2 논문 검색해줘", &[], "u1", None, None).await;

        assert_eq!(outcome.response, "MoS2 논문 3편 찾았어");
        assert_eq!(outcome.tools_used, vec!["search_arxiv"]);

        let traces = h.trace.recent(10).unwrap();
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0].tool, "search_arxiv");
        assert_eq!(traces[0].approval_level, "AUTO");
        assert_eq!(traces[0].approved_by, "auto");
    }

    // ── S3: gated download denied via callback ──────────────────────────────

    #[tokio::test]
    async fn denied_download_is_observed_by_the_model_and_never_runs() {
        let executed = Arc::new(AtomicBool::new(false));
        let h = harness(
            vec![
                tool_call(
                    "download_paper_pdf",
                    json!({"pdf_url": "http://x/p.pdf", "save_path": "/tmp/p.pdf"}),
                ),
                ChatOutcome::reply("다운로드 승인이 거절돼서 못 받았어"),
            ],
            vec![Box::new(StubDownloadTool { executed: executed.clone() })],
        );

        let transport = Arc::new(DenyingTransport { callbacks: AsyncMutex::new(Vec::new()) });

        // The transport records the deny payload; this task presses the button.
        let gate = h.router.gate().clone();
        let transport_clone = transport.clone();
        let answerer = tokio::spawn(async move {
            loop {
                if let Some(deny) = transport_clone.callbacks.lock().await.first().cloned() {
                    return gate.handle_callback(&deny);
                }
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        });

        let outcome = h
            .router
            .route("그 첫 번째 논문 받아줘", &[], "u1", Some(transport.as_ref()), Some(7))
            .await;

        assert_eq!(answerer.await.unwrap(), "Denied");
        assert_eq!(outcome.tools_used, vec!["download_paper_pdf"]);
        assert!(outcome.response.contains("거절"));
        assert!(!executed.load(Ordering::SeqCst), "denied tool must not run");

        let traces = h.trace.recent(10).unwrap();
        assert_eq!(traces[0].approval_level, "CONFIRM");
        assert_eq!(traces[0].approved_by, "denied");
        assert!(traces[0].result.contains("denied"));
    }

    // ── S5: correction loop ─────────────────────────────────────────────────

    #[tokio::test]
    async fn corrections_are_saved_and_surface_as_caution() {
        let h = harness(
            vec![ChatOutcome::reply("아 맞다, 1.8eV"), ChatOutcome::reply("응")],
            vec![],
        );
        let history = vec![
            Turn::User("MoS2 밴드갭 알려줘".to_string()),
            Turn::Assistant("MoS2 밴드갭은 2.0eV".to_string()),
        ];
        h.router.route("틀렸어, 1.8eV가 맞아", &history, "u1", None, None).await;

        let recent = h.feedback.get_recent_feedback(5).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].original_action, "MoS2 밴드갭은 2.0eV");
        assert_eq!(recent[0].correction, "틀렸어, 1.8eV가 맞아");

        // The next turn's system prompt carries the caution block.
        h.router.route("고마워", &[], "u1", None, None).await;
        let prompts = h.backend.system_prompts();
        let last = prompts.last().unwrap();
        assert!(last.contains("[주의: 과거 실수 기록]"));
        assert!(last.contains("1.8eV"));
    }

    // ── S6: vault hit injection ─────────────────────────────────────────────

    #[tokio::test]
    async fn vault_hits_are_injected_into_the_system_prompt() {
        let h = harness(vec![ChatOutcome::reply("밸리 분극 설명")], vec![]);
        h.store
            .save_knowledge(
                "research",
                "valley",
                "Valley polarization in MoS2 monolayer TMDC materials",
                "obsidian",
                &["tmdc".to_string()],
            )
            .await
            .unwrap();

        h.router.route("valley polarization", &[], "u1", None, None).await;

        let prompts = h.backend.system_prompts();
        let prompt = prompts.last().unwrap();
        let idx = prompt.find("[참고: 내 노트에서]").expect("vault block missing");
        assert!(prompt[idx..].contains("- valley:"));
    }

    // ── Enforcement policy ──────────────────────────────────────────────────

    fn skill(requires_tool: bool, chain: &[&str], required: &[&str]) -> Skill {
        Skill {
            name: "s".to_string(),
            description: String::new(),
            version: String::new(),
            category: String::new(),
            triggers: vec!["trigger".to_string()],
            tool_chain: chain.iter().map(|s| s.to_string()).collect(),
            tools_required: required.iter().map(|s| s.to_string()).collect(),
            requires_tool,
            strict_mode: requires_tool,
            source: borealis_skills::SkillSource::Internal,
            prompt: String::new(),
        }
    }

    fn defs() -> Vec<ToolDef> {
        vec![
            ToolDef {
                name: "search_arxiv".to_string(),
                description: String::new(),
                parameters: json!({"type": "object", "properties": {"query": {}}, "required": ["query"]}),
            },
            ToolDef {
                name: "fetch_mail_digest".to_string(),
                description: String::new(),
                parameters: json!({"type": "object", "properties": {}, "required": []}),
            },
        ]
    }

    #[test]
    fn enforcement_unions_chains_and_finds_preflights() {
        let skills = vec![
            skill(true, &["fetch_mail_digest", "search_arxiv"], &[]),
            skill(true, &[], &["search_arxiv"]),
            skill(false, &["ignored_tool"], &[]),
        ];
        let enforcement = resolve_enforcement(&skills, &defs());
        assert!(enforcement.requires_tool);
        assert!(enforcement.strict_mode);
        assert_eq!(enforcement.chain_tools, vec!["fetch_mail_digest", "search_arxiv"]);
        // Only the zero-required-param tool is preflightable.
        assert_eq!(enforcement.preflight_tools, vec!["fetch_mail_digest"]);
    }

    #[test]
    fn no_matched_skills_means_no_enforcement() {
        let enforcement = resolve_enforcement(&[], &defs());
        assert!(!enforcement.requires_tool);
        assert!(enforcement.allowed_tools.is_empty());
    }

    #[test]
    fn keyword_selection_matches_korean_and_english() {
        let all = defs();
        let selected = select_relevant_tools("MoS2 논문 검색해줘", &all);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].name, "search_arxiv");
        assert!(select_relevant_tools("안녕? 잘 지내?", &all).is_empty());
    }

    // ── Tool requirement policy ─────────────────────────────────────────────

    #[tokio::test]
    async fn required_tool_turn_without_execution_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let skills_dir = dir.path().join("skills");
        std::fs::create_dir_all(&skills_dir).unwrap();
        std::fs::write(
            skills_dir.join("paper-search.md"),
            "---\nname: paper-search\ndescription: paper lookups\ntriggers: [논문]\ntool_chain: [search_arxiv]\nrequires_tool: true\nstrict_mode: true\n---\n\n## Prompt\n논문은 도구 결과로만 답해.\n",
        )
        .unwrap();

        let store = Arc::new(MemoryStore::open_in_memory(Embedder::unavailable()).unwrap());
        let master_prompt = Arc::new(MasterPrompt::new(dir.path().join("mp.md")));
        let vault = Arc::new(VaultIndexer::new(
            store.clone(),
            dir.path(),
            "v",
            dir.path().join("idx.json"),
        ));
        let facts = Arc::new(FactExtractor::new(store.clone(), master_prompt.clone()));
        let feedback = Arc::new(FeedbackManager::new(store.clone()).unwrap());
        let skills = Arc::new(SkillRegistry::new(skills_dir.to_string_lossy(), vec![]));
        let mut registry = ToolRegistry::default();
        registry.register(Box::new(StubSearchTool));

        // The model hallucinates a direct answer instead of calling the tool.
        let backend = ScriptedBackend::new(vec![ChatOutcome::reply("MoS2 밴드갭은 1.8eV야")]);
        let router = Router::new(
            AppConfig::default(),
            backend,
            store,
            master_prompt,
            vault,
            facts,
            feedback,
            skills,
            Arc::new(registry),
            Arc::new(ApprovalGate::new()),
            Arc::new(TraceLogger::open_in_memory().unwrap()),
        );

        let outcome = router.route("MoS2 논문 찾아줘", &[], "u1", None, None).await;
        assert_eq!(outcome.response, TOOL_REQUIRED_REFUSAL);
        assert!(outcome.tools_used.is_empty());
    }

    // ── Failure semantics ───────────────────────────────────────────────────

    struct FailingBackend;

    #[async_trait]
    impl ChatBackend for FailingBackend {
        async fn chat(
            &self,
            _model: &str,
            _turns: &[Turn],
            _tools: Option<&serde_json::Value>,
            _max_tokens: u32,
        ) -> std::result::Result<ChatOutcome, LlmError> {
            Err(LlmError::Auth)
        }
    }

    #[tokio::test]
    async fn auth_errors_become_diagnostics_not_panics() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::open_in_memory(Embedder::unavailable()).unwrap());
        let master_prompt = Arc::new(MasterPrompt::new(dir.path().join("mp.md")));
        let vault = Arc::new(VaultIndexer::new(
            store.clone(),
            dir.path(),
            "v",
            dir.path().join("idx.json"),
        ));
        let facts = Arc::new(FactExtractor::new(store.clone(), master_prompt.clone()));
        let feedback = Arc::new(FeedbackManager::new(store.clone()).unwrap());
        let skills = Arc::new(SkillRegistry::new(dir.path().join("skills").to_string_lossy(), vec![]));
        let router = Router::new(
            AppConfig::default(),
            Arc::new(FailingBackend),
            store,
            master_prompt,
            vault,
            facts,
            feedback,
            skills,
            Arc::new(ToolRegistry::default()),
            Arc::new(ApprovalGate::new()),
            Arc::new(TraceLogger::open_in_memory().unwrap()),
        );

        let outcome = router.route("hello", &[], "u1", None, None).await;
        assert!(outcome.response.contains("Authentication error"));
        assert!(outcome.tools_used.is_empty());
    }

    #[tokio::test]
    async fn paid_backend_without_optin_is_refused() {
        let mut h = harness(vec![ChatOutcome::reply("unused")], vec![]);
        // Rebuild the router config around the paid backend.
        h.router.config.llm.backend = "anthropic".to_string();
        let outcome = h.router.route("뭐든", &[], "u1", None, None).await;
        assert!(outcome.response.contains("paid API"));
        assert!(outcome.tools_used.is_empty());
    }
}
