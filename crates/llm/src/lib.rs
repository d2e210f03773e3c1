//! LLM backend adapters.
//!
//! The transcript model is Borealis's own: a closed [`Turn`] enum rather
//! than a role-plus-optional-fields record, so impossible states (a tool
//! observation without a call id, a user turn carrying invocations) cannot
//! be constructed. Wire formats — OpenAI-compatible `/chat/completions`
//! JSON and Anthropic messages — are produced by explicit conversion
//! functions at the client boundary, never by serialising the domain types.

use async_trait::async_trait;
use serde_json::json;
use thiserror::Error;
use tracing::debug;

// ── Transcript model ─────────────────────────────────────────────────────────

/// One entry in the transcript the router accumulates for a user turn.
#[derive(Debug, Clone)]
pub enum Turn {
    /// The layered system prompt; always the first entry.
    System(String),
    User(String),
    /// Final assistant text.
    Assistant(String),
    /// The assistant asked for tool invocations instead of answering.
    ToolRequest(Vec<ToolInvocation>),
    /// A tool result fed back as the observation for one invocation.
    ToolObservation { call_id: String, payload: String },
}

/// A single tool invocation requested by the model.
///
/// `args` is always a parsed JSON object — whichever wire shape the backend
/// used (OpenAI sends a JSON string, some local servers an object), the
/// parser normalises before this type exists.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    /// Correlates the observation with the request. Backends that omit ids
    /// get synthesised ones.
    pub call_id: String,
    pub name: String,
    pub args: serde_json::Value,
}

/// What one chat call produced.
#[derive(Debug, Clone)]
pub struct ChatOutcome {
    /// Assistant text; may be empty when invocations were requested.
    pub text: String,
    /// Tool invocations the assistant wants; empty on a final answer.
    pub requests: Vec<ToolInvocation>,
    /// "stop", "tool_calls", "length", ...
    pub finish_reason: String,
}

impl ChatOutcome {
    /// A plain final answer.
    pub fn reply(text: impl Into<String>) -> Self {
        Self { text: text.into(), requests: vec![], finish_reason: "stop".to_string() }
    }
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("authentication failed: check the API configuration")]
    Auth,
    #[error("API error ({status}): {body}")]
    Api { status: u16, body: String },
    #[error("backend unreachable: {0}")]
    Transport(String),
}

// ── Backend seam ─────────────────────────────────────────────────────────────

/// One chat turn against an LLM backend. Implemented by the real HTTP clients
/// and by stubs in tests.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn chat(
        &self,
        model: &str,
        turns: &[Turn],
        tools: Option<&serde_json::Value>,
        max_tokens: u32,
    ) -> Result<ChatOutcome, LlmError>;
}

// ── OpenAI-compatible client (local, default) ────────────────────────────────

/// Client for any OpenAI-compatible `/chat/completions` endpoint — in the
/// default deployment that is a local Ollama server at `.../v1`.
#[derive(Debug, Clone)]
pub struct LocalClient {
    client: reqwest::Client,
    base_url: String,
}

impl LocalClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl ChatBackend for LocalClient {
    async fn chat(
        &self,
        model: &str,
        turns: &[Turn],
        tools: Option<&serde_json::Value>,
        max_tokens: u32,
    ) -> Result<ChatOutcome, LlmError> {
        let endpoint = format!("{}/chat/completions", self.base_url);

        let mut payload = json!({
            "model": model,
            "messages": turns_to_openai(turns),
            "max_tokens": max_tokens,
        });
        if let Some(tools_val) = tools {
            payload["tools"] = tools_val.clone();
        }

        let response = self
            .client
            .post(&endpoint)
            .json(&payload)
            .send()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(LlmError::Auth);
        }
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;
        if !status.is_success() {
            return Err(LlmError::Api { status: status.as_u16(), body: body.to_string() });
        }

        debug!(model, "chat completion received");
        Ok(parse_openai_response(&body))
    }
}

/// Render the transcript into OpenAI-compatible `messages` entries.
///
/// The field names here are the endpoint's contract: invocation arguments go
/// out as a JSON *string*, observations as `tool`-role entries keyed by
/// `tool_call_id`.
fn turns_to_openai(turns: &[Turn]) -> Vec<serde_json::Value> {
    turns
        .iter()
        .map(|turn| match turn {
            Turn::System(text) => json!({"role": "system", "content": text}),
            Turn::User(text) => json!({"role": "user", "content": text}),
            Turn::Assistant(text) => json!({"role": "assistant", "content": text}),
            Turn::ToolRequest(invocations) => {
                let calls: Vec<serde_json::Value> = invocations
                    .iter()
                    .map(|inv| {
                        json!({
                            "id": inv.call_id,
                            "type": "function",
                            "function": {
                                "name": inv.name,
                                "arguments": inv.args.to_string(),
                            },
                        })
                    })
                    .collect();
                json!({
                    "role": "assistant",
                    "content": serde_json::Value::Null,
                    "tool_calls": calls,
                })
            }
            Turn::ToolObservation { call_id, payload } => json!({
                "role": "tool",
                "tool_call_id": call_id,
                "content": payload,
            }),
        })
        .collect()
}

/// Parse an OpenAI-style chat completion body into a `ChatOutcome`.
fn parse_openai_response(body: &serde_json::Value) -> ChatOutcome {
    let choice = body
        .get("choices")
        .and_then(|c| c.get(0))
        .cloned()
        .unwrap_or_default();

    let text = choice
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();

    let requests = choice
        .get("message")
        .and_then(|m| m.get("tool_calls"))
        .and_then(|v| v.as_array())
        .map(|calls| parse_invocations(calls))
        .unwrap_or_default();

    let finish_reason = choice
        .get("finish_reason")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| {
            if requests.is_empty() { "stop".to_string() } else { "tool_calls".to_string() }
        });

    ChatOutcome { text, requests, finish_reason }
}

/// Normalise a `tool_calls` array into [`ToolInvocation`]s: arguments may be
/// a JSON string or an already-parsed object; missing ids get synthesised.
fn parse_invocations(calls: &[serde_json::Value]) -> Vec<ToolInvocation> {
    calls
        .iter()
        .enumerate()
        .filter_map(|(i, call)| {
            let func = call.get("function")?;
            let name = func.get("name")?.as_str()?.to_string();
            let args = match func.get("arguments") {
                Some(serde_json::Value::String(s)) => {
                    serde_json::from_str(s).unwrap_or_else(|_| json!({}))
                }
                Some(obj) => obj.clone(),
                None => json!({}),
            };
            let call_id = call
                .get("id")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| format!("call_{i}"));
            Some(ToolInvocation { call_id, name, args })
        })
        .collect()
}

// ── Anthropic client (paid, opt-in) ──────────────────────────────────────────

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Native Anthropic messages client. The caller is responsible for the paid
/// opt-in check; this client only speaks the wire format.
#[derive(Debug, Clone)]
pub struct AnthropicClient {
    client: reqwest::Client,
    api_key: String,
}

impl AnthropicClient {
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("ANTHROPIC_API_KEY").ok()?;
        if api_key.trim().is_empty() {
            return None;
        }
        Some(Self { client: reqwest::Client::new(), api_key })
    }
}

#[async_trait]
impl ChatBackend for AnthropicClient {
    async fn chat(
        &self,
        model: &str,
        turns: &[Turn],
        tools: Option<&serde_json::Value>,
        max_tokens: u32,
    ) -> Result<ChatOutcome, LlmError> {
        let (system, converted) = turns_to_anthropic(turns);

        let mut payload = json!({
            "model": model,
            "max_tokens": max_tokens,
            "messages": converted,
        });
        if !system.is_empty() {
            payload["system"] = json!(system);
        }
        if let Some(tools_val) = tools {
            payload["tools"] = openai_tools_to_anthropic(tools_val);
        }

        let response = self
            .client
            .post(ANTHROPIC_API_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&payload)
            .send()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(LlmError::Auth);
        }
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;
        if !status.is_success() {
            return Err(LlmError::Api { status: status.as_u16(), body: body.to_string() });
        }

        Ok(parse_anthropic_response(&body))
    }
}

/// Split the transcript into Anthropic's (system, messages) shape. Tool
/// requests become assistant `tool_use` blocks; observations travel as
/// user-role `tool_result` blocks.
fn turns_to_anthropic(turns: &[Turn]) -> (String, Vec<serde_json::Value>) {
    let mut system = String::new();
    let mut out: Vec<serde_json::Value> = Vec::new();

    for turn in turns {
        match turn {
            Turn::System(text) => {
                if !system.is_empty() {
                    system.push_str("\n\n");
                }
                system.push_str(text);
            }
            Turn::User(text) => {
                out.push(json!({"role": "user", "content": text}));
            }
            Turn::Assistant(text) => {
                out.push(json!({"role": "assistant", "content": text}));
            }
            Turn::ToolRequest(invocations) => {
                let blocks: Vec<serde_json::Value> = invocations
                    .iter()
                    .map(|inv| {
                        json!({
                            "type": "tool_use",
                            "id": inv.call_id,
                            "name": inv.name,
                            "input": inv.args,
                        })
                    })
                    .collect();
                out.push(json!({"role": "assistant", "content": blocks}));
            }
            Turn::ToolObservation { call_id, payload } => {
                out.push(json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": call_id,
                        "content": payload,
                    }],
                }));
            }
        }
    }

    (system, out)
}

/// OpenAI tool schema array → Anthropic tool schema array.
fn openai_tools_to_anthropic(tools: &serde_json::Value) -> serde_json::Value {
    let converted: Vec<serde_json::Value> = tools
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|t| {
                    let func = t.get("function")?;
                    Some(json!({
                        "name": func.get("name")?,
                        "description": func.get("description").cloned().unwrap_or(json!("")),
                        "input_schema": func
                            .get("parameters")
                            .cloned()
                            .unwrap_or(json!({"type": "object", "properties": {}})),
                    }))
                })
                .collect()
        })
        .unwrap_or_default();
    json!(converted)
}

fn parse_anthropic_response(body: &serde_json::Value) -> ChatOutcome {
    let empty = vec![];
    let blocks = body
        .get("content")
        .and_then(|v| v.as_array())
        .unwrap_or(&empty);

    let mut text_parts: Vec<&str> = Vec::new();
    let mut requests: Vec<ToolInvocation> = Vec::new();

    for block in blocks {
        match block.get("type").and_then(|v| v.as_str()) {
            Some("text") => {
                if let Some(text) = block.get("text").and_then(|v| v.as_str()) {
                    text_parts.push(text);
                }
            }
            Some("tool_use") => {
                requests.push(ToolInvocation {
                    call_id: block
                        .get("id")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string(),
                    name: block
                        .get("name")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string(),
                    args: block.get("input").cloned().unwrap_or(json!({})),
                });
            }
            _ => {}
        }
    }

    let stop_reason = body
        .get("stop_reason")
        .and_then(|v| v.as_str())
        .unwrap_or("stop");
    let finish_reason = if stop_reason == "tool_use" { "tool_calls" } else { stop_reason };

    ChatOutcome {
        text: text_parts.join("\n"),
        requests,
        finish_reason: finish_reason.to_string(),
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
