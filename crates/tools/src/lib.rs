use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

// ── Tool trait and registry ──────────────────────────────────────────────────

/// Static metadata about a tool, used by the LLM to decide which tool to call.
///
/// `parameters` is a JSON-schema-style object:
/// `{"type": "object", "properties": {...}, "required": [...]}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDef {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

impl ToolDef {
    /// Names listed under the schema's `required` array. Tools with none are
    /// eligible for preflight execution.
    pub fn required_params(&self) -> Vec<String> {
        self.parameters
            .get("required")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Trait implemented by every built-in tool.
///
/// Handlers return a string payload (conventionally JSON) which is passed
/// verbatim to the LLM as tool-result content.
#[async_trait]
pub trait Tool: Send + Sync {
    fn def(&self) -> ToolDef;
    async fn run(&self, args: &serde_json::Value) -> Result<String>;
}

/// Central registry for all available tools. Built once at startup; the
/// router filters its view per turn.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.push(tool);
    }

    pub fn list_defs(&self) -> Vec<ToolDef> {
        self.tools.iter().map(|t| t.def()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools
            .iter()
            .find(|t| t.def().name == name)
            .map(|t| t.as_ref())
    }

    /// Execute a tool by name. Unknown tools and handler failures are
    /// rendered as JSON error strings so the LLM can observe and recover.
    pub async fn execute(&self, name: &str, args: &serde_json::Value) -> String {
        let Some(tool) = self.get(name) else {
            return json!({"error": format!("Unknown tool: {name}")}).to_string();
        };
        match tool.run(args).await {
            Ok(result) => result,
            Err(err) => {
                warn!(tool = name, %err, "tool handler failed");
                json!({"error": format!("Tool '{name}' failed: {err}")}).to_string()
            }
        }
    }
}

/// Best-effort check for tool failure payloads.
pub fn looks_like_tool_error(result: &str) -> bool {
    let lower = result.to_lowercase();
    (lower.contains("tool '") && lower.contains("failed"))
        || lower.contains("\"error\"")
        || lower.contains("'error'")
}

/// Build the OpenAI-compatible `tools` array passed to the LLM API.
pub fn defs_to_openai_tools(defs: &[ToolDef]) -> serde_json::Value {
    let entries: Vec<serde_json::Value> = defs
        .iter()
        .map(|def| {
            json!({
                "type": "function",
                "function": {
                    "name": def.name,
                    "description": def.description,
                    "parameters": def.parameters,
                },
            })
        })
        .collect();
    json!(entries)
}

// ── Built-in tools ───────────────────────────────────────────────────────────

pub mod builtins;
pub use builtins::build_registry;
pub use builtins::mail::MailBridge;

// ── ToolRegistry tests ───────────────────────────────────────────────────────
