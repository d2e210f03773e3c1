//! Research-advisor handle: a zero-argument progress report assembled from
//! the master prompt's research and current-context sections.

use std::fs;
use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;

use crate::{Tool, ToolDef};

pub struct AdvisorHandleTool {
    master_prompt_path: PathBuf,
}

impl AdvisorHandleTool {
    pub fn new(master_prompt_path: &str) -> Self {
        Self { master_prompt_path: PathBuf::from(master_prompt_path) }
    }

    fn section(content: &str, name: &str) -> String {
        let mut lines: Vec<&str> = Vec::new();
        let mut in_section = false;
        for line in content.lines() {
            if let Some(header) = line.strip_prefix("## ") {
                if in_section {
                    break;
                }
                in_section = header.trim_start().starts_with(name);
                continue;
            }
            if in_section {
                lines.push(line);
            }
        }
        lines.join("\n").trim().to_string()
    }
}

#[async_trait]
impl Tool for AdvisorHandleTool {
    fn def(&self) -> ToolDef {
        ToolDef {
            name: "advisor_handle".to_string(),
            description: "연구 진행 상황 리포트. 현재 연구 주제와 최근 컨텍스트 요약 반환.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {},
                "required": []
            }),
        }
    }

    async fn run(&self, _args: &serde_json::Value) -> Result<String> {
        let content = fs::read_to_string(&self.master_prompt_path).unwrap_or_default();
        if content.is_empty() {
            return Ok(json!({
                "research": "",
                "current_context": "",
                "note": "master prompt not found",
            })
            .to_string());
        }
        Ok(json!({
            "research": Self::section(&content, "02_RESEARCH"),
            "current_context": Self::section(&content, "99_CURRENT_CONTEXT"),
        })
        .to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn report_extracts_sections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master_prompt.md");
        fs::write(
            &path,
            "## 02_RESEARCH\n- MoS2 valley polarization\n\n## 99_CURRENT_CONTEXT\n- [2025-07-01] 인턴십 합격\n",
        )
        .unwrap();

        let tool = AdvisorHandleTool::new(path.to_str().unwrap());
        let out: serde_json::Value =
            serde_json::from_str(&tool.run(&json!({})).await.unwrap()).unwrap();
        assert!(out["research"].as_str().unwrap().contains("valley polarization"));
        assert!(out["current_context"].as_str().unwrap().contains("인턴십"));
    }

    #[tokio::test]
    async fn missing_master_prompt_is_not_an_error() {
        let tool = AdvisorHandleTool::new("/nonexistent/mp.md");
        let out = tool.run(&json!({})).await.unwrap();
        assert!(out.contains("master prompt not found"));
    }
}
