//! Calendar bridge adapters. The provider itself is external; these tools
//! only relay requests to the configured HTTP bridge.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;

use crate::{Tool, ToolDef};

#[derive(Clone)]
struct CalendarBridge {
    client: reqwest::Client,
    base_url: Option<String>,
}

impl CalendarBridge {
    fn new(base_url: &str) -> Self {
        let base_url = (!base_url.is_empty())
            .then(|| base_url.trim_end_matches('/').to_string());
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self { client, base_url }
    }

    fn base(&self) -> Result<&str> {
        self.base_url
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("calendar bridge not configured"))
    }
}

pub struct CalendarBriefingTool {
    bridge: CalendarBridge,
}

impl CalendarBriefingTool {
    pub fn new(bridge_url: &str) -> Self {
        Self { bridge: CalendarBridge::new(bridge_url) }
    }
}

#[async_trait]
impl Tool for CalendarBriefingTool {
    fn def(&self) -> ToolDef {
        ToolDef {
            name: "get_calendar_briefing".to_string(),
            description: "오늘/내일 일정 브리핑. 캘린더에서 다가오는 이벤트 요약.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {},
                "required": []
            }),
        }
    }

    async fn run(&self, _args: &serde_json::Value) -> Result<String> {
        let base = self.bridge.base()?;
        let body = self
            .bridge
            .client
            .get(format!("{base}/briefing"))
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(body)
    }
}

pub struct AddCalendarEventTool {
    bridge: CalendarBridge,
}

impl AddCalendarEventTool {
    pub fn new(bridge_url: &str) -> Self {
        Self { bridge: CalendarBridge::new(bridge_url) }
    }
}

#[async_trait]
impl Tool for AddCalendarEventTool {
    fn def(&self) -> ToolDef {
        ToolDef {
            name: "add_calendar_event".to_string(),
            description: "일정 추가. 제목/날짜/시간으로 캘린더 이벤트 등록.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "title": {"type": "string", "description": "Event title"},
                    "date": {"type": "string", "description": "Event date (YYYY-MM-DD)"},
                    "time": {"type": "string", "description": "Event time (HH:MM, optional)"}
                },
                "required": ["title", "date"]
            }),
        }
    }

    async fn run(&self, args: &serde_json::Value) -> Result<String> {
        let title = args
            .get("title")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("missing required param: title"))?;
        let date = args
            .get("date")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("missing required param: date"))?;
        let time = args.get("time").and_then(|v| v.as_str()).unwrap_or("");

        let base = self.bridge.base()?;
        let body = self
            .bridge
            .client
            .post(format!("{base}/events"))
            .json(&json!({"title": title, "date": date, "time": time}))
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn briefing_without_bridge_errors() {
        let tool = CalendarBriefingTool::new("");
        assert!(tool.run(&json!({})).await.is_err());
    }

    #[test]
    fn briefing_has_no_required_params() {
        assert!(CalendarBriefingTool::new("").def().required_params().is_empty());
        assert_eq!(
            AddCalendarEventTool::new("").def().required_params(),
            vec!["title", "date"]
        );
    }
}
