//! Mail bridge adapters. The mail client is an external collaborator; the
//! bridge relays requests and returns its JSON payloads verbatim. The bridge
//! type is also used directly by the transport commands and the urgent-mail
//! poller.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;

use crate::{Tool, ToolDef};

#[derive(Clone)]
pub struct MailBridge {
    client: reqwest::Client,
    base_url: Option<String>,
}

impl MailBridge {
    pub fn new(base_url: &str) -> Self {
        let base_url = (!base_url.is_empty())
            .then(|| base_url.trim_end_matches('/').to_string());
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(20))
            .build()
            .unwrap_or_default();
        Self { client, base_url }
    }

    pub fn is_configured(&self) -> bool {
        self.base_url.is_some()
    }

    fn base(&self) -> Result<&str> {
        self.base_url
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("mail bridge not configured"))
    }

    pub async fn get(&self, path: &str) -> Result<String> {
        let base = self.base()?;
        let body = self
            .client
            .get(format!("{base}{path}"))
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(body)
    }

    pub async fn post(&self, path: &str, payload: &serde_json::Value) -> Result<String> {
        let base = self.base()?;
        let body = self
            .client
            .post(format!("{base}{path}"))
            .json(payload)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(body)
    }
}

macro_rules! simple_get_tool {
    ($name:ident, $tool_name:literal, $desc:literal, $path:literal) => {
        pub struct $name {
            bridge: MailBridge,
        }

        impl $name {
            pub fn new(bridge: MailBridge) -> Self {
                Self { bridge }
            }
        }

        #[async_trait]
        impl Tool for $name {
            fn def(&self) -> ToolDef {
                ToolDef {
                    name: $tool_name.to_string(),
                    description: $desc.to_string(),
                    parameters: json!({
                        "type": "object",
                        "properties": {},
                        "required": []
                    }),
                }
            }

            async fn run(&self, _args: &serde_json::Value) -> Result<String> {
                self.bridge.get($path).await
            }
        }
    };
}

simple_get_tool!(
    AnalyzeEmailsTool,
    "analyze_emails",
    "받은 메일 일괄 분석. 분류(ACTION/FYI)와 요약 반환.",
    "/analyze"
);
simple_get_tool!(
    FetchMailDigestTool,
    "fetch_mail_digest",
    "메일 다이제스트. 계정별 안 읽은 메일 요약.",
    "/digest"
);
simple_get_tool!(
    FetchUrgentMailsTool,
    "fetch_urgent_mails",
    "긴급 메일 조회. 긴급으로 분류된 메일 목록 반환.",
    "/urgent"
);
simple_get_tool!(
    FetchPromoDealsTool,
    "fetch_promo_deals",
    "프로모션/딜 메일 조회. 할인 정보 요약 반환.",
    "/promo"
);

pub struct ProposeMailActionsTool {
    bridge: MailBridge,
}

impl ProposeMailActionsTool {
    pub fn new(bridge: MailBridge) -> Self {
        Self { bridge }
    }
}

#[async_trait]
impl Tool for ProposeMailActionsTool {
    fn def(&self) -> ToolDef {
        ToolDef {
            name: "propose_mail_actions".to_string(),
            description: "메일 정리 제안. archive/라벨/읽음 처리 후보 목록 반환 (실행 안 함).".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "target": {
                        "type": "string",
                        "description": "Optional account or folder to scope the proposal"
                    }
                },
                "required": []
            }),
        }
    }

    async fn run(&self, args: &serde_json::Value) -> Result<String> {
        let target = args.get("target").and_then(|v| v.as_str()).unwrap_or("");
        self.bridge
            .post("/actions/propose", &json!({"target": target}))
            .await
    }
}

pub struct ExecuteMailActionsTool {
    bridge: MailBridge,
}

impl ExecuteMailActionsTool {
    pub fn new(bridge: MailBridge) -> Self {
        Self { bridge }
    }
}

#[async_trait]
impl Tool for ExecuteMailActionsTool {
    fn def(&self) -> ToolDef {
        ToolDef {
            name: "execute_mail_actions".to_string(),
            description: "제안된 메일 정리 실행. archive/라벨/읽음 처리를 실제로 적용.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "action_ids": {
                        "type": "array",
                        "items": {"type": "string"},
                        "description": "IDs of proposed actions to execute"
                    }
                },
                "required": ["action_ids"]
            }),
        }
    }

    async fn run(&self, args: &serde_json::Value) -> Result<String> {
        let action_ids = args
            .get("action_ids")
            .and_then(|v| v.as_array())
            .ok_or_else(|| anyhow::anyhow!("missing required param: action_ids"))?;
        self.bridge
            .post("/actions/execute", &json!({"action_ids": action_ids}))
            .await
    }
}

pub struct SendEmailReplyTool {
    bridge: MailBridge,
}

impl SendEmailReplyTool {
    pub fn new(bridge: MailBridge) -> Self {
        Self { bridge }
    }
}

#[async_trait]
impl Tool for SendEmailReplyTool {
    fn def(&self) -> ToolDef {
        ToolDef {
            name: "send_email_reply".to_string(),
            description: "메일 답장 발송. 지정한 메일에 답장을 보냄.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "message_id": {"type": "string", "description": "ID of the mail to reply to"},
                    "body": {"type": "string", "description": "Reply body text"}
                },
                "required": ["message_id", "body"]
            }),
        }
    }

    async fn run(&self, args: &serde_json::Value) -> Result<String> {
        let message_id = args
            .get("message_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("missing required param: message_id"))?;
        let body = args
            .get("body")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("missing required param: body"))?;
        self.bridge
            .post("/reply", &json!({"message_id": message_id, "body": body}))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unconfigured_bridge_errors_cleanly() {
        let bridge = MailBridge::new("");
        assert!(!bridge.is_configured());
        let tool = FetchMailDigestTool::new(bridge);
        let err = tool.run(&json!({})).await.unwrap_err();
        assert!(err.to_string().contains("not configured"));
    }

    #[test]
    fn digest_and_urgent_are_preflightable() {
        let bridge = MailBridge::new("");
        assert!(FetchMailDigestTool::new(bridge.clone()).def().required_params().is_empty());
        assert!(FetchUrgentMailsTool::new(bridge.clone()).def().required_params().is_empty());
        assert_eq!(
            ExecuteMailActionsTool::new(bridge).def().required_params(),
            vec!["action_ids"]
        );
    }
}
