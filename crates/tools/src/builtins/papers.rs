//! Paper search and retrieval adapters (arXiv, Semantic Scholar, PDF
//! download, and the external analysis bridge).

use std::sync::LazyLock;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use serde_json::json;

use crate::{Tool, ToolDef};

const ARXIV_API_URL: &str = "http://export.arxiv.org/api/query";
const SEMANTIC_SCHOLAR_URL: &str = "https://api.semanticscholar.org/graph/v1/paper/search";

fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(15))
        .user_agent("borealis/0.1")
        .build()
        .unwrap_or_default()
}

fn str_arg<'a>(args: &'a serde_json::Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(|v| v.as_str()).filter(|s| !s.is_empty())
}

fn usize_arg(args: &serde_json::Value, key: &str, default: usize) -> usize {
    args.get(key).and_then(|v| v.as_u64()).map(|n| n as usize).unwrap_or(default)
}

// ── arXiv ────────────────────────────────────────────────────────────────────

static ATOM_ENTRY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<entry>(.*?)</entry>").unwrap());
static ATOM_TITLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<title>(.*?)</title>").unwrap());
static ATOM_SUMMARY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<summary>(.*?)</summary>").unwrap());
static ATOM_ID: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<id>(.*?)</id>").unwrap());
static ATOM_AUTHOR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<name>(.*?)</name>").unwrap());
static ATOM_PDF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"<link[^>]*title="pdf"[^>]*href="([^"]+)""#).unwrap());

pub struct SearchArxivTool {
    client: reqwest::Client,
}

impl SearchArxivTool {
    pub fn new() -> Self {
        Self { client: http_client() }
    }
}

impl Default for SearchArxivTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for SearchArxivTool {
    fn def(&self) -> ToolDef {
        ToolDef {
            name: "search_arxiv".to_string(),
            description: "arXiv 논문 검색. 키워드로 논문 목록 반환 (제목, 저자, abstract). \
                NOT for: 일상 대화, 이메일, 일정."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "Search query (e.g. 'MoS2 band structure DFT')"
                    },
                    "max_results": {
                        "type": "integer",
                        "description": "Maximum number of results to return (default: 10)"
                    }
                },
                "required": ["query"]
            }),
        }
    }

    async fn run(&self, args: &serde_json::Value) -> Result<String> {
        let query = str_arg(args, "query")
            .ok_or_else(|| anyhow::anyhow!("missing required param: query"))?;
        let max_results = usize_arg(args, "max_results", 10);

        let body = self
            .client
            .get(ARXIV_API_URL)
            .query(&[
                ("search_query", format!("all:{query}")),
                ("max_results", max_results.to_string()),
            ])
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        let papers: Vec<serde_json::Value> = ATOM_ENTRY
            .captures_iter(&body)
            .map(|entry| {
                let entry = &entry[1];
                let field = |re: &Regex| {
                    re.captures(entry)
                        .map(|c| c[1].split_whitespace().collect::<Vec<_>>().join(" "))
                        .unwrap_or_default()
                };
                let authors: Vec<String> = ATOM_AUTHOR
                    .captures_iter(entry)
                    .map(|c| c[1].trim().to_string())
                    .collect();
                json!({
                    "title": field(&ATOM_TITLE),
                    "summary": field(&ATOM_SUMMARY),
                    "url": field(&ATOM_ID),
                    "pdf_url": ATOM_PDF.captures(entry).map(|c| c[1].to_string()),
                    "authors": authors,
                })
            })
            .collect();

        Ok(json!({"papers": papers, "count": papers.len()}).to_string())
    }
}

// ── Semantic Scholar ─────────────────────────────────────────────────────────

pub struct SearchSemanticScholarTool {
    client: reqwest::Client,
}

impl SearchSemanticScholarTool {
    pub fn new() -> Self {
        Self { client: http_client() }
    }
}

impl Default for SearchSemanticScholarTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for SearchSemanticScholarTool {
    fn def(&self) -> ToolDef {
        ToolDef {
            name: "search_semantic_scholar".to_string(),
            description: "Semantic Scholar 논문 검색. 인용 데이터 포함. \
                NOT for: 일상 대화, 이메일, 일정."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "Search query (e.g. 'Janus TMDC heterostructure')"
                    },
                    "max_results": {
                        "type": "integer",
                        "description": "Maximum number of results to return (default: 10)"
                    }
                },
                "required": ["query"]
            }),
        }
    }

    async fn run(&self, args: &serde_json::Value) -> Result<String> {
        let query = str_arg(args, "query")
            .ok_or_else(|| anyhow::anyhow!("missing required param: query"))?;
        let max_results = usize_arg(args, "max_results", 10);

        let body: serde_json::Value = self
            .client
            .get(SEMANTIC_SCHOLAR_URL)
            .query(&[
                ("query", query.to_string()),
                ("limit", max_results.to_string()),
                ("fields", "title,abstract,year,citationCount,url".to_string()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let papers = body.get("data").cloned().unwrap_or_else(|| json!([]));
        let count = papers.as_array().map(|a| a.len()).unwrap_or(0);
        Ok(json!({"papers": papers, "count": count}).to_string())
    }
}

// ── PDF download ─────────────────────────────────────────────────────────────

pub struct DownloadPaperPdfTool {
    client: reqwest::Client,
}

impl DownloadPaperPdfTool {
    pub fn new() -> Self {
        Self { client: http_client() }
    }
}

impl Default for DownloadPaperPdfTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for DownloadPaperPdfTool {
    fn def(&self) -> ToolDef {
        ToolDef {
            name: "download_paper_pdf".to_string(),
            description: "논문 PDF 다운로드. URL → 로컬 저장.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "pdf_url": {
                        "type": "string",
                        "description": "URL of the PDF to download"
                    },
                    "save_path": {
                        "type": "string",
                        "description": "Local file path to save the PDF to"
                    }
                },
                "required": ["pdf_url", "save_path"]
            }),
        }
    }

    async fn run(&self, args: &serde_json::Value) -> Result<String> {
        let pdf_url = str_arg(args, "pdf_url")
            .ok_or_else(|| anyhow::anyhow!("missing required param: pdf_url"))?;
        let save_path = str_arg(args, "save_path")
            .ok_or_else(|| anyhow::anyhow!("missing required param: save_path"))?;

        let bytes = self
            .client
            .get(pdf_url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;

        if let Some(parent) = std::path::Path::new(save_path).parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(save_path, &bytes).await?;

        Ok(json!({"success": true, "save_path": save_path, "bytes": bytes.len()}).to_string())
    }
}

// ── External analysis bridge ─────────────────────────────────────────────────

/// PDF analysis itself is a collaborator; this tool only ships text to it.
pub struct AnalyzePaperTool {
    client: reqwest::Client,
    bridge_url: Option<String>,
}

impl AnalyzePaperTool {
    pub fn new(bridge_url: &str) -> Self {
        let bridge_url = (!bridge_url.is_empty())
            .then(|| bridge_url.trim_end_matches('/').to_string());
        Self { client: http_client(), bridge_url }
    }
}

#[async_trait]
impl Tool for AnalyzePaperTool {
    fn def(&self) -> ToolDef {
        ToolDef {
            name: "analyze_paper".to_string(),
            description: "논문 분석. 텍스트/PDF 경로 → 요약, 핵심 결과, 방법론.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "content": {
                        "type": "string",
                        "description": "Paper text content or path to a PDF file"
                    }
                },
                "required": ["content"]
            }),
        }
    }

    async fn run(&self, args: &serde_json::Value) -> Result<String> {
        let content = str_arg(args, "content")
            .ok_or_else(|| anyhow::anyhow!("missing required param: content"))?;
        let Some(base) = &self.bridge_url else {
            anyhow::bail!("paper analyzer bridge not configured");
        };

        let analysis = self
            .client
            .post(format!("{base}/analyze"))
            .json(&json!({"content": content}))
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(json!({"analysis": analysis}).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atom_entries_are_parsed() {
        let body = r#"<feed><entry>
            <id>http://arxiv.org/abs/1234.5678</id>
            <title>MoS2 band
            structure</title>
            <summary>We study MoS2.</summary>
            <author><name>A. Kim</name></author>
            <author><name>B. Lee</name></author>
            <link title="pdf" href="http://arxiv.org/pdf/1234.5678"/>
        </entry></feed>"#;
        let entry = ATOM_ENTRY.captures(body).unwrap();
        let inner = &entry[1];
        assert!(ATOM_TITLE.captures(inner).is_some());
        assert_eq!(ATOM_AUTHOR.captures_iter(inner).count(), 2);
        assert_eq!(
            &ATOM_PDF.captures(inner).unwrap()[1],
            "http://arxiv.org/pdf/1234.5678"
        );
    }

    #[tokio::test]
    async fn missing_query_is_an_error() {
        let tool = SearchArxivTool::new();
        assert!(tool.run(&json!({})).await.is_err());
    }

    #[tokio::test]
    async fn unconfigured_analyzer_bridge_errors() {
        let tool = AnalyzePaperTool::new("");
        let err = tool.run(&json!({"content": "text"})).await.unwrap_err();
        assert!(err.to_string().contains("not configured"));
    }

    #[test]
    fn required_params_match_schema() {
        assert_eq!(SearchArxivTool::new().def().required_params(), vec!["query"]);
        assert_eq!(
            DownloadPaperPdfTool::new().def().required_params(),
            vec!["pdf_url", "save_path"]
        );
    }
}
