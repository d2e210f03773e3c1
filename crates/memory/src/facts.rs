//! Rule-based fact extraction from user turns.
//!
//! Pure regex matching, no LLM calls. Salient facts land in the knowledge
//! table; high-importance categories are also reflected into the master
//! prompt's current-context section.

use std::sync::{Arc, LazyLock};

use chrono::Local;
use regex::Regex;
use tracing::{info, warn};

use crate::master_prompt::MasterPrompt;
use crate::store::MemoryStore;

const MIN_MESSAGE_LENGTH: usize = 10;

/// Categories that get mirrored into the master prompt.
const HIGH_IMPORTANCE: &[&str] = &["career", "research", "academic"];

/// `(pattern, category, title template)`; templates use `{n}` for capture
/// group n (0-based, matching the order of groups in the pattern).
static FACT_PATTERNS: LazyLock<Vec<(Regex, &'static str, &'static str)>> = LazyLock::new(|| {
    let raw: &[(&str, &str, &str)] = &[
        // New tools / technologies
        (r"나\s+(.+?)\s*(시작했어|쓰게\s*됐어|배우고\s*있어|쓰기\s*시작|써보고\s*있어|도\s*쓰게|도\s*써)",
         "research", "{0} 도구/기술 사용 시작"),
        (r"(.+?)\s*(설치했어|깔았어|세팅했어|설정했어|셋업했어)",
         "research", "{0} 환경 설정"),
        // Status changes (pass/fail)
        (r"(.+?)\s*(에\s*)?합격했어", "career", "{0} 합격"),
        (r"(.+?)\s*(에\s*)?불합격했어", "career", "{0} 불합격"),
        (r"(.+?)\s*(에\s*)?(붙었어|떨어졌어|통과했어)", "career", "{0} 결과"),
        // Purchases / changes
        (r"나\s+(.+?)\s*(샀어|바꿨어|구매했어|질렀어|주문했어)", "life", "{0} 구매/변경"),
        // Cats (시루, 설기)
        (r"(시루|설기)\s*[가이은는]\s*(.+)", "life", "{0} 관련 정보"),
        (r"(시루|설기)\s+(.+)", "life", "{0} 관련 정보"),
        // Semester / academic
        (r"이번\s*학기\s*(.+)", "academic", "이번 학기 {0}"),
        (r"다음\s*학기\s*(.+)", "academic", "다음 학기 {0}"),
        // Research findings
        (r"연구에서\s+(.+?)\s*(발견했어|확인했어|알아냈어|밝혀졌어)", "research", "연구 발견: {0}"),
        (r"(시뮬레이션|계산|DFT|VASP|ONETEP)\s*(결과|에서)\s*(.+)", "research", "{0} 결과"),
        (r"(?i)(밴드갭|band\s*gap)\s*[이가은는]\s*(.+?(?:\d+\.?\d*\s*(?:eV|meV|eV야|eV어)).*)",
         "research", "밴드갭 정보: {1}"),
        // Internship / career
        (r"인턴십\s+(.+)", "career", "인턴십 {0}"),
        (r"인턴\s+(.+)", "career", "인턴 {0}"),
        (r"(직장|회사|취직)\s*(.+)", "career", "커리어: {1}"),
        // Vehicle
        (r"(?i)(\d[\d,]*)\s*(km|마일|mile)\s*.*(교체|갈았어|했어|체크)", "vehicle", "차량 주행거리 {0}{1}"),
        (r"(엔진오일|타이어|브레이크|배터리)\s*(.+?)(?:교체|갈았어|했어|체크)", "vehicle", "{0} 정비"),
        // Moving / health
        (r"(이사|이사했어|이사\s*가|이사\s*갈\s*거)", "life", "이사 관련"),
        (r"(병원|아파서|감기|코로나|독감)\s*(.+)", "life", "건강: {0}"),
    ];
    raw.iter()
        .map(|(pattern, category, template)| {
            (Regex::new(pattern).expect("fact pattern must compile"), *category, *template)
        })
        .collect()
});

/// Greetings and acknowledgements that never carry facts.
static SKIP_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^(ㅋ+|ㅎ+|ㅠ+|ㅜ+|안녕|고마워|감사|ㅇㅋ|ㅇㅇ|응|아니|네|오키|잘\s*자|굿나잇|good\s*night|thanks|thank\s*you|ok|okay|hi|hello|hey|bye|gn)[\s!?.]*$",
    )
    .expect("skip pattern must compile")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fact {
    pub category: String,
    pub title: String,
    pub content: String,
    pub source: String,
}

/// Master-prompt section a fact category belongs to.
pub fn section_for_category(category: &str) -> &'static str {
    match category {
        "research" => "02_RESEARCH",
        "dev" => "02_DEV",
        _ => "99_CURRENT_CONTEXT",
    }
}

pub struct FactExtractor {
    store: Arc<MemoryStore>,
    master_prompt: Arc<MasterPrompt>,
}

impl FactExtractor {
    pub fn new(store: Arc<MemoryStore>, master_prompt: Arc<MasterPrompt>) -> Self {
        Self { store, master_prompt }
    }

    /// Cheap pre-filter: short messages and greetings are never worth a scan.
    pub fn should_extract(message: &str) -> bool {
        if message.chars().count() < MIN_MESSAGE_LENGTH {
            return false;
        }
        !SKIP_PATTERN.is_match(message.trim())
    }

    /// Apply the rule table to one user message. Titles are deduplicated
    /// within the call; content is always the full message.
    pub fn extract_facts(message: &str) -> Vec<Fact> {
        let mut facts = Vec::new();
        let mut seen_titles: Vec<String> = Vec::new();

        for (pattern, category, template) in FACT_PATTERNS.iter() {
            let Some(caps) = pattern.captures(message) else {
                continue;
            };
            let title = render_title(template, &caps);
            if seen_titles.iter().any(|t| t == &title) {
                continue;
            }
            seen_titles.push(title.clone());
            facts.push(Fact {
                category: (*category).to_string(),
                title,
                content: message.trim().to_string(),
                source: "conversation".to_string(),
            });
        }
        facts
    }

    /// Persist facts and reflect the high-importance ones into the master
    /// prompt. Returns the number of facts saved.
    pub async fn save_and_update(&self, facts: &[Fact]) -> usize {
        if facts.is_empty() {
            return 0;
        }

        let mut saved = 0usize;
        let mut high_importance: Vec<&Fact> = Vec::new();
        for fact in facts {
            let tags = vec![fact.category.clone()];
            match self
                .store
                .save_knowledge(&fact.category, &fact.title, &fact.content, &fact.source, &tags)
                .await
            {
                Ok(_) => {
                    saved += 1;
                    info!(title = %fact.title, "fact saved");
                }
                Err(err) => warn!(title = %fact.title, %err, "failed to save fact"),
            }
            if HIGH_IMPORTANCE.contains(&fact.category.as_str()) {
                high_importance.push(fact);
            }
        }

        if !high_importance.is_empty() {
            if let Err(err) = self.update_current_context(&high_importance) {
                warn!(%err, "failed to update master prompt");
            }
        }

        saved
    }

    fn update_current_context(&self, facts: &[&Fact]) -> anyhow::Result<()> {
        let existing = self
            .master_prompt
            .read_section("99_CURRENT_CONTEXT")
            .unwrap_or_default();

        let today = Local::now().format("%Y-%m-%d").to_string();
        let new_lines: Vec<String> = facts
            .iter()
            .filter(|fact| !existing.contains(&fact.title))
            .map(|fact| {
                let content: String = fact.content.chars().take(100).collect();
                format!("- [{today}] {}: {content}", fact.title)
            })
            .collect();
        if new_lines.is_empty() {
            return Ok(());
        }

        // Keep the existing body, drop its header line.
        let body = existing
            .lines()
            .skip_while(|line| line.starts_with("## 99_CURRENT_CONTEXT"))
            .collect::<Vec<_>>()
            .join("\n");
        let updated = if body.trim().is_empty() {
            new_lines.join("\n")
        } else {
            format!("{}\n{}", body.trim(), new_lines.join("\n"))
        };
        self.master_prompt.write_section("99_CURRENT_CONTEXT", &updated)?;
        info!(count = new_lines.len(), "current-context section updated");
        Ok(())
    }
}

fn render_title(template: &str, caps: &regex::Captures<'_>) -> String {
    let mut title = template.to_string();
    for index in 0..caps.len().saturating_sub(1) {
        let placeholder = format!("{{{index}}}");
        if !title.contains(&placeholder) {
            continue;
        }
        let value = caps
            .get(index + 1)
            .map(|m| m.as_str().trim())
            .unwrap_or("");
        title = title.replace(&placeholder, value);
    }
    title
}
