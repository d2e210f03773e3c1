//! Layered system-prompt assembly.
//!
//! Callers pre-compute everything async (recent turns, vault hits, caution
//! block) and hand it to [`build_system_prompt`], which is purely
//! synchronous and owns the prompt layout.

use borealis_memory::{ConversationTurn, MasterPrompt, VaultHit};
use borealis_skills::Skill;

use crate::router::{Enforcement, PreflightResult};

/// Static persona/rules block — language, identity, tone.
pub const SYSTEM_PROMPT: &str = "\
[LANGUAGE]
한국어로만 답변. 한자(漢字), 중국어, 일본어 금지.
전문 용어는 한글(영어) 형식 허용. 예: 엔트로피(Entropy)

[IDENTITY]
너는 Borealis. 연구자의 AI 비서이자 대화 상대야.
할 수 있는 것: 논문 검색, 이메일 관리, HPC 잡 모니터링, 일정 관리, 일상 대화.

[TONE]
- 반말 전용. \"~해\", \"~어\", \"~지\" 사용. \"~요\", \"~세요\", \"~합니다\" 금지.
- 자연스러운 한국어 구어체. 번역투 금지.
- 일상 대화엔 가볍게 응대. 모든 대화를 연구로 돌리지 마.
- 공감 후 관련 질문을 던져서 대화를 이어가.
- 사용자가 \"잘 자\" 등 종료 신호를 보내기 전에 절대 먼저 작별 인사 금지.

[RULES]
- 도구 결과의 고유명사(이름, 제목)는 그대로 전달. 임의 생성 금지.
- 도구 필요 시 도구 호출. 불필요 시 자연스럽게 대화.
- YAML frontmatter, tags 등 메타데이터 응답에 포함 금지.";

const FEW_SHOT_EXAMPLES: &str = "\
[FEW-SHOT EXAMPLES]
User: \"오늘 일정 알려줘\" -> Call: get_calendar_briefing
User: \"MoS2 논문 찾아줘\" -> Call: search_arxiv(query=\"MoS2\")
User: \"이메일 확인해줘\" -> Call: analyze_emails
User: \"안녕? 잘 지내?\" -> No tool needed, respond directly.";

/// At most this many matched skill prompts get injected per turn.
const MAX_SKILL_PROMPTS: usize = 2;

/// Everything the prompt builder needs, pre-computed by the router.
pub struct PromptInputs<'a> {
    pub master_prompt: &'a MasterPrompt,
    pub matched_skills: &'a [Skill],
    pub has_tools: bool,
    pub recent_turns: &'a [ConversationTurn],
    pub vault_hits: &'a [VaultHit],
    /// Pre-formatted caution block from the feedback manager; may be empty.
    pub caution: &'a str,
    pub enforcement: &'a Enforcement,
    pub preflight_results: &'a [PreflightResult],
}

/// Assemble the layered system prompt.
pub fn build_system_prompt(inputs: &PromptInputs<'_>) -> String {
    let mut prompt = SYSTEM_PROMPT.to_string();

    // Persona + few-shot tone examples from the master prompt file.
    for section in ["00_PERSONA", "99_SYSTEM"] {
        if let Some(text) = inputs.master_prompt.read_section(section) {
            let text = text.trim();
            if !text.is_empty() {
                prompt.push_str("\n\n");
                prompt.push_str(text);
            }
        }
    }

    // Matched skills, capped to keep the token budget sane.
    for skill in inputs.matched_skills.iter().take(MAX_SKILL_PROMPTS) {
        if skill.prompt.is_empty() {
            continue;
        }
        prompt.push_str(&format!("\n\n[SKILL: {}]\n{}", skill.name, skill.prompt));
    }

    // Few-shot examples only when tools are in play.
    if inputs.has_tools {
        prompt.push_str("\n\n");
        prompt.push_str(FEW_SHOT_EXAMPLES);
    }

    if !inputs.recent_turns.is_empty() {
        let parts: Vec<String> = inputs
            .recent_turns
            .iter()
            .map(|turn| format!("[{}] {}", turn.role, clip(&turn.content, 200)))
            .collect();
        prompt.push_str("\n\n--- Recent conversation ---\n");
        prompt.push_str(&parts.join("\n"));
        prompt.push_str("\n--- End conversation ---");
    }

    if !inputs.vault_hits.is_empty() {
        let parts: Vec<String> = inputs
            .vault_hits
            .iter()
            .map(|hit| format!("- {}: {}", hit.title, clip(&hit.content, 500)))
            .collect();
        prompt.push_str("\n\n[참고: 내 노트에서]\n");
        prompt.push_str(&parts.join("\n"));
    }

    if !inputs.caution.is_empty() {
        prompt.push_str("\n\n");
        prompt.push_str(inputs.caution);
    }

    if inputs.enforcement.requires_tool {
        let chain = inputs.enforcement.chain_tools.join(", ");
        prompt.push_str(&format!(
            "\n\n[SKILL TOOL ENFORCEMENT]\n\
             이 요청은 스킬 정책상 도구 호출이 필수야. \
             도구 결과 없이 추정 답변을 만들면 안 돼. \
             필수 체인(순서): {}.\n\
             필수 인자가 부족하면 임의로 채우지 말고 사용자에게 추가 정보를 요청해.",
            if chain.is_empty() { "없음".to_string() } else { chain },
        ));
    }

    if !inputs.preflight_results.is_empty() {
        let mut lines = vec!["[PREFLIGHT TOOL RESULTS]".to_string()];
        for item in inputs.preflight_results {
            lines.push(format!("- {}: {}", item.name, clip(&item.content, 500)));
        }
        prompt.push('\n');
        prompt.push_str(&lines.join("\n"));
    }

    prompt
}

/// Truncate to at most `max_chars` characters.
pub fn clip(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use borealis_memory::VaultHit;

    fn empty_enforcement() -> Enforcement {
        Enforcement::default()
    }

    #[test]
    fn minimal_prompt_is_just_the_persona() {
        let dir = tempfile::tempdir().unwrap();
        let master = MasterPrompt::new(dir.path().join("mp.md"));
        let enforcement = empty_enforcement();
        let prompt = build_system_prompt(&PromptInputs {
            master_prompt: &master,
            matched_skills: &[],
            has_tools: false,
            recent_turns: &[],
            vault_hits: &[],
            caution: "",
            enforcement: &enforcement,
            preflight_results: &[],
        });
        assert!(prompt.starts_with("[LANGUAGE]"));
        assert!(!prompt.contains("[FEW-SHOT EXAMPLES]"));
        assert!(!prompt.contains("[PREFLIGHT TOOL RESULTS]"));
        assert!(!prompt.contains("[SKILL TOOL ENFORCEMENT]"));
    }

    #[test]
    fn few_shot_block_only_with_tools() {
        let dir = tempfile::tempdir().unwrap();
        let master = MasterPrompt::new(dir.path().join("mp.md"));
        let enforcement = empty_enforcement();
        let with_tools = build_system_prompt(&PromptInputs {
            master_prompt: &master,
            matched_skills: &[],
            has_tools: true,
            recent_turns: &[],
            vault_hits: &[],
            caution: "",
            enforcement: &enforcement,
            preflight_results: &[],
        });
        assert!(with_tools.contains("[FEW-SHOT EXAMPLES]"));
    }

    #[test]
    fn vault_hits_render_as_titled_bullets() {
        let dir = tempfile::tempdir().unwrap();
        let master = MasterPrompt::new(dir.path().join("mp.md"));
        let enforcement = empty_enforcement();
        let hits = vec![VaultHit {
            id: 1,
            title: "valley".to_string(),
            content: "Valley polarization in MoS2 monolayer TMDC materials".to_string(),
            category: "research".to_string(),
            score: 0.9,
        }];
        let prompt = build_system_prompt(&PromptInputs {
            master_prompt: &master,
            matched_skills: &[],
            has_tools: false,
            recent_turns: &[],
            vault_hits: &hits,
            caution: "",
            enforcement: &enforcement,
            preflight_results: &[],
        });
        let idx = prompt.find("[참고: 내 노트에서]").unwrap();
        assert!(prompt[idx..].contains("- valley:"));
    }

    #[test]
    fn enforcement_block_names_the_chain() {
        let dir = tempfile::tempdir().unwrap();
        let master = MasterPrompt::new(dir.path().join("mp.md"));
        let enforcement = Enforcement {
            requires_tool: true,
            strict_mode: true,
            allowed_tools: vec!["search_arxiv".to_string()],
            chain_tools: vec!["search_arxiv".to_string(), "download_paper_pdf".to_string()],
            preflight_tools: vec![],
        };
        let prompt = build_system_prompt(&PromptInputs {
            master_prompt: &master,
            matched_skills: &[],
            has_tools: true,
            recent_turns: &[],
            vault_hits: &[],
            caution: "",
            enforcement: &enforcement,
            preflight_results: &[],
        });
        assert!(prompt.contains("[SKILL TOOL ENFORCEMENT]"));
        assert!(prompt.contains("search_arxiv, download_paper_pdf"));
    }
}
