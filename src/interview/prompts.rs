//! Stage instructions, extraction prompts, control markers, and bridging
//! messages.

use std::collections::{BTreeMap, HashMap};

use super::ledger::PromptId;
use super::session::Confidence;
use super::stage::Stage;

/// Marker the model appends when it has enough for the current stage.
pub const STAGE_COMPLETE_MARKER: &str = "[STAGE_COMPLETE]";
const PROMPT_MARKER_PREFIX: &str = "[PROMPT:";

/// Static description of a stage: the questions it may ask and the fields it
/// tries to collect.
#[derive(Debug, Clone, Copy)]
pub struct StageProfile {
    pub stage: Stage,
    /// Prompt ids the model may tag its questions with, in asking order.
    pub prompts: &'static [&'static str],
    /// Fields the stage extracts.
    pub fields: &'static [&'static str],
    /// Opening question asked on entry.
    pub opening_prompt: &'static str,
    pub opening_text: &'static str,
}

const SELF_INTRO: StageProfile = StageProfile {
    stage: Stage::SelfIntro,
    prompts: &["intro.greeting", "intro.name_role", "intro.highlight"],
    fields: &["name", "current_role", "highlight", "intro_summary"],
    opening_prompt: "intro.greeting",
    opening_text: "Hi, thanks for joining this mock interview. To start, could you introduce yourself: your name and what you do right now?",
};

const PAST_EXPERIENCE: StageProfile = StageProfile {
    stage: Stage::PastExperience,
    prompts: &["past.project", "past.impact", "past.tradeoff"],
    fields: &["project_summary", "action", "impact", "constraint"],
    opening_prompt: "past.project",
    opening_text: "Tell me about one project you're proud of: what you did, and what impact it had.",
};

/// Profile for a non-terminal stage.
pub fn stage_profile(stage: Stage) -> Option<&'static StageProfile> {
    match stage {
        Stage::SelfIntro => Some(&SELF_INTRO),
        Stage::PastExperience => Some(&PAST_EXPERIENCE),
        Stage::Done => None,
    }
}

/// System instructions for the reasoning engine in `stage`.
pub fn stage_instructions(stage: Stage, known: &BTreeMap<String, String>) -> String {
    let base = "\
You are an interview assistant running a short spoken mock interview.
Guidelines:
- Keep every reply to one or two spoken sentences. Ask ONE question at a time.
- Never repeat a question you already asked; if you need to come back to a topic, rephrase it.
- Start every question with a marker naming it, e.g. [PROMPT: intro.highlight]. The marker is not spoken.
- When the stage is complete, end your message with [STAGE_COMPLETE] on its own line.";

    let stage_part = match stage {
        Stage::SelfIntro => "CURRENT STAGE: Self-introduction
Collect: name, current role, and one highlight.
Question ids: intro.name_role, intro.highlight.

When you have the name, the current role and a highlight, end with [STAGE_COMPLETE].",
        Stage::PastExperience => "CURRENT STAGE: Past experience
Ask for one project or story. Then ask up to two follow-ups:
1) measurable impact (past.impact), 2) a challenge or tradeoff (past.tradeoff).

When you have what they did, its impact, and a constraint they worked under, end with [STAGE_COMPLETE].",
        Stage::Done => "The interview is complete. Thank the participant and answer any questions they have about the process.",
    };

    let context = if known.is_empty() {
        String::new()
    } else {
        let lines = known
            .iter()
            .map(|(k, v)| format!("- {k}: {v}"))
            .collect::<Vec<_>>()
            .join("\n");
        format!("\n\nWhat you know so far:\n{lines}")
    };

    format!("{base}\n\n{stage_part}{context}")
}

/// Instruction for a sanctioned reprompt after the participant went quiet.
pub fn reprompt_instruction(prompt_id: &PromptId) -> String {
    format!(
        "The participant has been quiet for a while after your question [{prompt_id}]. \
         Gently ask it again in simpler words. Do not repeat your earlier wording. \
         Tag it with [PROMPT: {prompt_id}]."
    )
}

/// Instruction to move on with an easier question without changing stage.
pub fn simplify_instruction(stage: Stage) -> String {
    format!(
        "The participant still has not answered. Keep the {stage} stage moving: \
         acknowledge briefly and ask a different, simpler question with a new prompt id."
    )
}

/// Extraction prompt for the stage's fields, run over the stage transcript.
pub fn extraction_prompt(stage: Stage, transcript: &str) -> String {
    let schema = match stage {
        Stage::SelfIntro => {
            r#"Extract the following from the conversation. Use null for anything not mentioned.
{
  "name": "string or null",
  "current_role": "string or null",
  "highlight": "string or null",
  "intro_summary": "one sentence summary or null"
}"#
        }
        Stage::PastExperience => {
            r#"Extract the following from the conversation. Use null for anything not mentioned.
{
  "project_summary": "one sentence summary of the project or null",
  "action": "what the participant personally did, or null",
  "impact": "measurable impact, or null",
  "constraint": "the main challenge, tradeoff or constraint, or null"
}"#
        }
        Stage::Done => return String::new(),
    };

    format!(
        "Given this interview excerpt:\n\n\
         {transcript}\n\n\
         {schema}\n\n\
         Respond with ONLY valid JSON, no explanation or markdown formatting."
    )
}

/// Keep only string values for the stage's known fields.
pub fn parse_extraction(stage: Stage, json_text: &str) -> Option<HashMap<String, String>> {
    let profile = stage_profile(stage)?;
    let value: serde_json::Value = serde_json::from_str(strip_code_fence(json_text)).ok()?;
    let object = value.as_object()?;
    Some(
        profile
            .fields
            .iter()
            .filter_map(|field| {
                let v = object.get(*field)?.as_str()?.trim();
                (!v.is_empty()).then(|| (field.to_string(), v.to_string()))
            })
            .collect(),
    )
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed)
}

/// Result of parsing a model reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedReply {
    /// Reply text with markers stripped, safe to speak.
    pub cleaned: String,
    pub stage_completed: bool,
    pub prompt_id: Option<PromptId>,
}

/// Strip `[STAGE_COMPLETE]` and `[PROMPT: id]` markers from a model reply.
pub fn parse_reply(response: &str) -> ParsedReply {
    let stage_completed = response.contains(STAGE_COMPLETE_MARKER);

    let prompt_id = response.find(PROMPT_MARKER_PREFIX).and_then(|start| {
        let rest = &response[start + PROMPT_MARKER_PREFIX.len()..];
        let end = rest.find(']')?;
        let id = rest[..end].trim();
        (!id.is_empty()).then(|| PromptId::new(id))
    });

    let mut cleaned = response.replace(STAGE_COMPLETE_MARKER, "");
    while let Some(start) = cleaned.find(PROMPT_MARKER_PREFIX) {
        match cleaned[start..].find(']') {
            Some(len) => cleaned.replace_range(start..start + len + 1, ""),
            None => break,
        }
    }
    let cleaned = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");

    ParsedReply {
        cleaned,
        stage_completed,
        prompt_id,
    }
}

/// Derive a prompt id from question text when the model did not tag it.
pub fn derive_prompt_id(stage: Stage, text: &str) -> PromptId {
    let slug = text
        .split_whitespace()
        .map(|w| {
            w.chars()
                .filter(|c| c.is_alphanumeric())
                .collect::<String>()
                .to_lowercase()
        })
        .filter(|w| !w.is_empty())
        .take(8)
        .collect::<Vec<_>>()
        .join("_");
    PromptId::new(format!("{stage}.{slug}"))
}

/// Utterance spoken when a stage boundary is crossed: acknowledgement,
/// stage-shift framing, then the next stage's opening question.
pub fn bridging_message(
    to: Stage,
    fields: &BTreeMap<String, String>,
    confidence: Confidence,
) -> String {
    let acknowledgement = match (confidence, fields.get("name")) {
        (Confidence::High, Some(name)) => format!("Thanks, {name}."),
        (Confidence::High, None) => "Thanks.".to_string(),
        (Confidence::Low, _) => "Thanks, let's keep things moving.".to_string(),
    };

    match to {
        Stage::SelfIntro => acknowledgement,
        Stage::PastExperience => format!(
            "{acknowledgement} Now let's switch to past experience. {}",
            PAST_EXPERIENCE.opening_text
        ),
        Stage::Done => format!(
            "{acknowledgement} Thank you for sharing! That concludes our mock interview. \
             You did great discussing your background and project experience."
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instructions_name_the_stage() {
        let prompt = stage_instructions(Stage::SelfIntro, &BTreeMap::new());
        assert!(prompt.contains("CURRENT STAGE: Self-introduction"));
        assert!(prompt.contains(STAGE_COMPLETE_MARKER));
        assert!(!prompt.contains("What you know so far"));

        let mut known = BTreeMap::new();
        known.insert("name".to_string(), "Ada".to_string());
        let prompt = stage_instructions(Stage::PastExperience, &known);
        assert!(prompt.contains("CURRENT STAGE: Past experience"));
        assert!(prompt.contains("- name: Ada"));
    }

    #[test]
    fn stage_section_is_set_off_by_blank_lines() {
        let prompt = stage_instructions(Stage::SelfIntro, &BTreeMap::new());
        assert!(prompt.contains("own line.\n\nCURRENT STAGE: Self-introduction\n"));
        assert!(prompt.contains("intro.highlight.\n\nWhen you have"));

        let done = stage_instructions(Stage::Done, &BTreeMap::new());
        assert!(done.ends_with("\n\nThe interview is complete. Thank the participant and answer any questions they have about the process."));
    }

    #[test]
    fn parse_reply_without_markers() {
        let parsed = parse_reply("Nice to meet you! What do you do?");
        assert_eq!(parsed.cleaned, "Nice to meet you! What do you do?");
        assert!(!parsed.stage_completed);
        assert!(parsed.prompt_id.is_none());
    }

    #[test]
    fn parse_reply_strips_markers() {
        let parsed = parse_reply("[PROMPT: intro.highlight] What's one highlight?\n[STAGE_COMPLETE]");
        assert_eq!(parsed.cleaned, "What's one highlight?");
        assert!(parsed.stage_completed);
        assert_eq!(parsed.prompt_id, Some(PromptId::new("intro.highlight")));
    }

    #[test]
    fn parse_reply_empty_prompt_marker() {
        let parsed = parse_reply("[PROMPT: ] Hello");
        assert!(parsed.prompt_id.is_none());
        assert_eq!(parsed.cleaned, "Hello");
    }

    #[test]
    fn parse_extraction_keeps_known_string_fields() {
        let fields = parse_extraction(
            Stage::SelfIntro,
            r#"```json
{"name": "Ada", "current_role": null, "highlight": " ", "extra": "x"}
```"#,
        )
        .unwrap();
        assert_eq!(fields.len(), 1);
        assert_eq!(fields["name"], "Ada");
        assert!(parse_extraction(Stage::SelfIntro, "not json").is_none());
        assert!(parse_extraction(Stage::Done, "{}").is_none());
    }

    #[test]
    fn extraction_prompt_done_is_empty() {
        assert!(extraction_prompt(Stage::Done, "anything").is_empty());
        let prompt = extraction_prompt(Stage::PastExperience, "User: I led a migration");
        assert!(prompt.contains("constraint"));
        assert!(prompt.contains("I led a migration"));
    }

    #[test]
    fn derived_prompt_ids_are_stable() {
        let a = derive_prompt_id(Stage::SelfIntro, "What's your current role?");
        let b = derive_prompt_id(Stage::SelfIntro, "what's your CURRENT role");
        assert_eq!(a, b);
        assert!(a.as_str().starts_with("self_intro."));
    }

    #[test]
    fn bridging_varies_with_confidence() {
        let mut fields = BTreeMap::new();
        fields.insert("name".to_string(), "Ada".to_string());

        let high = bridging_message(Stage::PastExperience, &fields, Confidence::High);
        assert!(high.starts_with("Thanks, Ada."));
        assert!(high.contains("switch to past experience"));

        let low = bridging_message(Stage::PastExperience, &fields, Confidence::Low);
        assert!(low.starts_with("Thanks, let's keep things moving."));

        let done = bridging_message(Stage::Done, &BTreeMap::new(), Confidence::High);
        assert!(done.contains("concludes our mock interview"));
    }

    #[test]
    fn reprompt_instruction_forbids_verbatim() {
        let text = reprompt_instruction(&PromptId::new("intro.name_role"));
        assert!(text.contains("Do not repeat"));
        assert!(text.contains("intro.name_role"));
    }
}
