//! Reasoning engines: decide what to ask next and when a stage is done.
//!
//! The engine never mutates interview state. It returns an [`EngineReply`]
//! and the runtime feeds it to the controller, which arbitrates.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::config::InterviewConfig;
use crate::error::LlmError;
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider, Role};

use super::ledger::PromptId;
use super::prompts::{
    derive_prompt_id, extraction_prompt, parse_extraction, parse_reply, reprompt_instruction,
    simplify_instruction, stage_instructions,
};
use super::stage::Stage;

/// What the engine wants to happen next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineReply {
    pub stage: Stage,
    /// Text to speak. Ignored when `completion` is set: the controller
    /// speaks the bridging utterance instead.
    pub text: String,
    pub prompt_id: Option<PromptId>,
    /// Extracted fields when the engine judged the stage complete.
    pub completion: Option<HashMap<String, String>>,
}

impl EngineReply {
    fn ask(stage: Stage, prompt_id: PromptId, text: impl Into<String>) -> Self {
        Self {
            stage,
            text: text.into(),
            prompt_id: Some(prompt_id),
            completion: None,
        }
    }

    fn complete(stage: Stage, fields: HashMap<String, String>) -> Self {
        Self {
            stage,
            text: String::new(),
            prompt_id: None,
            completion: Some(fields),
        }
    }
}

#[async_trait]
pub trait ReasoningEngine: Send + Sync {
    fn name(&self) -> &str;

    /// A stage was entered; `opening` is already playing.
    async fn open_stage(&self, stage: Stage, opening: &str, known: &BTreeMap<String, String>);

    /// Answer a participant utterance.
    async fn respond(&self, stage: Stage, user_text: &str) -> Result<EngineReply, LlmError>;

    /// Rephrase `prompt_id` after the participant went quiet.
    async fn reprompt(&self, stage: Stage, prompt_id: &PromptId) -> Result<EngineReply, LlmError>;

    /// Offer an easier question without leaving the stage.
    async fn simplify(&self, stage: Stage) -> Result<EngineReply, LlmError>;

    /// Best-effort extraction of the stage's fields from what was said.
    async fn extract(&self, stage: Stage) -> Result<HashMap<String, String>, LlmError>;
}

// ── LLM engine ──────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct StageTranscript {
    system: String,
    messages: Vec<ChatMessage>,
    user_turns: u32,
}

/// Engine backed by a chat model. Keeps one transcript per stage.
pub struct LlmReasoningEngine {
    llm: Arc<dyn LlmProvider>,
    config: InterviewConfig,
    transcripts: RwLock<HashMap<Stage, StageTranscript>>,
}

impl LlmReasoningEngine {
    pub fn new(llm: Arc<dyn LlmProvider>, config: InterviewConfig) -> Self {
        Self {
            llm,
            config,
            transcripts: RwLock::new(HashMap::new()),
        }
    }

    async fn conversation(&self, stage: Stage, extra: Option<String>) -> Vec<ChatMessage> {
        let transcripts = self.transcripts.read().await;
        let mut messages = Vec::new();
        let system = transcripts
            .get(&stage)
            .map(|t| t.system.clone())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| stage_instructions(stage, &BTreeMap::new()));
        messages.push(ChatMessage::system(system));
        if let Some(t) = transcripts.get(&stage) {
            messages.extend(t.messages.iter().cloned());
        }
        if let Some(extra) = extra {
            messages.push(ChatMessage::system(extra));
        }
        messages
    }

    async fn generate(&self, stage: Stage, extra: Option<String>) -> Result<String, LlmError> {
        let messages = self.conversation(stage, extra).await;
        let request = CompletionRequest::new(messages)
            .with_max_tokens(300)
            .with_temperature(0.7);
        let response = self.llm.complete(request).await?;
        debug!(
            stage = %stage,
            input_tokens = response.input_tokens,
            output_tokens = response.output_tokens,
            "Engine reply generated"
        );
        Ok(response.content)
    }

    async fn push(&self, stage: Stage, message: ChatMessage) {
        let mut transcripts = self.transcripts.write().await;
        let transcript = transcripts.entry(stage).or_default();
        if message.role == Role::User {
            transcript.user_turns += 1;
        }
        transcript.messages.push(message);
    }

    /// Turn a model reply into a question, recording it in the transcript.
    async fn question_from(
        &self,
        stage: Stage,
        raw: &str,
        fallback_id: Option<&PromptId>,
    ) -> EngineReply {
        let parsed = parse_reply(raw);
        self.push(stage, ChatMessage::assistant(&parsed.cleaned)).await;
        let prompt_id = fallback_id
            .cloned()
            .or(parsed.prompt_id)
            .unwrap_or_else(|| derive_prompt_id(stage, &parsed.cleaned));
        EngineReply::ask(stage, prompt_id, parsed.cleaned)
    }
}

#[async_trait]
impl ReasoningEngine for LlmReasoningEngine {
    fn name(&self) -> &str {
        self.llm.model_name()
    }

    async fn open_stage(&self, stage: Stage, opening: &str, known: &BTreeMap<String, String>) {
        let mut transcripts = self.transcripts.write().await;
        let transcript = StageTranscript {
            system: stage_instructions(stage, known),
            messages: vec![ChatMessage::assistant(opening)],
            user_turns: 0,
        };
        transcripts.insert(stage, transcript);
    }

    async fn respond(&self, stage: Stage, user_text: &str) -> Result<EngineReply, LlmError> {
        self.push(stage, ChatMessage::user(user_text)).await;

        let raw = self.generate(stage, None).await?;
        let parsed = parse_reply(&raw);

        let user_turns = self
            .transcripts
            .read()
            .await
            .get(&stage)
            .map(|t| t.user_turns)
            .unwrap_or_default();
        let cap = self.config.turn_cap(stage);
        if parsed.stage_completed || user_turns >= cap {
            if !parsed.stage_completed {
                debug!(stage = %stage, user_turns, cap, "Turn cap reached; completing stage");
            }
            self.push(stage, ChatMessage::assistant(&parsed.cleaned)).await;
            let fields = match self.extract(stage).await {
                Ok(fields) => fields,
                Err(e) => {
                    warn!(stage = %stage, error = %e, "Extraction failed; completing without fields");
                    HashMap::new()
                }
            };
            return Ok(EngineReply::complete(stage, fields));
        }

        Ok(self.question_from(stage, &raw, None).await)
    }

    async fn reprompt(&self, stage: Stage, prompt_id: &PromptId) -> Result<EngineReply, LlmError> {
        let raw = self
            .generate(stage, Some(reprompt_instruction(prompt_id)))
            .await?;
        Ok(self.question_from(stage, &raw, Some(prompt_id)).await)
    }

    async fn simplify(&self, stage: Stage) -> Result<EngineReply, LlmError> {
        let raw = self
            .generate(stage, Some(simplify_instruction(stage)))
            .await?;
        Ok(self.question_from(stage, &raw, None).await)
    }

    async fn extract(&self, stage: Stage) -> Result<HashMap<String, String>, LlmError> {
        let transcript_text = {
            let transcripts = self.transcripts.read().await;
            let Some(transcript) = transcripts.get(&stage) else {
                return Ok(HashMap::new());
            };
            transcript
                .messages
                .iter()
                .map(|m| {
                    let speaker = match m.role {
                        Role::User => "Candidate",
                        Role::Assistant => "Interviewer",
                        Role::System => "System",
                    };
                    format!("{speaker}: {}", m.content)
                })
                .collect::<Vec<_>>()
                .join("\n")
        };

        let prompt = extraction_prompt(stage, &transcript_text);
        if prompt.is_empty() {
            return Ok(HashMap::new());
        }

        let request = CompletionRequest::new(vec![
            ChatMessage::system("You are a data extraction assistant. Output only valid JSON."),
            ChatMessage::user(prompt),
        ])
        .with_max_tokens(512)
        .with_temperature(0.0);
        let response = self.llm.complete(request).await?;

        match parse_extraction(stage, &response.content) {
            Some(fields) => Ok(fields),
            None => {
                warn!(
                    stage = %stage,
                    raw = %response.content,
                    "Failed to parse extraction JSON"
                );
                Err(LlmError::InvalidResponse {
                    provider: self.llm.model_name().to_string(),
                    reason: "extraction reply was not a JSON object".to_string(),
                })
            }
        }
    }
}

// ── Scripted engine ─────────────────────────────────────────────────────

/// One scripted question and the field its answer fills.
struct ScriptStep {
    prompt_id: &'static str,
    text: &'static str,
    rephrased: &'static str,
    field: &'static str,
}

/// Steps after the opening question, which is asked by the controller.
const SELF_INTRO_SCRIPT: &[ScriptStep] = &[
    ScriptStep {
        prompt_id: "intro.greeting",
        text: "",
        rephrased: "No rush. Just tell me your name and what you're working on these days.",
        field: "intro_summary",
    },
    ScriptStep {
        prompt_id: "intro.highlight",
        text: "Nice to meet you. What's one thing from your recent work you're proud of?",
        rephrased: "Is there a recent result or moment at work that stands out for you?",
        field: "highlight",
    },
];

const PAST_EXPERIENCE_SCRIPT: &[ScriptStep] = &[
    ScriptStep {
        prompt_id: "past.project",
        text: "",
        rephrased: "Any project works, big or small. What was it and what was your part?",
        field: "project_summary",
    },
    ScriptStep {
        prompt_id: "past.impact",
        text: "What impact did it have? Any numbers you can share?",
        rephrased: "How did things change once it shipped?",
        field: "impact",
    },
    ScriptStep {
        prompt_id: "past.tradeoff",
        text: "What was the hardest challenge or tradeoff along the way?",
        rephrased: "Was there a point where you had to give something up to get it done?",
        field: "constraint",
    },
];

static NAME_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:(?i:my name is|call me)\s+|\b(?:I'm|I am)\s+)([A-Z][a-zA-Z'\-]+)")
        .expect("static name pattern")
});

static ROLE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:i work as|working as|i'm|i am)\s+an?\s+([^.,;!?]+)")
        .expect("static role pattern")
});

fn script(stage: Stage) -> &'static [ScriptStep] {
    match stage {
        Stage::SelfIntro => SELF_INTRO_SCRIPT,
        Stage::PastExperience => PAST_EXPERIENCE_SCRIPT,
        Stage::Done => &[],
    }
}

/// Easier questions offered when the participant stalls, in order.
fn simplified_questions(stage: Stage) -> &'static [(&'static str, &'static str)] {
    match stage {
        Stage::SelfIntro => &[
            ("simple", "Let's keep it simple. What's your current job title?"),
            ("again", "No pressure. Just your first name and what you work on is plenty."),
        ],
        Stage::PastExperience => &[
            (
                "simple",
                "Let's keep it simple. What's one task from last month you finished and were happy with?",
            ),
            ("again", "Any small win works. What's something you fixed or improved recently?"),
        ],
        Stage::Done => &[],
    }
}

/// Pull a name and a role out of a free-form introduction.
fn intro_details(text: &str) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    if let Some(name) = NAME_PATTERN.captures(text).and_then(|c| c.get(1)) {
        fields.insert("name".to_string(), name.as_str().to_string());
    }
    if let Some(role) = ROLE_PATTERN.captures(text).and_then(|c| c.get(1)) {
        fields.insert("current_role".to_string(), role.as_str().trim().to_string());
    }
    fields
}

#[derive(Debug, Default)]
struct ScriptState {
    step: usize,
    fields: HashMap<String, String>,
    simplified: usize,
}

/// Offline engine with a fixed question script. Used when no model is
/// configured and in tests.
#[derive(Default)]
pub struct ScriptedEngine {
    states: RwLock<HashMap<Stage, ScriptState>>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReasoningEngine for ScriptedEngine {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn open_stage(&self, stage: Stage, _opening: &str, _known: &BTreeMap<String, String>) {
        self.states
            .write()
            .await
            .insert(stage, ScriptState::default());
    }

    async fn respond(&self, stage: Stage, user_text: &str) -> Result<EngineReply, LlmError> {
        let steps = script(stage);
        let mut states = self.states.write().await;
        let state = states.entry(stage).or_default();

        if let Some(step) = steps.get(state.step) {
            state
                .fields
                .insert(step.field.to_string(), user_text.trim().to_string());
        }
        if stage == Stage::SelfIntro {
            for (k, v) in intro_details(user_text) {
                state.fields.entry(k).or_insert(v);
            }
        }
        state.step += 1;

        match steps.get(state.step) {
            Some(next) => Ok(EngineReply::ask(stage, PromptId::new(next.prompt_id), next.text)),
            None => Ok(EngineReply::complete(stage, state.fields.clone())),
        }
    }

    async fn reprompt(&self, stage: Stage, prompt_id: &PromptId) -> Result<EngineReply, LlmError> {
        let text = script(stage)
            .iter()
            .find(|s| s.prompt_id == prompt_id.as_str())
            .map(|s| s.rephrased)
            .unwrap_or("Take your time. Whenever you're ready, go ahead.");
        Ok(EngineReply::ask(stage, prompt_id.clone(), text))
    }

    async fn simplify(&self, stage: Stage) -> Result<EngineReply, LlmError> {
        let mut states = self.states.write().await;
        let state = states.entry(stage).or_default();
        let attempt = state.simplified;
        state.simplified += 1;

        // Two distinct nudges per stage, then stay quiet
        let Some((suffix, text)) = simplified_questions(stage).get(attempt).copied() else {
            return Ok(EngineReply {
                stage,
                text: String::new(),
                prompt_id: None,
                completion: None,
            });
        };
        let prompt_id = PromptId::new(format!("{stage}.{suffix}"));
        Ok(EngineReply::ask(stage, prompt_id, text))
    }

    async fn extract(&self, stage: Stage) -> Result<HashMap<String, String>, LlmError> {
        Ok(self
            .states
            .read()
            .await
            .get(&stage)
            .map(|s| s.fields.clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::llm::CompletionResponse;

    /// Replays canned responses and records every request.
    struct StubLlm {
        replies: Mutex<Vec<String>>,
        requests: Mutex<Vec<CompletionRequest>>,
    }

    impl StubLlm {
        fn new(replies: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.iter().rev().map(|s| s.to_string()).collect()),
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl LlmProvider for StubLlm {
        fn model_name(&self) -> &str {
            "stub"
        }

        async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            self.requests.lock().unwrap().push(request);
            let content = self.replies.lock().unwrap().pop().unwrap_or_default();
            Ok(CompletionResponse {
                content,
                input_tokens: 0,
                output_tokens: 0,
            })
        }
    }

    #[tokio::test]
    async fn llm_engine_asks_tagged_question() {
        let llm = StubLlm::new(&["[PROMPT: intro.highlight] Nice! What's one highlight?"]);
        let engine = LlmReasoningEngine::new(llm.clone(), InterviewConfig::default());
        engine
            .open_stage(Stage::SelfIntro, "Introduce yourself?", &BTreeMap::new())
            .await;

        let reply = engine.respond(Stage::SelfIntro, "I'm Ada, an engineer").await.unwrap();
        assert_eq!(reply.text, "Nice! What's one highlight?");
        assert_eq!(reply.prompt_id, Some(PromptId::new("intro.highlight")));
        assert!(reply.completion.is_none());

        let requests = llm.requests.lock().unwrap();
        let messages = &requests[0].messages;
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[1], ChatMessage::assistant("Introduce yourself?"));
        assert_eq!(messages[2], ChatMessage::user("I'm Ada, an engineer"));
    }

    #[tokio::test]
    async fn llm_engine_completes_on_marker_and_extracts() {
        let llm = StubLlm::new(&[
            "Great, thanks!\n[STAGE_COMPLETE]",
            r#"{"name": "Ada", "current_role": "engineer", "highlight": null}"#,
        ]);
        let engine = LlmReasoningEngine::new(llm, InterviewConfig::default());
        engine
            .open_stage(Stage::SelfIntro, "Introduce yourself?", &BTreeMap::new())
            .await;

        let reply = engine
            .respond(Stage::SelfIntro, "I'm Ada, an engineer who shipped v2")
            .await
            .unwrap();
        let fields = reply.completion.unwrap();
        assert_eq!(fields.get("name").map(String::as_str), Some("Ada"));
        assert_eq!(fields.get("current_role").map(String::as_str), Some("engineer"));
        assert!(!fields.contains_key("highlight"));
    }

    #[tokio::test]
    async fn llm_engine_turn_cap_counts_as_completion() {
        let config = InterviewConfig {
            past_experience_turn_cap: 1,
            ..InterviewConfig::default()
        };
        let llm = StubLlm::new(&["What impact did it have?", r#"{"project_summary": "search"}"#]);
        let engine = LlmReasoningEngine::new(llm, config);
        engine
            .open_stage(Stage::PastExperience, "Tell me about a project.", &BTreeMap::new())
            .await;

        let reply = engine
            .respond(Stage::PastExperience, "I rebuilt search")
            .await
            .unwrap();
        assert_eq!(
            reply.completion.unwrap().get("project_summary").map(String::as_str),
            Some("search")
        );
    }

    #[tokio::test]
    async fn llm_engine_untagged_question_gets_derived_id() {
        let llm = StubLlm::new(&["And which team are you on?"]);
        let engine = LlmReasoningEngine::new(llm, InterviewConfig::default());
        let reply = engine.respond(Stage::SelfIntro, "hello").await.unwrap();
        assert_eq!(
            reply.prompt_id,
            Some(PromptId::new("self_intro.and_which_team_are_you_on"))
        );
    }

    #[tokio::test]
    async fn llm_engine_reprompt_keeps_prompt_id() {
        let llm = StubLlm::new(&["[PROMPT: other] Could you say a bit about yourself?"]);
        let engine = LlmReasoningEngine::new(llm.clone(), InterviewConfig::default());
        let id = PromptId::new("intro.greeting");
        let reply = engine.reprompt(Stage::SelfIntro, &id).await.unwrap();
        assert_eq!(reply.prompt_id, Some(id));
        assert_eq!(reply.text, "Could you say a bit about yourself?");

        let requests = llm.requests.lock().unwrap();
        let last = requests[0].messages.last().unwrap();
        assert_eq!(last.role, Role::System);
        assert!(last.content.contains("intro.greeting"));
    }

    #[tokio::test]
    async fn scripted_engine_walks_both_stages() {
        let engine = ScriptedEngine::new();
        engine
            .open_stage(Stage::SelfIntro, "", &BTreeMap::new())
            .await;

        let reply = engine
            .respond(Stage::SelfIntro, "Hi, I'm Ada and I work as a platform engineer.")
            .await
            .unwrap();
        assert_eq!(reply.prompt_id, Some(PromptId::new("intro.highlight")));

        let reply = engine
            .respond(Stage::SelfIntro, "I led the storage migration.")
            .await
            .unwrap();
        let fields = reply.completion.unwrap();
        assert_eq!(fields["name"], "Ada");
        assert_eq!(fields["current_role"], "platform engineer");
        assert_eq!(fields["highlight"], "I led the storage migration.");

        engine
            .open_stage(Stage::PastExperience, "", &BTreeMap::new())
            .await;
        for expected in ["past.impact", "past.tradeoff"] {
            let reply = engine
                .respond(Stage::PastExperience, "some answer")
                .await
                .unwrap();
            assert_eq!(reply.prompt_id, Some(PromptId::new(expected)));
        }
        let reply = engine
            .respond(Stage::PastExperience, "deadline vs scope")
            .await
            .unwrap();
        assert_eq!(reply.completion.unwrap()["constraint"], "deadline vs scope");
    }

    #[tokio::test]
    async fn scripted_simplify_rewords_then_stops() {
        let engine = ScriptedEngine::new();
        let first = engine.simplify(Stage::SelfIntro).await.unwrap();
        let second = engine.simplify(Stage::SelfIntro).await.unwrap();
        assert_ne!(first.prompt_id, second.prompt_id);
        assert_ne!(first.text, second.text);

        let third = engine.simplify(Stage::SelfIntro).await.unwrap();
        assert!(third.prompt_id.is_none());
        assert!(third.text.is_empty());
    }

    #[test]
    fn intro_details_ignores_lowercase_after_i_am() {
        let fields = intro_details("I am a data scientist");
        assert!(!fields.contains_key("name"));
        assert_eq!(fields["current_role"], "data scientist");
    }
}
