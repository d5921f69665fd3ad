//! Per-stage record of issued prompts and sanctioned reprompts.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use super::output::fingerprint;

/// Identifier of a question issued to the participant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PromptId(String);

impl PromptId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PromptId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PromptId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Tracks which prompts were asked in the current stage, with the wording
/// used, and which of them have used their single reprompt.
#[derive(Debug, Clone)]
pub struct PromptLedger {
    /// Prompt id to the normalised text it was asked with.
    asked: HashMap<PromptId, String>,
    reprompted: HashSet<PromptId>,
    last_asked: Option<PromptId>,
    budget: u32,
}

impl PromptLedger {
    /// `budget` caps sanctioned reprompts across the whole stage.
    pub fn new(budget: u32) -> Self {
        Self {
            asked: HashMap::new(),
            reprompted: HashSet::new(),
            last_asked: None,
            budget,
        }
    }

    /// Record a prompt as issued with `text`. Returns `false` if it was
    /// already asked; the first wording is kept.
    pub fn mark_asked(&mut self, id: PromptId, text: &str) -> bool {
        if self.asked.contains_key(&id) {
            return false;
        }
        self.asked.insert(id.clone(), fingerprint(text));
        self.last_asked = Some(id);
        true
    }

    pub fn was_asked(&self, id: &PromptId) -> bool {
        self.asked.contains_key(id)
    }

    /// Whether `text` repeats the wording `id` was asked with.
    pub fn is_verbatim(&self, id: &PromptId, text: &str) -> bool {
        self.asked
            .get(id)
            .is_some_and(|asked| *asked == fingerprint(text))
    }

    /// True only if `id` was asked, has not been reprompted yet, and the
    /// stage budget is not exhausted.
    pub fn may_reprompt(&self, id: &PromptId) -> bool {
        self.was_asked(id)
            && !self.reprompted.contains(id)
            && (self.reprompted.len() as u32) < self.budget
    }

    /// Consume the reprompt for `id`. Returns `false` if not allowed.
    pub fn record_reprompt(&mut self, id: &PromptId) -> bool {
        if !self.may_reprompt(id) {
            return false;
        }
        self.reprompted.insert(id.clone())
    }

    pub fn reprompt_count(&self, id: &PromptId) -> u32 {
        u32::from(self.reprompted.contains(id))
    }

    pub fn reprompts_used(&self) -> u32 {
        self.reprompted.len() as u32
    }

    pub fn last_asked(&self) -> Option<&PromptId> {
        self.last_asked.as_ref()
    }

    /// Forget everything. Called on stage entry.
    pub fn clear(&mut self) {
        self.asked.clear();
        self.reprompted.clear();
        self.last_asked = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_asked_rejects_repeats() {
        let mut ledger = PromptLedger::new(1);
        assert!(ledger.mark_asked("intro.name_role".into(), "Who are you?"));
        assert!(!ledger.mark_asked("intro.name_role".into(), "And you are?"));
        assert!(ledger.was_asked(&"intro.name_role".into()));
        assert_eq!(ledger.last_asked().map(PromptId::as_str), Some("intro.name_role"));
    }

    #[test]
    fn verbatim_check_uses_first_wording() {
        let mut ledger = PromptLedger::new(1);
        let id = PromptId::new("intro.name_role");
        ledger.mark_asked(id.clone(), "What's your name and current role?");
        ledger.mark_asked(id.clone(), "Tell me who you are.");

        assert!(ledger.is_verbatim(&id, "what's your name, and current role"));
        assert!(!ledger.is_verbatim(&id, "Tell me who you are."));
        assert!(!ledger.is_verbatim(&"intro.highlight".into(), "What's your name and current role?"));
    }

    #[test]
    fn reprompt_requires_prior_ask() {
        let ledger = PromptLedger::new(1);
        assert!(!ledger.may_reprompt(&"intro.highlight".into()));
    }

    #[test]
    fn reprompt_capped_at_one_per_prompt() {
        let mut ledger = PromptLedger::new(3);
        let id = PromptId::new("intro.name_role");
        ledger.mark_asked(id.clone(), "What's your name?");

        assert!(ledger.record_reprompt(&id));
        assert!(!ledger.may_reprompt(&id));
        assert!(!ledger.record_reprompt(&id));
        assert_eq!(ledger.reprompt_count(&id), 1);
    }

    #[test]
    fn stage_budget_limits_reprompts_across_prompts() {
        let mut ledger = PromptLedger::new(1);
        ledger.mark_asked("a".into(), "First?");
        ledger.mark_asked("b".into(), "Second?");

        assert!(ledger.record_reprompt(&"a".into()));
        assert!(!ledger.may_reprompt(&"b".into()));
        assert_eq!(ledger.reprompts_used(), 1);
    }

    #[test]
    fn last_asked_tracks_newest_prompt() {
        let mut ledger = PromptLedger::new(1);
        assert!(ledger.last_asked().is_none());
        ledger.mark_asked("a".into(), "First?");
        ledger.mark_asked("b".into(), "Second?");
        ledger.mark_asked("a".into(), "First again?");
        assert_eq!(ledger.last_asked().map(PromptId::as_str), Some("b"));
    }

    #[test]
    fn clear_resets_everything() {
        let mut ledger = PromptLedger::new(1);
        ledger.mark_asked("a".into(), "First?");
        ledger.record_reprompt(&"a".into());
        ledger.clear();

        assert!(!ledger.was_asked(&"a".into()));
        assert_eq!(ledger.reprompts_used(), 0);
        assert!(ledger.last_asked().is_none());
        assert!(ledger.mark_asked("a".into(), "First?"));
    }
}
