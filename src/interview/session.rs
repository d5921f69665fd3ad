//! Interview session state — stage, collected fields, and merge rules.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::stage::Stage;

/// Where a collected value came from.
///
/// `High` values come from an explicit extraction (normal completion).
/// `Low` values are best-effort, supplied on a fallback transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Low,
    High,
}

/// A single extracted value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectedField {
    pub value: String,
    pub confidence: Confidence,
    pub stage: Stage,
}

/// Outcome of merging a batch of fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Field names written.
    pub applied: Vec<String>,
    /// Field names whose low-confidence value was refused because a
    /// high-confidence value already exists.
    pub rejected: Vec<String>,
}

/// Mutable state of one interview. Owned by the stage controller.
#[derive(Debug, Clone)]
pub struct Session {
    pub stage: Stage,
    /// True once a transition out of `stage` has been committed.
    pub handoff_done: bool,
    /// When each exited stage handed off to the next one.
    pub handoffs: BTreeMap<Stage, DateTime<Utc>>,
    pub stage_entered_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub collected_fields: BTreeMap<String, CollectedField>,
    pub extraction_confidence: BTreeMap<Stage, Confidence>,
    /// Recognised user utterances in the current stage.
    pub turns_in_stage: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            stage: Stage::SelfIntro,
            handoff_done: false,
            handoffs: BTreeMap::new(),
            stage_entered_at: now,
            last_activity_at: now,
            collected_fields: BTreeMap::new(),
            extraction_confidence: BTreeMap::new(),
            turns_in_stage: 0,
            started_at: now,
            completed_at: None,
        }
    }

    /// Move into the next stage. Returns the new stage, or `None` when
    /// already terminal.
    pub fn advance(&mut self, now: DateTime<Utc>) -> Option<Stage> {
        let next = self.stage.next()?;
        if !self.stage.can_transition_to(next) {
            return None;
        }
        self.stage = next;
        self.handoff_done = false;
        self.stage_entered_at = now;
        self.last_activity_at = now;
        self.turns_in_stage = 0;
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        Some(next)
    }

    /// Mark the current stage as handed off. Called once per stage, right
    /// before [`advance`](Self::advance).
    pub fn mark_handoff(&mut self, now: DateTime<Utc>) {
        self.handoff_done = true;
        self.handoffs.entry(self.stage).or_insert(now);
    }

    /// Move the activity clock forward without counting a turn.
    pub fn touch(&mut self, at: DateTime<Utc>) {
        if at > self.last_activity_at {
            self.last_activity_at = at;
        }
    }

    /// Record a recognised user utterance.
    pub fn note_activity(&mut self, at: DateTime<Utc>) {
        self.touch(at);
        self.turns_in_stage += 1;
    }

    /// Merge extracted fields.
    ///
    /// High-confidence writes replace any existing value. Low-confidence
    /// writes only fill gaps or replace other low-confidence values. Blank
    /// values never overwrite anything. `stage` is the stage the values
    /// were extracted from, which may already have been exited.
    pub fn merge_fields(
        &mut self,
        stage: Stage,
        fields: &HashMap<String, String>,
        confidence: Confidence,
    ) -> MergeReport {
        let mut report = MergeReport::default();
        let mut names: Vec<&String> = fields.keys().collect();
        names.sort();

        for name in names {
            let value = fields[name].trim();
            if value.is_empty() {
                continue;
            }
            if let Some(existing) = self.collected_fields.get(name) {
                if existing.confidence > confidence {
                    report.rejected.push(name.clone());
                    continue;
                }
            }
            self.collected_fields.insert(
                name.clone(),
                CollectedField {
                    value: value.to_string(),
                    confidence,
                    stage,
                },
            );
            report.applied.push(name.clone());
        }
        report
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.collected_fields.get(name).map(|f| f.value.as_str())
    }

    /// Read-only view for queries and archival.
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            stage: self.stage,
            handoffs: self.handoffs.clone(),
            stage_entered_at: self.stage_entered_at,
            last_activity_at: self.last_activity_at,
            fields: self
                .collected_fields
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            extraction_confidence: self.extraction_confidence.clone(),
            turns_in_stage: self.turns_in_stage,
            started_at: self.started_at,
            completed_at: self.completed_at,
        }
    }
}

/// Serializable copy of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub stage: Stage,
    #[serde(default)]
    pub handoffs: BTreeMap<Stage, DateTime<Utc>>,
    pub stage_entered_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub fields: BTreeMap<String, CollectedField>,
    pub extraction_confidence: BTreeMap<Stage, Confidence>,
    pub turns_in_stage: u32,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl SessionSnapshot {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(|f| f.value.as_str())
    }

    /// Plain key/value view of the collected fields.
    pub fn field_values(&self) -> BTreeMap<String, String> {
        self.fields
            .iter()
            .map(|(k, v)| (k.clone(), v.value.clone()))
            .collect()
    }
}
