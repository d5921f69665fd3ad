//! Interview stages and the boundaries between them.

use serde::{Deserialize, Serialize};

/// The stages of the interview.
///
/// Progresses linearly: SelfIntro → PastExperience → Done. No back-transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    SelfIntro,
    PastExperience,
    Done,
}

impl Stage {
    /// Check if a transition from `self` to `target` is valid.
    pub fn can_transition_to(&self, target: Stage) -> bool {
        use Stage::*;
        matches!(
            (self, target),
            (SelfIntro, PastExperience) | (PastExperience, Done)
        )
    }

    /// Whether this stage is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done)
    }

    /// Get the next stage in the linear progression, if any.
    pub fn next(&self) -> Option<Stage> {
        match self {
            Self::SelfIntro => Some(Self::PastExperience),
            Self::PastExperience => Some(Self::Done),
            Self::Done => None,
        }
    }

    /// The boundary crossed when leaving this stage.
    pub fn boundary(&self) -> Option<StageBoundary> {
        match self {
            Self::SelfIntro => Some(StageBoundary::SelfIntroToPastExperience),
            Self::PastExperience => Some(StageBoundary::PastExperienceToDone),
            Self::Done => None,
        }
    }
}

impl Default for Stage {
    fn default() -> Self {
        Self::SelfIntro
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::SelfIntro => "self_intro",
            Self::PastExperience => "past_experience",
            Self::Done => "done",
        };
        write!(f, "{s}")
    }
}

/// A transition point between two adjacent stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageBoundary {
    SelfIntroToPastExperience,
    PastExperienceToDone,
}

impl StageBoundary {
    pub fn from_stage(&self) -> Stage {
        match self {
            Self::SelfIntroToPastExperience => Stage::SelfIntro,
            Self::PastExperienceToDone => Stage::PastExperience,
        }
    }

    pub fn to_stage(&self) -> Stage {
        match self {
            Self::SelfIntroToPastExperience => Stage::PastExperience,
            Self::PastExperienceToDone => Stage::Done,
        }
    }
}

impl std::fmt::Display for StageBoundary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}->{}", self.from_stage(), self.to_stage())
    }
}
