//! Configuration types.

use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::interview::stage::Stage;

/// Timer settings for a single stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageTimings {
    /// Hard deadline measured from stage entry.
    pub deadline: Duration,
    /// Idle time before a gentle reprompt (t1).
    pub idle_reprompt: Duration,
    /// Idle time before forced progression (t2).
    pub idle_force: Duration,
}

impl StageTimings {
    pub fn new(deadline: Duration, idle_reprompt: Duration, idle_force: Duration) -> Self {
        Self {
            deadline,
            idle_reprompt,
            idle_force,
        }
    }
}

/// Interview pacing configuration.
#[derive(Debug, Clone)]
pub struct InterviewConfig {
    pub self_intro: StageTimings,
    pub past_experience: StageTimings,
    /// When t2 fires with at most this much time left before the deadline,
    /// it is handled as a deadline fallback instead of a simplify nudge.
    pub near_deadline_margin: Duration,
    /// Sanctioned reprompts allowed per stage.
    pub reprompt_budget: u32,
    /// User turns after which the self-introduction counts as complete.
    pub self_intro_turn_cap: u32,
    /// User turns after which past experience counts as complete
    /// (the story plus two follow-ups).
    pub past_experience_turn_cap: u32,
}

impl Default for InterviewConfig {
    fn default() -> Self {
        Self {
            self_intro: StageTimings::new(
                Duration::from_secs(60),
                Duration::from_secs(15),
                Duration::from_secs(30),
            ),
            past_experience: StageTimings::new(
                Duration::from_secs(180),
                Duration::from_secs(20),
                Duration::from_secs(40),
            ),
            near_deadline_margin: Duration::from_secs(10),
            reprompt_budget: 1,
            self_intro_turn_cap: 6,
            past_experience_turn_cap: 3,
        }
    }
}

impl InterviewConfig {
    /// Build from `INTERVIEW_*` environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            self_intro: StageTimings::new(
                env_secs("INTERVIEW_SELF_INTRO_DEADLINE_SECS", defaults.self_intro.deadline),
                env_secs("INTERVIEW_SELF_INTRO_IDLE_T1_SECS", defaults.self_intro.idle_reprompt),
                env_secs("INTERVIEW_SELF_INTRO_IDLE_T2_SECS", defaults.self_intro.idle_force),
            ),
            past_experience: StageTimings::new(
                env_secs("INTERVIEW_PAST_EXPERIENCE_DEADLINE_SECS", defaults.past_experience.deadline),
                env_secs(
                    "INTERVIEW_PAST_EXPERIENCE_IDLE_T1_SECS",
                    defaults.past_experience.idle_reprompt,
                ),
                env_secs(
                    "INTERVIEW_PAST_EXPERIENCE_IDLE_T2_SECS",
                    defaults.past_experience.idle_force,
                ),
            ),
            near_deadline_margin: env_secs(
                "INTERVIEW_NEAR_DEADLINE_MARGIN_SECS",
                defaults.near_deadline_margin,
            ),
            reprompt_budget: env_parse("INTERVIEW_REPROMPT_BUDGET", defaults.reprompt_budget),
            self_intro_turn_cap: env_parse(
                "INTERVIEW_SELF_INTRO_TURN_CAP",
                defaults.self_intro_turn_cap,
            ),
            past_experience_turn_cap: env_parse(
                "INTERVIEW_PAST_EXPERIENCE_TURN_CAP",
                defaults.past_experience_turn_cap,
            ),
        }
    }

    /// Timings for a stage. `Done` has none.
    pub fn timings(&self, stage: Stage) -> Option<StageTimings> {
        match stage {
            Stage::SelfIntro => Some(self.self_intro),
            Stage::PastExperience => Some(self.past_experience),
            Stage::Done => None,
        }
    }

    /// User-turn cap for a stage.
    pub fn turn_cap(&self, stage: Stage) -> u32 {
        match stage {
            Stage::SelfIntro => self.self_intro_turn_cap,
            Stage::PastExperience => self.past_experience_turn_cap,
            Stage::Done => 0,
        }
    }

    /// Reject settings that would make the idle ladder meaningless.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, timings) in [
            ("self_intro", self.self_intro),
            ("past_experience", self.past_experience),
        ] {
            if timings.deadline.is_zero() {
                return Err(ConfigError::InvalidValue {
                    key: format!("{name}.deadline"),
                    message: "deadline must be greater than zero".to_string(),
                });
            }
            if timings.idle_reprompt >= timings.idle_force {
                return Err(ConfigError::InvalidValue {
                    key: format!("{name}.idle"),
                    message: "t1 must fire before t2".to_string(),
                });
            }
        }
        Ok(())
    }
}

/// HTTP/WebSocket server and local runtime settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub db_path: String,
    /// Simulated speech rate for the text speaker (words per second).
    pub speech_words_per_sec: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            db_path: "./data/interview.db".to_string(),
            speech_words_per_sec: 3.0,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: env_parse("INTERVIEW_WS_PORT", defaults.port),
            db_path: std::env::var("INTERVIEW_DB_PATH").unwrap_or(defaults.db_path),
            speech_words_per_sec: env_parse(
                "INTERVIEW_SPEECH_WORDS_PER_SEC",
                defaults.speech_words_per_sec,
            ),
        }
    }
}

/// Configuration for the OpenAI-compatible chat completion backend.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: SecretString,
    pub model: String,
}

impl LlmConfig {
    /// Requires `LLM_API_KEY`; base URL and model have defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = std::env::var("LLM_API_KEY")
            .map_err(|_| ConfigError::MissingEnvVar("LLM_API_KEY".to_string()))?;
        Ok(Self {
            base_url: std::env::var("LLM_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            api_key: SecretString::from(api_key),
            model: std::env::var("LLM_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}
