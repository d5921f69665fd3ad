//! Error types for the interview conductor.

use std::time::Duration;

use crate::interview::ledger::PromptId;
use crate::interview::output::UtteranceToken;
use crate::interview::stage::Stage;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Output error: {0}")]
    Output(#[from] OutputError),

    #[error("Prompt error: {0}")]
    Prompt(#[from] PromptError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Channel-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel {name} failed to start: {reason}")]
    StartupFailed { name: String, reason: String },

    #[error("Channel {name} disconnected: {reason}")]
    Disconnected { name: String, reason: String },

    #[error("Invalid message format: {0}")]
    InvalidMessage(String),
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Output sequencing errors.
///
/// `ConcurrentOutput` means the controller asked for a second live utterance
/// without cancelling the first. It is an invariant violation, not a
/// recoverable condition for the caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OutputError {
    #[error("Utterance {requested} requested while {live} is still live")]
    ConcurrentOutput {
        live: UtteranceToken,
        requested: UtteranceToken,
    },

    #[error("Refusing to replay cancelled utterance text")]
    ReplayRejected,

    #[error("Output channel closed")]
    ChannelClosed,
}

/// Reasons the controller refuses to speak a prompt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PromptError {
    #[error("Prompt targets {requested} but the interview is in {current}")]
    StaleStage { requested: Stage, current: Stage },

    #[error("Prompt {0} was already asked in this stage")]
    AlreadyAsked(PromptId),

    #[error("Reprompt of {0} was not sanctioned")]
    NotSanctioned(PromptId),

    #[error("Reprompt of {0} repeats the original wording")]
    VerbatimReprompt(PromptId),

    #[error(transparent)]
    Output(#[from] OutputError),
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
