//! Output sequencer — at most one live utterance, with barge-in cancellation.

use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::error::OutputError;

/// Handle for one utterance handed to the speech channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UtteranceToken(u64);

impl UtteranceToken {
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for UtteranceToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "utt-{}", self.0)
    }
}

/// Request to speak `text`; the token is used to stop it or report it done.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtteranceRequested {
    pub token: UtteranceToken,
    pub text: String,
}

/// Commands consumed by the speech-output channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputCommand {
    Speak(UtteranceRequested),
    /// Stop playback immediately. The utterance is never resumed.
    Stop { token: UtteranceToken },
}

struct LiveUtterance {
    token: UtteranceToken,
    fingerprint: String,
}

struct SequencerState {
    live: Option<LiveUtterance>,
    next_token: u64,
    /// Normalised text of utterances cancelled in the current stage.
    cancelled: HashSet<String>,
}

/// Guarantees at most one in-flight utterance.
pub struct OutputSequencer {
    state: Mutex<SequencerState>,
    tx: mpsc::UnboundedSender<OutputCommand>,
}

impl OutputSequencer {
    pub fn new(tx: mpsc::UnboundedSender<OutputCommand>) -> Self {
        Self {
            state: Mutex::new(SequencerState {
                live: None,
                next_token: 1,
                cancelled: HashSet::new(),
            }),
            tx,
        }
    }

    /// Start a new utterance.
    ///
    /// Fails with `ConcurrentOutput` if another utterance is still live; in
    /// that case both are stopped and the sequencer is reset. Fails with
    /// `ReplayRejected` if `text` matches an utterance cancelled earlier in
    /// the stage.
    pub fn begin_utterance(&self, text: &str) -> Result<UtteranceToken, OutputError> {
        let mut state = self.lock();
        let fingerprint = fingerprint(text);
        if state.cancelled.contains(&fingerprint) {
            debug!("Rejected verbatim replay of a cancelled utterance");
            return Err(OutputError::ReplayRejected);
        }

        let token = UtteranceToken(state.next_token);
        state.next_token += 1;

        if let Some(live) = state.live.take() {
            error!(
                live = %live.token,
                requested = %token,
                "Second utterance requested while one is live"
            );
            let _ = self.tx.send(OutputCommand::Stop { token: live.token });
            state.cancelled.insert(live.fingerprint);
            return Err(OutputError::ConcurrentOutput {
                live: live.token,
                requested: token,
            });
        }

        let request = UtteranceRequested {
            token,
            text: text.to_string(),
        };
        if self.tx.send(OutputCommand::Speak(request)).is_err() {
            return Err(OutputError::ChannelClosed);
        }
        state.live = Some(LiveUtterance { token, fingerprint });
        debug!(token = %token, "Utterance started");
        Ok(token)
    }

    /// Stop `token` if it is the live utterance.
    pub fn cancel(&self, token: UtteranceToken) -> bool {
        let mut state = self.lock();
        match state.live.take() {
            Some(live) if live.token == token => {
                let _ = self.tx.send(OutputCommand::Stop { token });
                state.cancelled.insert(live.fingerprint);
                debug!(token = %token, "Utterance cancelled");
                true
            }
            other => {
                state.live = other;
                false
            }
        }
    }

    /// Mark `token` as finished playing.
    pub fn complete(&self, token: UtteranceToken) -> bool {
        let mut state = self.lock();
        if state.live.as_ref().is_some_and(|l| l.token == token) {
            state.live = None;
            debug!(token = %token, "Utterance completed");
            true
        } else {
            false
        }
    }

    /// The participant started speaking: stop whatever is live.
    pub fn barge_in(&self) -> Option<UtteranceToken> {
        let cancelled = self.cancel_live();
        if let Some(token) = cancelled {
            info!(token = %token, "Barge-in cancelled live utterance");
        }
        cancelled
    }

    /// Stop the live utterance so a newer one can take its place.
    pub fn preempt(&self) -> Option<UtteranceToken> {
        self.cancel_live()
    }

    pub fn live(&self) -> Option<UtteranceToken> {
        self.lock().live.as_ref().map(|l| l.token)
    }

    /// Forget cancelled utterances. Called on stage entry.
    pub fn reset_history(&self) {
        self.lock().cancelled.clear();
    }

    fn cancel_live(&self) -> Option<UtteranceToken> {
        let mut state = self.lock();
        let live = state.live.take()?;
        let _ = self.tx.send(OutputCommand::Stop { token: live.token });
        state.cancelled.insert(live.fingerprint);
        Some(live.token)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SequencerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Case- and punctuation-insensitive form of `text`, used to spot verbatim repeats.
pub(crate) fn fingerprint(text: &str) -> String {
    text.split_whitespace()
        .map(|w| {
            w.chars()
                .filter(|c| c.is_alphanumeric())
                .collect::<String>()
                .to_lowercase()
        })
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}
