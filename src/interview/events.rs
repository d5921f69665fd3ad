//! Structured control event stream and diagnostic counters.
//!
//! Every record is mirrored to `tracing` and fanned out on a broadcast
//! channel so an observability sink (or a test) can consume it.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::stage::Stage;
use super::timers::TimerKind;

const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// What caused a control event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    NormalCompletion,
    DeadlineFallback,
    ForcedProgression,
    IdleReprompt,
    UserActivity,
    BargeIn,
}

/// The kind of record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    StageEntered,
    StageExited,
    PromptIssued { prompt_id: String },
    PromptRejected { prompt_id: String },
    RepromptRequested { prompt_id: String },
    SimplifyRequested,
    TimerArmed { timer: TimerKind },
    TimerFired { timer: TimerKind },
    TimerCancelled,
    StaleTimerDiscarded { timer: TimerKind },
    TransitionWon { to: Stage },
    /// A transition attempt that lost the boundary latch.
    DuplicateAttempt,
    StaleFieldOverwrite { field: String },
    BargeIn { token: u64 },
    UtteranceCancelled { token: u64 },
    ConcurrentOutput { live: u64, requested: u64 },
    Archived,
    ArchiveFailed { reason: String },
}

/// One record on the control event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlEvent {
    pub at: DateTime<Utc>,
    pub stage: Stage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<TriggerKind>,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Broadcast to the transport layer whenever a stage is entered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageChanged {
    pub stage: Stage,
    pub entered_at: DateTime<Utc>,
}

/// Counters for conditions that are handled locally but worth watching.
#[derive(Debug, Default)]
pub struct Diagnostics {
    duplicate_attempts: AtomicU64,
    stale_timer_callbacks: AtomicU64,
    stale_field_overwrites: AtomicU64,
    concurrent_output_errors: AtomicU64,
    barge_ins: AtomicU64,
}

/// Point-in-time copy of [`Diagnostics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticsSnapshot {
    pub duplicate_attempts: u64,
    pub stale_timer_callbacks: u64,
    pub stale_field_overwrites: u64,
    pub concurrent_output_errors: u64,
    pub barge_ins: u64,
}

impl Diagnostics {
    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            duplicate_attempts: self.duplicate_attempts.load(Ordering::Relaxed),
            stale_timer_callbacks: self.stale_timer_callbacks.load(Ordering::Relaxed),
            stale_field_overwrites: self.stale_field_overwrites.load(Ordering::Relaxed),
            concurrent_output_errors: self.concurrent_output_errors.load(Ordering::Relaxed),
            barge_ins: self.barge_ins.load(Ordering::Relaxed),
        }
    }

    fn count(&self, kind: &EventKind) {
        let counter = match kind {
            EventKind::DuplicateAttempt => &self.duplicate_attempts,
            EventKind::StaleTimerDiscarded { .. } => &self.stale_timer_callbacks,
            EventKind::StaleFieldOverwrite { .. } => &self.stale_field_overwrites,
            EventKind::ConcurrentOutput { .. } => &self.concurrent_output_errors,
            EventKind::BargeIn { .. } => &self.barge_ins,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Sink for control events.
pub struct EventLog {
    tx: broadcast::Sender<ControlEvent>,
    diagnostics: Diagnostics,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLog {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(DEFAULT_BROADCAST_CAPACITY);
        Self {
            tx,
            diagnostics: Diagnostics::default(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControlEvent> {
        self.tx.subscribe()
    }

    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    /// Record an event.
    pub fn record(&self, stage: Stage, trigger: Option<TriggerKind>, kind: EventKind) {
        self.diagnostics.count(&kind);
        trace_event(stage, trigger, &kind);
        let event = ControlEvent {
            at: Utc::now(),
            stage,
            trigger,
            kind,
        };
        // No subscribers is fine
        let _ = self.tx.send(event);
    }
}

fn trace_event(stage: Stage, trigger: Option<TriggerKind>, kind: &EventKind) {
    match kind {
        EventKind::StageEntered | EventKind::StageExited | EventKind::TransitionWon { .. } => {
            info!(stage = %stage, trigger = ?trigger, event = ?kind, "Stage event")
        }
        EventKind::ConcurrentOutput { live, requested } => error!(
            stage = %stage,
            live,
            requested,
            "Concurrent output requested; cancelling both utterances"
        ),
        EventKind::StaleFieldOverwrite { field } => warn!(
            stage = %stage,
            field = %field,
            "Rejected low-confidence overwrite of high-confidence field"
        ),
        EventKind::ArchiveFailed { reason } => {
            warn!(stage = %stage, reason = %reason, "Session archival failed")
        }
        EventKind::DuplicateAttempt => {
            info!(stage = %stage, trigger = ?trigger, "Duplicate transition attempt observed")
        }
        EventKind::BargeIn { .. } | EventKind::RepromptRequested { .. } | EventKind::Archived => {
            info!(stage = %stage, trigger = ?trigger, event = ?kind, "Control event")
        }
        _ => debug!(stage = %stage, trigger = ?trigger, event = ?kind, "Control event"),
    }
}
