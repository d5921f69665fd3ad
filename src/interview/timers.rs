//! Timer manager — per-stage deadline plus the two-step idle ladder.
//!
//! Timers run as spawned tasks that send a [`TimerFired`] message when they
//! elapse. Each message carries the stage epoch and idle generation it was
//! scheduled under; the receiver must check [`TimerManager::accepts`] while
//! holding the same lock that guards `disarm_stage` / `note_activity`, so a
//! callback already in flight when the timers are disarmed or rearmed is
//! discarded instead of being interpreted against newer state.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::config::StageTimings;

use super::stage::Stage;

/// Which timer fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerKind {
    /// Hard per-stage deadline.
    Deadline,
    /// Idle step t1: gentle reprompt.
    IdleReprompt,
    /// Idle step t2: forced progression.
    IdleForce,
}

/// Message sent by a timer task when it elapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    pub kind: TimerKind,
    pub stage: Stage,
    pub epoch: u64,
    pub idle_generation: u64,
}

struct ArmedStage {
    stage: Stage,
    timings: StageTimings,
    deadline_at: Instant,
    deadline: JoinHandle<()>,
    idle: Vec<JoinHandle<()>>,
}

impl ArmedStage {
    fn abort_idle(&mut self) {
        for handle in self.idle.drain(..) {
            handle.abort();
        }
    }

    fn abort_all(&mut self) {
        self.abort_idle();
        self.deadline.abort();
    }
}

/// Owns the timers of the active stage.
pub struct TimerManager {
    tx: mpsc::UnboundedSender<TimerFired>,
    epoch: u64,
    idle_generation: u64,
    armed: Option<ArmedStage>,
}

impl TimerManager {
    pub fn new(tx: mpsc::UnboundedSender<TimerFired>) -> Self {
        Self {
            tx,
            epoch: 0,
            idle_generation: 0,
            armed: None,
        }
    }

    /// Schedule the deadline (from `entered_at`) and the idle ladder (from
    /// `entered_at` as the initial activity instant). Any previously armed
    /// stage is disarmed first.
    pub fn arm_stage(&mut self, stage: Stage, timings: StageTimings, entered_at: Instant) -> u64 {
        self.disarm_stage();
        self.epoch += 1;
        self.idle_generation += 1;

        let deadline_at = entered_at + timings.deadline;
        let deadline = self.spawn(TimerKind::Deadline, stage, deadline_at);
        let mut armed = ArmedStage {
            stage,
            timings,
            deadline_at,
            deadline,
            idle: Vec::new(),
        };
        armed.idle = self.spawn_ladder(stage, timings, entered_at);
        self.armed = Some(armed);

        debug!(stage = %stage, epoch = self.epoch, deadline = ?timings.deadline, "Stage timers armed");
        self.epoch
    }

    /// Cancel every timer of the armed stage. Idempotent.
    ///
    /// Bumps the epoch, so messages from aborted tasks that were already
    /// queued fail [`accepts`](Self::accepts).
    pub fn disarm_stage(&mut self) -> bool {
        match self.armed.take() {
            Some(mut armed) => {
                armed.abort_all();
                self.epoch += 1;
                debug!(stage = %armed.stage, epoch = self.epoch, "Stage timers disarmed");
                true
            }
            None => false,
        }
    }

    /// Rearm the idle ladder relative to `at`. The deadline is untouched.
    /// Returns `false` when no stage is armed.
    pub fn note_activity(&mut self, at: Instant) -> bool {
        let Some(mut armed) = self.armed.take() else {
            return false;
        };
        armed.abort_idle();
        self.idle_generation += 1;
        armed.idle = self.spawn_ladder(armed.stage, armed.timings, at);
        self.armed = Some(armed);
        true
    }

    /// Whether a fired timer still belongs to the current arming.
    pub fn accepts(&self, fired: &TimerFired) -> bool {
        let Some(armed) = &self.armed else {
            return false;
        };
        if fired.epoch != self.epoch || fired.stage != armed.stage {
            return false;
        }
        match fired.kind {
            TimerKind::Deadline => true,
            TimerKind::IdleReprompt | TimerKind::IdleForce => {
                fired.idle_generation == self.idle_generation
            }
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn deadline_at(&self) -> Option<Instant> {
        self.armed.as_ref().map(|a| a.deadline_at)
    }

    /// Time left before the deadline, zero if it has passed.
    pub fn time_to_deadline(&self, now: Instant) -> Option<Duration> {
        self.deadline_at()
            .map(|at| at.saturating_duration_since(now))
    }

    fn spawn_ladder(&self, stage: Stage, timings: StageTimings, from: Instant) -> Vec<JoinHandle<()>> {
        vec![
            self.spawn(TimerKind::IdleReprompt, stage, from + timings.idle_reprompt),
            self.spawn(TimerKind::IdleForce, stage, from + timings.idle_force),
        ]
    }

    fn spawn(&self, kind: TimerKind, stage: Stage, at: Instant) -> JoinHandle<()> {
        let fired = TimerFired {
            kind,
            stage,
            epoch: self.epoch,
            idle_generation: self.idle_generation,
        };
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(at).await;
            // Receiver gone means the controller shut down
            let _ = tx.send(fired);
        })
    }
}

impl Drop for TimerManager {
    fn drop(&mut self) {
        if let Some(mut armed) = self.armed.take() {
            armed.abort_all();
        }
    }
}
