//! Stage controller — the single owner of interview state.
//!
//! Normal completions from the reasoning engine and timer callbacks both
//! arrive here as candidate transitions. Every state mutation happens under
//! one `std::sync::Mutex`; the [`TransitionGuard`] decides which trigger
//! commits a boundary. Nothing inside the locked sections awaits: timers are
//! spawned, outbound messages go over unbounded channels, and archival runs
//! on its own task after the lock is released.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::InterviewConfig;
use crate::error::{OutputError, PromptError};
use crate::store::Archive;

use super::events::{
    ControlEvent, DiagnosticsSnapshot, EventKind, EventLog, StageChanged, TriggerKind,
};
use super::guard::{CommitOutcome, OneShot, TransitionGuard};
use super::ledger::{PromptId, PromptLedger};
use super::output::{OutputCommand, OutputSequencer, UtteranceToken};
use super::prompts;
use super::session::{Confidence, Session, SessionSnapshot};
use super::stage::Stage;
use super::timers::{TimerFired, TimerKind, TimerManager};

const STAGE_BROADCAST_CAPACITY: usize = 16;

/// How the previous stage ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StageExit {
    pub stage: Stage,
    pub trigger: TriggerKind,
    pub confidence: Confidence,
}

/// Work the controller hands to the reasoning engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    /// A stage was entered and its opening question is already playing.
    StageEntered {
        stage: Stage,
        /// What was spoken on entry: the opening or bridging utterance.
        opening: String,
        snapshot: SessionSnapshot,
        previous: Option<StageExit>,
    },
    /// Rephrase `prompt_id` once. Answer with [`StageController::issue_reprompt`].
    Reprompt { stage: Stage, prompt_id: PromptId },
    /// The participant seems stuck; offer an easier angle on the stage.
    Simplify { stage: Stage },
}

/// Receiving ends created alongside the controller.
pub struct ControllerChannels {
    pub directives: mpsc::UnboundedReceiver<Directive>,
    pub output: mpsc::UnboundedReceiver<OutputCommand>,
}

/// Point-in-time status for the HTTP API.
#[derive(Debug, Clone, Serialize)]
pub struct ControllerStatus {
    pub session: SessionSnapshot,
    pub diagnostics: DiagnosticsSnapshot,
    pub reprompts_used: u32,
    pub live_utterance: Option<UtteranceToken>,
}

struct Inner {
    session: Session,
    ledger: PromptLedger,
    timers: TimerManager,
    started: bool,
    /// Reprompt sanctioned by the last t1 and not yet spoken.
    pending_reprompt: Option<PromptId>,
}

/// Work left for after the lock is released.
enum AfterLock {
    Nothing,
    Committed {
        /// Set when the interview just reached `Done`.
        archive: Option<SessionSnapshot>,
    },
}

pub struct StageController {
    inner: Mutex<Inner>,
    guard: TransitionGuard,
    archived: OneShot,
    output: OutputSequencer,
    events: Arc<EventLog>,
    stage_tx: broadcast::Sender<StageChanged>,
    directive_tx: mpsc::UnboundedSender<Directive>,
    archive: Arc<dyn Archive>,
    config: InterviewConfig,
}

impl StageController {
    /// Build a controller and spawn its timer pump. Must be called inside a
    /// Tokio runtime.
    pub fn new(
        config: InterviewConfig,
        archive: Arc<dyn Archive>,
    ) -> (Arc<Self>, ControllerChannels) {
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let (directive_tx, directive_rx) = mpsc::unbounded_channel();
        let (stage_tx, _) = broadcast::channel(STAGE_BROADCAST_CAPACITY);

        let controller = Arc::new(Self {
            inner: Mutex::new(Inner {
                session: Session::new(Utc::now()),
                ledger: PromptLedger::new(config.reprompt_budget),
                timers: TimerManager::new(timer_tx),
                started: false,
                pending_reprompt: None,
            }),
            guard: TransitionGuard::new(),
            archived: OneShot::new(),
            output: OutputSequencer::new(output_tx),
            events: Arc::new(EventLog::new()),
            stage_tx,
            directive_tx,
            archive,
            config,
        });

        tokio::spawn(timer_pump(Arc::downgrade(&controller), timer_rx));

        (
            controller,
            ControllerChannels {
                directives: directive_rx,
                output: output_rx,
            },
        )
    }

    /// Enter the first stage: arm its timers and speak its opening question.
    /// Later calls are no-ops.
    pub fn start(&self) {
        let mut inner = self.lock();
        if inner.started {
            return;
        }
        inner.started = true;
        let now = Utc::now();
        inner.session = Session::new(now);
        info!(stage = %inner.session.stage, "Interview started");
        self.enter_stage_locked(&mut inner, None);
    }

    /// The reasoning engine judged `stage` complete and extracted `fields`.
    pub fn on_normal_completion(
        &self,
        stage: Stage,
        fields: HashMap<String, String>,
    ) -> CommitOutcome {
        let committed = {
            let mut inner = self.lock();
            self.commit_locked(
                &mut inner,
                stage,
                TriggerKind::NormalCompletion,
                Some(&fields),
                Confidence::High,
            )
        };
        self.finish_commit(committed)
    }

    /// Handle a fired timer from the pump.
    pub fn on_timer(&self, fired: TimerFired) {
        let committed = {
            let mut inner = self.lock();
            let stage = inner.session.stage;
            if !inner.timers.accepts(&fired) {
                self.events.record(
                    stage,
                    None,
                    EventKind::StaleTimerDiscarded { timer: fired.kind },
                );
                return;
            }
            self.events
                .record(stage, None, EventKind::TimerFired { timer: fired.kind });

            match fired.kind {
                TimerKind::Deadline => self.commit_locked(
                    &mut inner,
                    fired.stage,
                    TriggerKind::DeadlineFallback,
                    None,
                    Confidence::Low,
                ),
                TimerKind::IdleReprompt => {
                    self.sanction_reprompt_locked(&mut inner);
                    AfterLock::Nothing
                }
                TimerKind::IdleForce => {
                    let remaining = inner
                        .timers
                        .time_to_deadline(Instant::now())
                        .unwrap_or_default();
                    if remaining <= self.config.near_deadline_margin {
                        debug!(remaining = ?remaining, "t2 within deadline margin; forcing progression");
                        self.commit_locked(
                            &mut inner,
                            fired.stage,
                            TriggerKind::ForcedProgression,
                            None,
                            Confidence::Low,
                        )
                    } else {
                        self.events.record(
                            stage,
                            Some(TriggerKind::IdleReprompt),
                            EventKind::SimplifyRequested,
                        );
                        let _ = self.directive_tx.send(Directive::Simplify { stage });
                        AfterLock::Nothing
                    }
                }
            }
        };
        self.finish_commit(committed);
    }

    /// A recognised user utterance. Rearms the idle ladder; never touches
    /// the reprompt counters.
    pub fn on_user_activity(&self, at: DateTime<Utc>) {
        let mut inner = self.lock();
        if inner.session.stage.is_terminal() {
            return;
        }
        inner.session.note_activity(at);
        self.rearm_idle_locked(&mut inner, TriggerKind::UserActivity);
        if let Some(prompt_id) = inner.pending_reprompt.take() {
            debug!(prompt_id = %prompt_id, "User spoke; dropping pending reprompt");
        }
    }

    /// The participant started speaking over the assistant. Counts as
    /// activity for the idle ladder but not as a turn.
    pub fn on_barge_in(&self) -> Option<UtteranceToken> {
        let mut inner = self.lock();
        let stage = inner.session.stage;
        if !stage.is_terminal() {
            inner.session.touch(Utc::now());
            self.rearm_idle_locked(&mut inner, TriggerKind::BargeIn);
        }
        let token = self.output.barge_in()?;
        self.events.record(
            stage,
            Some(TriggerKind::BargeIn),
            EventKind::BargeIn { token: token.id() },
        );
        self.events.record(
            stage,
            Some(TriggerKind::BargeIn),
            EventKind::UtteranceCancelled { token: token.id() },
        );
        Some(token)
    }

    /// Speak a fresh question for `stage`.
    ///
    /// Rejected when `stage` is no longer current or when `prompt_id` was
    /// already asked in this stage.
    pub fn issue_prompt(
        &self,
        stage: Stage,
        prompt_id: PromptId,
        text: &str,
    ) -> Result<UtteranceToken, PromptError> {
        let mut inner = self.lock();
        self.check_stage_locked(&inner, stage, &prompt_id)?;
        if inner.ledger.was_asked(&prompt_id) {
            self.events.record(
                stage,
                None,
                EventKind::PromptRejected {
                    prompt_id: prompt_id.to_string(),
                },
            );
            return Err(PromptError::AlreadyAsked(prompt_id));
        }

        let token = self.speak_locked(stage, text)?;
        inner.ledger.mark_asked(prompt_id.clone(), text);
        inner.pending_reprompt = None;
        self.events.record(
            stage,
            None,
            EventKind::PromptIssued {
                prompt_id: prompt_id.to_string(),
            },
        );
        Ok(token)
    }

    /// Speak the rephrasing of a prompt sanctioned by the last t1. The
    /// rephrasing must differ from the original wording.
    pub fn issue_reprompt(
        &self,
        stage: Stage,
        prompt_id: PromptId,
        text: &str,
    ) -> Result<UtteranceToken, PromptError> {
        let mut inner = self.lock();
        self.check_stage_locked(&inner, stage, &prompt_id)?;
        if inner.pending_reprompt.as_ref() != Some(&prompt_id) {
            debug!(prompt_id = %prompt_id, "Reprompt no longer pending");
            return Err(PromptError::NotSanctioned(prompt_id));
        }
        if inner.ledger.is_verbatim(&prompt_id, text) {
            self.events.record(
                stage,
                Some(TriggerKind::IdleReprompt),
                EventKind::PromptRejected {
                    prompt_id: prompt_id.to_string(),
                },
            );
            return Err(PromptError::VerbatimReprompt(prompt_id));
        }
        let token = self.speak_locked(stage, text)?;
        inner.pending_reprompt = None;
        Ok(token)
    }

    /// Merge fields extracted for `stage` outside a commit, e.g. the
    /// best-effort extraction that follows a fallback.
    pub fn record_extraction(
        &self,
        stage: Stage,
        fields: &HashMap<String, String>,
        confidence: Confidence,
    ) {
        let mut inner = self.lock();
        self.merge_locked(&mut inner, stage, fields, confidence);
        inner
            .session
            .extraction_confidence
            .entry(stage)
            .or_insert(confidence);
    }

    /// Playback of `token` finished.
    pub fn utterance_finished(&self, token: UtteranceToken) -> bool {
        self.output.complete(token)
    }

    pub fn current_stage(&self) -> Stage {
        self.lock().session.stage
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.lock().session.snapshot()
    }

    pub fn status(&self) -> ControllerStatus {
        let inner = self.lock();
        ControllerStatus {
            session: inner.session.snapshot(),
            diagnostics: self.events.diagnostics(),
            reprompts_used: inner.ledger.reprompts_used(),
            live_utterance: self.output.live(),
        }
    }

    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        self.events.diagnostics()
    }

    pub fn reprompt_count(&self, prompt_id: &PromptId) -> u32 {
        self.lock().ledger.reprompt_count(prompt_id)
    }

    pub fn live_utterance(&self) -> Option<UtteranceToken> {
        self.output.live()
    }

    pub fn subscribe_stage_changes(&self) -> broadcast::Receiver<StageChanged> {
        self.stage_tx.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ControlEvent> {
        self.events.subscribe()
    }

    fn commit_locked(
        &self,
        inner: &mut Inner,
        stage: Stage,
        trigger: TriggerKind,
        fields: Option<&HashMap<String, String>>,
        confidence: Confidence,
    ) -> AfterLock {
        let Some(boundary) = stage.boundary() else {
            debug!(stage = %stage, trigger = ?trigger, "Transition requested from terminal stage");
            return AfterLock::Nothing;
        };
        if stage > inner.session.stage {
            debug!(stage = %stage, current = %inner.session.stage, "Transition requested for a stage not yet entered");
            return AfterLock::Nothing;
        }

        if self.guard.try_commit(boundary) == CommitOutcome::Lost {
            self.events
                .record(stage, Some(trigger), EventKind::DuplicateAttempt);
            return AfterLock::Nothing;
        }

        if let Some(fields) = fields {
            self.merge_locked(inner, stage, fields, confidence);
        }
        inner
            .session
            .extraction_confidence
            .insert(stage, confidence);

        if inner.timers.disarm_stage() {
            self.events.record(stage, Some(trigger), EventKind::TimerCancelled);
        }
        let now = Utc::now();
        inner.session.mark_handoff(now);
        self.events.record(stage, Some(trigger), EventKind::StageExited);

        let Some(next) = inner.session.advance(now) else {
            warn!(stage = %stage, "Commit won but the session could not advance");
            return AfterLock::Nothing;
        };
        self.events
            .record(stage, Some(trigger), EventKind::TransitionWon { to: next });

        let exit = StageExit {
            stage,
            trigger,
            confidence,
        };
        self.enter_stage_locked(inner, Some(exit));

        AfterLock::Committed {
            archive: next.is_terminal().then(|| inner.session.snapshot()),
        }
    }

    /// Stage entry: latch, timers, ledger, bridging or opening utterance,
    /// notifications.
    fn enter_stage_locked(&self, inner: &mut Inner, previous: Option<StageExit>) {
        let stage = inner.session.stage;
        let trigger = previous.map(|p| p.trigger);

        inner.ledger.clear();
        inner.pending_reprompt = None;
        self.output.reset_history();

        if let Some(boundary) = stage.boundary() {
            self.guard.open(boundary);
        }
        if let Some(timings) = self.config.timings(stage) {
            inner.timers.arm_stage(stage, timings, Instant::now());
            for timer in [
                TimerKind::Deadline,
                TimerKind::IdleReprompt,
                TimerKind::IdleForce,
            ] {
                self.events
                    .record(stage, trigger, EventKind::TimerArmed { timer });
            }
        }
        self.events.record(stage, trigger, EventKind::StageEntered);

        let text = match previous {
            Some(exit) => {
                let known = inner.session.snapshot().field_values();
                prompts::bridging_message(stage, &known, exit.confidence)
            }
            None => prompts::stage_profile(stage)
                .map(|p| p.opening_text.to_string())
                .unwrap_or_default(),
        };
        if let Some(profile) = prompts::stage_profile(stage) {
            inner
                .ledger
                .mark_asked(PromptId::new(profile.opening_prompt), profile.opening_text);
        }
        if let Some(live) = self.output.preempt() {
            self.events.record(
                stage,
                trigger,
                EventKind::UtteranceCancelled { token: live.id() },
            );
        }
        if !text.is_empty() {
            // The slot was just cleared, so only a closed channel can fail here
            if let Err(e) = self.speak_locked(stage, &text) {
                warn!(stage = %stage, error = %e, "Failed to speak stage entry utterance");
            }
        }

        let _ = self.stage_tx.send(StageChanged {
            stage,
            entered_at: inner.session.stage_entered_at,
        });
        let _ = self.directive_tx.send(Directive::StageEntered {
            stage,
            opening: text,
            snapshot: inner.session.snapshot(),
            previous,
        });
    }

    fn finish_commit(&self, after: AfterLock) -> CommitOutcome {
        match after {
            AfterLock::Nothing => CommitOutcome::Lost,
            AfterLock::Committed { archive } => {
                if let Some(snapshot) = archive {
                    self.archive_once(snapshot);
                }
                CommitOutcome::Won
            }
        }
    }

    fn archive_once(&self, snapshot: SessionSnapshot) {
        if !self.archived.try_acquire() {
            return;
        }
        let archive = Arc::clone(&self.archive);
        let events = Arc::clone(&self.events);
        tokio::spawn(async move {
            match archive.store_summary(&snapshot).await {
                Ok(id) => {
                    info!(archive_id = %id, "Interview summary archived");
                    events.record(snapshot.stage, None, EventKind::Archived);
                }
                Err(e) => events.record(
                    snapshot.stage,
                    None,
                    EventKind::ArchiveFailed {
                        reason: e.to_string(),
                    },
                ),
            }
        });
    }

    /// Restart the idle ladder from now. No-op when no stage is armed.
    fn rearm_idle_locked(&self, inner: &mut Inner, trigger: TriggerKind) {
        if !inner.timers.note_activity(Instant::now()) {
            return;
        }
        let stage = inner.session.stage;
        for timer in [TimerKind::IdleReprompt, TimerKind::IdleForce] {
            self.events
                .record(stage, Some(trigger), EventKind::TimerArmed { timer });
        }
    }

    fn sanction_reprompt_locked(&self, inner: &mut Inner) {
        let stage = inner.session.stage;
        let Some(prompt_id) = inner.ledger.last_asked().cloned() else {
            debug!(stage = %stage, "t1 fired before any prompt was asked");
            return;
        };
        if !inner.ledger.record_reprompt(&prompt_id) {
            debug!(stage = %stage, prompt_id = %prompt_id, "Reprompt not allowed; ignoring t1");
            return;
        }
        self.events.record(
            stage,
            Some(TriggerKind::IdleReprompt),
            EventKind::RepromptRequested {
                prompt_id: prompt_id.to_string(),
            },
        );
        inner.pending_reprompt = Some(prompt_id.clone());
        let _ = self
            .directive_tx
            .send(Directive::Reprompt { stage, prompt_id });
    }

    fn merge_locked(
        &self,
        inner: &mut Inner,
        stage: Stage,
        fields: &HashMap<String, String>,
        confidence: Confidence,
    ) {
        let report = inner.session.merge_fields(stage, fields, confidence);
        for field in report.rejected {
            self.events.record(
                inner.session.stage,
                None,
                EventKind::StaleFieldOverwrite { field },
            );
        }
    }

    fn check_stage_locked(
        &self,
        inner: &Inner,
        stage: Stage,
        prompt_id: &PromptId,
    ) -> Result<(), PromptError> {
        let current = inner.session.stage;
        if stage != current || current.is_terminal() {
            self.events.record(
                current,
                None,
                EventKind::PromptRejected {
                    prompt_id: prompt_id.to_string(),
                },
            );
            return Err(PromptError::StaleStage {
                requested: stage,
                current,
            });
        }
        Ok(())
    }

    fn speak_locked(&self, stage: Stage, text: &str) -> Result<UtteranceToken, PromptError> {
        match self.output.begin_utterance(text) {
            Ok(token) => Ok(token),
            Err(OutputError::ConcurrentOutput { live, requested }) => {
                self.events.record(
                    stage,
                    None,
                    EventKind::ConcurrentOutput {
                        live: live.id(),
                        requested: requested.id(),
                    },
                );
                Err(OutputError::ConcurrentOutput { live, requested }.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Forward timer messages to the controller until it is dropped.
async fn timer_pump(controller: Weak<StageController>, mut rx: mpsc::UnboundedReceiver<TimerFired>) {
    while let Some(fired) = rx.recv().await {
        let Some(controller) = controller.upgrade() else {
            break;
        };
        controller.on_timer(fired);
    }
    debug!("Timer pump stopped");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::StageTimings;
    use crate::store::MemoryArchive;

    fn fields(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn controller_with(
        config: InterviewConfig,
    ) -> (Arc<StageController>, ControllerChannels, Arc<MemoryArchive>) {
        let archive = Arc::new(MemoryArchive::new());
        let (controller, channels) = StageController::new(config, archive.clone());
        (controller, channels, archive)
    }

    fn started() -> (Arc<StageController>, ControllerChannels, Arc<MemoryArchive>) {
        let (controller, channels, archive) = controller_with(InterviewConfig::default());
        controller.start();
        (controller, channels, archive)
    }

    fn drain_stage_changes(rx: &mut broadcast::Receiver<StageChanged>) -> Vec<Stage> {
        let mut stages = Vec::new();
        while let Ok(changed) = rx.try_recv() {
            stages.push(changed.stage);
        }
        stages
    }

    fn transitions(rx: &mut broadcast::Receiver<ControlEvent>) -> Vec<(Stage, Option<TriggerKind>)> {
        let mut won = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let EventKind::TransitionWon { to } = event.kind {
                won.push((to, event.trigger));
            }
        }
        won
    }

    #[tokio::test(start_paused = true)]
    async fn start_speaks_opening_question_once() {
        let (controller, mut channels, _) = started();
        controller.start();

        match channels.output.try_recv().unwrap() {
            OutputCommand::Speak(req) => assert!(req.text.contains("introduce yourself")),
            other => panic!("expected Speak, got {other:?}"),
        }
        assert!(channels.output.try_recv().is_err());
        assert!(matches!(
            channels.directives.try_recv().unwrap(),
            Directive::StageEntered {
                stage: Stage::SelfIntro,
                previous: None,
                ..
            }
        ));
        assert_eq!(controller.current_stage(), Stage::SelfIntro);
    }

    #[tokio::test(start_paused = true)]
    async fn completion_before_deadline_commits_with_high_confidence() {
        let (controller, _channels, _) = started();
        let mut changes = controller.subscribe_stage_changes();
        let mut events = controller.subscribe_events();

        tokio::time::sleep(Duration::from_secs(58)).await;
        let outcome = controller.on_normal_completion(
            Stage::SelfIntro,
            fields(&[("name", "Ada"), ("current_role", "engineer")]),
        );
        assert_eq!(outcome, CommitOutcome::Won);

        // The old deadline must not fire against the new stage
        tokio::time::sleep(Duration::from_secs(5)).await;

        let snapshot = controller.snapshot();
        assert_eq!(snapshot.stage, Stage::PastExperience);
        assert_eq!(
            snapshot.extraction_confidence.get(&Stage::SelfIntro),
            Some(&Confidence::High)
        );
        assert_eq!(snapshot.field("name"), Some("Ada"));
        assert_eq!(drain_stage_changes(&mut changes), vec![Stage::PastExperience]);
        assert_eq!(
            transitions(&mut events),
            vec![(Stage::PastExperience, Some(TriggerKind::NormalCompletion))]
        );
        assert_eq!(controller.diagnostics().duplicate_attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_without_completion_falls_back_with_low_confidence() {
        let (controller, _channels, _) = started();
        let start = Instant::now();
        let mut changes = controller.subscribe_stage_changes();
        let mut events = controller.subscribe_events();

        let changed = changes.recv().await.unwrap();
        assert_eq!(changed.stage, Stage::PastExperience);
        assert_eq!(start.elapsed().as_secs(), 60);

        let snapshot = controller.snapshot();
        assert_eq!(
            snapshot.extraction_confidence.get(&Stage::SelfIntro),
            Some(&Confidence::Low)
        );
        assert!(snapshot.fields.is_empty());
        assert_eq!(
            transitions(&mut events),
            vec![(Stage::PastExperience, Some(TriggerKind::DeadlineFallback))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn simultaneous_completion_and_deadline_commit_once() {
        let (controller, _channels, _) = started();
        let start = Instant::now();
        let mut changes = controller.subscribe_stage_changes();

        tokio::time::sleep_until(start + Duration::from_secs(60)).await;
        let outcome = controller.on_normal_completion(Stage::SelfIntro, fields(&[("name", "Ada")]));
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(drain_stage_changes(&mut changes), vec![Stage::PastExperience]);
        let diagnostics = controller.diagnostics();
        match outcome {
            CommitOutcome::Won => assert_eq!(diagnostics.duplicate_attempts, 0),
            CommitOutcome::Lost => assert_eq!(diagnostics.duplicate_attempts, 1),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_triggers_observe_exactly_one_winner() {
        for _ in 0..20 {
            let (controller, _channels, _) = started();
            let mut changes = controller.subscribe_stage_changes();
            let deadline = {
                let inner = controller.lock();
                TimerFired {
                    kind: TimerKind::Deadline,
                    stage: Stage::SelfIntro,
                    epoch: inner.timers.epoch(),
                    idle_generation: 0,
                }
            };

            let barrier = Arc::new(std::sync::Barrier::new(3));
            let mut handles = Vec::new();
            for i in 0..3 {
                let controller = Arc::clone(&controller);
                let barrier = Arc::clone(&barrier);
                handles.push(tokio::task::spawn_blocking(move || {
                    barrier.wait();
                    if i == 0 {
                        controller.on_timer(deadline);
                    } else {
                        controller.on_normal_completion(Stage::SelfIntro, HashMap::new());
                    }
                }));
            }
            for handle in handles {
                handle.await.unwrap();
            }

            assert_eq!(drain_stage_changes(&mut changes), vec![Stage::PastExperience]);
            let diagnostics = controller.diagnostics();
            assert_eq!(
                diagnostics.duplicate_attempts + diagnostics.stale_timer_callbacks,
                2
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reprompt_then_activity_keeps_counter_at_one() {
        let (controller, mut channels, _) = started();
        let greeting = PromptId::new("intro.greeting");
        let _entered = channels.directives.try_recv().unwrap();

        tokio::time::sleep(Duration::from_millis(15_500)).await;
        assert_eq!(controller.reprompt_count(&greeting), 1);
        assert_eq!(
            channels.directives.try_recv().unwrap(),
            Directive::Reprompt {
                stage: Stage::SelfIntro,
                prompt_id: greeting.clone(),
            }
        );

        tokio::time::sleep(Duration::from_millis(500)).await;
        controller.on_user_activity(Utc::now());

        // Rearmed t1 fires at 31s and must be refused
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(controller.reprompt_count(&greeting), 1);
        assert_eq!(controller.status().reprompts_used, 1);
        assert!(channels.directives.try_recv().is_err());

        // The sanctioned rephrasing arrived too late to be spoken
        assert_eq!(
            controller
                .issue_reprompt(Stage::SelfIntro, greeting.clone(), "Could you tell me a bit about yourself?")
                .unwrap_err(),
            PromptError::NotSanctioned(greeting)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn sanctioned_reprompt_is_spoken_once() {
        let (controller, mut channels, _) = started();
        let greeting = PromptId::new("intro.greeting");
        let opening = match channels.output.try_recv().unwrap() {
            OutputCommand::Speak(req) => req.token,
            other => panic!("expected Speak, got {other:?}"),
        };
        controller.utterance_finished(opening);

        tokio::time::sleep(Duration::from_millis(15_100)).await;
        let token = controller
            .issue_reprompt(Stage::SelfIntro, greeting.clone(), "No rush. Who are you and what do you do?")
            .unwrap();
        assert_eq!(controller.live_utterance(), Some(token));
        assert!(controller
            .issue_reprompt(Stage::SelfIntro, greeting, "Anything about you?")
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn verbatim_reprompt_is_refused() {
        let (controller, mut channels, _) = started();
        let greeting = PromptId::new("intro.greeting");
        let opening = match channels.output.try_recv().unwrap() {
            OutputCommand::Speak(req) => req,
            other => panic!("expected Speak, got {other:?}"),
        };
        controller.utterance_finished(opening.token);

        tokio::time::sleep(Duration::from_millis(15_100)).await;
        assert_eq!(
            controller
                .issue_reprompt(Stage::SelfIntro, greeting.clone(), &opening.text.to_uppercase())
                .unwrap_err(),
            PromptError::VerbatimReprompt(greeting.clone())
        );
        assert!(controller.live_utterance().is_none());

        // Still pending, so a real rephrasing goes through
        assert!(controller
            .issue_reprompt(Stage::SelfIntro, greeting, "No rush. What do you do these days?")
            .is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_ladder_arming_is_logged() {
        let (controller, _channels, _) = controller_with(InterviewConfig::default());
        let mut events = controller.subscribe_events();
        controller.start();
        controller.on_user_activity(Utc::now());
        let before_barge_in = Utc::now();
        controller.on_barge_in();

        let mut armed = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let EventKind::TimerArmed { timer } = event.kind {
                armed.push((timer, event.trigger));
            }
        }
        assert_eq!(
            armed,
            vec![
                (TimerKind::Deadline, None),
                (TimerKind::IdleReprompt, None),
                (TimerKind::IdleForce, None),
                (TimerKind::IdleReprompt, Some(TriggerKind::UserActivity)),
                (TimerKind::IdleForce, Some(TriggerKind::UserActivity)),
                (TimerKind::IdleReprompt, Some(TriggerKind::BargeIn)),
                (TimerKind::IdleForce, Some(TriggerKind::BargeIn)),
            ]
        );

        // Barge-in moves the activity clock but is not a turn
        let snapshot = controller.snapshot();
        assert!(snapshot.last_activity_at >= before_barge_in);
        assert_eq!(snapshot.turns_in_stage, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn handoff_is_recorded_and_losers_are_logged() {
        let (controller, _channels, _) = started();
        let mut events = controller.subscribe_events();

        assert!(controller
            .on_normal_completion(Stage::SelfIntro, fields(&[("name", "Ada")]))
            .is_won());
        assert!(!controller
            .on_normal_completion(Stage::SelfIntro, HashMap::new())
            .is_won());

        let snapshot = controller.snapshot();
        assert!(snapshot.handoffs.contains_key(&Stage::SelfIntro));
        assert!(!snapshot.handoffs.contains_key(&Stage::PastExperience));

        let mut lost = Vec::new();
        while let Ok(event) = events.try_recv() {
            if event.kind == EventKind::DuplicateAttempt {
                lost.push((event.stage, event.trigger));
            }
        }
        assert_eq!(
            lost,
            vec![(Stage::SelfIntro, Some(TriggerKind::NormalCompletion))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn idle_force_far_from_deadline_asks_for_simplification() {
        let (controller, mut channels, _) = started();
        let _entered = channels.directives.try_recv().unwrap();

        tokio::time::sleep(Duration::from_millis(30_500)).await;
        assert!(matches!(
            channels.directives.try_recv().unwrap(),
            Directive::Reprompt { .. }
        ));
        assert_eq!(
            channels.directives.try_recv().unwrap(),
            Directive::Simplify {
                stage: Stage::SelfIntro
            }
        );
        assert_eq!(controller.current_stage(), Stage::SelfIntro);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_force_near_deadline_forces_progression() {
        let config = InterviewConfig {
            self_intro: StageTimings::new(
                Duration::from_secs(35),
                Duration::from_secs(15),
                Duration::from_secs(30),
            ),
            ..InterviewConfig::default()
        };
        let (controller, _channels, _) = controller_with(config);
        controller.start();
        let start = Instant::now();
        let mut changes = controller.subscribe_stage_changes();
        let mut events = controller.subscribe_events();

        let changed = changes.recv().await.unwrap();
        assert_eq!(changed.stage, Stage::PastExperience);
        assert_eq!(start.elapsed().as_secs(), 30);
        assert_eq!(
            transitions(&mut events),
            vec![(Stage::PastExperience, Some(TriggerKind::ForcedProgression))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn barge_in_cancels_and_next_utterance_is_fresh() {
        let (controller, mut channels, _) = started();
        let opening = match channels.output.try_recv().unwrap() {
            OutputCommand::Speak(req) => req,
            other => panic!("expected Speak, got {other:?}"),
        };

        assert_eq!(controller.on_barge_in(), Some(opening.token));
        assert_eq!(
            channels.output.try_recv().unwrap(),
            OutputCommand::Stop {
                token: opening.token
            }
        );
        assert!(controller.live_utterance().is_none());
        assert_eq!(controller.diagnostics().barge_ins, 1);

        // Replaying the cancelled text under a new id is refused
        assert_eq!(
            controller
                .issue_prompt(Stage::SelfIntro, PromptId::new("intro.again"), &opening.text)
                .unwrap_err(),
            PromptError::Output(OutputError::ReplayRejected)
        );

        let next = controller
            .issue_prompt(
                Stage::SelfIntro,
                PromptId::new("intro.name_role"),
                "Sorry, go ahead. What's your current role?",
            )
            .unwrap();
        assert_ne!(next, opening.token);
        match channels.output.try_recv().unwrap() {
            OutputCommand::Speak(req) => assert_eq!(req.token, next),
            other => panic!("expected Speak, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn second_live_utterance_is_concurrent_output() {
        let (controller, mut channels, _) = started();
        let _opening = channels.output.try_recv().unwrap();

        let err = controller
            .issue_prompt(Stage::SelfIntro, PromptId::new("intro.highlight"), "Any highlight?")
            .unwrap_err();
        assert!(matches!(
            err,
            PromptError::Output(OutputError::ConcurrentOutput { .. })
        ));
        assert!(matches!(
            channels.output.try_recv().unwrap(),
            OutputCommand::Stop { .. }
        ));
        assert!(controller.live_utterance().is_none());
        assert_eq!(controller.diagnostics().concurrent_output_errors, 1);

        // The failed prompt was never marked asked
        assert!(controller
            .issue_prompt(Stage::SelfIntro, PromptId::new("intro.highlight"), "Any highlight?")
            .is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_and_stale_prompts_are_rejected() {
        let (controller, mut channels, _) = started();
        let opening = match channels.output.try_recv().unwrap() {
            OutputCommand::Speak(req) => req.token,
            other => panic!("expected Speak, got {other:?}"),
        };
        controller.utterance_finished(opening);

        assert_eq!(
            controller
                .issue_prompt(Stage::SelfIntro, PromptId::new("intro.greeting"), "Hello again?")
                .unwrap_err(),
            PromptError::AlreadyAsked(PromptId::new("intro.greeting"))
        );
        assert!(matches!(
            controller
                .issue_prompt(Stage::PastExperience, PromptId::new("past.project"), "A project?")
                .unwrap_err(),
            PromptError::StaleStage {
                requested: Stage::PastExperience,
                current: Stage::SelfIntro
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn bridging_utterance_preempts_live_output() {
        let (controller, mut channels, _) = started();
        let opening = match channels.output.try_recv().unwrap() {
            OutputCommand::Speak(req) => req.token,
            other => panic!("expected Speak, got {other:?}"),
        };

        controller.on_normal_completion(Stage::SelfIntro, fields(&[("name", "Ada")]));

        assert_eq!(
            channels.output.try_recv().unwrap(),
            OutputCommand::Stop { token: opening }
        );
        match channels.output.try_recv().unwrap() {
            OutputCommand::Speak(req) => {
                assert!(req.text.starts_with("Thanks, Ada."));
                assert!(req.text.contains("past experience"));
            }
            other => panic!("expected Speak, got {other:?}"),
        }
        assert_eq!(controller.diagnostics().concurrent_output_errors, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn low_confidence_extraction_does_not_overwrite() {
        let (controller, _channels, _) = started();
        controller.on_normal_completion(Stage::SelfIntro, fields(&[("name", "Ada")]));
        controller.record_extraction(
            Stage::SelfIntro,
            &fields(&[("name", "Bob"), ("highlight", "shipped v2")]),
            Confidence::Low,
        );

        let snapshot = controller.snapshot();
        assert_eq!(snapshot.field("name"), Some("Ada"));
        assert_eq!(snapshot.field("highlight"), Some("shipped v2"));
        assert_eq!(snapshot.fields["highlight"].stage, Stage::SelfIntro);
        assert_eq!(controller.diagnostics().stale_field_overwrites, 1);
        assert_eq!(
            snapshot.extraction_confidence.get(&Stage::SelfIntro),
            Some(&Confidence::High)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reaching_done_archives_exactly_once() {
        let (controller, _channels, archive) = started();
        assert!(controller
            .on_normal_completion(Stage::SelfIntro, fields(&[("name", "Ada")]))
            .is_won());

        // Past experience is left to its deadline
        tokio::time::sleep(Duration::from_secs(181)).await;
        assert_eq!(controller.current_stage(), Stage::Done);
        assert_eq!(
            controller.on_normal_completion(Stage::PastExperience, HashMap::new()),
            CommitOutcome::Lost
        );
        assert_eq!(
            controller.on_normal_completion(Stage::Done, HashMap::new()),
            CommitOutcome::Lost
        );
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(archive.len().await, 1);
        let stored = archive.recent_summaries(1).await.unwrap();
        assert_eq!(stored[0].stage, Stage::Done);
        assert_eq!(stored[0].field("name"), Some("Ada"));
        assert_eq!(
            stored[0].extraction_confidence.get(&Stage::PastExperience),
            Some(&Confidence::Low)
        );
        assert!(stored[0].completed_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn completion_for_unentered_stage_is_ignored() {
        let (controller, _channels, _) = started();
        assert_eq!(
            controller.on_normal_completion(Stage::PastExperience, HashMap::new()),
            CommitOutcome::Lost
        );
        assert_eq!(controller.current_stage(), Stage::SelfIntro);
        assert_eq!(controller.diagnostics().duplicate_attempts, 0);
    }
}
