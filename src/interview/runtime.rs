//! Session driver: routes participant events and controller directives to
//! the reasoning engine, and engine replies back to the controller.
//!
//! Engine calls run on spawned tasks so a slow model never delays barge-in
//! handling or timer arbitration.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::controller::{Directive, StageController};
use super::engine::{EngineReply, ReasoningEngine};
use super::output::UtteranceToken;
use super::session::Confidence;

/// Events coming from the participant-facing channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    /// A recognised (or typed) participant utterance.
    UserUtterance { text: String, at: DateTime<Utc> },
    /// Voice activity started while the assistant may be speaking.
    SpeechStarted,
    /// Playback of an utterance finished.
    SpeechFinished { token: UtteranceToken },
}

impl InboundEvent {
    pub fn utterance(text: impl Into<String>) -> Self {
        Self::UserUtterance {
            text: text.into(),
            at: Utc::now(),
        }
    }
}

#[derive(Clone)]
pub struct InterviewRuntime {
    controller: Arc<StageController>,
    engine: Arc<dyn ReasoningEngine>,
}

impl InterviewRuntime {
    pub fn new(controller: Arc<StageController>, engine: Arc<dyn ReasoningEngine>) -> Self {
        Self { controller, engine }
    }

    /// Drive the interview until both input streams close.
    pub async fn run(
        self,
        mut inbound: mpsc::Receiver<InboundEvent>,
        mut directives: mpsc::UnboundedReceiver<Directive>,
    ) {
        info!(engine = self.engine.name(), "Interview runtime started");
        loop {
            tokio::select! {
                Some(directive) = directives.recv() => self.handle_directive(directive).await,
                Some(event) = inbound.recv() => self.handle_inbound(event),
                else => break,
            }
        }
        info!("Interview runtime stopped");
    }

    fn handle_inbound(&self, event: InboundEvent) {
        match event {
            InboundEvent::UserUtterance { text, at } => {
                let text = text.trim().to_string();
                if text.is_empty() {
                    return;
                }
                let stage = self.controller.current_stage();
                if stage.is_terminal() {
                    debug!("Utterance after the interview ended; ignoring");
                    return;
                }
                // Speaking over the assistant is a barge-in even if voice
                // activity was not reported separately.
                if self.controller.live_utterance().is_some() {
                    self.controller.on_barge_in();
                }
                self.controller.on_user_activity(at);

                let runtime = self.clone();
                tokio::spawn(async move {
                    match runtime.engine.respond(stage, &text).await {
                        Ok(reply) => runtime.apply_reply(reply),
                        Err(e) => warn!(stage = %stage, error = %e, "Engine failed to respond"),
                    }
                });
            }
            InboundEvent::SpeechStarted => {
                self.controller.on_barge_in();
            }
            InboundEvent::SpeechFinished { token } => {
                self.controller.utterance_finished(token);
            }
        }
    }

    async fn handle_directive(&self, directive: Directive) {
        match directive {
            Directive::StageEntered {
                stage,
                opening,
                snapshot,
                previous,
            } => {
                // Inline so the engine sees the new stage before any reply
                self.engine
                    .open_stage(stage, &opening, &snapshot.field_values())
                    .await;
                if stage.is_terminal() {
                    info!(fields = snapshot.fields.len(), "Interview complete");
                }

                let Some(exit) = previous.filter(|p| p.confidence == Confidence::Low) else {
                    return;
                };
                let runtime = self.clone();
                tokio::spawn(async move {
                    match runtime.engine.extract(exit.stage).await {
                        Ok(fields) => {
                            runtime
                                .controller
                                .record_extraction(exit.stage, &fields, Confidence::Low);
                        }
                        Err(e) => warn!(stage = %exit.stage, error = %e, "Fallback extraction failed"),
                    }
                });
            }
            Directive::Reprompt { stage, prompt_id } => {
                let runtime = self.clone();
                tokio::spawn(async move {
                    let reply = match runtime.engine.reprompt(stage, &prompt_id).await {
                        Ok(reply) => reply,
                        Err(e) => {
                            warn!(stage = %stage, error = %e, "Engine failed to reprompt");
                            return;
                        }
                    };
                    if let Err(e) = runtime
                        .controller
                        .issue_reprompt(stage, prompt_id, &reply.text)
                    {
                        debug!(stage = %stage, error = %e, "Reprompt dropped");
                    }
                });
            }
            Directive::Simplify { stage } => {
                let runtime = self.clone();
                tokio::spawn(async move {
                    match runtime.engine.simplify(stage).await {
                        Ok(reply) => runtime.apply_reply(reply),
                        Err(e) => warn!(stage = %stage, error = %e, "Engine failed to simplify"),
                    }
                });
            }
        }
    }

    fn apply_reply(&self, reply: EngineReply) {
        if let Some(fields) = reply.completion {
            let outcome = self.controller.on_normal_completion(reply.stage, fields);
            debug!(stage = %reply.stage, outcome = ?outcome, "Normal completion submitted");
            return;
        }
        let (Some(prompt_id), false) = (reply.prompt_id, reply.text.is_empty()) else {
            return;
        };
        if let Err(e) = self
            .controller
            .issue_prompt(reply.stage, prompt_id, &reply.text)
        {
            debug!(stage = %reply.stage, error = %e, "Engine prompt dropped");
        }
    }
}
