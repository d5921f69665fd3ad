//! Interview core: a two-stage spoken interview driven by a stage
//! controller.
//!
//! The controller owns the session and arbitrates every candidate stage
//! transition. Completions come from the reasoning engine; deadlines and the
//! idle ladder come from the timer manager. Whichever trigger reaches the
//! transition guard first commits the boundary; the rest are logged no-ops.

pub mod controller;
pub mod engine;
pub mod events;
pub mod guard;
pub mod ledger;
pub mod output;
pub mod prompts;
pub mod runtime;
pub mod session;
pub mod stage;
pub mod timers;

pub use controller::{ControllerChannels, ControllerStatus, Directive, StageController, StageExit};
pub use engine::{EngineReply, LlmReasoningEngine, ReasoningEngine, ScriptedEngine};
pub use events::{ControlEvent, DiagnosticsSnapshot, EventKind, StageChanged, TriggerKind};
pub use guard::CommitOutcome;
pub use ledger::PromptId;
pub use output::{OutputCommand, UtteranceRequested, UtteranceToken};
pub use runtime::{InboundEvent, InterviewRuntime};
pub use session::{Confidence, SessionSnapshot};
pub use stage::Stage;
