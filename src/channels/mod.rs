//! Participant-facing transports.
//!
//! A channel turns participant input into [`InboundEvent`]s and renders the
//! controller's [`OutputCommand`]s. Output is fanned out through an
//! [`OutputHub`] so several transports (terminal, WebSocket clients) can
//! observe the same utterances.

pub mod cli;
pub mod ws;

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::ChannelError;
use crate::interview::{InboundEvent, OutputCommand};

pub use cli::CliChannel;
pub use ws::{ClientFrame, ServerFrame, StageRouteState, stage_routes};

/// Stream of participant events produced by a channel.
pub type InboundStream = Pin<Box<dyn Stream<Item = InboundEvent> + Send>>;

const OUTPUT_BROADCAST_CAPACITY: usize = 64;

#[async_trait]
pub trait Channel: Send + Sync {
    fn name(&self) -> &str;

    /// Start listening and return the participant's events.
    async fn start(&self) -> Result<InboundStream, ChannelError>;

    /// Render one output command (start or stop an utterance).
    async fn render(&self, command: &OutputCommand) -> Result<(), ChannelError>;

    async fn shutdown(&self) -> Result<(), ChannelError> {
        Ok(())
    }
}

/// Fan-out of output commands to every attached transport.
#[derive(Clone)]
pub struct OutputHub {
    tx: broadcast::Sender<OutputCommand>,
}

impl Default for OutputHub {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputHub {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(OUTPUT_BROADCAST_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OutputCommand> {
        self.tx.subscribe()
    }

    pub fn sender(&self) -> broadcast::Sender<OutputCommand> {
        self.tx.clone()
    }

    /// Forward the controller's output queue into the hub.
    pub fn spawn_relay(&self, mut rx: mpsc::UnboundedReceiver<OutputCommand>) -> JoinHandle<()> {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                // No transport attached yet is fine
                let _ = tx.send(command);
            }
            debug!("Output relay stopped");
        })
    }
}
