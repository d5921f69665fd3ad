//! CLI channel — text-only interview over stdin/stdout.
//!
//! Utterances are printed immediately and "played" for a duration derived
//! from their word count, so typing while the interviewer is still talking
//! behaves like a barge-in.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use crate::channels::{Channel, InboundStream};
use crate::error::ChannelError;
use crate::interview::{InboundEvent, OutputCommand, UtteranceToken};

/// Reads participant turns from stdin and prints the interviewer's lines.
pub struct CliChannel {
    words_per_sec: f64,
    tx: Mutex<Option<mpsc::UnboundedSender<InboundEvent>>>,
    playing: Arc<Mutex<Option<UtteranceToken>>>,
}

impl CliChannel {
    pub fn new(words_per_sec: f64) -> Self {
        Self {
            words_per_sec,
            tx: Mutex::new(None),
            playing: Arc::new(Mutex::new(None)),
        }
    }

    fn playback_time(&self, text: &str) -> Duration {
        let words = text.split_whitespace().count() as f64;
        Duration::from_secs_f64(words / self.words_per_sec.max(0.1))
    }
}

#[async_trait]
impl Channel for CliChannel {
    fn name(&self) -> &str {
        "cli"
    }

    async fn start(&self) -> Result<InboundStream, ChannelError> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.tx.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx.clone());
        let playing = Arc::clone(&self.playing);

        tokio::spawn(async move {
            let stdin = tokio::io::stdin();
            let reader = BufReader::new(stdin);
            let mut lines = reader.lines();

            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim().to_string();
                        if line.is_empty() {
                            continue;
                        }
                        if line == "/quit" {
                            break;
                        }
                        let interrupted = playing
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .take()
                            .is_some();
                        if interrupted && tx.send(InboundEvent::SpeechStarted).is_err() {
                            break;
                        }
                        if tx.send(InboundEvent::utterance(line)).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break, // EOF
                    Err(e) => {
                        tracing::error!("Error reading stdin: {}", e);
                        break;
                    }
                }
            }
        });

        let stream = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        });

        Ok(Box::pin(stream))
    }

    async fn render(&self, command: &OutputCommand) -> Result<(), ChannelError> {
        match command {
            OutputCommand::Speak(req) => {
                println!("\nInterviewer: {}\n", req.text);
                *self.playing.lock().unwrap_or_else(PoisonError::into_inner) = Some(req.token);

                let Some(tx) = self
                    .tx
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone()
                else {
                    return Err(ChannelError::Disconnected {
                        name: "cli".to_string(),
                        reason: "channel not started".to_string(),
                    });
                };
                let playing = Arc::clone(&self.playing);
                let token = req.token;
                let duration = self.playback_time(&req.text);
                tokio::spawn(async move {
                    tokio::time::sleep(duration).await;
                    let finished = {
                        let mut playing = playing.lock().unwrap_or_else(PoisonError::into_inner);
                        if *playing == Some(token) {
                            *playing = None;
                            true
                        } else {
                            false
                        }
                    };
                    if finished {
                        let _ = tx.send(InboundEvent::SpeechFinished { token });
                    }
                });
            }
            OutputCommand::Stop { token } => {
                let mut playing = self.playing.lock().unwrap_or_else(PoisonError::into_inner);
                if *playing == Some(*token) {
                    *playing = None;
                }
                eprintln!("   (interrupted)");
            }
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), ChannelError> {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interview::UtteranceRequested;

    fn token(id: u64) -> UtteranceToken {
        serde_json::from_str(&id.to_string()).unwrap()
    }

    #[test]
    fn playback_time_scales_with_words() {
        let cli = CliChannel::new(2.0);
        assert_eq!(cli.playback_time("one two three four"), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn render_before_start_is_disconnected() {
        let cli = CliChannel::new(3.0);
        let result = cli
            .render(&OutputCommand::Speak(UtteranceRequested {
                token: token(1),
                text: "hi".to_string(),
            }))
            .await;
        assert!(matches!(result, Err(ChannelError::Disconnected { .. })));
    }

    #[tokio::test]
    async fn stop_clears_playing_utterance() {
        let cli = CliChannel::new(3.0);
        *cli.playing.lock().unwrap() = Some(token(4));
        cli.render(&OutputCommand::Stop { token: token(4) })
            .await
            .unwrap();
        assert!(cli.playing.lock().unwrap().is_none());
    }
}
