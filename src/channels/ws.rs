//! WebSocket server + REST endpoints for interview clients.
//!
//! `GET /ws/stage` pushes stage changes and utterances to the client and
//! accepts participant turns. Every stage change is sent as a frame with a
//! top-level `stage` field, so clients that only track the current stage can
//! ignore everything else.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use crate::error::ChannelError;
use crate::interview::{
    InboundEvent, OutputCommand, SessionSnapshot, Stage, StageChanged, StageController,
    UtteranceToken,
};

/// Frames sent to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Sent once on connect, and again after the client lagged.
    StageSync {
        stage: Stage,
        session: SessionSnapshot,
    },
    StageChanged {
        stage: Stage,
        entered_at: DateTime<Utc>,
    },
    Utterance {
        token: UtteranceToken,
        text: String,
    },
    UtteranceStopped {
        token: UtteranceToken,
    },
}

impl From<StageChanged> for ServerFrame {
    fn from(changed: StageChanged) -> Self {
        Self::StageChanged {
            stage: changed.stage,
            entered_at: changed.entered_at,
        }
    }
}

impl From<OutputCommand> for ServerFrame {
    fn from(command: OutputCommand) -> Self {
        match command {
            OutputCommand::Speak(req) => Self::Utterance {
                token: req.token,
                text: req.text,
            },
            OutputCommand::Stop { token } => Self::UtteranceStopped { token },
        }
    }
}

/// Frames accepted from the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// A participant turn (typed, or recognised by client-side STT).
    Message { text: String },
    /// Client VAD detected the participant talking.
    SpeechStarted,
    /// Client finished playing an utterance.
    SpeechFinished { token: UtteranceToken },
}

impl ClientFrame {
    pub fn parse(text: &str) -> Result<Self, ChannelError> {
        serde_json::from_str(text).map_err(|e| ChannelError::InvalidMessage(e.to_string()))
    }

    fn into_event(self) -> InboundEvent {
        match self {
            Self::Message { text } => InboundEvent::utterance(text),
            Self::SpeechStarted => InboundEvent::SpeechStarted,
            Self::SpeechFinished { token } => InboundEvent::SpeechFinished { token },
        }
    }
}

/// Application state shared across handlers.
#[derive(Clone)]
pub struct StageRouteState {
    pub controller: Arc<StageController>,
    pub inbound: mpsc::Sender<InboundEvent>,
    pub output: broadcast::Sender<OutputCommand>,
}

/// Build the Axum router with the stage WebSocket and REST routes.
pub fn stage_routes(state: StageRouteState) -> Router {
    Router::new()
        .route("/ws/stage", get(ws_handler))
        .route("/api/interview/status", get(status))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "interview-conductor"
    }))
}

// ── REST ────────────────────────────────────────────────────────────────

async fn status(State(state): State<StageRouteState>) -> impl IntoResponse {
    Json(state.controller.status())
}

// ── WebSocket ───────────────────────────────────────────────────────────

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<StageRouteState>) -> impl IntoResponse {
    info!("Stage WebSocket client connecting");
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

fn sync_frame(controller: &StageController) -> ServerFrame {
    let session = controller.snapshot();
    ServerFrame::StageSync {
        stage: session.stage,
        session,
    }
}

async fn send_frame(socket: &mut WebSocket, frame: &ServerFrame) -> bool {
    match serde_json::to_string(frame) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "Failed to serialize WS frame");
            true
        }
    }
}

async fn handle_socket(mut socket: WebSocket, state: StageRouteState) {
    info!("Stage WebSocket client connected");

    // Subscribe before syncing so nothing between the two is missed
    let mut stages = state.controller.subscribe_stage_changes();
    let mut output = state.output.subscribe();

    if !send_frame(&mut socket, &sync_frame(&state.controller)).await {
        warn!("Failed to send initial sync, client disconnected");
        return;
    }

    loop {
        tokio::select! {
            result = stages.recv() => {
                match result {
                    Ok(changed) => {
                        if !send_frame(&mut socket, &ServerFrame::from(changed)).await {
                            debug!("Client disconnected during send");
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(missed = n, "WS client lagged behind stage broadcast");
                        if !send_frame(&mut socket, &sync_frame(&state.controller)).await {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Stage broadcast closed");
                        break;
                    }
                }
            }

            result = output.recv() => {
                match result {
                    Ok(command) => {
                        if !send_frame(&mut socket, &ServerFrame::from(command)).await {
                            debug!("Client disconnected during send");
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(missed = n, "WS client lagged behind output broadcast");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Output broadcast closed");
                        break;
                    }
                }
            }

            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Text(text))) => {
                        match ClientFrame::parse(&text) {
                            Ok(frame) => {
                                if state.inbound.send(frame.into_event()).await.is_err() {
                                    warn!("Interview runtime gone; closing socket");
                                    break;
                                }
                            }
                            Err(e) => debug!(error = %e, "Unrecognized WS message from client"),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Stage WebSocket client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    info!("Stage WebSocket connection closed");
}
