use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use futures::StreamExt;
use tokio::sync::mpsc;

use interview_conductor::channels::{Channel, CliChannel, OutputHub, StageRouteState, stage_routes};
use interview_conductor::config::{InterviewConfig, LlmConfig, ServerConfig};
use interview_conductor::error::ChannelError;
use interview_conductor::interview::{
    InterviewRuntime, LlmReasoningEngine, ReasoningEngine, ScriptedEngine, StageController,
};
use interview_conductor::llm::create_provider;
use interview_conductor::store::{Archive, LibSqlArchive};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let interview_config = InterviewConfig::from_env();
    interview_config.validate()?;
    let server_config = ServerConfig::from_env();

    // ── Reasoning engine ─────────────────────────────────────────────────
    let engine: Arc<dyn ReasoningEngine> = match LlmConfig::from_env() {
        Ok(llm_config) => {
            let llm = create_provider(&llm_config)?;
            Arc::new(LlmReasoningEngine::new(llm, interview_config.clone()))
        }
        Err(e) => {
            tracing::warn!("{e}; using the scripted interviewer");
            Arc::new(ScriptedEngine::new())
        }
    };

    eprintln!("🎙️  Interview Conductor v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Engine: {}", engine.name());
    eprintln!("   Stage WS: ws://0.0.0.0:{}/ws/stage", server_config.port);
    eprintln!("   Status API: http://0.0.0.0:{}/api/interview/status", server_config.port);
    eprintln!("   Type your answers and press Enter. /quit to exit.\n");

    // ── Database ─────────────────────────────────────────────────────────
    let archive: Arc<dyn Archive> = Arc::new(
        LibSqlArchive::new_local(Path::new(&server_config.db_path))
            .await
            .with_context(|| format!("Failed to open database at {}", server_config.db_path))?,
    );
    eprintln!("   Database: {}", server_config.db_path);

    // ── Controller + runtime ─────────────────────────────────────────────
    let (controller, channels) = StageController::new(interview_config, archive);
    let hub = OutputHub::new();
    let _relay = hub.spawn_relay(channels.output);

    let (inbound_tx, inbound_rx) = mpsc::channel(64);
    let runtime = InterviewRuntime::new(Arc::clone(&controller), engine);
    let runtime_handle = tokio::spawn(runtime.run(inbound_rx, channels.directives));

    // Spawn Axum WS/REST server
    let app = stage_routes(StageRouteState {
        controller: Arc::clone(&controller),
        inbound: inbound_tx.clone(),
        output: hub.sender(),
    });
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", server_config.port))
        .await
        .map_err(|e| ChannelError::StartupFailed {
            name: "ws".to_string(),
            reason: e.to_string(),
        })?;
    tokio::spawn(async move {
        tracing::info!(port = server_config.port, "Stage WebSocket server started");
        axum::serve(listener, app).await.ok();
    });

    // ── CLI channel ──────────────────────────────────────────────────────
    let cli = Arc::new(CliChannel::new(server_config.speech_words_per_sec));
    let mut cli_events = cli.start().await?;

    let renderer = Arc::clone(&cli);
    let mut output_rx = hub.subscribe();
    tokio::spawn(async move {
        loop {
            match output_rx.recv().await {
                Ok(command) => {
                    if let Err(e) = renderer.render(&command).await {
                        tracing::warn!(error = %e, "CLI render failed");
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(missed = n, "CLI renderer lagged behind output");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    controller.start();

    // Forward CLI input until EOF, /quit or Ctrl-C
    loop {
        tokio::select! {
            event = cli_events.next() => {
                let Some(event) = event else { break };
                if inbound_tx.send(event).await.is_err() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                eprintln!("\nInterrupted");
                break;
            }
        }
    }

    cli.shutdown().await?;
    let status = controller.status();
    eprintln!(
        "Stopped in stage {} ({} fields collected)",
        status.session.stage,
        status.session.fields.len()
    );
    runtime_handle.abort();
    Ok(())
}
