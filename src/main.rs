//! # Voice Coach Backend - Main Application Entry Point
//!
//! Runs a live voice-coaching conversation: microphone audio streams to a conversational
//! backend, the backend's synthesized speech is scheduled for gapless playback, and the
//! conversation is assembled into a turn-based transcript that UI clients can follow.
//!
//! ## Application Architecture:
//! - **config**: Application configuration (TOML file + environment variables)
//! - **error**: Pipeline errors (`VoiceError`) and HTTP error responses (`AppError`)
//! - **audio**: Capture sources, the frame encoder, audio outputs and the playback scheduler
//! - **transport**: The live session abstraction and its WebSocket implementation
//! - **transcript**: Turns streamed transcription fragments into transcript entries
//! - **coach**: The connection state machine that owns a running session
//! - **state / health / handlers / websocket**: The HTTP and WebSocket control surface

mod audio;
mod coach;
mod config;
mod error;
mod handlers;
mod health;
mod state;
mod transcript;
mod transport;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use audio::capture::{AudioCaptureSource, FileCaptureSource};
use audio::output::{AudioOutputFactory, HeadlessOutputFactory};
use coach::ConnectionStateMachine;
use config::{AppConfig, CaptureKind, OutputKind};
use state::{AppState, PipelineMetrics};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transport::ws_client::WebSocketBackend;

#[actix_web::main]
async fn main() -> Result<()> {
    // It's fine if there's no .env file
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting voice-coach-backend v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);
    info!(
        "Backend {} (model {}), capture {:?}, output {:?}",
        config.backend.endpoint, config.backend.model_id, config.audio.capture, config.audio.output
    );

    let metrics = Arc::new(PipelineMetrics::default());
    let coach = ConnectionStateMachine::new(
        config.session_settings(),
        Arc::new(WebSocketBackend::new(
            config.backend.endpoint.clone(),
            config.connect_timeout(),
            config.performance.inbound_queue_capacity,
        )),
        build_capture(&config)?,
        build_output(&config)?,
        Arc::clone(&metrics),
        config.performance.event_channel_capacity,
    );

    let app_state = AppState::new(config.clone(), metrics, coach.clone());
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(TracingLogger::default())
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .route("/session", web::get().to(handlers::get_session))
                    .route("/session/start", web::post().to(handlers::start_session))
                    .route("/session/stop", web::post().to(handlers::stop_session))
                    .route("/transcript", web::get().to(handlers::get_transcript)),
            )
            .route("/ws/events", web::get().to(websocket::event_feed))
            .route("/health", web::get().to(health::health_check))
    })
    // Signals are handled below so the session can be torn down first
    .disable_signals()
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, ending session and stopping server...");
            coach.stop();
            server_handle.stop(true).await;
        }
    }

    // Whatever happened above, never leave the microphone open
    coach.stop();
    info!("Server stopped gracefully");
    Ok(())
}

/// Install the tracing subscriber.
///
/// `RUST_LOG` controls what gets logged; the default is
/// `voice_coach_backend=debug,actix_web=info`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_coach_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

fn build_capture(config: &AppConfig) -> Result<Arc<dyn AudioCaptureSource>> {
    match config.audio.capture {
        CaptureKind::File => Ok(Arc::new(FileCaptureSource::new(&config.audio.capture_file))),
        #[cfg(feature = "device-audio")]
        CaptureKind::Device => Ok(Arc::new(audio::device::DeviceCaptureSource)),
        #[cfg(not(feature = "device-audio"))]
        CaptureKind::Device => Err(anyhow::anyhow!("device capture needs the device-audio feature")),
    }
}

fn build_output(config: &AppConfig) -> Result<Arc<dyn AudioOutputFactory>> {
    match config.audio.output {
        OutputKind::Headless => Ok(Arc::new(HeadlessOutputFactory::new())),
        #[cfg(feature = "device-audio")]
        OutputKind::Device => Ok(Arc::new(audio::device::DeviceOutputFactory)),
        #[cfg(not(feature = "device-audio"))]
        OutputKind::Device => Err(anyhow::anyhow!("device output needs the device-audio feature")),
    }
}

/// Resolve on SIGTERM or Ctrl+C.
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    result = tokio::signal::ctrl_c() => {
                        if let Err(e) = result {
                            warn!("Ctrl+C handler failed: {}", e);
                        }
                        info!("Received SIGINT");
                    }
                }
                return;
            }
            Err(e) => warn!("Failed to install SIGTERM handler: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Ctrl+C handler failed, running until killed: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received SIGINT");
}
