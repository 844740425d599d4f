//! Router, shared state, and server loop for the Streamcast HTTP API.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use streamcast_core::config::{StreamcastConfig, TranscodeConfig};
use streamcast_core::pipeline::ProcessingPipeline;
use streamcast_core::streaming::{RemuxOrchestrator, StreamSession};
use tokio::sync::{Mutex, watch};
use tower_http::cors::CorsLayer;

use crate::handlers::{add_stream, get_processing_status, get_stream, health, load_stream};
use crate::presets::PresetLibrary;

/// Shared state behind every handler.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<RemuxOrchestrator>,
    pub pipeline: ProcessingPipeline,
    pub presets: Arc<PresetLibrary>,
    /// Playback URLs per loaded group; the mutex also serializes group loads
    pub stream_cache: Arc<Mutex<HashMap<String, Vec<String>>>>,
    /// Live transcode sessions, kept for orderly shutdown
    pub sessions: Arc<Mutex<Vec<StreamSession>>>,
    pub transcode: TranscodeConfig,
    pub ingest_rtsp_port: u16,
}

impl AppState {
    pub fn new(
        orchestrator: Arc<RemuxOrchestrator>,
        pipeline: ProcessingPipeline,
        presets: PresetLibrary,
        config: &StreamcastConfig,
    ) -> Self {
        Self {
            orchestrator,
            pipeline,
            presets: Arc::new(presets),
            stream_cache: Arc::new(Mutex::new(HashMap::new())),
            sessions: Arc::new(Mutex::new(Vec::new())),
            transcode: config.transcode.clone(),
            ingest_rtsp_port: config.remux.rtsp_port,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/load_stream", post(load_stream))
        .route("/get_stream", post(get_stream))
        .route("/add_stream", post(add_stream))
        .route("/get_processing_status", post(get_processing_status))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serves the API until the shutdown flag flips. Teardown of sessions and
/// the orchestrator is the caller's job once this returns.
pub async fn run_server(
    state: AppState,
    bind: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!("HTTP server listening on {bind}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
}

/// Stops every live transcode session with its bounded grace+kill.
pub async fn cleanup_sessions(state: &AppState) {
    let mut sessions = state.sessions.lock().await;
    for session in sessions.iter_mut() {
        session.cleanup().await;
    }
    sessions.clear();
}
